use std::collections::BTreeSet;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::domain::InstitutionCandidate;

/// Identifier wrapper for submitted loans.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LoanId(pub String);

impl std::fmt::Display for LoanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Status of a submitted loan. The first eight form the ordered chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoanStatus {
    PendingReview,
    MfiMatched,
    KycPending,
    KycSubmitted,
    MfiReviewingDocs,
    Approved,
    AwaitingDisbursement,
    FundsDisbursed,
    Rejected,
}

impl LoanStatus {
    pub const fn ordered() -> [Self; 8] {
        [
            Self::PendingReview,
            Self::MfiMatched,
            Self::KycPending,
            Self::KycSubmitted,
            Self::MfiReviewingDocs,
            Self::Approved,
            Self::AwaitingDisbursement,
            Self::FundsDisbursed,
        ]
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::PendingReview => "Pending Review",
            Self::MfiMatched => "MFI Matched",
            Self::KycPending => "KYC Pending",
            Self::KycSubmitted => "KYC Submitted",
            Self::MfiReviewingDocs => "MFI Reviewing Docs",
            Self::Approved => "Approved",
            Self::AwaitingDisbursement => "Awaiting Disbursement",
            Self::FundsDisbursed => "Funds Disbursed",
            Self::Rejected => "Rejected",
        }
    }

    /// Dashboard progress percentage.
    pub const fn progress(self) -> u8 {
        match self {
            Self::PendingReview => 10,
            Self::MfiMatched => 25,
            Self::KycPending => 35,
            Self::KycSubmitted => 50,
            Self::MfiReviewingDocs => 60,
            Self::Approved => 75,
            Self::AwaitingDisbursement => 90,
            Self::FundsDisbursed => 100,
            Self::Rejected => 0,
        }
    }

    /// Position on the ordered chain; `None` for `Rejected`.
    pub fn rank(self) -> Option<usize> {
        Self::ordered().iter().position(|status| *status == self)
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::FundsDisbursed | Self::Rejected)
    }

    pub fn next_action(self, institution: Option<&str>) -> String {
        let lender = institution.unwrap_or("your chosen lender");
        match self {
            Self::PendingReview => "Your application is currently under review.".to_string(),
            Self::MfiMatched => {
                "We've matched you with potential lenders. Review your options and choose one."
                    .to_string()
            }
            Self::KycPending => format!("Upload your KYC documents for {lender} to continue."),
            Self::KycSubmitted => {
                format!("Your documents have been sent to {lender}. We'll notify you once they begin their review.")
            }
            Self::MfiReviewingDocs => format!("{lender} is reviewing your documents."),
            Self::Approved => format!("Congratulations! {lender} has approved your loan."),
            Self::AwaitingDisbursement => {
                format!("{lender} is preparing funds for disbursement to your account.")
            }
            Self::FundsDisbursed => {
                format!("Funds have been disbursed. Keep your repayments to {lender} on track.")
            }
            Self::Rejected => {
                format!("Unfortunately, {lender} did not approve this application. You can start a new one at any time.")
            }
        }
    }
}

/// Repayment sub-state, meaningful only after disbursement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepaymentStatus {
    #[default]
    NotApplicable,
    OnTrack,
    Overdue,
    PaidOff,
    Defaulted,
}

impl RepaymentStatus {
    pub const fn label(self) -> &'static str {
        match self {
            Self::NotApplicable => "N/A",
            Self::OnTrack => "On Track",
            Self::Overdue => "Overdue",
            Self::PaidOff => "Paid Off",
            Self::Defaulted => "Defaulted",
        }
    }
}

/// How an applied status update related to the chain order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    Sequential,
    OutOfOrder,
    Rejection,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    #[error("loan {id} is {} and cannot move to {}", .current.label(), .requested.label())]
    Terminal {
        id: LoanId,
        current: LoanStatus,
        requested: LoanStatus,
    },
    #[error("loan {id} is {} so repayment cannot be {}", .status.label(), .requested.label())]
    RepaymentBeforeDisbursement {
        id: LoanId,
        status: LoanStatus,
        requested: RepaymentStatus,
    },
    #[error("loan {id} is {} so its institution can no longer change", .status.label())]
    InstitutionLocked { id: LoanId, status: LoanStatus },
}

/// A submitted loan application as shown on the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoanRecord {
    pub id: LoanId,
    pub owner: String,
    pub amount: u64,
    pub collateral_description: String,
    pub institution: Option<String>,
    pub institution_contact: Option<String>,
    /// Monthly rate quoted by the chosen institution, in percent.
    pub interest_rate: Option<f64>,
    pub loan_terms: Option<String>,
    status: LoanStatus,
    pub applied_date: NaiveDate,
    last_update: NaiveDate,
    repayment_status: RepaymentStatus,
    pub buy_off_eligible: bool,
    pub buy_off_details: Option<String>,
    pub notes: Option<String>,
    pub submitted_documents: BTreeSet<String>,
}

impl LoanRecord {
    pub fn new(
        id: LoanId,
        owner: impl Into<String>,
        amount: u64,
        collateral_description: impl Into<String>,
        applied_date: NaiveDate,
    ) -> Self {
        Self {
            id,
            owner: owner.into(),
            amount,
            collateral_description: collateral_description.into(),
            institution: None,
            institution_contact: None,
            interest_rate: None,
            loan_terms: None,
            status: LoanStatus::PendingReview,
            applied_date,
            last_update: applied_date,
            repayment_status: RepaymentStatus::NotApplicable,
            buy_off_eligible: false,
            buy_off_details: None,
            notes: None,
            submitted_documents: BTreeSet::new(),
        }
    }

    pub fn status(&self) -> LoanStatus {
        self.status
    }

    pub fn last_update(&self) -> NaiveDate {
        self.last_update
    }

    pub fn repayment_status(&self) -> RepaymentStatus {
        self.repayment_status
    }

    pub fn progress(&self) -> u8 {
        self.status.progress()
    }

    pub fn next_action(&self) -> String {
        self.status.next_action(self.institution.as_deref())
    }

    /// Attach the chosen institution's contact and quoted terms.
    pub fn assign_institution(&mut self, candidate: &InstitutionCandidate) {
        self.institution = Some(candidate.name.clone());
        self.institution_contact = Some(candidate.contact_information.clone());
        self.interest_rate = Some(candidate.interest_rate);
        self.loan_terms = Some(candidate.loan_terms.clone());
    }

    /// Back to `MfiMatched` with no institution, for a fresh search before KYC.
    pub fn reopen_for_matching(&mut self, on: NaiveDate) -> Result<(), LifecycleError> {
        if !matches!(self.status, LoanStatus::MfiMatched | LoanStatus::KycPending) {
            return Err(LifecycleError::InstitutionLocked {
                id: self.id.clone(),
                status: self.status,
            });
        }

        if self.status != LoanStatus::MfiMatched {
            info!(loan_id = %self.id, from = self.status.label(), "institution choice withdrawn");
        }
        self.status = LoanStatus::MfiMatched;
        self.institution = None;
        self.institution_contact = None;
        self.interest_rate = None;
        self.loan_terms = None;
        self.touch(on);
        Ok(())
    }

    /// Overwrites the status. Institutions may report out of order, so skips and
    /// regressions are recorded with a warning instead of being refused.
    pub fn apply_status(
        &mut self,
        next: LoanStatus,
        on: NaiveDate,
    ) -> Result<TransitionKind, LifecycleError> {
        if next == self.status {
            self.touch(on);
            return Ok(TransitionKind::Unchanged);
        }

        if self.status.is_terminal() {
            return Err(LifecycleError::Terminal {
                id: self.id.clone(),
                current: self.status,
                requested: next,
            });
        }

        let kind = match (self.status.rank(), next.rank()) {
            (_, None) => TransitionKind::Rejection,
            (Some(from), Some(to)) if to == from + 1 => TransitionKind::Sequential,
            _ => TransitionKind::OutOfOrder,
        };

        if kind == TransitionKind::OutOfOrder {
            warn!(
                loan_id = %self.id,
                from = self.status.label(),
                to = next.label(),
                "recording out-of-order lifecycle update"
            );
        } else {
            info!(loan_id = %self.id, from = self.status.label(), to = next.label(), "loan status updated");
        }

        self.status = next;
        if next == LoanStatus::FundsDisbursed && self.repayment_status == RepaymentStatus::NotApplicable {
            self.repayment_status = RepaymentStatus::OnTrack;
        }
        self.touch(on);

        Ok(kind)
    }

    pub fn set_repayment(
        &mut self,
        repayment: RepaymentStatus,
        on: NaiveDate,
    ) -> Result<(), LifecycleError> {
        if repayment != RepaymentStatus::NotApplicable && self.status != LoanStatus::FundsDisbursed {
            return Err(LifecycleError::RepaymentBeforeDisbursement {
                id: self.id.clone(),
                status: self.status,
                requested: repayment,
            });
        }

        self.repayment_status = repayment;
        self.touch(on);
        Ok(())
    }

    pub fn set_buy_off(&mut self, eligible: bool, details: Option<String>, on: NaiveDate) {
        self.buy_off_eligible = eligible;
        self.buy_off_details = details.filter(|text| !text.trim().is_empty());
        self.touch(on);
    }

    /// `last_update` never moves backwards.
    fn touch(&mut self, on: NaiveDate) {
        if on > self.last_update {
            self.last_update = on;
        }
    }

    pub fn summary_view(&self) -> LoanSummaryView {
        LoanSummaryView {
            id: self.id.clone(),
            amount: self.amount,
            institution: self
                .institution
                .clone()
                .unwrap_or_else(|| "Pending selection".to_string()),
            status: self.status,
            status_label: self.status.label(),
            progress: self.progress(),
            next_action: self.next_action(),
            applied_date: self.applied_date,
            last_update: self.last_update,
            repayment_status: (self.repayment_status != RepaymentStatus::NotApplicable)
                .then(|| self.repayment_status.label()),
            buy_off_eligible: self.buy_off_eligible,
            buy_off_details: self.buy_off_details.clone(),
        }
    }
}

/// Dashboard card projection of a [`LoanRecord`].
#[derive(Debug, Clone, Serialize)]
pub struct LoanSummaryView {
    pub id: LoanId,
    pub amount: u64,
    pub institution: String,
    pub status: LoanStatus,
    pub status_label: &'static str,
    pub progress: u8,
    pub next_action: String,
    pub applied_date: NaiveDate,
    pub last_update: NaiveDate,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repayment_status: Option<&'static str>,
    pub buy_off_eligible: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buy_off_details: Option<String>,
}
