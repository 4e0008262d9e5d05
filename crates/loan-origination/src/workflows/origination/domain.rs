use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Upper bound of the bureau-style credit score captured on the form.
pub const MAX_CREDIT_SCORE: u16 = 1000;

/// Document categories an institution expects before KYC can be submitted.
pub const REQUIRED_KYC_DOCUMENTS: [&str; 3] = ["logbook", "national_id", "income_statement"];

/// Applicant input captured for a single submission. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicantProfile {
    pub collateral_description: String,
    pub requested_amount: u64,
    pub monthly_income: u64,
    pub proof_of_income_provided: bool,
    pub national_id: String,
    pub employment_status: EmploymentStatus,
    pub location: String,
    #[serde(default)]
    pub credit_score: Option<u16>,
}

impl ApplicantProfile {
    /// Syntactic checks only; business eligibility belongs to the evaluator.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.collateral_description.trim().is_empty() {
            return Err(ValidationError::EmptyCollateral);
        }
        if self.requested_amount == 0 {
            return Err(ValidationError::NonPositiveAmount("requested_amount"));
        }
        if self.monthly_income == 0 {
            return Err(ValidationError::NonPositiveAmount("monthly_income"));
        }

        let national_id = self.national_id.trim();
        if !(7..=8).contains(&national_id.len())
            || !national_id.chars().all(|c| c.is_ascii_digit())
        {
            return Err(ValidationError::InvalidNationalId);
        }

        if self.location.trim().chars().count() < 2 {
            return Err(ValidationError::MissingLocation);
        }

        if let Some(score) = self.credit_score {
            if score > MAX_CREDIT_SCORE {
                return Err(ValidationError::CreditScoreOutOfRange(score));
            }
        }

        Ok(())
    }

    pub fn eligibility_request(&self) -> EligibilityRequest {
        EligibilityRequest {
            collateral_description: self.collateral_description.trim().to_string(),
            requested_amount: self.requested_amount,
            monthly_income: self.monthly_income,
            proof_of_income_provided: self.proof_of_income_provided,
        }
    }

    /// The subset kept in the session so matching can run without re-prompting.
    pub fn retained_for_matching(&self) -> MatchingProfile {
        MatchingProfile {
            collateral_description: self.collateral_description.trim().to_string(),
            national_id: self.national_id.trim().to_string(),
            requested_amount: self.requested_amount,
            employment_status: self.employment_status,
            location: self.location.trim().to_string(),
            credit_score: self.credit_score.unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmploymentStatus {
    Employed,
    SelfEmployed,
    Unemployed,
}

impl EmploymentStatus {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Employed => "Employed",
            Self::SelfEmployed => "Self-Employed",
            Self::Unemployed => "Unemployed",
        }
    }
}

/// Malformed applicant input, caught before any network call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("collateral description is required")]
    EmptyCollateral,
    #[error("{0} must be greater than zero")]
    NonPositiveAmount(&'static str),
    #[error("national ID must be 7 or 8 digits")]
    InvalidNationalId,
    #[error("location (town or city) is required")]
    MissingLocation,
    #[error("credit score {0} is outside 0-1000")]
    CreditScoreOutOfRange(u16),
}

impl ValidationError {
    pub const fn reason_code(&self) -> &'static str {
        match self {
            Self::EmptyCollateral => "empty_collateral",
            Self::NonPositiveAmount(_) => "non_positive_amount",
            Self::InvalidNationalId => "invalid_national_id",
            Self::MissingLocation => "missing_location",
            Self::CreditScoreOutOfRange(_) => "credit_score_out_of_range",
        }
    }
}

/// Outbound eligibility request shaped from the applicant profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EligibilityRequest {
    pub collateral_description: String,
    pub requested_amount: u64,
    pub monthly_income: u64,
    pub proof_of_income_provided: bool,
}

/// Retained profile persisted after a positive verdict; doubles as the matching request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchingProfile {
    pub collateral_description: String,
    pub national_id: String,
    pub requested_amount: u64,
    pub employment_status: EmploymentStatus,
    pub location: String,
    pub credit_score: u16,
}

/// Structured verdict returned by the eligibility evaluator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EligibilityVerdict {
    pub is_eligible: bool,
    pub eligible_amount: u64,
    pub feedback: String,
    #[serde(default)]
    pub missing_info: Vec<String>,
}

impl EligibilityVerdict {
    pub fn new(
        is_eligible: bool,
        eligible_amount: u64,
        feedback: impl Into<String>,
        missing_info: Vec<String>,
    ) -> Self {
        Self {
            is_eligible,
            eligible_amount,
            feedback: feedback.into(),
            missing_info,
        }
        .normalized()
    }

    /// Verdict standing in for an evaluator failure so the read side stays uniform.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            is_eligible: false,
            eligible_amount: 0,
            feedback: message.into(),
            missing_info: Vec::new(),
        }
    }

    /// Rounds to the nearest KES 1000 and zeroes the amount of a negative verdict.
    pub fn normalized(mut self) -> Self {
        self.eligible_amount = if self.is_eligible {
            round_to_thousand(self.eligible_amount)
        } else {
            0
        };
        self
    }
}

fn round_to_thousand(amount: u64) -> u64 {
    amount.saturating_add(500) / 1000 * 1000
}

/// One lending institution returned by the matcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstitutionCandidate {
    pub name: String,
    pub interest_rate: f64,
    pub processing_time: String,
    pub approval_rate: f64,
    pub requirements: Vec<String>,
    pub loan_terms: String,
    pub contact_information: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_url: Option<String>,
}

/// The authenticated applicant as reported by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentUser {
    pub id: String,
    pub email: String,
    pub email_verified: bool,
}

/// Notification that documents were uploaded for the chosen institution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSubmission {
    pub institution_name: String,
    pub document_categories: BTreeSet<String>,
}

impl DocumentSubmission {
    pub fn missing_required(&self) -> Vec<String> {
        REQUIRED_KYC_DOCUMENTS
            .iter()
            .filter(|required| !self.document_categories.contains(**required))
            .map(|required| required.to_string())
            .collect()
    }
}
