//! Resumable workflow: eligibility, then matching, then institution selection and KYC.
//!
//! Every stage is one variant of [`StageState`]; operations that do not apply
//! to the current variant are refused with a [`PreconditionError`]. Each
//! dispatched evaluator call gets a ticket stamped with the current generation.
//! A response is applied only while that generation is still current, so a
//! newer submission or a reset silently wins over a late response.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{Local, NaiveDate};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::domain::{
    ApplicantProfile, CurrentUser, DocumentSubmission, EligibilityRequest, EligibilityVerdict,
    InstitutionCandidate, MatchingProfile, ValidationError,
};
use super::evaluator::{EligibilityEvaluator, EvaluatorError, InstitutionMatcher};
use super::lifecycle::{LifecycleError, LoanId, LoanRecord, LoanStatus};
use super::repository::{LoanRepository, RepositoryError};
use super::session::{SessionBackend, SessionKey, SessionStateStore, SessionWriteError};

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

static LOAN_SEQUENCE: AtomicU64 = AtomicU64::new(1);

fn next_loan_id() -> LoanId {
    let id = LOAN_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    LoanId(format!("loan-{id:06}"))
}

fn local_today() -> NaiveDate {
    Local::now().date_naive()
}

#[derive(Debug, Clone)]
pub struct WorkflowSettings {
    /// Upper bound for a single evaluator or matcher call.
    pub call_timeout: Duration,
    pub clock: fn() -> NaiveDate,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
            clock: local_today,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStage {
    Empty,
    EligibilityPending,
    EligibilityKnown,
    MatchPending,
    MatchKnown,
}

impl WorkflowStage {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::EligibilityPending => "eligibility check",
            Self::EligibilityKnown => "eligibility known",
            Self::MatchPending => "institution search",
            Self::MatchKnown => "matches known",
        }
    }
}

#[derive(Debug, Clone)]
struct Selection {
    candidate: InstitutionCandidate,
    documents_submitted: bool,
}

#[derive(Debug, Clone)]
enum StageState {
    Empty,
    EligibilityPending,
    EligibilityKnown {
        verdict: EligibilityVerdict,
        retained: Option<MatchingProfile>,
    },
    MatchPending {
        verdict: EligibilityVerdict,
        retained: MatchingProfile,
    },
    MatchKnown {
        verdict: EligibilityVerdict,
        retained: MatchingProfile,
        candidates: Vec<InstitutionCandidate>,
        failure: Option<String>,
        selection: Option<Selection>,
    },
}

impl StageState {
    fn kind(&self) -> WorkflowStage {
        match self {
            Self::Empty => WorkflowStage::Empty,
            Self::EligibilityPending => WorkflowStage::EligibilityPending,
            Self::EligibilityKnown { .. } => WorkflowStage::EligibilityKnown,
            Self::MatchPending { .. } => WorkflowStage::MatchPending,
            Self::MatchKnown { .. } => WorkflowStage::MatchKnown,
        }
    }
}

/// Handle for a dispatched eligibility call.
#[derive(Debug, Clone)]
pub struct EligibilityTicket {
    generation: u64,
    request: EligibilityRequest,
    retained: MatchingProfile,
}

impl EligibilityTicket {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn request(&self) -> &EligibilityRequest {
        &self.request
    }
}

/// Handle for a dispatched matching call.
#[derive(Debug, Clone)]
pub struct MatchTicket {
    generation: u64,
    owner: String,
    request: MatchingProfile,
}

impl MatchTicket {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn request(&self) -> &MatchingProfile {
        &self.request
    }
}

/// Whether a response was applied or dropped because its generation had passed.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition<T> {
    Applied(T),
    Discarded,
}

impl<T> Disposition<T> {
    pub fn applied(self) -> Option<T> {
        match self {
            Self::Applied(value) => Some(value),
            Self::Discarded => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EligibilityOutcome {
    pub verdict: EligibilityVerdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

/// Result of a search. `failure` distinguishes "search failed" from "zero matches".
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchOutcome {
    pub candidates: Vec<InstitutionCandidate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loan_id: Option<LoanId>,
}

/// Read-only view of the session for the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowSnapshot {
    pub stage: WorkflowStage,
    pub eligibility: Option<EligibilityVerdict>,
    pub candidates: Option<Vec<InstitutionCandidate>>,
    pub match_failure: Option<String>,
    pub selected_institution: Option<String>,
    pub documents_submitted: bool,
    pub loan_id: Option<LoanId>,
    pub error: Option<String>,
}

impl WorkflowSnapshot {
    /// View of a session that holds nothing yet.
    pub fn empty() -> Self {
        Self {
            stage: WorkflowStage::Empty,
            eligibility: None,
            candidates: None,
            match_failure: None,
            selected_institution: None,
            documents_submitted: false,
            loan_id: None,
            error: None,
        }
    }
}

/// Refused transition; the session is left untouched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PreconditionError {
    #[error("sign in to continue with your application")]
    Unauthenticated,
    #[error("complete the eligibility check first")]
    EligibilityUnknown,
    #[error("institution matching requires a positive eligibility verdict")]
    NotEligible,
    #[error("eligibility details are no longer available; submit the application again")]
    RetainedProfileMissing,
    #[error("the {} is still in progress", .0.label())]
    CallInFlight(WorkflowStage),
    #[error("no matched institutions are available to choose from")]
    NoMatchesAvailable,
    #[error("'{0}' is not one of the matched institutions")]
    UnknownInstitution(String),
    #[error("choose an institution before submitting documents")]
    NoInstitutionSelected,
    #[error("documents were addressed to '{submitted}' but '{selected}' is selected")]
    InstitutionMismatch { selected: String, submitted: String },
    #[error("attach at least one document")]
    NoDocuments,
    #[error("missing required documents: {}", .0.join(", "))]
    MissingDocuments(Vec<String>),
    #[error("documents were already submitted for this application")]
    DocumentsAlreadySubmitted,
}

impl PreconditionError {
    pub const fn reason_code(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::EligibilityUnknown => "eligibility_unknown",
            Self::NotEligible => "not_eligible",
            Self::RetainedProfileMissing => "retained_profile_missing",
            Self::CallInFlight(_) => "call_in_flight",
            Self::NoMatchesAvailable => "no_matches_available",
            Self::UnknownInstitution(_) => "unknown_institution",
            Self::NoInstitutionSelected => "no_institution_selected",
            Self::InstitutionMismatch { .. } => "institution_mismatch",
            Self::NoDocuments => "no_documents",
            Self::MissingDocuments(_) => "missing_documents",
            Self::DocumentsAlreadySubmitted => "documents_already_submitted",
        }
    }
}

/// Error raised by the workflow controller.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Precondition(#[from] PreconditionError),
    #[error("a newer request superseded this one")]
    Superseded,
    #[error(transparent)]
    Session(#[from] SessionWriteError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

struct WorkflowInner<B> {
    store: SessionStateStore<B>,
    stage: StageState,
    generation: u64,
    active_loan: Option<LoanId>,
    /// Set when matches were restored from the session and the loan opened for
    /// them has not been looked up yet.
    loan_unresolved: bool,
    last_error: Option<String>,
}

/// Owns one applicant's workflow session and every write to its session store.
pub struct WorkflowController<B, R> {
    inner: Mutex<WorkflowInner<B>>,
    evaluator: Arc<dyn EligibilityEvaluator>,
    matcher: Arc<dyn InstitutionMatcher>,
    loans: Arc<R>,
    settings: WorkflowSettings,
}

impl<B, R> WorkflowController<B, R>
where
    B: SessionBackend + 'static,
    R: LoanRepository + 'static,
{
    /// Builds a controller over `backend`, resuming whatever the session already holds.
    pub fn new(
        backend: B,
        evaluator: Arc<dyn EligibilityEvaluator>,
        matcher: Arc<dyn InstitutionMatcher>,
        loans: Arc<R>,
        settings: WorkflowSettings,
    ) -> Self {
        let store = SessionStateStore::new(backend);
        let stage = restore_stage(&store);
        let loan_unresolved = matches!(stage, StageState::MatchKnown { .. });
        debug!(stage = stage.kind().label(), "workflow session restored");

        Self {
            inner: Mutex::new(WorkflowInner {
                store,
                stage,
                generation: 0,
                active_loan: None,
                loan_unresolved,
                last_error: None,
            }),
            evaluator,
            matcher,
            loans,
            settings,
        }
    }

    fn lock(&self) -> MutexGuard<'_, WorkflowInner<B>> {
        self.inner.lock().expect("workflow mutex poisoned")
    }

    fn today(&self) -> NaiveDate {
        (self.settings.clock)()
    }

    pub fn stage(&self) -> WorkflowStage {
        self.lock().stage.kind()
    }

    pub fn snapshot(&self) -> WorkflowSnapshot {
        let inner = self.lock();
        let mut snapshot = WorkflowSnapshot {
            stage: inner.stage.kind(),
            loan_id: inner.active_loan.clone(),
            error: inner.last_error.clone(),
            ..WorkflowSnapshot::empty()
        };

        match &inner.stage {
            StageState::Empty | StageState::EligibilityPending => {}
            StageState::EligibilityKnown { verdict, .. } | StageState::MatchPending { verdict, .. } => {
                snapshot.eligibility = Some(verdict.clone());
            }
            StageState::MatchKnown {
                verdict,
                candidates,
                failure,
                selection,
                ..
            } => {
                snapshot.eligibility = Some(verdict.clone());
                snapshot.candidates = Some(candidates.clone());
                snapshot.match_failure = failure.clone();
                if let Some(selection) = selection {
                    snapshot.selected_institution = Some(selection.candidate.name.clone());
                    snapshot.documents_submitted = selection.documents_submitted;
                }
            }
        }

        snapshot
    }

    /// Submit a profile and wait for the evaluator. Evaluator failures resolve to
    /// a non-eligible verdict carrying the error text rather than an `Err`.
    pub async fn submit(
        &self,
        user: Option<&CurrentUser>,
        profile: ApplicantProfile,
    ) -> Result<EligibilityOutcome, WorkflowError> {
        let ticket = self.begin_submission(user, &profile)?;
        let result = self
            .bounded(self.evaluator.evaluate(ticket.request()))
            .await;

        let disposition = match result {
            Ok(verdict) => self.evaluator_responds(&ticket, verdict)?,
            Err(err) => self.evaluator_fails(&ticket, &err)?,
        };

        disposition.applied().ok_or(WorkflowError::Superseded)
    }

    /// Validates the profile, clears the previous application, and opens a new generation.
    pub fn begin_submission(
        &self,
        user: Option<&CurrentUser>,
        profile: &ApplicantProfile,
    ) -> Result<EligibilityTicket, WorkflowError> {
        let user = require_user(user)?;
        profile.validate()?;

        let mut inner = self.lock();
        if inner.stage.kind() == WorkflowStage::EligibilityPending {
            debug!(generation = inner.generation, "superseding pending eligibility check");
        }

        inner.generation += 1;
        inner.store.clear_all(&SessionKey::workflow_keys());
        inner.stage = StageState::EligibilityPending;
        inner.active_loan = None;
        inner.loan_unresolved = false;
        inner.last_error = None;

        info!(user_id = %user.id, generation = inner.generation, "eligibility check dispatched");

        Ok(EligibilityTicket {
            generation: inner.generation,
            request: profile.eligibility_request(),
            retained: profile.retained_for_matching(),
        })
    }

    pub fn evaluator_responds(
        &self,
        ticket: &EligibilityTicket,
        verdict: EligibilityVerdict,
    ) -> Result<Disposition<EligibilityOutcome>, WorkflowError> {
        let mut inner = self.lock();
        if ticket.generation != inner.generation {
            debug!(ticket = ticket.generation, current = inner.generation, "discarding stale eligibility verdict");
            return Ok(Disposition::Discarded);
        }

        let verdict = verdict.normalized();
        inner.store.set(SessionKey::EligibilityResult, &verdict)?;

        let retained = if verdict.is_eligible {
            inner
                .store
                .set(SessionKey::RetainedProfileForMatching, &ticket.retained)?;
            Some(ticket.retained.clone())
        } else {
            inner.store.remove(SessionKey::RetainedProfileForMatching);
            None
        };

        info!(
            eligible = verdict.is_eligible,
            eligible_amount = verdict.eligible_amount,
            "eligibility verdict recorded"
        );

        inner.stage = StageState::EligibilityKnown {
            verdict: verdict.clone(),
            retained,
        };
        inner.last_error = None;

        Ok(Disposition::Applied(EligibilityOutcome {
            verdict,
            failure: None,
        }))
    }

    pub fn evaluator_fails(
        &self,
        ticket: &EligibilityTicket,
        error: &EvaluatorError,
    ) -> Result<Disposition<EligibilityOutcome>, WorkflowError> {
        let mut inner = self.lock();
        if ticket.generation != inner.generation {
            debug!(ticket = ticket.generation, current = inner.generation, "discarding stale eligibility failure");
            return Ok(Disposition::Discarded);
        }

        warn!(error = %error, "eligibility evaluator failed");
        let message = format!("Eligibility check failed: {error}");
        let verdict = EligibilityVerdict::unavailable(message.clone());

        inner.store.set(SessionKey::EligibilityResult, &verdict)?;
        inner.store.remove(SessionKey::RetainedProfileForMatching);
        inner.stage = StageState::EligibilityKnown {
            verdict: verdict.clone(),
            retained: None,
        };
        inner.last_error = Some(message.clone());

        Ok(Disposition::Applied(EligibilityOutcome {
            verdict,
            failure: Some(message),
        }))
    }

    /// Search for institutions using the retained profile. Also serves as a retry
    /// after a completed search.
    pub async fn request_matches(
        &self,
        user: Option<&CurrentUser>,
    ) -> Result<MatchOutcome, WorkflowError> {
        let ticket = self.begin_match_search(user)?;
        let result = self
            .bounded(self.matcher.find_matches(ticket.request()))
            .await;

        let disposition = match result {
            Ok(candidates) => self.matcher_responds(&ticket, candidates)?,
            Err(err) => self.matcher_fails(&ticket, &err)?,
        };

        disposition.applied().ok_or(WorkflowError::Superseded)
    }

    pub fn begin_match_search(
        &self,
        user: Option<&CurrentUser>,
    ) -> Result<MatchTicket, WorkflowError> {
        let user = require_user(user)?;
        let mut inner = self.lock();
        self.resolve_restored_loan(&mut inner, &user.id)?;

        let (verdict, retained) = match &inner.stage {
            StageState::EligibilityKnown { verdict, retained } => {
                (verdict.clone(), retained.clone())
            }
            StageState::MatchKnown {
                verdict,
                retained,
                selection,
                ..
            } => {
                if selection.as_ref().is_some_and(|s| s.documents_submitted) {
                    return Err(PreconditionError::DocumentsAlreadySubmitted.into());
                }
                (verdict.clone(), Some(retained.clone()))
            }
            StageState::Empty => return Err(PreconditionError::EligibilityUnknown.into()),
            StageState::EligibilityPending => {
                return Err(
                    PreconditionError::CallInFlight(WorkflowStage::EligibilityPending).into(),
                )
            }
            StageState::MatchPending { .. } => {
                return Err(PreconditionError::CallInFlight(WorkflowStage::MatchPending).into())
            }
        };

        if !verdict.is_eligible {
            return Err(PreconditionError::NotEligible.into());
        }
        let retained = retained.ok_or(PreconditionError::RetainedProfileMissing)?;
        self.withdraw_selection(&inner)?;

        inner.generation += 1;
        inner.store.remove(SessionKey::MatchResults);
        inner.stage = StageState::MatchPending {
            verdict,
            retained: retained.clone(),
        };
        inner.last_error = None;

        info!(user_id = %user.id, generation = inner.generation, "institution search dispatched");

        Ok(MatchTicket {
            generation: inner.generation,
            owner: user.id.clone(),
            request: retained,
        })
    }

    pub fn matcher_responds(
        &self,
        ticket: &MatchTicket,
        candidates: Vec<InstitutionCandidate>,
    ) -> Result<Disposition<MatchOutcome>, WorkflowError> {
        let mut inner = self.lock();
        let Some((verdict, retained)) = match_context(&*inner, ticket) else {
            return Ok(Disposition::Discarded);
        };

        inner.store.set(SessionKey::MatchResults, &candidates)?;
        inner.stage = StageState::MatchKnown {
            verdict,
            retained: retained.clone(),
            candidates: candidates.clone(),
            failure: None,
            selection: None,
        };
        inner.last_error = None;

        info!(matches = candidates.len(), "institution matches recorded");

        if !candidates.is_empty() {
            if let Err(err) = self.ensure_loan(&mut inner, &ticket.owner, &retained) {
                warn!(error = %err, "could not record matched loan; it will be created on selection");
            }
        }

        Ok(Disposition::Applied(MatchOutcome {
            candidates,
            failure: None,
            loan_id: inner.active_loan.clone(),
        }))
    }

    pub fn matcher_fails(
        &self,
        ticket: &MatchTicket,
        error: &EvaluatorError,
    ) -> Result<Disposition<MatchOutcome>, WorkflowError> {
        let mut inner = self.lock();
        let Some((verdict, retained)) = match_context(&*inner, ticket) else {
            return Ok(Disposition::Discarded);
        };

        warn!(error = %error, "institution matcher failed");
        let message = format!("Institution search failed: {error}");

        inner
            .store
            .set(SessionKey::MatchResults, &Vec::<InstitutionCandidate>::new())?;
        inner.stage = StageState::MatchKnown {
            verdict,
            retained,
            candidates: Vec::new(),
            failure: Some(message.clone()),
            selection: None,
        };
        inner.last_error = Some(message.clone());

        Ok(Disposition::Applied(MatchOutcome {
            candidates: Vec::new(),
            failure: Some(message),
            loan_id: inner.active_loan.clone(),
        }))
    }

    /// Choose one of the matched institutions; the loan moves to `KycPending`.
    pub fn select_institution(
        &self,
        user: Option<&CurrentUser>,
        institution_name: &str,
    ) -> Result<LoanRecord, WorkflowError> {
        let user = require_user(user)?;
        let mut inner = self.lock();
        self.resolve_restored_loan(&mut inner, &user.id)?;

        let (candidate, retained) = match &inner.stage {
            StageState::MatchKnown {
                candidates,
                retained,
                selection,
                ..
            } => {
                if selection.as_ref().is_some_and(|s| s.documents_submitted) {
                    return Err(PreconditionError::DocumentsAlreadySubmitted.into());
                }
                if candidates.is_empty() {
                    return Err(PreconditionError::NoMatchesAvailable.into());
                }
                let candidate = candidates
                    .iter()
                    .find(|candidate| candidate.name == institution_name.trim())
                    .cloned()
                    .ok_or_else(|| {
                        PreconditionError::UnknownInstitution(institution_name.to_string())
                    })?;
                (candidate, retained.clone())
            }
            StageState::MatchPending { .. } => {
                return Err(PreconditionError::CallInFlight(WorkflowStage::MatchPending).into())
            }
            _ => return Err(PreconditionError::NoMatchesAvailable.into()),
        };

        let mut record = self.ensure_loan(&mut inner, &user.id, &retained)?;
        record.assign_institution(&candidate);
        record.apply_status(LoanStatus::KycPending, self.today())?;
        self.loans.update(record.clone())?;

        info!(loan_id = %record.id, institution = %candidate.name, "institution selected");

        if let StageState::MatchKnown { selection, .. } = &mut inner.stage {
            *selection = Some(Selection {
                candidate,
                documents_submitted: false,
            });
        }

        Ok(record)
    }

    /// Record that KYC documents were uploaded to the selected institution.
    pub fn submit_documents(
        &self,
        user: Option<&CurrentUser>,
        submission: DocumentSubmission,
    ) -> Result<LoanRecord, WorkflowError> {
        let user = require_user(user)?;
        let mut inner = self.lock();
        self.resolve_restored_loan(&mut inner, &user.id)?;

        let selected = match &inner.stage {
            StageState::MatchKnown {
                selection: Some(selection),
                ..
            } => {
                if selection.documents_submitted {
                    return Err(PreconditionError::DocumentsAlreadySubmitted.into());
                }
                selection.candidate.name.clone()
            }
            StageState::MatchPending { .. } => {
                return Err(PreconditionError::CallInFlight(WorkflowStage::MatchPending).into())
            }
            _ => return Err(PreconditionError::NoInstitutionSelected.into()),
        };

        if submission.institution_name.trim() != selected {
            return Err(PreconditionError::InstitutionMismatch {
                selected,
                submitted: submission.institution_name,
            }
            .into());
        }
        if submission.document_categories.is_empty() {
            return Err(PreconditionError::NoDocuments.into());
        }
        let missing = submission.missing_required();
        if !missing.is_empty() {
            return Err(PreconditionError::MissingDocuments(missing).into());
        }

        let loan_id = inner
            .active_loan
            .clone()
            .ok_or(PreconditionError::NoInstitutionSelected)?;
        let mut record = self
            .loans
            .fetch(&loan_id)?
            .ok_or(RepositoryError::NotFound)?;

        record.submitted_documents = submission.document_categories;
        record.apply_status(LoanStatus::KycSubmitted, self.today())?;
        self.loans.update(record.clone())?;

        info!(
            loan_id = %record.id,
            institution = %selected,
            documents = record.submitted_documents.len(),
            "kyc documents submitted"
        );

        if let StageState::MatchKnown {
            selection: Some(selection),
            ..
        } = &mut inner.stage
        {
            selection.documents_submitted = true;
        }

        Ok(record)
    }

    /// Drop the session back to `Empty`. Any response still in flight will be discarded.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.generation += 1;
        inner.store.clear_all(&SessionKey::workflow_keys());
        inner.stage = StageState::Empty;
        inner.active_loan = None;
        inner.loan_unresolved = false;
        inner.last_error = None;
        info!(generation = inner.generation, "workflow session reset");
    }

    /// After a reload, pick up the open loan created for the restored matches
    /// instead of opening a second one. A loan still at `KycPending` brings its
    /// institution back as the current selection.
    fn resolve_restored_loan(
        &self,
        inner: &mut WorkflowInner<B>,
        owner: &str,
    ) -> Result<(), WorkflowError> {
        if !inner.loan_unresolved || inner.active_loan.is_some() {
            inner.loan_unresolved = false;
            return Ok(());
        }

        let (amount, collateral, candidates) = match &inner.stage {
            StageState::MatchKnown {
                retained,
                candidates,
                selection: None,
                ..
            } => (
                retained.requested_amount,
                retained.collateral_description.clone(),
                candidates.clone(),
            ),
            _ => {
                inner.loan_unresolved = false;
                return Ok(());
            }
        };

        let open = self
            .loans
            .list_for_owner(owner)?
            .into_iter()
            .filter(|record| {
                matches!(record.status(), LoanStatus::MfiMatched | LoanStatus::KycPending)
                    && record.amount == amount
                    && record.collateral_description == collateral
            })
            .max_by(|a, b| a.applied_date.cmp(&b.applied_date).then_with(|| a.id.cmp(&b.id)));
        inner.loan_unresolved = false;

        let Some(record) = open else {
            return Ok(());
        };

        let selected = (record.status() == LoanStatus::KycPending)
            .then(|| {
                candidates
                    .into_iter()
                    .find(|candidate| record.institution.as_deref() == Some(candidate.name.as_str()))
            })
            .flatten();

        info!(
            loan_id = %record.id,
            institution = record.institution.as_deref().unwrap_or("none"),
            "resumed open loan for restored matches"
        );

        inner.active_loan = Some(record.id);
        if let (Some(candidate), StageState::MatchKnown { selection, .. }) =
            (selected, &mut inner.stage)
        {
            *selection = Some(Selection {
                candidate,
                documents_submitted: false,
            });
        }

        Ok(())
    }

    /// A new search invalidates any institution chosen from the previous list.
    fn withdraw_selection(&self, inner: &WorkflowInner<B>) -> Result<(), WorkflowError> {
        let Some(id) = &inner.active_loan else {
            return Ok(());
        };
        let Some(mut record) = self.loans.fetch(id)? else {
            return Ok(());
        };
        if record.status() != LoanStatus::KycPending {
            return Ok(());
        }

        record.reopen_for_matching(self.today())?;
        self.loans.update(record)?;
        Ok(())
    }

    fn ensure_loan(
        &self,
        inner: &mut WorkflowInner<B>,
        owner: &str,
        retained: &MatchingProfile,
    ) -> Result<LoanRecord, WorkflowError> {
        if let Some(id) = &inner.active_loan {
            if let Some(record) = self.loans.fetch(id)? {
                return Ok(record);
            }
        }

        let today = self.today();
        let mut record = LoanRecord::new(
            next_loan_id(),
            owner,
            retained.requested_amount,
            retained.collateral_description.clone(),
            today,
        );
        record.apply_status(LoanStatus::MfiMatched, today)?;

        let stored = self.loans.insert(record)?;
        inner.active_loan = Some(stored.id.clone());
        Ok(stored)
    }

    async fn bounded<T, F>(&self, call: F) -> Result<T, EvaluatorError>
    where
        F: Future<Output = Result<T, EvaluatorError>>,
    {
        match tokio::time::timeout(self.settings.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(EvaluatorError::Timeout(self.settings.call_timeout)),
        }
    }
}

fn require_user(user: Option<&CurrentUser>) -> Result<&CurrentUser, PreconditionError> {
    user.ok_or(PreconditionError::Unauthenticated)
}

/// Context a matcher response applies to, or `None` when the ticket is stale.
fn match_context<B>(
    inner: &WorkflowInner<B>,
    ticket: &MatchTicket,
) -> Option<(EligibilityVerdict, MatchingProfile)> {
    if ticket.generation != inner.generation {
        debug!(ticket = ticket.generation, current = inner.generation, "discarding stale match response");
        return None;
    }

    match &inner.stage {
        StageState::MatchPending { verdict, retained } => Some((verdict.clone(), retained.clone())),
        _ => {
            debug!(stage = inner.stage.kind().label(), "discarding repeated match response");
            None
        }
    }
}

/// Rebuild the stage from persisted slots, dropping any slot the invariants forbid.
fn restore_stage<B: SessionBackend>(store: &SessionStateStore<B>) -> StageState {
    let verdict = store
        .get::<EligibilityVerdict>(SessionKey::EligibilityResult)
        .map(EligibilityVerdict::normalized);
    let retained = store.get::<MatchingProfile>(SessionKey::RetainedProfileForMatching);
    let candidates = store.get::<Vec<InstitutionCandidate>>(SessionKey::MatchResults);

    let Some(verdict) = verdict else {
        if retained.is_some() || candidates.is_some() {
            warn!("dropping session slots persisted without an eligibility verdict");
            store.clear_all(&[
                SessionKey::RetainedProfileForMatching,
                SessionKey::MatchResults,
            ]);
        }
        return StageState::Empty;
    };

    if !verdict.is_eligible {
        if retained.is_some() || candidates.is_some() {
            warn!("dropping matching slots persisted for a non-eligible verdict");
            store.clear_all(&[
                SessionKey::RetainedProfileForMatching,
                SessionKey::MatchResults,
            ]);
        }
        return StageState::EligibilityKnown {
            verdict,
            retained: None,
        };
    }

    match (retained, candidates) {
        (Some(retained), Some(candidates)) => StageState::MatchKnown {
            verdict,
            retained,
            candidates,
            failure: None,
            selection: None,
        },
        (Some(retained), None) => StageState::EligibilityKnown {
            verdict,
            retained: Some(retained),
        },
        (None, candidates) => {
            if candidates.is_some() {
                warn!("dropping match results persisted without a retained profile");
                store.remove(SessionKey::MatchResults);
            }
            StageState::EligibilityKnown {
                verdict,
                retained: None,
            }
        }
    }
}
