//! Logbook loan origination: eligibility check, lender matching, institution
//! selection, KYC submission, and post-submission tracking.

pub mod controller;
pub mod domain;
pub mod evaluator;
pub mod lifecycle;
pub mod repository;
pub mod router;
pub mod session;
pub mod sessions;
pub mod tracker;

#[cfg(test)]
mod tests;

pub use controller::{
    Disposition, EligibilityOutcome, EligibilityTicket, MatchOutcome, MatchTicket,
    PreconditionError, WorkflowController, WorkflowError, WorkflowSettings, WorkflowSnapshot,
    WorkflowStage, DEFAULT_CALL_TIMEOUT,
};
pub use domain::{
    ApplicantProfile, CurrentUser, DocumentSubmission, EligibilityRequest, EligibilityVerdict,
    EmploymentStatus, InstitutionCandidate, MatchingProfile, ValidationError, MAX_CREDIT_SCORE,
    REQUIRED_KYC_DOCUMENTS,
};
pub use evaluator::{
    EligibilityEvaluator, EvaluatorError, HttpEligibilityEvaluator, HttpInstitutionMatcher,
    InstitutionMatcher,
};
pub use lifecycle::{
    LifecycleError, LoanId, LoanRecord, LoanStatus, LoanSummaryView, RepaymentStatus,
    TransitionKind,
};
pub use repository::{LoanRepository, RepositoryError};
pub use router::{
    current_user, institution_authorized, origination_router, OriginationState, SelectionRequest,
    INSTITUTION_KEY_HEADER,
};
pub use session::{
    MemorySessionBackend, SessionBackend, SessionKey, SessionStateStore, SessionWriteError,
    StateCorruption,
};
pub use sessions::{SessionController, WorkflowSessions};
pub use tracker::{BuyOffUpdate, InstitutionUpdate, LoanTracker, LoanTrackerError, RepaymentUpdate};
