use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::response::Response;
use chrono::NaiveDate;
use serde_json::Value;

use crate::workflows::origination::domain::{
    ApplicantProfile, CurrentUser, DocumentSubmission, EligibilityRequest, EligibilityVerdict,
    EmploymentStatus, InstitutionCandidate, MatchingProfile, REQUIRED_KYC_DOCUMENTS,
};
use crate::workflows::origination::evaluator::{
    EligibilityEvaluator, EvaluatorError, InstitutionMatcher,
};
use crate::workflows::origination::lifecycle::{LoanId, LoanRecord};
use crate::workflows::origination::repository::{LoanRepository, RepositoryError};
use crate::workflows::origination::session::MemorySessionBackend;
use crate::workflows::origination::{
    origination_router, LoanTracker, OriginationState, WorkflowController, WorkflowSessions,
    WorkflowSettings,
};

pub(super) fn fixed_today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 3, 14).expect("valid date")
}

pub(super) fn date(month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, month, day).expect("valid date")
}

pub(super) fn settings() -> WorkflowSettings {
    WorkflowSettings {
        call_timeout: Duration::from_secs(2),
        clock: fixed_today,
    }
}

pub(super) fn user() -> CurrentUser {
    CurrentUser {
        id: "user-wanjiru".to_string(),
        email: "wanjiru@example.co.ke".to_string(),
        email_verified: true,
    }
}

pub(super) fn profile() -> ApplicantProfile {
    ApplicantProfile {
        collateral_description: "Toyota Axio KDA 123X, 2015".to_string(),
        requested_amount: 50_000,
        monthly_income: 40_000,
        proof_of_income_provided: true,
        national_id: "12345678".to_string(),
        employment_status: EmploymentStatus::SelfEmployed,
        location: "Nakuru".to_string(),
        credit_score: Some(640),
    }
}

pub(super) fn eligible_verdict() -> EligibilityVerdict {
    EligibilityVerdict::new(
        true,
        45_200,
        "Your vehicle qualifies for a logbook loan.",
        Vec::new(),
    )
}

pub(super) fn ineligible_verdict() -> EligibilityVerdict {
    EligibilityVerdict::new(
        false,
        0,
        "The vehicle is older than our lenders accept.",
        vec!["newer vehicle".to_string()],
    )
}

pub(super) fn candidate(name: &str, interest_rate: f64) -> InstitutionCandidate {
    InstitutionCandidate {
        name: name.to_string(),
        interest_rate,
        processing_time: "48 hours".to_string(),
        approval_rate: 0.8,
        requirements: vec!["Original logbook".to_string(), "National ID".to_string()],
        loan_terms: "Up to 12 months".to_string(),
        contact_information: format!("loans@{}.co.ke", name.to_lowercase().replace(' ', "")),
        website_url: None,
        application_url: None,
    }
}

pub(super) fn candidates() -> Vec<InstitutionCandidate> {
    vec![candidate("Faulu Kenya", 4.5), candidate("Platinum Credit", 5.2)]
}

pub(super) fn full_documents(institution: &str) -> DocumentSubmission {
    DocumentSubmission {
        institution_name: institution.to_string(),
        document_categories: REQUIRED_KYC_DOCUMENTS
            .iter()
            .map(|category| category.to_string())
            .collect(),
    }
}

struct Step<T> {
    delay: Duration,
    result: Result<T, EvaluatorError>,
}

/// Evaluator double that replays queued results, optionally after a delay.
#[derive(Default)]
pub(super) struct StubEvaluator {
    steps: Mutex<VecDeque<Step<EligibilityVerdict>>>,
    requests: Mutex<Vec<EligibilityRequest>>,
}

impl StubEvaluator {
    pub(super) fn answering(verdict: EligibilityVerdict) -> Arc<Self> {
        let stub = Self::default();
        stub.push(Duration::ZERO, Ok(verdict));
        Arc::new(stub)
    }

    pub(super) fn failing(error: EvaluatorError) -> Arc<Self> {
        let stub = Self::default();
        stub.push(Duration::ZERO, Err(error));
        Arc::new(stub)
    }

    pub(super) fn push(&self, delay: Duration, result: Result<EligibilityVerdict, EvaluatorError>) {
        self.steps
            .lock()
            .expect("stub mutex poisoned")
            .push_back(Step { delay, result });
    }

    pub(super) fn requests(&self) -> Vec<EligibilityRequest> {
        self.requests.lock().expect("stub mutex poisoned").clone()
    }
}

#[async_trait]
impl EligibilityEvaluator for StubEvaluator {
    async fn evaluate(
        &self,
        request: &EligibilityRequest,
    ) -> Result<EligibilityVerdict, EvaluatorError> {
        self.requests
            .lock()
            .expect("stub mutex poisoned")
            .push(request.clone());
        let step = self.steps.lock().expect("stub mutex poisoned").pop_front();
        let Some(step) = step else {
            return Err(EvaluatorError::EmptyResponse);
        };
        if !step.delay.is_zero() {
            tokio::time::sleep(step.delay).await;
        }
        step.result
    }
}

/// Matcher double mirroring [`StubEvaluator`].
#[derive(Default)]
pub(super) struct StubMatcher {
    steps: Mutex<VecDeque<Step<Vec<InstitutionCandidate>>>>,
    calls: AtomicUsize,
}

impl StubMatcher {
    pub(super) fn answering(candidates: Vec<InstitutionCandidate>) -> Arc<Self> {
        let stub = Self::default();
        stub.push(Duration::ZERO, Ok(candidates));
        Arc::new(stub)
    }

    pub(super) fn push(
        &self,
        delay: Duration,
        result: Result<Vec<InstitutionCandidate>, EvaluatorError>,
    ) {
        self.steps
            .lock()
            .expect("stub mutex poisoned")
            .push_back(Step { delay, result });
    }

    pub(super) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InstitutionMatcher for StubMatcher {
    async fn find_matches(
        &self,
        _request: &MatchingProfile,
    ) -> Result<Vec<InstitutionCandidate>, EvaluatorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.steps.lock().expect("stub mutex poisoned").pop_front();
        let Some(step) = step else {
            return Err(EvaluatorError::EmptyResponse);
        };
        if !step.delay.is_zero() {
            tokio::time::sleep(step.delay).await;
        }
        step.result
    }
}

#[derive(Default, Clone)]
pub(super) struct MemoryLoanRepository {
    pub(super) records: Arc<Mutex<HashMap<LoanId, LoanRecord>>>,
}

impl MemoryLoanRepository {
    pub(super) fn all(&self) -> Vec<LoanRecord> {
        self.records
            .lock()
            .expect("repository mutex poisoned")
            .values()
            .cloned()
            .collect()
    }
}

impl LoanRepository for MemoryLoanRepository {
    fn insert(&self, record: LoanRecord) -> Result<LoanRecord, RepositoryError> {
        let mut guard = self.records.lock().expect("repository mutex poisoned");
        if guard.contains_key(&record.id) {
            return Err(RepositoryError::Conflict);
        }
        guard.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    fn update(&self, record: LoanRecord) -> Result<(), RepositoryError> {
        let mut guard = self.records.lock().expect("repository mutex poisoned");
        if !guard.contains_key(&record.id) {
            return Err(RepositoryError::NotFound);
        }
        guard.insert(record.id.clone(), record);
        Ok(())
    }

    fn fetch(&self, id: &LoanId) -> Result<Option<LoanRecord>, RepositoryError> {
        let guard = self.records.lock().expect("repository mutex poisoned");
        Ok(guard.get(id).cloned())
    }

    fn list_for_owner(&self, owner: &str) -> Result<Vec<LoanRecord>, RepositoryError> {
        let guard = self.records.lock().expect("repository mutex poisoned");
        Ok(guard
            .values()
            .filter(|record| record.owner == owner)
            .cloned()
            .collect())
    }
}

pub(super) struct UnavailableRepository;

impl LoanRepository for UnavailableRepository {
    fn insert(&self, _record: LoanRecord) -> Result<LoanRecord, RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }

    fn update(&self, _record: LoanRecord) -> Result<(), RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }

    fn fetch(&self, _id: &LoanId) -> Result<Option<LoanRecord>, RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }

    fn list_for_owner(&self, _owner: &str) -> Result<Vec<LoanRecord>, RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }
}

pub(super) type TestController = WorkflowController<MemorySessionBackend, MemoryLoanRepository>;

pub(super) fn build_controller(
    backend: MemorySessionBackend,
    evaluator: Arc<StubEvaluator>,
    matcher: Arc<StubMatcher>,
) -> (TestController, Arc<MemoryLoanRepository>) {
    let loans = Arc::new(MemoryLoanRepository::default());
    let controller = WorkflowController::new(backend, evaluator, matcher, loans.clone(), settings());
    (controller, loans)
}

/// Controller that has already received an eligible verdict.
pub(super) fn eligible_controller(
    backend: MemorySessionBackend,
    matcher: Arc<StubMatcher>,
) -> (TestController, Arc<MemoryLoanRepository>) {
    let (controller, loans) = build_controller(backend, Arc::new(StubEvaluator::default()), matcher);
    let ticket = controller
        .begin_submission(Some(&user()), &profile())
        .expect("valid submission");
    controller
        .evaluator_responds(&ticket, eligible_verdict())
        .expect("verdict applied");
    (controller, loans)
}

pub(super) const INSTITUTION_KEY: &str = "lender-key";

pub(super) fn origination_state(
    evaluator: Arc<StubEvaluator>,
    matcher: Arc<StubMatcher>,
) -> (OriginationState<MemoryLoanRepository>, Arc<MemoryLoanRepository>) {
    let loans = Arc::new(MemoryLoanRepository::default());
    let sessions = WorkflowSessions::new(evaluator, matcher, loans.clone(), settings());
    let state = OriginationState {
        sessions: Arc::new(sessions),
        tracker: Arc::new(LoanTracker::new(loans.clone())),
        institution_key: Some(Arc::from(INSTITUTION_KEY)),
    };
    (state, loans)
}

pub(super) fn router_with(
    evaluator: Arc<StubEvaluator>,
    matcher: Arc<StubMatcher>,
) -> (axum::Router, Arc<MemoryLoanRepository>) {
    let (state, loans) = origination_state(evaluator, matcher);
    (origination_router(state), loans)
}

pub(super) async fn read_json_body(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .expect("read body");
    serde_json::from_slice(&body).expect("json payload")
}
