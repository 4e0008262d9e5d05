//! End-to-end origination scenarios driven through the public controller API.
//!
//! Evaluators are in-process doubles so each scenario controls exactly what the
//! external services answer.

mod common {
    use std::collections::{HashMap, VecDeque};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use chrono::NaiveDate;

    use loan_origination::workflows::origination::{
        ApplicantProfile, CurrentUser, EligibilityEvaluator, EligibilityRequest,
        EligibilityVerdict, EmploymentStatus, EvaluatorError, InstitutionCandidate,
        InstitutionMatcher, LoanId, LoanRecord, LoanRepository, MatchingProfile,
        MemorySessionBackend, RepositoryError, WorkflowController, WorkflowSettings,
    };

    pub(super) fn user() -> CurrentUser {
        CurrentUser {
            id: "user-kamau".to_string(),
            email: "kamau@example.co.ke".to_string(),
            email_verified: false,
        }
    }

    pub(super) fn profile(collateral: &str) -> ApplicantProfile {
        ApplicantProfile {
            collateral_description: collateral.to_string(),
            requested_amount: 60_000,
            monthly_income: 55_000,
            proof_of_income_provided: true,
            national_id: "2345678".to_string(),
            employment_status: EmploymentStatus::Employed,
            location: "Eldoret".to_string(),
            credit_score: None,
        }
    }

    pub(super) fn candidate(name: &str) -> InstitutionCandidate {
        InstitutionCandidate {
            name: name.to_string(),
            interest_rate: 4.0,
            processing_time: "24 hours".to_string(),
            approval_rate: 0.75,
            requirements: vec!["Original logbook".to_string()],
            loan_terms: "3 to 18 months".to_string(),
            contact_information: "0700 000 000".to_string(),
            website_url: Some("https://lender.example".to_string()),
            application_url: None,
        }
    }

    pub(super) struct FixedEvaluator(pub(super) EligibilityVerdict);

    #[async_trait]
    impl EligibilityEvaluator for FixedEvaluator {
        async fn evaluate(
            &self,
            _request: &EligibilityRequest,
        ) -> Result<EligibilityVerdict, EvaluatorError> {
            Ok(self.0.clone())
        }
    }

    #[derive(Default)]
    pub(super) struct ScriptedMatcher {
        answers: Mutex<VecDeque<Result<Vec<InstitutionCandidate>, EvaluatorError>>>,
    }

    impl ScriptedMatcher {
        pub(super) fn new(
            answers: Vec<Result<Vec<InstitutionCandidate>, EvaluatorError>>,
        ) -> Arc<Self> {
            Arc::new(Self {
                answers: Mutex::new(answers.into_iter().collect()),
            })
        }
    }

    #[async_trait]
    impl InstitutionMatcher for ScriptedMatcher {
        async fn find_matches(
            &self,
            _request: &MatchingProfile,
        ) -> Result<Vec<InstitutionCandidate>, EvaluatorError> {
            self.answers
                .lock()
                .expect("matcher mutex poisoned")
                .pop_front()
                .unwrap_or(Err(EvaluatorError::EmptyResponse))
        }
    }

    #[derive(Default)]
    pub(super) struct Loans {
        records: Mutex<HashMap<LoanId, LoanRecord>>,
    }

    impl Loans {
        pub(super) fn only(&self) -> LoanRecord {
            let guard = self.records.lock().expect("loans mutex poisoned");
            assert_eq!(guard.len(), 1, "expected exactly one loan");
            guard.values().next().cloned().expect("one loan")
        }
    }

    impl LoanRepository for Loans {
        fn insert(&self, record: LoanRecord) -> Result<LoanRecord, RepositoryError> {
            let mut guard = self.records.lock().expect("loans mutex poisoned");
            if guard.contains_key(&record.id) {
                return Err(RepositoryError::Conflict);
            }
            guard.insert(record.id.clone(), record.clone());
            Ok(record)
        }

        fn update(&self, record: LoanRecord) -> Result<(), RepositoryError> {
            let mut guard = self.records.lock().expect("loans mutex poisoned");
            guard.insert(record.id.clone(), record);
            Ok(())
        }

        fn fetch(&self, id: &LoanId) -> Result<Option<LoanRecord>, RepositoryError> {
            let guard = self.records.lock().expect("loans mutex poisoned");
            Ok(guard.get(id).cloned())
        }

        fn list_for_owner(&self, owner: &str) -> Result<Vec<LoanRecord>, RepositoryError> {
            let guard = self.records.lock().expect("loans mutex poisoned");
            Ok(guard
                .values()
                .filter(|record| record.owner == owner)
                .cloned()
                .collect())
        }
    }

    pub(super) fn controller(
        backend: MemorySessionBackend,
        verdict: EligibilityVerdict,
        matcher: Arc<ScriptedMatcher>,
    ) -> (WorkflowController<MemorySessionBackend, Loans>, Arc<Loans>) {
        let loans = Arc::new(Loans::default());
        let controller = WorkflowController::new(
            backend,
            Arc::new(FixedEvaluator(verdict)),
            matcher,
            loans.clone(),
            WorkflowSettings {
                clock: || NaiveDate::from_ymd_opt(2025, 6, 2).expect("valid date"),
                ..WorkflowSettings::default()
            },
        );
        (controller, loans)
    }
}

use common::*;
use loan_origination::workflows::origination::{
    DocumentSubmission, EligibilityVerdict, EvaluatorError, LoanStatus, MemorySessionBackend,
    PreconditionError, WorkflowError, WorkflowStage, REQUIRED_KYC_DOCUMENTS,
};

#[tokio::test]
async fn collateral_without_a_year_is_not_eligible_and_cannot_be_matched() {
    let backend = MemorySessionBackend::default();
    let verdict = EligibilityVerdict::new(
        false,
        0,
        "We could not determine the vehicle's age.",
        vec!["Vehicle year of manufacture not clear".to_string()],
    );
    let (controller, _) = controller(backend.clone(), verdict, ScriptedMatcher::new(Vec::new()));

    let outcome = controller
        .submit(Some(&user()), profile("Silver Toyota Probox"))
        .await
        .expect("submission accepted");

    assert!(!outcome.verdict.is_eligible);
    assert_eq!(
        outcome.verdict.missing_info,
        vec!["Vehicle year of manufacture not clear".to_string()]
    );
    assert_eq!(controller.stage(), WorkflowStage::EligibilityKnown);

    match controller.request_matches(Some(&user())).await {
        Err(WorkflowError::Precondition(PreconditionError::NotEligible)) => {}
        other => panic!("expected precondition error, got {other:?}"),
    }
    assert!(backend.raw("matchResults").is_none());
}

#[tokio::test]
async fn eligible_applicant_selects_a_lender_and_submits_kyc() {
    let verdict = EligibilityVerdict::new(true, 50_000, "Eligible for KES 50,000.", Vec::new());
    let matcher = ScriptedMatcher::new(vec![Ok(vec![
        candidate("Momentum Credit"),
        candidate("Mogo Kenya"),
    ])]);
    let (controller, loans) = controller(MemorySessionBackend::default(), verdict, matcher);

    controller
        .submit(Some(&user()), profile("Toyota Probox 2014, KCB 456Y"))
        .await
        .expect("eligible");
    let matches = controller
        .request_matches(Some(&user()))
        .await
        .expect("matches returned");
    assert_eq!(controller.stage(), WorkflowStage::MatchKnown);
    assert_eq!(matches.candidates.len(), 2);

    let first = matches.candidates[0].name.clone();
    controller
        .select_institution(Some(&user()), &first)
        .expect("selection recorded");
    let record = controller
        .submit_documents(
            Some(&user()),
            DocumentSubmission {
                institution_name: first.clone(),
                document_categories: REQUIRED_KYC_DOCUMENTS
                    .iter()
                    .map(|category| category.to_string())
                    .collect(),
            },
        )
        .expect("documents accepted");

    assert_eq!(record.status(), LoanStatus::KycSubmitted);
    let stored = loans.only();
    assert_eq!(stored.status(), LoanStatus::KycSubmitted);
    assert_eq!(stored.institution.as_deref(), Some(first.as_str()));
    assert_eq!(stored.amount, 60_000);
    assert_eq!(stored.summary_view().progress, 50);
}

#[tokio::test]
async fn failed_search_surfaces_an_error_and_allows_a_retry() {
    let verdict = EligibilityVerdict::new(true, 50_000, "Eligible.", Vec::new());
    let matcher = ScriptedMatcher::new(vec![
        Err(EvaluatorError::Unreachable("dns lookup failed".to_string())),
        Ok(vec![candidate("Momentum Credit")]),
    ]);
    let backend = MemorySessionBackend::default();
    let (controller, _) = controller(backend.clone(), verdict, matcher);
    controller
        .submit(Some(&user()), profile("Nissan Note 2016"))
        .await
        .expect("eligible");

    let failed = controller
        .request_matches(Some(&user()))
        .await
        .expect("failure surfaced");
    assert_eq!(controller.stage(), WorkflowStage::MatchKnown);
    assert!(failed.candidates.is_empty());
    assert!(!failed.failure.unwrap_or_default().is_empty());
    assert_eq!(backend.raw("matchResults").as_deref(), Some("[]"));

    let retried = controller
        .request_matches(Some(&user()))
        .await
        .expect("retry permitted");
    assert_eq!(retried.candidates.len(), 1);
    assert!(retried.failure.is_none());
}

#[tokio::test]
async fn corrupted_match_results_are_ignored_on_resume() {
    let backend = MemorySessionBackend::default();
    let verdict = EligibilityVerdict::new(true, 50_000, "Eligible.", Vec::new());
    let (first, _) = controller(backend.clone(), verdict.clone(), ScriptedMatcher::new(Vec::new()));
    first
        .submit(Some(&user()), profile("Honda Fit 2013"))
        .await
        .expect("eligible");
    backend.insert_raw("matchResults", "this is not json");

    let (resumed, _) = controller(
        backend.clone(),
        verdict,
        ScriptedMatcher::new(vec![Ok(vec![candidate("Mogo Kenya")])]),
    );

    let snapshot = resumed.snapshot();
    assert_eq!(snapshot.stage, WorkflowStage::EligibilityKnown);
    assert!(snapshot.candidates.is_none());
    assert!(backend.raw("matchResults").is_none());

    let matches = resumed
        .request_matches(Some(&user()))
        .await
        .expect("matching still possible");
    assert_eq!(matches.candidates.len(), 1);
}
