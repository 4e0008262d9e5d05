use async_trait::async_trait;
use loan_origination::workflows::origination::{
    EligibilityEvaluator, EligibilityRequest, EligibilityVerdict, EvaluatorError,
    InstitutionCandidate, InstitutionMatcher, LoanId, LoanRecord, LoanRepository,
    MatchingProfile, RepositoryError,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) readiness: Arc<AtomicBool>,
    pub(crate) metrics: Arc<PrometheusHandle>,
}

#[derive(Default, Clone)]
pub(crate) struct InMemoryLoanRepository {
    records: Arc<Mutex<HashMap<LoanId, LoanRecord>>>,
}

impl LoanRepository for InMemoryLoanRepository {
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
        if guard.contains_key(&record.id) {
            guard.insert(record.id.clone(), record);
            Ok(())
        } else {
            Err(RepositoryError::NotFound)
        }
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

/// Oldest vehicle the demo lenders accept as collateral.
const OLDEST_ACCEPTED_YEAR: u32 = 2005;

/// Offline stand-in for the eligibility service used by the demo command.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct RuleBasedEligibility;

#[async_trait]
impl EligibilityEvaluator for RuleBasedEligibility {
    async fn evaluate(
        &self,
        request: &EligibilityRequest,
    ) -> Result<EligibilityVerdict, EvaluatorError> {
        let mut missing_info = Vec::new();
        match vehicle_year(&request.collateral_description) {
            None => missing_info.push("Vehicle year of manufacture not clear".to_string()),
            Some(year) if year < OLDEST_ACCEPTED_YEAR => {
                return Ok(EligibilityVerdict::new(
                    false,
                    0,
                    format!("Vehicles manufactured before {OLDEST_ACCEPTED_YEAR} are not accepted."),
                    Vec::new(),
                ));
            }
            Some(_) => {}
        }
        if !request.proof_of_income_provided {
            missing_info.push("M-Pesa statement".to_string());
        }

        if !missing_info.is_empty() {
            return Ok(EligibilityVerdict::new(
                false,
                0,
                "More information is needed before we can assess this vehicle.",
                missing_info,
            ));
        }

        let ceiling = request.monthly_income.saturating_mul(3);
        let amount = request.requested_amount.min(ceiling);
        Ok(EligibilityVerdict::new(
            true,
            amount,
            format!("Eligible for up to KES {amount} against this vehicle."),
            Vec::new(),
        ))
    }
}

fn vehicle_year(collateral: &str) -> Option<u32> {
    collateral
        .split(|c: char| !c.is_ascii_digit())
        .filter(|token| token.len() == 4)
        .filter_map(|token| token.parse::<u32>().ok())
        .find(|year| (1950..=2100).contains(year))
}

/// Offline stand-in for the matching service: a fixed lender panel filtered by amount.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct PanelMatcher;

#[async_trait]
impl InstitutionMatcher for PanelMatcher {
    async fn find_matches(
        &self,
        request: &MatchingProfile,
    ) -> Result<Vec<InstitutionCandidate>, EvaluatorError> {
        let panel = [
            ("Faulu Kenya", 4.5, 0.82, 1_000_000, "faulukenya.com"),
            ("Momentum Credit", 5.0, 0.76, 500_000, "momentumcredit.co.ke"),
            ("Mogo Kenya", 6.5, 0.88, 250_000, "mogo.co.ke"),
        ];

        Ok(panel
            .iter()
            .filter(|(_, _, _, ceiling, _)| request.requested_amount <= *ceiling)
            .map(|(name, rate, approval, _, domain)| InstitutionCandidate {
                name: name.to_string(),
                interest_rate: *rate,
                processing_time: "24-48 hours".to_string(),
                approval_rate: *approval,
                requirements: vec![
                    "Original logbook".to_string(),
                    "National ID".to_string(),
                    "6-month M-Pesa statement".to_string(),
                ],
                loan_terms: "1 to 24 months".to_string(),
                contact_information: format!("loans@{domain}"),
                website_url: Some(format!("https://{domain}")),
                application_url: None,
            })
            .collect())
    }
}
