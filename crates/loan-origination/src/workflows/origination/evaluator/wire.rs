use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::EvaluatorError;
use crate::workflows::origination::domain::{
    EligibilityRequest, EligibilityVerdict, InstitutionCandidate, MatchingProfile,
};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EligibilityRequestPayload<'a> {
    pub logbook_details: &'a str,
    pub requested_loan_amount: u64,
    pub monthly_income: u64,
    pub mpesa_statement_provided: bool,
}

impl<'a> From<&'a EligibilityRequest> for EligibilityRequestPayload<'a> {
    fn from(request: &'a EligibilityRequest) -> Self {
        Self {
            logbook_details: &request.collateral_description,
            requested_loan_amount: request.requested_amount,
            monthly_income: request.monthly_income,
            mpesa_statement_provided: request.proof_of_income_provided,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchingRequestPayload<'a> {
    pub logbook_details: &'a str,
    pub national_id: &'a str,
    pub loan_amount: u64,
    pub employment_status: &'static str,
    pub location: &'a str,
    pub credit_score: u16,
}

impl<'a> From<&'a MatchingProfile> for MatchingRequestPayload<'a> {
    fn from(profile: &'a MatchingProfile) -> Self {
        Self {
            logbook_details: &profile.collateral_description,
            national_id: &profile.national_id,
            loan_amount: profile.requested_amount,
            employment_status: profile.employment_status.label(),
            location: &profile.location,
            credit_score: profile.credit_score,
        }
    }
}

/// Inbound verdict; every field is optional so absence can be reported precisely.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerdictPayload {
    pub is_eligible: Option<bool>,
    pub eligible_amount: Option<f64>,
    pub feedback: Option<String>,
    pub missing_info: Option<Vec<String>>,
}

impl TryFrom<VerdictPayload> for EligibilityVerdict {
    type Error = EvaluatorError;

    fn try_from(payload: VerdictPayload) -> Result<Self, Self::Error> {
        let is_eligible = payload.is_eligible.ok_or_else(|| missing("isEligible"))?;
        let amount = payload
            .eligible_amount
            .ok_or_else(|| missing("eligibleAmount"))?;
        if !amount.is_finite() || amount < 0.0 {
            return Err(EvaluatorError::Malformed(format!(
                "eligibleAmount must be a non-negative number, found {amount}"
            )));
        }
        let feedback = payload.feedback.ok_or_else(|| missing("feedback"))?;

        Ok(EligibilityVerdict::new(
            is_eligible,
            amount.round() as u64,
            feedback,
            payload.missing_info.unwrap_or_default(),
        ))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidatePayload {
    pub name: Option<String>,
    pub interest_rate: Option<f64>,
    pub processing_time: Option<String>,
    pub approval_rate: Option<f64>,
    pub requirements: Option<Vec<String>>,
    pub loan_terms: Option<String>,
    pub contact_information: Option<String>,
    pub website_url: Option<String>,
    pub application_url: Option<String>,
}

impl TryFrom<CandidatePayload> for InstitutionCandidate {
    type Error = EvaluatorError;

    fn try_from(payload: CandidatePayload) -> Result<Self, Self::Error> {
        let name = payload
            .name
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| missing("name"))?;

        let interest_rate = payload.interest_rate.ok_or_else(|| missing("interestRate"))?;
        if !interest_rate.is_finite() || interest_rate < 0.0 {
            return Err(EvaluatorError::Malformed(format!(
                "interestRate for {name} must be a non-negative number"
            )));
        }

        let approval_rate = payload.approval_rate.ok_or_else(|| missing("approvalRate"))?;
        if !(0.0..=1.0).contains(&approval_rate) {
            return Err(EvaluatorError::Malformed(format!(
                "approvalRate for {name} must be within 0.0-1.0, found {approval_rate}"
            )));
        }

        Ok(InstitutionCandidate {
            interest_rate,
            approval_rate,
            processing_time: payload
                .processing_time
                .ok_or_else(|| missing("processingTime"))?,
            requirements: payload.requirements.ok_or_else(|| missing("requirements"))?,
            loan_terms: payload.loan_terms.ok_or_else(|| missing("loanTerms"))?,
            contact_information: payload
                .contact_information
                .ok_or_else(|| missing("contactInformation"))?,
            website_url: payload.website_url.filter(|url| !url.trim().is_empty()),
            application_url: payload.application_url.filter(|url| !url.trim().is_empty()),
            name,
        })
    }
}

fn missing(field: &str) -> EvaluatorError {
    EvaluatorError::Malformed(format!("missing required field '{field}'"))
}

/// Maps an eligibility response body. `null` and blank bodies count as no output.
pub fn verdict_from_json(body: &str) -> Result<EligibilityVerdict, EvaluatorError> {
    let payload: Option<VerdictPayload> = decode(body)?;
    payload.ok_or(EvaluatorError::EmptyResponse)?.try_into()
}

/// Maps a matching response body into an ordered candidate list with unique names.
pub fn candidates_from_json(body: &str) -> Result<Vec<InstitutionCandidate>, EvaluatorError> {
    let payload: Option<Vec<CandidatePayload>> = decode(body)?;
    let payload = payload.ok_or(EvaluatorError::EmptyResponse)?;

    let mut seen = HashSet::new();
    let mut candidates = Vec::with_capacity(payload.len());
    for entry in payload {
        let candidate = InstitutionCandidate::try_from(entry)?;
        if !seen.insert(candidate.name.clone()) {
            return Err(EvaluatorError::Malformed(format!(
                "institution '{}' listed more than once",
                candidate.name
            )));
        }
        candidates.push(candidate);
    }

    Ok(candidates)
}

fn decode<T: serde::de::DeserializeOwned>(body: &str) -> Result<Option<T>, EvaluatorError> {
    if body.trim().is_empty() {
        return Err(EvaluatorError::EmptyResponse);
    }
    serde_json::from_str::<Option<T>>(body).map_err(|err| EvaluatorError::Malformed(err.to_string()))
}
