//! Adapters for the external eligibility and institution-matching services.
//!
//! Both services are opaque request/response collaborators. Adapters shape the
//! outbound request, map the inbound body into domain types, and report every
//! failure through [`EvaluatorError`]. They never retry or cache.

mod http;
mod wire;

use std::time::Duration;

use async_trait::async_trait;

use super::domain::{EligibilityRequest, EligibilityVerdict, InstitutionCandidate, MatchingProfile};

pub use http::{HttpEligibilityEvaluator, HttpInstitutionMatcher};
pub use wire::{
    candidates_from_json, verdict_from_json, CandidatePayload, EligibilityRequestPayload,
    MatchingRequestPayload, VerdictPayload,
};

#[async_trait]
pub trait EligibilityEvaluator: Send + Sync {
    async fn evaluate(
        &self,
        request: &EligibilityRequest,
    ) -> Result<EligibilityVerdict, EvaluatorError>;
}

#[async_trait]
pub trait InstitutionMatcher: Send + Sync {
    async fn find_matches(
        &self,
        request: &MatchingProfile,
    ) -> Result<Vec<InstitutionCandidate>, EvaluatorError>;
}

/// The single failure channel of both adapters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EvaluatorError {
    #[error("service unreachable: {0}")]
    Unreachable(String),
    #[error("service returned HTTP {status}: {body}")]
    Upstream { status: u16, body: String },
    #[error("service returned no output")]
    EmptyResponse,
    #[error("service returned malformed output: {0}")]
    Malformed(String),
    #[error("service did not respond within {0:?}")]
    Timeout(Duration),
}

impl EvaluatorError {
    /// `timeout` is the limit the client was configured with.
    pub(crate) fn from_transport(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            Self::Timeout(timeout)
        } else if err.is_decode() {
            Self::Malformed(err.to_string())
        } else {
            Self::Unreachable(err.to_string())
        }
    }
}
