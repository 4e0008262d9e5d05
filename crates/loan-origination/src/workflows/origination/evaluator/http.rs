use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use super::wire::{
    candidates_from_json, verdict_from_json, EligibilityRequestPayload, MatchingRequestPayload,
};
use super::{EligibilityEvaluator, EvaluatorError, InstitutionMatcher};
use crate::config::EvaluatorConfig;
use crate::workflows::origination::domain::{
    EligibilityRequest, EligibilityVerdict, InstitutionCandidate, MatchingProfile,
};

/// Shared plumbing: one pooled client, one endpoint, optional bearer token.
#[derive(Clone)]
struct JsonEndpoint {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl JsonEndpoint {
    fn new(config: &EvaluatorConfig, url: &str) -> Result<Self, EvaluatorError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| EvaluatorError::from_transport(err, config.timeout))?;

        Ok(Self::with_client(client, config, url))
    }

    fn with_client(client: reqwest::Client, config: &EvaluatorConfig, url: &str) -> Self {
        Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            timeout: config.timeout,
        }
    }

    async fn post<T: Serialize + ?Sized>(&self, body: &T) -> Result<String, EvaluatorError> {
        let mut request = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|err| EvaluatorError::from_transport(err, self.timeout))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|err| EvaluatorError::from_transport(err, self.timeout))?;

        if !status.is_success() {
            return Err(EvaluatorError::Upstream {
                status: status.as_u16(),
                body: text,
            });
        }

        debug!(url = %self.url, status = status.as_u16(), bytes = text.len(), "evaluator responded");
        Ok(text)
    }
}

/// Eligibility evaluator reached over HTTP.
#[derive(Clone)]
pub struct HttpEligibilityEvaluator {
    endpoint: JsonEndpoint,
}

impl HttpEligibilityEvaluator {
    pub fn new(config: &EvaluatorConfig, url: &str) -> Result<Self, EvaluatorError> {
        Ok(Self {
            endpoint: JsonEndpoint::new(config, url)?,
        })
    }

    /// Reuse an existing [`reqwest::Client`] so both adapters share one pool.
    /// The configured timeout still applies per request.
    pub fn with_client(client: reqwest::Client, config: &EvaluatorConfig, url: &str) -> Self {
        Self {
            endpoint: JsonEndpoint::with_client(client, config, url),
        }
    }
}

#[async_trait]
impl EligibilityEvaluator for HttpEligibilityEvaluator {
    async fn evaluate(
        &self,
        request: &EligibilityRequest,
    ) -> Result<EligibilityVerdict, EvaluatorError> {
        let body = self
            .endpoint
            .post(&EligibilityRequestPayload::from(request))
            .await?;
        verdict_from_json(&body)
    }
}

/// Institution matcher reached over HTTP.
#[derive(Clone)]
pub struct HttpInstitutionMatcher {
    endpoint: JsonEndpoint,
}

impl HttpInstitutionMatcher {
    pub fn new(config: &EvaluatorConfig, url: &str) -> Result<Self, EvaluatorError> {
        Ok(Self {
            endpoint: JsonEndpoint::new(config, url)?,
        })
    }

    pub fn with_client(client: reqwest::Client, config: &EvaluatorConfig, url: &str) -> Self {
        Self {
            endpoint: JsonEndpoint::with_client(client, config, url),
        }
    }
}

#[async_trait]
impl InstitutionMatcher for HttpInstitutionMatcher {
    async fn find_matches(
        &self,
        request: &MatchingProfile,
    ) -> Result<Vec<InstitutionCandidate>, EvaluatorError> {
        let body = self
            .endpoint
            .post(&MatchingRequestPayload::from(request))
            .await?;
        candidates_from_json(&body)
    }
}
