//! HTTP scoring oracle.
//!
//! POSTs `{text, context}` to `{base_url}/analyze` and expects
//! `{traits, confidence}` back. Status codes map onto error kinds so the
//! retry policy and the breaker can act on them.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::OracleConfig;
use crate::domain::ports::{AnalysisContext, AnalysisResult, ScoringOracle};
use crate::infrastructure::logging::LogScrubber;

/// Longest error body kept in error messages.
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Serialize)]
struct AnalyzeRequest<'a> {
    text: &'a str,
    context: &'a AnalysisContext,
}

pub struct HttpScoringOracle {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    timeout: Duration,
    scrubber: LogScrubber,
}

impl HttpScoringOracle {
    pub fn new(config: &OracleConfig) -> DomainResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| DomainError::OracleUnavailable(format!("failed to build HTTP client: {e}")))?;
        let scrubber =
            LogScrubber::new().map_err(|e| DomainError::ValidationFailed(format!("invalid scrubber pattern: {e}")))?;

        Ok(Self {
            client,
            endpoint: format!("{}/analyze", config.base_url.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            timeout: config.timeout(),
            scrubber,
        })
    }

    fn map_status(&self, status: StatusCode, body: &str) -> DomainError {
        let mut detail = self.scrubber.scrub(body);
        if detail.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !detail.is_char_boundary(cut) {
                cut -= 1;
            }
            detail.truncate(cut);
        }

        match status.as_u16() {
            408 | 504 => DomainError::OracleTimeout {
                timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
            },
            429 => DomainError::RateLimited,
            401 | 403 => DomainError::Unauthorized(format!("oracle returned {status}: {detail}")),
            s if s >= 500 => DomainError::OracleUnavailable(format!("oracle returned {status}: {detail}")),
            _ => DomainError::ValidationFailed(format!("oracle returned {status}: {detail}")),
        }
    }

    fn map_transport_error(&self, err: &reqwest::Error) -> DomainError {
        if err.is_timeout() {
            DomainError::OracleTimeout {
                timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
            }
        } else {
            DomainError::OracleUnavailable(self.scrubber.scrub(&err.to_string()))
        }
    }
}

#[async_trait]
impl ScoringOracle for HttpScoringOracle {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn analyze(&self, text: &str, context: &AnalysisContext) -> DomainResult<AnalysisResult> {
        let mut request = self.client.post(&self.endpoint).json(&AnalyzeRequest { text, context });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| self.map_transport_error(&e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.map_status(status, &body));
        }

        let result: AnalysisResult = response
            .json()
            .await
            .map_err(|e| DomainError::ValidationFailed(format!("malformed oracle response: {e}")))?;
        if !result.confidence.is_finite() {
            return Err(DomainError::ValidationFailed("oracle returned non-finite confidence".to_string()));
        }
        Ok(result)
    }
}
