use std::future::Future;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::Instrument;

/// Upper bound on SQL accepted from the agent.
pub const MAX_SQL_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone, Serialize)]
pub struct AgentRequest<'a> {
    pub request_id: &'a str,
    /// Filtered schema as produced by `SchemaDescriptor::agent_view`.
    pub schema: &'a serde_json::Value,
    pub input: &'a str,
}

#[derive(Debug, Deserialize)]
struct AgentResponse {
    sql: String,
}

#[derive(Debug)]
pub enum AgentError {
    Timeout,
    Unavailable,
    BadStatus(u16),
    InvalidResponse,
}

impl AgentError {
    pub fn code(&self) -> &'static str {
        match self {
            AgentError::Timeout => "ERR_AGENT_TIMEOUT",
            AgentError::Unavailable | AgentError::BadStatus(_) => "ERR_AGENT_UNAVAILABLE",
            AgentError::InvalidResponse => "ERR_AGENT_INVALID_RESPONSE",
        }
    }
}

impl std::fmt::Display for AgentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentError::Timeout => write!(f, "agent request timed out"),
            AgentError::Unavailable => write!(f, "agent request failed"),
            AgentError::BadStatus(status) => write!(f, "agent returned status {}", status),
            AgentError::InvalidResponse => write!(f, "agent returned an invalid response"),
        }
    }
}

impl std::error::Error for AgentError {}

impl From<reqwest::Error> for AgentError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            AgentError::Timeout
        } else {
            AgentError::Unavailable
        }
    }
}

/// The external component that turns a question plus a filtered schema into
/// one SQL string. Nothing it returns is trusted.
pub trait QueryAgent: Send + Sync {
    fn draft_sql(
        &self,
        request: &AgentRequest<'_>,
        timeout: Duration,
    ) -> impl Future<Output = Result<String, AgentError>> + Send;
}

#[derive(Clone)]
pub struct HttpAgentClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpAgentClient {
    pub fn new(base_url: String, timeout: Duration) -> Result<Self, AgentError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|_| AgentError::Unavailable)?;
        Ok(Self { base_url, http })
    }

    fn draft_url(&self) -> String {
        format!("{}/v1/draft", self.base_url.trim_end_matches('/'))
    }
}

impl QueryAgent for HttpAgentClient {
    async fn draft_sql(
        &self,
        request: &AgentRequest<'_>,
        timeout: Duration,
    ) -> Result<String, AgentError> {
        let span = tracing::info_span!(
            "agent.draft",
            request_id = %request.request_id,
            status_code = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        async {
            let started = Instant::now();
            let send_fut = async {
                let response = self
                    .http
                    .post(self.draft_url())
                    .header("x-qgate-request-id", request.request_id)
                    .json(request)
                    .send()
                    .await?;

                let status = response.status();
                tracing::Span::current().record("status_code", status.as_u16());
                if !status.is_success() {
                    return Err(AgentError::BadStatus(status.as_u16()));
                }

                let bytes = response.bytes().await?;
                let body = serde_json::from_slice::<AgentResponse>(&bytes)
                    .map_err(|_| AgentError::InvalidResponse)?;
                let sql = body.sql.trim();
                if sql.is_empty() || sql.len() > MAX_SQL_BYTES {
                    return Err(AgentError::InvalidResponse);
                }
                Ok(sql.to_string())
            };

            let result = match tokio::time::timeout(timeout, send_fut).await {
                Ok(result) => result,
                Err(_) => Err(AgentError::Timeout),
            };

            tracing::Span::current().record("latency_ms", started.elapsed().as_millis() as u64);
            tracing::Span::current().record(
                "outcome",
                match &result {
                    Ok(_) => "ok",
                    Err(err) => err.code(),
                },
            );
            result
        }
        .instrument(span)
        .await
    }
}
