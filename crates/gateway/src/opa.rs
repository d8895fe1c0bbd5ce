use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use qgate_contracts::canonical;
use qgate_policy::{LocalPermissionDecider, PolicyDecider, PolicyDecision, PolicyError, PolicyInput};
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};

#[derive(Debug)]
pub enum OpaError {
    Timeout,
    Http(reqwest::Error),
    BadStatus(reqwest::StatusCode),
    InvalidResponse,
    CircuitOpen,
}

impl std::fmt::Display for OpaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpaError::Timeout => write!(f, "OPA request timed out"),
            OpaError::Http(err) => write!(f, "OPA HTTP error: {}", err),
            OpaError::BadStatus(status) => write!(f, "OPA returned status {}", status),
            OpaError::InvalidResponse => write!(f, "OPA returned invalid JSON response"),
            OpaError::CircuitOpen => write!(f, "OPA circuit breaker is open"),
        }
    }
}

impl std::error::Error for OpaError {}

impl From<reqwest::Error> for OpaError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            OpaError::Timeout
        } else {
            OpaError::Http(value)
        }
    }
}

impl From<OpaError> for PolicyError {
    fn from(value: OpaError) -> Self {
        match value {
            OpaError::Timeout => PolicyError::Timeout,
            OpaError::CircuitOpen => PolicyError::CircuitOpen,
            OpaError::InvalidResponse => PolicyError::InvalidResponse,
            other => PolicyError::Unavailable(other.to_string()),
        }
    }
}

impl OpaError {
    fn is_retryable(&self) -> bool {
        match self {
            OpaError::Timeout | OpaError::Http(_) => true,
            OpaError::BadStatus(status) => status.is_server_error(),
            OpaError::InvalidResponse | OpaError::CircuitOpen => false,
        }
    }
}

#[derive(Deserialize)]
struct OpaDataResponse<T> {
    result: T,
}

/// Decisions are cached per session; a new session never sees another
/// session's decisions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DecisionCacheKey {
    session_id: String,
    input_hash: String,
}

impl DecisionCacheKey {
    fn for_input(input: &PolicyInput) -> Option<Self> {
        let session_id = input.session_id()?.to_string();
        let value = serde_json::to_value(input).ok()?;
        Some(Self {
            session_id,
            input_hash: canonical::hash_canonical_json(&value),
        })
    }
}

#[derive(Clone)]
struct CachedDecision {
    decision: PolicyDecision,
    expires_at: Instant,
}

type DecisionCache = HashMap<DecisionCacheKey, CachedDecision>;

/// A copy of `current` with expired entries gone, `key` inserted and the
/// oldest-expiring entries evicted down to `max_entries`.
fn next_cache(
    current: &DecisionCache,
    key: DecisionCacheKey,
    decision: PolicyDecision,
    now: Instant,
    ttl: Duration,
    max_entries: usize,
) -> DecisionCache {
    let mut next = current
        .iter()
        .filter(|(_, entry)| entry.expires_at > now)
        .map(|(k, entry)| (k.clone(), entry.clone()))
        .collect::<DecisionCache>();
    next.insert(
        key,
        CachedDecision {
            decision,
            expires_at: now + ttl,
        },
    );

    if next.len() > max_entries {
        let mut by_expiry = next
            .iter()
            .map(|(k, entry)| (entry.expires_at, k.clone()))
            .collect::<Vec<_>>();
        by_expiry.sort_by_key(|(expires_at, _)| *expires_at);
        let overflow = next.len() - max_entries;
        for (_, k) in by_expiry.into_iter().take(overflow) {
            next.remove(&k);
        }
    }
    next
}

#[derive(Debug, Clone)]
pub struct OpaClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub cache_max_entries: usize,
    pub cache_ttl: Duration,
    pub retry_max_attempts: u32,
    pub retry_base_backoff: Duration,
    pub circuit_breaker_failure_threshold: u32,
    pub circuit_breaker_open_for: Duration,
}

#[derive(Default)]
struct BreakerState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

#[derive(Clone)]
pub struct OpaClient {
    base_url: String,
    http: reqwest::Client,
    /// Readers clone the snapshot and drop the lock; writers build the next
    /// map off-lock and only take the write lock to swap it in.
    cache: Arc<RwLock<Arc<DecisionCache>>>,
    cache_refresh: Arc<Mutex<()>>,
    cache_max_entries: usize,
    cache_ttl: Duration,
    retry_max_attempts: u32,
    retry_base_backoff: Duration,
    breaker: Arc<Mutex<BreakerState>>,
    breaker_threshold: u32,
    breaker_open_for: Duration,
}

impl OpaClient {
    pub fn new(config: OpaClientConfig) -> Result<Self, OpaError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(OpaError::Http)?;

        Ok(Self {
            base_url: config.base_url,
            http,
            cache: Arc::new(RwLock::new(Arc::new(DecisionCache::new()))),
            cache_refresh: Arc::new(Mutex::new(())),
            cache_max_entries: config.cache_max_entries,
            cache_ttl: config.cache_ttl,
            retry_max_attempts: config.retry_max_attempts,
            retry_base_backoff: config.retry_base_backoff,
            breaker: Arc::new(Mutex::new(BreakerState::default())),
            breaker_threshold: config.circuit_breaker_failure_threshold.max(1),
            breaker_open_for: config.circuit_breaker_open_for,
        })
    }

    pub async fn decide_input(&self, input: &PolicyInput) -> Result<PolicyDecision, OpaError> {
        let cache_key = self.cache_enabled().then(|| DecisionCacheKey::for_input(input)).flatten();

        if let Some(key) = cache_key.as_ref()
            && let Some(decision) = self.get_cached(key).await
        {
            return Ok(decision);
        }

        self.check_breaker().await?;

        let attempts = self.retry_max_attempts.saturating_add(1);
        let mut attempt = 0u32;
        let decision = loop {
            match self.post_decision(input).await {
                Ok(decision) => break decision,
                Err(err) => {
                    attempt += 1;
                    if !err.is_retryable() || attempt >= attempts {
                        self.record_failure().await;
                        return Err(err);
                    }
                    tracing::debug!(attempt, error = %err, "opa.retry");
                    let backoff = self
                        .retry_base_backoff
                        .saturating_mul(2u32.saturating_pow(attempt - 1));
                    tokio::time::sleep(backoff).await;
                }
            }
        };
        self.record_success().await;

        if let Some(key) = cache_key
            && decision.cacheable
        {
            self.put_cached(key, decision.clone()).await;
        }

        Ok(decision)
    }

    /// Readiness probe: OPA's own health endpoint.
    pub async fn ready(&self) -> Result<(), OpaError> {
        let url = format!("{}/health", self.base_url.trim_end_matches('/'));
        let resp = self.http.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(OpaError::BadStatus(resp.status()));
        }
        Ok(())
    }

    async fn post_decision(&self, input: &PolicyInput) -> Result<PolicyDecision, OpaError> {
        let resp = self
            .http
            .post(self.decision_url())
            .json(&serde_json::json!({ "input": input }))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(OpaError::BadStatus(resp.status()));
        }

        let decoded = resp
            .json::<OpaDataResponse<PolicyDecision>>()
            .await
            .map_err(|_| OpaError::InvalidResponse)?;
        Ok(decoded.result)
    }

    fn decision_url(&self) -> String {
        format!(
            "{}/v1/data/qgate/authz/decision",
            self.base_url.trim_end_matches('/')
        )
    }

    fn cache_enabled(&self) -> bool {
        self.cache_max_entries > 0 && self.cache_ttl > Duration::ZERO
    }

    async fn check_breaker(&self) -> Result<(), OpaError> {
        let mut breaker = self.breaker.lock().await;
        match breaker.open_until {
            Some(until) if Instant::now() < until => Err(OpaError::CircuitOpen),
            Some(_) => {
                // Half-open: let one round of attempts through.
                breaker.open_until = None;
                breaker.consecutive_failures = self.breaker_threshold.saturating_sub(1);
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn record_failure(&self) {
        let mut breaker = self.breaker.lock().await;
        breaker.consecutive_failures = breaker.consecutive_failures.saturating_add(1);
        if breaker.consecutive_failures >= self.breaker_threshold && breaker.open_until.is_none() {
            breaker.open_until = Some(Instant::now() + self.breaker_open_for);
            tracing::warn!(
                consecutive_failures = breaker.consecutive_failures,
                open_ms = self.breaker_open_for.as_millis() as u64,
                "opa.circuit_opened"
            );
        }
    }

    async fn record_success(&self) {
        let mut breaker = self.breaker.lock().await;
        breaker.consecutive_failures = 0;
        breaker.open_until = None;
    }

    async fn get_cached(&self, key: &DecisionCacheKey) -> Option<PolicyDecision> {
        let now = Instant::now();
        let snapshot = self.cache.read().await.clone();
        snapshot
            .get(key)
            .and_then(|entry| (entry.expires_at > now).then(|| entry.decision.clone()))
    }

    async fn put_cached(&self, key: DecisionCacheKey, decision: PolicyDecision) {
        let _refresh = self.cache_refresh.lock().await;
        let current = self.cache.read().await.clone();
        let next = next_cache(
            &current,
            key,
            decision,
            Instant::now(),
            self.cache_ttl,
            self.cache_max_entries,
        );
        *self.cache.write().await = Arc::new(next);
    }
}

impl PolicyDecider for OpaClient {
    async fn decide(&self, input: &PolicyInput) -> Result<PolicyDecision, PolicyError> {
        self.decide_input(input).await.map_err(PolicyError::from)
    }
}

/// The decider selected by `QGATE_POLICY_MODE`.
#[derive(Clone)]
pub enum PolicyBackend {
    Local(LocalPermissionDecider),
    Opa(OpaClient),
}

impl PolicyBackend {
    pub async fn ready(&self) -> bool {
        match self {
            PolicyBackend::Local(_) => true,
            PolicyBackend::Opa(client) => client.ready().await.is_ok(),
        }
    }
}

impl PolicyDecider for PolicyBackend {
    async fn decide(&self, input: &PolicyInput) -> Result<PolicyDecision, PolicyError> {
        match self {
            PolicyBackend::Local(local) => local.decide(input).await,
            PolicyBackend::Opa(client) => client.decide(input).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};

    use super::*;

    fn input(session_id: &str, table: &str) -> PolicyInput {
        PolicyInput {
            action: "read",
            principal: serde_json::json!({
                "identity_id": "alice",
                "tenant_id": "acme",
                "permissions": [],
                "session_id": session_id,
            }),
            resource: serde_json::json!({"kind": "table", "table": table}),
        }
    }

    fn config(addr: SocketAddr) -> OpaClientConfig {
        OpaClientConfig {
            base_url: format!("http://{}", addr),
            timeout: Duration::from_millis(500),
            cache_max_entries: 0,
            cache_ttl: Duration::ZERO,
            retry_max_attempts: 0,
            retry_base_backoff: Duration::from_millis(1),
            circuit_breaker_failure_threshold: 2,
            circuit_breaker_open_for: Duration::from_secs(60),
        }
    }

    #[derive(Clone)]
    struct Fake {
        calls: Arc<AtomicUsize>,
        fail_first: usize,
    }

    async fn decision(
        State(fake): State<Fake>,
        Json(body): Json<serde_json::Value>,
    ) -> (StatusCode, Json<serde_json::Value>) {
        let call = fake.calls.fetch_add(1, Ordering::SeqCst);
        if call < fake.fail_first {
            return (StatusCode::SERVICE_UNAVAILABLE, Json(serde_json::json!({})));
        }
        let table = body
            .pointer("/input/resource/table")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        let allow = table == "orders";
        (
            StatusCode::OK,
            Json(serde_json::json!({"result": {"allow": allow, "cacheable": true}})),
        )
    }

    async fn spawn_fake(fail_first: usize) -> (SocketAddr, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route("/v1/data/qgate/authz/decision", post(decision))
            .with_state(Fake {
                calls: calls.clone(),
                fail_first,
            });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind should succeed");
        let addr = listener.local_addr().expect("local_addr should succeed");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (addr, calls)
    }

    #[tokio::test]
    async fn decision_is_read_from_result_envelope() {
        let (addr, _) = spawn_fake(0).await;
        let client = OpaClient::new(config(addr)).expect("client should build");

        assert!(client.decide_input(&input("s1", "orders")).await.expect("decision").allow);
        assert!(!client.decide_input(&input("s1", "customers")).await.expect("decision").allow);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_within_bound() {
        let (addr, calls) = spawn_fake(2).await;
        let client = OpaClient::new(OpaClientConfig {
            retry_max_attempts: 2,
            circuit_breaker_failure_threshold: 8,
            ..config(addr)
        })
        .expect("client should build");

        let decision = client
            .decide_input(&input("s1", "orders"))
            .await
            .expect("third attempt should succeed");
        assert!(decision.allow);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn breaker_opens_after_threshold_and_skips_calls() {
        let (addr, calls) = spawn_fake(usize::MAX).await;
        let client = OpaClient::new(config(addr)).expect("client should build");

        for _ in 0..2 {
            let err = client.decide_input(&input("s1", "orders")).await.unwrap_err();
            assert!(matches!(err, OpaError::BadStatus(_)));
        }
        let err = client.decide_input(&input("s1", "orders")).await.unwrap_err();
        assert!(matches!(err, OpaError::CircuitOpen));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(matches!(PolicyError::from(err), PolicyError::CircuitOpen));
    }

    #[tokio::test]
    async fn cache_is_scoped_per_session() {
        let (addr, calls) = spawn_fake(0).await;
        let client = OpaClient::new(OpaClientConfig {
            cache_max_entries: 16,
            cache_ttl: Duration::from_secs(60),
            ..config(addr)
        })
        .expect("client should build");

        client.decide_input(&input("s1", "orders")).await.expect("decision");
        client.decide_input(&input("s1", "orders")).await.expect("decision");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        client.decide_input(&input("s2", "orders")).await.expect("decision");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    fn key(session_id: &str) -> DecisionCacheKey {
        DecisionCacheKey::for_input(&input(session_id, "orders")).expect("key should build")
    }

    #[test]
    fn cache_refresh_leaves_published_snapshot_untouched() {
        let now = Instant::now();
        let ttl = Duration::from_secs(60);
        let first = next_cache(&DecisionCache::new(), key("s1"), PolicyDecision::allow(), now, ttl, 2);
        let second = next_cache(&first, key("s2"), PolicyDecision::allow(), now, ttl, 2);

        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 2);
        assert!(second.contains_key(&key("s1")));
    }

    #[test]
    fn cache_refresh_drops_expired_then_evicts_oldest() {
        let now = Instant::now();
        let mut current = next_cache(
            &DecisionCache::new(),
            key("stale"),
            PolicyDecision::allow(),
            now,
            Duration::from_millis(1),
            8,
        );
        current = next_cache(&current, key("s1"), PolicyDecision::allow(), now, Duration::from_secs(10), 8);
        current = next_cache(&current, key("s2"), PolicyDecision::allow(), now, Duration::from_secs(20), 8);

        let later = now + Duration::from_millis(5);
        let next = next_cache(&current, key("s3"), PolicyDecision::allow(), later, Duration::from_secs(30), 2);

        assert_eq!(next.len(), 2);
        assert!(!next.contains_key(&key("stale")));
        assert!(!next.contains_key(&key("s1")));
        assert!(next.contains_key(&key("s2")));
        assert!(next.contains_key(&key("s3")));
    }

    #[tokio::test]
    async fn unreachable_engine_maps_to_unavailable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind should succeed");
        let addr = listener.local_addr().expect("local_addr should succeed");
        drop(listener);

        let backend = PolicyBackend::Opa(OpaClient::new(config(addr)).expect("client should build"));
        let err = backend.decide(&input("s1", "orders")).await.unwrap_err();
        assert!(matches!(err, PolicyError::Unavailable(_) | PolicyError::Timeout));
        assert!(!backend.ready().await);
    }
}
