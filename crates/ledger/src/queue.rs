use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use qgate_contracts::AuditRecord;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::AuditSink;

#[derive(Debug, Clone)]
pub struct AuditQueueConfig {
    pub capacity: usize,
    pub retry_max_attempts: u32,
    pub retry_base_backoff: Duration,
    /// Consecutive records that exhausted their retries before the queue
    /// reports itself degraded.
    pub degrade_after_failures: u32,
    pub probe_interval: Duration,
}

impl Default for AuditQueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            retry_max_attempts: 3,
            retry_base_backoff: Duration::from_millis(50),
            degrade_after_failures: 3,
            probe_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditError {
    Degraded,
    Backpressure,
    Closed,
    WriteFailed,
}

impl std::fmt::Display for AuditError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuditError::Degraded => write!(f, "audit sink is degraded"),
            AuditError::Backpressure => write!(f, "audit queue is full"),
            AuditError::Closed => write!(f, "audit queue is closed"),
            AuditError::WriteFailed => write!(f, "audit record could not be stored"),
        }
    }
}

impl std::error::Error for AuditError {}

struct Envelope {
    record: AuditRecord,
    ack: Option<oneshot::Sender<Result<(), AuditError>>>,
}

#[derive(Default)]
struct QueueHealth {
    degraded: AtomicBool,
    consecutive_failures: AtomicU32,
}

/// Bounded hand-off from request tasks to one writer task that owns the sink.
#[derive(Clone)]
pub struct AuditQueue {
    tx: mpsc::Sender<Envelope>,
    health: Arc<QueueHealth>,
}

impl AuditQueue {
    pub fn spawn<S>(sink: S, config: AuditQueueConfig) -> (Self, JoinHandle<()>)
    where
        S: AuditSink + 'static,
    {
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        let health = Arc::new(QueueHealth::default());
        let handle = tokio::spawn(run_writer(sink, config, rx, health.clone()));
        (Self { tx, health }, handle)
    }

    pub fn is_degraded(&self) -> bool {
        self.health.degraded.load(Ordering::Acquire)
    }

    /// Queues a record, waiting for capacity no later than `deadline`.
    pub async fn enqueue(&self, record: AuditRecord, deadline: Instant) -> Result<(), AuditError> {
        self.send(
            Envelope {
                record,
                ack: None,
            },
            deadline,
        )
        .await
    }

    /// Queues a record and waits until the sink has stored it.
    pub async fn enqueue_and_wait(
        &self,
        record: AuditRecord,
        deadline: Instant,
    ) -> Result<(), AuditError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.send(
            Envelope {
                record,
                ack: Some(ack_tx),
            },
            deadline,
        )
        .await?;

        match tokio::time::timeout_at(deadline, ack_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AuditError::Closed),
            Err(_) => Err(AuditError::Backpressure),
        }
    }

    async fn send(&self, envelope: Envelope, deadline: Instant) -> Result<(), AuditError> {
        if self.is_degraded() {
            return Err(AuditError::Degraded);
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        match self.tx.send_timeout(envelope, remaining).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => Err(AuditError::Backpressure),
            Err(mpsc::error::SendTimeoutError::Closed(_)) => Err(AuditError::Closed),
        }
    }
}

async fn run_writer<S: AuditSink>(
    sink: S,
    config: AuditQueueConfig,
    mut rx: mpsc::Receiver<Envelope>,
    health: Arc<QueueHealth>,
) {
    loop {
        let next = tokio::time::timeout(config.probe_interval, rx.recv()).await;
        let envelope = match next {
            Ok(Some(envelope)) => envelope,
            Ok(None) => break,
            Err(_) => {
                if health.degraded.load(Ordering::Acquire) && sink.ping().await.is_ok() {
                    health.consecutive_failures.store(0, Ordering::Release);
                    health.degraded.store(false, Ordering::Release);
                    tracing::info!("audit.sink_recovered");
                }
                continue;
            }
        };

        let result = write_with_retry(&sink, &config, &envelope.record).await;
        match result {
            Ok(()) => {
                health.consecutive_failures.store(0, Ordering::Release);
                if health.degraded.swap(false, Ordering::AcqRel) {
                    tracing::info!("audit.sink_recovered");
                }
            }
            Err(()) => {
                let failures = health.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                tracing::error!(
                    audit_id = %envelope.record.audit_id,
                    request_id = %envelope.record.request_id,
                    outcome = %envelope.record.outcome.label(),
                    consecutive_failures = failures,
                    "audit.write_failed"
                );
                if failures >= config.degrade_after_failures.max(1)
                    && !health.degraded.swap(true, Ordering::AcqRel)
                {
                    tracing::error!(consecutive_failures = failures, "audit.sink_degraded");
                }
            }
        }

        if let Some(ack) = envelope.ack {
            let _ = ack.send(result.map_err(|_| AuditError::WriteFailed));
        }
    }
}

async fn write_with_retry<S: AuditSink>(
    sink: &S,
    config: &AuditQueueConfig,
    record: &AuditRecord,
) -> Result<(), ()> {
    let attempts = config.retry_max_attempts.max(1);
    for attempt in 0..attempts {
        match sink.append(record).await {
            Ok(()) => return Ok(()),
            Err(err) => {
                tracing::warn!(
                    audit_id = %record.audit_id,
                    attempt = attempt + 1,
                    error = %err,
                    "audit.append_retry"
                );
                if attempt + 1 < attempts {
                    let backoff = config
                        .retry_base_backoff
                        .saturating_mul(2u32.saturating_pow(attempt));
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
    Err(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    use qgate_contracts::{AuditOutcome, ErrorKind, Stage};

    use super::*;
    use crate::LedgerError;

    fn record(id: &str) -> AuditRecord {
        AuditRecord {
            audit_id: id.to_string(),
            request_id: format!("req-{}", id),
            recorded_at_epoch_ms: 0,
            identity_id: "alice".to_string(),
            tenant_id: "acme".to_string(),
            session_id: "s1".to_string(),
            sql_hash: None,
            row_count: 0,
            redacted_columns: Vec::new(),
            masked_columns: Vec::new(),
            outcome: AuditOutcome::denied(Stage::InputGuardrail, ErrorKind::InputRejected),
        }
    }

    fn config() -> AuditQueueConfig {
        AuditQueueConfig {
            capacity: 8,
            retry_max_attempts: 3,
            retry_base_backoff: Duration::from_millis(1),
            degrade_after_failures: 2,
            probe_interval: Duration::from_millis(10),
        }
    }

    #[derive(Default)]
    struct FlakySink {
        fail_first: usize,
        calls: AtomicUsize,
        stored: Mutex<Vec<String>>,
        healthy: AtomicBool,
    }

    impl AuditSink for Arc<FlakySink> {
        async fn append(&self, record: &AuditRecord) -> Result<(), LedgerError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first && !self.healthy.load(Ordering::SeqCst) {
                return Err(LedgerError::Timeout);
            }
            self.stored
                .lock()
                .expect("lock")
                .push(record.audit_id.clone());
            Ok(())
        }

        async fn ping(&self) -> Result<(), LedgerError> {
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(LedgerError::Timeout)
            }
        }
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(2)
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let sink = Arc::new(FlakySink {
            fail_first: 2,
            ..FlakySink::default()
        });
        let (queue, _handle) = AuditQueue::spawn(sink.clone(), config());

        queue
            .enqueue_and_wait(record("a1"), deadline())
            .await
            .expect("record should be stored after retries");

        assert_eq!(sink.stored.lock().expect("lock").as_slice(), ["a1".to_string()]);
        assert!(!queue.is_degraded());
    }

    #[tokio::test]
    async fn persistent_failure_degrades_and_rejects_new_records() {
        let sink = Arc::new(FlakySink {
            fail_first: usize::MAX,
            ..FlakySink::default()
        });
        let (queue, _handle) = AuditQueue::spawn(sink.clone(), config());

        for id in ["a1", "a2"] {
            let err = queue
                .enqueue_and_wait(record(id), deadline())
                .await
                .expect_err("write must fail");
            assert_eq!(err, AuditError::WriteFailed);
        }

        assert!(queue.is_degraded());
        let err = queue
            .enqueue(record("a3"), deadline())
            .await
            .expect_err("degraded queue must refuse records");
        assert_eq!(err, AuditError::Degraded);
    }

    #[tokio::test]
    async fn degraded_queue_recovers_when_sink_answers_probe() {
        let sink = Arc::new(FlakySink {
            fail_first: usize::MAX,
            ..FlakySink::default()
        });
        let (queue, _handle) = AuditQueue::spawn(sink.clone(), config());

        for id in ["a1", "a2"] {
            let _ = queue.enqueue_and_wait(record(id), deadline()).await;
        }
        assert!(queue.is_degraded());

        sink.healthy.store(true, Ordering::SeqCst);
        let started = Instant::now();
        while queue.is_degraded() && started.elapsed() < Duration::from_secs(2) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!queue.is_degraded());

        queue
            .enqueue_and_wait(record("a3"), deadline())
            .await
            .expect("recovered queue should store records");
    }

    #[tokio::test]
    async fn full_queue_applies_backpressure_at_deadline() {
        struct StuckSink;

        impl AuditSink for StuckSink {
            async fn append(&self, _record: &AuditRecord) -> Result<(), LedgerError> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }

            async fn ping(&self) -> Result<(), LedgerError> {
                Ok(())
            }
        }

        let (queue, _handle) = AuditQueue::spawn(
            StuckSink,
            AuditQueueConfig {
                capacity: 1,
                ..config()
            },
        );

        // One record is held by the writer, one fills the channel.
        let mut accepted = 0;
        let mut last_err = None;
        for i in 0..4 {
            match queue
                .enqueue(record(&format!("r{}", i)), Instant::now() + Duration::from_millis(20))
                .await
            {
                Ok(()) => accepted += 1,
                Err(err) => last_err = Some(err),
            }
        }
        assert!(accepted <= 2);
        assert_eq!(last_err, Some(AuditError::Backpressure));
    }
}
