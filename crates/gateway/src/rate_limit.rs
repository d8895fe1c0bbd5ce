use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Sliding-window request limiter keyed by identity.
#[derive(Clone)]
pub struct RateLimiter {
    windows: Arc<Mutex<HashMap<String, VecDeque<Instant>>>>,
    window: Duration,
    limit: u32,
    max_identities: usize,
}

impl RateLimiter {
    /// `limit == 0` disables limiting.
    pub fn new(window: Duration, limit: u32, max_identities: usize) -> Self {
        Self {
            windows: Arc::new(Mutex::new(HashMap::new())),
            window,
            limit,
            max_identities: max_identities.max(1),
        }
    }

    /// Records one request for `identity`, or returns how long until the
    /// oldest request in the window falls out of it.
    pub fn check(&self, identity: &str) -> Result<(), Duration> {
        self.check_at(identity, Instant::now())
    }

    fn check_at(&self, identity: &str, now: Instant) -> Result<(), Duration> {
        if self.limit == 0 {
            return Ok(());
        }

        let mut windows = match self.windows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let events = windows.entry(identity.to_string()).or_default();
        prune(events, now, self.window);
        if events.len() >= self.limit as usize {
            let retry_after = events
                .front()
                .map(|oldest| self.window.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(self.window);
            return Err(retry_after);
        }
        events.push_back(now);

        if windows.len() > self.max_identities {
            windows.retain(|_, events| {
                prune(events, now, self.window);
                !events.is_empty()
            });
        }
        if windows.len() > self.max_identities {
            // Still over: drop arbitrary other identities rather than grow.
            let overflow = windows.len() - self.max_identities;
            let victims = windows
                .keys()
                .filter(|k| k.as_str() != identity)
                .take(overflow)
                .cloned()
                .collect::<Vec<_>>();
            for key in victims {
                windows.remove(&key);
            }
        }

        Ok(())
    }
}

fn prune(events: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(front) = events.front() {
        if now.duration_since(*front) >= window {
            events.pop_front();
        } else {
            break;
        }
    }
}
