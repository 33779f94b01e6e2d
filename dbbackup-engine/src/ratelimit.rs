//! Per-host connection backoff.
//!
//! Each failed connection attempt doubles the wait before the next one; a
//! success clears the host. Once a host has failed `max_attempts` times in a
//! row further attempts are refused until `max_delay` has passed since its
//! last failure; the next attempt after that is a trial, and failing it
//! starts a new refusal window.

use crate::utils::errors::{EngineError, Result};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
struct HostState {
    failures: u32,
    last_failure: Instant,
    next_attempt: Instant,
}

#[derive(Debug)]
pub struct ConnectionLimiter {
    hosts: Mutex<HashMap<String, HostState>>,
    base_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
}

impl ConnectionLimiter {
    pub fn new(max_attempts: u32) -> Self {
        Self::with_delays(max_attempts, Duration::from_millis(500), Duration::from_secs(60))
    }

    pub fn with_delays(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            hosts: Mutex::new(HashMap::new()),
            base_delay,
            max_delay,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Wait until `host` may be contacted again. The lock only covers the
    /// bookkeeping; the sleep happens after it is released.
    pub async fn acquire(&self, host: &str) -> Result<()> {
        let wait = {
            let hosts = self.hosts.lock().unwrap_or_else(|e| e.into_inner());
            let now = Instant::now();
            match hosts.get(host) {
                Some(state) if state.failures >= self.max_attempts && now < state.last_failure + self.max_delay => {
                    let retry_in = (state.last_failure + self.max_delay).saturating_duration_since(now);
                    return Err(EngineError::RateLimited(format!(
                        "{} failed {} consecutive connection attempts, retry in {}ms",
                        host,
                        state.failures,
                        retry_in.as_millis()
                    )));
                }
                Some(state) => state.next_attempt.saturating_duration_since(now),
                None => Duration::ZERO,
            }
        };

        if !wait.is_zero() {
            debug!(host = %host, wait_ms = wait.as_millis() as u64, "Backing off before connecting");
            tokio::time::sleep(wait).await;
        }
        Ok(())
    }

    pub fn record_success(&self, host: &str) {
        let mut hosts = self.hosts.lock().unwrap_or_else(|e| e.into_inner());
        hosts.remove(host);
    }

    pub fn record_failure(&self, host: &str) {
        let mut hosts = self.hosts.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let state = hosts.entry(host.to_string()).or_insert(HostState {
            failures: 0,
            last_failure: now,
            next_attempt: now,
        });
        state.failures = state.failures.saturating_add(1);
        let factor = 2u32.saturating_pow(state.failures - 1);
        let delay = self.base_delay.saturating_mul(factor).min(self.max_delay);
        state.last_failure = now;
        state.next_attempt = now + delay;
        warn!(host = %host, failures = state.failures, delay_ms = delay.as_millis() as u64, "Connection attempt failed");
    }

    pub fn failures(&self, host: &str) -> u32 {
        let hosts = self.hosts.lock().unwrap_or_else(|e| e.into_inner());
        hosts.get(host).map(|s| s.failures).unwrap_or(0)
    }
}
