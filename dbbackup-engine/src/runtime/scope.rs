//! Structured cancellation: a root scope governs the whole operation and
//! child scopes attach their own deadlines.

use crate::utils::errors::{EngineError, Result};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a scope finished before the work it guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interruption {
    Cancelled,
    TimedOut(Duration),
}

impl From<Interruption> for EngineError {
    fn from(reason: Interruption) -> Self {
        match reason {
            Interruption::Cancelled => EngineError::Cancelled,
            Interruption::TimedOut(limit) => EngineError::TimedOut(limit),
        }
    }
}

/// A cancellation token plus an optional deadline.
#[derive(Debug, Clone)]
pub struct CancelScope {
    token: CancellationToken,
    deadline: Option<(Instant, Duration)>,
}

impl CancelScope {
    /// Create a new root scope.
    pub fn root() -> Self {
        Self::from_token(CancellationToken::new())
    }

    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Child scope: cancelled with the parent, or on its own.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Child scope that additionally expires after `timeout`.
    /// The earlier of the parent's deadline and the new one wins.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = (Instant::now() + timeout, timeout);
        let deadline = match self.deadline {
            Some(parent) if parent.0 <= candidate.0 => parent,
            _ => candidate,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Current interruption state, if any.
    pub fn interruption(&self) -> Option<Interruption> {
        if self.token.is_cancelled() {
            return Some(Interruption::Cancelled);
        }
        match self.deadline {
            Some((at, limit)) if Instant::now() >= at => Some(Interruption::TimedOut(limit)),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.interruption().is_some()
    }

    /// Synchronous poll, usable from blocking code between work items.
    pub fn check(&self) -> Result<()> {
        match self.interruption() {
            Some(reason) => Err(reason.into()),
            None => Ok(()),
        }
    }

    /// Resolves when the scope is cancelled or its deadline passes.
    pub async fn done(&self) -> Interruption {
        match self.deadline {
            Some((at, limit)) => {
                tokio::select! {
                    _ = self.token.cancelled() => Interruption::Cancelled,
                    _ = tokio::time::sleep_until(at) => Interruption::TimedOut(limit),
                }
            }
            None => {
                self.token.cancelled().await;
                Interruption::Cancelled
            }
        }
    }
}

impl Default for CancelScope {
    fn default() -> Self {
        Self::root()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_child_follows_parent_cancellation() {
        let root = CancelScope::root();
        let child = root.child();
        assert!(child.check().is_ok());

        root.cancel();
        assert_eq!(child.done().await, Interruption::Cancelled);
        assert!(matches!(child.check(), Err(EngineError::Cancelled)));
    }

    #[tokio::test]
    async fn test_child_cancel_does_not_touch_parent() {
        let root = CancelScope::root();
        let child = root.child();
        child.cancel();
        assert!(child.is_done());
        assert!(!root.is_done());
    }

    #[tokio::test]
    async fn test_timeout_expires() {
        let root = CancelScope::root();
        let scoped = root.with_timeout(Duration::from_millis(50));
        let reason = scoped.done().await;
        assert_eq!(reason, Interruption::TimedOut(Duration::from_millis(50)));
        assert!(matches!(scoped.check(), Err(EngineError::TimedOut(_))));
        assert!(!root.is_done());
    }

    #[tokio::test]
    async fn test_nested_timeout_keeps_earlier_deadline() {
        let root = CancelScope::root();
        let outer = root.with_timeout(Duration::from_millis(50));
        let inner = outer.with_timeout(Duration::from_secs(3600));
        let started = Instant::now();
        inner.done().await;
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
