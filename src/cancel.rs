//! Cooperative cancellation.
//!
//! A token is cancelled explicitly, when its deadline passes, or when any of
//! its ancestors is cancelled. Cancelling a child never affects the parent,
//! which lets the delivery loop cut one iteration short without stopping
//! itself.

use crate::error::{BrokerError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Inner {
    cancelled: AtomicBool,
    deadline: Option<Instant>,
    parent: Option<CancellationToken>,
}

/// Shared cancellation signal.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    /// A token that is only cancelled explicitly.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                deadline: None,
                parent: None,
            }),
        }
    }

    /// A child token, cancelled with this one.
    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                deadline: None,
                parent: Some(self.clone()),
            }),
        }
    }

    /// A child token that also cancels itself after `timeout`.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                deadline: Some(Instant::now() + timeout),
                parent: Some(self.clone()),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.inner.cancelled.load(Ordering::SeqCst) {
            return true;
        }
        if let Some(deadline) = self.inner.deadline {
            if Instant::now() >= deadline {
                return true;
            }
        }
        self.inner
            .parent
            .as_ref()
            .map(|p| p.is_cancelled())
            .unwrap_or(false)
    }

    /// Fail with `Cancelled` if the token has fired.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(BrokerError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Time left before the nearest deadline in the chain, if any.
    pub fn remaining(&self) -> Option<Duration> {
        let own = self
            .inner
            .deadline
            .map(|d| d.saturating_duration_since(Instant::now()));
        let parent = self.inner.parent.as_ref().and_then(|p| p.remaining());
        match (own, parent) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_follows_parent() {
        let parent = CancellationToken::new();
        let child = parent.child();
        assert!(!child.is_cancelled());

        parent.cancel();
        assert!(child.is_cancelled());
        assert!(matches!(child.check(), Err(BrokerError::Cancelled)));
    }

    #[test]
    fn test_child_does_not_cancel_parent() {
        let parent = CancellationToken::new();
        let child = parent.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn test_deadline_expires() {
        let parent = CancellationToken::new();
        let child = parent.child_with_timeout(Duration::from_millis(10));
        assert!(child.remaining().is_some());
        std::thread::sleep(Duration::from_millis(20));
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
        assert_eq!(child.remaining(), Some(Duration::ZERO));
    }
}
