//! Cooperative cancellation
//!
//! Long-running operations receive a [`CancellationToken`] and call
//! [`CancellationToken::check`] before each backend I/O and at each task
//! boundary. Cancelling a parent cancels every child; a child may add its
//! own deadline without affecting the parent.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::error::{PorchError, Result};

#[derive(Debug, Default)]
struct Flag {
    cancelled: AtomicBool,
    parent: Option<Arc<Flag>>,
}

impl Flag {
    fn is_set(&self) -> bool {
        self.cancelled.load(Ordering::Acquire) || self.parent.as_ref().is_some_and(|p| p.is_set())
    }
}

/// Clonable cancellation token with an optional deadline
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<Flag>,
    deadline: Option<Instant>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token that never trips; used by tests and one-shot tools
    pub fn none() -> Self {
        Self::default()
    }

    /// Derive a child token sharing cancellation with this one
    pub fn child(&self) -> Self {
        Self {
            flag: Arc::new(Flag {
                cancelled: AtomicBool::new(false),
                parent: Some(self.flag.clone()),
            }),
            deadline: self.deadline,
        }
    }

    /// Derive a child token that additionally expires after `timeout`
    pub fn with_deadline(&self, timeout: Duration) -> Self {
        let mut child = self.child();
        let deadline = Instant::now() + timeout;
        child.deadline = Some(match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        });
        child
    }

    pub fn cancel(&self) {
        self.flag.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.is_set()
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Time left before the deadline, if any
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Fail if the token was cancelled or its deadline passed
    pub fn check(&self, operation: &str) -> Result<()> {
        if self.is_cancelled() {
            return Err(PorchError::Cancelled);
        }
        if self.is_expired() {
            return Err(PorchError::Timeout {
                operation: operation.to_string(),
            });
        }
        Ok(())
    }
}
