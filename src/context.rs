//! Request context
//!
//! Carries the executing user, an optional lock token presented by the client,
//! and the cancellation state every long running operation checks between steps.

use crate::error::FsError;
use crate::types::User;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared cancellation flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Per-request state handed to every engine operation.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    user: Option<User>,
    lock_id: Option<String>,
    deadline: Option<Instant>,
    cancellation: CancellationToken,
}

impl RequestContext {
    pub fn new(user: User) -> Self {
        Self {
            user: Some(user),
            ..Default::default()
        }
    }

    /// Context without an authenticated user. Permission checks will deny.
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn with_lock_id(mut self, lock_id: impl Into<String>) -> Self {
        self.lock_id = Some(lock_id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn user(&self) -> Option<&User> {
        self.user.as_ref()
    }

    pub fn lock_id(&self) -> Option<&str> {
        self.lock_id.as_deref()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_done(&self) -> bool {
        self.cancellation.is_cancelled()
            || self.deadline.map(|d| Instant::now() >= d).unwrap_or(false)
    }

    /// Fail with `Aborted` once the request was cancelled or ran past its deadline.
    pub fn check(&self) -> Result<(), FsError> {
        if self.cancellation.is_cancelled() {
            return Err(FsError::Aborted("request cancelled".to_string()));
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(FsError::Aborted("request deadline exceeded".to_string()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_is_shared() {
        let token = CancellationToken::new();
        let ctx = RequestContext::anonymous().with_cancellation(token.clone());
        assert!(ctx.check().is_ok());
        token.cancel();
        assert!(matches!(ctx.check(), Err(FsError::Aborted(_))));
    }

    #[test]
    fn test_deadline() {
        let ctx = RequestContext::anonymous().with_timeout(Duration::from_millis(0));
        assert!(ctx.is_done());
        assert!(ctx.check().is_err());
    }
}
