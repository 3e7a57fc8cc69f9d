// Composed Cancellation
// Cancellation tokens carrying a reason, with timeout-derived children

use tokio_util::sync::CancellationToken;

use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Why a token was cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The per-operation timeout fired
    Timeout,
    /// The parent/engine requested an abort
    Aborted,
}

impl CancelReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CancelReason::Timeout => "timeout",
            CancelReason::Aborted => "aborted",
        }
    }
}

/// A cancellation signal composed from a per-operation timeout and
/// parent-level abort propagation.
///
/// Cancelling a parent propagates to every derived child synchronously
/// through the underlying [`CancellationToken`] hierarchy; the reason is
/// resolved by walking the parent chain so either cause stays
/// distinguishable at the call site.
#[derive(Debug, Clone)]
pub struct CancelToken {
    token: CancellationToken,
    reason: Arc<OnceLock<CancelReason>>,
    parent: Option<Box<CancelToken>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// A fresh root token
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: Arc::new(OnceLock::new()),
            parent: None,
        }
    }

    /// Cancel this token (and all derived children) with a reason.
    /// Idempotent: the first reason wins.
    pub fn cancel(&self, reason: CancelReason) {
        let _ = self.reason.set(reason);
        self.token.cancel();
    }

    /// Fast path: whether this token or any ancestor has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The reason this token observed, checking the parent chain for
    /// cancellations that propagated down.
    pub fn reason(&self) -> Option<CancelReason> {
        self.reason
            .get()
            .copied()
            .or_else(|| self.parent.as_ref().and_then(|p| p.reason()))
    }

    /// Resolves when the token is cancelled
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// Derive a child that additionally cancels itself after `timeout`.
    /// A child of an already-cancelled token starts out cancelled.
    pub fn child_with_timeout(&self, timeout: Option<Duration>) -> CancelToken {
        let child = CancelToken {
            token: self.token.child_token(),
            reason: Arc::new(OnceLock::new()),
            parent: Some(Box::new(self.clone())),
        };

        if let Some(timeout) = timeout {
            let armed = child.clone();
            tokio::spawn(async move {
                tokio::select! {
                    () = tokio::time::sleep(timeout) => armed.cancel(CancelReason::Timeout),
                    () = armed.cancelled() => {}
                }
            });
        }

        child
    }
}
