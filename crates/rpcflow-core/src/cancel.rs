//! Run cancellation with a typed cause.
//!
//! A single `CancelSource` exists per run. It wraps a
//! `tokio_util::sync::CancellationToken` and records why the run ended
//! (`CancelCause`), so callers classify the outcome from structured data
//! rather than from error text. Per-step timeout subtrees use `child`
//! sources: cancelling a child never affects the parent.
//!
//! A `stop` cancellation is graceful: it blocks further admission but does
//! not interrupt in-flight work, so steps already executing finish and
//! record their results. Every other cause fires the token and aborts
//! in-flight suspend points.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// CancelCause
// ---------------------------------------------------------------------------

/// Why a run was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelCause {
    /// A flow or step deadline fired.
    Timeout,
    /// A stop step with `endWorkflow=true` completed.
    Stop,
    /// `pause()` was called.
    Pause,
    /// Explicit external cancellation.
    Manual,
    /// A step failed under `onFailure=abort-flow`.
    UpstreamFailure,
}

impl CancelCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelCause::Timeout => "timeout",
            CancelCause::Stop => "stop",
            CancelCause::Pause => "pause",
            CancelCause::Manual => "manual",
            CancelCause::UpstreamFailure => "upstream-failure",
        }
    }

    /// The reason string carried by `STEP_SKIP` events for steps that never
    /// started because of this cancellation.
    pub fn skip_reason(&self) -> &'static str {
        match self {
            CancelCause::Timeout => "flow timed out",
            CancelCause::Stop => "flow stopped",
            CancelCause::Pause => "flow paused",
            CancelCause::Manual => "flow cancelled",
            CancelCause::UpstreamFailure => "upstream failure",
        }
    }
}

impl std::fmt::Display for CancelCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Cause cell (chains child -> parent)
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct CauseCell {
    cause: OnceLock<CancelCause>,
    parent: Option<Arc<CauseCell>>,
}

impl CauseCell {
    fn get(&self) -> Option<CancelCause> {
        self.cause
            .get()
            .copied()
            .or_else(|| self.parent.as_ref().and_then(|p| p.get()))
    }
}

// ---------------------------------------------------------------------------
// CancelSource / CancelSignal
// ---------------------------------------------------------------------------

/// The cancelling side. One per run; children per step-timeout subtree.
#[derive(Debug, Clone)]
pub struct CancelSource {
    token: CancellationToken,
    cell: Arc<CauseCell>,
    stopped: Arc<AtomicBool>,
}

impl CancelSource {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            cell: Arc::new(CauseCell::default()),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cancel with a cause. The first cause wins; later calls are no-ops.
    ///
    /// `Stop` is graceful: it marks the source cancelled for admission
    /// checks but does not fire the token, so in-flight work completes.
    pub fn cancel(&self, cause: CancelCause) {
        if self.is_cancelled() {
            return;
        }
        let _ = self.cell.cause.set(cause);
        if matches!(cause, CancelCause::Stop) {
            self.stopped.store(true, Ordering::SeqCst);
        } else {
            self.token.cancel();
        }
    }

    /// Whether the source has been cancelled (including a graceful stop).
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.stopped.load(Ordering::SeqCst)
    }

    pub fn cause(&self) -> Option<CancelCause> {
        self.cell.get()
    }

    /// The observing side, cloned into tasks and handlers.
    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            token: self.token.clone(),
            cell: Arc::clone(&self.cell),
            stopped: Arc::clone(&self.stopped),
        }
    }

    /// A child source whose cancellation does not propagate upward. Firing
    /// the parent fires every child.
    pub fn child(&self) -> CancelSource {
        CancelSource {
            token: self.token.child_token(),
            cell: Arc::new(CauseCell {
                cause: OnceLock::new(),
                parent: Some(Arc::clone(&self.cell)),
            }),
            stopped: Arc::clone(&self.stopped),
        }
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

/// The observing side of a cancellation source.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    token: CancellationToken,
    cell: Arc<CauseCell>,
    stopped: Arc<AtomicBool>,
}

impl CancelSignal {
    /// Whether the token has fired. A graceful stop does not fire the token
    /// and is therefore not visible here; in-flight work keeps running.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cause(&self) -> Option<CancelCause> {
        self.cell.get()
    }

    /// Resolves when the token fires. Never resolves for a graceful stop.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// A child source for a step-scoped subtree (per-step timeouts).
    pub fn child_source(&self) -> CancelSource {
        CancelSource {
            token: self.token.child_token(),
            cell: Arc::new(CauseCell {
                cause: OnceLock::new(),
                parent: Some(Arc::clone(&self.cell)),
            }),
            stopped: Arc::clone(&self.stopped),
        }
    }

    /// A signal that never fires, for standalone executor use.
    pub fn never() -> CancelSignal {
        CancelSignal {
            token: CancellationToken::new(),
            cell: Arc::new(CauseCell::default()),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
