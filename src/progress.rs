//! Cooperative pause/cancellation for long-running operations.
//!
//! Every engine loop calls [`ProgressToken::rendezvous`] at its suspension
//! points (channel reads, remote I/O boundaries). A paused token parks the
//! task until resumed; a cancelled token surfaces [`EngineError::Cancelled`]
//! so the operation can drain its transaction and flush the backend before
//! returning.

use tokio::sync::watch;

use crate::error::{EngineError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RunState {
    Running,
    Paused,
    Cancelled,
}

/// Controller half; owned by whoever drives the operation.
pub struct ProgressControl {
    tx: watch::Sender<RunState>,
}

impl ProgressControl {
    pub fn new() -> (Self, ProgressToken) {
        let (tx, rx) = watch::channel(RunState::Running);
        (Self { tx }, ProgressToken { rx })
    }

    pub fn pause(&self) {
        let _ = self.tx.send(RunState::Paused);
    }

    pub fn resume(&self) {
        let _ = self.tx.send(RunState::Running);
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(RunState::Cancelled);
    }
}

/// Checkpoint handle threaded through every async engine call.
#[derive(Clone)]
pub struct ProgressToken {
    rx: watch::Receiver<RunState>,
}

impl ProgressToken {
    /// A token that never pauses and never cancels.
    pub fn noop() -> Self {
        let (tx, rx) = watch::channel(RunState::Running);
        // Keep the sender alive forever so the channel never closes.
        std::mem::forget(tx);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() == RunState::Cancelled
    }

    /// Cooperative checkpoint: returns immediately while running, parks
    /// while paused, errors once cancelled.
    pub async fn rendezvous(&self) -> Result<()> {
        let mut rx = self.rx.clone();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                RunState::Running => return Ok(()),
                RunState::Cancelled => return Err(EngineError::Cancelled),
                RunState::Paused => {
                    if rx.changed().await.is_err() {
                        // Controller dropped while paused; treat as resume.
                        return Ok(());
                    }
                }
            }
        }
    }
}
