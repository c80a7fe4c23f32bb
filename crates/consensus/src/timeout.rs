//! Timeout scheduling for the consensus state machine.
//!
//! Each consensus step arms at most one timeout; entering the next step
//! cancels it. Deadlines grow linearly with the round
//! (`base + delta * round`, from the configuration), which restores
//! liveness under partial synchrony: after GST some round's window is wide
//! enough for all correct validators to coordinate.
//!
//! Fired timeouts are delivered on an mpsc channel into the state
//! machine's event loop; a timeout that arrives for a stale
//! `(height, round, step)` is ignored there.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use tessera_types::{Height, Round};

use crate::state::Step;

/// A timeout event delivered to the consensus engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutInfo {
    /// The step the timeout was armed in
    pub step: Step,
    /// Height when the timeout was scheduled
    pub height: Height,
    /// Round when the timeout was scheduled
    pub round: Round,
}

impl std::fmt::Display for TimeoutInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Timeout({:?} h={} r={})",
            self.step, self.height, self.round
        )
    }
}

/// Schedules and cancels per-step timeouts.
pub struct TimeoutScheduler {
    timeout_tx: mpsc::Sender<TimeoutInfo>,
    pending: Mutex<HashMap<(Height, Round, Step), JoinHandle<()>>>,
}

impl TimeoutScheduler {
    /// Create a scheduler that delivers fired timeouts on `timeout_tx`.
    pub fn new(timeout_tx: mpsc::Sender<TimeoutInfo>) -> Self {
        Self {
            timeout_tx,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Arm a timeout for `(height, round, step)` after `duration`.
    ///
    /// Re-arming the same key replaces the previous timer.
    pub fn schedule(&self, step: Step, height: Height, round: Round, duration: Duration) {
        trace!(?step, height, round, ?duration, "scheduling timeout");
        let tx = self.timeout_tx.clone();
        let info = TimeoutInfo {
            step,
            height,
            round,
        };
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            // The receiver may already be gone during shutdown.
            let _ = tx.send(info).await;
        });
        let mut pending = self.pending.lock();
        if let Some(previous) = pending.insert((height, round, step), handle) {
            previous.abort();
        }
    }

    /// Cancel the timeout armed for `(height, round, step)`, if any.
    pub fn cancel(&self, step: Step, height: Height, round: Round) {
        if let Some(handle) = self.pending.lock().remove(&(height, round, step)) {
            trace!(?step, height, round, "cancelling timeout");
            handle.abort();
        }
    }

    /// Cancel every pending timeout (on commit and on shutdown).
    pub fn cancel_all(&self) {
        let mut pending = self.pending.lock();
        if !pending.is_empty() {
            debug!(count = pending.len(), "cancelling all timeouts");
        }
        for (_, handle) in pending.drain() {
            handle.abort();
        }
    }

    /// Number of armed timeouts (for tests and introspection).
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

impl Drop for TimeoutScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
