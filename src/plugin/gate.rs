//! Per-record dispatch gate: in-flight accounting, draining and
//! serialization of non-reentrant plugins.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct GateState {
    inflight: usize,
    draining: bool,
}

/// Admits capability calls to one plugin instance.
#[derive(Debug)]
pub struct DispatchGate {
    state: watch::Sender<GateState>,
    cancel: parking_lot::Mutex<CancellationToken>,
    serialized: AtomicBool,
    serial: Mutex<()>,
}

/// How a drain ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainOutcome {
    /// Calls still running when the grace period ran out (now cancelled).
    pub cancelled: usize,
    /// Time spent waiting.
    pub waited: Duration,
}

impl DrainOutcome {
    /// Whether every in-flight call finished within the grace period.
    pub fn completed(&self) -> bool {
        self.cancelled == 0
    }
}

/// An admitted call. Dropping it releases the in-flight slot.
#[derive(Debug)]
pub struct CallPermit {
    gate: Arc<DispatchGate>,
    token: CancellationToken,
}

impl CallPermit {
    /// Token cancelled when the call is abandoned by a drain.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        self.gate.state.send_modify(|s| s.inflight = s.inflight.saturating_sub(1));
    }
}

impl DispatchGate {
    /// Create an open gate.
    pub fn new(reentrant: bool) -> Self {
        let (state, _) = watch::channel(GateState::default());
        Self {
            state,
            cancel: parking_lot::Mutex::new(CancellationToken::new()),
            serialized: AtomicBool::new(!reentrant),
            serial: Mutex::new(()),
        }
    }

    /// Admit a call, or `None` while draining.
    pub fn enter(self: &Arc<Self>) -> Option<CallPermit> {
        let mut admitted = false;
        self.state.send_if_modified(|s| {
            if s.draining {
                return false;
            }
            s.inflight += 1;
            admitted = true;
            true
        });
        admitted.then(|| CallPermit { gate: Arc::clone(self), token: self.cancel.lock().clone() })
    }

    /// Number of admitted calls still running.
    pub fn inflight(&self) -> usize {
        self.state.borrow().inflight
    }

    /// Check if the gate is draining.
    pub fn is_draining(&self) -> bool {
        self.state.borrow().draining
    }

    /// Whether calls are serialized.
    pub fn is_serialized(&self) -> bool {
        self.serialized.load(Ordering::Acquire)
    }

    /// Serialize calls (for non-reentrant instances).
    pub fn set_serialized(&self, serialized: bool) {
        self.serialized.store(serialized, Ordering::Release);
    }

    /// Wait for the serialization lock if calls are serialized.
    pub async fn serialize(&self) -> Option<MutexGuard<'_, ()>> {
        if self.is_serialized() {
            Some(self.serial.lock().await)
        } else {
            None
        }
    }

    /// Stop admitting calls, wait up to `grace` for in-flight calls, then
    /// cancel whatever is left. The gate stays closed until [`reopen`].
    ///
    /// [`reopen`]: DispatchGate::reopen
    pub async fn drain(&self, grace: Duration) -> DrainOutcome {
        let started = Instant::now();
        let mut rx = self.state.subscribe();
        self.state.send_modify(|s| s.draining = true);

        let finished =
            tokio::time::timeout(grace, rx.wait_for(|s| s.inflight == 0)).await.is_ok();

        let cancelled = if finished {
            0
        } else {
            let left = self.inflight();
            let fresh = CancellationToken::new();
            let old = std::mem::replace(&mut *self.cancel.lock(), fresh);
            old.cancel();
            left
        };

        DrainOutcome { cancelled, waited: started.elapsed() }
    }

    /// Start admitting calls again.
    pub fn reopen(&self) {
        self.state.send_modify(|s| s.draining = false);
    }
}
