//! Cross-boundary lifecycle signals.
//!
//! The streaming loop and its supervisor coordinate through a fixed set of
//! one-way flags: `ready`, `started`, `stop`, `error` and `exit`. Each flag
//! exposes set / is-set / wait-until-set and nothing else; no ordering is
//! implied across flags except that `exit` is only set after the final
//! buffer has been drained and any result file written. The supervisor must
//! not clear any signal state until it has observed `exit` (flags here are
//! never cleared at all; a new session gets a fresh set).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

// =============================================================================
// Signal Flag
// =============================================================================

/// A one-way boolean flag with set / check / wait semantics.
///
/// Writers call [`set`](SignalFlag::set) exactly once per session; readers
/// either poll [`is_set`](SignalFlag::is_set) or block in
/// [`wait_timeout`](SignalFlag::wait_timeout). The flag is intentionally not
/// clearable.
#[derive(Debug, Default)]
pub struct SignalFlag {
    /// Fast path for polling without taking the lock.
    raised: AtomicBool,
    state: Mutex<bool>,
    cond: Condvar,
}

impl SignalFlag {
    /// Returns whether the flag has been set.
    pub fn is_set(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }

    /// Set the flag and wake all waiters. Idempotent.
    ///
    /// Returns true if this call performed the transition.
    pub fn set(&self) -> bool {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let first = !*state;
        *state = true;
        self.raised.store(true, Ordering::SeqCst);
        self.cond.notify_all();
        first
    }

    /// Block until the flag is set, or until `timeout` elapses.
    ///
    /// `None` waits indefinitely. Returns whether the flag was set when the
    /// wait ended.
    pub fn wait_timeout(&self, timeout: Option<Duration>) -> bool {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match timeout {
            None => {
                while !*state {
                    state = match self.cond.wait(state) {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                }
                true
            }
            Some(timeout) => {
                let deadline = std::time::Instant::now() + timeout;
                while !*state {
                    let remaining = match deadline.checked_duration_since(std::time::Instant::now())
                    {
                        Some(d) if !d.is_zero() => d,
                        _ => return false,
                    };
                    state = match self.cond.wait_timeout(state, remaining) {
                        Ok((guard, _)) => guard,
                        Err(poisoned) => poisoned.into_inner().0,
                    };
                }
                true
            }
        }
    }
}

// =============================================================================
// Lifecycle Signals
// =============================================================================

struct SignalsInner {
    ready: SignalFlag,
    started: SignalFlag,
    stop: SignalFlag,
    error: SignalFlag,
    exit: SignalFlag,
}

/// Cloneable handle to the full set of session lifecycle flags.
///
/// The pipeline sets `ready` once buffers and configuration are prepared,
/// `started` once capture begins, `error` on any unrecoverable condition and
/// `exit` after the final drain. The supervisor sets `stop`; the loop
/// observes it at iteration granularity.
#[derive(Clone)]
pub struct LifecycleSignals {
    inner: Arc<SignalsInner>,
}

impl LifecycleSignals {
    /// Create a fresh set of unset signals.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SignalsInner {
                ready: SignalFlag::default(),
                started: SignalFlag::default(),
                stop: SignalFlag::default(),
                error: SignalFlag::default(),
                exit: SignalFlag::default(),
            }),
        }
    }

    /// Set once buffers and configuration are prepared.
    pub fn ready(&self) -> &SignalFlag {
        &self.inner.ready
    }

    /// Set once the capture has started.
    pub fn started(&self) -> &SignalFlag {
        &self.inner.started
    }

    /// Supervisor-settable stop request; observed each loop iteration.
    pub fn stop(&self) -> &SignalFlag {
        &self.inner.stop
    }

    /// One-way unrecoverable-error flag.
    pub fn error(&self) -> &SignalFlag {
        &self.inner.error
    }

    /// Set only after the final buffer is drained and results are written.
    pub fn exit(&self) -> &SignalFlag {
        &self.inner.exit
    }
}

impl Default for LifecycleSignals {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LifecycleSignals {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleSignals")
            .field("ready", &self.inner.ready.is_set())
            .field("started", &self.inner.started.is_set())
            .field("stop", &self.inner.stop.is_set())
            .field("error", &self.inner.error.is_set())
            .field("exit", &self.inner.exit.is_set())
            .finish()
    }
}
