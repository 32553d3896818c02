//! Test-case completion gate.
//!
//! The orchestrator thread parks on the gate for the whole test case; the
//! engine's log callback thread opens it when it sees the final verdict.
//! The gate is a one-shot: one `arm`, one `signal`, one `await_completion`.
//!
//! ```text
//! Idle ──arm──▶ Armed ──signal──▶ Signaled ──await──▶ Released
//!  ▲                                                     │
//!  └──────────────────────── arm ◀───────────────────────┘
//! ```

use std::sync::{Condvar, Mutex, MutexGuard};

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    /// Never armed.
    Idle,
    /// Waiting for the verdict.
    Armed,
    /// Verdict seen, waiter not yet released.
    Signaled,
    /// Waiter released; the cycle is over.
    Released,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GateError {
    #[error("completion gate used before it was armed")]
    NotArmed,
    #[error("completion gate is already armed for a running test case")]
    AlreadyArmed,
    #[error("completion gate was already signaled in this cycle")]
    AlreadySignaled,
}

pub struct CompletionGate {
    state: Mutex<GateState>,
    condvar: Condvar,
}

impl Default for CompletionGate {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionGate {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState::Idle),
            condvar: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Prepare the gate for one test case. Must precede the test start.
    pub fn arm(&self) -> Result<(), GateError> {
        let mut state = self.lock();
        match *state {
            GateState::Idle | GateState::Released => {
                *state = GateState::Armed;
                Ok(())
            }
            GateState::Armed | GateState::Signaled => Err(GateError::AlreadyArmed),
        }
    }

    /// Open the gate. Only the first call per arm cycle has any effect.
    pub fn signal(&self) -> Result<(), GateError> {
        let mut state = self.lock();
        match *state {
            GateState::Armed => {
                *state = GateState::Signaled;
                self.condvar.notify_all();
                Ok(())
            }
            GateState::Idle => Err(GateError::NotArmed),
            GateState::Signaled | GateState::Released => Err(GateError::AlreadySignaled),
        }
    }

    /// Block until [`signal`](Self::signal) has been called for this cycle.
    ///
    /// Returns immediately if the signal already arrived.
    pub fn await_completion(&self) -> Result<(), GateError> {
        let mut state = self.lock();
        loop {
            match *state {
                GateState::Armed => {
                    state = self
                        .condvar
                        .wait(state)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
                GateState::Signaled => {
                    *state = GateState::Released;
                    return Ok(());
                }
                GateState::Idle | GateState::Released => return Err(GateError::NotArmed),
            }
        }
    }

    pub fn state(&self) -> GateState {
        *self.lock()
    }
}
