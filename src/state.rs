//! Lifecycle of a debugged process and the state that is shared across threads.
//!
//! A [`ProcessHandle`](crate::process::ProcessHandle) is owned by one thread. The only thing
//! another thread may do with the process while it runs is to ask for a manual stop through a
//! [`StopHandle`], which touches nothing but the [`Shared`] block.

use std::sync::{Arc, Mutex, PoisonError};

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use serde::Serialize;
use tracing::debug;

use crate::errors::{DebuggerError, Result};
use crate::sys;

/// Where the process is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProcessState {
    /// All threads are stopped and can be inspected
    Stopped,
    /// [`continue_once`](crate::process::ProcessHandle::continue_once) is waiting for a trap
    Running,
    /// The process is gone, with the exit code or the negated number of the killing signal
    Exited(i32),
    /// We let go of the process
    Detached,
}

/// State of one process, shared with every [`StopHandle`]
#[derive(Debug)]
pub(crate) struct Shared {
    pid: Pid,
    manual_stop: Mutex<bool>,
    state: Mutex<ProcessState>,
}

impl Shared {
    pub(crate) fn new(pid: Pid) -> Arc<Self> {
        Arc::new(Self {
            pid,
            manual_stop: Mutex::new(false),
            state: Mutex::new(ProcessState::Stopped),
        })
    }

    pub(crate) fn pid(&self) -> Pid {
        self.pid
    }

    pub(crate) fn state(&self) -> ProcessState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_state(&self, state: ProcessState) {
        debug!("process {} is now {state:?}", self.pid);
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Fails with the terminal condition if the process can no longer be controlled
    pub(crate) fn valid(&self) -> Result<()> {
        match self.state() {
            ProcessState::Exited(status) => Err(DebuggerError::ProcessExited {
                pid: self.pid,
                status,
            }),
            ProcessState::Detached => Err(DebuggerError::ProcessDetached),
            ProcessState::Stopped | ProcessState::Running => Ok(()),
        }
    }

    pub(crate) fn set_manual_stop(&self) -> Result<()> {
        self.valid()?;
        *self
            .manual_stop
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = true;
        Ok(())
    }

    pub(crate) fn request_manual_stop(&self) -> Result<()> {
        self.set_manual_stop()?;
        debug!("manual stop of {} requested", self.pid);
        sys::kill(self.pid, Signal::SIGTRAP)
    }

    pub(crate) fn check_and_clear_manual_stop(&self) -> bool {
        let mut flag = self
            .manual_stop
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *flag, false)
    }

    pub(crate) fn manual_stop_requested(&self) -> bool {
        *self
            .manual_stop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Interrupts a running process from another thread
///
/// Obtained from [`ProcessHandle::stop_handle`](crate::process::ProcessHandle::stop_handle).
/// This is the only way to bound a [`continue_once`](crate::process::ProcessHandle::continue_once)
/// in time.
#[derive(Debug, Clone)]
pub struct StopHandle {
    shared: Arc<Shared>,
}

impl StopHandle {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Makes the in-flight or next `continue_once` return with
    /// [`StopReason::ManualStop`](crate::stop::StopReason::ManualStop)
    ///
    /// # Errors
    ///
    /// Fails if the process is gone or the trap could not be sent.
    pub fn request_manual_stop(&self) -> Result<()> {
        self.shared.request_manual_stop()
    }

    pub fn pid(&self) -> Pid {
        self.shared.pid()
    }

    pub fn state(&self) -> ProcessState {
        self.shared.state()
    }
}
