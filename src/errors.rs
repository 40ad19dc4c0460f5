//! # Errors
//!
//! The error taxonomy of the process-control core.
//!
//! Errors are never recovered from below the continue engine: memory, register and executor
//! operations propagate them as-is, and only [`ProcessHandle`](crate::process::ProcessHandle)
//! interprets a [`DebuggerError::ProcessExited`] as a state transition.

use nix::unistd::Pid;
use thiserror::Error;

use crate::addr::Addr;

/// Shorthand for results of this crate
pub type Result<T> = std::result::Result<T, DebuggerError>;

#[derive(Error, Debug)]
pub enum DebuggerError {
    #[error("process {pid} has exited with status {status}")]
    ProcessExited { pid: Pid, status: i32 },
    #[error("process has been detached")]
    ProcessDetached,
    #[error("could not write breakpoint at {addr}: {source}")]
    BreakpointWriteFailed {
        addr: Addr,
        #[source]
        source: Box<DebuggerError>,
    },
    #[error("could not erase breakpoint at {addr}: {source}")]
    BreakpointEraseFailed {
        addr: Addr,
        #[source]
        source: Box<DebuggerError>,
    },
    #[error("a breakpoint already exists at {0}")]
    BreakpointExists(Addr),
    #[error("no breakpoint at {0}")]
    NoSuchBreakpoint(Addr),
    #[error("hardware breakpoints exhausted")]
    NoFreeHardwareSlot,
    #[error("hardware breakpoint slot {0} is already in use")]
    HardwareSlotInUse(u8),
    #[error("there is no hardware breakpoint slot {0}")]
    InvalidHardwareSlot(u8),
    #[error("unsupported watchpoint: {0}")]
    UnsupportedWatch(&'static str),
    #[error("wait failed: {0}")]
    WaitFailed(nix::Error),
    #[error("thread {0} not found")]
    ThreadNotFound(Pid),
    #[error("thread {0} exited")]
    ThreadExited(Pid),
    #[error("the ptrace executor has been shut down")]
    ExecutorClosed,
    #[error("a ptrace job panicked on the executor thread")]
    ExecutorJobPanicked,
    #[error("Os error: {0}")]
    Os(#[from] nix::Error),
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Executable does not exist: {0}")]
    ExecutableDoesNotExist(String),
    #[error("Executable is not a file: {0}")]
    ExecutableIsNotAFile(String),
    #[error("Could not find the executable: {0}")]
    Which(#[from] which::Error),
    #[error("invalid register: {0}")]
    InvalidRegister(u16),
    #[error("extended register state is too short: {0} bytes")]
    XstateTooShort(usize),
    #[error("malformed proc file {0}")]
    MalformedProcFile(String),
}

impl DebuggerError {
    /// True for the terminal conditions: the target exited or was detached.
    pub fn is_process_gone(&self) -> bool {
        matches!(
            self,
            DebuggerError::ProcessExited { .. } | DebuggerError::ProcessDetached
        )
    }

    /// The exit status if this error reports the end of the target process
    pub fn exit_status(&self) -> Option<i32> {
        match self {
            DebuggerError::ProcessExited { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub(crate) fn write_failed(addr: Addr, source: DebuggerError) -> Self {
        // an exited process stays an exited process
        if source.is_process_gone() {
            return source;
        }
        DebuggerError::BreakpointWriteFailed {
            addr,
            source: Box::new(source),
        }
    }

    pub(crate) fn erase_failed(addr: Addr, source: DebuggerError) -> Self {
        if source.is_process_gone() {
            return source;
        }
        DebuggerError::BreakpointEraseFailed {
            addr,
            source: Box::new(source),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_process_gone() {
        let e = DebuggerError::ProcessExited {
            pid: Pid::from_raw(42),
            status: 3,
        };
        assert!(e.is_process_gone());
        assert_eq!(e.exit_status(), Some(3));
        assert!(DebuggerError::ProcessDetached.is_process_gone());
        assert!(!DebuggerError::ExecutorClosed.is_process_gone());
    }

    #[test]
    fn test_write_failed_keeps_exit() {
        let exited = DebuggerError::ProcessExited {
            pid: Pid::from_raw(1),
            status: 0,
        };
        let e = DebuggerError::write_failed(Addr::from(0x1000usize), exited);
        assert!(matches!(e, DebuggerError::ProcessExited { .. }));

        let e = DebuggerError::write_failed(
            Addr::from(0x1000usize),
            DebuggerError::Os(nix::Error::EIO),
        );
        assert!(matches!(e, DebuggerError::BreakpointWriteFailed { .. }));
        assert_eq!(
            e.to_string(),
            "could not write breakpoint at 0x0000000000001000: Os error: EIO: I/O error"
        );
    }
}
