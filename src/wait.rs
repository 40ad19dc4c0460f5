//! Kernel wait statuses of traced threads.

use nix::sys::ptrace::Event;
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus as NixStatus;
use nix::unistd::Pid;

/// What `waitpid` reported for one thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitStatus(NixStatus);

impl WaitStatus {
    /// The thread the status is about, `None` for [`NixStatus::StillAlive`]
    pub fn pid(&self) -> Option<Pid> {
        self.0.pid()
    }

    /// Exit code if the thread exited normally
    pub fn exited(&self) -> Option<i32> {
        match self.0 {
            NixStatus::Exited(_, code) => Some(code),
            _ => None,
        }
    }

    /// Signal that killed the thread
    pub fn signaled(&self) -> Option<Signal> {
        match self.0 {
            NixStatus::Signaled(_, sig, _) => Some(sig),
            _ => None,
        }
    }

    /// True if the thread is gone
    pub fn is_terminated(&self) -> bool {
        matches!(self.0, NixStatus::Exited(..) | NixStatus::Signaled(..))
    }

    /// Status of a terminated thread: the exit code, or the negated number of the killing signal
    pub fn exit_status(&self) -> Option<i32> {
        match self.0 {
            NixStatus::Exited(_, code) => Some(code),
            NixStatus::Signaled(_, sig, _) => Some(-(sig as i32)),
            _ => None,
        }
    }

    /// The signal that stopped the thread, ptrace events count as `SIGTRAP`
    pub fn stop_signal(&self) -> Option<Signal> {
        match self.0 {
            NixStatus::Stopped(_, sig) | NixStatus::PtraceEvent(_, sig, _) => Some(sig),
            NixStatus::PtraceSyscall(_) => Some(Signal::SIGTRAP),
            _ => None,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop_signal().is_some()
    }

    /// The ptrace event that stopped the thread, if any
    pub fn trap_cause(&self) -> Option<i32> {
        match self.0 {
            NixStatus::PtraceEvent(_, _, event) => Some(event),
            _ => None,
        }
    }

    /// The thread stopped because it created a new thread
    pub fn is_clone_event(&self) -> bool {
        self.trap_cause() == Some(Event::PTRACE_EVENT_CLONE as i32)
    }

    /// A plain `SIGTRAP` stop: a breakpoint, a finished step or a manual stop
    pub fn is_trap(&self) -> bool {
        matches!(self.0, NixStatus::Stopped(_, Signal::SIGTRAP))
    }

    pub fn inner(&self) -> NixStatus {
        self.0
    }
}

impl From<NixStatus> for WaitStatus {
    fn from(value: NixStatus) -> Self {
        Self(value)
    }
}
