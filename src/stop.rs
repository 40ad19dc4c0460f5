//! Why and where a process stopped.

use std::fmt::Display;

use nix::unistd::Pid;
use serde::{Serialize, Serializer};

use crate::addr::Addr;

/// The reason the process stopped the last time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum StopReason {
    /// No breakpoint and no manual stop explains the trap
    #[default]
    Unknown,
    /// The process was just launched and sits at its first instruction
    Launched,
    /// The process was just attached to
    Attached,
    /// A [`StopHandle`](crate::state::StopHandle) asked for the stop
    ManualStop,
    BreakpointHit,
    Exited,
    /// A hardware data watchpoint was triggered
    WatchpointHit,
}

/// Report of [`continue_once`](crate::process::ProcessHandle::continue_once)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Stop {
    /// The thread that caused the stop
    #[serde(serialize_with = "serialize_pid")]
    pub thread: Pid,
    pub reason: StopReason,
    /// Program counter of [`Stop::thread`] after breakpoint adjustment
    pub pc: Addr,
}

fn serialize_pid<S: Serializer>(pid: &Pid, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_i32(pid.as_raw())
}

impl Display for Stop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "thread {} stopped at {}: {:?}", self.thread, self.pc, self.reason)
    }
}
