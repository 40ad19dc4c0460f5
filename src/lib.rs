//! # nativeproc
//!
//! Native process control for debuggers on Linux x86-64.
//!
//! This crate launches or attaches to a process with `ptrace`, controls its threads, arms
//! software and hardware breakpoints, single-steps, reads and writes memory and registers and
//! reports why the process stopped. Symbol resolution, breakpoint conditions and user interfaces
//! are left to the layers built on top of it.
//!
//! The entry point is [`ProcessHandle`](process::ProcessHandle):
//!
//! ```no_run
//! use nativeproc::launch::LaunchOptions;
//! use nativeproc::process::ProcessHandle;
//!
//! let mut proc = ProcessHandle::launch(LaunchOptions::new("/bin/true"))?;
//! let entry = proc.entry_point()?;
//! proc.set_breakpoint(entry, None)?;
//! let stop = proc.continue_once()?;
//! println!("stopped at {} because of {:?}", stop.pc, stop.reason);
//! proc.detach(true)?;
//! # Ok::<(), nativeproc::errors::DebuggerError>(())
//! ```

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
compile_error!("nativeproc only supports linux on x86_64");

pub mod addr;
pub mod arch;
pub mod breakpoint;
pub mod consts;
pub mod dump;
pub mod errors;
pub mod executor;
pub mod launch;
pub mod memory;
pub mod memorymap;
pub mod process;
pub mod registers;
pub mod state;
pub mod stop;
pub mod sys;
pub mod thread;
pub mod wait;

/// A machine word of the target
pub type Word = i64;

/// Size of a [`Word`] in bytes
pub const WORD_BYTES: usize = std::mem::size_of::<Word>();

pub use addr::Addr;
pub use errors::{DebuggerError, Result};
pub use process::ProcessHandle;
pub use stop::{Stop, StopReason};
