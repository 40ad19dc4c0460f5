//! # Operating system layer
//!
//! The capabilities the process-control core needs from the kernel, as free functions over a
//! thread id. Everything that issues a `ptrace` request must be called on the tracer thread, see
//! [`PtraceExecutor`](crate::executor::PtraceExecutor). The `/proc` readers and the
//! `process_vm_*` copies can be used from anywhere.

use std::io::{IoSlice, IoSliceMut};
use std::path::PathBuf;

use nix::errno::Errno;
use nix::libc;
use nix::sys::ptrace::{self, Options};
use nix::sys::signal::Signal;
use nix::sys::uio::{process_vm_readv, process_vm_writev, RemoteIoVec};
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::Pid;
use once_cell::sync::OnceCell;
use tracing::{debug, trace};

use crate::addr::Addr;
use crate::consts::{FXSAVE_SIZE, NT_X86_XSTATE, XSTATE_MAX_SIZE};
use crate::errors::{DebuggerError, Result};
use crate::wait::WaitStatus;
use crate::Word;

/// `AT_NULL` of the auxiliary vector, terminates it
const AT_NULL: u64 = 0;
/// `AT_ENTRY` of the auxiliary vector, the entry point of the program
const AT_ENTRY: u64 = 9;

// ---------------- execution control --------------------------------------------------------------

pub fn cont(tid: Pid, sig: Option<Signal>) -> Result<()> {
    Ok(ptrace::cont(tid, sig)?)
}

pub fn step(tid: Pid, sig: Option<Signal>) -> Result<()> {
    Ok(ptrace::step(tid, sig)?)
}

pub fn attach(pid: Pid) -> Result<()> {
    Ok(ptrace::attach(pid)?)
}

pub fn detach(tid: Pid, sig: Option<Signal>) -> Result<()> {
    Ok(ptrace::detach(tid, sig)?)
}

/// Makes the kernel report new threads of a traced thread
pub fn trace_clones(tid: Pid) -> Result<()> {
    Ok(ptrace::setoptions(tid, Options::PTRACE_O_TRACECLONE)?)
}

/// Message of the last ptrace event, the new thread id for a clone event
pub fn event_message(tid: Pid) -> Result<Pid> {
    Ok(Pid::from_raw(ptrace::getevent(tid)? as libc::pid_t))
}

pub fn siginfo(tid: Pid) -> Result<libc::siginfo_t> {
    Ok(ptrace::getsiginfo(tid)?)
}

/// Sends `sig` to the whole thread group
pub fn kill(pid: Pid, sig: Signal) -> Result<()> {
    Ok(nix::sys::signal::kill(pid, sig)?)
}

/// Sends `sig` to exactly one thread of the thread group `tgid`
pub fn tgkill(tgid: Pid, tid: Pid, sig: Signal) -> Result<()> {
    // SAFETY: plain syscall, no memory is passed
    let ret = unsafe {
        libc::syscall(
            libc::SYS_tgkill,
            tgid.as_raw(),
            tid.as_raw(),
            sig as libc::c_int,
        )
    };
    Errno::result(ret)?;
    Ok(())
}

/// Waits for any traced thread, including threads that are not our children
pub fn wait_any() -> Result<WaitStatus> {
    waitpid(Pid::from_raw(-1), Some(WaitPidFlag::__WALL))
        .map(WaitStatus::from)
        .map_err(DebuggerError::WaitFailed)
}

/// Like [`wait_any`] but returns `None` instead of blocking
pub fn wait_any_nohang() -> Result<Option<WaitStatus>> {
    let status = waitpid(
        Pid::from_raw(-1),
        Some(WaitPidFlag::__WALL | WaitPidFlag::WNOHANG),
    );
    match status {
        Ok(nix::sys::wait::WaitStatus::StillAlive) => Ok(None),
        Ok(status) => Ok(Some(WaitStatus::from(status))),
        Err(Errno::ECHILD) => Ok(None),
        Err(e) => Err(DebuggerError::WaitFailed(e)),
    }
}

/// Waits for one specific thread
pub fn wait_for(tid: Pid) -> Result<WaitStatus> {
    waitpid(tid, Some(WaitPidFlag::__WALL))
        .map(WaitStatus::from)
        .map_err(DebuggerError::WaitFailed)
}

// ---------------- memory -------------------------------------------------------------------------

pub fn peek(tid: Pid, addr: Addr) -> Result<Word> {
    Ok(ptrace::read(tid, addr.into())?)
}

pub fn poke(tid: Pid, addr: Addr, value: Word) -> Result<()> {
    Ok(ptrace::write(tid, addr.into(), value)?)
}

/// Copies target memory with `process_vm_readv`, returns the number of bytes copied
pub fn vm_read(pid: Pid, addr: Addr, buf: &mut [u8]) -> Result<usize> {
    let remote = [RemoteIoVec {
        base: addr.usize(),
        len: buf.len(),
    }];
    Ok(process_vm_readv(pid, &mut [IoSliceMut::new(buf)], &remote)?)
}

/// Copies into target memory with `process_vm_writev`, returns the number of bytes copied
///
/// Read-only mappings, like the text of the program, can not be written this way.
pub fn vm_write(pid: Pid, addr: Addr, data: &[u8]) -> Result<usize> {
    let remote = [RemoteIoVec {
        base: addr.usize(),
        len: data.len(),
    }];
    Ok(process_vm_writev(pid, &[IoSlice::new(data)], &remote)?)
}

// ---------------- registers ----------------------------------------------------------------------

pub fn getregs(tid: Pid) -> Result<libc::user_regs_struct> {
    Ok(ptrace::getregs(tid)?)
}

pub fn setregs(tid: Pid, regs: libc::user_regs_struct) -> Result<()> {
    Ok(ptrace::setregs(tid, regs)?)
}

/// Reads a word of the `struct user` area of a thread
pub fn peek_user(tid: Pid, offset: usize) -> Result<Word> {
    Ok(ptrace::read_user(tid, offset as ptrace::AddressType)?)
}

/// Writes a word of the `struct user` area of a thread
pub fn poke_user(tid: Pid, offset: usize, value: Word) -> Result<()> {
    Ok(ptrace::write_user(tid, offset as ptrace::AddressType, value)?)
}

/// How the extended register state is transferred on this machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XstateVariant {
    /// `PTRACE_GETREGSET` with `NT_X86_XSTATE`, the xsave area has `size` bytes
    Xsave { size: usize },
    /// `PTRACE_GETFPREGS`, only the legacy fxsave area
    Fxsave,
}

impl XstateVariant {
    pub fn size(&self) -> usize {
        match self {
            XstateVariant::Xsave { size } => *size,
            XstateVariant::Fxsave => FXSAVE_SIZE,
        }
    }
}

static XSTATE_VARIANT: OnceCell<XstateVariant> = OnceCell::new();

/// The xstate variant of this machine, probed on `tid` the first time it is needed
pub fn xstate_variant(tid: Pid) -> Result<XstateVariant> {
    XSTATE_VARIANT
        .get_or_try_init(|| {
            let mut buf = vec![0u8; XSTATE_MAX_SIZE];
            let variant = match getregset_raw(tid, NT_X86_XSTATE, &mut buf) {
                Ok(size) => XstateVariant::Xsave { size },
                Err(DebuggerError::Os(Errno::EIO | Errno::EINVAL | Errno::ENODEV)) => {
                    XstateVariant::Fxsave
                }
                Err(e) => return Err(e),
            };
            debug!("extended register state transferred as {variant:?}");
            Ok(variant)
        })
        .copied()
}

fn getregset_raw(tid: Pid, note: i32, buf: &mut [u8]) -> Result<usize> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };
    // SAFETY: the kernel writes at most iov_len bytes into buf and updates iov_len
    let ret = unsafe {
        libc::ptrace(
            libc::PTRACE_GETREGSET,
            tid.as_raw(),
            note as usize as *mut libc::c_void,
            &mut iov as *mut libc::iovec,
        )
    };
    Errno::result(ret)?;
    Ok(iov.iov_len)
}

fn setregset_raw(tid: Pid, note: i32, buf: &[u8]) -> Result<()> {
    let mut iov = libc::iovec {
        iov_base: buf.as_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    // SAFETY: the kernel only reads iov_len bytes from buf
    let ret = unsafe {
        libc::ptrace(
            libc::PTRACE_SETREGSET,
            tid.as_raw(),
            note as usize as *mut libc::c_void,
            &mut iov as *mut libc::iovec,
        )
    };
    Errno::result(ret)?;
    Ok(())
}

/// Reads the raw xsave (or fxsave) area of a thread
pub fn get_xstate(tid: Pid) -> Result<Vec<u8>> {
    let variant = xstate_variant(tid)?;
    let mut buf = vec![0u8; variant.size()];
    match variant {
        XstateVariant::Xsave { .. } => {
            let len = getregset_raw(tid, NT_X86_XSTATE, &mut buf)?;
            buf.truncate(len);
        }
        XstateVariant::Fxsave => {
            // SAFETY: PTRACE_GETFPREGS writes a user_fpregs_struct, which is FXSAVE_SIZE bytes
            let ret = unsafe {
                libc::ptrace(
                    libc::PTRACE_GETFPREGS,
                    tid.as_raw(),
                    std::ptr::null_mut::<libc::c_void>(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                )
            };
            Errno::result(ret)?;
        }
    }
    trace!("read {} bytes of extended state of {tid}", buf.len());
    Ok(buf)
}

/// Writes back an area previously read with [`get_xstate`]
pub fn set_xstate(tid: Pid, data: &[u8]) -> Result<()> {
    match xstate_variant(tid)? {
        XstateVariant::Xsave { .. } => setregset_raw(tid, NT_X86_XSTATE, data),
        XstateVariant::Fxsave => {
            if data.len() < FXSAVE_SIZE {
                return Err(DebuggerError::Os(Errno::EINVAL));
            }
            // SAFETY: data holds at least one user_fpregs_struct
            let ret = unsafe {
                libc::ptrace(
                    libc::PTRACE_SETFPREGS,
                    tid.as_raw(),
                    std::ptr::null_mut::<libc::c_void>(),
                    data.as_ptr() as *mut libc::c_void,
                )
            };
            Errno::result(ret)?;
            Ok(())
        }
    }
}

// ---------------- /proc --------------------------------------------------------------------------

/// Ids of all threads of process `pid`
pub fn thread_ids(pid: Pid) -> Result<Vec<Pid>> {
    let mut ids = Vec::new();
    for entry in std::fs::read_dir(format!("/proc/{pid}/task"))? {
        let name = entry?.file_name();
        if let Some(tid) = name.to_str().and_then(|s| s.parse::<i32>().ok()) {
            ids.push(Pid::from_raw(tid));
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

/// Kernel scheduling state of a thread (`R`, `S`, `t`, `Z` and so on)
pub fn task_state(pid: Pid, tid: Pid) -> Result<char> {
    let path = format!("/proc/{pid}/task/{tid}/stat");
    let stat = std::fs::read_to_string(&path)?;
    parse_stat_state(&stat).ok_or(DebuggerError::MalformedProcFile(path))
}

pub(crate) fn parse_stat_state(stat: &str) -> Option<char> {
    // the command name may contain spaces and parentheses, the state follows the last ')'
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.trim_start().chars().next()
}

/// Thread group of a thread, `None` if the thread does not exist (anymore)
pub fn thread_group(tid: Pid) -> Result<Option<Pid>> {
    let path = format!("/proc/{tid}/status");
    let status = match std::fs::read_to_string(&path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    parse_status_tgid(&status)
        .map(Some)
        .ok_or(DebuggerError::MalformedProcFile(path))
}

pub(crate) fn parse_status_tgid(status: &str) -> Option<Pid> {
    status
        .lines()
        .find_map(|l| l.strip_prefix("Tgid:"))
        .and_then(|v| v.trim().parse().ok())
        .map(Pid::from_raw)
}

/// Command name of a process
pub fn comm(pid: Pid) -> Result<String> {
    Ok(std::fs::read_to_string(format!("/proc/{pid}/comm"))?
        .trim_end()
        .to_string())
}

/// Raw auxiliary vector of a process
pub fn auxv(pid: Pid) -> Result<Vec<u8>> {
    Ok(std::fs::read(format!("/proc/{pid}/auxv"))?)
}

/// Command line of a process, NUL separated
pub fn cmdline(pid: Pid) -> Result<Vec<u8>> {
    Ok(std::fs::read(format!("/proc/{pid}/cmdline"))?)
}

/// Path of the executable a process runs
pub fn executable(pid: Pid) -> Result<PathBuf> {
    Ok(std::fs::read_link(format!("/proc/{pid}/exe"))?)
}

/// Entry point of the program, from the auxiliary vector
pub fn entry_point(pid: Pid) -> Result<Addr> {
    parse_auxv(&auxv(pid)?, AT_ENTRY)
        .map(Addr::from)
        .ok_or_else(|| DebuggerError::MalformedProcFile(format!("/proc/{pid}/auxv")))
}

pub(crate) fn parse_auxv(auxv: &[u8], key: u64) -> Option<u64> {
    let mut words = auxv
        .chunks_exact(8)
        .map(|c| u64::from_ne_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]));
    while let (Some(k), Some(v)) = (words.next(), words.next()) {
        if k == AT_NULL {
            break;
        }
        if k == key {
            return Some(v);
        }
    }
    None
}
