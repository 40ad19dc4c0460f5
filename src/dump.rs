//! # Process notes
//!
//! The ELF notes that describe a live process in a core file: `NT_PRPSINFO` for the process,
//! `NT_AUXV`, and per thread `NT_PRSTATUS` with the general purpose registers followed by
//! `NT_X86_XSTATE`. Writing the core file itself is left to the caller, together with the
//! memory of [`MemoryMap::dumpable`](crate::memorymap::MemoryMap::dumpable).
//!
//! Layouts follow `struct elf_prpsinfo` and `struct elf_prstatus` of the x86-64 kernel.

use std::path::Path;

use nix::libc::user_regs_struct;
use nix::unistd::Pid;
use serde::Serialize;

use crate::consts::{FXSAVE_SIZE, NT_X86_XSTATE};
use crate::registers::Xstate;

pub const NT_PRSTATUS: u32 = 1;
pub const NT_PRPSINFO: u32 = 3;
pub const NT_AUXV: u32 = 6;

/// Size of `struct elf_prpsinfo`
pub const PRPSINFO_SIZE: usize = 136;
/// Size of `struct elf_prstatus`
pub const PRSTATUS_SIZE: usize = 336;

const FNAME_LEN: usize = 16;
const ARGS_LEN: usize = 80;
/// fxsave area plus the xsave header
const XSTATE_MIN_SIZE: usize = FXSAVE_SIZE + 64;
/// Offset of `pr_reg` in `struct elf_prstatus`
pub(crate) const PRSTATUS_REGS: usize = 112;

/// One ELF note
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Note {
    /// Owner, `CORE` or `LINUX`
    pub name: &'static str,
    pub kind: u32,
    pub data: Vec<u8>,
}

impl Note {
    fn core(kind: u32, data: Vec<u8>) -> Self {
        Self {
            name: "CORE",
            kind,
            data,
        }
    }

    /// The note as it appears in a `PT_NOTE` segment, name and descriptor padded to 4 bytes
    pub fn encode(&self) -> Vec<u8> {
        let namesz = self.name.len() + 1;
        let mut out = Vec::with_capacity(12 + pad4(namesz) + pad4(self.data.len()));
        out.extend_from_slice(&(namesz as u32).to_le_bytes());
        out.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.kind.to_le_bytes());
        out.extend_from_slice(self.name.as_bytes());
        out.resize(12 + pad4(namesz), 0);
        out.extend_from_slice(&self.data);
        out.resize(12 + pad4(namesz) + pad4(self.data.len()), 0);
        out
    }
}

fn pad4(n: usize) -> usize {
    (n + 3) & !3
}

/// `NT_PRPSINFO` of process `pid`
///
/// Names longer than the kernel's fields are cut, the last byte of each stays NUL.
pub fn prpsinfo(pid: Pid, comm: &str, args: &[u8]) -> Note {
    let mut data = Vec::with_capacity(PRPSINFO_SIZE);
    // state, sname, zomb, nice, padding, flag, uid, gid
    data.resize(24, 0);
    data.extend_from_slice(&pid.as_raw().to_le_bytes());
    // ppid, pgrp, sid
    data.resize(40, 0);
    push_cstr(&mut data, comm.as_bytes(), FNAME_LEN);
    push_cstr(&mut data, args, ARGS_LEN);
    Note::core(NT_PRPSINFO, data)
}

fn push_cstr(out: &mut Vec<u8>, s: &[u8], field: usize) {
    let n = s.len().min(field - 1);
    let start = out.len();
    out.extend_from_slice(&s[..n]);
    out.resize(start + field, 0);
}

/// The `pr_psargs` of a process: the executable, then the arguments after `argv[0]`
pub fn psargs(exe: &Path, cmdline: &[u8]) -> Vec<u8> {
    let mut cmdline = cmdline;
    while let Some(rest) = cmdline.strip_suffix(b"\n") {
        cmdline = rest;
    }
    let rest = match cmdline.iter().position(|b| *b == 0) {
        Some(zero) => &cmdline[zero + 1..],
        None => cmdline,
    };
    let mut args = exe.as_os_str().as_encoded_bytes().to_vec();
    args.push(0);
    args.extend_from_slice(rest);
    args
}

pub fn auxv(raw: Vec<u8>) -> Note {
    Note::core(NT_AUXV, raw)
}

/// `NT_PRSTATUS` of thread `tid` of process `pid`
pub fn prstatus(tid: Pid, pid: Pid, regs: &user_regs_struct) -> Note {
    let mut data = Vec::with_capacity(PRSTATUS_SIZE);
    // siginfo, cursig, sigpend, sighold
    data.resize(32, 0);
    for id in [tid, pid, pid, pid] {
        data.extend_from_slice(&id.as_raw().to_le_bytes());
    }
    // utime, stime, cutime, cstime
    data.resize(PRSTATUS_REGS, 0);
    for word in gpr_words(regs) {
        data.extend_from_slice(&word.to_le_bytes());
    }
    // fpvalid, the xstate note follows
    data.extend_from_slice(&1u64.to_le_bytes());
    Note::core(NT_PRSTATUS, data)
}

/// `NT_X86_XSTATE`, at least the legacy area and the xsave header even without extended state
pub fn xstate(xstate: Option<&Xstate>) -> Note {
    let mut data = xstate.map(|x| x.raw().to_vec()).unwrap_or_default();
    if data.len() < XSTATE_MIN_SIZE {
        data.resize(XSTATE_MIN_SIZE, 0);
    }
    Note {
        name: "LINUX",
        kind: NT_X86_XSTATE as u32,
        data,
    }
}

/// The registers in the order of the kernel's `struct user_regs_struct`
fn gpr_words(r: &user_regs_struct) -> [u64; 27] {
    [
        r.r15, r.r14, r.r13, r.r12, r.rbp, r.rbx, r.r11, r.r10, r.r9, r.r8, r.rax, r.rcx, r.rdx,
        r.rsi, r.rdi, r.orig_rax, r.rip, r.cs, r.eflags, r.rsp, r.ss, r.fs_base, r.gs_base, r.ds,
        r.es, r.fs, r.gs,
    ]
}
