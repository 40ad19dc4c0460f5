//! # Registers
//!
//! Access to the general purpose, extended (x87/SSE/AVX) and debug registers of one thread.
//!
//! [`Registers`] is a snapshot. The general purpose registers are read eagerly, the extended
//! state is only fetched from the kernel the first time it is asked for, through a loader that
//! was captured when the snapshot was taken. Registers are addressed by their DWARF number, see
//! [`dwarf`].
//!
//! [`DebugRegisters`] is a typed view of DR0-DR3, DR6 and DR7 used to program hardware
//! breakpoints and watchpoints.

use std::fmt::Debug;
use std::sync::Arc;

use nix::errno::Errno;
use nix::libc::user_regs_struct;
use nix::unistd::Pid;
use tracing::trace;

use crate::addr::Addr;
use crate::arch::HW_SLOTS;
use crate::breakpoint::WatchType;
use crate::consts::{DEBUG_REG_COUNT, DEBUG_REG_USER_OFFSET, FXSAVE_SIZE};
use crate::errors::{DebuggerError, Result};
use crate::executor::PtraceExecutor;
use crate::{sys, WORD_BYTES};

/// DWARF register numbers of x86-64, as in the System V psABI
pub mod dwarf {
    pub const RAX: u16 = 0;
    pub const RDX: u16 = 1;
    pub const RCX: u16 = 2;
    pub const RBX: u16 = 3;
    pub const RSI: u16 = 4;
    pub const RDI: u16 = 5;
    pub const RBP: u16 = 6;
    pub const RSP: u16 = 7;
    pub const R8: u16 = 8;
    pub const R15: u16 = 15;
    /// The return address column, holds the program counter
    pub const RIP: u16 = 16;
    pub const XMM0: u16 = 17;
    pub const XMM15: u16 = 32;
    pub const ST0: u16 = 33;
    pub const ST7: u16 = 40;
    pub const MM0: u16 = 41;
    pub const MM7: u16 = 48;
    pub const RFLAGS: u16 = 49;
    pub const ES: u16 = 50;
    pub const CS: u16 = 51;
    pub const SS: u16 = 52;
    pub const DS: u16 = 53;
    pub const FS: u16 = 54;
    pub const GS: u16 = 55;
    pub const FS_BASE: u16 = 58;
    pub const GS_BASE: u16 = 59;
}

/// A new value for a register
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterValue {
    Uint(u64),
    /// Little endian bytes, for registers wider than a machine word
    Bytes(Vec<u8>),
}

impl RegisterValue {
    fn as_u64(&self) -> u64 {
        match self {
            RegisterValue::Uint(v) => *v,
            RegisterValue::Bytes(b) => {
                let mut word = [0u8; 8];
                let n = b.len().min(8);
                word[..n].copy_from_slice(&b[..n]);
                u64::from_le_bytes(word)
            }
        }
    }

    fn to_bytes<const N: usize>(&self) -> [u8; N] {
        let mut out = [0u8; N];
        let src = match self {
            RegisterValue::Uint(v) => v.to_le_bytes().to_vec(),
            RegisterValue::Bytes(b) => b.clone(),
        };
        let n = src.len().min(N);
        out[..n].copy_from_slice(&src[..n]);
        out
    }
}

impl From<u64> for RegisterValue {
    fn from(value: u64) -> Self {
        RegisterValue::Uint(value)
    }
}

impl From<Vec<u8>> for RegisterValue {
    fn from(value: Vec<u8>) -> Self {
        RegisterValue::Bytes(value)
    }
}

// ---------------- extended state -----------------------------------------------------------------

const FCW: usize = 0;
const FSW: usize = 2;
const FTW: usize = 4;
const FOP: usize = 6;
const FIP: usize = 8;
const FDP: usize = 16;
const MXCSR: usize = 24;
const MXCSR_MASK: usize = 28;
const ST_SPACE: usize = 32;
const XMM_SPACE: usize = 160;
const XSAVE_HEADER: usize = 512;
const YMM_HI_SPACE: usize = 576;
const XMM_COUNT: usize = 16;
const ST_COUNT: usize = 8;
/// Bit of the AVX state component in `XSTATE_BV`
const XFEATURE_YMM: u64 = 1 << 2;

/// The xsave area of a thread: x87, SSE and, if the machine has it, AVX state
///
/// Layout of the first 512 bytes is the legacy fxsave format, the xsave header and the upper
/// halves of the ymm registers follow if the kernel provided them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Xstate {
    raw: Vec<u8>,
}

impl Xstate {
    pub fn from_raw(raw: Vec<u8>) -> Result<Self> {
        if raw.len() < FXSAVE_SIZE {
            return Err(DebuggerError::XstateTooShort(raw.len()));
        }
        Ok(Self { raw })
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    fn u16_at(&self, off: usize) -> u16 {
        u16::from_le_bytes([self.raw[off], self.raw[off + 1]])
    }

    fn u32_at(&self, off: usize) -> u32 {
        let mut b = [0u8; 4];
        b.copy_from_slice(&self.raw[off..off + 4]);
        u32::from_le_bytes(b)
    }

    fn u64_at(&self, off: usize) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.raw[off..off + 8]);
        u64::from_le_bytes(b)
    }

    /// x87 control word
    pub fn fcw(&self) -> u16 {
        self.u16_at(FCW)
    }

    /// x87 status word
    pub fn fsw(&self) -> u16 {
        self.u16_at(FSW)
    }

    /// abridged x87 tag word
    pub fn ftw(&self) -> u8 {
        self.raw[FTW]
    }

    pub fn fop(&self) -> u16 {
        self.u16_at(FOP)
    }

    pub fn fip(&self) -> u64 {
        self.u64_at(FIP)
    }

    pub fn fdp(&self) -> u64 {
        self.u64_at(FDP)
    }

    pub fn mxcsr(&self) -> u32 {
        self.u32_at(MXCSR)
    }

    pub fn mxcsr_mask(&self) -> u32 {
        self.u32_at(MXCSR_MASK)
    }

    /// The 80 bit value of `st(i)`
    pub fn st(&self, i: usize) -> [u8; 10] {
        let mut out = [0u8; 10];
        let off = ST_SPACE + i * 16;
        out.copy_from_slice(&self.raw[off..off + 10]);
        out
    }

    pub fn set_st(&mut self, i: usize, value: [u8; 10]) {
        let off = ST_SPACE + i * 16;
        self.raw[off..off + 10].copy_from_slice(&value);
    }

    pub fn xmm(&self, i: usize) -> [u8; 16] {
        let mut out = [0u8; 16];
        let off = XMM_SPACE + i * 16;
        out.copy_from_slice(&self.raw[off..off + 16]);
        out
    }

    pub fn set_xmm(&mut self, i: usize, value: [u8; 16]) {
        let off = XMM_SPACE + i * 16;
        self.raw[off..off + 16].copy_from_slice(&value);
    }

    /// The state components present in the area, 0 for a plain fxsave area
    pub fn xstate_bv(&self) -> u64 {
        if self.raw.len() < XSAVE_HEADER + 8 {
            return 0;
        }
        self.u64_at(XSAVE_HEADER)
    }

    pub fn has_avx(&self) -> bool {
        self.xstate_bv() & XFEATURE_YMM != 0 && self.raw.len() >= YMM_HI_SPACE + XMM_COUNT * 16
    }

    /// The full `ymm(i)`, `None` without AVX state
    pub fn ymm(&self, i: usize) -> Option<[u8; 32]> {
        if !self.has_avx() {
            return None;
        }
        let mut out = [0u8; 32];
        out[..16].copy_from_slice(&self.xmm(i));
        let off = YMM_HI_SPACE + i * 16;
        out[16..].copy_from_slice(&self.raw[off..off + 16]);
        Some(out)
    }

    fn set_ymm_hi(&mut self, i: usize, value: [u8; 16]) {
        let off = YMM_HI_SPACE + i * 16;
        self.raw[off..off + 16].copy_from_slice(&value);
    }

    /// Names and little endian values of all registers in the area
    pub fn decode(&self) -> Vec<(String, Vec<u8>)> {
        let mut out = vec![
            ("CW".to_string(), self.fcw().to_le_bytes().to_vec()),
            ("SW".to_string(), self.fsw().to_le_bytes().to_vec()),
            ("TW".to_string(), vec![self.ftw()]),
            ("FOP".to_string(), self.fop().to_le_bytes().to_vec()),
            ("FIP".to_string(), self.fip().to_le_bytes().to_vec()),
            ("FDP".to_string(), self.fdp().to_le_bytes().to_vec()),
        ];
        for i in 0..ST_COUNT {
            out.push((format!("ST({i})"), self.st(i).to_vec()));
        }
        out.push(("MXCSR".to_string(), self.mxcsr().to_le_bytes().to_vec()));
        out.push((
            "MXCSR_MASK".to_string(),
            self.mxcsr_mask().to_le_bytes().to_vec(),
        ));
        for i in 0..XMM_COUNT {
            match self.ymm(i) {
                Some(ymm) => out.push((format!("YMM{i}"), ymm.to_vec())),
                None => out.push((format!("XMM{i}"), self.xmm(i).to_vec())),
            }
        }
        out
    }
}

// ---------------- register snapshot --------------------------------------------------------------

type XstateLoader = Arc<dyn Fn() -> Result<Xstate> + Send + Sync>;

/// Register snapshot of one thread
#[derive(Clone)]
pub struct Registers {
    regs: user_regs_struct,
    xstate: Option<Xstate>,
    loader: Option<XstateLoader>,
}

impl Debug for Registers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registers")
            .field("rip", &format_args!("{:#x}", self.regs.rip))
            .field("rsp", &format_args!("{:#x}", self.regs.rsp))
            .field("xstate_loaded", &self.xstate.is_some())
            .finish()
    }
}

fn gpr_slot(regs: &mut user_regs_struct, regnum: u16) -> Option<&mut u64> {
    Some(match regnum {
        dwarf::RAX => &mut regs.rax,
        dwarf::RDX => &mut regs.rdx,
        dwarf::RCX => &mut regs.rcx,
        dwarf::RBX => &mut regs.rbx,
        dwarf::RSI => &mut regs.rsi,
        dwarf::RDI => &mut regs.rdi,
        dwarf::RBP => &mut regs.rbp,
        dwarf::RSP => &mut regs.rsp,
        8 => &mut regs.r8,
        9 => &mut regs.r9,
        10 => &mut regs.r10,
        11 => &mut regs.r11,
        12 => &mut regs.r12,
        13 => &mut regs.r13,
        14 => &mut regs.r14,
        dwarf::R15 => &mut regs.r15,
        dwarf::RIP => &mut regs.rip,
        dwarf::RFLAGS => &mut regs.eflags,
        dwarf::ES => &mut regs.es,
        dwarf::CS => &mut regs.cs,
        dwarf::SS => &mut regs.ss,
        dwarf::DS => &mut regs.ds,
        dwarf::FS => &mut regs.fs,
        dwarf::GS => &mut regs.gs,
        dwarf::FS_BASE => &mut regs.fs_base,
        dwarf::GS_BASE => &mut regs.gs_base,
        _ => return None,
    })
}

impl Registers {
    pub(crate) fn new(regs: user_regs_struct, loader: Option<XstateLoader>) -> Self {
        Self {
            regs,
            xstate: None,
            loader,
        }
    }

    /// A snapshot with a known extended state and no loader
    pub fn with_xstate(regs: user_regs_struct, xstate: Option<Xstate>) -> Self {
        Self {
            regs,
            xstate,
            loader: None,
        }
    }

    pub fn pc(&self) -> Addr {
        Addr::from(self.regs.rip)
    }

    pub fn sp(&self) -> Addr {
        Addr::from(self.regs.rsp)
    }

    pub fn frame_pointer(&self) -> Addr {
        Addr::from(self.regs.rbp)
    }

    pub fn gpr(&self) -> &user_regs_struct {
        &self.regs
    }

    pub fn gpr_mut(&mut self) -> &mut user_regs_struct {
        &mut self.regs
    }

    /// Value of a register that fits in a machine word, by DWARF number
    pub fn get(&self, regnum: u16) -> Option<u64> {
        let mut regs = self.regs;
        gpr_slot(&mut regs, regnum).map(|v| *v)
    }

    /// The extended state, loaded from the thread on first access
    ///
    /// `None` for a snapshot that was built without extended state.
    pub fn xstate(&mut self) -> Result<Option<&Xstate>> {
        self.load_xstate()?;
        Ok(self.xstate.as_ref())
    }

    /// The extended state if it has been loaded already
    pub fn loaded_xstate(&self) -> Option<&Xstate> {
        self.xstate.as_ref()
    }

    fn load_xstate(&mut self) -> Result<()> {
        if self.xstate.is_none() {
            if let Some(loader) = &self.loader {
                trace!("loading extended register state");
                self.xstate = Some(loader()?);
            }
        }
        Ok(())
    }

    /// Changes a register in the snapshot, returns true if the extended state was changed
    pub fn set_reg(&mut self, regnum: u16, value: &RegisterValue) -> Result<bool> {
        if let Some(slot) = gpr_slot(&mut self.regs, regnum) {
            *slot = value.as_u64();
            return Ok(false);
        }

        self.load_xstate()?;
        let xstate = self
            .xstate
            .as_mut()
            .ok_or(DebuggerError::InvalidRegister(regnum))?;
        match regnum {
            dwarf::XMM0..=dwarf::XMM15 => {
                let i = (regnum - dwarf::XMM0) as usize;
                let full: [u8; 32] = value.to_bytes();
                let mut lo = [0u8; 16];
                lo.copy_from_slice(&full[..16]);
                xstate.set_xmm(i, lo);
                if matches!(value, RegisterValue::Bytes(b) if b.len() > 16) && xstate.has_avx() {
                    let mut hi = [0u8; 16];
                    hi.copy_from_slice(&full[16..]);
                    xstate.set_ymm_hi(i, hi);
                }
            }
            dwarf::ST0..=dwarf::ST7 => {
                xstate.set_st((regnum - dwarf::ST0) as usize, value.to_bytes());
            }
            dwarf::MM0..=dwarf::MM7 => {
                // mmx registers alias the mantissa of the x87 registers
                let i = (regnum - dwarf::MM0) as usize;
                let mut st = xstate.st(i);
                st[..8].copy_from_slice(&value.to_bytes::<8>());
                xstate.set_st(i, st);
            }
            _ => return Err(DebuggerError::InvalidRegister(regnum)),
        }
        Ok(true)
    }
}

// ---------------- debug registers ----------------------------------------------------------------

const DR6: usize = 6;
const DR7: usize = 7;

/// Typed view of the debug registers of one thread
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DebugRegisters {
    regs: [u64; DEBUG_REG_COUNT],
    dirty: bool,
}

impl DebugRegisters {
    pub fn from_raw(regs: [u64; DEBUG_REG_COUNT]) -> Self {
        Self {
            regs,
            dirty: false,
        }
    }

    pub fn raw(&self) -> [u64; DEBUG_REG_COUNT] {
        self.regs
    }

    /// True if a change has to be written back to the thread
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn dr6(&self) -> u64 {
        self.regs[DR6]
    }

    pub fn dr7(&self) -> u64 {
        self.regs[DR7]
    }

    pub fn addr(&self, slot: u8) -> Addr {
        Addr::from(self.regs[slot as usize])
    }

    pub fn is_enabled(&self, slot: u8) -> bool {
        self.dr7() & (1 << (2 * slot as u64)) != 0
    }

    pub fn first_free_slot(&self) -> Option<u8> {
        (0..HW_SLOTS as u8).find(|&slot| !self.is_enabled(slot))
    }

    /// Programs `slot` to trigger on `addr`
    ///
    /// Setting a slot to the breakpoint it already holds is allowed.
    pub fn set_breakpoint(&mut self, slot: u8, addr: Addr, watch: WatchType) -> Result<()> {
        if slot as usize >= HW_SLOTS {
            return Err(DebuggerError::InvalidHardwareSlot(slot));
        }
        if self.is_enabled(slot) && self.addr(slot) != addr {
            return Err(DebuggerError::HardwareSlotInUse(slot));
        }
        if addr.usize() % watch.size() as usize != 0 {
            return Err(DebuggerError::UnsupportedWatch(
                "the address must be aligned to the watched size",
            ));
        }

        let shift = 16 + 4 * slot as u64;
        let mut dr7 = self.dr7();
        dr7 &= !(0xf << shift);
        dr7 |= (watch.rw_bits() | (watch.len_bits() << 2)) << shift;
        dr7 |= 1 << (2 * slot as u64);

        self.regs[slot as usize] = addr.u64();
        self.regs[DR7] = dr7;
        self.dirty = true;
        Ok(())
    }

    /// Disables `slot`
    pub fn clear_breakpoint(&mut self, slot: u8) -> Result<()> {
        if slot as usize >= HW_SLOTS {
            return Err(DebuggerError::InvalidHardwareSlot(slot));
        }
        let shift = 16 + 4 * slot as u64;
        self.regs[DR7] &= !((0xf << shift) | (1 << (2 * slot as u64)));
        self.regs[slot as usize] = 0;
        self.dirty = true;
        Ok(())
    }

    /// The slot that triggered the last debug exception, clears the status
    pub fn active_breakpoint(&mut self) -> Option<u8> {
        let hit = (0..HW_SLOTS as u8).find(|&slot| self.dr6() & (1 << slot) != 0)?;
        self.regs[DR6] = 0;
        self.dirty = true;
        Some(hit)
    }
}

// ---------------- per thread access --------------------------------------------------------------

/// Register access for one thread, all requests run on the executor
#[derive(Debug, Clone)]
pub struct RegisterAccess {
    executor: Arc<PtraceExecutor>,
    tid: Pid,
}

impl RegisterAccess {
    pub(crate) fn new(executor: Arc<PtraceExecutor>, tid: Pid) -> Self {
        Self { executor, tid }
    }

    pub fn thread(&self) -> Pid {
        self.tid
    }

    /// Snapshot of the registers, the extended state is loaded lazily
    pub fn registers(&self) -> Result<Registers> {
        let tid = self.tid;
        let regs = self.executor.run(move || sys::getregs(tid))??;
        let executor = self.executor.clone();
        let loader: XstateLoader =
            Arc::new(move || Xstate::from_raw(executor.run(move || sys::get_xstate(tid))??));
        Ok(Registers::new(regs, Some(loader)))
    }

    pub fn pc(&self) -> Result<Addr> {
        Ok(self.registers()?.pc())
    }

    pub fn set_pc(&self, pc: Addr) -> Result<()> {
        let tid = self.tid;
        self.executor.run(move || {
            let mut regs = sys::getregs(tid)?;
            regs.rip = pc.u64();
            sys::setregs(tid, regs)
        })?
    }

    /// Changes one register, by DWARF number
    pub fn set_register(&self, regnum: u16, value: RegisterValue) -> Result<()> {
        let mut regs = self.registers()?;
        let xstate_changed = regs.set_reg(regnum, &value)?;
        let gpr = *regs.gpr();
        let xstate = if xstate_changed {
            regs.loaded_xstate().map(|x| x.raw().to_vec())
        } else {
            None
        };
        let tid = self.tid;
        self.executor.run(move || {
            sys::setregs(tid, gpr)?;
            if let Some(xstate) = xstate {
                sys::set_xstate(tid, &xstate)?;
            }
            Ok(())
        })?
    }

    /// Writes a snapshot back to the thread
    ///
    /// `fs_base` and `gs_base` keep their current value. The extended state is only written if it
    /// was loaded in the snapshot.
    pub fn restore_registers(&self, saved: &Registers) -> Result<()> {
        let tid = self.tid;
        let mut gpr = *saved.gpr();
        let xstate = saved.loaded_xstate().map(|x| x.raw().to_vec());
        self.executor.run(move || {
            let current = sys::getregs(tid)?;
            gpr.fs_base = current.fs_base;
            gpr.gs_base = current.gs_base;
            sys::setregs(tid, gpr)?;
            if let Some(xstate) = xstate {
                sys::set_xstate(tid, &xstate)?;
            }
            Ok(())
        })?
    }

    /// Reads the debug registers, lets `f` change them and writes them back if it did
    ///
    /// A thread that vanished in the meantime is not an error, `T::default()` is returned
    /// instead.
    pub fn with_debug_registers<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut DebugRegisters) -> Result<T> + Send + 'static,
        T: Default + Send + 'static,
    {
        let tid = self.tid;
        let r = self.executor.run(move || {
            let mut raw = [0u64; DEBUG_REG_COUNT];
            for (i, reg) in raw.iter_mut().enumerate() {
                if is_reserved_debug_reg(i) {
                    continue;
                }
                *reg = sys::peek_user(tid, debug_reg_offset(i))? as u64;
            }

            let mut drs = DebugRegisters::from_raw(raw);
            let out = f(&mut drs)?;

            if drs.is_dirty() {
                for (i, reg) in drs.raw().iter().enumerate() {
                    if is_reserved_debug_reg(i) {
                        continue;
                    }
                    sys::poke_user(tid, debug_reg_offset(i), *reg as i64)?;
                }
                trace!("wrote debug registers of {tid}: dr7={:#x}", drs.dr7());
            }
            Ok(out)
        })?;

        match r {
            Err(DebuggerError::Os(Errno::ESRCH)) => Ok(T::default()),
            other => other,
        }
    }
}

/// DR4 and DR5 are aliases the kernel refuses to access
fn is_reserved_debug_reg(i: usize) -> bool {
    i == 4 || i == 5
}

fn debug_reg_offset(i: usize) -> usize {
    DEBUG_REG_USER_OFFSET + i * WORD_BYTES
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::breakpoint::WatchKind;

    fn zeroed_regs() -> user_regs_struct {
        // SAFETY: user_regs_struct is plain integers
        unsafe { std::mem::zeroed() }
    }

    fn fxsave_area() -> Vec<u8> {
        let mut raw = vec![0u8; FXSAVE_SIZE];
        raw[FCW..FCW + 2].copy_from_slice(&0x037fu16.to_le_bytes());
        raw[MXCSR..MXCSR + 4].copy_from_slice(&0x1f80u32.to_le_bytes());
        for i in 0..XMM_COUNT {
            let off = XMM_SPACE + i * 16;
            raw[off..off + 16].fill(i as u8);
        }
        raw
    }

    #[test]
    fn test_xstate_decode_fxsave() {
        let x = Xstate::from_raw(fxsave_area()).unwrap();
        assert_eq!(x.fcw(), 0x037f);
        assert_eq!(x.mxcsr(), 0x1f80);
        assert_eq!(x.xstate_bv(), 0);
        assert!(!x.has_avx());
        assert_eq!(x.xmm(3), [3u8; 16]);
        assert_eq!(x.ymm(3), None);

        let decoded = x.decode();
        assert_eq!(decoded[0], ("CW".to_string(), vec![0x7f, 0x03]));
        assert!(decoded.iter().any(|(n, v)| n == "XMM15" && v == &vec![15u8; 16]));
        assert!(decoded.iter().any(|(n, _)| n == "ST(7)"));
    }

    #[test]
    fn test_xstate_decode_avx() {
        let mut raw = fxsave_area();
        raw.resize(YMM_HI_SPACE + XMM_COUNT * 16, 0);
        raw[XSAVE_HEADER..XSAVE_HEADER + 8].copy_from_slice(&(0b111u64).to_le_bytes());
        for i in 0..XMM_COUNT {
            let off = YMM_HI_SPACE + i * 16;
            raw[off..off + 16].fill(0x80 | i as u8);
        }
        let x = Xstate::from_raw(raw).unwrap();
        assert!(x.has_avx());
        let ymm = x.ymm(2).unwrap();
        assert_eq!(&ymm[..16], &[2u8; 16]);
        assert_eq!(&ymm[16..], &[0x82u8; 16]);
        assert!(x.decode().iter().any(|(n, v)| n == "YMM0" && v.len() == 32));
    }

    #[test]
    fn test_xstate_too_short() {
        assert!(matches!(
            Xstate::from_raw(vec![0; 100]),
            Err(DebuggerError::XstateTooShort(100))
        ));
    }

    #[test]
    fn test_set_gpr() {
        let mut regs = Registers::with_xstate(zeroed_regs(), None);
        assert!(!regs.set_reg(dwarf::RIP, &0x401000u64.into()).unwrap());
        assert!(!regs.set_reg(dwarf::RDX, &7u64.into()).unwrap());
        assert!(!regs.set_reg(12, &RegisterValue::Bytes(vec![1, 2])).unwrap());
        assert_eq!(regs.pc(), Addr::from(0x401000usize));
        assert_eq!(regs.gpr().rdx, 7);
        assert_eq!(regs.get(12), Some(0x0201));
        assert_eq!(regs.get(dwarf::FS_BASE), Some(0));
        assert_eq!(regs.get(100), None);
    }

    #[test]
    fn test_set_vector_register() {
        let xstate = Xstate::from_raw(fxsave_area()).unwrap();
        let mut regs = Registers::with_xstate(zeroed_regs(), Some(xstate));
        assert!(regs
            .set_reg(dwarf::XMM0 + 1, &RegisterValue::Bytes(vec![0xab; 16]))
            .unwrap());
        assert!(regs
            .set_reg(dwarf::ST0, &RegisterValue::Bytes(vec![0x11; 10]))
            .unwrap());
        assert!(regs.set_reg(dwarf::MM0 + 1, &0x2222u64.into()).unwrap());
        let x = regs.loaded_xstate().unwrap();
        assert_eq!(x.xmm(1), [0xab; 16]);
        assert_eq!(x.st(0), [0x11; 10]);
        assert_eq!(&x.st(1)[..2], &[0x22, 0x22]);
    }

    #[test]
    fn test_invalid_register() {
        let mut regs = Registers::with_xstate(zeroed_regs(), None);
        assert!(matches!(
            regs.set_reg(dwarf::XMM0, &1u64.into()),
            Err(DebuggerError::InvalidRegister(17))
        ));
        let mut regs =
            Registers::with_xstate(zeroed_regs(), Some(Xstate::from_raw(fxsave_area()).unwrap()));
        assert!(matches!(
            regs.set_reg(57, &1u64.into()),
            Err(DebuggerError::InvalidRegister(57))
        ));
    }

    #[test]
    fn test_lazy_loader_called_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let loader: XstateLoader = Arc::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
            Xstate::from_raw(fxsave_area())
        });
        let mut regs = Registers::new(zeroed_regs(), Some(loader));
        assert!(regs.loaded_xstate().is_none());
        assert_eq!(regs.xstate().unwrap().unwrap().fcw(), 0x037f);
        regs.xstate().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dr7_layout() {
        let mut drs = DebugRegisters::default();
        let watch = WatchType::new(WatchKind::Write, 4).unwrap();
        drs.set_breakpoint(1, Addr::from(0x1000usize), watch).unwrap();
        assert!(drs.is_dirty());
        assert_eq!(drs.addr(1), Addr::from(0x1000usize));
        // L1 enable, RW1 = 01 (write), LEN1 = 11 (4 bytes)
        assert_eq!(drs.dr7(), (1 << 2) | (0b1101 << 20));
        assert!(drs.is_enabled(1));
        assert_eq!(drs.first_free_slot(), Some(0));

        let exec = WatchType::execute();
        drs.set_breakpoint(0, Addr::from(0x401003usize), exec).unwrap();
        assert_eq!(drs.dr7() & 0xf0001, 1);

        let rw8 = WatchType::new(WatchKind::ReadWrite, 8).unwrap();
        drs.set_breakpoint(3, Addr::from(0x2000usize), rw8).unwrap();
        // RW3 = 11, LEN3 = 10 (8 bytes)
        assert_eq!((drs.dr7() >> 28) & 0xf, 0b1011);

        drs.clear_breakpoint(1).unwrap();
        assert!(!drs.is_enabled(1));
        assert_eq!((drs.dr7() >> 20) & 0xf, 0);
        assert_eq!(drs.addr(1), Addr::NULL);
        assert_eq!(drs.first_free_slot(), Some(1));
    }

    #[test]
    fn test_dr_slot_errors() {
        let mut drs = DebugRegisters::default();
        let w = WatchType::new(WatchKind::Write, 8).unwrap();
        drs.set_breakpoint(0, Addr::from(0x1000usize), w).unwrap();
        // reprogramming the same address is fine
        drs.set_breakpoint(0, Addr::from(0x1000usize), w).unwrap();
        assert!(matches!(
            drs.set_breakpoint(0, Addr::from(0x2000usize), w),
            Err(DebuggerError::HardwareSlotInUse(0))
        ));
        assert!(matches!(
            drs.set_breakpoint(4, Addr::from(0x2000usize), w),
            Err(DebuggerError::InvalidHardwareSlot(4))
        ));
        assert!(matches!(
            drs.set_breakpoint(1, Addr::from(0x2004usize), w),
            Err(DebuggerError::UnsupportedWatch(_))
        ));
    }

    #[test]
    fn test_active_breakpoint() {
        let mut raw = [0u64; DEBUG_REG_COUNT];
        raw[DR6] = 0b0100;
        let mut drs = DebugRegisters::from_raw(raw);
        assert!(!drs.is_dirty());
        assert_eq!(drs.active_breakpoint(), Some(2));
        assert_eq!(drs.dr6(), 0);
        assert!(drs.is_dirty());
        assert_eq!(drs.active_breakpoint(), None);
    }

    #[test]
    fn test_register_value_bytes() {
        assert_eq!(RegisterValue::Uint(0x0102).to_bytes::<4>(), [2, 1, 0, 0]);
        assert_eq!(RegisterValue::Bytes(vec![1; 20]).to_bytes::<16>(), [1; 16]);
        assert_eq!(RegisterValue::Bytes(vec![0xff, 0x01]).as_u64(), 0x01ff);
    }
}
