//! # Breakpoints
//!
//! The table of armed breakpoints of a process.
//!
//! A software breakpoint replaces the code at its address with the trap instruction of the
//! architecture and keeps the original bytes to restore them. A hardware breakpoint occupies one
//! of the debug register slots and is programmed on every thread; it can also watch data for
//! writes or accesses. Every address is in the table at most once, and an entry only leaves the
//! table after it has been disarmed in the target.
//!
//! The table does not talk to the process itself. It arms and disarms through a
//! [`BreakpointTarget`], which the [`ProcessHandle`](crate::process::ProcessHandle) implements on
//! top of its memory and register access.

use std::collections::HashMap;

use serde::Serialize;
use tracing::{trace, warn};

use crate::addr::Addr;
use crate::arch::{Arch, NativeArch, HW_SLOTS};
use crate::errors::{DebuggerError, Result};

/// What a hardware slot reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum WatchKind {
    /// Executing the instruction at the address
    Execute,
    /// Reading the data, not supported by x86
    Read,
    Write,
    ReadWrite,
}

/// Condition and width of a hardware breakpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct WatchType {
    kind: WatchKind,
    size: u8,
}

impl WatchType {
    /// # Errors
    ///
    /// [`DebuggerError::UnsupportedWatch`] for read-only watches, for sizes other than 1, 2, 4
    /// and 8 and for execution breakpoints wider than one byte.
    pub fn new(kind: WatchKind, size: u8) -> Result<Self> {
        if kind == WatchKind::Read {
            return Err(DebuggerError::UnsupportedWatch(
                "x86 can not watch for reads only, watch for reads and writes instead",
            ));
        }
        if !matches!(size, 1 | 2 | 4 | 8) {
            return Err(DebuggerError::UnsupportedWatch(
                "the watched size must be 1, 2, 4 or 8 bytes",
            ));
        }
        if kind == WatchKind::Execute && size != 1 {
            return Err(DebuggerError::UnsupportedWatch(
                "execution breakpoints are one byte wide",
            ));
        }
        Ok(Self { kind, size })
    }

    /// A hardware breakpoint on code
    pub fn execute() -> Self {
        Self {
            kind: WatchKind::Execute,
            size: 1,
        }
    }

    pub fn kind(&self) -> WatchKind {
        self.kind
    }

    pub fn size(&self) -> u8 {
        self.size
    }

    /// True for watchpoints, false for hardware breakpoints on code
    pub fn is_data_watch(&self) -> bool {
        self.kind != WatchKind::Execute
    }

    /// The RW field of DR7
    pub(crate) fn rw_bits(&self) -> u64 {
        match self.kind {
            WatchKind::Execute => 0b00,
            WatchKind::Write => 0b01,
            WatchKind::Read | WatchKind::ReadWrite => 0b11,
        }
    }

    /// The LEN field of DR7
    pub(crate) fn len_bits(&self) -> u64 {
        match self.size {
            2 => 0b01,
            4 => 0b11,
            8 => 0b10,
            _ => 0b00,
        }
    }
}

/// How a breakpoint is armed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum BreakpointKind {
    /// Trap instruction in the code, with the bytes it replaced
    Software { orig: Vec<u8> },
    /// Debug register slot
    Hardware { watch: WatchType, slot: u8 },
}

/// What kind of breakpoint to arm
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointRequest {
    Software,
    /// `slot: None` takes the first free slot
    Hardware { watch: WatchType, slot: Option<u8> },
}

/// An armed breakpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Breakpoint {
    addr: Addr,
    logical_id: Option<u32>,
    kind: BreakpointKind,
}

impl Breakpoint {
    pub fn addr(&self) -> Addr {
        self.addr
    }

    /// The user level breakpoint this address belongs to
    pub fn logical_id(&self) -> Option<u32> {
        self.logical_id
    }

    pub fn kind(&self) -> &BreakpointKind {
        &self.kind
    }

    pub fn is_hardware(&self) -> bool {
        matches!(self.kind, BreakpointKind::Hardware { .. })
    }

    pub fn watch(&self) -> Option<WatchType> {
        match self.kind {
            BreakpointKind::Hardware { watch, .. } => Some(watch),
            BreakpointKind::Software { .. } => None,
        }
    }

    pub fn slot(&self) -> Option<u8> {
        match self.kind {
            BreakpointKind::Hardware { slot, .. } => Some(slot),
            BreakpointKind::Software { .. } => None,
        }
    }

    /// The code the trap instruction replaced
    pub fn original(&self) -> Option<&[u8]> {
        match &self.kind {
            BreakpointKind::Software { orig } => Some(orig),
            BreakpointKind::Hardware { .. } => None,
        }
    }
}

/// Arms and disarms breakpoints in a process
pub trait BreakpointTarget {
    fn read_memory(&self, addr: Addr, len: usize) -> Result<Vec<u8>>;
    fn write_memory(&self, addr: Addr, data: &[u8]) -> Result<()>;
    /// Programs `slot` on every thread of the process
    fn write_hardware(&self, slot: u8, addr: Addr, watch: WatchType) -> Result<()>;
    /// Clears `slot` on every thread of the process
    fn clear_hardware(&self, slot: u8) -> Result<()>;
}

/// All breakpoints of a process, by address
#[derive(Debug, Clone, Default)]
pub struct BreakpointTable {
    map: HashMap<Addr, Breakpoint>,
    hw_slots: [Option<Addr>; HW_SLOTS],
}

impl BreakpointTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms a breakpoint at `addr` and adds it to the table
    ///
    /// # Errors
    ///
    /// * [`DebuggerError::BreakpointExists`] if there is a breakpoint at `addr` already
    /// * [`DebuggerError::NoFreeHardwareSlot`], [`DebuggerError::HardwareSlotInUse`] or
    ///   [`DebuggerError::InvalidHardwareSlot`] if no slot can be used
    /// * [`DebuggerError::UnsupportedWatch`] if `addr` is not aligned to the watched size
    /// * [`DebuggerError::BreakpointWriteFailed`] if the target refused the change
    pub fn install(
        &mut self,
        addr: Addr,
        logical_id: Option<u32>,
        request: BreakpointRequest,
        target: &impl BreakpointTarget,
    ) -> Result<&Breakpoint> {
        if self.map.contains_key(&addr) {
            return Err(DebuggerError::BreakpointExists(addr));
        }

        let kind = match request {
            BreakpointRequest::Software => {
                let size = NativeArch::BREAKPOINT_SIZE;
                let orig = target
                    .read_memory(addr, size)
                    .map_err(|e| DebuggerError::write_failed(addr, e))?;
                if orig.len() < size {
                    return Err(DebuggerError::write_failed(
                        addr,
                        DebuggerError::Os(nix::Error::EIO),
                    ));
                }
                target
                    .write_memory(addr, NativeArch::BREAKPOINT_INSTRUCTION)
                    .map_err(|e| DebuggerError::write_failed(addr, e))?;
                BreakpointKind::Software { orig }
            }
            BreakpointRequest::Hardware { watch, slot } => {
                if addr.usize() % watch.size() as usize != 0 {
                    return Err(DebuggerError::UnsupportedWatch(
                        "the address must be aligned to the watched size",
                    ));
                }
                let slot = self.pick_slot(slot)?;
                if let Err(e) = target.write_hardware(slot, addr, watch) {
                    // some threads may already have the slot programmed
                    if let Err(undo) = target.clear_hardware(slot) {
                        warn!("could not roll back hardware slot {slot}: {undo}");
                    }
                    return Err(DebuggerError::write_failed(addr, e));
                }
                self.hw_slots[slot as usize] = Some(addr);
                BreakpointKind::Hardware { watch, slot }
            }
        };

        trace!("armed breakpoint at {addr}: {kind:?}");
        Ok(&*self.map.entry(addr).or_insert(Breakpoint {
            addr,
            logical_id,
            kind,
        }))
    }

    fn pick_slot(&self, requested: Option<u8>) -> Result<u8> {
        match requested {
            Some(slot) if slot as usize >= HW_SLOTS => Err(DebuggerError::InvalidHardwareSlot(slot)),
            Some(slot) if self.hw_slots[slot as usize].is_some() => {
                Err(DebuggerError::HardwareSlotInUse(slot))
            }
            Some(slot) => Ok(slot),
            None => self
                .hw_slots
                .iter()
                .position(Option::is_none)
                .map(|i| i as u8)
                .ok_or(DebuggerError::NoFreeHardwareSlot),
        }
    }

    /// Disarms the breakpoint at `addr` and removes it from the table
    ///
    /// # Errors
    ///
    /// * [`DebuggerError::NoSuchBreakpoint`] if there is no breakpoint at `addr`
    /// * [`DebuggerError::BreakpointEraseFailed`] if the target refused the change, the breakpoint
    ///   then stays in the table
    pub fn remove(&mut self, addr: Addr, target: &impl BreakpointTarget) -> Result<Breakpoint> {
        let bp = self
            .map
            .get(&addr)
            .ok_or(DebuggerError::NoSuchBreakpoint(addr))?;

        match &bp.kind {
            BreakpointKind::Software { orig } => target
                .write_memory(addr, orig)
                .map_err(|e| DebuggerError::erase_failed(addr, e))?,
            BreakpointKind::Hardware { slot, .. } => {
                target
                    .clear_hardware(*slot)
                    .map_err(|e| DebuggerError::erase_failed(addr, e))?;
                self.hw_slots[*slot as usize] = None;
            }
        }

        trace!("disarmed breakpoint at {addr}");
        self.map
            .remove(&addr)
            .ok_or(DebuggerError::NoSuchBreakpoint(addr))
    }

    /// Disarms every breakpoint, stops at the first failure
    pub fn remove_all(&mut self, target: &impl BreakpointTarget) -> Result<()> {
        let addrs: Vec<Addr> = self.map.keys().copied().collect();
        for addr in addrs {
            self.remove(addr, target)?;
        }
        Ok(())
    }

    /// Drops all entries without touching the target, for a process that is gone
    pub(crate) fn forget_all(&mut self) {
        self.map.clear();
        self.hw_slots = [None; HW_SLOTS];
    }

    /// The breakpoint a thread with program counter `pc` is stopped at
    ///
    /// An exact match wins. With `adjust_pc`, on architectures where the trap leaves the program
    /// counter after the trap instruction, a software breakpoint just before `pc` also matches;
    /// the returned flag tells that the program counter has to be rewound to the breakpoint.
    pub fn find(&self, pc: Addr, adjust_pc: bool) -> Option<(&Breakpoint, bool)> {
        if let Some(bp) = self.map.get(&pc) {
            return Some((bp, false));
        }
        if adjust_pc && NativeArch::BREAK_INSTR_MOVES_PC {
            let before = pc.checked_sub(NativeArch::BREAKPOINT_SIZE)?;
            if let Some(bp) = self.map.get(&before) {
                if !bp.is_hardware() {
                    return Some((bp, true));
                }
            }
        }
        None
    }

    pub fn get(&self, addr: Addr) -> Option<&Breakpoint> {
        self.map.get(&addr)
    }

    pub fn contains(&self, addr: Addr) -> bool {
        self.map.contains_key(&addr)
    }

    /// The hardware breakpoint programmed into `slot`
    pub fn find_by_slot(&self, slot: u8) -> Option<&Breakpoint> {
        let addr = (*self.hw_slots.get(slot as usize)?)?;
        self.map.get(&addr)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Breakpoint> {
        self.map.values()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn has_hardware(&self) -> bool {
        self.hw_slots.iter().any(Option::is_some)
    }

    /// All addresses of one user level breakpoint
    pub fn by_logical_id(&self, id: u32) -> impl Iterator<Item = &Breakpoint> {
        self.map
            .values()
            .filter(move |bp| bp.logical_id == Some(id))
    }

    /// Replaces trap instructions in `data`, read from the target at `addr`, with the original
    /// code
    pub fn original_bytes(&self, addr: Addr, data: &mut [u8]) {
        let end = addr + data.len();
        for bp in self.map.values() {
            let Some(orig) = bp.original() else {
                continue;
            };
            for (i, byte) in orig.iter().enumerate() {
                let at = bp.addr + i;
                if at >= addr && at < end {
                    data[at - addr] = *byte;
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::cell::RefCell;
    use std::collections::BTreeMap;

    use super::*;

    #[derive(Default)]
    struct FakeTarget {
        memory: RefCell<BTreeMap<usize, u8>>,
        slots: RefCell<[Option<(Addr, WatchType)>; HW_SLOTS]>,
        fail_writes: bool,
    }

    impl FakeTarget {
        fn with_code(start: usize, code: &[u8]) -> Self {
            let t = Self::default();
            for (i, b) in code.iter().enumerate() {
                t.memory.borrow_mut().insert(start + i, *b);
            }
            t
        }

        fn byte(&self, addr: usize) -> u8 {
            self.memory.borrow()[&addr]
        }
    }

    impl BreakpointTarget for FakeTarget {
        fn read_memory(&self, addr: Addr, len: usize) -> Result<Vec<u8>> {
            let mem = self.memory.borrow();
            (0..len)
                .map(|i| {
                    mem.get(&(addr.usize() + i))
                        .copied()
                        .ok_or(DebuggerError::Os(nix::Error::EFAULT))
                })
                .collect()
        }

        fn write_memory(&self, addr: Addr, data: &[u8]) -> Result<()> {
            if self.fail_writes {
                return Err(DebuggerError::Os(nix::Error::EPERM));
            }
            let mut mem = self.memory.borrow_mut();
            for (i, b) in data.iter().enumerate() {
                mem.insert(addr.usize() + i, *b);
            }
            Ok(())
        }

        fn write_hardware(&self, slot: u8, addr: Addr, watch: WatchType) -> Result<()> {
            self.slots.borrow_mut()[slot as usize] = Some((addr, watch));
            Ok(())
        }

        fn clear_hardware(&self, slot: u8) -> Result<()> {
            self.slots.borrow_mut()[slot as usize] = None;
            Ok(())
        }
    }

    fn addr(a: usize) -> Addr {
        Addr::from(a)
    }

    #[test]
    fn test_watch_type_validation() {
        assert!(matches!(
            WatchType::new(WatchKind::Read, 4),
            Err(DebuggerError::UnsupportedWatch(_))
        ));
        assert!(WatchType::new(WatchKind::Write, 3).is_err());
        assert!(WatchType::new(WatchKind::Execute, 4).is_err());
        let w = WatchType::new(WatchKind::ReadWrite, 8).unwrap();
        assert!(w.is_data_watch());
        assert_eq!((w.rw_bits(), w.len_bits()), (0b11, 0b10));
        assert!(!WatchType::execute().is_data_watch());
    }

    #[test]
    fn test_software_install_and_remove() {
        let target = FakeTarget::with_code(0x1000, &[0x55, 0x48, 0x89, 0xe5]);
        let mut table = BreakpointTable::new();

        let bp = table
            .install(addr(0x1001), Some(3), BreakpointRequest::Software, &target)
            .unwrap();
        assert_eq!(bp.original(), Some(&[0x48u8][..]));
        assert_eq!(bp.logical_id(), Some(3));
        assert_eq!(target.byte(0x1001), 0xcc);
        assert_eq!(target.byte(0x1000), 0x55);
        assert_eq!(table.len(), 1);

        let removed = table.remove(addr(0x1001), &target).unwrap();
        assert_eq!(removed.addr(), addr(0x1001));
        assert_eq!(target.byte(0x1001), 0x48);
        assert!(table.is_empty());
    }

    #[test]
    fn test_duplicate_and_missing() {
        let target = FakeTarget::with_code(0x1000, &[0x90; 4]);
        let mut table = BreakpointTable::new();
        table
            .install(addr(0x1000), None, BreakpointRequest::Software, &target)
            .unwrap();
        assert!(matches!(
            table.install(addr(0x1000), None, BreakpointRequest::Software, &target),
            Err(DebuggerError::BreakpointExists(_))
        ));
        // the original bytes are still the real code, not the trap
        assert_eq!(table.get(addr(0x1000)).unwrap().original(), Some(&[0x90u8][..]));
        assert!(matches!(
            table.remove(addr(0x2000), &target),
            Err(DebuggerError::NoSuchBreakpoint(_))
        ));
    }

    #[test]
    fn test_write_failure() {
        let mut target = FakeTarget::with_code(0x1000, &[0x90; 4]);
        target.fail_writes = true;
        let mut table = BreakpointTable::new();
        assert!(matches!(
            table.install(addr(0x1000), None, BreakpointRequest::Software, &target),
            Err(DebuggerError::BreakpointWriteFailed { .. })
        ));
        assert!(table.is_empty());
        // unmapped memory
        assert!(matches!(
            table.install(addr(0x9000), None, BreakpointRequest::Software, &target),
            Err(DebuggerError::BreakpointWriteFailed { .. })
        ));
    }

    #[test]
    fn test_hardware_slots() {
        let target = FakeTarget::default();
        let mut table = BreakpointTable::new();
        let w = WatchType::new(WatchKind::Write, 8).unwrap();
        for i in 0..HW_SLOTS {
            let bp = table
                .install(
                    addr(0x4000 + i * 8),
                    None,
                    BreakpointRequest::Hardware { watch: w, slot: None },
                    &target,
                )
                .unwrap();
            assert_eq!(bp.slot(), Some(i as u8));
        }
        assert!(table.has_hardware());
        assert!(matches!(
            table.install(
                addr(0x5000),
                None,
                BreakpointRequest::Hardware { watch: w, slot: None },
                &target
            ),
            Err(DebuggerError::NoFreeHardwareSlot)
        ));
        assert_eq!(table.find_by_slot(2).unwrap().addr(), addr(0x4010));
        assert_eq!(target.slots.borrow()[2], Some((addr(0x4010), w)));

        table.remove(addr(0x4010), &target).unwrap();
        assert!(table.find_by_slot(2).is_none());
        assert_eq!(target.slots.borrow()[2], None);

        assert!(matches!(
            table.install(
                addr(0x5000),
                None,
                BreakpointRequest::Hardware { watch: w, slot: Some(1) },
                &target
            ),
            Err(DebuggerError::HardwareSlotInUse(1))
        ));
        let bp = table
            .install(
                addr(0x5000),
                None,
                BreakpointRequest::Hardware { watch: w, slot: Some(2) },
                &target,
            )
            .unwrap();
        assert_eq!(bp.slot(), Some(2));
        assert!(matches!(
            table.install(
                addr(0x6004),
                None,
                BreakpointRequest::Hardware { watch: w, slot: None },
                &target
            ),
            Err(DebuggerError::UnsupportedWatch(_))
        ));
    }

    #[test]
    fn test_find_prefers_exact_match() {
        let target = FakeTarget::with_code(0x1000, &[0x90; 8]);
        let mut table = BreakpointTable::new();
        table
            .install(addr(0x1003), None, BreakpointRequest::Software, &target)
            .unwrap();
        table
            .install(addr(0x1004), None, BreakpointRequest::Software, &target)
            .unwrap();

        let (bp, rewind) = table.find(addr(0x1004), true).unwrap();
        assert_eq!(bp.addr(), addr(0x1004));
        assert!(!rewind);

        let (bp, rewind) = table.find(addr(0x1005), true).unwrap();
        assert_eq!(bp.addr(), addr(0x1004));
        assert!(rewind);

        assert!(table.find(addr(0x1005), false).is_none());
        assert!(table.find(Addr::NULL, true).is_none());
    }

    #[test]
    fn test_logical_ids_and_original_bytes() {
        let target = FakeTarget::with_code(0x1000, &[1, 2, 3, 4, 5, 6]);
        let mut table = BreakpointTable::new();
        for a in [0x1001, 0x1004] {
            table
                .install(addr(a), Some(7), BreakpointRequest::Software, &target)
                .unwrap();
        }
        table
            .install(addr(0x1005), Some(8), BreakpointRequest::Software, &target)
            .unwrap();
        assert_eq!(table.by_logical_id(7).count(), 2);
        assert_eq!(table.by_logical_id(9).count(), 0);

        let mut data = target.read_memory(addr(0x1000), 5).unwrap();
        assert_eq!(data, [1, 0xcc, 3, 4, 0xcc]);
        table.original_bytes(addr(0x1000), &mut data);
        assert_eq!(data, [1, 2, 3, 4, 5]);

        table.remove_all(&target).unwrap();
        assert!(table.is_empty());
        assert_eq!(target.read_memory(addr(0x1000), 6).unwrap(), [1, 2, 3, 4, 5, 6]);
    }
}
