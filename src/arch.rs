//! Architecture facts the process-control core needs from the binary layer.
//!
//! Only the breakpoint instruction and its effect on the program counter are needed; nothing in
//! this crate parses a binary. The architecture is selected at build time.

/// Description of a target architecture
pub trait Arch {
    /// Name used in diagnostics
    const NAME: &'static str;
    /// The trap instruction written over the original code by a software breakpoint
    const BREAKPOINT_INSTRUCTION: &'static [u8];
    /// Length of [`Arch::BREAKPOINT_INSTRUCTION`] in bytes
    const BREAKPOINT_SIZE: usize = Self::BREAKPOINT_INSTRUCTION.len();
    /// Whether executing the trap leaves the program counter after the trap instruction
    const BREAK_INSTR_MOVES_PC: bool;
    /// Number of hardware breakpoint/watchpoint slots
    const HW_BREAKPOINT_SLOTS: usize;
}

/// x86-64
#[derive(Debug, Clone, Copy)]
pub struct Amd64;

impl Arch for Amd64 {
    const NAME: &'static str = "amd64";
    const BREAKPOINT_INSTRUCTION: &'static [u8] = &[0xcc]; // int3
    const BREAK_INSTR_MOVES_PC: bool = true;
    const HW_BREAKPOINT_SLOTS: usize = 4;
}

/// The architecture this crate was built for
#[cfg(target_arch = "x86_64")]
pub type NativeArch = Amd64;

/// Number of hardware slots of the native architecture
pub const HW_SLOTS: usize = <NativeArch as Arch>::HW_BREAKPOINT_SLOTS;
