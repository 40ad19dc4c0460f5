//! Kernel constants that are not exported by nix or the libc bindings.
//!
//! si_codes: <https://elixir.bootlin.com/linux/v6.13.1/source/include/uapi/asm-generic/siginfo.h#L227>

/// Sent by the kernel, an `int3` on x86
pub const SI_KERNEL: i32 = 0x80;

/// `SIGTRAP` si_code of a breakpoint instruction on architectures that report it
pub const TRAP_BRKPT: i32 = 0x1;

// ---------------- register sets ------------------------------------------------------------------

/// `PTRACE_GETREGSET` note type of the xsave area
pub const NT_X86_XSTATE: i32 = 0x202;

/// Upper bound for the xsave area the kernel hands out
pub const XSTATE_MAX_SIZE: usize = 4096;

/// Size of the legacy fxsave area (`user_fpregs_struct`)
pub const FXSAVE_SIZE: usize = 512;

/// Offset of the first debug register in `struct user`, see arch/x86/kernel/ptrace.c
pub const DEBUG_REG_USER_OFFSET: usize = 848;

/// Number of debug registers in `struct user`
pub const DEBUG_REG_COUNT: usize = 8;
