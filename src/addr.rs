//! Virtual addresses in the address space of the traced process.

use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

use nix::sys::ptrace::AddressType;
use serde::{Serialize, Serializer};

use crate::WORD_BYTES;

/// Size of a memory page on the supported targets
pub const PAGE_SIZE: usize = 4096;

/// An address in the tracee, never dereferenced by the debugger itself
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Addr(usize);

impl Addr {
    pub const NULL: Addr = Addr(0);

    #[inline]
    pub const fn usize(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn u64(self) -> u64 {
        self.0 as u64
    }

    /// The address in the form the ptrace requests take it
    pub fn as_ptr(self) -> AddressType {
        self.0 as AddressType
    }

    /// Start of the machine word this address falls in
    pub fn align_down(self) -> Addr {
        Addr(self.0 & !(WORD_BYTES - 1))
    }

    pub fn word_offset(self) -> usize {
        self.0 & (WORD_BYTES - 1)
    }

    /// Start of the page this address falls in
    pub fn page(self) -> Addr {
        Addr(self.0 & !(PAGE_SIZE - 1))
    }

    pub fn checked_sub(self, bytes: usize) -> Option<Addr> {
        self.0.checked_sub(bytes).map(Addr)
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

impl fmt::Debug for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::LowerHex for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl Serialize for Addr {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.u64())
    }
}

// Offsets are plain byte counts, the distance between two addresses is one as well.

impl Add<usize> for Addr {
    type Output = Addr;
    fn add(self, bytes: usize) -> Addr {
        Addr(self.0 + bytes)
    }
}

impl AddAssign<usize> for Addr {
    fn add_assign(&mut self, bytes: usize) {
        self.0 += bytes;
    }
}

impl Sub<usize> for Addr {
    type Output = Addr;
    fn sub(self, bytes: usize) -> Addr {
        Addr(self.0 - bytes)
    }
}

impl SubAssign<usize> for Addr {
    fn sub_assign(&mut self, bytes: usize) {
        self.0 -= bytes;
    }
}

impl Sub for Addr {
    type Output = usize;
    fn sub(self, base: Addr) -> usize {
        self.0 - base.0
    }
}

impl From<usize> for Addr {
    fn from(value: usize) -> Self {
        Addr(value)
    }
}

impl From<u64> for Addr {
    fn from(value: u64) -> Self {
        Addr(value as usize)
    }
}

impl From<AddressType> for Addr {
    fn from(ptr: AddressType) -> Self {
        Addr(ptr as usize)
    }
}

impl From<Addr> for u64 {
    fn from(addr: Addr) -> Self {
        addr.u64()
    }
}

impl From<Addr> for AddressType {
    fn from(addr: Addr) -> Self {
        addr.as_ptr()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_offsets() {
        let a = Addr::from(0x1000usize);
        assert_eq!(a + 8, Addr::from(0x1008usize));
        assert_eq!((a + 8) - a, 8);
        assert_eq!(a - 1usize, Addr::from(0xfffusize));
        let mut b = a;
        b += 0x10;
        b -= 0x8;
        assert_eq!(b.usize(), 0x1008);
        assert_eq!(Addr::NULL.checked_sub(1), None);
        assert_eq!(a.checked_sub(0x1000), Some(Addr::NULL));
    }

    #[test]
    fn test_alignment() {
        let a = Addr::from(0x401003usize);
        assert_eq!(a.align_down(), Addr::from(0x401000usize));
        assert_eq!(a.word_offset(), 3);
        assert_eq!(Addr::from(0x401008usize).word_offset(), 0);
        assert_eq!(Addr::from(0x401ff8usize).page(), Addr::from(0x401000usize));
    }

    #[test]
    fn test_formatting() {
        let a = Addr::from(0x1234u64);
        assert_eq!(a.to_string(), "0x0000000000001234");
        assert_eq!(format!("{a:?}"), "0x0000000000001234");
        assert_eq!(format!("{a:x}"), "1234");
        assert_eq!(serde_json::to_string(&a).unwrap(), "4660");
        assert_eq!(Addr::from(a.as_ptr()), a);
    }
}
