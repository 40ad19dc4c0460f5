//! # Memory map
//!
//! Snapshot of the mappings in the address space of a process, as listed in `/proc/<pid>/maps`.
//! The file is parsed by the [`proc_maps`] crate.
//!
//! [`MemoryMap::dumpable`] reads `/proc/<pid>/smaps` instead and keeps only what a core file
//! should contain: regions flagged `dd` (don't dump) or `io` are left out, and regions backed by
//! an anonymous device (`00:xx`) lose their file name and offset.

use std::fmt::{self, Display};

use nix::unistd::Pid;
use serde::Serialize;

use crate::addr::Addr;
use crate::errors::{DebuggerError, Result};

const VM_FLAGS: &str = "VmFlags:";

/// Access rights of a mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MemoryPermissions {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    /// `s` in the flags, otherwise the mapping is private (copy on write)
    pub shared: bool,
}

impl MemoryPermissions {
    /// Parses the `rwxp` column
    pub fn parse(flags: &str) -> Self {
        let flag = |i: usize, c: u8| flags.as_bytes().get(i) == Some(&c);
        Self {
            read: flag(0, b'r'),
            write: flag(1, b'w'),
            execute: flag(2, b'x'),
            shared: flag(3, b's'),
        }
    }
}

impl Display for MemoryPermissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bit = |set: bool, c: char| if set { c } else { '-' };
        write!(
            f,
            "{}{}{}{}",
            bit(self.read, 'r'),
            bit(self.write, 'w'),
            bit(self.execute, 'x'),
            if self.shared { 's' } else { 'p' }
        )
    }
}

/// One line of the memory map
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemoryRegion {
    pub start: Addr,
    /// Exclusive
    pub end: Addr,
    pub permissions: MemoryPermissions,
    /// Offset into the mapped file
    pub offset: usize,
    /// `major:minor` of the device holding the file
    pub device: String,
    /// 0 for anonymous mappings
    pub inode: usize,
    /// File name or pseudo name like `[stack]`
    pub path: Option<String>,
}

impl MemoryRegion {
    pub fn size(&self) -> usize {
        self.end - self.start
    }

    pub fn contains(&self, addr: Addr) -> bool {
        addr >= self.start && addr < self.end
    }
}

impl From<&proc_maps::MapRange> for MemoryRegion {
    fn from(range: &proc_maps::MapRange) -> Self {
        let start = range.start();
        MemoryRegion {
            start: Addr::from(start),
            end: Addr::from(start + range.size()),
            permissions: MemoryPermissions::parse(&range.flags),
            offset: range.offset,
            device: range.dev.clone(),
            inode: range.inode,
            path: range.filename().map(|p| p.to_string_lossy().to_string()),
        }
    }
}

/// All mappings of a process, sorted by address
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct MemoryMap {
    regions: Vec<MemoryRegion>,
}

impl MemoryMap {
    /// Reads the current memory map of `pid`
    pub fn of(pid: Pid) -> Result<Self> {
        let ranges = proc_maps::get_process_maps(pid.as_raw())?;
        Ok(Self::from_regions(
            ranges.iter().map(MemoryRegion::from).collect(),
        ))
    }

    /// The regions of `pid` that belong in a core dump
    ///
    /// Falls back to `/proc/<pid>/maps` on kernels without `smaps`.
    pub fn dumpable(pid: Pid) -> Result<Self> {
        let smaps = match std::fs::read_to_string(format!("/proc/{pid}/smaps")) {
            Ok(text) => text,
            Err(_) => std::fs::read_to_string(format!("/proc/{pid}/maps"))?,
        };
        Ok(Self::from_regions(parse_smaps(&smaps)?))
    }

    pub fn from_regions(mut regions: Vec<MemoryRegion>) -> Self {
        regions.sort_by_key(|r| r.start);
        Self { regions }
    }

    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    /// The region `addr` lies in
    pub fn find(&self, addr: Addr) -> Option<&MemoryRegion> {
        let idx = self.regions.partition_point(|r| r.end <= addr);
        self.regions.get(idx).filter(|r| r.contains(addr))
    }

    pub fn is_mapped(&self, addr: Addr) -> bool {
        self.find(addr).is_some()
    }

    /// Lowest address at which the file `path` is mapped
    pub fn base_address(&self, path: &str) -> Option<Addr> {
        self.regions
            .iter()
            .find(|r| r.path.as_deref() == Some(path))
            .map(|r| r.start)
    }

    pub fn total_mapped(&self) -> usize {
        self.regions.iter().map(MemoryRegion::size).sum()
    }
}

impl Display for MemoryMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for region in &self.regions {
            writeln!(
                f,
                "{:016x}-{:016x} {} {:08x} {} {} {}",
                region.start.usize(),
                region.end.usize(),
                region.permissions,
                region.offset,
                region.device,
                region.inode,
                region.path.as_deref().unwrap_or("")
            )?;
        }
        Ok(())
    }
}

/// Parses `smaps` (or `maps`) text, dropping regions that must not be dumped
pub(crate) fn parse_smaps(text: &str) -> Result<Vec<MemoryRegion>> {
    let mut regions = Vec::new();
    let mut lines = text.lines().enumerate().peekable();
    while let Some((lineno, line)) = lines.next() {
        if line.is_empty() {
            continue;
        }
        let mut region = parse_map_header(line).ok_or_else(|| {
            DebuggerError::MalformedProcFile(format!("smaps line {}: {line:?}", lineno + 1))
        })?;

        let mut dump = true;
        // attribute lines start with a capitalized key, headers with a hex address
        while let Some((_, attr)) =
            lines.next_if(|(_, l)| l.starts_with(|c: char| c.is_ascii_uppercase()))
        {
            if let Some(flags) = attr.strip_prefix(VM_FLAGS) {
                dump = !flags.split_whitespace().any(|f| f == "dd" || f == "io");
            }
        }
        if !dump {
            continue;
        }
        if region.device.starts_with("00:") {
            region.path = None;
            region.offset = 0;
        }
        regions.push(region);
    }
    Ok(regions)
}

/// `start-end perms offset dev inode [path]`
fn parse_map_header(line: &str) -> Option<MemoryRegion> {
    let mut fields = line.splitn(6, ' ');
    let (start, end) = fields.next()?.split_once('-')?;
    let perms = fields.next()?;
    if perms.len() < 4 {
        return None;
    }
    let offset = usize::from_str_radix(fields.next()?, 16).ok()?;
    let device = fields.next()?.to_string();
    let inode = fields.next()?.parse().ok()?;
    let path = fields
        .next()
        .map(str::trim_start)
        .filter(|p| !p.is_empty())
        .map(str::to_string);
    Some(MemoryRegion {
        start: Addr::from(usize::from_str_radix(start, 16).ok()?),
        end: Addr::from(usize::from_str_radix(end, 16).ok()?),
        permissions: MemoryPermissions::parse(perms),
        offset,
        device,
        inode,
        path,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn region(start: usize, end: usize, flags: &str, path: Option<&str>) -> MemoryRegion {
        MemoryRegion {
            start: Addr::from(start),
            end: Addr::from(end),
            permissions: MemoryPermissions::parse(flags),
            offset: 0,
            device: "00:00".to_string(),
            inode: 0,
            path: path.map(str::to_string),
        }
    }

    #[test]
    fn test_parse_permissions() {
        let p = MemoryPermissions::parse("r-xp");
        assert!(p.read && !p.write && p.execute && !p.shared);
        assert_eq!(p.to_string(), "r-xp");
        let p = MemoryPermissions::parse("rw-s");
        assert!(p.read && p.write && !p.execute && p.shared);
        assert_eq!(MemoryPermissions::parse(""), MemoryPermissions::default());
    }

    #[test]
    fn test_find() {
        let map = MemoryMap::from_regions(vec![
            region(0x3000, 0x4000, "rw-p", None),
            region(0x1000, 0x2000, "r-xp", Some("/bin/x")),
            region(0x2000, 0x3000, "r--p", Some("/bin/x")),
        ]);
        assert_eq!(map.find(Addr::from(0x1000usize)).unwrap().start, Addr::from(0x1000usize));
        assert_eq!(map.find(Addr::from(0x2fffusize)).unwrap().start, Addr::from(0x2000usize));
        assert!(map.find(Addr::from(0x4000usize)).is_none());
        assert!(map.find(Addr::from(0x10usize)).is_none());
        assert_eq!(map.base_address("/bin/x"), Some(Addr::from(0x1000usize)));
        assert_eq!(map.total_mapped(), 0x3000);
    }

    const SMAPS: &str = "\
00400000-00401000 r--p 00000000 08:01 1234                               /usr/bin/prog
Size:                  4 kB
VmFlags: rd mr mw me dw sd
00401000-00402000 r-xp 00001000 08:01 1234                               /usr/bin/prog
Size:                  4 kB
VmFlags: rd ex mr mw me dw sd
7f0000000000-7f0000001000 rw-s 00000000 00:05 77                         /dev/zero (deleted)
VmFlags: rd wr sh mr mw me ms sd
7f0000002000-7f0000003000 rw-p 00000000 00:00 0 
Size:                  4 kB
VmFlags: rd wr mr mw me dd ac sd
7f0000004000-7f0000005000 rw-s 00000000 00:06 12                         /dev/mem
VmFlags: rd wr sh io pf dd sd
7ffd00000000-7ffd00021000 rw-p 00000000 00:00 0                          [stack]
VmFlags: rd wr mr mw me gd ac
";

    #[test]
    fn test_parse_smaps() {
        let regions = parse_smaps(SMAPS).unwrap();
        let starts: Vec<usize> = regions.iter().map(|r| r.start.usize()).collect();
        assert_eq!(starts, vec![0x400000, 0x401000, 0x7f0000000000, 0x7ffd00000000]);

        let text = &regions[1];
        assert_eq!(text.path.as_deref(), Some("/usr/bin/prog"));
        assert_eq!(text.offset, 0x1000);
        assert_eq!(text.inode, 1234);
        assert!(text.permissions.execute);

        // anonymous devices lose their name
        assert_eq!(regions[2].path, None);
        assert!(regions[2].permissions.shared);
        assert_eq!(regions[3].path, None);
        assert_eq!(regions[3].size(), 0x21000);
    }

    #[test]
    fn test_parse_plain_maps() {
        let maps = "00400000-00401000 r-xp 00000000 08:01 1234 /usr/bin/prog\n\
                    7ffd00000000-7ffd00021000 rw-p 00000000 00:00 0 \n";
        let regions = parse_smaps(maps).unwrap();
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].path.as_deref(), Some("/usr/bin/prog"));
    }

    #[test]
    fn test_parse_smaps_malformed() {
        assert!(matches!(
            parse_smaps("00400000 r-xp 00000000 08:01 1234\n"),
            Err(DebuggerError::MalformedProcFile(_))
        ));
        assert!(parse_smaps("00400000-00401000 r- 0 08:01 1\n").is_err());
    }

    #[test]
    fn test_dumpable_map_of_self() {
        let me = nix::unistd::getpid();
        let map = MemoryMap::dumpable(me).unwrap();
        let code = Addr::from(test_dumpable_map_of_self as usize);
        assert!(map.find(code).unwrap().permissions.execute);
        assert!(map.regions().iter().all(|r| !r.device.starts_with("00:") || r.path.is_none()));
    }

    #[test]
    fn test_map_of_self() {
        let map = MemoryMap::of(nix::unistd::getpid()).unwrap();
        let code = Addr::from(test_map_of_self as usize);
        let region = map.find(code).expect("our own code is mapped");
        assert!(region.permissions.execute);
        let local = 0u64;
        let stack = Addr::from(&local as *const u64 as usize);
        assert!(map.find(stack).unwrap().permissions.write);
        assert!(!map.to_string().is_empty());
    }
}
