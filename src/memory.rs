//! # Memory access
//!
//! Reads and writes byte ranges of the target's address space.
//!
//! The fast path copies with `process_vm_readv`/`process_vm_writev`, which works from any thread
//! but can not write to read-only mappings. If it copies nothing, the operation falls back to
//! `PTRACE_PEEKDATA`/`PTRACE_POKEDATA` one machine word at a time on the
//! [`PtraceExecutor`], merging the partial words at both ends of the range. Writes that fit in one
//! word, typically breakpoint instructions, always take the word path.

use nix::unistd::Pid;
use tracing::trace;

use crate::addr::Addr;
use crate::errors::Result;
use crate::executor::PtraceExecutor;
use crate::state::Shared;
use crate::{sys, Word, WORD_BYTES};

/// Memory of a traced process, accessed through one of its threads
#[derive(Debug, Clone, Copy)]
pub struct MemoryIO<'p> {
    executor: &'p PtraceExecutor,
    shared: &'p Shared,
    tid: Pid,
}

impl<'p> MemoryIO<'p> {
    pub(crate) fn new(executor: &'p PtraceExecutor, shared: &'p Shared, tid: Pid) -> Self {
        Self {
            executor,
            shared,
            tid,
        }
    }

    /// The thread whose ptrace requests are used for the word path
    pub fn thread(&self) -> Pid {
        self.tid
    }

    /// Reads `len` bytes starting at `addr`
    ///
    /// # Errors
    ///
    /// Fails with [`ProcessExited`](crate::errors::DebuggerError::ProcessExited) or
    /// [`ProcessDetached`](crate::errors::DebuggerError::ProcessDetached) without a syscall if the
    /// process is gone, and with the OS error if neither path can read the range.
    pub fn read(&self, addr: Addr, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let n = self.read_into(addr, &mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Reads into `buf`, returns the number of bytes read
    ///
    /// The bulk path may read fewer bytes than requested if the range ends in unmapped memory.
    pub fn read_into(&self, addr: Addr, buf: &mut [u8]) -> Result<usize> {
        self.shared.valid()?;
        if buf.is_empty() {
            return Ok(0);
        }

        let n = sys::vm_read(self.tid, addr, buf).unwrap_or(0);
        if n > 0 {
            return Ok(n);
        }

        trace!("reading {} bytes at {addr} word by word", buf.len());
        let tid = self.tid;
        let len = buf.len();
        let words = self.executor.run(move || {
            let mut tmp = vec![0u8; len];
            read_words(addr, &mut tmp, |a| sys::peek(tid, a)).map(|()| tmp)
        })??;
        buf.copy_from_slice(&words);
        Ok(len)
    }

    /// Writes `data` at `addr`, returns the number of bytes written
    ///
    /// Writing to the text of the program works, the word path ignores page protections.
    pub fn write(&self, addr: Addr, data: &[u8]) -> Result<usize> {
        self.shared.valid()?;
        if data.is_empty() {
            return Ok(0);
        }

        let mut written = 0;
        if data.len() > WORD_BYTES {
            written = sys::vm_write(self.tid, addr, data).unwrap_or(0);
        }
        if written > 0 {
            return Ok(written);
        }

        trace!("writing {} bytes at {addr} word by word", data.len());
        let tid = self.tid;
        let data = data.to_vec();
        let len = data.len();
        self.executor.run(move || {
            write_words(
                addr,
                &data,
                |a| sys::peek(tid, a),
                |a, w| sys::poke(tid, a, w),
            )
        })??;
        Ok(len)
    }

    /// Reads one machine word, it does not need to be aligned
    pub fn read_word(&self, addr: Addr) -> Result<Word> {
        let mut buf = [0u8; WORD_BYTES];
        let n = self.read_into(addr, &mut buf)?;
        if n < WORD_BYTES {
            // the bulk path stopped at the end of a mapping, retry on the word path
            let tid = self.tid;
            return Ok(self.executor.run(move || {
                let mut tmp = [0u8; WORD_BYTES];
                read_words(addr, &mut tmp, |a| sys::peek(tid, a)).map(|()| Word::from_ne_bytes(tmp))
            })??);
        }
        Ok(Word::from_ne_bytes(buf))
    }
}

/// Fills `buf` from the memory at `addr` with aligned word reads
pub(crate) fn read_words<R>(addr: Addr, buf: &mut [u8], mut read_word: R) -> Result<()>
where
    R: FnMut(Addr) -> Result<Word>,
{
    let mut current = addr.align_down();
    let mut offset = addr.word_offset();
    let mut done = 0;
    while done < buf.len() {
        let word = read_word(current)?.to_ne_bytes();
        let n = (WORD_BYTES - offset).min(buf.len() - done);
        buf[done..done + n].copy_from_slice(&word[offset..offset + n]);
        done += n;
        offset = 0;
        current += WORD_BYTES;
    }
    Ok(())
}

/// Writes `data` to the memory at `addr` with aligned word writes
///
/// Words that are only partially covered by `data` are read first, so the bytes around the range
/// keep their value.
pub(crate) fn write_words<R, W>(
    addr: Addr,
    data: &[u8],
    mut read_word: R,
    mut write_word: W,
) -> Result<()>
where
    R: FnMut(Addr) -> Result<Word>,
    W: FnMut(Addr, Word) -> Result<()>,
{
    let mut current = addr.align_down();
    let mut offset = addr.word_offset();
    let mut done = 0;
    while done < data.len() {
        let n = (WORD_BYTES - offset).min(data.len() - done);
        let mut word = if n < WORD_BYTES {
            read_word(current)?.to_ne_bytes()
        } else {
            [0u8; WORD_BYTES]
        };
        word[offset..offset + n].copy_from_slice(&data[done..done + n]);
        write_word(current, Word::from_ne_bytes(word))?;
        done += n;
        offset = 0;
        current += WORD_BYTES;
    }
    Ok(())
}
