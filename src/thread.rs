//! # Threads
//!
//! The OS threads of a traced process and what happens to one of them: reading its registers,
//! stepping it over a breakpoint, resuming and stopping it.
//!
//! [`Thread`] holds the bookkeeping of one thread, [`ThreadRegistry`] all of them. Operations
//! that need the rest of the process (the executor, the breakpoint table) go through a
//! [`ThreadHandle`], which borrows one thread together with that context.

use std::collections::BTreeMap;
use std::sync::Arc;

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tracing::{debug, trace, warn};

use crate::addr::Addr;
use crate::arch::{Arch, NativeArch};
use crate::breakpoint::{BreakpointKind, BreakpointTable};
use crate::consts::{SI_KERNEL, TRAP_BRKPT};
use crate::errors::{DebuggerError, Result};
use crate::executor::PtraceExecutor;
use crate::memory::MemoryIO;
use crate::process::post_exit;
use crate::registers::{RegisterAccess, RegisterValue, Registers};
use crate::state::Shared;
use crate::sys;
use crate::wait::WaitStatus;

/// One thread of the traced process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thread {
    id: Pid,
    pub(crate) status: Option<WaitStatus>,
    pub(crate) current_breakpoint: Option<Addr>,
    pub(crate) delayed_signal: Option<Signal>,
    pub(crate) running: bool,
    /// the last stop was a `SIGTRAP` that may be a breakpoint
    pub(crate) setbp: bool,
    /// we sent a `SIGSTOP` that has not been observed yet
    pub(crate) stop_requested: bool,
    pub(crate) single_stepping: bool,
    pub(crate) clones: Vec<Pid>,
}

impl Thread {
    pub fn new(id: Pid) -> Self {
        Self {
            id,
            status: None,
            current_breakpoint: None,
            delayed_signal: None,
            running: false,
            setbp: false,
            stop_requested: false,
            single_stepping: false,
            clones: Vec::new(),
        }
    }

    pub fn id(&self) -> Pid {
        self.id
    }

    /// What the last wait reported for this thread
    pub fn status(&self) -> Option<WaitStatus> {
        self.status
    }

    /// Address of the breakpoint the thread is stopped at
    pub fn current_breakpoint(&self) -> Option<Addr> {
        self.current_breakpoint
    }

    /// Signal that will be delivered when the thread is resumed
    pub fn delayed_signal(&self) -> Option<Signal> {
        self.delayed_signal
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_single_stepping(&self) -> bool {
        self.single_stepping
    }
}

/// All known threads of a process
#[derive(Debug, Clone, Default)]
pub struct ThreadRegistry {
    threads: BTreeMap<Pid, Thread>,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn list(&self) -> impl Iterator<Item = &Thread> {
        self.threads.values()
    }

    pub(crate) fn list_mut(&mut self) -> impl Iterator<Item = &mut Thread> {
        self.threads.values_mut()
    }

    pub fn find(&self, tid: Pid) -> Option<&Thread> {
        self.threads.get(&tid)
    }

    pub fn find_mut(&mut self, tid: Pid) -> Option<&mut Thread> {
        self.threads.get_mut(&tid)
    }

    /// Registers a thread, a known thread is left as it is
    pub fn add(&mut self, tid: Pid) -> &mut Thread {
        self.threads.entry(tid).or_insert_with(|| {
            trace!("new thread {tid}");
            Thread::new(tid)
        })
    }

    pub fn remove(&mut self, tid: Pid) -> Option<Thread> {
        trace!("thread {tid} is gone");
        self.threads.remove(&tid)
    }

    pub fn contains(&self, tid: Pid) -> bool {
        self.threads.contains_key(&tid)
    }

    /// Thread ids in ascending order
    pub fn ids(&self) -> Vec<Pid> {
        self.threads.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    /// Takes the threads that were created while other threads were single-stepped
    pub(crate) fn drain_clones(&mut self) -> Vec<Pid> {
        let mut clones = Vec::new();
        for thread in self.threads.values_mut() {
            clones.append(&mut thread.clones);
        }
        clones.retain(|tid| !self.threads.contains_key(tid));
        clones
    }
}

/// What to do with a signal that arrived while single-stepping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StepSignal {
    /// The step is complete
    Done,
    /// A stale stop, drop it
    Ignore,
    /// Caused by the stepped instruction, deliver it with the next step
    Redeliver(Signal),
    /// Unrelated, deliver it when the thread is resumed
    Delay(Signal),
}

pub(crate) fn classify_step_signal(sig: Signal) -> StepSignal {
    match sig {
        Signal::SIGTRAP => StepSignal::Done,
        Signal::SIGSTOP => StepSignal::Ignore,
        Signal::SIGILL | Signal::SIGBUS | Signal::SIGFPE | Signal::SIGSEGV | Signal::SIGSTKFLT => {
            StepSignal::Redeliver(sig)
        }
        other => StepSignal::Delay(other),
    }
}

/// The parts of the process a thread operation needs
#[derive(Debug, Clone, Copy)]
pub(crate) struct ProcessContext<'p> {
    pub(crate) pid: Pid,
    pub(crate) executor: &'p Arc<PtraceExecutor>,
    pub(crate) shared: &'p Shared,
    pub(crate) breakpoints: &'p BreakpointTable,
}

impl<'p> ProcessContext<'p> {
    pub(crate) fn memory(&self, tid: Pid) -> MemoryIO<'p> {
        MemoryIO::new(self.executor, self.shared, tid)
    }

    pub(crate) fn registers(&self, tid: Pid) -> RegisterAccess {
        RegisterAccess::new(self.executor.clone(), tid)
    }
}

/// One thread together with the process it belongs to
#[derive(Debug)]
pub struct ThreadHandle<'p> {
    thread: &'p mut Thread,
    ctx: ProcessContext<'p>,
}

impl<'p> ThreadHandle<'p> {
    pub(crate) fn new(thread: &'p mut Thread, ctx: ProcessContext<'p>) -> Self {
        Self { thread, ctx }
    }

    pub fn id(&self) -> Pid {
        self.thread.id
    }

    pub fn thread(&self) -> &Thread {
        &*self.thread
    }

    fn regs(&self) -> RegisterAccess {
        self.ctx.registers(self.thread.id)
    }

    pub fn pc(&self) -> Result<Addr> {
        self.regs().pc()
    }

    pub fn registers(&self) -> Result<Registers> {
        self.regs().registers()
    }

    pub fn set_pc(&self, pc: Addr) -> Result<()> {
        self.regs().set_pc(pc)
    }

    /// Changes one register, by DWARF number
    pub fn set_register(&self, regnum: u16, value: RegisterValue) -> Result<()> {
        self.regs().set_register(regnum, value)
    }

    pub fn restore_registers(&self, saved: &Registers) -> Result<()> {
        self.regs().restore_registers(saved)
    }

    /// Memory of the process, accessed through this thread
    pub fn memory(&self) -> MemoryIO<'p> {
        self.ctx.memory(self.thread.id)
    }

    /// Resumes the thread, stepping over the breakpoint at its program counter first
    pub fn continue_over_breakpoint(&mut self) -> Result<()> {
        let pc = self.pc()?;
        if self.ctx.breakpoints.find(pc, false).is_some() {
            self.step_instruction()?;
        }
        self.resume()
    }

    /// Executes exactly one instruction
    ///
    /// A breakpoint at the program counter, or the hardware breakpoint the thread is stopped at,
    /// is disarmed for the step and armed again afterwards.
    ///
    /// # Errors
    ///
    /// [`DebuggerError::ProcessExited`] if the process died during the step.
    pub fn step_instruction(&mut self) -> Result<()> {
        self.thread.single_stepping = true;
        let r = self.step_over_breakpoints();
        self.thread.single_stepping = false;
        r
    }

    fn step_over_breakpoints(&mut self) -> Result<()> {
        let tid = self.thread.id;

        let hw_slot = self
            .thread
            .current_breakpoint
            .and_then(|addr| self.ctx.breakpoints.get(addr))
            .and_then(|bp| match bp.kind() {
                BreakpointKind::Hardware { watch, slot } => Some((bp.addr(), *watch, *slot)),
                BreakpointKind::Software { .. } => None,
            });
        if let Some((_, _, slot)) = hw_slot {
            self.regs()
                .with_debug_registers(move |drs| drs.clear_breakpoint(slot))?;
        }

        let pc = self.pc()?;
        let sw_orig = self
            .ctx
            .breakpoints
            .find(pc, false)
            .and_then(|(bp, _)| bp.original().map(|orig| (bp.addr(), orig.to_vec())));
        if let Some((addr, orig)) = &sw_orig {
            self.memory()
                .write(*addr, orig)
                .map_err(|e| DebuggerError::erase_failed(*addr, e))?;
        }

        let stepped = self.single_step();
        if matches!(stepped, Err(ref e) if e.is_process_gone()) {
            return stepped;
        }

        let mut rearmed = Ok(());
        if let Some((addr, _)) = sw_orig {
            rearmed = self
                .memory()
                .write(addr, NativeArch::BREAKPOINT_INSTRUCTION)
                .map(|_| ())
                .map_err(|e| DebuggerError::write_failed(addr, e));
        }
        if let Some((addr, watch, slot)) = hw_slot {
            let r = self
                .regs()
                .with_debug_registers(move |drs| drs.set_breakpoint(slot, addr, watch));
            rearmed = rearmed.and(r.map_err(|e| DebuggerError::write_failed(addr, e)));
        }
        trace!("thread {tid} stepped one instruction");
        stepped.and(rearmed)
    }

    /// Hardware single-step of one instruction, without caring about breakpoints
    pub fn single_step(&mut self) -> Result<()> {
        let tid = self.thread.id;
        let mut sig = None;
        loop {
            self.ctx.executor.run(move || sys::step(tid, sig))??;
            sig = None;

            let status = match sys::wait_for(tid) {
                Ok(status) => status,
                Err(DebuggerError::WaitFailed(nix::Error::ECHILD)) if tid == self.ctx.pid => {
                    // the leader is gone and was already reaped
                    return Err(post_exit(self.ctx.shared, self.ctx.executor, 0));
                }
                Err(e) => return Err(e),
            };
            self.thread.status = Some(status);

            if let Some(exit) = status.exit_status() {
                if tid == self.ctx.pid {
                    return Err(post_exit(self.ctx.shared, self.ctx.executor, exit));
                }
                return Err(DebuggerError::ThreadExited(tid));
            }

            if status.is_clone_event() {
                let new = self
                    .ctx
                    .executor
                    .run(move || sys::event_message(tid))??;
                debug!("thread {tid} created thread {new} while stepping");
                self.thread.clones.push(new);
                continue;
            }

            let Some(stop) = status.stop_signal() else {
                continue;
            };
            match classify_step_signal(stop) {
                StepSignal::Done => return Ok(()),
                StepSignal::Ignore => self.thread.stop_requested = false,
                StepSignal::Redeliver(s) => sig = Some(s),
                StepSignal::Delay(s) => {
                    trace!("delaying {s} of thread {tid}");
                    self.thread.delayed_signal = Some(s);
                }
            }
        }
    }

    /// Finds the breakpoint the thread is stopped at and records it as its current breakpoint
    ///
    /// Hardware breakpoints are asked first. With `adjust_pc`, a thread that executed a trap
    /// instruction gets its program counter moved back onto the breakpoint.
    pub fn set_current_breakpoint(&mut self, adjust_pc: bool) -> Result<Option<Addr>> {
        self.thread.current_breakpoint = None;

        let mut found = None;
        if self.ctx.breakpoints.has_hardware() {
            let slot = self
                .regs()
                .with_debug_registers(|drs| Ok(drs.active_breakpoint()))?;
            found = slot
                .and_then(|slot| self.ctx.breakpoints.find_by_slot(slot))
                .map(|bp| bp.addr());
        }

        if found.is_none() {
            let pc = self.pc()?;
            let adjust_pc = adjust_pc && NativeArch::BREAK_INSTR_MOVES_PC;
            if let Some((bp, rewind)) = self.ctx.breakpoints.find(pc, adjust_pc) {
                if rewind {
                    self.set_pc(bp.addr())?;
                }
                found = Some(bp.addr());
            }
        }

        self.thread.current_breakpoint = found;
        Ok(found)
    }

    /// True if the last `SIGTRAP` of the thread was raised by a trap instruction
    ///
    /// A step, a hardware breakpoint or a signal sent by another process are not.
    pub fn trapped_on_instruction(&self) -> Result<bool> {
        let tid = self.thread.id;
        let code = self.ctx.executor.run(move || sys::siginfo(tid).map(|i| i.si_code))??;
        Ok(matches!(code, SI_KERNEL | TRAP_BRKPT))
    }

    /// Asks the kernel to stop the thread
    pub fn stop(&mut self) -> Result<()> {
        sys::tgkill(self.ctx.pid, self.thread.id, Signal::SIGSTOP)?;
        self.thread.stop_requested = true;
        Ok(())
    }

    /// Resumes the thread, delivering its delayed signal
    pub fn resume(&mut self) -> Result<()> {
        let sig = self.thread.delayed_signal.take();
        self.resume_with_signal(sig)
    }

    pub fn resume_with_signal(&mut self, sig: Option<Signal>) -> Result<()> {
        let tid = self.thread.id;
        self.thread.running = true;
        if let Some(sig) = sig {
            trace!("resuming {tid} with {sig}");
        }
        let r = self.ctx.executor.run(move || sys::cont(tid, sig))?;
        if r.is_err() {
            warn!("could not resume thread {tid}");
            self.thread.running = false;
        }
        r
    }

    /// True if the kernel reports the thread as stopped by the tracer
    pub fn is_stopped_os(&self) -> Result<bool> {
        let state = sys::task_state(self.ctx.pid, self.thread.id)?;
        Ok(matches!(state, 't' | 'T'))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_classify_step_signal() {
        assert_eq!(classify_step_signal(Signal::SIGTRAP), StepSignal::Done);
        assert_eq!(classify_step_signal(Signal::SIGSTOP), StepSignal::Ignore);
        for sig in [
            Signal::SIGILL,
            Signal::SIGBUS,
            Signal::SIGFPE,
            Signal::SIGSEGV,
            Signal::SIGSTKFLT,
        ] {
            assert_eq!(classify_step_signal(sig), StepSignal::Redeliver(sig));
        }
        for sig in [Signal::SIGINT, Signal::SIGUSR1, Signal::SIGCHLD, Signal::SIGALRM] {
            assert_eq!(classify_step_signal(sig), StepSignal::Delay(sig));
        }
    }

    #[test]
    fn test_registry() {
        let mut reg = ThreadRegistry::new();
        assert!(reg.is_empty());
        reg.add(Pid::from_raw(12)).running = true;
        reg.add(Pid::from_raw(10));
        // adding a known thread keeps its state
        assert!(reg.add(Pid::from_raw(12)).is_running());
        assert_eq!(reg.ids(), vec![Pid::from_raw(10), Pid::from_raw(12)]);
        assert_eq!(reg.len(), 2);
        assert!(reg.find(Pid::from_raw(10)).is_some());
        assert!(reg.remove(Pid::from_raw(10)).is_some());
        assert!(reg.find(Pid::from_raw(10)).is_none());
        assert!(reg.remove(Pid::from_raw(10)).is_none());
    }

    #[test]
    fn test_drain_clones() {
        let mut reg = ThreadRegistry::new();
        reg.add(Pid::from_raw(1)).clones = vec![Pid::from_raw(5), Pid::from_raw(2)];
        reg.add(Pid::from_raw(2)).clones = vec![Pid::from_raw(6)];
        let mut clones = reg.drain_clones();
        clones.sort();
        // thread 2 is known already
        assert_eq!(clones, vec![Pid::from_raw(5), Pid::from_raw(6)]);
        assert!(reg.drain_clones().is_empty());
    }

    #[test]
    fn test_new_thread_state() {
        let t = Thread::new(Pid::from_raw(3));
        assert_eq!(t.id(), Pid::from_raw(3));
        assert!(!t.is_running());
        assert_eq!(t.current_breakpoint(), None);
        assert_eq!(t.delayed_signal(), None);
        assert_eq!(t.status(), None);
    }
}
