//! # Process control
//!
//! [`ProcessHandle`] owns one debugged process: its threads, its breakpoints and the ptrace
//! executor that talks to the kernel for it. Its core is [`ProcessHandle::continue_once`], which
//! resumes every thread, waits until one of them traps and stops all others before it returns.
//!
//! While the process runs, the handle is blocked in `waitpid`. Another thread can interrupt it
//! through a [`StopHandle`].

use std::sync::Arc;

use crossbeam_channel::Sender;
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tracing::{debug, info, trace, warn};

use crate::addr::Addr;
use crate::arch::{Arch, NativeArch};
use crate::breakpoint::{
    Breakpoint, BreakpointRequest, BreakpointTable, BreakpointTarget, WatchType,
};
use crate::dump::{self, Note};
use crate::errors::{DebuggerError, Result};
use crate::executor::PtraceExecutor;
use crate::launch::LaunchOptions;
use crate::memory::MemoryIO;
use crate::memorymap::MemoryMap;
use crate::registers::{DebugRegisters, RegisterAccess};
use crate::state::{ProcessState, Shared, StopHandle};
use crate::stop::{Stop, StopReason};
use crate::sys;
use crate::thread::{ProcessContext, Thread, ThreadHandle, ThreadRegistry};
use crate::wait::WaitStatus;

/// How [`ProcessHandle::trap_wait`] waits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitMode {
    /// Until a thread traps
    Block,
    /// Only collect what is already there
    NoHang,
    /// Until any thread stops, while stopping all threads
    Halt,
}

/// A debugged process
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Pid,
    /// launched by us, as opposed to attached to
    child_process: bool,
    executor: Arc<PtraceExecutor>,
    shared: Arc<Shared>,
    breakpoints: BreakpointTable,
    threads: ThreadRegistry,
    /// thread used for memory access
    memthread: Pid,
    stop_reason: StopReason,
    resume_notify: Option<Sender<()>>,
    comm: String,
}

impl ProcessHandle {
    fn new(pid: Pid, executor: Arc<PtraceExecutor>, child_process: bool, reason: StopReason) -> Self {
        let comm = sys::comm(pid).unwrap_or_else(|e| {
            warn!("could not read the command name of {pid}: {e}");
            String::new()
        });
        Self {
            pid,
            child_process,
            executor,
            shared: Shared::new(pid),
            breakpoints: BreakpointTable::new(),
            threads: ThreadRegistry::new(),
            memthread: pid,
            stop_reason: reason,
            resume_notify: None,
            comm,
        }
    }

    /// Starts a program and stops it before its first instruction
    ///
    /// # Errors
    ///
    /// Fails if the program can not be found or started, see
    /// [`LaunchOptions::resolve_program`].
    pub fn launch(opts: LaunchOptions) -> Result<Self> {
        let executor = Arc::new(PtraceExecutor::spawn("nativeproc-ptrace")?);
        let (pid, status) = executor.run(move || -> Result<(Pid, WaitStatus)> {
            let pid = opts.spawn_traced()?;
            let status = sys::wait_for(pid)?;
            if status.is_stopped() {
                sys::trace_clones(pid)?;
            }
            Ok((pid, status))
        })??;

        if let Some(code) = status.exit_status() {
            executor.close();
            return Err(DebuggerError::ProcessExited { pid, status: code });
        }

        let mut proc = Self::new(pid, executor, true, StopReason::Launched);
        proc.threads.add(pid).status = Some(status);
        info!("launched process {pid} ({}) on {}", proc.comm, NativeArch::NAME);
        Ok(proc)
    }

    /// Attaches to a running process and all of its threads
    pub fn attach(pid: Pid) -> Result<Self> {
        let executor = Arc::new(PtraceExecutor::spawn("nativeproc-ptrace")?);
        let attached = executor.run(move || -> Result<Vec<(Pid, WaitStatus)>> {
            sys::attach(pid)?;
            let status = sys::wait_for(pid)?;
            if let Some(code) = status.exit_status() {
                return Err(DebuggerError::ProcessExited { pid, status: code });
            }
            sys::trace_clones(pid)?;

            let mut attached = vec![(pid, status)];
            for tid in sys::thread_ids(pid)? {
                if tid == pid {
                    continue;
                }
                match sys::attach(tid) {
                    Ok(()) => (),
                    Err(DebuggerError::Os(Errno::ESRCH)) => {
                        debug!("thread {tid} exited before we could attach");
                        continue;
                    }
                    Err(e) => return Err(e),
                }
                let status = sys::wait_for(tid)?;
                if status.is_terminated() {
                    continue;
                }
                sys::trace_clones(tid)?;
                attached.push((tid, status));
            }
            Ok(attached)
        })?;

        let attached = match attached {
            Ok(a) => a,
            Err(e) => {
                executor.close();
                return Err(e);
            }
        };

        let mut proc = Self::new(pid, executor, false, StopReason::Attached);
        for (tid, status) in attached {
            proc.threads.add(tid).status = Some(status);
        }
        info!(
            "attached to process {pid} ({}) with {} threads on {}",
            proc.comm,
            proc.threads.len(),
            NativeArch::NAME
        );
        Ok(proc)
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Command name of the process, from `/proc/<pid>/comm`
    pub fn comm(&self) -> &str {
        &self.comm
    }

    /// True if the process was started by [`launch`](Self::launch)
    pub fn is_child(&self) -> bool {
        self.child_process
    }

    pub fn state(&self) -> ProcessState {
        self.shared.state()
    }

    /// Why the process stopped the last time
    pub fn stop_reason(&self) -> StopReason {
        self.stop_reason
    }

    /// Fails with the terminal condition if the process is gone
    pub fn valid(&self) -> Result<()> {
        self.shared.valid()
    }

    pub fn list_threads(&self) -> impl Iterator<Item = &Thread> {
        self.threads.list()
    }

    pub fn find_thread(&self, tid: Pid) -> Option<&Thread> {
        self.threads.find(tid)
    }

    /// Operations on one thread
    pub fn thread(&mut self, tid: Pid) -> Result<ThreadHandle<'_>> {
        let ctx = ProcessContext {
            pid: self.pid,
            executor: &self.executor,
            shared: self.shared.as_ref(),
            breakpoints: &self.breakpoints,
        };
        let thread = self
            .threads
            .find_mut(tid)
            .ok_or(DebuggerError::ThreadNotFound(tid))?;
        Ok(ThreadHandle::new(thread, ctx))
    }

    /// The thread memory is accessed through, the one that trapped last
    pub fn memory_thread(&self) -> Pid {
        if self.threads.contains(self.memthread) {
            self.memthread
        } else {
            self.pid
        }
    }

    /// Memory of the process
    pub fn memory(&self) -> MemoryIO<'_> {
        MemoryIO::new(&self.executor, &self.shared, self.memory_thread())
    }

    pub fn registers(&self, tid: Pid) -> Result<RegisterAccess> {
        if !self.threads.contains(tid) {
            return Err(DebuggerError::ThreadNotFound(tid));
        }
        Ok(RegisterAccess::new(self.executor.clone(), tid))
    }

    pub fn memory_map(&self) -> Result<MemoryMap> {
        self.valid()?;
        MemoryMap::of(self.pid)
    }

    /// The regions a core dump of the process would contain
    pub fn dumpable_memory_map(&self) -> Result<MemoryMap> {
        self.valid()?;
        MemoryMap::dumpable(self.pid)
    }

    /// The notes of a core file for the stopped process
    ///
    /// `NT_PRPSINFO` and `NT_AUXV` come first, then `NT_PRSTATUS` and `NT_X86_XSTATE` for every
    /// thread. A missing command line or auxiliary vector leaves the field empty or the note out.
    pub fn dump_notes(&self) -> Result<Vec<Note>> {
        self.valid()?;
        let pid = self.pid;
        let args = match (sys::executable(pid), sys::cmdline(pid)) {
            (Ok(exe), Ok(cmdline)) => dump::psargs(&exe, &cmdline),
            _ => Vec::new(),
        };
        let mut notes = vec![dump::prpsinfo(pid, &self.comm, &args)];
        match sys::auxv(pid) {
            Ok(raw) => notes.push(dump::auxv(raw)),
            Err(e) => debug!("no auxiliary vector for {pid}: {e}"),
        }

        for tid in self.threads.ids() {
            let mut regs = RegisterAccess::new(self.executor.clone(), tid).registers()?;
            notes.push(dump::prstatus(tid, pid, regs.gpr()));
            notes.push(dump::xstate(regs.xstate()?));
            trace!("dumped the notes of thread {tid}");
        }
        Ok(notes)
    }

    /// Entry point of the program, from the auxiliary vector
    pub fn entry_point(&self) -> Result<Addr> {
        self.valid()?;
        sys::entry_point(self.pid)
    }

    pub fn breakpoints(&self) -> &BreakpointTable {
        &self.breakpoints
    }

    pub fn find_breakpoint(&self, pc: Addr, adjust_pc: bool) -> Option<(&Breakpoint, bool)> {
        self.breakpoints.find(pc, adjust_pc)
    }

    /// Arms a software breakpoint at `addr`
    pub fn set_breakpoint(&mut self, addr: Addr, logical_id: Option<u32>) -> Result<&Breakpoint> {
        self.install(addr, logical_id, BreakpointRequest::Software)
    }

    /// Arms a hardware breakpoint or watchpoint at `addr` on every thread
    ///
    /// Without a `slot`, the first free debug register is used.
    pub fn set_hardware_breakpoint(
        &mut self,
        addr: Addr,
        logical_id: Option<u32>,
        watch: WatchType,
        slot: Option<u8>,
    ) -> Result<&Breakpoint> {
        self.install(addr, logical_id, BreakpointRequest::Hardware { watch, slot })
    }

    fn install(
        &mut self,
        addr: Addr,
        logical_id: Option<u32>,
        request: BreakpointRequest,
    ) -> Result<&Breakpoint> {
        self.valid()?;
        let memthread = self.memory_thread();
        let target = ProcessTarget::new(&self.executor, &self.shared, memthread, &self.threads);
        let bp = self.breakpoints.install(addr, logical_id, request, &target)?;
        debug!("breakpoint set at {addr}");
        Ok(bp)
    }

    /// Disarms the breakpoint at `addr` and returns it
    pub fn clear_breakpoint(&mut self, addr: Addr) -> Result<Breakpoint> {
        self.valid()?;
        let memthread = self.memory_thread();
        let target = ProcessTarget::new(&self.executor, &self.shared, memthread, &self.threads);
        let bp = self.breakpoints.remove(addr, &target)?;
        for thread in self.threads.list_mut() {
            if thread.current_breakpoint == Some(addr) {
                thread.current_breakpoint = None;
            }
        }
        debug!("breakpoint at {addr} cleared");
        Ok(bp)
    }

    /// A handle that can interrupt [`continue_once`](Self::continue_once) from another thread
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle::new(self.shared.clone())
    }

    /// See [`StopHandle::request_manual_stop`]
    pub fn request_manual_stop(&self) -> Result<()> {
        self.shared.request_manual_stop()
    }

    /// True exactly once after each manual stop request
    pub fn check_and_clear_manual_stop(&self) -> bool {
        self.shared.check_and_clear_manual_stop()
    }

    /// `notify` is dropped the next time [`continue_once`](Self::continue_once) has resumed the
    /// process, receivers see a disconnected channel
    pub fn resume_notify(&mut self, notify: Sender<()>) {
        self.resume_notify = Some(notify);
    }

    /// Executes one instruction on `tid`, stepping over a breakpoint it may stand on
    pub fn step_instruction(&mut self, tid: Pid) -> Result<Stop> {
        self.valid()?;
        match self.step_and_locate(tid) {
            Ok(stop) => {
                self.adopt_clones()?;
                self.stop_reason = stop.reason;
                Ok(stop)
            }
            Err(DebuggerError::ThreadExited(tid)) => {
                self.threads.remove(tid);
                self.adopt_clones()?;
                Err(DebuggerError::ThreadExited(tid))
            }
            Err(e) => Err(self.on_error(e)),
        }
    }

    fn step_and_locate(&mut self, tid: Pid) -> Result<Stop> {
        let mut thread = self.thread(tid)?;
        thread.step_instruction()?;
        let bp = thread.set_current_breakpoint(true)?;
        let pc = thread.pc()?;
        let reason = match bp {
            Some(addr) => self.breakpoint_reason(addr),
            None => StopReason::Unknown,
        };
        Ok(Stop {
            thread: tid,
            reason,
            pc,
        })
    }

    fn breakpoint_reason(&self, addr: Addr) -> StopReason {
        match self.breakpoints.get(addr).and_then(Breakpoint::watch) {
            Some(watch) if watch.is_data_watch() => StopReason::WatchpointHit,
            _ => StopReason::BreakpointHit,
        }
    }

    /// Resumes the process and returns when it stopped again
    ///
    /// All threads are stopped when this returns. The reported thread is the one that trapped and
    /// becomes the memory thread.
    ///
    /// # Errors
    ///
    /// [`DebuggerError::ProcessExited`] if the process ended, with its exit code or the negated
    /// number of the signal that killed it. The executor is shut down then, every further
    /// operation fails.
    pub fn continue_once(&mut self) -> Result<Stop> {
        self.valid()?;
        match self.continue_inner() {
            Ok(stop) => {
                self.shared.set_state(ProcessState::Stopped);
                self.stop_reason = stop.reason;
                Ok(stop)
            }
            Err(e) => Err(self.on_error(e)),
        }
    }

    fn continue_inner(&mut self) -> Result<Stop> {
        loop {
            self.resume()?;

            for thread in self.threads.list_mut() {
                thread.current_breakpoint = None;
            }

            if let Some(notify) = self.resume_notify.take() {
                drop(notify);
            }

            let Some(trapthread) = self.trap_wait(WaitMode::Block)? else {
                continue;
            };
            if let Some(stop) = self.stop_all(trapthread)? {
                return Ok(stop);
            }
            trace!("the trap thread {trapthread} is gone, continuing");
        }
    }

    /// Steps threads that stand on a breakpoint over it and resumes every thread
    fn resume(&mut self) -> Result<()> {
        for tid in self.threads.ids() {
            let on_breakpoint = self
                .threads
                .find(tid)
                .is_some_and(|t| t.current_breakpoint.is_some());
            if !on_breakpoint {
                continue;
            }
            match self.thread(tid)?.step_instruction() {
                Ok(()) => (),
                Err(DebuggerError::ThreadExited(tid)) => {
                    self.threads.remove(tid);
                    continue;
                }
                Err(e) => return Err(e),
            }
            if let Some(thread) = self.threads.find_mut(tid) {
                thread.current_breakpoint = None;
            }
        }
        self.adopt_clones()?;

        self.shared.set_state(ProcessState::Running);
        for tid in self.threads.ids() {
            match self.thread(tid)?.resume() {
                Ok(()) => (),
                Err(DebuggerError::Os(Errno::ESRCH)) => {
                    debug!("thread {tid} vanished before it could be resumed");
                    self.threads.remove(tid);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Waits for trace events and handles them until a thread traps
    ///
    /// Returns the thread that trapped. New threads are registered, exited ones removed and
    /// signals meant for the program are passed on. With [`WaitMode::NoHang`], `None` means that
    /// no event was pending.
    fn trap_wait(&mut self, mode: WaitMode) -> Result<Option<Pid>> {
        loop {
            let status = match mode {
                WaitMode::NoHang => match sys::wait_any_nohang()? {
                    Some(status) => status,
                    None => return Ok(None),
                },
                WaitMode::Block | WaitMode::Halt => match sys::wait_any() {
                    Ok(status) => status,
                    Err(DebuggerError::WaitFailed(Errno::ECHILD)) => {
                        // nothing left to wait for, the process was reaped elsewhere
                        return Err(self.exited(0));
                    }
                    Err(e) => return Err(e),
                },
            };
            let Some(wpid) = status.pid() else {
                continue;
            };
            trace!("wait: {status:?}");

            if let Some(thread) = self.threads.find_mut(wpid) {
                thread.status = Some(status);
            }

            if let Some(code) = status.exit_status() {
                if wpid == self.pid {
                    info!("process {wpid} exited with status {code}");
                    return Err(self.exited(code));
                }
                debug!("thread {wpid} exited with status {code}");
                self.threads.remove(wpid);
                continue;
            }

            if status.is_clone_event() {
                let parent = wpid;
                let child = self.executor.run(move || sys::event_message(parent))??;
                debug!("thread {parent} created thread {child}");
                self.adopt_thread(child, true)?;
                if mode == WaitMode::Halt {
                    // the parent still has our SIGSTOP pending, a new child is stopped already
                    if let Some(t) = self.threads.find_mut(parent) {
                        t.running = false;
                    }
                    return Ok(Some(parent));
                }
                let child_stopped = self.threads.find(child).is_some_and(|t| !t.is_running());
                if child_stopped {
                    self.resume_thread(child, None)?;
                }
                self.resume_thread(parent, None)?;
                continue;
            }

            if !self.threads.contains(wpid) {
                if sys::thread_group(wpid)? != Some(self.pid) {
                    trace!("ignoring event of foreign task {wpid}");
                    continue;
                }
                debug!("adopting unknown thread {wpid}");
                self.adopt_thread(wpid, false)?;
                if status.stop_signal() == Some(Signal::SIGSTOP) {
                    // the initial stop of a thread whose clone event is still pending
                    if let Some(t) = self.threads.find_mut(wpid) {
                        t.stop_requested = true;
                    }
                }
            }

            let Some(sig) = status.stop_signal() else {
                continue;
            };
            let Some(thread) = self.threads.find_mut(wpid) else {
                continue;
            };

            if mode == WaitMode::Halt {
                thread.running = false;
                match sig {
                    Signal::SIGTRAP => thread.setbp = true,
                    Signal::SIGSTOP if thread.stop_requested => thread.stop_requested = false,
                    other => {
                        trace!("delaying {other} of thread {wpid}");
                        thread.delayed_signal = Some(other);
                    }
                }
                return Ok(Some(wpid));
            }

            match sig {
                Signal::SIGTRAP => {
                    thread.running = false;
                    thread.setbp = true;
                    return Ok(Some(wpid));
                }
                Signal::SIGSTOP if thread.stop_requested => {
                    thread.stop_requested = false;
                    self.resume_thread(wpid, None)?;
                }
                other => {
                    trace!("passing {other} on to thread {wpid}");
                    self.resume_thread(wpid, Some(other))?;
                }
            }
        }
    }

    fn resume_thread(&mut self, tid: Pid, sig: Option<Signal>) -> Result<()> {
        match self.thread(tid)?.resume_with_signal(sig) {
            Err(DebuggerError::Os(Errno::ESRCH)) => {
                debug!("thread {tid} vanished");
                self.threads.remove(tid);
                Ok(())
            }
            other => other,
        }
    }

    /// Stops every thread after `trapthread` trapped and finds out why
    ///
    /// `None` if the trap thread disappeared in the meantime.
    fn stop_all(&mut self, trapthread: Pid) -> Result<Option<Stop>> {
        for thread in self.threads.list_mut() {
            thread.setbp = false;
        }
        if let Some(t) = self.threads.find_mut(trapthread) {
            t.setbp = true;
        }

        // other threads may have trapped at the same time
        while self.trap_wait(WaitMode::NoHang)?.is_some() {}

        for tid in self.threads.ids() {
            let running = self.threads.find(tid).is_some_and(Thread::is_running);
            if !running {
                continue;
            }
            match self.thread(tid)?.stop() {
                Ok(()) => (),
                Err(DebuggerError::Os(Errno::ESRCH)) => {
                    self.threads.remove(tid);
                }
                Err(e) => return Err(e),
            }
        }
        while self.threads.list().any(Thread::is_running) {
            self.trap_wait(WaitMode::Halt)?;
        }
        trace!("all threads of {} stopped", self.pid);

        for tid in self.threads.ids() {
            let setbp = self.threads.find(tid).is_some_and(|t| t.setbp);
            if setbp {
                let mut thread = self.thread(tid)?;
                // a trap sent with kill must not rewind a thread that stands after a breakpoint
                let adjust = thread.trapped_on_instruction().unwrap_or(true);
                thread.set_current_breakpoint(adjust)?;
            }
        }

        let Some(thread) = self.threads.find(trapthread) else {
            return Ok(None);
        };
        let reason = match thread.current_breakpoint() {
            Some(addr) => self.breakpoint_reason(addr),
            None if self.shared.manual_stop_requested() => StopReason::ManualStop,
            None => StopReason::Unknown,
        };
        let pc = self.thread(trapthread)?.pc()?;
        self.memthread = trapthread;
        debug!("thread {trapthread} stopped at {pc}: {reason:?}");
        Ok(Some(Stop {
            thread: trapthread,
            reason,
            pc,
        }))
    }

    /// Registers a thread we were not told about before
    ///
    /// With `wait_initial`, its initial stop is consumed first. Hardware breakpoints are not
    /// inherited by new threads, they are programmed here.
    fn adopt_thread(&mut self, tid: Pid, wait_initial: bool) -> Result<()> {
        if self.threads.contains(tid) {
            return Ok(());
        }
        if wait_initial {
            let status = sys::wait_for(tid)?;
            if status.is_terminated() {
                return Ok(());
            }
        }
        match self.executor.run(move || sys::trace_clones(tid))? {
            Err(DebuggerError::Os(Errno::ESRCH)) => return Ok(()),
            r => r?,
        }

        let hardware: Vec<_> = self
            .breakpoints
            .iter()
            .filter_map(|bp| Some((bp.slot()?, bp.addr(), bp.watch()?)))
            .collect();
        if !hardware.is_empty() {
            RegisterAccess::new(self.executor.clone(), tid).with_debug_registers(move |drs| {
                for (slot, addr, watch) in hardware {
                    drs.set_breakpoint(slot, addr, watch)?;
                }
                Ok(())
            })?;
        }

        self.threads.add(tid);
        Ok(())
    }

    fn adopt_clones(&mut self) -> Result<()> {
        for tid in self.threads.drain_clones() {
            self.adopt_thread(tid, true)?;
        }
        Ok(())
    }

    /// Lets go of the process
    ///
    /// A launched process is killed if `kill` is set. Otherwise all breakpoints are removed and
    /// every thread is detached; with `kill` the process then receives a `SIGINT`. Nothing happens
    /// if the process is already gone.
    pub fn detach(&mut self, kill: bool) -> Result<()> {
        if matches!(
            self.shared.state(),
            ProcessState::Exited(_) | ProcessState::Detached
        ) {
            return Ok(());
        }

        if kill && self.child_process {
            sys::kill(self.pid, Signal::SIGKILL)?;
            loop {
                match sys::wait_any() {
                    Ok(status) if status.pid() == Some(self.pid) && status.is_terminated() => {
                        break
                    }
                    Ok(_) => continue,
                    Err(DebuggerError::WaitFailed(Errno::ECHILD)) => break,
                    Err(e) => return Err(e),
                }
            }
            info!("killed process {}", self.pid);
            self.exited(-(Signal::SIGKILL as i32));
            return Ok(());
        }

        let memthread = self.memory_thread();
        let target = ProcessTarget::new(&self.executor, &self.shared, memthread, &self.threads);
        self.breakpoints.remove_all(&target)?;

        let pid = self.pid;
        let threads: Vec<(Pid, Option<Signal>)> = self
            .threads
            .list()
            .map(|t| (t.id(), t.delayed_signal()))
            .collect();
        self.executor.run(move || -> Result<()> {
            for (tid, sig) in threads {
                match sys::detach(tid, sig) {
                    Ok(()) | Err(DebuggerError::Os(Errno::ESRCH)) => (),
                    Err(e) => return Err(e),
                }
            }
            if kill {
                sys::kill(pid, Signal::SIGINT)?;
            }
            Ok(())
        })??;

        info!("detached from process {pid}");
        self.shared.set_state(ProcessState::Detached);
        self.executor.close();
        self.threads = ThreadRegistry::new();
        Ok(())
    }

    /// Marks the process as exited and returns the matching error
    fn exited(&mut self, status: i32) -> DebuggerError {
        self.stop_reason = StopReason::Exited;
        self.breakpoints.forget_all();
        self.threads = ThreadRegistry::new();
        post_exit(&self.shared, &self.executor, status)
    }

    /// Drops the bookkeeping of a process that a thread operation found dead
    fn on_error(&mut self, e: DebuggerError) -> DebuggerError {
        if matches!(self.shared.state(), ProcessState::Exited(_)) {
            self.stop_reason = StopReason::Exited;
            self.breakpoints.forget_all();
            self.threads = ThreadRegistry::new();
        }
        e
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if let Err(e) = self.detach(self.child_process) {
            warn!("could not release process {}: {e}", self.pid);
        }
    }
}

/// Records the end of the process and shuts its executor down
pub(crate) fn post_exit(shared: &Shared, executor: &PtraceExecutor, status: i32) -> DebuggerError {
    shared.set_state(ProcessState::Exited(status));
    executor.close();
    DebuggerError::ProcessExited {
        pid: shared.pid(),
        status,
    }
}

/// Arms breakpoints through the memory thread and programs hardware slots on all threads
struct ProcessTarget<'p> {
    executor: &'p Arc<PtraceExecutor>,
    shared: &'p Shared,
    memthread: Pid,
    threads: Vec<Pid>,
}

impl<'p> ProcessTarget<'p> {
    fn new(
        executor: &'p Arc<PtraceExecutor>,
        shared: &'p Shared,
        memthread: Pid,
        threads: &ThreadRegistry,
    ) -> Self {
        Self {
            executor,
            shared,
            memthread,
            threads: threads.ids(),
        }
    }

    fn memory(&self) -> MemoryIO<'p> {
        MemoryIO::new(self.executor, self.shared, self.memthread)
    }

    fn each_thread<F>(&self, f: F) -> Result<()>
    where
        F: Fn(&mut DebugRegisters) -> Result<()> + Clone + Send + 'static,
    {
        for tid in &self.threads {
            RegisterAccess::new(self.executor.clone(), *tid).with_debug_registers(f.clone())?;
        }
        Ok(())
    }
}

impl BreakpointTarget for ProcessTarget<'_> {
    fn read_memory(&self, addr: Addr, len: usize) -> Result<Vec<u8>> {
        self.memory().read(addr, len)
    }

    fn write_memory(&self, addr: Addr, data: &[u8]) -> Result<()> {
        self.memory().write(addr, data).map(|_| ())
    }

    fn write_hardware(&self, slot: u8, addr: Addr, watch: WatchType) -> Result<()> {
        self.each_thread(move |drs| drs.set_breakpoint(slot, addr, watch))
    }

    fn clear_hardware(&self, slot: u8) -> Result<()> {
        self.each_thread(move |drs| drs.clear_breakpoint(slot))
    }
}
