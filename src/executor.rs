//! # Ptrace Executor
//!
//! Serializes all ptrace requests of one traced process onto a single OS thread.
//!
//! The kernel only accepts ptrace requests from the thread that attached to the tracee (or, for
//! a launched process, the thread that forked it). Every caller therefore hands its work to a
//! dedicated worker thread through [`PtraceExecutor::run`] and blocks until the worker has
//! executed it. `std::thread` threads are OS threads and are never migrated, so the worker stays
//! the tracer for the whole lifetime of the process.
//!
//! Jobs run in FIFO order of their submission. Callers that need several ptrace requests to
//! happen without interleaving must bundle them into one job.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Mutex, PoisonError};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use tracing::{error, trace};

use crate::errors::{DebuggerError, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs closures on the tracer thread of a process
#[derive(Debug)]
pub struct PtraceExecutor {
    commands: Mutex<Option<Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PtraceExecutor {
    /// Spawns the worker thread
    ///
    /// # Errors
    ///
    /// Fails if the operating system refuses to create another thread.
    pub fn spawn(name: impl Into<String>) -> Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        let worker = std::thread::Builder::new()
            .name(name.into())
            .spawn(move || Self::work(rx))?;

        Ok(Self {
            commands: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    fn work(rx: Receiver<Job>) {
        trace!("ptrace worker started");
        for job in rx {
            // the completion channel of a panicking job is dropped, its caller sees the panic
            if catch_unwind(AssertUnwindSafe(job)).is_err() {
                error!("a ptrace job panicked");
            }
        }
        trace!("ptrace worker stopped");
    }

    /// Executes `f` on the tracer thread and returns its result
    ///
    /// Blocks the calling thread until the job has been executed.
    ///
    /// # Errors
    ///
    /// * [`DebuggerError::ExecutorClosed`] if [`close`](Self::close) was already called
    /// * [`DebuggerError::ExecutorJobPanicked`] if `f` panicked
    pub fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        // only clone the sender under the lock, never wait while holding it
        let commands = self
            .commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(DebuggerError::ExecutorClosed)?;

        let (done_tx, done_rx) = crossbeam_channel::bounded::<T>(1);
        commands
            .send(Box::new(move || {
                // the caller is blocked on the receiver, it can not be gone
                let _ = done_tx.send(f());
            }))
            .map_err(|_| DebuggerError::ExecutorClosed)?;
        drop(commands);

        done_rx
            .recv()
            .map_err(|_| DebuggerError::ExecutorJobPanicked)
    }

    /// True until [`close`](Self::close) was called
    pub fn is_open(&self) -> bool {
        self.commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Stops the worker thread
    ///
    /// Jobs submitted before this call are still executed. Calling this more than once is a
    /// no-op. Must not be called from a job.
    pub fn close(&self) {
        let sender = self
            .commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if sender.is_none() {
            return;
        }
        drop(sender);

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if worker.thread().id() == std::thread::current().id() {
                return;
            }
            if worker.join().is_err() {
                error!("the ptrace worker thread panicked");
            }
        }
    }
}

impl Drop for PtraceExecutor {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[test]
    fn test_run_returns_value() {
        let ex = PtraceExecutor::spawn("test-executor").unwrap();
        assert_eq!(ex.run(|| 19 + 23).unwrap(), 42);
        ex.close();
    }

    #[test]
    fn test_runs_on_one_thread() {
        let ex = PtraceExecutor::spawn("test-executor").unwrap();
        let first = ex.run(|| std::thread::current().id()).unwrap();
        for _ in 0..16 {
            assert_eq!(ex.run(|| std::thread::current().id()).unwrap(), first);
        }
        assert_ne!(first, std::thread::current().id());
    }

    #[test]
    fn test_fifo_order() {
        let ex = PtraceExecutor::spawn("test-executor").unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..32 {
            let log = log.clone();
            ex.run(move || log.lock().unwrap().push(i)).unwrap();
        }
        assert_eq!(*log.lock().unwrap(), (0..32).collect::<Vec<_>>());
    }

    #[test]
    fn test_concurrent_callers() {
        let ex = Arc::new(PtraceExecutor::spawn("test-executor").unwrap());
        let handles: Vec<_> = (0..8u64)
            .map(|i| {
                let ex = ex.clone();
                std::thread::spawn(move || ex.run(move || i * 2).unwrap())
            })
            .collect();
        let mut results: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        results.sort_unstable();
        assert_eq!(results, (0..8).map(|i| i * 2).collect::<Vec<_>>());
    }

    #[test]
    fn test_fail_fast_after_close() {
        let ex = PtraceExecutor::spawn("test-executor").unwrap();
        assert!(ex.is_open());
        ex.close();
        ex.close();
        assert!(!ex.is_open());
        assert!(matches!(ex.run(|| ()), Err(DebuggerError::ExecutorClosed)));
    }

    #[test]
    fn test_panicking_job() {
        let ex = PtraceExecutor::spawn("test-executor").unwrap();
        let r: Result<()> = ex.run(|| panic!("boom"));
        assert!(matches!(r, Err(DebuggerError::ExecutorJobPanicked)));
        // the worker survives
        assert_eq!(ex.run(|| 7).unwrap(), 7);
    }
}
