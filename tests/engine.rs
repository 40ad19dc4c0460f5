//! Continue engine scenarios on a small C program, `tests/fixtures/debuggee.c`.
//!
//! The program is compiled once per test run with the system C compiler. Addresses of its
//! functions are taken from `nm`, the binary is not position independent.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Command;

use nativeproc::breakpoint::{WatchKind, WatchType};
use nativeproc::dump::{NT_AUXV, NT_PRPSINFO, NT_PRSTATUS, PRSTATUS_SIZE};
use nativeproc::errors::DebuggerError;
use nativeproc::launch::{LaunchOptions, Redirect};
use nativeproc::process::ProcessHandle;
use nativeproc::stop::StopReason;
use nativeproc::Addr;

use nix::sys::signal::{kill, Signal};
use once_cell::sync::Lazy;
use serial_test::serial;

static DEBUGGEE: Lazy<PathBuf> = Lazy::new(|| {
    let src = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/debuggee.c");
    let out = Path::new(env!("CARGO_TARGET_TMPDIR")).join("debuggee");
    let status = Command::new("cc")
        .args(["-O0", "-g", "-no-pie", "-pthread", "-o"])
        .arg(&out)
        .arg(&src)
        .status()
        .expect("a C compiler is needed to build the debuggee");
    assert!(status.success(), "could not build {}", src.display());
    out
});

fn symbol(name: &str) -> Addr {
    let out = Command::new("nm")
        .arg(&*DEBUGGEE)
        .output()
        .expect("nm is needed to find symbols");
    String::from_utf8_lossy(&out.stdout)
        .lines()
        .find_map(|line| {
            let mut fields = line.split_whitespace();
            let (addr, _kind, sym) = (fields.next()?, fields.next()?, fields.next()?);
            if sym == name {
                usize::from_str_radix(addr, 16).ok()
            } else {
                None
            }
        })
        .map(Addr::from)
        .unwrap_or_else(|| panic!("no symbol {name} in the debuggee"))
}

fn launch(mode: &str) -> ProcessHandle {
    ProcessHandle::launch(
        LaunchOptions::new(DEBUGGEE.as_path())
            .arg(mode)
            .stdout(Redirect::Null),
    )
    .expect("could not launch the debuggee")
}

fn expect_exit(proc: &mut ProcessHandle, status: i32) {
    match proc.continue_once() {
        Err(DebuggerError::ProcessExited { status: s, .. }) => assert_eq!(s, status),
        other => panic!("expected exit status {status}, got {other:?}"),
    }
}

#[test]
#[serial]
fn test_software_breakpoint_hit() {
    let target = symbol("target");
    let mut proc = launch("plain");
    proc.set_breakpoint(target, None).unwrap();

    let stop = proc.continue_once().unwrap();
    assert_eq!((stop.reason, stop.pc), (StopReason::BreakpointHit, target));
    let thread = proc.thread(stop.thread).unwrap();
    assert!(thread.trapped_on_instruction().unwrap());
    assert_eq!(thread.thread().current_breakpoint(), Some(target));

    expect_exit(&mut proc, 0);
}

#[test]
#[serial]
fn test_signal_at_breakpoint_reaches_handler() {
    let target = symbol("target");
    let mut proc = launch("signal");
    proc.set_breakpoint(target, None).unwrap();
    let stop = proc.continue_once().unwrap();
    assert_eq!(stop.pc, target);

    // arrives while the thread steps over the breakpoint, is held back and delivered on resume
    kill(proc.pid(), Signal::SIGUSR1).unwrap();
    expect_exit(&mut proc, 10);
}

#[test]
#[serial]
fn test_fault_during_step_over_is_delivered() {
    let fault = symbol("fault_store");
    let mut proc = launch("fault");
    proc.set_breakpoint(fault, None).unwrap();
    let stop = proc.continue_once().unwrap();
    assert_eq!((stop.reason, stop.pc), (StopReason::BreakpointHit, fault));

    // the SIGSEGV handler exits with 42
    expect_exit(&mut proc, 42);
}

#[test]
#[serial]
fn test_hardware_execute_breakpoint() {
    let target = symbol("target");
    let mut proc = launch("plain");
    let bp = proc
        .set_hardware_breakpoint(target, Some(7), WatchType::execute(), None)
        .unwrap();
    assert_eq!(bp.slot(), Some(0));
    // the code is untouched
    let code = proc.memory().read(target, 1).unwrap();
    assert_ne!(code, vec![0xcc]);

    let stop = proc.continue_once().unwrap();
    assert_eq!((stop.reason, stop.pc), (StopReason::BreakpointHit, target));
    let thread = proc.thread(stop.thread).unwrap();
    assert_eq!(thread.thread().current_breakpoint(), Some(target));
    assert!(!thread.trapped_on_instruction().unwrap());

    expect_exit(&mut proc, 0);
}

#[test]
#[serial]
fn test_write_watchpoint() {
    let watched = symbol("watched");
    let mut proc = launch("watch");
    let watch = WatchType::new(WatchKind::Write, 4).unwrap();
    proc.set_hardware_breakpoint(watched, None, watch, None)
        .unwrap();

    let stop = proc.continue_once().unwrap();
    assert_eq!(stop.reason, StopReason::WatchpointHit);
    assert_eq!(
        proc.find_thread(stop.thread).unwrap().current_breakpoint(),
        Some(watched)
    );
    // data watchpoints trap after the store
    assert_eq!(proc.memory().read(watched, 4).unwrap(), 7i32.to_ne_bytes());

    expect_exit(&mut proc, 0);
}

#[test]
#[serial]
fn test_breakpoint_hit_by_all_threads() {
    let target = symbol("target");
    let mut proc = launch("threads");
    let pid = proc.pid();
    proc.set_breakpoint(target, None).unwrap();

    let mut hitters = HashSet::new();
    let mut hits = 0;
    for _ in 0..32 {
        match proc.continue_once() {
            Ok(stop) => {
                assert_eq!((stop.reason, stop.pc), (StopReason::BreakpointHit, target));
                for thread in proc.list_threads() {
                    if thread.current_breakpoint() == Some(target) {
                        hits += 1;
                        hitters.insert(thread.id());
                        assert!(!thread.is_running());
                    }
                }
            }
            Err(DebuggerError::ProcessExited { status, .. }) => {
                assert_eq!(status, 0);
                break;
            }
            Err(e) => panic!("unexpected error {e}"),
        }
    }
    assert_eq!(hits, 4);
    assert_eq!(hitters.len(), 4);
    assert!(!hitters.contains(&pid));
}

#[test]
#[serial]
fn test_dump_notes() {
    let target = symbol("target");
    let mut proc = launch("threads");
    proc.set_breakpoint(target, None).unwrap();
    proc.continue_once().unwrap();
    let threads = proc.list_threads().count();
    assert!(threads > 1);

    let notes = proc.dump_notes().unwrap();
    assert_eq!(notes[0].kind, NT_PRPSINFO);
    assert_eq!(&notes[0].data[40..48], b"debuggee");
    // psargs starts with the absolute path of the executable
    assert_eq!(notes[0].data[56], b'/');
    assert_eq!(notes[1].kind, NT_AUXV);
    assert_eq!(notes.len(), 2 + 2 * threads);

    let status: Vec<_> = notes.iter().filter(|n| n.kind == NT_PRSTATUS).collect();
    assert_eq!(status.len(), threads);
    assert!(status.iter().all(|n| n.data.len() == PRSTATUS_SIZE));
    for note in &notes {
        assert_eq!(note.encode().len() % 4, 0);
    }

    let map = proc.dumpable_memory_map().unwrap();
    assert!(map.find(target).unwrap().permissions.execute);
    proc.detach(true).unwrap();
}
