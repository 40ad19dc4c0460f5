use std::path::PathBuf;
use std::time::Duration;

use nativeproc::addr::Addr;
use nativeproc::breakpoint::{WatchKind, WatchType};
use nativeproc::errors::DebuggerError;
use nativeproc::launch::LaunchOptions;
use nativeproc::process::ProcessHandle;
use nativeproc::stop::Stop;

use clap::Parser;
use nix::unistd::Pid;
use tracing::{debug, info, trace, Level};

/// Run a program under ptrace and report every stop
///
/// Breakpoints are given as hexadecimal addresses. Each stop is printed as one line, or as one
/// JSON object per line with `--json`.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Attach to a running process instead of launching one
    #[arg(short, long, conflicts_with = "program")]
    attach: Option<i32>,

    /// Break at the entry point of the program
    #[arg(short, long)]
    entry: bool,

    /// Software breakpoint
    #[arg(short, long = "break", value_parser = parse_addr)]
    breakpoints: Vec<Addr>,

    /// Hardware watchpoint, as ADDR:w|rw:SIZE
    #[arg(short, long = "watch", value_parser = parse_watch)]
    watchpoints: Vec<(Addr, WatchType)>,

    /// Detach after this many stops
    #[arg(short = 'n', long, default_value_t = 64)]
    max_stops: usize,

    /// Interrupt the process if it did not stop within this many seconds
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Keep address space randomization enabled
    #[arg(long)]
    aslr: bool,

    /// Kill the process instead of letting it run on when done
    #[arg(short, long)]
    kill: bool,

    /// Print stops as JSON lines
    #[arg(long)]
    json: bool,

    /// More logging, may be repeated
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// The program to launch and its arguments
    #[arg(trailing_var_arg = true, required_unless_present = "attach")]
    program: Vec<String>,
}

fn main() -> Result<(), DebuggerError> {
    human_panic::setup_panic!();
    let args = Args::parse();
    setup_logger(args.verbose);

    let mut proc = if let Some(pid) = args.attach {
        ProcessHandle::attach(Pid::from_raw(pid))?
    } else {
        let Some((program, rest)) = args.program.split_first() else {
            return Err(DebuggerError::ExecutableDoesNotExist(String::new()));
        };
        ProcessHandle::launch(
            LaunchOptions::new(PathBuf::from(program))
                .args(rest)
                .disable_aslr(!args.aslr),
        )?
    };
    info!("debugging {} ({})", proc.pid(), proc.comm());

    if args.entry {
        let entry = proc.entry_point()?;
        proc.set_breakpoint(entry, None)?;
    }
    for addr in &args.breakpoints {
        proc.set_breakpoint(*addr, None)?;
    }
    for (addr, watch) in &args.watchpoints {
        proc.set_hardware_breakpoint(*addr, None, *watch, None)?;
    }

    for _ in 0..args.max_stops {
        if let Some(secs) = args.timeout {
            let handle = proc.stop_handle();
            let (tx, rx) = crossbeam_channel::bounded::<()>(0);
            proc.resume_notify(tx);
            std::thread::spawn(move || {
                // wait for the resume, then give the process its time
                let _ = rx.recv();
                std::thread::sleep(Duration::from_secs(secs));
                if handle.request_manual_stop().is_ok() {
                    debug!("timeout, stopping the process");
                }
            });
        }

        match proc.continue_once() {
            Ok(stop) => {
                report(&stop, args.json)?;
                if proc.check_and_clear_manual_stop() {
                    trace!("stop was requested");
                    break;
                }
            }
            Err(DebuggerError::ProcessExited { pid, status }) => {
                if args.json {
                    println!("{}", serde_json::json!({ "pid": pid.as_raw(), "exited": status }));
                } else {
                    println!("process {pid} exited with status {status}");
                }
                return Ok(());
            }
            Err(e) => return Err(e),
        }
    }

    proc.detach(args.kill)?;
    Ok(())
}

fn report(stop: &Stop, json: bool) -> Result<(), DebuggerError> {
    if json {
        println!(
            "{}",
            serde_json::to_string(stop).map_err(std::io::Error::from)?
        );
    } else {
        println!("{stop}");
    }
    Ok(())
}

fn parse_addr(s: &str) -> Result<Addr, String> {
    let digits = s.trim_start_matches("0x");
    usize::from_str_radix(digits, 16)
        .map(Addr::from)
        .map_err(|e| format!("bad address {s}: {e}"))
}

fn parse_watch(s: &str) -> Result<(Addr, WatchType), String> {
    let mut parts = s.split(':');
    let (Some(addr), Some(kind), Some(size), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(format!("expected ADDR:KIND:SIZE, got {s}"));
    };
    let kind = match kind {
        "w" => WatchKind::Write,
        "rw" => WatchKind::ReadWrite,
        "x" => WatchKind::Execute,
        other => return Err(format!("unknown watch kind {other}")),
    };
    let size: u8 = size.parse().map_err(|e| format!("bad size {size}: {e}"))?;
    let watch = WatchType::new(kind, size).map_err(|e| e.to_string())?;
    Ok((parse_addr(addr)?, watch))
}

fn setup_logger(verbose: u8) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    // construct a subscriber that prints formatted traces to stderr
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .finish();
    // use that subscriber to process traces emitted after this point
    tracing::subscriber::set_global_default(subscriber).expect("could not setup logger");
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_program_or_attach_required() {
        let err = Args::try_parse_from(["ntrace"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);

        let args = Args::try_parse_from(["ntrace", "--attach", "42"]).unwrap();
        assert_eq!(args.attach, Some(42));
        assert!(args.program.is_empty());

        let args = Args::try_parse_from(["ntrace", "-b", "0x401000", "true", "-x"]).unwrap();
        assert_eq!(args.program, vec!["true", "-x"]);
        assert_eq!(args.breakpoints, vec![Addr::from(0x401000usize)]);

        assert!(Args::try_parse_from(["ntrace", "--attach", "42", "true"]).is_err());
    }

    #[test]
    fn test_parse_watch() {
        let (addr, watch) = parse_watch("0x404028:w:4").unwrap();
        assert_eq!(addr, Addr::from(0x404028usize));
        assert_eq!(watch, WatchType::new(WatchKind::Write, 4).unwrap());
        assert!(parse_watch("0x404028:r:4").is_err());
        assert!(parse_watch("0x404028:w").is_err());
    }
}
