//! # Launching
//!
//! Configuration of a process that is started under the debugger.
//!
//! [`LaunchOptions`] is a builder. [`ProcessHandle::launch`](crate::process::ProcessHandle::launch)
//! hands it to the ptrace executor, which starts the program with `PTRACE_TRACEME` so that the
//! executor thread becomes its tracer. The new process stops with a `SIGTRAP` right after `exec`.

use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use nix::sys::personality::{self, Persona};
use nix::sys::ptrace;
use nix::unistd::Pid;
use tracing::{debug, error, info};

use crate::errors::{DebuggerError, Result};

/// Where a standard stream of the launched process goes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Redirect {
    /// Shared with the debugger
    #[default]
    Inherit,
    /// `/dev/null`
    Null,
    /// A file, created or truncated for output streams
    File(PathBuf),
}

impl Redirect {
    fn open(&self, output: bool) -> Result<Stdio> {
        Ok(match self {
            Redirect::Inherit => Stdio::inherit(),
            Redirect::Null => Stdio::null(),
            Redirect::File(path) if output => File::create(path)?.into(),
            Redirect::File(path) => File::open(path)?.into(),
        })
    }
}

/// How to start a debugged program
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchOptions {
    program: PathBuf,
    args: Vec<OsString>,
    cwd: Option<PathBuf>,
    env: Vec<(OsString, OsString)>,
    disable_aslr: bool,
    stdin: Redirect,
    stdout: Redirect,
    stderr: Redirect,
}

impl LaunchOptions {
    /// Starts `program` without arguments and with address space randomization disabled
    ///
    /// A bare name without a `/` is looked up in `PATH`.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            disable_aslr: true,
            stdin: Redirect::Inherit,
            stdout: Redirect::Inherit,
            stderr: Redirect::Inherit,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_owned()));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Adds a variable to the inherited environment
    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.env
            .push((key.as_ref().to_owned(), value.as_ref().to_owned()));
        self
    }

    pub fn disable_aslr(mut self, disable: bool) -> Self {
        self.disable_aslr = disable;
        self
    }

    pub fn stdin(mut self, redirect: Redirect) -> Self {
        self.stdin = redirect;
        self
    }

    pub fn stdout(mut self, redirect: Redirect) -> Self {
        self.stdout = redirect;
        self
    }

    pub fn stderr(mut self, redirect: Redirect) -> Self {
        self.stderr = redirect;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn arguments(&self) -> &[OsString] {
        &self.args
    }

    pub fn aslr_disabled(&self) -> bool {
        self.disable_aslr
    }

    /// The executable that will be started
    ///
    /// # Errors
    ///
    /// * [`DebuggerError::Which`] if a bare name is not in `PATH`
    /// * [`DebuggerError::ExecutableDoesNotExist`] or [`DebuggerError::ExecutableIsNotAFile`]
    ///   for a bad path
    pub fn resolve_program(&self) -> Result<PathBuf> {
        let path = if self.program.components().count() == 1 && !self.program.has_root() {
            which::which(&self.program)?
        } else {
            self.program.clone()
        };

        if !path.exists() {
            let err = DebuggerError::ExecutableDoesNotExist(path.to_string_lossy().to_string());
            error!("{err}");
            return Err(err);
        }
        if !path.is_file() {
            let err = DebuggerError::ExecutableIsNotAFile(path.to_string_lossy().to_string());
            error!("{err}");
            return Err(err);
        }
        Ok(path)
    }

    /// Starts the program as a tracee of the calling thread
    ///
    /// Must run on the ptrace executor. The caller has to wait for the initial `SIGTRAP`.
    pub(crate) fn spawn_traced(&self) -> Result<Pid> {
        let path = self.resolve_program()?;

        let mut cmd = Command::new(&path);
        cmd.args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(self.stdin.open(false)?)
            .stdout(self.stdout.open(true)?)
            .stderr(self.stderr.open(true)?);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }

        let disable_aslr = self.disable_aslr;
        // SAFETY: the hook only issues async-signal-safe syscalls
        unsafe {
            cmd.pre_exec(move || {
                if disable_aslr {
                    // seccomp profiles of containers may refuse this, the program then runs
                    // randomized
                    if let Ok(persona) = personality::get() {
                        let _ = personality::set(persona | Persona::ADDR_NO_RANDOMIZE);
                    }
                }
                ptrace::traceme()?;
                Ok(())
            });
        }

        info!("starting {}", path.display());
        let child = cmd.spawn()?;
        let pid = Pid::from_raw(child.id() as i32);
        debug!("launched {} as {pid}", path.display());
        // the child is reaped with waitpid by the continue engine, not by std
        drop(child);
        Ok(pid)
    }
}
