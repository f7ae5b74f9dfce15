// SPDX-License-Identifier: MIT OR Apache-2.0
//! What to launch, and the start/wait lifecycle of the launched process.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::mem;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use spx_cancel::CancelToken;
use spx_capture::PrefixSuffixSaver;
use spx_config::{ExecConfig, SpawnStrategy};
use spx_which::{LookupCause, LookupError};
use tracing::{debug, warn};

use crate::error::{ExecError, ExitError, Misuse, ProcessError};
use crate::process::Process;
use crate::spawn::{self, Engine, ProcAttr, SpawnRequest};
use crate::status::ExitStatus;
use crate::stdio::{
    self, CopyOutcome, InputSource, OutputTarget, PipeEnd, PipeReader, PipeWriter, RunningTasks,
    SharedWriter, Stream,
};
use crate::watcher::{AbortFn, Watcher};

fn default_config() -> &'static ExecConfig {
    static DEFAULT: OnceLock<ExecConfig> = OnceLock::new();
    DEFAULT.get_or_init(ExecConfig::from_env)
}

enum State {
    Configured,
    Running(Box<Running>),
    Finished,
}

struct Running {
    process: Process,
    tasks: RunningTasks,
    watcher: Option<Watcher>,
}

/// A command to launch, and after [`start`](Command::start), the process
/// launched from it.
///
/// A `Command` drives exactly one process: it can be started once and
/// waited on once.
///
/// ```no_run
/// use spx_exec::Command;
///
/// let mut cmd = Command::new("sh");
/// cmd.args(["-c", "echo hello"]);
/// let out = cmd.output()?;
/// assert_eq!(out, b"hello\n");
/// # Ok::<(), spx_exec::ExecError>(())
/// ```
pub struct Command {
    path: PathBuf,
    args: Vec<OsString>,
    env: Option<Vec<(OsString, OsString)>>,
    dir: Option<PathBuf>,
    stdin: Option<InputSource>,
    stdout: Option<OutputTarget>,
    stderr: Option<OutputTarget>,
    extra_files: Vec<OwnedFd>,
    attrs: ProcAttr,
    cancel: Option<CancelToken>,
    abort: Option<AbortFn>,
    wait_delay: Option<Duration>,
    config: ExecConfig,

    lookup_err: Option<LookupError>,
    pipe_used: [bool; 3],
    conflict: Option<Stream>,
    parent_pipes: Vec<Arc<PipeEnd>>,
    state: State,
    waited: bool,
    process: Option<Process>,
    status: Option<ExitStatus>,
    cancelled: bool,
}

// ── Construction ────────────────────────────────────────────────────

impl Command {
    /// Build a command running `name`.
    ///
    /// `name` becomes `argv[0]` verbatim. A bare name (no `/`) is resolved
    /// through `PATH` right away; a resolution failure is stored and
    /// returned by the first [`start`](Command::start).
    pub fn new(name: impl AsRef<str>) -> Self {
        let name = name.as_ref();
        let mut cmd = Self::unresolved(name);
        if !name.contains('/') {
            match spx_which::look_path(name) {
                Ok(path) => cmd.path = path,
                Err(e) => {
                    debug!(target: "spx.exec", name, error = %e, "lookup failed, deferring");
                    cmd.lookup_err = Some(e);
                }
            }
        }
        cmd
    }

    /// Like [`new`](Command::new), but the process is aborted when `token`
    /// is cancelled.
    pub fn with_cancel(token: CancelToken, name: impl AsRef<str>) -> Self {
        let mut cmd = Self::new(name);
        cmd.cancel = Some(token);
        cmd
    }

    fn unresolved(name: &str) -> Self {
        Self {
            path: PathBuf::from(name),
            args: vec![OsString::from(name)],
            env: None,
            dir: None,
            stdin: None,
            stdout: None,
            stderr: None,
            extra_files: Vec::new(),
            attrs: ProcAttr::default(),
            cancel: None,
            abort: None,
            wait_delay: None,
            config: default_config().clone(),
            lookup_err: None,
            pipe_used: [false; 3],
            conflict: None,
            parent_pipes: Vec::new(),
            state: State::Configured,
            waited: false,
            process: None,
            status: None,
            cancelled: false,
        }
    }

    /// Append one argument.
    pub fn arg(&mut self, arg: impl AsRef<OsStr>) -> &mut Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_owned()));
        self
    }

    /// Replace the whole argument vector, `argv[0]` included. An empty
    /// vector runs the program with `argv == [path]`.
    pub fn argv<I, S>(&mut self, argv: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args = argv.into_iter().map(|a| a.as_ref().to_owned()).collect();
        self
    }

    fn env_mut(&mut self) -> &mut Vec<(OsString, OsString)> {
        self.env
            .get_or_insert_with(|| std::env::vars_os().collect())
    }

    /// Set one environment variable. The first change seeds the override
    /// from the current process environment.
    pub fn env(&mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> &mut Self {
        upsert(
            self.env_mut(),
            key.as_ref().to_owned(),
            value.as_ref().to_owned(),
        );
        self
    }

    /// Set several environment variables.
    pub fn envs<I, K, V>(&mut self, vars: I) -> &mut Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        for (k, v) in vars {
            self.env(k, v);
        }
        self
    }

    /// Remove an environment variable from the child's environment.
    pub fn env_remove(&mut self, key: impl AsRef<OsStr>) -> &mut Self {
        let key = key.as_ref();
        self.env_mut().retain(|(k, _)| k != key);
        self
    }

    /// Start the child with an empty environment.
    pub fn env_clear(&mut self) -> &mut Self {
        self.env = Some(Vec::new());
        self
    }

    /// Working directory for the child. A relative program path is
    /// interpreted relative to it.
    pub fn dir(&mut self, dir: impl AsRef<Path>) -> &mut Self {
        self.dir = Some(dir.as_ref().to_owned());
        self
    }

    /// Bind the child's standard input.
    pub fn stdin(&mut self, source: InputSource) -> &mut Self {
        if self.pipe_used[Stream::Stdin.index()] {
            self.conflict.get_or_insert(Stream::Stdin);
        } else {
            self.stdin = Some(source);
        }
        self
    }

    /// Bind the child's standard output.
    pub fn stdout(&mut self, target: OutputTarget) -> &mut Self {
        if self.pipe_used[Stream::Stdout.index()] {
            self.conflict.get_or_insert(Stream::Stdout);
        } else {
            self.stdout = Some(target);
        }
        self
    }

    /// Bind the child's standard error.
    pub fn stderr(&mut self, target: OutputTarget) -> &mut Self {
        if self.pipe_used[Stream::Stderr.index()] {
            self.conflict.get_or_insert(Stream::Stderr);
        } else {
            self.stderr = Some(target);
        }
        self
    }

    /// Pass `fd` to the child as descriptor `3 + i`, where `i` counts the
    /// extra files added before it.
    pub fn extra_file(&mut self, fd: impl Into<OwnedFd>) -> &mut Self {
        self.extra_files.push(fd.into());
        self
    }

    /// Replace the process attributes.
    pub fn proc_attr(&mut self, attrs: ProcAttr) -> &mut Self {
        self.attrs = attrs;
        self
    }

    /// Put the child in process group `pgid` (`0` creates a new group led
    /// by the child).
    pub fn process_group(&mut self, pgid: i32) -> &mut Self {
        self.attrs.process_group = Some(pgid);
        self
    }

    /// Action run when the cancellation token fires, instead of `SIGKILL`.
    pub fn cancel_with(
        &mut self,
        abort: impl FnOnce(&Process) -> Result<(), ProcessError> + Send + 'static,
    ) -> &mut Self {
        self.abort = Some(Box::new(abort));
        self
    }

    /// Grace period after cancellation before the child is killed outright,
    /// and the bound on waiting for I/O once the child has exited.
    pub fn wait_delay(&mut self, delay: Duration) -> &mut Self {
        self.wait_delay = Some(delay);
        self
    }

    /// Apply execution settings.
    pub fn with_config(&mut self, config: &ExecConfig) -> &mut Self {
        self.config = config.clone();
        self
    }

    /// Choose the process-creation strategy.
    pub fn strategy(&mut self, strategy: SpawnStrategy) -> &mut Self {
        self.config.strategy = strategy;
        self
    }
}

fn upsert(env: &mut Vec<(OsString, OsString)>, key: OsString, value: OsString) {
    match env.iter_mut().find(|(k, _)| *k == key) {
        Some(slot) => slot.1 = value,
        None => env.push((key, value)),
    }
}

fn dedup_env(pairs: impl IntoIterator<Item = (OsString, OsString)>) -> Vec<(OsString, OsString)> {
    let mut out = Vec::new();
    for (k, v) in pairs {
        upsert(&mut out, k, v);
    }
    out
}

// ── Inspection ──────────────────────────────────────────────────────

impl Command {
    /// The executable path that will be launched.
    pub fn get_path(&self) -> &Path {
        &self.path
    }

    /// The argument vector, `argv[0]` included.
    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    /// The working directory, if one was set.
    pub fn get_dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Attributes applied in the child.
    pub fn get_proc_attr(&self) -> &ProcAttr {
        &self.attrs
    }

    /// The resolution failure stored at construction, if any.
    pub fn lookup_error(&self) -> Option<&LookupError> {
        self.lookup_err.as_ref()
    }

    /// Accept a program found through a relative `PATH` entry.
    ///
    /// Clears a stored [`LookupCause::RelativeToCurrentDir`] failure and
    /// adopts the relative path it matched. Any other stored failure is
    /// returned unchanged.
    pub fn accept_relative_resolution(&mut self) -> Result<&mut Self, ExecError> {
        match self.lookup_err.take() {
            None => Ok(self),
            Some(LookupError {
                cause: LookupCause::RelativeToCurrentDir,
                resolved: Some(path),
                ..
            }) => {
                self.path = path;
                Ok(self)
            }
            Some(other) => {
                self.lookup_err = Some(other.clone());
                Err(other.into())
            }
        }
    }

    /// Effective child environment as `KEY=VALUE` entries. When a key
    /// appears more than once the last value wins.
    pub fn environ(&self) -> Vec<OsString> {
        self.effective_env()
            .into_iter()
            .map(|(k, v)| {
                let mut entry = k;
                entry.push("=");
                entry.push(v);
                entry
            })
            .collect()
    }

    fn effective_env(&self) -> Vec<(OsString, OsString)> {
        match &self.env {
            Some(env) => dedup_env(env.iter().cloned()),
            None => dedup_env(std::env::vars_os()),
        }
    }

    /// Debug rendering: the path followed by the arguments after `argv[0]`.
    /// Not shell-quoted.
    pub fn describe(&self) -> String {
        let parts: Vec<String> = if self.lookup_err.is_some() {
            self.args
                .iter()
                .map(|a| a.to_string_lossy().into_owned())
                .collect()
        } else {
            std::iter::once(self.path.to_string_lossy().into_owned())
                .chain(
                    self.args
                        .iter()
                        .skip(1)
                        .map(|a| a.to_string_lossy().into_owned()),
                )
                .collect()
        };
        parts.join(" ")
    }

    /// Handle to the launched process, after a successful start.
    pub fn process(&self) -> Option<&Process> {
        self.process.as_ref()
    }

    /// Pid of the launched process, after a successful start.
    pub fn id(&self) -> Option<i32> {
        self.process.as_ref().map(|_| self.process_pid())
    }

    fn process_pid(&self) -> i32 {
        match &self.state {
            State::Running(r) => r.process.pid(),
            _ => self.status.map_or(-1, |s| s.pid()),
        }
    }

    /// Exit status, once [`wait`](Command::wait) has reaped the process.
    pub fn status(&self) -> Option<&ExitStatus> {
        self.status.as_ref()
    }

    /// Whether the cancellation token fired while the process ran.
    pub fn was_cancelled(&self) -> bool {
        self.cancelled
    }

    fn effective_wait_delay(&self) -> Option<Duration> {
        self.wait_delay.or_else(|| self.config.wait_delay())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("path", &self.path)
            .field("args", &self.args)
            .field("dir", &self.dir)
            .field("stdin", &self.stdin)
            .field("stdout", &self.stdout)
            .field("stderr", &self.stderr)
            .field("extra_files", &self.extra_files.len())
            .field("attrs", &self.attrs)
            .field("strategy", &self.config.strategy)
            .finish_non_exhaustive()
    }
}

// ── Pipe accessors ──────────────────────────────────────────────────

impl Command {
    fn check_pipe(&self, stream: Stream, assigned: bool) -> Result<(), ExecError> {
        if !matches!(self.state, State::Configured) {
            return Err(Misuse::PipeAfterStart(stream).into());
        }
        if self.pipe_used[stream.index()] {
            return Err(Misuse::PipeAlreadyRequested(stream).into());
        }
        if assigned {
            return Err(Misuse::StreamAlreadySet(stream).into());
        }
        Ok(())
    }

    fn pipe_error(&self, source: std::io::Error) -> ExecError {
        ExecError::Start {
            path: self.path.clone(),
            source,
        }
    }

    /// A pipe connected to the child's standard input.
    ///
    /// Dropping the writer delivers end-of-file to the child; `wait` also
    /// closes it once the child is reaped.
    pub fn stdin_pipe(&mut self) -> Result<PipeWriter, ExecError> {
        self.check_pipe(Stream::Stdin, self.stdin.is_some())?;
        let (binding, writer, end) = stdio::stdin_pipe().map_err(|e| self.pipe_error(e))?;
        self.stdin = Some(binding);
        self.pipe_used[Stream::Stdin.index()] = true;
        self.parent_pipes.push(end);
        Ok(writer)
    }

    /// A pipe connected to the child's standard output.
    ///
    /// Read to end-of-file before calling `wait`, which closes the pipe.
    pub fn stdout_pipe(&mut self) -> Result<PipeReader, ExecError> {
        self.check_pipe(Stream::Stdout, self.stdout.is_some())?;
        let (binding, reader, end) = stdio::output_pipe().map_err(|e| self.pipe_error(e))?;
        self.stdout = Some(binding);
        self.pipe_used[Stream::Stdout.index()] = true;
        self.parent_pipes.push(end);
        Ok(reader)
    }

    /// A pipe connected to the child's standard error.
    ///
    /// Read to end-of-file before calling `wait`, which closes the pipe.
    pub fn stderr_pipe(&mut self) -> Result<PipeReader, ExecError> {
        self.check_pipe(Stream::Stderr, self.stderr.is_some())?;
        let (binding, reader, end) = stdio::output_pipe().map_err(|e| self.pipe_error(e))?;
        self.stderr = Some(binding);
        self.pipe_used[Stream::Stderr.index()] = true;
        self.parent_pipes.push(end);
        Ok(reader)
    }

    fn close_parent_pipes(&mut self) {
        for end in self.parent_pipes.drain(..) {
            end.close();
        }
    }
}

// ── Lifecycle ───────────────────────────────────────────────────────

impl Command {
    fn check_startable(&self) -> Result<Engine, ExecError> {
        if let Some(err) = &self.lookup_err {
            return Err(err.clone().into());
        }
        match self.state {
            State::Configured => {}
            State::Running(_) => return Err(Misuse::AlreadyStarted.into()),
            State::Finished => return Err(Misuse::AlreadyFinished.into()),
        }
        if let Some(stream) = self.conflict {
            return Err(Misuse::StreamConflict(stream).into());
        }
        if (self.attrs.setctty || self.attrs.foreground) && self.attrs.ctty.is_none() {
            return Err(Misuse::MissingCtty.into());
        }

        let engine = Engine::select(self.config.strategy)?;
        let caps = engine.capabilities();
        let unsupported = |feature| ExecError::Unsupported { feature, engine };
        if self.dir.is_some() && !caps.working_dir {
            return Err(unsupported("working directory"));
        }
        if self.attrs.process_group.is_some() && !caps.process_group {
            return Err(unsupported("process group"));
        }
        if self.attrs.setsid && !caps.new_session {
            return Err(unsupported("new session"));
        }
        if self.attrs.needs_terminal() && !caps.controlling_terminal {
            return Err(unsupported("controlling terminal"));
        }
        Ok(engine)
    }

    fn launch_path(&self) -> std::io::Result<PathBuf> {
        match &self.dir {
            Some(dir) if self.path.is_relative() => std::path::absolute(dir.join(&self.path)),
            _ => Ok(self.path.clone()),
        }
    }

    /// Create the process and begin its copy tasks. Does not wait.
    ///
    /// Lookup, misuse, and capability errors leave the command untouched.
    /// Any later failure leaves no process behind and marks the command
    /// finished.
    pub fn start(&mut self) -> Result<(), ExecError> {
        let engine = self.check_startable()?;
        self.state = State::Finished;

        if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            self.close_parent_pipes();
            return Err(ExecError::Cancelled);
        }

        let path = match self.launch_path() {
            Ok(path) => path,
            Err(source) => return Err(self.start_failed(self.path.clone(), source)),
        };
        let argv = if self.args.is_empty() {
            vec![path.clone().into_os_string()]
        } else {
            self.args.clone()
        };

        let setup = match stdio::prepare(self.stdin.take(), self.stdout.take(), self.stderr.take())
        {
            Ok(setup) => setup,
            Err(source) => return Err(self.start_failed(path, source)),
        };

        let request = SpawnRequest {
            path: path.clone(),
            argv,
            env: self.effective_env(),
            dir: self.dir.clone(),
            attrs: self.attrs.clone(),
            stdio: setup.child,
            extra: mem::take(&mut self.extra_files),
        };
        let pid = match spawn::spawn(engine, request) {
            Ok(pid) => pid,
            Err(source) => return Err(self.start_failed(path, source)),
        };
        let process = Process::from_pid(pid);
        debug!(target: "spx.exec", pid, %engine, path = %path.display(), "started");

        let tasks = setup.tasks.start();
        let watcher = match &self.cancel {
            Some(token) => {
                match Watcher::spawn(
                    token.clone(),
                    process.clone(),
                    self.abort.take(),
                    self.effective_wait_delay(),
                ) {
                    Ok(watcher) => Some(watcher),
                    Err(source) => {
                        // Without a watcher cancellation could not be honoured.
                        let _ = process.kill();
                        let _ = process.wait();
                        self.close_parent_pipes();
                        let _ = tasks.join(self.effective_wait_delay());
                        return Err(ExecError::Start { path, source });
                    }
                }
            }
            None => None,
        };

        self.process = Some(process.clone());
        self.state = State::Running(Box::new(Running {
            process,
            tasks,
            watcher,
        }));
        Ok(())
    }

    fn start_failed(&mut self, path: PathBuf, source: std::io::Error) -> ExecError {
        debug!(target: "spx.exec", path = %path.display(), error = %source, "start failed");
        self.close_parent_pipes();
        ExecError::Start { path, source }
    }

    /// Wait for the process to exit and for its copy tasks to finish.
    ///
    /// The process is reaped first, then the parent ends of accessor pipes
    /// are closed, then the copy tasks are joined. A reap failure wins over
    /// an unsuccessful exit, which wins over an expired wait delay, which
    /// wins over a copy error.
    pub fn wait(&mut self) -> Result<(), ExecError> {
        let running = match mem::replace(&mut self.state, State::Finished) {
            State::Running(running) => *running,
            State::Configured => {
                self.state = State::Configured;
                return Err(Misuse::NotStarted.into());
            }
            State::Finished if self.waited => return Err(Misuse::WaitAlreadyCalled.into()),
            State::Finished => return Err(Misuse::NotStarted.into()),
        };
        self.waited = true;

        let Running {
            process,
            tasks,
            watcher,
        } = running;
        let reaped = process.wait();
        if let Some(watcher) = watcher {
            self.cancelled = watcher.finish();
        }
        self.close_parent_pipes();

        let status = reaped.map_err(ExecError::Wait)?;
        self.status = Some(status);

        let copied = tasks.join(self.effective_wait_delay());
        if !status.success() {
            return Err(ExitError {
                status,
                stderr: None,
            }
            .into());
        }
        match copied {
            CopyOutcome::Complete => Ok(()),
            CopyOutcome::TimedOut => Err(ExecError::WaitDelayExpired),
            CopyOutcome::Failed(stream, source) => {
                warn!(target: "spx.exec.io", %stream, error = %source, "copy task failed");
                Err(ExecError::Copy { stream, source })
            }
        }
    }

    /// Start the command and wait for it.
    pub fn run(&mut self) -> Result<(), ExecError> {
        self.start()?;
        self.wait()
    }

    /// Run the command and return its standard output.
    ///
    /// Unless standard error was bound, its head and tail are captured and
    /// attached to an [`ExitError`] if the process fails.
    pub fn output(&mut self) -> Result<Vec<u8>, ExecError> {
        if self.stdout.is_some() {
            return Err(Misuse::StreamAlreadySet(Stream::Stdout).into());
        }
        let stdout = Arc::new(Mutex::new(Vec::<u8>::new()));
        self.stdout = Some(OutputTarget::shared(stdout.clone()));

        let capture = if self.stderr.is_none() {
            let saver = Arc::new(Mutex::new(PrefixSuffixSaver::new(
                self.config.stderr_capture_limit,
            )));
            self.stderr = Some(OutputTarget::shared(saver.clone()));
            Some(saver)
        } else {
            None
        };

        let result = self.run();
        let out = mem::take(&mut *stdout.lock().unwrap_or_else(PoisonError::into_inner));
        match result {
            Ok(()) => Ok(out),
            Err(ExecError::Exit(mut e)) => {
                if let Some(saver) = capture {
                    let saver = saver.lock().unwrap_or_else(PoisonError::into_inner);
                    e.stderr = Some(saver.bytes());
                }
                Err(ExecError::Exit(e))
            }
            Err(e) => Err(e),
        }
    }

    /// Run the command and return standard output and standard error
    /// interleaved in one buffer.
    pub fn combined_output(&mut self) -> Result<Vec<u8>, ExecError> {
        if self.stdout.is_some() {
            return Err(Misuse::StreamAlreadySet(Stream::Stdout).into());
        }
        if self.stderr.is_some() {
            return Err(Misuse::StreamAlreadySet(Stream::Stderr).into());
        }
        let buf = Arc::new(Mutex::new(Vec::<u8>::new()));
        let shared: SharedWriter = buf.clone();
        self.stdout = Some(OutputTarget::shared(shared.clone()));
        self.stderr = Some(OutputTarget::shared(shared));

        let result = self.run();
        let out = mem::take(&mut *buf.lock().unwrap_or_else(PoisonError::into_inner));
        result.map(|()| out)
    }
}

impl Drop for Command {
    fn drop(&mut self) {
        self.close_parent_pipes();
    }
}
