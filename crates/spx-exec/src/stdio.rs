// SPDX-License-Identifier: MIT OR Apache-2.0
//! Standard stream bindings, pipes, and the background copy tasks that
//! bridge arbitrary readers and writers to the child.

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::OwnedFd;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::sys;

const COPY_BUF_SIZE: usize = 32 * 1024;

/// A writer shared between the caller and a copy task.
pub type SharedWriter = Arc<Mutex<dyn Write + Send>>;

/// One of the three standard streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    /// Standard input.
    Stdin,
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

impl Stream {
    pub(crate) fn index(self) -> usize {
        match self {
            Self::Stdin => 0,
            Self::Stdout => 1,
            Self::Stderr => 2,
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stdin => "stdin",
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        })
    }
}

// ── Bindings ────────────────────────────────────────────────────────

/// Where the child's standard input comes from.
pub struct InputSource(pub(crate) InputKind);

pub(crate) enum InputKind {
    Null,
    Fd(OwnedFd),
    Reader(Box<dyn Read + Send>),
    /// Child end of a pipe handed out by `stdin_pipe`.
    Pipe(OwnedFd),
}

impl InputSource {
    /// Read from the null device.
    pub fn null() -> Self {
        Self(InputKind::Null)
    }

    /// Hand a descriptor to the child directly; no copy task is involved.
    pub fn fd(fd: impl Into<OwnedFd>) -> Self {
        Self(InputKind::Fd(fd.into()))
    }

    /// Feed the child from an arbitrary reader through a copy task.
    pub fn reader(reader: impl Read + Send + 'static) -> Self {
        Self(InputKind::Reader(Box::new(reader)))
    }

    /// Feed the child a fixed byte buffer.
    pub fn bytes(data: impl Into<Vec<u8>>) -> Self {
        Self::reader(io::Cursor::new(data.into()))
    }
}

impl From<File> for InputSource {
    fn from(file: File) -> Self {
        Self::fd(file)
    }
}

impl fmt::Debug for InputSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.0 {
            InputKind::Null => "Null",
            InputKind::Fd(_) => "Fd",
            InputKind::Reader(_) => "Reader",
            InputKind::Pipe(_) => "Pipe",
        };
        f.debug_tuple("InputSource").field(&kind).finish()
    }
}

/// Where the child's standard output or error goes.
pub struct OutputTarget(pub(crate) OutputKind);

pub(crate) enum OutputKind {
    Null,
    Fd(OwnedFd),
    Writer(SharedWriter),
    /// Child end of a pipe handed out by `stdout_pipe`/`stderr_pipe`.
    Pipe(OwnedFd),
}

impl OutputTarget {
    /// Discard output.
    pub fn null() -> Self {
        Self(OutputKind::Null)
    }

    /// Hand a descriptor to the child directly; no copy task is involved.
    pub fn fd(fd: impl Into<OwnedFd>) -> Self {
        Self(OutputKind::Fd(fd.into()))
    }

    /// Copy output into `writer` through a copy task.
    pub fn writer(writer: impl Write + Send + 'static) -> Self {
        Self(OutputKind::Writer(Arc::new(Mutex::new(writer))))
    }

    /// Copy output into a writer the caller keeps a handle to.
    ///
    /// Binding stdout and stderr to clones of the same `Arc` makes both
    /// streams share one descriptor and one copy task, so their bytes are
    /// interleaved exactly as the child wrote them.
    pub fn shared(writer: SharedWriter) -> Self {
        Self(OutputKind::Writer(writer))
    }
}

impl From<File> for OutputTarget {
    fn from(file: File) -> Self {
        Self::fd(file)
    }
}

impl fmt::Debug for OutputTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.0 {
            OutputKind::Null => "Null",
            OutputKind::Fd(_) => "Fd",
            OutputKind::Writer(_) => "Writer",
            OutputKind::Pipe(_) => "Pipe",
        };
        f.debug_tuple("OutputTarget").field(&kind).finish()
    }
}

fn same_writer(a: &SharedWriter, b: &SharedWriter) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a).cast::<()>(),
        Arc::as_ptr(b).cast::<()>(),
    )
}

// ── Pipe accessors ──────────────────────────────────────────────────

/// Parent end of an accessor pipe. Shared with the command so that
/// `wait` can close it after the child is reaped.
///
/// I/O runs on a cloned handle outside the lock, so `close` never waits
/// for an in-flight read or write; the descriptor itself is released when
/// that call returns.
pub(crate) struct PipeEnd {
    file: Mutex<Option<Arc<File>>>,
}

impl PipeEnd {
    fn new(fd: OwnedFd) -> Arc<Self> {
        Arc::new(Self {
            file: Mutex::new(Some(Arc::new(File::from(fd)))),
        })
    }

    pub(crate) fn close(&self) {
        let file = self
            .file
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(file);
    }

    fn with<T>(&self, f: impl FnOnce(&File) -> io::Result<T>) -> io::Result<T> {
        let file = self
            .file
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match file {
            Some(file) => f(&file),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe already closed")),
        }
    }
}

/// Writable end of the child's stdin pipe.
///
/// Dropping (or [`close`](PipeWriter::close)-ing) it delivers end-of-file to
/// the child. `wait` closes it as well once the child has been reaped.
pub struct PipeWriter {
    end: Arc<PipeEnd>,
}

impl PipeWriter {
    /// Close the pipe, delivering end-of-file to the child.
    pub fn close(&self) {
        self.end.close();
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.end.with(|mut f| f.write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.end.with(|mut f| f.flush())
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.end.close();
    }
}

impl fmt::Debug for PipeWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeWriter").finish_non_exhaustive()
    }
}

/// Readable end of the child's stdout or stderr pipe.
///
/// All reads must finish before `wait`, which closes the pipe after the
/// child is reaped.
pub struct PipeReader {
    end: Arc<PipeEnd>,
}

impl PipeReader {
    /// Close the pipe early; the child gets `EPIPE` on further writes.
    pub fn close(&self) {
        self.end.close();
    }
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.end.with(|mut f| f.read(buf))
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.end.close();
    }
}

impl fmt::Debug for PipeReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeReader").finish_non_exhaustive()
    }
}

/// Create the stdin accessor pipe: `(child binding, parent writer, retained end)`.
pub(crate) fn stdin_pipe() -> io::Result<(InputSource, PipeWriter, Arc<PipeEnd>)> {
    let (r, w) = sys::pipe()?;
    let end = PipeEnd::new(w);
    Ok((
        InputSource(InputKind::Pipe(r)),
        PipeWriter { end: end.clone() },
        end,
    ))
}

/// Create an output accessor pipe: `(child binding, parent reader, retained end)`.
pub(crate) fn output_pipe() -> io::Result<(OutputTarget, PipeReader, Arc<PipeEnd>)> {
    let (r, w) = sys::pipe()?;
    let end = PipeEnd::new(r);
    Ok((
        OutputTarget(OutputKind::Pipe(w)),
        PipeReader { end: end.clone() },
        end,
    ))
}

// ── Child-facing plan ───────────────────────────────────────────────

/// What descriptor the child sees for one standard stream.
#[derive(Debug)]
pub(crate) enum ChildFd {
    /// The null device.
    Null,
    /// This descriptor, owned by the parent until creation returns.
    Fd(OwnedFd),
    /// A duplicate of the child's stdout (stderr only).
    SameAsStdout,
}

#[derive(Debug)]
pub(crate) struct ChildStdio {
    pub(crate) stdin: ChildFd,
    pub(crate) stdout: ChildFd,
    pub(crate) stderr: ChildFd,
}

type CopyFn = Box<dyn FnOnce() -> io::Result<()> + Send>;

/// Copy tasks prepared before creation; dropped unstarted if creation fails.
pub(crate) struct PendingTasks {
    tasks: Vec<(Stream, CopyFn)>,
}

pub(crate) struct StdioSetup {
    pub(crate) child: ChildStdio,
    pub(crate) tasks: PendingTasks,
}

/// Resolve the three bindings into child descriptors plus copy tasks.
///
/// Any failure drops everything created so far.
pub(crate) fn prepare(
    stdin: Option<InputSource>,
    stdout: Option<OutputTarget>,
    stderr: Option<OutputTarget>,
) -> io::Result<StdioSetup> {
    let mut tasks = Vec::new();

    let child_stdin = match stdin.map(|s| s.0) {
        None | Some(InputKind::Null) => ChildFd::Null,
        Some(InputKind::Fd(fd)) | Some(InputKind::Pipe(fd)) => ChildFd::Fd(fd),
        Some(InputKind::Reader(reader)) => {
            let (r, w) = sys::pipe()?;
            tasks.push((Stream::Stdin, feed_task(reader, File::from(w))));
            ChildFd::Fd(r)
        }
    };

    let stdout = stdout.map(|s| s.0);
    let stderr = stderr.map(|s| s.0);
    let shared = matches!(
        (&stdout, &stderr),
        (Some(OutputKind::Writer(a)), Some(OutputKind::Writer(b))) if same_writer(a, b)
    );

    let child_stdout = output_fd(Stream::Stdout, stdout, &mut tasks)?;
    let child_stderr = if shared {
        ChildFd::SameAsStdout
    } else {
        output_fd(Stream::Stderr, stderr, &mut tasks)?
    };

    Ok(StdioSetup {
        child: ChildStdio {
            stdin: child_stdin,
            stdout: child_stdout,
            stderr: child_stderr,
        },
        tasks: PendingTasks { tasks },
    })
}

fn output_fd(
    stream: Stream,
    kind: Option<OutputKind>,
    tasks: &mut Vec<(Stream, CopyFn)>,
) -> io::Result<ChildFd> {
    Ok(match kind {
        None | Some(OutputKind::Null) => ChildFd::Null,
        Some(OutputKind::Fd(fd)) | Some(OutputKind::Pipe(fd)) => ChildFd::Fd(fd),
        Some(OutputKind::Writer(writer)) => {
            let (r, w) = sys::pipe()?;
            tasks.push((stream, drain_task(File::from(r), writer)));
            ChildFd::Fd(w)
        }
    })
}

fn feed_task(mut reader: Box<dyn Read + Send>, mut pipe: File) -> CopyFn {
    Box::new(move || {
        let result = io::copy(&mut reader, &mut pipe);
        drop(pipe);
        match result {
            Ok(_) => Ok(()),
            // The child is free to stop reading its input.
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
            Err(e) => Err(e),
        }
    })
}

fn drain_task(mut pipe: File, writer: SharedWriter) -> CopyFn {
    Box::new(move || {
        let mut buf = vec![0u8; COPY_BUF_SIZE];
        loop {
            let n = match pipe.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            let mut w = writer.lock().unwrap_or_else(PoisonError::into_inner);
            w.write_all(&buf[..n])?;
        }
        let mut w = writer.lock().unwrap_or_else(PoisonError::into_inner);
        w.flush()
    })
}

// ── Running tasks ───────────────────────────────────────────────────

struct Outcomes {
    slots: Mutex<Vec<Option<io::Result<()>>>>,
    done: Condvar,
}

/// Copy tasks running on their own threads.
pub(crate) struct RunningTasks {
    streams: Vec<Stream>,
    outcomes: Arc<Outcomes>,
    handles: Vec<JoinHandle<()>>,
}

/// Result of synchronising with the copy tasks.
#[derive(Debug)]
pub(crate) enum CopyOutcome {
    Complete,
    Failed(Stream, io::Error),
    TimedOut,
}

impl PendingTasks {
    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Spawn one thread per task.
    pub(crate) fn start(self) -> RunningTasks {
        let outcomes = Arc::new(Outcomes {
            slots: Mutex::new((0..self.tasks.len()).map(|_| None).collect()),
            done: Condvar::new(),
        });
        let mut streams = Vec::with_capacity(self.tasks.len());
        let mut handles = Vec::with_capacity(self.tasks.len());

        for (index, (stream, task)) in self.tasks.into_iter().enumerate() {
            streams.push(stream);
            let shared = outcomes.clone();
            let spawned = thread::Builder::new()
                .name(format!("spx-copy-{stream}"))
                .spawn(move || {
                    let result = catch_unwind(AssertUnwindSafe(task)).unwrap_or_else(|_| {
                        Err(io::Error::other("copy task panicked"))
                    });
                    record(&shared, index, result);
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => record(&outcomes, index, Err(e)),
            }
        }

        RunningTasks {
            streams,
            outcomes,
            handles,
        }
    }
}

fn record(outcomes: &Outcomes, index: usize, result: io::Result<()>) {
    if let Err(e) = &result {
        debug!(target: "spx.exec.io", index, error = %e, "copy task failed");
    }
    let mut slots = outcomes
        .slots
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    slots[index] = Some(result);
    outcomes.done.notify_all();
}

impl RunningTasks {
    /// Wait for every task, or until `limit` elapses.
    ///
    /// On completion the first failure in task order is reported. On timeout
    /// the unfinished threads are left detached.
    pub(crate) fn join(mut self, limit: Option<Duration>) -> CopyOutcome {
        let deadline = limit.map(|d| Instant::now() + d);
        let mut slots = self
            .outcomes
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while slots.iter().any(Option::is_none) {
            match deadline {
                None => {
                    slots = self
                        .outcomes
                        .done
                        .wait(slots)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        warn!(target: "spx.exec.io", "wait delay expired with copy tasks still running");
                        return CopyOutcome::TimedOut;
                    }
                    slots = self
                        .outcomes
                        .done
                        .wait_timeout(slots, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }

        let mut outcome = CopyOutcome::Complete;
        for (index, slot) in slots.iter_mut().enumerate() {
            if let Some(Err(e)) = slot.take() {
                outcome = CopyOutcome::Failed(self.streams[index], e);
                break;
            }
        }
        drop(slots);

        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[derive(Default)]
    struct Sink(Vec<u8>);

    impl Write for Sink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct FailingWriter;

    impl Write for FailingWriter {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::other("disk full"))
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn unset_streams_map_to_null_without_tasks() {
        let setup = prepare(None, None, None).unwrap();
        assert!(matches!(setup.child.stdin, ChildFd::Null));
        assert!(matches!(setup.child.stdout, ChildFd::Null));
        assert!(matches!(setup.child.stderr, ChildFd::Null));
        assert!(setup.tasks.is_empty());
    }

    #[test]
    fn direct_descriptors_pass_through() {
        let (r, w) = sys::pipe().unwrap();
        let raw = w.as_raw_fd();
        let setup = prepare(Some(InputSource::fd(r)), Some(OutputTarget::fd(w)), None).unwrap();
        match setup.child.stdout {
            ChildFd::Fd(fd) => assert_eq!(fd.as_raw_fd(), raw),
            other => panic!("unexpected {other:?}"),
        }
        assert!(setup.tasks.is_empty());
    }

    #[test]
    fn shared_writer_yields_single_task() {
        let buf: SharedWriter = Arc::new(Mutex::new(Sink::default()));
        let setup = prepare(
            None,
            Some(OutputTarget::shared(buf.clone())),
            Some(OutputTarget::shared(buf)),
        )
        .unwrap();
        assert!(matches!(setup.child.stderr, ChildFd::SameAsStdout));
        assert_eq!(setup.tasks.tasks.len(), 1);
    }

    #[test]
    fn distinct_writers_yield_two_tasks() {
        let setup = prepare(
            None,
            Some(OutputTarget::writer(Sink::default())),
            Some(OutputTarget::writer(Sink::default())),
        )
        .unwrap();
        assert!(matches!(setup.child.stderr, ChildFd::Fd(_)));
        assert_eq!(setup.tasks.tasks.len(), 2);
    }

    #[test]
    fn drain_task_copies_until_eof() {
        let sink = Arc::new(Mutex::new(Sink::default()));
        let (r, w) = sys::pipe().unwrap();
        let task = drain_task(File::from(r), sink.clone());
        let mut w = File::from(w);
        w.write_all(b"hello world").unwrap();
        drop(w);
        task().unwrap();
        assert_eq!(sink.lock().unwrap().0, b"hello world");
    }

    #[test]
    fn feed_task_ignores_broken_pipe() {
        let (r, w) = sys::pipe().unwrap();
        drop(r);
        let task = feed_task(Box::new(io::Cursor::new(vec![7u8; 1 << 20])), File::from(w));
        task().unwrap();
    }

    #[test]
    fn join_reports_first_failure_in_task_order() {
        let pending = PendingTasks {
            tasks: vec![
                (Stream::Stdin, Box::new(|| Ok(())) as CopyFn),
                (
                    Stream::Stdout,
                    Box::new(|| Err(io::Error::other("first"))) as CopyFn,
                ),
                (
                    Stream::Stderr,
                    Box::new(|| Err(io::Error::other("second"))) as CopyFn,
                ),
            ],
        };
        match pending.start().join(None) {
            CopyOutcome::Failed(stream, e) => {
                assert_eq!(stream, Stream::Stdout);
                assert_eq!(e.to_string(), "first");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn join_times_out_on_stuck_task() {
        let (r, w) = sys::pipe().unwrap();
        let sink: SharedWriter = Arc::new(Mutex::new(Sink::default()));
        let pending = PendingTasks {
            tasks: vec![(Stream::Stdout, drain_task(File::from(r), sink))],
        };
        let running = pending.start();
        let outcome = running.join(Some(Duration::from_millis(50)));
        assert!(matches!(outcome, CopyOutcome::TimedOut));
        drop(w);
    }

    #[test]
    fn failing_writer_surfaces_error() {
        let (r, w) = sys::pipe().unwrap();
        let task = drain_task(File::from(r), Arc::new(Mutex::new(FailingWriter)));
        let mut w = File::from(w);
        w.write_all(b"x").unwrap();
        drop(w);
        assert_eq!(task().unwrap_err().to_string(), "disk full");
    }

    #[test]
    fn pipe_writer_drop_closes() {
        let (binding, writer, end) = stdin_pipe().unwrap();
        drop(writer);
        assert!(end.with(|_| Ok(())).is_err());
        drop(binding);
    }

    #[test]
    fn stream_names() {
        assert_eq!(Stream::Stdin.to_string(), "stdin");
        assert_eq!(Stream::Stderr.index(), 2);
    }
}
