// SPDX-License-Identifier: MIT OR Apache-2.0
//! Error types for launching and waiting on commands.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::spawn::Engine;
use crate::status::ExitStatus;
use crate::stdio::Stream;
use spx_which::LookupError;

/// Errors from [`Command`](crate::Command) operations.
#[derive(Debug, Error)]
pub enum ExecError {
    /// Program name resolution failed when the command was built.
    #[error(transparent)]
    Lookup(#[from] LookupError),

    /// The process could not be created.
    #[error("exec: {}: {source}", path.display())]
    Start {
        /// Program path that was being launched.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// The process ran and finished unsuccessfully.
    #[error(transparent)]
    Exit(#[from] ExitError),

    /// A background copy task failed.
    #[error("exec: copying {stream}: {source}")]
    Copy {
        /// Which standard stream the task served.
        stream: Stream,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// An operation was invoked in the wrong lifecycle state.
    #[error("exec: {0}")]
    Misuse(#[from] Misuse),

    /// Reaping the process failed.
    #[error("exec: wait: {0}")]
    Wait(#[source] ProcessError),

    /// The cancellation token fired before the process was created.
    #[error("exec: cancelled before start")]
    Cancelled,

    /// The process exited but its I/O did not complete within the wait delay.
    #[error("exec: WaitDelay expired before I/O complete")]
    WaitDelayExpired,

    /// The selected engine cannot honour a requested attribute.
    #[error("exec: {feature} is not supported by the {engine} engine")]
    Unsupported {
        /// The attribute that was requested.
        feature: &'static str,
        /// The engine that rejected it.
        engine: Engine,
    },
}

impl ExecError {
    /// Exit code of an unsuccessful process, when that is what failed.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Exit(e) => Some(e.status.exit_code()),
            _ => None,
        }
    }

    /// The [`ExitError`] carried by this error, if any.
    pub fn as_exit(&self) -> Option<&ExitError> {
        match self {
            Self::Exit(e) => Some(e),
            _ => None,
        }
    }

    /// Returns `true` for lifecycle misuse.
    pub fn is_misuse(&self) -> bool {
        matches!(self, Self::Misuse(_))
    }

    /// Returns `true` when the program could not be found on `PATH`.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Lookup(e) if e.is_not_found())
    }
}

/// A process that finished with a non-success status.
#[derive(Debug, Clone, Error)]
#[error("{status}")]
pub struct ExitError {
    /// Decoded status of the finished process.
    pub status: ExitStatus,
    /// Head and tail of the process's stderr, populated by
    /// [`Command::output`](crate::Command::output) when it captured stderr.
    pub stderr: Option<Vec<u8>>,
}

impl ExitError {
    /// Exit code, or `-1` when the process did not exit normally.
    pub fn exit_code(&self) -> i32 {
        self.status.exit_code()
    }
}

/// Lifecycle misuse of a [`Command`](crate::Command).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Misuse {
    /// `start` on a command whose process is already running.
    #[error("already started")]
    AlreadyStarted,
    /// `start` on a command that already ran (or failed to start).
    #[error("already finished")]
    AlreadyFinished,
    /// `wait` before `start`.
    #[error("not started")]
    NotStarted,
    /// A second `wait`.
    #[error("Wait was already called")]
    WaitAlreadyCalled,
    /// The stream was bound before a helper that needs it unset.
    #[error("{0} already set")]
    StreamAlreadySet(Stream),
    /// The pipe accessor for this stream was already used.
    #[error("{0} pipe already requested")]
    PipeAlreadyRequested(Stream),
    /// A pipe accessor was called after start.
    #[error("{0} pipe requested after process started")]
    PipeAfterStart(Stream),
    /// The stream was bound directly after its pipe accessor was used.
    #[error("{0} bound both directly and through a pipe")]
    StreamConflict(Stream),
    /// A terminal attribute needs a controlling terminal descriptor.
    #[error("terminal attribute requires a ctty descriptor")]
    MissingCtty,
}

/// Errors from [`Process`](crate::Process) operations.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The process has already been reaped.
    #[error("process already finished")]
    Finished,
    /// The handle was released and no longer refers to a process.
    #[error("process already released")]
    Released,
    /// The signal number does not name a signal on this platform.
    #[error("invalid signal number {0}")]
    InvalidSignal(i32),
    /// The operating system rejected the operation.
    #[error(transparent)]
    Os(#[from] io::Error),
}

impl From<nix::errno::Errno> for ProcessError {
    fn from(e: nix::errno::Errno) -> Self {
        Self::Os(e.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn misuse_messages_are_prefixed() {
        let e = ExecError::from(Misuse::StreamAlreadySet(Stream::Stdout));
        assert_eq!(e.to_string(), "exec: stdout already set");
        assert!(e.is_misuse());
        assert_eq!(e.exit_code(), None);
    }

    #[test]
    fn exit_error_displays_status() {
        let status = ExitStatus::from_raw(10, 42 << 8, None);
        let e = ExecError::from(ExitError { status, stderr: None });
        assert_eq!(e.to_string(), "exit status 42");
        assert_eq!(e.exit_code(), Some(42));
        assert!(e.as_exit().is_some());
    }

    #[test]
    fn start_error_names_the_path() {
        let e = ExecError::Start {
            path: PathBuf::from("/no/such"),
            source: io::Error::from_raw_os_error(libc::ENOENT),
        };
        assert!(e.to_string().starts_with("exec: /no/such: "));
        assert!(std::error::Error::source(&e).is_some());
    }

    #[test]
    fn unsupported_names_feature_and_engine() {
        let e = ExecError::Unsupported {
            feature: "controlling terminal",
            engine: Engine::PosixSpawn,
        };
        assert_eq!(
            e.to_string(),
            "exec: controlling terminal is not supported by the posix_spawn engine"
        );
    }

    #[test]
    fn process_error_from_errno() {
        let e = ProcessError::from(nix::errno::Errno::ESRCH);
        match e {
            ProcessError::Os(io) => assert_eq!(io.raw_os_error(), Some(libc::ESRCH)),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
