// SPDX-License-Identifier: MIT OR Apache-2.0
//! Process creation engines.
//!
//! Two engines sit behind the [`Spawner`] seam: a `posix_spawn` engine,
//! compiled on macOS, that drives the child's descriptor layout through a
//! file-action list, and a fork/exec engine that delegates to
//! [`std::process::Command`]. Both hand back a bare pid; reaping is always
//! done by [`Process`](crate::Process).

mod actions;
mod fork_exec;
#[cfg(target_os = "macos")]
mod posix;

use std::ffi::{CString, OsString};
use std::fmt;
use std::io;
use std::os::fd::{OwnedFd, RawFd};
use std::path::PathBuf;

use spx_config::SpawnStrategy;
use tracing::debug;

use crate::error::ExecError;
use crate::stdio::ChildStdio;

/// A concrete process-creation engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Engine {
    /// `posix_spawn` with file actions and spawn attributes.
    PosixSpawn,
    /// The host's fork/exec facility.
    ForkExec,
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PosixSpawn => "posix_spawn",
            Self::ForkExec => "fork_exec",
        })
    }
}

impl Engine {
    /// Pick the engine for `strategy` on this build.
    pub fn select(strategy: SpawnStrategy) -> Result<Self, ExecError> {
        match strategy {
            SpawnStrategy::ForkExec => Ok(Self::ForkExec),
            SpawnStrategy::Auto if cfg!(target_os = "macos") => Ok(Self::PosixSpawn),
            SpawnStrategy::Auto => Ok(Self::ForkExec),
            SpawnStrategy::PosixSpawn if cfg!(target_os = "macos") => Ok(Self::PosixSpawn),
            SpawnStrategy::PosixSpawn => Err(ExecError::Unsupported {
                feature: "the posix_spawn strategy",
                engine: Self::ForkExec,
            }),
        }
    }

    /// What this engine can honour on the running system.
    pub fn capabilities(self) -> Capabilities {
        match self {
            Self::ForkExec => Capabilities {
                working_dir: true,
                process_group: true,
                new_session: true,
                controlling_terminal: true,
            },
            #[cfg(target_os = "macos")]
            Self::PosixSpawn => Capabilities {
                working_dir: posix::supports_chdir(),
                process_group: true,
                new_session: true,
                controlling_terminal: false,
            },
            #[cfg(not(target_os = "macos"))]
            Self::PosixSpawn => Capabilities::default(),
        }
    }
}

/// Attribute support reported by an [`Engine`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// A working directory can be set for the child.
    pub working_dir: bool,
    /// The child can be placed in a process group.
    pub process_group: bool,
    /// The child can start a new session.
    pub new_session: bool,
    /// Controlling-terminal and foreground attributes are available.
    pub controlling_terminal: bool,
}

/// Process attributes applied in the child before the program image runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcAttr {
    /// Join (or with `Some(0)`, create) this process group.
    pub process_group: Option<i32>,
    /// Start a new session.
    pub setsid: bool,
    /// Terminal descriptor used by `setctty` and `foreground`, numbered as
    /// the child sees it (after stdio and extra files are in place).
    pub ctty: Option<RawFd>,
    /// Make `ctty` the controlling terminal. Requires `setsid`.
    pub setctty: bool,
    /// Detach from the inherited controlling terminal.
    pub noctty: bool,
    /// Make the child's process group the foreground group of `ctty`.
    pub foreground: bool,
}

impl ProcAttr {
    pub(crate) fn needs_terminal(&self) -> bool {
        self.setctty || self.noctty || self.foreground
    }
}

/// Everything an engine needs to create one process.
pub(crate) struct SpawnRequest {
    pub(crate) path: PathBuf,
    pub(crate) argv: Vec<OsString>,
    pub(crate) env: Vec<(OsString, OsString)>,
    pub(crate) dir: Option<PathBuf>,
    pub(crate) attrs: ProcAttr,
    pub(crate) stdio: ChildStdio,
    pub(crate) extra: Vec<OwnedFd>,
}

/// The narrow interface both engines implement.
pub(crate) trait Spawner {
    /// Create the process and return its pid. Consumes the child-facing
    /// descriptors in `request`; they are closed in the parent on return.
    fn spawn(&self, request: SpawnRequest) -> io::Result<libc::pid_t>;
}

/// Create a process with `engine`.
pub(crate) fn spawn(engine: Engine, request: SpawnRequest) -> io::Result<libc::pid_t> {
    debug!(
        target: "spx.exec.spawn",
        %engine,
        path = %request.path.display(),
        argc = request.argv.len(),
        extra_fds = request.extra.len(),
        "creating process"
    );
    match engine {
        Engine::ForkExec => fork_exec::ForkExecSpawner.spawn(request),
        #[cfg(target_os = "macos")]
        Engine::PosixSpawn => posix::PosixSpawner.spawn(request),
        #[cfg(not(target_os = "macos"))]
        Engine::PosixSpawn => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "posix_spawn engine is not compiled in",
        )),
    }
}

/// Build a C string, rejecting interior NULs as invalid input.
#[cfg_attr(not(any(target_os = "macos", test)), allow(dead_code))]
pub(crate) fn c_string(bytes: impl Into<Vec<u8>>) -> io::Result<CString> {
    CString::new(bytes).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("argument contains a NUL byte at offset {}", e.nul_position()),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fork_exec_is_always_available() {
        assert_eq!(
            Engine::select(SpawnStrategy::ForkExec).unwrap(),
            Engine::ForkExec
        );
        let caps = Engine::ForkExec.capabilities();
        assert!(caps.working_dir && caps.controlling_terminal);
    }

    #[cfg(not(target_os = "macos"))]
    #[test]
    fn posix_spawn_strategy_is_rejected_without_the_engine() {
        assert_eq!(
            Engine::select(SpawnStrategy::Auto).unwrap(),
            Engine::ForkExec
        );
        let err = Engine::select(SpawnStrategy::PosixSpawn).unwrap_err();
        assert!(matches!(err, ExecError::Unsupported { .. }));
    }

    #[cfg(target_os = "macos")]
    #[test]
    fn auto_prefers_posix_spawn() {
        assert_eq!(
            Engine::select(SpawnStrategy::Auto).unwrap(),
            Engine::PosixSpawn
        );
        assert!(!Engine::PosixSpawn.capabilities().controlling_terminal);
    }

    #[test]
    fn nul_bytes_are_invalid_input() {
        let err = c_string(b"a\0b".to_vec()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(c_string("ok").is_ok());
    }

    #[test]
    fn engine_names() {
        assert_eq!(Engine::PosixSpawn.to_string(), "posix_spawn");
        assert_eq!(Engine::ForkExec.to_string(), "fork_exec");
    }

    #[test]
    fn terminal_attributes_are_detected() {
        assert!(!ProcAttr::default().needs_terminal());
        let attrs = ProcAttr {
            noctty: true,
            ..ProcAttr::default()
        };
        assert!(attrs.needs_terminal());
    }
}
