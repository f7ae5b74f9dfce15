// SPDX-License-Identifier: MIT OR Apache-2.0
//! Microcrate for executable discovery in `PATH`.
//!
//! [`look_path`] follows POSIX shell search rules: names containing a slash
//! are checked directly, everything else is searched for in each `PATH`
//! entry in order, and an empty entry means the current directory. A match
//! found through a relative entry is reported as
//! [`LookupCause::RelativeToCurrentDir`] rather than as a plain success.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::trace;

/// Why a lookup failed to produce a usable executable path.
#[derive(Debug, Error)]
pub enum LookupCause {
    /// No `PATH` entry contains an executable with the requested name.
    #[error("executable file not found in $PATH")]
    NotFound,

    /// The executable was found through a relative `PATH` entry
    /// (explicit `.` or an empty element).
    #[error("cannot run executable found relative to current directory")]
    RelativeToCurrentDir,

    /// The file exists but is a directory or lacks every execute bit.
    #[error("permission denied")]
    NotExecutable,

    /// `stat` on the candidate failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Error returned by [`look_path`] when `name` cannot be classified as an
/// executable.
#[derive(Debug, Clone, Error)]
#[error("exec: {name}: {cause}")]
pub struct LookupError {
    /// The name that was looked up.
    pub name: String,
    /// Underlying cause.
    #[source]
    pub cause: LookupCause,
    /// The relative path that matched, set only for
    /// [`LookupCause::RelativeToCurrentDir`].
    pub resolved: Option<PathBuf>,
}

impl Clone for LookupCause {
    fn clone(&self) -> Self {
        match self {
            Self::NotFound => Self::NotFound,
            Self::RelativeToCurrentDir => Self::RelativeToCurrentDir,
            Self::NotExecutable => Self::NotExecutable,
            Self::Io(e) => Self::Io(match e.raw_os_error() {
                Some(code) => io::Error::from_raw_os_error(code),
                None => io::Error::new(e.kind(), e.to_string()),
            }),
        }
    }
}

impl LookupError {
    fn new(name: &str, cause: LookupCause) -> Self {
        Self {
            name: name.to_string(),
            cause,
            resolved: None,
        }
    }

    /// Returns `true` when no `PATH` directory held a matching executable.
    pub fn is_not_found(&self) -> bool {
        matches!(self.cause, LookupCause::NotFound)
    }

    /// Returns `true` when the match came from a relative `PATH` entry.
    pub fn is_relative_to_current_dir(&self) -> bool {
        matches!(self.cause, LookupCause::RelativeToCurrentDir)
    }
}

/// Search for an executable named `name` using the process `PATH`.
///
/// If `name` contains a slash it is tried directly and returned unchanged.
/// Otherwise the first `PATH` directory holding an executable `name` wins.
pub fn look_path(name: &str) -> Result<PathBuf, LookupError> {
    let path = std::env::var_os("PATH");
    look_path_in(name, path.as_deref())
}

/// Like [`look_path`] but searches the given `PATH`-style list instead of
/// the process environment. `None` and the empty string both mean "no
/// directories".
pub fn look_path_in(name: &str, search_path: Option<&OsStr>) -> Result<PathBuf, LookupError> {
    if has_separator(name) {
        return match find_executable(Path::new(name)) {
            Ok(()) => Ok(PathBuf::from(name)),
            Err(cause) => Err(LookupError::new(name, cause)),
        };
    }

    let search_path = search_path.filter(|p| !p.is_empty());
    if let Some(search_path) = search_path {
        for dir in std::env::split_paths(search_path) {
            // Shell semantics: an empty element means ".".
            let dir = if dir.as_os_str().is_empty() {
                PathBuf::from(".")
            } else {
                dir
            };
            let candidate = dir.join(name);
            if find_executable(&candidate).is_err() {
                continue;
            }
            if !candidate.is_absolute() {
                trace!(target: "spx.which", name, candidate = %candidate.display(), "relative match");
                return Err(LookupError {
                    name: name.to_string(),
                    cause: LookupCause::RelativeToCurrentDir,
                    resolved: Some(candidate),
                });
            }
            trace!(target: "spx.which", name, candidate = %candidate.display(), "resolved");
            return Ok(candidate);
        }
    }

    Err(LookupError::new(name, LookupCause::NotFound))
}

/// Return `true` when `command` resolves to an absolute executable path.
pub fn command_exists(command: &str) -> bool {
    look_path(command).is_ok()
}

/// Reports whether `path` is a regular file with at least one execute bit.
pub fn is_executable(path: &Path) -> bool {
    match std::fs::metadata(path) {
        Ok(meta) => meta.is_file() && has_exec_bit(&meta),
        Err(_) => false,
    }
}

fn has_separator(name: &str) -> bool {
    name.contains('/') || (cfg!(windows) && name.contains('\\'))
}

fn find_executable(path: &Path) -> Result<(), LookupCause> {
    let meta = std::fs::metadata(path)?;
    if meta.is_dir() {
        return Err(LookupCause::NotExecutable);
    }
    if has_exec_bit(&meta) {
        Ok(())
    } else {
        Err(LookupCause::NotExecutable)
    }
}

#[cfg(unix)]
fn has_exec_bit(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn has_exec_bit(_meta: &std::fs::Metadata) -> bool {
    true
}
