// SPDX-License-Identifier: MIT OR Apache-2.0
//! Launch external programs, wire their standard streams, and report how
//! they finished.
//!
//! [`Command`] is the entry point: build it with a program name, bind its
//! streams, then [`run`](Command::run) it or drive
//! [`start`](Command::start)/[`wait`](Command::wait) yourself.
//!
//! Streams bound to a descriptor are handed to the child directly. Streams
//! bound to an arbitrary reader or writer go through a pipe serviced by a
//! background copy thread, joined in `wait` after the child is reaped and
//! the parent's pipe ends are closed.
//!
//! On macOS processes are created with `posix_spawn` and an explicit
//! file-action list; elsewhere creation is delegated to
//! [`std::process::Command`]. Either way the child is reaped by
//! [`Process`], which reports resource usage alongside the exit status.
#![cfg(unix)]
#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

mod command;
mod error;
mod process;
mod spawn;
mod status;
mod stdio;
mod sys;
mod watcher;

pub use command::Command;
pub use error::{ExecError, ExitError, Misuse, ProcessError};
pub use process::Process;
pub use spawn::{Capabilities, Engine, ProcAttr};
pub use status::{ExitStatus, ResourceUsage};
pub use stdio::{InputSource, OutputTarget, PipeReader, PipeWriter, SharedWriter, Stream};
pub use watcher::AbortFn;

pub use nix::sys::signal::Signal;
pub use spx_cancel::CancelToken;
pub use spx_config::{ExecConfig, SpawnStrategy};
pub use spx_which::{LookupCause, LookupError, look_path};
