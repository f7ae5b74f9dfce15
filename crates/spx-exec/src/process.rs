// SPDX-License-Identifier: MIT OR Apache-2.0
//! Handle to a created child process.

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::fmt;
use std::io;
use std::mem::MaybeUninit;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, trace};

use crate::error::ProcessError;
use crate::status::{ExitStatus, ResourceUsage};
use crate::sys::retry_eintr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandleState {
    Live,
    Reaped,
    Released,
}

struct Inner {
    pid: i32,
    state: RwLock<HandleState>,
}

/// A created child process.
///
/// Cloning yields another handle to the same process. Signalling may race
/// freely with [`wait`](Process::wait): a signal is either delivered to the
/// live (or zombie) process or rejected with [`ProcessError::Finished`], never
/// sent to a recycled pid.
#[derive(Clone)]
pub struct Process {
    inner: Arc<Inner>,
}

impl Process {
    pub(crate) fn from_pid(pid: i32) -> Self {
        Self {
            inner: Arc::new(Inner {
                pid,
                state: RwLock::new(HandleState::Live),
            }),
        }
    }

    fn state(&self) -> HandleState {
        *self
            .inner
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Process id, or `-1` once the process was reaped or the handle released.
    pub fn pid(&self) -> i32 {
        match self.state() {
            HandleState::Live => self.inner.pid,
            _ => -1,
        }
    }

    /// Returns `true` once [`wait`](Process::wait) reaped the process.
    pub fn is_finished(&self) -> bool {
        self.state() == HandleState::Reaped
    }

    /// Deliver `sig` to the process.
    pub fn signal(&self, sig: Signal) -> Result<(), ProcessError> {
        // Holding the read lock keeps the reaper out until kill(2) returns,
        // so the pid cannot be recycled underneath us.
        let state = self
            .inner
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        match *state {
            HandleState::Live => {}
            HandleState::Reaped => return Err(ProcessError::Finished),
            HandleState::Released => return Err(ProcessError::Released),
        }
        trace!(target: "spx.exec", pid = self.inner.pid, signal = %sig, "signal");
        signal::kill(Pid::from_raw(self.inner.pid), sig)?;
        Ok(())
    }

    /// Deliver a signal given by number.
    pub fn signal_raw(&self, sig: i32) -> Result<(), ProcessError> {
        let sig = Signal::try_from(sig).map_err(|_| ProcessError::InvalidSignal(sig))?;
        self.signal(sig)
    }

    /// Send `SIGKILL`.
    pub fn kill(&self) -> Result<(), ProcessError> {
        self.signal(Signal::SIGKILL)
    }

    /// Detach the handle from the process without reaping it.
    pub fn release(&self) -> Result<(), ProcessError> {
        let mut state = self
            .inner
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match *state {
            HandleState::Live => {
                *state = HandleState::Released;
                Ok(())
            }
            HandleState::Reaped => Err(ProcessError::Finished),
            HandleState::Released => Err(ProcessError::Released),
        }
    }

    /// Block until the process exits, then reap it.
    ///
    /// Only one call can succeed; later calls (from any clone) fail with
    /// [`ProcessError::Finished`].
    pub fn wait(&self) -> Result<ExitStatus, ProcessError> {
        match self.state() {
            HandleState::Live => {}
            HandleState::Reaped => return Err(ProcessError::Finished),
            HandleState::Released => return Err(ProcessError::Released),
        }
        let pid = self.inner.pid;

        // Wait without consuming the zombie so that signalling stays valid
        // until we hold the write lock.
        retry_eintr(|| block_until_exited(pid))?;

        let mut state = self
            .inner
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match *state {
            HandleState::Live => {}
            HandleState::Reaped => return Err(ProcessError::Finished),
            HandleState::Released => return Err(ProcessError::Released),
        }
        let (raw, rusage) = retry_eintr(|| reap(pid))?;
        *state = HandleState::Reaped;
        drop(state);

        let status = ExitStatus::from_raw(pid, raw, Some(rusage));
        debug!(target: "spx.exec", pid, %status, "reaped");
        Ok(status)
    }
}

fn block_until_exited(pid: i32) -> io::Result<()> {
    let mut info = MaybeUninit::<libc::siginfo_t>::zeroed();
    // SAFETY: `info` is valid for writes; WNOWAIT leaves the child waitable.
    let rc = unsafe {
        libc::waitid(
            libc::P_PID,
            pid as libc::id_t,
            info.as_mut_ptr(),
            libc::WEXITED | libc::WNOWAIT,
        )
    };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn reap(pid: i32) -> io::Result<(i32, ResourceUsage)> {
    let mut status: libc::c_int = 0;
    let mut ru = MaybeUninit::<libc::rusage>::zeroed();
    // SAFETY: both out-pointers are valid for writes.
    let rc = unsafe { libc::wait4(pid, &mut status, 0, ru.as_mut_ptr()) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: wait4 succeeded and filled the struct (it was zeroed regardless).
    let ru = unsafe { ru.assume_init() };
    Ok((status, ResourceUsage::from(ru)))
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.inner.pid)
            .field("state", &self.state())
            .finish()
    }
}
