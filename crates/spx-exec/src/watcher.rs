// SPDX-License-Identifier: MIT OR Apache-2.0
//! Background watcher that turns a cancellation signal into process
//! termination.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use spx_cancel::CancelToken;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::ProcessError;
use crate::process::Process;

/// Custom action run when cancellation fires. Defaults to `SIGKILL`.
pub type AbortFn = Box<dyn FnOnce(&Process) -> Result<(), ProcessError> + Send>;

/// Watches one running process until it is reaped.
pub(crate) struct Watcher {
    done: Option<oneshot::Sender<()>>,
    fired: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Watcher {
    /// Start watching `process`.
    ///
    /// If `token` fires first the abort action runs; if the process is still
    /// not reaped `wait_delay` later, it is sent `SIGKILL`.
    pub(crate) fn spawn(
        token: CancelToken,
        process: Process,
        abort: Option<AbortFn>,
        wait_delay: Option<Duration>,
    ) -> io::Result<Self> {
        let (done_tx, done_rx) = oneshot::channel();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let handle = thread::Builder::new()
            .name("spx-cancel-watch".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        warn!(target: "spx.exec.cancel", error = %e, "cannot start cancellation watcher");
                        return;
                    }
                };
                runtime.block_on(watch(token, process, abort, wait_delay, done_rx, flag));
            })?;

        Ok(Self {
            done: Some(done_tx),
            fired,
            handle: Some(handle),
        })
    }

    /// Tell the watcher the process was reaped and wait for it to exit.
    /// Returns whether cancellation fired.
    pub(crate) fn finish(mut self) -> bool {
        self.stop();
        self.fired.load(Ordering::SeqCst)
    }

    fn stop(&mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn watch(
    token: CancelToken,
    process: Process,
    abort: Option<AbortFn>,
    wait_delay: Option<Duration>,
    mut done: oneshot::Receiver<()>,
    fired: Arc<AtomicBool>,
) {
    tokio::select! {
        _ = &mut done => return,
        () = token.cancelled() => {}
    }

    fired.store(true, Ordering::SeqCst);
    debug!(target: "spx.exec.cancel", pid = process.pid(), "cancellation fired");
    let result = match abort {
        Some(abort) => abort(&process),
        None => process.kill(),
    };
    match result {
        Ok(()) | Err(ProcessError::Finished) => {}
        Err(e) => warn!(target: "spx.exec.cancel", error = %e, "abort action failed"),
    }

    let Some(delay) = wait_delay else {
        return;
    };
    if tokio::time::timeout(delay, &mut done).await.is_err() {
        debug!(target: "spx.exec.cancel", pid = process.pid(), ?delay, "wait delay elapsed, killing");
        if let Err(e) = process.kill() {
            if !matches!(e, ProcessError::Finished) {
                warn!(target: "spx.exec.cancel", error = %e, "forced kill failed");
            }
        }
    }
}
