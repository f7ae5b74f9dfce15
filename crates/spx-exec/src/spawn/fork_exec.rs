// SPDX-License-Identifier: MIT OR Apache-2.0
//! Fork/exec engine built on [`std::process::Command`].

use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::Stdio;
use tracing::trace;

use super::{ProcAttr, SpawnRequest, Spawner};
use crate::stdio::ChildFd;
use crate::sys;

pub(crate) struct ForkExecSpawner;

impl Spawner for ForkExecSpawner {
    fn spawn(&self, request: SpawnRequest) -> io::Result<libc::pid_t> {
        let SpawnRequest {
            path,
            argv,
            env,
            dir,
            attrs,
            stdio,
            extra,
        } = request;

        let mut cmd = std::process::Command::new(&path);
        if let Some((arg0, rest)) = argv.split_first() {
            cmd.arg0(arg0).args(rest);
        }
        cmd.env_clear().envs(env);
        if let Some(dir) = &dir {
            cmd.current_dir(dir);
        }

        let mut stdout_copy = match (&stdio.stdout, &stdio.stderr) {
            (ChildFd::Fd(fd), ChildFd::SameAsStdout) => Some(fd.try_clone()?),
            _ => None,
        };
        cmd.stdin(to_stdio(stdio.stdin, &mut None))
            .stdout(to_stdio(stdio.stdout, &mut None))
            .stderr(to_stdio(stdio.stderr, &mut stdout_copy));

        if let Some(pgid) = attrs.process_group {
            cmd.process_group(pgid);
        }

        // Sources sit above every target so the dup2 loop below never
        // overwrites one it has yet to read.
        let floor = 3 + extra.len() as RawFd;
        let relocated = extra
            .iter()
            .map(|fd| sys::dup_at_least(fd, floor))
            .collect::<io::Result<Vec<OwnedFd>>>()?;
        let sources: Vec<RawFd> = relocated.iter().map(AsRawFd::as_raw_fd).collect();
        trace!(target: "spx.exec.spawn", extra = sources.len(), ?attrs, "fork/exec");

        let child_attrs = attrs.clone();
        // SAFETY: the hook only calls async-signal-safe libc functions and
        // touches no heap memory besides the captured, pre-built vector.
        unsafe {
            cmd.pre_exec(move || in_child(&child_attrs, &sources));
        }

        // std opens its exec-status pipe on the lowest free numbers; keep
        // every number below the floor taken so the dup2 loop cannot
        // clobber it.
        let placeholders = if extra.is_empty() {
            Vec::new()
        } else {
            occupy_below(floor)?
        };
        let child = cmd.spawn();
        drop(placeholders);
        let child = child?;
        drop(relocated);
        drop(extra);
        // The pid is reaped by `Process`; dropping `Child` neither waits
        // nor kills.
        Ok(child.id() as libc::pid_t)
    }
}

/// Opens `/dev/null` until the kernel hands out a descriptor `>= floor`,
/// returning the ones below it.
fn occupy_below(floor: RawFd) -> io::Result<Vec<File>> {
    let mut held = Vec::new();
    loop {
        let file = File::open("/dev/null")?;
        if file.as_raw_fd() >= floor {
            return Ok(held);
        }
        held.push(file);
    }
}

fn to_stdio(child: ChildFd, stdout_copy: &mut Option<OwnedFd>) -> Stdio {
    match child {
        ChildFd::Null => Stdio::null(),
        ChildFd::Fd(fd) => Stdio::from(fd),
        ChildFd::SameAsStdout => stdout_copy.take().map_or_else(Stdio::null, Stdio::from),
    }
}

fn cvt(rc: libc::c_int) -> io::Result<()> {
    if rc == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Runs in the forked child, after stdio, directory, and process group are set.
fn in_child(attrs: &ProcAttr, extra: &[RawFd]) -> io::Result<()> {
    reset_signal_dispositions();

    for (i, &fd) in extra.iter().enumerate() {
        // SAFETY: plain descriptor duplication.
        cvt(unsafe { libc::dup2(fd, 3 + i as RawFd) })?;
    }

    if attrs.setsid {
        // SAFETY: no memory is involved.
        if unsafe { libc::setsid() } == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    if attrs.noctty {
        // SAFETY: TIOCNOTTY takes no argument.
        cvt(unsafe { libc::ioctl(0, libc::TIOCNOTTY as _) })?;
    }
    if let Some(tty) = attrs.ctty {
        if attrs.setctty {
            // SAFETY: TIOCSCTTY takes an int flag.
            cvt(unsafe { libc::ioctl(tty, libc::TIOCSCTTY as _, 0) })?;
        }
        if attrs.foreground {
            set_foreground(tty)?;
        }
    }
    Ok(())
}

fn reset_signal_dispositions() {
    for sig in 1..32 {
        if sig == libc::SIGKILL || sig == libc::SIGSTOP {
            continue;
        }
        // SAFETY: signal(2) is async-signal-safe; errors for reserved
        // numbers are ignored.
        unsafe {
            libc::signal(sig, libc::SIG_DFL);
        }
    }
}

fn set_foreground(tty: RawFd) -> io::Result<()> {
    // SAFETY: sigset_t values are initialised by sigemptyset before use and
    // the mask is restored before returning.
    unsafe {
        let mut block: libc::sigset_t = std::mem::zeroed();
        let mut old: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut block);
        libc::sigaddset(&mut block, libc::SIGTTOU);
        libc::pthread_sigmask(libc::SIG_BLOCK, &block, &mut old);
        let rc = libc::tcsetpgrp(tty, libc::getpgrp());
        let result = cvt(rc);
        libc::pthread_sigmask(libc::SIG_SETMASK, &old, std::ptr::null_mut());
        result
    }
}
