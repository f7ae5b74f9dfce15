// SPDX-License-Identifier: MIT OR Apache-2.0
//! Descriptor layout for the `posix_spawn` engine, expressed as a plain
//! list of file actions so it can be built and checked on any unix.
#![cfg_attr(not(target_os = "macos"), allow(dead_code))]

use std::ffi::{CStr, CString};
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use crate::stdio::{ChildFd, ChildStdio};
use crate::sys;

const DEV_NULL: &CStr = c"/dev/null";

/// One step applied in the child between creation and program start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FileAction {
    /// Open `path` with `flags` onto descriptor `fd`.
    Open {
        fd: RawFd,
        path: &'static CStr,
        flags: libc::c_int,
    },
    /// Duplicate `src` onto `dst`, clearing close-on-exec on `dst`.
    Dup2 { src: RawFd, dst: RawFd },
    /// Change the working directory.
    Chdir(CString),
}

/// Ordered file actions plus the descriptors they reference.
#[derive(Debug)]
pub(crate) struct SpawnPlan {
    pub(crate) actions: Vec<FileAction>,
    /// Relocated duplicates that must stay open until creation returns.
    relocated: Vec<OwnedFd>,
}

impl SpawnPlan {
    /// Lay out stdio on 0..=2, `extra[i]` on `3 + i`, then change directory.
    ///
    /// Every source descriptor is first moved to a number at or above
    /// `3 + extra.len()` so no duplicate can clobber a source that a later
    /// action still reads.
    pub(crate) fn build(
        stdio: &ChildStdio,
        extra: &[OwnedFd],
        dir: Option<&CStr>,
    ) -> io::Result<Self> {
        let floor = 3 + extra.len() as RawFd;
        let mut relocated = Vec::new();
        let mut source = |fd: &OwnedFd| -> io::Result<RawFd> {
            if fd.as_raw_fd() >= floor {
                return Ok(fd.as_raw_fd());
            }
            let high = sys::dup_at_least(fd, floor)?;
            let raw = high.as_raw_fd();
            relocated.push(high);
            Ok(raw)
        };

        let mut actions = Vec::with_capacity(4 + extra.len());
        let streams = [
            (0, &stdio.stdin, libc::O_RDONLY),
            (1, &stdio.stdout, libc::O_WRONLY),
            (2, &stdio.stderr, libc::O_WRONLY),
        ];
        for (target, child, flags) in streams {
            match child {
                ChildFd::Null => actions.push(FileAction::Open {
                    fd: target,
                    path: DEV_NULL,
                    flags,
                }),
                ChildFd::Fd(fd) => actions.push(FileAction::Dup2 {
                    src: source(fd)?,
                    dst: target,
                }),
                ChildFd::SameAsStdout => actions.push(FileAction::Dup2 { src: 1, dst: target }),
            }
        }
        for (i, fd) in extra.iter().enumerate() {
            actions.push(FileAction::Dup2 {
                src: source(fd)?,
                dst: 3 + i as RawFd,
            });
        }
        if let Some(dir) = dir {
            actions.push(FileAction::Chdir(dir.to_owned()));
        }

        Ok(Self { actions, relocated })
    }

    /// Number of descriptors that had to be moved out of the target range.
    pub(crate) fn relocated_count(&self) -> usize {
        self.relocated.len()
    }
}
