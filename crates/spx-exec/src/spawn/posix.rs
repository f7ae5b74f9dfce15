// SPDX-License-Identifier: MIT OR Apache-2.0
//! `posix_spawn` engine for macOS.

use std::ffi::{CString, OsStr};
use std::io;
use std::mem::MaybeUninit;
use std::os::unix::ffi::OsStrExt;
use std::ptr;
use std::sync::OnceLock;
use tracing::trace;

use super::actions::{FileAction, SpawnPlan};
use super::{SpawnRequest, Spawner, c_string};

// `libc` declares these as `c_int`; `posix_spawnattr_setflags` takes `c_short`.
const POSIX_SPAWN_SETPGROUP: libc::c_short = libc::POSIX_SPAWN_SETPGROUP as libc::c_short;
const POSIX_SPAWN_SETSIGDEF: libc::c_short = libc::POSIX_SPAWN_SETSIGDEF as libc::c_short;
const POSIX_SPAWN_SETSIGMASK: libc::c_short = libc::POSIX_SPAWN_SETSIGMASK as libc::c_short;
const POSIX_SPAWN_CLOEXEC_DEFAULT: libc::c_short =
    libc::POSIX_SPAWN_CLOEXEC_DEFAULT as libc::c_short;
// Not exported by `libc` for Darwin; value from <spawn.h>.
const POSIX_SPAWN_SETSID: libc::c_short = 0x0400;

type AddChdirFn =
    unsafe extern "C" fn(*mut libc::posix_spawn_file_actions_t, *const libc::c_char) -> libc::c_int;

/// Resolve `posix_spawn_file_actions_addchdir{,_np}` once per process.
fn addchdir() -> Option<AddChdirFn> {
    static ADDCHDIR: OnceLock<Option<AddChdirFn>> = OnceLock::new();
    *ADDCHDIR.get_or_init(|| {
        for name in [
            c"posix_spawn_file_actions_addchdir",
            c"posix_spawn_file_actions_addchdir_np",
        ] {
            // SAFETY: dlsym with RTLD_DEFAULT and a NUL-terminated name.
            let sym = unsafe { libc::dlsym(libc::RTLD_DEFAULT, name.as_ptr()) };
            if !sym.is_null() {
                trace!(target: "spx.exec.spawn", symbol = ?name, "chdir file action available");
                // SAFETY: both symbols share this signature.
                return Some(unsafe { std::mem::transmute::<*mut libc::c_void, AddChdirFn>(sym) });
            }
        }
        None
    })
}

/// Whether a working directory can be applied through a file action.
pub(crate) fn supports_chdir() -> bool {
    addchdir().is_some()
}

fn check(rc: libc::c_int) -> io::Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(rc))
    }
}

struct FileActions(libc::posix_spawn_file_actions_t);

impl FileActions {
    fn new() -> io::Result<Self> {
        let mut raw = MaybeUninit::uninit();
        // SAFETY: init writes a valid object on success.
        check(unsafe { libc::posix_spawn_file_actions_init(raw.as_mut_ptr()) })?;
        // SAFETY: initialised above.
        Ok(Self(unsafe { raw.assume_init() }))
    }

    fn push(&mut self, action: &FileAction) -> io::Result<()> {
        // SAFETY: `self.0` is initialised; every path is NUL-terminated and
        // outlives the spawn call.
        let rc = unsafe {
            match action {
                FileAction::Open { fd, path, flags } => libc::posix_spawn_file_actions_addopen(
                    &mut self.0,
                    *fd,
                    path.as_ptr(),
                    *flags,
                    0,
                ),
                FileAction::Dup2 { src, dst } => {
                    libc::posix_spawn_file_actions_adddup2(&mut self.0, *src, *dst)
                }
                FileAction::Chdir(dir) => match addchdir() {
                    Some(add) => add(&mut self.0, dir.as_ptr()),
                    None => libc::ENOSYS,
                },
            }
        };
        check(rc)
    }
}

impl Drop for FileActions {
    fn drop(&mut self) {
        // SAFETY: initialised in `new`.
        unsafe {
            libc::posix_spawn_file_actions_destroy(&mut self.0);
        }
    }
}

struct SpawnAttr(libc::posix_spawnattr_t);

impl SpawnAttr {
    fn new() -> io::Result<Self> {
        let mut raw = MaybeUninit::uninit();
        // SAFETY: init writes a valid object on success.
        check(unsafe { libc::posix_spawnattr_init(raw.as_mut_ptr()) })?;
        // SAFETY: initialised above.
        Ok(Self(unsafe { raw.assume_init() }))
    }
}

impl Drop for SpawnAttr {
    fn drop(&mut self) {
        // SAFETY: initialised in `new`.
        unsafe {
            libc::posix_spawnattr_destroy(&mut self.0);
        }
    }
}

/// Null-terminated pointer array borrowing from `strings`.
fn pointer_array(strings: &[CString]) -> Vec<*mut libc::c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr().cast_mut())
        .chain(std::iter::once(ptr::null_mut()))
        .collect()
}

fn env_entry(key: &OsStr, value: &OsStr) -> io::Result<CString> {
    let mut bytes = Vec::with_capacity(key.len() + value.len() + 1);
    bytes.extend_from_slice(key.as_bytes());
    bytes.push(b'=');
    bytes.extend_from_slice(value.as_bytes());
    c_string(bytes)
}

pub(crate) struct PosixSpawner;

impl Spawner for PosixSpawner {
    fn spawn(&self, request: SpawnRequest) -> io::Result<libc::pid_t> {
        let path = c_string(request.path.as_os_str().as_bytes())?;
        let argv = request
            .argv
            .iter()
            .map(|a| c_string(a.as_bytes()))
            .collect::<io::Result<Vec<_>>>()?;
        let envp = request
            .env
            .iter()
            .map(|(k, v)| env_entry(k, v))
            .collect::<io::Result<Vec<_>>>()?;
        let dir = request
            .dir
            .as_ref()
            .map(|d| c_string(d.as_os_str().as_bytes()))
            .transpose()?;

        let plan = SpawnPlan::build(&request.stdio, &request.extra, dir.as_deref())?;
        trace!(
            target: "spx.exec.spawn",
            actions = plan.actions.len(),
            relocated = plan.relocated_count(),
            "posix_spawn file actions"
        );

        let mut actions = FileActions::new()?;
        for action in &plan.actions {
            actions.push(action)?;
        }

        let mut attr = SpawnAttr::new()?;
        let mut flags =
            POSIX_SPAWN_CLOEXEC_DEFAULT | POSIX_SPAWN_SETSIGDEF | POSIX_SPAWN_SETSIGMASK;
        // SAFETY: `attr.0` is initialised and the sigsets are filled before use.
        unsafe {
            let mut all: libc::sigset_t = std::mem::zeroed();
            let mut none: libc::sigset_t = std::mem::zeroed();
            libc::sigfillset(&mut all);
            libc::sigemptyset(&mut none);
            check(libc::posix_spawnattr_setsigdefault(&mut attr.0, &all))?;
            check(libc::posix_spawnattr_setsigmask(&mut attr.0, &none))?;
            if let Some(pgid) = request.attrs.process_group {
                flags |= POSIX_SPAWN_SETPGROUP;
                check(libc::posix_spawnattr_setpgroup(&mut attr.0, pgid))?;
            }
            if request.attrs.setsid {
                flags |= POSIX_SPAWN_SETSID;
            }
            check(libc::posix_spawnattr_setflags(&mut attr.0, flags))?;
        }

        let argv_ptrs = pointer_array(&argv);
        let envp_ptrs = pointer_array(&envp);
        let mut pid: libc::pid_t = 0;
        // SAFETY: every pointer refers to a live, NUL-terminated buffer owned
        // by this frame; the arrays are null-terminated.
        check(unsafe {
            libc::posix_spawn(
                &mut pid,
                path.as_ptr(),
                &actions.0,
                &attr.0,
                argv_ptrs.as_ptr(),
                envp_ptrs.as_ptr(),
            )
        })?;

        // Child-facing descriptors and relocated duplicates close here.
        drop(plan);
        drop(request);
        Ok(pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chdir_capability_is_stable() {
        assert_eq!(supports_chdir(), supports_chdir());
    }

    #[test]
    fn pointer_array_is_null_terminated() {
        let strings = vec![CString::new("a").unwrap(), CString::new("b").unwrap()];
        let ptrs = pointer_array(&strings);
        assert_eq!(ptrs.len(), 3);
        assert!(ptrs[2].is_null());
    }

    #[test]
    fn env_entries_are_joined_with_equals() {
        let entry = env_entry("K".as_ref(), "v=1".as_ref()).unwrap();
        assert_eq!(entry.as_bytes(), b"K=v=1");
    }
}
