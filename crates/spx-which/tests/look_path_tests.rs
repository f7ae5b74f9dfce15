// SPDX-License-Identifier: MIT OR Apache-2.0
//! PATH search behaviour against real files in scratch directories.

use serial_test::serial;
use spx_which::{LookupCause, is_executable, look_path, look_path_in};
use std::ffi::OsString;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

fn write_file(dir: &Path, name: &str, mode: u32) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
    path
}

fn search_path(dirs: &[&Path]) -> OsString {
    std::env::join_paths(dirs).unwrap()
}

struct CwdGuard(PathBuf);

impl CwdGuard {
    fn enter(dir: &Path) -> Self {
        let prev = std::env::current_dir().unwrap();
        std::env::set_current_dir(dir).unwrap();
        Self(prev)
    }
}

impl Drop for CwdGuard {
    fn drop(&mut self) {
        let _ = std::env::set_current_dir(&self.0);
    }
}

// ── Search over PATH entries ────────────────────────────────────────

#[test]
fn resolves_under_a_search_directory() {
    let tmp = tempfile::tempdir().unwrap();
    let exe = write_file(tmp.path(), "tool", 0o755);
    let found = look_path_in("tool", Some(&search_path(&[tmp.path()]))).unwrap();
    assert_eq!(found, exe);
    assert!(found.is_absolute());
}

#[test]
fn first_matching_entry_wins() {
    let a = tempfile::tempdir().unwrap();
    let b = tempfile::tempdir().unwrap();
    write_file(a.path(), "tool", 0o755);
    write_file(b.path(), "tool", 0o755);
    let found = look_path_in("tool", Some(&search_path(&[b.path(), a.path()]))).unwrap();
    assert_eq!(found, b.path().join("tool"));
}

#[test]
fn non_executable_candidates_are_skipped() {
    let a = tempfile::tempdir().unwrap();
    let b = tempfile::tempdir().unwrap();
    write_file(a.path(), "tool", 0o644);
    let exe = write_file(b.path(), "tool", 0o700);
    let found = look_path_in("tool", Some(&search_path(&[a.path(), b.path()]))).unwrap();
    assert_eq!(found, exe);
}

#[test]
fn directories_are_never_executables() {
    let tmp = tempfile::tempdir().unwrap();
    fs::create_dir(tmp.path().join("tool")).unwrap();
    let err = look_path_in("tool", Some(&search_path(&[tmp.path()]))).unwrap_err();
    assert!(err.is_not_found());
}

#[test]
fn not_found_names_the_program() {
    let tmp = tempfile::tempdir().unwrap();
    let err = look_path_in("absent-tool", Some(&search_path(&[tmp.path()]))).unwrap_err();
    assert!(matches!(err.cause, LookupCause::NotFound));
    assert!(err.to_string().contains("absent-tool"));
    assert!(err.to_string().contains("$PATH"));
}

// ── Relative entries ────────────────────────────────────────────────

#[test]
#[serial]
fn explicit_dot_entry_is_classified() {
    let tmp = tempfile::tempdir().unwrap();
    write_file(tmp.path(), "tool", 0o755);
    let _cwd = CwdGuard::enter(tmp.path());
    let err = look_path_in("tool", Some(&OsString::from("."))).unwrap_err();
    assert!(err.is_relative_to_current_dir());
    assert_eq!(err.resolved.as_deref(), Some(Path::new("./tool")));
}

#[test]
#[serial]
fn empty_entry_means_current_directory() {
    let tmp = tempfile::tempdir().unwrap();
    let elsewhere = tempfile::tempdir().unwrap();
    write_file(tmp.path(), "tool", 0o755);
    let _cwd = CwdGuard::enter(tmp.path());
    let mut list = OsString::from(elsewhere.path());
    list.push("::");
    let err = look_path_in("tool", Some(&list)).unwrap_err();
    assert!(err.is_relative_to_current_dir());
}

#[test]
#[serial]
fn absolute_entry_before_dot_wins() {
    let tmp = tempfile::tempdir().unwrap();
    let abs = tempfile::tempdir().unwrap();
    write_file(tmp.path(), "tool", 0o755);
    let exe = write_file(abs.path(), "tool", 0o755);
    let _cwd = CwdGuard::enter(tmp.path());
    let mut list = OsString::from(abs.path());
    list.push(":.");
    assert_eq!(look_path_in("tool", Some(&list)).unwrap(), exe);
}

// ── Names with a separator ──────────────────────────────────────────

#[test]
fn direct_path_is_returned_unchanged() {
    let tmp = tempfile::tempdir().unwrap();
    let exe = write_file(tmp.path(), "tool", 0o755);
    let name = exe.to_str().unwrap();
    assert_eq!(look_path_in(name, None).unwrap(), exe);
}

#[test]
fn direct_missing_path_reports_stat_error() {
    let err = look_path_in("/definitely/not/here/tool", None).unwrap_err();
    match err.cause {
        LookupCause::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::NotFound),
        other => panic!("unexpected cause: {other:?}"),
    }
}

#[test]
fn direct_non_executable_path_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let file = write_file(tmp.path(), "data", 0o644);
    let err = look_path_in(file.to_str().unwrap(), None).unwrap_err();
    assert!(matches!(err.cause, LookupCause::NotExecutable));
    assert!(!is_executable(&file));
}

// ── Process PATH ────────────────────────────────────────────────────

#[test]
#[serial]
fn look_path_reads_process_path() {
    let tmp = tempfile::tempdir().unwrap();
    let exe = write_file(tmp.path(), "spx-only-here", 0o755);
    let prev = std::env::var_os("PATH");
    // SAFETY: serialized with every other test touching the environment.
    unsafe { std::env::set_var("PATH", search_path(&[tmp.path()])) };
    let found = look_path("spx-only-here");
    match prev {
        Some(p) => unsafe { std::env::set_var("PATH", p) },
        None => unsafe { std::env::remove_var("PATH") },
    }
    assert_eq!(found.unwrap(), exe);
}

#[test]
#[serial]
fn sh_is_found_on_a_standard_system() {
    let found = look_path("sh").unwrap();
    assert!(found.is_absolute());
    assert!(is_executable(&found));
}
