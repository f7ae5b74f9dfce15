// SPDX-License-Identifier: MIT OR Apache-2.0
//! Decoding of raw wait statuses and resource usage.

use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Resource usage reported by the kernel when the child was reaped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// CPU time spent in user mode.
    pub user_time: Duration,
    /// CPU time spent in kernel mode.
    pub system_time: Duration,
    /// Peak resident set size, in the platform's native unit
    /// (kilobytes on Linux, bytes on macOS).
    pub max_rss: i64,
    /// Page faults serviced without I/O.
    pub minor_faults: i64,
    /// Page faults that required I/O.
    pub major_faults: i64,
    /// Block input operations.
    pub block_input: i64,
    /// Block output operations.
    pub block_output: i64,
    /// Signals received.
    pub signals: i64,
    /// Voluntary context switches.
    pub voluntary_switches: i64,
    /// Involuntary context switches.
    pub involuntary_switches: i64,
}

fn timeval_to_duration(tv: libc::timeval) -> Duration {
    let secs = u64::try_from(tv.tv_sec).unwrap_or(0);
    let micros = u32::try_from(tv.tv_usec).unwrap_or(0);
    Duration::from_secs(secs) + Duration::from_micros(u64::from(micros))
}

impl From<libc::rusage> for ResourceUsage {
    fn from(ru: libc::rusage) -> Self {
        Self {
            user_time: timeval_to_duration(ru.ru_utime),
            system_time: timeval_to_duration(ru.ru_stime),
            max_rss: ru.ru_maxrss as i64,
            minor_faults: ru.ru_minflt as i64,
            major_faults: ru.ru_majflt as i64,
            block_input: ru.ru_inblock as i64,
            block_output: ru.ru_oublock as i64,
            signals: ru.ru_nsignals as i64,
            voluntary_switches: ru.ru_nvcsw as i64,
            involuntary_switches: ru.ru_nivcsw as i64,
        }
    }
}

/// Terminal (or stop/continue) state of a reaped process.
///
/// Wraps the raw `wait` status word; the accessors decode it with the
/// platform's `W*` macros.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    pid: i32,
    raw: i32,
    rusage: Option<ResourceUsage>,
}

impl ExitStatus {
    /// Build a status from a raw wait word.
    pub fn from_raw(pid: i32, raw: i32, rusage: Option<ResourceUsage>) -> Self {
        Self { pid, raw, rusage }
    }

    /// Process id the status belongs to.
    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// The undecoded wait status word.
    pub fn raw(&self) -> i32 {
        self.raw
    }

    /// Resource usage, when the reaping call supplied it.
    pub fn rusage(&self) -> Option<&ResourceUsage> {
        self.rusage.as_ref()
    }

    /// `true` when the process terminated through `exit`.
    pub fn exited(&self) -> bool {
        libc::WIFEXITED(self.raw)
    }

    /// `true` when the process exited normally with code 0.
    pub fn success(&self) -> bool {
        self.code() == Some(0)
    }

    /// Exit code when [`exited`](Self::exited), otherwise `None`.
    pub fn code(&self) -> Option<i32> {
        self.exited().then(|| libc::WEXITSTATUS(self.raw))
    }

    /// Exit code, or `-1` when the process did not exit normally.
    pub fn exit_code(&self) -> i32 {
        self.code().unwrap_or(-1)
    }

    /// Terminating signal number when the process was killed by a signal.
    pub fn signal(&self) -> Option<i32> {
        libc::WIFSIGNALED(self.raw).then(|| libc::WTERMSIG(self.raw))
    }

    /// `true` when the process was killed by a signal and dumped core.
    pub fn core_dumped(&self) -> bool {
        libc::WIFSIGNALED(self.raw) && libc::WCOREDUMP(self.raw)
    }

    /// Stop signal number when the status reports a stopped process.
    pub fn stopped_signal(&self) -> Option<i32> {
        libc::WIFSTOPPED(self.raw).then(|| libc::WSTOPSIG(self.raw))
    }

    /// `true` when the status reports a continued process.
    pub fn continued(&self) -> bool {
        libc::WIFCONTINUED(self.raw)
    }

    /// CPU time spent in user mode, zero when no usage was recorded.
    pub fn user_time(&self) -> Duration {
        self.rusage.map(|r| r.user_time).unwrap_or_default()
    }

    /// CPU time spent in kernel mode, zero when no usage was recorded.
    pub fn system_time(&self) -> Duration {
        self.rusage.map(|r| r.system_time).unwrap_or_default()
    }

    /// User plus system CPU time.
    pub fn cpu_time(&self) -> Duration {
        self.user_time() + self.system_time()
    }
}

/// Human-readable signal name, falling back to the number.
pub(crate) fn signal_name(sig: i32) -> String {
    match Signal::try_from(sig) {
        Ok(s) => s.as_str().to_string(),
        Err(_) => format!("signal {sig}"),
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = self.code() {
            write!(f, "exit status {code}")
        } else if let Some(sig) = self.signal() {
            write!(f, "signal: {}", signal_name(sig))?;
            if self.core_dumped() {
                f.write_str(" (core dumped)")?;
            }
            Ok(())
        } else if let Some(sig) = self.stopped_signal() {
            write!(f, "stop signal: {}", signal_name(sig))
        } else if self.continued() {
            f.write_str("continued")
        } else {
            write!(f, "unknown status {:#x}", self.raw)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Traditional layout: exit code in bits 8..16, signal in the low 7 bits,
    // 0x80 for core, 0x7f low byte for stopped.
    #[cfg(target_os = "linux")]
    const CONTINUED: i32 = 0xffff;
    #[cfg(not(target_os = "linux"))]
    const CONTINUED: i32 = (0x13 << 8) | 0x7f;

    fn exited(code: i32) -> ExitStatus {
        ExitStatus::from_raw(1, code << 8, None)
    }

    #[test]
    fn normal_exit() {
        let st = exited(0);
        assert!(st.exited());
        assert!(st.success());
        assert_eq!(st.code(), Some(0));
        assert_eq!(st.to_string(), "exit status 0");
    }

    #[test]
    fn nonzero_exit() {
        let st = exited(42);
        assert!(!st.success());
        assert_eq!(st.exit_code(), 42);
        assert_eq!(st.signal(), None);
        assert_eq!(st.to_string(), "exit status 42");
    }

    #[test]
    fn killed_by_signal() {
        let st = ExitStatus::from_raw(1, libc::SIGKILL, None);
        assert!(!st.exited());
        assert!(!st.success());
        assert_eq!(st.exit_code(), -1);
        assert_eq!(st.signal(), Some(libc::SIGKILL));
        assert_eq!(st.to_string(), "signal: SIGKILL");
    }

    #[test]
    fn core_dump_is_reported() {
        let st = ExitStatus::from_raw(1, libc::SIGSEGV | 0x80, None);
        assert!(st.core_dumped());
        assert_eq!(st.to_string(), "signal: SIGSEGV (core dumped)");
    }

    #[test]
    fn stopped_status() {
        let st = ExitStatus::from_raw(1, (libc::SIGSTOP << 8) | 0x7f, None);
        assert_eq!(st.stopped_signal(), Some(libc::SIGSTOP));
        assert_eq!(st.to_string(), "stop signal: SIGSTOP");
    }

    #[test]
    fn continued_status() {
        let st = ExitStatus::from_raw(1, CONTINUED, None);
        assert!(st.continued());
        assert_eq!(st.to_string(), "continued");
    }

    #[test]
    fn unknown_signal_numbers_render_numerically() {
        assert_eq!(signal_name(1000), "signal 1000");
        assert_eq!(signal_name(libc::SIGTERM), "SIGTERM");
    }

    #[test]
    fn rusage_conversion() {
        // SAFETY: rusage is plain old data.
        let mut ru: libc::rusage = unsafe { std::mem::zeroed() };
        ru.ru_utime.tv_sec = 1;
        ru.ru_utime.tv_usec = 500_000;
        ru.ru_stime.tv_usec = 250_000;
        ru.ru_maxrss = 2048;
        let usage = ResourceUsage::from(ru);
        assert_eq!(usage.user_time, Duration::from_millis(1500));
        assert_eq!(usage.system_time, Duration::from_millis(250));
        assert_eq!(usage.max_rss, 2048);

        let st = ExitStatus::from_raw(7, 0, Some(usage));
        assert_eq!(st.cpu_time(), Duration::from_millis(1750));
        assert_eq!(st.system_time(), Duration::from_millis(250));
        assert_eq!(ExitStatus::from_raw(7, 0, None).user_time(), Duration::ZERO);
        assert_eq!(st.pid(), 7);
    }

    #[test]
    fn serializes_with_rusage() {
        let st = ExitStatus::from_raw(9, 3 << 8, Some(ResourceUsage::default()));
        let json = serde_json::to_value(st).unwrap();
        assert_eq!(json["pid"], 9);
        assert_eq!(json["raw"], 3 << 8);
        assert!(json["rusage"].is_object());
    }
}
