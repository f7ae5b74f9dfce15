// SPDX-License-Identifier: MIT OR Apache-2.0
//! Configuration loading, validation, and environment overrides for
//! spawn-exec.
//!
//! [`ExecConfig`] selects the spawn strategy and sets the defaults a command
//! picks up at construction: the stderr capture bound used by `output()` and
//! the post-cancellation grace period.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Environment variable selecting the spawn strategy.
pub const ENV_STRATEGY: &str = "SPX_STRATEGY";
/// Environment variable overriding the stderr capture bound.
pub const ENV_STDERR_CAPTURE_LIMIT: &str = "SPX_STDERR_CAPTURE_LIMIT";
/// Environment variable setting the default wait delay in milliseconds.
pub const ENV_WAIT_DELAY_MS: &str = "SPX_WAIT_DELAY_MS";

/// Upper bound accepted for `stderr_capture_limit` (64 MiB).
pub const MAX_CAPTURE_LIMIT: usize = 64 << 20;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file could not be read.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },

    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },

    /// An environment override held a value that could not be parsed.
    #[error("invalid value for {var}: {value:?}")]
    InvalidOverride {
        /// Variable name.
        var: &'static str,
        /// Offending value.
        value: String,
    },

    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Which process-creation primitive to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpawnStrategy {
    /// `posix_spawn` where compiled in, otherwise fork/exec.
    #[default]
    Auto,
    /// Require the `posix_spawn` engine; starting fails where it is unavailable.
    PosixSpawn,
    /// Always delegate to the host fork/exec facility.
    ForkExec,
}

impl fmt::Display for SpawnStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Auto => "auto",
            Self::PosixSpawn => "posix_spawn",
            Self::ForkExec => "fork_exec",
        };
        f.write_str(s)
    }
}

impl FromStr for SpawnStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "posix_spawn" | "posix-spawn" | "spawn" => Ok(Self::PosixSpawn),
            "fork_exec" | "fork-exec" | "fork" => Ok(Self::ForkExec),
            other => Err(format!("unknown spawn strategy '{other}'")),
        }
    }
}

/// Runtime settings for command execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecConfig {
    /// Process-creation strategy.
    pub strategy: SpawnStrategy,

    /// Bytes of stderr prefix (and, separately, suffix) kept by `output()`.
    pub stderr_capture_limit: usize,

    /// Default grace period after cancellation, in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_delay_ms: Option<u64>,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            strategy: SpawnStrategy::Auto,
            stderr_capture_limit: spx_capture::DEFAULT_CAPTURE_LIMIT,
            wait_delay_ms: None,
        }
    }
}

impl ExecConfig {
    /// Defaults with environment overrides applied.
    ///
    /// Unparseable overrides are logged and ignored so a bad variable never
    /// prevents commands from being constructed.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Err(e) = apply_env_overrides(&mut config) {
            warn!(target: "spx.config", "ignoring environment override: {e}");
        }
        config
    }

    /// The default wait delay as a [`Duration`].
    pub fn wait_delay(&self) -> Option<Duration> {
        self.wait_delay_ms.map(Duration::from_millis)
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load configuration from an optional TOML file.
///
/// * If `path` is `Some`, reads and parses the file.
/// * If `path` is `None`, returns [`ExecConfig::default()`].
///
/// Environment variable overrides are applied on top in both cases.
pub fn load_config(path: Option<&Path>) -> Result<ExecConfig, ConfigError> {
    let mut config = match path {
        Some(p) => {
            let content = std::fs::read_to_string(p).map_err(|_| ConfigError::FileNotFound {
                path: p.display().to_string(),
            })?;
            parse_toml(&content)?
        }
        None => ExecConfig::default(),
    };
    apply_env_overrides(&mut config)?;
    Ok(config)
}

/// Parse a TOML string into an [`ExecConfig`].
pub fn parse_toml(content: &str) -> Result<ExecConfig, ConfigError> {
    toml::from_str::<ExecConfig>(content).map_err(|e| ConfigError::ParseError {
        reason: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Env overrides
// ---------------------------------------------------------------------------

/// Apply environment variable overrides.
///
/// Recognised variables:
/// - `SPX_STRATEGY`
/// - `SPX_STDERR_CAPTURE_LIMIT`
/// - `SPX_WAIT_DELAY_MS`
pub fn apply_env_overrides(config: &mut ExecConfig) -> Result<(), ConfigError> {
    apply_overrides_from(config, |key| std::env::var(key).ok())
}

/// Apply overrides using `lookup` in place of the process environment.
pub fn apply_overrides_from(
    config: &mut ExecConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    if let Some(val) = lookup(ENV_STRATEGY) {
        config.strategy = val.parse().map_err(|_| ConfigError::InvalidOverride {
            var: ENV_STRATEGY,
            value: val.clone(),
        })?;
    }
    if let Some(val) = lookup(ENV_STDERR_CAPTURE_LIMIT) {
        config.stderr_capture_limit =
            val.trim().parse().map_err(|_| ConfigError::InvalidOverride {
                var: ENV_STDERR_CAPTURE_LIMIT,
                value: val.clone(),
            })?;
    }
    if let Some(val) = lookup(ENV_WAIT_DELAY_MS) {
        config.wait_delay_ms = Some(val.trim().parse().map_err(|_| {
            ConfigError::InvalidOverride {
                var: ENV_WAIT_DELAY_MS,
                value: val.clone(),
            }
        })?);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a configuration.
pub fn validate_config(config: &ExecConfig) -> Result<(), ConfigError> {
    let mut errors: Vec<String> = Vec::new();

    if config.stderr_capture_limit == 0 {
        errors.push("stderr_capture_limit must be greater than zero".into());
    } else if config.stderr_capture_limit > MAX_CAPTURE_LIMIT {
        errors.push(format!(
            "stderr_capture_limit {} exceeds maximum {MAX_CAPTURE_LIMIT}",
            config.stderr_capture_limit
        ));
    }
    if config.wait_delay_ms == Some(0) {
        errors.push("wait_delay_ms must be greater than zero when set".into());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationError { reasons: errors })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn default_config_is_valid() {
        let cfg = ExecConfig::default();
        validate_config(&cfg).expect("default config should be valid");
        assert_eq!(cfg.strategy, SpawnStrategy::Auto);
        assert_eq!(cfg.stderr_capture_limit, 32 * 1024);
        assert!(cfg.wait_delay().is_none());
    }

    #[test]
    fn parse_valid_toml_string() {
        let cfg = parse_toml(
            r#"
            strategy = "fork_exec"
            stderr_capture_limit = 1024
            wait_delay_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(cfg.strategy, SpawnStrategy::ForkExec);
        assert_eq!(cfg.stderr_capture_limit, 1024);
        assert_eq!(cfg.wait_delay(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn empty_string_toml_parses_to_defaults() {
        assert_eq!(parse_toml("").unwrap(), ExecConfig::default());
    }

    #[test]
    fn parse_unknown_strategy_gives_parse_error() {
        let err = parse_toml(r#"strategy = "vfork""#).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn toml_roundtrip() {
        let cfg = ExecConfig {
            strategy: SpawnStrategy::PosixSpawn,
            stderr_capture_limit: 77,
            wait_delay_ms: Some(5),
        };
        let text = toml::to_string(&cfg).unwrap();
        assert_eq!(parse_toml(&text).unwrap(), cfg);
    }

    #[test]
    fn json_omits_unset_wait_delay() {
        let json = serde_json::to_string(&ExecConfig::default()).unwrap();
        assert!(!json.contains("wait_delay_ms"));
    }

    #[test]
    fn overrides_apply_on_top() {
        let mut cfg = ExecConfig::default();
        apply_overrides_from(
            &mut cfg,
            lookup(&[
                (ENV_STRATEGY, "fork-exec"),
                (ENV_STDERR_CAPTURE_LIMIT, " 4096 "),
                (ENV_WAIT_DELAY_MS, "100"),
            ]),
        )
        .unwrap();
        assert_eq!(cfg.strategy, SpawnStrategy::ForkExec);
        assert_eq!(cfg.stderr_capture_limit, 4096);
        assert_eq!(cfg.wait_delay_ms, Some(100));
    }

    #[test]
    fn bad_override_is_reported() {
        let mut cfg = ExecConfig::default();
        let err = apply_overrides_from(&mut cfg, lookup(&[(ENV_STDERR_CAPTURE_LIMIT, "lots")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidOverride {
                var: ENV_STDERR_CAPTURE_LIMIT,
                ..
            }
        ));
    }

    #[test]
    fn validation_catches_zero_limit_and_zero_delay() {
        let cfg = ExecConfig {
            stderr_capture_limit: 0,
            wait_delay_ms: Some(0),
            ..Default::default()
        };
        match validate_config(&cfg).unwrap_err() {
            ConfigError::ValidationError { reasons } => assert_eq!(reasons.len(), 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn validation_catches_oversized_limit() {
        let cfg = ExecConfig {
            stderr_capture_limit: MAX_CAPTURE_LIMIT + 1,
            ..Default::default()
        };
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn strategy_parses_aliases() {
        assert_eq!("AUTO".parse::<SpawnStrategy>(), Ok(SpawnStrategy::Auto));
        assert_eq!("posix-spawn".parse::<SpawnStrategy>(), Ok(SpawnStrategy::PosixSpawn));
        assert_eq!("fork".parse::<SpawnStrategy>(), Ok(SpawnStrategy::ForkExec));
        assert!("clone3".parse::<SpawnStrategy>().is_err());
        assert_eq!(SpawnStrategy::ForkExec.to_string(), "fork_exec");
    }

    #[test]
    fn load_config_from_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "stderr_capture_limit = 99").unwrap();
        writeln!(f, "wait_delay_ms = 250").unwrap();
        let cfg = load_config(Some(f.path())).unwrap();
        assert_eq!(cfg.stderr_capture_limit, 99);
        assert_eq!(cfg.wait_delay_ms, Some(250));
    }

    #[test]
    fn load_missing_file_gives_file_not_found() {
        let err = load_config(Some(Path::new("/nonexistent/spx.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }
}
