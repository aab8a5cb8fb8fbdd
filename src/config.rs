//! CLI configuration.
//!
//! Mirrors of the optional `dlltrace.toml` next to the executable, plus the
//! conversion into runtime types. Library callers never touch this; they
//! configure [`crate::TraceOptions`] directly. Keeping the raw TOML shapes
//! separate from the runtime config keeps file-format concerns out of the
//! trace core.

use serde::Deserialize;
use std::{fs, path::Path, time::Duration};
use thiserror::Error;

/// Top-level file as deserialized from TOML. Every table is optional; a
/// missing file means all defaults.
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub trace: TraceTable,
}

/// Mirror of the `[logging]` table.
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_level() -> String {
    "INFO".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { enable: false, file: None, level: default_level() }
    }
}

/// Mirror of the `[trace]` table.
#[derive(Debug, Default, Deserialize)]
pub struct TraceTable {
    #[serde(default)]
    pub audit: bool,
    #[serde(default)]
    pub debug: bool,
    /// Emit events as JSON lines instead of plain paths.
    #[serde(default)]
    pub json: bool,
    #[serde(default)]
    pub session_name: Option<String>,
    /// Bound on teardown join, e.g. `"2s"` or `"500ms"`.
    #[serde(default)]
    pub stop_timeout: Option<String>,
}

/// Fully-typed runtime configuration for the probe tool.
#[derive(Debug)]
pub struct ProbeConfig {
    pub logging: LoggingConfig,
    pub audit: bool,
    pub debug: bool,
    pub json: bool,
    pub session_name: Option<String>,
    pub stop_timeout: Option<Duration>,
}

/// All the ways config loading can go wrong.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid duration '{0}': {1}")]
    InvalidDuration(String, #[source] humantime::DurationError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Load and convert `path`, or fall back to defaults when the file does not
/// exist. A file that exists but fails to parse is still an error.
pub fn load_probe_config(path: &Path) -> Result<ProbeConfig, ConfigError> {
    let raw = if path.exists() {
        log::debug!("reading config from {}", path.display());
        let txt = fs::read_to_string(path)?;
        toml::from_str::<FileConfig>(&txt)?
    } else {
        log::debug!("no config at {}; using defaults", path.display());
        FileConfig::default()
    };
    convert(raw)
}

fn convert(raw: FileConfig) -> Result<ProbeConfig, ConfigError> {
    let stop_timeout = raw
        .trace
        .stop_timeout
        .map(|s| {
            humantime::parse_duration(&s).map_err(|e| ConfigError::InvalidDuration(s.clone(), e))
        })
        .transpose()?;

    Ok(ProbeConfig {
        logging: raw.logging,
        audit: raw.trace.audit,
        debug: raw.trace.debug,
        json: raw.trace.json,
        session_name: raw.trace.session_name,
        stop_timeout,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn full_config_parses_and_converts() {
        let toml = r#"
            [logging]
            enable = true
            level = "DEBUG"
            file = "probe.log"

            [trace]
            audit = true
            json = true
            session_name = "dlltrace-ci"
            stop_timeout = "500ms"
        "#;
        let raw: FileConfig = toml::from_str(toml).unwrap();
        let cfg = convert(raw).unwrap();

        assert!(cfg.logging.enable);
        assert_eq!(cfg.logging.level, "DEBUG");
        assert!(cfg.audit);
        assert!(!cfg.debug);
        assert!(cfg.json);
        assert_eq!(cfg.session_name.as_deref(), Some("dlltrace-ci"));
        assert_eq!(cfg.stop_timeout, Some(Duration::from_millis(500)));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_probe_config(&dir.path().join("absent.toml")).unwrap();

        assert!(!cfg.logging.enable);
        assert_eq!(cfg.logging.level, "INFO");
        assert!(!cfg.audit && !cfg.debug && !cfg.json);
        assert_eq!(cfg.stop_timeout, None);
    }

    #[test]
    fn bad_duration_is_reported_with_the_offending_value() {
        let raw: FileConfig =
            toml::from_str("[trace]\nstop_timeout = \"soon\"\n").unwrap();
        match convert(raw) {
            Err(ConfigError::InvalidDuration(v, _)) => assert_eq!(v, "soon"),
            other => panic!("expected InvalidDuration, got {other:?}"),
        }
    }

    #[test]
    fn malformed_file_is_an_error_not_a_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dlltrace.toml");
        let mut f = fs::File::create(&path).unwrap();
        writeln!(f, "[trace").unwrap();

        assert!(matches!(load_probe_config(&path), Err(ConfigError::Toml(_))));
    }
}
