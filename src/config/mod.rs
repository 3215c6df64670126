//! Configuration management for the telbbs engine.
//!
//! Configuration is TOML, organized into sections:
//!
//! - [`BbsConfig`] - board identity and the top-level (matrix) script
//! - [`TelnetConfig`] - listener settings
//! - [`SessionSettings`] - per-session defaults: encoding, traffic taps,
//!   session recording
//! - [`LoggingConfig`] - log level and optional log file
//!
//! ```toml
//! [bbs]
//! name = "telbbs"
//! sysop = "sysop"
//! matrix_script = "matrix"
//!
//! [telnet]
//! bind = "0.0.0.0:6023"
//!
//! [session]
//! default_encoding = "utf8"
//! record_tty = true
//! ttyrec_path = "recordings"
//! ```
//!
//! Values are validated on load; an invalid encoding or an empty bind
//! address is a configuration fault, not something sessions recover from.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::bbs::encoding::Encoding;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BbsConfig {
    pub name: String,
    pub sysop: String,
    /// Script every fresh session starts in.
    #[serde(default = "default_matrix_script")]
    pub matrix_script: String,
}

fn default_matrix_script() -> String {
    "matrix".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelnetConfig {
    /// Listener address, e.g. "0.0.0.0:6023".
    pub bind: String,
}

/// Per-session defaults, handed to every spawned session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Starting terminal encoding; only "utf8" and "cp437" parse.
    #[serde(default = "default_encoding")]
    pub default_encoding: Encoding,
    /// Log raw keyboard input at debug level.
    #[serde(default)]
    pub tap_input: bool,
    /// Log session output at debug level.
    #[serde(default)]
    pub tap_output: bool,
    /// Log event dispatch at debug level.
    #[serde(default)]
    pub tap_events: bool,
    /// Capture sessions to timestamped binary recordings.
    #[serde(default)]
    pub record_tty: bool,
    /// Directory recordings are written into (created on demand).
    #[serde(default = "default_ttyrec_path")]
    pub ttyrec_path: PathBuf,
    /// Echo script failure diagnostics to the client.
    #[serde(default)]
    pub show_traceback: bool,
}

fn default_encoding() -> Encoding {
    Encoding::Utf8
}

fn default_ttyrec_path() -> PathBuf {
    PathBuf::from("recordings")
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            default_encoding: default_encoding(),
            tap_input: false,
            tap_output: false,
            tap_events: false,
            record_tty: false,
            ttyrec_path: default_ttyrec_path(),
            show_traceback: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log level: error, warn, info, debug, trace.
    #[serde(default)]
    pub level: Option<String>,
    /// Optional log file; stdout is still used when it is a TTY.
    #[serde(default)]
    pub file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub bbs: BbsConfig,
    pub telnet: TelnetConfig,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load and validate a configuration file.
    pub async fn load(path: &str) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config file {path}"))?;
        let config: Config =
            toml::from_str(&raw).with_context(|| format!("parsing config file {path}"))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.bbs.name.trim().is_empty() {
            return Err(anyhow!("bbs.name must not be empty"));
        }
        if self.bbs.matrix_script.trim().is_empty() {
            return Err(anyhow!("bbs.matrix_script must not be empty"));
        }
        if self.telnet.bind.parse::<std::net::SocketAddr>().is_err() {
            return Err(anyhow!("telnet.bind is not a valid address: {}", self.telnet.bind));
        }
        if let Some(level) = &self.logging.level {
            if level.parse::<log::LevelFilter>().is_err() {
                return Err(anyhow!("logging.level is not a valid level: {level}"));
            }
        }
        Ok(())
    }

    /// Write a starter configuration file, refusing to clobber an existing
    /// one.
    pub async fn create_default(path: &str) -> Result<()> {
        if fs::try_exists(path).await.unwrap_or(false) {
            return Err(anyhow!("{path} already exists"));
        }
        fs::write(path, DEFAULT_CONFIG)
            .await
            .with_context(|| format!("writing {path}"))?;
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bbs: BbsConfig {
                name: "telbbs".to_string(),
                sysop: "sysop".to_string(),
                matrix_script: default_matrix_script(),
            },
            telnet: TelnetConfig { bind: "0.0.0.0:6023".to_string() },
            session: SessionSettings::default(),
            logging: LoggingConfig::default(),
        }
    }
}

const DEFAULT_CONFIG: &str = r#"[bbs]
name = "telbbs"
sysop = "sysop"
matrix_script = "matrix"

[telnet]
bind = "0.0.0.0:6023"

[session]
default_encoding = "utf8"
tap_input = false
tap_output = false
tap_events = false
record_tty = true
ttyrec_path = "recordings"
show_traceback = false

[logging]
level = "info"
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_parses_and_validates() {
        let config: Config = toml::from_str(DEFAULT_CONFIG).expect("default config parses");
        config.validate().expect("default config validates");
        assert_eq!(config.session.default_encoding, Encoding::Utf8);
        assert!(config.session.record_tty);
    }

    #[test]
    fn unsupported_encoding_is_a_configuration_fault() {
        let raw = r#"
[bbs]
name = "x"
sysop = "s"

[telnet]
bind = "0.0.0.0:6023"

[session]
default_encoding = "latin-1"
"#;
        assert!(toml::from_str::<Config>(raw).is_err());
    }

    #[test]
    fn bad_bind_address_is_rejected() {
        let mut config = Config::default();
        config.telnet.bind = "nowhere".to_string();
        assert!(config.validate().is_err());
    }
}
