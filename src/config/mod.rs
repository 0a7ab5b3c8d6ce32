//! Persisted configuration for the playback client
//!
//! A YAML file with two top-level keys: `config` (general options) and
//! `sources` (per-source options, validated by the source itself when it
//! is built). Missing file means defaults; missing options take their
//! documented defaults.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::{AppError, AppResult};
use crate::models::WaitingRoomPolicy;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub config: GeneralConfig,
    #[serde(default)]
    pub sources: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_server")]
    pub server: String,
    #[serde(default)]
    pub room: String,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default = "default_preview_duration")]
    pub preview_duration: u32,
    #[serde(default)]
    pub last_song: Option<DateTime<Utc>>,
    #[serde(default)]
    pub waiting_room_policy: Option<WaitingRoomPolicy>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default = "default_buffer_in_advance")]
    pub buffer_in_advance: usize,
    #[serde(default = "default_qr_box_size")]
    pub qr_box_size: u32,
    #[serde(default)]
    pub qr_position: QrPosition,
    #[serde(default)]
    pub show_advanced: bool,
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default = "default_next_up_time")]
    pub next_up_time: u32,
    #[serde(default = "default_true")]
    pub allow_collab_mode: bool,
}

fn default_server() -> String {
    "https://syng.rocks".to_string()
}

fn default_preview_duration() -> u32 {
    3
}

fn default_buffer_in_advance() -> usize {
    2
}

fn default_qr_box_size() -> u32 {
    7
}

fn default_next_up_time() -> u32 {
    20
}

fn default_true() -> bool {
    true
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            server: default_server(),
            room: String::new(),
            secret: None,
            preview_duration: default_preview_duration(),
            last_song: None,
            waiting_room_policy: None,
            key: None,
            buffer_in_advance: default_buffer_in_advance(),
            qr_box_size: default_qr_box_size(),
            qr_position: QrPosition::default(),
            show_advanced: false,
            log_level: LogLevel::default(),
            next_up_time: default_next_up_time(),
            allow_collab_mode: true,
        }
    }
}

/// Corner of the playback screen the join QR is rendered in.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum QrPosition {
    TopLeft,
    #[default]
    TopRight,
    BottomLeft,
    BottomRight,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    /// The tracing filter directive this level maps to.
    pub fn as_filter(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warn",
            Self::Error | Self::Critical => "error",
        }
    }
}

impl ConfigFile {
    /// Load from `path`, falling back to defaults when the file does not
    /// exist. A present-but-invalid file is a configuration error.
    pub fn load(path: &Path) -> AppResult<Self> {
        if !path.exists() {
            info!("No config found at {}, using default values", path.display());
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&contents).map_err(|e| {
            AppError::configuration(format!("invalid config file {}: {e}", path.display()))
        })
    }

    /// Write the current configuration back out, creating parent
    /// directories as needed.
    pub fn save(&self, path: &Path) -> AppResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_yaml::to_string(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = GeneralConfig::default();
        assert_eq!(cfg.server, "https://syng.rocks");
        assert_eq!(cfg.preview_duration, 3);
        assert_eq!(cfg.buffer_in_advance, 2);
        assert_eq!(cfg.qr_box_size, 7);
        assert_eq!(cfg.qr_position, QrPosition::TopRight);
        assert_eq!(cfg.log_level, LogLevel::Info);
        assert_eq!(cfg.next_up_time, 20);
        assert!(cfg.allow_collab_mode);
        assert!(cfg.last_song.is_none());
    }

    #[test]
    fn parses_partial_yaml() {
        let cfg: ConfigFile = serde_yaml::from_str(
            r#"
config:
  room: ABCD
  preview_duration: 5
  qr_position: bottom-left
  log_level: warning
sources:
  files:
    dir: /srv/karaoke
"#,
        )
        .unwrap();
        assert_eq!(cfg.config.room, "ABCD");
        assert_eq!(cfg.config.preview_duration, 5);
        assert_eq!(cfg.config.qr_position, QrPosition::BottomLeft);
        assert_eq!(cfg.config.log_level, LogLevel::Warning);
        assert_eq!(cfg.config.buffer_in_advance, 2);
        assert_eq!(
            cfg.sources["files"]["dir"],
            serde_json::Value::from("/srv/karaoke")
        );
    }

    #[test]
    fn save_and_load_round_trip() {
        let path = std::env::temp_dir().join("syng-config-test/config.yaml");
        let mut cfg = ConfigFile::default();
        cfg.config.room = "WXYZ".to_string();
        cfg.sources.insert(
            "files".to_string(),
            serde_json::json!({"dir": "/srv/karaoke"}),
        );
        cfg.save(&path).unwrap();

        let loaded = ConfigFile::load(&path).unwrap();
        assert_eq!(loaded.config.room, "WXYZ");
        assert_eq!(
            loaded.sources["files"]["dir"],
            serde_json::Value::from("/srv/karaoke")
        );
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn last_song_accepts_iso_timestamp() {
        let cfg: ConfigFile = serde_yaml::from_str(
            "config:\n  last_song: \"2026-08-01T23:30:00Z\"\n",
        )
        .unwrap();
        assert!(cfg.config.last_song.is_some());
    }
}
