//! # Configuration Module
//!
//! Data directory, database location and session settings.
//!
//! ## Data Storage
//!
//! Emotune stores its database and settings in the platform-standard data
//! directory:
//! - Linux: `~/.local/share/emotune/`
//! - macOS: `~/Library/Application Support/emotune/`
//! - Windows: `%APPDATA%\emotune\`
//!
//! ## Settings Precedence
//!
//! Built-in defaults, then `settings.json` in the data directory (if present),
//! then environment variables, then command-line flags. Every layer is
//! optional; the result is validated once, after the last layer.

use crate::emotion::Precedence;
use crate::sampler::DEFAULT_MIN_CONFIDENCE;
use anyhow::{bail, Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_DIR: &str = "emotune";
const DB_FILE: &str = "emotune.db";
const SETTINGS_FILE: &str = "settings.json";

/// Returns the platform-appropriate data directory for Emotune, creating it
/// if needed.
pub fn get_data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir().ok_or_else(|| {
        anyhow::anyhow!(
            "Could not determine system data directory. Please ensure your platform supports standard data directories."
        )
    })?;

    let app_dir = data_dir.join(APP_DIR);
    fs::create_dir_all(&app_dir).with_context(|| {
        format!(
            "Failed to create Emotune data directory at {}. Please check file permissions.",
            app_dir.display()
        )
    })?;

    Ok(app_dir)
}

/// Returns the default database file path.
pub fn get_db_path() -> Result<PathBuf> {
    Ok(get_data_dir()?.join(DB_FILE))
}

/// Returns the default settings file path.
pub fn get_settings_path() -> Result<PathBuf> {
    Ok(get_data_dir()?.join(SETTINGS_FILE))
}

/// Where "now playing" comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum NowPlayingKind {
    /// Local MPD through `mpc`.
    Mpd,
    /// Spotify Web API with an access token.
    Spotify,
}

/// Session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// User the committed records belong to.
    pub user_id: String,
    /// Database file; `None` means the default location.
    pub db_path: Option<PathBuf>,
    /// Samples below this classifier confidence are discarded.
    pub min_confidence: f32,
    /// Frame sampling cadence.
    pub frame_interval_ms: u64,
    /// Now-playing poll cadence.
    pub poll_interval_ms: u64,
    /// Upper bound for one now-playing request.
    pub poll_timeout_ms: u64,
    /// Bounded queue between the producers and the aggregator.
    pub channel_capacity: usize,
    /// How long stopping waits for a stuck camera or poll.
    pub shutdown_grace_ms: u64,
    /// Tie-break order for equal counts.
    pub precedence: Precedence,
    pub now_playing: NowPlayingKind,
    /// Spotify access token, usually from `SPOTIFY_ACCESS_TOKEN`.
    #[serde(skip_serializing)]
    pub spotify_access_token: Option<String>,
    /// Classifier program and its arguments.
    pub classifier_command: Vec<String>,
    /// Webcam device used when no frame directory is given.
    pub camera_device: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            user_id: "default".to_string(),
            db_path: None,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            frame_interval_ms: 100,
            poll_interval_ms: 1000,
            poll_timeout_ms: 3000,
            channel_capacity: 256,
            shutdown_grace_ms: 1000,
            precedence: Precedence::default(),
            now_playing: NowPlayingKind::Mpd,
            spotify_access_token: None,
            classifier_command: vec!["emotune-classifier".to_string()],
            camera_device: "/dev/video0".to_string(),
        }
    }
}

impl Settings {
    /// Defaults, overlaid with the settings file and the environment.
    pub fn load() -> Result<Self> {
        let mut settings = match get_settings_path() {
            Ok(path) if path.exists() => Self::from_file(&path)?,
            _ => Self::default(),
        };
        settings.apply_env(|key| env::var(key).ok())?;
        Ok(settings)
    }

    /// Reads a JSON settings file; missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        debug!("Loading settings from {}", path.display());
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Invalid settings file {}", path.display()))
    }

    /// Applies `EMOTUNE_*` and `SPOTIFY_ACCESS_TOKEN` overrides read through
    /// `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(user) = lookup("EMOTUNE_USER") {
            self.user_id = user;
        }
        if let Some(db) = lookup("EMOTUNE_DB") {
            self.db_path = Some(PathBuf::from(db));
        }
        if let Some(value) = lookup("EMOTUNE_MIN_CONFIDENCE") {
            self.min_confidence = value
                .parse()
                .with_context(|| format!("EMOTUNE_MIN_CONFIDENCE is not a number: {value}"))?;
        }
        if let Some(value) = lookup("EMOTUNE_FRAME_INTERVAL_MS") {
            self.frame_interval_ms = value
                .parse()
                .with_context(|| format!("EMOTUNE_FRAME_INTERVAL_MS is not a number: {value}"))?;
        }
        if let Some(value) = lookup("EMOTUNE_POLL_INTERVAL_MS") {
            self.poll_interval_ms = value
                .parse()
                .with_context(|| format!("EMOTUNE_POLL_INTERVAL_MS is not a number: {value}"))?;
        }
        if let Some(token) = lookup("SPOTIFY_ACCESS_TOKEN") {
            self.spotify_access_token = Some(token);
        }
        Ok(())
    }

    /// Checks ranges once all layers are applied.
    pub fn validate(&self) -> Result<()> {
        if self.user_id.trim().is_empty() {
            bail!("user_id must not be empty");
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            bail!(
                "min_confidence must be within [0, 1], got {}",
                self.min_confidence
            );
        }
        if self.frame_interval_ms == 0 || self.poll_interval_ms == 0 || self.poll_timeout_ms == 0 {
            bail!("frame_interval_ms, poll_interval_ms and poll_timeout_ms must be positive");
        }
        if self.channel_capacity == 0 {
            bail!("channel_capacity must be positive");
        }
        if self.classifier_command.is_empty() {
            bail!("classifier_command must name a program");
        }
        Ok(())
    }

    /// Configured database path, or the default one.
    pub fn resolved_db_path(&self) -> Result<PathBuf> {
        match &self.db_path {
            Some(path) => Ok(path.clone()),
            None => get_db_path(),
        }
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
