//! Stream preference collaborator.
//!
//! The relay only reads these preferences; they pick the rate control used
//! when a caller asks for a stream without naming a format.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use streamrelay_av::RateControl;

/// Preferred output quality.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamQuality {
    Low,
    Medium,
    #[default]
    High,
}

/// Stored stream preferences.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSettings {
    #[serde(default)]
    pub rtsp_url: String,

    #[serde(default)]
    pub stream_quality: StreamQuality,

    /// Encoder buffer size in kilobits.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: u32,
}

fn default_buffer_size() -> u32 {
    1024
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            rtsp_url: String::new(),
            stream_quality: StreamQuality::default(),
            buffer_size: default_buffer_size(),
        }
    }
}

impl StreamSettings {
    /// Encoder rate control matching these preferences.
    pub fn rate_control(&self) -> RateControl {
        let (crf, maxrate_kbps) = match self.stream_quality {
            StreamQuality::High => (23, 1000),
            StreamQuality::Medium => (26, 700),
            StreamQuality::Low => (30, 400),
        };

        // A zero buffer would make the encoder reject the rate limit.
        let bufsize_kbps = if self.buffer_size == 0 {
            maxrate_kbps * 2
        } else {
            self.buffer_size
        };

        RateControl {
            crf,
            maxrate_kbps,
            bufsize_kbps,
        }
    }
}

/// Source of the current stream preferences.
#[async_trait]
pub trait SettingsProvider: Send + Sync {
    async fn stream_settings(&self) -> Result<StreamSettings>;
}

/// Fixed preferences, used when no settings file is configured.
#[derive(Debug, Clone, Default)]
pub struct StaticSettings(pub StreamSettings);

#[async_trait]
impl SettingsProvider for StaticSettings {
    async fn stream_settings(&self) -> Result<StreamSettings> {
        Ok(self.0.clone())
    }
}

/// Preferences read from a JSON document on every call, so edits made by
/// the settings store are picked up without a restart.
#[derive(Debug, Clone)]
pub struct JsonFileSettings {
    path: PathBuf,
}

impl JsonFileSettings {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SettingsProvider for JsonFileSettings {
    async fn stream_settings(&self) -> Result<StreamSettings> {
        let content = match tokio::fs::read(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(StreamSettings::default());
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read settings file: {:?}", self.path))
            }
        };

        serde_json::from_slice(&content)
            .with_context(|| format!("Failed to parse settings file: {:?}", self.path))
    }
}
