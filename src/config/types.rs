use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub tools: ToolsConfig,

    #[serde(default)]
    pub relay: RelayConfig,

    #[serde(default)]
    pub hls: HlsConfig,

    #[serde(default)]
    pub settings: SettingsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    5000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// External binaries. Bare names are resolved through `PATH`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolsConfig {
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: PathBuf,

    #[serde(default = "default_ffprobe")]
    pub ffprobe: PathBuf,
}

fn default_ffmpeg() -> PathBuf {
    PathBuf::from("ffmpeg")
}
fn default_ffprobe() -> PathBuf {
    PathBuf::from("ffprobe")
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ffmpeg: default_ffmpeg(),
            ffprobe: default_ffprobe(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelayConfig {
    /// Time a transcoder gets to exit after a stop request before it is killed
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,

    /// Upper bound on a single read from transcoder stdout
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Chunks allowed in flight between the relay task and the response body
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// How long finished sessions stay queryable
    #[serde(default = "default_session_retention")]
    pub session_retention_secs: u64,

    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
}

fn default_grace_period_ms() -> u64 {
    5000
}
fn default_chunk_size() -> usize {
    64 * 1024
}
fn default_channel_capacity() -> usize {
    4
}
fn default_session_retention() -> u64 {
    60
}
fn default_probe_timeout() -> u64 {
    30
}

impl RelayConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: default_grace_period_ms(),
            chunk_size: default_chunk_size(),
            channel_capacity: default_channel_capacity(),
            session_retention_secs: default_session_retention(),
            probe_timeout_secs: default_probe_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HlsConfig {
    /// Every publish directory lives under this root
    #[serde(default = "default_hls_root")]
    pub root: PathBuf,

    /// URL prefix the root is served under
    #[serde(default = "default_mount_path")]
    pub mount_path: String,

    #[serde(default = "default_segment_duration")]
    pub segment_duration_secs: u32,

    #[serde(default = "default_max_segments")]
    pub max_segments: usize,

    /// Fallback retention sweep period when no file events arrive
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,
}

fn default_hls_root() -> PathBuf {
    PathBuf::from("./hls_output")
}
fn default_mount_path() -> String {
    "/hls".to_string()
}
fn default_segment_duration() -> u32 {
    2
}
fn default_max_segments() -> usize {
    10
}
fn default_sweep_interval() -> u64 {
    1000
}

impl HlsConfig {
    /// Retention sweep period. Unvalidated configs still get a usable timer.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}

impl Default for HlsConfig {
    fn default() -> Self {
        Self {
            root: default_hls_root(),
            mount_path: default_mount_path(),
            segment_duration_secs: default_segment_duration(),
            max_segments: default_max_segments(),
            sweep_interval_ms: default_sweep_interval(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SettingsConfig {
    /// JSON file holding the stream preferences; defaults apply when unset
    #[serde(default)]
    pub path: Option<PathBuf>,
}
