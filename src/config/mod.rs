mod types;

pub use types::*;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let mut config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    validate_config(&config)?;
    expand_paths(&mut config);

    Ok(config)
}

/// Load config from default locations or return default config
pub fn load_config_or_default(custom_path: Option<&Path>) -> Result<Config> {
    if let Some(path) = custom_path {
        return load_config(path);
    }

    // Try default locations
    let default_paths = [
        "./config.toml",
        "./streamrelay.toml",
        "~/.config/streamrelay/config.toml",
        "/etc/streamrelay/config.toml",
    ];

    for path_str in default_paths {
        let path = shellexpand::tilde(path_str);
        let path = Path::new(path.as_ref());
        if path.exists() {
            return load_config(path);
        }
    }

    // Return default config if no file found
    Ok(Config::default())
}

fn expand_paths(config: &mut Config) {
    config.hls.root = expand(&config.hls.root);
    config.tools.ffmpeg = expand(&config.tools.ffmpeg);
    config.tools.ffprobe = expand(&config.tools.ffprobe);
    if let Some(path) = config.settings.path.as_mut() {
        *path = expand(path);
    }
}

fn expand(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).as_ref())
}

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<()> {
    if config.server.port == 0 {
        anyhow::bail!("Server port cannot be 0");
    }

    if config.relay.grace_period_ms == 0 {
        anyhow::bail!("relay.grace_period_ms must be greater than 0");
    }

    if config.relay.chunk_size == 0 || config.relay.channel_capacity == 0 {
        anyhow::bail!("relay.chunk_size and relay.channel_capacity must be greater than 0");
    }

    if config.hls.segment_duration_secs == 0 {
        anyhow::bail!("hls.segment_duration_secs must be greater than 0");
    }

    if config.hls.max_segments == 0 {
        anyhow::bail!("hls.max_segments must be at least 1");
    }

    if config.hls.sweep_interval_ms == 0 {
        anyhow::bail!("hls.sweep_interval_ms must be greater than 0");
    }

    if !config.hls.mount_path.starts_with('/') || config.hls.mount_path.len() < 2 {
        anyhow::bail!(
            "hls.mount_path must be an absolute URL path, got {:?}",
            config.hls.mount_path
        );
    }

    if let Some(ref path) = config.settings.path {
        if !path.exists() {
            tracing::warn!("Settings file does not exist, defaults apply: {:?}", path);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        validate_config(&config).unwrap();
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.hls.max_segments, 10);
        assert_eq!(config.hls.segment_duration_secs, 2);
        assert_eq!(config.hls.mount_path, "/hls");
    }

    #[test]
    fn loads_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
            [server]
            port = 8088

            [relay]
            grace_period_ms = 250

            [hls]
            root = "/tmp/streams"
            max_segments = 5
            "#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.server.port, 8088);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.relay.grace_period_ms, 250);
        assert_eq!(config.relay.chunk_size, 64 * 1024);
        assert_eq!(config.hls.root, PathBuf::from("/tmp/streams"));
        assert_eq!(config.hls.max_segments, 5);
        assert_eq!(config.tools.ffmpeg, PathBuf::from("ffmpeg"));
    }

    #[test]
    fn rejects_zero_max_segments() {
        let mut config = Config::default();
        config.hls.max_segments = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn rejects_zero_sweep_interval() {
        let mut config = Config::default();
        config.hls.sweep_interval_ms = 0;
        assert!(validate_config(&config).is_err());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[hls]\nsweep_interval_ms = 0\n").unwrap();
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn sweep_interval_is_never_zero() {
        let mut config = Config::default();
        config.hls.sweep_interval_ms = 0;
        assert!(config.hls.sweep_interval() > std::time::Duration::ZERO);
    }

    #[test]
    fn rejects_relative_mount_path() {
        let mut config = Config::default();
        config.hls.mount_path = "hls".to_string();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn rejects_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server\nport = ").unwrap();
        assert!(load_config(&path).is_err());
    }
}
