//! External tool detection and management.

use crate::{Error, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Information about an external tool.
#[derive(Debug, Clone, Serialize)]
pub struct ToolInfo {
    /// Name of the tool.
    pub name: String,
    /// Whether the tool is available.
    pub available: bool,
    /// Version string if available.
    pub version: Option<String>,
    /// Path to the tool executable.
    pub path: Option<PathBuf>,
}

/// Check if a tool is available using ffmpeg's `-version` convention.
///
/// `name` may be a bare program name (resolved through `PATH`) or a path.
pub fn check_tool(name: &str) -> ToolInfo {
    let result = Command::new(name).arg("-version").output();

    match result {
        Ok(output) if output.status.success() => {
            let version = String::from_utf8_lossy(&output.stdout)
                .lines()
                .next()
                .map(|s| s.to_string());

            ToolInfo {
                name: name.to_string(),
                available: true,
                version,
                path: which::which(name).ok(),
            }
        }
        _ => ToolInfo {
            name: name.to_string(),
            available: false,
            version: None,
            path: None,
        },
    }
}

/// Check the transcoder and prober binaries.
pub fn check_tools(ffmpeg: &str, ffprobe: &str) -> Vec<ToolInfo> {
    vec![check_tool(ffmpeg), check_tool(ffprobe)]
}

/// Require that a tool is available, returning its path.
///
/// # Errors
///
/// Returns an error if the tool is not found.
pub fn require_tool(name: &str) -> Result<PathBuf> {
    which::which(name).map_err(|_| Error::tool_not_found(name))
}

/// Resolve a configured tool to an executable path.
///
/// Existing paths are used verbatim, anything else is looked up in `PATH`.
/// When neither works the configured value is returned unchanged so that the
/// eventual spawn reports the real OS error.
pub fn resolve_tool_path(configured: &Path) -> PathBuf {
    if configured.exists() {
        return configured.to_path_buf();
    }

    match configured.to_str().map(require_tool) {
        Some(Ok(path)) => path,
        _ => configured.to_path_buf(),
    }
}
