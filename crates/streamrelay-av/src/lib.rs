//! # streamrelay-av
//!
//! External media tool plumbing for the stream relay.
//!
//! This crate provides:
//! - The output profile registry mapping format names to transcoder arguments
//! - A supervised transcoder process handle with graceful termination
//! - One-shot tool execution with timeouts
//! - Stream metadata probing through ffprobe
//!
//! ## Example
//!
//! ```no_run
//! use std::path::Path;
//! use streamrelay_av::{OutputTarget, ProfileRegistry, StdoutMode, TranscoderProcess};
//!
//! # async fn example() -> streamrelay_av::Result<()> {
//! let registry = ProfileRegistry::standard();
//! let profile = registry.resolve("progressive")?;
//! let args = profile.invocation("rtsp://cam.local/live", &OutputTarget::Pipe, None)?;
//!
//! let mut process = TranscoderProcess::launch(Path::new("ffmpeg"), &args, StdoutMode::Piped)?;
//! let _stdout = process.take_stdout();
//! process.terminate(std::time::Duration::from_secs(5)).await?;
//! # Ok(())
//! # }
//! ```

mod command;
mod error;
pub mod probe;
pub mod process;
pub mod profile;
pub mod tools;

// Re-exports
pub use command::{ToolCommand, ToolOutput};
pub use error::{Error, Result};
pub use probe::{AudioStream, StreamInfo, StreamProber, VideoStream};
pub use process::{StdoutMode, Termination, TranscoderProcess};
pub use profile::{Delivery, FormatProfile, OutputTarget, ProfileRegistry, RateControl};
pub use tools::{check_tool, check_tools, require_tool, resolve_tool_path, ToolInfo};
