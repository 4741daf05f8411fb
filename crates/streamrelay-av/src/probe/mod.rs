//! Stream metadata probing.
//!
//! Probing is a bounded, one-shot operation: the prober process is started,
//! its JSON output accumulated and parsed, and the process is gone by the
//! time a result is returned.

mod ffprobe;
mod types;

pub use ffprobe::{parse_ffprobe_output, StreamProber};
pub use types::*;
