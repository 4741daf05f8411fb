//! Stream metadata types.

use serde::{Deserialize, Serialize};

/// Metadata reported for a source stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    /// The probed source URI.
    pub source: String,
    /// Container/demuxer name (e.g. "rtsp", "mov,mp4,m4a,3gp,3g2,mj2").
    pub format_name: String,
    /// Human-readable container name.
    pub format_long_name: Option<String>,
    /// Duration in seconds; `None` for live sources.
    pub duration_secs: Option<f64>,
    /// Overall bit rate in bits per second.
    pub bit_rate: Option<u64>,
    /// Video streams in source order.
    pub video_streams: Vec<VideoStream>,
    /// Audio streams in source order.
    pub audio_streams: Vec<AudioStream>,
    /// Streams that are neither audio nor video (data, subtitles, attachments).
    pub other_streams: u32,
}

impl StreamInfo {
    /// First video stream, if any.
    pub fn primary_video(&self) -> Option<&VideoStream> {
        self.video_streams.first()
    }

    /// Whether the source reports a finite duration.
    pub fn is_live(&self) -> bool {
        self.duration_secs.is_none()
    }
}

/// A video stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoStream {
    /// Stream index within the source.
    pub index: u32,
    pub codec: String,
    pub profile: Option<String>,
    pub width: u32,
    pub height: u32,
    /// Frame rate in FPS.
    pub frame_rate: Option<f64>,
    pub pixel_format: Option<String>,
    pub bit_rate: Option<u64>,
}

/// An audio stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioStream {
    /// Stream index within the source.
    pub index: u32,
    pub codec: String,
    pub channels: u32,
    pub sample_rate: Option<u32>,
    pub language: Option<String>,
    pub bit_rate: Option<u64>,
}
