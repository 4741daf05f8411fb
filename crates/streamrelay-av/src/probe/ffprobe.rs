//! FFprobe-based stream probing.

use super::types::*;
use crate::{Error, Result, ToolCommand};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

const TOOL: &str = "ffprobe";

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: Option<FfprobeFormat>,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    format_name: String,
    format_long_name: Option<String>,
    duration: Option<String>,
    bit_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    index: u32,
    codec_type: Option<String>,
    codec_name: Option<String>,
    profile: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    pix_fmt: Option<String>,
    channels: Option<u32>,
    sample_rate: Option<String>,
    bit_rate: Option<String>,
    #[serde(default)]
    tags: FfprobeTags,
}

#[derive(Debug, Default, Deserialize)]
struct FfprobeTags {
    language: Option<String>,
}

/// One-shot metadata prober backed by the `ffprobe` binary.
#[derive(Debug, Clone)]
pub struct StreamProber {
    binary: PathBuf,
    timeout: Duration,
}

impl StreamProber {
    /// Create a prober for the given ffprobe binary.
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Bound the probe duration; the process is killed when it elapses.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Probe `source` and parse the reported metadata.
    ///
    /// # Errors
    ///
    /// - [`Error::Launch`] if ffprobe cannot be started.
    /// - [`Error::ToolFailed`] / [`Error::Timeout`] if it does not exit cleanly.
    /// - [`Error::Parse`] if its output is not the expected JSON document.
    pub async fn probe(&self, source: &str) -> Result<StreamInfo> {
        let output = ToolCommand::new(self.binary.clone())
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
                // Bound to -i so a source starting with '-' is never read as an option.
                "-i",
            ])
            .arg(source)
            .timeout(self.timeout)
            .execute()
            .await?;

        parse_ffprobe_output(source, &output.stdout)
    }
}

/// Parse ffprobe's `-print_format json -show_format -show_streams` output.
pub fn parse_ffprobe_output(source: &str, raw: &[u8]) -> Result<StreamInfo> {
    let json_str = std::str::from_utf8(raw)
        .map_err(|e| Error::parse_error(TOOL, format!("Invalid UTF-8: {}", e)))?;

    let output: FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| Error::parse_error(TOOL, e.to_string()))?;

    let format = output
        .format
        .ok_or_else(|| Error::parse_error(TOOL, "missing format section"))?;

    let mut info = StreamInfo {
        source: source.to_string(),
        format_name: format.format_name,
        format_long_name: format.format_long_name,
        duration_secs: format
            .duration
            .and_then(|s| s.parse::<f64>().ok())
            .filter(|d| d.is_finite() && *d > 0.0),
        bit_rate: format.bit_rate.and_then(|s| s.parse().ok()),
        video_streams: Vec::new(),
        audio_streams: Vec::new(),
        other_streams: 0,
    };

    for stream in output.streams {
        match stream.codec_type.as_deref() {
            Some("video") => {
                let frame_rate = stream
                    .avg_frame_rate
                    .as_deref()
                    .and_then(parse_frame_rate)
                    .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_frame_rate));

                info.video_streams.push(VideoStream {
                    index: stream.index,
                    codec: stream.codec_name.unwrap_or_default(),
                    profile: stream.profile,
                    width: stream.width.unwrap_or(0),
                    height: stream.height.unwrap_or(0),
                    frame_rate,
                    pixel_format: stream.pix_fmt,
                    bit_rate: stream.bit_rate.and_then(|s| s.parse().ok()),
                });
            }
            Some("audio") => {
                info.audio_streams.push(AudioStream {
                    index: stream.index,
                    codec: stream.codec_name.unwrap_or_default(),
                    channels: stream.channels.unwrap_or(2),
                    sample_rate: stream.sample_rate.and_then(|s| s.parse().ok()),
                    language: stream.tags.language,
                    bit_rate: stream.bit_rate.and_then(|s| s.parse().ok()),
                });
            }
            _ => info.other_streams += 1,
        }
    }

    Ok(info)
}

fn parse_frame_rate(rate_str: &str) -> Option<f64> {
    let parts: Vec<&str> = rate_str.split('/').collect();
    if parts.len() == 2 {
        let num: f64 = parts[0].parse().ok()?;
        let den: f64 = parts[1].parse().ok()?;
        if den != 0.0 && num != 0.0 {
            return Some(num / den);
        }
        return None;
    }
    rate_str.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const RTSP_SAMPLE: &str = r#"{
        "streams": [
            {
                "index": 0,
                "codec_name": "h264",
                "profile": "Main",
                "codec_type": "video",
                "width": 1920,
                "height": 1080,
                "pix_fmt": "yuvj420p",
                "r_frame_rate": "25/1",
                "avg_frame_rate": "0/0"
            },
            {
                "index": 1,
                "codec_name": "pcm_alaw",
                "codec_type": "audio",
                "sample_rate": "8000",
                "channels": 1,
                "bit_rate": "64000",
                "tags": { "language": "und" }
            },
            {
                "index": 2,
                "codec_type": "data"
            }
        ],
        "format": {
            "filename": "rtsp://cam.local/live",
            "nb_streams": 3,
            "format_name": "rtsp",
            "format_long_name": "RTSP input",
            "start_time": "0.000000",
            "duration": "N/A",
            "probe_score": 100
        }
    }"#;

    #[test]
    fn test_parse_frame_rate() {
        assert_eq!(parse_frame_rate("24000/1001"), Some(23.976023976023978));
        assert_eq!(parse_frame_rate("30/1"), Some(30.0));
        assert_eq!(parse_frame_rate("25"), Some(25.0));
        assert_eq!(parse_frame_rate("0/0"), None);
        assert_eq!(parse_frame_rate("invalid"), None);
    }

    #[test]
    fn parses_live_rtsp_source() {
        let info = parse_ffprobe_output("rtsp://cam.local/live", RTSP_SAMPLE.as_bytes()).unwrap();

        assert_eq!(info.format_name, "rtsp");
        assert!(info.is_live());

        let video = info.primary_video().unwrap();
        assert_eq!(video.codec, "h264");
        assert_eq!((video.width, video.height), (1920, 1080));
        // avg_frame_rate of 0/0 falls back to r_frame_rate.
        assert_eq!(video.frame_rate, Some(25.0));

        assert_eq!(info.audio_streams.len(), 1);
        assert_eq!(info.audio_streams[0].sample_rate, Some(8000));
        assert_eq!(info.audio_streams[0].channels, 1);
        assert_eq!(info.other_streams, 1);
    }

    #[test]
    fn parses_file_duration_and_bit_rate() {
        let raw = br#"{
            "streams": [],
            "format": {
                "format_name": "mov,mp4,m4a,3gp,3g2,mj2",
                "duration": "596.474195",
                "bit_rate": "2119234"
            }
        }"#;
        let info = parse_ffprobe_output("http://example.com/a.mp4", raw).unwrap();
        assert_eq!(info.duration_secs, Some(596.474195));
        assert_eq!(info.bit_rate, Some(2_119_234));
        assert!(info.video_streams.is_empty());
    }

    #[test]
    fn invalid_json_is_a_parse_error() {
        let err = parse_ffprobe_output("x", b"not json").unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
    }

    #[test]
    fn missing_format_is_a_parse_error() {
        let err = parse_ffprobe_output("x", b"{}").unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
    }

    #[test]
    fn invalid_utf8_is_a_parse_error() {
        let err = parse_ffprobe_output("x", &[0xff, 0xfe, 0x00]).unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn probe_missing_binary_is_launch_failure() {
        let err = StreamProber::new("/nonexistent/ffprobe")
            .probe("rtsp://cam.local/live")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Launch { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn probe_nonzero_exit_is_tool_failure() {
        // `false` ignores its arguments and exits 1.
        let err = StreamProber::new("false")
            .probe("rtsp://unreachable.invalid/live")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ToolFailed { code: Some(1), .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn probe_garbage_output_is_parse_failure() {
        // `echo` prints its arguments, which is not JSON.
        let err = StreamProber::new("echo")
            .probe("rtsp://cam.local/live")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
    }
}
