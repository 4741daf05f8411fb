//! Output format profiles.
//!
//! A profile selects the transcoder arguments, the response content type and
//! whether output is relayed through the caller's sink or written to disk as
//! HLS segments. The registry is built once and never mutated, so resolving
//! a name always yields the same configuration.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Fragmented MP4 relayed over the response body.
pub const PROGRESSIVE: &str = "progressive";
/// MPEG-TS relayed over the response body.
pub const LEGACY_PACKETIZED: &str = "legacy-packetized";
/// HLS segments written into a publish directory.
pub const SEGMENTED: &str = "segmented";

/// Index file name written by the segmented profile.
pub const PLAYLIST_FILE: &str = "stream.m3u8";
/// Segment file pattern handed to the transcoder.
pub const SEGMENT_PATTERN: &str = "segment_%05d.ts";

/// Flags placed before the input on every invocation.
const COMMON_INPUT_ARGS: &[&str] = &["-hide_banner", "-loglevel", "warning", "-nostats"];

/// How a profile's output reaches viewers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Delivery {
    /// Transcoder stdout is relayed to the requester's connection.
    Stream,
    /// The transcoder writes files that are served statically.
    Filesystem,
}

/// Encoder rate-control knobs shared by the H.264 profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateControl {
    pub crf: u8,
    pub maxrate_kbps: u32,
    pub bufsize_kbps: u32,
}

impl RateControl {
    fn args(&self) -> [String; 6] {
        [
            "-crf".to_string(),
            self.crf.to_string(),
            "-maxrate".to_string(),
            format!("{}k", self.maxrate_kbps),
            "-bufsize".to_string(),
            format!("{}k", self.bufsize_kbps),
        ]
    }
}

/// Where the transcoder should put its output.
#[derive(Debug, Clone, Copy)]
pub enum OutputTarget<'a> {
    /// Write the container to stdout.
    Pipe,
    /// Write an HLS index plus segments into `dir`, numbering segments from
    /// `start_number`.
    Segments {
        dir: &'a Path,
        segment_duration_secs: u32,
        max_segments: usize,
        start_number: u64,
    },
}

/// Immutable description of one output format.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormatProfile {
    pub name: String,
    /// Codec and muxer arguments, placed between the input and the output.
    pub args: Vec<String>,
    /// `None` for profiles that are not served over the response body.
    pub content_type: Option<String>,
    pub delivery: Delivery,
    /// Default rate control; `None` when the profile pins its own bitrate.
    pub rate_control: Option<RateControl>,
}

impl FormatProfile {
    fn new(
        name: &str,
        args: &[&str],
        content_type: Option<&str>,
        delivery: Delivery,
        rate_control: Option<RateControl>,
    ) -> Self {
        Self {
            name: name.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            content_type: content_type.map(str::to_string),
            delivery,
            rate_control,
        }
    }

    /// Whether output is relayed through a sink rather than written to disk.
    pub fn streams_to_sink(&self) -> bool {
        self.delivery == Delivery::Stream
    }

    /// Build the full transcoder argument vector for `source`.
    ///
    /// `rate_control` overrides the profile default; it is ignored for
    /// profiles that pin their own bitrate.
    pub fn invocation(
        &self,
        source: &str,
        target: &OutputTarget<'_>,
        rate_control: Option<RateControl>,
    ) -> Result<Vec<String>> {
        let mut args: Vec<String> = COMMON_INPUT_ARGS.iter().map(|s| s.to_string()).collect();
        args.push("-i".to_string());
        args.push(source.to_string());
        args.extend(self.args.iter().cloned());

        if let Some(rc) = self.rate_control.map(|default| rate_control.unwrap_or(default)) {
            args.extend(rc.args());
        }

        match (self.delivery, target) {
            (Delivery::Stream, OutputTarget::Pipe) => {
                args.push("pipe:1".to_string());
            }
            (
                Delivery::Filesystem,
                OutputTarget::Segments {
                    dir,
                    segment_duration_secs,
                    max_segments,
                    start_number,
                },
            ) => {
                // The index lists one entry fewer than the window so the
                // segment renamed in ahead of the next index still fits.
                let list_size = max_segments.saturating_sub(1).max(1);
                args.extend([
                    "-hls_time".to_string(),
                    segment_duration_secs.to_string(),
                    "-hls_list_size".to_string(),
                    list_size.to_string(),
                    "-start_number".to_string(),
                    start_number.to_string(),
                    // Segments and index are renamed into place once complete.
                    "-hls_flags".to_string(),
                    "temp_file+independent_segments".to_string(),
                    "-hls_segment_filename".to_string(),
                    dir.join(SEGMENT_PATTERN).to_string_lossy().to_string(),
                    dir.join(PLAYLIST_FILE).to_string_lossy().to_string(),
                ]);
            }
            (Delivery::Stream, OutputTarget::Segments { .. }) => {
                return Err(Error::InvalidTarget(format!(
                    "profile '{}' streams to a sink and cannot write segments",
                    self.name
                )));
            }
            (Delivery::Filesystem, OutputTarget::Pipe) => {
                return Err(Error::InvalidTarget(format!(
                    "profile '{}' writes segment files and cannot stream to a sink",
                    self.name
                )));
            }
        }

        Ok(args)
    }
}

/// Lookup table of the available output profiles.
#[derive(Debug, Clone)]
pub struct ProfileRegistry {
    profiles: Vec<FormatProfile>,
}

impl ProfileRegistry {
    /// The built-in profiles.
    pub fn standard() -> Self {
        let h264_rate = RateControl {
            crf: 23,
            maxrate_kbps: 1000,
            bufsize_kbps: 2000,
        };

        let profiles = vec![
            FormatProfile::new(
                PROGRESSIVE,
                &[
                    "-c:v",
                    "libx264",
                    "-c:a",
                    "aac",
                    "-preset",
                    "ultrafast",
                    "-tune",
                    "zerolatency",
                    "-f",
                    "mp4",
                    // Fragment on keyframes with an empty moov so playback can
                    // start before the stream ends.
                    "-movflags",
                    "frag_keyframe+empty_moov+default_base_moof",
                ],
                Some("video/mp4"),
                Delivery::Stream,
                Some(h264_rate),
            ),
            FormatProfile::new(
                LEGACY_PACKETIZED,
                &[
                    "-f",
                    "mpegts",
                    "-codec:v",
                    "mpeg1video",
                    "-codec:a",
                    "mp2",
                    "-b:v",
                    "1000k",
                    "-bf",
                    "0",
                    "-muxdelay",
                    "0.001",
                ],
                Some("video/mp2t"),
                Delivery::Stream,
                None,
            ),
            FormatProfile::new(
                SEGMENTED,
                &[
                    "-c:v",
                    "libx264",
                    "-c:a",
                    "aac",
                    "-preset",
                    "veryfast",
                    "-f",
                    "hls",
                ],
                None,
                Delivery::Filesystem,
                Some(h264_rate),
            ),
        ];

        Self { profiles }
    }

    /// Look up a profile by name.
    pub fn resolve(&self, name: &str) -> Result<&FormatProfile> {
        self.profiles
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| Error::UnknownProfile(name.to_string()))
    }

    /// Registered profile names in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.profiles.iter().map(|p| p.name.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FormatProfile> {
        self.profiles.iter()
    }
}

impl Default for ProfileRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn standard_registry_has_three_profiles() {
        let registry = ProfileRegistry::standard();
        assert_eq!(
            registry.names(),
            vec![PROGRESSIVE, LEGACY_PACKETIZED, SEGMENTED]
        );
    }

    #[test]
    fn resolve_is_deterministic() {
        let registry = ProfileRegistry::standard();
        let first = registry.resolve(PROGRESSIVE).unwrap().clone();
        for _ in 0..10 {
            assert_eq!(registry.resolve(PROGRESSIVE).unwrap(), &first);
        }
    }

    #[test]
    fn resolve_unknown_profile() {
        let registry = ProfileRegistry::standard();
        let err = registry.resolve("webm").unwrap_err();
        assert!(matches!(err, Error::UnknownProfile(ref n) if n == "webm"));
    }

    #[test]
    fn content_types_and_delivery() {
        let registry = ProfileRegistry::standard();

        let progressive = registry.resolve(PROGRESSIVE).unwrap();
        assert_eq!(progressive.content_type.as_deref(), Some("video/mp4"));
        assert!(progressive.streams_to_sink());

        let packetized = registry.resolve(LEGACY_PACKETIZED).unwrap();
        assert_eq!(packetized.content_type.as_deref(), Some("video/mp2t"));
        assert!(packetized.streams_to_sink());

        let segmented = registry.resolve(SEGMENTED).unwrap();
        assert!(segmented.content_type.is_none());
        assert_eq!(segmented.delivery, Delivery::Filesystem);
    }

    #[test]
    fn progressive_invocation_pipes_fragmented_mp4() {
        let registry = ProfileRegistry::standard();
        let args = registry
            .resolve(PROGRESSIVE)
            .unwrap()
            .invocation("rtsp://cam.local/live", &OutputTarget::Pipe, None)
            .unwrap();

        let input = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[input + 1], "rtsp://cam.local/live");
        assert_eq!(args.last().map(String::as_str), Some("pipe:1"));
        assert!(args
            .windows(2)
            .any(|w| w[0] == "-movflags" && w[1] == "frag_keyframe+empty_moov+default_base_moof"));
        assert!(args.windows(2).any(|w| w[0] == "-maxrate" && w[1] == "1000k"));
    }

    #[test]
    fn rate_control_override_replaces_defaults() {
        let registry = ProfileRegistry::standard();
        let rc = RateControl {
            crf: 30,
            maxrate_kbps: 400,
            bufsize_kbps: 512,
        };
        let args = registry
            .resolve(PROGRESSIVE)
            .unwrap()
            .invocation("http://example.com/a.mp4", &OutputTarget::Pipe, Some(rc))
            .unwrap();

        assert!(args.windows(2).any(|w| w[0] == "-crf" && w[1] == "30"));
        assert!(args.windows(2).any(|w| w[0] == "-bufsize" && w[1] == "512k"));
        assert!(!args.iter().any(|a| a == "1000k"));
    }

    #[test]
    fn packetized_ignores_rate_control() {
        let registry = ProfileRegistry::standard();
        let rc = RateControl {
            crf: 30,
            maxrate_kbps: 400,
            bufsize_kbps: 512,
        };
        let args = registry
            .resolve(LEGACY_PACKETIZED)
            .unwrap()
            .invocation("rtsp://cam.local/live", &OutputTarget::Pipe, Some(rc))
            .unwrap();

        assert!(!args.iter().any(|a| a == "-crf"));
        assert!(args.windows(2).any(|w| w[0] == "-muxdelay" && w[1] == "0.001"));
    }

    #[test]
    fn segmented_invocation_writes_into_directory() {
        let registry = ProfileRegistry::standard();
        let dir = PathBuf::from("/tmp/out");
        let args = registry
            .resolve(SEGMENTED)
            .unwrap()
            .invocation(
                "rtsp://cam.local/live",
                &OutputTarget::Segments {
                    dir: &dir,
                    segment_duration_secs: 2,
                    max_segments: 10,
                    start_number: 42,
                },
                None,
            )
            .unwrap();

        assert!(args.windows(2).any(|w| w[0] == "-hls_time" && w[1] == "2"));
        assert!(args.windows(2).any(|w| w[0] == "-hls_list_size" && w[1] == "9"));
        assert!(args.windows(2).any(|w| w[0] == "-start_number" && w[1] == "42"));
        assert!(args
            .windows(2)
            .any(|w| w[0] == "-hls_segment_filename" && w[1] == "/tmp/out/segment_%05d.ts"));
        assert_eq!(args.last().map(String::as_str), Some("/tmp/out/stream.m3u8"));
    }

    #[test]
    fn mismatched_targets_are_rejected() {
        let registry = ProfileRegistry::standard();
        let dir = PathBuf::from("/tmp/out");

        let err = registry
            .resolve(SEGMENTED)
            .unwrap()
            .invocation("rtsp://a", &OutputTarget::Pipe, None)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTarget(_)));

        let err = registry
            .resolve(PROGRESSIVE)
            .unwrap()
            .invocation(
                "rtsp://a",
                &OutputTarget::Segments {
                    dir: &dir,
                    segment_duration_secs: 2,
                    max_segments: 10,
                    start_number: 0,
                },
                None,
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTarget(_)));
    }
}
