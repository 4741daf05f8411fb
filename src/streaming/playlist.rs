//! Minimal HLS media playlist model.
//!
//! Only what retention needs: the header tags are carried through verbatim,
//! segments keep their own tags, and the media sequence is tracked so the
//! window can be trimmed from the front.

use std::fmt::Write as _;
use std::sync::OnceLock;

use regex::Regex;

const MEDIA_SEQUENCE_TAG: &str = "#EXT-X-MEDIA-SEQUENCE:";
const ENDLIST_TAG: &str = "#EXT-X-ENDLIST";

/// Tags that belong to the following segment rather than the playlist.
const SEGMENT_TAG_PREFIXES: &[&str] = &[
    "#EXTINF",
    "#EXT-X-DISCONTINUITY",
    "#EXT-X-PROGRAM-DATE-TIME",
    "#EXT-X-BYTERANGE",
];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PlaylistError {
    #[error("playlist does not start with #EXTM3U")]
    MissingHeader,
    #[error("invalid media sequence: {0}")]
    InvalidMediaSequence(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistSegment {
    pub tags: Vec<String>,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaPlaylist {
    pub header: Vec<String>,
    pub media_sequence: u64,
    pub segments: Vec<PlaylistSegment>,
    pub ended: bool,
}

impl MediaPlaylist {
    pub fn parse(text: &str) -> Result<Self, PlaylistError> {
        let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());

        if lines.next() != Some("#EXTM3U") {
            return Err(PlaylistError::MissingHeader);
        }

        let mut playlist = MediaPlaylist {
            header: Vec::new(),
            media_sequence: 0,
            segments: Vec::new(),
            ended: false,
        };
        let mut pending: Vec<String> = Vec::new();

        for line in lines {
            if let Some(value) = line.strip_prefix(MEDIA_SEQUENCE_TAG) {
                playlist.media_sequence = value
                    .trim()
                    .parse()
                    .map_err(|_| PlaylistError::InvalidMediaSequence(value.to_string()))?;
            } else if line == ENDLIST_TAG {
                playlist.ended = true;
            } else if line.starts_with('#') {
                let segment_tag = SEGMENT_TAG_PREFIXES.iter().any(|p| line.starts_with(p));
                if pending.is_empty() && playlist.segments.is_empty() && !segment_tag {
                    playlist.header.push(line.to_string());
                } else {
                    pending.push(line.to_string());
                }
            } else {
                playlist.segments.push(PlaylistSegment {
                    tags: std::mem::take(&mut pending),
                    uri: line.to_string(),
                });
            }
        }

        Ok(playlist)
    }

    /// Keep only the newest `max` segments. Returns how many were dropped.
    pub fn retain_latest(&mut self, max: usize) -> usize {
        let excess = self.segments.len().saturating_sub(max);
        if excess > 0 {
            self.segments.drain(..excess);
            self.media_sequence += excess as u64;
        }
        excess
    }

    pub fn render(&self) -> String {
        let mut out = String::from("#EXTM3U\n");
        for tag in &self.header {
            out.push_str(tag);
            out.push('\n');
        }
        let _ = writeln!(out, "{}{}", MEDIA_SEQUENCE_TAG, self.media_sequence);
        for segment in &self.segments {
            for tag in &segment.tags {
                out.push_str(tag);
                out.push('\n');
            }
            out.push_str(&segment.uri);
            out.push('\n');
        }
        if self.ended {
            out.push_str(ENDLIST_TAG);
            out.push('\n');
        }
        out
    }

    /// File names referenced by the playlist (URI path component only).
    pub fn segment_file_names(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().map(|s| file_name_of(&s.uri))
    }
}

fn file_name_of(uri: &str) -> &str {
    let path = uri.split(['?', '#']).next().unwrap_or(uri);
    path.rsplit('/').next().unwrap_or(path)
}

/// Sequence number encoded in a finished segment's file name.
///
/// `segment_00042.ts` → `Some(42)`. Temporary files and anything that does
/// not look like a media segment yield `None`.
pub fn segment_number(file_name: &str) -> Option<u64> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r"(\d+)\.(?:ts|m4s|mp4|aac)$").expect("segment pattern is valid")
    });

    pattern
        .captures(file_name)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "#EXTM3U
#EXT-X-VERSION:3
#EXT-X-TARGETDURATION:2
#EXT-X-MEDIA-SEQUENCE:7
#EXTINF:2.000000,
segment_00007.ts
#EXTINF:2.000000,
segment_00008.ts
#EXT-X-DISCONTINUITY
#EXTINF:1.960000,
segment_00009.ts
";

    #[test]
    fn parses_ffmpeg_playlist() {
        let playlist = MediaPlaylist::parse(SAMPLE).unwrap();
        assert_eq!(playlist.header, vec!["#EXT-X-VERSION:3", "#EXT-X-TARGETDURATION:2"]);
        assert_eq!(playlist.media_sequence, 7);
        assert_eq!(playlist.segments.len(), 3);
        assert_eq!(
            playlist.segments[2].tags,
            vec!["#EXT-X-DISCONTINUITY", "#EXTINF:1.960000,"]
        );
        assert!(!playlist.ended);
    }

    #[test]
    fn render_round_trips_structure() {
        let playlist = MediaPlaylist::parse(SAMPLE).unwrap();
        assert_eq!(MediaPlaylist::parse(&playlist.render()).unwrap(), playlist);
    }

    #[test]
    fn retain_latest_advances_media_sequence() {
        let mut playlist = MediaPlaylist::parse(SAMPLE).unwrap();
        assert_eq!(playlist.retain_latest(2), 1);
        assert_eq!(playlist.media_sequence, 8);
        let names: Vec<&str> = playlist.segment_file_names().collect();
        assert_eq!(names, vec!["segment_00008.ts", "segment_00009.ts"]);

        assert_eq!(playlist.retain_latest(5), 0);
        assert_eq!(playlist.segments.len(), 2);
    }

    #[test]
    fn endlist_is_preserved() {
        let playlist =
            MediaPlaylist::parse("#EXTM3U\n#EXTINF:2,\nsegment_00001.ts\n#EXT-X-ENDLIST\n")
                .unwrap();
        assert!(playlist.ended);
        assert!(playlist.render().ends_with("#EXT-X-ENDLIST\n"));
    }

    #[test]
    fn rejects_non_playlists() {
        assert_eq!(
            MediaPlaylist::parse("segment_1.ts\n"),
            Err(PlaylistError::MissingHeader)
        );
        assert!(matches!(
            MediaPlaylist::parse("#EXTM3U\n#EXT-X-MEDIA-SEQUENCE:abc\n"),
            Err(PlaylistError::InvalidMediaSequence(_))
        ));
    }

    #[test]
    fn segment_numbers() {
        assert_eq!(segment_number("segment_00042.ts"), Some(42));
        assert_eq!(segment_number("segment_100000.ts"), Some(100000));
        assert_eq!(segment_number("segment_00042.ts.tmp"), None);
        assert_eq!(segment_number("stream.m3u8"), None);
        assert_eq!(segment_number("notes.txt"), None);
    }

    #[test]
    fn file_names_strip_paths_and_queries() {
        assert_eq!(file_name_of("segment_00001.ts"), "segment_00001.ts");
        assert_eq!(file_name_of("/hls/cam/segment_00001.ts?x=1"), "segment_00001.ts");
    }
}
