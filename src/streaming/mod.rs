//! Transcoder sessions and their delivery paths.
//!
//! - [`sessions`]: session registry and lifecycle
//! - [`relay`]: stdout relay into a client sink
//! - [`hls`]: publish directories and segment retention
//! - [`playlist`]: HLS media playlist model

pub mod hls;
pub mod playlist;
pub mod relay;
pub mod sessions;

pub use hls::{sweep, HlsPublisher, PublishTarget, RetentionPolicy, SweepReport};
pub use playlist::{MediaPlaylist, PlaylistError, PlaylistSegment};
pub use relay::{BodyStream, ByteSink, ChannelSink, SinkError};
pub use sessions::{
    redact_source, start_cleanup_task, SessionConfig, SessionHandle, SessionId, SessionInfo,
    SessionManager, SessionState, SessionStatus,
};
