//! Relay error taxonomy and its HTTP mapping.
//!
//! Process-level failures are translated into these variants at the session
//! boundary; handlers return them directly and callers only ever see a
//! status code plus `{"error": "..."}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Errors surfaced by the relay.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Missing or malformed input. No process was started.
    #[error("{0}")]
    InvalidRequest(String),

    /// The requested format is not in the profile registry.
    #[error("Unknown stream format: {0}")]
    UnknownProfile(String),

    /// The transcoder could not be started.
    #[error("FFmpeg process failed to start")]
    LaunchFailure(#[source] streamrelay_av::Error),

    /// The prober could not be started.
    #[error("Failed to start stream probe")]
    ProbeLaunchFailure(#[source] streamrelay_av::Error),

    /// The prober ran but exited unsuccessfully (or timed out).
    #[error("Failed to get stream info")]
    ProbeExitFailure(#[source] streamrelay_av::Error),

    /// The prober's output could not be parsed.
    #[error("Failed to parse stream info")]
    ProbeParseFailure(#[source] streamrelay_av::Error),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// The request conflicts with a live session.
    #[error("{0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// Classify a prober error.
    pub fn from_probe(err: streamrelay_av::Error) -> Self {
        use streamrelay_av::Error as AvError;
        match err {
            AvError::Launch { .. } | AvError::ToolNotFound { .. } => Self::ProbeLaunchFailure(err),
            AvError::Parse { .. } => Self::ProbeParseFailure(err),
            _ => Self::ProbeExitFailure(err),
        }
    }

    /// Map this error to an HTTP status code.
    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) | Self::UnknownProfile(_) => StatusCode::BAD_REQUEST,
            Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::LaunchFailure(_)
            | Self::ProbeLaunchFailure(_)
            | Self::ProbeExitFailure(_)
            | Self::ProbeParseFailure(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.http_status();

        if status.is_server_error() {
            let cause = std::error::Error::source(&self)
                .map(|e| e.to_string())
                .unwrap_or_default();
            tracing::error!(status = %status, error = %self, cause = %cause, "Relay request failed");
        }

        (status, axum::Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use streamrelay_av::Error as AvError;

    #[test]
    fn invalid_request_is_400() {
        let err = RelayError::invalid("Stream URL is required");
        assert_eq!(err.to_string(), "Stream URL is required");
        assert_eq!(err.http_status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn unknown_profile_is_400() {
        let err = RelayError::UnknownProfile("webm".into());
        assert_eq!(err.http_status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn launch_failure_hides_cause_from_message() {
        let err = RelayError::LaunchFailure(AvError::launch(
            "ffmpeg",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        ));
        assert_eq!(err.to_string(), "FFmpeg process failed to start");
        assert_eq!(err.http_status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn probe_errors_are_classified() {
        let launch = RelayError::from_probe(AvError::launch(
            "ffprobe",
            std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        ));
        assert!(matches!(launch, RelayError::ProbeLaunchFailure(_)));

        let exit = RelayError::from_probe(AvError::tool_failed("ffprobe", Some(1), "exit 1"));
        assert!(matches!(exit, RelayError::ProbeExitFailure(_)));
        assert_eq!(exit.to_string(), "Failed to get stream info");

        let timeout = RelayError::from_probe(AvError::Timeout {
            tool: "ffprobe".into(),
            after: std::time::Duration::from_secs(1),
        });
        assert!(matches!(timeout, RelayError::ProbeExitFailure(_)));

        let parse = RelayError::from_probe(AvError::parse_error("ffprobe", "bad json"));
        assert!(matches!(parse, RelayError::ProbeParseFailure(_)));
        assert_eq!(parse.to_string(), "Failed to parse stream info");
    }

    #[test]
    fn response_body_is_error_object() {
        let response = RelayError::Conflict("busy".into()).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
