use crate::error::RelayError;
use crate::server::{AppContext, SESSION_HEADER};
use crate::streaming::{ChannelSink, RetentionPolicy, SessionId};
use axum::{
    body::Body,
    extract::{rejection::JsonRejection, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use streamrelay_av::{profile::PROGRESSIVE, RateControl};

pub fn stream_routes() -> Router<AppContext> {
    Router::new()
        .route("/stream", get(stream))
        .route("/stream/hls", post(start_hls))
        .route("/stream/info", get(stream_info))
}

#[derive(Deserialize)]
struct StreamQuery {
    url: Option<String>,
    format: Option<String>,
}

async fn stream(
    State(ctx): State<AppContext>,
    Query(params): Query<StreamQuery>,
) -> Result<Response, RelayError> {
    let url = non_empty(params.url).ok_or_else(|| RelayError::invalid("Stream URL is required"))?;

    // Without an explicit format the stored preferences pick the bitrate
    let (format, rate_control) = match non_empty(params.format) {
        Some(format) => (format, None),
        None => (PROGRESSIVE.to_string(), preferred_rate_control(&ctx).await),
    };

    let (sink, body) = ChannelSink::new(ctx.config.relay.channel_capacity);
    let handle = ctx
        .sessions
        .start_stream(&url, &format, rate_control, Box::new(sink))?;

    Response::builder()
        .status(StatusCode::OK)
        .header(
            header::CONTENT_TYPE,
            handle.content_type().unwrap_or("application/octet-stream"),
        )
        .header(header::CACHE_CONTROL, "no-cache")
        .header(SESSION_HEADER, handle.id().to_string())
        .body(Body::from_stream(body))
        .map_err(|e| RelayError::Internal(e.to_string()))
}

#[derive(Debug, Default, Deserialize)]
struct HlsRequest {
    #[serde(default, rename = "sourceURI", alias = "sourceUri", alias = "rtspUrl")]
    source_uri: Option<String>,
    #[serde(default, rename = "outputPath")]
    output_path: Option<String>,
    #[serde(default, rename = "segmentDuration")]
    segment_duration: Option<u32>,
    #[serde(default, rename = "maxSegments")]
    max_segments: Option<usize>,
}

#[derive(Debug, Serialize)]
struct HlsResponse {
    message: &'static str,
    #[serde(rename = "playlistURL")]
    playlist_url: String,
    #[serde(rename = "sessionId")]
    session_id: SessionId,
}

async fn start_hls(
    State(ctx): State<AppContext>,
    payload: Result<Json<HlsRequest>, JsonRejection>,
) -> Result<Json<HlsResponse>, RelayError> {
    let Json(request) = payload.map_err(|e| RelayError::invalid(e.body_text()))?;

    let source = non_empty(request.source_uri)
        .ok_or_else(|| RelayError::invalid("Source URI is required"))?;
    if request.segment_duration == Some(0) {
        return Err(RelayError::invalid("segmentDuration must be greater than 0"));
    }
    if request.max_segments == Some(0) {
        return Err(RelayError::invalid("maxSegments must be at least 1"));
    }

    let (dir, relative) = ctx
        .publisher
        .resolve_output_dir(request.output_path.as_deref())?;

    let defaults = ctx.publisher.defaults();
    let policy = RetentionPolicy {
        segment_duration_secs: request
            .segment_duration
            .unwrap_or(defaults.segment_duration_secs),
        max_segments: request.max_segments.unwrap_or(defaults.max_segments),
    };

    // A directory that is being published keeps its running policy
    let target = match ctx.publisher.target(&dir) {
        Some(target) if ctx.sessions.segment_owner(&dir).is_some() => target,
        _ => ctx.publisher.ensure_target(&dir, &relative, policy).await?,
    };

    let start_number = target.next_segment_number().await.map_err(|e| {
        RelayError::Internal(format!("cannot scan {}: {}", target.dir().display(), e))
    })?;
    let rate_control = preferred_rate_control(&ctx).await;
    let handle = ctx
        .sessions
        .start_segmented(&source, &target, start_number, rate_control)?;

    let message = if handle.reused() {
        "HLS conversion already running"
    } else {
        "HLS conversion started"
    };

    Ok(Json(HlsResponse {
        message,
        playlist_url: target.published_url().to_string(),
        session_id: handle.id(),
    }))
}

#[derive(Deserialize)]
struct InfoQuery {
    url: Option<String>,
}

async fn stream_info(
    State(ctx): State<AppContext>,
    Query(params): Query<InfoQuery>,
) -> Result<impl IntoResponse, RelayError> {
    let url = non_empty(params.url).ok_or_else(|| RelayError::invalid("Stream URL is required"))?;

    let info = ctx.prober.probe(&url).await.map_err(RelayError::from_probe)?;
    Ok(Json(info))
}

async fn preferred_rate_control(ctx: &AppContext) -> Option<RateControl> {
    match ctx.settings.stream_settings().await {
        Ok(settings) => Some(settings.rate_control()),
        Err(e) => {
            tracing::warn!("Failed to read stream settings, using profile defaults: {:#}", e);
            None
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hls_request_accepts_legacy_field_name() {
        let request: HlsRequest =
            serde_json::from_str(r#"{"rtspUrl":"rtsp://cam","outputPath":"cam1"}"#).unwrap();
        assert_eq!(request.source_uri.as_deref(), Some("rtsp://cam"));
        assert_eq!(request.output_path.as_deref(), Some("cam1"));

        let request: HlsRequest =
            serde_json::from_str(r#"{"sourceURI":"rtsp://cam","maxSegments":4}"#).unwrap();
        assert_eq!(request.source_uri.as_deref(), Some("rtsp://cam"));
        assert_eq!(request.max_segments, Some(4));
    }

    #[test]
    fn hls_response_field_names() {
        let response = HlsResponse {
            message: "HLS conversion started",
            playlist_url: "/hls/stream.m3u8".into(),
            session_id: SessionId::new(),
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["playlistURL"], "/hls/stream.m3u8");
        assert!(json["sessionId"].is_string());
    }

    #[test]
    fn blank_values_are_missing() {
        assert_eq!(non_empty(Some("  ".into())), None);
        assert_eq!(non_empty(None), None);
        assert_eq!(non_empty(Some(" x ".into())), Some("x".into()));
    }
}
