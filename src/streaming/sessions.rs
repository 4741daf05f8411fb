//! Transcoding session lifecycle.
//!
//! Every request that launches a transcoder becomes a session. The manager
//! keeps them in a concurrent map keyed by [`SessionId`]; each entry carries
//! its state in a watch channel so handlers, the relay task and tests all
//! see the same transitions. Finished sessions stay queryable until the
//! cleanup task purges them.

use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use streamrelay_av::profile::SEGMENTED;
use streamrelay_av::{
    FormatProfile, OutputTarget, ProfileRegistry, RateControl, StdoutMode, TranscoderProcess,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::hls::PublishTarget;
use super::relay::{self, ByteSink};
use crate::config::Config;
use crate::error::RelayError;

/// Unique identifier for a transcoding session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for SessionId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state. Transitions only move forward and a session reaches
/// exactly one of the terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Pending,
    Spawning,
    Streaming,
    Draining,
    Closed,
    Failed,
}

impl SessionState {
    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Spawning => 1,
            Self::Streaming => 2,
            Self::Draining => 3,
            Self::Closed | Self::Failed => 4,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Spawning => "spawning",
            Self::Streaming => "streaming",
            Self::Draining => "draining",
            Self::Closed => "closed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current status as published on a session's watch channel.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub state: SessionState,
    pub ended_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outcome {
    Closed { exit_code: Option<i32> },
    Failed { exit_code: Option<i32>, error: String },
}

impl Outcome {
    pub(crate) fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Closed { exit_code } | Self::Failed { exit_code, .. } => *exit_code,
        }
    }
}

pub(crate) struct SessionEntry {
    pub(crate) id: SessionId,
    source: String,
    profile: String,
    content_type: Option<String>,
    output_dir: Option<PathBuf>,
    playlist_url: Option<String>,
    started_at: DateTime<Utc>,
    pid: AtomicU32,
    bytes: AtomicU64,
    status: watch::Sender<SessionStatus>,
    pub(crate) cancel: CancellationToken,
}

impl SessionEntry {
    pub(crate) fn new(
        source: &str,
        profile: &FormatProfile,
        target: Option<&PublishTarget>,
    ) -> Arc<Self> {
        let (status, _) = watch::channel(SessionStatus {
            state: SessionState::Pending,
            ended_at: None,
            exit_code: None,
            error: None,
        });

        Arc::new(Self {
            id: SessionId::new(),
            source: source.to_string(),
            profile: profile.name.clone(),
            content_type: profile.content_type.clone(),
            output_dir: target.map(|t| t.dir().to_path_buf()),
            playlist_url: target.map(|t| t.published_url().to_string()),
            started_at: Utc::now(),
            pid: AtomicU32::new(0),
            bytes: AtomicU64::new(0),
            status,
            cancel: CancellationToken::new(),
        })
    }

    pub(crate) fn state(&self) -> SessionState {
        self.status.borrow().state
    }

    /// Move to a later non-terminal state. Returns false when the session is
    /// already at or past `next`.
    pub(crate) fn advance(&self, next: SessionState) -> bool {
        debug_assert!(!next.is_terminal());
        self.status.send_if_modified(|status| {
            if status.state.is_terminal() || next.rank() <= status.state.rank() {
                return false;
            }
            tracing::debug!(session = %self.id, from = %status.state, to = %next, "Session state");
            status.state = next;
            true
        })
    }

    /// Record the terminal state. Only the first call has any effect.
    pub(crate) fn finish(&self, outcome: Outcome) -> bool {
        self.status.send_if_modified(|status| {
            if status.state.is_terminal() {
                return false;
            }
            match outcome {
                Outcome::Closed { exit_code } => {
                    status.state = SessionState::Closed;
                    status.exit_code = exit_code;
                }
                Outcome::Failed { exit_code, ref error } => {
                    status.state = SessionState::Failed;
                    status.exit_code = exit_code;
                    status.error = Some(error.clone());
                }
            }
            status.ended_at = Some(Utc::now());
            true
        })
    }

    pub(crate) fn add_bytes(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::Relaxed);
    }

    fn set_pid(&self, pid: Option<u32>) {
        self.pid.store(pid.unwrap_or(0), Ordering::Relaxed);
    }

    fn handle(&self, reused: bool) -> SessionHandle {
        SessionHandle {
            id: self.id,
            profile: self.profile.clone(),
            content_type: self.content_type.clone(),
            playlist_url: self.playlist_url.clone(),
            reused,
            status: self.status.subscribe(),
        }
    }

    fn info(&self) -> SessionInfo {
        let status = self.status.borrow().clone();
        let pid = self.pid.load(Ordering::Relaxed);
        SessionInfo {
            id: self.id,
            source: redact_source(&self.source).into_owned(),
            profile: self.profile.clone(),
            state: status.state,
            started_at: self.started_at,
            ended_at: status.ended_at,
            bytes_delivered: self.bytes.load(Ordering::Relaxed),
            pid: (pid != 0).then_some(pid),
            exit_code: status.exit_code,
            error: status.error,
            output_dir: self.output_dir.clone(),
            playlist_url: self.playlist_url.clone(),
        }
    }
}

/// Caller-side view of a started session.
#[derive(Debug)]
pub struct SessionHandle {
    id: SessionId,
    profile: String,
    content_type: Option<String>,
    playlist_url: Option<String>,
    reused: bool,
    status: watch::Receiver<SessionStatus>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn playlist_url(&self) -> Option<&str> {
        self.playlist_url.as_deref()
    }

    /// True when an already running session was handed back.
    pub fn reused(&self) -> bool {
        self.reused
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// Wait for the session to reach a terminal state.
    pub async fn wait(&mut self) -> SessionStatus {
        loop {
            {
                let status = self.status.borrow_and_update();
                if status.state.is_terminal() {
                    return status.clone();
                }
            }
            if self.status.changed().await.is_err() {
                return self.status.borrow().clone();
            }
        }
    }
}

/// Snapshot returned by queries.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: SessionId,
    pub source: String,
    pub profile: String,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub bytes_delivered: u64,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub playlist_url: Option<String>,
}

/// Knobs the manager needs from the configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub ffmpeg: PathBuf,
    pub grace_period: Duration,
    pub chunk_size: usize,
    pub retention: Duration,
}

impl SessionConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            ffmpeg: streamrelay_av::resolve_tool_path(&config.tools.ffmpeg),
            grace_period: config.relay.grace_period(),
            chunk_size: config.relay.chunk_size,
            retention: Duration::from_secs(config.relay.session_retention_secs),
        }
    }
}

struct Inner {
    config: SessionConfig,
    profiles: Arc<ProfileRegistry>,
    sessions: DashMap<SessionId, Arc<SessionEntry>>,
    // Lock order: never touch `segment_owners` while holding a `sessions` guard.
    segment_owners: DashMap<PathBuf, SessionId>,
}

impl Inner {
    fn lookup(&self, id: &SessionId) -> Option<Arc<SessionEntry>> {
        self.sessions.get(id).map(|e| Arc::clone(e.value()))
    }

    fn complete(&self, entry: &SessionEntry, outcome: Outcome) {
        if entry.finish(outcome.clone()) {
            match &outcome {
                Outcome::Closed { exit_code } => tracing::info!(
                    session = %entry.id,
                    profile = %entry.profile,
                    code = ?exit_code,
                    bytes = entry.bytes.load(Ordering::Relaxed),
                    "Session closed"
                ),
                Outcome::Failed { exit_code, error } => tracing::warn!(
                    session = %entry.id,
                    profile = %entry.profile,
                    code = ?exit_code,
                    %error,
                    "Session failed"
                ),
            }
        }

        if let Some(dir) = &entry.output_dir {
            self.segment_owners.remove_if(dir, |_, owner| *owner == entry.id);
        }
    }
}

/// Thread-safe registry and launcher of transcoding sessions.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(config: SessionConfig, profiles: Arc<ProfileRegistry>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                profiles,
                sessions: DashMap::new(),
                segment_owners: DashMap::new(),
            }),
        }
    }

    pub fn profiles(&self) -> &ProfileRegistry {
        &self.inner.profiles
    }

    /// Start relaying `source` in the `profile` format into `sink`.
    pub fn start(
        &self,
        source: &str,
        profile: &str,
        sink: Box<dyn ByteSink>,
    ) -> Result<SessionHandle, RelayError> {
        self.start_stream(source, profile, None, sink)
    }

    /// Like [`start`](Self::start) with an explicit rate-control override.
    pub fn start_stream(
        &self,
        source: &str,
        profile: &str,
        rate_control: Option<RateControl>,
        sink: Box<dyn ByteSink>,
    ) -> Result<SessionHandle, RelayError> {
        let source = require_source(source, "Stream URL is required")?;
        let profile = self.resolve(profile)?;
        if !profile.streams_to_sink() {
            return Err(RelayError::invalid(format!(
                "Format '{}' is published with POST /stream/hls",
                profile.name
            )));
        }
        let args = profile
            .invocation(source, &OutputTarget::Pipe, rate_control)
            .map_err(|e| RelayError::invalid(e.to_string()))?;

        let entry = SessionEntry::new(source, profile, None);
        self.inner.sessions.insert(entry.id, Arc::clone(&entry));
        tracing::info!(
            session = %entry.id,
            source = %redact_source(source),
            profile = %profile.name,
            "Starting stream session"
        );

        let process = match self.launch(&entry, &args, StdoutMode::Piped) {
            Ok(p) => p,
            Err(e) => {
                sink.close();
                return Err(e);
            }
        };

        let handle = entry.handle(false);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let outcome = relay::relay_to_sink(
                &entry,
                process,
                sink,
                inner.config.chunk_size,
                inner.config.grace_period,
            )
            .await;
            inner.complete(&entry, outcome);
        });

        Ok(handle)
    }

    /// Start writing HLS segments for `source` into `target`.
    ///
    /// A directory has at most one live session. Asking again for the same
    /// source hands back the running session; a different source is a
    /// conflict until the current one ends. A new process numbers its
    /// segments from `start_number` so they sort after any left behind by an
    /// earlier run.
    pub fn start_segmented(
        &self,
        source: &str,
        target: &PublishTarget,
        start_number: u64,
        rate_control: Option<RateControl>,
    ) -> Result<SessionHandle, RelayError> {
        let source = require_source(source, "Source URI is required")?;
        let profile = self.resolve(SEGMENTED)?;
        let policy = target.policy();
        let args = profile
            .invocation(
                source,
                &OutputTarget::Segments {
                    dir: target.dir(),
                    segment_duration_secs: policy.segment_duration_secs,
                    max_segments: policy.max_segments,
                    start_number,
                },
                rate_control,
            )
            .map_err(|e| RelayError::invalid(e.to_string()))?;

        let entry = SessionEntry::new(source, profile, Some(target));

        match self.inner.segment_owners.entry(target.dir().to_path_buf()) {
            Entry::Occupied(mut owner) => {
                let live = self
                    .inner
                    .lookup(owner.get())
                    .filter(|e| !e.state().is_terminal());
                if let Some(existing) = live {
                    if existing.source == source {
                        tracing::info!(session = %existing.id, "Reusing segment session");
                        return Ok(existing.handle(true));
                    }
                    return Err(RelayError::Conflict(format!(
                        "{} is already publishing another source",
                        target.relative().display()
                    )));
                }
                owner.insert(entry.id);
                self.inner.sessions.insert(entry.id, Arc::clone(&entry));
            }
            Entry::Vacant(slot) => {
                slot.insert(entry.id);
                self.inner.sessions.insert(entry.id, Arc::clone(&entry));
            }
        }

        tracing::info!(
            session = %entry.id,
            source = %redact_source(source),
            dir = %target.dir().display(),
            "Starting segment session"
        );

        let process = self.launch(&entry, &args, StdoutMode::Discard)?;

        let handle = entry.handle(false);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let outcome = relay::supervise(&entry, process, inner.config.grace_period).await;
            inner.complete(&entry, outcome);
        });

        Ok(handle)
    }

    fn resolve(&self, name: &str) -> Result<&FormatProfile, RelayError> {
        self.inner
            .profiles
            .resolve(name)
            .map_err(|_| RelayError::UnknownProfile(name.to_string()))
    }

    fn launch(
        &self,
        entry: &Arc<SessionEntry>,
        args: &[String],
        stdout: StdoutMode,
    ) -> Result<TranscoderProcess, RelayError> {
        entry.advance(SessionState::Spawning);

        match TranscoderProcess::launch(&self.inner.config.ffmpeg, args, stdout) {
            Ok(process) => {
                entry.set_pid(process.id());
                entry.advance(SessionState::Streaming);
                Ok(process)
            }
            Err(e) => {
                self.inner.complete(
                    entry,
                    Outcome::Failed {
                        exit_code: None,
                        error: e.to_string(),
                    },
                );
                Err(RelayError::LaunchFailure(e))
            }
        }
    }

    /// Request a session to stop. Stopping a finished session is a no-op.
    pub fn cancel(&self, id: &SessionId) -> Result<SessionState, RelayError> {
        let entry = self
            .inner
            .lookup(id)
            .ok_or_else(|| RelayError::SessionNotFound(id.to_string()))?;

        if !entry.state().is_terminal() {
            entry.advance(SessionState::Draining);
            entry.cancel.cancel();
            tracing::info!(session = %id, "Session cancel requested");
        }

        Ok(entry.state())
    }

    pub fn get(&self, id: &SessionId) -> Option<SessionInfo> {
        self.inner.lookup(id).map(|e| e.info())
    }

    /// Subscribe to an existing session's status.
    pub fn handle(&self, id: &SessionId) -> Option<SessionHandle> {
        self.inner.lookup(id).map(|e| e.handle(true))
    }

    /// All known sessions, oldest first.
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> =
            self.inner.sessions.iter().map(|e| e.value().info()).collect();
        sessions.sort_by_key(|s| s.started_at);
        sessions
    }

    /// Live session currently publishing into `dir`.
    pub fn segment_owner(&self, dir: &Path) -> Option<SessionId> {
        let id = self.inner.segment_owners.get(dir).map(|r| *r.value())?;
        self.inner
            .lookup(&id)
            .filter(|e| !e.state().is_terminal())
            .map(|e| e.id)
    }

    /// Number of sessions that have not reached a terminal state.
    pub fn active_count(&self) -> usize {
        self.inner
            .sessions
            .iter()
            .filter(|e| !e.value().state().is_terminal())
            .count()
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.sessions.is_empty()
    }

    /// Drop finished sessions older than the retention period.
    pub fn cleanup_expired_sessions(&self) -> usize {
        let now = Utc::now();
        let retention = chrono::Duration::from_std(self.inner.config.retention)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));

        let mut removed = 0;
        self.inner.sessions.retain(|id, entry| {
            let ended_at = entry.status.borrow().ended_at;
            match ended_at {
                Some(ended) if now - ended >= retention => {
                    tracing::debug!(session = %id, "Expired session removed");
                    removed += 1;
                    false
                }
                _ => true,
            }
        });

        removed
    }

    /// Cancel every live session and wait for them to finish.
    pub async fn shutdown(&self) {
        let mut handles = Vec::new();
        for entry in self.inner.sessions.iter() {
            let entry = entry.value();
            if !entry.state().is_terminal() {
                entry.advance(SessionState::Draining);
                entry.cancel.cancel();
                handles.push(entry.handle(false));
            }
        }

        if handles.is_empty() {
            return;
        }
        tracing::info!(sessions = handles.len(), "Stopping live sessions");

        let deadline = self.inner.config.grace_period + Duration::from_secs(1);
        let all = futures::future::join_all(handles.iter_mut().map(|h| h.wait()));
        if tokio::time::timeout(deadline, all).await.is_err() {
            tracing::warn!("Timed out waiting for sessions to stop");
        }
    }
}

/// Start a background task that periodically purges expired sessions.
pub fn start_cleanup_task(
    manager: SessionManager,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            manager.cleanup_expired_sessions();
        }
    })
}

fn require_source<'a>(source: &'a str, message: &str) -> Result<&'a str, RelayError> {
    let source = source.trim();
    if source.is_empty() {
        return Err(RelayError::invalid(message));
    }
    Ok(source)
}

/// Hide credentials embedded in a source URI.
pub fn redact_source(source: &str) -> Cow<'_, str> {
    if let Some((scheme, rest)) = source.split_once("://") {
        let authority_end = rest.find('/').unwrap_or(rest.len());
        if let Some(at) = rest[..authority_end].rfind('@') {
            return Cow::Owned(format!("{}://***@{}", scheme, &rest[at + 1..]));
        }
    }
    Cow::Borrowed(source)
}
