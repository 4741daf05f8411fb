//! HLS segment publishing.
//!
//! The transcoder writes segments and a rolling index into a publish
//! directory under the HLS root. [`HlsPublisher`] owns those directories:
//! it resolves requested output paths, builds public playlist URLs and keeps
//! each directory's retention window in check by sweeping after every change
//! the filesystem watcher reports (with an interval as fallback).

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::RwLock;
use serde::Serialize;
use streamrelay_av::profile::PLAYLIST_FILE;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use super::playlist::{segment_number, MediaPlaylist};
use crate::config::HlsConfig;
use crate::error::RelayError;

const SWEEP_TMP_SUFFIX: &str = ".sweep";

/// Retention settings for one publish directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetentionPolicy {
    pub segment_duration_secs: u32,
    pub max_segments: usize,
}

/// One publish directory.
#[derive(Debug)]
pub struct PublishTarget {
    dir: PathBuf,
    relative: PathBuf,
    published_url: String,
    policy: RwLock<RetentionPolicy>,
    sweep_lock: Mutex<()>,
}

impl PublishTarget {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the directory relative to the HLS root.
    pub fn relative(&self) -> &Path {
        &self.relative
    }

    pub fn playlist_path(&self) -> PathBuf {
        self.dir.join(PLAYLIST_FILE)
    }

    pub fn published_url(&self) -> &str {
        &self.published_url
    }

    pub fn policy(&self) -> RetentionPolicy {
        *self.policy.read()
    }

    /// First segment number a new transcoder should use so its output sorts
    /// after everything already on disk or listed in the index.
    pub async fn next_segment_number(&self) -> std::io::Result<u64> {
        let on_disk = list_segments(&self.dir).await?;
        let mut highest = on_disk.iter().map(|s| s.number).max();

        match tokio::fs::read_to_string(self.playlist_path()).await {
            Ok(text) => {
                if let Ok(playlist) = MediaPlaylist::parse(&text) {
                    let listed = playlist
                        .segment_file_names()
                        .filter_map(segment_number)
                        .max();
                    highest = highest.max(listed);
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        Ok(highest.map_or(0, |n| n + 1))
    }

    fn set_policy(&self, policy: RetentionPolicy) {
        let mut current = self.policy.write();
        if *current != policy {
            tracing::debug!(dir = %self.dir.display(), ?policy, "Updated retention policy");
            *current = policy;
        }
    }
}

/// Outcome of a single retention sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Segments the index references after the sweep.
    pub retained: usize,
    /// Segment files removed from disk.
    pub deleted: Vec<PathBuf>,
    /// Deletions that failed; retried on the next sweep.
    pub failed: usize,
    pub index_rewritten: bool,
}

struct TargetEntry {
    target: Arc<PublishTarget>,
    task: JoinHandle<()>,
}

/// Owner of every publish directory under the HLS root.
pub struct HlsPublisher {
    root: PathBuf,
    mount_path: String,
    defaults: RetentionPolicy,
    sweep_interval: Duration,
    targets: DashMap<PathBuf, TargetEntry>,
}

impl HlsPublisher {
    pub fn new(config: &HlsConfig) -> Self {
        Self {
            root: absolute(&config.root),
            mount_path: normalize_mount(&config.mount_path),
            defaults: RetentionPolicy {
                segment_duration_secs: config.segment_duration_secs,
                max_segments: config.max_segments,
            },
            sweep_interval: config.sweep_interval(),
            targets: DashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn mount_path(&self) -> &str {
        &self.mount_path
    }

    pub fn defaults(&self) -> RetentionPolicy {
        self.defaults
    }

    /// Resolve a requested output path to an absolute directory plus its
    /// path relative to the root.
    ///
    /// Relative paths are joined onto the root. Absolute paths must already
    /// lie inside it. Parent-directory components are rejected outright.
    pub fn resolve_output_dir(
        &self,
        output_path: Option<&str>,
    ) -> Result<(PathBuf, PathBuf), RelayError> {
        let requested = match output_path.map(str::trim) {
            None | Some("") => return Ok((self.root.clone(), PathBuf::new())),
            Some(p) => Path::new(p),
        };

        if requested
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(RelayError::invalid("outputPath must not contain '..'"));
        }

        let relative = if requested.is_absolute() {
            strip_cur_dir(requested)
                .strip_prefix(&self.root)
                .map(Path::to_path_buf)
                .map_err(|_| RelayError::invalid("outputPath must be inside the HLS root"))?
        } else {
            strip_cur_dir(requested)
        };

        Ok((self.root.join(&relative), relative))
    }

    /// Public URL of the index inside `relative`.
    pub fn published_url(&self, relative: &Path) -> String {
        let mut url = self.mount_path.clone();
        for part in relative.components() {
            if let Component::Normal(s) = part {
                url.push('/');
                url.push_str(&s.to_string_lossy());
            }
        }
        url.push('/');
        url.push_str(PLAYLIST_FILE);
        url
    }

    /// Get or create the publish target for `dir`, creating the directory
    /// and starting its retention task on first use.
    pub async fn ensure_target(
        &self,
        dir: &Path,
        relative: &Path,
        policy: RetentionPolicy,
    ) -> Result<Arc<PublishTarget>, RelayError> {
        if let Some(existing) = self.targets.get(dir) {
            existing.target.set_policy(policy);
            return Ok(Arc::clone(&existing.target));
        }

        tokio::fs::create_dir_all(dir).await.map_err(|e| {
            RelayError::Internal(format!("cannot create {}: {}", dir.display(), e))
        })?;

        let target = Arc::new(PublishTarget {
            dir: dir.to_path_buf(),
            relative: relative.to_path_buf(),
            published_url: self.published_url(relative),
            policy: RwLock::new(policy),
            sweep_lock: Mutex::new(()),
        });

        let entry = match self.targets.entry(dir.to_path_buf()) {
            dashmap::mapref::entry::Entry::Occupied(e) => {
                e.get().target.set_policy(policy);
                return Ok(Arc::clone(&e.get().target));
            }
            dashmap::mapref::entry::Entry::Vacant(v) => v.insert(TargetEntry {
                task: spawn_retention(Arc::clone(&target), self.sweep_interval),
                target,
            }),
        };

        tracing::info!(
            dir = %dir.display(),
            url = %entry.target.published_url,
            max_segments = policy.max_segments,
            "Publishing HLS directory"
        );

        Ok(Arc::clone(&entry.target))
    }

    pub fn target(&self, dir: &Path) -> Option<Arc<PublishTarget>> {
        self.targets.get(dir).map(|e| Arc::clone(&e.target))
    }

    pub fn targets(&self) -> Vec<Arc<PublishTarget>> {
        self.targets.iter().map(|e| Arc::clone(&e.target)).collect()
    }

    /// Stop all retention tasks. Files on disk are left as they are.
    pub fn shutdown(&self) {
        for entry in self.targets.iter() {
            entry.task.abort();
        }
        self.targets.clear();
    }
}

impl Drop for HlsPublisher {
    fn drop(&mut self) {
        for entry in self.targets.iter() {
            entry.task.abort();
        }
    }
}

/// Run one retention sweep over `target`.
///
/// Trims the index to the newest `max_segments` entries, then deletes the
/// segment files it no longer references. A file written after the index
/// is left alone: it is either the next segment waiting to be listed or the
/// first output of a restarted transcoder. In-progress temporaries are never
/// touched.
pub async fn sweep(target: &PublishTarget) -> std::io::Result<SweepReport> {
    let _guard = target.sweep_lock.lock().await;
    let max_segments = target.policy().max_segments;
    let mut report = SweepReport::default();

    let index_path = target.playlist_path();
    // Taken before the read: a replacement landing in between only makes
    // the check more conservative.
    let index_modified = modified(&index_path).await;
    let index = match tokio::fs::read_to_string(&index_path).await {
        Ok(text) => match MediaPlaylist::parse(&text) {
            Ok(playlist) => Some(playlist),
            Err(e) => {
                // Caught mid-write; the next event will bring a complete one.
                tracing::debug!(path = %index_path.display(), error = %e, "Skipping sweep");
                return Ok(report);
            }
        },
        Err(e) if e.kind() == ErrorKind::NotFound => None,
        Err(e) => return Err(e),
    };

    let mut on_disk = list_segments(target.dir()).await?;
    on_disk.sort_by_key(|s| s.number);

    let stale: Vec<PathBuf> = match index {
        Some(mut playlist) => {
            if playlist.retain_latest(max_segments) > 0 {
                write_atomically(&index_path, playlist.render().as_bytes(), index_modified)
                    .await?;
                report.index_rewritten = true;
            }
            report.retained = playlist.segments.len();

            let referenced: HashSet<&str> = playlist.segment_file_names().collect();
            let cutoff = referenced.iter().filter_map(|n| segment_number(n)).min();

            let stale = on_disk
                .into_iter()
                .filter(|s| !referenced.contains(s.file_name().as_str()))
                .filter(|s| match (index_modified, s.modified) {
                    (Some(listed_at), Some(written_at)) => written_at <= listed_at,
                    // Without timestamps only what precedes the window is known to be old.
                    _ => cutoff.is_some_and(|c| s.number < c),
                })
                .map(|s| s.path)
                .collect();
            stale
        }
        None => {
            // No index yet (or it was removed): keep the newest window.
            let keep_from = on_disk.len().saturating_sub(max_segments);
            report.retained = on_disk.len() - keep_from;
            on_disk.truncate(keep_from);
            on_disk.into_iter().map(|s| s.path).collect()
        }
    };

    for path in stale {
        match tokio::fs::remove_file(&path).await {
            Ok(()) => report.deleted.push(path),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to delete segment");
                report.failed += 1;
            }
        }
    }

    if !report.deleted.is_empty() || report.index_rewritten {
        tracing::debug!(
            dir = %target.dir().display(),
            deleted = report.deleted.len(),
            retained = report.retained,
            rewritten = report.index_rewritten,
            "Retention sweep"
        );
    }

    Ok(report)
}

/// A finished segment file found in a publish directory.
struct SegmentFile {
    number: u64,
    path: PathBuf,
    modified: Option<SystemTime>,
}

impl SegmentFile {
    fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Finished segment files in `dir`.
async fn list_segments(dir: &Path) -> std::io::Result<Vec<SegmentFile>> {
    let mut out = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e),
    };

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(number) = segment_number(&name.to_string_lossy()) else {
            continue;
        };
        let Ok(metadata) = entry.metadata().await else {
            // Renamed or removed since the listing.
            continue;
        };
        if metadata.is_file() {
            out.push(SegmentFile {
                number,
                path: entry.path(),
                modified: metadata.modified().ok(),
            });
        }
    }

    Ok(out)
}

async fn modified(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path).await.ok()?.modified().ok()
}

/// Replace `path` through a temporary file and rename. `modified` is carried
/// over so a rewrite never makes unlisted segments look older than the index.
async fn write_atomically(
    path: &Path,
    contents: &[u8],
    modified: Option<SystemTime>,
) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(SWEEP_TMP_SUFFIX);
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, contents).await?;
    if let Some(modified) = modified {
        let tmp = tmp.clone();
        tokio::task::spawn_blocking(move || {
            std::fs::File::options()
                .write(true)
                .open(&tmp)?
                .set_modified(modified)
        })
        .await
        .map_err(std::io::Error::other)??;
    }
    tokio::fs::rename(&tmp, path).await
}

fn spawn_retention(target: Arc<PublishTarget>, interval: Duration) -> JoinHandle<()> {
    let (event_tx, mut event_rx) = mpsc::channel::<()>(1);

    let watcher = RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                if event.kind.is_create() || event.kind.is_modify() || event.kind.is_remove() {
                    // A full channel already has a sweep queued.
                    let _ = event_tx.try_send(());
                }
            }
        },
        Config::default(),
    )
    .and_then(|mut w| w.watch(target.dir(), RecursiveMode::NonRecursive).map(|_| w));

    let watcher = match watcher {
        Ok(w) => Some(w),
        Err(e) => {
            tracing::warn!(
                dir = %target.dir().display(),
                error = %e,
                "File watcher unavailable, sweeping on interval only"
            );
            None
        }
    };

    tokio::spawn(async move {
        let _watcher = watcher;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                Some(()) = event_rx.recv() => {}
                _ = ticker.tick() => {}
            }

            if let Err(e) = sweep(&target).await {
                tracing::warn!(dir = %target.dir().display(), error = %e, "Retention sweep failed");
            }
        }
    })
}

fn absolute(path: &Path) -> PathBuf {
    let path = strip_cur_dir(path);
    if path.is_absolute() {
        return path;
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path,
    }
}

fn strip_cur_dir(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

fn normalize_mount(mount: &str) -> String {
    let trimmed = mount.trim().trim_end_matches('/');
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}
