//! Shared test harness for integration tests.
//!
//! Provides [`TestHarness`] which builds a full [`AppContext`] rooted in a
//! temporary directory. External tools are replaced by small shell scripts
//! written into that directory, and [`TestHarness::serve`] starts Axum on a
//! random port for HTTP-level testing.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use streamrelay::config::Config;
use streamrelay::server::{self, AppContext};
use tempfile::TempDir;
use tokio::sync::oneshot;

/// Test harness wrapping a fully-constructed [`AppContext`].
pub struct TestHarness {
    pub ctx: AppContext,
    pub dir: TempDir,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestHarness {
    /// Harness whose tools do not exist.
    pub fn new() -> Self {
        Self::with_tools(None, None)
    }

    /// Harness with fake `ffmpeg`/`ffprobe` scripts. Each body is the shell
    /// script run in place of the real binary.
    pub fn with_tools(ffmpeg: Option<&str>, ffprobe: Option<&str>) -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let bin = dir.path().join("bin");
        std::fs::create_dir_all(&bin).expect("failed to create bin dir");

        let mut config = Config::default();
        config.tools.ffmpeg = bin.join("ffmpeg");
        config.tools.ffprobe = bin.join("ffprobe");
        config.hls.root = dir.path().join("hls");
        config.hls.sweep_interval_ms = 100;
        config.relay.grace_period_ms = 500;
        config.relay.probe_timeout_secs = 5;

        if let Some(body) = ffmpeg {
            write_script(&config.tools.ffmpeg, body);
        }
        if let Some(body) = ffprobe {
            write_script(&config.tools.ffprobe, body);
        }

        Self {
            ctx: AppContext::new(config),
            dir,
            shutdown: None,
        }
    }

    /// Start an Axum server on a random port and return the harness together
    /// with the bound socket address.
    pub async fn serve(mut self) -> (Self, SocketAddr) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind random port");
        let addr = listener.local_addr().expect("failed to get local addr");

        let (tx, rx) = oneshot::channel();
        self.shutdown = Some(tx);

        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            server::serve(listener, ctx, async {
                let _ = rx.await;
            })
            .await
            .ok();
        });

        (self, addr)
    }

    /// Shorthand for `with_tools(..).serve()`.
    pub async fn with_server(ffmpeg: Option<&str>, ffprobe: Option<&str>) -> (Self, SocketAddr) {
        Self::with_tools(ffmpeg, ffprobe).serve().await
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn hls_root(&self) -> &Path {
        self.ctx.publisher.root()
    }
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

pub fn write_script(path: &Path, body: &str) {
    std::fs::write(path, format!("#!/bin/sh\n{}\n", body)).expect("failed to write script");
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .expect("failed to chmod script");
}

/// Poll `GET /sessions/:id` until the session reports `state`.
pub async fn wait_for_state(addr: SocketAddr, id: &str, state: &str) -> serde_json::Value {
    let url = format!("http://{addr}/sessions/{id}");
    let mut last = serde_json::Value::Null;

    for _ in 0..100 {
        let resp = reqwest::get(&url).await.expect("request failed");
        if resp.status() == 200 {
            last = resp.json().await.unwrap();
            if last["state"] == state {
                return last;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    panic!("session {id} never reached {state}, last seen: {last}");
}
