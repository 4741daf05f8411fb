//! Byte relay between a transcoder and a client sink.
//!
//! One task per session drives the process: it reads stdout in bounded
//! chunks, forwards each chunk to the sink and reacts to whichever happens
//! first of end of output, cancellation or the client going away. That task
//! is the only place a session reaches its terminal state.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use streamrelay_av::TranscoderProcess;
use tokio::io::AsyncReadExt;
use tokio::process::ChildStdout;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::sessions::{Outcome, SessionEntry, SessionState};

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("client disconnected")]
    Disconnected,
    #[error("sink write failed: {0}")]
    Io(#[from] io::Error),
}

/// Destination for a streamed session's bytes.
///
/// `write` may wait; that wait is what pushes back on the transcoder.
#[async_trait]
pub trait ByteSink: Send + Sync + 'static {
    async fn write(&self, chunk: Bytes) -> Result<(), SinkError>;

    /// Resolves once the consumer is gone.
    async fn closed(&self);

    /// Signal end of stream. Called exactly once, after the process exited.
    fn close(self: Box<Self>) {}
}

/// Response body fed by a [`ChannelSink`].
pub type BodyStream = ReceiverStream<Result<Bytes, io::Error>>;

/// Sink backed by a bounded channel whose receiver is the response body.
pub struct ChannelSink {
    tx: mpsc::Sender<Result<Bytes, io::Error>>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, BodyStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, ReceiverStream::new(rx))
    }
}

#[async_trait]
impl ByteSink for ChannelSink {
    async fn write(&self, chunk: Bytes) -> Result<(), SinkError> {
        self.tx
            .send(Ok(chunk))
            .await
            .map_err(|_| SinkError::Disconnected)
    }

    async fn closed(&self) {
        self.tx.closed().await
    }
}

enum Stop {
    Eof,
    Cancelled,
    Disconnected,
    Failed(String),
}

/// Relay a streamed session until it ends and report how it ended.
pub(crate) async fn relay_to_sink(
    entry: &SessionEntry,
    mut process: TranscoderProcess,
    sink: Box<dyn ByteSink>,
    chunk_size: usize,
    grace: Duration,
) -> Outcome {
    let outcome = match process.take_stdout() {
        Some(mut stdout) => {
            let stop = pump(entry, &mut stdout, sink.as_ref(), chunk_size).await;
            // Unblocks a transcoder stuck writing to a pipe nobody reads.
            drop(stdout);

            match stop {
                Stop::Eof => {
                    entry.advance(SessionState::Draining);
                    await_exit(entry, &mut process, grace).await
                }
                Stop::Cancelled => stop_process(entry, &mut process, grace).await,
                Stop::Disconnected => {
                    tracing::info!(session = %entry.id, "Client disconnected");
                    stop_process(entry, &mut process, grace).await
                }
                Stop::Failed(error) => {
                    tracing::warn!(session = %entry.id, %error, "Relay failed");
                    let stopped = stop_process(entry, &mut process, grace).await;
                    Outcome::Failed {
                        exit_code: stopped.exit_code(),
                        error,
                    }
                }
            }
        }
        None => {
            let _ = process.terminate(grace).await;
            Outcome::Failed {
                exit_code: None,
                error: "transcoder stdout unavailable".to_string(),
            }
        }
    };

    sink.close();
    outcome
}

/// Supervise a process that writes its own output until it exits or the
/// session is cancelled.
pub(crate) async fn supervise(
    entry: &SessionEntry,
    mut process: TranscoderProcess,
    grace: Duration,
) -> Outcome {
    await_exit(entry, &mut process, grace).await
}

async fn pump(
    entry: &SessionEntry,
    stdout: &mut ChildStdout,
    sink: &dyn ByteSink,
    chunk_size: usize,
) -> Stop {
    let mut buf = vec![0u8; chunk_size.max(1)];

    loop {
        let read = tokio::select! {
            biased;
            _ = entry.cancel.cancelled() => return Stop::Cancelled,
            _ = sink.closed() => return Stop::Disconnected,
            r = stdout.read(&mut buf) => r,
        };

        let n = match read {
            Ok(0) => return Stop::Eof,
            Ok(n) => n,
            Err(e) => return Stop::Failed(format!("read from transcoder failed: {}", e)),
        };

        let written = tokio::select! {
            biased;
            _ = entry.cancel.cancelled() => return Stop::Cancelled,
            r = sink.write(Bytes::copy_from_slice(&buf[..n])) => r,
        };

        match written {
            Ok(()) => entry.add_bytes(n as u64),
            Err(SinkError::Disconnected) => return Stop::Disconnected,
            Err(e) => return Stop::Failed(e.to_string()),
        }
    }
}

async fn await_exit(
    entry: &SessionEntry,
    process: &mut TranscoderProcess,
    grace: Duration,
) -> Outcome {
    let exited = tokio::select! {
        biased;
        _ = entry.cancel.cancelled() => None,
        status = process.wait() => Some(status),
    };

    match exited {
        None => stop_process(entry, process, grace).await,
        Some(Ok(status)) if status.success() => Outcome::Closed {
            exit_code: status.code(),
        },
        Some(Ok(status)) => Outcome::Failed {
            exit_code: status.code(),
            error: match status.code() {
                Some(code) => format!("transcoder exited with code {}", code),
                None => "transcoder terminated by signal".to_string(),
            },
        },
        Some(Err(e)) => Outcome::Failed {
            exit_code: None,
            error: format!("waiting for transcoder failed: {}", e),
        },
    }
}

/// Requested stop: the session closes normally whatever the exit code.
async fn stop_process(
    entry: &SessionEntry,
    process: &mut TranscoderProcess,
    grace: Duration,
) -> Outcome {
    entry.advance(SessionState::Draining);

    match process.terminate(grace).await {
        Ok(termination) => {
            tracing::debug!(session = %entry.id, ?termination, "Transcoder stopped");
            Outcome::Closed {
                exit_code: termination.status().code(),
            }
        }
        Err(e) => Outcome::Failed {
            exit_code: None,
            error: format!("failed to stop transcoder: {}", e),
        },
    }
}
