//! Encoder session launch.
//!
//! Writes the playlist file, spawns the encoder with both pipes drained, and
//! waits out the startup grace window before handing back a supervisor.

use crate::concat::{write_playlist_file, ConcatError};
use crate::drain::{spawn_drain, DrainContext, OutputTail};
use crate::encode::{build_stream_command, describe_command};
use crate::playlist::Playlist;
use crate::supervisor::ProcessSupervisor;
use async_trait::async_trait;
use lofi_streamer_config::StreamConfig;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Error type for session launch.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// The playlist file could not be written; nothing was spawned.
    #[error("Failed to write playlist file: {0}")]
    PlaylistWrite(#[from] ConcatError),

    /// The encoder binary could not be started.
    #[error("Failed to spawn encoder: {0}")]
    Spawn(#[source] std::io::Error),

    /// The encoder exited inside the startup grace window.
    #[error("Encoder exited during startup (exit code {code:?})")]
    DiedImmediately {
        code: Option<i32>,
        recent_output: Vec<String>,
    },
}

/// Starts one encoder session per playlist.
///
/// When `cancel` fires during the grace window the session is handed back
/// as-is, without the liveness check; the caller owns its teardown.
#[async_trait]
pub trait SessionLauncher: Send + Sync {
    async fn launch(
        &self,
        playlist: &Playlist,
        cancel: &CancellationToken,
    ) -> Result<ProcessSupervisor, LaunchError>;
}

/// Launcher for the real ffmpeg encoder.
#[derive(Debug, Clone)]
pub struct EncoderLauncher {
    config: Arc<StreamConfig>,
    grace: Duration,
    stop_timeout: Duration,
}

impl EncoderLauncher {
    pub fn new(config: Arc<StreamConfig>) -> Self {
        let grace = config.startup_grace();
        let stop_timeout = config.stop_timeout();
        Self {
            config,
            grace,
            stop_timeout,
        }
    }

    /// Override the grace window and stop timeout taken from the config.
    pub fn with_timings(mut self, grace: Duration, stop_timeout: Duration) -> Self {
        self.grace = grace;
        self.stop_timeout = stop_timeout;
        self
    }

    pub fn playlist_path(&self) -> PathBuf {
        self.config.media.playlist_path.clone()
    }

    /// Launch `command` against a freshly written playlist file.
    ///
    /// The file is complete on disk before the process starts. If the process
    /// is gone when the grace window ends, the session is torn down (which
    /// removes the file) and `DiedImmediately` is returned. A cancellation
    /// inside the window returns the session immediately.
    pub async fn launch_command(
        &self,
        playlist: &Playlist,
        command: std::process::Command,
        cancel: &CancellationToken,
    ) -> Result<ProcessSupervisor, LaunchError> {
        let playlist_path = self.playlist_path();
        write_playlist_file(playlist, &playlist_path)?;

        let session_id = uuid::Uuid::new_v4().to_string();
        let tail = OutputTail::default();

        let mut cmd = Command::from(command);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                crate::concat::remove_playlist_file(&playlist_path);
                return Err(LaunchError::Spawn(e));
            }
        };

        let mut drains = Vec::with_capacity(2);
        let ctx = |stream: &'static str| DrainContext {
            stream,
            session_id: session_id.clone(),
            tail: tail.clone(),
        };
        if let Some(stdout) = child.stdout.take() {
            drains.push(spawn_drain(stdout, ctx("stdout")));
        }
        if let Some(stderr) = child.stderr.take() {
            drains.push(spawn_drain(stderr, ctx("stderr")));
        }

        let mut supervisor =
            ProcessSupervisor::new(session_id, playlist_path, tail, self.stop_timeout);
        supervisor.attach(child, drains);

        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(
                    session_id = %supervisor.session_id(),
                    "Stop requested during startup grace window"
                );
                return Ok(supervisor);
            }
            _ = tokio::time::sleep(self.grace) => {}
        }

        if !supervisor.is_running() {
            let code = supervisor.exit_code();
            supervisor.stop().await;
            let recent_output = supervisor.recent_output();
            return Err(LaunchError::DiedImmediately {
                code,
                recent_output,
            });
        }

        Ok(supervisor)
    }
}

#[async_trait]
impl SessionLauncher for EncoderLauncher {
    async fn launch(
        &self,
        playlist: &Playlist,
        cancel: &CancellationToken,
    ) -> Result<ProcessSupervisor, LaunchError> {
        let playlist_path = self.playlist_path();
        let command = build_stream_command(&playlist_path, &self.config);
        tracing::info!(
            command = %describe_command(&command, &self.config),
            tracks = playlist.len(),
            "Starting encoder"
        );
        self.launch_command(playlist, command, cancel).await
    }
}
