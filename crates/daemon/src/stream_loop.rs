//! Stream loop for the lofi streamer
//!
//! Runs one encoder session at a time: builds a shuffled playlist, launches
//! the encoder, polls it on a fixed interval, and restarts it with a fresh
//! shuffle when it dies. Exits on the configured deadline or when the
//! cancellation token fires, always tearing the active session down first.

use crate::launcher::{EncoderLauncher, LaunchError, SessionLauncher};
use crate::playlist::{PlaylistError, PlaylistSource};
use crate::status::{new_shared_status, timestamp_ms, LoopState, SharedStatus, StreamStatus};
use crate::supervisor::{ProcessSupervisor, SupervisorState};
use crate::validate::{FfprobeValidator, MediaValidator};
use lofi_streamer_config::{ConfigError, StreamConfig};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Errors that end the stream loop
#[derive(Debug, Error)]
pub enum StreamError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// No usable playlist could be built
    #[error("Playlist error: {0}")]
    Playlist(#[from] PlaylistError),
}

/// Why the loop returned normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
    DeadlineReached,
    Cancelled,
}

/// Delay before the `failures`-th consecutive restart.
///
/// The first restart is immediate; later ones wait `base * 2^(failures - 2)`,
/// capped at `max`.
pub fn restart_delay(failures: u32, base: Duration, max: Duration) -> Duration {
    if failures <= 1 {
        return Duration::ZERO;
    }
    let factor = 1u32.checked_shl(failures - 2).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(max)
}

/// Instants this far out are treated as "never".
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// `started + max_duration`, clamped when the sum would overflow.
fn deadline_after(started: Instant, max_duration: Duration) -> Instant {
    started
        .checked_add(max_duration)
        .or_else(|| started.checked_add(FAR_FUTURE))
        .unwrap_or(started)
}

/// The session control loop
pub struct StreamLoop<V, L> {
    config: Arc<StreamConfig>,
    source: PlaylistSource<V>,
    launcher: L,
    poll_interval: Duration,
    cancel: CancellationToken,
    status: SharedStatus,
    session: Option<ProcessSupervisor>,
    consecutive_failures: u32,
}

impl StreamLoop<FfprobeValidator, EncoderLauncher> {
    /// Wire the loop to ffprobe validation and the ffmpeg encoder.
    pub fn from_config(config: Arc<StreamConfig>, cancel: CancellationToken) -> Self {
        let validator =
            FfprobeValidator::new(config.encoder.ffprobe_bin.clone(), config.validation_timeout());
        let source = PlaylistSource::new(
            config.media.audio_dir.clone(),
            config.media.supported_extensions.clone(),
            validator,
        );
        let launcher = EncoderLauncher::new(config.clone());
        Self::new(config, source, launcher, cancel)
    }
}

impl<V: MediaValidator, L: SessionLauncher> StreamLoop<V, L> {
    pub fn new(
        config: Arc<StreamConfig>,
        source: PlaylistSource<V>,
        launcher: L,
        cancel: CancellationToken,
    ) -> Self {
        let poll_interval = config.poll_interval();
        Self {
            config,
            source,
            launcher,
            poll_interval,
            cancel,
            status: new_shared_status(),
            session: None,
            consecutive_failures: 0,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Publish into an existing status handle (e.g. one the HTTP server reads).
    pub fn with_status(mut self, status: SharedStatus) -> Self {
        self.status = status;
        self
    }

    /// Get the shared status
    pub fn status(&self) -> SharedStatus {
        self.status.clone()
    }

    /// Run until the deadline, cancellation, or a fatal error
    ///
    /// The active session is torn down on every exit path.
    pub async fn run(&mut self) -> Result<LoopOutcome, StreamError> {
        self.config.validate()?;

        let started = Instant::now();
        let deadline = deadline_after(started, self.config.max_duration());
        self.update_status(|s| {
            s.state = LoopState::Starting;
            s.max_duration_secs = self.config.timing.max_duration_secs;
        })
        .await;
        tracing::info!(
            audio_dir = %self.source.audio_dir().display(),
            max_duration_secs = self.config.timing.max_duration_secs,
            poll_interval_secs = self.poll_interval.as_secs_f64(),
            "Starting stream loop"
        );

        let result = self.drive(started, deadline).await;

        self.update_status(|s| s.state = LoopState::Stopping).await;
        self.teardown().await;
        self.update_status(|s| {
            s.state = LoopState::Finished;
            s.elapsed_secs = started.elapsed().as_secs();
        })
        .await;

        match &result {
            Ok(outcome) => tracing::info!(
                outcome = ?outcome,
                elapsed_secs = started.elapsed().as_secs(),
                "Stream loop finished"
            ),
            Err(e) => tracing::error!(error = %e, "Stream loop failed"),
        }
        result
    }

    async fn drive(&mut self, started: Instant, deadline: Instant) -> Result<LoopOutcome, StreamError> {
        if self.cancel.is_cancelled() {
            return Ok(LoopOutcome::Cancelled);
        }
        self.start_session().await?;

        loop {
            let now = Instant::now();
            if now >= deadline {
                tracing::info!(
                    elapsed_secs = started.elapsed().as_secs(),
                    "Maximum stream duration reached"
                );
                return Ok(LoopOutcome::DeadlineReached);
            }

            let wait = self.poll_interval.min(deadline - now);
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("Stop requested, shutting down stream");
                    return Ok(LoopOutcome::Cancelled);
                }
                _ = tokio::time::sleep(wait) => {}
            }

            let elapsed = started.elapsed();
            self.update_status(|s| s.elapsed_secs = elapsed.as_secs()).await;
            if Instant::now() >= deadline {
                continue;
            }

            if let Some(session) = self.session.as_mut() {
                if session.is_running() {
                    self.consecutive_failures = 0;
                    continue;
                }

                let code = match session.state() {
                    SupervisorState::CrashedUnexpectedly(code) => code,
                    _ => None,
                };
                // Let the drains flush before reading the tail.
                tokio::time::sleep(Duration::from_millis(100)).await;
                tracing::error!(
                    session_id = %session.session_id(),
                    pid = ?session.pid(),
                    code = ?code,
                    elapsed_secs = elapsed.as_secs(),
                    recent_output = %session.recent_output().join(" | "),
                    "Stream process crashed unexpectedly, restarting with a new playlist"
                );
                self.update_status(|s| s.crashes += 1).await;
            } else {
                tracing::warn!("No active stream session, retrying launch");
            }

            self.restart(deadline).await?;
        }
    }

    /// Replace the current session with a freshly shuffled one.
    async fn restart(&mut self, deadline: Instant) -> Result<(), StreamError> {
        self.update_status(|s| s.state = LoopState::Restarting).await;
        self.stop_session().await;

        self.consecutive_failures += 1;
        let delay = restart_delay(
            self.consecutive_failures,
            self.config.restart_backoff_base(),
            self.config.restart_backoff_max(),
        );
        if !delay.is_zero() {
            let wait = delay.min(deadline.saturating_duration_since(Instant::now()));
            tracing::warn!(
                consecutive_failures = self.consecutive_failures,
                delay_secs = wait.as_secs_f64(),
                "Repeated stream failures, backing off before restart"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(wait) => {}
            }
        }

        if self.cancel.is_cancelled() || Instant::now() >= deadline {
            return Ok(());
        }
        self.start_session().await
    }

    /// Build a playlist and launch it. Launch failures are absorbed; the
    /// next poll tick retries.
    ///
    /// A stop request abandons the build. During the grace window the
    /// launcher returns the session early and it is stored like any other,
    /// so the exit path tears it down.
    async fn start_session(&mut self) -> Result<(), StreamError> {
        let playlist = tokio::select! {
            _ = self.cancel.cancelled() => {
                tracing::info!("Stop requested while building playlist");
                return Ok(());
            }
            playlist = self.source.build_playlist() => playlist?,
        };
        self.update_status(|s| {
            s.track_count = playlist.len();
            s.playlist_duration_secs = playlist.total_duration_secs();
        })
        .await;

        match self.launcher.launch(&playlist, &self.cancel).await {
            Ok(session) => {
                tracing::info!(
                    session_id = %session.session_id(),
                    pid = ?session.pid(),
                    track_count = playlist.len(),
                    "Stream session started"
                );
                let session_id = session.session_id().to_string();
                let pid = session.pid();
                self.update_status(|s| {
                    s.state = LoopState::Streaming;
                    s.session_id = Some(session_id);
                    s.pid = pid;
                    s.sessions_started += 1;
                })
                .await;
                self.session = Some(session);
            }
            Err(e) => {
                match &e {
                    LaunchError::DiedImmediately { recent_output, .. } => tracing::error!(
                        error = %e,
                        recent_output = %recent_output.join(" | "),
                        "Failed to start stream session"
                    ),
                    _ => tracing::error!(error = %e, "Failed to start stream session"),
                }
                self.update_status(|s| {
                    s.state = LoopState::Restarting;
                    s.session_id = None;
                    s.pid = None;
                    s.launch_failures += 1;
                })
                .await;
            }
        }
        Ok(())
    }

    async fn stop_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.stop().await;
            tracing::info!(
                session_id = %session.session_id(),
                state = ?session.state(),
                "Stream session ended"
            );
            self.update_status(|s| {
                s.sessions_stopped += 1;
                s.session_id = None;
                s.pid = None;
            })
            .await;
        }
    }

    async fn teardown(&mut self) {
        if self.session.is_some() {
            tracing::info!("Tearing down active stream session");
        }
        self.stop_session().await;
    }

    async fn update_status(&self, f: impl FnOnce(&mut StreamStatus)) {
        let mut status = self.status.write().await;
        f(&mut status);
        status.timestamp_unix_ms = timestamp_ms();
    }
}
