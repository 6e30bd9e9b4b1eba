//! Lofi Streamer
//!
//! Streams a shuffled audio playlist over a looping background to an RTMP
//! endpoint, supervising the ffmpeg process and restarting it on crashes.

pub mod concat;
pub mod drain;
pub mod encode;
pub mod launcher;
pub mod playlist;
pub mod startup;
pub mod status;
pub mod status_server;
pub mod stream_loop;
pub mod supervisor;
pub mod validate;

pub use lofi_streamer_config as config;
pub use lofi_streamer_config::StreamConfig;
pub use concat::{escape_concat_path, remove_playlist_file, write_playlist_file, ConcatError};
pub use drain::{classify_line, spawn_drain, DrainStats, LineSeverity, OutputTail};
pub use encode::build_stream_command;
pub use launcher::{EncoderLauncher, LaunchError, SessionLauncher};
pub use playlist::{Playlist, PlaylistError, PlaylistSource, Track};
pub use startup::{check_tool_available, parse_ffmpeg_version, run_startup_checks, StartupError};
pub use status::{
    collect_system_metrics, new_shared_status, LoopState, SharedStatus, StreamStatus,
    SystemMetrics,
};
pub use status_server::{create_status_router, parse_bind_addr, run_status_server, ServerError};
pub use stream_loop::{restart_delay, LoopOutcome, StreamError, StreamLoop};
pub use supervisor::{ProcessSupervisor, SupervisorState};
pub use validate::{FfprobeValidator, MediaValidator};

/// Stand-ins for ffprobe and ffmpeg used across the unit tests.
#[cfg(test)]
pub(crate) mod test_support {
    use crate::launcher::{EncoderLauncher, LaunchError, SessionLauncher};
    use crate::playlist::Playlist;
    use crate::supervisor::ProcessSupervisor;
    use crate::validate::{check_file_basics, MediaValidator};
    use async_trait::async_trait;
    use lofi_streamer_config::StreamConfig;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    /// Accepts any existing non-empty file, duration unknown.
    pub struct SizeOnlyValidator;

    #[async_trait]
    impl MediaValidator for SizeOnlyValidator {
        async fn probe(&self, path: &Path) -> Option<f64> {
            check_file_basics(path).ok().map(|_| 0.0)
        }
    }

    /// Launches `sh -c <script>` in place of ffmpeg.
    #[derive(Clone)]
    pub struct ShellLauncher {
        inner: EncoderLauncher,
        script: String,
        pub launches: Arc<AtomicUsize>,
    }

    impl ShellLauncher {
        pub fn new(config: Arc<StreamConfig>, script: &str) -> Self {
            Self {
                inner: EncoderLauncher::new(config)
                    .with_timings(Duration::from_millis(200), Duration::from_secs(2)),
                script: script.to_string(),
                launches: Arc::new(AtomicUsize::new(0)),
            }
        }

        pub fn with_grace(mut self, grace: Duration) -> Self {
            self.inner = self.inner.with_timings(grace, Duration::from_secs(2));
            self
        }
    }

    #[async_trait]
    impl SessionLauncher for ShellLauncher {
        async fn launch(
            &self,
            playlist: &Playlist,
            cancel: &CancellationToken,
        ) -> Result<ProcessSupervisor, LaunchError> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            let mut cmd = std::process::Command::new("sh");
            cmd.arg("-c").arg(&self.script);
            self.inner.launch_command(playlist, cmd, cancel).await
        }
    }
}
