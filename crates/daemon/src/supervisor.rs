//! Encoder process supervision.
//!
//! One `ProcessSupervisor` owns one encoder process, the two tasks draining
//! its pipes and the playlist file it reads. `stop()` tears all three down.

use crate::concat::remove_playlist_file;
use crate::drain::{DrainStats, OutputTail};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Child;
use tokio::task::JoinHandle;

/// Upper bound on waiting for drain tasks once the process is gone.
const DRAIN_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle of one supervised encoder process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    NotStarted,
    Running,
    /// Stopped on request; carries the exit code when the process reported one.
    Stopped(Option<i32>),
    /// Force-killed after the graceful stop timed out.
    Killed,
    /// Exited without being asked to.
    CrashedUnexpectedly(Option<i32>),
}

impl SupervisorState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SupervisorState::Stopped(_)
                | SupervisorState::Killed
                | SupervisorState::CrashedUnexpectedly(_)
        )
    }
}

/// Supervisor for one encoder session.
#[derive(Debug)]
pub struct ProcessSupervisor {
    session_id: String,
    child: Option<Child>,
    pid: Option<u32>,
    playlist_path: PathBuf,
    drains: Vec<JoinHandle<DrainStats>>,
    tail: OutputTail,
    state: SupervisorState,
    stop_timeout: Duration,
}

impl ProcessSupervisor {
    pub fn new(
        session_id: impl Into<String>,
        playlist_path: impl Into<PathBuf>,
        tail: OutputTail,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            child: None,
            pid: None,
            playlist_path: playlist_path.into(),
            drains: Vec::new(),
            tail,
            state: SupervisorState::NotStarted,
            stop_timeout,
        }
    }

    /// Take ownership of a freshly spawned child and its drain tasks.
    pub fn attach(&mut self, child: Child, drains: Vec<JoinHandle<DrainStats>>) {
        self.pid = child.id();
        self.child = Some(child);
        self.drains = drains;
        self.state = SupervisorState::Running;
        tracing::info!(session_id = %self.session_id, pid = ?self.pid, "Encoder process started");
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn playlist_path(&self) -> &Path {
        &self.playlist_path
    }

    /// Last lines the encoder printed, oldest first.
    pub fn recent_output(&self) -> Vec<String> {
        self.tail.snapshot()
    }

    /// Exit code of a process that has already finished.
    pub fn exit_code(&self) -> Option<i32> {
        match self.state {
            SupervisorState::Stopped(code) | SupervisorState::CrashedUnexpectedly(code) => code,
            _ => None,
        }
    }

    /// Non-blocking liveness poll.
    ///
    /// An exit observed here was not requested, so it is recorded as a crash.
    pub fn is_running(&mut self) -> bool {
        if self.state != SupervisorState::Running {
            return false;
        }
        let Some(child) = self.child.as_mut() else {
            return false;
        };

        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                self.state = SupervisorState::CrashedUnexpectedly(status.code());
                false
            }
            Err(e) => {
                tracing::warn!(session_id = %self.session_id, error = %e, "Failed to poll encoder process");
                self.state = SupervisorState::CrashedUnexpectedly(None);
                false
            }
        }
    }

    /// Terminate the process, join the drains and remove the playlist file.
    ///
    /// Sends a graceful termination signal first and force-kills after
    /// `stop_timeout`. Calling it again once stopped does nothing.
    pub async fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            if self.state == SupervisorState::Running {
                self.state = terminate(&mut child, self.stop_timeout, &self.session_id).await;
            } else {
                // Already exited; reap it.
                if let Err(e) = child.wait().await {
                    tracing::warn!(session_id = %self.session_id, error = %e, "Failed to reap encoder process");
                }
            }
        } else if self.state == SupervisorState::NotStarted {
            self.state = SupervisorState::Stopped(None);
        }

        self.join_drains().await;
        remove_playlist_file(&self.playlist_path);
    }

    async fn join_drains(&mut self) {
        for mut handle in self.drains.drain(..) {
            match tokio::time::timeout(DRAIN_JOIN_TIMEOUT, &mut handle).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    tracing::warn!(session_id = %self.session_id, error = %e, "Output drain task failed")
                }
                Err(_) => {
                    tracing::warn!(session_id = %self.session_id, "Output drain did not finish, aborting");
                    handle.abort();
                }
            }
        }
    }
}

/// Graceful-then-forced termination of one child.
async fn terminate(child: &mut Child, timeout: Duration, session_id: &str) -> SupervisorState {
    request_terminate(child, session_id);

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => {
            tracing::info!(session_id, code = ?status.code(), "Encoder process stopped");
            SupervisorState::Stopped(status.code())
        }
        Ok(Err(e)) => {
            tracing::warn!(session_id, error = %e, "Failed waiting for encoder, killing");
            force_kill(child, session_id).await
        }
        Err(_) => {
            tracing::warn!(session_id, timeout_secs = timeout.as_secs(), "Encoder did not stop in time, killing");
            force_kill(child, session_id).await
        }
    }
}

/// Always ends in `Killed`; a failed kill leaves the process untracked.
async fn force_kill(child: &mut Child, session_id: &str) -> SupervisorState {
    let pid = child.id();
    if let Err(e) = child.kill().await {
        tracing::error!(
            session_id,
            pid = ?pid,
            error = %e,
            "Failed to kill encoder process, it may be left running as an orphan"
        );
    }
    SupervisorState::Killed
}

#[cfg(unix)]
fn request_terminate(child: &mut Child, session_id: &str) {
    let Some(pid) = child.id() else {
        return;
    };
    // SAFETY: kill(2) has no memory-safety preconditions; pid belongs to our unreaped child.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        tracing::warn!(
            session_id,
            error = %std::io::Error::last_os_error(),
            "Failed to send SIGTERM to encoder"
        );
    }
}

#[cfg(not(unix))]
fn request_terminate(child: &mut Child, session_id: &str) {
    if let Err(e) = child.start_kill() {
        tracing::warn!(session_id, error = %e, "Failed to signal encoder");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::drain::{spawn_drain, DrainContext};
    use std::process::Stdio;
    use std::time::Instant;
    use tempfile::TempDir;
    use tokio::process::Command;

    fn spawn_sh(script: &str, tail: &OutputTail) -> (Child, Vec<JoinHandle<DrainStats>>) {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let ctx = |stream: &'static str| DrainContext {
            stream,
            session_id: "test".to_string(),
            tail: tail.clone(),
        };
        let drains = vec![
            spawn_drain(child.stdout.take().unwrap(), ctx("stdout")),
            spawn_drain(child.stderr.take().unwrap(), ctx("stderr")),
        ];
        (child, drains)
    }

    fn supervised(script: &str, dir: &TempDir, stop_timeout: Duration) -> ProcessSupervisor {
        let playlist = dir.path().join("current_playlist.txt");
        std::fs::write(&playlist, "file '/a.mp3'\n").unwrap();
        let tail = OutputTail::default();
        let mut sup = ProcessSupervisor::new("test", &playlist, tail.clone(), stop_timeout);
        let (child, drains) = spawn_sh(script, &tail);
        sup.attach(child, drains);
        sup
    }

    #[tokio::test]
    async fn test_not_running_before_start() {
        let temp = TempDir::new().unwrap();
        let mut sup = ProcessSupervisor::new(
            "idle",
            temp.path().join("list.txt"),
            OutputTail::default(),
            Duration::from_secs(1),
        );
        assert!(!sup.is_running());
        assert_eq!(sup.state(), SupervisorState::NotStarted);

        sup.stop().await;
        assert_eq!(sup.state(), SupervisorState::Stopped(None));
    }

    #[tokio::test]
    async fn test_graceful_stop_is_idempotent_and_cleans_up() {
        let temp = TempDir::new().unwrap();
        let mut sup = supervised("exec sleep 30", &temp, Duration::from_secs(5));
        let playlist = sup.playlist_path().to_path_buf();

        assert!(sup.is_running());
        sup.stop().await;

        assert!(!sup.is_running());
        assert!(matches!(sup.state(), SupervisorState::Stopped(_)));
        assert!(!playlist.exists());

        sup.stop().await;
        assert!(!sup.is_running());
        assert!(matches!(sup.state(), SupervisorState::Stopped(_)));
    }

    #[tokio::test]
    async fn test_stop_force_kills_after_timeout() {
        let temp = TempDir::new().unwrap();
        let mut sup = supervised(
            "trap '' TERM; echo ready; while true; do sleep 0.1; done",
            &temp,
            Duration::from_millis(500),
        );
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = Instant::now();
        sup.stop().await;

        assert_eq!(sup.state(), SupervisorState::Killed);
        assert!(started.elapsed() < Duration::from_secs(8));
        assert!(!sup.playlist_path().exists());
    }

    #[tokio::test]
    async fn test_unrequested_exit_is_a_crash() {
        let temp = TempDir::new().unwrap();
        let mut sup = supervised("echo 'Error: connection failed' >&2; exit 3", &temp, Duration::from_secs(2));

        let deadline = Instant::now() + Duration::from_secs(5);
        while sup.is_running() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        assert_eq!(sup.state(), SupervisorState::CrashedUnexpectedly(Some(3)));
        assert_eq!(sup.exit_code(), Some(3));

        sup.stop().await;
        // Crash classification survives teardown.
        assert_eq!(sup.state(), SupervisorState::CrashedUnexpectedly(Some(3)));
        assert!(sup.recent_output().iter().any(|l| l.contains("connection failed")));
        assert!(!sup.playlist_path().exists());
    }
}
