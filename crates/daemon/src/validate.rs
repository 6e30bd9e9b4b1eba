//! Media validation module for audio tracks.
//!
//! A track is usable when it exists, is non-empty and ffprobe can read at
//! least one audio stream from it within a bounded time. Every failure mode
//! (missing tool, non-zero exit, timeout, unparseable output) collapses to
//! "invalid"; nothing here is fatal to the caller.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// The file does not exist.
    #[error("file not found")]
    Missing,

    /// The file is zero bytes.
    #[error("file is empty")]
    Empty,

    /// ffprobe ran but rejected the file.
    #[error("ffprobe failed: {0}")]
    ProbeFailed(String),

    /// ffprobe did not finish within the validation timeout.
    #[error("ffprobe timed out after {0:?}")]
    Timeout(Duration),

    /// Failed to parse ffprobe output.
    #[error("failed to parse ffprobe output: {0}")]
    Parse(String),

    /// The file has no audio stream.
    #[error("no audio stream")]
    NoAudio,

    /// IO error, including ffprobe not being installed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Validation collaborator used by the playlist source.
///
/// `probe` is the single primitive: `Some(duration_secs)` for a playable
/// track, `None` otherwise.
#[async_trait]
pub trait MediaValidator: Send + Sync {
    async fn probe(&self, path: &Path) -> Option<f64>;

    /// Whether the track can be streamed.
    async fn validate(&self, path: &Path) -> bool {
        self.probe(path).await.is_some()
    }

    /// Duration in seconds, 0.0 when the track cannot be probed.
    async fn duration(&self, path: &Path) -> f64 {
        self.probe(path).await.unwrap_or(0.0)
    }
}

/// Summary of an ffprobe run.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    /// Number of audio streams in the container.
    pub audio_streams: usize,
    /// Container duration in seconds (0.0 when unknown).
    pub duration_secs: f64,
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
    }
}

/// Existence and size check, done before spending a process on ffprobe.
pub fn check_file_basics(path: &Path) -> Result<u64, ValidationError> {
    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ValidationError::Missing)
        }
        Err(e) => return Err(ValidationError::Io(e)),
    };
    if !metadata.is_file() {
        return Err(ValidationError::Missing);
    }
    if metadata.len() == 0 {
        return Err(ValidationError::Empty);
    }
    Ok(metadata.len())
}

/// Parses ffprobe JSON output into a ProbeResult.
pub fn parse_ffprobe_output(json_str: &str) -> Result<ProbeResult, ValidationError> {
    if json_str.trim().is_empty() {
        return Err(ValidationError::Parse("empty output".to_string()));
    }

    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ValidationError::Parse(e.to_string()))?;

    let audio_streams = ffprobe
        .streams
        .unwrap_or_default()
        .iter()
        .filter(|s| s.codec_type.as_deref() == Some("audio"))
        .count();

    let duration_secs = ffprobe
        .format
        .and_then(|f| f.duration)
        .and_then(|d| d.trim().parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d >= 0.0)
        .unwrap_or(0.0);

    Ok(ProbeResult {
        audio_streams,
        duration_secs,
    })
}

/// Validator backed by the ffprobe binary.
#[derive(Debug, Clone)]
pub struct FfprobeValidator {
    ffprobe_bin: String,
    timeout: Duration,
}

impl FfprobeValidator {
    pub fn new(ffprobe_bin: impl Into<String>, timeout: Duration) -> Self {
        Self {
            ffprobe_bin: ffprobe_bin.into(),
            timeout,
        }
    }

    /// Probes a file using ffprobe to collect stream and format metadata.
    ///
    /// Runs `ffprobe -v quiet -print_format json -show_format -show_streams <path>`
    /// under a hard timeout. The child is killed if the timeout fires.
    pub async fn probe_file(&self, path: &Path) -> Result<ProbeResult, ValidationError> {
        check_file_basics(path)?;

        let mut cmd = Command::new(&self.ffprobe_bin);
        cmd.args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| ValidationError::Timeout(self.timeout))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ValidationError::ProbeFailed(format!(
                "ffprobe exited with status {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let probe = parse_ffprobe_output(&String::from_utf8_lossy(&output.stdout))?;
        if probe.audio_streams == 0 {
            return Err(ValidationError::NoAudio);
        }
        Ok(probe)
    }
}

#[async_trait]
impl MediaValidator for FfprobeValidator {
    async fn probe(&self, path: &Path) -> Option<f64> {
        match self.probe_file(path).await {
            Ok(probe) => Some(probe.duration_secs),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to validate audio file");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const AUDIO_JSON: &str = r#"{
        "streams": [
            {"index": 0, "codec_name": "mp3", "codec_type": "audio", "channels": 2}
        ],
        "format": {"filename": "a.mp3", "duration": "183.248000", "size": "2931200"}
    }"#;

    /// Writes an executable shell script standing in for ffprobe.
    #[cfg(unix)]
    fn fake_ffprobe(dir: &Path, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("fake-ffprobe");
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().to_string()
    }

    fn audio_file(dir: &Path, name: &str, bytes: &[u8]) -> std::path::PathBuf {
        let path = dir.join(name);
        fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn test_parse_ffprobe_output_audio() {
        let probe = parse_ffprobe_output(AUDIO_JSON).unwrap();
        assert_eq!(probe.audio_streams, 1);
        assert!((probe.duration_secs - 183.248).abs() < 1e-6);
    }

    #[test]
    fn test_parse_ffprobe_output_missing_fields() {
        let probe = parse_ffprobe_output(r#"{"streams": [{"codec_type": "video"}]}"#).unwrap();
        assert_eq!(probe.audio_streams, 0);
        assert_eq!(probe.duration_secs, 0.0);

        let probe = parse_ffprobe_output(r#"{"format": {"duration": "N/A"}}"#).unwrap();
        assert_eq!(probe.duration_secs, 0.0);
    }

    #[test]
    fn test_parse_ffprobe_output_rejects_garbage() {
        assert!(matches!(parse_ffprobe_output(""), Err(ValidationError::Parse(_))));
        assert!(matches!(
            parse_ffprobe_output("not json"),
            Err(ValidationError::Parse(_))
        ));
    }

    #[test]
    fn test_check_file_basics() {
        let temp = TempDir::new().unwrap();
        let good = audio_file(temp.path(), "good.mp3", b"ID3");
        let empty = audio_file(temp.path(), "empty.mp3", b"");

        assert_eq!(check_file_basics(&good).unwrap(), 3);
        assert!(matches!(check_file_basics(&empty), Err(ValidationError::Empty)));
        assert!(matches!(
            check_file_basics(&temp.path().join("gone.mp3")),
            Err(ValidationError::Missing)
        ));
        assert!(matches!(check_file_basics(temp.path()), Err(ValidationError::Missing)));
    }

    #[tokio::test]
    async fn test_missing_tool_is_invalid_not_fatal() {
        let temp = TempDir::new().unwrap();
        let track = audio_file(temp.path(), "a.mp3", b"data");
        let validator =
            FfprobeValidator::new("/nonexistent/ffprobe-binary", Duration::from_secs(2));

        assert!(!validator.validate(&track).await);
        assert_eq!(validator.duration(&track).await, 0.0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_probe_reads_duration_from_fake_ffprobe() {
        let temp = TempDir::new().unwrap();
        let bin = fake_ffprobe(temp.path(), &format!("cat <<'JSON'\n{}\nJSON", AUDIO_JSON));
        let track = audio_file(temp.path(), "a.mp3", b"data");
        let validator = FfprobeValidator::new(bin, Duration::from_secs(5));

        assert!(validator.validate(&track).await);
        assert!((validator.duration(&track).await - 183.248).abs() < 1e-6);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_probe_non_zero_exit_is_invalid() {
        let temp = TempDir::new().unwrap();
        let bin = fake_ffprobe(temp.path(), "echo 'Invalid data found' >&2\nexit 1");
        let track = audio_file(temp.path(), "a.flac", b"data");
        let validator = FfprobeValidator::new(bin, Duration::from_secs(5));

        let err = validator.probe_file(&track).await.unwrap_err();
        assert!(matches!(err, ValidationError::ProbeFailed(_)));
        assert!(!validator.validate(&track).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_probe_timeout_is_enforced() {
        let temp = TempDir::new().unwrap();
        let bin = fake_ffprobe(temp.path(), "sleep 10");
        let track = audio_file(temp.path(), "slow.wav", b"data");
        let validator = FfprobeValidator::new(bin, Duration::from_millis(300));

        let started = std::time::Instant::now();
        let err = validator.probe_file(&track).await.unwrap_err();
        assert!(matches!(err, ValidationError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_probe_without_audio_stream_is_invalid() {
        let temp = TempDir::new().unwrap();
        let bin = fake_ffprobe(
            temp.path(),
            r#"echo '{"streams":[{"codec_type":"video"}],"format":{"duration":"5"}}'"#,
        );
        let track = audio_file(temp.path(), "video.m4a", b"data");
        let validator = FfprobeValidator::new(bin, Duration::from_secs(5));

        assert!(matches!(
            validator.probe_file(&track).await,
            Err(ValidationError::NoAudio)
        ));
    }
}
