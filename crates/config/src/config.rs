//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Literal value of `BACKGROUND` meaning "no background video".
pub const NO_BACKGROUND: &str = "NONE";

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file or creating the logs directory
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// RTMP URL or stream key is missing
    MissingOutputTarget,
    /// The audio source directory does not exist
    MissingAudioDir(PathBuf),
    /// A value is out of range
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::MissingOutputTarget => {
                write!(f, "RTMP_URL and STREAM_KEY must be set in environment")
            }
            ConfigError::MissingAudioDir(dir) => {
                write!(f, "Audio directory '{}' does not exist", dir.display())
            }
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// RTMP output target
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct OutputConfig {
    /// Ingest URL, e.g. `rtmp://a.rtmp.youtube.com/live2`
    pub rtmp_url: Option<String>,
    /// Stream key appended to the URL
    pub stream_key: Option<String>,
}

/// Media inputs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaConfig {
    /// Directory holding the audio tracks (must exist)
    #[serde(default = "default_audio_dir")]
    pub audio_dir: PathBuf,
    /// Background video path, or `NONE` for a solid colour
    #[serde(default)]
    pub background: Option<String>,
    /// Where the concat list for the running session is written
    #[serde(default = "default_playlist_path")]
    pub playlist_path: PathBuf,
    /// Accepted audio extensions (case-insensitive, without the dot)
    #[serde(default = "default_supported_extensions")]
    pub supported_extensions: Vec<String>,
}

fn default_audio_dir() -> PathBuf {
    PathBuf::from("audio")
}

fn default_playlist_path() -> PathBuf {
    PathBuf::from("current_playlist.txt")
}

fn default_supported_extensions() -> Vec<String> {
    ["mp3", "wav", "flac", "m4a"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            audio_dir: default_audio_dir(),
            background: None,
            playlist_path: default_playlist_path(),
            supported_extensions: default_supported_extensions(),
        }
    }
}

/// Timeouts, intervals and the session deadline
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimingConfig {
    /// Upper bound on the whole streaming run (default 47h)
    #[serde(default = "default_max_duration_secs")]
    pub max_duration_secs: u64,
    /// Reserved for track transitions, not used by the loop yet
    #[serde(default = "default_crossfade_secs")]
    pub crossfade_secs: f64,
    /// Bound on a single ffprobe run
    #[serde(default = "default_validation_timeout_secs")]
    pub validation_timeout_secs: u64,
    /// Time after spawn during which an exit counts as a failed launch
    #[serde(default = "default_startup_grace_secs")]
    pub startup_grace_secs: u64,
    /// Graceful stop wait before the encoder is killed
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
    /// How often the loop checks liveness and the deadline
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Delay before the second consecutive restart (doubles afterwards)
    #[serde(default = "default_restart_backoff_base_secs")]
    pub restart_backoff_base_secs: u64,
    /// Cap on the restart delay
    #[serde(default = "default_restart_backoff_max_secs")]
    pub restart_backoff_max_secs: u64,
}

fn default_max_duration_secs() -> u64 {
    169_200
}

fn default_crossfade_secs() -> f64 {
    3.0
}

fn default_validation_timeout_secs() -> u64 {
    10
}

fn default_startup_grace_secs() -> u64 {
    5
}

fn default_stop_timeout_secs() -> u64 {
    15
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_restart_backoff_base_secs() -> u64 {
    5
}

fn default_restart_backoff_max_secs() -> u64 {
    300
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            max_duration_secs: default_max_duration_secs(),
            crossfade_secs: default_crossfade_secs(),
            validation_timeout_secs: default_validation_timeout_secs(),
            startup_grace_secs: default_startup_grace_secs(),
            stop_timeout_secs: default_stop_timeout_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            restart_backoff_base_secs: default_restart_backoff_base_secs(),
            restart_backoff_max_secs: default_restart_backoff_max_secs(),
        }
    }
}

/// Encoder binaries and the fixed encode settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EncoderConfig {
    pub ffmpeg_bin: String,
    pub ffprobe_bin: String,
    pub video_codec: String,
    pub preset: String,
    pub video_bitrate: String,
    pub buffer_size: String,
    pub framerate: u32,
    pub audio_codec: String,
    pub audio_bitrate: String,
    pub sample_rate: u32,
    /// Colour of the synthetic background when no video is configured
    pub fallback_color: String,
    /// Resolution of the synthetic background, `WxH`
    pub fallback_resolution: String,
    pub reconnect_delay_max_secs: u32,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_bin: "ffmpeg".to_string(),
            ffprobe_bin: "ffprobe".to_string(),
            video_codec: "libx264".to_string(),
            preset: "veryfast".to_string(),
            video_bitrate: "2500k".to_string(),
            buffer_size: "5000k".to_string(),
            framerate: 30,
            audio_codec: "aac".to_string(),
            audio_bitrate: "128k".to_string(),
            sample_rate: 44_100,
            fallback_color: "black".to_string(),
            fallback_resolution: "1280x720".to_string(),
            reconnect_delay_max_secs: 10,
        }
    }
}

impl EncoderConfig {
    /// Keyframe interval in frames: two seconds at the output framerate
    pub fn keyframe_interval(&self) -> u32 {
        self.framerate.saturating_mul(2).max(1)
    }
}

/// Log sink settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Directory for the log file (created at startup)
    pub logs_dir: PathBuf,
    /// Log file name inside `logs_dir`
    pub log_file: String,
    /// Default filter when `RUST_LOG` is not set
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            logs_dir: PathBuf::from("logs"),
            log_file: "lofi_stream.log".to_string(),
            level: "info".to_string(),
        }
    }
}

/// Optional HTTP status endpoint
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct StatusConfig {
    /// Bind address such as `127.0.0.1:7878`; `None` disables the endpoint
    pub bind: Option<String>,
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct StreamConfig {
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub status: StatusConfig,
}

/// Parse `raw` into `target`, leaving it untouched when parsing fails.
fn override_parsed<T: FromStr>(raw: Option<String>, target: &mut T) {
    if let Some(parsed) = raw.and_then(|v| v.trim().parse::<T>().ok()) {
        *target = parsed;
    }
}

impl StreamConfig {
    /// Load configuration from a TOML file
    ///
    /// Parses the file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: StreamConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - RTMP_URL -> output.rtmp_url
    /// - STREAM_KEY -> output.stream_key
    /// - BACKGROUND -> media.background
    /// - AUDIO_DIR -> media.audio_dir
    /// - MAX_DURATION -> timing.max_duration_secs
    /// - CROSSFADE_DURATION -> timing.crossfade_secs
    /// - VALIDATION_TIMEOUT -> timing.validation_timeout_secs
    /// - POLL_INTERVAL -> timing.poll_interval_secs
    /// - FFMPEG_BIN / FFPROBE_BIN -> encoder binaries
    /// - LOGS_DIR -> logging.logs_dir
    /// - STATUS_BIND -> status.bind
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| env::var(key).ok());
    }

    /// Same as [`apply_env_overrides`](Self::apply_env_overrides) with a custom lookup.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("RTMP_URL") {
            self.output.rtmp_url = Some(url);
        }
        if let Some(key) = lookup("STREAM_KEY") {
            self.output.stream_key = Some(key);
        }
        if let Some(background) = lookup("BACKGROUND") {
            self.media.background = Some(background);
        }
        if let Some(dir) = lookup("AUDIO_DIR") {
            self.media.audio_dir = PathBuf::from(dir);
        }

        override_parsed(lookup("MAX_DURATION"), &mut self.timing.max_duration_secs);
        override_parsed(lookup("CROSSFADE_DURATION"), &mut self.timing.crossfade_secs);
        override_parsed(
            lookup("VALIDATION_TIMEOUT"),
            &mut self.timing.validation_timeout_secs,
        );
        override_parsed(lookup("POLL_INTERVAL"), &mut self.timing.poll_interval_secs);

        if let Some(bin) = lookup("FFMPEG_BIN") {
            self.encoder.ffmpeg_bin = bin;
        }
        if let Some(bin) = lookup("FFPROBE_BIN") {
            self.encoder.ffprobe_bin = bin;
        }
        if let Some(dir) = lookup("LOGS_DIR") {
            self.logging.logs_dir = PathBuf::from(dir);
        }
        if let Some(bind) = lookup("STATUS_BIND") {
            self.status.bind = Some(bind).filter(|b| !b.trim().is_empty());
        }
    }

    /// Load configuration from an optional file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Check that the configuration can drive a stream
    ///
    /// The output target must be fully resolved and every timeout non-zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = self.output.rtmp_url.as_deref().map(str::trim).unwrap_or("");
        let key = self.output.stream_key.as_deref().map(str::trim).unwrap_or("");
        if url.is_empty() || key.is_empty() {
            return Err(ConfigError::MissingOutputTarget);
        }

        let t = &self.timing;
        let zeroes = [
            ("max_duration_secs", t.max_duration_secs),
            ("validation_timeout_secs", t.validation_timeout_secs),
            ("startup_grace_secs", t.startup_grace_secs),
            ("stop_timeout_secs", t.stop_timeout_secs),
            ("poll_interval_secs", t.poll_interval_secs),
        ];
        if let Some((name, _)) = zeroes.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Invalid(format!("{} must be greater than 0", name)));
        }
        if !(t.crossfade_secs >= 0.0) {
            return Err(ConfigError::Invalid(
                "crossfade_secs must not be negative".to_string(),
            ));
        }
        if self.media.supported_extensions.is_empty() {
            return Err(ConfigError::Invalid(
                "supported_extensions must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Check the filesystem preconditions: the audio directory exists and
    /// the logs directory is created if absent.
    pub fn validate_filesystem(&self) -> Result<(), ConfigError> {
        if !self.media.audio_dir.is_dir() {
            return Err(ConfigError::MissingAudioDir(self.media.audio_dir.clone()));
        }
        fs::create_dir_all(&self.logging.logs_dir)?;
        Ok(())
    }

    /// `RTMP_URL/STREAM_KEY` with exactly one slash between the parts
    ///
    /// Only meaningful after [`validate`](Self::validate) has succeeded.
    pub fn output_target(&self) -> String {
        let url = self.output.rtmp_url.as_deref().unwrap_or("").trim();
        let key = self.output.stream_key.as_deref().unwrap_or("").trim();
        format!(
            "{}/{}",
            url.trim_end_matches('/'),
            key.trim_start_matches('/')
        )
    }

    /// Background video path, or `None` when the solid colour fallback applies
    pub fn background_source(&self) -> Option<&str> {
        self.media
            .background
            .as_deref()
            .map(str::trim)
            .filter(|b| !b.is_empty() && !b.eq_ignore_ascii_case(NO_BACKGROUND))
    }

    /// Full path of the log file
    pub fn log_file_path(&self) -> PathBuf {
        self.logging.logs_dir.join(&self.logging.log_file)
    }

    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.timing.max_duration_secs)
    }

    pub fn validation_timeout(&self) -> Duration {
        Duration::from_secs(self.timing.validation_timeout_secs)
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_secs(self.timing.startup_grace_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.timing.stop_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.timing.poll_interval_secs)
    }

    pub fn restart_backoff_base(&self) -> Duration {
        Duration::from_secs(self.timing.restart_backoff_base_secs)
    }

    pub fn restart_backoff_max(&self) -> Duration {
        Duration::from_secs(self.timing.restart_backoff_max_secs)
    }
}
