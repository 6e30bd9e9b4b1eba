//! Startup checks module for the lofi streamer
//!
//! Preflight checks run before the first session:
//! - ffmpeg is installed and answers `-version`
//! - ffprobe is installed and answers `-version`

use lofi_streamer_config::StreamConfig;
use std::process::Command;
use thiserror::Error;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("{tool} not available: {reason}")]
    ToolUnavailable { tool: String, reason: String },
}

/// Versions reported by the external tools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolVersions {
    pub ffmpeg: String,
    pub ffprobe: String,
}

/// Extract the version token from `<tool> -version` output
///
/// Handles the formats FFmpeg builds print:
/// - Release: "ffmpeg version 6.1.1 ..."
/// - Git snapshot with n prefix: "ffmpeg version n7.0-12-gabcdef ..."
/// - Distribution suffix: "ffprobe version 4.4.2-0ubuntu0.22.04.1 ..."
pub fn parse_tool_version(version_output: &str, tool: &str) -> Option<String> {
    let marker = format!("{} version", tool.to_lowercase());
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains(&marker))?;

    let version = version_line
        .to_lowercase()
        .split(marker.as_str())
        .nth(1)?
        .split_whitespace()
        .next()?
        .trim_start_matches('n')
        .to_string();

    if version.is_empty() {
        None
    } else {
        Some(version)
    }
}

/// Parse FFmpeg version string and extract major version number
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let version = parse_tool_version(version_output, "ffmpeg")?;
    version.split(['.', '-']).next()?.parse().ok()
}

/// Run `<bin> -version` and return the reported version
///
/// A build whose banner cannot be parsed is still usable; its version is
/// reported as "unknown".
pub fn check_tool_available(bin: &str, tool: &str) -> Result<String, StartupError> {
    let output = Command::new(bin)
        .arg("-version")
        .output()
        .map_err(|e| StartupError::ToolUnavailable {
            tool: tool.to_string(),
            reason: format!("{} -version failed; is it installed and in PATH? Error: {}", bin, e),
        })?;

    if !output.status.success() {
        return Err(StartupError::ToolUnavailable {
            tool: tool.to_string(),
            reason: format!("{} -version exited with {}", bin, output.status),
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(parse_tool_version(&stdout, tool).unwrap_or_else(|| "unknown".to_string()))
}

/// Run all startup checks in order
///
/// 1. ffmpeg availability
/// 2. ffprobe availability
pub fn run_startup_checks(cfg: &StreamConfig) -> Result<ToolVersions, StartupError> {
    let ffmpeg = check_tool_available(&cfg.encoder.ffmpeg_bin, "ffmpeg")?;
    tracing::info!(bin = %cfg.encoder.ffmpeg_bin, version = %ffmpeg, "Found ffmpeg");

    let ffprobe = check_tool_available(&cfg.encoder.ffprobe_bin, "ffprobe")?;
    tracing::info!(bin = %cfg.encoder.ffprobe_bin, version = %ffprobe, "Found ffprobe");

    Ok(ToolVersions { ffmpeg, ffprobe })
}
