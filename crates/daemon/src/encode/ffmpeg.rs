//! FFmpeg streaming command module
//!
//! Builds the ffmpeg invocation that plays the concat playlist over a looping
//! background and pushes the result to the RTMP target.

use lofi_streamer_config::StreamConfig;
use std::path::Path;
use std::process::Command;

/// Index of the concat (audio) input on the command line.
pub const AUDIO_INPUT: usize = 0;
/// Index of the background (video) input on the command line.
pub const VIDEO_INPUT: usize = 1;

/// Synthetic background used when no video is configured.
///
/// Produces the `lavfi` source description, e.g. `color=c=black:s=1280x720:r=30`.
pub fn solid_color_source(config: &StreamConfig) -> String {
    format!(
        "color=c={}:s={}:r={}",
        config.encoder.fallback_color,
        config.encoder.fallback_resolution,
        config.encoder.framerate
    )
}

/// Build the ffmpeg streaming command
///
/// Argument order matters: the concat list is input 0, the background is
/// input 1, and the explicit `-map`s refer to those indices.
///
/// Creates a Command configured with:
/// - Global flags: no stdin, real-time pacing, overwrite, verbose log level, stats
/// - Input 0: concat demuxer over the playlist file, unsafe paths allowed, looped forever
/// - Input 1: background video looped forever, or a solid colour `lavfi` source
/// - Mapping: video from input 1, audio from input 0
/// - Video: codec, preset, capped bitrate with matching buffer, 2s keyframe interval
/// - Audio: codec, bitrate, sample rate
/// - Timestamp normalisation and network reconnect flags
/// - FLV output to `RTMP_URL/STREAM_KEY`
///
/// # Arguments
/// * `playlist_path` - Concat list written for this session
/// * `config` - Resolved stream configuration
pub fn build_stream_command(playlist_path: &Path, config: &StreamConfig) -> Command {
    let enc = &config.encoder;
    let mut cmd = Command::new(&enc.ffmpeg_bin);

    // Global flags. Log level and stats go first so they apply to the whole run.
    cmd.args(["-nostdin", "-re", "-y"]);
    cmd.args(["-loglevel", "verbose", "-stats"]);

    // Input 0: the playlist
    cmd.args(["-f", "concat", "-safe", "0", "-stream_loop", "-1"]);
    cmd.arg("-i").arg(playlist_path);

    // Input 1: the background
    match config.background_source() {
        Some(background) => {
            cmd.args(["-stream_loop", "-1", "-i", background]);
        }
        None => {
            cmd.args(["-loop", "1", "-f", "lavfi", "-i"]);
            cmd.arg(solid_color_source(config));
        }
    }

    // The background never gates the audio loop count
    cmd.arg("-map").arg(format!("{}:v", VIDEO_INPUT));
    cmd.arg("-map").arg(format!("{}:a", AUDIO_INPUT));

    // Video encode
    cmd.arg("-c:v").arg(&enc.video_codec);
    cmd.arg("-preset").arg(&enc.preset);
    cmd.arg("-b:v").arg(&enc.video_bitrate);
    cmd.arg("-maxrate").arg(&enc.video_bitrate);
    cmd.arg("-bufsize").arg(&enc.buffer_size);
    cmd.arg("-r").arg(enc.framerate.to_string());
    cmd.arg("-g").arg(enc.keyframe_interval().to_string());

    // Audio encode
    cmd.arg("-c:a").arg(&enc.audio_codec);
    cmd.arg("-b:a").arg(&enc.audio_bitrate);
    cmd.arg("-ar").arg(enc.sample_rate.to_string());

    // Timestamps and reconnects
    cmd.args(["-avoid_negative_ts", "make_zero", "-fflags", "+genpts"]);
    cmd.args([
        "-reconnect",
        "1",
        "-reconnect_at_eof",
        "1",
        "-reconnect_streamed",
        "1",
    ]);
    cmd.arg("-reconnect_delay_max")
        .arg(enc.reconnect_delay_max_secs.to_string());

    // Output
    cmd.args(["-f", "flv"]);
    cmd.arg(config.output_target());

    cmd
}

/// Render a command for logging, with the stream key masked.
pub fn describe_command(cmd: &Command, config: &StreamConfig) -> String {
    let mut parts = vec![cmd.get_program().to_string_lossy().to_string()];
    parts.extend(cmd.get_args().map(|a| a.to_string_lossy().to_string()));
    let line = parts.join(" ");

    match config.output.stream_key.as_deref().map(str::trim) {
        Some(key) if !key.is_empty() => line.replace(key, "****"),
        _ => line,
    }
}
