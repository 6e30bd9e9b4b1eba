//! Encoder command construction for the lofi streamer

pub mod ffmpeg;

pub use ffmpeg::{build_stream_command, describe_command, solid_color_source};
