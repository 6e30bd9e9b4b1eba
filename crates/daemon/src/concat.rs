//! Concat list writer for the ffmpeg concat demuxer.
//!
//! Each track becomes one `file '<path>'` line. Inside single quotes the
//! demuxer takes every byte literally, so an embedded quote has to close the
//! quoted run, appear backslash-escaped, and reopen it: `'` -> `'\''`.

use crate::playlist::Playlist;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while persisting a playlist.
#[derive(Debug, Error)]
pub enum ConcatError {
    /// A path cannot be expressed in the line-oriented concat format.
    #[error("Path cannot be written to a concat list: {}", .0.display())]
    UnsupportedPath(PathBuf),

    /// Writing or renaming the list failed.
    #[error("Failed to write playlist file: {0}")]
    Io(#[from] io::Error),
}

/// Whether `path` survives a trip through a concat list: valid UTF-8 and
/// free of line breaks.
pub fn is_representable(path: &Path) -> bool {
    match path.to_str() {
        Some(s) => !s.contains('\n') && !s.contains('\r'),
        None => false,
    }
}

/// Quote a path for a concat list entry.
pub fn escape_concat_path(path: &str) -> String {
    format!("'{}'", path.replace('\'', r"'\''"))
}

/// Render the whole list, one `file` directive per track, newline-terminated.
pub fn render_concat(playlist: &Playlist) -> Result<String, ConcatError> {
    let mut out = String::new();
    for track in playlist.tracks() {
        let path = match track.path().to_str() {
            Some(path) if is_representable(track.path()) => path,
            _ => return Err(ConcatError::UnsupportedPath(track.path().to_path_buf())),
        };
        out.push_str("file ");
        out.push_str(&escape_concat_path(path));
        out.push('\n');
    }
    Ok(out)
}

/// Sibling temp path used while writing `path`.
fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "playlist".to_string());
    path.with_file_name(format!(".{}.tmp-{}", name, std::process::id()))
}

/// Write `playlist` to `path`, replacing any previous list.
///
/// The content goes to a sibling temp file which is synced and then renamed
/// over `path`, so a reader only ever sees a complete list.
pub fn write_playlist_file(playlist: &Playlist, path: &Path) -> Result<(), ConcatError> {
    let content = render_concat(playlist)?;
    let temp = temp_path_for(path);

    let result = (|| -> io::Result<()> {
        let mut file = File::create(&temp)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp, path)
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&temp);
        return Err(ConcatError::Io(e));
    }

    tracing::debug!(path = %path.display(), tracks = playlist.len(), "Wrote playlist file");
    Ok(())
}

/// Best-effort removal; a leftover list is never fatal.
pub fn remove_playlist_file(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "Removed playlist file"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove playlist file")
        }
    }
}
