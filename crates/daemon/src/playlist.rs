//! Playlist source: discovers audio tracks, filters them through the
//! validator and produces a uniformly shuffled playlist.

use crate::concat::is_representable;
use crate::validate::MediaValidator;
use rand::seq::SliceRandom;
use rand::Rng;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

/// Errors raised while building a playlist. All of them are fatal to the loop.
#[derive(Debug, Error)]
pub enum PlaylistError {
    /// The audio directory is absent.
    #[error("Audio directory '{}' not found", .0.display())]
    MissingAudioDir(PathBuf),

    /// Nothing survived validation.
    #[error("No valid audio files found in '{}'", .0.display())]
    Empty(PathBuf),

    /// Listing the directory failed.
    #[error("Failed to list audio directory: {0}")]
    Io(#[from] io::Error),
}

/// Absolute path to a validated media file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Track(PathBuf);

impl Track {
    /// Wrap a path that has already been validated.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl AsRef<Path> for Track {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

/// Ordered, non-empty sequence of tracks for one session.
#[derive(Debug, Clone, PartialEq)]
pub struct Playlist {
    tracks: Vec<Track>,
    total_duration_secs: f64,
}

impl Playlist {
    /// Shuffle `tracks` with `rng` into a playlist. Returns `None` when empty.
    pub fn shuffled<R: Rng + ?Sized>(
        mut tracks: Vec<Track>,
        total_duration_secs: f64,
        rng: &mut R,
    ) -> Option<Self> {
        if tracks.is_empty() {
            return None;
        }
        // Fisher-Yates: every permutation equally likely.
        tracks.shuffle(rng);
        Some(Self {
            tracks,
            total_duration_secs,
        })
    }

    /// Build a playlist in the given order. Returns `None` when empty.
    pub fn from_tracks(tracks: Vec<Track>) -> Option<Self> {
        if tracks.is_empty() {
            None
        } else {
            Some(Self {
                tracks,
                total_duration_secs: 0.0,
            })
        }
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    /// Never true for a constructed playlist.
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Sum of probed durations in seconds (0.0 when unknown).
    pub fn total_duration_secs(&self) -> f64 {
        self.total_duration_secs
    }
}

/// Checks if a file has one of `extensions` (case-insensitive, no dot).
pub fn is_audio_file(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

/// Lists candidate audio files directly inside `dir`, sorted by path.
///
/// Subdirectories are not descended into and hidden files are skipped.
pub fn scan_audio_dir(dir: &Path, extensions: &[String]) -> Result<Vec<PathBuf>, PlaylistError> {
    if !dir.is_dir() {
        return Err(PlaylistError::MissingAudioDir(dir.to_path_buf()));
    }

    let mut candidates = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| {
            e.into_io_error()
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "directory walk failed"))
        })?;

        if !entry.file_type().is_file() && !entry.path_is_symlink() {
            continue;
        }
        let hidden = entry
            .file_name()
            .to_str()
            .map(|n| n.starts_with('.'))
            .unwrap_or(false);
        if hidden || !is_audio_file(entry.path(), extensions) {
            continue;
        }
        if !is_representable(entry.path()) {
            tracing::warn!(path = ?entry.path(), "Skipping file whose name cannot be written to a playlist");
            continue;
        }
        candidates.push(entry.into_path());
    }

    candidates.sort();
    Ok(candidates)
}

fn absolutize(path: PathBuf) -> io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path)
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

/// Enumerates, validates and shuffles the audio directory.
pub struct PlaylistSource<V> {
    audio_dir: PathBuf,
    extensions: Vec<String>,
    validator: V,
}

impl<V: MediaValidator> PlaylistSource<V> {
    pub fn new(audio_dir: PathBuf, extensions: Vec<String>, validator: V) -> Self {
        Self {
            audio_dir,
            extensions,
            validator,
        }
    }

    pub fn audio_dir(&self) -> &Path {
        &self.audio_dir
    }

    /// Every track that passes validation, in directory order.
    pub async fn valid_tracks(&self) -> Result<(Vec<Track>, f64), PlaylistError> {
        let candidates = scan_audio_dir(&self.audio_dir, &self.extensions)?;

        let mut tracks = Vec::with_capacity(candidates.len());
        let mut total_duration = 0.0;
        for candidate in candidates {
            match self.validator.probe(&candidate).await {
                Some(duration) => {
                    total_duration += duration;
                    tracks.push(Track(absolutize(candidate)?));
                }
                None => {
                    let name = candidate
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_default();
                    tracing::warn!(file = %name, "Skipping invalid audio file");
                }
            }
        }

        Ok((tracks, total_duration))
    }

    /// Build a fresh, independently shuffled playlist.
    ///
    /// # Errors
    /// * `MissingAudioDir` if the directory is absent
    /// * `Empty` if no track passes validation
    pub async fn build_playlist(&self) -> Result<Playlist, PlaylistError> {
        let (tracks, total_duration) = self.valid_tracks().await?;
        let playlist = Playlist::shuffled(tracks, total_duration, &mut rand::rng())
            .ok_or_else(|| PlaylistError::Empty(self.audio_dir.clone()))?;

        tracing::info!(
            track_count = playlist.len(),
            total_duration_secs = playlist.total_duration_secs().round() as u64,
            "Created playlist with {} tracks",
            playlist.len()
        );
        Ok(playlist)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::SizeOnlyValidator;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;
    use std::fs;
    use tempfile::TempDir;

    fn exts() -> Vec<String> {
        ["mp3", "wav", "flac", "m4a"].iter().map(|s| s.to_string()).collect()
    }

    fn track(name: &str) -> Track {
        Track(PathBuf::from(format!("/music/{}", name)))
    }

    #[test]
    fn test_is_audio_file() {
        let e = exts();
        assert!(is_audio_file(Path::new("/a/song.mp3"), &e));
        assert!(is_audio_file(Path::new("/a/song.FLAC"), &e));
        assert!(is_audio_file(Path::new("/a/song.M4a"), &e));
        assert!(!is_audio_file(Path::new("/a/cover.jpg"), &e));
        assert!(!is_audio_file(Path::new("/a/README"), &e));
    }

    #[test]
    fn test_scan_audio_dir_filters_and_sorts() {
        let temp = TempDir::new().unwrap();
        for name in ["b.mp3", "a.wav", "notes.txt", ".hidden.mp3"] {
            fs::write(temp.path().join(name), b"x").unwrap();
        }
        fs::create_dir(temp.path().join("nested")).unwrap();
        fs::write(temp.path().join("nested/c.mp3"), b"x").unwrap();

        let found = scan_audio_dir(temp.path(), &exts()).unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.wav", "b.mp3"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_scan_skips_non_utf8_names() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("ok.mp3"), b"x").unwrap();
        fs::write(temp.path().join(OsStr::from_bytes(b"caf\xE9.mp3")), b"x").unwrap();

        let found = scan_audio_dir(temp.path(), &exts()).unwrap();
        assert_eq!(found, vec![temp.path().join("ok.mp3")]);
    }

    #[test]
    fn test_scan_missing_dir() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("audio");
        assert!(matches!(
            scan_audio_dir(&missing, &exts()),
            Err(PlaylistError::MissingAudioDir(p)) if p == missing
        ));
    }

    #[test]
    fn test_playlist_rejects_empty() {
        assert!(Playlist::from_tracks(vec![]).is_none());
        assert!(Playlist::shuffled(vec![], 0.0, &mut StdRng::seed_from_u64(1)).is_none());
    }

    // Property: shuffling yields a permutation, each track exactly once.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_shuffle_is_permutation(count in 1usize..40, seed in any::<u64>()) {
            let tracks: Vec<Track> = (0..count).map(|i| track(&format!("{:03}.mp3", i))).collect();
            let mut rng = StdRng::seed_from_u64(seed);

            let playlist = Playlist::shuffled(tracks.clone(), 0.0, &mut rng).unwrap();

            prop_assert_eq!(playlist.len(), count);
            let mut sorted = playlist.tracks().to_vec();
            sorted.sort();
            prop_assert_eq!(sorted, tracks);
        }
    }

    #[test]
    fn test_shuffle_visits_every_permutation_of_three() {
        let tracks = vec![track("a.mp3"), track("b.mp3"), track("c.mp3")];
        let mut rng = StdRng::seed_from_u64(7);
        let mut seen = HashSet::new();
        for _ in 0..600 {
            let p = Playlist::shuffled(tracks.clone(), 0.0, &mut rng).unwrap();
            seen.insert(p.tracks().to_vec());
        }
        assert_eq!(seen.len(), 6);
    }

    #[tokio::test]
    async fn test_build_playlist_drops_zero_byte_file() {
        let temp = TempDir::new().unwrap();
        for name in ["one.mp3", "two.flac", "three.wav"] {
            fs::write(temp.path().join(name), b"audio").unwrap();
        }
        fs::write(temp.path().join("broken.mp3"), b"").unwrap();

        let source = PlaylistSource::new(temp.path().to_path_buf(), exts(), SizeOnlyValidator);
        let playlist = source.build_playlist().await.unwrap();

        assert_eq!(playlist.len(), 3);
        assert!(playlist.tracks().iter().all(|t| t.path().is_absolute()));
        assert!(!playlist
            .tracks()
            .iter()
            .any(|t| t.path().ends_with("broken.mp3")));
    }

    #[tokio::test]
    async fn test_build_playlist_order_varies_across_runs() {
        let temp = TempDir::new().unwrap();
        for i in 0..8 {
            fs::write(temp.path().join(format!("{}.mp3", i)), b"audio").unwrap();
        }
        let source = PlaylistSource::new(temp.path().to_path_buf(), exts(), SizeOnlyValidator);

        let first = source.build_playlist().await.unwrap();
        let mut differs = false;
        for _ in 0..20 {
            if source.build_playlist().await.unwrap().tracks() != first.tracks() {
                differs = true;
                break;
            }
        }
        assert!(differs, "21 shuffles of 8 tracks should not all be identical");
    }

    #[tokio::test]
    async fn test_build_playlist_empty_is_error() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("silent.mp3"), b"").unwrap();
        fs::write(temp.path().join("cover.png"), b"png").unwrap();

        let source = PlaylistSource::new(temp.path().to_path_buf(), exts(), SizeOnlyValidator);
        assert!(matches!(
            source.build_playlist().await,
            Err(PlaylistError::Empty(_))
        ));
    }

    #[tokio::test]
    async fn test_build_playlist_missing_dir_is_error() {
        let temp = TempDir::new().unwrap();
        let source = PlaylistSource::new(temp.path().join("nope"), exts(), SizeOnlyValidator);
        assert!(matches!(
            source.build_playlist().await,
            Err(PlaylistError::MissingAudioDir(_))
        ));
    }
}
