//! Tracks and the fixed playlist they live in.
//!
//! A [`Playlist`] is an ordered, non-empty list of [`Track`]s addressed by
//! index. It is supplied once by the host and never changes afterwards.
//!
//! Playlists can be read from TOML:
//!
//! ```toml
//! [[track]]
//! title = "Opening"
//! filename = "01-opening.mp3"
//!
//! [[track]]
//! title = "Finale"
//! filename = "02-finale.flac"
//! ```

use std::{fmt, fs, ops::Index, path::Path};

use serde::Deserialize;
use url::Url;

use crate::error::{Error, Result};

/// An addressable audio item.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Hash)]
pub struct Track {
    pub title: String,
    pub filename: String,
}

impl Track {
    #[must_use]
    pub fn new(title: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            filename: filename.into(),
        }
    }

    /// The canonical network location of this track below `base`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the filename cannot be joined onto the
    /// base URL.
    pub fn url(&self, base: &Url) -> Result<Url> {
        base.join(&self.filename).map_err(Into::into)
    }
}

impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "\"{}\" ({})", self.title, self.filename)
    }
}

#[derive(Deserialize)]
struct PlaylistFile {
    #[serde(rename = "track", default)]
    tracks: Vec<Track>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Playlist {
    tracks: Vec<Track>,
}

impl Playlist {
    /// Builds a playlist from its tracks.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an empty list.
    pub fn new(tracks: Vec<Track>) -> Result<Self> {
        if tracks.is_empty() {
            return Err(Error::invalid_argument("playlist has no tracks"));
        }
        Ok(Self { tracks })
    }

    /// Parses a playlist from TOML text.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for malformed TOML, tracks with an empty
    /// filename, or an empty list.
    pub fn from_toml(text: &str) -> Result<Self> {
        let file: PlaylistFile = toml::from_str(text)?;
        if let Some(track) = file.tracks.iter().find(|track| track.filename.is_empty()) {
            return Err(Error::invalid_argument(format!(
                "track \"{}\" has no filename",
                track.title
            )));
        }
        Self::new(file.tracks)
    }

    /// Reads a playlist from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Track> {
        self.tracks.get(index)
    }

    /// Returns the track at `index`.
    ///
    /// # Errors
    ///
    /// Returns `OutOfRange` if `index` is past the end.
    pub fn try_get(&self, index: usize) -> Result<&Track> {
        self.get(index).ok_or_else(|| {
            Error::out_of_range(format!(
                "track {index} out of range for playlist of {}",
                self.len()
            ))
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    /// Always false: playlists cannot be empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    #[must_use]
    pub fn last_index(&self) -> usize {
        self.len() - 1
    }

    pub fn iter(&self) -> impl Iterator<Item = &Track> {
        self.tracks.iter()
    }
}

impl Index<usize> for Playlist {
    type Output = Track;

    /// # Panics
    ///
    /// Panics if `index` is out of range, like slice indexing.
    fn index(&self, index: usize) -> &Track {
        &self.tracks[index]
    }
}
