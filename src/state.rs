//! Player state: the single source of truth the UI reads from.
//!
//! [`PlayerState`] is plain data. It clamps what it stores but never talks
//! to the network or the playback engine; the [`Player`](crate::player::Player)
//! is the only component that mutates it.

use std::{fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use serde_with::{DeserializeFromStr, SerializeDisplay};

use crate::error::Error;

/// A percentage in the range `0..=100`.
///
/// Stored as a ratio internally. Constructors clamp, so a `Percentage` is
/// always valid once built. NaN becomes zero.
#[derive(Copy, Clone, Debug, Default, Serialize, Deserialize, PartialEq, PartialOrd)]
pub struct Percentage(f64);

impl Percentage {
    pub const ZERO: Self = Self(0.0);
    pub const FULL: Self = Self(1.0);

    #[must_use]
    pub fn from_ratio(ratio: f64) -> Self {
        if ratio.is_nan() {
            Self::ZERO
        } else {
            Self(ratio.clamp(0.0, 1.0))
        }
    }

    #[must_use]
    pub fn from_percent(percent: f64) -> Self {
        Self::from_ratio(percent / 100.0)
    }

    /// Ratio of `part` over `whole`, zero when `whole` is zero.
    #[must_use]
    #[expect(clippy::cast_precision_loss)]
    pub fn from_fraction(part: u64, whole: u64) -> Self {
        if whole == 0 {
            Self::ZERO
        } else {
            // `f64` not for precision, but to fit big file sizes.
            Self::from_ratio(part as f64 / whole as f64)
        }
    }

    #[must_use]
    pub fn as_ratio(&self) -> f64 {
        self.0
    }

    #[must_use]
    pub fn as_percent(&self) -> f64 {
        self.0 * 100.0
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.0 >= 1.0
    }
}

impl fmt::Display for Percentage {
    /// Formats a `Percentage` for display with a `%` sign.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}%", self.as_percent())
    }
}

/// What happens when a track plays to its end.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Hash, SerializeDisplay, DeserializeFromStr,
)]
pub enum LoopMode {
    /// Advance to the next track, stop after the last one.
    #[default]
    None,
    /// Restart the same track.
    One,
    /// Advance, wrapping from the last track to the first.
    All,
}

impl fmt::Display for LoopMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopMode::None => write!(f, "none"),
            LoopMode::One => write!(f, "one"),
            LoopMode::All => write!(f, "all"),
        }
    }
}

/// Parses "none", "one" or "all", case-insensitively.
impl FromStr for LoopMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "off" => Ok(LoopMode::None),
            "one" | "track" => Ok(LoopMode::One),
            "all" | "playlist" => Ok(LoopMode::All),
            _ => Err(Error::invalid_argument(format!(
                "{s} is not a valid loop mode"
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PlayerState {
    current_track: usize,
    is_playing: bool,
    is_loading: bool,
    volume: f32,
    loop_mode: LoopMode,
    current_time: Duration,
    duration: Option<Duration>,
    buffered: Percentage,

    /// Last playback failure, kept until the next successful start or an
    /// explicit retry.
    error: Option<String>,
}

impl Default for PlayerState {
    fn default() -> Self {
        Self {
            current_track: 0,
            is_playing: false,
            is_loading: false,
            volume: 1.0,
            loop_mode: LoopMode::default(),
            current_time: Duration::ZERO,
            duration: None,
            buffered: Percentage::ZERO,
            error: None,
        }
    }
}

impl PlayerState {
    #[must_use]
    pub fn new(volume: f32, loop_mode: LoopMode) -> Self {
        let mut state = Self {
            loop_mode,
            ..Self::default()
        };
        state.set_volume(volume);
        state
    }

    #[must_use]
    pub fn current_track(&self) -> usize {
        self.current_track
    }

    #[must_use]
    pub fn is_playing(&self) -> bool {
        self.is_playing
    }

    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.is_loading
    }

    #[must_use]
    pub fn volume(&self) -> f32 {
        self.volume
    }

    #[must_use]
    pub fn loop_mode(&self) -> LoopMode {
        self.loop_mode
    }

    #[must_use]
    pub fn current_time(&self) -> Duration {
        self.current_time
    }

    /// Total duration of the current track, once the engine reported it.
    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    #[must_use]
    pub fn buffered(&self) -> Percentage {
        self.buffered
    }

    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Playback position as a percentage of the duration.
    #[must_use]
    pub fn progress(&self) -> Percentage {
        match self.duration {
            Some(duration) if !duration.is_zero() => {
                Percentage::from_ratio(self.current_time.as_secs_f64() / duration.as_secs_f64())
            }
            _ => Percentage::ZERO,
        }
    }

    pub(crate) fn set_current_track(&mut self, index: usize) {
        self.current_track = index;
    }

    pub(crate) fn set_playing(&mut self, playing: bool) {
        self.is_playing = playing;
    }

    pub(crate) fn set_loading(&mut self, loading: bool) {
        self.is_loading = loading;
    }

    /// Sets the volume, clamped to `0.0..=1.0`. NaN is ignored.
    pub(crate) fn set_volume(&mut self, volume: f32) {
        if !volume.is_nan() {
            self.volume = volume.clamp(0.0, 1.0);
        }
    }

    pub(crate) fn set_loop_mode(&mut self, loop_mode: LoopMode) {
        self.loop_mode = loop_mode;
    }

    /// Sets the playback position, clamped to the duration when known.
    pub(crate) fn set_current_time(&mut self, time: Duration) {
        self.current_time = match self.duration {
            Some(duration) => time.min(duration),
            None => time,
        };
    }

    pub(crate) fn set_duration(&mut self, duration: Duration) {
        self.duration = Some(duration);
        self.current_time = self.current_time.min(duration);
    }

    pub(crate) fn set_buffered(&mut self, buffered: Percentage) {
        self.buffered = buffered;
    }

    pub(crate) fn set_error(&mut self, error: Option<String>) {
        self.error = error;
    }

    /// Forgets everything about the previously loaded track.
    pub(crate) fn clear_timing(&mut self) {
        self.current_time = Duration::ZERO;
        self.duration = None;
        self.buffered = Percentage::ZERO;
    }
}
