//! The playback engine seam.
//!
//! The [`Player`](crate::player::Player) drives exactly one [`Engine`]
//! through plain method calls. The engine answers asynchronously through
//! [`EngineEvent`]s sent on a channel the caller owns, which keeps the
//! player's state updates ordered and testable without audio hardware.
//!
//! Every event is tagged with the [`Generation`] of the load that produced
//! it. The player bumps the generation whenever it switches tracks, so a
//! late answer to a request for a track that is no longer current can be
//! recognized and dropped.
//!
//! # Submodules
//!
//! * [`rodio`] - engine playing through the default audio output device

pub mod rodio;

use std::{fmt, ops::Range, time::Duration};

use url::Url;

use crate::{error::Result, resources::Locator};

/// Counter identifying one load of the engine.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Generation(u64);

impl Generation {
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where the engine reads a track from.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Source {
    /// Streamed from the canonical network location.
    Network(Url),
    /// Read from a prefetched in-memory resource.
    Resource(Locator),
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Network(url) => write!(f, "{url}"),
            Source::Resource(locator) => write!(f, "{locator}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct EngineEvent {
    pub generation: Generation,
    pub kind: EngineEventKind,
}

impl EngineEvent {
    #[must_use]
    pub fn new(generation: Generation, kind: EngineEventKind) -> Self {
        Self { generation, kind }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum EngineEventKind {
    /// A play request was honored and audio is running.
    Started,
    /// A play request was rejected: not ready, undecodable, no device.
    StartFailed(String),
    /// The total duration became known.
    DurationChanged(Duration),
    /// The play cursor moved.
    TimeUpdate(Duration),
    /// Playback stalled waiting for data.
    Waiting,
    /// Enough data arrived to resume.
    CanPlay,
    /// Contiguous readable time ranges of the loaded source.
    Buffered(Vec<Range<Duration>>),
    /// The track played to its natural end.
    Ended,
}

impl fmt::Display for EngineEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Started => write!(f, "started"),
            Self::StartFailed(e) => write!(f, "start failed: {e}"),
            Self::DurationChanged(duration) => write!(f, "duration {:.1}s", duration.as_secs_f32()),
            Self::TimeUpdate(time) => write!(f, "time {:.1}s", time.as_secs_f32()),
            Self::Waiting => write!(f, "waiting"),
            Self::CanPlay => write!(f, "can play"),
            Self::Buffered(ranges) => write!(f, "{} buffered ranges", ranges.len()),
            Self::Ended => write!(f, "ended"),
        }
    }
}

/// A single-owner handle over the playback engine.
///
/// All methods return quickly. Anything that takes time, like opening a
/// stream, is reported later through [`EngineEvent`]s carrying the
/// generation passed to the most recent [`load`](Engine::load).
pub trait Engine {
    /// Replaces whatever is loaded with `source`, paused at the start.
    /// Pending play requests for the previous source are abandoned.
    ///
    /// # Errors
    ///
    /// Returns an error if the source cannot be resolved, such as a
    /// revoked resource.
    fn load(&mut self, source: Source, generation: Generation) -> Result<()>;

    /// The source currently loaded, if any.
    fn source(&self) -> Option<&Source>;

    /// Requests playback. The outcome arrives as
    /// [`Started`](EngineEventKind::Started) or
    /// [`StartFailed`](EngineEventKind::StartFailed).
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot even be issued, for example
    /// when nothing is loaded.
    fn play(&mut self) -> Result<()>;

    fn pause(&mut self);

    /// Stops playback and unloads the source.
    fn stop(&mut self);

    /// Moves the play cursor.
    ///
    /// # Errors
    ///
    /// Returns an error if the source does not support seeking there.
    fn seek(&mut self, position: Duration) -> Result<()>;

    /// Sets the output volume, `0.0..=1.0`.
    fn set_volume(&mut self, volume: f32);

    /// Gives the engine a chance to report progress. Engines that report
    /// on their own need not implement this.
    fn tick(&mut self) {}
}
