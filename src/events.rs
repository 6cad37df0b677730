//! Notifications emitted by the player for UI collaborators.
//!
//! These are coarse state changes a UI reacts to, such as redrawing the
//! play button or highlighting another row. Fine-grained values like the
//! play position are read from [`PlayerState`](crate::state::PlayerState)
//! instead.
//!
//! # Example
//!
//! ```rust
//! use tapedeck::events::Event;
//!
//! fn handle_event(event: Event) {
//!     match event {
//!         Event::Play => println!("Playback started"),
//!         Event::TrackChanged { index } => println!("Now on track {index}"),
//!         _ => {}
//!     }
//! }
//! ```

use std::fmt;

/// Events that can be emitted by the player.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Event {
    /// Playback has started, either fresh or resumed.
    Play,

    /// Playback has paused and can be resumed from the current position.
    Pause,

    /// Playback stopped at the end of the playlist.
    Stopped,

    /// The current track changed, through selection or auto-advance.
    TrackChanged { index: usize },

    /// The player is waiting for the engine: starting or stalled.
    Loading,

    /// Starting playback of a track failed. The reason is kept in
    /// [`PlayerState::error`](crate::state::PlayerState::error).
    Failed { index: usize },
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Play => write!(f, "play"),
            Event::Pause => write!(f, "pause"),
            Event::Stopped => write!(f, "stopped"),
            Event::TrackChanged { index } => write!(f, "track changed to {index}"),
            Event::Loading => write!(f, "loading"),
            Event::Failed { index } => write!(f, "track {index} failed"),
        }
    }
}
