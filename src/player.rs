//! The transport controller.
//!
//! [`Player`] owns the playlist position, the engine handle and the
//! [`PlayerState`] the UI reads. It turns user commands (select, play,
//! pause, seek) into engine calls, and engine and prefetch events back into
//! state.
//!
//! # Stale requests
//!
//! Commands and engine events are not synchronized: a user can pick
//! another track while the engine is still opening the previous one. Each
//! load therefore gets a fresh [`Generation`], and events carrying an older
//! one are dropped. A late "started" for a track that is no longer current
//! cannot flip the player into playing, and a late time update cannot move
//! the cursor of the new track.
//!
//! # End of track
//!
//! | loop mode | not last track | last track |
//! | --------- | -------------- | ---------- |
//! | `none`    | next track     | stop       |
//! | `one`     | same track     | same track |
//! | `all`     | next track     | first track |

use std::{ops::Range, sync::Arc, time::Duration, time::Instant};

use tokio::{sync::mpsc, task::JoinHandle};
use url::Url;

use crate::{
    config::Config,
    engine::{Engine, EngineEvent, EngineEventKind, Generation, Source},
    error::{Error, Result},
    events::Event,
    prefetch::{PrefetchEvent, PrefetchManager},
    resources::Locator,
    selection::{ClickAction, ClickDisambiguator, Clock, SystemClock},
    state::{LoopMode, Percentage, PlayerState},
    track::{Playlist, Track},
};

pub struct Player<E: Engine> {
    playlist: Playlist,
    base_url: Url,
    engine: E,
    prefetch: PrefetchManager,
    state: PlayerState,

    /// Generation of the most recent load.
    generation: Generation,

    /// Set while a play request for `generation` awaits its outcome.
    pending_start: Option<Generation>,

    clicks: ClickDisambiguator,
    clock: Arc<dyn Clock>,

    prefetch_ahead: usize,
    events: Option<mpsc::UnboundedSender<Event>>,
}

impl<E: Engine> Player<E> {
    pub fn new(config: &Config, playlist: Playlist, mut engine: E, prefetch: PrefetchManager) -> Self {
        let state = PlayerState::new(config.volume, config.loop_mode);
        engine.set_volume(state.volume());

        Self {
            playlist,
            base_url: config.base_url.clone(),
            engine,
            prefetch,
            state,
            generation: Generation::default(),
            pending_start: None,
            clicks: ClickDisambiguator::new(config.click_window),
            clock: Arc::new(SystemClock),
            prefetch_ahead: config.prefetch_ahead,
            events: None,
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_events(mut self, events: mpsc::UnboundedSender<Event>) -> Self {
        self.events = Some(events);
        self
    }

    #[must_use]
    pub fn state(&self) -> &PlayerState {
        &self.state
    }

    #[must_use]
    pub fn playlist(&self) -> &Playlist {
        &self.playlist
    }

    #[must_use]
    pub fn prefetcher(&self) -> &PrefetchManager {
        &self.prefetch
    }

    #[must_use]
    pub fn engine(&self) -> &E {
        &self.engine
    }

    #[must_use]
    pub fn current(&self) -> &Track {
        // The index is validated on every change.
        &self.playlist[self.state.current_track()]
    }

    fn emit(&self, event: Event) {
        if let Some(events) = &self.events {
            // Nobody listening is fine.
            let _ = events.send(event);
        }
    }

    fn validate(&self, index: usize) -> Result<()> {
        self.playlist.try_get(index).map(|_| ())
    }

    /// Abandons whatever the engine was doing for the previous track.
    fn invalidate(&mut self) {
        self.generation = self.generation.next();
        self.pending_start = None;
        self.engine.stop();
        self.state.set_loading(false);
        self.state.clear_timing();
    }

    fn change_track(&mut self, index: usize) {
        self.invalidate();
        if self.state.current_track() != index {
            self.state.set_current_track(index);
            self.state.set_error(None);
            self.emit(Event::TrackChanged { index });
        }
    }

    /// Makes `index` the current track without starting playback.
    ///
    /// # Errors
    ///
    /// Returns `OutOfRange` and leaves the state untouched if `index` is
    /// not in the playlist.
    pub fn select_track(&mut self, index: usize) -> Result<()> {
        self.validate(index)?;
        debug!("selecting track {index}");

        let was_playing = self.state.is_playing();
        self.change_track(index);
        self.state.set_playing(false);
        if was_playing {
            self.emit(Event::Pause);
        }

        Ok(())
    }

    /// The source to play `index` from: its prefetched resource when the
    /// download is done, the network otherwise.
    fn preferred_source(&self, index: usize) -> Result<Source> {
        if let Some(locator) = self.prefetch.locator(index) {
            return Ok(Source::Resource(locator));
        }
        let url = self.playlist.try_get(index)?.url(&self.base_url)?;
        Ok(Source::Network(url))
    }

    /// Whether the engine already holds some source for `index`, so that
    /// pause and resume never restart a track.
    fn is_loaded(&self, index: usize) -> bool {
        if index != self.state.current_track() {
            return false;
        }

        match self.engine.source() {
            Some(Source::Network(url)) => self
                .playlist
                .get(index)
                .and_then(|track| track.url(&self.base_url).ok())
                .is_some_and(|expected| expected == *url),
            Some(Source::Resource(locator)) => self.owns_resource(index, locator),
            None => false,
        }
    }

    fn owns_resource(&self, index: usize, locator: &Locator) -> bool {
        self.prefetch.locator(index).as_ref() == Some(locator)
    }

    /// Starts playing `index`, or the current track for `None`.
    ///
    /// Start failures are not returned here: they arrive later through the
    /// engine and end up in [`PlayerState::error`].
    ///
    /// # Errors
    ///
    /// Returns `OutOfRange` and leaves the state untouched if `index` is
    /// not in the playlist.
    pub fn play_track(&mut self, index: Option<usize>) -> Result<()> {
        let index = index.unwrap_or_else(|| self.state.current_track());
        self.validate(index)?;

        if !self.is_loaded(index) {
            self.change_track(index);

            let source = self.preferred_source(index)?;
            debug!("loading track {index} from {source}");
            if let Err(e) = self.engine.load(source, self.generation) {
                self.fail_start(e.to_string());
                return Ok(());
            }
        }

        self.request_start();
        Ok(())
    }

    fn request_start(&mut self) {
        self.state.set_loading(true);
        self.pending_start = Some(self.generation);
        self.emit(Event::Loading);

        if let Err(e) = self.engine.play() {
            self.fail_start(e.to_string());
        }
    }

    fn fail_start(&mut self, reason: String) {
        let index = self.state.current_track();
        error!("failed to start track {index}: {reason}");

        self.pending_start = None;
        self.state.set_loading(false);
        self.state.set_playing(false);
        self.state.set_error(Some(reason));
        self.emit(Event::Failed { index });
    }

    /// Pauses when playing, plays the current track otherwise.
    pub fn toggle_play(&mut self) -> Result<()> {
        if self.state.is_playing() || self.pending_start.is_some() {
            self.pause();
            Ok(())
        } else {
            self.play_track(None)
        }
    }

    pub fn pause(&mut self) {
        self.engine.pause();
        self.pending_start = None;
        self.state.set_loading(false);
        if self.state.is_playing() {
            self.state.set_playing(false);
            self.emit(Event::Pause);
        }
    }

    /// Plays the next track, wrapping around when looping over the whole
    /// playlist. Returns whether there was a next track.
    ///
    /// # Errors
    ///
    /// Never fails for a valid playlist; see [`play_track`](Self::play_track).
    pub fn next(&mut self) -> Result<bool> {
        let current = self.state.current_track();
        let next = if current < self.playlist.last_index() {
            current + 1
        } else if self.state.loop_mode() == LoopMode::All {
            0
        } else {
            return Ok(false);
        };
        self.skip_to(next)?;
        Ok(true)
    }

    /// Plays the previous track, wrapping around when looping over the
    /// whole playlist. Returns whether there was a previous track.
    ///
    /// # Errors
    ///
    /// Never fails for a valid playlist; see [`play_track`](Self::play_track).
    pub fn previous(&mut self) -> Result<bool> {
        let current = self.state.current_track();
        let previous = if current > 0 {
            current - 1
        } else if self.state.loop_mode() == LoopMode::All {
            self.playlist.last_index()
        } else {
            return Ok(false);
        };
        self.skip_to(previous)?;
        Ok(true)
    }

    fn skip_to(&mut self, index: usize) -> Result<()> {
        if self.state.is_playing() || self.pending_start.is_some() {
            self.play_track(Some(index))
        } else {
            self.select_track(index)
        }
    }

    /// Seeks to `percent` of the track's duration.
    ///
    /// Values outside `0..=100` are clamped. Before the duration is known
    /// there is nothing to seek in, and the call does nothing.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for NaN, or the engine's error if it
    /// cannot seek.
    pub fn seek(&mut self, percent: f64) -> Result<()> {
        if percent.is_nan() {
            return Err(Error::invalid_argument("cannot seek to NaN"));
        }

        let Some(duration) = self.state.duration() else {
            debug!("ignoring seek before duration is known");
            return Ok(());
        };

        let position = duration.mul_f64(Percentage::from_percent(percent).as_ratio());
        debug!("seeking to {:.1}s", position.as_secs_f32());

        if let Err(e) = self.engine.seek(position) {
            warn!("seeking to {:.1}s failed: {e}", position.as_secs_f32());
            return Err(e);
        }
        self.state.set_current_time(position);

        Ok(())
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.state.set_volume(volume);
        self.engine.set_volume(self.state.volume());
    }

    pub fn set_loop(&mut self, loop_mode: LoopMode) {
        debug!("setting loop mode to {loop_mode}");
        self.state.set_loop_mode(loop_mode);
    }

    /// Clears a recorded failure and tries the current track again,
    /// restarting its prefetch if that failed too.
    ///
    /// # Errors
    ///
    /// See [`play_track`](Self::play_track).
    pub fn retry(&mut self) -> Result<()> {
        let index = self.state.current_track();
        self.state.set_error(None);

        if self
            .prefetch
            .state(index)
            .is_some_and(|state| state.failure().is_some())
        {
            info!("retrying prefetch of track {index}");
            drop(self.prefetch.spawn(index));
        }

        // Force a fresh load: the previous attempt may have left the
        // engine with a source it cannot play.
        self.invalidate();
        self.play_track(None)
    }

    /// Starts prefetching `index` in the background.
    ///
    /// # Errors
    ///
    /// Returns `OutOfRange` if `index` is not in the playlist.
    pub fn prefetch_track(&self, index: usize) -> Result<JoinHandle<Result<Locator>>> {
        self.validate(index)?;
        Ok(self.prefetch.spawn(index))
    }

    fn prefetch_upcoming(&self) {
        let current = self.state.current_track();
        let len = self.playlist.len();
        let wrap = self.state.loop_mode() == LoopMode::All;

        for offset in 1..=self.prefetch_ahead.min(len - 1) {
            let index = current + offset;
            let index = if index < len {
                index
            } else if wrap {
                index - len
            } else {
                break;
            };

            if self.prefetch.state(index).is_none() {
                trace!("prefetching upcoming track {index}");
                drop(self.prefetch.spawn(index));
            }
        }
    }

    /// Handles a click on playlist row `index`.
    ///
    /// # Errors
    ///
    /// Returns `OutOfRange` if `index` is not in the playlist.
    pub fn handle_track_click(&mut self, index: usize) -> Result<()> {
        self.validate(index)?;

        let now = self.clock.now();
        self.poll_clicks_at(now)?;
        match self.clicks.click(index, now) {
            Some(action) => self.apply_click(action),
            None => Ok(()),
        }
    }

    /// When a pending single click fires, for scheduling
    /// [`poll_clicks`](Self::poll_clicks).
    #[must_use]
    pub fn click_deadline(&self) -> Option<Instant> {
        self.clicks.deadline()
    }

    /// Fires a pending single click whose window has passed.
    ///
    /// # Errors
    ///
    /// See [`select_track`](Self::select_track).
    pub fn poll_clicks(&mut self) -> Result<()> {
        let now = self.clock.now();
        self.poll_clicks_at(now)
    }

    fn poll_clicks_at(&mut self, now: Instant) -> Result<()> {
        match self.clicks.poll(now) {
            Some(action) => self.apply_click(action),
            None => Ok(()),
        }
    }

    fn apply_click(&mut self, action: ClickAction) -> Result<()> {
        debug!("click: {action}");
        match action {
            ClickAction::Select(index) => self.select_track(index),
            ClickAction::Play(index) => self.play_track(Some(index)),
        }
    }

    /// Lets the engine report progress and fires an expired click.
    ///
    /// # Errors
    ///
    /// See [`poll_clicks`](Self::poll_clicks).
    pub fn tick(&mut self) -> Result<()> {
        self.engine.tick();
        self.poll_clicks()
    }

    /// Folds an engine event into the player state.
    pub fn handle_engine_event(&mut self, event: EngineEvent) {
        if event.generation != self.generation {
            trace!(
                "dropping stale engine event from {} (now {}): {}",
                event.generation,
                self.generation,
                event.kind
            );
            return;
        }

        match event.kind {
            EngineEventKind::Started => self.on_started(),
            EngineEventKind::StartFailed(reason) => {
                if self.pending_start.is_some() {
                    self.fail_start(reason);
                } else {
                    debug!("start failed after request was withdrawn: {reason}");
                }
            }
            EngineEventKind::DurationChanged(duration) => {
                trace!("duration: {:.1}s", duration.as_secs_f32());
                self.state.set_duration(duration);
            }
            EngineEventKind::TimeUpdate(time) => self.state.set_current_time(time),
            EngineEventKind::Waiting => {
                self.state.set_loading(true);
                self.emit(Event::Loading);
            }
            EngineEventKind::CanPlay => {
                if self.pending_start.is_none() {
                    self.state.set_loading(false);
                }
            }
            EngineEventKind::Buffered(ranges) => self.update_buffered(&ranges),
            EngineEventKind::Ended => self.on_ended(),
        }
    }

    fn on_started(&mut self) {
        if self.pending_start.take().is_none() {
            // Paused while the engine was still starting.
            debug!("engine started without a pending request, pausing");
            self.engine.pause();
            return;
        }

        self.state.set_loading(false);
        self.state.set_error(None);
        if !self.state.is_playing() {
            self.state.set_playing(true);
            self.emit(Event::Play);
        }

        if self.prefetch.locator(self.state.current_track()).is_some() {
            self.state.set_buffered(Percentage::FULL);
        }
        self.prefetch_upcoming();
    }

    fn update_buffered(&mut self, ranges: &[Range<Duration>]) {
        let Some(duration) = self.state.duration().filter(|d| !d.is_zero()) else {
            return;
        };
        if self.state.buffered().is_full()
            && self.prefetch.locator(self.state.current_track()).is_some()
        {
            return;
        }

        let cursor = self.state.current_time();
        let distance = |range: &&Range<Duration>| {
            if range.contains(&cursor) || range.end == cursor {
                Duration::ZERO
            } else if cursor < range.start {
                range.start - cursor
            } else {
                cursor - range.end
            }
        };

        let buffered = ranges
            .iter()
            .min_by_key(distance)
            .map_or(Percentage::ZERO, |range| {
                Percentage::from_ratio(range.end.as_secs_f64() / duration.as_secs_f64())
            });
        self.state.set_buffered(buffered);
    }

    fn on_ended(&mut self) {
        let current = self.state.current_track();
        let next = match self.state.loop_mode() {
            LoopMode::One => Some(current),
            LoopMode::All if current == self.playlist.last_index() => Some(0),
            _ if current < self.playlist.last_index() => Some(current + 1),
            _ => None,
        };

        let Some(next) = next else {
            debug!("end of playlist");
            // The finished source cannot be started again; playing the
            // track later loads it afresh.
            self.engine.stop();
            self.pending_start = None;
            self.state.set_loading(false);
            self.state.set_playing(false);
            self.emit(Event::Stopped);
            return;
        };

        debug!("track {current} ended, continuing with track {next}");

        // Restarting the same track needs a fresh load too: the engine has
        // already released the finished one.
        if next == current {
            self.invalidate();
            match self.preferred_source(next) {
                Ok(source) => {
                    if let Err(e) = self.engine.load(source, self.generation) {
                        self.fail_start(e.to_string());
                        return;
                    }
                    self.request_start();
                }
                Err(e) => self.fail_start(e.to_string()),
            }
        } else if let Err(e) = self.play_track(Some(next)) {
            self.fail_start(e.to_string());
        }
    }

    /// Folds a prefetch event into the player state.
    pub fn handle_prefetch_event(&mut self, event: PrefetchEvent) {
        match event {
            PrefetchEvent::Completed { index, .. } => {
                if index == self.state.current_track() {
                    trace!("current track {index} fully prefetched");
                    self.state.set_buffered(Percentage::FULL);
                }
            }
            PrefetchEvent::Progress { index, progress } => {
                trace!("track {index} prefetched {progress}");
            }
            PrefetchEvent::Failed { index, error } => {
                warn!("track {index} will be streamed: {error}");
            }
        }
    }

    /// Stops the engine, cancels running prefetches and revokes every
    /// completed resource. Returns the revoked track indices.
    pub fn teardown(mut self) -> Vec<usize> {
        self.engine.stop();
        self.clicks.reset();
        let revoked = self.prefetch.teardown();
        info!("released {} prefetched tracks", revoked.len());
        revoked
    }
}
