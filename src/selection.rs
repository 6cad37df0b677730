//! Single versus double click on a playlist row.
//!
//! A single click selects a track, a double click selects and plays it.
//! Both start with the same first click, so the decision is deferred: the
//! first click arms one pending selection that fires once the click window
//! has passed, unless a second click arrives first and turns it into a
//! play. There is exactly one pending slot for the whole playlist.
//!
//! The disambiguator never reads the time itself. Callers pass `now`,
//! usually from a [`Clock`], so tests can move time by hand.

use std::{
    fmt,
    time::{Duration, Instant},
};

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// The system's monotonic clock.
#[derive(Copy, Clone, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// What a click resolved into.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ClickAction {
    Select(usize),
    Play(usize),
}

impl fmt::Display for ClickAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClickAction::Select(index) => write!(f, "select track {index}"),
            ClickAction::Play(index) => write!(f, "play track {index}"),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
enum Pending {
    #[default]
    Idle,
    Armed { index: usize, deadline: Instant },
}

#[derive(Clone, Debug)]
pub struct ClickDisambiguator {
    window: Duration,
    pending: Pending,
}

impl ClickDisambiguator {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: Pending::Idle,
        }
    }

    /// When the pending selection fires, if one is armed.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        match self.pending {
            Pending::Idle => None,
            Pending::Armed { deadline, .. } => Some(deadline),
        }
    }

    /// Registers a click on row `index` at `now`.
    ///
    /// Returns `Some(Play)` when this click completes a double click. Any
    /// row counts as the second click; the index played is the one clicked
    /// last. Otherwise the click arms a pending selection and `None` is
    /// returned. An expired selection must be collected with
    /// [`poll`](Self::poll) before calling this, or it is lost.
    pub fn click(&mut self, index: usize, now: Instant) -> Option<ClickAction> {
        match self.pending {
            Pending::Armed { deadline, .. } if now < deadline => {
                self.pending = Pending::Idle;
                Some(ClickAction::Play(index))
            }
            _ => {
                self.pending = Pending::Armed {
                    index,
                    deadline: now + self.window,
                };
                None
            }
        }
    }

    /// Fires the pending selection if its deadline has passed.
    pub fn poll(&mut self, now: Instant) -> Option<ClickAction> {
        match self.pending {
            Pending::Armed { index, deadline } if now >= deadline => {
                self.pending = Pending::Idle;
                Some(ClickAction::Select(index))
            }
            _ => None,
        }
    }

    /// Drops any pending selection.
    pub fn reset(&mut self) {
        self.pending = Pending::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(250);

    #[test]
    fn single_click_selects_after_window() {
        let mut clicks = ClickDisambiguator::new(WINDOW);
        let start = Instant::now();

        assert_eq!(clicks.click(2, start), None);
        assert_eq!(clicks.poll(start + Duration::from_millis(249)), None);
        assert_eq!(
            clicks.poll(start + WINDOW),
            Some(ClickAction::Select(2))
        );
        assert_eq!(clicks.poll(start + WINDOW * 2), None);
        assert_eq!(clicks.deadline(), None);
    }

    #[test]
    fn double_click_plays_and_cancels_select() {
        let mut clicks = ClickDisambiguator::new(WINDOW);
        let start = Instant::now();

        clicks.click(1, start);
        assert_eq!(
            clicks.click(1, start + Duration::from_millis(100)),
            Some(ClickAction::Play(1))
        );
        assert_eq!(clicks.poll(start + WINDOW * 4), None);
    }

    #[test]
    fn second_click_on_another_row_plays_that_row() {
        let mut clicks = ClickDisambiguator::new(WINDOW);
        let start = Instant::now();

        clicks.click(0, start);
        assert_eq!(
            clicks.click(3, start + Duration::from_millis(10)),
            Some(ClickAction::Play(3))
        );
    }

    #[test]
    fn slow_second_click_arms_a_new_select() {
        let mut clicks = ClickDisambiguator::new(WINDOW);
        let start = Instant::now();

        clicks.click(0, start);
        assert_eq!(clicks.click(1, start + WINDOW), None);
        assert_eq!(clicks.deadline(), Some(start + WINDOW * 2));
        assert_eq!(
            clicks.poll(start + WINDOW * 2),
            Some(ClickAction::Select(1))
        );
    }
}
