//! Background prefetching of tracks ahead of demand.
//!
//! The [`PrefetchManager`] downloads a track's bytes in chunks, keeps a
//! per-track [`PrefetchState`] that UIs can read or subscribe to, and
//! publishes the finished download into the [`ResourceArena`] so the
//! engine can play it without going back to the network.
//!
//! # Lifecycle
//!
//! ```text
//! unrequested ──prefetch_track──> in progress ──stream ends──> done
//!                                      │
//!                                      ├──read error──> failed
//!                                      └──cancel──────> cancelled
//! ```
//!
//! `done` is absorbing. A failed or cancelled entry keeps its partial
//! progress until someone calls [`PrefetchManager::prefetch_track`] again,
//! which starts a fresh attempt. Nothing is retried automatically.
//!
//! Every download owns a cancellation token derived from the manager's
//! shutdown token, so [`PrefetchManager::teardown`] stops all of them.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    error::{Error, Result},
    http::{Download, Fetch},
    resources::{Locator, ResourceArena},
    state::Percentage,
    track::Playlist,
};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
pub enum Phase {
    #[default]
    InProgress,
    Done,
    Failed,
    Cancelled,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::InProgress => write!(f, "in progress"),
            Phase::Done => write!(f, "done"),
            Phase::Failed => write!(f, "failed"),
            Phase::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Download state of one track.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PrefetchState {
    phase: Phase,
    progress: Percentage,
    locator: Option<Locator>,
    failure: Option<String>,
}

impl PrefetchState {
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    #[must_use]
    pub fn progress(&self) -> Percentage {
        self.progress
    }

    /// Locator of the materialized resource, once done.
    #[must_use]
    pub fn locator(&self) -> Option<&Locator> {
        self.locator.as_ref()
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    #[must_use]
    pub fn is_in_progress(&self) -> bool {
        self.phase == Phase::InProgress
    }

    /// Why the last attempt failed, if it did.
    #[must_use]
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }
}

/// Notifications about prefetch progress, in the order they happened per
/// track.
#[derive(Clone, Debug, PartialEq)]
pub enum PrefetchEvent {
    Progress { index: usize, progress: Percentage },
    Completed { index: usize, locator: Locator },
    Failed { index: usize, error: String },
}

struct Slot {
    state: Arc<watch::Sender<PrefetchState>>,
    cancel: CancellationToken,
}

struct Inner {
    playlist: Playlist,
    base_url: Url,
    fetcher: Arc<dyn Fetch>,
    arena: ResourceArena,
    registry: Mutex<HashMap<usize, Slot>>,
    events: Option<mpsc::UnboundedSender<PrefetchEvent>>,
    shutdown: CancellationToken,
}

/// Downloads tracks in the background. Cloning yields a handle to the same
/// manager.
#[derive(Clone)]
pub struct PrefetchManager {
    inner: Arc<Inner>,
}

/// Marks an attempt cancelled when its future is dropped before it
/// settles, so the slot never stays in progress with nobody driving it.
struct Attempt {
    index: usize,
    state: Arc<watch::Sender<PrefetchState>>,
}

impl Drop for Attempt {
    fn drop(&mut self) {
        let index = self.index;
        self.state.send_if_modified(|state| {
            let abandoned = state.is_in_progress();
            if abandoned {
                debug!("prefetch of track {index} abandoned by its caller");
                state.phase = Phase::Cancelled;
            }
            abandoned
        });
    }
}

enum Claim {
    Ready(Locator),
    Join(watch::Receiver<PrefetchState>),
    Start(Arc<watch::Sender<PrefetchState>>, CancellationToken),
}

impl PrefetchManager {
    /// Upper bound on buffer preallocation from a `Content-Length` header,
    /// so a bogus header cannot reserve gigabytes up front.
    const MAX_PREALLOCATION: usize = 64 * 1024 * 1024;

    #[must_use]
    pub fn new(
        playlist: Playlist,
        base_url: Url,
        fetcher: Arc<dyn Fetch>,
        events: Option<mpsc::UnboundedSender<PrefetchEvent>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                playlist,
                base_url,
                fetcher,
                arena: ResourceArena::new(),
                registry: Mutex::new(HashMap::new()),
                events,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Read access to the arena holding completed downloads.
    #[must_use]
    pub fn arena(&self) -> &ResourceArena {
        &self.inner.arena
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<usize, Slot>> {
        // Slots are only ever replaced whole, so a poisoned map is still
        // consistent.
        self.inner
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: PrefetchEvent) {
        if let Some(events) = &self.inner.events {
            // Nobody listening is fine.
            let _ = events.send(event);
        }
    }

    /// State of the download for `index`, or `None` if never requested.
    #[must_use]
    pub fn state(&self, index: usize) -> Option<PrefetchState> {
        self.registry()
            .get(&index)
            .map(|slot| slot.state.borrow().clone())
    }

    /// All requested downloads by track index.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<usize, PrefetchState> {
        self.registry()
            .iter()
            .map(|(index, slot)| (*index, slot.state.borrow().clone()))
            .collect()
    }

    /// Watches the state of `index` as it changes.
    #[must_use]
    pub fn subscribe(&self, index: usize) -> Option<watch::Receiver<PrefetchState>> {
        self.registry().get(&index).map(|slot| slot.state.subscribe())
    }

    /// Locator of the completed download for `index`.
    #[must_use]
    pub fn locator(&self, index: usize) -> Option<Locator> {
        self.state(index)
            .filter(PrefetchState::is_done)
            .and_then(|state| state.locator)
    }

    /// Prefetches `index` and resolves to the locator of the result.
    ///
    /// Idempotent: a completed track returns at once, and a track already
    /// downloading is waited for rather than downloaded twice. A failed or
    /// cancelled track is downloaded again from scratch.
    ///
    /// # Errors
    ///
    /// * `OutOfRange` if `index` is not in the playlist
    /// * `Cancelled` if the download was cancelled
    /// * the network error that broke off the download
    pub async fn prefetch_track(&self, index: usize) -> Result<Locator> {
        let track = self.inner.playlist.try_get(index)?;
        let url = track.url(&self.inner.base_url)?;

        match self.claim(index) {
            Claim::Ready(locator) => Ok(locator),
            Claim::Join(rx) => Self::join(index, rx).await,
            Claim::Start(tx, cancel) => {
                debug!("prefetching track {index} {track} from {url}");
                self.run(index, url, tx, cancel).await
            }
        }
    }

    /// Spawns [`prefetch_track`](Self::prefetch_track) as a background task.
    pub fn spawn(&self, index: usize) -> JoinHandle<Result<Locator>> {
        let manager = self.clone();
        tokio::spawn(async move { manager.prefetch_track(index).await })
    }

    fn claim(&self, index: usize) -> Claim {
        let mut registry = self.registry();

        if let Some(slot) = registry.get(&index) {
            let state = slot.state.borrow();
            match state.phase {
                Phase::Done => {
                    if let Some(locator) = state.locator.clone() {
                        return Claim::Ready(locator);
                    }
                }
                Phase::InProgress => return Claim::Join(slot.state.subscribe()),
                Phase::Failed | Phase::Cancelled => {}
            }
        }

        let cancel = self.inner.shutdown.child_token();
        let tx = match registry.get(&index) {
            // Keep the channel so existing subscribers see the new attempt.
            Some(slot) => {
                slot.state.send_replace(PrefetchState::default());
                Arc::clone(&slot.state)
            }
            None => Arc::new(watch::channel(PrefetchState::default()).0),
        };
        registry.insert(
            index,
            Slot {
                state: Arc::clone(&tx),
                cancel: cancel.clone(),
            },
        );

        Claim::Start(tx, cancel)
    }

    async fn join(index: usize, mut rx: watch::Receiver<PrefetchState>) -> Result<Locator> {
        trace!("joining prefetch of track {index} already in progress");
        let state = rx
            .wait_for(|state| !state.is_in_progress())
            .await
            .map_err(|_| Error::cancelled(format!("prefetch of track {index} went away")))?
            .clone();

        match state.phase {
            Phase::Done => state
                .locator
                .ok_or_else(|| Error::internal(format!("track {index} done without locator"))),
            Phase::Cancelled => Err(Error::cancelled(format!(
                "prefetch of track {index} was cancelled"
            ))),
            _ => Err(Error::unavailable(state.failure.unwrap_or_else(|| {
                format!("prefetch of track {index} failed")
            }))),
        }
    }

    async fn run(
        &self,
        index: usize,
        url: Url,
        tx: Arc<watch::Sender<PrefetchState>>,
        cancel: CancellationToken,
    ) -> Result<Locator> {
        let _attempt = Attempt {
            index,
            state: Arc::clone(&tx),
        };

        match self.download(index, url, &tx, &cancel).await {
            Ok(data) => {
                let size = data.len();

                // Checked under the registry lock, which `teardown` takes
                // after cancelling and before revoking.
                let published = {
                    let _registry = self.registry();
                    (!cancel.is_cancelled()).then(|| self.inner.arena.publish(index, data))
                };

                let Some(locator) = published else {
                    tx.send_modify(|state| state.phase = Phase::Cancelled);
                    debug!("prefetch of track {index} cancelled after completion");
                    return Err(Error::cancelled(format!(
                        "prefetch of track {index} was cancelled"
                    )));
                };

                tx.send_modify(|state| {
                    state.phase = Phase::Done;
                    state.progress = Percentage::FULL;
                    state.locator = Some(locator.clone());
                    state.failure = None;
                });
                debug!("prefetch of track {index} completed with {size} bytes");
                self.emit(PrefetchEvent::Completed {
                    index,
                    locator: locator.clone(),
                });
                Ok(locator)
            }
            Err(e) if e.is_cancelled() => {
                tx.send_modify(|state| state.phase = Phase::Cancelled);
                debug!("prefetch of track {index} cancelled");
                Err(e)
            }
            Err(e) => {
                let failure = e.to_string();
                tx.send_modify(|state| {
                    state.phase = Phase::Failed;
                    state.failure = Some(failure.clone());
                });
                error!("prefetch of track {index} failed: {failure}");
                self.emit(PrefetchEvent::Failed {
                    index,
                    error: failure,
                });
                Err(e)
            }
        }
    }

    async fn download(
        &self,
        index: usize,
        url: Url,
        tx: &watch::Sender<PrefetchState>,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        let cancelled = || Error::cancelled(format!("prefetch of track {index} was cancelled"));

        let Download {
            content_length,
            mut chunks,
        } = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(cancelled()),
            download = self.inner.fetcher.fetch(url) => download?,
        };

        match content_length {
            Some(length) => trace!("track {index} is {length} bytes"),
            None => debug!("track {index} has unknown length, progress stays at zero"),
        }

        let capacity = content_length
            .and_then(|length| usize::try_from(length).ok())
            .unwrap_or_default()
            .min(Self::MAX_PREALLOCATION);
        let mut buffer = BytesMut::with_capacity(capacity);

        loop {
            let chunk = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(cancelled()),
                chunk = chunks.next() => chunk,
            };

            let Some(chunk) = chunk else {
                break;
            };
            buffer.extend_from_slice(&chunk?);

            let progress = content_length.map_or(Percentage::ZERO, |length| {
                Percentage::from_fraction(buffer.len() as u64, length)
            });

            let mut advanced = false;
            tx.send_if_modified(|state| {
                // Never move backwards, even if the server sends more than
                // it announced.
                advanced = progress > state.progress;
                if advanced {
                    state.progress = progress;
                }
                advanced
            });
            if advanced {
                self.emit(PrefetchEvent::Progress { index, progress });
            }
        }

        Ok(buffer.freeze())
    }

    /// Cancels the download of `index` if one is running.
    ///
    /// Returns whether a running download was signaled.
    pub fn cancel(&self, index: usize) -> bool {
        let registry = self.registry();
        match registry.get(&index) {
            Some(slot) if slot.state.borrow().is_in_progress() => {
                slot.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Cancels every running download and revokes all completed resources.
    ///
    /// Returns the indices whose resources were revoked. The manager is
    /// unusable for new downloads afterwards: any later attempt is
    /// cancelled immediately.
    pub fn teardown(&self) -> Vec<usize> {
        self.inner.shutdown.cancel();
        // Taking the lock waits out any publish that saw the token unset.
        let abandoned = self
            .registry()
            .drain()
            .filter(|(_, slot)| slot.state.borrow().is_in_progress())
            .count();
        if abandoned > 0 {
            debug!("abandoned {abandoned} prefetches in progress");
        }
        self.inner.arena.revoke_all()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        error::ErrorKind,
        testing::{playlist, MemoryFetch, BASE_URL},
    };

    fn manager(
        fetch: MemoryFetch,
    ) -> (PrefetchManager, mpsc::UnboundedReceiver<PrefetchEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = PrefetchManager::new(
            playlist(3),
            BASE_URL.parse().unwrap(),
            Arc::new(fetch),
            Some(tx),
        );
        (manager, rx)
    }

    #[tokio::test]
    async fn completes_with_monotonic_progress() {
        let fetch = MemoryFetch::new();
        fetch.serve("track0.mp3", vec![b"aaaa".to_vec(), b"bb".to_vec(), b"cccc".to_vec()]);
        let (manager, mut events) = manager(fetch);

        let locator = manager.prefetch_track(0).await.unwrap();

        let state = manager.state(0).unwrap();
        assert!(state.is_done());
        assert_eq!(state.locator(), Some(&locator));
        assert_eq!(
            manager.arena().resolve(&locator).unwrap(),
            Bytes::from_static(b"aaaabbcccc")
        );

        let mut last = Percentage::ZERO;
        let mut completed = false;
        while let Ok(event) = events.try_recv() {
            match event {
                PrefetchEvent::Progress { index, progress } => {
                    assert_eq!(index, 0);
                    assert!(progress > last);
                    last = progress;
                }
                PrefetchEvent::Completed { index, .. } => {
                    assert_eq!(index, 0);
                    completed = true;
                }
                PrefetchEvent::Failed { .. } => panic!("unexpected failure"),
            }
        }
        assert!(completed);
        assert!(last.is_full());
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_download() {
        let fetch = MemoryFetch::new();
        fetch.serve("track1.mp3", vec![b"12".to_vec(), b"34".to_vec()]);
        let requests = fetch.requests();
        let (manager, _events) = manager(fetch);

        let (first, second) = tokio::join!(manager.prefetch_track(1), manager.prefetch_track(1));

        assert_eq!(first.unwrap(), second.unwrap());
        assert_eq!(requests.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(manager.arena().len(), 1);

        // Done is absorbing: no further request either.
        manager.prefetch_track(1).await.unwrap();
        assert_eq!(requests.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_length_reports_zero_until_done() {
        let fetch = MemoryFetch::new();
        fetch.serve_without_length("track0.mp3", vec![b"ab".to_vec(), b"cd".to_vec()]);
        let (manager, mut events) = manager(fetch);

        manager.prefetch_track(0).await.unwrap();

        assert!(manager.state(0).unwrap().progress().is_full());
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, PrefetchEvent::Progress { .. }));
        }
    }

    #[tokio::test]
    async fn failure_keeps_partial_progress_until_retried() {
        let fetch = MemoryFetch::new();
        fetch.serve_failing("track2.mp3", vec![b"half".to_vec()], 8);
        let (manager, mut events) = manager(fetch.clone());

        let err = manager.prefetch_track(2).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::DataLoss);

        let state = manager.state(2).unwrap();
        assert_eq!(state.phase(), Phase::Failed);
        assert!(!state.is_done());
        assert!((state.progress().as_percent() - 50.0).abs() < 1e-9);
        assert!(state.failure().is_some());
        assert!(matches!(
            events.try_recv(),
            Ok(PrefetchEvent::Progress { index: 2, .. })
        ));
        assert!(matches!(
            events.try_recv(),
            Ok(PrefetchEvent::Failed { index: 2, .. })
        ));

        // An explicit request starts over.
        fetch.serve("track2.mp3", vec![b"complete".to_vec()]);
        manager.prefetch_track(2).await.unwrap();
        assert!(manager.state(2).unwrap().is_done());
    }

    #[tokio::test]
    async fn cancel_stops_a_stalled_download() {
        let fetch = MemoryFetch::new();
        fetch.serve_stalling("track0.mp3", vec![b"ab".to_vec()], 10);
        let (manager, _events) = manager(fetch);

        let handle = manager.spawn(0);
        tokio::task::yield_now().await;
        let mut rx = loop {
            if let Some(rx) = manager.subscribe(0) {
                break rx;
            }
            tokio::task::yield_now().await;
        };
        rx.wait_for(|state| state.progress() > Percentage::ZERO)
            .await
            .unwrap();

        assert!(manager.cancel(0));
        let err = handle.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());

        let state = manager.state(0).unwrap();
        assert_eq!(state.phase(), Phase::Cancelled);
        assert!((state.progress().as_percent() - 20.0).abs() < 1e-9);
        assert!(!manager.cancel(0));
    }

    #[tokio::test]
    async fn dropped_request_does_not_strand_the_track() {
        let fetch = MemoryFetch::new();
        fetch.serve_stalling("track0.mp3", vec![b"ab".to_vec()], 10);
        let (manager, _events) = manager(fetch.clone());

        let timed_out =
            tokio::time::timeout(Duration::from_millis(50), manager.prefetch_track(0)).await;
        assert!(timed_out.is_err());

        let state = manager.state(0).unwrap();
        assert_eq!(state.phase(), Phase::Cancelled);
        assert!(!manager.cancel(0));

        fetch.serve("track0.mp3", vec![b"abcd".to_vec()]);
        let locator = tokio::time::timeout(Duration::from_secs(5), manager.prefetch_track(0))
            .await
            .expect("request after a dropped one must not hang")
            .unwrap();
        assert!(manager.state(0).unwrap().is_done());
        assert_eq!(
            manager.arena().resolve(&locator).unwrap(),
            Bytes::from_static(b"abcd")
        );
    }

    #[tokio::test]
    async fn joiner_of_dropped_request_sees_cancellation() {
        let fetch = MemoryFetch::new();
        fetch.serve_stalling("track1.mp3", vec![b"ab".to_vec()], 10);
        let (manager, _events) = manager(fetch);

        let owner = manager.spawn(1);
        let mut rx = loop {
            if let Some(rx) = manager.subscribe(1) {
                break rx;
            }
            tokio::task::yield_now().await;
        };
        rx.wait_for(|state| state.progress() > Percentage::ZERO)
            .await
            .unwrap();

        let joiner = manager.spawn(1);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        owner.abort();

        let err = joiner.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(manager.state(1).unwrap().phase(), Phase::Cancelled);
    }

    #[tokio::test]
    async fn teardown_during_download_publishes_nothing() {
        let fetch = MemoryFetch::new();
        fetch.serve_stalling("track2.mp3", vec![b"ab".to_vec()], 10);
        let (manager, _events) = manager(fetch);

        let handle = manager.spawn(2);
        let mut rx = loop {
            if let Some(rx) = manager.subscribe(2) {
                break rx;
            }
            tokio::task::yield_now().await;
        };
        rx.wait_for(|state| state.progress() > Percentage::ZERO)
            .await
            .unwrap();

        assert!(manager.teardown().is_empty());
        let err = handle.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
        assert!(manager.arena().is_empty());
    }

    #[tokio::test]
    async fn teardown_revokes_only_completed_tracks() {
        let fetch = MemoryFetch::new();
        fetch.serve("track0.mp3", vec![b"zero".to_vec()]);
        fetch.serve("track2.mp3", vec![b"two".to_vec()]);
        let (manager, _events) = manager(fetch);

        let zero = manager.prefetch_track(0).await.unwrap();
        let two = manager.prefetch_track(2).await.unwrap();
        assert!(manager.state(1).is_none());

        assert_eq!(manager.teardown(), vec![0, 2]);
        assert!(!manager.arena().contains(&zero));
        assert!(!manager.arena().contains(&two));
        assert!(manager.snapshot().is_empty());

        let err = manager.prefetch_track(1).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn rejects_index_outside_playlist() {
        let (manager, _events) = manager(MemoryFetch::new());
        let err = manager.prefetch_track(3).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::OutOfRange);
        assert!(manager.state(3).is_none());
    }
}
