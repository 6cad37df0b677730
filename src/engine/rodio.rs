//! Engine playing through the default audio output device.
//!
//! Loading a source starts opening it in the background right away:
//! * network sources are streamed with `stream-download` into temporary
//!   storage, so playback can start before the download is complete
//! * resources are read from the arena in memory
//!
//! Once the decoder is ready it is appended to a fresh [`Sink`], paused
//! unless playback was requested in the meantime. The caller drives
//! progress reporting by calling [`Engine::tick`] periodically.
//!
//! While a network download is still running, each tick compares the play
//! position with how far the download has got. Playback that catches up
//! with the download reports `Waiting`, and `CanPlay` once enough is
//! buffered again.

use std::{
    path::Path,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use ::rodio::{OutputStream, OutputStreamHandle, Sink};
use stream_download::{
    http::HttpStream, source::SourceStream, storage::temp::TempStorageProvider, StreamDownload,
    StreamPhase, StreamState,
};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use url::Url;

use super::{Engine, EngineEvent, EngineEventKind, Generation, Source};
use crate::{
    audio_file::AudioFile,
    decoder::Decoder,
    error::{Error, Result},
    resources::ResourceArena,
};

/// How far a network download has got, in playback time.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Buffering {
    end: Duration,
    complete: bool,
}

/// State shared with the download progress callback.
#[derive(Debug, Default)]
struct Timeline {
    duration: Option<Duration>,
    buffering: Option<Buffering>,
}

/// A source being opened in the background.
struct Opening {
    rx: oneshot::Receiver<Result<Decoder>>,
    task: JoinHandle<()>,
}

pub struct RodioEngine {
    // Dropping the stream silences all sinks.
    _stream: OutputStream,
    handle: OutputStreamHandle,
    sink: Option<Sink>,

    arena: ResourceArena,
    client: reqwest::Client,
    events: mpsc::UnboundedSender<EngineEvent>,

    source: Option<Source>,
    generation: Generation,
    opening: Option<Opening>,

    timeline: Arc<Mutex<Timeline>>,

    volume: f32,
    want_play: bool,
    waiting: bool,
    ended: bool,
}

impl RodioEngine {
    /// Playback closer than this to the end of the download stalls.
    const STALL_AHEAD: Duration = Duration::from_millis(500);

    /// Buffered time needed to resume after a stall.
    const RESUME_AHEAD: Duration = Duration::from_secs(2);

    /// Opens the default audio output device.
    ///
    /// # Errors
    ///
    /// Returns an error if no output device is available.
    pub fn new(
        arena: ResourceArena,
        client: reqwest::Client,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Result<Self> {
        let (stream, handle) = OutputStream::try_default()?;
        info!("opened default audio output device");

        Ok(Self {
            _stream: stream,
            handle,
            sink: None,
            arena,
            client,
            events,
            source: None,
            generation: Generation::default(),
            opening: None,
            timeline: Arc::default(),
            volume: 1.0,
            want_play: false,
            waiting: false,
            ended: false,
        })
    }

    fn emit(&self, kind: EngineEventKind) {
        // The receiver only goes away on shutdown.
        let _ = self.events.send(EngineEvent::new(self.generation, kind));
    }

    fn extension(url: &Url) -> Option<String> {
        Path::new(url.path())
            .extension()
            .and_then(|extension| extension.to_str())
            .map(ToOwned::to_owned)
    }

    async fn open_network(
        client: reqwest::Client,
        url: Url,
        generation: Generation,
        timeline: Arc<Mutex<Timeline>>,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Result<Decoder> {
        let stream = HttpStream::new(client, url.clone()).await?;
        let content_length = stream.content_length();
        match content_length {
            Some(length) => debug!("streaming {length} bytes from {url}"),
            None => debug!("streaming {url} with unknown length"),
        }

        let callback = move |_: &HttpStream<_>, stream_state: StreamState, _: &tokio_util::sync::CancellationToken| {
            let mut timeline = timeline.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(total) = timeline.duration else {
                return;
            };

            let complete = matches!(stream_state.phase, StreamPhase::Complete);
            let buffered = match stream_state.phase {
                StreamPhase::Complete => total,
                _ => match content_length {
                    Some(length) if length > 0 => {
                        // `f64` not for precision, but to fit big file sizes.
                        #[expect(clippy::cast_precision_loss)]
                        let progress = stream_state.current_position as f64 / length as f64;
                        total.mul_f64(progress.min(1.0))
                    }
                    _ => return,
                },
            };
            timeline.buffering = Some(Buffering {
                end: buffered,
                complete,
            });
            drop(timeline);

            let _ = events.send(EngineEvent::new(
                generation,
                EngineEventKind::Buffered(vec![Duration::ZERO..buffered]),
            ));
        };

        let download = StreamDownload::from_stream(
            stream,
            TempStorageProvider::default(),
            stream_download::Settings::default().on_progress(callback),
        )
        .await?;

        let extension = Self::extension(&url);
        let file = AudioFile::from_download(download, content_length);
        tokio::task::spawn_blocking(move || Decoder::new(file, extension.as_deref())).await?
    }

    fn open(&mut self, source: &Source) -> Result<()> {
        let (tx, rx) = oneshot::channel();

        let task = match source {
            Source::Network(url) => {
                let opening = Self::open_network(
                    self.client.clone(),
                    url.clone(),
                    self.generation,
                    Arc::clone(&self.timeline),
                    self.events.clone(),
                );
                tokio::spawn(async move {
                    let _ = tx.send(opening.await);
                })
            }
            Source::Resource(locator) => {
                let data = self
                    .arena
                    .resolve(locator)
                    .ok_or_else(|| Error::not_found(format!("{locator} was revoked")))?;
                tokio::spawn(async move {
                    let decoder = tokio::task::spawn_blocking(move || {
                        Decoder::new(AudioFile::from_bytes(data), None)
                    })
                    .await
                    .map_err(Error::from)
                    .and_then(|decoder| decoder);
                    let _ = tx.send(decoder);
                })
            }
        };

        self.opening = Some(Opening { rx, task });
        Ok(())
    }

    fn attach(&mut self, decoder: Decoder) -> Result<()> {
        let sink = Sink::try_new(&self.handle)?;
        sink.set_volume(self.volume);
        if !self.want_play {
            sink.pause();
        }

        if let Some(total) = ::rodio::Source::total_duration(&decoder) {
            self.timeline
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .duration = Some(total);
            self.emit(EngineEventKind::DurationChanged(total));
        }

        sink.append(decoder);
        self.sink = Some(sink);

        if self.waiting {
            self.waiting = false;
            self.emit(EngineEventKind::CanPlay);
        }
        if self.want_play {
            self.emit(EngineEventKind::Started);
        }
        Ok(())
    }

    /// Collects background results and reports the play position.
    fn poll(&mut self) {
        if let Some(opening) = &mut self.opening {
            match opening.rx.try_recv() {
                Err(oneshot::error::TryRecvError::Empty) => {
                    if self.want_play && !self.waiting {
                        self.waiting = true;
                        self.emit(EngineEventKind::Waiting);
                    }
                    return;
                }
                Ok(Ok(decoder)) => {
                    self.opening = None;
                    if let Err(e) = self.attach(decoder) {
                        self.emit(EngineEventKind::StartFailed(e.to_string()));
                    }
                }
                Ok(Err(e)) => {
                    self.opening = None;
                    if let Some(source) = &self.source {
                        error!("cannot open {source}: {e}");
                    }
                    self.emit(EngineEventKind::StartFailed(e.to_string()));
                }
                Err(oneshot::error::TryRecvError::Closed) => {
                    self.opening = None;
                    self.emit(EngineEventKind::StartFailed(
                        "opening source went away".to_owned(),
                    ));
                }
            }
        }

        let Some(sink) = &self.sink else {
            return;
        };
        if self.ended {
            return;
        }

        if sink.empty() {
            self.ended = true;
            self.emit(EngineEventKind::Ended);
            return;
        }
        if sink.is_paused() {
            return;
        }

        let position = sink.get_pos();
        self.emit(EngineEventKind::TimeUpdate(position));

        let buffering = self
            .timeline
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .buffering;
        if let Some(kind) = Self::stall_event(self.waiting, position, buffering) {
            self.waiting = kind == EngineEventKind::Waiting;
            debug!("playback at {:.1}s: {kind}", position.as_secs_f32());
            self.emit(kind);
        }
    }

    /// Decides whether playback at `position` just stalled on the download
    /// or just recovered from a stall.
    ///
    /// Sources without download progress, such as resources in memory,
    /// never stall.
    fn stall_event(
        waiting: bool,
        position: Duration,
        buffering: Option<Buffering>,
    ) -> Option<EngineEventKind> {
        let Some(buffering) = buffering else {
            return waiting.then_some(EngineEventKind::CanPlay);
        };

        let ahead = buffering.end.saturating_sub(position);
        if waiting {
            (buffering.complete || ahead >= Self::RESUME_AHEAD).then_some(EngineEventKind::CanPlay)
        } else {
            (!buffering.complete && ahead < Self::STALL_AHEAD).then_some(EngineEventKind::Waiting)
        }
    }
}

impl Engine for RodioEngine {
    fn load(&mut self, source: Source, generation: Generation) -> Result<()> {
        self.stop();
        self.generation = generation;
        debug!("loading {source} for {generation}");

        self.open(&source)?;
        self.source = Some(source);
        Ok(())
    }

    fn source(&self) -> Option<&Source> {
        self.source.as_ref()
    }

    fn play(&mut self) -> Result<()> {
        if self.source.is_none() {
            return Err(Error::failed_precondition("no source loaded"));
        }

        self.want_play = true;
        if let Some(sink) = &self.sink {
            if self.ended {
                return Err(Error::failed_precondition("track already ended"));
            }
            sink.play();
            self.emit(EngineEventKind::Started);
        }
        // Otherwise `poll` starts playback once the source is open.
        Ok(())
    }

    fn pause(&mut self) {
        self.want_play = false;
        if let Some(sink) = &self.sink {
            sink.pause();
        }
    }

    fn stop(&mut self) {
        if let Some(opening) = self.opening.take() {
            opening.task.abort();
        }
        if let Some(sink) = self.sink.take() {
            sink.stop();
        }
        // A fresh cell, so a download still winding down cannot touch the
        // next track's timeline.
        self.timeline = Arc::default();

        self.source = None;
        self.want_play = false;
        self.waiting = false;
        self.ended = false;
    }

    fn seek(&mut self, position: Duration) -> Result<()> {
        let sink = self
            .sink
            .as_ref()
            .ok_or_else(|| Error::failed_precondition("source is not open yet"))?;
        sink.try_seek(position)?;
        Ok(())
    }

    fn set_volume(&mut self, volume: f32) {
        self.volume = volume;
        if let Some(sink) = &self.sink {
            sink.set_volume(volume);
        }
    }

    /// Call this a few times per second from the control loop.
    fn tick(&mut self) {
        self.poll();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_comes_from_url_path() {
        let url = Url::parse("https://cdn.example.com/audio/track.FLAC?token=1").unwrap();
        assert_eq!(RodioEngine::extension(&url).as_deref(), Some("FLAC"));

        let url = Url::parse("https://cdn.example.com/audio/track").unwrap();
        assert_eq!(RodioEngine::extension(&url), None);
    }

    fn buffered(secs: u64, complete: bool) -> Option<Buffering> {
        Some(Buffering {
            end: Duration::from_secs(secs),
            complete,
        })
    }

    #[test]
    fn playback_catching_up_with_download_stalls() {
        let at = |millis| Duration::from_millis(millis);

        assert_eq!(RodioEngine::stall_event(false, at(5_000), buffered(30, false)), None);
        assert_eq!(
            RodioEngine::stall_event(false, at(29_800), buffered(30, false)),
            Some(EngineEventKind::Waiting)
        );
        assert_eq!(
            RodioEngine::stall_event(false, at(31_000), buffered(30, false)),
            Some(EngineEventKind::Waiting)
        );

        // A complete download never stalls, even right at its end.
        assert_eq!(RodioEngine::stall_event(false, at(29_900), buffered(30, true)), None);
        assert_eq!(RodioEngine::stall_event(false, at(29_900), None), None);
    }

    #[test]
    fn stalled_playback_resumes_with_enough_buffered() {
        let at = |millis| Duration::from_millis(millis);

        // Some data arrived, but not enough to resume yet.
        assert_eq!(RodioEngine::stall_event(true, at(29_800), buffered(31, false)), None);
        assert_eq!(
            RodioEngine::stall_event(true, at(29_800), buffered(32, false)),
            Some(EngineEventKind::CanPlay)
        );
        assert_eq!(
            RodioEngine::stall_event(true, at(29_800), buffered(30, true)),
            Some(EngineEventKind::CanPlay)
        );
        assert_eq!(
            RodioEngine::stall_event(true, at(29_800), None),
            Some(EngineEventKind::CanPlay)
        );
    }
}
