//! Test doubles: an in-memory fetcher, a scripted engine and a manual clock.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use futures_util::{future::BoxFuture, stream, FutureExt, StreamExt};
use url::Url;

use crate::{
    engine::{Engine, Generation, Source},
    error::{Error, Result},
    http::{Download, Fetch},
    selection::Clock,
    track::{Playlist, Track},
};

pub const BASE_URL: &str = "http://audio.test/files/";

/// Playlist of `len` tracks named `track0.mp3`, `track1.mp3` and so on.
pub fn playlist(len: usize) -> Playlist {
    Playlist::new(
        (0..len)
            .map(|i| Track::new(format!("Track {i}"), format!("track{i}.mp3")))
            .collect(),
    )
    .unwrap()
}

#[derive(Clone, Copy, Debug)]
enum Ending {
    Complete,
    Fail,
    Stall,
}

#[derive(Clone, Debug)]
struct Response {
    chunks: Vec<Vec<u8>>,
    content_length: Option<u64>,
    ending: Ending,
}

/// Serves canned bodies by filename. Clones share the same responses.
#[derive(Clone, Default)]
pub struct MemoryFetch {
    responses: Arc<Mutex<HashMap<String, Response>>>,
    requests: Arc<AtomicUsize>,
}

impl MemoryFetch {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, name: &str, response: Response) {
        self.responses
            .lock()
            .unwrap()
            .insert(name.to_owned(), response);
    }

    pub fn serve(&self, name: &str, chunks: Vec<Vec<u8>>) {
        let length = chunks.iter().map(Vec::len).sum::<usize>() as u64;
        self.insert(
            name,
            Response {
                chunks,
                content_length: Some(length),
                ending: Ending::Complete,
            },
        );
    }

    pub fn serve_without_length(&self, name: &str, chunks: Vec<Vec<u8>>) {
        self.insert(
            name,
            Response {
                chunks,
                content_length: None,
                ending: Ending::Complete,
            },
        );
    }

    /// Sends `chunks`, then breaks off with a read error.
    pub fn serve_failing(&self, name: &str, chunks: Vec<Vec<u8>>, content_length: u64) {
        self.insert(
            name,
            Response {
                chunks,
                content_length: Some(content_length),
                ending: Ending::Fail,
            },
        );
    }

    /// Sends `chunks`, then never sends anything again.
    pub fn serve_stalling(&self, name: &str, chunks: Vec<Vec<u8>>, content_length: u64) {
        self.insert(
            name,
            Response {
                chunks,
                content_length: Some(content_length),
                ending: Ending::Stall,
            },
        );
    }

    /// Number of fetches made so far.
    pub fn requests(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.requests)
    }
}

impl Fetch for MemoryFetch {
    fn fetch(&self, url: Url) -> BoxFuture<'_, Result<Download>> {
        self.requests.fetch_add(1, Ordering::SeqCst);

        let name = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .unwrap_or_default()
            .to_owned();
        let response = self.responses.lock().unwrap().get(&name).cloned();

        async move {
            let response = response.ok_or_else(|| Error::not_found(format!("{url} not served")))?;

            let body = stream::iter(
                response
                    .chunks
                    .into_iter()
                    .map(|chunk| Ok::<_, Error>(Bytes::from(chunk))),
            );
            let chunks = match response.ending {
                Ending::Complete => body.boxed(),
                Ending::Fail => body
                    .chain(stream::once(async {
                        Err(Error::data_loss("connection reset"))
                    }))
                    .boxed(),
                Ending::Stall => body.chain(stream::pending()).boxed(),
            };

            Ok(Download {
                content_length: response.content_length,
                chunks,
            })
        }
        .boxed()
    }
}

/// Engine that records what it was asked to do. Outcomes are fed back to
/// the player by the test itself.
#[derive(Debug, Default)]
pub struct ScriptedEngine {
    pub source: Option<Source>,
    pub generation: Generation,
    pub playing: bool,
    pub loads: Vec<Source>,
    pub play_requests: usize,
    pub seeks: Vec<Duration>,
    pub volume: f32,

    /// Makes the next `play` calls fail immediately.
    pub reject_play: bool,

    /// Set once the loaded source played to its end. Like a real output,
    /// an ended source refuses to play until something is loaded again.
    pub ended: bool,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Engine for ScriptedEngine {
    fn load(&mut self, source: Source, generation: Generation) -> Result<()> {
        self.loads.push(source.clone());
        self.source = Some(source);
        self.generation = generation;
        self.playing = false;
        self.ended = false;
        Ok(())
    }

    fn source(&self) -> Option<&Source> {
        self.source.as_ref()
    }

    fn play(&mut self) -> Result<()> {
        if self.source.is_none() {
            return Err(Error::failed_precondition("nothing loaded"));
        }
        if self.reject_play {
            return Err(Error::unavailable("output device busy"));
        }
        if self.ended {
            return Err(Error::failed_precondition("track already ended"));
        }
        self.play_requests += 1;
        self.playing = true;
        Ok(())
    }

    fn pause(&mut self) {
        self.playing = false;
    }

    fn stop(&mut self) {
        self.source = None;
        self.playing = false;
        self.ended = false;
    }

    fn seek(&mut self, position: Duration) -> Result<()> {
        self.seeks.push(position);
        Ok(())
    }

    fn set_volume(&mut self, volume: f32) {
        self.volume = volume;
    }
}

/// Clock that only moves when told to. Clones share the same time.
#[derive(Clone, Debug)]
pub struct ManualClock {
    now: Arc<Mutex<Instant>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap()
    }
}
