//! Built-in synthetic media backend
//!
//! Serves a small fixed catalog whose tracks are pure sine tones. A
//! producer thread renders the playing track chunk by chunk into an
//! [`AudioSink`]; queries are answered on a separate worker thread so
//! callers see the same asynchronous behaviour a real player would give.

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::ToneGenerator;
use crate::backend::{
    AlbumInfo, ArtistInfo, AudioSink, MediaBackend, MediaQuery, PlaybackCommand, PlaybackState,
    PlayerStatus, PlaylistInfo, QueryReply, QueryResult, RepeatMode, RequestToken, SinkOutcome,
    StatusEvent, StatusListener, TrackInfo,
};
use crate::config::AudioConfig;
use crate::error::{AudioError, BackendError};
use crate::timer::{Timer, TimerScheduler};

/// Interval between position updates while playing
const POSITION_INTERVAL_MS: u32 = 1_000;

/// Within this far into a track, "previous" goes to the prior track
const RESTART_THRESHOLD_MS: u32 = 3_000;

const IMAGE_MIME: &str = "image/x-portable-pixmap";

// (album slug, album title, artist slug, artist name, [(track slug, title, frequency, seconds)])
type AlbumSpec = (&'static str, &'static str, &'static str, &'static str, &'static [(&'static str, &'static str, f64, u32)]);

const ALBUMS: &[AlbumSpec] = &[
    (
        "concert-pitch",
        "Concert Pitch",
        "oscillator",
        "Oscillator",
        &[
            ("a3", "A3", 220.0, 20),
            ("a4", "A4", 440.0, 20),
            ("a5", "A5", 880.0, 20),
        ],
    ),
    (
        "overtones",
        "Overtones",
        "harmonics",
        "Harmonic Series",
        &[
            ("fundamental", "Fundamental", 110.0, 15),
            ("octave", "Octave", 220.0, 15),
            ("fifth", "Twelfth", 330.0, 15),
            ("double-octave", "Double Octave", 440.0, 15),
        ],
    ),
    (
        "beeps",
        "Beeps",
        "oscillator",
        "Oscillator",
        &[("short-high", "Short High", 1_500.0, 2), ("short-low", "Short Low", 1_000.0, 2)],
    ),
];

#[derive(Debug, Clone)]
struct CatalogTrack {
    info: TrackInfo,
    frequency: f64,
}

struct CatalogPlaylist {
    info: PlaylistInfo,
    tracks: Vec<usize>,
}

struct Catalog {
    tracks: Vec<CatalogTrack>,
    albums: Vec<AlbumInfo>,
    artists: Vec<ArtistInfo>,
    playlists: Vec<CatalogPlaylist>,
}

impl Catalog {
    fn build() -> Self {
        let mut tracks = Vec::new();
        let mut albums = Vec::new();
        let mut artists: Vec<ArtistInfo> = Vec::new();
        let mut playlists = Vec::new();

        for (album_slug, album_title, artist_slug, artist_name, album_tracks) in ALBUMS {
            let album_uri = format!("tone:album:{album_slug}");
            let artist_uri = format!("tone:artist:{artist_slug}");
            let first = tracks.len();

            for (slug, title, frequency, seconds) in album_tracks.iter() {
                tracks.push(CatalogTrack {
                    info: TrackInfo {
                        uri: format!("tone:track:{slug}"),
                        title: title.to_string(),
                        artist: artist_name.to_string(),
                        album: album_title.to_string(),
                        duration_ms: seconds * 1000,
                    },
                    frequency: *frequency,
                });
            }
            let indices: Vec<usize> = (first..tracks.len()).collect();

            albums.push(AlbumInfo {
                uri: album_uri.clone(),
                title: album_title.to_string(),
                artist: artist_name.to_string(),
                tracks: indices.iter().map(|&i| tracks[i].info.clone()).collect(),
            });
            match artists.iter_mut().find(|a| a.uri == artist_uri) {
                Some(artist) => artist.albums.push(album_uri),
                None => artists.push(ArtistInfo {
                    uri: artist_uri,
                    name: artist_name.to_string(),
                    albums: vec![album_uri],
                }),
            }
            playlists.push(CatalogPlaylist {
                info: PlaylistInfo {
                    uri: format!("tone:playlist:{album_slug}"),
                    name: album_title.to_string(),
                    track_count: indices.len(),
                },
                tracks: indices,
            });
        }

        playlists.insert(
            0,
            CatalogPlaylist {
                info: PlaylistInfo {
                    uri: "tone:playlist:all".to_string(),
                    name: "All Tones".to_string(),
                    track_count: tracks.len(),
                },
                tracks: (0..tracks.len()).collect(),
            },
        );

        Self {
            tracks,
            albums,
            artists,
            playlists,
        }
    }

    fn playlist(&self, uri: &str) -> Option<&CatalogPlaylist> {
        self.playlists.iter().find(|p| p.info.uri == uri)
    }

    fn has_uri(&self, uri: &str) -> bool {
        self.tracks.iter().any(|t| t.info.uri == uri)
            || self.albums.iter().any(|a| a.uri == uri)
            || self.artists.iter().any(|a| a.uri == uri)
            || self.playlists.iter().any(|p| p.info.uri == uri)
    }

    fn answer(&self, query: &MediaQuery, status: PlayerStatus) -> Result<QueryResult, BackendError> {
        match query {
            MediaQuery::Status => Ok(QueryResult::Status(status)),
            MediaQuery::Playlists => Ok(QueryResult::Playlists(
                self.playlists.iter().map(|p| p.info.clone()).collect(),
            )),
            MediaQuery::Tracks { playlist } => self
                .playlist(playlist)
                .map(|p| QueryResult::Tracks(p.tracks.iter().map(|&i| self.tracks[i].info.clone()).collect()))
                .ok_or_else(|| BackendError::NotFound(playlist.clone())),
            MediaQuery::Album { uri } => self
                .albums
                .iter()
                .find(|a| &a.uri == uri)
                .cloned()
                .map(QueryResult::Album)
                .ok_or_else(|| BackendError::NotFound(uri.clone())),
            MediaQuery::Artist { uri } => self
                .artists
                .iter()
                .find(|a| &a.uri == uri)
                .cloned()
                .map(QueryResult::Artist)
                .ok_or_else(|| BackendError::NotFound(uri.clone())),
            MediaQuery::Search { query } => {
                let needle = query.trim().to_lowercase();
                if needle.is_empty() {
                    return Err(BackendError::InvalidArgument("empty search".to_string()));
                }
                Ok(QueryResult::Search(
                    self.tracks
                        .iter()
                        .map(|t| &t.info)
                        .filter(|t| {
                            t.title.to_lowercase().contains(&needle)
                                || t.artist.to_lowercase().contains(&needle)
                                || t.album.to_lowercase().contains(&needle)
                        })
                        .cloned()
                        .collect(),
                ))
            }
            MediaQuery::Image { uri } => {
                if !self.has_uri(uri) {
                    return Err(BackendError::NotFound(uri.clone()));
                }
                Ok(QueryResult::Image {
                    mime: IMAGE_MIME.to_string(),
                    data: cover_art(uri),
                })
            }
        }
    }
}

/// 8x8 binary PPM tinted from the uri
fn cover_art(uri: &str) -> Vec<u8> {
    let hash = uri
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325u64, |h, b| (h ^ b as u64).wrapping_mul(0x100_0000_01b3));
    let [r, g, b, ..] = hash.to_be_bytes();

    let mut image = b"P6\n8 8\n255\n".to_vec();
    for y in 0..8u8 {
        for x in 0..8u8 {
            let shade = 128 + (x + y) * 8;
            image.extend_from_slice(&[r / 2 + shade / 2, g / 2 + shade / 2, b / 2 + shade / 2]);
        }
    }
    image
}

/// Play order over `len` tracks with `first` at the cursor.
fn play_order(len: usize, shuffle: bool, first: usize) -> (Vec<usize>, usize) {
    let mut order: Vec<usize> = (0..len).collect();
    if !shuffle || len < 2 {
        return (order, first.min(len.saturating_sub(1)));
    }

    let mut seed = (uuid::Uuid::new_v4().as_u128() as u64) | 1;
    for i in (1..len).rev() {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        order.swap(i, (seed % (i as u64 + 1)) as usize);
    }
    if let Some(pos) = order.iter().position(|&i| i == first) {
        order.swap(0, pos);
    }
    (order, 0)
}

struct Player {
    state: PlaybackState,
    playlist_uri: Option<String>,
    tracks: Vec<CatalogTrack>,
    order: Vec<usize>,
    cursor: usize,
    generator: Option<ToneGenerator>,
    volume: u8,
    shuffle: bool,
    repeat: RepeatMode,
    /// Bumped on every discontinuity so the producer drops stale chunks
    generation: u64,
}

impl Player {
    fn current(&self) -> Option<&CatalogTrack> {
        self.order.get(self.cursor).and_then(|&i| self.tracks.get(i))
    }

    fn position_ms(&self) -> u32 {
        self.generator.as_ref().map_or(0, |g| g.position_ms())
    }

    fn status(&self) -> PlayerStatus {
        PlayerStatus {
            state: self.state,
            track: self.current().map(|t| t.info.clone()),
            position_ms: self.position_ms(),
            volume: self.volume,
            shuffle: self.shuffle,
            repeat: self.repeat,
        }
    }

    fn amplitude(&self) -> f64 {
        self.volume as f64 / 100.0 * 0.5
    }

    /// Load the track under the cursor and start it from the beginning.
    fn load_current(&mut self, audio: &AudioConfig, events: &mut Vec<StatusEvent>) -> Result<(), BackendError> {
        let track = self.current().cloned().ok_or(BackendError::NothingToPlay)?;
        let mut generator = ToneGenerator::new(track.frequency, audio.sample_rate, audio.channels)
            .map_err(|e| BackendError::InvalidArgument(e.to_string()))?;
        generator.set_amplitude(self.amplitude());

        self.generator = Some(generator);
        self.generation += 1;
        events.push(StatusEvent::track(Some(track.info)));
        Ok(())
    }

    fn set_state(&mut self, state: PlaybackState, events: &mut Vec<StatusEvent>) {
        if self.state != state {
            self.state = state;
            events.push(StatusEvent::state(state));
        }
    }

    fn stop(&mut self, events: &mut Vec<StatusEvent>) {
        self.generator = None;
        self.generation += 1;
        self.set_state(PlaybackState::Stopped, events);
        events.push(StatusEvent::track(None));
    }

    /// Move the cursor forward; stops at the end unless repeating all.
    fn advance(&mut self, audio: &AudioConfig, events: &mut Vec<StatusEvent>) -> Result<(), BackendError> {
        if self.order.is_empty() {
            return Err(BackendError::NothingToPlay);
        }
        if self.cursor + 1 < self.order.len() {
            self.cursor += 1;
        } else if self.repeat == RepeatMode::All {
            self.cursor = 0;
        } else {
            self.stop(events);
            return Ok(());
        }
        self.load_current(audio, events)
    }

    fn retreat(&mut self, audio: &AudioConfig, events: &mut Vec<StatusEvent>) -> Result<(), BackendError> {
        if self.order.is_empty() {
            return Err(BackendError::NothingToPlay);
        }
        let restart = self.generator.is_none() || self.position_ms() > RESTART_THRESHOLD_MS;
        if !restart {
            if self.cursor > 0 {
                self.cursor -= 1;
            } else if self.repeat == RepeatMode::All {
                self.cursor = self.order.len() - 1;
            }
        }
        self.load_current(audio, events)
    }

    /// The generator ran past the end of the current track.
    fn track_finished(&mut self, audio: &AudioConfig, events: &mut Vec<StatusEvent>) {
        let result = if self.repeat == RepeatMode::One {
            self.load_current(audio, events)
        } else {
            self.advance(audio, events)
        };
        if let Err(e) = result {
            tracing::warn!("Tone backend could not continue playback: {}", e);
            self.stop(events);
        }
    }
}

struct ToneInner {
    catalog: Catalog,
    audio: AudioConfig,
    player: Mutex<Player>,
    wake: Condvar,
    sink: Arc<dyn AudioSink>,
    listener: RwLock<Option<Arc<dyn StatusListener>>>,
    running: AtomicBool,
}

impl ToneInner {
    fn emit(&self, events: Vec<StatusEvent>) {
        if events.is_empty() {
            return;
        }
        let listener = self.listener.read().clone();
        if let Some(listener) = listener {
            for event in &events {
                listener.on_status(event);
            }
        }
    }

    fn apply(&self, command: PlaybackCommand, events: &mut Vec<StatusEvent>) -> Result<(), BackendError> {
        let mut player = self.player.lock();
        let audio = &self.audio;
        let generation = player.generation;

        match command {
            PlaybackCommand::Play { playlist, track } => {
                let uri = playlist
                    .or_else(|| player.playlist_uri.clone())
                    .or_else(|| self.catalog.playlists.first().map(|p| p.info.uri.clone()))
                    .ok_or(BackendError::NothingToPlay)?;
                let source = self
                    .catalog
                    .playlist(&uri)
                    .ok_or_else(|| BackendError::NotFound(uri.clone()))?;
                let tracks: Vec<CatalogTrack> = source.tracks.iter().map(|&i| self.catalog.tracks[i].clone()).collect();
                if tracks.is_empty() {
                    return Err(BackendError::NothingToPlay);
                }
                let first = match &track {
                    Some(track_uri) => tracks
                        .iter()
                        .position(|t| &t.info.uri == track_uri)
                        .ok_or_else(|| BackendError::NotFound(track_uri.clone()))?,
                    None => 0,
                };

                let (order, cursor) = play_order(tracks.len(), player.shuffle, first);
                player.playlist_uri = Some(uri);
                player.tracks = tracks;
                player.order = order;
                player.cursor = cursor;
                player.load_current(audio, events)?;
                player.set_state(PlaybackState::Playing, events);
            }
            PlaybackCommand::Pause => {
                if player.state == PlaybackState::Playing {
                    player.set_state(PlaybackState::Paused, events);
                }
            }
            PlaybackCommand::Resume => match player.state {
                PlaybackState::Playing => {}
                PlaybackState::Paused => player.set_state(PlaybackState::Playing, events),
                PlaybackState::Stopped => {
                    player.load_current(audio, events)?;
                    player.set_state(PlaybackState::Playing, events);
                }
            },
            PlaybackCommand::Next => player.advance(audio, events)?,
            PlaybackCommand::Previous => player.retreat(audio, events)?,
            PlaybackCommand::Seek { position_ms } => {
                let duration = player
                    .current()
                    .map(|t| t.info.duration_ms)
                    .ok_or(BackendError::NothingToPlay)?;
                if position_ms >= duration {
                    return Err(BackendError::InvalidArgument(format!(
                        "seek to {}ms past end of {}ms track",
                        position_ms, duration
                    )));
                }
                let generator = player.generator.as_mut().ok_or(BackendError::NothingToPlay)?;
                generator.seek(position_ms);
                player.generation += 1;
                events.push(StatusEvent::position(position_ms));
            }
            PlaybackCommand::SetShuffle(shuffle) => {
                if player.shuffle != shuffle {
                    player.shuffle = shuffle;
                    let current = player.order.get(player.cursor).copied().unwrap_or(0);
                    let (order, cursor) = play_order(player.tracks.len(), shuffle, current);
                    player.order = order;
                    player.cursor = cursor;
                }
                events.push(StatusEvent::shuffle(shuffle));
            }
            PlaybackCommand::SetRepeat(repeat) => {
                player.repeat = repeat;
                events.push(StatusEvent::repeat(repeat));
            }
            PlaybackCommand::SetVolume(volume) => {
                if volume > 100 {
                    return Err(BackendError::InvalidArgument(format!("volume {volume}")));
                }
                player.volume = volume;
                let amplitude = player.amplitude();
                if let Some(generator) = player.generator.as_mut() {
                    generator.set_amplitude(amplitude);
                }
                events.push(StatusEvent::volume(volume));
            }
        }
        // The producer delivers under this lock too
        if player.generation != generation {
            self.sink.flush();
        }
        drop(player);

        self.wake.notify_all();
        Ok(())
    }
}

struct QueryJob {
    query: MediaQuery,
    token: RequestToken,
    reply: Arc<dyn QueryReply>,
}

/// Synthetic backend playing sine tones
pub struct ToneBackend {
    inner: Arc<ToneInner>,
    producer: Mutex<Option<JoinHandle<()>>>,
    queries: Mutex<Option<Sender<QueryJob>>>,
    query_worker: Mutex<Option<JoinHandle<()>>>,
    scheduler: Arc<TimerScheduler>,
    position_timer: Timer,
}

impl ToneBackend {
    /// Start the producer and query threads and the position timer.
    pub fn new(
        audio: AudioConfig,
        sink: Arc<dyn AudioSink>,
        scheduler: Arc<TimerScheduler>,
    ) -> Result<Self, AudioError> {
        // Reject formats the generator cannot render
        ToneGenerator::new(440.0, audio.sample_rate, audio.channels)?;

        let inner = Arc::new(ToneInner {
            catalog: Catalog::build(),
            audio,
            player: Mutex::new(Player {
                state: PlaybackState::Stopped,
                playlist_uri: None,
                tracks: Vec::new(),
                order: Vec::new(),
                cursor: 0,
                generator: None,
                volume: 50,
                shuffle: false,
                repeat: RepeatMode::Off,
                generation: 0,
            }),
            wake: Condvar::new(),
            sink,
            listener: RwLock::new(None),
            running: AtomicBool::new(true),
        });

        let producer_inner = inner.clone();
        let producer = thread::Builder::new()
            .name("tone-producer".to_string())
            .spawn(move || produce(producer_inner))
            .map_err(|e| AudioError::Spawn(e.to_string()))?;

        let (tx, rx) = unbounded();
        let worker_inner = Arc::downgrade(&inner);
        let query_worker = thread::Builder::new()
            .name("tone-query".to_string())
            .spawn(move || answer_queries(worker_inner, rx))
            .map_err(|e| AudioError::Spawn(e.to_string()))?;

        let timer_inner = Arc::downgrade(&inner);
        let position_timer = Timer::new("tone-position", move || report_position(&timer_inner));
        scheduler.add(&position_timer, true, POSITION_INTERVAL_MS);

        tracing::info!("Tone backend started with {} tracks", inner.catalog.tracks.len());

        Ok(Self {
            inner,
            producer: Mutex::new(Some(producer)),
            queries: Mutex::new(Some(tx)),
            query_worker: Mutex::new(Some(query_worker)),
            scheduler,
            position_timer,
        })
    }
}

impl MediaBackend for ToneBackend {
    fn command(&self, command: PlaybackCommand) -> Result<(), BackendError> {
        if !self.inner.running.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable);
        }
        tracing::debug!("Tone backend command {:?}", command);

        let mut events = Vec::new();
        let result = self.inner.apply(command, &mut events);
        self.inner.emit(events);
        result
    }

    fn query(&self, query: MediaQuery, token: RequestToken, reply: Arc<dyn QueryReply>) {
        let queries = self.queries.lock().clone();
        match queries {
            Some(tx) => {
                if let Err(e) = tx.send(QueryJob { query, token, reply }) {
                    let job = e.0;
                    job.reply.reply(job.token, Err(BackendError::Unavailable));
                }
            }
            None => reply.reply(token, Err(BackendError::Unavailable)),
        }
    }

    fn set_event_sink(&self, listener: Arc<dyn StatusListener>) {
        *self.inner.listener.write() = Some(listener);
    }

    fn status(&self) -> PlayerStatus {
        self.inner.player.lock().status()
    }

    fn shutdown(&self) {
        self.scheduler.cancel(&self.position_timer);
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.wake.notify_all();

        if let Some(handle) = self.producer.lock().take() {
            if handle.join().is_err() {
                tracing::error!("Tone producer panicked");
            }
        }

        self.queries.lock().take();
        if let Some(handle) = self.query_worker.lock().take() {
            if handle.join().is_err() {
                tracing::error!("Tone query worker panicked");
            }
            tracing::info!("Tone backend stopped");
        }
    }
}

impl Drop for ToneBackend {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn produce(inner: Arc<ToneInner>) {
    let samples = inner.audio.samples_per_chunk();
    let chunk_duration = Duration::from_millis(inner.audio.chunk_ms as u64);
    let backoff = Duration::from_millis(inner.audio.producer_backoff_ms.max(1));

    loop {
        let (chunk, generation, events) = {
            let mut player = inner.player.lock();
            loop {
                if !inner.running.load(Ordering::SeqCst) {
                    return;
                }
                if player.state == PlaybackState::Playing && player.generator.is_some() {
                    break;
                }
                inner.wake.wait(&mut player);
            }

            let Some(generator) = player.generator.as_mut() else {
                continue;
            };
            let chunk = generator.next_chunk(samples);
            let position = generator.position_ms();

            let mut events = Vec::new();
            let duration = player.current().map_or(0, |t| t.info.duration_ms);
            if position >= duration {
                player.track_finished(&inner.audio, &mut events);
            }
            (chunk, player.generation, events)
        };
        inner.emit(events);

        loop {
            let outcome = {
                let player = inner.player.lock();
                if player.generation != generation {
                    break;
                }
                inner.sink.deliver(&chunk)
            };
            match outcome {
                SinkOutcome::Accepted | SinkOutcome::Partial => break,
                SinkOutcome::NoListeners => {
                    // Keep real-time pace when nobody is buffering
                    thread::sleep(chunk_duration);
                    break;
                }
                SinkOutcome::Rejected => {
                    thread::sleep(backoff);
                    let player = inner.player.lock();
                    let stale = player.generation != generation || player.state != PlaybackState::Playing;
                    if stale || !inner.running.load(Ordering::SeqCst) {
                        break;
                    }
                }
            }
        }
    }
}

fn answer_queries(inner: Weak<ToneInner>, jobs: Receiver<QueryJob>) {
    for job in jobs.iter() {
        let result = match inner.upgrade() {
            Some(inner) => {
                let status = inner.player.lock().status();
                inner.catalog.answer(&job.query, status)
            }
            None => Err(BackendError::Unavailable),
        };
        job.reply.reply(job.token, result);
    }
}

fn report_position(inner: &Weak<ToneInner>) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let position = {
        let player = inner.player.lock();
        if player.state != PlaybackState::Playing {
            return;
        }
        player.position_ms()
    };
    inner.emit(vec![StatusEvent::position(position)]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioChunk;
    use crate::backend::StatusEventKind;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    #[derive(Default)]
    struct CountingSink {
        chunks: AtomicUsize,
        reject: AtomicBool,
        timestamps: Mutex<Vec<u32>>,
        /// `timestamps.len()` at each flush
        flushes: Mutex<Vec<usize>>,
    }

    impl AudioSink for CountingSink {
        fn deliver(&self, chunk: &AudioChunk) -> SinkOutcome {
            if self.reject.load(Ordering::SeqCst) {
                return SinkOutcome::Rejected;
            }
            // Stand-in for queue backpressure
            thread::sleep(Duration::from_millis(2));
            self.chunks.fetch_add(1, Ordering::SeqCst);
            self.timestamps.lock().push(chunk.timestamp());
            SinkOutcome::Accepted
        }

        fn flush(&self) {
            let delivered = self.timestamps.lock().len();
            self.flushes.lock().push(delivered);
        }
    }

    #[derive(Default)]
    struct EventLog(Mutex<Vec<StatusEvent>>);

    impl StatusListener for EventLog {
        fn on_status(&self, event: &StatusEvent) {
            self.0.lock().push(event.clone());
        }
    }

    struct ReplyChannel(Sender<(RequestToken, Result<QueryResult, BackendError>)>);

    impl QueryReply for ReplyChannel {
        fn reply(&self, token: RequestToken, result: Result<QueryResult, BackendError>) {
            let _ = self.0.send((token, result));
        }
    }

    fn backend(sink: Arc<CountingSink>) -> (ToneBackend, Arc<EventLog>) {
        let scheduler = Arc::new(TimerScheduler::start().unwrap());
        let backend = ToneBackend::new(AudioConfig::default(), sink, scheduler).unwrap();
        let log = Arc::new(EventLog::default());
        backend.set_event_sink(log.clone());
        (backend, log)
    }

    fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        done()
    }

    fn ask(backend: &ToneBackend, query: MediaQuery) -> Result<QueryResult, BackendError> {
        let (tx, rx) = unbounded();
        backend.query(query, 7, Arc::new(ReplyChannel(tx)));
        let (token, result) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(token, 7);
        result
    }

    #[test]
    fn test_play_produces_audio_and_events() {
        let sink = Arc::new(CountingSink::default());
        let (backend, log) = backend(sink.clone());

        backend
            .command(PlaybackCommand::Play {
                playlist: Some("tone:playlist:concert-pitch".into()),
                track: Some("tone:track:a4".into()),
            })
            .unwrap();

        assert!(wait_until(Duration::from_secs(2), || sink.chunks.load(Ordering::SeqCst) >= 5));
        let status = backend.status();
        assert_eq!(status.state, PlaybackState::Playing);
        assert_eq!(status.track.unwrap().title, "A4");

        let kinds: Vec<StatusEventKind> = log.0.lock().iter().map(|e| e.kind).collect();
        assert_eq!(&kinds[..2], &[StatusEventKind::Track, StatusEventKind::State]);

        let timestamps = sink.timestamps.lock().clone();
        assert!(timestamps.windows(2).all(|w| w[1] == w[0] + 10));
    }

    #[test]
    fn test_pause_stops_production() {
        let sink = Arc::new(CountingSink::default());
        let (backend, _log) = backend(sink.clone());

        backend
            .command(PlaybackCommand::Play { playlist: None, track: None })
            .unwrap();
        assert!(wait_until(Duration::from_secs(2), || sink.chunks.load(Ordering::SeqCst) > 0));
        backend.command(PlaybackCommand::Pause).unwrap();
        thread::sleep(Duration::from_millis(50));

        let paused_at = sink.chunks.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(sink.chunks.load(Ordering::SeqCst), paused_at);
        assert_eq!(backend.status().state, PlaybackState::Paused);
    }

    #[test]
    fn test_rejected_chunks_are_retried() {
        let sink = Arc::new(CountingSink::default());
        sink.reject.store(true, Ordering::SeqCst);
        let (backend, _log) = backend(sink.clone());

        backend
            .command(PlaybackCommand::Play { playlist: None, track: None })
            .unwrap();
        thread::sleep(Duration::from_millis(50));
        sink.reject.store(false, Ordering::SeqCst);

        assert!(wait_until(Duration::from_secs(2), || sink.chunks.load(Ordering::SeqCst) >= 2));
        // The chunk held back during rejection is delivered first
        assert_eq!(sink.timestamps.lock()[0], 0);
    }

    #[test]
    fn test_seek_flush_is_not_followed_by_stale_audio() {
        let sink = Arc::new(CountingSink::default());
        let (backend, _log) = backend(sink.clone());

        backend
            .command(PlaybackCommand::Play {
                playlist: Some("tone:playlist:concert-pitch".into()),
                track: Some("tone:track:a4".into()),
            })
            .unwrap();
        assert!(wait_until(Duration::from_secs(2), || sink.chunks.load(Ordering::SeqCst) >= 3));

        for round in 1..=5u32 {
            let target = round * 3_000;
            backend.command(PlaybackCommand::Seek { position_ms: target }).unwrap();
            let flushed_at = *sink.flushes.lock().last().unwrap();
            assert!(wait_until(Duration::from_secs(2), || sink.timestamps.lock().len() >= flushed_at + 3));

            let timestamps = sink.timestamps.lock().clone();
            assert!(
                timestamps[flushed_at..].iter().all(|&ts| ts >= target),
                "chunk from before the seek to {target}ms delivered after the flush: {:?}",
                &timestamps[flushed_at..]
            );
        }
        assert_eq!(sink.flushes.lock().len(), 6);
    }

    #[test]
    fn test_navigation() {
        let sink = Arc::new(CountingSink::default());
        let (backend, _log) = backend(sink);

        backend
            .command(PlaybackCommand::Play {
                playlist: Some("tone:playlist:beeps".into()),
                track: None,
            })
            .unwrap();
        backend.command(PlaybackCommand::Next).unwrap();
        assert_eq!(backend.status().track.unwrap().uri, "tone:track:short-low");

        // Past the last track without repeat: stopped
        backend.command(PlaybackCommand::Next).unwrap();
        assert_eq!(backend.status().state, PlaybackState::Stopped);

        backend.command(PlaybackCommand::SetRepeat(RepeatMode::All)).unwrap();
        backend
            .command(PlaybackCommand::Play {
                playlist: Some("tone:playlist:beeps".into()),
                track: Some("tone:track:short-low".into()),
            })
            .unwrap();
        backend.command(PlaybackCommand::Next).unwrap();
        assert_eq!(backend.status().track.unwrap().uri, "tone:track:short-high");
    }

    #[test]
    fn test_command_errors() {
        let sink = Arc::new(CountingSink::default());
        let (backend, _log) = backend(sink);

        assert_eq!(
            backend.command(PlaybackCommand::Seek { position_ms: 10 }),
            Err(BackendError::NothingToPlay)
        );
        assert_eq!(
            backend.command(PlaybackCommand::Play {
                playlist: Some("tone:playlist:missing".into()),
                track: None
            }),
            Err(BackendError::NotFound("tone:playlist:missing".into()))
        );
        assert!(matches!(
            backend.command(PlaybackCommand::SetVolume(101)),
            Err(BackendError::InvalidArgument(_))
        ));

        backend.shutdown();
        assert_eq!(backend.command(PlaybackCommand::Pause), Err(BackendError::Unavailable));
    }

    #[test]
    fn test_queries_answer_with_token() {
        let sink = Arc::new(CountingSink::default());
        let (backend, _log) = backend(sink);

        let Ok(QueryResult::Playlists(playlists)) = ask(&backend, MediaQuery::Playlists) else {
            panic!("expected playlists");
        };
        assert_eq!(playlists[0].uri, "tone:playlist:all");
        assert_eq!(playlists[0].track_count, 9);

        let Ok(QueryResult::Artist(artist)) = ask(
            &backend,
            MediaQuery::Artist { uri: "tone:artist:oscillator".into() },
        ) else {
            panic!("expected artist");
        };
        assert_eq!(artist.albums.len(), 2);

        let Ok(QueryResult::Search(hits)) = ask(&backend, MediaQuery::Search { query: "octave".into() }) else {
            panic!("expected search hits");
        };
        assert_eq!(hits.len(), 2);

        let Ok(QueryResult::Image { data, .. }) = ask(&backend, MediaQuery::Image { uri: "tone:track:a4".into() }) else {
            panic!("expected image");
        };
        assert!(data.starts_with(b"P6\n8 8\n255\n"));
        assert_eq!(data.len(), 11 + 8 * 8 * 3);

        assert_eq!(
            ask(&backend, MediaQuery::Tracks { playlist: "nope".into() }),
            Err(BackendError::NotFound("nope".into()))
        );
    }

    #[test]
    fn test_shuffle_keeps_current_track() {
        let sink = Arc::new(CountingSink::default());
        let (backend, _log) = backend(sink);
        backend
            .command(PlaybackCommand::Play {
                playlist: None,
                track: Some("tone:track:octave".into()),
            })
            .unwrap();
        backend.command(PlaybackCommand::SetShuffle(true)).unwrap();

        let status = backend.status();
        assert!(status.shuffle);
        assert_eq!(status.track.unwrap().uri, "tone:track:octave");
    }
}
