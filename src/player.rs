//! Per-guild playback queues and the driver that advances them.
//!
//! The [`Jukebox`] owns every guild queue. Commands mutate it directly; the
//! audio side reports back through [`PlaybackEvent`]s which [`Jukebox::drive`]
//! feeds into the same transitions. A queue's lifetime is:
//!
//! - created by the first `play` in a guild, then connecting (`Loading`)
//! - each head track goes `Loading` -> `Playing` <-> `Paused`
//! - a finished, skipped or unplayable head is popped and the next one loaded
//! - an empty queue, `stop`, or a lost voice connection removes the entry

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serenity::model::id::{ChannelId, GuildId};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, info_span, warn};
use tracing_futures::Instrument;

use crate::config::PlayerConfig;
use crate::error::PlayerError;
use crate::models::{Caller, Enqueued, QueueView, Track};
use crate::render::{self, Notice};

pub type EventSender = mpsc::UnboundedSender<PlaybackEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<PlaybackEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// The track started under `generation` finished or was stopped.
    TrackEnded { guild: GuildId, generation: u64 },
    /// The bot left its voice channel, on request or not.
    Disconnected { guild: GuildId },
}

impl PlaybackEvent {
    pub fn guild(&self) -> GuildId {
        match self {
            PlaybackEvent::TrackEnded { guild, .. } | PlaybackEvent::Disconnected { guild } => *guild,
        }
    }
}

/// Tags a started track so its end can be matched to the right queue head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cue {
    pub guild: GuildId,
    pub generation: u64,
}

impl Cue {
    pub fn ended(self) -> PlaybackEvent {
        PlaybackEvent::TrackEnded {
            guild: self.guild,
            generation: self.generation,
        }
    }
}

/// Everything the player needs from the outside world.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    type Stream: Send + 'static;
    type Connection: VoiceConnection<Stream = Self::Stream>;

    fn is_valid_url(&self, url: &str) -> bool;

    async fn resolve(&self, url: &str, requested_by: &str) -> Result<Track, PlayerError>;

    async fn connect(
        &self,
        guild: GuildId,
        channel: ChannelId,
        events: EventSender,
    ) -> Result<Self::Connection, PlayerError>;

    async fn open(&self, track: &Track) -> Result<Self::Stream, PlayerError>;

    /// Delivery failures are logged, never returned.
    async fn notify(&self, channel: ChannelId, notice: Notice);
}

/// A joined voice channel together with its audio output.
#[async_trait]
pub trait VoiceConnection: Send + 'static {
    type Stream: Send + 'static;

    /// Starts `stream`; its end must be reported as `cue.ended()`.
    async fn play(&mut self, stream: Self::Stream, cue: Cue) -> Result<(), PlayerError>;

    fn pause(&mut self) -> Result<(), PlayerError>;

    fn resume(&mut self) -> Result<(), PlayerError>;

    /// Stops the current track, which still reports its end.
    fn stop(&mut self) -> Result<(), PlayerError>;

    async fn leave(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Loading,
    Playing,
    Paused,
}

struct GuildQueue<C> {
    session: u64,
    text_channel: ChannelId,
    voice_channel: ChannelId,
    connection: Option<C>,
    songs: VecDeque<Track>,
    is_playing: bool,
    /// Id of the head currently loading or playing.
    generation: u64,
    /// Whether the head has been handed to the audio output.
    live: bool,
    failures: u32,
}

impl<C> GuildQueue<C> {
    fn new(session: u64, text_channel: ChannelId, voice_channel: ChannelId, first: Track) -> Self {
        GuildQueue {
            session,
            text_channel,
            voice_channel,
            connection: None,
            songs: VecDeque::from([first]),
            is_playing: true,
            generation: 0,
            live: false,
            failures: 0,
        }
    }

    fn state(&self) -> PlaybackState {
        match (self.live, self.is_playing) {
            (false, _) => PlaybackState::Loading,
            (true, true) => PlaybackState::Playing,
            (true, false) => PlaybackState::Paused,
        }
    }
}

/// Why a queue is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Leave {
    /// We leave the channel ourselves; the gateway will echo a disconnect.
    Requested,
    /// The channel is already gone.
    Kicked,
}

pub struct Jukebox<B: Backend> {
    backend: B,
    queues: Mutex<HashMap<GuildId, GuildQueue<B::Connection>>>,
    /// Own departures whose disconnect has not been seen yet, per guild.
    departing: Mutex<HashMap<GuildId, u32>>,
    events: EventSender,
    /// Source of session and generation ids, unique for the process.
    ids: AtomicU64,
    timeout: Duration,
    max_failures: u32,
}

impl<B: Backend> Jukebox<B> {
    pub fn new(backend: B, config: &PlayerConfig) -> (Arc<Self>, EventReceiver) {
        let (events, receiver) = mpsc::unbounded_channel();

        let jukebox = Jukebox {
            backend,
            queues: Mutex::new(HashMap::new()),
            departing: Mutex::new(HashMap::new()),
            events,
            ids: AtomicU64::new(1),
            timeout: config.timeout(),
            max_failures: config.max_consecutive_failures.max(1),
        };

        (Arc::new(jukebox), receiver)
    }

    pub fn events(&self) -> EventSender {
        self.events.clone()
    }

    fn next_id(&self) -> u64 {
        self.ids.fetch_add(1, Ordering::Relaxed)
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, PlayerError>>,
        on_timeout: impl FnOnce(String) -> PlayerError,
    ) -> Result<T, PlayerError> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(on_timeout(format!("timed out after {:?}", self.timeout))),
        }
    }

    /// Adds the track at `url` to the guild queue, joining the caller's
    /// voice channel if the guild has no queue yet.
    pub async fn play(
        &self,
        guild: GuildId,
        text_channel: ChannelId,
        caller: &Caller,
        url: Option<&str>,
    ) -> Result<Enqueued, PlayerError> {
        let voice_channel = caller.voice_channel.ok_or_else(|| PlayerError::not_in_voice("play"))?;

        if !caller.bot_can_speak {
            return Err(PlayerError::PermissionDenied {
                reason: "I need the permissions to join and speak in your voice channel!".to_string(),
            });
        }

        let url = url.ok_or_else(|| PlayerError::InvalidInput {
            reason: "Please provide a YouTube URL!".to_string(),
        })?;

        if !self.backend.is_valid_url(url) {
            return Err(PlayerError::InvalidInput {
                reason: "Please provide a valid YouTube URL!".to_string(),
            });
        }

        let track = self
            .bounded(self.backend.resolve(url, &caller.tag), PlayerError::metadata)
            .await?;

        // Reserve the entry before connecting so that concurrent plays append.
        let session = {
            let mut queues = self.queues.lock().await;

            if let Some(queue) = queues.get_mut(&guild) {
                queue.songs.push_back(track.clone());
                let position = queue.songs.len();
                info!("Queued {} at position {position} in guild {guild}", track.title);

                return Ok(Enqueued::Queued { track, position });
            }

            let session = self.next_id();
            queues.insert(guild, GuildQueue::new(session, text_channel, voice_channel, track.clone()));
            session
        };

        info!("Joining voice channel {voice_channel} in guild {guild}");
        let connected = self
            .bounded(
                self.backend.connect(guild, voice_channel, self.events()),
                PlayerError::connection,
            )
            .await;

        let mut queues = self.queues.lock().await;
        let reserved = queues.get(&guild).map_or(false, |queue| queue.session == session);

        match connected {
            Ok(connection) if reserved => {
                if let Some(queue) = queues.get_mut(&guild) {
                    queue.connection = Some(connection);
                }
            }
            Ok(connection) => {
                drop(queues);
                self.depart(guild, connection).await;
                return Err(PlayerError::connection("playback was stopped while connecting"));
            }
            Err(error) => {
                if reserved {
                    queues.remove(&guild);
                }
                warn!("Could not join voice in guild {guild}: {error:?}");
                return Err(error);
            }
        }
        drop(queues);

        self.advance(guild).await;

        Ok(Enqueued::Started(track))
    }

    /// Drops the head track and starts the next one.
    pub async fn skip(&self, guild: GuildId, caller: &Caller) -> Result<Track, PlayerError> {
        const ACTION: &str = "skip";

        if caller.voice_channel.is_none() {
            return Err(PlayerError::not_in_voice(ACTION));
        }

        let mut queues = self.queues.lock().await;
        let queue = queues
            .get_mut(&guild)
            .ok_or(PlayerError::NothingPlaying { action: ACTION })?;
        let head = queue
            .songs
            .front()
            .cloned()
            .ok_or(PlayerError::NothingPlaying { action: ACTION })?;

        info!("Skipping {} in guild {guild}", head.title);

        if queue.live {
            if let Some(connection) = queue.connection.as_mut() {
                connection.stop()?;
            }
        }

        // A new generation makes the stopped track's end event and any
        // in-flight load stale, so the next skip acts on the next head.
        let connected = queue.connection.is_some();
        queue.songs.pop_front();
        queue.generation = self.next_id();
        queue.live = false;
        drop(queues);

        if connected {
            self.advance(guild).await;
        }

        Ok(head)
    }

    /// Drops the whole queue and leaves the voice channel.
    pub async fn stop(&self, guild: GuildId, caller: &Caller) -> Result<(), PlayerError> {
        const ACTION: &str = "stop";

        if caller.voice_channel.is_none() {
            return Err(PlayerError::not_in_voice(ACTION));
        }

        let queue = self
            .queues
            .lock()
            .await
            .remove(&guild)
            .ok_or(PlayerError::NothingPlaying { action: ACTION })?;

        info!("Stopping playback in guild {guild}, dropping {} songs", queue.songs.len());
        self.teardown(guild, queue, Leave::Requested).await;

        Ok(())
    }

    pub async fn pause(&self, guild: GuildId, caller: &Caller) -> Result<(), PlayerError> {
        if caller.voice_channel.is_none() {
            return Err(PlayerError::not_in_voice("pause"));
        }

        let mut queues = self.queues.lock().await;
        let queue = queues
            .get_mut(&guild)
            .filter(|queue| queue.is_playing)
            .ok_or(PlayerError::NothingToPause)?;

        if queue.live {
            if let Some(connection) = queue.connection.as_mut() {
                connection.pause()?;
            }
        }
        queue.is_playing = false;

        Ok(())
    }

    pub async fn resume(&self, guild: GuildId, caller: &Caller) -> Result<(), PlayerError> {
        if caller.voice_channel.is_none() {
            return Err(PlayerError::not_in_voice("resume"));
        }

        let mut queues = self.queues.lock().await;
        let queue = queues
            .get_mut(&guild)
            .filter(|queue| !queue.is_playing)
            .ok_or(PlayerError::NothingToResume)?;

        if queue.live {
            if let Some(connection) = queue.connection.as_mut() {
                connection.resume()?;
            }
        }
        queue.is_playing = true;

        Ok(())
    }

    pub async fn list(&self, guild: GuildId) -> Result<QueueView, PlayerError> {
        let queues = self.queues.lock().await;

        match queues.get(&guild) {
            Some(queue) if !queue.songs.is_empty() => Ok(QueueView::of(queue.songs.iter())),
            _ => Err(PlayerError::EmptyQueue),
        }
    }

    /// Consumes driver events until every sender is gone.
    pub async fn drive(self: Arc<Self>, mut events: EventReceiver) {
        while let Some(event) = events.recv().await {
            let jukebox = self.clone();
            let span = info_span!("playback", guild = %event.guild());

            tokio::spawn(async move { jukebox.handle(event).await }.instrument(span));
        }

        debug!("Playback event channel closed");
    }

    pub async fn handle(&self, event: PlaybackEvent) {
        match event {
            PlaybackEvent::TrackEnded { guild, generation } => self.track_ended(guild, generation).await,
            PlaybackEvent::Disconnected { guild } => self.disconnected(guild).await,
        }
    }

    async fn track_ended(&self, guild: GuildId, generation: u64) {
        {
            let mut queues = self.queues.lock().await;
            let queue = match queues.get_mut(&guild) {
                Some(queue) if queue.live && queue.generation == generation => queue,
                _ => {
                    debug!("Ignoring end of stale track {generation}");
                    return;
                }
            };

            queue.live = false;
            if let Some(finished) = queue.songs.pop_front() {
                debug!("Finished {}", finished.title);
            }
        }

        self.advance(guild).await;
    }

    async fn disconnected(&self, guild: GuildId) {
        {
            let mut departing = self.departing.lock().await;
            if let Some(pending) = departing.get_mut(&guild) {
                *pending -= 1;
                if *pending == 0 {
                    departing.remove(&guild);
                }
                debug!("Ignoring disconnect from our own leave in guild {guild}");
                return;
            }
        }

        let queue = {
            let mut queues = self.queues.lock().await;
            let joining = match queues.get(&guild) {
                Some(queue) => queue.connection.is_none(),
                None => return,
            };
            if joining {
                debug!("Ignoring disconnect while joining voice in guild {guild}");
                return;
            }
            queues.remove(&guild)
        };

        if let Some(queue) = queue {
            info!(
                "Disconnected from voice in guild {guild} while {:?}, dropping {} songs",
                queue.state(),
                queue.songs.len()
            );
            self.teardown(guild, queue, Leave::Kicked).await;
        }
    }

    /// Starts the head of the queue, dropping heads that fail to open.
    /// An empty queue is torn down.
    async fn advance(&self, guild: GuildId) {
        loop {
            let (generation, track) = {
                let mut queues = self.queues.lock().await;
                let Some(queue) = queues.get_mut(&guild) else {
                    return;
                };

                match queue.songs.front().cloned() {
                    Some(track) => {
                        queue.generation = self.next_id();
                        queue.live = false;
                        (queue.generation, track)
                    }
                    None => {
                        let queue = queues.remove(&guild);
                        drop(queues);

                        if let Some(queue) = queue {
                            info!("Queue finished in guild {guild}");
                            self.teardown(guild, queue, Leave::Requested).await;
                        }
                        return;
                    }
                }
            };

            debug!("Loading {} - {}", track.title, track.url);
            let opened = self
                .bounded(self.backend.open(&track), PlayerError::stream)
                .await;

            let mut queues = self.queues.lock().await;
            let queue = match queues.get_mut(&guild) {
                Some(queue) if queue.generation == generation => queue,
                _ => {
                    debug!("Load of {} was superseded", track.title);
                    return;
                }
            };

            let started = match (opened, queue.connection.as_mut()) {
                (Ok(stream), Some(connection)) => connection.play(stream, Cue { guild, generation }).await,
                (Ok(_), None) => Err(PlayerError::stream("no voice connection")),
                (Err(error), _) => Err(error),
            };

            match started {
                Ok(()) => {
                    queue.live = true;
                    queue.failures = 0;

                    if !queue.is_playing {
                        if let Some(connection) = queue.connection.as_mut() {
                            if let Err(error) = connection.pause() {
                                warn!("Could not apply pending pause: {error:?}");
                            }
                        }
                    }

                    let channel = queue.text_channel;
                    drop(queues);

                    info!("Playing {} in guild {guild}", track.title);
                    self.backend.notify(channel, render::now_playing(&track)).await;
                    return;
                }
                Err(error) => {
                    warn!("Could not play {} ({}): {error:?}", track.title, track.url);

                    queue.songs.pop_front();
                    queue.failures += 1;

                    if queue.failures >= self.max_failures {
                        warn!(
                            "{} tracks failed in a row in guild {guild}, giving up on {} more",
                            queue.failures,
                            queue.songs.len()
                        );
                        queue.songs.clear();
                    }

                    let channel = queue.text_channel;
                    drop(queues);

                    self.backend.notify(channel, render::track_failed(&track, &error)).await;
                }
            }
        }
    }

    async fn teardown(&self, guild: GuildId, mut queue: GuildQueue<B::Connection>, leave: Leave) {
        queue.songs.clear();

        if let Some(mut connection) = queue.connection.take() {
            if queue.live {
                if let Err(error) = connection.stop() {
                    debug!("Stopping track during teardown failed: {error:?}");
                }
            }
            debug!("Leaving voice channel {}", queue.voice_channel);

            match leave {
                Leave::Requested => self.depart(guild, connection).await,
                Leave::Kicked => connection.leave().await,
            }
        }
    }

    /// Leaves voice, remembering that the resulting disconnect is ours.
    async fn depart(&self, guild: GuildId, mut connection: B::Connection) {
        *self.departing.lock().await.entry(guild).or_default() += 1;
        connection.leave().await;
    }

    #[cfg(test)]
    pub async fn state(&self, guild: GuildId) -> Option<PlaybackState> {
        self.queues.lock().await.get(&guild).map(GuildQueue::state)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;

    use tokio::sync::Notify;

    use super::*;

    const GUILD: GuildId = GuildId(1);
    const TEXT: ChannelId = ChannelId(10);
    const VOICE: ChannelId = ChannelId(20);

    #[derive(Default)]
    struct Log {
        calls: Vec<String>,
        notices: Vec<Notice>,
        last_cue: Option<Cue>,
    }

    #[derive(Clone, Default)]
    struct FakeBackend {
        log: Arc<StdMutex<Log>>,
        broken: Arc<StdMutex<HashSet<String>>>,
        refuse_connect: bool,
        connect_gate: Option<Arc<Notify>>,
        /// Holds `open` of the named track until notified.
        open_gate: Option<(String, Arc<Notify>)>,
    }

    impl FakeBackend {
        fn calls(&self) -> Vec<String> {
            self.log.lock().unwrap().calls.clone()
        }

        fn played(&self) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter_map(|call| call.strip_prefix("play ").map(str::to_string))
                .collect()
        }

        fn notices(&self) -> Vec<Notice> {
            self.log.lock().unwrap().notices.clone()
        }

        fn break_track(&self, title: &str) {
            self.broken.lock().unwrap().insert(title.to_string());
        }

        /// The event the audio output would send when the current track ends.
        fn natural_end(&self) -> PlaybackEvent {
            self.log.lock().unwrap().last_cue.expect("a track was started").ended()
        }
    }

    #[async_trait]
    impl Backend for FakeBackend {
        type Stream = String;
        type Connection = FakeConnection;

        fn is_valid_url(&self, url: &str) -> bool {
            url.starts_with("https://")
        }

        async fn resolve(&self, url: &str, requested_by: &str) -> Result<Track, PlayerError> {
            let title = url.rsplit('/').next().unwrap_or_default();

            match title {
                "missing" => Err(PlayerError::metadata("video unavailable")),
                "hang" => std::future::pending().await,
                _ => Ok(Track {
                    title: title.to_string(),
                    url: url.to_string(),
                    duration_secs: 60,
                    thumbnail: String::new(),
                    requested_by: requested_by.to_string(),
                }),
            }
        }

        async fn connect(
            &self,
            _guild: GuildId,
            _channel: ChannelId,
            events: EventSender,
        ) -> Result<FakeConnection, PlayerError> {
            if let Some(gate) = &self.connect_gate {
                gate.notified().await;
            }
            if self.refuse_connect {
                return Err(PlayerError::connection("missing access"));
            }

            self.log.lock().unwrap().calls.push("connect".to_string());
            Ok(FakeConnection {
                log: self.log.clone(),
                events,
                current: None,
            })
        }

        async fn open(&self, track: &Track) -> Result<String, PlayerError> {
            if let Some((title, gate)) = &self.open_gate {
                if *title == track.title {
                    gate.notified().await;
                }
            }
            if self.broken.lock().unwrap().contains(&track.title) {
                return Err(PlayerError::stream("HTTP 403"));
            }
            Ok(track.title.clone())
        }

        async fn notify(&self, _channel: ChannelId, notice: Notice) {
            self.log.lock().unwrap().notices.push(notice);
        }
    }

    struct FakeConnection {
        log: Arc<StdMutex<Log>>,
        events: EventSender,
        current: Option<Cue>,
    }

    impl FakeConnection {
        fn record(&self, call: String) {
            self.log.lock().unwrap().calls.push(call);
        }
    }

    #[async_trait]
    impl VoiceConnection for FakeConnection {
        type Stream = String;

        async fn play(&mut self, stream: String, cue: Cue) -> Result<(), PlayerError> {
            self.record(format!("play {stream}"));
            self.current = Some(cue);
            self.log.lock().unwrap().last_cue = Some(cue);
            Ok(())
        }

        fn pause(&mut self) -> Result<(), PlayerError> {
            self.record("pause".to_string());
            Ok(())
        }

        fn resume(&mut self) -> Result<(), PlayerError> {
            self.record("resume".to_string());
            Ok(())
        }

        fn stop(&mut self) -> Result<(), PlayerError> {
            self.record("stop".to_string());
            if let Some(cue) = self.current.take() {
                let _ = self.events.send(cue.ended());
            }
            Ok(())
        }

        async fn leave(&mut self) {
            self.record("leave".to_string());
        }
    }

    fn jukebox(backend: &FakeBackend) -> (Arc<Jukebox<FakeBackend>>, EventReceiver) {
        Jukebox::new(backend.clone(), &PlayerConfig::default())
    }

    fn listener() -> Caller {
        Caller {
            tag: "listener#0001".to_string(),
            voice_channel: Some(VOICE),
            bot_can_speak: true,
        }
    }

    fn outsider() -> Caller {
        Caller {
            voice_channel: None,
            ..listener()
        }
    }

    fn url(title: &str) -> String {
        format!("https://youtu.be/{title}")
    }

    async fn play(jukebox: &Jukebox<FakeBackend>, title: &str) -> Result<Enqueued, PlayerError> {
        jukebox.play(GUILD, TEXT, &listener(), Some(&url(title))).await
    }

    /// Runs every event the fakes have emitted so far.
    async fn pump(jukebox: &Jukebox<FakeBackend>, events: &mut EventReceiver) {
        while let Ok(event) = events.try_recv() {
            jukebox.handle(event).await;
        }
    }

    async fn titles(jukebox: &Jukebox<FakeBackend>) -> Vec<String> {
        match jukebox.list(GUILD).await {
            Ok(view) => view.songs.into_iter().map(|t| t.title).collect(),
            Err(_) => Vec::new(),
        }
    }

    #[tokio::test]
    async fn first_play_starts_and_later_plays_append() {
        let backend = FakeBackend::default();
        let (jukebox, _events) = jukebox(&backend);

        let first = play(&jukebox, "a").await.unwrap();
        assert!(matches!(first, Enqueued::Started(ref t) if t.title == "a"));

        for (n, title) in ["b", "c", "d"].iter().enumerate() {
            match play(&jukebox, title).await.unwrap() {
                Enqueued::Queued { position, .. } => assert_eq!(position, n + 2),
                other => panic!("expected queued, got {other:?}"),
            }
        }

        assert_eq!(titles(&jukebox).await, vec!["a", "b", "c", "d"]);
        assert_eq!(backend.calls(), vec!["connect", "play a"]);
        assert_eq!(jukebox.state(GUILD).await, Some(PlaybackState::Playing));
        assert_eq!(backend.notices(), vec![render::now_playing(&Track {
            title: "a".to_string(),
            url: url("a"),
            duration_secs: 60,
            thumbnail: String::new(),
            requested_by: "listener#0001".to_string(),
        })]);
    }

    #[tokio::test]
    async fn play_during_connect_appends_to_reserved_queue() {
        let gate = Arc::new(Notify::new());
        let backend = FakeBackend {
            connect_gate: Some(gate.clone()),
            ..FakeBackend::default()
        };
        let (jukebox, _events) = jukebox(&backend);

        let connecting = {
            let jukebox = jukebox.clone();
            tokio::spawn(async move { jukebox.play(GUILD, TEXT, &listener(), Some(&url("a"))).await })
        };

        while jukebox.state(GUILD).await.is_none() {
            tokio::task::yield_now().await;
        }
        assert_eq!(jukebox.state(GUILD).await, Some(PlaybackState::Loading));

        let second = play(&jukebox, "b").await.unwrap();
        assert!(matches!(second, Enqueued::Queued { position: 2, .. }));

        gate.notify_one();
        let first = connecting.await.unwrap().unwrap();
        assert!(matches!(first, Enqueued::Started(_)));
        assert_eq!(backend.calls(), vec!["connect", "play a"]);
        assert_eq!(titles(&jukebox).await, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn natural_end_advances_fifo() {
        let backend = FakeBackend::default();
        let (jukebox, _events) = jukebox(&backend);

        for title in ["a", "b", "c"] {
            play(&jukebox, title).await.unwrap();
        }

        jukebox.handle(backend.natural_end()).await;
        assert_eq!(titles(&jukebox).await, vec!["b", "c"]);

        jukebox.handle(backend.natural_end()).await;
        assert_eq!(backend.played(), vec!["a", "b", "c"]);
        assert_eq!(backend.notices().len(), 3);
    }

    #[tokio::test]
    async fn skip_removes_one_head_and_tears_down_when_empty() {
        let backend = FakeBackend::default();
        let (jukebox, mut events) = jukebox(&backend);

        for title in ["a", "b", "c"] {
            play(&jukebox, title).await.unwrap();
        }

        let skipped = jukebox.skip(GUILD, &listener()).await.unwrap();
        assert_eq!(skipped.title, "a");
        pump(&jukebox, &mut events).await;
        assert_eq!(titles(&jukebox).await, vec!["b", "c"]);

        jukebox.skip(GUILD, &listener()).await.unwrap();
        pump(&jukebox, &mut events).await;
        assert_eq!(titles(&jukebox).await, vec!["c"]);

        jukebox.skip(GUILD, &listener()).await.unwrap();
        pump(&jukebox, &mut events).await;

        assert_eq!(jukebox.state(GUILD).await, None);
        assert_eq!(backend.played(), vec!["a", "b", "c"]);
        assert_eq!(backend.calls().last().map(String::as_str), Some("leave"));
        assert_eq!(
            jukebox.skip(GUILD, &listener()).await,
            Err(PlayerError::NothingPlaying { action: "skip" })
        );
    }

    #[tokio::test]
    async fn stale_end_events_are_ignored() {
        let backend = FakeBackend::default();
        let (jukebox, mut events) = jukebox(&backend);

        play(&jukebox, "a").await.unwrap();
        play(&jukebox, "b").await.unwrap();
        let end_of_a = backend.natural_end();

        jukebox.skip(GUILD, &listener()).await.unwrap();
        pump(&jukebox, &mut events).await;
        jukebox.handle(end_of_a).await;

        assert_eq!(titles(&jukebox).await, vec!["b"]);
        assert_eq!(jukebox.state(GUILD).await, Some(PlaybackState::Playing));
    }

    #[tokio::test]
    async fn back_to_back_skips_each_remove_a_track() {
        let backend = FakeBackend::default();
        let (jukebox, mut events) = jukebox(&backend);

        for title in ["a", "b", "c"] {
            play(&jukebox, title).await.unwrap();
        }

        let first = jukebox.skip(GUILD, &listener()).await.unwrap();
        let second = jukebox.skip(GUILD, &listener()).await.unwrap();
        pump(&jukebox, &mut events).await;

        assert_eq!(first.title, "a");
        assert_eq!(second.title, "b");
        assert_eq!(titles(&jukebox).await, vec!["c"]);
        assert_eq!(backend.played(), vec!["a", "b", "c"]);
        assert_eq!(jukebox.state(GUILD).await, Some(PlaybackState::Playing));
    }

    #[tokio::test]
    async fn skip_while_connecting_starts_the_next_song() {
        let gate = Arc::new(Notify::new());
        let backend = FakeBackend {
            connect_gate: Some(gate.clone()),
            ..FakeBackend::default()
        };
        let (jukebox, _events) = jukebox(&backend);

        let connecting = {
            let jukebox = jukebox.clone();
            tokio::spawn(async move { jukebox.play(GUILD, TEXT, &listener(), Some(&url("a"))).await })
        };
        while jukebox.state(GUILD).await.is_none() {
            tokio::task::yield_now().await;
        }
        play(&jukebox, "b").await.unwrap();

        let skipped = jukebox.skip(GUILD, &listener()).await.unwrap();
        assert_eq!(skipped.title, "a");
        assert_eq!(titles(&jukebox).await, vec!["b"]);

        gate.notify_one();
        connecting.await.unwrap().unwrap();

        assert_eq!(backend.played(), vec!["b"]);
        assert_eq!(titles(&jukebox).await, vec!["b"]);
        assert_eq!(jukebox.state(GUILD).await, Some(PlaybackState::Playing));
    }

    #[tokio::test]
    async fn stop_while_connecting_leaves_the_new_channel() {
        let gate = Arc::new(Notify::new());
        let backend = FakeBackend {
            connect_gate: Some(gate.clone()),
            ..FakeBackend::default()
        };
        let (jukebox, _events) = jukebox(&backend);

        let connecting = {
            let jukebox = jukebox.clone();
            tokio::spawn(async move { jukebox.play(GUILD, TEXT, &listener(), Some(&url("a"))).await })
        };
        while jukebox.state(GUILD).await.is_none() {
            tokio::task::yield_now().await;
        }

        jukebox.stop(GUILD, &listener()).await.unwrap();
        gate.notify_one();
        let result = connecting.await.unwrap();

        assert!(matches!(result, Err(PlayerError::ConnectionFailed { .. })));
        assert_eq!(backend.calls(), vec!["connect", "leave"]);
        assert_eq!(jukebox.state(GUILD).await, None);
    }

    #[tokio::test]
    async fn skip_during_a_slow_load_drops_that_load() {
        let gate = Arc::new(Notify::new());
        let backend = FakeBackend {
            open_gate: Some(("b".to_string(), gate.clone())),
            ..FakeBackend::default()
        };
        let (jukebox, _events) = jukebox(&backend);

        for title in ["a", "b", "c"] {
            play(&jukebox, title).await.unwrap();
        }

        let loading_b = {
            let jukebox = jukebox.clone();
            let end_of_a = backend.natural_end();
            tokio::spawn(async move { jukebox.handle(end_of_a).await })
        };
        while jukebox.state(GUILD).await != Some(PlaybackState::Loading) {
            tokio::task::yield_now().await;
        }

        let skipped = jukebox.skip(GUILD, &listener()).await.unwrap();
        assert_eq!(skipped.title, "b");

        gate.notify_one();
        loading_b.await.unwrap();

        assert_eq!(backend.played(), vec!["a", "c"]);
        assert_eq!(titles(&jukebox).await, vec!["c"]);
        assert_eq!(jukebox.state(GUILD).await, Some(PlaybackState::Playing));
    }

    #[tokio::test]
    async fn own_leave_does_not_end_a_newer_session() {
        let backend = FakeBackend::default();
        let (jukebox, _events) = jukebox(&backend);

        play(&jukebox, "a").await.unwrap();
        jukebox.stop(GUILD, &listener()).await.unwrap();
        play(&jukebox, "b").await.unwrap();

        // Gateway echo of the leave issued by `stop`.
        jukebox.handle(PlaybackEvent::Disconnected { guild: GUILD }).await;
        assert_eq!(titles(&jukebox).await, vec!["b"]);
        assert_eq!(jukebox.state(GUILD).await, Some(PlaybackState::Playing));

        jukebox.handle(PlaybackEvent::Disconnected { guild: GUILD }).await;
        assert_eq!(jukebox.state(GUILD).await, None);
    }

    #[tokio::test]
    async fn stop_always_removes_the_queue() {
        let backend = FakeBackend::default();
        let (jukebox, mut events) = jukebox(&backend);

        play(&jukebox, "a").await.unwrap();
        play(&jukebox, "b").await.unwrap();
        jukebox.pause(GUILD, &listener()).await.unwrap();

        jukebox.stop(GUILD, &listener()).await.unwrap();
        pump(&jukebox, &mut events).await;

        assert_eq!(jukebox.state(GUILD).await, None);
        assert_eq!(backend.calls().last().map(String::as_str), Some("leave"));
        assert_eq!(backend.played(), vec!["a"]);
        assert_eq!(
            jukebox.stop(GUILD, &listener()).await,
            Err(PlayerError::NothingPlaying { action: "stop" })
        );
    }

    #[tokio::test]
    async fn pause_then_resume_keeps_the_track() {
        let backend = FakeBackend::default();
        let (jukebox, _events) = jukebox(&backend);

        play(&jukebox, "a").await.unwrap();

        jukebox.pause(GUILD, &listener()).await.unwrap();
        assert_eq!(jukebox.state(GUILD).await, Some(PlaybackState::Paused));
        assert_eq!(jukebox.pause(GUILD, &listener()).await, Err(PlayerError::NothingToPause));

        jukebox.resume(GUILD, &listener()).await.unwrap();
        assert_eq!(jukebox.state(GUILD).await, Some(PlaybackState::Playing));
        assert_eq!(jukebox.resume(GUILD, &listener()).await, Err(PlayerError::NothingToResume));

        assert_eq!(backend.calls(), vec!["connect", "play a", "pause", "resume"]);
        assert_eq!(titles(&jukebox).await, vec!["a"]);
    }

    #[tokio::test]
    async fn pause_carries_over_to_the_next_track() {
        let backend = FakeBackend::default();
        let (jukebox, _events) = jukebox(&backend);

        play(&jukebox, "a").await.unwrap();
        play(&jukebox, "b").await.unwrap();
        jukebox.pause(GUILD, &listener()).await.unwrap();

        jukebox.handle(backend.natural_end()).await;

        assert_eq!(jukebox.state(GUILD).await, Some(PlaybackState::Paused));
        assert_eq!(backend.calls(), vec!["connect", "play a", "pause", "play b", "pause"]);
    }

    #[tokio::test]
    async fn stream_error_drops_the_track_and_moves_on() {
        let backend = FakeBackend::default();
        backend.break_track("3");
        let (jukebox, _events) = jukebox(&backend);

        for title in ["1", "2", "3", "4", "5"] {
            play(&jukebox, title).await.unwrap();
        }

        jukebox.handle(backend.natural_end()).await;
        jukebox.handle(backend.natural_end()).await;

        assert_eq!(backend.played(), vec!["1", "2", "4"]);
        assert_eq!(titles(&jukebox).await, vec!["4", "5"]);
        assert_eq!(jukebox.state(GUILD).await, Some(PlaybackState::Playing));

        let errors: Vec<Notice> = backend
            .notices()
            .into_iter()
            .filter(|n| n.colour == render::COLOUR_ERROR)
            .collect();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].description.as_deref().unwrap_or_default().contains("**3**"));
    }

    #[tokio::test]
    async fn repeated_stream_errors_end_the_session() {
        let backend = FakeBackend::default();
        for title in ["2", "3", "4"] {
            backend.break_track(title);
        }
        let config = PlayerConfig {
            max_consecutive_failures: 2,
            ..PlayerConfig::default()
        };
        let (jukebox, _events) = Jukebox::new(backend.clone(), &config);

        for title in ["1", "2", "3", "4", "5"] {
            play(&jukebox, title).await.unwrap();
        }
        jukebox.handle(backend.natural_end()).await;

        assert_eq!(jukebox.state(GUILD).await, None);
        assert_eq!(backend.played(), vec!["1"]);
        assert_eq!(backend.calls().last().map(String::as_str), Some("leave"));
    }

    #[tokio::test]
    async fn every_track_failing_tears_down() {
        let backend = FakeBackend::default();
        backend.break_track("a");
        let (jukebox, _events) = jukebox(&backend);

        let result = play(&jukebox, "a").await.unwrap();

        assert!(matches!(result, Enqueued::Started(_)));
        assert_eq!(jukebox.state(GUILD).await, None);
        assert_eq!(backend.calls(), vec!["connect", "leave"]);
    }

    #[tokio::test]
    async fn disconnect_discards_remaining_songs() {
        let backend = FakeBackend::default();
        let (jukebox, _events) = jukebox(&backend);

        for title in ["a", "b", "c"] {
            play(&jukebox, title).await.unwrap();
        }
        jukebox.handle(PlaybackEvent::Disconnected { guild: GUILD }).await;

        assert_eq!(jukebox.state(GUILD).await, None);
        assert_eq!(jukebox.list(GUILD).await.unwrap_err(), PlayerError::EmptyQueue);
    }

    #[tokio::test]
    async fn failed_connection_removes_the_new_queue() {
        let backend = FakeBackend {
            refuse_connect: true,
            ..FakeBackend::default()
        };
        let (jukebox, _events) = jukebox(&backend);

        let error = play(&jukebox, "a").await.unwrap_err();

        assert!(matches!(error, PlayerError::ConnectionFailed { .. }));
        assert_eq!(jukebox.state(GUILD).await, None);
    }

    #[tokio::test]
    async fn play_preconditions_leave_no_queue() {
        let backend = FakeBackend::default();
        let (jukebox, _events) = jukebox(&backend);
        let muted = Caller {
            bot_can_speak: false,
            ..listener()
        };

        let outside = jukebox.play(GUILD, TEXT, &outsider(), Some(&url("a"))).await;
        let no_perms = jukebox.play(GUILD, TEXT, &muted, Some(&url("a"))).await;
        let no_url = jukebox.play(GUILD, TEXT, &listener(), None).await;
        let bad_url = jukebox.play(GUILD, TEXT, &listener(), Some("not a url")).await;
        let missing = play(&jukebox, "missing").await;

        assert!(matches!(outside, Err(PlayerError::PermissionDenied { .. })));
        assert!(matches!(no_perms, Err(PlayerError::PermissionDenied { .. })));
        assert!(matches!(no_url, Err(PlayerError::InvalidInput { .. })));
        assert!(matches!(bad_url, Err(PlayerError::InvalidInput { .. })));
        assert!(matches!(missing, Err(PlayerError::MetadataFetchFailed { .. })));
        assert_eq!(jukebox.state(GUILD).await, None);
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn metadata_lookup_times_out() {
        let backend = FakeBackend::default();
        let config = PlayerConfig {
            timeout_secs: 0,
            ..PlayerConfig::default()
        };
        let (jukebox, _events) = Jukebox::new(backend.clone(), &config);

        let result = play(&jukebox, "hang").await;

        assert!(matches!(result, Err(PlayerError::MetadataFetchFailed { ref reason }) if reason.contains("timed out")));
        assert_eq!(jukebox.state(GUILD).await, None);
    }

    #[tokio::test]
    async fn controls_require_a_voice_channel_and_a_queue() {
        let backend = FakeBackend::default();
        let (jukebox, _events) = jukebox(&backend);

        assert_eq!(
            jukebox.skip(GUILD, &listener()).await,
            Err(PlayerError::NothingPlaying { action: "skip" })
        );
        assert_eq!(jukebox.pause(GUILD, &listener()).await, Err(PlayerError::NothingToPause));
        assert_eq!(jukebox.resume(GUILD, &listener()).await, Err(PlayerError::NothingToResume));
        assert_eq!(jukebox.list(GUILD).await.unwrap_err(), PlayerError::EmptyQueue);

        play(&jukebox, "a").await.unwrap();

        assert!(matches!(jukebox.skip(GUILD, &outsider()).await, Err(PlayerError::PermissionDenied { .. })));
        assert!(matches!(jukebox.stop(GUILD, &outsider()).await, Err(PlayerError::PermissionDenied { .. })));
        assert!(matches!(jukebox.pause(GUILD, &outsider()).await, Err(PlayerError::PermissionDenied { .. })));
        assert_eq!(jukebox.state(GUILD).await, Some(PlaybackState::Playing));
    }

    #[tokio::test]
    async fn listing_caps_at_ten() {
        let backend = FakeBackend::default();
        let (jukebox, _events) = jukebox(&backend);

        for n in 1..=12 {
            play(&jukebox, &n.to_string()).await.unwrap();
        }

        let view = jukebox.list(GUILD).await.unwrap();
        assert_eq!(view.songs.len(), 10);
        assert_eq!(view.remaining, 2);
        assert_eq!(view.songs[0].title, "1");
    }
}
