//! Songbird-backed voice connections and yt-dlp streams.

use std::sync::Arc;

use async_trait::async_trait;
use serenity::http::Http;
use serenity::model::id::{ChannelId, GuildId};
use songbird::input::Input;
use songbird::tracks::{TrackError, TrackHandle};
use songbird::{Call, Event, EventContext, EventHandler as VoiceEventHandler, Songbird, TrackEvent};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::PlayerError;
use crate::handler::deliver;
use crate::models::Track;
use crate::player::{Backend, Cue, EventSender, VoiceConnection};
use crate::render::Notice;
use crate::youtube;

pub struct SongbirdBackend {
    manager: Arc<Songbird>,
    http: Arc<Http>,
}

impl SongbirdBackend {
    pub fn new(manager: Arc<Songbird>, http: Arc<Http>) -> Self {
        SongbirdBackend { manager, http }
    }
}

#[async_trait]
impl Backend for SongbirdBackend {
    type Stream = Input;
    type Connection = SongbirdConnection;

    fn is_valid_url(&self, url: &str) -> bool {
        youtube::is_video_url(url)
    }

    async fn resolve(&self, url: &str, requested_by: &str) -> Result<Track, PlayerError> {
        youtube::fetch_track(url, requested_by).await
    }

    async fn connect(
        &self,
        guild: GuildId,
        channel: ChannelId,
        events: EventSender,
    ) -> Result<SongbirdConnection, PlayerError> {
        let (call, joined) = self.manager.join(guild, channel).await;

        if let Err(why) = joined {
            if let Err(e) = self.manager.remove(guild).await {
                debug!("Cleanup after failed join: {e:?}");
            }
            return Err(PlayerError::connection(why));
        }

        {
            let mut handler = call.lock().await;

            if handler.is_deaf() {
                info!("Already deafen!")
            } else if let Err(e) = handler.deafen(true).await {
                info!("Deafen failed due to {e:?}")
            }
        }

        Ok(SongbirdConnection {
            manager: self.manager.clone(),
            guild,
            call,
            events,
            current: None,
        })
    }

    async fn open(&self, track: &Track) -> Result<Input, PlayerError> {
        songbird::ytdl(&track.url).await.map_err(PlayerError::stream)
    }

    async fn notify(&self, channel: ChannelId, notice: Notice) {
        deliver(&self.http, channel, &notice).await;
    }
}

pub struct SongbirdConnection {
    manager: Arc<Songbird>,
    guild: GuildId,
    call: Arc<Mutex<Call>>,
    events: EventSender,
    current: Option<TrackHandle>,
}

#[async_trait]
impl VoiceConnection for SongbirdConnection {
    type Stream = Input;

    async fn play(&mut self, stream: Input, cue: Cue) -> Result<(), PlayerError> {
        let track_handle = {
            let mut handler = self.call.lock().await;
            handler.stop(); // Just in case something was playing before
            handler.play_source(stream)
        };

        track_handle
            .add_event(
                Event::Track(TrackEvent::End),
                TrackEndNotifier {
                    cue,
                    events: self.events.clone(),
                },
            )
            .map_err(PlayerError::stream)?;

        self.current = Some(track_handle);

        Ok(())
    }

    fn pause(&mut self) -> Result<(), PlayerError> {
        match &self.current {
            Some(track_handle) => track_handle.pause().map_err(PlayerError::stream),
            None => Ok(()),
        }
    }

    fn resume(&mut self) -> Result<(), PlayerError> {
        match &self.current {
            Some(track_handle) => track_handle.play().map_err(PlayerError::stream),
            None => Ok(()),
        }
    }

    fn stop(&mut self) -> Result<(), PlayerError> {
        match self.current.take().map(|track_handle| track_handle.stop()) {
            // Already over; its end event is on the way.
            Some(Err(TrackError::Finished)) | Some(Ok(())) | None => Ok(()),
            Some(Err(why)) => Err(PlayerError::stream(why)),
        }
    }

    async fn leave(&mut self) {
        self.current = None;

        if let Err(e) = self.manager.remove(self.guild).await {
            debug!("Leaving voice in guild {} failed: {e:?}", self.guild);
        }
    }
}

/// Reports the end of a track, natural or forced, back to the player.
struct TrackEndNotifier {
    cue: Cue,
    events: EventSender,
}

#[async_trait]
impl VoiceEventHandler for TrackEndNotifier {
    async fn act(&self, _ctx: &EventContext<'_>) -> Option<Event> {
        debug!("End notifier triggered for track {}", self.cue.generation);

        if self.events.send(self.cue.ended()).is_err() {
            warn!("Playback driver stopped, dropping end of track {}", self.cue.generation);
        }

        None
    }
}
