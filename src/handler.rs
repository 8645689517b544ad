//! Gateway event handling: prefix commands in, replies and embeds out.

use std::sync::Arc;

use async_trait::async_trait;
use serenity::builder::CreateEmbed;
use serenity::client::{Context, EventHandler};
use serenity::http::Http;
use serenity::model::channel::ReactionType::Unicode;
use serenity::model::channel::{Channel, Message};
use serenity::model::gateway::Ready;
use serenity::model::guild::Guild;
use serenity::model::id::{ChannelId, GuildId};
use serenity::model::voice::VoiceState;
use serenity::utils::Colour;
use serenity::Result as SerenityResult;
use tracing::{debug, info, warn};

use crate::commands::{self, Command};
use crate::error::PlayerError;
use crate::models::{Caller, Enqueued};
use crate::player::{Jukebox, PlaybackEvent};
use crate::render::{self, Notice};
use crate::voice::SongbirdBackend;

const LOADING_EMOJI: &str = "⏳";

pub struct Handler {
    jukebox: Arc<Jukebox<SongbirdBackend>>,
    prefix: String,
}

impl Handler {
    pub fn new(jukebox: Arc<Jukebox<SongbirdBackend>>, prefix: String) -> Self {
        Handler { jukebox, prefix }
    }

    async fn dispatch(&self, ctx: &Context, msg: &Message, command: Command) -> Result<(), PlayerError> {
        if command == Command::Help {
            deliver(&ctx.http, msg.channel_id, &render::help(&self.prefix)).await;
            return Ok(());
        }

        let Some((guild_id, caller)) = resolve_caller(ctx, msg) else {
            debug!("Ignoring {command:?} outside of a guild");
            return Ok(());
        };

        match command {
            Command::Play(url) => {
                let loading = Unicode(LOADING_EMOJI.to_string());
                check_msg(msg.react(&ctx.http, loading.clone()).await.map(|_| ()));

                let enqueued = self
                    .jukebox
                    .play(guild_id, msg.channel_id, &caller, url.as_deref())
                    .await;

                let own_reaction = Some(ctx.cache.current_user_id());
                check_msg(msg.channel_id.delete_reaction(&ctx.http, msg.id, own_reaction, loading).await);

                if let Enqueued::Queued { track, position } = enqueued? {
                    deliver(&ctx.http, msg.channel_id, &render::enqueued(&track, position)).await;
                }
            }
            Command::Skip => {
                self.jukebox.skip(guild_id, &caller).await?;
                react(ctx, msg, "⏭️").await;
            }
            Command::Stop => {
                self.jukebox.stop(guild_id, &caller).await?;
                react(ctx, msg, "⏹️").await;
            }
            Command::Pause => {
                self.jukebox.pause(guild_id, &caller).await?;
                react(ctx, msg, "⏸️").await;
            }
            Command::Resume => {
                self.jukebox.resume(guild_id, &caller).await?;
                react(ctx, msg, "▶️").await;
            }
            Command::Queue => {
                let view = self.jukebox.list(guild_id).await?;
                deliver(&ctx.http, msg.channel_id, &render::queue_listing(&view)).await;
            }
            Command::Help => {}
        }

        Ok(())
    }
}

#[async_trait]
impl EventHandler for Handler {
    async fn message(&self, ctx: Context, msg: Message) {
        if msg.author.bot {
            return;
        }

        let Some(invocation) = commands::parse(&msg.content, &self.prefix) else {
            return;
        };

        info!("Command '{}' received from {}", invocation.name, msg.author.tag());

        let Some(command) = Command::from_invocation(invocation) else {
            debug!("Unknown command, ignoring");
            return;
        };

        if let Err(why) = self.dispatch(&ctx, &msg, command).await {
            info!("Command failed: {why:?}");
            check_msg(msg.reply(&ctx, why.to_string()).await.map(|_| ()));
        }
    }

    async fn ready(&self, _ctx: Context, ready: Ready) {
        info!("{} is connected!", ready.user.name);
    }

    async fn voice_state_update(&self, ctx: Context, _: Option<VoiceState>, new: VoiceState) {
        if new.channel_id.is_some() || new.user_id != ctx.cache.current_user_id() {
            return;
        }

        if let Some(guild) = new.guild_id {
            info!("Bot was disconnected from voice in guild {guild}");

            if self.jukebox.events().send(PlaybackEvent::Disconnected { guild }).is_err() {
                warn!("Playback driver stopped, ignoring disconnect");
            }
        }
    }
}

/// Resolves the guild of `msg` and the author's voice access in it.
fn resolve_caller(ctx: &Context, msg: &Message) -> Option<(GuildId, Caller)> {
    let guild = msg.guild(&ctx.cache)?;

    let voice_channel = guild
        .voice_states
        .get(&msg.author.id)
        .and_then(|voice_state| voice_state.channel_id);

    let bot_can_speak = voice_channel.map_or(false, |channel| bot_can_speak(ctx, &guild, channel));

    let caller = Caller {
        tag: msg.author.tag(),
        voice_channel,
        bot_can_speak,
    };

    Some((guild.id, caller))
}

fn bot_can_speak(ctx: &Context, guild: &Guild, channel_id: ChannelId) -> bool {
    let bot_id = ctx.cache.current_user_id();

    let (Some(Channel::Guild(channel)), Some(member)) =
        (guild.channels.get(&channel_id), guild.members.get(&bot_id))
    else {
        warn!("Bot member or channel {channel_id} missing from cache");
        return false;
    };

    match guild.user_permissions_in(channel, member) {
        Ok(permissions) => permissions.connect() && permissions.speak(),
        Err(why) => {
            warn!("Could not compute permissions in {channel_id}: {why:?}");
            false
        }
    }
}

async fn react(ctx: &Context, msg: &Message, emoji: &str) {
    check_msg(msg.react(&ctx.http, Unicode(emoji.to_string())).await.map(|_| ()));
}

/// Posts `notice` as an embed, logging instead of failing.
pub async fn deliver(http: &Http, channel: ChannelId, notice: &Notice) {
    let sent = channel
        .send_message(http, |m| m.embed(|e| embed(e, notice)))
        .await;

    check_msg(sent.map(|_| ()));
}

fn embed<'a>(e: &'a mut CreateEmbed, notice: &Notice) -> &'a mut CreateEmbed {
    e.title(&notice.title).colour(Colour::new(notice.colour));

    if let Some(description) = &notice.description {
        e.description(description);
    }
    if let Some(thumbnail) = &notice.thumbnail {
        e.thumbnail(thumbnail);
    }
    for field in &notice.fields {
        e.field(&field.name, &field.value, field.inline);
    }
    if let Some(footer) = &notice.footer {
        e.footer(|f| f.text(footer));
    }

    e
}

/// Checks that a message successfully sent; if not, then logs why.
fn check_msg(result: SerenityResult<()>) {
    if let Err(why) = result {
        warn!("Error sending message: {why:?}");
    }
}
