//! Formatting of the embeds the bot posts. Nothing here talks to Discord.

use crate::models::{QueueView, Track};

pub const COLOUR_INFO: u32 = 0x0099ff;
pub const COLOUR_PLAYING: u32 = 0x00ff00;
pub const COLOUR_ERROR: u32 = 0xff0000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

/// Description of an embed, converted to a serenity builder on delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub title: String,
    pub colour: u32,
    pub description: Option<String>,
    pub thumbnail: Option<String>,
    pub fields: Vec<Field>,
    pub footer: Option<String>,
}

impl Notice {
    fn new(title: impl Into<String>, colour: u32) -> Self {
        Notice {
            title: title.into(),
            colour,
            description: None,
            thumbnail: None,
            fields: Vec::new(),
            footer: None,
        }
    }

    fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    fn thumbnail(mut self, url: &str) -> Self {
        if !url.is_empty() {
            self.thumbnail = Some(url.to_string());
        }
        self
    }

    fn field(mut self, name: impl Into<String>, value: impl Into<String>, inline: bool) -> Self {
        self.fields.push(Field {
            name: name.into(),
            value: value.into(),
            inline,
        });
        self
    }
}

/// `H:MM:SS` from one hour up, `M:SS` below.
pub fn format_duration(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if hours > 0 {
        format!("{hours}:{minutes:02}:{secs:02}")
    } else {
        format!("{minutes}:{secs:02}")
    }
}

pub fn now_playing(track: &Track) -> Notice {
    Notice::new("Now Playing", COLOUR_PLAYING)
        .description(format!("**{}**", track.title))
        .thumbnail(&track.thumbnail)
        .field("Requested by", &track.requested_by, true)
        .field("Duration", format_duration(track.duration_secs), true)
}

pub fn enqueued(track: &Track, position: usize) -> Notice {
    Notice::new("Song Added to Queue", COLOUR_INFO)
        .description(format!("**{}** has been added to the queue!", track.title))
        .thumbnail(&track.thumbnail)
        .field("Requested by", &track.requested_by, true)
        .field("Position in queue", position.to_string(), true)
}

pub fn queue_listing(view: &QueueView) -> Notice {
    let lines: Vec<String> = view
        .songs
        .iter()
        .enumerate()
        .map(|(index, track)| {
            let marker = match index {
                0 => "🎵 **Now Playing:**".to_string(),
                n => format!("{n}."),
            };
            format!("{marker} {} - *Requested by {}*", track.title, track.requested_by)
        })
        .collect();

    let mut notice = Notice::new("Music Queue", COLOUR_INFO).description(lines.join("\n"));
    if view.remaining > 0 {
        notice.footer = Some(format!("And {} more songs...", view.remaining));
    }
    notice
}

pub fn help(prefix: &str) -> Notice {
    let commands = [
        ("play <YouTube URL>", "Play a song from YouTube"),
        ("skip", "Skip the current song"),
        ("stop", "Stop playing and clear the queue"),
        ("pause", "Pause the current song"),
        ("resume", "Resume the paused song"),
        ("queue", "Show the current queue"),
        ("help", "Show this help message"),
    ];

    commands.iter().fold(
        Notice::new("Music Bot Commands", COLOUR_INFO).description("Here are all the available commands:"),
        |notice, (usage, what)| notice.field(format!("{prefix}{usage}"), *what, false),
    )
}

pub fn error(message: impl Into<String>) -> Notice {
    Notice::new("Something went wrong", COLOUR_ERROR).description(message)
}

/// Error posted to the output channel when a track could not be played.
pub fn track_failed(track: &Track, message: impl std::fmt::Display) -> Notice {
    error(format!("{message}\nSkipping **{}**.", track.title))
}
