use serenity::model::id::ChannelId;

/// A playable item with the metadata shown in announcements.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Track {
    pub title: String,
    pub url: String,
    pub duration_secs: u64,
    pub thumbnail: String,
    pub requested_by: String,
}

/// Who issued a command, and what voice access they have.
#[derive(Clone, Debug)]
pub struct Caller {
    pub tag: String,
    pub voice_channel: Option<ChannelId>,
    /// Whether the bot holds CONNECT and SPEAK in `voice_channel`.
    pub bot_can_speak: bool,
}

/// Read-only snapshot of a guild queue used by the `queue` command.
#[derive(Clone, Debug)]
pub struct QueueView {
    /// Head first, at most [`QueueView::LIMIT`] entries.
    pub songs: Vec<Track>,
    /// Tracks left out of `songs`.
    pub remaining: usize,
}

impl QueueView {
    pub const LIMIT: usize = 10;

    pub fn of<'a>(songs: impl ExactSizeIterator<Item = &'a Track>) -> Self {
        let total = songs.len();
        let songs: Vec<Track> = songs.take(Self::LIMIT).cloned().collect();
        let remaining = total - songs.len();

        QueueView { songs, remaining }
    }
}

/// Result of a successful `play`.
#[derive(Clone, Debug)]
pub enum Enqueued {
    /// The guild had no queue; a connection was made and this track is the head.
    Started(Track),
    /// Appended to an existing queue at the 1-based `position`.
    Queued { track: Track, position: usize },
}
