use thiserror::Error;

/// Failures of a player operation.
///
/// `Display` is the reply shown to the user; `reason` fields only go to the logs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlayerError {
    #[error("{reason}")]
    PermissionDenied { reason: String },
    #[error("{reason}")]
    InvalidInput { reason: String },
    #[error("There was an error getting song information!")]
    MetadataFetchFailed { reason: String },
    #[error("There was an error connecting to the voice channel!")]
    ConnectionFailed { reason: String },
    #[error("There was an error playing the song!")]
    StreamError { reason: String },
    #[error("There is nothing playing that I could {action}!")]
    NothingPlaying { action: &'static str },
    #[error("There is nothing playing that I could pause!")]
    NothingToPause,
    #[error("There is nothing paused that I could resume!")]
    NothingToResume,
    #[error("The queue is empty!")]
    EmptyQueue,
}

impl PlayerError {
    pub fn not_in_voice(action: &str) -> Self {
        PlayerError::PermissionDenied {
            reason: format!("You need to be in a voice channel to {action} music!"),
        }
    }

    pub fn metadata(reason: impl ToString) -> Self {
        PlayerError::MetadataFetchFailed { reason: reason.to_string() }
    }

    pub fn connection(reason: impl ToString) -> Self {
        PlayerError::ConnectionFailed { reason: reason.to_string() }
    }

    pub fn stream(reason: impl ToString) -> Self {
        PlayerError::StreamError { reason: reason.to_string() }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Could not read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config file '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("No bot token: set DISCORD_TOKEN or `token` in the config file.")]
    MissingToken,
}

#[derive(Error, Debug)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Discord client failed: {0}")]
    Client(#[from] serenity::Error),
    #[error("Could not listen for Ctrl-C: {0}")]
    Signal(#[from] std::io::Error),
}
