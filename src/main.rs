use std::future::Future;
use std::sync::Arc;

use dotenvy::dotenv;
use serenity::client::Client;
use serenity::http::Http;
use serenity::prelude::GatewayIntents;
use songbird::{SerenityInit, Songbird};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::{Config, LoggingConfig};
use crate::error::StartupError;
use crate::handler::Handler;
use crate::player::Jukebox;
use crate::voice::SongbirdBackend;

mod commands;
mod config;
mod error;
mod handler;
mod models;
mod player;
mod render;
mod voice;
mod youtube;

fn install_tracing(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[derive(Debug, PartialEq, Eq)]
enum Exit {
    ClientStopped,
    Signalled,
}

/// Runs the client until it stops or `signal` fires, whichever comes first.
async fn until_signal(
    client: impl Future<Output = serenity::Result<()>>,
    signal: impl Future<Output = std::io::Result<()>>,
) -> Result<Exit, StartupError> {
    tokio::select! {
        started = client => {
            if let Err(why) = &started {
                error!("Client ended: {why:?}");
            }
            started?;
            Ok(Exit::ClientStopped)
        }
        signalled = signal => {
            signalled?;
            Ok(Exit::Signalled)
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), StartupError> {
    // The token may also come from the real environment.
    let dotenv_loaded = dotenv().is_ok();

    let config = Config::load()?;
    install_tracing(&config.logging);

    if !dotenv_loaded {
        info!("No .env file found, using the process environment");
    }

    let http = Arc::new(Http::new(config.token()));
    let manager = Songbird::serenity();

    let backend = SongbirdBackend::new(manager.clone(), http);
    let (jukebox, events) = Jukebox::new(backend, &config.player);
    tokio::spawn(jukebox.clone().drive(events));

    let intents = GatewayIntents::non_privileged() | GatewayIntents::MESSAGE_CONTENT;

    let mut client = Client::builder(config.token(), intents)
        .event_handler(Handler::new(jukebox, config.prefix.clone()))
        .register_songbird_with(manager)
        .await?;

    let shard_manager = client.shard_manager.clone();

    if until_signal(client.start(), tokio::signal::ctrl_c()).await? == Exit::Signalled {
        info!("Received Ctrl-C, shutting down.");
        shard_manager.lock().await.shutdown_all().await;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::future::{pending, ready};

    use super::*;

    #[tokio::test]
    async fn client_failure_ends_the_process() {
        let exit = until_signal(ready(Err(serenity::Error::Other("invalid token"))), pending::<std::io::Result<()>>()).await;

        assert!(matches!(exit, Err(StartupError::Client(_))));
    }

    #[tokio::test]
    async fn signal_requests_shutdown() {
        let exit = until_signal(pending::<serenity::Result<()>>(), ready(Ok(()))).await;

        assert_eq!(exit.unwrap(), Exit::Signalled);
    }
}
