use std::{collections::HashSet, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{handler_fn, ClientConfig, ClientEvent, ConnectionState, Session};
use shared::protocol::Envelope;
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Sign in to the campus platform and follow realtime events")]
struct Args {
    /// TOML config file; `client.toml` is used when present.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    username: String,
    #[arg(long)]
    password: String,
    /// Channel to subscribe to each time the connection opens.
    #[arg(long = "channel")]
    channels: Vec<String>,
    /// Event type to print; defaults to `message` and `notification`.
    #[arg(long = "event")]
    events: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let args = Args::parse();

    let config = ClientConfig::load(args.config.as_deref())?;
    let session = Session::new(config)?;
    session
        .login(&args.username, &args.password)
        .await
        .context("login failed")?;

    let event_types: HashSet<String> = if args.events.is_empty() {
        ["message", "notification"].into_iter().map(String::from).collect()
    } else {
        args.events.into_iter().collect()
    };
    let printer = handler_fn(print_envelope);
    for event_type in &event_types {
        session.on(event_type.clone(), Arc::clone(&printer));
    }

    let mut lifecycle = BroadcastStream::new(session.subscribe_events());
    if let Err(err) = session.connect_realtime().await {
        warn!(error = %err, "realtime connect failed; waiting for reconnect");
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            event = lifecycle.next() => {
                match event {
                    Some(Ok(ClientEvent::ConnectionStateChanged(ConnectionState::Open))) => {
                        subscribe_all(&session, &args.channels);
                    }
                    Some(Ok(ClientEvent::SessionExpired)) => {
                        warn!("session expired; sign in again");
                        break;
                    }
                    Some(Ok(ClientEvent::ConnectionLost)) => {
                        warn!("realtime connection lost");
                        break;
                    }
                    Some(Ok(other)) => info!(event = ?other, "client event"),
                    Some(Err(lagged)) => warn!(error = %lagged, "missed client events"),
                    None => break,
                }
            }
        }
    }

    session.logout().await;
    Ok(())
}

fn subscribe_all(session: &Session, channels: &[String]) {
    for channel in channels {
        if !session.realtime().subscribe(channel) {
            warn!(channel, "subscribe dropped; connection not open");
        }
    }
}

fn print_envelope(envelope: &Envelope) -> Result<()> {
    println!("{}", serde_json::to_string(envelope)?);
    Ok(())
}
