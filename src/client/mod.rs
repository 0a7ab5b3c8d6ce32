//! The venue-side playback client process
//!
//! Owns the websocket connection to the relay and feeds inbound events to
//! the [`coordinator::PlaybackClient`]. Playback and other long handlers
//! run as their own tasks so a skip can overtake a running song. A
//! dropped connection is retried; a refused registration is fatal.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};
use url::Url;

use crate::config::ConfigFile;
use crate::errors::{AppError, AppResult};
use crate::protocol::{Envelope, ServerEvent};
use crate::sources::SourceRegistry;

pub mod coordinator;

use coordinator::PlaybackClient;

/// Seconds between reconnect attempts once a connection existed.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Options for the `client` subcommand.
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    pub room: Option<String>,
    pub secret: Option<String>,
    pub config_file: PathBuf,
    pub key: Option<String>,
    pub server: Option<String>,
}

/// Secret generated when neither CLI nor config provide one.
fn generate_secret() -> String {
    (0..8)
        .map(|_| fastrand::alphanumeric())
        .collect()
}

/// Derive the websocket endpoint from the configured server URL.
fn websocket_url(server: &str) -> AppResult<Url> {
    let mut url = Url::parse(server)
        .map_err(|e| AppError::configuration(format!("invalid server URL {server}: {e}")))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(AppError::configuration(format!(
                "unsupported server scheme {other}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| AppError::configuration("cannot derive websocket URL"))?;
    url.set_path("/ws");
    Ok(url)
}

pub async fn run_client(options: ClientOptions) -> AppResult<()> {
    let config = ConfigFile::load(&options.config_file)?;
    let mut general = config.config.clone();

    if let Some(room) = options.room {
        general.room = room;
    }
    if let Some(server) = options.server {
        general.server = server;
    }
    let secret = options
        .secret
        .or_else(|| general.secret.clone())
        .unwrap_or_else(|| {
            let secret = generate_secret();
            println!("Generated secret: {secret}");
            secret
        });
    let key = options.key.or_else(|| general.key.clone());

    let registry = SourceRegistry::with_builtin();
    let sources = registry.configure_sources(&config.sources)?;
    if sources.is_empty() {
        return Err(AppError::configuration(
            "no sources configured; add at least one under 'sources:'",
        ));
    }
    info!(
        "Configured sources: {}",
        sources.keys().cloned().collect::<Vec<_>>().join(", ")
    );

    let url = websocket_url(&general.server)?;
    let server = general.server.clone();
    let client = Arc::new(PlaybackClient::new(
        sources, general, server, secret, key,
    ));

    let mut connected_once = false;
    loop {
        match run_session(&client, &url).await {
            Ok(()) => {
                connected_once = true;
                warn!("Connection to relay lost, reconnecting");
            }
            // A refused registration never heals by retrying.
            Err(e @ AppError::Auth { .. }) => return Err(e),
            Err(e) if connected_once => {
                warn!("Reconnect failed: {e}");
            }
            Err(e) => return Err(e),
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

/// One websocket session: register, then pump events until the socket
/// closes. Returns Ok on a clean transport loss (caller reconnects) and
/// Err on connect or registration failure.
async fn run_session(client: &Arc<PlaybackClient>, url: &Url) -> AppResult<()> {
    let (socket, _) = connect_async(url.as_str())
        .await
        .map_err(|e| AppError::transport(format!("cannot reach {url}: {e}")))?;
    let (mut sink, mut stream) = socket.split();

    let (tx, mut outbound) = mpsc::unbounded_channel();
    client.attach(tx).await;

    let writer = tokio::spawn(async move {
        while let Some(event) = outbound.recv().await {
            let text = event.into_envelope().to_text();
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    client.on_connected().await;

    let mut result = Ok(());
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                let event = match Envelope::parse(&text).and_then(ServerEvent::from_envelope) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!("Dropping message from relay: {e}");
                        continue;
                    }
                };
                match event {
                    // Registration outcome decides whether we keep running;
                    // everything else runs as its own task so a skip can
                    // arrive while a song plays.
                    ServerEvent::ClientRegistered { .. } => {
                        if let Err(e) = client.handle_event(event).await {
                            result = Err(e);
                            break;
                        }
                    }
                    other => {
                        let client = client.clone();
                        tokio::spawn(async move {
                            if let Err(e) = client.handle_event(other).await {
                                warn!("Handler failed: {e}");
                            }
                        });
                    }
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    writer.abort();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn websocket_url_maps_schemes() {
        assert_eq!(
            websocket_url("https://syng.rocks").unwrap().as_str(),
            "wss://syng.rocks/ws"
        );
        assert_eq!(
            websocket_url("http://localhost:8080").unwrap().as_str(),
            "ws://localhost:8080/ws"
        );
        assert!(websocket_url("ftp://nope").is_err());
    }

    #[test]
    fn generated_secrets_are_long_enough() {
        let secret = generate_secret();
        assert_eq!(secret.len(), 8);
        assert!(secret.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
