//! The relay's network face
//!
//! An axum application: the websocket endpoint every client speaks the
//! event protocol over, and the HTTP surface serving the web UI bundle.
//! `/` and `/{room}` both return the index page (the room code is
//! client-side routing); assets come from the embedded bundle or, when
//! `--root-folder` is given, from disk.

use std::net::SocketAddr;
use std::path::PathBuf;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::AppResult;
use crate::protocol::{ClientEvent, Envelope};
use crate::sources::SourceRegistry;

pub mod assets;
pub mod rooms;

use assets::StaticAssets;
use rooms::Relay;

/// Options for the `server` subcommand.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub host: String,
    pub port: u16,
    pub root_folder: Option<PathBuf>,
    pub registration_keyfile: Option<PathBuf>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8080,
            root_folder: None,
            registration_keyfile: None,
        }
    }
}

#[derive(Clone)]
struct AppState {
    relay: Relay,
    root_folder: Option<PathBuf>,
}

/// Relay service plus its HTTP binding.
pub struct RelayServer {
    app: Router,
    addr: SocketAddr,
}

impl RelayServer {
    pub async fn new(options: ServerOptions) -> AppResult<Self> {
        let registration_keys = options
            .registration_keyfile
            .as_deref()
            .map(rooms::load_registration_keys)
            .transpose()?;
        let relay = Relay::new(SourceRegistry::with_builtin(), registration_keys);

        let state = AppState {
            relay,
            root_folder: options.root_folder.clone(),
        };
        let app = Self::create_router(state);

        let addr = tokio::net::lookup_host((options.host.as_str(), options.port))
            .await?
            .next()
            .ok_or_else(|| {
                crate::errors::AppError::configuration(format!(
                    "cannot resolve host {}",
                    options.host
                ))
            })?;

        Ok(Self { app, addr })
    }

    fn create_router(state: AppState) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/", get(index))
            .route("/favicon.ico", get(favicon))
            .route("/assets/*path", get(serve_asset))
            .route("/:room", get(index))
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn serve(self) -> AppResult<()> {
        info!("Listening on {}", self.addr);
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        axum::serve(listener, self.app)
            .await
            .map_err(|e| crate::errors::AppError::transport(e.to_string()))?;
        Ok(())
    }
}

async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state.relay, socket))
}

/// One websocket connection is one relay session. Events are handled in
/// arrival order, except the two handlers that wait on the queue
/// semaphore, which get their own tasks; outbound events flow through
/// the session channel into the sink.
async fn handle_socket(relay: Relay, socket: WebSocket) {
    let sid = Uuid::new_v4();
    debug!("Session {sid} connected");
    let mut outbound = relay.connect(sid).await;
    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(event) = outbound.recv().await {
            let text = event.into_envelope().to_text();
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                match Envelope::parse(&text).and_then(ClientEvent::from_envelope) {
                    // get-first and pop-then-get-next suspend on the queue
                    // semaphore until a song arrives. They run as their own
                    // tasks so this session keeps reading: the config
                    // replies that let the room fill up arrive on this very
                    // socket.
                    Ok(event @ (ClientEvent::GetFirst | ClientEvent::PopThenGetNext)) => {
                        let relay = relay.clone();
                        tokio::spawn(async move {
                            relay.handle_event(sid, event).await;
                        });
                    }
                    Ok(event) => relay.handle_event(sid, event).await,
                    Err(e) => warn!("Dropping message from {sid}: {e}"),
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    debug!("Session {sid} disconnected");
    relay.disconnect(sid).await;
    writer.abort();
}

/// `/` and `/{room}`: the web UI entry point.
async fn index(State(state): State<AppState>) -> Response {
    serve_file(&state, "index.html").await
}

async fn favicon(State(state): State<AppState>) -> Response {
    serve_file(&state, "favicon.ico").await
}

async fn serve_asset(
    State(state): State<AppState>,
    axum::extract::Path(path): axum::extract::Path<String>,
) -> Response {
    serve_file(&state, &format!("assets/{path}")).await
}

async fn serve_file(state: &AppState, path: &str) -> Response {
    if path.split('/').any(|part| part == "..") {
        return StatusCode::NOT_FOUND.into_response();
    }
    if let Some(root) = &state.root_folder {
        let full = root.join(path);
        match tokio::fs::read(&full).await {
            Ok(contents) => {
                return (
                    [(header::CONTENT_TYPE, StaticAssets::content_type(path))],
                    contents,
                )
                    .into_response();
            }
            Err(_) => return StatusCode::NOT_FOUND.into_response(),
        }
    }

    match StaticAssets::get(path) {
        Some(file) => (
            [(header::CONTENT_TYPE, StaticAssets::content_type(path))],
            file.data.into_owned(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
