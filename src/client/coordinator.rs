//! The playback coordinator
//!
//! Venue-side counterpart of the relay: reacts to server events, keeps
//! the local queue snapshots, drives the buffer pipeline ahead of
//! playback and walks each song through preview, playback and the
//! advance handshake. The coordinator never pops locally; it reports
//! `pop-then-get-next` and lets the relay drive.

use std::collections::HashMap;
use std::io::Write;
use std::process::Stdio;
use std::sync::Arc;

use qrcode_generator::QrCodeEcc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

use crate::config::GeneralConfig;
use crate::errors::{AppError, AppResult};
use crate::models::{Entry, RoomConfig};
use crate::protocol::{
    ClientEvent, ConfigChunk, MetaInfo, RegisterClient, ServerEvent, SourceConfig, StatePayload,
    PROTOCOL_VERSION,
};
use crate::sources::{Source, SourceConfigPayload};

#[derive(Default)]
struct CoordinatorState {
    queue: Vec<Entry>,
    recent: Vec<Entry>,
    room: String,
    current_source: Option<String>,
}

pub struct PlaybackClient {
    sources: HashMap<String, Arc<dyn Source>>,
    general: GeneralConfig,
    server: String,
    secret: String,
    key: Option<String>,
    state: Mutex<CoordinatorState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<ClientEvent>>>,
}

impl PlaybackClient {
    pub fn new(
        sources: HashMap<String, Arc<dyn Source>>,
        general: GeneralConfig,
        server: String,
        secret: String,
        key: Option<String>,
    ) -> Self {
        Self {
            sources,
            general,
            server,
            secret,
            key,
            state: Mutex::new(CoordinatorState::default()),
            outbound: Mutex::new(None),
        }
    }

    /// Attach the outbound channel of a (re)connected transport session.
    pub async fn attach(&self, tx: mpsc::UnboundedSender<ClientEvent>) {
        *self.outbound.lock().await = Some(tx);
    }

    async fn emit(&self, event: ClientEvent) {
        let outbound = self.outbound.lock().await;
        if let Some(tx) = outbound.as_ref() {
            let _ = tx.send(event);
        }
    }

    fn room_config(&self) -> RoomConfig {
        RoomConfig {
            preview_duration: self.general.preview_duration,
            last_song: self
                .general
                .last_song
                .map(|dt| dt.timestamp() as f64),
            waiting_room_policy: self.general.waiting_room_policy,
            buffer_in_advance: self.general.buffer_in_advance,
            allow_collab_mode: self.general.allow_collab_mode,
            allow_reorder_head: false,
        }
    }

    /// Announce ourselves to the relay, carrying the held snapshots so a
    /// room survives a playback client restart.
    pub async fn on_connected(&self) {
        info!("Connected to {}", self.server);
        let state = self.state.lock().await;
        // After the first registration the server-assigned code wins, so a
        // reconnect reclaims the same room.
        let room = if state.room.is_empty() {
            self.general.room.clone()
        } else {
            state.room.clone()
        };
        let registration = RegisterClient {
            room: (!room.is_empty()).then_some(room),
            secret: self.secret.clone(),
            queue: state.queue.clone(),
            recent: state.recent.clone(),
            config: self.room_config(),
            key: self.key.clone(),
            version: PROTOCOL_VERSION,
        };
        drop(state);
        self.emit(ClientEvent::RegisterClient(registration)).await;
    }

    /// Dispatch one server event. Long-running handlers (play) are
    /// expected to be spawned by the caller so skips can overtake them.
    pub async fn handle_event(self: &Arc<Self>, event: ServerEvent) -> AppResult<()> {
        match event {
            ServerEvent::ClientRegistered { success, room } => {
                self.on_registered(success, room).await
            }
            ServerEvent::State(state) => {
                self.on_state(state).await;
                Ok(())
            }
            ServerEvent::Buffer(entry) => {
                self.on_buffer(entry).await;
                Ok(())
            }
            ServerEvent::Play(entry) => {
                self.on_play(entry).await;
                Ok(())
            }
            ServerEvent::RequestConfig { source } => {
                self.on_request_config(&source).await;
                Ok(())
            }
            ServerEvent::SkipCurrent => {
                self.on_skip_current().await;
                Ok(())
            }
            ServerEvent::Msg { msg } => {
                info!("Server: {msg}");
                Ok(())
            }
            other => {
                warn!("Unhandled server event: {other:?}");
                Ok(())
            }
        }
    }

    async fn on_registered(&self, success: bool, room: String) -> AppResult<()> {
        if !success {
            return Err(AppError::auth(format!(
                "registration for room {room} refused"
            )));
        }
        info!("Registered in room {room}");
        self.print_join_hint(&room);
        self.state.lock().await.room = room;

        let names: Vec<String> = self.sources.keys().cloned().collect();
        self.emit(ClientEvent::Sources { sources: names }).await;

        let playing = self.state.lock().await.current_source.is_some();
        if !playing {
            self.emit(ClientEvent::GetFirst).await;
        }
        Ok(())
    }

    /// Print the join link plus a scannable terminal QR code.
    fn print_join_hint(&self, room: &str) {
        let link = format!("{}/{room}", self.server.trim_end_matches('/'));
        println!("Join here: {link}");
        match qrcode_generator::to_matrix(&link, QrCodeEcc::Low) {
            Ok(matrix) => {
                let stdout = std::io::stdout();
                let mut out = stdout.lock();
                for row in &matrix {
                    let line: String = row
                        .iter()
                        .map(|dark| if *dark { "██" } else { "  " })
                        .collect();
                    let _ = writeln!(out, " {line}");
                }
            }
            Err(e) => warn!("Could not render QR code: {e}"),
        }
    }

    /// New state snapshot: store it and buffer the next few entries ahead
    /// of playback.
    async fn on_state(self: &Arc<Self>, state: StatePayload) {
        let ahead = self.general.buffer_in_advance.max(1);
        {
            let mut held = self.state.lock().await;
            held.queue = state.queue;
            held.recent = state.recent;
        }
        let upcoming: Vec<Entry> = {
            let held = self.state.lock().await;
            held.queue.iter().take(ahead).cloned().collect()
        };
        for entry in upcoming {
            let Some(source) = self.sources.get(&entry.source).cloned() else {
                warn!("No source {} for {}", entry.source, entry.title);
                continue;
            };
            info!("Buffering: {}", entry.title);
            tokio::spawn(async move {
                source.buffer(&entry).await;
            });
        }
    }

    /// The relay wants the missing metadata for a fresh entry.
    async fn on_buffer(&self, entry: Entry) {
        let Some(source) = self.sources.get(&entry.source) else {
            warn!("No source {} for {}", entry.source, entry.title);
            return;
        };
        match source.get_missing_metadata(&entry).await {
            Ok(meta) => {
                self.emit(ClientEvent::MetaInfo(MetaInfo {
                    uuid: entry.uuid.to_string(),
                    meta,
                }))
                .await;
            }
            Err(e) => warn!("Could not fetch metadata for {}: {e}", entry.title),
        }
    }

    /// Walk one song: preview card, playback, then the advance handshake.
    /// `pop-then-get-next` goes out no matter how playback ended.
    async fn on_play(&self, entry: Entry) {
        info!(
            "Playing: {} - {} [{}] ({}) for {}",
            entry.artist, entry.title, entry.album, entry.source, entry.performer
        );
        match self.sources.get(&entry.source) {
            Some(source) => {
                self.state.lock().await.current_source = Some(entry.source.clone());
                if let Err(e) = self.preview(&entry).await {
                    warn!("Preview failed: {e}");
                }
                if let Err(e) = source.play(&entry).await {
                    error!("Playback failed for {}: {e}", entry.title);
                }
                self.state.lock().await.current_source = None;
            }
            None => warn!("No source {} for {}", entry.source, entry.title),
        }
        self.emit(ClientEvent::PopThenGetNext).await;
    }

    async fn on_skip_current(&self) {
        info!("Skipping current");
        let (source, head) = {
            let state = self.state.lock().await;
            let source = state
                .current_source
                .as_ref()
                .and_then(|name| self.sources.get(name).cloned());
            (source, state.queue.first().cloned())
        };
        if let (Some(source), Some(head)) = (source, head) {
            source.skip_current(&head).await;
        }
    }

    /// Ship a source's config to the relay, chunked when the source says
    /// it would not fit one message.
    async fn on_request_config(&self, name: &str) {
        let Some(source) = self.sources.get(name) else {
            warn!("Relay requested config for unknown source {name}");
            return;
        };
        match source.get_config().await {
            Ok(SourceConfigPayload::Full(config)) => {
                self.emit(ClientEvent::Config(SourceConfig {
                    source: name.to_string(),
                    config,
                }))
                .await;
            }
            Ok(SourceConfigPayload::Chunked(chunks)) => {
                let total = chunks.len();
                for (i, config) in chunks.into_iter().enumerate() {
                    self.emit(ClientEvent::ConfigChunk(ConfigChunk {
                        source: name.to_string(),
                        config,
                        number: i + 1,
                        total,
                    }))
                    .await;
                }
            }
            Err(e) => warn!("Could not collect config for {name}: {e}"),
        }
    }

    /// Show the pre-roll card: a black background with artist, title and
    /// performer as subtitles, for `preview_duration` seconds.
    async fn preview(&self, entry: &Entry) -> AppResult<()> {
        let duration = self.general.preview_duration;
        if duration == 0 {
            return Ok(());
        }

        let background = std::env::temp_dir().join("syng-preview.png");
        let canvas = image::RgbImage::new(1280, 720);
        canvas
            .save(&background)
            .map_err(|e| AppError::player(format!("could not write preview card: {e}")))?;

        let subtitle = format!(
            "1\n00:00:00,00 --> 00:05:00,00\n{} - {}\n{}\n",
            entry.artist, entry.title, entry.performer
        );

        let mut child = Command::new("mpv")
            .arg(&background)
            .arg(format!("--image-display-duration={duration}"))
            .arg("--sub-pos=50")
            .arg("--sub-file=-")
            .arg("--fullscreen")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| AppError::player(format!("could not launch preview: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(subtitle.as_bytes()).await;
        }
        let _ = child.wait().await;
        Ok(())
    }
}
