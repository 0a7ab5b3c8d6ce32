//! The room-scoped relay
//!
//! One [`Relay`] owns every room and every connected session. Each room
//! aggregates one playback client, any number of web clients and the
//! admins among them; the relay routes events between them and owns the
//! authoritative queue. Handlers run as tasks; events from one session
//! are processed in arrival order except the queue-waiting handlers
//! (`get-first`, `pop-then-get-next`), which the transport layer spawns
//! so a suspended wait never stalls the session's reads. State
//! broadcasts are serialized per room so every client observes them in
//! the same order.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{Local, TimeZone, Utc};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::AppResult;
use crate::models::{Entry, RoomConfig};
use crate::protocol::{
    AppendRequest, ClientEvent, ConfigChunk, MetaInfo, RegisterClient, ServerEvent, SourceConfig,
    StatePayload, PROTOCOL_VERSION,
};
use crate::queue::SongQueue;
use crate::sources::{Source, SourceRegistry};

/// Transport session id.
pub type Sid = Uuid;

/// How many popped entries a room keeps in its recent list.
const RECENT_LIMIT: usize = 128;

/// Length of a freshly generated room code.
const ROOM_CODE_LEN: usize = 4;

struct SessionHandle {
    room: Option<String>,
    is_admin: bool,
    tx: mpsc::UnboundedSender<ServerEvent>,
}

/// Authoritative per-room state.
pub struct Room {
    pub id: String,
    secret: String,
    pub queue: SongQueue,
    recent: Mutex<Vec<Entry>>,
    playback_sid: Mutex<Option<Sid>>,
    config: RwLock<RoomConfig>,
    sources: RwLock<HashMap<String, Arc<dyn Source>>>,
    sources_prio: RwLock<Vec<String>>,
    broadcast_lock: Mutex<()>,
}

impl Room {
    fn new(id: String, secret: String, reg: &RegisterClient, playback: Sid) -> Self {
        Self {
            id,
            secret,
            queue: SongQueue::new(reg.queue.clone()),
            recent: Mutex::new(reg.recent.clone()),
            playback_sid: Mutex::new(Some(playback)),
            config: RwLock::new(reg.config.clone()),
            sources: RwLock::new(HashMap::new()),
            sources_prio: RwLock::new(Vec::new()),
            broadcast_lock: Mutex::new(()),
        }
    }

    pub async fn playback_sid(&self) -> Option<Sid> {
        *self.playback_sid.lock().await
    }
}

/// The relay service: rooms, sessions and the event handlers connecting
/// them. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct Relay {
    rooms: Arc<RwLock<HashMap<String, Arc<Room>>>>,
    sessions: Arc<RwLock<HashMap<Sid, SessionHandle>>>,
    registry: Arc<SourceRegistry>,
    registration_keys: Option<Arc<HashSet<String>>>,
}

impl Relay {
    pub fn new(registry: SourceRegistry, registration_keys: Option<HashSet<String>>) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            registry: Arc::new(registry),
            registration_keys: registration_keys.map(Arc::new),
        }
    }

    /// Register a transport session and hand back the stream of events
    /// destined for it.
    pub async fn connect(&self, sid: Sid) -> mpsc::UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions.write().await.insert(
            sid,
            SessionHandle {
                room: None,
                is_admin: false,
                tx,
            },
        );
        rx
    }

    /// Tear down a session. The room itself persists; if this was the
    /// playback client the slot stays empty until the next registration
    /// with the matching secret reclaims it.
    pub async fn disconnect(&self, sid: Sid) {
        let handle = self.sessions.write().await.remove(&sid);
        let Some(SessionHandle { room: Some(room_id), .. }) = handle else {
            return;
        };
        if let Some(room) = self.room(&room_id).await {
            let mut playback = room.playback_sid.lock().await;
            if *playback == Some(sid) {
                info!("Playback client left room {room_id}");
                *playback = None;
            }
        }
    }

    /// Dispatch one inbound event. Errors are protocol-level and are
    /// logged and dropped here so a bad event never tears down the loop.
    pub async fn handle_event(&self, sid: Sid, event: ClientEvent) {
        let result = match event {
            ClientEvent::RegisterClient(reg) => self.register_client(sid, reg).await,
            ClientEvent::RegisterWeb { room } => self.register_web(sid, room).await,
            ClientEvent::RegisterAdmin { secret } => self.register_admin(sid, secret).await,
            ClientEvent::Sources { sources } => self.update_sources(sid, sources).await,
            ClientEvent::Config(config) => self.install_config(sid, config).await,
            ClientEvent::ConfigChunk(chunk) => self.install_config_chunk(sid, chunk).await,
            ClientEvent::Append(request) => self.append(sid, request).await,
            ClientEvent::MetaInfo(meta) => self.meta_info(sid, meta).await,
            ClientEvent::GetState => self.get_state(sid).await,
            ClientEvent::GetFirst => self.get_first(sid).await,
            ClientEvent::PopThenGetNext => self.pop_then_get_next(sid).await,
            ClientEvent::Search { query } => self.search(sid, query).await,
            ClientEvent::SkipCurrent => self.skip_current(sid).await,
            ClientEvent::MoveUp { uuid } => self.move_up(sid, uuid).await,
            ClientEvent::MoveTo { uuid, target } => self.move_to(sid, uuid, target).await,
            ClientEvent::Skip { uuid } => self.skip(sid, uuid).await,
        };
        if let Err(e) = result {
            warn!("Event from {sid} dropped: {e}");
        }
    }

    async fn room(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    /// The room the session has joined, if any.
    async fn session_room(&self, sid: Sid) -> Option<Arc<Room>> {
        let room_id = self.sessions.read().await.get(&sid)?.room.clone()?;
        self.room(&room_id).await
    }

    async fn is_admin(&self, sid: Sid) -> bool {
        self.sessions
            .read()
            .await
            .get(&sid)
            .map(|s| s.is_admin)
            .unwrap_or(false)
    }

    async fn join(&self, sid: Sid, room_id: &str) {
        if let Some(session) = self.sessions.write().await.get_mut(&sid) {
            session.room = Some(room_id.to_string());
        }
    }

    /// Send one event to one session. Dead sessions are ignored; their
    /// disconnect is handled by the transport layer.
    async fn emit(&self, sid: Sid, event: ServerEvent) {
        if let Some(session) = self.sessions.read().await.get(&sid) {
            let _ = session.tx.send(event);
        }
    }

    async fn emit_to_playback(&self, room: &Room, event: ServerEvent) {
        if let Some(sid) = room.playback_sid().await {
            self.emit(sid, event).await;
        } else {
            debug!("Room {} has no playback client connected", room.id);
        }
    }

    async fn state_payload(&self, room: &Room) -> StatePayload {
        StatePayload {
            queue: room.queue.to_list().await,
            recent: room.recent.lock().await.clone(),
        }
    }

    /// Broadcast the room state to every session in the room. The
    /// broadcast lock keeps the per-room ordering guarantee: a client
    /// observing broadcast n observes n+1 next.
    async fn send_state(&self, room: &Room) {
        let _order = room.broadcast_lock.lock().await;
        let payload = self.state_payload(room).await;
        let sessions = self.sessions.read().await;
        for session in sessions
            .values()
            .filter(|s| s.room.as_deref() == Some(room.id.as_str()))
        {
            let _ = session.tx.send(ServerEvent::State(payload.clone()));
        }
    }

    /// Push the room state to a single session.
    async fn send_state_to(&self, room: &Room, sid: Sid) {
        let _order = room.broadcast_lock.lock().await;
        let payload = self.state_payload(room).await;
        self.emit(sid, ServerEvent::State(payload)).await;
    }

    /// Generate an unused room code: 4 letters, one longer per collision.
    async fn generate_room_code(&self) -> String {
        let rooms = self.rooms.read().await;
        let mut len = ROOM_CODE_LEN;
        loop {
            let code: String = (0..len).map(|_| fastrand::alphabetic()).collect();
            if !rooms.contains_key(&code) {
                return code;
            }
            len += 1;
        }
    }

    async fn register_client(&self, sid: Sid, reg: RegisterClient) -> AppResult<()> {
        let room_id = match &reg.room {
            Some(room) if !room.is_empty() => room.clone(),
            _ => self.generate_room_code().await,
        };

        if let Some(keys) = &self.registration_keys {
            let presented = reg.key.as_deref().unwrap_or("");
            if !keys.contains(presented) {
                warn!("Registration for {room_id} refused: unknown key");
                self.emit(
                    sid,
                    ServerEvent::ClientRegistered {
                        success: false,
                        room: room_id,
                    },
                )
                .await;
                return Ok(());
            }
        }

        if !PROTOCOL_VERSION.compatible_with(&reg.version) {
            warn!(
                "Registration for {room_id} refused: protocol {} vs {}",
                reg.version, PROTOCOL_VERSION
            );
            self.emit(
                sid,
                ServerEvent::ClientRegistered {
                    success: false,
                    room: room_id,
                },
            )
            .await;
            return Ok(());
        }

        if let Some(room) = self.room(&room_id).await {
            if reg.secret == room.secret {
                info!("Got new playback client connection for {room_id}");
                *room.playback_sid.lock().await = Some(sid);
                *room.config.write().await = reg.config.clone();
                self.join(sid, &room_id).await;
                self.emit(
                    sid,
                    ServerEvent::ClientRegistered {
                        success: true,
                        room: room_id,
                    },
                )
                .await;
                self.send_state_to(&room, sid).await;
            } else {
                warn!("Got wrong secret for {room_id}");
                self.emit(
                    sid,
                    ServerEvent::ClientRegistered {
                        success: false,
                        room: room_id,
                    },
                )
                .await;
            }
            return Ok(());
        }

        info!("Registered new room {room_id}");
        let room = Arc::new(Room::new(
            room_id.clone(),
            reg.secret.clone(),
            &reg,
            sid,
        ));
        {
            // Re-check under the write lock; a concurrent registration may
            // have claimed the code since the lookup above.
            let mut rooms = self.rooms.write().await;
            if rooms.contains_key(&room_id) {
                self.emit(
                    sid,
                    ServerEvent::ClientRegistered {
                        success: false,
                        room: room_id,
                    },
                )
                .await;
                return Ok(());
            }
            rooms.insert(room_id.clone(), room.clone());
        }
        self.join(sid, &room_id).await;
        self.emit(
            sid,
            ServerEvent::ClientRegistered {
                success: true,
                room: room_id,
            },
        )
        .await;
        self.send_state(&room).await;
        Ok(())
    }

    async fn register_web(&self, sid: Sid, room_id: String) -> AppResult<()> {
        match self.room(&room_id).await {
            Some(room) => {
                self.join(sid, &room_id).await;
                self.emit(sid, ServerEvent::WebRegistered { success: true })
                    .await;
                self.send_state_to(&room, sid).await;
            }
            None => {
                self.emit(sid, ServerEvent::WebRegistered { success: false })
                    .await;
            }
        }
        Ok(())
    }

    async fn register_admin(&self, sid: Sid, secret: String) -> AppResult<()> {
        let Some(room) = self.session_room(sid).await else {
            self.emit(sid, ServerEvent::AdminRegistered { success: false })
                .await;
            return Ok(());
        };
        let success = secret == room.secret;
        if !success {
            warn!("Failed admin attempt in room {}", room.id);
        }
        if let Some(session) = self.sessions.write().await.get_mut(&sid) {
            session.is_admin = success;
        }
        self.emit(sid, ServerEvent::AdminRegistered { success })
            .await;
        Ok(())
    }

    /// The playback client announced which sources it runs. Drop the ones
    /// that disappeared, request configs for the new ones, remember the
    /// search priority order.
    async fn update_sources(&self, sid: Sid, names: Vec<String>) -> AppResult<()> {
        let Some(room) = self.session_room(sid).await else {
            return Ok(());
        };

        let known: HashSet<String> = room.sources.read().await.keys().cloned().collect();
        let announced: HashSet<String> = names.iter().cloned().collect();

        {
            let mut sources = room.sources.write().await;
            for unused in known.difference(&announced) {
                debug!("Dropping unused source {unused} in room {}", room.id);
                sources.remove(unused);
            }
        }

        *room.sources_prio.write().await = names.clone();

        for new in names.iter().filter(|n| !known.contains(*n)) {
            self.emit(
                sid,
                ServerEvent::RequestConfig {
                    source: new.clone(),
                },
            )
            .await;
        }
        Ok(())
    }

    async fn install_config(&self, sid: Sid, config: SourceConfig) -> AppResult<()> {
        let Some(room) = self.session_room(sid).await else {
            return Ok(());
        };
        let source = self.registry.build(&config.source, config.config)?;
        room.sources.write().await.insert(config.source, source);
        Ok(())
    }

    /// Install one chunk of a chunked source config: the first chunk for a
    /// source initializes the instance, later chunks extend it.
    async fn install_config_chunk(&self, sid: Sid, chunk: ConfigChunk) -> AppResult<()> {
        let Some(room) = self.session_room(sid).await else {
            return Ok(());
        };
        let mut sources = room.sources.write().await;
        match sources.get(&chunk.source) {
            None => {
                let source = self.registry.build(&chunk.source, chunk.config)?;
                sources.insert(chunk.source.clone(), source);
            }
            Some(source) => {
                source.add_to_config(chunk.config).await?;
            }
        }
        if chunk.number == chunk.total {
            debug!(
                "Source {} configured in room {} ({} chunks)",
                chunk.source, room.id, chunk.total
            );
        }
        Ok(())
    }

    async fn get_state(&self, sid: Sid) -> AppResult<()> {
        if let Some(room) = self.session_room(sid).await {
            self.send_state_to(&room, sid).await;
        }
        Ok(())
    }

    /// Resolve the request through the named source, apply the end-time
    /// guard, enqueue, and ask the playback client to start buffering.
    async fn append(&self, sid: Sid, request: AppendRequest) -> AppResult<()> {
        let Some(room) = self.session_room(sid).await else {
            return Ok(());
        };

        let source = room.sources.read().await.get(&request.source).cloned();
        let Some(source) = source else {
            warn!("Append with unknown source {}", request.source);
            self.emit(
                sid,
                ServerEvent::Msg {
                    msg: format!("Unknown source: {}", request.source),
                },
            )
            .await;
            return Ok(());
        };

        let entry = match source.resolve(&request.performer, &request.id).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Could not resolve {}: {e}", request.id);
                self.emit(
                    sid,
                    ServerEvent::Msg {
                        msg: format!("Could not add {}.", request.id),
                    },
                )
                .await;
                return Ok(());
            }
        };

        let config = room.config.read().await.clone();
        if let Some(last_song) = config.last_song {
            let projected = self.projected_start(&room, &config).await;
            if last_song < projected {
                let ends_at = Local
                    .timestamp_opt(last_song as i64, 0)
                    .single()
                    .map(|t| t.format("%H:%M").to_string())
                    .unwrap_or_else(|| "--:--".to_string());
                self.emit(
                    sid,
                    ServerEvent::Msg {
                        msg: format!("The song queue ends at {ends_at}."),
                    },
                )
                .await;
                return Ok(());
            }
        }

        room.queue.append(entry.clone()).await;
        self.send_state(&room).await;
        self.emit_to_playback(&room, ServerEvent::Buffer(entry)).await;
        Ok(())
    }

    /// Wall-clock estimate for when a newly appended entry would start:
    /// the head's start (or now) plus every queued entry's duration,
    /// preview and transition second.
    async fn projected_start(&self, room: &Room, config: &RoomConfig) -> f64 {
        let now = Utc::now().timestamp() as f64;
        let head_start = room
            .queue
            .try_peek()
            .await
            .and_then(|head| head.started_at)
            .unwrap_or(now);
        let start = head_start.max(now);
        room.queue
            .fold(start, |acc, entry| {
                acc + entry.duration as f64 + config.preview_duration as f64 + 1.0
            })
            .await
    }

    async fn meta_info(&self, sid: Sid, meta: MetaInfo) -> AppResult<()> {
        let Some(room) = self.session_room(sid).await else {
            return Ok(());
        };
        let Ok(uuid) = Uuid::parse_str(&meta.uuid) else {
            warn!("meta-info with unparseable uuid {}", meta.uuid);
            return Ok(());
        };
        room.queue.update(&uuid, |entry| entry.apply_meta(&meta.meta)).await;
        self.send_state(&room).await;
        Ok(())
    }

    /// Prime the pipeline: wait for a head entry, stamp its start time and
    /// tell the playback client to play it. Waiting and stamping happen in
    /// one queue exclusion region, so an admin skip cannot remove the head
    /// in between.
    async fn get_first(&self, sid: Sid) -> AppResult<()> {
        let Some(room) = self.session_room(sid).await else {
            return Ok(());
        };
        let stamped = room.queue.update_head(Entry::stamp_started).await;
        self.emit(sid, ServerEvent::Play(stamped)).await;
        Ok(())
    }

    /// The playback client finished a song: move it to the recent list,
    /// broadcast the pop, stamp the next head, broadcast again, play.
    async fn pop_then_get_next(&self, sid: Sid) -> AppResult<()> {
        let Some(room) = self.session_room(sid).await else {
            return Ok(());
        };

        let done = room.queue.pop_front().await;
        {
            let mut recent = room.recent.lock().await;
            recent.push(done);
            if recent.len() > RECENT_LIMIT {
                let excess = recent.len() - RECENT_LIMIT;
                recent.drain(..excess);
            }
        }
        self.send_state(&room).await;

        let stamped = room.queue.update_head(Entry::stamp_started).await;
        self.send_state(&room).await;
        self.emit(sid, ServerEvent::Play(stamped)).await;
        Ok(())
    }

    /// Fan the query out to every source in priority order and reply with
    /// the concatenation. A failing source contributes nothing.
    async fn search(&self, sid: Sid, query: String) -> AppResult<()> {
        let Some(room) = self.session_room(sid).await else {
            return Ok(());
        };

        let prio = room.sources_prio.read().await.clone();
        let sources = room.sources.read().await.clone();
        let searches = prio.iter().filter_map(|name| {
            let source = sources.get(name)?.clone();
            let query = query.clone();
            Some(async move {
                match source.search(&query).await {
                    Ok(results) => results,
                    Err(e) => {
                        warn!("Search failed for {}: {e}", source.name());
                        Vec::new()
                    }
                }
            })
        });

        let results = futures::future::join_all(searches)
            .await
            .into_iter()
            .flatten()
            .collect();
        self.emit(sid, ServerEvent::SearchResults { results }).await;
        Ok(())
    }

    async fn skip_current(&self, sid: Sid) -> AppResult<()> {
        if !self.is_admin(sid).await {
            warn!("Ignoring skip-current from non-admin {sid}");
            return Ok(());
        }
        if let Some(room) = self.session_room(sid).await {
            self.emit_to_playback(&room, ServerEvent::SkipCurrent).await;
        }
        Ok(())
    }

    async fn move_up(&self, sid: Sid, uuid: String) -> AppResult<()> {
        if !self.is_admin(sid).await {
            warn!("Ignoring move-up from non-admin {sid}");
            return Ok(());
        }
        let Some(room) = self.session_room(sid).await else {
            return Ok(());
        };
        let Ok(uuid) = Uuid::parse_str(&uuid) else {
            warn!("move-up with unparseable uuid {uuid}");
            return Ok(());
        };
        room.queue.move_up(&uuid).await;
        self.send_state(&room).await;
        Ok(())
    }

    /// Admin reorder to an arbitrary position. The head and the entry
    /// being buffered stay put unless the room allows head reordering.
    async fn move_to(&self, sid: Sid, uuid: String, target: usize) -> AppResult<()> {
        if !self.is_admin(sid).await {
            warn!("Ignoring move-to from non-admin {sid}");
            return Ok(());
        }
        let Some(room) = self.session_room(sid).await else {
            return Ok(());
        };
        let Ok(uuid) = Uuid::parse_str(&uuid) else {
            warn!("move-to with unparseable uuid {uuid}");
            return Ok(());
        };

        let allow_reorder_head = room.config.read().await.allow_reorder_head;
        if !allow_reorder_head {
            let entries = room.queue.to_list().await;
            let current = entries.iter().position(|e| e.uuid == uuid);
            let protected = matches!(current, Some(0) | Some(1)) || target <= 1;
            if protected {
                debug!("move-to touching the playing or buffering slot ignored");
                return Ok(());
            }
        }

        room.queue.move_to(&uuid, target).await;
        self.send_state(&room).await;
        Ok(())
    }

    async fn skip(&self, sid: Sid, uuid: String) -> AppResult<()> {
        if !self.is_admin(sid).await {
            warn!("Ignoring skip from non-admin {sid}");
            return Ok(());
        }
        let Some(room) = self.session_room(sid).await else {
            return Ok(());
        };
        let Ok(uuid) = Uuid::parse_str(&uuid) else {
            warn!("skip with unparseable uuid {uuid}");
            return Ok(());
        };
        if let Some(entry) = room.queue.find_by_uuid(&uuid).await {
            info!("Skipping {} - {}", entry.artist, entry.title);
            room.queue.remove(&uuid).await;
            self.send_state(&room).await;
        }
        Ok(())
    }
}

/// Read a registration keyfile: one key per line, blank lines ignored.
pub fn load_registration_keys(path: &std::path::Path) -> AppResult<HashSet<String>> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        crate::errors::AppError::configuration(format!(
            "cannot read registration keyfile {}: {e}",
            path.display()
        ))
    })?;
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}
