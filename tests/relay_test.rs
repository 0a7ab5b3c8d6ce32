//! Relay service scenarios, driven against the event handlers directly
//! with channel-backed sessions standing in for websocket connections.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;
use uuid::Uuid;

use syng::errors::AppResult;
use syng::models::{Entry, MetaUpdate, RoomConfig, SearchResult};
use syng::protocol::{
    AppendRequest, ClientEvent, MetaInfo, RegisterClient, ServerEvent, SourceConfig,
    PROTOCOL_VERSION,
};
use syng::server::rooms::{Relay, Sid};
use syng::sources::{
    matches_query, tokenize_query, Source, SourceConfigPayload, SourceRegistry, SourceState,
};

/// A deterministic source for tests: a fixed catalogue configured as
/// `{"songs": [{"id", "title", "artist", "duration"}]}`.
struct StubSource {
    name: String,
    state: SourceState,
    songs: Vec<StubSong>,
}

#[derive(Clone, Deserialize)]
struct StubSong {
    id: String,
    title: String,
    #[serde(default)]
    artist: String,
    #[serde(default)]
    duration: u32,
}

#[derive(Deserialize)]
struct StubConfig {
    #[serde(default)]
    songs: Vec<StubSong>,
}

impl StubSource {
    fn factory(name: &'static str) -> impl Fn(serde_json::Value) -> AppResult<Arc<dyn Source>> {
        move |config| {
            let config: StubConfig = serde_json::from_value(config).unwrap();
            Ok(Arc::new(StubSource {
                name: name.to_string(),
                state: SourceState::new(),
                songs: config.songs,
            }) as Arc<dyn Source>)
        }
    }
}

#[async_trait]
impl Source for StubSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> &SourceState {
        &self.state
    }

    async fn resolve(&self, performer: &str, id: &str) -> AppResult<Entry> {
        let song = self
            .songs
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .unwrap_or(StubSong {
                id: id.to_string(),
                title: id.to_string(),
                artist: String::new(),
                duration: 0,
            });
        Ok(Entry::new(
            song.id,
            self.name.clone(),
            performer,
            song.title,
            song.artist,
            "",
            song.duration,
        ))
    }

    async fn search(&self, query: &str) -> AppResult<Vec<SearchResult>> {
        let tokens = tokenize_query(query);
        Ok(self
            .songs
            .iter()
            .filter(|s| matches_query(&tokens, &format!("{} {}", s.title, s.artist)))
            .map(|s| SearchResult {
                id: s.id.clone(),
                source: self.name.clone(),
                title: s.title.clone(),
                artist: s.artist.clone(),
            })
            .collect())
    }

    async fn do_buffer(&self, _entry: &Entry) -> AppResult<(PathBuf, Option<PathBuf>)> {
        Ok((PathBuf::from("/tmp/stub"), None))
    }

    async fn get_config(&self) -> AppResult<SourceConfigPayload> {
        Ok(SourceConfigPayload::Full(json!({})))
    }
}

fn test_relay() -> Relay {
    let mut registry = SourceRegistry::new();
    registry.register("stub", Box::new(StubSource::factory("stub")));
    registry.register("s1", Box::new(StubSource::factory("s1")));
    registry.register("s2", Box::new(StubSource::factory("s2")));
    Relay::new(registry, None)
}

struct TestSession {
    sid: Sid,
    rx: UnboundedReceiver<ServerEvent>,
}

async fn connect(relay: &Relay) -> TestSession {
    let sid = Uuid::new_v4();
    let rx = relay.connect(sid).await;
    TestSession { sid, rx }
}

async fn next_event(session: &mut TestSession) -> ServerEvent {
    timeout(Duration::from_secs(1), session.rx.recv())
        .await
        .expect("expected an event in time")
        .expect("session channel closed")
}

fn assert_no_event(session: &mut TestSession) {
    assert!(
        session.rx.try_recv().is_err(),
        "expected no pending events"
    );
}

fn registration(room: Option<&str>, secret: &str, queue: Vec<Entry>) -> RegisterClient {
    RegisterClient {
        room: room.map(str::to_string),
        secret: secret.to_string(),
        queue,
        recent: Vec::new(),
        config: RoomConfig::default(),
        key: None,
        version: PROTOCOL_VERSION,
    }
}

/// Register a playback session, drain its registration events and return
/// the assigned room code.
async fn register_playback(
    relay: &Relay,
    session: &mut TestSession,
    room: Option<&str>,
    secret: &str,
    queue: Vec<Entry>,
) -> String {
    relay
        .handle_event(
            session.sid,
            ClientEvent::RegisterClient(registration(room, secret, queue)),
        )
        .await;
    let ServerEvent::ClientRegistered { success, room } = next_event(session).await else {
        panic!("expected client-registered first");
    };
    assert!(success);
    let ServerEvent::State(_) = next_event(session).await else {
        panic!("expected initial state push");
    };
    room
}

/// Configure the `stub` source with a small catalogue in a room.
async fn install_stub(relay: &Relay, playback: &TestSession, source: &str) {
    relay
        .handle_event(
            playback.sid,
            ClientEvent::Config(SourceConfig {
                source: source.to_string(),
                config: json!({
                    "songs": [
                        {"id": "https://y/watch?v=A", "title": "Song A", "artist": "Alice Band", "duration": 210},
                        {"id": "https://y/watch?v=B", "title": "Song B", "artist": "Bob Band", "duration": 180},
                    ]
                }),
            }),
        )
        .await;
}

#[tokio::test]
async fn fresh_room_gets_a_four_letter_code() {
    let relay = test_relay();
    let mut playback = connect(&relay).await;

    relay
        .handle_event(
            playback.sid,
            ClientEvent::RegisterClient(registration(None, "abcd1234", Vec::new())),
        )
        .await;

    let ServerEvent::ClientRegistered { success, room } = next_event(&mut playback).await else {
        panic!("expected client-registered");
    };
    assert!(success);
    assert_eq!(room.len(), 4);
    assert!(room.chars().all(|c| c.is_ascii_alphabetic()));

    let ServerEvent::State(state) = next_event(&mut playback).await else {
        panic!("expected state");
    };
    assert!(state.queue.is_empty());
    assert!(state.recent.is_empty());
}

#[tokio::test]
async fn append_then_play_flow() {
    let relay = test_relay();
    let mut playback = connect(&relay).await;
    let room = register_playback(&relay, &mut playback, None, "abcd1234", Vec::new()).await;
    install_stub(&relay, &playback, "stub").await;

    let mut web = connect(&relay).await;
    relay
        .handle_event(web.sid, ClientEvent::RegisterWeb { room: room.clone() })
        .await;
    let ServerEvent::WebRegistered { success: true } = next_event(&mut web).await else {
        panic!("expected web registration to succeed");
    };
    let ServerEvent::State(_) = next_event(&mut web).await else {
        panic!("expected initial state");
    };

    relay
        .handle_event(
            web.sid,
            ClientEvent::Append(AppendRequest {
                source: "stub".to_string(),
                id: "https://y/watch?v=A".to_string(),
                performer: "Alice".to_string(),
            }),
        )
        .await;

    // Web observes the append at the tail.
    let ServerEvent::State(state) = next_event(&mut web).await else {
        panic!("expected state after append");
    };
    assert_eq!(state.queue.len(), 1);
    let entry = state.queue.last().unwrap().clone();
    assert_eq!(entry.title, "Song A");
    assert_eq!(entry.performer, "Alice");
    assert_eq!(entry.duration, 210);
    assert!(entry.started_at.is_none());

    // Playback gets the same broadcast plus the buffer request.
    let ServerEvent::State(_) = next_event(&mut playback).await else {
        panic!("expected state on playback");
    };
    let ServerEvent::Buffer(buffered) = next_event(&mut playback).await else {
        panic!("expected buffer request");
    };
    assert_eq!(buffered.uuid, entry.uuid);

    // Metadata flows back and is rebroadcast.
    relay
        .handle_event(
            playback.sid,
            ClientEvent::MetaInfo(MetaInfo {
                uuid: entry.uuid.to_string(),
                meta: MetaUpdate::duration(211),
            }),
        )
        .await;
    let ServerEvent::State(state) = next_event(&mut web).await else {
        panic!("expected state after meta-info");
    };
    assert_eq!(state.queue[0].duration, 211);
    let ServerEvent::State(_) = next_event(&mut playback).await else {
        panic!("expected state after meta-info");
    };

    // get-first stamps and plays the head.
    relay.handle_event(playback.sid, ClientEvent::GetFirst).await;
    let ServerEvent::Play(playing) = next_event(&mut playback).await else {
        panic!("expected play");
    };
    assert_eq!(playing.uuid, entry.uuid);
    assert!(playing.started_at.is_some());
}

#[tokio::test]
async fn pop_then_get_next_broadcasts_twice() {
    let relay = test_relay();
    let e1 = Entry::new("id-1", "stub", "P1", "First", "", "", 60);
    let e2 = Entry::new("id-2", "stub", "P2", "Second", "", "", 60);
    let mut playback = connect(&relay).await;
    register_playback(
        &relay,
        &mut playback,
        Some("WXYZ"),
        "abcd1234",
        vec![e1.clone(), e2.clone()],
    )
    .await;

    relay
        .handle_event(playback.sid, ClientEvent::PopThenGetNext)
        .await;

    // First broadcast: E1 popped into recent, E2 not yet stamped.
    let ServerEvent::State(state) = next_event(&mut playback).await else {
        panic!("expected post-pop state");
    };
    assert_eq!(state.queue.len(), 1);
    assert_eq!(state.queue[0].uuid, e2.uuid);
    assert!(state.queue[0].started_at.is_none());
    assert_eq!(state.recent.last().unwrap().uuid, e1.uuid);

    // Second broadcast: the new head is stamped.
    let ServerEvent::State(state) = next_event(&mut playback).await else {
        panic!("expected post-stamp state");
    };
    assert!(state.queue[0].started_at.is_some());

    let ServerEvent::Play(playing) = next_event(&mut playback).await else {
        panic!("expected play");
    };
    assert_eq!(playing.uuid, e2.uuid);
    assert!(playing.started_at.is_some());
}

#[tokio::test]
async fn admin_skip_requires_the_flag() {
    let relay = test_relay();
    let doomed = Entry::new("id-1", "stub", "P", "Doomed", "", "", 60);
    let keeper = Entry::new("id-2", "stub", "P", "Keeper", "", "", 60);
    let mut playback = connect(&relay).await;
    let room = register_playback(
        &relay,
        &mut playback,
        None,
        "abcd1234",
        vec![keeper.clone(), doomed.clone()],
    )
    .await;

    let mut web = connect(&relay).await;
    relay
        .handle_event(web.sid, ClientEvent::RegisterWeb { room: room.clone() })
        .await;
    next_event(&mut web).await; // registered
    next_event(&mut web).await; // state

    // Not an admin yet: the skip is silently dropped.
    relay
        .handle_event(
            web.sid,
            ClientEvent::Skip {
                uuid: doomed.uuid.to_string(),
            },
        )
        .await;
    assert_no_event(&mut web);

    relay
        .handle_event(
            web.sid,
            ClientEvent::RegisterAdmin {
                secret: "abcd1234".to_string(),
            },
        )
        .await;
    let ServerEvent::AdminRegistered { success: true } = next_event(&mut web).await else {
        panic!("expected admin registration to succeed");
    };

    relay
        .handle_event(
            web.sid,
            ClientEvent::Skip {
                uuid: doomed.uuid.to_string(),
            },
        )
        .await;
    let ServerEvent::State(state) = next_event(&mut web).await else {
        panic!("expected state after skip");
    };
    assert_eq!(state.queue.len(), 1);
    assert_eq!(state.queue[0].uuid, keeper.uuid);
}

#[tokio::test]
async fn wrong_admin_secret_is_refused() {
    let relay = test_relay();
    let mut playback = connect(&relay).await;
    let room = register_playback(&relay, &mut playback, None, "right", Vec::new()).await;

    let mut web = connect(&relay).await;
    relay
        .handle_event(web.sid, ClientEvent::RegisterWeb { room })
        .await;
    next_event(&mut web).await;
    next_event(&mut web).await;

    relay
        .handle_event(
            web.sid,
            ClientEvent::RegisterAdmin {
                secret: "wrong".to_string(),
            },
        )
        .await;
    let ServerEvent::AdminRegistered { success } = next_event(&mut web).await else {
        panic!("expected admin reply");
    };
    assert!(!success);
}

#[tokio::test]
async fn cutoff_refuses_late_appends() {
    let relay = test_relay();
    let head = Entry::new("id-1", "stub", "P", "Long Song", "", "", 120);
    let mut playback = connect(&relay).await;

    let mut reg = registration(Some("WXYZ"), "abcd1234", vec![head]);
    reg.config.last_song = Some(chrono::Utc::now().timestamp() as f64 + 60.0);
    relay
        .handle_event(playback.sid, ClientEvent::RegisterClient(reg))
        .await;
    next_event(&mut playback).await; // registered
    next_event(&mut playback).await; // state

    install_stub(&relay, &playback, "stub").await;

    relay
        .handle_event(
            playback.sid,
            ClientEvent::Append(AppendRequest {
                source: "stub".to_string(),
                id: "https://y/watch?v=B".to_string(),
                performer: "Bob".to_string(),
            }),
        )
        .await;

    let ServerEvent::Msg { msg } = next_event(&mut playback).await else {
        panic!("expected cutoff message");
    };
    assert!(
        msg.starts_with("The song queue ends at "),
        "unexpected message: {msg}"
    );
    assert_no_event(&mut playback);
}

#[tokio::test]
async fn search_concatenates_sources_in_priority_order() {
    let relay = test_relay();
    let mut playback = connect(&relay).await;
    register_playback(&relay, &mut playback, None, "abcd1234", Vec::new()).await;

    relay
        .handle_event(
            playback.sid,
            ClientEvent::Config(SourceConfig {
                source: "s1".to_string(),
                config: json!({"songs": [
                    {"id": "1a", "title": "Bohemian Rhapsody Karaoke", "artist": "Queen"},
                ]}),
            }),
        )
        .await;
    relay
        .handle_event(
            playback.sid,
            ClientEvent::Config(SourceConfig {
                source: "s2".to_string(),
                config: json!({"songs": [
                    {"id": "2a", "title": "Bohemian Like You Karaoke", "artist": "Dandy Warhols"},
                    {"id": "2b", "title": "Radio Ga Ga", "artist": "Queen"},
                ]}),
            }),
        )
        .await;
    relay
        .handle_event(
            playback.sid,
            ClientEvent::Sources {
                sources: vec!["s1".to_string(), "s2".to_string()],
            },
        )
        .await;
    // Both sources already have configs, so no request-config roundtrip is
    // needed; the announcement fixes the priority order.

    relay
        .handle_event(
            playback.sid,
            ClientEvent::Search {
                query: "karaoke bohemian".to_string(),
            },
        )
        .await;

    let ServerEvent::SearchResults { results } = next_event(&mut playback).await else {
        panic!("expected search results");
    };
    let ids: Vec<_> = results.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, ["1a", "2a"]);
    assert_eq!(results[0].source, "s1");
    assert_eq!(results[1].source, "s2");
}

#[tokio::test]
async fn reregistration_keeps_the_queue_only_with_the_right_secret() {
    let relay = test_relay();
    let held = Entry::new("id-1", "stub", "P", "Held", "", "", 60);
    let mut playback = connect(&relay).await;
    let room =
        register_playback(&relay, &mut playback, None, "abcd1234", vec![held.clone()]).await;

    // Wrong secret: refused, queue untouched.
    let mut intruder = connect(&relay).await;
    relay
        .handle_event(
            intruder.sid,
            ClientEvent::RegisterClient(registration(Some(&room), "wrong", Vec::new())),
        )
        .await;
    let ServerEvent::ClientRegistered { success, room: replied } =
        next_event(&mut intruder).await
    else {
        panic!("expected client-registered");
    };
    assert!(!success);
    assert_eq!(replied, room);
    assert_no_event(&mut intruder);

    // Right secret: reclaimed, queue preserved (the fresh snapshot the
    // reconnecting client carries does not replace it).
    let mut reclaimed = connect(&relay).await;
    relay
        .handle_event(
            reclaimed.sid,
            ClientEvent::RegisterClient(registration(Some(&room), "abcd1234", Vec::new())),
        )
        .await;
    let ServerEvent::ClientRegistered { success, .. } = next_event(&mut reclaimed).await else {
        panic!("expected client-registered");
    };
    assert!(success);
    let ServerEvent::State(state) = next_event(&mut reclaimed).await else {
        panic!("expected state");
    };
    assert_eq!(state.queue.len(), 1);
    assert_eq!(state.queue[0].uuid, held.uuid);
}

#[tokio::test]
async fn old_major_version_is_refused() {
    let relay = test_relay();
    let mut playback = connect(&relay).await;

    let mut reg = registration(None, "abcd1234", Vec::new());
    reg.version = syng::protocol::ProtocolVersion(1, 9, 9);
    relay
        .handle_event(playback.sid, ClientEvent::RegisterClient(reg))
        .await;

    let ServerEvent::ClientRegistered { success, .. } = next_event(&mut playback).await else {
        panic!("expected client-registered");
    };
    assert!(!success);
}

#[tokio::test]
async fn move_up_and_move_to_respect_the_playing_head() {
    let relay = test_relay();
    let entries: Vec<Entry> = ["a", "b", "c", "d"]
        .iter()
        .map(|t| Entry::new(*t, "stub", "P", *t, "", "", 60))
        .collect();
    let uuids: Vec<Uuid> = entries.iter().map(|e| e.uuid).collect();

    let mut playback = connect(&relay).await;
    let room = register_playback(&relay, &mut playback, None, "abcd1234", entries).await;

    let mut admin = connect(&relay).await;
    relay
        .handle_event(admin.sid, ClientEvent::RegisterWeb { room })
        .await;
    next_event(&mut admin).await;
    next_event(&mut admin).await;
    relay
        .handle_event(
            admin.sid,
            ClientEvent::RegisterAdmin {
                secret: "abcd1234".to_string(),
            },
        )
        .await;
    next_event(&mut admin).await;

    // move-up of position 1 is a no-op, no broadcast of a changed order.
    relay
        .handle_event(
            admin.sid,
            ClientEvent::MoveUp {
                uuid: uuids[1].to_string(),
            },
        )
        .await;
    let ServerEvent::State(state) = next_event(&mut admin).await else {
        panic!("expected state");
    };
    let titles: Vec<_> = state.queue.iter().map(|e| e.title.as_str()).collect();
    assert_eq!(titles, ["a", "b", "c", "d"]);

    // move-up of position 2 swaps with position 1.
    relay
        .handle_event(
            admin.sid,
            ClientEvent::MoveUp {
                uuid: uuids[2].to_string(),
            },
        )
        .await;
    let ServerEvent::State(state) = next_event(&mut admin).await else {
        panic!("expected state");
    };
    let titles: Vec<_> = state.queue.iter().map(|e| e.title.as_str()).collect();
    assert_eq!(titles, ["a", "c", "b", "d"]);

    // move-to into the protected head region is ignored by default.
    relay
        .handle_event(
            admin.sid,
            ClientEvent::MoveTo {
                uuid: uuids[3].to_string(),
                target: 0,
            },
        )
        .await;
    assert_no_event(&mut admin);

    // move-to between free positions works.
    relay
        .handle_event(
            admin.sid,
            ClientEvent::MoveTo {
                uuid: uuids[3].to_string(),
                target: 2,
            },
        )
        .await;
    let ServerEvent::State(state) = next_event(&mut admin).await else {
        panic!("expected state");
    };
    let titles: Vec<_> = state.queue.iter().map(|e| e.title.as_str()).collect();
    assert_eq!(titles, ["a", "c", "d", "b"]);
}
