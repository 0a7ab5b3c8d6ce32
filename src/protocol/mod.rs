//! Wire protocol between the relay service and its clients
//!
//! Messages travel over a websocket as a JSON envelope
//! `{"event": <name>, "data": <payload>}`. Event payloads are typed here;
//! decoding is tolerant the way the data model is: unknown fields are
//! ignored, a missing `data` member is treated as an empty object.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{AppError, AppResult};
use crate::models::{Entry, MetaUpdate, RoomConfig, SearchResult};

/// Protocol version advertised in `register-client`. The relay refuses
/// registration when the major versions differ.
pub const PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion(2, 2, 0);

/// `(major, minor, patch)`, serialized as a 3-element array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersion(pub u16, pub u16, pub u16);

impl ProtocolVersion {
    pub fn major(&self) -> u16 {
        self.0
    }

    /// Whether a peer at `other` may register against this version.
    pub fn compatible_with(&self, other: &ProtocolVersion) -> bool {
        self.major() == other.major()
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        PROTOCOL_VERSION
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.0, self.1, self.2)
    }
}

/// The JSON envelope every message travels in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(event: &str, data: Value) -> Self {
        Self {
            event: event.to_string(),
            data,
        }
    }

    pub fn parse(text: &str) -> AppResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| AppError::protocol(format!("malformed envelope: {e}")))
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

fn decode<T: DeserializeOwned>(event: &str, data: Value) -> AppResult<T> {
    let data = if data.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        data
    };
    serde_json::from_value(data)
        .map_err(|e| AppError::protocol(format!("bad payload for '{event}': {e}")))
}

fn encode<T: Serialize>(payload: &T) -> Value {
    serde_json::to_value(payload).unwrap_or(Value::Null)
}

/// Payload of `register-client`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterClient {
    #[serde(default)]
    pub room: Option<String>,
    pub secret: String,
    #[serde(default)]
    pub queue: Vec<Entry>,
    #[serde(default)]
    pub recent: Vec<Entry>,
    #[serde(default)]
    pub config: RoomConfig,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub version: ProtocolVersion,
}

/// Payload of `append`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendRequest {
    pub source: String,
    pub id: String,
    pub performer: String,
}

/// Payload of `config` (full replacement) and of each `config-chunk`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source: String,
    pub config: Value,
}

/// One chunk of a chunked source config, 1-based numbering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigChunk {
    pub source: String,
    pub config: Value,
    pub number: usize,
    pub total: usize,
}

/// Payload of `meta-info`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaInfo {
    pub uuid: String,
    pub meta: MetaUpdate,
}

/// Payload of `state` broadcasts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatePayload {
    pub queue: Vec<Entry>,
    pub recent: Vec<Entry>,
}

/// Events flowing from a client (playback, web or admin) to the relay.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    RegisterClient(RegisterClient),
    RegisterWeb { room: String },
    RegisterAdmin { secret: String },
    Sources { sources: Vec<String> },
    Config(SourceConfig),
    ConfigChunk(ConfigChunk),
    Append(AppendRequest),
    MetaInfo(MetaInfo),
    GetState,
    GetFirst,
    PopThenGetNext,
    Search { query: String },
    SkipCurrent,
    MoveUp { uuid: String },
    MoveTo { uuid: String, target: usize },
    Skip { uuid: String },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct RoomOnly {
    room: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct SecretOnly {
    secret: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct SourcesOnly {
    sources: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct QueryOnly {
    query: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct UuidOnly {
    uuid: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct UuidTarget {
    uuid: String,
    target: usize,
}

impl ClientEvent {
    /// Decode a wire envelope into a typed event. Unknown event names are
    /// protocol errors; the caller logs and drops them.
    pub fn from_envelope(env: Envelope) -> AppResult<Self> {
        let Envelope { event, data } = env;
        let ev = match event.as_str() {
            "register-client" => Self::RegisterClient(decode(&event, data)?),
            "register-web" => {
                let RoomOnly { room } = decode(&event, data)?;
                Self::RegisterWeb { room }
            }
            "register-admin" => {
                let SecretOnly { secret } = decode(&event, data)?;
                Self::RegisterAdmin { secret }
            }
            "sources" => {
                let SourcesOnly { sources } = decode(&event, data)?;
                Self::Sources { sources }
            }
            "config" => Self::Config(decode(&event, data)?),
            "config-chunk" => Self::ConfigChunk(decode(&event, data)?),
            "append" => Self::Append(decode(&event, data)?),
            "meta-info" => Self::MetaInfo(decode(&event, data)?),
            "get-state" => Self::GetState,
            "get-first" => Self::GetFirst,
            "pop-then-get-next" => Self::PopThenGetNext,
            "search" => {
                let QueryOnly { query } = decode(&event, data)?;
                Self::Search { query }
            }
            "skip-current" => Self::SkipCurrent,
            "move-up" => {
                let UuidOnly { uuid } = decode(&event, data)?;
                Self::MoveUp { uuid }
            }
            "move-to" => {
                let UuidTarget { uuid, target } = decode(&event, data)?;
                Self::MoveTo { uuid, target }
            }
            "skip" => {
                let UuidOnly { uuid } = decode(&event, data)?;
                Self::Skip { uuid }
            }
            other => {
                return Err(AppError::protocol(format!("unknown event '{other}'")));
            }
        };
        Ok(ev)
    }

    pub fn into_envelope(self) -> Envelope {
        match self {
            Self::RegisterClient(p) => Envelope::new("register-client", encode(&p)),
            Self::RegisterWeb { room } => Envelope::new("register-web", encode(&RoomOnly { room })),
            Self::RegisterAdmin { secret } => {
                Envelope::new("register-admin", encode(&SecretOnly { secret }))
            }
            Self::Sources { sources } => Envelope::new("sources", encode(&SourcesOnly { sources })),
            Self::Config(p) => Envelope::new("config", encode(&p)),
            Self::ConfigChunk(p) => Envelope::new("config-chunk", encode(&p)),
            Self::Append(p) => Envelope::new("append", encode(&p)),
            Self::MetaInfo(p) => Envelope::new("meta-info", encode(&p)),
            Self::GetState => Envelope::new("get-state", Value::Null),
            Self::GetFirst => Envelope::new("get-first", Value::Null),
            Self::PopThenGetNext => Envelope::new("pop-then-get-next", Value::Null),
            Self::Search { query } => Envelope::new("search", encode(&QueryOnly { query })),
            Self::SkipCurrent => Envelope::new("skip-current", Value::Null),
            Self::MoveUp { uuid } => Envelope::new("move-up", encode(&UuidOnly { uuid })),
            Self::MoveTo { uuid, target } => {
                Envelope::new("move-to", encode(&UuidTarget { uuid, target }))
            }
            Self::Skip { uuid } => Envelope::new("skip", encode(&UuidOnly { uuid })),
        }
    }
}

/// Events flowing from the relay to a client.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    ClientRegistered { success: bool, room: String },
    WebRegistered { success: bool },
    AdminRegistered { success: bool },
    State(StatePayload),
    Buffer(Entry),
    Play(Entry),
    RequestConfig { source: String },
    SearchResults { results: Vec<SearchResult> },
    Msg { msg: String },
    SkipCurrent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Registered {
    success: bool,
    room: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SuccessOnly {
    success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SourceOnly {
    source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Results {
    results: Vec<SearchResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MsgOnly {
    msg: String,
}

impl ServerEvent {
    pub fn from_envelope(env: Envelope) -> AppResult<Self> {
        let Envelope { event, data } = env;
        let ev = match event.as_str() {
            "client-registered" => {
                let Registered { success, room } = decode(&event, data)?;
                Self::ClientRegistered { success, room }
            }
            "register-web" => {
                let SuccessOnly { success } = decode(&event, data)?;
                Self::WebRegistered { success }
            }
            "register-admin" => {
                let SuccessOnly { success } = decode(&event, data)?;
                Self::AdminRegistered { success }
            }
            "state" => Self::State(decode(&event, data)?),
            "buffer" => Self::Buffer(decode(&event, data)?),
            "play" => Self::Play(decode(&event, data)?),
            "request-config" => {
                let SourceOnly { source } = decode(&event, data)?;
                Self::RequestConfig { source }
            }
            "search-results" => {
                let Results { results } = decode(&event, data)?;
                Self::SearchResults { results }
            }
            "msg" => {
                let MsgOnly { msg } = decode(&event, data)?;
                Self::Msg { msg }
            }
            "skip-current" => Self::SkipCurrent,
            other => {
                return Err(AppError::protocol(format!("unknown event '{other}'")));
            }
        };
        Ok(ev)
    }

    pub fn into_envelope(self) -> Envelope {
        match self {
            Self::ClientRegistered { success, room } => {
                Envelope::new("client-registered", encode(&Registered { success, room }))
            }
            Self::WebRegistered { success } => {
                Envelope::new("register-web", encode(&SuccessOnly { success }))
            }
            Self::AdminRegistered { success } => {
                Envelope::new("register-admin", encode(&SuccessOnly { success }))
            }
            Self::State(p) => Envelope::new("state", encode(&p)),
            Self::Buffer(entry) => Envelope::new("buffer", encode(&entry)),
            Self::Play(entry) => Envelope::new("play", encode(&entry)),
            Self::RequestConfig { source } => {
                Envelope::new("request-config", encode(&SourceOnly { source }))
            }
            Self::SearchResults { results } => {
                Envelope::new("search-results", encode(&Results { results }))
            }
            Self::Msg { msg } => Envelope::new("msg", encode(&MsgOnly { msg })),
            Self::SkipCurrent => Envelope::new("skip-current", Value::Null),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trip() {
        let env = ClientEvent::Search {
            query: "bohemian".into(),
        }
        .into_envelope();
        let text = env.to_text();
        let parsed = Envelope::parse(&text).unwrap();
        match ClientEvent::from_envelope(parsed).unwrap() {
            ClientEvent::Search { query } => assert_eq!(query, "bohemian"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn payloadless_events_accept_missing_data() {
        let parsed = Envelope::parse(r#"{"event":"get-state"}"#).unwrap();
        assert!(matches!(
            ClientEvent::from_envelope(parsed).unwrap(),
            ClientEvent::GetState
        ));
    }

    #[test]
    fn unknown_event_is_a_protocol_error() {
        let parsed = Envelope::parse(r#"{"event":"nope","data":{}}"#).unwrap();
        assert!(ClientEvent::from_envelope(parsed).is_err());
    }

    #[test]
    fn register_client_defaults_version() {
        let env = Envelope::parse(
            r#"{"event":"register-client","data":{"secret":"s","config":{}}}"#,
        )
        .unwrap();
        match ClientEvent::from_envelope(env).unwrap() {
            ClientEvent::RegisterClient(reg) => {
                assert_eq!(reg.version, PROTOCOL_VERSION);
                assert!(reg.room.is_none());
                assert_eq!(reg.config.preview_duration, 3);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn version_serializes_as_triple() {
        assert_eq!(
            serde_json::to_string(&PROTOCOL_VERSION).unwrap(),
            "[2,2,0]"
        );
    }
}
