//! Shared data model for the relay service and the playback client
//!
//! Everything in here crosses the wire as JSON: entries serialize with all
//! fields present (UUIDs as canonical hyphenated strings, `started_at` as
//! epoch seconds or null), unknown fields are ignored on decode and missing
//! fields take their documented defaults.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One queued song.
///
/// The `uuid` is assigned at creation and identifies the entry for its
/// whole lifetime in a room; `(source, id)` may repeat when the same song
/// is queued twice. The `skip` flag is playback-client internal and never
/// serialized.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entry {
    pub uuid: Uuid,
    pub id: String,
    pub source: String,
    #[serde(default)]
    pub duration: u32,
    pub title: String,
    #[serde(default)]
    pub artist: String,
    #[serde(default)]
    pub album: String,
    pub performer: String,
    #[serde(default)]
    pub started_at: Option<f64>,
    #[serde(default)]
    pub failed: bool,
    #[serde(skip)]
    pub skip: bool,
}

impl Entry {
    /// Create a new entry with a fresh uuid and no start timestamp.
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        performer: impl Into<String>,
        title: impl Into<String>,
        artist: impl Into<String>,
        album: impl Into<String>,
        duration: u32,
    ) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            id: id.into(),
            source: source.into(),
            duration,
            title: title.into(),
            artist: artist.into(),
            album: album.into(),
            performer: performer.into(),
            started_at: None,
            failed: false,
            skip: false,
        }
    }

    /// Stamp the wall-clock start time, once. Calling this on an entry
    /// that already started is a no-op so the unset-to-set transition
    /// happens exactly once per entry.
    pub fn stamp_started(&mut self) {
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now().timestamp() as f64);
        }
    }

    /// Apply a partial metadata update reported by the playback client.
    pub fn apply_meta(&mut self, meta: &MetaUpdate) {
        if let Some(duration) = meta.duration {
            self.duration = duration;
        }
        if let Some(title) = &meta.title {
            self.title = title.clone();
        }
        if let Some(artist) = &meta.artist {
            self.artist = artist.clone();
        }
        if let Some(album) = &meta.album {
            self.album = album.clone();
        }
    }
}

/// A single search hit. Ephemeral: returned to the requesting session and
/// never stored in the queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchResult {
    pub id: String,
    pub source: String,
    pub title: String,
    pub artist: String,
}

/// Fields a source can fill in after the initial resolve, typically the
/// duration once the media has been probed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetaUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artist: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub album: Option<String>,
}

impl MetaUpdate {
    pub fn duration(duration: u32) -> Self {
        Self {
            duration: Some(duration),
            ..Self::default()
        }
    }
}

/// Per-room policy, supplied by the playback client at registration.
///
/// `last_song` is the optional cutoff after which appends are refused,
/// carried as epoch seconds on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoomConfig {
    #[serde(default = "default_preview_duration")]
    pub preview_duration: u32,
    #[serde(default)]
    pub last_song: Option<f64>,
    #[serde(default)]
    pub waiting_room_policy: Option<WaitingRoomPolicy>,
    #[serde(default = "default_buffer_in_advance")]
    pub buffer_in_advance: usize,
    #[serde(default = "default_true")]
    pub allow_collab_mode: bool,
    #[serde(default)]
    pub allow_reorder_head: bool,
}

fn default_preview_duration() -> u32 {
    3
}

fn default_buffer_in_advance() -> usize {
    2
}

fn default_true() -> bool {
    true
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            preview_duration: default_preview_duration(),
            last_song: None,
            waiting_room_policy: None,
            buffer_in_advance: default_buffer_in_advance(),
            allow_collab_mode: true,
            allow_reorder_head: false,
        }
    }
}

/// Policy for the waiting room of performers who already have a song
/// queued. Lowercase strings on the wire.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WaitingRoomPolicy {
    Forced,
    Optional,
    None,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_round_trips_with_canonical_uuid() {
        let entry = Entry::new("/a/b.cdg", "files", "Alice", "B", "A", "", 210);
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["uuid"], entry.uuid.to_string());
        assert_eq!(json["started_at"], serde_json::Value::Null);
        assert!(json.get("skip").is_none());

        let back: Entry = serde_json::from_value(json).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn entry_decode_ignores_unknown_and_defaults_missing() {
        let back: Entry = serde_json::from_value(serde_json::json!({
            "uuid": "67e55044-10b1-426f-9247-bb680e5fe0c8",
            "id": "x",
            "source": "youtube",
            "title": "T",
            "performer": "P",
            "extraneous": 42,
        }))
        .unwrap();
        assert_eq!(back.duration, 0);
        assert!(!back.failed);
        assert!(back.started_at.is_none());
    }

    #[test]
    fn stamp_started_is_one_shot() {
        let mut entry = Entry::new("x", "files", "P", "T", "", "", 0);
        entry.stamp_started();
        let first = entry.started_at;
        assert!(first.is_some());
        entry.stamp_started();
        assert_eq!(entry.started_at, first);
    }

    #[test]
    fn waiting_room_policy_is_lowercase_on_the_wire() {
        assert_eq!(
            serde_json::to_string(&WaitingRoomPolicy::Forced).unwrap(),
            "\"forced\""
        );
        let p: WaitingRoomPolicy = serde_json::from_str("\"none\"").unwrap();
        assert_eq!(p, WaitingRoomPolicy::None);
    }
}
