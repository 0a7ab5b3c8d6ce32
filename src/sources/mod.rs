//! Media source plugins and the contract they implement
//!
//! A source knows how to search a backend, resolve a result id into a
//! queue entry, buffer media to local files and hand them to the player.
//! The download bookkeeping (one buffer per entry id, a one-shot ready
//! event covering success and failure, skip/cancel handling, a single
//! player process per source) lives in [`SourceState`] and the provided
//! trait methods, so concrete sources only implement the backend-specific
//! pieces.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info};

use crate::errors::{AppResult, SourceError};
use crate::models::{Entry, MetaUpdate, SearchResult};

pub mod files;
pub mod player;
pub mod s3;
pub mod youtube;

/// How many index paths travel in one `config-chunk`.
pub const CONFIG_CHUNK_SIZE: usize = 1000;

/// A source's configuration on its way to the relay: either one blob or,
/// when it would exceed a practical message size, a list of chunks the
/// relay merges back together.
#[derive(Debug, Clone)]
pub enum SourceConfigPayload {
    Full(Value),
    Chunked(Vec<Value>),
}

/// Download bookkeeping for one entry id.
///
/// `ready` fires exactly once, covering success, failure and skip; the
/// in-memory `complete` flag is the only readiness authority (partial
/// files on disk are never trusted).
#[derive(Debug, Default)]
pub struct SlotState {
    pub video: Option<PathBuf>,
    pub audio: Option<PathBuf>,
    pub buffering: bool,
    pub complete: bool,
    pub failed: bool,
    pub skipped: bool,
    ready: bool,
    cancelled: bool,
}

#[derive(Debug, Default)]
pub struct DownloadSlot {
    pub state: Mutex<SlotState>,
    ready: Notify,
    cancel: Notify,
}

impl DownloadSlot {
    /// Suspend until the slot is ready (buffered, failed or skipped).
    pub async fn wait_ready(&self) {
        loop {
            let notified = self.ready.notified();
            if self.state.lock().await.ready {
                return;
            }
            notified.await;
        }
    }

    /// Mark ready and wake all waiters. Safe to call more than once.
    pub async fn mark_ready(&self) {
        self.state.lock().await.ready = true;
        self.ready.notify_waiters();
    }

    /// Suspend until the in-flight buffer for this slot is cancelled.
    pub async fn wait_cancelled(&self) {
        loop {
            let notified = self.cancel.notified();
            if self.state.lock().await.cancelled {
                return;
            }
            notified.await;
        }
    }

    async fn mark_cancelled(&self) {
        self.state.lock().await.cancelled = true;
        self.cancel.notify_waiters();
    }
}

/// Shared machinery every source instance owns: the download table and
/// the single player process slot.
#[derive(Default)]
pub struct SourceState {
    downloads: Mutex<HashMap<String, Arc<DownloadSlot>>>,
    player_gate: Mutex<()>,
    player_kill: Notify,
}

impl SourceState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch or create the download slot for an entry id.
    pub async fn slot(&self, id: &str) -> Arc<DownloadSlot> {
        let mut downloads = self.downloads.lock().await;
        downloads.entry(id.to_string()).or_default().clone()
    }

    /// Drop the cached artifact record for an entry id.
    pub async fn discard(&self, id: &str) {
        self.downloads.lock().await.remove(id);
    }

    /// Signal the running player, if any, to terminate.
    pub fn kill_player(&self) {
        self.player_kill.notify_waiters();
    }

    /// The lock serializing player launches for this source.
    pub fn player_gate(&self) -> &Mutex<()> {
        &self.player_gate
    }

    /// The notify handle a running player watches for termination.
    pub fn player_kill_handle(&self) -> &Notify {
        &self.player_kill
    }
}

/// The capability set every media source implements.
///
/// `buffer`, `ensure_playable`, `play` and `skip_current` are provided on
/// top of [`SourceState`]; concrete sources supply the backend operations.
#[async_trait]
pub trait Source: Send + Sync {
    fn name(&self) -> &str;

    fn state(&self) -> &SourceState;

    /// Extra arguments appended to the player command line.
    fn extra_player_args(&self) -> Vec<String> {
        Vec::new()
    }

    /// Turn a search-result id into a fully populated entry.
    async fn resolve(&self, performer: &str, id: &str) -> AppResult<Entry>;

    /// Ranked results for a query, best first.
    async fn search(&self, query: &str) -> AppResult<Vec<SearchResult>>;

    /// Backend-specific download. Returns the video path and an optional
    /// separate audio path.
    async fn do_buffer(&self, entry: &Entry) -> AppResult<(PathBuf, Option<PathBuf>)>;

    /// Fill in fields not resolvable at search time, typically duration.
    async fn get_missing_metadata(&self, _entry: &Entry) -> AppResult<MetaUpdate> {
        Ok(MetaUpdate::default())
    }

    /// The source configuration shipped to the relay.
    async fn get_config(&self) -> AppResult<SourceConfigPayload>;

    /// Accept one chunk of a chunked configuration.
    async fn add_to_config(&self, _chunk: Value) -> AppResult<()> {
        Ok(())
    }

    /// Idempotent download of an entry's media. A second caller for the
    /// same id becomes a waiter, not a second downloader; success sets
    /// `complete`, failure sets `failed`, both signal `ready`.
    async fn buffer(&self, entry: &Entry) {
        let slot = self.state().slot(&entry.id).await;
        {
            let mut st = slot.state.lock().await;
            if st.buffering || st.ready {
                return;
            }
            st.buffering = true;
        }

        let outcome = tokio::select! {
            res = self.do_buffer(entry) => Some(res),
            _ = slot.wait_cancelled() => None,
        };

        {
            let mut st = slot.state.lock().await;
            match outcome {
                Some(Ok((video, audio))) => {
                    st.video = Some(video);
                    st.audio = audio;
                    st.complete = true;
                }
                Some(Err(e)) => {
                    error!("Buffering failed for {} ({}): {e}", entry.title, entry.id);
                    st.failed = true;
                }
                None => {
                    debug!("Buffering cancelled for {}", entry.id);
                }
            }
        }
        slot.mark_ready().await;
    }

    /// Buffer if needed, then wait for the slot to become ready.
    async fn ensure_playable(&self, entry: &Entry) {
        self.buffer(entry).await;
        let slot = self.state().slot(&entry.id).await;
        slot.wait_ready().await;
    }

    /// Play a buffered entry with the external player and block until the
    /// player exits. A failed or skipped entry returns immediately and
    /// drops its cached artifact.
    async fn play(&self, entry: &Entry) -> AppResult<()> {
        play_buffered(self, entry).await
    }

    /// Skip the entry: cancel an in-flight buffer, release waiters and
    /// terminate the player process if one is running.
    async fn skip_current(&self, entry: &Entry) {
        let slot = self.state().slot(&entry.id).await;
        {
            let mut st = slot.state.lock().await;
            st.skipped = true;
            st.buffering = false;
        }
        slot.mark_cancelled().await;
        slot.mark_ready().await;
        self.state().kill_player();
    }
}

/// The shared playback path: wait for the buffer, bail out on failure or
/// skip, otherwise run the player to completion. Sources that override
/// `play` (e.g. for direct streaming) fall back to this for the buffered
/// case.
pub async fn play_buffered<S: Source + ?Sized>(source: &S, entry: &Entry) -> AppResult<()> {
    source.ensure_playable(entry).await;

    let slot = source.state().slot(&entry.id).await;
    let (video, audio, unplayable) = {
        let st = slot.state.lock().await;
        (st.video.clone(), st.audio.clone(), st.failed || st.skipped)
    };

    if unplayable || entry.skip {
        source.state().discard(&entry.id).await;
        return Ok(());
    }
    let Some(video) = video else {
        source.state().discard(&entry.id).await;
        return Ok(());
    };

    let state = source.state();
    let _gate = state.player_gate.lock().await;
    info!(
        "Playing {} - {} for {}",
        entry.artist, entry.title, entry.performer
    );
    let child = player::launch(&video, audio.as_deref(), &source.extra_player_args())?;
    player::wait_or_kill(child, &state.player_kill).await;
    Ok(())
}

/// Builds a configured source instance from its config blob, failing with
/// `ConfigInvalid` when the options do not validate.
pub type SourceFactory =
    Box<dyn Fn(Value) -> AppResult<Arc<dyn Source>> + Send + Sync>;

/// Name-to-constructor map for the known source kinds. Threaded through
/// construction on both the relay and the playback client; no process
/// globals.
pub struct SourceRegistry {
    factories: HashMap<String, SourceFactory>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with all built-in source kinds.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("youtube", Box::new(youtube::YoutubeSource::factory));
        registry.register("files", Box::new(files::FilesSource::factory));
        registry.register("s3", Box::new(s3::S3Source::factory));
        registry
    }

    pub fn register(&mut self, name: &str, factory: SourceFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Build one source from its config blob.
    pub fn build(&self, name: &str, config: Value) -> AppResult<Arc<dyn Source>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| SourceError::Unknown(name.to_string()))?;
        factory(config)
    }

    /// Build every configured source that names a known kind; unknown
    /// names are skipped.
    pub fn configure_sources(
        &self,
        configs: &HashMap<String, Value>,
    ) -> AppResult<HashMap<String, Arc<dyn Source>>> {
        let mut sources = HashMap::new();
        for (name, config) in configs {
            if self.contains(name) {
                sources.insert(name.clone(), self.build(name, config.clone())?);
            }
        }
        Ok(sources)
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Lowercased shell-style tokens of a query. Unbalanced quoting falls
/// back to plain whitespace splitting.
pub fn tokenize_query(query: &str) -> Vec<String> {
    let tokens = shlex::split(query)
        .unwrap_or_else(|| query.split_whitespace().map(str::to_string).collect());
    tokens.into_iter().map(|t| t.to_lowercase()).collect()
}

/// True when every token is a substring of the lowercased haystack.
pub fn matches_query(tokens: &[String], haystack: &str) -> bool {
    let haystack = haystack.to_lowercase();
    tokens.iter().all(|t| haystack.contains(t.as_str()))
}

/// Fraction of tokens missing from the haystack: `1 - hits/len`, so a
/// better match ranks lower. An empty query ranks everything equal.
pub fn miss_rank(tokens: &[String], haystack: &str) -> f64 {
    if tokens.is_empty() {
        return 0.0;
    }
    let haystack = haystack.to_lowercase();
    let hits = tokens.iter().filter(|t| haystack.contains(t.as_str())).count();
    1.0 - (hits as f64 / tokens.len() as f64)
}

/// Split an index into config-chunk sized JSON arrays.
pub fn chunk_index(index: &[String]) -> Vec<Value> {
    if index.is_empty() {
        return vec![Value::Array(Vec::new())];
    }
    index
        .chunks(CONFIG_CHUNK_SIZE)
        .map(|chunk| Value::Array(chunk.iter().map(|p| Value::from(p.as_str())).collect()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        state: SourceState,
        downloads: AtomicUsize,
    }

    #[async_trait]
    impl Source for CountingSource {
        fn name(&self) -> &str {
            "counting"
        }

        fn state(&self) -> &SourceState {
            &self.state
        }

        async fn resolve(&self, performer: &str, id: &str) -> AppResult<Entry> {
            Ok(Entry::new(id, "counting", performer, id, "", "", 10))
        }

        async fn search(&self, _query: &str) -> AppResult<Vec<SearchResult>> {
            Ok(Vec::new())
        }

        async fn do_buffer(&self, _entry: &Entry) -> AppResult<(PathBuf, Option<PathBuf>)> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(30)).await;
            Ok((PathBuf::from("/tmp/video"), None))
        }

        async fn get_config(&self) -> AppResult<SourceConfigPayload> {
            Ok(SourceConfigPayload::Full(serde_json::json!({})))
        }
    }

    #[tokio::test]
    async fn concurrent_buffers_download_once() {
        let source = Arc::new(CountingSource {
            state: SourceState::new(),
            downloads: AtomicUsize::new(0),
        });
        let entry = Entry::new("song-1", "counting", "P", "T", "", "", 10);

        let a = {
            let (s, e) = (source.clone(), entry.clone());
            tokio::spawn(async move { s.ensure_playable(&e).await })
        };
        let b = {
            let (s, e) = (source.clone(), entry.clone());
            tokio::spawn(async move { s.ensure_playable(&e).await })
        };
        a.await.unwrap();
        b.await.unwrap();

        assert_eq!(source.downloads.load(Ordering::SeqCst), 1);
        let slot = source.state().slot(&entry.id).await;
        let st = slot.state.lock().await;
        assert!(st.complete);
        assert_eq!(st.video.as_deref(), Some(std::path::Path::new("/tmp/video")));
    }

    #[tokio::test]
    async fn skip_cancels_inflight_buffer() {
        let source = Arc::new(CountingSource {
            state: SourceState::new(),
            downloads: AtomicUsize::new(0),
        });
        let mut entry = Entry::new("song-2", "counting", "P", "T", "", "", 10);

        let buffering = {
            let (s, e) = (source.clone(), entry.clone());
            tokio::spawn(async move { s.buffer(&e).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        source.skip_current(&entry).await;
        buffering.await.unwrap();

        let slot = source.state().slot(&entry.id).await;
        {
            let st = slot.state.lock().await;
            assert!(st.skipped);
            assert!(!st.complete);
        }

        // A skipped entry plays as a no-op and drops its artifact record.
        entry.skip = true;
        source.play(&entry).await.unwrap();
        assert!(source
            .state()
            .downloads
            .lock()
            .await
            .get(&entry.id)
            .is_none());
    }

    #[test]
    fn query_tokens_are_shell_style() {
        assert_eq!(
            tokenize_query(r#"Queen "Bohemian Rhapsody""#),
            vec!["queen".to_string(), "bohemian rhapsody".to_string()]
        );
    }

    #[test]
    fn query_matching_requires_every_token() {
        let tokens = tokenize_query("karaoke bohemian");
        assert!(matches_query(&tokens, "Bohemian Rhapsody (Karaoke Version) Queen"));
        assert!(!matches_query(&tokens, "Bohemian Rhapsody Queen"));
    }

    #[test]
    fn rank_orders_by_misses() {
        let tokens = tokenize_query("queen rhapsody live");
        let full = miss_rank(&tokens, "queen bohemian rhapsody live at wembley");
        let partial = miss_rank(&tokens, "queen greatest hits");
        assert!(full < partial);
    }

    #[test]
    fn chunking_covers_everything() {
        let index: Vec<String> = (0..2500).map(|i| format!("song-{i}.cdg")).collect();
        let chunks = chunk_index(&index);
        assert_eq!(chunks.len(), 3);
        let total: usize = chunks
            .iter()
            .map(|c| c.as_array().map(Vec::len).unwrap_or(0))
            .sum();
        assert_eq!(total, 2500);
    }
}
