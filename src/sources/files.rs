//! Local-directory source
//!
//! Indexes a folder of karaoke files by extension pairs such as
//! `mp3+cdg` (audio file next to the video file) and plays straight from
//! disk, so buffering only checks that the files are there. The index is
//! shipped to the relay inside the chunked source config, which is how
//! the relay can search it without seeing the directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::errors::{AppResult, SourceError};
use crate::models::{Entry, MetaUpdate, SearchResult};

use super::{
    chunk_index, matches_query, tokenize_query, Source, SourceConfigPayload, SourceState,
};

/// Fallback duration when a file cannot be probed.
const DEFAULT_DURATION: u32 = 180;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FilesConfig {
    #[serde(default = "default_dir")]
    dir: PathBuf,
    #[serde(default = "default_extensions")]
    extensions: Vec<String>,
    /// File index carried inside the config when it travels to the relay.
    #[serde(default)]
    index: Vec<String>,
}

fn default_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_extensions() -> Vec<String> {
    vec!["mp3+cdg".to_string()]
}

pub struct FilesSource {
    state: SourceState,
    dir: PathBuf,
    extensions: Vec<String>,
    index: RwLock<Vec<String>>,
}

impl FilesSource {
    pub fn factory(config: Value) -> AppResult<Arc<dyn Source>> {
        let config: FilesConfig = serde_json::from_value(config)
            .map_err(|e| SourceError::config_invalid("files", e.to_string()))?;
        Ok(Arc::new(Self {
            state: SourceState::new(),
            dir: config.dir,
            extensions: config.extensions,
            index: RwLock::new(config.index),
        }))
    }

    /// The video-file extensions of the configured pairs; the latter half
    /// of `audio+video` pairs, or the extension itself when unpaired.
    fn video_extensions(&self) -> Vec<&str> {
        self.extensions
            .iter()
            .map(|ext| ext.rsplit('+').next().unwrap_or(ext))
            .collect()
    }

    /// Split a relative path into video and optional audio siblings
    /// according to the extension pairs.
    fn video_audio_split(&self, path: &str) -> (PathBuf, Option<PathBuf>) {
        let video = self.dir.join(path);
        let Some(ext) = video.extension().and_then(|e| e.to_str()) else {
            return (video, None);
        };
        for pair in &self.extensions {
            if let Some((audio_ext, video_ext)) = pair.split_once('+') {
                if video_ext.eq_ignore_ascii_case(ext) {
                    let audio = video.with_extension(audio_ext);
                    return (video, Some(audio));
                }
            }
        }
        (video, None)
    }

    /// Walk `dir` and populate the index, once. Instances built from a
    /// shipped config already carry theirs.
    async fn ensure_index(&self) {
        if !self.index.read().await.is_empty() {
            return;
        }
        let dir = self.dir.clone();
        let extensions: Vec<String> = self
            .video_extensions()
            .into_iter()
            .map(str::to_string)
            .collect();
        let found = tokio::task::spawn_blocking(move || {
            let mut paths = Vec::new();
            for file in WalkDir::new(&dir)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
            {
                let matches = file
                    .path()
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|ext| extensions.iter().any(|v| v.eq_ignore_ascii_case(ext)))
                    .unwrap_or(false);
                if matches {
                    if let Ok(rel) = file.path().strip_prefix(&dir) {
                        paths.push(rel.to_string_lossy().into_owned());
                    }
                }
            }
            paths.sort();
            paths
        })
        .await
        .unwrap_or_default();

        debug!("Indexed {} files under {}", found.len(), self.dir.display());
        *self.index.write().await = found;
    }

    fn title_of(path: &str) -> String {
        Path::new(path)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string())
    }
}

/// Probe a media file's duration in seconds. Runs on the blocking pool.
pub(crate) async fn probe_duration(path: PathBuf) -> Option<u32> {
    tokio::task::spawn_blocking(move || {
        use lofty::file::AudioFile;
        let tagged = lofty::probe::read_from_path(&path).ok()?;
        Some(tagged.properties().duration().as_secs() as u32)
    })
    .await
    .ok()
    .flatten()
}

#[async_trait]
impl Source for FilesSource {
    fn name(&self) -> &str {
        "files"
    }

    fn state(&self) -> &SourceState {
        &self.state
    }

    fn extra_player_args(&self) -> Vec<String> {
        vec!["--scale=oversample".to_string()]
    }

    async fn resolve(&self, performer: &str, id: &str) -> AppResult<Entry> {
        Ok(Entry::new(
            id,
            self.name(),
            performer,
            Self::title_of(id),
            "",
            "",
            0,
        ))
    }

    async fn search(&self, query: &str) -> AppResult<Vec<SearchResult>> {
        self.ensure_index().await;
        let tokens = tokenize_query(query);
        let index = self.index.read().await;
        Ok(index
            .iter()
            .filter_map(|path| {
                let title = Self::title_of(path);
                let haystack = format!("{title} ");
                matches_query(&tokens, &haystack).then(|| SearchResult {
                    id: path.clone(),
                    source: self.name().to_string(),
                    title,
                    artist: String::new(),
                })
            })
            .collect())
    }

    async fn do_buffer(&self, entry: &Entry) -> AppResult<(PathBuf, Option<PathBuf>)> {
        // Nothing to download, the files are already on disk.
        let (video, audio) = self.video_audio_split(&entry.id);
        if !video.exists() {
            return Err(SourceError::buffer_failed(
                entry.id.clone(),
                format!("missing file {}", video.display()),
            )
            .into());
        }
        let audio = audio.filter(|p| p.exists());
        Ok((video, audio))
    }

    async fn get_missing_metadata(&self, entry: &Entry) -> AppResult<MetaUpdate> {
        let (video, audio) = self.video_audio_split(&entry.id);
        let probe_path = audio.unwrap_or(video);
        let duration = match probe_duration(probe_path.clone()).await {
            Some(duration) => duration,
            None => {
                warn!("Could not probe {}", probe_path.display());
                DEFAULT_DURATION
            }
        };
        Ok(MetaUpdate::duration(duration))
    }

    async fn get_config(&self) -> AppResult<SourceConfigPayload> {
        self.ensure_index().await;
        let index = self.index.read().await;
        let chunks: Vec<Value> = chunk_index(&index)
            .into_iter()
            .map(|chunk| {
                serde_json::json!({
                    "extensions": self.extensions,
                    "index": chunk,
                })
            })
            .collect();
        Ok(SourceConfigPayload::Chunked(chunks))
    }

    async fn add_to_config(&self, chunk: Value) -> AppResult<()> {
        let config: FilesConfig = serde_json::from_value(chunk)
            .map_err(|e| SourceError::config_invalid("files", e.to_string()))?;
        self.index.write().await.extend(config.index);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source_with_index(index: Vec<&str>) -> FilesSource {
        FilesSource {
            state: SourceState::new(),
            dir: PathBuf::from("/srv/karaoke"),
            extensions: vec!["mp3+cdg".to_string()],
            index: RwLock::new(index.into_iter().map(str::to_string).collect()),
        }
    }

    #[tokio::test]
    async fn search_filters_on_every_token() {
        let source = source_with_index(vec![
            "queen/Bohemian Rhapsody.cdg",
            "queen/Under Pressure.cdg",
            "abba/Waterloo.cdg",
        ]);
        let hits = source.search("bohemian rhap").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "Bohemian Rhapsody");
        assert_eq!(hits[0].id, "queen/Bohemian Rhapsody.cdg");

        assert!(source.search("bohemian waterloo").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn split_pairs_video_with_audio_sibling() {
        let source = source_with_index(vec![]);
        let (video, audio) = source.video_audio_split("queen/Waterloo.cdg");
        assert_eq!(video, PathBuf::from("/srv/karaoke/queen/Waterloo.cdg"));
        assert_eq!(
            audio,
            Some(PathBuf::from("/srv/karaoke/queen/Waterloo.mp3"))
        );

        let (_, none) = source.video_audio_split("intro.mp4");
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn shipped_config_round_trips_through_chunks() {
        let source = source_with_index((0..2048).map(|_| "x.cdg").collect());
        let SourceConfigPayload::Chunked(chunks) = source.get_config().await.unwrap() else {
            panic!("files config should be chunked");
        };
        assert_eq!(chunks.len(), 3);

        let rebuilt = source_with_index(vec![]);
        for chunk in chunks {
            rebuilt.add_to_config(chunk).await.unwrap();
        }
        assert_eq!(rebuilt.index.read().await.len(), 2048);
    }
}
