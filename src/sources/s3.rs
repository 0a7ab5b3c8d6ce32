//! Object-store source
//!
//! The bucket is indexed once (optionally cached in an index file) and
//! entries are downloaded into the cache directory at buffer time. When
//! the instance is rebuilt on the relay from the shipped config it
//! carries only the index, no credentials, which is all searching needs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use s3::creds::Credentials;
use s3::{Bucket, Region};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::errors::{AppResult, SourceError};
use crate::models::{Entry, MetaUpdate, SearchResult};

use super::files::probe_duration;
use super::{
    chunk_index, matches_query, tokenize_query, Source, SourceConfigPayload, SourceState,
};

const DEFAULT_DURATION: u32 = 180;

/// Object suffixes considered playable.
const VIDEO_SUFFIXES: [&str; 2] = [".mp4", ".webm"];

#[derive(Debug, Clone, Serialize, Deserialize)]
struct S3Config {
    #[serde(default)]
    endpoint: String,
    #[serde(default)]
    access_key: String,
    #[serde(default)]
    secret_key: String,
    #[serde(default = "default_secure")]
    secure: bool,
    #[serde(default)]
    bucket: String,
    #[serde(default = "default_tmp_dir")]
    tmp_dir: PathBuf,
    #[serde(default)]
    index_file: Option<PathBuf>,
    /// Object index carried inside the config when it travels to the relay.
    #[serde(default)]
    index: Vec<String>,
}

fn default_secure() -> bool {
    true
}

fn default_tmp_dir() -> PathBuf {
    std::env::temp_dir().join("syng")
}

pub struct S3Source {
    state: SourceState,
    bucket: Option<Bucket>,
    tmp_dir: PathBuf,
    index_file: Option<PathBuf>,
    index: RwLock<Vec<String>>,
}

impl S3Source {
    pub fn factory(config: Value) -> AppResult<Arc<dyn Source>> {
        let config: S3Config = serde_json::from_value(config)
            .map_err(|e| SourceError::config_invalid("s3", e.to_string()))?;

        let bucket = if config.endpoint.is_empty() {
            // Relay-side instance rebuilt from a shipped index.
            None
        } else {
            let scheme = if config.secure { "https" } else { "http" };
            let endpoint = if config.endpoint.contains("://") {
                config.endpoint.clone()
            } else {
                format!("{scheme}://{}", config.endpoint)
            };
            let region = Region::Custom {
                region: "us-east-1".to_string(),
                endpoint,
            };
            let credentials = Credentials::new(
                Some(&config.access_key),
                Some(&config.secret_key),
                None,
                None,
                None,
            )
            .map_err(|e| SourceError::config_invalid("s3", e.to_string()))?;
            let bucket = Bucket::new(&config.bucket, region, credentials)
                .map_err(|e| SourceError::config_invalid("s3", e.to_string()))?
                .with_path_style();
            Some(bucket)
        };

        Ok(Arc::new(Self {
            state: SourceState::new(),
            bucket,
            tmp_dir: config.tmp_dir,
            index_file: config.index_file,
            index: RwLock::new(config.index),
        }))
    }

    /// Build the object index: from the index file when present, else by
    /// listing the bucket (and caching the listing to the index file).
    async fn ensure_index(&self) -> AppResult<()> {
        if !self.index.read().await.is_empty() {
            return Ok(());
        }

        if let Some(index_file) = &self.index_file {
            if index_file.is_file() {
                let contents = tokio::fs::read_to_string(index_file).await?;
                let cached: Vec<String> = serde_json::from_str(&contents)?;
                debug!("Loaded {} objects from {}", cached.len(), index_file.display());
                *self.index.write().await = cached;
                return Ok(());
            }
        }

        let Some(bucket) = &self.bucket else {
            return Ok(());
        };

        info!("Indexing bucket {}", bucket.name());
        let pages = bucket
            .list(String::new(), None)
            .await
            .map_err(|e| SourceError::search_failed("s3", e.to_string()))?;
        let mut keys: Vec<String> = pages
            .into_iter()
            .flat_map(|page| page.contents)
            .map(|object| object.key)
            .filter(|key| VIDEO_SUFFIXES.iter().any(|s| key.ends_with(s)))
            .collect();
        keys.sort();
        info!("Indexed {} objects", keys.len());

        if let Some(index_file) = &self.index_file {
            if let Some(parent) = index_file.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(index_file, serde_json::to_string(&keys)?).await?;
        }

        *self.index.write().await = keys;
        Ok(())
    }

    fn title_of(key: &str) -> String {
        Path::new(key)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| key.to_string())
    }
}

#[async_trait]
impl Source for S3Source {
    fn name(&self) -> &str {
        "s3"
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
        self.ensure_index().await?;
        let tokens = tokenize_query(query);
        let index = self.index.read().await;
        Ok(index
            .iter()
            .filter_map(|key| {
                let title = Self::title_of(key);
                matches_query(&tokens, &title).then(|| SearchResult {
                    id: key.clone(),
                    source: self.name().to_string(),
                    title,
                    artist: String::new(),
                })
            })
            .collect())
    }

    async fn do_buffer(&self, entry: &Entry) -> AppResult<(PathBuf, Option<PathBuf>)> {
        let Some(bucket) = &self.bucket else {
            return Err(SourceError::buffer_failed(
                entry.id.clone(),
                "no bucket credentials on this side",
            )
            .into());
        };

        let target = self.tmp_dir.join(self.name()).join(&entry.id);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let response = bucket
            .get_object(&entry.id)
            .await
            .map_err(|e| SourceError::buffer_failed(entry.id.clone(), e.to_string()))?;
        tokio::fs::write(&target, response.bytes()).await?;
        debug!("Buffered {} to {}", entry.id, target.display());
        Ok((target, None))
    }

    async fn get_missing_metadata(&self, entry: &Entry) -> AppResult<MetaUpdate> {
        // Duration comes off the downloaded media itself.
        self.ensure_playable(entry).await;
        let slot = self.state.slot(&entry.id).await;
        let video = slot.state.lock().await.video.clone();
        let duration = match video {
            Some(path) => probe_duration(path.clone()).await.unwrap_or_else(|| {
                warn!("Could not probe {}", path.display());
                DEFAULT_DURATION
            }),
            None => DEFAULT_DURATION,
        };
        Ok(MetaUpdate::duration(duration))
    }

    async fn get_config(&self) -> AppResult<SourceConfigPayload> {
        if let Err(e) = self.ensure_index().await {
            warn!("Could not index bucket: {e}");
        }
        let index = self.index.read().await;
        Ok(SourceConfigPayload::Chunked(
            chunk_index(&index)
                .into_iter()
                .map(|chunk| serde_json::json!({ "index": chunk }))
                .collect(),
        ))
    }

    async fn add_to_config(&self, chunk: Value) -> AppResult<()> {
        let config: S3Config = serde_json::from_value(chunk)
            .map_err(|e| SourceError::config_invalid("s3", e.to_string()))?;
        self.index.write().await.extend(config.index);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source_with_index(index: Vec<&str>) -> S3Source {
        S3Source {
            state: SourceState::new(),
            bucket: None,
            tmp_dir: PathBuf::from("/tmp/syng"),
            index_file: None,
            index: RwLock::new(index.into_iter().map(str::to_string).collect()),
        }
    }

    #[tokio::test]
    async fn search_matches_object_stems() {
        let source = source_with_index(vec![
            "pop/Take On Me.mp4",
            "pop/Africa.webm",
            "rock/Take Me Home.mp4",
        ]);
        let hits = source.search("take me").await.unwrap();
        let ids: Vec<_> = hits.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["pop/Take On Me.mp4", "rock/Take Me Home.mp4"]);
    }

    #[tokio::test]
    async fn relay_side_instance_has_no_bucket() {
        let built = S3Source::factory(serde_json::json!({
            "index": ["a.mp4", "b.webm"],
        }))
        .unwrap();
        let hits = built.search("a").await.unwrap();
        assert_eq!(hits.len(), 1);
    }
}
