//! YouTube source
//!
//! Search, resolve and download go through the external `yt-dlp` tool;
//! one JSON document per line for flat searches, a single document for a
//! resolve. With `start_streaming` enabled playback can begin before the
//! download finished by handing the URL to mpv's ytdl hook.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::errors::{AppResult, SourceError};
use crate::models::{Entry, SearchResult};

use super::{miss_rank, play_buffered, player, tokenize_query, Source, SourceConfigPayload, SourceState};

/// Results requested from the general video search.
const SEARCH_LIMIT: usize = 15;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct YoutubeConfig {
    #[serde(default)]
    channels: Vec<String>,
    #[serde(default = "default_tmp_dir")]
    tmp_dir: PathBuf,
    #[serde(default = "default_max_res")]
    max_res: u32,
    #[serde(default)]
    start_streaming: bool,
}

fn default_tmp_dir() -> PathBuf {
    std::env::temp_dir().join("syng")
}

fn default_max_res() -> u32 {
    720
}

pub struct YoutubeSource {
    state: SourceState,
    channels: Vec<String>,
    tmp_dir: PathBuf,
    max_res: u32,
    start_streaming: bool,
}

/// The fields read off yt-dlp's JSON output.
#[derive(Debug, Deserialize)]
struct VideoInfo {
    #[serde(default)]
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    uploader: Option<String>,
    #[serde(default)]
    webpage_url: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    duration: Option<f64>,
}

impl VideoInfo {
    fn artist(&self) -> String {
        self.channel
            .clone()
            .or_else(|| self.uploader.clone())
            .unwrap_or_default()
    }

    fn watch_url(&self) -> String {
        self.webpage_url
            .clone()
            .or_else(|| self.url.clone())
            .unwrap_or_else(|| format!("https://youtube.com/watch?v={}", self.id))
    }
}

impl YoutubeSource {
    pub fn factory(config: Value) -> AppResult<Arc<dyn Source>> {
        let config: YoutubeConfig = serde_json::from_value(config)
            .map_err(|e| SourceError::config_invalid("youtube", e.to_string()))?;
        Ok(Arc::new(Self {
            state: SourceState::new(),
            channels: config.channels,
            tmp_dir: config.tmp_dir,
            max_res: config.max_res,
            start_streaming: config.start_streaming,
        }))
    }

    async fn ytdlp(&self, args: &[String]) -> AppResult<String> {
        let output = Command::new("yt-dlp")
            .args(args)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .await
            .map_err(|e| SourceError::search_failed("youtube", format!("yt-dlp: {e}")))?;
        if !output.status.success() {
            return Err(
                SourceError::search_failed("youtube", format!("yt-dlp exited {}", output.status))
                    .into(),
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// One flat search: a `ytsearchN:` expression or a channel search URL.
    async fn flat_search(&self, target: &str) -> Vec<VideoInfo> {
        let args = vec![
            "--dump-json".to_string(),
            "--flat-playlist".to_string(),
            "--no-warnings".to_string(),
            target.to_string(),
        ];
        match self.ytdlp(&args).await {
            Ok(stdout) => stdout
                .lines()
                .filter_map(|line| serde_json::from_str::<VideoInfo>(line).ok())
                .collect(),
            Err(e) => {
                warn!("YouTube search against {target} failed: {e}");
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl Source for YoutubeSource {
    fn name(&self) -> &str {
        "youtube"
    }

    fn state(&self) -> &SourceState {
        &self.state
    }

    async fn resolve(&self, performer: &str, id: &str) -> AppResult<Entry> {
        let args = vec![
            "--dump-json".to_string(),
            "--no-download".to_string(),
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            id.to_string(),
        ];
        let stdout = self.ytdlp(&args).await?;
        let info: VideoInfo = serde_json::from_str(stdout.trim()).map_err(|e| {
            SourceError::resolve_failed("youtube", id, format!("unreadable metadata: {e}"))
        })?;
        Ok(Entry::new(
            id,
            self.name(),
            performer,
            info.title.clone(),
            info.artist(),
            "YouTube",
            info.duration.unwrap_or(0.0) as u32,
        ))
    }

    async fn search(&self, query: &str) -> AppResult<Vec<SearchResult>> {
        let mut targets: Vec<String> = self
            .channels
            .iter()
            .map(|channel| format!("https://www.youtube.com{channel}/search?query={query}"))
            .collect();
        targets.push(format!("ytsearch{SEARCH_LIMIT}:{query} karaoke"));

        let searches = targets.iter().map(|t| self.flat_search(t));
        let mut videos: Vec<VideoInfo> = futures::future::join_all(searches)
            .await
            .into_iter()
            .flatten()
            .collect();

        let tokens = tokenize_query(query);
        videos.sort_by(|a, b| {
            let rank_a = miss_rank(&tokens, &format!("{} {}", a.title, a.artist()));
            let rank_b = miss_rank(&tokens, &format!("{} {}", b.title, b.artist()));
            rank_a.partial_cmp(&rank_b).unwrap_or(std::cmp::Ordering::Equal)
        });

        Ok(videos
            .into_iter()
            .map(|v| {
                let id = v.watch_url();
                let artist = v.artist();
                SearchResult {
                    id,
                    source: self.name().to_string(),
                    title: v.title,
                    artist,
                }
            })
            .collect())
    }

    async fn do_buffer(&self, entry: &Entry) -> AppResult<(PathBuf, Option<PathBuf>)> {
        tokio::fs::create_dir_all(&self.tmp_dir).await?;
        let format = format!(
            "bestvideo[height<={res}]+bestaudio/best[height<={res}]",
            res = self.max_res
        );
        let template = self.tmp_dir.join("%(id)s.%(ext)s");
        let args = vec![
            "--format".to_string(),
            format,
            "--output".to_string(),
            template.to_string_lossy().into_owned(),
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            "--no-simulate".to_string(),
            "--print".to_string(),
            "after_move:filepath".to_string(),
            entry.id.clone(),
        ];
        let stdout = self
            .ytdlp(&args)
            .await
            .map_err(|e| SourceError::buffer_failed(entry.id.clone(), e.to_string()))?;
        let path = stdout
            .lines()
            .last()
            .map(PathBuf::from)
            .filter(|p| p.exists())
            .ok_or_else(|| {
                SourceError::buffer_failed(entry.id.clone(), "yt-dlp produced no file")
            })?;
        debug!("Buffered {} to {}", entry.id, path.display());
        Ok((path, None))
    }

    async fn get_config(&self) -> AppResult<SourceConfigPayload> {
        Ok(SourceConfigPayload::Full(serde_json::json!({
            "channels": self.channels,
        })))
    }

    async fn play(&self, entry: &Entry) -> AppResult<()> {
        let buffered = {
            let slot = self.state.slot(&entry.id).await;
            let st = slot.state.lock().await;
            st.complete
        };
        if self.start_streaming && !buffered {
            info!("Streaming {} directly", entry.id);
            let args = vec![format!(
                "--ytdl-format=bestvideo[height<={res}]+bestaudio/best[height<={res}]",
                res = self.max_res
            )];
            let _gate = self.state.player_gate().lock().await;
            let child = player::launch_streaming(&entry.id, &args)?;
            player::wait_or_kill(child, self.state.player_kill_handle()).await;
            return Ok(());
        }
        play_buffered(self, entry).await
    }
}
