//! The external media player subprocess
//!
//! mpv is launched with the buffered media path plus an optional separate
//! audio file; its exit, clean or not, is the signal to advance the queue.
//! Termination on skip goes through a notify handle so the waiter and the
//! killer never contend for the child.

use std::path::Path;

use tokio::process::{Child, Command};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::errors::{AppError, AppResult};

/// Launch mpv fullscreen on `video`, mixing in `audio` when the media
/// comes as a separate pair (e.g. cdg+mp3).
pub fn launch(video: &Path, audio: Option<&Path>, extra_args: &[String]) -> AppResult<Child> {
    let mut command = Command::new("mpv");
    command.arg("--fullscreen");
    for arg in extra_args {
        command.arg(arg);
    }
    command.arg(video);
    if let Some(audio) = audio {
        command.arg(format!("--audio-file={}", audio.display()));
    }
    command
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .map_err(|e| AppError::player(format!("could not launch mpv: {e}")))
}

/// Stream a URL directly through mpv's ytdl hook instead of a local file.
pub fn launch_streaming(url: &str, extra_args: &[String]) -> AppResult<Child> {
    let mut command = Command::new("mpv");
    command.arg("--fullscreen");
    for arg in extra_args {
        command.arg(arg);
    }
    command.arg(url);
    command
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .map_err(|e| AppError::player(format!("could not launch mpv: {e}")))
}

/// Wait for the player to exit, or kill it when `kill` fires. A crash is
/// indistinguishable from a normal exit; either way the song is over.
pub async fn wait_or_kill(mut child: Child, kill: &Notify) {
    tokio::select! {
        status = child.wait() => {
            match status {
                Ok(status) if status.success() => debug!("Player exited"),
                Ok(status) => debug!("Player exited with {status}"),
                Err(e) => warn!("Waiting on player failed: {e}"),
            }
        }
        _ = kill.notified() => {
            debug!("Terminating player");
            if let Err(e) = child.start_kill() {
                warn!("Could not terminate player: {e}");
            }
            let _ = child.wait().await;
        }
    }
}
