use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::transcoder::{StreamError, TranscodeSettings, Transcoder, TranscoderInfo, TranscoderStatus};
use super::PLAYLIST_FILE;
use crate::error::HlsError;
use crate::state::is_valid_uid;

/// What a player should be told about a device's HLS output.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PlaybackStatus {
    /// No transcoder for this device
    Inactive,
    /// Transcoder is up but no playlist has been written yet
    NotReady { status: TranscoderStatus },
    Ready { playlist: String },
    Failed { error: Option<StreamError> },
}

/// Owns one [`Transcoder`] per device UID.
pub struct HlsManager {
    base_dir: PathBuf,
    settings: TranscodeSettings,
    transcoders: RwLock<HashMap<String, Arc<Transcoder>>>,
}

impl HlsManager {
    pub fn new(base_dir: impl Into<PathBuf>, settings: TranscodeSettings) -> Self {
        Self {
            base_dir: base_dir.into(),
            settings,
            transcoders: RwLock::new(HashMap::new()),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Start transcoding `source_url` for `uid`, stopping any transcoder
    /// already registered for it first.
    pub async fn start_transcoding(&self, uid: &str, source_url: &str) -> Result<(), HlsError> {
        if !is_valid_uid(uid) {
            return Err(HlsError::InvalidUid(uid.to_string()));
        }

        let existing = self.transcoders.write().remove(uid);
        if let Some(existing) = existing {
            debug!(uid = %uid, "Replacing existing transcoder");
            existing.stop().await;
        }

        let transcoder = Arc::new(Transcoder::new(uid, source_url, &self.base_dir, self.settings.clone()));
        transcoder.start()?;

        let displaced = self
            .transcoders
            .write()
            .insert(uid.to_string(), transcoder);
        if let Some(displaced) = displaced {
            // Lost a race with a concurrent start for the same UID
            warn!(uid = %uid, "Concurrent transcoder start, stopping the older one");
            tokio::spawn(async move { displaced.stop().await });
        }
        Ok(())
    }

    pub async fn stop_transcoding(&self, uid: &str) {
        let transcoder = self.transcoders.write().remove(uid);
        if let Some(transcoder) = transcoder {
            transcoder.stop().await;
        }
    }

    pub fn transcoder(&self, uid: &str) -> Option<Arc<Transcoder>> {
        self.transcoders.read().get(uid).cloned()
    }

    pub fn is_running(&self, uid: &str) -> bool {
        self.transcoder(uid).map(|t| t.is_running()).unwrap_or(false)
    }

    pub fn info(&self, uid: &str) -> Option<TranscoderInfo> {
        self.transcoder(uid).map(|t| t.info())
    }

    pub fn playback(&self, uid: &str) -> PlaybackStatus {
        let Some(transcoder) = self.transcoder(uid) else {
            return PlaybackStatus::Inactive;
        };

        let (status, error) = transcoder.status();
        if status == TranscoderStatus::Error && !transcoder.is_running() {
            return PlaybackStatus::Failed { error };
        }
        if transcoder.playlist_path().exists() {
            PlaybackStatus::Ready {
                playlist: format!("/hls/{}/{}", uid, PLAYLIST_FILE),
            }
        } else {
            PlaybackStatus::NotReady { status }
        }
    }

    pub async fn stop_all(&self) {
        let transcoders: Vec<_> = self.transcoders.write().drain().collect();
        for (uid, transcoder) in transcoders {
            debug!(uid = %uid, "Stopping transcoder");
            transcoder.stop().await;
        }
    }

    /// Periodically sweep orphaned output directories until `cancel` fires.
    pub async fn run_cleanup(self: Arc<Self>, interval: Duration, max_age: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    self.cleanup_orphans(max_age);
                }
            }
        }
    }

    /// Remove per-device directories that have no active transcoder and
    /// contain files older than `max_age`. Returns how many were removed.
    pub fn cleanup_orphans(&self, max_age: Duration) -> usize {
        debug!("Starting periodic HLS cleanup");
        let entries = match std::fs::read_dir(&self.base_dir) {
            Ok(entries) => entries,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(dir = %self.base_dir.display(), error = %e, "Failed to list HLS directories");
                }
                return 0;
            }
        };

        let active: HashSet<String> = self.transcoders.read().keys().cloned().collect();
        let mut cleaned = 0;

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if active.contains(&name) || !has_old_files(&path, max_age) {
                continue;
            }
            match std::fs::remove_dir_all(&path) {
                Ok(()) => {
                    cleaned += 1;
                    debug!(uid = %name, "Cleaned up orphaned HLS directory");
                }
                Err(e) => warn!(dir = %path.display(), error = %e, "Failed to remove orphaned HLS directory"),
            }
        }

        if cleaned > 0 {
            info!(cleaned_count = cleaned, "🧹 Completed HLS cleanup");
        }
        cleaned
    }
}

fn has_old_files(dir: &Path, max_age: Duration) -> bool {
    let Some(cutoff) = SystemTime::now().checked_sub(max_age) else {
        return false;
    };
    let Ok(entries) = std::fs::read_dir(dir) else {
        return false;
    };
    entries
        .flatten()
        .filter_map(|entry| entry.metadata().and_then(|m| m.modified()).ok())
        .any(|modified| modified < cutoff)
}
