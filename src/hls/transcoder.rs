use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::PLAYLIST_FILE;
use crate::error::HlsError;
use crate::state::is_valid_uid;

/// Runs shorter than this that end in a plain non-zero exit are treated as
/// "the RTMP source was not there yet".
const EARLY_EXIT_WINDOW: Duration = Duration::from_secs(10);

/// Lines of ffmpeg stderr kept for failure classification
const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Clone)]
pub struct TranscodeSettings {
    pub program: String,
    pub segment_seconds: u32,
    pub playlist_size: u32,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub max_retry_delay: Duration,
    /// Playlist modified within this window counts as actively written
    pub fresh_window: Duration,
    pub poll_interval: Duration,
}

impl Default for TranscodeSettings {
    fn default() -> Self {
        Self {
            program: "ffmpeg".to_string(),
            segment_seconds: 2,
            playlist_size: 5,
            max_retries: 5,
            retry_delay: Duration::from_secs(10),
            max_retry_delay: Duration::from_secs(60),
            fresh_window: Duration::from_secs(10),
            poll_interval: Duration::from_secs(5),
        }
    }
}

impl TranscodeSettings {
    /// Delay before retry number `attempt` (1-based): doubles per attempt,
    /// capped at `max_retry_delay`.
    pub fn retry_delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.retry_delay
            .saturating_mul(factor)
            .min(self.max_retry_delay.max(self.retry_delay))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscoderStatus {
    Starting,
    Connecting,
    Streaming,
    Error,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RtmpConnection,
    RtmpTimeout,
    FfmpegFailed,
    NetworkError,
    Unknown,
}

impl ErrorKind {
    /// Only source-side problems are worth another attempt.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::RtmpConnection | ErrorKind::RtmpTimeout | ErrorKind::NetworkError
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamError {
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    pub message: String,
    pub code: String,
}

impl StreamError {
    pub fn new(kind: ErrorKind, message: &str, code: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.to_string(),
            code: code.into(),
        }
    }
}

/// Classify a failed run from its exit text (stderr tail plus exit status)
/// and how long it ran.
pub fn classify_failure(text: &str, uptime: Duration) -> StreamError {
    let code = text.trim().to_string();
    let has = |needle: &str| text.contains(needle);

    if has("Connection refused") || has("Connection reset") || has("No route to host") {
        StreamError::new(ErrorKind::RtmpConnection, "Cannot connect to RTMP server", code)
    } else if has("Connection timed out") || has("timeout") {
        StreamError::new(ErrorKind::RtmpTimeout, "RTMP connection timed out", code)
    } else if has("Server error") || has("403") || has("404") {
        StreamError::new(ErrorKind::RtmpConnection, "RTMP server rejected connection", code)
    } else if has("exit status") {
        if uptime < EARLY_EXIT_WINDOW {
            StreamError::new(ErrorKind::RtmpConnection, "RTMP stream not available", code)
        } else {
            StreamError::new(ErrorKind::NetworkError, "Stream disconnected unexpectedly", code)
        }
    } else {
        StreamError::new(ErrorKind::Unknown, "FFmpeg process failed", code)
    }
}

/// Snapshot for polling consumers
#[derive(Debug, Clone, Serialize)]
pub struct TranscoderInfo {
    pub uid: String,
    pub status: TranscoderStatus,
    pub is_running: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StreamError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_secs: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_files: Option<bool>,
}

struct Progress {
    status: TranscoderStatus,
    last_error: Option<StreamError>,
    start_time: Option<DateTime<Utc>>,
    started_at: Instant,
    attempt_started_at: Instant,
    retry_count: u32,
    running: bool,
}

impl Progress {
    fn fail(&mut self, error: StreamError) {
        self.status = TranscoderStatus::Error;
        self.last_error = Some(error);
    }
}

struct Shared {
    uid: String,
    source_url: String,
    dir: PathBuf,
    settings: TranscodeSettings,
    progress: Mutex<Progress>,
}

enum RunOutcome {
    Cancelled,
    Exited { success: bool, text: String },
}

/// Supervises one ffmpeg process converting a device's RTMP feed to HLS.
pub struct Transcoder {
    shared: Arc<Shared>,
    cancel: Mutex<Option<CancellationToken>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Transcoder {
    pub fn new(uid: &str, source_url: &str, base_dir: &Path, settings: TranscodeSettings) -> Self {
        let now = Instant::now();
        Self {
            shared: Arc::new(Shared {
                uid: uid.to_string(),
                source_url: source_url.to_string(),
                dir: base_dir.join(uid),
                settings,
                progress: Mutex::new(Progress {
                    status: TranscoderStatus::Stopped,
                    last_error: None,
                    start_time: None,
                    started_at: now,
                    attempt_started_at: now,
                    retry_count: 0,
                    running: false,
                }),
            }),
            cancel: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn playlist_path(&self) -> PathBuf {
        self.shared.dir.join(PLAYLIST_FILE)
    }

    pub fn is_running(&self) -> bool {
        self.shared.progress.lock().running
    }

    pub fn status(&self) -> (TranscoderStatus, Option<StreamError>) {
        let progress = self.shared.progress.lock();
        (progress.status, progress.last_error.clone())
    }

    pub fn info(&self) -> TranscoderInfo {
        let mut info = {
            let progress = self.shared.progress.lock();
            TranscoderInfo {
                uid: self.shared.uid.clone(),
                status: progress.status,
                is_running: progress.running,
                start_time: progress.start_time,
                retry_count: progress.retry_count,
                max_retries: self.shared.settings.max_retries,
                error: progress.last_error.clone(),
                uptime_secs: progress.running.then(|| progress.started_at.elapsed().as_secs_f64()),
                has_files: None,
            }
        };
        if info.is_running {
            info.has_files = Some(has_fresh_playlist(&self.shared.dir, self.shared.settings.fresh_window));
        }
        info
    }

    /// Launch ffmpeg and its supervisor. Fails if already running, if the
    /// output directory cannot be prepared or if the process cannot start.
    pub fn start(&self) -> Result<(), HlsError> {
        let shared = &self.shared;
        if !is_valid_uid(&shared.uid) {
            return Err(HlsError::InvalidUid(shared.uid.clone()));
        }

        {
            let mut progress = shared.progress.lock();
            if progress.running {
                return Err(HlsError::AlreadyRunning(shared.uid.clone()));
            }
            let now = Instant::now();
            progress.status = TranscoderStatus::Starting;
            progress.last_error = None;
            progress.start_time = Some(Utc::now());
            progress.started_at = now;
            progress.attempt_started_at = now;
            progress.retry_count = 0;
            progress.running = true;
        }

        if let Err(e) = std::fs::create_dir_all(&shared.dir) {
            let mut progress = shared.progress.lock();
            progress.running = false;
            progress.fail(StreamError::new(ErrorKind::FfmpegFailed, "Failed to create HLS directory", e.to_string()));
            return Err(HlsError::Directory(e));
        }
        clean_artifacts(&shared.dir);

        info!(
            uid = %shared.uid,
            source = %shared.source_url,
            dir = %shared.dir.display(),
            "🎬 Starting HLS transcoding"
        );

        let child = match shared.spawn() {
            Ok(child) => child,
            Err(e) => {
                let mut progress = shared.progress.lock();
                progress.running = false;
                progress.fail(StreamError::new(ErrorKind::FfmpegFailed, "Failed to start FFmpeg process", e.to_string()));
                return Err(e);
            }
        };
        shared.progress.lock().status = TranscoderStatus::Connecting;

        let cancel = CancellationToken::new();
        *self.cancel.lock() = Some(cancel.clone());

        let handle = tokio::spawn(supervise(shared.clone(), child, cancel));
        *self.task.lock() = Some(handle);
        Ok(())
    }

    /// Stop supervision, kill ffmpeg, wait for it and remove its output.
    /// Safe to call any number of times.
    pub async fn stop(&self) {
        let cancel = self.cancel.lock().take();
        if let Some(cancel) = &cancel {
            cancel.cancel();
        }

        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(uid = %self.shared.uid, error = %e, "HLS supervisor task failed");
            }
        }

        // Nothing was started since the last stop
        if cancel.is_none() {
            return;
        }

        {
            let mut progress = self.shared.progress.lock();
            progress.running = false;
            progress.status = TranscoderStatus::Stopped;
        }
        info!(uid = %self.shared.uid, "⏹️ HLS transcoding stopped");
        clean_artifacts(&self.shared.dir);
    }
}

impl Shared {
    fn ffmpeg_args(&self) -> Vec<String> {
        let playlist = self.dir.join(PLAYLIST_FILE);
        let segments = self.dir.join("segment_%d.ts");
        vec![
            "-hide_banner".into(),
            "-i".into(),
            self.source_url.clone(),
            "-c:v".into(),
            "libx264".into(),
            "-preset".into(),
            "ultrafast".into(),
            "-tune".into(),
            "zerolatency".into(),
            "-c:a".into(),
            "aac".into(),
            "-f".into(),
            "hls".into(),
            "-hls_time".into(),
            self.settings.segment_seconds.to_string(),
            "-hls_list_size".into(),
            self.settings.playlist_size.to_string(),
            "-hls_flags".into(),
            "delete_segments".into(),
            "-hls_segment_filename".into(),
            segments.to_string_lossy().into_owned(),
            "-y".into(),
            playlist.to_string_lossy().into_owned(),
        ]
    }

    fn spawn(&self) -> Result<Child, HlsError> {
        Command::new(&self.settings.program)
            .args(self.ffmpeg_args())
            .current_dir(&self.dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(HlsError::Spawn)
    }
}

/// Watch ffmpeg runs until success, a non-retryable failure, exhausted
/// retries or cancellation.
async fn supervise(shared: Arc<Shared>, mut child: Child, cancel: CancellationToken) {
    loop {
        match watch(&shared, &mut child, &cancel).await {
            RunOutcome::Cancelled => {
                if let Err(e) = child.kill().await {
                    debug!(uid = %shared.uid, error = %e, "ffmpeg already gone");
                }
                debug!(uid = %shared.uid, "HLS supervisor cancelled");
                return;
            }
            RunOutcome::Exited { success: true, .. } => {
                info!(uid = %shared.uid, "HLS transcoding process exited normally");
                let mut progress = shared.progress.lock();
                progress.running = false;
                progress.status = TranscoderStatus::Stopped;
                return;
            }
            RunOutcome::Exited { success: false, text } => {
                let (error, retry) = {
                    let mut progress = shared.progress.lock();
                    let error = classify_failure(&text, progress.attempt_started_at.elapsed());
                    progress.fail(error.clone());
                    let retry = if error.kind.is_retryable()
                        && progress.retry_count < shared.settings.max_retries
                    {
                        progress.retry_count += 1;
                        Some(progress.retry_count)
                    } else {
                        progress.running = false;
                        None
                    };
                    (error, retry)
                };

                error!(
                    uid = %shared.uid,
                    error_type = ?error.kind,
                    message = %error.message,
                    "HLS transcoding process exited with error"
                );

                let Some(attempt) = retry else {
                    return;
                };

                let delay = shared.settings.retry_delay_for(attempt);
                info!(
                    uid = %shared.uid,
                    retry_count = attempt,
                    max_retries = shared.settings.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "Scheduling HLS transcoding retry"
                );

                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }

                clean_artifacts(&shared.dir);
                {
                    let mut progress = shared.progress.lock();
                    progress.status = TranscoderStatus::Connecting;
                    progress.last_error = None;
                    progress.attempt_started_at = Instant::now();
                }

                child = match shared.spawn() {
                    Ok(child) => child,
                    Err(e) => {
                        error!(uid = %shared.uid, error = %e, "Failed to restart FFmpeg during retry");
                        let mut progress = shared.progress.lock();
                        progress.running = false;
                        progress.fail(StreamError::new(
                            ErrorKind::FfmpegFailed,
                            "Failed to restart FFmpeg process",
                            e.to_string(),
                        ));
                        return;
                    }
                };
            }
        }
    }
}

/// One ffmpeg run: wait for exit or cancellation while polling for fresh
/// playlist writes.
async fn watch(shared: &Shared, child: &mut Child, cancel: &CancellationToken) -> RunOutcome {
    let stderr_tail = child
        .stderr
        .take()
        .map(|stderr| tokio::spawn(collect_stderr(shared.uid.clone(), stderr)));

    let mut ticker = tokio::time::interval(shared.settings.poll_interval);
    ticker.tick().await;
    let mut streaming = false;

    let outcome = loop {
        tokio::select! {
            _ = cancel.cancelled() => break None,

            status = child.wait() => break Some(status),

            _ = ticker.tick(), if !streaming => {
                if has_fresh_playlist(&shared.dir, shared.settings.fresh_window) {
                    streaming = true;
                    shared.progress.lock().status = TranscoderStatus::Streaming;
                    info!(uid = %shared.uid, "✅ HLS transcoding producing files");
                }
            }
        }
    };

    let Some(status) = outcome else {
        if let Some(tail) = stderr_tail {
            tail.abort();
        }
        return RunOutcome::Cancelled;
    };

    let mut text = match stderr_tail {
        Some(tail) => tail.await.unwrap_or_default(),
        None => String::new(),
    };

    match status {
        Ok(status) => {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(&status.to_string());
            RunOutcome::Exited { success: status.success(), text }
        }
        Err(e) => RunOutcome::Exited { success: false, text: e.to_string() },
    }
}

async fn collect_stderr(uid: String, stderr: ChildStderr) -> String {
    let mut lines = BufReader::new(stderr).lines();
    let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(uid = %uid, "ffmpeg: {}", line);
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    Vec::from(tail).join("\n")
}

/// Playlist exists and was written within `window`.
pub fn has_fresh_playlist(dir: &Path, window: Duration) -> bool {
    let Ok(modified) = std::fs::metadata(dir.join(PLAYLIST_FILE)).and_then(|m| m.modified()) else {
        return false;
    };
    match SystemTime::now().duration_since(modified) {
        Ok(age) => age < window,
        // Modified "in the future": clock skew, treat as fresh
        Err(_) => true,
    }
}

/// Remove every file directly under `dir`.
pub fn clean_artifacts(dir: &Path) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "Failed to list HLS files for cleanup");
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_file() {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(file = %path.display(), error = %e, "Failed to remove HLS file");
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[test]
    fn test_classify_failure() {
        let quick = Duration::from_secs(1);
        let long = Duration::from_secs(60);

        let refused = classify_failure("rtmp://x: Connection refused\nexit status: 1", quick);
        assert_eq!(refused.kind, ErrorKind::RtmpConnection);
        assert_eq!(refused.message, "Cannot connect to RTMP server");

        assert_eq!(classify_failure("Connection timed out", long).kind, ErrorKind::RtmpTimeout);
        assert_eq!(classify_failure("Server returned 404 Not Found", long).kind, ErrorKind::RtmpConnection);

        let early = classify_failure("exit status: 1", quick);
        assert_eq!(early.kind, ErrorKind::RtmpConnection);
        assert_eq!(early.message, "RTMP stream not available");

        assert_eq!(classify_failure("exit status: 1", long).kind, ErrorKind::NetworkError);
        assert_eq!(classify_failure("signal: 9 (SIGKILL)", quick).kind, ErrorKind::Unknown);
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(ErrorKind::RtmpConnection.is_retryable());
        assert!(ErrorKind::RtmpTimeout.is_retryable());
        assert!(ErrorKind::NetworkError.is_retryable());
        assert!(!ErrorKind::FfmpegFailed.is_retryable());
        assert!(!ErrorKind::Unknown.is_retryable());
    }

    #[test]
    fn test_retry_delay_doubles_and_caps() {
        let settings = TranscodeSettings {
            retry_delay: Duration::from_secs(10),
            max_retry_delay: Duration::from_secs(60),
            ..Default::default()
        };
        assert_eq!(settings.retry_delay_for(1), Duration::from_secs(10));
        assert_eq!(settings.retry_delay_for(2), Duration::from_secs(20));
        assert_eq!(settings.retry_delay_for(3), Duration::from_secs(40));
        assert_eq!(settings.retry_delay_for(4), Duration::from_secs(60));
        assert_eq!(settings.retry_delay_for(40), Duration::from_secs(60));
    }

    #[test]
    fn test_stream_error_json_shape() {
        let error = StreamError::new(ErrorKind::RtmpTimeout, "RTMP connection timed out", "timeout");
        let json = serde_json::to_value(&error).unwrap();
        assert_eq!(json["type"], "rtmp_timeout");
        assert_eq!(json["code"], "timeout");
    }

    #[test]
    fn test_clean_artifacts_keeps_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(PLAYLIST_FILE), "#EXTM3U").unwrap();
        std::fs::write(dir.path().join("segment_0.ts"), [0u8; 4]).unwrap();

        clean_artifacts(dir.path());

        assert!(dir.path().exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        clean_artifacts(&dir.path().join("missing"));
    }

    #[test]
    fn test_fresh_playlist_detection() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!has_fresh_playlist(dir.path(), Duration::from_secs(10)));

        std::fs::write(dir.path().join(PLAYLIST_FILE), "#EXTM3U").unwrap();
        assert!(has_fresh_playlist(dir.path(), Duration::from_secs(10)));

        let old = SystemTime::now() - Duration::from_secs(60);
        std::fs::File::options()
            .write(true)
            .open(dir.path().join(PLAYLIST_FILE))
            .unwrap()
            .set_modified(old)
            .unwrap();
        assert!(!has_fresh_playlist(dir.path(), Duration::from_secs(10)));
    }

    #[tokio::test]
    async fn test_missing_program_fails_to_start() {
        let base = tempfile::tempdir().unwrap();
        let settings = TranscodeSettings {
            program: base.path().join("no-such-ffmpeg").to_string_lossy().into_owned(),
            ..Default::default()
        };
        let transcoder = Transcoder::new("abc", "rtmp://127.0.0.1/local/abc", base.path(), settings);

        assert!(matches!(transcoder.start(), Err(HlsError::Spawn(_))));
        assert!(!transcoder.is_running());
        let (status, error) = transcoder.status();
        assert_eq!(status, TranscoderStatus::Error);
        assert_eq!(error.unwrap().kind, ErrorKind::FfmpegFailed);
    }

    #[tokio::test]
    async fn test_invalid_uid_is_rejected() {
        let base = tempfile::tempdir().unwrap();
        let transcoder = Transcoder::new("../abc", "rtmp://x", base.path(), TranscodeSettings::default());
        assert!(matches!(transcoder.start(), Err(HlsError::InvalidUid(_))));
    }

    #[cfg(unix)]
    pub(crate) mod fake {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;
        use std::path::Path;

        /// Write an executable shell script standing in for ffmpeg.
        pub fn script(dir: &Path, name: &str, body: &str) -> String {
            let path = dir.join(name);
            let mut file = std::fs::File::create(&path).unwrap();
            writeln!(file, "#!/bin/sh").unwrap();
            file.write_all(body.as_bytes()).unwrap();
            file.sync_all().unwrap();
            drop(file);
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path.to_string_lossy().into_owned()
        }
    }

    #[cfg(unix)]
    async fn wait_until(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_refused_connection_retries_until_ceiling() {
        let tools = tempfile::tempdir().unwrap();
        let base = tempfile::tempdir().unwrap();
        let runs = tools.path().join("runs");
        let program = fake::script(
            tools.path(),
            "ffmpeg",
            &format!(
                "echo run >> '{}'\necho 'rtmp://127.0.0.1/local/abc: Connection refused' >&2\nexit 1\n",
                runs.display()
            ),
        );
        let settings = TranscodeSettings {
            program,
            max_retries: 2,
            retry_delay: Duration::from_millis(10),
            max_retry_delay: Duration::from_millis(20),
            poll_interval: Duration::from_millis(20),
            ..Default::default()
        };
        let transcoder = Transcoder::new("abc", "rtmp://127.0.0.1/local/abc", base.path(), settings);

        transcoder.start().unwrap();
        wait_until(|| !transcoder.is_running()).await;

        let info = transcoder.info();
        assert_eq!(info.status, TranscoderStatus::Error);
        assert_eq!(info.retry_count, 2);
        assert_eq!(info.error.unwrap().kind, ErrorKind::RtmpConnection);
        assert_eq!(std::fs::read_to_string(&runs).unwrap().lines().count(), 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_fresh_playlist_flips_to_streaming_and_stop_cleans_up() {
        let tools = tempfile::tempdir().unwrap();
        let base = tempfile::tempdir().unwrap();
        let program = fake::script(tools.path(), "ffmpeg", "touch playlist.m3u8\nexec sleep 30\n");
        let settings = TranscodeSettings {
            program,
            poll_interval: Duration::from_millis(20),
            ..Default::default()
        };
        let transcoder = Transcoder::new("abc", "rtmp://127.0.0.1/local/abc", base.path(), settings);

        transcoder.start().unwrap();
        assert!(matches!(transcoder.start(), Err(HlsError::AlreadyRunning(_))));

        wait_until(|| transcoder.status().0 == TranscoderStatus::Streaming).await;
        assert_eq!(transcoder.info().has_files, Some(true));

        transcoder.stop().await;
        assert!(!transcoder.is_running());
        assert_eq!(transcoder.status().0, TranscoderStatus::Stopped);
        assert!(!transcoder.playlist_path().exists());

        // Second stop is a no-op
        transcoder.stop().await;
        assert_eq!(transcoder.status().0, TranscoderStatus::Stopped);
    }
}
