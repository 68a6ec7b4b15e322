pub mod manager;
pub mod transcoder;

pub use manager::{HlsManager, PlaybackStatus};
pub use transcoder::{TranscodeSettings, TranscoderInfo};

/// Playlist file name inside each per-device output directory
pub const PLAYLIST_FILE: &str = "playlist.m3u8";
