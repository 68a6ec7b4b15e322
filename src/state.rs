use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub mod store;

pub use store::StateStore;

/// A device counts as actively streaming while its last media packet is
/// younger than this.
pub const ACTIVE_STREAM_WINDOW_SECS: i64 = 10;

static VALID_UID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9_-]+$").expect("static uid pattern")
});

/// UIDs end up in file paths and RTMP paths, so only a safe alphabet is accepted.
pub fn is_valid_uid(uid: &str) -> bool {
    VALID_UID.is_match(uid)
}

/// Health of the device's local RTMP stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    #[default]
    Unknown,
    Unhealthy,
    Alive,
}

/// Outcome of the most recent ask to start local streaming
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StreamRequestState {
    #[default]
    NotRequested,
    Requested,
    RequestFailed,
}

/// Device information gathered from status and settings responses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hardware_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mounting_mode: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wifi_network: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wifi_band: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub night_vision: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sleep_mode: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_light: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mic_mute: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anti_flicker: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub streaming_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upgrade_downloaded: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available_soundtracks: Option<Vec<String>>,

    // Sensor thresholds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_low_threshold: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_high_threshold: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub humidity_low_threshold: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub humidity_high_threshold: Option<i32>,

    // Stream configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mobile_bitrate: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mobile_fps: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dvr_bitrate: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dvr_fps: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analytics_bitrate: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analytics_fps: Option<i32>,

    /// Unix timestamp of the last device info refresh
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<i64>,
}

/// Copies `patch` into `target` when present and different. Returns whether
/// `target` changed.
fn merge_field<T: Clone + PartialEq>(target: &mut Option<T>, patch: &Option<T>, delta: &mut Option<T>) -> bool {
    match patch {
        Some(value) if target.as_ref() != Some(value) => {
            *target = Some(value.clone());
            *delta = Some(value.clone());
            true
        }
        _ => false,
    }
}

impl DeviceInfo {
    /// Field-wise merge. Returns the merged record and the fields that
    /// actually changed, or `None` when nothing changed.
    pub fn merge(&self, patch: &DeviceInfo) -> Option<(DeviceInfo, DeviceInfo)> {
        let mut merged = self.clone();
        let mut delta = DeviceInfo::default();
        let mut changed = false;

        changed |= merge_field(&mut merged.firmware_version, &patch.firmware_version, &mut delta.firmware_version);
        changed |= merge_field(&mut merged.hardware_version, &patch.hardware_version, &mut delta.hardware_version);
        changed |= merge_field(&mut merged.device_mode, &patch.device_mode, &mut delta.device_mode);
        changed |= merge_field(&mut merged.mounting_mode, &patch.mounting_mode, &mut delta.mounting_mode);
        changed |= merge_field(&mut merged.wifi_network, &patch.wifi_network, &mut delta.wifi_network);
        changed |= merge_field(&mut merged.wifi_band, &patch.wifi_band, &mut delta.wifi_band);
        changed |= merge_field(&mut merged.night_vision, &patch.night_vision, &mut delta.night_vision);
        changed |= merge_field(&mut merged.volume, &patch.volume, &mut delta.volume);
        changed |= merge_field(&mut merged.sleep_mode, &patch.sleep_mode, &mut delta.sleep_mode);
        changed |= merge_field(&mut merged.status_light, &patch.status_light, &mut delta.status_light);
        changed |= merge_field(&mut merged.mic_mute, &patch.mic_mute, &mut delta.mic_mute);
        changed |= merge_field(&mut merged.anti_flicker, &patch.anti_flicker, &mut delta.anti_flicker);
        changed |= merge_field(&mut merged.streaming_error, &patch.streaming_error, &mut delta.streaming_error);
        changed |= merge_field(&mut merged.upgrade_downloaded, &patch.upgrade_downloaded, &mut delta.upgrade_downloaded);
        changed |= merge_field(&mut merged.available_soundtracks, &patch.available_soundtracks, &mut delta.available_soundtracks);
        changed |= merge_field(&mut merged.temp_low_threshold, &patch.temp_low_threshold, &mut delta.temp_low_threshold);
        changed |= merge_field(&mut merged.temp_high_threshold, &patch.temp_high_threshold, &mut delta.temp_high_threshold);
        changed |= merge_field(&mut merged.humidity_low_threshold, &patch.humidity_low_threshold, &mut delta.humidity_low_threshold);
        changed |= merge_field(&mut merged.humidity_high_threshold, &patch.humidity_high_threshold, &mut delta.humidity_high_threshold);
        changed |= merge_field(&mut merged.mobile_bitrate, &patch.mobile_bitrate, &mut delta.mobile_bitrate);
        changed |= merge_field(&mut merged.mobile_fps, &patch.mobile_fps, &mut delta.mobile_fps);
        changed |= merge_field(&mut merged.dvr_bitrate, &patch.dvr_bitrate, &mut delta.dvr_bitrate);
        changed |= merge_field(&mut merged.dvr_fps, &patch.dvr_fps, &mut delta.dvr_fps);
        changed |= merge_field(&mut merged.analytics_bitrate, &patch.analytics_bitrate, &mut delta.analytics_bitrate);
        changed |= merge_field(&mut merged.analytics_fps, &patch.analytics_fps, &mut delta.analytics_fps);
        changed |= merge_field(&mut merged.last_updated, &patch.last_updated, &mut delta.last_updated);

        if changed {
            Some((merged, delta))
        } else {
            None
        }
    }
}

/// Sparse per-device state. Every field is independently present or absent;
/// the same type is used for full records and for partial updates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct State {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_state: Option<StreamState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_request_state: Option<StreamRequestState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_websocket_alive: Option<bool>,
    /// Unix timestamp (seconds) of the last media packet, 0 once the stream dies
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_video_packet_time: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub motion_timestamp: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sound_timestamp: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature_milli: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub humidity_milli: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_night: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub night_light: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub standby: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_info: Option<DeviceInfo>,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        *self == State::default()
    }

    /// Applies `patch` on top of `self`. Absent fields in the patch never
    /// clobber present ones; the device info record is merged field by field.
    ///
    /// Returns `(merged, delta)` where `delta` holds only the fields whose
    /// value changed, or `None` if the patch was a no-op.
    pub fn merge(&self, patch: &State) -> Option<(State, State)> {
        let mut merged = self.clone();
        let mut delta = State::default();
        let mut changed = false;

        changed |= merge_field(&mut merged.stream_state, &patch.stream_state, &mut delta.stream_state);
        changed |= merge_field(&mut merged.stream_request_state, &patch.stream_request_state, &mut delta.stream_request_state);
        changed |= merge_field(&mut merged.is_websocket_alive, &patch.is_websocket_alive, &mut delta.is_websocket_alive);
        changed |= merge_field(&mut merged.last_video_packet_time, &patch.last_video_packet_time, &mut delta.last_video_packet_time);
        changed |= merge_field(&mut merged.motion_timestamp, &patch.motion_timestamp, &mut delta.motion_timestamp);
        changed |= merge_field(&mut merged.sound_timestamp, &patch.sound_timestamp, &mut delta.sound_timestamp);
        changed |= merge_field(&mut merged.temperature_milli, &patch.temperature_milli, &mut delta.temperature_milli);
        changed |= merge_field(&mut merged.humidity_milli, &patch.humidity_milli, &mut delta.humidity_milli);
        changed |= merge_field(&mut merged.is_night, &patch.is_night, &mut delta.is_night);
        changed |= merge_field(&mut merged.night_light, &patch.night_light, &mut delta.night_light);
        changed |= merge_field(&mut merged.standby, &patch.standby, &mut delta.standby);

        if let Some(info_patch) = &patch.device_info {
            let current = merged.device_info.take().unwrap_or_default();
            match current.merge(info_patch) {
                Some((info, info_delta)) => {
                    merged.device_info = Some(info);
                    delta.device_info = Some(info_delta);
                    changed = true;
                }
                None => merged.device_info = self.device_info.clone(),
            }
        }

        if changed {
            Some((merged, delta))
        } else {
            None
        }
    }

    pub fn with_stream_state(mut self, value: StreamState) -> Self {
        self.stream_state = Some(value);
        self
    }

    pub fn with_stream_request_state(mut self, value: StreamRequestState) -> Self {
        self.stream_request_state = Some(value);
        self
    }

    pub fn with_websocket_alive(mut self, value: bool) -> Self {
        self.is_websocket_alive = Some(value);
        self
    }

    pub fn with_last_video_packet_time(mut self, value: i64) -> Self {
        self.last_video_packet_time = Some(value);
        self
    }

    pub fn with_temperature_milli(mut self, value: i32) -> Self {
        self.temperature_milli = Some(value);
        self
    }

    pub fn with_humidity_milli(mut self, value: i32) -> Self {
        self.humidity_milli = Some(value);
        self
    }

    pub fn with_is_night(mut self, value: bool) -> Self {
        self.is_night = Some(value);
        self
    }

    pub fn with_night_light(mut self, value: bool) -> Self {
        self.night_light = Some(value);
        self
    }

    pub fn with_standby(mut self, value: bool) -> Self {
        self.standby = Some(value);
        self
    }

    pub fn with_device_info(mut self, value: DeviceInfo) -> Self {
        self.device_info = Some(value);
        self
    }

    pub fn stream_state(&self) -> StreamState {
        self.stream_state.unwrap_or_default()
    }

    pub fn stream_request_state(&self) -> StreamRequestState {
        self.stream_request_state.unwrap_or_default()
    }

    pub fn websocket_alive(&self) -> bool {
        self.is_websocket_alive.unwrap_or(false)
    }

    pub fn temperature(&self) -> Option<f64> {
        self.temperature_milli.map(|v| v as f64 / 1000.0)
    }

    pub fn humidity(&self) -> Option<f64> {
        self.humidity_milli.map(|v| v as f64 / 1000.0)
    }

    pub fn is_actively_streaming(&self) -> bool {
        self.is_actively_streaming_at(chrono::Utc::now().timestamp())
    }

    /// `now - last_video_packet_time < 10s`; never true without a recorded packet.
    pub fn is_actively_streaming_at(&self, now: i64) -> bool {
        match self.last_video_packet_time {
            Some(last) => now - last < ACTIVE_STREAM_WINDOW_SECS,
            None => false,
        }
    }

    pub fn view(&self) -> StateView {
        StateView {
            stream_state: self.stream_state(),
            stream_request_state: self.stream_request_state(),
            is_websocket_alive: self.websocket_alive(),
            is_actively_streaming: self.is_actively_streaming(),
            last_video_packet_time: self.last_video_packet_time,
            temperature: self.temperature(),
            humidity: self.humidity(),
            is_night: self.is_night,
            night_light: self.night_light,
            standby: self.standby,
            motion_timestamp: self.motion_timestamp,
            sound_timestamp: self.sound_timestamp,
            device_info: self.device_info.clone(),
        }
    }
}

/// JSON shape handed to status consumers.
#[derive(Debug, Clone, Serialize)]
pub struct StateView {
    pub stream_state: StreamState,
    pub stream_request_state: StreamRequestState,
    pub is_websocket_alive: bool,
    pub is_actively_streaming: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_video_packet_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_night: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub night_light: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub standby: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub motion_timestamp: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sound_timestamp: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_info: Option<DeviceInfo>,
}
