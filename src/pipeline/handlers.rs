use std::sync::Arc;

use tracing::{debug, trace};

use crate::protocol::messages::{
    AntiFlicker, Control, MountingMode, NightLight, SensorData, SensorType, Settings, Status, StreamIdentifier,
    WifiBand,
};
use crate::protocol::{DeviceConnection, Message, MessageType, RequestType, STATUS_OK};
use crate::state::{DeviceInfo, State, StateStore};

/// Register the handler that mirrors device traffic into the state store.
pub fn install(conn: &DeviceConnection, store: Arc<StateStore>) {
    conn.register_handler(move |message, conn| {
        let now = chrono::Utc::now().timestamp();
        if let Some(patch) = state_from_message(message, now) {
            trace!(uid = %conn.uid(), "Applying device update");
            store.update(conn.uid(), patch);
        }
    });
}

/// Translate one inbound envelope into a state patch, if it carries
/// anything the store tracks.
pub fn state_from_message(message: &Message, now: i64) -> Option<State> {
    let patch = match message.r#type() {
        MessageType::Request => {
            let request = message.request.as_ref()?;
            match request.r#type() {
                RequestType::PutSensorData => sensor_patch(&request.sensor_data),
                RequestType::PutControl => request.control.as_ref().map(control_patch)?,
                RequestType::PutSettings => request.settings.as_ref().map(|s| settings_patch(s, now))?,
                other => {
                    debug!(request_type = ?other, "Unhandled device request");
                    return None;
                }
            }
        }
        MessageType::Response => {
            let response = message.response.as_ref()?;
            if response.status_code != Some(STATUS_OK) {
                return None;
            }
            match response.request_type() {
                RequestType::GetSensorData => sensor_patch(&response.sensor_data),
                RequestType::GetControl => response.control.as_ref().map(control_patch)?,
                RequestType::GetSettings | RequestType::PutSettings => {
                    response.settings.as_ref().map(|s| settings_patch(s, now))?
                }
                RequestType::GetStatus => response.status.as_ref().map(|s| status_patch(s, now))?,
                _ => return None,
            }
        }
        MessageType::Keepalive => return None,
    };

    if patch.is_empty() {
        None
    } else {
        Some(patch)
    }
}

fn sensor_patch(readings: &[SensorData]) -> State {
    let mut patch = State::new();
    for reading in readings {
        match reading.sensor_type() {
            SensorType::Temperature => patch.temperature_milli = reading.value_milli,
            SensorType::Humidity => patch.humidity_milli = reading.value_milli,
            SensorType::Night => patch.is_night = reading.value.map(|v| v == 1),
            SensorType::Motion => patch.motion_timestamp = reading.timestamp,
            SensorType::Sound => patch.sound_timestamp = reading.timestamp,
            SensorType::Light => {}
        }
    }
    patch
}

fn control_patch(control: &Control) -> State {
    let mut patch = State::new();
    if control.night_light.is_some() {
        patch.night_light = Some(control.night_light() == NightLight::LightOn);
    }
    patch
}

fn settings_patch(settings: &Settings, now: i64) -> State {
    let mut info = DeviceInfo {
        night_vision: settings.night_vision,
        volume: settings.volume,
        sleep_mode: settings.sleep_mode,
        status_light: settings.status_light_on,
        mic_mute: settings.mic_mute_on,
        mounting_mode: settings.mounting_mode,
        last_updated: Some(now),
        ..Default::default()
    };

    if settings.anti_flicker.is_some() {
        info.anti_flicker = Some(
            match settings.anti_flicker() {
                AntiFlicker::Fr50Hz => "50Hz",
                AntiFlicker::Fr60Hz => "60Hz",
            }
            .to_string(),
        );
    }
    if settings.wifi_band.is_some() {
        info.wifi_band = Some(
            match settings.wifi_band() {
                WifiBand::Any => "Any",
                WifiBand::Fr24Ghz => "2.4GHz",
                WifiBand::Fr50Ghz => "5.0GHz",
            }
            .to_string(),
        );
    }

    for sensor in &settings.sensors {
        let low = sensor.low_threshold.filter(|_| sensor.use_low_threshold());
        let high = sensor.high_threshold.filter(|_| sensor.use_high_threshold());
        match sensor.sensor_type() {
            SensorType::Temperature => {
                info.temp_low_threshold = low;
                info.temp_high_threshold = high;
            }
            SensorType::Humidity => {
                info.humidity_low_threshold = low;
                info.humidity_high_threshold = high;
            }
            _ => {}
        }
    }

    for stream in &settings.streams {
        match stream.id() {
            StreamIdentifier::Mobile => {
                info.mobile_bitrate = stream.bitrate;
                info.mobile_fps = stream.best_fps;
            }
            StreamIdentifier::Dvr => {
                info.dvr_bitrate = stream.bitrate;
                info.dvr_fps = stream.best_fps;
            }
            StreamIdentifier::Analytics => {
                info.analytics_bitrate = stream.bitrate;
                info.analytics_fps = stream.best_fps;
            }
        }
    }

    let mut patch = State::new().with_device_info(info);
    patch.standby = settings.sleep_mode;
    patch
}

fn status_patch(status: &Status, now: i64) -> State {
    let mut info = DeviceInfo {
        firmware_version: status.current_version.clone(),
        hardware_version: status.hardware_version.clone(),
        upgrade_downloaded: status.upgrade_downloaded,
        last_updated: Some(now),
        ..Default::default()
    };
    if status.mode.is_some() {
        info.device_mode = Some(
            match status.mode() {
                MountingMode::Stand => "Stand",
                MountingMode::Travel => "Travel",
                MountingMode::Switch => "Switch",
            }
            .to_string(),
        );
    }
    State::new().with_device_info(info)
}
