//! Protobuf envelope spoken over the device WebSocket.
//!
//! Hand-maintained prost definitions (proto2 semantics: every scalar is
//! optional on the wire). Prost generates accessor methods named after each
//! optional field (`id()`, `r#type()`, `status_code()`, ...) that return the
//! proto default when the field is absent.

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum MessageType {
    Keepalive = 0,
    Request = 1,
    Response = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum RequestType {
    GetStatus = 0,
    GetSettings = 1,
    PutSettings = 2,
    GetControl = 3,
    PutControl = 4,
    GetEvents = 5,
    GetSensorData = 12,
    PutSensorData = 13,
    PutStreaming = 14,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum StreamIdentifier {
    Dvr = 0,
    Analytics = 1,
    Mobile = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum StreamingStatus {
    Started = 0,
    Stopped = 1,
    Paused = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum SensorType {
    Sound = 0,
    Motion = 1,
    Temperature = 2,
    Humidity = 3,
    Light = 4,
    Night = 5,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum NightLight {
    LightOff = 0,
    LightOn = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum AntiFlicker {
    Fr50Hz = 0,
    Fr60Hz = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum WifiBand {
    Any = 0,
    Fr24Ghz = 1,
    Fr50Ghz = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum MountingMode {
    Stand = 0,
    Travel = 1,
    Switch = 2,
}

/// Top-level frame. One WebSocket binary message carries exactly one of these.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Message {
    #[prost(enumeration = "MessageType", optional, tag = "1")]
    pub r#type: Option<i32>,
    #[prost(message, optional, tag = "2")]
    pub request: Option<Request>,
    #[prost(message, optional, tag = "3")]
    pub response: Option<Response>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Request {
    #[prost(int32, optional, tag = "1")]
    pub id: Option<i32>,
    #[prost(enumeration = "RequestType", optional, tag = "2")]
    pub r#type: Option<i32>,
    #[prost(message, optional, tag = "3")]
    pub get_status: Option<GetStatus>,
    #[prost(message, optional, tag = "4")]
    pub streaming: Option<Streaming>,
    #[prost(message, optional, tag = "5")]
    pub settings: Option<Settings>,
    #[prost(message, optional, tag = "12")]
    pub get_sensor_data: Option<GetSensorData>,
    #[prost(message, repeated, tag = "13")]
    pub sensor_data: Vec<SensorData>,
    #[prost(message, optional, tag = "15")]
    pub control: Option<Control>,
    #[prost(message, optional, tag = "19")]
    pub get_control: Option<GetControl>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Response {
    #[prost(int32, optional, tag = "1")]
    pub request_id: Option<i32>,
    #[prost(enumeration = "RequestType", optional, tag = "2")]
    pub request_type: Option<i32>,
    #[prost(int32, optional, tag = "3")]
    pub status_code: Option<i32>,
    #[prost(string, optional, tag = "4")]
    pub status_message: Option<String>,
    #[prost(message, optional, tag = "5")]
    pub status: Option<Status>,
    #[prost(message, optional, tag = "6")]
    pub settings: Option<Settings>,
    #[prost(message, repeated, tag = "8")]
    pub sensor_data: Vec<SensorData>,
    #[prost(message, optional, tag = "9")]
    pub control: Option<Control>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Streaming {
    #[prost(enumeration = "StreamIdentifier", optional, tag = "1")]
    pub id: Option<i32>,
    #[prost(enumeration = "StreamingStatus", optional, tag = "2")]
    pub status: Option<i32>,
    #[prost(string, optional, tag = "3")]
    pub rtmp_url: Option<String>,
    #[prost(int32, optional, tag = "4")]
    pub attempts: Option<i32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SensorData {
    #[prost(enumeration = "SensorType", optional, tag = "1")]
    pub sensor_type: Option<i32>,
    #[prost(bool, optional, tag = "2")]
    pub is_alert: Option<bool>,
    #[prost(int32, optional, tag = "3")]
    pub value: Option<i32>,
    #[prost(int32, optional, tag = "4")]
    pub value_milli: Option<i32>,
    #[prost(int32, optional, tag = "5")]
    pub timestamp: Option<i32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetSensorData {
    #[prost(bool, optional, tag = "1")]
    pub all: Option<bool>,
    #[prost(bool, optional, tag = "2")]
    pub temperature: Option<bool>,
    #[prost(bool, optional, tag = "3")]
    pub humidity: Option<bool>,
    #[prost(bool, optional, tag = "4")]
    pub light: Option<bool>,
    #[prost(bool, optional, tag = "5")]
    pub night: Option<bool>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Control {
    #[prost(enumeration = "NightLight", optional, tag = "1")]
    pub night_light: Option<i32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetControl {
    #[prost(bool, optional, tag = "1")]
    pub night_light: Option<bool>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SensorSettings {
    #[prost(enumeration = "SensorType", optional, tag = "1")]
    pub sensor_type: Option<i32>,
    #[prost(bool, optional, tag = "2")]
    pub use_low_threshold: Option<bool>,
    #[prost(bool, optional, tag = "3")]
    pub use_high_threshold: Option<bool>,
    #[prost(int32, optional, tag = "4")]
    pub low_threshold: Option<i32>,
    #[prost(int32, optional, tag = "5")]
    pub high_threshold: Option<i32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamSettings {
    #[prost(enumeration = "StreamIdentifier", optional, tag = "1")]
    pub id: Option<i32>,
    #[prost(int32, optional, tag = "2")]
    pub bitrate: Option<i32>,
    #[prost(int32, optional, tag = "3")]
    pub best_fps: Option<i32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Settings {
    #[prost(bool, optional, tag = "1")]
    pub night_vision: Option<bool>,
    #[prost(message, repeated, tag = "2")]
    pub sensors: Vec<SensorSettings>,
    #[prost(message, repeated, tag = "3")]
    pub streams: Vec<StreamSettings>,
    #[prost(int32, optional, tag = "4")]
    pub volume: Option<i32>,
    #[prost(enumeration = "AntiFlicker", optional, tag = "5")]
    pub anti_flicker: Option<i32>,
    #[prost(bool, optional, tag = "6")]
    pub sleep_mode: Option<bool>,
    #[prost(bool, optional, tag = "7")]
    pub status_light_on: Option<bool>,
    #[prost(enumeration = "MountingMode", optional, tag = "8")]
    pub mounting_mode: Option<i32>,
    #[prost(enumeration = "WifiBand", optional, tag = "9")]
    pub wifi_band: Option<i32>,
    #[prost(bool, optional, tag = "10")]
    pub mic_mute_on: Option<bool>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Status {
    #[prost(bool, optional, tag = "1")]
    pub upgrade_downloaded: Option<bool>,
    #[prost(string, optional, tag = "3")]
    pub current_version: Option<String>,
    #[prost(enumeration = "MountingMode", optional, tag = "4")]
    pub mode: Option<i32>,
    #[prost(string, optional, tag = "5")]
    pub hardware_version: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetStatus {
    #[prost(bool, optional, tag = "1")]
    pub all: Option<bool>,
}
