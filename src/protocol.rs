pub mod codec;
pub mod connection;
pub mod messages;

pub use connection::DeviceConnection;
pub use messages::{Message, MessageType, Request, RequestType, Response};

/// Status code the device uses for a successful response
pub const STATUS_OK: i32 = 200;
