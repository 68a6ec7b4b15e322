pub mod rtmp;
pub mod websocket;
