//! Process Bridge: локальный движок в отдельном процессе.
//!
//! Кадры идут JSON-строками. В продакшене это stdio дочернего процесса,
//! в тестах `tokio::io::duplex`.

mod client;
mod error;
mod host;
mod protocol;

pub use client::BridgeClient;
pub use error::BridgeError;
pub use host::BridgeHost;
pub use protocol::{decode_frame, encode_frame, BridgeEvent, BridgeReply, Frame, Method};
