//! Cloud Provider: стриминг ответа удалённого эндпоинта (`/ai/chat/stream`).

mod auth;
mod client;
mod config;
mod decode;

pub use auth::{EnvToken, StaticToken, TokenSource};
pub use client::CloudStreamClient;
pub use config::{
    CloudConfig, DEFAULT_BASE_URL, DEFAULT_CONNECT_TIMEOUT, DEFAULT_RESPONSE_HEADER_TIMEOUT,
};
pub use decode::{decode_line, EventStreamDecoder, StreamEvent};
