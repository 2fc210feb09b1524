//! Кадры моста: одна JSON-строка на кадр.
//!
//! Call → Reply по call_id. Chat отвечает не Reply, а потоком Event по request_id,
//! который закрывается done или error. Abort: без ответа.

use ai_providers::{ChatMessage, EngineConfig, EngineError, LlmChatResult, LocalEngineStatus};
use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Call {
        call_id: u64,
        method: Method,
    },
    Reply {
        call_id: u64,
        result: Result<BridgeReply, EngineError>,
    },
    Event {
        request_id: String,
        event: BridgeEvent,
    },
    Abort {
        request_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum Method {
    Initialize {
        config: EngineConfig,
    },
    Chat {
        request_id: String,
        messages: Vec<ChatMessage>,
    },
    Unload,
    Status,
}

impl Method {
    pub fn name(&self) -> &'static str {
        match self {
            Method::Initialize { .. } => "initialize",
            Method::Chat { .. } => "chat",
            Method::Unload => "unload",
            Method::Status => "status",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BridgeReply {
    Unit,
    Status { status: LocalEngineStatus },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BridgeEvent {
    Chunk { text: String },
    Done { result: LlmChatResult },
    Error { error: EngineError },
}

impl BridgeEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BridgeEvent::Chunk { .. })
    }
}

/// Кадр в строку с `\n` на конце.
pub fn encode_frame(frame: &Frame) -> Result<String, BridgeError> {
    let mut line = serde_json::to_string(frame).map_err(|e| BridgeError::Protocol(e.to_string()))?;
    line.push('\n');
    Ok(line)
}

pub fn decode_frame(line: &str) -> Result<Frame, BridgeError> {
    serde_json::from_str(line.trim()).map_err(|e| BridgeError::Protocol(e.to_string()))
}
