//! Таксономия ошибок бэкендов.
//!
//! `EngineError` сериализуется: он пересекает границу процесса через ProcessBridge
//! и должен сохранить вариант (NotInitialized остаётся NotInitialized).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Ошибки локального движка.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum EngineError {
    /// Не удалось загрузить модель или выделить контекст. Движок остаётся неинициализированным.
    #[error("engine init failed: {0}")]
    InitFailed(String),

    #[error("local engine is already initialized, unload it first")]
    AlreadyInitialized,

    #[error("local engine is not initialized")]
    NotInitialized,

    #[error("no user message in request")]
    NoUserMessage,

    /// Кооперативная отмена. Не ошибка для пользователя: стрим завершается молча.
    #[error("generation aborted")]
    Aborted,

    #[error("request id already in flight: {0}")]
    DuplicateRequest(String),

    #[error("generation failed: {0}")]
    Generation(String),

    /// Обрыв транспорта между процессами.
    #[error("process bridge: {0}")]
    Bridge(String),
}

impl EngineError {
    pub fn is_aborted(&self) -> bool {
        matches!(self, EngineError::Aborted)
    }
}

/// Ошибки облачного стрима.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CloudError {
    /// Не-2xx ответ эндпоинта.
    #[error("cloud request failed with status {status}: {body}")]
    Request { status: u16, body: String },

    #[error("network error: {0}")]
    Network(String),

    /// Ошибка, пришедшая внутри event-stream (`data: {"error": ...}`).
    #[error("cloud stream error: {0}")]
    Stream(String),

    #[error("credential error: {0}")]
    Credential(String),

    #[error("cloud client misconfigured: {0}")]
    Config(String),

    #[error("cloud request aborted")]
    Aborted,
}

impl CloudError {
    pub fn is_aborted(&self) -> bool {
        matches!(self, CloudError::Aborted)
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            CloudError::Request { status, .. } => Some(*status),
            _ => None,
        }
    }
}
