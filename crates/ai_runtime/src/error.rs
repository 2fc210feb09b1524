//! Ошибки маршрутизатора. Всё, кроме отмены, уходит вызывающему одним error-чанком.

use ai_providers::{CloudError, EngineError};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouterError {
    #[error("local engine is not available")]
    LocalUnavailable,

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error("invalid endpoint url: {0}")]
    InvalidUrl(String),
}

impl RouterError {
    pub fn is_aborted(&self) -> bool {
        match self {
            RouterError::Engine(e) => e.is_aborted(),
            RouterError::Cloud(e) => e.is_aborted(),
            _ => false,
        }
    }
}
