//! Ошибки нативного runtime.

use ai_providers::EngineError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NativeError {
    #[error("model load failed: {0}")]
    ModelLoadFailed(String),

    #[error("context allocation failed: {0}")]
    ContextFailed(String),

    #[error("inference failed: {0}")]
    InferenceFailed(String),

    #[error("hardware detection failed: {0}")]
    HardwareDetectionFailed(String),
}

impl NativeError {
    /// Ошибка загрузки или выделения контекста как EngineInitError.
    pub fn into_init_error(self) -> EngineError {
        EngineError::InitFailed(self.to_string())
    }
}

impl From<NativeError> for EngineError {
    fn from(e: NativeError) -> Self {
        match e {
            NativeError::ModelLoadFailed(_) | NativeError::ContextFailed(_) => {
                EngineError::InitFailed(e.to_string())
            }
            NativeError::InferenceFailed(_) | NativeError::HardwareDetectionFailed(_) => {
                EngineError::Generation(e.to_string())
            }
        }
    }
}
