use ai_providers::EngineError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("bridge io: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad frame: {0}")]
    Protocol(String),

    #[error("bridge closed: {0}")]
    Closed(String),
}

impl From<BridgeError> for EngineError {
    fn from(err: BridgeError) -> Self {
        EngineError::Bridge(err.to_string())
    }
}
