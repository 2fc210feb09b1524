//! AI Providers: общий контракт локального движка и облачного стрима.
//!
//! Провайдер не знает, кто его выбрал: получает сообщения, отдаёт фрагменты.

mod error;
mod traits;
mod types;

pub use error::{CloudError, EngineError};
pub use traits::{CloudBackend, FragmentSink, LocalEngine};
pub use types::{
    last_user_message, ChatMessage, EngineBackend, EngineConfig, InferenceChunk,
    InferenceRequest, InferenceSource, LlmChatResult, LocalEngineStatus, Role,
    DEFAULT_CONTEXT_SIZE, DEFAULT_MAX_TOKENS,
};
