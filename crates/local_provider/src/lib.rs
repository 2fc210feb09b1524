//! On-device движок: загрузка GGUF, стриминг фрагментов, отмена по request_id, выгрузка.
//!
//! Нативная библиотека скрыта за `NativeRuntime`; llama.cpp: фича `llama`.

mod config;
mod error;
pub mod hardware_detect;
#[cfg(feature = "llama")]
mod inference;
mod native;
mod service;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::{
    default_models_dir, find_gguf_model, model_name_from_path, ContextParams, ModelParams,
};
pub use error::NativeError;
#[cfg(feature = "llama")]
pub use inference::LlamaRuntime;
pub use native::{InferenceContext, LoadedModel, NativeRuntime};
pub use service::{EnginePhase, LocalEngineService};
