//! Непрозрачные хэндлы нативного движка.
//!
//! LocalEngineService знает только эти трейты; конкретная библиотека (llama.cpp или
//! тестовый runtime) прячется за ними. Ресурсы освобождает Drop,
//! сначала контекст, затем модель.

use std::path::Path;

use tokio_util::sync::CancellationToken;

use crate::config::{ContextParams, ModelParams};
use crate::error::NativeError;

/// Фабрика моделей. Один экземпляр на процесс.
pub trait NativeRuntime: Send + Sync {
    /// Строка бэкенда библиотеки ("Metal", "CUDA", ...). Маппится в EngineBackend по подстроке.
    fn backend_name(&self) -> String;

    fn load_model(
        &self,
        path: &Path,
        params: &ModelParams,
    ) -> Result<Box<dyn LoadedModel>, NativeError>;
}

/// Загруженная модель.
pub trait LoadedModel: Send + Sync {
    fn name(&self) -> String;

    fn create_context(&self, params: &ContextParams) -> Result<Box<dyn InferenceContext>, NativeError>;
}

/// Контекст инференса. `generate` блокирующий, вызывается из spawn_blocking.
pub trait InferenceContext: Send + Sync {
    /// Генерирует текст по промпту; каждый фрагмент отдаётся в `on_fragment` сразу.
    /// Цикл проверяет `cancel` между фрагментами и выходит досрочно.
    /// Возвращает число отданных фрагментов.
    fn generate(
        &self,
        prompt: &str,
        max_tokens: usize,
        cancel: &CancellationToken,
        on_fragment: &mut dyn FnMut(&str),
    ) -> Result<u32, NativeError>;
}
