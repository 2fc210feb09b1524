//! Команды для вызывающего (UI, CLI): initialize, chat, abort, unload, status.
//!
//! Ошибки: строки для показа пользователю. Состояние чата видно только по чанкам.

use ai_providers::{EngineConfig, InferenceRequest, LocalEngineStatus};
use ai_runtime::{ChatOutcome, ChunkEmitter, ComplexityResult};
use tokio_util::sync::CancellationToken;

use crate::state::AppState;

/// Загружает модель: явный конфиг или из ai_config / каталога моделей.
pub async fn initialize(
    state: &AppState,
    config: Option<EngineConfig>,
) -> Result<LocalEngineStatus, String> {
    let local = state
        .local
        .as_ref()
        .ok_or_else(|| "local engine is disabled".to_string())?;
    let config = config
        .or_else(|| state.config.resolve_engine_config())
        .ok_or_else(|| {
            "no model configured: set local.engine.model_path or EMFIELD_MODEL_PATH".to_string()
        })?;
    local.initialize(config).await.map_err(|e| e.to_string())?;
    Ok(local.status().await)
}

/// Запускает чат. Завершается на терминальном чанке или отмене.
pub async fn chat(state: &AppState, request: InferenceRequest, on_chunk: ChunkEmitter) -> ChatOutcome {
    state.router.chat(request, on_chunk).await
}

/// Чат с токеном отмены вызывающего (таймер, Ctrl-C).
pub async fn chat_with_cancel(
    state: &AppState,
    request: InferenceRequest,
    on_chunk: ChunkEmitter,
    cancel: CancellationToken,
) -> ChatOutcome {
    state.router.chat_with_cancel(request, on_chunk, cancel).await
}

/// Отменяет текущий чат. Без активного чата: no-op.
pub fn abort(state: &AppState) {
    state.router.abort();
}

pub async fn unload(state: &AppState) -> Result<(), String> {
    if let Some(ref local) = state.local {
        local.unload().await;
    }
    Ok(())
}

/// Статус локального движка. Без движка: нулевой статус.
pub async fn status(state: &AppState) -> Result<LocalEngineStatus, String> {
    match state.local {
        Some(ref local) => Ok(local.status().await),
        None => Ok(LocalEngineStatus::default()),
    }
}

/// Оценка сложности без запуска инференса.
pub fn estimate(state: &AppState, request: &InferenceRequest) -> ComplexityResult {
    state.router.estimator().estimate(request)
}

/// Новый bearer-токен (после логина во внешнем слое).
pub async fn set_token(state: &AppState, token: Option<String>) {
    state.tokens.set(token).await;
}
