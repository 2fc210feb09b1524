//! Интерфейсы бэкендов: локальный движок и облачный стрим.
//!
//! Фрагменты идут через колбэк по мере генерации. Отмена кооперативная: токен
//! вызывающего передаётся в вызов, локально дополнительно работает abort(request_id).

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{CloudError, EngineError};
use crate::types::{ChatMessage, EngineConfig, LlmChatResult, LocalEngineStatus};

/// Приёмник фрагментов текста. Вызывается ноль или более раз до завершения вызова.
pub type FragmentSink<'a> = &'a mut (dyn FnMut(&str) + Send);

/// Внешний контракт локального движка. Реализуют LocalEngineService (в процессе)
/// и BridgeClient (движок в другом процессе).
#[async_trait]
pub trait LocalEngine: Send + Sync {
    /// Загрузка модели. Повторный вызов без unload: AlreadyInitialized.
    async fn initialize(&self, config: EngineConfig) -> Result<(), EngineError>;

    /// Генерация по последнему сообщению пользователя.
    /// Отмена регистрируется под request_id на всё время вызова и связана с `cancel`:
    /// уже отменённый токен завершает вызов с Aborted без генерации.
    async fn chat(
        &self,
        request_id: &str,
        messages: &[ChatMessage],
        on_fragment: FragmentSink<'_>,
        cancel: &CancellationToken,
    ) -> Result<LlmChatResult, EngineError>;

    /// Отменить генерацию. Неизвестный id: no-op.
    async fn abort(&self, request_id: &str);

    /// Прервать все генерации и освободить модель. Без инициализации: no-op.
    async fn unload(&self);

    async fn status(&self) -> LocalEngineStatus;

    /// Готов ли движок принимать chat.
    async fn is_ready(&self) -> bool {
        self.status().await.initialized
    }
}

/// Облачный стриминговый бэкенд.
#[async_trait]
pub trait CloudBackend: Send + Sync {
    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        on_fragment: FragmentSink<'_>,
        cancel: &CancellationToken,
    ) -> Result<LlmChatResult, CloudError>;
}
