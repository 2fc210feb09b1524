//! LocalEngineService: единственный экземпляр on-device модели и её контекста.
//!
//! Uninitialized → Initializing → Ready ⇄ Generating(n) → Unloading → Uninitialized.
//! Один сервис на процесс, передаётся потребителям через Arc (без глобального состояния).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use ai_providers::{
    last_user_message, ChatMessage, EngineBackend, EngineConfig, EngineError, FragmentSink,
    LlmChatResult, LocalEngine, LocalEngineStatus,
};
use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ContextParams, ModelParams};
use crate::hardware_detect::process_memory_mb;
use crate::native::{InferenceContext, LoadedModel, NativeRuntime};

const FRAGMENT_CHANNEL_CAP: usize = 64;

/// Фаза жизненного цикла (для наблюдаемости; источник истины: слот движка).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePhase {
    Uninitialized,
    Initializing,
    Ready,
    /// Число параллельных генераций на загруженном контексте.
    Generating(usize),
    Unloading,
}

/// Загруженная модель. Порядок полей = порядок освобождения: контекст, затем модель.
struct LoadedEngine {
    context: Arc<dyn InferenceContext>,
    model: Box<dyn LoadedModel>,
    max_tokens: usize,
    permits: Arc<Semaphore>,
}

impl LoadedEngine {
    fn release(self) {
        let LoadedEngine { context, model, .. } = self;
        drop(context);
        drop(model);
    }
}

// ---------------------------------------------------------------------------
// In-flight registry
// ---------------------------------------------------------------------------

#[derive(Default)]
struct InFlightTable {
    /// Идёт unload: новые регистрации отклоняются.
    closing: bool,
    tokens: HashMap<String, (u64, CancellationToken)>,
}

/// request_id → токен отмены. Запись удаляется гардом на любом выходе из chat.
#[derive(Default)]
struct InFlightRegistry {
    table: Mutex<InFlightTable>,
    serial: AtomicU64,
}

impl InFlightRegistry {
    fn lock(&self) -> MutexGuard<'_, InFlightTable> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Токен записи: дочерний к токену вызывающего, abort(request_id) гасит только его.
    fn register(
        self: &Arc<Self>,
        request_id: &str,
        parent: &CancellationToken,
    ) -> Result<InFlightGuard, EngineError> {
        let mut table = self.lock();
        if table.closing {
            return Err(EngineError::Aborted);
        }
        if table.tokens.contains_key(request_id) {
            return Err(EngineError::DuplicateRequest(request_id.to_string()));
        }
        let serial = self.serial.fetch_add(1, Ordering::Relaxed);
        let token = parent.child_token();
        table
            .tokens
            .insert(request_id.to_string(), (serial, token.clone()));
        Ok(InFlightGuard {
            registry: Arc::clone(self),
            request_id: request_id.to_string(),
            serial,
            token,
        })
    }

    fn cancel(&self, request_id: &str) -> bool {
        let removed = self.lock().tokens.remove(request_id);
        match removed {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn close_and_cancel_all(&self) -> usize {
        let mut table = self.lock();
        table.closing = true;
        let count = table.tokens.len();
        for (_, (_, token)) in table.tokens.drain() {
            token.cancel();
        }
        count
    }

    fn reopen(&self) {
        self.lock().closing = false;
    }

    fn len(&self) -> usize {
        self.lock().tokens.len()
    }
}

/// Гард регистрации: снимает запись (только свою) и сигналит отмену при любом выходе.
struct InFlightGuard {
    registry: Arc<InFlightRegistry>,
    request_id: String,
    serial: u64,
    token: CancellationToken,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut table = self.registry.lock();
        if matches!(table.tokens.get(&self.request_id), Some((serial, _)) if *serial == self.serial)
        {
            table.tokens.remove(&self.request_id);
        }
        drop(table);
        // Если future chat уронили посреди генерации: рабочий поток тоже должен остановиться.
        self.token.cancel();
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

pub struct LocalEngineService {
    runtime: Arc<dyn NativeRuntime>,
    slot: RwLock<Option<LoadedEngine>>,
    status: Mutex<LocalEngineStatus>,
    phase: Mutex<EnginePhase>,
    in_flight: Arc<InFlightRegistry>,
}

impl LocalEngineService {
    pub fn new(runtime: Arc<dyn NativeRuntime>) -> Self {
        Self {
            runtime,
            slot: RwLock::new(None),
            status: Mutex::new(LocalEngineStatus::default()),
            phase: Mutex::new(EnginePhase::Uninitialized),
            in_flight: Arc::new(InFlightRegistry::default()),
        }
    }

    pub fn phase(&self) -> EnginePhase {
        let phase = *self.phase.lock().unwrap_or_else(|p| p.into_inner());
        match phase {
            EnginePhase::Ready => match self.in_flight.len() {
                0 => EnginePhase::Ready,
                n => EnginePhase::Generating(n),
            },
            other => other,
        }
    }

    /// Число зарегистрированных токенов отмены.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn set_phase(&self, phase: EnginePhase) {
        *self.phase.lock().unwrap_or_else(|p| p.into_inner()) = phase;
    }

    fn set_status(&self, status: LocalEngineStatus) {
        *self.status.lock().unwrap_or_else(|p| p.into_inner()) = status;
    }

    fn load(
        runtime: Arc<dyn NativeRuntime>,
        config: EngineConfig,
    ) -> Result<(LoadedEngine, LocalEngineStatus), EngineError> {
        let model = runtime
            .load_model(&config.model_path, &ModelParams::from_config(&config))
            .map_err(|e| e.into_init_error())?;
        let ctx_params = ContextParams::from_config(&config);
        let context = model
            .create_context(&ctx_params)
            .map_err(|e| e.into_init_error())?;

        let status = LocalEngineStatus {
            initialized: true,
            model_name: Some(model.name()),
            backend: EngineBackend::from_backend_name(&runtime.backend_name()),
            memory_usage_mb: 0.0,
            context_size: ctx_params.context_size,
        };
        let engine = LoadedEngine {
            context: Arc::from(context),
            model,
            max_tokens: ctx_params.max_tokens,
            permits: Arc::new(Semaphore::new(config.max_concurrent_generations())),
        };
        Ok((engine, status))
    }
}

#[async_trait]
impl LocalEngine for LocalEngineService {
    async fn initialize(&self, config: EngineConfig) -> Result<(), EngineError> {
        let mut slot = self.slot.write().await;
        if slot.is_some() {
            return Err(EngineError::AlreadyInitialized);
        }
        self.set_phase(EnginePhase::Initializing);
        info!(model = %config.model_path.display(), "local engine: loading model");

        let runtime = Arc::clone(&self.runtime);
        let loaded = tokio::task::spawn_blocking(move || Self::load(runtime, config))
            .await
            .map_err(|e| EngineError::InitFailed(e.to_string()))
            .and_then(|r| r);

        match loaded {
            Ok((engine, status)) => {
                info!(
                    model = ?status.model_name,
                    backend = status.backend.as_str(),
                    context_size = status.context_size,
                    "local engine: ready"
                );
                *slot = Some(engine);
                self.set_status(status);
                self.set_phase(EnginePhase::Ready);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "local engine: init failed");
                self.set_phase(EnginePhase::Uninitialized);
                Err(e)
            }
        }
    }

    async fn chat(
        &self,
        request_id: &str,
        messages: &[ChatMessage],
        on_fragment: FragmentSink<'_>,
        cancel: &CancellationToken,
    ) -> Result<LlmChatResult, EngineError> {
        let start = Instant::now();
        let slot = self.slot.read().await;
        let engine = slot.as_ref().ok_or(EngineError::NotInitialized)?;
        let prompt = last_user_message(messages)
            .ok_or(EngineError::NoUserMessage)?
            .content
            .clone();

        let guard = self.in_flight.register(request_id, cancel)?;
        let token = guard.token.clone();
        debug!(request_id, "local engine: request registered");

        let _permit = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(EngineError::Aborted),
            permit = Arc::clone(&engine.permits).acquire_owned() => {
                permit.map_err(|_| EngineError::Aborted)?
            }
        };

        let (tx, mut rx) = mpsc::channel::<String>(FRAGMENT_CHANNEL_CAP);
        let context = Arc::clone(&engine.context);
        let max_tokens = engine.max_tokens;
        let worker_token = token.clone();
        let handle = tokio::task::spawn_blocking(move || {
            context.generate(&prompt, max_tokens, &worker_token, &mut |piece: &str| {
                let _ = tx.blocking_send(piece.to_string());
            })
        });

        let mut fragments: u32 = 0;
        while let Some(piece) = rx.recv().await {
            // После abort дочитываем канал, но наружу ничего не отдаём.
            if token.is_cancelled() {
                continue;
            }
            on_fragment(&piece);
            fragments += 1;
        }

        let generated = handle
            .await
            .map_err(|e| EngineError::Generation(e.to_string()))?;
        if token.is_cancelled() {
            debug!(request_id, fragments, "local engine: aborted");
            return Err(EngineError::Aborted);
        }
        generated.map_err(EngineError::from)?;
        drop(guard);

        let result = LlmChatResult {
            latency_ms: start.elapsed().as_millis() as u64,
            tokens_generated: fragments,
        };
        debug!(request_id, latency_ms = result.latency_ms, fragments, "local engine: done");
        Ok(result)
    }

    async fn abort(&self, request_id: &str) {
        if self.in_flight.cancel(request_id) {
            debug!(request_id, "local engine: abort signalled");
        }
    }

    async fn unload(&self) {
        let aborted = self.in_flight.close_and_cancel_all();
        {
            let mut slot = self.slot.write().await;
            if let Some(engine) = slot.take() {
                self.set_phase(EnginePhase::Unloading);
                engine.release();
                self.set_status(LocalEngineStatus::default());
                info!(aborted, "local engine: unloaded");
            }
            self.set_phase(EnginePhase::Uninitialized);
        }
        self.in_flight.reopen();
    }

    async fn status(&self) -> LocalEngineStatus {
        let mut status = self
            .status
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        if status.initialized {
            status.memory_usage_mb = process_memory_mb();
        }
        status
    }
}
