//! Скриптованный runtime для тестов: без нативной библиотеки, с задержками и счётчиками.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::{model_name_from_path, ContextParams, ModelParams};
use crate::error::NativeError;
use crate::native::{InferenceContext, LoadedModel, NativeRuntime};

#[derive(Debug, Clone)]
enum Script {
    /// Фиксированные фрагменты.
    Fixed(Vec<String>),
    /// Слова промпта по одному.
    Echo,
}

/// Runtime, который «генерирует» заданные фрагменты.
#[derive(Debug, Clone)]
pub struct ScriptedRuntime {
    script: Script,
    delay: Duration,
    backend: String,
    load_error: Option<String>,
    generation_error: Option<String>,
    live_models: Arc<AtomicUsize>,
    live_contexts: Arc<AtomicUsize>,
}

impl ScriptedRuntime {
    pub fn new<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            script: Script::Fixed(fragments.into_iter().map(Into::into).collect()),
            delay: Duration::ZERO,
            backend: "CPU".to_string(),
            load_error: None,
            generation_error: None,
            live_models: Arc::new(AtomicUsize::new(0)),
            live_contexts: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Отдаёт промпт по словам.
    pub fn echo() -> Self {
        Self {
            script: Script::Echo,
            ..Self::new(Vec::<String>::new())
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_backend(mut self, name: impl Into<String>) -> Self {
        self.backend = name.into();
        self
    }

    pub fn failing_load(mut self, message: impl Into<String>) -> Self {
        self.load_error = Some(message.into());
        self
    }

    pub fn failing_generation(mut self, message: impl Into<String>) -> Self {
        self.generation_error = Some(message.into());
        self
    }

    /// Сколько моделей сейчас не освобождено.
    pub fn live_models(&self) -> usize {
        self.live_models.load(Ordering::SeqCst)
    }

    /// Сколько контекстов сейчас не освобождено.
    pub fn live_contexts(&self) -> usize {
        self.live_contexts.load(Ordering::SeqCst)
    }
}

impl NativeRuntime for ScriptedRuntime {
    fn backend_name(&self) -> String {
        self.backend.clone()
    }

    fn load_model(
        &self,
        path: &Path,
        _params: &ModelParams,
    ) -> Result<Box<dyn LoadedModel>, NativeError> {
        if let Some(ref message) = self.load_error {
            return Err(NativeError::ModelLoadFailed(message.clone()));
        }
        self.live_models.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedModel {
            runtime: self.clone(),
            name: model_name_from_path(path),
        }))
    }
}

struct ScriptedModel {
    runtime: ScriptedRuntime,
    name: String,
}

impl Drop for ScriptedModel {
    fn drop(&mut self) {
        self.runtime.live_models.fetch_sub(1, Ordering::SeqCst);
    }
}

impl LoadedModel for ScriptedModel {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn create_context(
        &self,
        _params: &ContextParams,
    ) -> Result<Box<dyn InferenceContext>, NativeError> {
        self.runtime.live_contexts.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedContext {
            runtime: self.runtime.clone(),
        }))
    }
}

struct ScriptedContext {
    runtime: ScriptedRuntime,
}

impl Drop for ScriptedContext {
    fn drop(&mut self) {
        self.runtime.live_contexts.fetch_sub(1, Ordering::SeqCst);
    }
}

impl InferenceContext for ScriptedContext {
    fn generate(
        &self,
        prompt: &str,
        max_tokens: usize,
        cancel: &CancellationToken,
        on_fragment: &mut dyn FnMut(&str),
    ) -> Result<u32, NativeError> {
        if let Some(ref message) = self.runtime.generation_error {
            return Err(NativeError::InferenceFailed(message.clone()));
        }
        let fragments: Vec<String> = match self.runtime.script {
            Script::Fixed(ref f) => f.clone(),
            Script::Echo => prompt.split_whitespace().map(|w| format!("{w} ")).collect(),
        };
        let mut produced = 0;
        for fragment in fragments.iter().take(max_tokens) {
            if !self.runtime.delay.is_zero() {
                std::thread::sleep(self.runtime.delay);
            }
            if cancel.is_cancelled() {
                break;
            }
            on_fragment(fragment);
            produced += 1;
        }
        Ok(produced)
    }
}
