//! GGUF inference через llama.cpp (фича `llama`).

use std::num::NonZeroU32;
use std::path::Path;
use std::sync::Arc;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use tokio_util::sync::CancellationToken;

use crate::config::{model_name_from_path, ContextParams, ModelParams};
use crate::error::NativeError;
use crate::native::{InferenceContext, LoadedModel, NativeRuntime};

/// Максимум токенов в одном batch для decode (ограничение llama.cpp; при большем префилле: "Insufficient Space").
const PREFILL_BATCH_SIZE: usize = 512;

/// Runtime llama.cpp. LlamaBackend инициализируется один раз на процесс.
pub struct LlamaRuntime {
    backend: Arc<LlamaBackend>,
}

impl LlamaRuntime {
    pub fn new() -> Result<Self, NativeError> {
        let backend =
            LlamaBackend::init().map_err(|e| NativeError::ModelLoadFailed(e.to_string()))?;
        Ok(Self {
            backend: Arc::new(backend),
        })
    }
}

impl NativeRuntime for LlamaRuntime {
    fn backend_name(&self) -> String {
        if cfg!(feature = "metal") {
            "Metal".to_string()
        } else if cfg!(feature = "cuda") {
            "CUDA".to_string()
        } else if cfg!(feature = "vulkan") {
            "Vulkan".to_string()
        } else {
            "CPU".to_string()
        }
    }

    fn load_model(
        &self,
        path: &Path,
        params: &ModelParams,
    ) -> Result<Box<dyn LoadedModel>, NativeError> {
        if !path.exists() {
            return Err(NativeError::ModelLoadFailed(format!(
                "model file not found: {}",
                path.display()
            )));
        }
        let mut model_params = LlamaModelParams::default();
        if let Some(layers) = params.gpu_layers {
            model_params = model_params.with_n_gpu_layers(layers);
        }
        let model = LlamaModel::load_from_file(&self.backend, path, &model_params)
            .map_err(|e| NativeError::ModelLoadFailed(e.to_string()))?;

        Ok(Box::new(LlamaLoadedModel {
            backend: Arc::clone(&self.backend),
            model: Arc::new(model),
            name: model_name_from_path(path),
        }))
    }
}

struct LlamaLoadedModel {
    backend: Arc<LlamaBackend>,
    model: Arc<LlamaModel>,
    name: String,
}

impl LoadedModel for LlamaLoadedModel {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn create_context(
        &self,
        params: &ContextParams,
    ) -> Result<Box<dyn InferenceContext>, NativeError> {
        let context = LlamaInferenceContext {
            backend: Arc::clone(&self.backend),
            model: Arc::clone(&self.model),
            params: params.clone(),
        };
        // Пробное выделение: нехватка памяти должна всплыть на initialize, а не на первом chat.
        context.new_llama_context()?;
        Ok(Box::new(context))
    }
}

/// Контекст пересоздаётся на каждую генерацию: LlamaContext заимствует модель,
/// а параллельные запросы не должны делить KV-кэш.
struct LlamaInferenceContext {
    backend: Arc<LlamaBackend>,
    model: Arc<LlamaModel>,
    params: ContextParams,
}

impl LlamaInferenceContext {
    fn new_llama_context(&self) -> Result<llama_cpp_2::context::LlamaContext<'_>, NativeError> {
        let n_ctx = NonZeroU32::new(self.params.context_size)
            .or(NonZeroU32::new(2048))
            .ok_or_else(|| NativeError::ContextFailed("invalid context size".into()))?;
        let n_threads = self.params.threads as i32;
        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(Some(n_ctx))
            .with_n_threads(n_threads)
            .with_n_threads_batch(n_threads);
        self.model
            .new_context(&self.backend, ctx_params)
            .map_err(|e| NativeError::ContextFailed(e.to_string()))
    }
}

impl InferenceContext for LlamaInferenceContext {
    fn generate(
        &self,
        prompt: &str,
        max_tokens: usize,
        cancel: &CancellationToken,
        on_fragment: &mut dyn FnMut(&str),
    ) -> Result<u32, NativeError> {
        let mut ctx = self.new_llama_context()?;

        let tokens_list = self
            .model
            .str_to_token(prompt, AddBos::Always)
            .map_err(|e| NativeError::InferenceFailed(e.to_string()))?;

        let mut batch = LlamaBatch::new(PREFILL_BATCH_SIZE, 1);
        let n_tokens = tokens_list.len();
        let last_pos = (n_tokens as i32).saturating_sub(1);

        // Prefill по чанкам, чтобы не превышать лимит batch.
        let mut pos = 0i32;
        for chunk in tokens_list.chunks(PREFILL_BATCH_SIZE) {
            if cancel.is_cancelled() {
                return Ok(0);
            }
            batch.clear();
            for (j, &token) in chunk.iter().enumerate() {
                let p = pos + j as i32;
                batch
                    .add(token, p, &[0], p == last_pos)
                    .map_err(|e| NativeError::InferenceFailed(e.to_string()))?;
            }
            ctx.decode(&mut batch)
                .map_err(|e| NativeError::InferenceFailed(e.to_string()))?;
            pos += chunk.len() as i32;
        }

        let mut sampler =
            LlamaSampler::chain_simple([LlamaSampler::dist(1234), LlamaSampler::greedy()]);

        let mut n_cur = n_tokens as i32;
        let mut fragments: u32 = 0;

        for _ in 0..max_tokens {
            if cancel.is_cancelled() {
                break;
            }

            let token = sampler.sample(&ctx, batch.n_tokens() - 1);
            sampler.accept(token);

            if self.model.is_eog_token(token) {
                break;
            }

            let piece = self
                .model
                .token_to_str(token, Special::Tokenize)
                .unwrap_or_default();
            if !piece.is_empty() {
                on_fragment(&piece);
                fragments += 1;
            }

            batch.clear();
            batch
                .add(token, n_cur, &[0], true)
                .map_err(|e| NativeError::InferenceFailed(e.to_string()))?;
            n_cur += 1;

            ctx.decode(&mut batch)
                .map_err(|e| NativeError::InferenceFailed(e.to_string()))?;
        }

        Ok(fragments)
    }
}
