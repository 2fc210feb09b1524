//! Параметры загрузки: из EngineConfig в параметры нативного runtime, поиск GGUF.

use std::path::{Path, PathBuf};

use ai_providers::EngineConfig;

use crate::hardware_detect::cpu_cores;

/// Параметры загрузки модели для NativeRuntime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelParams {
    pub gpu_layers: Option<u32>,
}

/// Параметры контекста инференса.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextParams {
    pub context_size: u32,
    pub threads: usize,
    pub max_tokens: usize,
}

impl ModelParams {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            gpu_layers: config.gpu_layers,
        }
    }
}

impl ContextParams {
    pub fn from_config(config: &EngineConfig) -> Self {
        let threads = config
            .threads
            .filter(|t| *t > 0)
            .unwrap_or_else(|| cpu_cores().unwrap_or(4));
        Self {
            context_size: config.context_size(),
            threads,
            max_tokens: config.max_tokens(),
        }
    }
}

/// Имя модели для статуса: имя файла без расширения.
pub fn model_name_from_path(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Директория моделей по умолчанию.
pub fn default_models_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("emfield")
        .join("models")
}

/// Первый GGUF-файл в директории (для split-моделей: первая часть).
pub fn find_gguf_model(dir: &Path) -> Option<PathBuf> {
    if !dir.exists() {
        return None;
    }
    let mut candidates: Vec<PathBuf> = std::fs::read_dir(dir)
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().map(|e| e == "gguf").unwrap_or(false))
        .collect();
    candidates.sort();
    candidates.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_params_defaults() {
        let config = EngineConfig::new("/tmp/qwen2.5-1.5b-instruct-q4_k_m.gguf");
        let params = ContextParams::from_config(&config);
        assert_eq!(params.context_size, 4096);
        assert!(params.threads >= 1);
        assert_eq!(params.max_tokens, ai_providers::DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn test_zero_threads_falls_back_to_detected() {
        let mut config = EngineConfig::new("/tmp/m.gguf");
        config.threads = Some(0);
        assert!(ContextParams::from_config(&config).threads >= 1);
        config.threads = Some(3);
        assert_eq!(ContextParams::from_config(&config).threads, 3);
    }

    #[test]
    fn test_model_name_from_path() {
        assert_eq!(
            model_name_from_path(Path::new("/models/qwen2.5-1.5b-instruct-q4_k_m.gguf")),
            "qwen2.5-1.5b-instruct-q4_k_m"
        );
    }

    #[test]
    fn test_find_gguf_missing_dir() {
        assert!(find_gguf_model(Path::new("/definitely/not/here")).is_none());
    }
}
