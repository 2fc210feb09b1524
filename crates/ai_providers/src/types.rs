//! Типы запроса, чанков и статуса движка: общий контракт для локального и облачного путей.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ---------------------------------------------------------------------------
// Messages & request
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/// Одно сообщение диалога. Порядок в запросе = порядок разговора.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// Последнее сообщение пользователя (промпт для локального движка, вход для оценщика).
pub fn last_user_message(messages: &[ChatMessage]) -> Option<&ChatMessage> {
    messages.iter().rev().find(|m| m.role == Role::User)
}

/// Источник инференса. `Hybrid`: только рекомендация оценщика, не режим исполнения.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferenceSource {
    Local,
    Cloud,
    Hybrid,
}

impl InferenceSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            InferenceSource::Local => "local",
            InferenceSource::Cloud => "cloud",
            InferenceSource::Hybrid => "hybrid",
        }
    }

    /// Источник, который реально исполняется: hybrid всегда уходит в облако.
    pub fn executable(self) -> Self {
        match self {
            InferenceSource::Hybrid => InferenceSource::Cloud,
            other => other,
        }
    }
}

impl std::str::FromStr for InferenceSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "local" => Ok(InferenceSource::Local),
            "cloud" => Ok(InferenceSource::Cloud),
            "hybrid" => Ok(InferenceSource::Hybrid),
            other => Err(format!("unknown inference source: {other}")),
        }
    }
}

/// Запрос на чат. После отправки не меняется.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub course_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_knowledge_base: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force_source: Option<InferenceSource>,
}

impl InferenceRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    pub fn with_course(mut self, course_id: impl Into<String>) -> Self {
        self.course_id = Some(course_id.into());
        self
    }

    pub fn with_knowledge_base(mut self, enabled: bool) -> Self {
        self.use_knowledge_base = Some(enabled);
        self
    }

    pub fn with_forced_source(mut self, source: InferenceSource) -> Self {
        self.force_source = Some(source);
        self
    }
}

// ---------------------------------------------------------------------------
// Chunks (caller-facing envelope)
// ---------------------------------------------------------------------------

/// Чанк потока для вызывающего. metadata → content* → done | error.
/// При отмене терминального чанка нет.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InferenceChunk {
    Metadata {
        source: InferenceSource,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        latency_ms: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tokens_generated: Option<u32>,
    },
    Content {
        text: String,
    },
    Done {
        source: InferenceSource,
        latency_ms: u64,
        tokens_generated: u32,
    },
    Error {
        message: String,
    },
}

impl InferenceChunk {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InferenceChunk::Done { .. } | InferenceChunk::Error { .. })
    }
}

/// Итог одного стрима, одинаковый для локального и облачного бэкенда.
/// `tokens_generated`: число фрагментов, приблизительная метрика.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmChatResult {
    pub latency_ms: u64,
    pub tokens_generated: u32,
}

// ---------------------------------------------------------------------------
// Local engine status & config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineBackend {
    #[default]
    Cpu,
    Cuda,
    Metal,
    Vulkan,
}

impl EngineBackend {
    /// Сопоставление строки бэкенда нативной библиотеки по подстроке. Всё неизвестное: cpu.
    pub fn from_backend_name(name: &str) -> Self {
        let name = name.to_lowercase();
        if name.contains("metal") {
            EngineBackend::Metal
        } else if name.contains("cuda") {
            EngineBackend::Cuda
        } else if name.contains("vulkan") {
            EngineBackend::Vulkan
        } else {
            EngineBackend::Cpu
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EngineBackend::Cpu => "cpu",
            EngineBackend::Cuda => "cuda",
            EngineBackend::Metal => "metal",
            EngineBackend::Vulkan => "vulkan",
        }
    }
}

/// Снимок состояния локального движка. Меняет только LocalEngineService.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalEngineStatus {
    pub initialized: bool,
    pub model_name: Option<String>,
    pub backend: EngineBackend,
    pub memory_usage_mb: f64,
    pub context_size: u32,
}

pub const DEFAULT_CONTEXT_SIZE: u32 = 4096;
pub const DEFAULT_MAX_TOKENS: usize = 2048;

/// Параметры загрузки модели.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub model_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_layers: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threads: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<usize>,
    /// Сколько генераций одновременно на одном контексте. 1 = последовательно.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_generations: Option<usize>,
}

impl EngineConfig {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            context_size: None,
            gpu_layers: None,
            threads: None,
            max_tokens: None,
            max_concurrent_generations: None,
        }
    }

    pub fn context_size(&self) -> u32 {
        self.context_size.unwrap_or(DEFAULT_CONTEXT_SIZE)
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)
    }

    pub fn max_concurrent_generations(&self) -> usize {
        self.max_concurrent_generations.unwrap_or(1).max(1)
    }
}
