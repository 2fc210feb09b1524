//! AI Config: облако, локальный движок и оценщик (~/.emfield/ai_config.json).
//!
//! Все поля необязательные. Переменные окружения перекрывают файл, флаги CLI: окружение.

use ai_providers::EngineConfig;
use ai_runtime::{EstimatorConfig, DEFAULT_PROBE_TIMEOUT};
use cloud_provider::CloudConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_DIR: &str = ".emfield";
const CONFIG_FILE: &str = "ai_config.json";

pub const ENV_BASE_URL: &str = "EMFIELD_AI_BASE_URL";
pub const ENV_TOKEN: &str = "EMFIELD_AI_TOKEN";
pub const ENV_MODEL_PATH: &str = "EMFIELD_MODEL_PATH";

const REDACTED: &str = "<redacted>";

/// Где живёт локальный движок.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalMode {
    /// Только облако.
    Disabled,
    /// В этом процессе (нужна фича `local`).
    #[default]
    InProcess,
    /// В дочернем процессе `emfield-ai worker` через ProcessBridge.
    Worker,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalSection {
    pub mode: LocalMode,
    /// Параметры модели. Без них: первый .gguf из каталога моделей.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine: Option<EngineConfig>,
    /// Загружать модель при старте.
    pub autoload: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    pub cloud: CloudConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub probe_timeout_ms: u64,
    pub local: LocalSection,
    pub estimator: EstimatorConfig,
    /// Каталог router.log. По умолчанию ~/.emfield/logs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            cloud: CloudConfig::default(),
            token: None,
            probe_timeout_ms: DEFAULT_PROBE_TIMEOUT.as_millis() as u64,
            local: LocalSection::default(),
            estimator: EstimatorConfig::default(),
            log_dir: None,
        }
    }
}

impl AiConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(crate::logs::logs_dir)
    }

    /// Переопределения из окружения. `lookup`: обычно `std::env::var(..).ok()`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(url) = non_empty(ENV_BASE_URL) {
            self.cloud.base_url = url;
        }
        if let Some(token) = non_empty(ENV_TOKEN) {
            self.token = Some(token);
        }
        if let Some(path) = non_empty(ENV_MODEL_PATH) {
            self.set_model_path(PathBuf::from(path));
        }
    }

    /// Меняет путь к модели, сохраняя остальные параметры движка.
    pub fn set_model_path(&mut self, path: PathBuf) {
        match self.local.engine {
            Some(ref mut engine) => engine.model_path = path,
            None => self.local.engine = Some(EngineConfig::new(path)),
        }
    }

    /// Копия для вывода: значение токена скрыто.
    pub fn redacted(&self) -> AiConfig {
        let mut shown = self.clone();
        if shown.token.is_some() {
            shown.token = Some(REDACTED.to_string());
        }
        shown
    }

    /// Копия для записи в файл. Токен берётся только из уже сохранённого файла,
    /// переопределения из окружения и флагов на диск не попадают.
    pub fn for_file(&self, stored: &AiConfig) -> AiConfig {
        AiConfig {
            token: stored.token.clone(),
            ..self.clone()
        }
    }

    /// Конфиг движка: явный или первый .gguf в каталоге моделей.
    pub fn resolve_engine_config(&self) -> Option<EngineConfig> {
        if let Some(ref engine) = self.local.engine {
            return Some(engine.clone());
        }
        local_provider::find_gguf_model(&local_provider::default_models_dir()).map(EngineConfig::new)
    }
}

pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(CONFIG_DIR)
}

pub fn config_path() -> PathBuf {
    config_dir().join(CONFIG_FILE)
}

/// Файл + окружение. Битый или отсутствующий файл: значения по умолчанию.
pub fn load_config() -> AiConfig {
    let mut config = load_config_from(&config_path());
    config.apply_env(|key| std::env::var(key).ok());
    config
}

pub fn load_config_from(path: &Path) -> AiConfig {
    match std::fs::read_to_string(path) {
        Ok(s) => match serde_json::from_str(&s) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ai config: invalid json, using defaults");
                AiConfig::default()
            }
        },
        Err(_) => AiConfig::default(),
    }
}

/// Сохраняет действующий конфиг поверх файла, не вынося токен из окружения на диск.
pub fn write_effective_config(path: &Path, config: &AiConfig) -> Result<(), String> {
    let stored = load_config_from(path);
    save_config_to(path, &config.for_file(&stored))
}

pub fn save_config_to(path: &Path, config: &AiConfig) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
    }
    let json = serde_json::to_string_pretty(config).map_err(|e| e.to_string())?;
    std::fs::write(path, json).map_err(|e| e.to_string())
}
