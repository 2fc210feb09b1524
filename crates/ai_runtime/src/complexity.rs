//! ComplexityEstimator: детерминированная оценка сложности запроса.
//!
//! Rule-based, без LLM. Смотрит только на последнее сообщение пользователя
//! и метаданные запроса. Результат не кэшируется.

use ai_providers::{last_user_message, InferenceRequest, InferenceSource};
use serde::{Deserialize, Serialize};

/// Веса, пороги и словари оценщика. Значения по умолчанию: рабочие,
/// переопределяются из ai_config.json.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    pub long_message_chars: usize,
    pub long_message_weight: f64,
    pub short_message_chars: usize,
    pub short_message_weight: f64,
    pub knowledge_base_weight: f64,
    pub complex_task_weight: f64,
    pub simple_task_weight: f64,
    pub long_conversation_messages: usize,
    pub long_conversation_weight: f64,
    pub privacy_weight: f64,
    pub course_context_weight: f64,
    /// score ниже: local.
    pub local_threshold: f64,
    /// score выше: cloud. Между порогами: hybrid.
    pub cloud_threshold: f64,
    pub complex_keywords: Vec<String>,
    pub simple_keywords: Vec<String>,
    pub privacy_keywords: Vec<String>,
}

fn words(list: &[&str]) -> Vec<String> {
    list.iter().map(|w| w.to_string()).collect()
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            long_message_chars: 200,
            long_message_weight: 0.3,
            short_message_chars: 20,
            short_message_weight: -0.1,
            knowledge_base_weight: 0.2,
            complex_task_weight: 0.4,
            simple_task_weight: -0.2,
            long_conversation_messages: 6,
            long_conversation_weight: 0.1,
            privacy_weight: -0.5,
            course_context_weight: 0.2,
            local_threshold: 0.3,
            cloud_threshold: 0.5,
            complex_keywords: words(&[
                "分析", "比较", "评价", "论证", "推导", "证明", "设计", "总结", "改进", "优缺点",
                "analyze", "compare", "evaluate", "explain why", "derive", "prove", "design",
                "essay",
            ]),
            simple_keywords: words(&[
                "什么是", "是什么", "定义", "翻译", "what is", "define", "translate",
            ]),
            privacy_keywords: words(&[
                "成绩", "学号", "身份证", "手机号", "密码", "隐私", "grade", "student id",
                "password", "phone number", "private",
            ]),
        }
    }
}

/// Итог оценки: score в [0, 1], сработавшие правила по порядку, рекомендация.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplexityResult {
    pub score: f64,
    pub factors: Vec<String>,
    pub suggested_source: InferenceSource,
}

pub const FACTOR_NO_USER_MESSAGE: &str = "no user message";
pub const FACTOR_LONG_MESSAGE: &str = "long message";
pub const FACTOR_SHORT_MESSAGE: &str = "short message";
pub const FACTOR_KNOWLEDGE_BASE: &str = "knowledge base";
pub const FACTOR_COMPLEX_TASK: &str = "complex task";
pub const FACTOR_SIMPLE_TASK: &str = "simple task";
pub const FACTOR_LONG_CONVERSATION: &str = "long conversation";
pub const FACTOR_PRIVACY: &str = "privacy sensitive";
pub const FACTOR_COURSE_CONTEXT: &str = "course context";

#[derive(Debug, Clone, Default)]
pub struct ComplexityEstimator {
    config: EstimatorConfig,
}

impl ComplexityEstimator {
    pub fn new(config: EstimatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    pub fn estimate(&self, request: &InferenceRequest) -> ComplexityResult {
        let cfg = &self.config;
        let Some(message) = last_user_message(&request.messages) else {
            return ComplexityResult {
                score: 0.5,
                factors: vec![FACTOR_NO_USER_MESSAGE.to_string()],
                suggested_source: InferenceSource::Cloud,
            };
        };

        let text = message.content.to_lowercase();
        let chars = message.content.chars().count();
        let mut score = 0.0_f64;
        let mut factors = Vec::new();
        let mut apply = |triggered: bool, weight: f64, label: &str| {
            if triggered {
                score += weight;
                factors.push(label.to_string());
            }
        };

        apply(chars > cfg.long_message_chars, cfg.long_message_weight, FACTOR_LONG_MESSAGE);
        apply(chars < cfg.short_message_chars, cfg.short_message_weight, FACTOR_SHORT_MESSAGE);
        apply(
            request.use_knowledge_base.unwrap_or(false),
            cfg.knowledge_base_weight,
            FACTOR_KNOWLEDGE_BASE,
        );
        apply(
            contains_any(&text, &cfg.complex_keywords),
            cfg.complex_task_weight,
            FACTOR_COMPLEX_TASK,
        );
        apply(
            contains_any(&text, &cfg.simple_keywords),
            cfg.simple_task_weight,
            FACTOR_SIMPLE_TASK,
        );
        apply(
            request.messages.len() > cfg.long_conversation_messages,
            cfg.long_conversation_weight,
            FACTOR_LONG_CONVERSATION,
        );
        let privacy = contains_any(&text, &cfg.privacy_keywords);
        apply(privacy, cfg.privacy_weight, FACTOR_PRIVACY);
        apply(
            request.course_id.as_deref().is_some_and(|c| !c.is_empty()),
            cfg.course_context_weight,
            FACTOR_COURSE_CONTEXT,
        );

        // Два знака: 0.1 + 0.2 не должно перепрыгивать порог.
        let score = (score.clamp(0.0, 1.0) * 100.0).round() / 100.0;
        let suggested_source = if privacy || score < cfg.local_threshold {
            InferenceSource::Local
        } else if score > cfg.cloud_threshold {
            InferenceSource::Cloud
        } else {
            InferenceSource::Hybrid
        };

        ComplexityResult {
            score,
            factors,
            suggested_source,
        }
    }
}

fn contains_any(text: &str, keywords: &[String]) -> bool {
    keywords
        .iter()
        .any(|k| !k.is_empty() && text.contains(&k.to_lowercase()))
}
