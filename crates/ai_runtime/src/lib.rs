//! AI Runtime: адаптивная маршрутизация инференса.
//!
//! Pipeline: ComplexityEstimator → проверка local/сети → backend (local | cloud) → emit chunks.

mod complexity;
mod error;
mod network;
mod router;

pub use complexity::{
    ComplexityEstimator, ComplexityResult, EstimatorConfig, FACTOR_COMPLEX_TASK,
    FACTOR_COURSE_CONTEXT, FACTOR_KNOWLEDGE_BASE, FACTOR_LONG_CONVERSATION, FACTOR_LONG_MESSAGE,
    FACTOR_NO_USER_MESSAGE, FACTOR_PRIVACY, FACTOR_SHORT_MESSAGE, FACTOR_SIMPLE_TASK,
};
pub use error::RouterError;
pub use network::{NetworkProbe, StaticProbe, TcpProbe, DEFAULT_PROBE_TIMEOUT};
pub use router::{
    ChatOutcome, ChunkEmitter, DecisionHook, InferenceRouter, RouteDecision, SelectionReason,
};
