//! Emfield AI host. Сборка маршрутизатора инференса: конфиг, логи, команды.

pub mod ai_config;
pub mod commands;
pub mod logs;
pub mod state;

pub use state::AppState;
