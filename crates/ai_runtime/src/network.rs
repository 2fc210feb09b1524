//! Проверка доступности облака перед выбором источника.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::RouterError;

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(1500);

#[async_trait]
pub trait NetworkProbe: Send + Sync {
    async fn is_reachable(&self) -> bool;
}

/// TCP-connect к хосту облачного эндпоинта с таймаутом.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    target: String,
    timeout: Duration,
}

impl TcpProbe {
    /// `target`: `host:port`.
    pub fn new(target: impl Into<String>, timeout: Duration) -> Self {
        Self {
            target: target.into(),
            timeout,
        }
    }

    /// Хост и порт из base URL (порт по схеме, если не указан).
    pub fn from_url(url: &str, timeout: Duration) -> Result<Self, RouterError> {
        let parsed = Url::parse(url).map_err(|e| RouterError::InvalidUrl(format!("{url}: {e}")))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| RouterError::InvalidUrl(format!("{url}: no host")))?;
        let port = parsed
            .port_or_known_default()
            .ok_or_else(|| RouterError::InvalidUrl(format!("{url}: no port")))?;
        let target = if host.contains(':') && !host.starts_with('[') {
            format!("[{host}]:{port}")
        } else {
            format!("{host}:{port}")
        };
        Ok(Self::new(target, timeout))
    }

    pub fn target(&self) -> &str {
        &self.target
    }
}

#[async_trait]
impl NetworkProbe for TcpProbe {
    async fn is_reachable(&self) -> bool {
        match tokio::time::timeout(self.timeout, TcpStream::connect(&self.target)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!(target = %self.target, error = %e, "network probe: unreachable");
                false
            }
            Err(_) => {
                debug!(target = %self.target, "network probe: timed out");
                false
            }
        }
    }
}

/// Фиксированный ответ (тесты, принудительный офлайн-режим).
#[derive(Debug)]
pub struct StaticProbe {
    online: AtomicBool,
}

impl StaticProbe {
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
        }
    }

    pub fn set(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

#[async_trait]
impl NetworkProbe for StaticProbe {
    async fn is_reachable(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}
