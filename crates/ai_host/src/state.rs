//! Состояние приложения: облачный клиент, локальный движок, маршрутизатор.
//!
//! Всё собирается один раз и раздаётся через Arc; глобального состояния нет.

use std::process::Stdio;
use std::sync::Arc;

use ai_providers::{CloudBackend, LocalEngine};
use ai_runtime::{ComplexityEstimator, InferenceRouter, NetworkProbe, TcpProbe};
use cloud_provider::{CloudStreamClient, StaticToken};
use process_bridge::BridgeClient;
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::ai_config::{AiConfig, LocalMode};
use crate::logs::decision_logger;

pub struct AppState {
    pub config: AiConfig,
    pub router: Arc<InferenceRouter>,
    pub local: Option<Arc<dyn LocalEngine>>,
    pub tokens: Arc<StaticToken>,
    /// Дочерний процесс воркера (LocalMode::Worker). Убивается при drop.
    worker: Option<Child>,
}

impl AppState {
    /// Production-сборка по конфигу. Воркер, если нужен, стартует здесь.
    pub async fn new(config: AiConfig) -> Result<Self, String> {
        let tokens = Arc::new(StaticToken::new(config.token.clone()));
        let cloud = CloudStreamClient::new(config.cloud.clone(), tokens.clone())
            .map_err(|e| e.to_string())?;
        let network = TcpProbe::from_url(&config.cloud.base_url, config.probe_timeout())
            .map_err(|e| e.to_string())?;

        let (local, worker) = match config.local.mode {
            LocalMode::Disabled => (None, None),
            LocalMode::InProcess => (native_engine()?, None),
            LocalMode::Worker => {
                let (client, child) = spawn_worker()?;
                (Some(client), Some(child))
            }
        };

        let mut state =
            Self::with_backends(config, Arc::new(cloud), local, Arc::new(network), tokens);
        state.worker = worker;

        if state.config.local.autoload {
            state.autoload().await;
        }
        Ok(state)
    }

    /// Сборка с готовыми бэкендами (тесты, встраивание).
    pub fn with_backends(
        config: AiConfig,
        cloud: Arc<dyn CloudBackend>,
        local: Option<Arc<dyn LocalEngine>>,
        network: Arc<dyn NetworkProbe>,
        tokens: Arc<StaticToken>,
    ) -> Self {
        let router = InferenceRouter::new(cloud, local.clone(), network)
            .with_estimator(ComplexityEstimator::new(config.estimator.clone()))
            .with_decision_hook(decision_logger(config.log_dir()));
        Self {
            config,
            router: Arc::new(router),
            local,
            tokens,
            worker: None,
        }
    }

    pub fn has_worker(&self) -> bool {
        self.worker.is_some()
    }

    async fn autoload(&self) {
        let Some(ref local) = self.local else {
            return;
        };
        let Some(engine_config) = self.config.resolve_engine_config() else {
            warn!("autoload: no model configured");
            return;
        };
        match local.initialize(engine_config).await {
            Ok(()) => info!("autoload: local engine ready"),
            Err(e) => warn!(error = %e, "autoload: local engine failed to start"),
        }
    }
}

/// In-process движок llama.cpp.
#[cfg(feature = "local")]
pub fn native_engine() -> Result<Option<Arc<dyn LocalEngine>>, String> {
    use local_provider::{LlamaRuntime, LocalEngineService};

    let runtime = LlamaRuntime::new().map_err(|e| e.to_string())?;
    Ok(Some(Arc::new(LocalEngineService::new(Arc::new(runtime)))))
}

#[cfg(not(feature = "local"))]
pub fn native_engine() -> Result<Option<Arc<dyn LocalEngine>>, String> {
    warn!("built without the `local` feature: on-device engine disabled");
    Ok(None)
}

/// Запускает `<этот бинарь> worker` и подключает ProcessBridge к его stdio.
fn spawn_worker() -> Result<(Arc<dyn LocalEngine>, Child), String> {
    let exe = std::env::current_exe().map_err(|e| e.to_string())?;
    let mut child = Command::new(exe)
        .arg("worker")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("failed to start engine worker: {e}"))?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| "worker stdin unavailable".to_string())?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| "worker stdout unavailable".to_string())?;
    info!(pid = ?child.id(), "engine worker started");
    Ok((Arc::new(BridgeClient::connect(stdout, stdin)), child))
}
