//! InferenceRouter: выбор источника, запуск бэкенда, единый поток чанков, отмена.
//!
//! metadata → content* → done | error. Отмена: без терминального чанка.

use std::sync::{Arc, Mutex, MutexGuard};

use ai_providers::{
    CloudBackend, InferenceChunk, InferenceRequest, InferenceSource, LlmChatResult, LocalEngine,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::complexity::{ComplexityEstimator, ComplexityResult};
use crate::error::RouterError;
use crate::network::NetworkProbe;

/// Эмиттер чанков вызывающему (UI, CLI, тест).
pub type ChunkEmitter = Arc<dyn Fn(&InferenceChunk) + Send + Sync>;

/// Наблюдатель решений маршрутизации (файловый лог в ai_host).
pub type DecisionHook = Arc<dyn Fn(&RouteDecision) + Send + Sync>;

/// Почему выбран источник.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionReason {
    Forced,
    Offline,
    LocalUnavailable,
    Suggested,
}

impl SelectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionReason::Forced => "forced",
            SelectionReason::Offline => "offline",
            SelectionReason::LocalUnavailable => "local_unavailable",
            SelectionReason::Suggested => "suggested",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteDecision {
    pub request_id: String,
    /// Исполняемый источник: local или cloud.
    pub source: InferenceSource,
    pub reason: SelectionReason,
    /// Нет при принудительном источнике.
    pub complexity: Option<ComplexityResult>,
}

/// Терминальное состояние chat, то же, что видно по чанкам.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatOutcome {
    Completed {
        source: InferenceSource,
        result: LlmChatResult,
    },
    Failed(String),
    Aborted,
}

struct ActiveRequest {
    request_id: String,
    token: CancellationToken,
}

type ActiveSlot = Arc<Mutex<Option<ActiveRequest>>>;

fn lock_slot(slot: &ActiveSlot) -> MutexGuard<'_, Option<ActiveRequest>> {
    slot.lock().unwrap_or_else(|p| p.into_inner())
}

/// Снимает активный запрос на любом выходе, но только свой: более новый не трогает.
struct ActiveGuard {
    slot: ActiveSlot,
    request_id: String,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let mut slot = lock_slot(&self.slot);
        if slot
            .as_ref()
            .is_some_and(|active| active.request_id == self.request_id)
        {
            *slot = None;
        }
    }
}

pub struct InferenceRouter {
    cloud: Arc<dyn CloudBackend>,
    local: Option<Arc<dyn LocalEngine>>,
    network: Arc<dyn NetworkProbe>,
    estimator: ComplexityEstimator,
    active: ActiveSlot,
    decision_hook: Option<DecisionHook>,
}

impl InferenceRouter {
    pub fn new(
        cloud: Arc<dyn CloudBackend>,
        local: Option<Arc<dyn LocalEngine>>,
        network: Arc<dyn NetworkProbe>,
    ) -> Self {
        Self {
            cloud,
            local,
            network,
            estimator: ComplexityEstimator::default(),
            active: Arc::new(Mutex::new(None)),
            decision_hook: None,
        }
    }

    pub fn with_estimator(mut self, estimator: ComplexityEstimator) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn with_decision_hook(mut self, hook: DecisionHook) -> Self {
        self.decision_hook = Some(hook);
        self
    }

    pub fn estimator(&self) -> &ComplexityEstimator {
        &self.estimator
    }

    /// id запроса, который сейчас обслуживается.
    pub fn active_request_id(&self) -> Option<String> {
        lock_slot(&self.active)
            .as_ref()
            .map(|active| active.request_id.clone())
    }

    /// Отменяет текущий запрос. Без активного запроса: no-op.
    pub fn abort(&self) {
        let active = lock_slot(&self.active).take();
        if let Some(active) = active {
            debug!(request_id = %active.request_id, "router: abort");
            active.token.cancel();
        }
    }

    pub async fn chat(&self, request: InferenceRequest, on_chunk: ChunkEmitter) -> ChatOutcome {
        self.chat_with_cancel(request, on_chunk, CancellationToken::new())
            .await
    }

    /// То же, что chat, плюс внешний токен отмены вызывающего.
    pub async fn chat_with_cancel(
        &self,
        request: InferenceRequest,
        on_chunk: ChunkEmitter,
        cancel: CancellationToken,
    ) -> ChatOutcome {
        let request_id = Uuid::new_v4().to_string();
        let token = cancel.child_token();
        let previous = lock_slot(&self.active).replace(ActiveRequest {
            request_id: request_id.clone(),
            token: token.clone(),
        });
        if let Some(previous) = previous {
            info!(request_id = %previous.request_id, "router: superseded by a new request");
            previous.token.cancel();
        }
        let _guard = ActiveGuard {
            slot: Arc::clone(&self.active),
            request_id: request_id.clone(),
        };

        let decision = self.select(&request_id, &request).await;
        info!(
            request_id = %request_id,
            source = decision.source.as_str(),
            reason = decision.reason.as_str(),
            score = decision.complexity.as_ref().map(|c| c.score),
            "router: source selected"
        );
        if let Some(ref hook) = self.decision_hook {
            hook(&decision);
        }

        if token.is_cancelled() {
            return ChatOutcome::Aborted;
        }
        let source = decision.source;
        on_chunk(&InferenceChunk::Metadata {
            source,
            latency_ms: None,
            tokens_generated: None,
        });

        let mut sink = |text: &str| {
            // После отмены фрагменты бэкенда не доходят до вызывающего.
            if !token.is_cancelled() {
                on_chunk(&InferenceChunk::Content {
                    text: text.to_string(),
                });
            }
        };
        let result = match source {
            InferenceSource::Local => {
                self.run_local(&request_id, &request, &mut sink, &token)
                    .await
            }
            _ => self
                .cloud
                .stream_chat(&request.messages, &mut sink, &token)
                .await
                .map_err(RouterError::from),
        };

        match result {
            _ if token.is_cancelled() => {
                debug!(request_id = %request_id, "router: aborted");
                ChatOutcome::Aborted
            }
            Ok(result) => {
                info!(
                    request_id = %request_id,
                    source = source.as_str(),
                    latency_ms = result.latency_ms,
                    tokens = result.tokens_generated,
                    "router: done"
                );
                on_chunk(&InferenceChunk::Done {
                    source,
                    latency_ms: result.latency_ms,
                    tokens_generated: result.tokens_generated,
                });
                ChatOutcome::Completed { source, result }
            }
            Err(e) if e.is_aborted() => ChatOutcome::Aborted,
            Err(e) => {
                let message = e.to_string();
                warn!(request_id = %request_id, source = source.as_str(), error = %message, "router: failed");
                on_chunk(&InferenceChunk::Error {
                    message: message.clone(),
                });
                ChatOutcome::Failed(message)
            }
        }
    }

    /// Выбор источника: forced → нет local → offline → рекомендация оценщика.
    /// hybrid всегда исполняется как cloud.
    pub async fn select(&self, request_id: &str, request: &InferenceRequest) -> RouteDecision {
        let decide = |source: InferenceSource,
                      reason: SelectionReason,
                      complexity: Option<ComplexityResult>| RouteDecision {
            request_id: request_id.to_string(),
            source: source.executable(),
            reason,
            complexity,
        };

        if let Some(forced) = request.force_source {
            return decide(forced, SelectionReason::Forced, None);
        }

        let complexity = self.estimator.estimate(request);
        let local_ready = match self.local {
            Some(ref local) => local.is_ready().await,
            None => false,
        };
        if !local_ready {
            return decide(
                InferenceSource::Cloud,
                SelectionReason::LocalUnavailable,
                Some(complexity),
            );
        }
        if !self.network.is_reachable().await {
            return decide(InferenceSource::Local, SelectionReason::Offline, Some(complexity));
        }
        let suggested = complexity.suggested_source;
        decide(suggested, SelectionReason::Suggested, Some(complexity))
    }

    async fn run_local(
        &self,
        request_id: &str,
        request: &InferenceRequest,
        sink: &mut (dyn FnMut(&str) + Send),
        token: &CancellationToken,
    ) -> Result<LlmChatResult, RouterError> {
        let local = self.local.as_ref().ok_or(RouterError::LocalUnavailable)?;
        // Токен уходит в движок до первого poll: отмена не может обогнать регистрацию.
        local
            .chat(request_id, &request.messages, sink, token)
            .await
            .map_err(RouterError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::StaticProbe;
    use ai_providers::{ChatMessage, CloudError, EngineConfig, FragmentSink};
    use async_trait::async_trait;
    use local_provider::testing::ScriptedRuntime;
    use local_provider::LocalEngineService;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Облако из заданных фрагментов; честно слушает токен отмены.
    struct FakeCloud {
        fragments: Vec<String>,
        delay: Duration,
        error: Option<CloudError>,
        calls: AtomicUsize,
    }

    impl FakeCloud {
        fn new(fragments: &[&str]) -> Self {
            Self {
                fragments: fragments.iter().map(|f| f.to_string()).collect(),
                delay: Duration::ZERO,
                error: None,
                calls: AtomicUsize::new(0),
            }
        }

        fn slow(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn failing(mut self, error: CloudError) -> Self {
            self.error = Some(error);
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CloudBackend for FakeCloud {
        async fn stream_chat(
            &self,
            _messages: &[ChatMessage],
            on_fragment: FragmentSink<'_>,
            cancel: &CancellationToken,
        ) -> Result<LlmChatResult, CloudError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(ref error) = self.error {
                return Err(error.clone());
            }
            for fragment in &self.fragments {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(CloudError::Aborted),
                    _ = tokio::time::sleep(self.delay) => {}
                }
                on_fragment(fragment);
            }
            Ok(LlmChatResult {
                latency_ms: 1,
                tokens_generated: self.fragments.len() as u32,
            })
        }
    }

    type Chunks = Arc<Mutex<Vec<InferenceChunk>>>;

    fn collector() -> (ChunkEmitter, Chunks) {
        let chunks: Chunks = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&chunks);
        let emitter: ChunkEmitter = Arc::new(move |chunk: &InferenceChunk| {
            sink.lock().expect("chunks").push(chunk.clone());
        });
        (emitter, chunks)
    }

    fn taken(chunks: &Chunks) -> Vec<InferenceChunk> {
        chunks.lock().expect("chunks").clone()
    }

    fn assert_protocol(chunks: &[InferenceChunk]) {
        assert!(
            matches!(chunks.first(), Some(InferenceChunk::Metadata { .. })),
            "metadata first: {chunks:?}"
        );
        let terminals = chunks.iter().filter(|c| c.is_terminal()).count();
        assert!(terminals <= 1, "at most one terminal: {chunks:?}");
        if let Some(pos) = chunks.iter().position(|c| c.is_terminal()) {
            assert_eq!(pos, chunks.len() - 1, "nothing after terminal: {chunks:?}");
        }
    }

    fn content(chunks: &[InferenceChunk]) -> String {
        chunks
            .iter()
            .filter_map(|c| match c {
                InferenceChunk::Content { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    async fn ready_local(runtime: ScriptedRuntime) -> Arc<LocalEngineService> {
        let engine = Arc::new(LocalEngineService::new(Arc::new(runtime)));
        engine
            .initialize(EngineConfig::new("/models/tutor.gguf"))
            .await
            .expect("init");
        engine
    }

    fn ask(text: &str) -> InferenceRequest {
        InferenceRequest::new(vec![ChatMessage::user(text)])
    }

    #[tokio::test]
    async fn test_local_unavailable_routes_to_cloud() {
        let cloud = Arc::new(FakeCloud::new(&["Gauss", "'s law"]));
        let router = InferenceRouter::new(cloud.clone(), None, Arc::new(StaticProbe::new(true)));
        let (emit, chunks) = collector();

        let outcome = router.chat(ask("什么是高斯定律？"), emit).await;
        let chunks = taken(&chunks);

        assert_protocol(&chunks);
        assert_eq!(
            chunks[0],
            InferenceChunk::Metadata {
                source: InferenceSource::Cloud,
                latency_ms: None,
                tokens_generated: None
            }
        );
        assert_eq!(content(&chunks), "Gauss's law");
        assert!(matches!(
            chunks.last(),
            Some(InferenceChunk::Done { source: InferenceSource::Cloud, tokens_generated: 2, .. })
        ));
        assert!(matches!(outcome, ChatOutcome::Completed { source: InferenceSource::Cloud, .. }));
        assert_eq!(router.active_request_id(), None);
    }

    #[tokio::test]
    async fn test_simple_question_with_local_ready_runs_local() {
        let cloud = Arc::new(FakeCloud::new(&["cloud"]));
        let local = ready_local(ScriptedRuntime::new(["高斯", "定律"])).await;
        let router =
            InferenceRouter::new(cloud.clone(), Some(local), Arc::new(StaticProbe::new(true)));
        let (emit, chunks) = collector();

        router.chat(ask("什么是高斯定律？"), emit).await;
        let chunks = taken(&chunks);
        assert_protocol(&chunks);
        assert!(matches!(
            chunks[0],
            InferenceChunk::Metadata { source: InferenceSource::Local, .. }
        ));
        assert_eq!(content(&chunks), "高斯定律");
        assert_eq!(cloud.calls(), 0);
    }

    #[tokio::test]
    async fn test_complex_request_with_both_available_goes_cloud() {
        let cloud = Arc::new(FakeCloud::new(&["analysis"]));
        let local = ready_local(ScriptedRuntime::new(["local"])).await;
        let router =
            InferenceRouter::new(cloud.clone(), Some(local), Arc::new(StaticProbe::new(true)));
        let (emit, chunks) = collector();

        let request = ask("请分析这篇文章的写作风格，并给出改进建议").with_course("writing-201");
        router.chat(request, emit).await;
        assert_eq!(content(&taken(&chunks)), "analysis");
        assert_eq!(cloud.calls(), 1);
    }

    #[tokio::test]
    async fn test_hybrid_suggestion_executes_on_cloud() {
        let cloud = Arc::new(FakeCloud::new(&["c"]));
        let local = ready_local(ScriptedRuntime::new(["l"])).await;
        let router = InferenceRouter::new(cloud, Some(local), Arc::new(StaticProbe::new(true)));

        let request = ask("Tell me about the history of electromagnetism in Europe")
            .with_knowledge_base(true)
            .with_course("physics-101");
        let decision = router.select("r", &request).await;
        assert_eq!(
            decision.complexity.as_ref().map(|c| c.suggested_source),
            Some(InferenceSource::Hybrid)
        );
        assert_eq!(decision.source, InferenceSource::Cloud);
        assert_eq!(decision.reason, SelectionReason::Suggested);

        let forced = router
            .select("r", &ask("hi").with_forced_source(InferenceSource::Hybrid))
            .await;
        assert_eq!(forced.source, InferenceSource::Cloud);
        assert_eq!(forced.reason, SelectionReason::Forced);
    }

    #[tokio::test]
    async fn test_offline_with_local_ready_runs_local_even_for_complex() {
        let cloud = Arc::new(FakeCloud::new(&["never"]));
        let local = ready_local(ScriptedRuntime::new(["offline answer"])).await;
        let router =
            InferenceRouter::new(cloud.clone(), Some(local), Arc::new(StaticProbe::new(false)));
        let (emit, chunks) = collector();

        let request = ask("请分析这篇文章的写作风格，并给出改进建议").with_course("c");
        router.chat(request, emit).await;
        assert_eq!(content(&taken(&chunks)), "offline answer");
        assert_eq!(cloud.calls(), 0);
    }

    #[tokio::test]
    async fn test_privacy_keyword_stays_local() {
        let cloud = Arc::new(FakeCloud::new(&["never"]));
        let local = ready_local(ScriptedRuntime::new(["ok"])).await;
        let router =
            InferenceRouter::new(cloud.clone(), Some(local), Arc::new(StaticProbe::new(true)));
        let (emit, _chunks) = collector();

        let request = ask(&format!("请详细分析我的期末成绩。{}", "背景".repeat(120)))
            .with_course("c")
            .with_knowledge_base(true);
        let outcome = router.chat(request, emit).await;
        assert!(matches!(outcome, ChatOutcome::Completed { source: InferenceSource::Local, .. }));
        assert_eq!(cloud.calls(), 0);
    }

    #[tokio::test]
    async fn test_forced_cloud_offline_surfaces_error_chunk() {
        let cloud = Arc::new(
            FakeCloud::new(&[]).failing(CloudError::Network("connection refused".into())),
        );
        let local = ready_local(ScriptedRuntime::new(["local"])).await;
        let router =
            InferenceRouter::new(cloud.clone(), Some(local), Arc::new(StaticProbe::new(false)));
        let (emit, chunks) = collector();

        let outcome = router
            .chat(ask("hi").with_forced_source(InferenceSource::Cloud), emit)
            .await;
        let chunks = taken(&chunks);
        assert_protocol(&chunks);
        assert_eq!(chunks.len(), 2);
        assert!(matches!(
            chunks[0],
            InferenceChunk::Metadata { source: InferenceSource::Cloud, .. }
        ));
        assert!(
            matches!(chunks[1], InferenceChunk::Error { ref message } if message.contains("connection refused"))
        );
        assert!(matches!(outcome, ChatOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn test_forced_local_not_initialized_is_error_chunk() {
        let cloud = Arc::new(FakeCloud::new(&["c"]));
        let engine = Arc::new(LocalEngineService::new(Arc::new(ScriptedRuntime::new(["x"]))));
        let router =
            InferenceRouter::new(cloud.clone(), Some(engine), Arc::new(StaticProbe::new(true)));
        let (emit, chunks) = collector();

        let outcome = router
            .chat(ask("hi").with_forced_source(InferenceSource::Local), emit)
            .await;
        let chunks = taken(&chunks);
        assert_protocol(&chunks);
        assert!(matches!(
            chunks.last(),
            Some(InferenceChunk::Error { message }) if message.contains("not initialized")
        ));
        assert!(matches!(outcome, ChatOutcome::Failed(_)));
        assert_eq!(cloud.calls(), 0);
    }

    #[tokio::test]
    async fn test_forced_local_without_engine_is_error_chunk() {
        let router = InferenceRouter::new(
            Arc::new(FakeCloud::new(&["c"])),
            None,
            Arc::new(StaticProbe::new(true)),
        );
        let (emit, chunks) = collector();
        router
            .chat(ask("hi").with_forced_source(InferenceSource::Local), emit)
            .await;
        assert!(matches!(
            taken(&chunks).last(),
            Some(InferenceChunk::Error { message }) if message == "local engine is not available"
        ));
    }

    #[tokio::test]
    async fn test_abort_cloud_is_silent() {
        let fragments: Vec<String> = (0..100).map(|i| format!("f{i} ")).collect();
        let refs: Vec<&str> = fragments.iter().map(String::as_str).collect();
        let cloud = Arc::new(FakeCloud::new(&refs).slow(Duration::from_millis(5)));
        let router = Arc::new(InferenceRouter::new(
            cloud,
            None,
            Arc::new(StaticProbe::new(true)),
        ));
        let (emit, chunks) = collector();

        let runner = Arc::clone(&router);
        let task = tokio::spawn(async move { runner.chat(ask("write an essay"), emit).await });
        tokio::time::sleep(Duration::from_millis(40)).await;
        router.abort();
        let outcome = task.await.expect("join");

        assert_eq!(outcome, ChatOutcome::Aborted);
        let seen = taken(&chunks);
        assert_protocol(&seen);
        assert!(seen.iter().all(|c| !c.is_terminal()));
        assert!(seen.len() < 101);

        // после отмены ничего не дописывается
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(taken(&chunks).len(), seen.len());
        assert_eq!(router.active_request_id(), None);
    }

    #[tokio::test]
    async fn test_abort_local_releases_engine_token() {
        let fragments: Vec<String> = (0..300).map(|i| format!("t{i}")).collect();
        let local = ready_local(
            ScriptedRuntime::new(fragments).with_delay(Duration::from_millis(5)),
        )
        .await;
        let router = Arc::new(InferenceRouter::new(
            Arc::new(FakeCloud::new(&[])),
            Some(local.clone()),
            Arc::new(StaticProbe::new(false)),
        ));
        let (emit, chunks) = collector();

        let runner = Arc::clone(&router);
        let task = tokio::spawn(async move { runner.chat(ask("hello"), emit).await });
        tokio::time::sleep(Duration::from_millis(40)).await;
        router.abort();

        assert_eq!(task.await.expect("join"), ChatOutcome::Aborted);
        assert!(taken(&chunks).iter().all(|c| !c.is_terminal()));
        assert_eq!(local.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_abort_before_local_generation_starts_is_honoured() {
        let fragments: Vec<String> = (0..100).map(|i| format!("t{i}")).collect();
        let local = ready_local(
            ScriptedRuntime::new(fragments).with_delay(Duration::from_millis(5)),
        )
        .await;
        let router = Arc::new(InferenceRouter::new(
            Arc::new(FakeCloud::new(&[])),
            Some(local.clone()),
            Arc::new(StaticProbe::new(false)),
        ));

        for _ in 0..10 {
            // abort из колбэка metadata: движок ещё не видел request_id
            let chunks: Chunks = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&chunks);
            let aborter = Arc::clone(&router);
            let emit: ChunkEmitter = Arc::new(move |chunk: &InferenceChunk| {
                sink.lock().expect("chunks").push(chunk.clone());
                if matches!(chunk, InferenceChunk::Metadata { .. }) {
                    aborter.abort();
                }
            });

            let started = std::time::Instant::now();
            let outcome = router.chat(ask("hello"), emit).await;
            assert_eq!(outcome, ChatOutcome::Aborted);
            assert!(
                started.elapsed() < Duration::from_millis(250),
                "generation was not stopped: {:?}",
                started.elapsed()
            );
            let seen = taken(&chunks);
            assert_eq!(seen.len(), 1, "only metadata expected: {seen:?}");
            assert_eq!(local.in_flight(), 0);
            assert_eq!(router.active_request_id(), None);
        }
    }

    #[tokio::test]
    async fn test_external_cancellation_is_silent() {
        let cloud = Arc::new(FakeCloud::new(&["a", "b", "c", "d"]).slow(Duration::from_millis(20)));
        let router = InferenceRouter::new(cloud, None, Arc::new(StaticProbe::new(true)));
        let (emit, chunks) = collector();
        let cancel = CancellationToken::new();
        let timer = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            timer.cancel();
        });

        let outcome = router.chat_with_cancel(ask("hi"), emit, cancel).await;
        assert_eq!(outcome, ChatOutcome::Aborted);
        assert!(taken(&chunks).iter().all(|c| !c.is_terminal()));
    }

    #[tokio::test]
    async fn test_abort_without_active_request_is_noop() {
        let router = InferenceRouter::new(
            Arc::new(FakeCloud::new(&["x"])),
            None,
            Arc::new(StaticProbe::new(true)),
        );
        router.abort();
        let (emit, chunks) = collector();
        let outcome = router.chat(ask("hi"), emit).await;
        assert!(matches!(outcome, ChatOutcome::Completed { .. }));
        // запоздалый abort не влияет на следующий запрос
        router.abort();
        let (emit, chunks_two) = collector();
        router.chat(ask("again"), emit).await;
        assert!(matches!(taken(&chunks).last(), Some(InferenceChunk::Done { .. })));
        assert!(matches!(taken(&chunks_two).last(), Some(InferenceChunk::Done { .. })));
    }

    #[tokio::test]
    async fn test_new_chat_supersedes_previous() {
        let cloud = Arc::new(FakeCloud::new(&["a", "b", "c", "d", "e"]).slow(Duration::from_millis(20)));
        let router = Arc::new(InferenceRouter::new(
            cloud,
            None,
            Arc::new(StaticProbe::new(true)),
        ));
        let (first_emit, first_chunks) = collector();
        let runner = Arc::clone(&router);
        let first = tokio::spawn(async move { runner.chat(ask("first"), first_emit).await });
        tokio::time::sleep(Duration::from_millis(30)).await;

        let (second_emit, second_chunks) = collector();
        let second = router.chat(ask("second"), second_emit).await;

        assert_eq!(first.await.expect("join"), ChatOutcome::Aborted);
        assert!(taken(&first_chunks).iter().all(|c| !c.is_terminal()));
        assert!(matches!(second, ChatOutcome::Completed { .. }));
        assert_eq!(content(&taken(&second_chunks)), "abcde");
        assert_eq!(router.active_request_id(), None);
    }

    #[tokio::test]
    async fn test_decision_hook_sees_every_request() {
        let seen: Arc<Mutex<Vec<RouteDecision>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let router = InferenceRouter::new(
            Arc::new(FakeCloud::new(&["x"])),
            None,
            Arc::new(StaticProbe::new(true)),
        )
        .with_decision_hook(Arc::new(move |d: &RouteDecision| {
            sink.lock().expect("decisions").push(d.clone());
        }));
        let (emit, _) = collector();
        router.chat(ask("什么是电场？"), emit).await;

        let decisions = seen.lock().expect("decisions").clone();
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].reason, SelectionReason::LocalUnavailable);
        assert_eq!(decisions[0].source, InferenceSource::Cloud);
        assert!(decisions[0].complexity.is_some());
    }
}
