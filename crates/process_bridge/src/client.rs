//! Сторона вызывающего: LocalEngine, живущий в другом процессе.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use ai_providers::{
    ChatMessage, EngineConfig, EngineError, FragmentSink, LlmChatResult, LocalEngine,
    LocalEngineStatus,
};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::BridgeError;
use crate::host::write_frames;
use crate::protocol::{decode_frame, BridgeEvent, BridgeReply, Frame, Method};

type ReplySender = oneshot::Sender<Result<BridgeReply, EngineError>>;

#[derive(Default)]
struct PendingTable {
    /// Причина закрытия моста. После закрытия новые вызовы сразу падают.
    closed: Option<String>,
    calls: HashMap<u64, ReplySender>,
    streams: HashMap<String, mpsc::UnboundedSender<BridgeEvent>>,
}

#[derive(Default)]
struct Pending {
    table: Mutex<PendingTable>,
}

impl Pending {
    fn lock(&self) -> MutexGuard<'_, PendingTable> {
        self.table.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn closed_error(reason: &str) -> EngineError {
        BridgeError::Closed(reason.to_string()).into()
    }

    /// Закрывает мост: все ожидающие вызовы и стримы получают EngineError::Bridge.
    fn fail_all(&self, reason: &str) {
        let (calls, streams) = {
            let mut table = self.lock();
            if table.closed.is_none() {
                table.closed = Some(reason.to_string());
            }
            (
                std::mem::take(&mut table.calls),
                std::mem::take(&mut table.streams),
            )
        };
        if !calls.is_empty() || !streams.is_empty() {
            warn!(
                reason,
                calls = calls.len(),
                streams = streams.len(),
                "bridge client: failing pending work"
            );
        }
        for (_, reply) in calls {
            let _ = reply.send(Err(Self::closed_error(reason)));
        }
        for (_, events) in streams {
            let _ = events.send(BridgeEvent::Error {
                error: Self::closed_error(reason),
            });
        }
    }

    fn route(&self, frame: Frame) {
        match frame {
            Frame::Reply { call_id, result } => {
                let reply = self.lock().calls.remove(&call_id);
                match reply {
                    Some(reply) => {
                        let _ = reply.send(result);
                    }
                    None => debug!(call_id, "bridge client: reply for unknown call"),
                }
            }
            Frame::Event { request_id, event } => {
                let mut table = self.lock();
                let terminal = event.is_terminal();
                let events = if terminal {
                    table.streams.remove(&request_id)
                } else {
                    table.streams.get(&request_id).cloned()
                };
                drop(table);
                match events {
                    Some(events) => {
                        let _ = events.send(event);
                    }
                    None => debug!(request_id, "bridge client: event for finished request"),
                }
            }
            other => warn!(frame = ?other, "bridge client: unexpected frame from worker"),
        }
    }
}

/// Регистрация стрима: снимается при любом выходе из chat. Если chat уронили
/// до терминального события, воркеру уходит Abort.
struct StreamGuard<'a> {
    client: &'a BridgeClient,
    request_id: String,
    finished: bool,
}

impl Drop for StreamGuard<'_> {
    fn drop(&mut self) {
        // Терминальное событие уже сняло запись в route().
        if self.finished {
            return;
        }
        self.client.pending.lock().streams.remove(&self.request_id);
        self.client.send_frame(Frame::Abort {
            request_id: self.request_id.clone(),
        });
    }
}

pub struct BridgeClient {
    outbound: mpsc::UnboundedSender<Frame>,
    pending: Arc<Pending>,
    next_call: AtomicU64,
}

impl BridgeClient {
    /// Поднимает задачи чтения и записи над парой потоков (stdio дочернего процесса,
    /// duplex в тестах).
    pub fn connect<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let pending = Arc::new(Pending::default());
        let (outbound, rx) = mpsc::unbounded_channel::<Frame>();

        let writer_pending = Arc::clone(&pending);
        tokio::spawn(async move {
            if let Err(e) = write_frames(writer, rx).await {
                writer_pending.fail_all(&e.to_string());
            }
        });

        let reader_pending = Arc::clone(&pending);
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            let reason = loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => match decode_frame(&line) {
                        Ok(frame) => reader_pending.route(frame),
                        Err(e) => warn!(error = %e, "bridge client: dropping malformed frame"),
                    },
                    Ok(None) => break "worker closed the stream".to_string(),
                    Err(e) => break e.to_string(),
                }
            };
            reader_pending.fail_all(&reason);
        });

        Self {
            outbound,
            pending,
            next_call: AtomicU64::new(1),
        }
    }

    /// Закрыт ли мост (EOF или ошибка транспорта).
    pub fn is_closed(&self) -> bool {
        self.pending.lock().closed.is_some()
    }

    fn send_frame(&self, frame: Frame) -> bool {
        self.outbound.send(frame).is_ok()
    }

    async fn call(&self, method: Method) -> Result<BridgeReply, EngineError> {
        let call_id = self.next_call.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut table = self.pending.lock();
            if let Some(ref reason) = table.closed {
                return Err(Pending::closed_error(reason));
            }
            table.calls.insert(call_id, reply_tx);
        }
        if !self.send_frame(Frame::Call { call_id, method }) {
            self.pending.lock().calls.remove(&call_id);
            return Err(Pending::closed_error("writer stopped"));
        }
        reply_rx
            .await
            .map_err(|_| Pending::closed_error("reply dropped"))?
    }
}

#[async_trait]
impl LocalEngine for BridgeClient {
    async fn initialize(&self, config: EngineConfig) -> Result<(), EngineError> {
        match self.call(Method::Initialize { config }).await? {
            BridgeReply::Unit => Ok(()),
            other => Err(EngineError::Bridge(format!("unexpected reply: {other:?}"))),
        }
    }

    async fn chat(
        &self,
        request_id: &str,
        messages: &[ChatMessage],
        on_fragment: FragmentSink<'_>,
        cancel: &CancellationToken,
    ) -> Result<LlmChatResult, EngineError> {
        if cancel.is_cancelled() {
            return Err(EngineError::Aborted);
        }
        let (events_tx, mut events) = mpsc::unbounded_channel();
        {
            let mut table = self.pending.lock();
            if let Some(ref reason) = table.closed {
                return Err(Pending::closed_error(reason));
            }
            if table.streams.contains_key(request_id) {
                return Err(EngineError::DuplicateRequest(request_id.to_string()));
            }
            table.streams.insert(request_id.to_string(), events_tx);
        }
        let mut guard = StreamGuard {
            client: self,
            request_id: request_id.to_string(),
            finished: false,
        };

        let call_id = self.next_call.fetch_add(1, Ordering::Relaxed);
        let sent = self.send_frame(Frame::Call {
            call_id,
            method: Method::Chat {
                request_id: request_id.to_string(),
                messages: messages.to_vec(),
            },
        });
        if !sent {
            guard.finished = true;
            self.pending.lock().streams.remove(request_id);
            return Err(Pending::closed_error("writer stopped"));
        }

        // После отмены ждём терминальное событие воркера: так id освобождается на обеих сторонах.
        let mut abort_sent = false;
        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = cancel.cancelled(), if !abort_sent => {
                    abort_sent = true;
                    debug!(request_id, "bridge client: caller cancelled, sending abort");
                    self.send_frame(Frame::Abort {
                        request_id: request_id.to_string(),
                    });
                    continue;
                }
            };
            let Some(event) = event else {
                break;
            };
            match event {
                BridgeEvent::Chunk { text } => on_fragment(&text),
                BridgeEvent::Done { result } => {
                    guard.finished = true;
                    return Ok(result);
                }
                BridgeEvent::Error { error } => {
                    guard.finished = true;
                    return Err(error);
                }
            }
        }
        guard.finished = true;
        Err(Pending::closed_error("event stream dropped"))
    }

    async fn abort(&self, request_id: &str) {
        // Всегда пишем: воркер сам решит, что id уже неизвестен.
        if !self.send_frame(Frame::Abort {
            request_id: request_id.to_string(),
        }) {
            debug!(request_id, "bridge client: abort not sent, bridge closed");
        }
    }

    async fn unload(&self) {
        if let Err(e) = self.call(Method::Unload).await {
            warn!(error = %e, "bridge client: unload failed");
        }
    }

    async fn status(&self) -> LocalEngineStatus {
        match self.call(Method::Status).await {
            Ok(BridgeReply::Status { status }) => status,
            Ok(other) => {
                warn!(reply = ?other, "bridge client: unexpected status reply");
                LocalEngineStatus::default()
            }
            Err(e) => {
                debug!(error = %e, "bridge client: status unavailable");
                LocalEngineStatus::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::BridgeHost;
    use local_provider::testing::ScriptedRuntime;
    use local_provider::LocalEngineService;
    use std::time::Duration;
    use tokio::io::{duplex, split};

    /// Хост и клиент над in-memory duplex. Возвращает клиент и задачу хоста.
    fn bridge(runtime: ScriptedRuntime) -> (Arc<BridgeClient>, tokio::task::JoinHandle<()>) {
        let (client_io, host_io) = duplex(64 * 1024);
        let (host_read, host_write) = split(host_io);
        let (client_read, client_write) = split(client_io);

        let engine = Arc::new(LocalEngineService::new(Arc::new(runtime)));
        let host = tokio::spawn(async move {
            let _ = BridgeHost::new(engine).serve(host_read, host_write).await;
        });
        (Arc::new(BridgeClient::connect(client_read, client_write)), host)
    }

    fn config() -> EngineConfig {
        EngineConfig::new("/models/tutor-q4.gguf")
    }

    fn no_cancel() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn test_chat_before_initialize_keeps_error_variant() {
        let (client, _host) = bridge(ScriptedRuntime::new(["a"]));
        let mut sink = |_: &str| {};
        let err = client
            .chat("r1", &[ChatMessage::user("hi")], &mut sink, &no_cancel())
            .await
            .expect_err("not initialized");
        assert_eq!(err, EngineError::NotInitialized);
        assert!(!client.status().await.initialized);
    }

    #[tokio::test]
    async fn test_initialize_chat_status_round_trip() {
        let (client, _host) = bridge(ScriptedRuntime::new(["电场", "强度"]).with_backend("CUDA0"));
        client.initialize(config()).await.expect("init");
        assert_eq!(
            client.initialize(config()).await,
            Err(EngineError::AlreadyInitialized)
        );

        let mut out = Vec::new();
        let mut sink = |s: &str| out.push(s.to_string());
        let result = client
            .chat("r1", &[ChatMessage::user("电场强度")], &mut sink, &no_cancel())
            .await
            .expect("chat");
        assert_eq!(out, vec!["电场", "强度"]);
        assert_eq!(result.tokens_generated, 2);

        let status = client.status().await;
        assert!(status.initialized);
        assert_eq!(status.model_name.as_deref(), Some("tutor-q4"));
        assert_eq!(status.backend, ai_providers::EngineBackend::Cuda);

        client.unload().await;
        assert!(!client.status().await.initialized);
    }

    #[tokio::test]
    async fn test_abort_crosses_the_bridge() {
        let fragments: Vec<String> = (0..500).map(|i| format!("t{i}")).collect();
        let (client, _host) =
            bridge(ScriptedRuntime::new(fragments).with_delay(Duration::from_millis(5)));
        client.initialize(config()).await.expect("init");

        let runner = Arc::clone(&client);
        let task = tokio::spawn(async move {
            let mut count = 0usize;
            let mut sink = |_: &str| count += 1;
            let result = runner
                .chat("long", &[ChatMessage::user("essay")], &mut sink, &no_cancel())
                .await;
            (result, count)
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.abort("long").await;

        let (result, count) = task.await.expect("join");
        assert_eq!(result, Err(EngineError::Aborted));
        assert!(count < 500);

        // повторный abort завершённого id безопасен
        client.abort("long").await;
        let mut sink = |_: &str| {};
        client
            .chat("after", &[ChatMessage::user("ok")], &mut sink, &no_cancel())
            .await
            .expect("engine still usable");
    }

    #[tokio::test]
    async fn test_concurrent_streams_are_routed_by_request_id() {
        let runtime = ScriptedRuntime::echo().with_delay(Duration::from_millis(2));
        let (client, _host) = bridge(runtime);
        let mut cfg = config();
        cfg.max_concurrent_generations = Some(2);
        client.initialize(cfg).await.expect("init");

        let a = Arc::clone(&client);
        let b = Arc::clone(&client);
        let (ra, rb) = tokio::join!(
            async move {
                let mut out = String::new();
                let mut sink = |s: &str| out.push_str(s);
                a.chat("a", &[ChatMessage::user("a1 a2 a3")], &mut sink, &no_cancel())
                    .await
                    .map(|_| out)
            },
            async move {
                let mut out = String::new();
                let mut sink = |s: &str| out.push_str(s);
                b.chat("b", &[ChatMessage::user("b1 b2 b3 b4")], &mut sink, &no_cancel())
                    .await
                    .map(|_| out)
            }
        );
        assert_eq!(ra.expect("a"), "a1 a2 a3 ");
        assert_eq!(rb.expect("b"), "b1 b2 b3 b4 ");
    }

    #[tokio::test]
    async fn test_transport_loss_fails_pending_work() {
        let (client_io, host_io) = duplex(1024);
        let (client_read, client_write) = split(client_io);
        let client = BridgeClient::connect(client_read, client_write);

        // Воркер «умирает», не ответив.
        drop(host_io);

        let err = client.initialize(config()).await.expect_err("closed");
        assert!(matches!(err, EngineError::Bridge(_)));
        let mut sink = |_: &str| {};
        let err = client
            .chat("r1", &[ChatMessage::user("hi")], &mut sink, &no_cancel())
            .await
            .expect_err("closed");
        assert!(matches!(err, EngineError::Bridge(_)));
        assert_eq!(client.status().await, LocalEngineStatus::default());
    }

    #[tokio::test]
    async fn test_host_unloads_when_caller_disappears() {
        let runtime = ScriptedRuntime::new(["x"]);
        let (client_io, host_io) = duplex(4096);
        let (host_read, host_write) = split(host_io);
        let (client_read, client_write) = split(client_io);
        let engine = Arc::new(LocalEngineService::new(Arc::new(runtime.clone())));
        let host_engine: Arc<dyn LocalEngine> = engine.clone();
        let host = tokio::spawn(async move {
            BridgeHost::new(host_engine)
                .serve(host_read, host_write)
                .await
        });

        let client = BridgeClient::connect(client_read, client_write);
        client.initialize(config()).await.expect("init");
        assert_eq!(runtime.live_models(), 1);
        drop(client);

        tokio::time::timeout(Duration::from_secs(5), host)
            .await
            .expect("host stops on EOF")
            .expect("join")
            .expect("clean shutdown");
        assert_eq!(runtime.live_models(), 0);
        assert!(!engine.status().await.initialized);
    }

    #[tokio::test]
    async fn test_caller_token_aborts_remote_generation() {
        let fragments: Vec<String> = (0..500).map(|i| format!("t{i}")).collect();
        let (client, _host) =
            bridge(ScriptedRuntime::new(fragments).with_delay(Duration::from_millis(5)));
        client.initialize(config()).await.expect("init");

        let cancel = CancellationToken::new();
        let runner = Arc::clone(&client);
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let mut count = 0usize;
            let mut sink = |_: &str| count += 1;
            let result = runner
                .chat("long", &[ChatMessage::user("essay")], &mut sink, &token)
                .await;
            (result, count)
        });
        tokio::time::sleep(Duration::from_millis(40)).await;
        cancel.cancel();

        let (result, count) = task.await.expect("join");
        assert_eq!(result, Err(EngineError::Aborted));
        assert!(count < 500);

        // id освобождён на обеих сторонах
        let mut sink = |_: &str| {};
        client
            .chat("long", &[ChatMessage::user("ok")], &mut sink, &no_cancel())
            .await
            .expect("same id reusable after abort");
    }

    #[tokio::test]
    async fn test_cancelled_token_never_reaches_worker() {
        let fragments: Vec<String> = (0..200).map(|i| format!("t{i}")).collect();
        let (client, _host) =
            bridge(ScriptedRuntime::new(fragments).with_delay(Duration::from_millis(5)));
        client.initialize(config()).await.expect("init");

        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut count = 0usize;
        let mut sink = |_: &str| count += 1;
        let result = client
            .chat("early", &[ChatMessage::user("essay")], &mut sink, &cancel)
            .await;
        assert_eq!(result, Err(EngineError::Aborted));
        assert_eq!(count, 0);
    }
}
