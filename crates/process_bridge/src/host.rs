//! Сторона воркера: читает кадры, вызывает движок, пишет ответы и события.
//!
//! Один писатель на поток: все кадры идут через канал в одну задачу, поэтому
//! события одного request_id не перемешиваются и не теряют порядок.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use ai_providers::LocalEngine;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::BridgeError;
use crate::protocol::{decode_frame, encode_frame, BridgeEvent, BridgeReply, Frame, Method};

/// request_id → токен отмены chat на стороне воркера. Запись появляется в цикле
/// чтения до запуска задачи, поэтому Abort следом за Call её всегда находит.
#[derive(Default)]
struct RequestTokens {
    table: Mutex<HashMap<String, (u64, CancellationToken)>>,
    serial: AtomicU64,
}

impl RequestTokens {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, (u64, CancellationToken)>> {
        self.table.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn open(self: &Arc<Self>, request_id: &str) -> RequestTokenGuard {
        let serial = self.serial.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let mut table = self.lock();
        // Живой дубль движок отклонит сам; чужую запись не трогаем.
        if !table.contains_key(request_id) {
            table.insert(request_id.to_string(), (serial, token.clone()));
        }
        RequestTokenGuard {
            tokens: Arc::clone(self),
            request_id: request_id.to_string(),
            serial,
            token,
        }
    }

    fn cancel(&self, request_id: &str) -> bool {
        let removed = self.lock().remove(request_id);
        match removed {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

struct RequestTokenGuard {
    tokens: Arc<RequestTokens>,
    request_id: String,
    serial: u64,
    token: CancellationToken,
}

impl Drop for RequestTokenGuard {
    fn drop(&mut self) {
        let mut table = self.tokens.lock();
        if matches!(table.get(&self.request_id), Some((serial, _)) if *serial == self.serial) {
            table.remove(&self.request_id);
        }
    }
}

pub struct BridgeHost {
    engine: Arc<dyn LocalEngine>,
}

impl BridgeHost {
    pub fn new(engine: Arc<dyn LocalEngine>) -> Self {
        Self { engine }
    }

    /// Обслуживает поток до EOF. При потере вызывающего движок выгружается,
    /// все незавершённые генерации прерываются.
    pub async fn serve<R, W>(&self, reader: R, writer: W) -> Result<(), BridgeError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel::<Frame>();
        let writer_task = tokio::spawn(write_frames(writer, rx));
        let tokens = Arc::new(RequestTokens::default());
        let mut calls = JoinSet::new();
        let mut lines = BufReader::new(reader).lines();

        let read_result = loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break Ok(()),
                Err(e) => break Err(BridgeError::Io(e)),
            };
            if line.trim().is_empty() {
                continue;
            }
            let frame = match decode_frame(&line) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "bridge host: dropping malformed frame");
                    continue;
                }
            };
            match frame {
                Frame::Call { call_id, method } => {
                    debug!(call_id, method = method.name(), "bridge host: call");
                    let request = match method {
                        Method::Chat { ref request_id, .. } => Some(tokens.open(request_id)),
                        _ => None,
                    };
                    let engine = Arc::clone(&self.engine);
                    let tx = tx.clone();
                    calls.spawn(async move { dispatch(engine, call_id, method, request, tx).await });
                }
                Frame::Abort { request_id } => {
                    if !tokens.cancel(&request_id) {
                        debug!(request_id, "bridge host: abort for finished request");
                    }
                }
                other => {
                    warn!(frame = ?other, "bridge host: unexpected frame from caller");
                }
            }
            // Собираем завершённые вызовы, чтобы JoinSet не рос.
            while calls.try_join_next().is_some() {}
        };

        info!("bridge host: caller gone, unloading engine");
        self.engine.unload().await;
        while calls.join_next().await.is_some() {}
        drop(tx);
        match writer_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "bridge host: writer stopped"),
            Err(e) => warn!(error = %e, "bridge host: writer task failed"),
        }
        read_result
    }
}

async fn dispatch(
    engine: Arc<dyn LocalEngine>,
    call_id: u64,
    method: Method,
    request: Option<RequestTokenGuard>,
    tx: mpsc::UnboundedSender<Frame>,
) {
    let reply = match method {
        Method::Initialize { config } => engine.initialize(config).await.map(|()| BridgeReply::Unit),
        Method::Unload => {
            engine.unload().await;
            Ok(BridgeReply::Unit)
        }
        Method::Status => Ok(BridgeReply::Status {
            status: engine.status().await,
        }),
        Method::Chat {
            request_id,
            messages,
        } => {
            let cancel = request
                .as_ref()
                .map(|guard| guard.token.clone())
                .unwrap_or_default();
            let events = tx.clone();
            let id = request_id.clone();
            let mut sink = move |piece: &str| {
                let _ = events.send(Frame::Event {
                    request_id: id.clone(),
                    event: BridgeEvent::Chunk {
                        text: piece.to_string(),
                    },
                });
            };
            let event = match engine.chat(&request_id, &messages, &mut sink, &cancel).await {
                Ok(result) => BridgeEvent::Done { result },
                Err(error) => BridgeEvent::Error { error },
            };
            drop(request);
            let _ = tx.send(Frame::Event { request_id, event });
            return;
        }
    };
    let _ = tx.send(Frame::Reply {
        call_id,
        result: reply,
    });
}

pub(crate) async fn write_frames<W>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<Frame>,
) -> Result<(), BridgeError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        let line = match encode_frame(&frame) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "bridge: frame not serializable");
                continue;
            }
        };
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
    }
    let _ = writer.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ai_providers::{ChatMessage, EngineConfig, EngineError};
    use local_provider::testing::ScriptedRuntime;
    use local_provider::LocalEngineService;
    use std::time::Duration;
    use tokio::io::{duplex, split, DuplexStream, Lines, ReadHalf, WriteHalf};

    struct Caller {
        writer: WriteHalf<DuplexStream>,
        lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    }

    impl Caller {
        async fn send(&mut self, frames: &[Frame]) {
            let mut batch = String::new();
            for frame in frames {
                batch.push_str(&encode_frame(frame).expect("encode"));
            }
            // Одна запись: хост видит кадры подряд в одном буфере.
            self.writer.write_all(batch.as_bytes()).await.expect("write");
        }

        async fn next(&mut self) -> Frame {
            let line = tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
                .await
                .expect("frame in time")
                .expect("read")
                .expect("host open");
            decode_frame(&line).expect("decode")
        }
    }

    async fn ready_host(runtime: ScriptedRuntime) -> Caller {
        let (caller_io, host_io) = duplex(256 * 1024);
        let (host_read, host_write) = split(host_io);
        let engine = Arc::new(LocalEngineService::new(Arc::new(runtime)));
        tokio::spawn(async move {
            let _ = BridgeHost::new(engine).serve(host_read, host_write).await;
        });
        let (read, writer) = split(caller_io);
        let mut caller = Caller {
            writer,
            lines: BufReader::new(read).lines(),
        };
        caller
            .send(&[Frame::Call {
                call_id: 1,
                method: Method::Initialize {
                    config: EngineConfig::new("/models/tutor-q4.gguf"),
                },
            }])
            .await;
        match caller.next().await {
            Frame::Reply { call_id: 1, result } => assert_eq!(result, Ok(BridgeReply::Unit)),
            other => panic!("unexpected frame: {other:?}"),
        }
        caller
    }

    fn chat_call(call_id: u64, request_id: &str) -> Frame {
        Frame::Call {
            call_id,
            method: Method::Chat {
                request_id: request_id.to_string(),
                messages: vec![ChatMessage::user("write an essay")],
            },
        }
    }

    /// Читает события request_id до терминального. Возвращает (число чанков, терминал).
    async fn drain(caller: &mut Caller, request_id: &str) -> (usize, BridgeEvent) {
        let mut chunks = 0;
        loop {
            match caller.next().await {
                Frame::Event { request_id: id, event } if id == request_id => {
                    if event.is_terminal() {
                        return (chunks, event);
                    }
                    chunks += 1;
                }
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn test_abort_right_behind_chat_call_is_not_lost() {
        let fragments: Vec<String> = (0..200).map(|i| format!("t{i}")).collect();
        let mut caller =
            ready_host(ScriptedRuntime::new(fragments).with_delay(Duration::from_millis(5))).await;

        caller
            .send(&[
                chat_call(2, "r"),
                Frame::Abort {
                    request_id: "r".into(),
                },
            ])
            .await;
        let (chunks, terminal) = drain(&mut caller, "r").await;
        assert_eq!(
            terminal,
            BridgeEvent::Error {
                error: EngineError::Aborted
            }
        );
        assert!(chunks < 200, "generation ran to the end: {chunks} chunks");
    }

    #[tokio::test]
    async fn test_abort_of_finished_request_does_not_touch_next_one() {
        let mut caller = ready_host(ScriptedRuntime::new(["a", "b"])).await;

        caller.send(&[chat_call(2, "r")]).await;
        let (chunks, terminal) = drain(&mut caller, "r").await;
        assert_eq!(chunks, 2);
        assert!(matches!(terminal, BridgeEvent::Done { .. }));

        // Запоздалый abort старого id, затем новый запрос с тем же id.
        caller
            .send(&[
                Frame::Abort {
                    request_id: "r".into(),
                },
                chat_call(3, "r"),
            ])
            .await;
        let (chunks, terminal) = drain(&mut caller, "r").await;
        assert_eq!(chunks, 2);
        assert!(matches!(terminal, BridgeEvent::Done { .. }));
    }
}
