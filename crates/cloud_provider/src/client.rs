//! Стриминговый HTTP-клиент облачного эндпоинта.

use std::sync::Arc;
use std::time::Instant;

use ai_providers::{ChatMessage, CloudBackend, CloudError, FragmentSink, LlmChatResult};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::ACCEPT;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::TokenSource;
use crate::config::CloudConfig;
use crate::decode::{EventStreamDecoder, StreamEvent};

/// Сколько байт тела ошибки сохранять в CloudError.
const ERROR_BODY_LIMIT: usize = 512;

#[derive(Debug, Serialize)]
struct StreamRequest<'a> {
    messages: &'a [ChatMessage],
    stream: bool,
}

pub struct CloudStreamClient {
    config: CloudConfig,
    http_client: reqwest::Client,
    tokens: Arc<dyn TokenSource>,
}

impl CloudStreamClient {
    pub fn new(config: CloudConfig, tokens: Arc<dyn TokenSource>) -> Result<Self, CloudError> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| CloudError::Config(e.to_string()))?;
        Ok(Self {
            config,
            http_client,
            tokens,
        })
    }

    pub fn config(&self) -> &CloudConfig {
        &self.config
    }

    async fn open_stream(
        &self,
        messages: &[ChatMessage],
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, CloudError> {
        let token = self.tokens.bearer_token().await?;

        let mut request = self
            .http_client
            .post(self.config.stream_url())
            .header(ACCEPT, "text/event-stream")
            .json(&StreamRequest {
                messages,
                stream: true,
            });
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        let header_timeout = self.config.response_header_timeout;
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CloudError::Aborted),
            sent = tokio::time::timeout(header_timeout, request.send()) => match sent {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => return Err(CloudError::Network(e.to_string())),
                Err(_) => {
                    return Err(CloudError::Network(format!(
                        "no response headers within {} ms",
                        header_timeout.as_millis()
                    )))
                }
            },
        };

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CloudError::Aborted),
            text = response.text() => text.unwrap_or_default(),
        };
        let body: String = body.chars().take(ERROR_BODY_LIMIT).collect();
        warn!(status = status.as_u16(), "cloud: request rejected");
        Err(CloudError::Request {
            status: status.as_u16(),
            body,
        })
    }
}

/// Что делать после события.
enum Flow {
    Continue,
    Finished,
}

fn apply_event(
    event: StreamEvent,
    on_fragment: &mut (dyn FnMut(&str) + Send),
    fragments: &mut u32,
    cancel: &CancellationToken,
) -> Result<Flow, CloudError> {
    match event {
        StreamEvent::Fragment(text) => {
            if cancel.is_cancelled() {
                return Err(CloudError::Aborted);
            }
            on_fragment(&text);
            *fragments += 1;
            Ok(Flow::Continue)
        }
        StreamEvent::Done => Ok(Flow::Finished),
        StreamEvent::Error(message) => Err(CloudError::Stream(message)),
        StreamEvent::Skip(line) => {
            debug!(line = %line, "cloud: skipping malformed stream line");
            Ok(Flow::Continue)
        }
    }
}

#[async_trait]
impl CloudBackend for CloudStreamClient {
    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        on_fragment: FragmentSink<'_>,
        cancel: &CancellationToken,
    ) -> Result<LlmChatResult, CloudError> {
        let start = Instant::now();
        let response = self.open_stream(messages, cancel).await?;

        // Выход из функции роняет стрим, а с ним и соединение.
        let mut body = response.bytes_stream();
        let mut decoder = EventStreamDecoder::new();
        let mut fragments: u32 = 0;

        'read: loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CloudError::Aborted),
                next = body.next() => next,
            };
            match next {
                Some(Ok(bytes)) => {
                    for event in decoder.push(&bytes) {
                        if let Flow::Finished =
                            apply_event(event, &mut *on_fragment, &mut fragments, cancel)?
                        {
                            break 'read;
                        }
                    }
                }
                Some(Err(e)) => return Err(CloudError::Network(e.to_string())),
                None => {
                    if let Some(event) = decoder.finish() {
                        apply_event(event, &mut *on_fragment, &mut fragments, cancel)?;
                    }
                    debug!(fragments, "cloud: stream closed without [DONE]");
                    break;
                }
            }
        }

        let result = LlmChatResult {
            latency_ms: start.elapsed().as_millis() as u64,
            tokens_generated: fragments,
        };
        info!(latency_ms = result.latency_ms, fragments, "cloud: stream complete");
        Ok(result)
    }
}
