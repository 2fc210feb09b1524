//! Декодер event-stream: одна JSON-строка `data: {...}` на событие, `data: [DONE]` в конце.
//!
//! Байты копятся до перевода строки, поэтому UTF-8 символ, разрезанный между
//! сетевыми чанками, декодируется целиком.

use serde::Deserialize;

const DONE_SENTINEL: &str = "[DONE]";

/// Предел незавершённой строки. Длиннее: строка выбрасывается до следующего `\n`.
pub const MAX_LINE_BYTES: usize = 1 << 20;

/// Разобранная строка потока.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Очередной фрагмент текста (`choices[0].delta.content`).
    Fragment(String),
    /// `data: [DONE]`.
    Done,
    /// `data: {"error": "..."}`: шлюз сообщает об обрыве апстрима.
    Error(String),
    /// Битая строка: пропускается, стрим продолжается.
    Skip(String),
}

#[derive(Debug, Deserialize)]
struct EventPayload {
    #[serde(default)]
    choices: Vec<EventChoice>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct EventChoice {
    #[serde(default)]
    delta: Option<EventDelta>,
}

#[derive(Debug, Deserialize)]
struct EventDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Построчный декодер с буфером незавершённой строки.
#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    buffer: Vec<u8>,
    /// Хвост переполненной строки ещё не дошёл до перевода строки.
    discarding: bool,
}

impl EventStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Добавляет байты и возвращает события всех завершённых строк.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        let mut bytes = bytes;
        if self.discarding {
            match bytes.iter().position(|b| *b == b'\n') {
                Some(pos) => {
                    bytes = &bytes[pos + 1..];
                    self.discarding = false;
                }
                None => return events,
            }
        }
        self.buffer.extend_from_slice(bytes);
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(event) = decode_line(&line) {
                events.push(event);
            }
        }
        if self.buffer.len() > MAX_LINE_BYTES {
            events.push(StreamEvent::Skip(format!(
                "line longer than {MAX_LINE_BYTES} bytes dropped"
            )));
            self.buffer = Vec::new();
            self.discarding = true;
        }
        events
    }

    /// Хвост без завершающего перевода строки (соединение закрыто).
    pub fn finish(&mut self) -> Option<StreamEvent> {
        self.discarding = false;
        if self.buffer.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.buffer);
        decode_line(&line)
    }
}

/// Разбор одной строки. Пустые строки, комментарии (`:`) и прочие SSE-поля: None.
pub fn decode_line(raw: &[u8]) -> Option<StreamEvent> {
    let line = match std::str::from_utf8(raw) {
        Ok(s) => s,
        Err(_) => return Some(StreamEvent::Skip(String::from_utf8_lossy(raw).into_owned())),
    };
    let line = line.trim_end_matches(['\n', '\r']);
    if line.trim().is_empty() || line.starts_with(':') {
        return None;
    }

    let payload = if let Some(rest) = line.strip_prefix("data:") {
        rest.trim()
    } else if line.trim_start().starts_with('{') {
        line.trim()
    } else {
        // event:, id:, retry:: не несут контента.
        return None;
    };

    if payload == DONE_SENTINEL {
        return Some(StreamEvent::Done);
    }

    let parsed: EventPayload = match serde_json::from_str(payload) {
        Ok(p) => p,
        Err(_) => return Some(StreamEvent::Skip(line.to_string())),
    };

    if let Some(error) = parsed.error.filter(|e| !e.is_null()) {
        let message = match error {
            serde_json::Value::String(s) => s,
            serde_json::Value::Object(ref obj) => obj
                .get("message")
                .and_then(|m| m.as_str())
                .map(String::from)
                .unwrap_or_else(|| error.to_string()),
            other => other.to_string(),
        };
        return Some(StreamEvent::Error(message));
    }

    parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta)
        .and_then(|d| d.content)
        .filter(|c| !c.is_empty())
        .map(StreamEvent::Fragment)
}
