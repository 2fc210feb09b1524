//! Файловый лог решений маршрутизации: ~/.emfield/logs/router.log.

use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};
use std::thread;

use ai_runtime::{DecisionHook, RouteDecision};

use crate::ai_config::config_dir;

pub const ROUTER_LOG: &str = "router.log";

pub fn logs_dir() -> PathBuf {
    config_dir().join("logs")
}

/// Записывает строку в файл лога (append). Ошибки записи не мешают чату.
pub fn append_log_in(dir: &Path, filename: &str, line: &str) {
    if std::fs::create_dir_all(dir).is_err() {
        return;
    }
    let path = dir.join(filename);
    let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
    let full_line = format!("[{}] {}\n", timestamp, line);
    let _ = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .and_then(|mut f| std::io::Write::write_all(&mut f, full_line.as_bytes()));
}

pub fn format_decision(decision: &RouteDecision) -> String {
    let mut line = format!(
        "route request={} source={} reason={}",
        decision.request_id,
        decision.source.as_str(),
        decision.reason.as_str()
    );
    if let Some(ref complexity) = decision.complexity {
        line.push_str(&format!(
            " score={:.2} suggested={} factors=[{}]",
            complexity.score,
            complexity.suggested_source.as_str(),
            complexity.factors.join(", ")
        ));
    }
    line
}

/// Хук маршрутизатора: по строке в router.log на каждое решение.
///
/// Хук только кладёт строку в канал, файл пишет отдельный поток в порядке
/// решений. Поток завершается, когда роутер отпускает хук.
pub fn decision_logger(dir: PathBuf) -> DecisionHook {
    let (tx, rx) = mpsc::channel::<String>();
    let spawned = thread::Builder::new()
        .name("router-log".into())
        .spawn(move || {
            for line in rx {
                append_log_in(&dir, ROUTER_LOG, &line);
            }
        });
    if let Err(e) = spawned {
        tracing::warn!(error = %e, "router log: writer thread not started, decisions go unlogged");
    }
    Arc::new(move |decision: &RouteDecision| {
        let _ = tx.send(format_decision(decision));
    })
}
