//! Telemetry event emission
//!
//! The runtime emits structured events at decision points (dead-lettered
//! jobs, guardrail blocks, budget denials). Sinks are pluggable; the tracing
//! sink ships by default and a JSONL file sink supports test assertions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A structured telemetry event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub kind: String,
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl TelemetryEvent {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            at: Utc::now(),
            fields: serde_json::Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }
}

/// Event sink capability.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: TelemetryEvent);
}

/// Default sink: structured tracing output.
pub struct TracingSink;

#[async_trait]
impl EventSink for TracingSink {
    async fn emit(&self, event: TelemetryEvent) {
        tracing::info!(
            kind = %event.kind,
            fields = %serde_json::Value::Object(event.fields.clone()),
            "telemetry event"
        );
    }
}

/// JSONL file sink, one event per line. Used by tests and local debugging.
pub struct JsonlSink {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl JsonlSink {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: tokio::sync::Mutex::new(()),
        }
    }
}

#[async_trait]
impl EventSink for JsonlSink {
    async fn emit(&self, event: TelemetryEvent) {
        let Ok(line) = serde_json::to_string(&event) else {
            return;
        };
        let _guard = self.lock.lock().await;
        if let Ok(mut file) = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
        {
            use tokio::io::AsyncWriteExt;
            let _ = file.write_all(format!("{line}\n").as_bytes()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn jsonl_sink_appends_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let sink = JsonlSink::new(path.clone());

        sink.emit(TelemetryEvent::new("job_dead_lettered").with("job_type", "embed"))
            .await;
        sink.emit(TelemetryEvent::new("guardrail_blocked")).await;

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: TelemetryEvent = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.kind, "job_dead_lettered");
        assert_eq!(first.fields["job_type"], "embed");
    }
}
