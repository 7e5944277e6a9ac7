//! Ingestion progress events.
//!
//! Every ingestion or indexing run emits, in order:
//!
//! ```text
//! enqueued{scheduled,total} → accepted{total} → progress{..}* → complete{..} | error{..}
//! ```
//!
//! An unchanged root ends with `skipped{reason}` instead. Each event is
//! wrapped in an [`EventEnvelope`] carrying the run's correlation id and is
//! serialized as one NDJSON line.
//!
//! Events travel over a bounded `tokio::sync::mpsc` channel. The CLI drains
//! it into a reporter on **stderr** so stdout stays parseable for scripts.

use std::io::{IsTerminal, Write};

use rag_harness_core::RagError;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IngestEvent {
    Enqueued { scheduled: u64, total: u64 },
    Accepted { total: u64 },
    Progress { processed: u64, errors: u64, total: u64 },
    Complete { processed: u64, successful: u64, failed: u64 },
    Error { error: String, error_type: String, retryable: bool },
    Skipped { reason: String },
}

impl IngestEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IngestEvent::Complete { .. } | IngestEvent::Error { .. } | IngestEvent::Skipped { .. }
        )
    }

    pub fn from_error(err: &RagError) -> Self {
        let body = err.to_body();
        IngestEvent::Error {
            error: body.error,
            error_type: body.error_type.as_str().to_string(),
            retryable: body.retryable,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub correlation_id: String,
    #[serde(flatten)]
    pub event: IngestEvent,
}

impl EventEnvelope {
    /// One NDJSON line, newline included.
    pub fn to_ndjson(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|e| {
            format!(
                "{{\"correlation_id\":\"{}\",\"type\":\"error\",\"error\":\"unserializable event: {}\",\"error_type\":\"unexpected\",\"retryable\":false}}",
                self.correlation_id, e
            )
        });
        line.push('\n');
        line
    }
}

/// Sending half of an event stream. Cloneable across workers.
#[derive(Debug, Clone)]
pub struct EventSink {
    correlation_id: String,
    tx: mpsc::Sender<EventEnvelope>,
}

impl EventSink {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Send an event. A consumer that went away is not an error for the run.
    pub async fn emit(&self, event: IngestEvent) {
        let envelope = EventEnvelope {
            correlation_id: self.correlation_id.clone(),
            event,
        };
        if self.tx.send(envelope).await.is_err() {
            tracing::debug!(correlation_id = %self.correlation_id, "event consumer dropped");
        }
    }
}

/// Bounded event channel for one run.
pub fn channel(correlation_id: impl Into<String>, buffer: usize) -> (EventSink, mpsc::Receiver<EventEnvelope>) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    (
        EventSink {
            correlation_id: correlation_id.into(),
            tx,
        },
        rx,
    )
}

pub fn new_correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ============ Reporters ============

/// Renders events for a terminal or a log collector.
pub trait EventReporter: Send + Sync {
    fn report(&self, envelope: &EventEnvelope);
}

/// Human-friendly lines on stderr: `index 1f3a…  progress  1,234 / 5,000 items`.
pub struct StderrReporter {
    pub label: String,
}

impl EventReporter for StderrReporter {
    fn report(&self, envelope: &EventEnvelope) {
        let id: String = envelope.correlation_id.chars().take(8).collect();
        let body = match &envelope.event {
            IngestEvent::Enqueued { scheduled, total } => format!(
                "enqueued  {} of {} items",
                format_number(*scheduled),
                format_number(*total)
            ),
            IngestEvent::Accepted { total } => format!("accepted  {} items", format_number(*total)),
            IngestEvent::Progress {
                processed,
                errors,
                total,
            } => {
                let mut s = format!(
                    "progress  {} / {} items",
                    format_number(*processed),
                    format_number(*total)
                );
                if *errors > 0 {
                    s.push_str(&format!(" ({} errors)", format_number(*errors)));
                }
                s
            }
            IngestEvent::Complete {
                processed,
                successful,
                failed,
            } => format!(
                "complete  {} processed, {} ok, {} failed",
                format_number(*processed),
                format_number(*successful),
                format_number(*failed)
            ),
            IngestEvent::Error {
                error, error_type, ..
            } => format!("error  [{}] {}", error_type, error),
            IngestEvent::Skipped { reason } => format!("skipped  {}", reason),
        };
        let line = format!("{} {}  {}\n", self.label, id, body);
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: the NDJSON envelope on stderr.
pub struct JsonReporter;

impl EventReporter for JsonReporter {
    fn report(&self, envelope: &EventEnvelope) {
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(envelope.to_ndjson().as_bytes());
        let _ = stderr.flush();
    }
}

pub struct NoReporter;

impl EventReporter for NoReporter {
    fn report(&self, _envelope: &EventEnvelope) {}
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human progress when stderr is a terminal, otherwise off.
    pub fn default_for_tty() -> Self {
        if std::io::stderr().is_terminal() {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self, label: &str) -> Box<dyn EventReporter> {
        match self {
            ProgressMode::Off => Box::new(NoReporter),
            ProgressMode::Human => Box::new(StderrReporter {
                label: label.to_string(),
            }),
            ProgressMode::Json => Box::new(JsonReporter),
        }
    }
}

/// Drain `rx` into `reporter` and return the terminal event, if any.
pub async fn drain(
    mut rx: mpsc::Receiver<EventEnvelope>,
    reporter: &dyn EventReporter,
) -> Option<IngestEvent> {
    let mut last = None;
    while let Some(envelope) = rx.recv().await {
        reporter.report(&envelope);
        if envelope.event.is_terminal() {
            last = Some(envelope.event);
        }
    }
    last
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn test_envelope_is_flat_ndjson() {
        let env = EventEnvelope {
            correlation_id: "abc".into(),
            event: IngestEvent::Progress {
                processed: 1,
                errors: 0,
                total: 2,
            },
        };
        let line = env.to_ndjson();
        assert!(line.ends_with('\n'));
        let v: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(v["correlation_id"], "abc");
        assert_eq!(v["type"], "progress");
        assert_eq!(v["total"], 2);
    }

    #[test]
    fn test_error_event_carries_taxonomy() {
        let ev = IngestEvent::from_error(&RagError::Timeout("slow".into()));
        match ev {
            IngestEvent::Error {
                error_type,
                retryable,
                ..
            } => {
                assert_eq!(error_type, "timeout");
                assert!(retryable);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(IngestEvent::Skipped { reason: "unchanged".into() }.is_terminal());
        assert!(!IngestEvent::Accepted { total: 1 }.is_terminal());
    }

    #[tokio::test]
    async fn test_drain_returns_terminal() {
        let (sink, rx) = channel("cid", 4);
        let producer = tokio::spawn(async move {
            sink.emit(IngestEvent::Accepted { total: 1 }).await;
            sink.emit(IngestEvent::Complete {
                processed: 1,
                successful: 1,
                failed: 0,
            })
            .await;
        });
        let last = drain(rx, &NoReporter).await;
        producer.await.unwrap();
        assert!(matches!(last, Some(IngestEvent::Complete { successful: 1, .. })));
    }
}
