//! Progress telemetry shared by the chunked prompt runner and the bulk
//! annotator.
//!
//! Both runs emit one [`ProgressEvent`] per state change and exactly one
//! terminal event with `finished = true`, including on error and
//! cancellation, so a consumer never waits for a report that will not come.

use std::io::Write;
use std::sync::Mutex;

use serde::{Serialize, Serializer};
use tokio::sync::mpsc::UnboundedSender;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProgressReport {
    pub processed: u64,
    pub total: u64,
    pub updated: u64,
    pub ignored: u64,
    pub finished: bool,
}

impl ProgressReport {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            ..Self::default()
        }
    }

    pub fn finish(mut self) -> Self {
        self.finished = true;
        self
    }
}

/// A progress report tagged with the kind of run that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Annotation {
        request_id: Option<u64>,
        report: ProgressReport,
    },
    Prompt(ProgressReport),
}

impl ProgressEvent {
    pub fn report(&self) -> &ProgressReport {
        match self {
            ProgressEvent::Annotation { report, .. } => report,
            ProgressEvent::Prompt(report) => report,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.report().finished
    }
}

#[derive(Serialize)]
struct AnnotationWire {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    total_docs: u64,
    updated_docs: u64,
    ignored_docs: u64,
    finished: bool,
}

#[derive(Serialize)]
struct PromptWire {
    total_messages: u64,
    processed_messages: u64,
    finished: bool,
}

impl Serialize for ProgressEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ProgressEvent::Annotation { request_id, report } => AnnotationWire {
                id: *request_id,
                total_docs: report.total,
                updated_docs: report.updated,
                ignored_docs: report.ignored,
                finished: report.finished,
            }
            .serialize(serializer),
            ProgressEvent::Prompt(report) => PromptWire {
                total_messages: report.total,
                processed_messages: report.processed,
                finished: report.finished,
            }
            .serialize(serializer),
        }
    }
}

/// Receives progress events. Emission must not fail the run, so sinks
/// swallow (and log) their own delivery errors.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

pub struct NullSink;

impl ProgressSink for NullSink {
    fn emit(&self, _event: ProgressEvent) {}
}

/// Collects every event in memory.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn reports(&self) -> Vec<ProgressReport> {
        self.events().iter().map(|event| *event.report()).collect()
    }
}

impl ProgressSink for MemorySink {
    fn emit(&self, event: ProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Forwards events to a task that owns the UI side of the channel.
pub struct ChannelSink {
    tx: UnboundedSender<ProgressEvent>,
}

impl ChannelSink {
    pub fn new(tx: UnboundedSender<ProgressEvent>) -> Self {
        Self { tx }
    }
}

impl ProgressSink for ChannelSink {
    fn emit(&self, event: ProgressEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("progress receiver dropped");
        }
    }
}

pub struct JsonlWriter<W> {
    writer: W,
}

impl<W: Write> JsonlWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn write_record<T: Serialize>(&mut self, record: &T) -> anyhow::Result<()> {
        let mut buf = serde_json::to_vec(record)?;
        buf.push(b'\n');
        self.writer.write_all(&buf)?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// Writes each event as one JSON line, flushed immediately.
pub struct JsonlSink<W> {
    writer: Mutex<JsonlWriter<W>>,
}

impl<W: Write> JsonlSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(JsonlWriter::new(writer)),
        }
    }

    pub fn into_inner(self) -> Option<W> {
        self.writer.into_inner().ok().map(JsonlWriter::into_inner)
    }
}

impl<W: Write + Send> ProgressSink for JsonlSink<W> {
    fn emit(&self, event: ProgressEvent) {
        let Ok(mut writer) = self.writer.lock() else {
            return;
        };
        if let Err(err) = writer.write_record(&event) {
            tracing::warn!("failed to write progress event: {err:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn annotation_event_uses_document_counters() {
        let event = ProgressEvent::Annotation {
            request_id: Some(7),
            report: ProgressReport {
                processed: 3,
                total: 10,
                updated: 2,
                ignored: 1,
                finished: false,
            },
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({"id": 7, "total_docs": 10, "updated_docs": 2, "ignored_docs": 1, "finished": false})
        );
    }

    #[test]
    fn prompt_event_uses_message_counters() {
        let event = ProgressEvent::Prompt(ProgressReport {
            processed: 100,
            total: 250,
            ..ProgressReport::default()
        });
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({"total_messages": 250, "processed_messages": 100, "finished": false})
        );
    }

    #[test]
    fn jsonl_sink_writes_one_line_per_event() {
        let sink = JsonlSink::new(Vec::new());
        sink.emit(ProgressEvent::Prompt(ProgressReport::new(4)));
        sink.emit(ProgressEvent::Prompt(ProgressReport::new(4).finish()));
        let buf = sink.into_inner().unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains("\"finished\":true"));
    }

    #[tokio::test]
    async fn channel_sink_forwards_events() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let sink = ChannelSink::new(tx);
        sink.emit(ProgressEvent::Prompt(ProgressReport::new(1).finish()));
        let event = rx.recv().await.unwrap();
        assert!(event.is_finished());
    }
}
