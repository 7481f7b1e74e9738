//! Evidence Recorder boundary.
//!
//! The engine emits [`EvidenceEvent`]s fire-and-forget. Recorders must not
//! block, and the engine never reads anything back from them.

use crate::snapshot::PageSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Step lifecycle event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepEvent {
    /// Step began
    StepStarted,
    /// Step finished successfully
    StepSucceeded,
    /// Step failed
    StepFailed,
}

/// One structured event for later reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceEvent {
    /// When the event happened
    pub timestamp: DateTime<Utc>,
    /// Workflow the step belongs to
    pub workflow_name: String,
    /// Step position, outermost first
    pub step_index: Vec<usize>,
    /// Event kind
    pub event: StepEvent,
    /// Step label
    pub description: String,
    /// Reference to a snapshot handed to [`EvidenceRecorder::record_snapshot`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_ref: Option<String>,
}

impl EvidenceEvent {
    /// Create an event stamped now
    #[must_use]
    pub fn new(
        workflow_name: impl Into<String>,
        step_index: Vec<usize>,
        event: StepEvent,
        description: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            workflow_name: workflow_name.into(),
            step_index,
            event,
            description: description.into(),
            snapshot_ref: None,
        }
    }

    /// Attach a snapshot reference
    #[must_use]
    pub fn with_snapshot_ref(mut self, snapshot_ref: impl Into<String>) -> Self {
        self.snapshot_ref = Some(snapshot_ref.into());
        self
    }
}

/// Receives evidence. Implementations must return promptly.
pub trait EvidenceRecorder: Send + Sync {
    /// Record a step event
    fn record(&self, event: EvidenceEvent);

    /// Keep a page snapshot under `snapshot_ref`
    fn record_snapshot(&self, snapshot_ref: &str, snapshot: &PageSnapshot) {
        let _ = (snapshot_ref, snapshot);
    }
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullRecorder;

impl EvidenceRecorder for NullRecorder {
    fn record(&self, _event: EvidenceEvent) {}
}

/// Keeps everything in memory (tests, small runs)
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    events: Mutex<Vec<EvidenceEvent>>,
    snapshots: Mutex<Vec<(String, PageSnapshot)>>,
}

impl MemoryRecorder {
    /// Create an empty recorder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded events
    #[must_use]
    pub fn events(&self) -> Vec<EvidenceEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Recorded snapshots with their references
    #[must_use]
    pub fn snapshots(&self) -> Vec<(String, PageSnapshot)> {
        self.snapshots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Events of one kind
    #[must_use]
    pub fn count(&self, kind: StepEvent) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.event == kind)
            .count()
    }
}

impl EvidenceRecorder for MemoryRecorder {
    fn record(&self, event: EvidenceEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    fn record_snapshot(&self, snapshot_ref: &str, snapshot: &PageSnapshot) {
        self.snapshots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((snapshot_ref.to_string(), snapshot.clone()));
    }
}

/// Message sent by [`ChannelRecorder`]
#[derive(Debug, Clone)]
pub enum EvidenceMessage {
    /// Step event
    Event(EvidenceEvent),
    /// Snapshot with its reference
    Snapshot(String, Box<PageSnapshot>),
}

/// Forwards evidence to a consumer task over an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelRecorder {
    tx: mpsc::UnboundedSender<EvidenceMessage>,
}

impl ChannelRecorder {
    /// Create a recorder and the receiving end
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EvidenceMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EvidenceRecorder for ChannelRecorder {
    fn record(&self, event: EvidenceEvent) {
        // A closed receiver means nobody is collecting; evidence is best-effort
        if self.tx.send(EvidenceMessage::Event(event)).is_err() {
            warn!("evidence receiver dropped; event discarded");
        }
    }

    fn record_snapshot(&self, snapshot_ref: &str, snapshot: &PageSnapshot) {
        let message = EvidenceMessage::Snapshot(snapshot_ref.to_string(), Box::new(snapshot.clone()));
        if self.tx.send(message).is_err() {
            warn!("evidence receiver dropped; snapshot discarded");
        }
    }
}

/// Emits evidence as `tracing` events
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingRecorder;

impl EvidenceRecorder for TracingRecorder {
    fn record(&self, event: EvidenceEvent) {
        let step = event
            .step_index
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(".");
        info!(
            target: "flowguard::evidence",
            workflow = %event.workflow_name,
            step = %step,
            event = ?event.event,
            snapshot_ref = event.snapshot_ref.as_deref().unwrap_or(""),
            "{}",
            event.description
        );
    }

    fn record_snapshot(&self, snapshot_ref: &str, snapshot: &PageSnapshot) {
        info!(
            target: "flowguard::evidence",
            snapshot_ref,
            url = %snapshot.url,
            nodes = snapshot.nodes.len(),
            "snapshot captured"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(step: usize) -> EvidenceEvent {
        EvidenceEvent::new("create contact", vec![step], StepEvent::StepStarted, "click")
    }

    #[test]
    fn test_memory_recorder() {
        let recorder = MemoryRecorder::new();
        recorder.record(started(0));
        recorder.record(EvidenceEvent::new("w", vec![0], StepEvent::StepFailed, "x").with_snapshot_ref("s1"));
        recorder.record_snapshot("s1", &PageSnapshot::new("https://app.test/"));
        assert_eq!(recorder.events().len(), 2);
        assert_eq!(recorder.count(StepEvent::StepFailed), 1);
        assert_eq!(recorder.snapshots()[0].0, "s1");
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_value(started(2)).unwrap();
        assert_eq!(json["event"], "step_started");
        assert_eq!(json["step_index"], serde_json::json!([2]));
        assert!(json.get("snapshot_ref").is_none());
    }

    #[tokio::test]
    async fn test_channel_recorder_delivers() {
        let (recorder, mut rx) = ChannelRecorder::new();
        recorder.record(started(1));
        match rx.recv().await {
            Some(EvidenceMessage::Event(e)) => assert_eq!(e.step_index, vec![1]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_channel_recorder_never_blocks_without_receiver() {
        let (recorder, rx) = ChannelRecorder::new();
        drop(rx);
        recorder.record(started(0));
        recorder.record_snapshot("s", &PageSnapshot::new("u"));
    }

    #[test]
    fn test_tracing_recorder_accepts_events() {
        TracingRecorder.record(started(0));
        NullRecorder.record(started(0));
    }
}
