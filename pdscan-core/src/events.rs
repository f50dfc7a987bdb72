//! Scan lifecycle events.
//!
//! The orchestrator reports progress as [`ScanEvent`]s to a [`ScanEventSink`].
//! Sinks never influence the scan: emission is synchronous, infallible from
//! the caller's point of view, and must not block.

use crate::error::ErrorKind;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Standard event names, matching the serialized `event` tag.
pub mod event_names {
    pub const SCAN_STARTED: &str = "scan_started";
    pub const UNIT_COMPLETED: &str = "unit_completed";
    pub const UNIT_FAILED: &str = "unit_failed";
    pub const SCAN_COMPLETED: &str = "scan_completed";
    pub const SCAN_FAILED: &str = "scan_failed";
}

/// One lifecycle event of a scan invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ScanEvent {
    ScanStarted {
        scan_id: Uuid,
        source: String,
        units: usize,
    },
    UnitCompleted {
        scan_id: Uuid,
        unit: String,
        matches: usize,
        records_sampled: u64,
    },
    UnitFailed {
        scan_id: Uuid,
        unit: String,
        error_kind: ErrorKind,
        message: String,
    },
    ScanCompleted {
        scan_id: Uuid,
        matches: usize,
        units_scanned: usize,
        units_failed: usize,
        cancelled: bool,
    },
    ScanFailed {
        scan_id: Uuid,
        error_kind: ErrorKind,
        message: String,
    },
}

impl ScanEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ScanStarted { .. } => event_names::SCAN_STARTED,
            Self::UnitCompleted { .. } => event_names::UNIT_COMPLETED,
            Self::UnitFailed { .. } => event_names::UNIT_FAILED,
            Self::ScanCompleted { .. } => event_names::SCAN_COMPLETED,
            Self::ScanFailed { .. } => event_names::SCAN_FAILED,
        }
    }

    pub fn scan_id(&self) -> Uuid {
        match self {
            Self::ScanStarted { scan_id, .. }
            | Self::UnitCompleted { scan_id, .. }
            | Self::UnitFailed { scan_id, .. }
            | Self::ScanCompleted { scan_id, .. }
            | Self::ScanFailed { scan_id, .. } => *scan_id,
        }
    }

    /// Serialize as a single JSON line.
    pub fn to_jsonl(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{{\"event\":\"{}\"}}", self.name()))
    }
}

/// Receiver of scan lifecycle events.
pub trait ScanEventSink: Send + Sync {
    fn emit(&self, event: ScanEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl ScanEventSink for NoopSink {
    fn emit(&self, _event: ScanEvent) {}
}

/// Writes events as structured log records.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ScanEventSink for TracingSink {
    fn emit(&self, event: ScanEvent) {
        match &event {
            ScanEvent::ScanStarted {
                scan_id,
                source,
                units,
            } => tracing::info!(%scan_id, %source, units, "Scan started"),
            ScanEvent::UnitCompleted {
                scan_id,
                unit,
                matches,
                records_sampled,
            } => tracing::debug!(%scan_id, %unit, matches, records_sampled, "Unit completed"),
            ScanEvent::UnitFailed {
                scan_id,
                unit,
                error_kind,
                message,
            } => tracing::warn!(%scan_id, %unit, %error_kind, %message, "Unit failed"),
            ScanEvent::ScanCompleted {
                scan_id,
                matches,
                units_scanned,
                units_failed,
                cancelled,
            } => tracing::info!(
                %scan_id,
                matches,
                units_scanned,
                units_failed,
                cancelled,
                "Scan completed"
            ),
            ScanEvent::ScanFailed {
                scan_id,
                error_kind,
                message,
            } => tracing::error!(%scan_id, %error_kind, %message, "Scan failed"),
        }
    }
}

/// In-process fan-out to any number of subscribers.
///
/// Subscribers whose receiver was dropped are pruned on the next emit.
#[derive(Debug, Default)]
pub struct EventBus {
    senders: Mutex<Vec<mpsc::UnboundedSender<ScanEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to receive scan events.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ScanEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        match self.senders.lock() {
            Ok(mut senders) => senders.push(tx),
            Err(poisoned) => poisoned.into_inner().push(tx),
        }
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        match self.senders.lock() {
            Ok(senders) => senders.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: ScanEvent) {
        let mut senders = match self.senders.lock() {
            Ok(senders) => senders,
            Err(poisoned) => poisoned.into_inner(),
        };
        senders.retain(|sender| sender.send(event.clone()).is_ok());
    }
}

impl ScanEventSink for EventBus {
    fn emit(&self, event: ScanEvent) {
        EventBus::emit(self, event);
    }
}

/// JSONL writer for scan events (CLI-friendly).
pub struct JsonlSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonlSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

impl<W: Write + Send> ScanEventSink for JsonlSink<W> {
    fn emit(&self, event: ScanEvent) {
        let line = event.to_jsonl();
        if let Ok(mut writer) = self.writer.lock() {
            let _ = writeln!(writer, "{}", line);
        }
    }
}

/// Forwards events to several sinks in order.
pub struct FanoutSink {
    sinks: Vec<Arc<dyn ScanEventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn ScanEventSink>>) -> Self {
        Self { sinks }
    }
}

impl ScanEventSink for FanoutSink {
    fn emit(&self, event: ScanEvent) {
        for sink in &self.sinks {
            sink.emit(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Capture {
        events: Mutex<Vec<ScanEvent>>,
    }

    impl Capture {
        fn new() -> Self {
            Self {
                events: Mutex::new(Vec::new()),
            }
        }
    }

    impl ScanEventSink for Capture {
        fn emit(&self, event: ScanEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    fn started(scan_id: Uuid) -> ScanEvent {
        ScanEvent::ScanStarted {
            scan_id,
            source: "sqlite://app.db".to_string(),
            units: 3,
        }
    }

    #[test]
    fn test_event_tag_names() {
        let scan_id = Uuid::new_v4();
        let json = serde_json::to_value(started(scan_id)).unwrap();
        assert_eq!(json["event"], "scan_started");
        assert_eq!(json["units"], 3);

        let failed = ScanEvent::UnitFailed {
            scan_id,
            unit: "orders".to_string(),
            error_kind: ErrorKind::Timeout,
            message: "timed out".to_string(),
        };
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["event"], event_names::UNIT_FAILED);
        assert_eq!(json["error_kind"], "Timeout");
        assert_eq!(failed.name(), "unit_failed");
        assert_eq!(failed.scan_id(), scan_id);
    }

    #[test]
    fn test_jsonl_is_single_line() {
        let line = started(Uuid::new_v4()).to_jsonl();
        assert!(!line.contains('\n'));
        let back: ScanEvent = serde_json::from_str(&line).unwrap();
        assert_eq!(back.name(), "scan_started");
    }

    #[test]
    fn test_event_bus_fans_out_and_prunes() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let second = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        drop(second);
        bus.emit(started(Uuid::new_v4()));

        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(first.try_recv().unwrap().name(), "scan_started");
        assert!(first.try_recv().is_err());
    }

    #[test]
    fn test_fanout_sink_forwards_to_all() {
        let a = Arc::new(Capture::new());
        let b = Arc::new(Capture::new());
        let fanout = FanoutSink::new(vec![a.clone(), b.clone(), Arc::new(NoopSink)]);

        fanout.emit(started(Uuid::new_v4()));

        assert_eq!(a.events.lock().unwrap().len(), 1);
        assert_eq!(b.events.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_jsonl_sink_writes_lines() {
        let sink = JsonlSink::new(Vec::new());
        sink.emit(started(Uuid::new_v4()));
        sink.emit(ScanEvent::ScanFailed {
            scan_id: Uuid::new_v4(),
            error_kind: ErrorKind::ConnectionError,
            message: "refused".to_string(),
        });

        let buf = sink.writer.into_inner().unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains("\"event\":\"scan_failed\""));
    }
}
