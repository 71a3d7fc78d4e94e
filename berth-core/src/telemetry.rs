use berth_shared::models::EngineEvent;
use std::sync::{Arc, Mutex};

/// Receives engine events after each state transition.
///
/// Implementations must not block and must never fail the caller: the payment path
/// does not depend on metrics being recorded.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: EngineEvent);
}

/// Drops every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: EngineEvent) {}
}

/// Forwards each event to every inner sink
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: EngineEvent) {
        for sink in &self.sinks {
            sink.emit(event.clone());
        }
    }
}

/// Keeps events in memory; used by tests and local tooling
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<EngineEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn count(&self, name: &str) -> usize {
        self.events().iter().filter(|e| e.name() == name).count()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: EngineEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_shared::models::events::WebhookRejectedEvent;

    fn rejected() -> EngineEvent {
        EngineEvent::WebhookRejected(WebhookRejectedEvent {
            provider: "REGIONAL".to_string(),
            reason: "Signature does not match payload".to_string(),
            timestamp: 0,
        })
    }

    #[test]
    fn test_fanout_reaches_every_sink() {
        let first = Arc::new(MemorySink::new());
        let second = Arc::new(MemorySink::new());
        let fanout = FanoutSink::new(vec![first.clone(), second.clone()]);

        fanout.emit(rejected());

        assert_eq!(first.count("WEBHOOK_REJECTED"), 1);
        assert_eq!(second.count("WEBHOOK_REJECTED"), 1);
    }

    #[test]
    fn test_noop_accepts_events() {
        NoopSink.emit(rejected());
    }
}
