//! Prometheus counters and sliding-window alerts fed by engine events.

use berth_core::EventSink;
use berth_shared::models::EngineEvent;
use prometheus::{Encoder, IntCounter, Opts, Registry, TextEncoder};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub alert_window: Duration,
    pub signature_alert_threshold: usize,
    pub failure_alert_threshold: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            alert_window: Duration::from_secs(300),
            signature_alert_threshold: 10,
            failure_alert_threshold: 20,
        }
    }
}

/// Timestamps of one kind of event inside the alert window
#[derive(Debug, Default)]
struct Window {
    hits: VecDeque<Instant>,
    last_alert: Option<Instant>,
}

impl Window {
    /// Record a hit and report whether an alert is due. At most one alert per window.
    fn record(&mut self, now: Instant, window: Duration, threshold: usize) -> Option<usize> {
        self.hits.push_back(now);
        while let Some(first) = self.hits.front() {
            if now.duration_since(*first) > window {
                self.hits.pop_front();
            } else {
                break;
            }
        }

        if threshold == 0 || self.hits.len() < threshold {
            return None;
        }
        if let Some(last) = self.last_alert {
            if now.duration_since(last) < window {
                return None;
            }
        }
        self.last_alert = Some(now);
        Some(self.hits.len())
    }
}

struct Counters {
    succeeded: IntCounter,
    failed: IntCounter,
    refunded: IntCounter,
    fraud_suspected: IntCounter,
    webhooks_rejected: IntCounter,
    capacity_conflicts: IntCounter,
    alerts: IntCounter,
}

pub struct PaymentMonitor {
    registry: Registry,
    counters: Counters,
    config: MonitorConfig,
    rejected: Mutex<Window>,
    failures: Mutex<Window>,
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter, prometheus::Error> {
    let c = IntCounter::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(c.clone()))?;
    Ok(c)
}

impl PaymentMonitor {
    pub fn new(config: MonitorConfig) -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let counters = Counters {
            succeeded: counter(&registry, "berth_payments_succeeded_total", "Payments that settled")?,
            failed: counter(&registry, "berth_payments_failed_total", "Payment attempts that failed")?,
            refunded: counter(&registry, "berth_payments_refunded_total", "Refunds recorded")?,
            fraud_suspected: counter(
                &registry,
                "berth_payments_fraud_suspected_total",
                "Disputes opened by providers",
            )?,
            webhooks_rejected: counter(
                &registry,
                "berth_payments_webhooks_rejected_total",
                "Webhooks that failed signature checks",
            )?,
            capacity_conflicts: counter(
                &registry,
                "berth_payments_capacity_conflicts_total",
                "Booking attempts refused for lack of capacity",
            )?,
            alerts: counter(&registry, "berth_payments_alerts_total", "Monitoring alerts raised")?,
        };

        Ok(Self {
            registry,
            counters,
            config,
            rejected: Mutex::new(Window::default()),
            failures: Mutex::new(Window::default()),
        })
    }

    /// Prometheus text exposition of every counter
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    pub fn alerts_raised(&self) -> u64 {
        self.counters.alerts.get()
    }

    fn observe(&self, event: &EngineEvent, now: Instant) {
        match event {
            EngineEvent::PaymentSucceeded(_) => self.counters.succeeded.inc(),
            EngineEvent::PaymentFailed(e) => {
                self.counters.failed.inc();
                self.track(&self.failures, now, self.config.failure_alert_threshold, |n| {
                    tracing::error!(
                        "ALERT: {} payment failures within {:?} (latest: {} via {})",
                        n,
                        self.config.alert_window,
                        e.reason,
                        e.provider
                    )
                });
            }
            EngineEvent::PaymentRefunded(_) => self.counters.refunded.inc(),
            EngineEvent::FraudSuspected(e) => {
                self.counters.fraud_suspected.inc();
                tracing::warn!("Dispute opened at {} for event {}", e.provider, e.external_event_id);
            }
            EngineEvent::WebhookRejected(e) => {
                self.counters.webhooks_rejected.inc();
                self.track(&self.rejected, now, self.config.signature_alert_threshold, |n| {
                    tracing::error!(
                        "ALERT: {} rejected webhooks within {:?} (latest from {})",
                        n,
                        self.config.alert_window,
                        e.provider
                    )
                });
            }
            EngineEvent::CapacityConflict(_) => self.counters.capacity_conflicts.inc(),
        }
    }

    fn track(&self, window: &Mutex<Window>, now: Instant, threshold: usize, alert: impl FnOnce(usize)) {
        let due = match window.lock() {
            Ok(mut w) => w.record(now, self.config.alert_window, threshold),
            Err(poisoned) => poisoned
                .into_inner()
                .record(now, self.config.alert_window, threshold),
        };
        if let Some(n) = due {
            self.counters.alerts.inc();
            alert(n);
        }
    }
}

impl EventSink for PaymentMonitor {
    fn emit(&self, event: EngineEvent) {
        self.observe(&event, Instant::now());
    }
}
