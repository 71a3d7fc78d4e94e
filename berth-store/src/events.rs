use berth_core::EventSink;
use berth_shared::models::EngineEvent;
use rdkafka::config::ClientConfig;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::time::Duration;
use tracing::{debug, error, warn};

pub const PAYMENTS_TOPIC: &str = "payments.events";

/// Thin wrapper over an idempotent rdkafka producer
#[derive(Clone)]
pub struct EventProducer {
    producer: FutureProducer,
}

impl EventProducer {
    pub fn new(brokers: &str) -> Result<Self, KafkaError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("enable.idempotence", "true")
            .set("message.timeout.ms", "5000")
            .create()?;

        Ok(Self { producer })
    }

    /// Send one record; resolves once the broker acknowledges it.
    pub async fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(i32, i64), KafkaError> {
        let record = FutureRecord::to(topic).key(key).payload(payload);
        self.producer
            .send(record, Timeout::After(Duration::from_secs(0)))
            .await
            .map(|delivery| (delivery.partition, delivery.offset))
            .map_err(|(e, _)| e)
    }
}

/// Publishes engine events as JSON keyed by booking. Delivery runs on a spawned task so
/// `emit` never waits on the broker.
#[derive(Clone)]
pub struct KafkaEventSink {
    producer: EventProducer,
    topic: String,
}

impl KafkaEventSink {
    pub fn new(producer: EventProducer) -> Self {
        Self::with_topic(producer, PAYMENTS_TOPIC)
    }

    pub fn with_topic(producer: EventProducer, topic: &str) -> Self {
        Self {
            producer,
            topic: topic.to_string(),
        }
    }
}

impl EventSink for KafkaEventSink {
    fn emit(&self, event: EngineEvent) {
        let payload = match serde_json::to_vec(&event) {
            Ok(p) => p,
            Err(e) => {
                error!("Failed to serialize {} event: {}", event.name(), e);
                return;
            }
        };

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime available, dropping {} event", event.name());
            return;
        };

        let producer = self.producer.clone();
        let topic = self.topic.clone();
        let key = event.key();
        let name = event.name();
        runtime.spawn(async move {
            match producer.send(&topic, &key, &payload).await {
                Ok((partition, offset)) => {
                    debug!("{} for {} -> {}[{}]@{}", name, key, topic, partition, offset)
                }
                Err(e) => error!("Failed to publish {} for {} to {}: {}", name, key, topic, e),
            }
        });
    }
}
