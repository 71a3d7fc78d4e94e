use std::sync::Arc;

use berth_core::WebhookLog;
use berth_order::{PaymentOrchestrator, WebhookReconciler};
use berth_store::RedisClient;

use crate::monitor::PaymentMonitor;

#[derive(Clone)]
pub struct RateLimit {
    pub redis: Arc<RedisClient>,
    pub per_minute: i64,
}

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<PaymentOrchestrator>,
    pub reconciler: Arc<WebhookReconciler>,
    /// Source of the operator review queue
    pub review: Arc<dyn WebhookLog>,
    pub monitor: Arc<PaymentMonitor>,
    pub rate_limit: Option<RateLimit>,
}
