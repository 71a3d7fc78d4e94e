pub mod breaker;
pub mod orchestrator;
pub mod reconciler;
pub mod refund;
pub mod settlement;

pub use orchestrator::{
    BookingView, ConfirmOutcome, OrchestratorConfig, PaymentOrchestrator, PaymentSession,
    RefundOutcome,
};
pub use reconciler::{ReconcileOutcome, WebhookReconciler};
pub use refund::{RefundDecision, RefundPolicyWindow, RefundTier};
pub use settlement::{Settled, Settlement};

use berth_core::{CapacityLedger, PackageCatalog, PaymentLedger, WebhookLog};
use std::sync::Arc;

/// Storage handles shared by the orchestrator and the reconciler
#[derive(Clone)]
pub struct Ledgers {
    pub catalog: Arc<dyn PackageCatalog>,
    pub capacity: Arc<dyn CapacityLedger>,
    pub payments: Arc<dyn PaymentLedger>,
    pub webhooks: Arc<dyn WebhookLog>,
}

impl Ledgers {
    /// All four ledgers backed by one store
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: PackageCatalog + CapacityLedger + PaymentLedger + WebhookLog + 'static,
    {
        Self {
            catalog: store.clone(),
            capacity: store.clone(),
            payments: store.clone(),
            webhooks: store,
        }
    }
}
