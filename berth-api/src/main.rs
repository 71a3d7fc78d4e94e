use anyhow::Context;
use berth_api::{app, AppState, MonitorConfig, PaymentMonitor, RateLimit};
use berth_core::telemetry::FanoutSink;
use berth_core::{EventSink, PaymentAdapter, Provider, ProviderRegistry};
use berth_gateway::{
    GlobalCardAdapter, GlobalConfig, MockPaymentAdapter, RegionalConfig, RegionalRailsAdapter,
};
use berth_order::{Ledgers, OrchestratorConfig, PaymentOrchestrator, WebhookReconciler};
use berth_store::app_config::Config;
use berth_store::{DbClient, EventProducer, KafkaEventSink, RedisClient};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn adapters(config: &Config) -> anyhow::Result<(Arc<dyn PaymentAdapter>, Arc<dyn PaymentAdapter>)> {
    if config.providers.use_mock {
        tracing::warn!("Using mock payment adapters; no money will move");
        return Ok((
            Arc::new(MockPaymentAdapter::new(Provider::Global)),
            Arc::new(MockPaymentAdapter::new(Provider::Regional)),
        ));
    }

    let timeout = config.payments.provider_timeout();
    let global = GlobalCardAdapter::new(GlobalConfig {
        api_key: config.providers.global.api_key.clone(),
        webhook_secret: config.providers.global.webhook_secret.clone(),
        base_url: config.providers.global.base_url.clone(),
        webhook_tolerance_secs: config.payments.webhook_tolerance_seconds,
        request_timeout: timeout,
    })
    .context("Failed to build global provider client")?;
    let regional = RegionalRailsAdapter::new(RegionalConfig {
        secret_key: config.providers.regional.secret_key.clone(),
        base_url: config.providers.regional.base_url.clone(),
        callback_url: config.providers.regional.callback_url.clone(),
        request_timeout: timeout,
    })
    .context("Failed to build regional provider client")?;

    Ok((Arc::new(global), Arc::new(regional)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "berth_api=debug,berth_order=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().context("Failed to load config")?;
    tracing::info!("Starting Berth API on port {}", config.server.port);

    let db = DbClient::connect(&config.database)
        .await
        .context("Failed to connect to Postgres")?;
    db.migrate().await.context("Failed to run migrations")?;
    let store = Arc::new(db.store());
    let ledgers = Ledgers::from_store(store.clone());

    let monitor = Arc::new(
        PaymentMonitor::new(MonitorConfig {
            alert_window: Duration::from_secs(config.monitoring.alert_window_seconds),
            signature_alert_threshold: config.monitoring.signature_alert_threshold,
            failure_alert_threshold: config.monitoring.failure_alert_threshold,
        })
        .context("Failed to register metrics")?,
    );
    let mut sinks = FanoutSink::new(vec![monitor.clone() as Arc<dyn EventSink>]);
    if let Some(kafka) = &config.kafka {
        let producer = EventProducer::new(&kafka.brokers).context("Failed to create Kafka producer")?;
        sinks.push(Arc::new(KafkaEventSink::new(producer)));
        tracing::info!("Publishing engine events to Kafka at {}", kafka.brokers);
    }
    let sink: Arc<dyn EventSink> = Arc::new(sinks);

    let (global, regional) = adapters(&config)?;
    let registry = ProviderRegistry::new(global, regional, config.payments.regional_currencies.clone());

    let orchestrator = PaymentOrchestrator::new(
        ledgers.clone(),
        registry.clone(),
        sink.clone(),
        OrchestratorConfig {
            provider_timeout: config.payments.provider_timeout(),
            max_payment_attempts: config.payments.max_payment_attempts,
            ..OrchestratorConfig::default()
        },
    );
    let reconciler = WebhookReconciler::new(ledgers, registry, sink);

    let rate_limit = match &config.redis {
        Some(redis) => {
            let client = RedisClient::new(&redis.url)
                .await
                .context("Failed to connect to Redis")?;
            Some(RateLimit {
                redis: Arc::new(client),
                per_minute: redis.rate_limit_per_minute,
            })
        }
        None => {
            tracing::info!("Redis not configured; rate limiting disabled");
            None
        }
    };

    let app_state = AppState {
        orchestrator: Arc::new(orchestrator),
        reconciler: Arc::new(reconciler),
        review: store,
        monitor,
        rate_limit,
    };

    let app = app(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}
