use serde::Deserialize;
use std::env;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub redis: Option<RedisConfig>,
    #[serde(default)]
    pub kafka: Option<KafkaConfig>,
    #[serde(default)]
    pub payments: PaymentsConfig,
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    pub url: String,
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: i64,
}

fn default_rate_limit() -> i64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct KafkaConfig {
    pub brokers: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PaymentsConfig {
    /// ISO 4217 codes routed to the regional provider
    #[serde(default = "default_regional_currencies")]
    pub regional_currencies: Vec<String>,
    #[serde(default = "default_provider_timeout_ms")]
    pub provider_timeout_ms: u64,
    #[serde(default = "default_max_payment_attempts")]
    pub max_payment_attempts: u32,
    #[serde(default = "default_webhook_tolerance")]
    pub webhook_tolerance_seconds: i64,
}

impl PaymentsConfig {
    pub fn provider_timeout(&self) -> Duration {
        Duration::from_millis(self.provider_timeout_ms)
    }
}

impl Default for PaymentsConfig {
    fn default() -> Self {
        Self {
            regional_currencies: default_regional_currencies(),
            provider_timeout_ms: default_provider_timeout_ms(),
            max_payment_attempts: default_max_payment_attempts(),
            webhook_tolerance_seconds: default_webhook_tolerance(),
        }
    }
}

fn default_regional_currencies() -> Vec<String> {
    ["NGN", "GHS", "KES", "ZAR"].iter().map(|c| c.to_string()).collect()
}

fn default_provider_timeout_ms() -> u64 {
    10_000
}

fn default_max_payment_attempts() -> u32 {
    3
}

fn default_webhook_tolerance() -> i64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProvidersConfig {
    /// Serve payments from the in-process mock adapters (local runs only)
    #[serde(default)]
    pub use_mock: bool,
    pub global: GlobalProviderConfig,
    pub regional: RegionalProviderConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GlobalProviderConfig {
    pub api_key: String,
    pub webhook_secret: String,
    pub base_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RegionalProviderConfig {
    pub secret_key: String,
    pub base_url: String,
    #[serde(default)]
    pub callback_url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MonitoringConfig {
    #[serde(default = "default_alert_window")]
    pub alert_window_seconds: u64,
    #[serde(default = "default_signature_threshold")]
    pub signature_alert_threshold: usize,
    #[serde(default = "default_failure_threshold")]
    pub failure_alert_threshold: usize,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            alert_window_seconds: default_alert_window(),
            signature_alert_threshold: default_signature_threshold(),
            failure_alert_threshold: default_failure_threshold(),
        }
    }
}

fn default_alert_window() -> u64 {
    300
}

fn default_signature_threshold() -> usize {
    10
}

fn default_failure_threshold() -> usize {
    20
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            // Optional per-environment overrides, 'development' when RUN_MODE is unset
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            // Local overrides, not checked in
            .add_source(config::File::with_name("config/local").required(false))
            // Eg. `BERTH__PAYMENTS__MAX_PAYMENT_ATTEMPTS=5`
            .add_source(config::Environment::with_prefix("BERTH").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_toml(raw: &str) -> Result<Config, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::from_str(raw, config::FileFormat::Toml))
            .build()?
            .try_deserialize()
    }

    const MINIMAL: &str = r#"
        [server]
        port = 3000

        [database]
        url = "postgres://localhost/berth"

        [providers.global]
        api_key = "sk_test"
        webhook_secret = "whsec_test"
        base_url = "https://api.global.test"

        [providers.regional]
        secret_key = "rk_test"
        base_url = "https://api.regional.test"
    "#;

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config = from_toml(MINIMAL).unwrap();

        assert_eq!(config.database.max_connections, 10);
        assert!(config.redis.is_none());
        assert!(config.kafka.is_none());
        assert_eq!(config.payments.max_payment_attempts, 3);
        assert_eq!(config.payments.webhook_tolerance_seconds, 300);
        assert_eq!(config.payments.provider_timeout(), Duration::from_secs(10));
        assert!(config.payments.regional_currencies.contains(&"NGN".to_string()));
        assert_eq!(config.monitoring.alert_window_seconds, 300);
        assert!(!config.providers.use_mock);
    }

    #[test]
    fn test_optional_sections_are_read() {
        let raw = format!(
            "{}\n[redis]\nurl = \"redis://localhost\"\n[kafka]\nbrokers = \"localhost:9092\"\n[payments]\nregional_currencies = [\"NGN\"]\nmax_payment_attempts = 5\n",
            MINIMAL
        );
        let config = from_toml(&raw).unwrap();

        assert_eq!(config.redis.unwrap().rate_limit_per_minute, 120);
        assert_eq!(config.kafka.unwrap().brokers, "localhost:9092");
        assert_eq!(config.payments.regional_currencies, vec!["NGN".to_string()]);
        assert_eq!(config.payments.max_payment_attempts, 5);
        assert_eq!(config.payments.webhook_tolerance_seconds, 300);
    }

    #[test]
    fn test_missing_provider_secrets_fail() {
        let raw = "[server]\nport = 1\n[database]\nurl = \"x\"\n";
        assert!(from_toml(raw).is_err());
    }
}
