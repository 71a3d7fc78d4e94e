use berth_core::Provider;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CircuitState {
    Closed,   // Normal operation
    Open,     // Provider failing, calls short-circuited
    HalfOpen, // Probing whether the provider is back
}

/// Trips after `failure_threshold` consecutive transport failures of one provider.
pub struct CircuitBreaker {
    pub name: String,
    state: RwLock<CircuitState>,
    failure_count: AtomicUsize,
    failure_threshold: usize,
    reset_timeout: Duration,
    opened_at: RwLock<Option<Instant>>,
}

impl CircuitBreaker {
    pub fn new(name: &str, threshold: usize, reset_timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            state: RwLock::new(CircuitState::Closed),
            failure_count: AtomicUsize::new(0),
            failure_threshold: threshold.max(1),
            reset_timeout,
            opened_at: RwLock::new(None),
        }
    }

    pub async fn state(&self) -> CircuitState {
        *self.state.read().await
    }

    /// Whether a call may go out now
    pub async fn check(&self) -> bool {
        let state = *self.state.read().await;
        match state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let opened_at = *self.opened_at.read().await;
                match opened_at {
                    Some(instant) if instant.elapsed() >= self.reset_timeout => {
                        let mut s = self.state.write().await;
                        *s = CircuitState::HalfOpen;
                        tracing::info!("Circuit breaker [{}] moving to half-open", self.name);
                        true
                    }
                    _ => false,
                }
            }
        }
    }

    pub async fn record_success(&self) {
        let mut state = self.state.write().await;
        if *state == CircuitState::HalfOpen {
            tracing::info!("Circuit breaker [{}] recovered to closed", self.name);
        }
        *state = CircuitState::Closed;
        self.failure_count.store(0, Ordering::SeqCst);
    }

    pub async fn record_failure(&self) {
        let count = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
        let mut state = self.state.write().await;

        if count >= self.failure_threshold || *state == CircuitState::HalfOpen {
            *state = CircuitState::Open;
            *self.opened_at.write().await = Some(Instant::now());
            tracing::error!(
                "Circuit breaker [{}] tripped to open after {} failures",
                self.name,
                count
            );
        }
    }
}

/// One breaker per provider
pub struct ProviderBreakers {
    global: CircuitBreaker,
    regional: CircuitBreaker,
}

impl ProviderBreakers {
    pub fn new(threshold: usize, reset_timeout: Duration) -> Self {
        Self {
            global: CircuitBreaker::new(Provider::Global.as_str(), threshold, reset_timeout),
            regional: CircuitBreaker::new(Provider::Regional.as_str(), threshold, reset_timeout),
        }
    }

    pub fn get(&self, provider: Provider) -> &CircuitBreaker {
        match provider {
            Provider::Global => &self.global,
            Provider::Regional => &self.regional,
        }
    }
}
