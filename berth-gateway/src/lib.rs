pub mod global;
pub mod mock;
pub mod regional;
pub mod signature;

pub use global::{GlobalCardAdapter, GlobalConfig};
pub use mock::{MockBehavior, MockPaymentAdapter};
pub use regional::{RegionalConfig, RegionalRailsAdapter};

use berth_core::AdapterError;

/// Anything that failed before a provider answered is retryable.
pub(crate) fn transport_error(err: reqwest::Error) -> AdapterError {
    if err.is_timeout() {
        AdapterError::Transport(format!("provider timed out: {}", err))
    } else {
        AdapterError::Transport(err.to_string())
    }
}
