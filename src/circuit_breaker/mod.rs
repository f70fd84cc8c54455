pub mod breaker;
pub mod retry;
pub mod types;

pub use breaker::{CallPermit, CircuitBreaker};
pub use retry::RetryExecutor;
pub use types::{CircuitBreakerConfig, CircuitState, RetryConfig};
