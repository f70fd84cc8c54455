//! Token bucket rate limiting
//!
//! Buckets live in a [`BucketStore`]: Redis for deployments with more than
//! one instance, or process memory for a single instance and tests. Both
//! run the same refill-then-consume step atomically per key:
//!
//! - **Rolling** windows refill continuously at `refill_rate` tokens/s
//! - **Fixed** windows refill completely once per `capacity / refill_rate` seconds
//!
//! Bucket keys look like `ratelimit:identity+route:orders:user123:GET /api/orders`:
//! prefix, scope, policy name, then one value per scope dimension.
//!
//! # Example
//!
//! ```rust,no_run
//! use authgate::rate_limit::{BucketStore, InMemoryBucketStore, RateLimitPolicy};
//! use authgate::rate_limit::types::{RateLimitDimension, RateLimitScope, WindowKind};
//! use std::time::SystemTime;
//!
//! #[tokio::main]
//! async fn main() {
//!     let policy = RateLimitPolicy {
//!         name: "otp-verify".to_string(),
//!         capacity: 5,
//!         refill_rate: 5.0 / 300.0,
//!         window: WindowKind::Rolling,
//!         scope: RateLimitScope::Single(RateLimitDimension::Identity),
//!         cost: 1,
//!     };
//!
//!     let store = InMemoryBucketStore::new();
//!     let outcome = store
//!         .check_and_consume("ratelimit:identity:otp-verify:42", &policy, 1, SystemTime::now(), "req-1")
//!         .await
//!         .unwrap();
//!     assert!(outcome.allowed);
//! }
//! ```

pub mod local;
pub mod lua_scripts;
pub mod redis;
pub mod service;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use local::InMemoryBucketStore;
pub use redis::RedisBucketStore;
pub use service::RateLimiter;
pub use store::{BucketState, BucketStore, ConsumeOutcome};
pub use types::{Decision, FallbackMode, RateLimitKey, RateLimitPolicy};
