//! Rate limiting primitives and the limiter registry.

mod bucket;
mod context;
mod limiter;
mod registry;

pub use bucket::TokenBucket;
pub use context::ConnContext;
pub use limiter::{Direction, RateLimiter};
pub use registry::{ConnMetadata, LimiterKey, LimiterRegistry, Scope};
