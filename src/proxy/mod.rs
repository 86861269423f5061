//! Request classification, rate limiting, and upstream selection.
//!
//! Splits the edge pipeline into a fixed route table (`router`),
//! per-client token buckets (`rate_limit`), health-aware replica sets
//! (`upstream`), and the Pingora glue tying them together (`gateway`).

mod gateway;
mod rate_limit;
mod router;
mod upstream;

pub use gateway::EdgeProxy;
pub use rate_limit::RateLimit;
