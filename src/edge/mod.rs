//! Edge listener composition
//!
//! Connection admission, per-IP rate limiting, TLS termination, and ACME
//! challenge answering. The server wires these ahead of the router.

pub mod acme;
pub mod limiter;
pub mod ratelimit;
pub mod tls;

pub use acme::ChallengeStore;
pub use limiter::{ConnGuard, ConnLimiter};
pub use ratelimit::EdgeLimiter;
pub use tls::TlsFront;
