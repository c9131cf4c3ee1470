//! Per-IP request rate limiting
//!
//! Keyed token buckets over source IPs. Idle buckets are evicted
//! periodically so the key table does not grow with every client ever seen.

use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// How often idle buckets are swept
const EVICTION_INTERVAL: Duration = Duration::from_secs(60);

type IpLimiter = RateLimiter<IpAddr, DefaultKeyedStateStore<IpAddr>, DefaultClock>;

/// Edge token-bucket limiter keyed by source IP
pub struct EdgeLimiter {
    limiter: Arc<IpLimiter>,
}

impl EdgeLimiter {
    /// `rps` sustained requests per second with `burst` headroom
    pub fn new(rps: u32, burst: u32) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(rps.max(1)).expect("nonzero"))
            .allow_burst(NonZeroU32::new(burst.max(1)).expect("nonzero"));
        Self {
            limiter: Arc::new(RateLimiter::keyed(quota)),
        }
    }

    /// True when the request is admitted
    pub fn check(&self, ip: IpAddr) -> bool {
        self.limiter.check_key(&ip).is_ok()
    }

    /// Start the periodic idle-bucket eviction task
    pub fn spawn_eviction_task(&self) {
        let limiter = Arc::clone(&self.limiter);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(EVICTION_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let before = limiter.len();
                limiter.retain_recent();
                let after = limiter.len();
                if before != after {
                    debug!(evicted = before - after, "rate limit buckets evicted");
                }
            }
        });
    }

    /// Tracked bucket count, for the system info endpoint
    pub fn bucket_count(&self) -> usize {
        self.limiter.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_then_limited() {
        let limiter = EdgeLimiter::new(1, 3);
        let ip: IpAddr = "10.1.1.1".parse().unwrap();
        assert!(limiter.check(ip));
        assert!(limiter.check(ip));
        assert!(limiter.check(ip));
        assert!(!limiter.check(ip));
    }

    #[test]
    fn ips_are_independent(){
        let limiter = EdgeLimiter::new(1, 1);
        let a: IpAddr = "10.1.1.1".parse().unwrap();
        let b: IpAddr = "10.1.1.2".parse().unwrap();
        assert!(limiter.check(a));
        assert!(!limiter.check(a));
        assert!(limiter.check(b));
    }
}
