//! Per-client token-bucket rate limiting.
//!
//! Buckets are keyed by a pluggable client identifier and shard-locked
//! via DashMap, so unrelated clients never contend on a shared lock.
//! Bursts are admitted immediately (no smoothing); over-limit requests
//! are rejected, never queued.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use http::HeaderMap;

/// Derives the rate-limit bucket key for a request.
///
/// Pluggable so deployments behind another proxy can key on the
/// forwarded client instead of the immediate peer without touching the
/// bucket algorithm.
pub trait ClientKeyExtractor: Send + Sync {
    fn client_key(&self, client_addr: Option<&SocketAddr>, headers: &HeaderMap) -> String;
}

/// Keys buckets by the remote peer IP.
pub struct RemoteAddrKey;

impl ClientKeyExtractor for RemoteAddrKey {
    fn client_key(&self, client_addr: Option<&SocketAddr>, _headers: &HeaderMap) -> String {
        client_addr
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// Keys buckets by the leftmost `X-Forwarded-For` hop when present,
/// falling back to the remote peer IP.
pub struct ForwardedForKey;

impl ClientKeyExtractor for ForwardedForKey {
    fn client_key(&self, client_addr: Option<&SocketAddr>, headers: &HeaderMap) -> String {
        headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(|hop| hop.trim().to_string())
            .filter(|hop| !hop.is_empty())
            .unwrap_or_else(|| RemoteAddrKey.client_key(client_addr, headers))
    }
}

/// Refill rate and burst capacity for one rate class.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimit {
    /// Tokens added per second.
    pub rate: f64,
    /// Bucket capacity; tokens are clamped to `[0, burst]`.
    pub burst: u32,
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    Allowed,
    Limited {
        /// Time until one token becomes available again.
        retry_after: Duration,
    },
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token buckets for one rate class, keyed by client identifier.
///
/// New clients start with a full bucket, so a burst of up to `burst`
/// requests is admitted immediately before the refill rate applies.
pub struct RateLimiter {
    limit: RateLimit,
    buckets: DashMap<String, Bucket>,
}

impl RateLimiter {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            buckets: DashMap::new(),
        }
    }

    /// Consumes one token for `key`, or reports how long to back off.
    pub fn check(&self, key: &str) -> Decision {
        self.check_at(key, Instant::now())
    }

    /// Same as [`check`](Self::check) with the clock passed explicitly.
    pub fn check_at(&self, key: &str, now: Instant) -> Decision {
        let mut bucket = self.buckets.entry(key.to_string()).or_insert_with(|| Bucket {
            tokens: self.limit.burst as f64,
            last_refill: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last_refill);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.limit.rate)
            .min(self.limit.burst as f64);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Decision::Allowed
        } else {
            let deficit = 1.0 - bucket.tokens;
            Decision::Limited {
                retry_after: Duration::from_secs_f64(deficit / self.limit.rate),
            }
        }
    }

    /// Drops buckets idle for longer than `idle_for`.
    ///
    /// Called periodically from a sweeper thread so one-off clients do
    /// not accumulate forever.
    pub fn evict_idle(&self, idle_for: Duration) {
        let now = Instant::now();
        self.buckets
            .retain(|_, bucket| now.saturating_duration_since(bucket.last_refill) < idle_for);
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(rate: f64, burst: u32) -> RateLimiter {
        RateLimiter::new(RateLimit { rate, burst })
    }

    fn headers_with_xff(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", value.parse().unwrap());
        headers
    }

    // ========== Bucket behavior ==========

    #[test]
    fn test_burst_admitted_immediately() {
        let limiter = limiter(10.0, 20);
        let now = Instant::now();
        for i in 0..20 {
            assert_eq!(
                limiter.check_at("1.2.3.4", now),
                Decision::Allowed,
                "request {i} within burst should pass"
            );
        }
        assert!(matches!(
            limiter.check_at("1.2.3.4", now),
            Decision::Limited { .. }
        ));
    }

    #[test]
    fn test_refill_allows_rate_times_elapsed_plus_burst() {
        let limiter = limiter(10.0, 20);
        let start = Instant::now();

        // Drain the burst.
        for _ in 0..20 {
            assert_eq!(limiter.check_at("c", start), Decision::Allowed);
        }

        // Over 2 seconds, exactly rate*elapsed = 20 more tokens accrue.
        let later = start + Duration::from_secs(2);
        for i in 0..20 {
            assert_eq!(
                limiter.check_at("c", later),
                Decision::Allowed,
                "refilled request {i} should pass"
            );
        }
        assert!(matches!(
            limiter.check_at("c", later),
            Decision::Limited { .. }
        ));
    }

    #[test]
    fn test_tokens_clamped_to_burst() {
        let limiter = limiter(10.0, 5);
        let start = Instant::now();

        // A long idle period must not accumulate beyond the burst cap.
        let later = start + Duration::from_secs(3600);
        for _ in 0..5 {
            assert_eq!(limiter.check_at("c", later), Decision::Allowed);
        }
        assert!(matches!(
            limiter.check_at("c", later),
            Decision::Limited { .. }
        ));
    }

    #[test]
    fn test_retry_after_reflects_deficit() {
        let limiter = limiter(2.0, 1);
        let now = Instant::now();
        assert_eq!(limiter.check_at("c", now), Decision::Allowed);

        match limiter.check_at("c", now) {
            Decision::Limited { retry_after } => {
                // One token at 2/s takes 500ms.
                assert!(retry_after <= Duration::from_millis(500));
                assert!(retry_after > Duration::from_millis(400));
            }
            Decision::Allowed => panic!("expected rejection"),
        }
    }

    #[test]
    fn test_clients_do_not_share_buckets() {
        let limiter = limiter(10.0, 1);
        let now = Instant::now();
        assert_eq!(limiter.check_at("a", now), Decision::Allowed);
        assert!(matches!(limiter.check_at("a", now), Decision::Limited { .. }));
        // A different client still has its full burst.
        assert_eq!(limiter.check_at("b", now), Decision::Allowed);
    }

    #[test]
    fn test_evict_idle_drops_stale_buckets_only() {
        let limiter = limiter(10.0, 5);
        limiter.check("stale");
        assert_eq!(limiter.bucket_count(), 1);

        // Nothing is older than an hour, so nothing goes.
        limiter.evict_idle(Duration::from_secs(3600));
        assert_eq!(limiter.bucket_count(), 1);

        // Everything is older than zero.
        limiter.evict_idle(Duration::ZERO);
        assert_eq!(limiter.bucket_count(), 0);
    }

    #[test]
    fn test_concurrent_checks_do_not_panic() {
        use std::sync::Arc;
        use std::thread;

        let limiter = Arc::new(limiter(1000.0, 100));
        let mut handles = vec![];
        for t in 0..8 {
            let limiter = Arc::clone(&limiter);
            handles.push(thread::spawn(move || {
                for i in 0..200 {
                    let _ = limiter.check(&format!("client-{}", (t + i) % 4));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }

    // ========== Key extraction ==========

    #[test]
    fn test_remote_addr_key_uses_ip_only() {
        let addr: SocketAddr = "192.168.1.9:55123".parse().unwrap();
        let key = RemoteAddrKey.client_key(Some(&addr), &HeaderMap::new());
        assert_eq!(key, "192.168.1.9");
    }

    #[test]
    fn test_remote_addr_key_without_addr() {
        let key = RemoteAddrKey.client_key(None, &HeaderMap::new());
        assert_eq!(key, "unknown");
    }

    #[test]
    fn test_forwarded_for_key_takes_leftmost_hop() {
        let addr: SocketAddr = "10.0.0.1:80".parse().unwrap();
        let headers = headers_with_xff("203.0.113.7, 10.0.0.2");
        let key = ForwardedForKey.client_key(Some(&addr), &headers);
        assert_eq!(key, "203.0.113.7");
    }

    #[test]
    fn test_forwarded_for_key_falls_back_to_remote_addr() {
        let addr: SocketAddr = "10.0.0.1:80".parse().unwrap();
        let key = ForwardedForKey.client_key(Some(&addr), &HeaderMap::new());
        assert_eq!(key, "10.0.0.1");
    }
}
