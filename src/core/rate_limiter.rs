//! Gateway-wide rate limiting (feature-gated).
//!
//! A fixed-window counter keyed by client IP. Buckets live in one
//! mutex-guarded map; the critical section is a lookup and an increment, and
//! a background task evicts expired windows every ten seconds.
use std::{
    collections::HashMap,
    net::IpAddr,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use eyre::{Result, WrapErr};
use tokio_util::sync::CancellationToken;

use crate::config::models::RateLimitConfig;

const EVICTION_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug)]
struct Bucket {
    count: u32,
    reset_at: Instant,
}

/// Fixed-window request counter keyed by client IP.
#[derive(Debug)]
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    buckets: Mutex<HashMap<IpAddr, Bucket>>,
    stop: CancellationToken,
}

impl RateLimiter {
    pub fn from_config(cfg: &RateLimitConfig) -> Result<Self> {
        let window = humantime::parse_duration(&cfg.window)
            .wrap_err_with(|| format!("invalid rate limit window {:?}", cfg.window))?;

        Ok(Self {
            limit: cfg.limit,
            window,
            buckets: Mutex::new(HashMap::new()),
            stop: CancellationToken::new(),
        })
    }

    /// Count a request against the client's current window.
    pub fn allow(&self, ip: IpAddr) -> bool {
        let mut buckets = self.lock();
        let now = Instant::now();

        let bucket = buckets.entry(ip).or_insert_with(|| Bucket {
            count: 0,
            reset_at: now + self.window,
        });

        if now >= bucket.reset_at {
            bucket.count = 0;
            bucket.reset_at = now + self.window;
        }

        bucket.count += 1;
        bucket.count <= self.limit
    }

    /// Spawn the periodic eviction task. It runs until [`RateLimiter::stop`]
    /// is called or the runtime shuts down.
    pub fn spawn_eviction(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(EVICTION_INTERVAL);
            ticker.tick().await; // the first tick completes immediately
            loop {
                tokio::select! {
                    _ = limiter.stop.cancelled() => break,
                    _ = ticker.tick() => limiter.evict_expired(),
                }
            }
        })
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }

    fn evict_expired(&self) {
        let now = Instant::now();
        self.lock().retain(|_, bucket| now < bucket.reset_at);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<IpAddr, Bucket>> {
        match self.buckets.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(limit: u32, window: &str) -> RateLimiter {
        RateLimiter::from_config(&RateLimitConfig {
            enabled: true,
            limit,
            window: window.to_string(),
        })
        .unwrap()
    }

    #[test]
    fn test_allows_up_to_limit() {
        let limiter = limiter(3, "1s");
        let ip: IpAddr = "10.0.0.1".parse().unwrap();

        assert!(limiter.allow(ip));
        assert!(limiter.allow(ip));
        assert!(limiter.allow(ip));
        assert!(!limiter.allow(ip));
    }

    #[test]
    fn test_clients_are_independent() {
        let limiter = limiter(1, "1s");
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();

        assert!(limiter.allow(a));
        assert!(!limiter.allow(a));
        assert!(limiter.allow(b));
    }

    #[test]
    fn test_window_resets() {
        let limiter = limiter(1, "30ms");
        let ip: IpAddr = "10.0.0.1".parse().unwrap();

        assert!(limiter.allow(ip));
        assert!(!limiter.allow(ip));

        std::thread::sleep(Duration::from_millis(40));
        assert!(limiter.allow(ip));
    }

    #[test]
    fn test_eviction_drops_expired_buckets() {
        let limiter = limiter(1, "10ms");
        let ip: IpAddr = "10.0.0.1".parse().unwrap();

        limiter.allow(ip);
        assert_eq!(limiter.bucket_count(), 1);

        std::thread::sleep(Duration::from_millis(20));
        limiter.evict_expired();
        assert_eq!(limiter.bucket_count(), 0);
    }

    #[test]
    fn test_invalid_window_is_rejected() {
        let result = RateLimiter::from_config(&RateLimitConfig {
            enabled: true,
            limit: 1,
            window: "often".to_string(),
        });
        assert!(result.is_err());
    }
}
