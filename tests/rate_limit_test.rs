//! Tests for the sliding-window [`RateLimiter`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use muninn::cache::{BackendInfo, CacheBackend, MemoryBackend, WindowState};
use muninn::{MuninnError, RateLimitConfig, RateLimiter, Result};

// ============================================================================
// Mock backend
// ============================================================================

/// Backend that is unreachable for every call.
struct DownBackend;

fn down<T>() -> Result<T> {
    Err(MuninnError::ConnectionUnavailable("timed out".into()))
}

#[async_trait]
impl CacheBackend for DownBackend {
    fn name(&self) -> &str {
        "down"
    }

    async fn ping(&self) -> Result<()> {
        down()
    }

    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
        down()
    }

    async fn set(&self, _key: &str, _value: Vec<u8>, _expire_in: Duration) -> Result<()> {
        down()
    }

    async fn delete(&self, _key: &str) -> Result<bool> {
        down()
    }

    async fn keys(&self, _pattern: &str) -> Result<Vec<String>> {
        down()
    }

    async fn set_add(&self, _set: &str, _member: &str) -> Result<()> {
        down()
    }

    async fn set_members(&self, _set: &str) -> Result<Vec<String>> {
        down()
    }

    async fn set_remove(&self, _set: &str, _member: &str) -> Result<()> {
        down()
    }

    async fn set_delete(&self, _set: &str) -> Result<()> {
        down()
    }

    async fn window_hit(
        &self,
        _key: &str,
        _window: Duration,
        _limit: u32,
        _record: bool,
    ) -> Result<WindowState> {
        down()
    }

    async fn info(&self) -> Result<BackendInfo> {
        down()
    }

    async fn flush(&self) -> Result<u64> {
        down()
    }
}

fn limiter(config: RateLimitConfig) -> RateLimiter {
    RateLimiter::new(Arc::new(MemoryBackend::new()), config)
}

// ============================================================================
// Window behaviour
// ============================================================================

#[tokio::test(start_paused = true)]
async fn limit_of_three_admits_three_then_rejects() {
    let rl = limiter(RateLimitConfig::new().service_limit("aws", "pricing", 3));

    let mut allowed = Vec::new();
    for _ in 0..4 {
        allowed.push(rl.check_rate_limit("aws", "pricing").await.allowed);
    }
    assert_eq!(allowed, vec![true, true, true, false]);

    tokio::time::advance(Duration::from_secs(61)).await;

    let status = rl.check_rate_limit("aws", "pricing").await;
    assert!(status.allowed);
    assert_eq!(status.current, 1);
    assert_eq!(status.remaining, 2);
}

#[tokio::test(start_paused = true)]
async fn remaining_counts_down() {
    let rl = limiter(RateLimitConfig::new().service_limit("gcp", "billing", 3));

    let first = rl.check_rate_limit("gcp", "billing").await;
    assert_eq!((first.remaining, first.current, first.limit), (2, 1, 3));
    assert!(!first.degraded);

    rl.check_rate_limit("gcp", "billing").await;
    let third = rl.check_rate_limit("gcp", "billing").await;
    assert_eq!(third.remaining, 0);

    let rejected = rl.check_rate_limit("gcp", "billing").await;
    assert!(!rejected.allowed);
    assert_eq!(rejected.remaining, 0);
    assert_eq!(rejected.current, 3);
    assert!(rejected.reset_at.is_some());
    assert!(rejected.retry_after.unwrap() <= Duration::from_secs(60));
}

#[tokio::test(start_paused = true)]
async fn window_slides_request_by_request() {
    let rl = limiter(RateLimitConfig::new().service_limit("aws", "ec2", 2));

    rl.check_rate_limit("aws", "ec2").await;
    tokio::time::advance(Duration::from_secs(30)).await;
    rl.check_rate_limit("aws", "ec2").await;

    assert!(!rl.check_rate_limit("aws", "ec2").await.allowed);

    // The first request leaves the window; the second is still inside it.
    tokio::time::advance(Duration::from_secs(31)).await;
    let status = rl.check_rate_limit("aws", "ec2").await;
    assert!(status.allowed);
    assert_eq!(status.current, 2);
}

#[tokio::test(start_paused = true)]
async fn status_does_not_record() {
    let rl = limiter(RateLimitConfig::new().service_limit("azure", "retail", 2));

    for _ in 0..5 {
        let status = rl.rate_limit_status("azure", "retail").await;
        assert!(status.allowed);
        assert_eq!(status.current, 0);
        assert_eq!(status.remaining, 2);
    }

    rl.check_rate_limit("azure", "retail").await;
    rl.check_rate_limit("azure", "retail").await;

    let status = rl.rate_limit_status("azure", "retail").await;
    assert!(!status.allowed);
    assert_eq!(status.current, 2);
}

#[tokio::test(start_paused = true)]
async fn pairs_are_independent() {
    let rl = limiter(RateLimitConfig::new().default_limit(1).provider_limit("aws", 1));

    assert!(rl.check_rate_limit("aws", "pricing").await.allowed);
    assert!(!rl.check_rate_limit("aws", "pricing").await.allowed);
    assert!(rl.check_rate_limit("aws", "compute").await.allowed);
    assert!(rl.check_rate_limit("oracle", "pricing").await.allowed);
}

#[tokio::test(start_paused = true)]
async fn custom_window_length() {
    let rl = limiter(
        RateLimitConfig::new()
            .default_limit(1)
            .window(Duration::from_secs(5)),
    );

    assert!(rl.check_rate_limit("vendor", "api").await.allowed);
    assert!(!rl.check_rate_limit("vendor", "api").await.allowed);
    tokio::time::advance(Duration::from_secs(5)).await;
    assert!(rl.check_rate_limit("vendor", "api").await.allowed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_never_exceed_limit() {
    let rl = Arc::new(limiter(RateLimitConfig::new().service_limit("aws", "pricing", 10)));

    let handles: Vec<_> = (0..50)
        .map(|_| {
            let rl = Arc::clone(&rl);
            tokio::spawn(async move { rl.check_rate_limit("aws", "pricing").await.allowed })
        })
        .collect();

    let mut admitted = 0;
    for handle in handles {
        if handle.await.unwrap() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 10);
}

// ============================================================================
// Fail open
// ============================================================================

#[tokio::test]
async fn unavailable_backend_fails_open() {
    let rl = RateLimiter::new(
        Arc::new(DownBackend),
        RateLimitConfig::new().service_limit("aws", "pricing", 1),
    );

    for _ in 0..3 {
        let status = rl.check_rate_limit("aws", "pricing").await;
        assert!(status.allowed);
        assert_eq!(status.remaining, -1);
        assert!(status.degraded);
        assert_eq!(status.limit, 1);
    }

    let status = rl.rate_limit_status("aws", "pricing").await;
    assert!(status.allowed);
    assert!(status.degraded);
}
