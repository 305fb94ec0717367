//! Per-client rate limiting
//!
//! Fixed-window counters keyed by client IP. Three tiers apply to different
//! routes: single-shot uploads are limited hardest, chunk uploads are allowed
//! many more requests, and everything else shares the general limit.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderValue, Method},
    middleware::Next,
    response::{IntoResponse, Response},
};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::RateLimitConfig;
use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Clone, Copy)]
struct RateLimitBucket {
    count: u32,
    reset_at: Instant,
}

/// Outcome of a rate check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: u32 },
    Limited { retry_after: Duration },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }
}

// ============================================================================
// Rate Limiter
// ============================================================================

#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<RateLimiterInner>,
}

struct RateLimiterInner {
    buckets: Mutex<HashMap<String, RateLimitBucket>>,
    limit: u32,
    window: Duration,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            inner: Arc::new(RateLimiterInner {
                buckets: Mutex::new(HashMap::new()),
                limit: limit.max(1),
                window,
            }),
        }
    }

    pub fn limit(&self) -> u32 {
        self.inner.limit
    }

    pub fn allow(&self, client_key: &str) -> bool {
        self.check_at(client_key, Instant::now()).is_allowed()
    }

    pub fn check_at(&self, client_key: &str, now: Instant) -> RateDecision {
        let mut buckets = self.inner.buckets.lock();
        let bucket = buckets
            .entry(client_key.to_string())
            .or_insert(RateLimitBucket {
                count: 0,
                reset_at: now + self.inner.window,
            });

        if now >= bucket.reset_at {
            bucket.count = 0;
            bucket.reset_at = now + self.inner.window;
        }

        if bucket.count < self.inner.limit {
            bucket.count += 1;
            RateDecision::Allowed {
                remaining: self.inner.limit - bucket.count,
            }
        } else {
            RateDecision::Limited {
                retry_after: bucket.reset_at.saturating_duration_since(now),
            }
        }
    }

    /// Drop buckets whose window has closed
    pub fn cleanup_at(&self, now: Instant) -> usize {
        let mut buckets = self.inner.buckets.lock();
        let before = buckets.len();
        buckets.retain(|_, bucket| bucket.reset_at > now);
        before - buckets.len()
    }

    pub fn bucket_count(&self) -> usize {
        self.inner.buckets.lock().len()
    }
}

// ============================================================================
// Limiter Tiers
// ============================================================================

#[derive(Clone)]
pub struct RateLimiters {
    pub upload: RateLimiter,
    pub chunk: RateLimiter,
    pub api: RateLimiter,
}

impl RateLimiters {
    pub fn from_config(config: &RateLimitConfig) -> Self {
        let base = config.requests;
        Self {
            upload: RateLimiter::new(base / 10, config.window),
            chunk: RateLimiter::new(base.saturating_mul(5), config.window),
            api: RateLimiter::new(base, config.window),
        }
    }

    /// Limiter for a request, `None` for unlimited routes
    pub fn for_request(&self, method: &Method, path: &str) -> Option<&RateLimiter> {
        match (method, path) {
            (_, "/health") => None,
            (&Method::POST, "/upload/finalize") => None,
            (&Method::POST, "/upload/chunk") => Some(&self.chunk),
            (&Method::POST, "/upload") => Some(&self.upload),
            _ => Some(&self.api),
        }
    }

    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        self.upload.cleanup_at(now) + self.chunk.cleanup_at(now) + self.api.cleanup_at(now)
    }

    pub fn start_cleanup_task(self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = self.cleanup();
                        if removed > 0 {
                            tracing::debug!(buckets_cleaned = removed, "Expired rate limit buckets removed");
                        }
                    }
                }
            }
        })
    }
}

// ============================================================================
// Client Identification
// ============================================================================

/// Client key: first valid `X-Forwarded-For` entry, then `X-Real-IP`, then
/// the socket address without its port
pub fn client_key(headers: &HeaderMap, socket_addr: Option<&SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|ip| ip.parse::<IpAddr>().is_ok());
    if let Some(ip) = forwarded {
        return ip.to_string();
    }

    let real_ip = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|ip| ip.parse::<IpAddr>().is_ok());
    if let Some(ip) = real_ip {
        return ip.to_string();
    }

    socket_addr
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

// ============================================================================
// Middleware
// ============================================================================

pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(limiter) = state
        .rate_limiters()
        .for_request(request.method(), request.uri().path())
    else {
        return next.run(request).await;
    };

    let socket_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let key = client_key(request.headers(), socket_addr.as_ref());

    match limiter.check_at(&key, Instant::now()) {
        RateDecision::Allowed { remaining } => {
            let limit = limiter.limit();
            let mut response = next.run(request).await;
            let headers = response.headers_mut();
            headers.insert("x-ratelimit-limit", HeaderValue::from(limit));
            headers.insert("x-ratelimit-remaining", HeaderValue::from(remaining));
            response
        }
        RateDecision::Limited { retry_after } => {
            tracing::warn!(client = %key, path = %request.uri().path(), "Rate limit exceeded");
            let mut response = AppError::RateLimited.into_response();
            response.headers_mut().insert(
                header::RETRY_AFTER,
                HeaderValue::from(retry_after.as_secs().max(1)),
            );
            response
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_limits_and_resets() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        let start = Instant::now();

        assert!(limiter.check_at("1.2.3.4", start).is_allowed());
        assert!(limiter.check_at("1.2.3.4", start).is_allowed());
        assert!(!limiter.check_at("1.2.3.4", start).is_allowed());
        assert!(limiter.check_at("5.6.7.8", start).is_allowed());

        let next_window = start + Duration::from_secs(61);
        assert!(limiter.check_at("1.2.3.4", next_window).is_allowed());
    }

    #[test]
    fn test_cleanup_drops_closed_windows() {
        let limiter = RateLimiter::new(5, Duration::from_secs(60));
        let start = Instant::now();
        limiter.check_at("a", start);
        limiter.check_at("b", start);
        assert_eq!(limiter.cleanup_at(start + Duration::from_secs(120)), 2);
        assert_eq!(limiter.bucket_count(), 0);
    }

    #[test]
    fn test_tiers() {
        let limiters = RateLimiters::from_config(&RateLimitConfig {
            requests: 60,
            window: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(300),
        });
        assert_eq!(limiters.upload.limit(), 6);
        assert_eq!(limiters.chunk.limit(), 300);
        assert_eq!(limiters.api.limit(), 60);
        assert!(limiters.for_request(&Method::GET, "/health").is_none());
        assert!(limiters.for_request(&Method::POST, "/upload/finalize").is_none());
        assert_eq!(limiters.for_request(&Method::POST, "/upload").unwrap().limit(), 6);
    }

    #[test]
    fn test_client_key() {
        let mut headers = HeaderMap::new();
        let addr: SocketAddr = "10.0.0.1:54321".parse().unwrap();
        assert_eq!(client_key(&headers, Some(&addr)), "10.0.0.1");

        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9, 10.0.0.2"));
        assert_eq!(client_key(&headers, Some(&addr)), "203.0.113.9");

        headers.insert("x-forwarded-for", HeaderValue::from_static("garbage"));
        assert_eq!(client_key(&headers, Some(&addr)), "10.0.0.1");
        assert_eq!(client_key(&HeaderMap::new(), None), "unknown");
    }
}
