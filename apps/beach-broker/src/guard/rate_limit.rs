use std::{
    collections::VecDeque,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use metrics::counter;
use tokio::{task::JoinHandle, time::Instant};
use tracing::{debug, warn};

use crate::error::{ApiError, BrokerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 30,
            window: Duration::from_secs(60),
        }
    }
}

/// Sliding-window request log keyed by client address.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<RateLimiterInner>,
}

struct RateLimiterInner {
    config: RateLimitConfig,
    hits: DashMap<IpAddr, VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            inner: Arc::new(RateLimiterInner {
                config,
                hits: DashMap::new(),
            }),
        }
    }

    /// Record a request from `addr`. Returns how long to wait when the window
    /// is already full; rejected requests are not recorded.
    pub fn check(&self, addr: IpAddr) -> Result<(), Duration> {
        let RateLimitConfig {
            max_requests,
            window,
        } = self.inner.config;
        let now = Instant::now();
        let mut hits = self.inner.hits.entry(addr).or_default();
        while let Some(oldest) = hits.front() {
            if now.duration_since(*oldest) >= window {
                hits.pop_front();
            } else {
                break;
            }
        }
        if hits.len() >= max_requests as usize {
            let retry_after = hits
                .front()
                .map(|oldest| window.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(window);
            return Err(retry_after);
        }
        hits.push_back(now);
        Ok(())
    }

    /// Drop addresses with no requests inside the current window.
    pub fn sweep(&self) -> usize {
        let window = self.inner.config.window;
        let now = Instant::now();
        let before = self.inner.hits.len();
        self.inner.hits.retain(|_, hits| {
            hits.back()
                .map(|latest| now.duration_since(*latest) < window)
                .unwrap_or(false)
        });
        before - self.inner.hits.len()
    }

    pub fn tracked_clients(&self) -> usize {
        self.inner.hits.len()
    }

    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let limiter = self.clone();
        let period = limiter.inner.config.window.max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = limiter.sweep();
                if removed > 0 {
                    debug!(removed, "swept idle rate limit entries");
                }
            }
        })
    }
}

pub async fn rate_limit(
    State(limiter): State<RateLimiter>,
    request: Request,
    next: Next,
) -> Response {
    let addr = client_ip(&request);
    match limiter.check(addr) {
        Ok(()) => next.run(request).await,
        Err(retry_after) => {
            counter!("beach_broker_rate_limited_total").increment(1);
            warn!(client = %addr, retry_after_ms = retry_after.as_millis() as u64, "rate limit exceeded");
            ApiError::from(BrokerError::RateLimited { retry_after }).into_response()
        }
    }
}

fn client_ip(request: &Request) -> IpAddr {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_requests: u32, window_ms: u64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            max_requests,
            window: Duration::from_millis(window_ms),
        })
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_fourth_request_inside_window() {
        let limiter = limiter(3, 1000);
        for _ in 0..3 {
            assert!(limiter.check(ip(1)).is_ok());
        }
        let retry_after = limiter.check(ip(1)).unwrap_err();
        assert!(retry_after <= Duration::from_millis(1000));

        tokio::time::advance(Duration::from_millis(1001)).await;
        assert!(limiter.check(ip(1)).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn window_slides_per_request() {
        let limiter = limiter(2, 1000);
        assert!(limiter.check(ip(1)).is_ok());
        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(limiter.check(ip(1)).is_ok());
        assert!(limiter.check(ip(1)).is_err());

        // Only the first hit has aged out.
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(limiter.check(ip(1)).is_ok());
        let retry_after = limiter.check(ip(1)).unwrap_err();
        assert_eq!(retry_after, Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn clients_are_counted_independently() {
        let limiter = limiter(1, 1000);
        assert!(limiter.check(ip(1)).is_ok());
        assert!(limiter.check(ip(2)).is_ok());
        assert!(limiter.check(ip(1)).is_err());
        assert_eq!(limiter.tracked_clients(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_drops_idle_clients() {
        let limiter = limiter(5, 1000);
        limiter.check(ip(1)).unwrap();
        limiter.check(ip(2)).unwrap();
        tokio::time::advance(Duration::from_millis(500)).await;
        limiter.check(ip(2)).unwrap();
        tokio::time::advance(Duration::from_millis(600)).await;

        assert_eq!(limiter.sweep(), 1);
        assert_eq!(limiter.tracked_clients(), 1);
    }
}
