//! Per-IP sliding-window rate limiting for the approval API.
//!
//! The pairing tier exists to keep code guessing impractical: a 6-digit code
//! space against 30 attempts per minute per IP inside a 5-minute window is a
//! lost cause for the attacker. A well-behaved agent polling every two
//! seconds sits exactly at that cadence, so the sliding window never fills
//! ahead of it. Session endpoints get a looser tier.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use axum::{
    extract::{ConnectInfo, Request},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};

/// Stale IPs are pruned once this many seconds pass between checks.
const PRUNE_INTERVAL_SECS: u64 = 300;

pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    hits: Mutex<HashMap<IpAddr, VecDeque<Instant>>>,
    last_prune: Mutex<Instant>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            hits: Mutex::new(HashMap::new()),
            last_prune: Mutex::new(Instant::now()),
        }
    }

    /// Record an attempt from `ip`; false when over budget.
    pub fn check(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut hits = self.hits.lock().unwrap_or_else(|e| e.into_inner());

        {
            let mut last_prune = self.last_prune.lock().unwrap_or_else(|e| e.into_inner());
            if now.duration_since(*last_prune).as_secs() >= PRUNE_INTERVAL_SECS {
                let horizon = self.window * 2;
                hits.retain(|_, stamps| {
                    stamps.back().is_some_and(|t| now.duration_since(*t) < horizon)
                });
                *last_prune = now;
            }
        }

        let stamps = hits.entry(ip).or_default();
        while stamps
            .front()
            .is_some_and(|t| now.duration_since(*t) >= self.window)
        {
            stamps.pop_front();
        }

        if stamps.len() < self.max_requests {
            stamps.push_back(now);
            true
        } else {
            false
        }
    }

    pub fn tracked_ips(&self) -> usize {
        self.hits.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

static PAIRING_LIMITER: once_cell::sync::Lazy<RateLimiter> =
    once_cell::sync::Lazy::new(|| RateLimiter::new(30, Duration::from_secs(60)));

static SESSION_LIMITER: once_cell::sync::Lazy<RateLimiter> =
    once_cell::sync::Lazy::new(|| RateLimiter::new(120, Duration::from_secs(60)));

fn client_ip(req: &Request) -> Option<IpAddr> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip())
}

fn too_many_requests() -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [("retry-after", "60")],
        "Rate limit exceeded",
    )
        .into_response()
}

/// Middleware for `/pairing/*`: 30 req/min per IP.
pub async fn pairing_rate_limit(request: Request, next: Next) -> Response {
    if let Some(ip) = client_ip(&request)
        && !PAIRING_LIMITER.check(ip)
    {
        return too_many_requests();
    }
    next.run(request).await
}

/// Middleware for credential and session endpoints: 120 req/min per IP.
pub async fn session_rate_limit(request: Request, next: Next) -> Response {
    if let Some(ip) = client_ip(&request)
        && !SESSION_LIMITER.check(ip)
    {
        return too_many_requests();
    }
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_after_budget_is_spent() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        let ip: IpAddr = "127.0.0.1".parse().unwrap();

        assert!(limiter.check(ip));
        assert!(limiter.check(ip));
        assert!(limiter.check(ip));
        assert!(!limiter.check(ip));
    }

    #[test]
    fn ips_are_independent() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();

        assert!(limiter.check(a));
        assert!(!limiter.check(a));
        assert!(limiter.check(b));
    }

    #[test]
    fn window_frees_budget() {
        let limiter = RateLimiter::new(1, Duration::from_millis(50));
        let ip: IpAddr = "10.0.0.3".parse().unwrap();

        assert!(limiter.check(ip));
        assert!(!limiter.check(ip));
        std::thread::sleep(Duration::from_millis(60));
        assert!(limiter.check(ip));
    }

    #[test]
    fn prune_discards_idle_ips() {
        let limiter = RateLimiter::new(10, Duration::from_millis(10));
        let ip: IpAddr = "10.0.0.4".parse().unwrap();
        limiter.check(ip);
        assert_eq!(limiter.tracked_ips(), 1);

        std::thread::sleep(Duration::from_millis(30));
        *limiter.last_prune.lock().unwrap() =
            Instant::now() - Duration::from_secs(PRUNE_INTERVAL_SECS + 1);

        let other: IpAddr = "10.0.0.5".parse().unwrap();
        limiter.check(other);
        assert_eq!(limiter.tracked_ips(), 1);
    }
}
