//! Rate limiting middleware.
//!
//! In-memory attempt limiting per client address using a sliding window.
//! An identity that reaches its limit is blocked for a fixed duration; every
//! attempt counts, whether or not the guarded handler later succeeds.

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::{sync::watch, task::JoinHandle, time::interval};
use tracing::{debug, warn};

use crate::error::AuthError;

/// Default period of the background eviction sweep.
pub const DEFAULT_SWEEP_PERIOD: Duration = Duration::from_secs(5 * 60);

/// Default block applied once an identity trips its limit.
pub const DEFAULT_BLOCK_DURATION: Duration = Duration::from_secs(15 * 60);

/// Longest block a limiter will apply; longer policies are clamped to this.
pub const MAX_BLOCK_DURATION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Limits for one class of endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    /// Maximum admitted attempts inside the trailing window.
    pub limit: usize,
    /// Trailing window length.
    pub window: Duration,
    /// How long an identity stays blocked after tripping the limit.
    pub block_duration: Duration,
}

impl RateLimitPolicy {
    /// 3 registrations per hour.
    pub fn register(block_duration: Duration) -> Self {
        Self {
            limit: 3,
            window: Duration::from_secs(60 * 60),
            block_duration,
        }
    }

    /// 5 login attempts per 5 minutes.
    pub fn login(block_duration: Duration) -> Self {
        Self {
            limit: 5,
            window: Duration::from_secs(5 * 60),
            block_duration,
        }
    }

    /// 10 verification attempts per 10 minutes.
    pub fn verify(block_duration: Duration) -> Self {
        Self {
            limit: 10,
            window: Duration::from_secs(10 * 60),
            block_duration,
        }
    }
}

#[derive(Debug, Default)]
struct IdentityState {
    timestamps: Vec<Instant>,
    blocked_until: Option<Instant>,
}

/// Per-identity sliding-window limiter with temporary blocks.
pub struct RateLimiter {
    name: &'static str,
    policy: RateLimitPolicy,
    state: Mutex<HashMap<String, IdentityState>>,
}

impl RateLimiter {
    pub fn new(name: &'static str, mut policy: RateLimitPolicy) -> Self {
        policy.block_duration = policy.block_duration.min(MAX_BLOCK_DURATION);
        Self {
            name,
            policy,
            state: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn policy(&self) -> RateLimitPolicy {
        self.policy
    }

    /// Record an attempt for `identity` and report whether it is admitted.
    pub fn allow(&self, identity: &str) -> bool {
        self.allow_at(identity, Instant::now())
    }

    pub fn allow_at(&self, identity: &str, now: Instant) -> bool {
        let mut state = self.state.lock();
        let entry = state.entry(identity.to_string()).or_default();

        if let Some(until) = entry.blocked_until {
            if now < until {
                return false;
            }
            entry.blocked_until = None;
        }

        let window = self.policy.window;
        entry
            .timestamps
            .retain(|t| now.saturating_duration_since(*t) < window);

        if entry.timestamps.len() >= self.policy.limit {
            entry.blocked_until = Some(now + self.policy.block_duration);
            warn!(
                limiter = self.name,
                identity,
                block_secs = self.policy.block_duration.as_secs(),
                "Rate limit tripped, identity blocked"
            );
            return false;
        }

        entry.timestamps.push(now);
        true
    }

    /// Whether `identity` is blocked and for how much longer. Never consumes a slot.
    pub fn is_blocked(&self, identity: &str) -> (bool, Duration) {
        self.is_blocked_at(identity, Instant::now())
    }

    pub fn is_blocked_at(&self, identity: &str, now: Instant) -> (bool, Duration) {
        let state = self.state.lock();
        match state.get(identity).and_then(|e| e.blocked_until) {
            Some(until) if now < until => (true, until - now),
            _ => (false, Duration::ZERO),
        }
    }

    /// Evict aged timestamps, lapsed blocks and idle identities. Returns identities removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        let window = self.policy.window;
        let mut state = self.state.lock();
        let before = state.len();

        state.retain(|_, entry| {
            entry
                .timestamps
                .retain(|t| now.saturating_duration_since(*t) < window);
            if entry.blocked_until.is_some_and(|until| now >= until) {
                entry.blocked_until = None;
            }
            !entry.timestamps.is_empty() || entry.blocked_until.is_some()
        });

        before - state.len()
    }

    /// Number of identities currently held in memory.
    pub fn tracked_identities(&self) -> usize {
        self.state.lock().len()
    }

    /// Start the periodic sweep. The task runs until [`SweeperHandle::shutdown`].
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> SweeperHandle {
        let limiter = Arc::clone(self);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = limiter.sweep();
                        debug!(
                            limiter = limiter.name,
                            evicted,
                            tracked = limiter.tracked_identities(),
                            "Rate limit sweep"
                        );
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            debug!(limiter = limiter.name, "Rate limit sweeper stopped");
        });

        SweeperHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}

/// Owned handle to a running sweeper task.
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Signal the sweeper to stop and wait for it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!("Rate limit sweeper ended abnormally: {e}");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Resolve the rate-limit identity for a request.
///
/// `X-Forwarded-For` is honoured only when the TCP peer is a trusted proxy; the
/// chain is walked right to left and the first address that is not itself a
/// trusted proxy wins. Anything unparseable ends the walk.
pub fn client_identity(peer: SocketAddr, headers: &HeaderMap, trusted_proxies: &[IpAddr]) -> IpAddr {
    let peer_ip = peer.ip();
    if !trusted_proxies.contains(&peer_ip) {
        return peer_ip;
    }

    let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    else {
        return peer_ip;
    };

    for hop in forwarded.rsplit(',') {
        match hop.trim().parse::<IpAddr>() {
            Ok(ip) if trusted_proxies.contains(&ip) => continue,
            Ok(ip) => return ip,
            Err(_) => break,
        }
    }

    peer_ip
}

/// State for one guarded route class.
#[derive(Clone)]
pub struct RouteGuard {
    limiter: Arc<RateLimiter>,
    trusted_proxies: Arc<[IpAddr]>,
}

impl RouteGuard {
    pub fn new(limiter: Arc<RateLimiter>, trusted_proxies: Arc<[IpAddr]>) -> Self {
        Self {
            limiter,
            trusted_proxies,
        }
    }
}

/// Rate limiting middleware function.
pub async fn rate_limit_guard(
    State(guard): State<RouteGuard>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let ip = client_identity(addr, request.headers(), &guard.trusted_proxies);
    let identity = ip.to_string();

    if let (true, remaining) = guard.limiter.is_blocked(&identity) {
        warn!(
            limiter = guard.limiter.name(),
            ip = %ip,
            retry_after_secs = remaining.as_secs(),
            "Blocked identity rejected"
        );
        return AuthError::RateLimited {
            retry_after: remaining,
        }
        .into_response();
    }

    if !guard.limiter.allow(&identity) {
        return AuthError::RateLimited {
            retry_after: guard.limiter.policy().block_duration,
        }
        .into_response();
    }

    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::connect_info::MockConnectInfo, http::StatusCode, middleware, routing::post,
        Router,
    };
    use std::sync::Barrier;
    use tower::ServiceExt;

    const MINUTE: Duration = Duration::from_secs(60);

    fn limiter(limit: usize, window: Duration) -> RateLimiter {
        RateLimiter::new(
            "test",
            RateLimitPolicy {
                limit,
                window,
                block_duration: 15 * MINUTE,
            },
        )
    }

    #[test]
    fn test_blocks_after_limit_then_recovers() {
        let limiter = limiter(3, 60 * MINUTE);
        let t0 = Instant::now();

        for i in 0..3 {
            assert!(limiter.allow_at("x", t0 + Duration::from_secs(i)), "call {i}");
        }
        let tripped_at = t0 + Duration::from_secs(3);
        assert!(!limiter.allow_at("x", tripped_at));

        let (blocked, remaining) = limiter.is_blocked_at("x", tripped_at);
        assert!(blocked);
        assert_eq!(remaining, 15 * MINUTE);

        // Still blocked right before the block lapses
        assert!(!limiter.allow_at("x", tripped_at + 15 * MINUTE - Duration::from_secs(1)));

        // The window is an hour, so the first three still count once the
        // block ends: clearing the block does not reset the window.
        let after_block = tripped_at + 15 * MINUTE;
        assert!(!limiter.is_blocked_at("x", after_block).0);
        assert!(!limiter.allow_at("x", after_block));

        // Past both the block and the window the identity is admitted again.
        let much_later = t0 + 60 * MINUTE + 30 * MINUTE;
        assert!(limiter.allow_at("x", much_later));
    }

    #[test]
    fn test_admitted_again_after_block_with_short_window() {
        let limiter = limiter(3, 5 * MINUTE);
        let t0 = Instant::now();

        for i in 0..3 {
            assert!(limiter.allow_at("x", t0 + Duration::from_secs(i)));
        }
        assert!(!limiter.allow_at("x", t0 + Duration::from_secs(10)));
        assert!(limiter.is_blocked_at("x", t0 + Duration::from_secs(10)).0);

        let after = t0 + Duration::from_secs(10) + 15 * MINUTE;
        assert!(limiter.allow_at("x", after));
    }

    #[test]
    fn test_admitted_again_when_block_outlasts_window() {
        let limiter = RateLimiter::new(
            "test",
            RateLimitPolicy {
                limit: 3,
                window: 60 * MINUTE,
                block_duration: 60 * MINUTE,
            },
        );
        let t0 = Instant::now();

        for i in 0..3 {
            assert!(limiter.allow_at("x", t0 + Duration::from_secs(i)));
        }
        let tripped_at = t0 + Duration::from_secs(3);
        assert!(!limiter.allow_at("x", tripped_at));
        assert!(!limiter.allow_at("x", tripped_at + 59 * MINUTE));

        assert!(limiter.allow_at("x", tripped_at + 60 * MINUTE));
    }

    #[test]
    fn test_oversized_block_is_clamped() {
        let limiter = RateLimiter::new(
            "test",
            RateLimitPolicy {
                limit: 1,
                window: MINUTE,
                block_duration: Duration::from_secs(u64::MAX),
            },
        );
        assert_eq!(limiter.policy().block_duration, MAX_BLOCK_DURATION);

        let t0 = Instant::now();
        assert!(limiter.allow_at("a", t0));
        assert!(!limiter.allow_at("a", t0));
        assert_eq!(limiter.is_blocked_at("a", t0), (true, MAX_BLOCK_DURATION));
    }

    #[test]
    fn test_is_blocked_does_not_consume_slots() {
        let limiter = limiter(2, 5 * MINUTE);
        let t0 = Instant::now();

        for _ in 0..10 {
            assert_eq!(limiter.is_blocked_at("y", t0), (false, Duration::ZERO));
        }
        assert!(limiter.allow_at("y", t0));
        assert!(limiter.allow_at("y", t0));
    }

    #[test]
    fn test_sliding_window_differs_from_fixed_bucket() {
        let limiter = limiter(5, 5 * MINUTE);
        let t0 = Instant::now();

        // One call per minute at minutes 0..=4
        for m in 0..5 {
            assert!(limiter.allow_at("y", t0 + m * MINUTE), "minute {m}");
        }

        // Minute 5: the minute-0 attempt has aged out individually
        assert!(limiter.allow_at("y", t0 + 5 * MINUTE));

        // A fixed [5, 10) bucket would admit this; the sliding window still
        // holds attempts from minutes 1..=5 and denies it.
        assert!(!limiter.allow_at("y", t0 + 5 * MINUTE + Duration::from_secs(1)));
    }

    #[test]
    fn test_identities_are_independent() {
        let limiter = limiter(1, 5 * MINUTE);
        let t0 = Instant::now();

        assert!(limiter.allow_at("a", t0));
        assert!(!limiter.allow_at("a", t0));
        assert!(limiter.allow_at("b", t0));
    }

    #[test]
    fn test_concurrent_calls_never_over_admit() {
        let limiter = Arc::new(limiter(10, 60 * MINUTE));
        for _ in 0..9 {
            assert!(limiter.allow("z"));
        }

        let barrier = Arc::new(Barrier::new(5));
        let handles: Vec<_> = (0..5)
            .map(|_| {
                let limiter = limiter.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    limiter.allow("z")
                })
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(admitted, 1);
        assert!(limiter.is_blocked("z").0);
    }

    #[test]
    fn test_sweep_evicts_idle_and_keeps_blocked() {
        let limiter = limiter(1, 5 * MINUTE);
        let t0 = Instant::now();

        assert!(limiter.allow_at("idle", t0));
        assert!(limiter.allow_at("blocked", t0));
        assert!(!limiter.allow_at("blocked", t0));
        assert_eq!(limiter.tracked_identities(), 2);

        // Window passed, block still active
        let evicted = limiter.sweep_at(t0 + 6 * MINUTE);
        assert_eq!(evicted, 1);
        assert_eq!(limiter.tracked_identities(), 1);
        assert!(limiter.is_blocked_at("blocked", t0 + 6 * MINUTE).0);

        // Block lapsed too
        assert_eq!(limiter.sweep_at(t0 + 16 * MINUTE), 1);
        assert_eq!(limiter.tracked_identities(), 0);
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_shutdown() {
        let limiter = Arc::new(limiter(1, Duration::from_millis(10)));
        assert!(limiter.allow("a"));

        let handle = limiter.spawn_sweeper(Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(limiter.tracked_identities(), 0);

        assert!(!handle.is_finished());
        handle.shutdown().await;
    }

    #[test]
    fn test_forwarded_for_ignored_from_untrusted_peer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "1.2.3.4".parse().unwrap());
        let peer: SocketAddr = "203.0.113.9:5000".parse().unwrap();

        assert_eq!(
            client_identity(peer, &headers, &[]),
            "203.0.113.9".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn test_forwarded_for_walks_trusted_chain() {
        let proxy: IpAddr = "10.0.0.1".parse().unwrap();
        let inner: IpAddr = "10.0.0.2".parse().unwrap();
        let peer = SocketAddr::new(proxy, 443);

        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            "6.6.6.6, 198.51.100.7, 10.0.0.2".parse().unwrap(),
        );
        assert_eq!(
            client_identity(peer, &headers, &[proxy, inner]),
            "198.51.100.7".parse::<IpAddr>().unwrap()
        );

        headers.insert("x-forwarded-for", "garbage, 10.0.0.2".parse().unwrap());
        assert_eq!(client_identity(peer, &headers, &[proxy, inner]), proxy);
    }

    #[tokio::test]
    async fn test_guard_returns_429_with_minutes() {
        let limiter = Arc::new(limiter(1, 5 * MINUTE));
        let guard = RouteGuard::new(limiter, Arc::from(Vec::<IpAddr>::new()));

        let app = Router::new()
            .route(
                "/api/login",
                post(|| async { "ok" })
                    .layer(middleware::from_fn_with_state(guard, rate_limit_guard)),
            )
            .layer(MockConnectInfo(SocketAddr::from(([192, 0, 2, 1], 4000))));

        let request = || {
            Request::builder()
                .method("POST")
                .uri("/api/login")
                .body(Body::empty())
                .unwrap()
        };

        let first = app.clone().oneshot(request()).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app.clone().oneshot(request()).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);

        let third = app.oneshot(request()).await.unwrap();
        assert_eq!(third.status(), StatusCode::TOO_MANY_REQUESTS);
        let body = axum::body::to_bytes(third.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["retry_after_minutes"], 15);
    }
}
