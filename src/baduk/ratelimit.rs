//! Per-client sliding-window throttling for the auth endpoints.
//!
//! Each protected action owns a [`SlidingWindowLimiter`]. A limiter keeps one
//! [`Visitor`] per client key behind a single mutex; an idle sweeper evicts
//! visitors not seen for three windows.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, PoisonError, Weak},
    time::Duration,
};
use tokio::{task::JoinHandle, time::Instant};
use tracing::{debug, warn};

use super::RateLimitSettings;

pub const DEFAULT_SWEEP_PERIOD: Duration = Duration::from_secs(60);
const IDLE_WINDOWS: u32 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitAction {
    CreateUser,
    Activate,
    Login,
}

impl RateLimitAction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CreateUser => "create_user",
            Self::Activate => "activate",
            Self::Login => "login",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub limit: usize,
    pub window: Duration,
}

impl RateLimitPolicy {
    #[must_use]
    pub const fn new(limit: usize, window: Duration) -> Self {
        Self { limit, window }
    }
}

#[derive(Debug)]
struct Visitor {
    attempts: VecDeque<Instant>,
    last_seen: Instant,
}

#[derive(Debug)]
pub struct SlidingWindowLimiter {
    policy: RateLimitPolicy,
    visitors: Mutex<HashMap<String, Visitor>>,
}

impl SlidingWindowLimiter {
    #[must_use]
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self {
            policy,
            visitors: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn policy(&self) -> RateLimitPolicy {
        self.policy
    }

    /// Admit or reject one request from `key`.
    pub fn allow(&self, key: &str) -> bool {
        let now = Instant::now();
        let window = self.policy.window;
        let mut visitors = self.visitors.lock().unwrap_or_else(PoisonError::into_inner);

        let Some(visitor) = visitors.get_mut(key) else {
            visitors.insert(
                key.to_string(),
                Visitor {
                    attempts: VecDeque::from([now]),
                    last_seen: now,
                },
            );
            return true;
        };

        visitor.last_seen = now;
        while visitor
            .attempts
            .front()
            .is_some_and(|attempt| now.duration_since(*attempt) >= window)
        {
            visitor.attempts.pop_front();
        }

        if visitor.attempts.len() < self.policy.limit {
            visitor.attempts.push_back(now);
            true
        } else {
            false
        }
    }

    /// Drop visitors idle for more than three windows; returns how many went.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let idle = self.policy.window * IDLE_WINDOWS;
        let mut visitors = self.visitors.lock().unwrap_or_else(PoisonError::into_inner);
        let before = visitors.len();
        visitors.retain(|_, visitor| now.duration_since(visitor.last_seen) <= idle);
        before - visitors.len()
    }

    pub fn check(&self, key: &str) -> RateLimitDecision {
        if self.allow(key) {
            RateLimitDecision::Allowed
        } else {
            RateLimitDecision::Limited
        }
    }

    #[must_use]
    pub fn visitor_count(&self) -> usize {
        self.visitors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Periodic sweep; the task ends on its own once the limiter is dropped.
    #[must_use]
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let limiter: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(limiter) = limiter.upgrade() else {
                    break;
                };
                let removed = limiter.sweep();
                if removed > 0 {
                    debug!(removed, "evicted idle rate limit visitors");
                }
            }
        })
    }
}

/// One limiter per protected action.
pub struct RateLimits {
    create_user: Arc<SlidingWindowLimiter>,
    activate: Arc<SlidingWindowLimiter>,
    login: Arc<SlidingWindowLimiter>,
}

impl RateLimits {
    #[must_use]
    pub fn new(
        create_user: RateLimitPolicy,
        activate: RateLimitPolicy,
        login: RateLimitPolicy,
    ) -> Self {
        Self {
            create_user: Arc::new(SlidingWindowLimiter::new(create_user)),
            activate: Arc::new(SlidingWindowLimiter::new(activate)),
            login: Arc::new(SlidingWindowLimiter::new(login)),
        }
    }

    #[must_use]
    pub fn limiter(&self, action: RateLimitAction) -> &Arc<SlidingWindowLimiter> {
        match action {
            RateLimitAction::CreateUser => &self.create_user,
            RateLimitAction::Activate => &self.activate,
            RateLimitAction::Login => &self.login,
        }
    }

    pub fn check(&self, action: RateLimitAction, key: &str) -> RateLimitDecision {
        let decision = self.limiter(action).check(key);
        if decision == RateLimitDecision::Limited {
            warn!(action = action.as_str(), client = key, "rate limit exceeded");
        }
        decision
    }

    #[must_use]
    pub fn spawn_sweepers(&self, period: Duration) -> Vec<JoinHandle<()>> {
        [&self.create_user, &self.activate, &self.login]
            .into_iter()
            .map(|limiter| limiter.spawn_sweeper(period))
            .collect()
    }
}

impl From<&RateLimitSettings> for RateLimits {
    fn from(settings: &RateLimitSettings) -> Self {
        Self::new(settings.create_user, settings.activate, settings.login)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn limiter(limit: usize, window_secs: u64) -> SlidingWindowLimiter {
        SlidingWindowLimiter::new(RateLimitPolicy::new(
            limit,
            Duration::from_secs(window_secs),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn burst_over_limit_is_rejected() {
        let limiter = limiter(3, 60);
        for _ in 0..3 {
            assert!(limiter.allow("10.0.0.1"));
        }
        assert!(!limiter.allow("10.0.0.1"));
    }

    #[tokio::test(start_paused = true)]
    async fn admits_again_after_window() {
        let limiter = limiter(2, 60);
        assert!(limiter.allow("k"));
        assert!(limiter.allow("k"));
        assert!(!limiter.allow("k"));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(limiter.allow("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn window_slides_per_attempt() {
        let limiter = limiter(2, 60);
        assert!(limiter.allow("k"));
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(limiter.allow("k"));
        tokio::time::advance(Duration::from_secs(31)).await;
        // First attempt aged out, second is still inside the window.
        assert!(limiter.allow("k"));
        assert!(!limiter.allow("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_calls_do_not_grow_attempts() {
        let limiter = limiter(2, 60);
        for _ in 0..100 {
            limiter.allow("k");
        }
        let len = limiter
            .visitors
            .lock()
            .map(|v| v.get("k").map(|visitor| visitor.attempts.len()))
            .unwrap_or_default();
        assert_eq!(len, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn first_seen_key_is_admitted_even_with_zero_limit() {
        let limiter = limiter(0, 60);
        assert!(limiter.allow("new"));
        assert!(!limiter.allow("new"));
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_independent() {
        let limiter = limiter(1, 60);
        assert!(limiter.allow("a"));
        assert!(!limiter.allow("a"));
        assert!(limiter.allow("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_evicts_idle_visitors_only() {
        let limiter = limiter(5, 10);
        limiter.allow("idle");
        tokio::time::advance(Duration::from_secs(25)).await;
        limiter.allow("active");
        tokio::time::advance(Duration::from_secs(6)).await;

        assert_eq!(limiter.sweep(), 1);
        assert_eq!(limiter.visitor_count(), 1);
        assert!(limiter.check("active") == RateLimitDecision::Allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_runs_periodically() {
        let limiter = Arc::new(limiter(5, 1));
        limiter.allow("k");
        let handle = limiter.spawn_sweeper(Duration::from_secs(2));

        tokio::time::advance(Duration::from_secs(4)).await;
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;

        assert_eq!(limiter.visitor_count(), 0);
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_stops_when_limiter_dropped() {
        let limiter = Arc::new(limiter(5, 1));
        let handle = limiter.spawn_sweeper(Duration::from_secs(1));
        drop(limiter);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(handle.await.is_ok());
    }

    #[test]
    fn concurrent_callers_never_exceed_limit() {
        let limiter = Arc::new(limiter(25, 3600));
        let admitted = Arc::new(AtomicUsize::new(0));

        std::thread::scope(|scope| {
            for _ in 0..16 {
                let limiter = Arc::clone(&limiter);
                let admitted = Arc::clone(&admitted);
                scope.spawn(move || {
                    for _ in 0..50 {
                        if limiter.allow("shared") {
                            admitted.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                });
            }
        });

        assert_eq!(admitted.load(Ordering::SeqCst), 25);
    }

    #[test]
    fn rate_limits_follow_settings() {
        let settings = RateLimitSettings::default();
        let limits = RateLimits::from(&settings);
        assert_eq!(
            limits.limiter(RateLimitAction::Login).policy(),
            settings.login
        );
        assert_eq!(
            limits.limiter(RateLimitAction::CreateUser).policy(),
            settings.create_user
        );
    }

    #[test]
    fn rate_limits_route_actions_to_their_policies() {
        let limits = RateLimits::new(
            RateLimitPolicy::new(1, Duration::from_secs(60)),
            RateLimitPolicy::new(2, Duration::from_secs(60)),
            RateLimitPolicy::new(3, Duration::from_secs(60)),
        );
        assert_eq!(limits.limiter(RateLimitAction::CreateUser).policy().limit, 1);
        assert_eq!(limits.limiter(RateLimitAction::Activate).policy().limit, 2);
        assert_eq!(limits.limiter(RateLimitAction::Login).policy().limit, 3);

        assert_eq!(
            limits.check(RateLimitAction::CreateUser, "ip"),
            RateLimitDecision::Allowed
        );
        assert_eq!(
            limits.check(RateLimitAction::CreateUser, "ip"),
            RateLimitDecision::Limited
        );
        assert_eq!(
            limits.check(RateLimitAction::Login, "ip"),
            RateLimitDecision::Allowed
        );
    }
}
