//! Per-operator rate limiting with denial backoff.
//!
//! Two gates guard every incoming interaction: a 60-second sliding request
//! window and an exponential backoff that kicks in after repeated denials.
//! Both gates are always evaluated on every check so response latency does
//! not reveal which one blocked the caller.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

const WINDOW_SECS: i64 = 60;
const MIN_WAIT_SECS: f64 = 0.1;

/// Rate limiting state for a single operator identity.
#[derive(Debug, Clone, Default)]
pub struct UserRateState {
    request_times: Vec<DateTime<Utc>>,
    denial_count: u32,
    last_denial: Option<DateTime<Utc>>,
    backoff_until: Option<DateTime<Utc>>,
}

/// Snapshot of one identity's rate state, for the status surface.
#[derive(Debug, Clone, PartialEq)]
pub struct UserRateStats {
    pub requests_last_minute: usize,
    pub requests_remaining: usize,
    pub denial_count: u32,
    pub in_backoff: bool,
    pub backoff_remaining: f64,
}

/// Per-identity limiter. Identities never block each other: the shared map
/// lock only resolves the per-identity cell, and all state mutation happens
/// under that identity's own lock.
pub struct RateLimiter {
    states: Mutex<HashMap<u64, Arc<Mutex<UserRateState>>>>,
    requests_per_minute: usize,
    denial_backoff_base: f64,
    denial_backoff_max: f64,
    denial_threshold: u32,
}

impl RateLimiter {
    pub fn new(
        requests_per_minute: usize,
        denial_backoff_base: f64,
        denial_backoff_max: f64,
        denial_threshold: u32,
    ) -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            requests_per_minute,
            denial_backoff_base,
            denial_backoff_max,
            denial_threshold,
        }
    }

    /// Check whether `user_id` may interact right now.
    ///
    /// Returns `(allowed, wait_seconds)`. When both gates would block, the
    /// denial backoff's wait is reported.
    pub fn check_rate_limit(&self, user_id: u64) -> (bool, Option<f64>) {
        let cell = self.cell(user_id);
        let mut state = lock(&cell);
        let now = Utc::now();

        // Evaluate both gates unconditionally; see module docs.
        let denial_wait = state
            .backoff_until
            .filter(|until| *until > now)
            .map(|until| seconds_between(now, until));

        state.request_times.retain(|t| now.signed_duration_since(*t).num_seconds() < WINDOW_SECS);
        let rate_limited = state.request_times.len() >= self.requests_per_minute;
        let rate_wait = if rate_limited {
            state
                .request_times
                .first()
                .map(|oldest| {
                    let elapsed = now.signed_duration_since(*oldest);
                    (WINDOW_SECS as f64) - as_seconds(elapsed)
                })
                .unwrap_or(0.0)
        } else {
            0.0
        };

        if let Some(wait) = denial_wait {
            return (false, Some(wait.max(MIN_WAIT_SECS)));
        }
        if rate_limited {
            return (false, Some(rate_wait.max(MIN_WAIT_SECS)));
        }
        (true, None)
    }

    pub fn record_request(&self, user_id: u64) {
        let cell = self.cell(user_id);
        let mut state = lock(&cell);
        state.request_times.push(Utc::now());
    }

    /// Record a denial. Once the count reaches the threshold, each further
    /// denial doubles the backoff up to the configured ceiling.
    pub fn record_denial(&self, user_id: u64) {
        let cell = self.cell(user_id);
        let mut state = lock(&cell);
        let now = Utc::now();
        state.denial_count += 1;
        state.last_denial = Some(now);

        if state.denial_count >= self.denial_threshold {
            let exponent = state.denial_count - self.denial_threshold;
            let backoff = (self.denial_backoff_base * 2f64.powi(exponent as i32))
                .min(self.denial_backoff_max);
            state.backoff_until = now.checked_add_signed(
                TimeDelta::milliseconds((backoff * 1000.0) as i64),
            );
        }
    }

    /// An approval wipes the denial slate clean.
    pub fn record_approval(&self, user_id: u64) {
        let cell = self.cell(user_id);
        let mut state = lock(&cell);
        state.denial_count = 0;
        state.backoff_until = None;
    }

    pub fn clear_user(&self, user_id: u64) {
        lock_map(&self.states).remove(&user_id);
    }

    pub fn user_stats(&self, user_id: u64) -> UserRateStats {
        let cell = self.cell(user_id);
        let mut state = lock(&cell);
        let now = Utc::now();
        state.request_times.retain(|t| now.signed_duration_since(*t).num_seconds() < WINDOW_SECS);

        let recent = state.request_times.len();
        let backoff_remaining = state
            .backoff_until
            .filter(|until| *until > now)
            .map_or(0.0, |until| seconds_between(now, until));

        UserRateStats {
            requests_last_minute: recent,
            requests_remaining: self.requests_per_minute.saturating_sub(recent),
            denial_count: state.denial_count,
            in_backoff: backoff_remaining > 0.0,
            backoff_remaining,
        }
    }

    /// Drop identities with no recent activity and no live backoff, keeping
    /// the map bounded over long bridge sessions.
    pub fn sweep_stale(&self, max_idle: Duration) -> usize {
        let now = Utc::now();
        let max_idle = TimeDelta::from_std(max_idle).unwrap_or(TimeDelta::MAX);
        let mut map = lock_map(&self.states);
        let before = map.len();
        map.retain(|_, cell| {
            let state = lock(cell);
            let live_backoff = state.backoff_until.is_some_and(|until| until > now);
            let last_seen = state
                .request_times
                .last()
                .copied()
                .into_iter()
                .chain(state.last_denial)
                .max();
            live_backoff
                || last_seen.is_some_and(|t| now.signed_duration_since(t) < max_idle)
        });
        before - map.len()
    }

    fn cell(&self, user_id: u64) -> Arc<Mutex<UserRateState>> {
        let mut map = lock_map(&self.states);
        Arc::clone(map.entry(user_id).or_default())
    }
}

fn lock(cell: &Arc<Mutex<UserRateState>>) -> MutexGuard<'_, UserRateState> {
    cell.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn lock_map(
    states: &Mutex<HashMap<u64, Arc<Mutex<UserRateState>>>>,
) -> MutexGuard<'_, HashMap<u64, Arc<Mutex<UserRateState>>>> {
    states
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    as_seconds(to.signed_duration_since(from))
}

fn as_seconds(delta: TimeDelta) -> f64 {
    delta.num_milliseconds() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::RateLimiter;
    use chrono::{TimeDelta, Utc};

    fn limiter() -> RateLimiter {
        RateLimiter::new(5, 5.0, 300.0, 3)
    }

    #[test]
    fn allows_until_the_window_is_full() {
        let rl = limiter();
        for _ in 0..5 {
            let (allowed, wait) = rl.check_rate_limit(1);
            assert!(allowed);
            assert!(wait.is_none());
            rl.record_request(1);
        }
        let (allowed, wait) = rl.check_rate_limit(1);
        assert!(!allowed);
        assert!(wait.unwrap() > 0.0);
    }

    #[test]
    fn window_ages_out() {
        let rl = limiter();
        for _ in 0..5 {
            rl.record_request(1);
        }
        // Backdate every recorded request beyond the window.
        {
            let cell = rl.cell(1);
            let mut state = super::lock(&cell);
            let past = Utc::now() - TimeDelta::seconds(61);
            for t in &mut state.request_times {
                *t = past;
            }
        }
        let (allowed, _) = rl.check_rate_limit(1);
        assert!(allowed);
    }

    #[test]
    fn identities_do_not_share_windows() {
        let rl = limiter();
        for _ in 0..5 {
            rl.record_request(1);
        }
        assert!(!rl.check_rate_limit(1).0);
        assert!(rl.check_rate_limit(2).0);
    }

    #[test]
    fn backoff_starts_at_the_threshold_and_grows_exponentially() {
        let rl = limiter();
        rl.record_denial(1);
        rl.record_denial(1);
        assert!(rl.check_rate_limit(1).0, "below threshold, no backoff");

        rl.record_denial(1); // 3rd denial: backoff = base * 2^0 = 5s
        let (allowed, wait) = rl.check_rate_limit(1);
        assert!(!allowed);
        let wait3 = wait.unwrap();
        assert!(wait3 > 3.0 && wait3 <= 5.0, "wait3 = {wait3}");

        rl.record_denial(1); // 4th: base * 2^1 = 10s
        let wait4 = rl.check_rate_limit(1).1.unwrap();
        assert!(wait4 > wait3, "backoff must grow: {wait4} <= {wait3}");

        rl.record_denial(1); // 5th: base * 2^2 = 20s
        let wait5 = rl.check_rate_limit(1).1.unwrap();
        assert!(wait5 > wait4);
    }

    #[test]
    fn backoff_is_capped_at_the_ceiling() {
        let rl = RateLimiter::new(100, 5.0, 40.0, 1);
        for _ in 0..20 {
            rl.record_denial(1);
        }
        let wait = rl.check_rate_limit(1).1.unwrap();
        assert!(wait <= 40.0, "wait = {wait}");
    }

    #[test]
    fn approval_resets_denials_and_clears_backoff() {
        let rl = limiter();
        for _ in 0..4 {
            rl.record_denial(1);
        }
        assert!(!rl.check_rate_limit(1).0);

        rl.record_approval(1);
        assert!(rl.check_rate_limit(1).0);
        assert_eq!(rl.user_stats(1).denial_count, 0);
    }

    #[test]
    fn denial_backoff_wins_over_the_request_window() {
        let rl = RateLimiter::new(1, 500.0, 500.0, 1);
        rl.record_request(1);
        rl.record_request(1);
        rl.record_denial(1);

        let (allowed, wait) = rl.check_rate_limit(1);
        assert!(!allowed);
        // Window wait is at most 60s; the reported wait is the backoff's.
        assert!(wait.unwrap() > 60.0);
    }

    #[test]
    fn stats_reflect_the_window() {
        let rl = limiter();
        rl.record_request(1);
        rl.record_request(1);
        let stats = rl.user_stats(1);
        assert_eq!(stats.requests_last_minute, 2);
        assert_eq!(stats.requests_remaining, 3);
        assert!(!stats.in_backoff);
    }

    #[test]
    fn sweep_drops_idle_identities_but_keeps_live_backoff() {
        let rl = limiter();
        rl.record_request(1);
        for _ in 0..5 {
            rl.record_denial(2); // identity 2 is in backoff
        }
        // Backdate identity 1's activity.
        {
            let cell = rl.cell(1);
            let mut state = super::lock(&cell);
            let past = Utc::now() - TimeDelta::hours(2);
            for t in &mut state.request_times {
                *t = past;
            }
        }
        let swept = rl.sweep_stale(std::time::Duration::from_secs(3600));
        assert_eq!(swept, 1);
        assert!(!rl.check_rate_limit(2).0, "backoff survives the sweep");
    }

    #[test]
    fn clear_user_resets_everything() {
        let rl = limiter();
        for _ in 0..5 {
            rl.record_request(1);
            rl.record_denial(1);
        }
        rl.clear_user(1);
        assert!(rl.check_rate_limit(1).0);
    }
}
