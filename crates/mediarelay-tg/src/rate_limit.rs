//! Per-user rate limiting with fixed one-minute windows and a cooldown
//! penalty for going over the limit.

use crate::observability::metrics::RATE_LIMIT_REJECTIONS_TOTAL;
use crate::prelude::*;
use parking_lot::Mutex as SyncMutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::time::Duration;
use tokio::time::Instant;

/// Length of the window in which the requests are counted
pub(crate) const WINDOW: Duration = Duration::from_secs(60);

#[derive(Deserialize, Clone, Debug)]
pub(crate) struct Config {
    /// Max number of requests from a single user per [`WINDOW`]
    #[serde(default = "default_max_requests")]
    pub(crate) max_requests: u32,

    /// Duration of the lockout after the user exceeds the limit
    #[serde(default = "default_cooldown_secs")]
    pub(crate) cooldown_secs: u64,
}

fn default_max_requests() -> u32 {
    10
}

fn default_cooldown_secs() -> u64 {
    60
}

pub(crate) struct RateLimiter<K> {
    limit: u32,
    cooldown: Duration,
    state: SyncMutex<State<K>>,
}

struct State<K> {
    entries: HashMap<K, Entry>,

    /// Stale entries are evicted lazily at most once per [`WINDOW`]
    last_sweep: Instant,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    count: u32,
    window_start: Instant,
    cooldown_until: Option<Instant>,
}

impl Entry {
    fn new(now: Instant) -> Self {
        Self {
            count: 0,
            window_start: now,
            cooldown_until: None,
        }
    }

    fn rotate_window_if_stale(&mut self, now: Instant) {
        if now.duration_since(self.window_start) >= WINDOW {
            self.count = 0;
            self.window_start = now;
        }
    }

    fn cooldown_remaining(&self, now: Instant) -> Option<Duration> {
        self.cooldown_until
            .filter(|&until| until > now)
            .map(|until| until - now)
    }

    /// The entry carries no information that a fresh one wouldn't
    fn is_stale(&self, now: Instant) -> bool {
        now.duration_since(self.window_start) >= WINDOW && self.cooldown_remaining(now).is_none()
    }
}

impl<K: Hash + Eq + Clone + fmt::Debug> RateLimiter<K> {
    pub(crate) fn new(config: &Config) -> Self {
        Self::with_limits(config.max_requests, Duration::from_secs(config.cooldown_secs))
    }

    pub(crate) fn with_limits(limit: u32, cooldown: Duration) -> Self {
        Self {
            limit,
            cooldown,
            state: SyncMutex::new(State {
                entries: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    /// Checks if the user may make a request right now.
    ///
    /// This is not a pure query. If the user is already at the limit, every
    /// call to this method (re)starts the cooldown from the current moment.
    /// It must be called exactly once per incoming request, and if it returns
    /// `true`, [`Self::record_request`] must follow if the request is processed.
    pub(crate) fn can_make_request(&self, identity: &K) -> bool {
        let now = Instant::now();
        let allowed = self.with_entry(identity, now, |entry| {
            if entry.cooldown_remaining(now).is_some() {
                return false;
            }

            if entry.count >= self.limit {
                entry.cooldown_until = Some(now + self.cooldown);
                info!(
                    ?identity,
                    count = entry.count,
                    cooldown = tracing_duration(self.cooldown),
                    "Rate limit exceeded, cooldown started"
                );
                return false;
            }

            true
        });

        if !allowed {
            metrics::increment_counter!(RATE_LIMIT_REJECTIONS_TOTAL);
        }

        allowed
    }

    /// Counts the request in the current window. Doesn't check the limit.
    pub(crate) fn record_request(&self, identity: &K) {
        let now = Instant::now();
        self.with_entry(identity, now, |entry| {
            entry.count = entry.count.saturating_add(1);
        });
    }

    /// Side-effect-free query of the remaining cooldown duration
    pub(crate) fn cooldown_remaining(&self, identity: &K) -> Option<Duration> {
        let now = Instant::now();
        self.state
            .lock()
            .entries
            .get(identity)
            .and_then(|entry| entry.cooldown_remaining(now))
    }

    fn with_entry<R>(&self, identity: &K, now: Instant, f: impl FnOnce(&mut Entry) -> R) -> R {
        let mut state = self.state.lock();

        if now.duration_since(state.last_sweep) >= WINDOW {
            state.sweep(now);
        }

        let entry = state
            .entries
            .entry(identity.clone())
            .or_insert_with(|| Entry::new(now));

        entry.rotate_window_if_stale(now);

        f(entry)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.state.lock().entries.len()
    }
}

impl<K: Hash + Eq> State<K> {
    fn sweep(&mut self, now: Instant) {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_stale(now));
        self.last_sweep = now;

        let evicted = before - self.entries.len();
        if evicted > 0 {
            debug!(evicted, remaining = self.entries.len(), "Evicted stale rate limit entries");
        }
    }
}
