//! Keyed multi-window rate limiter.
//!
//! The registry maps a key to its windows. Creation of keys and windows goes
//! through reader/writer locks; the counters of every window sit behind the
//! window's own mutex, so `take` and `set` on different keys never contend.
//!
//! Waiters under heavy contention are not served in FIFO order: when a
//! window resets, whichever caller re-checks first claims the replenished
//! capacity.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::display::WindowStatus;
use crate::error::{RateLimitError, Result};
use crate::window::{WindowLimit, WindowState};

type Window = Arc<Mutex<WindowState>>;

/// Windows of one key.
#[derive(Debug, Default)]
struct KeyLimiter {
    windows: RwLock<BTreeMap<String, Window>>,
    /// Fired by every `set` so blocked callers re-check.
    updated: Notify,
}

impl KeyLimiter {
    /// Windows named in `costs`, in window name order. Unknown windows and
    /// zero costs are skipped.
    fn lookup(&self, costs: &[(&str, u64)]) -> Vec<(String, u64, Window)> {
        let windows = self.windows.read();
        let mut found: Vec<_> = costs
            .iter()
            .filter(|(_, cost)| *cost > 0)
            .filter_map(|(name, cost)| {
                windows
                    .get(*name)
                    .map(|w| (name.to_string(), *cost, Arc::clone(w)))
            })
            .collect();
        found.sort_by(|a, b| a.0.cmp(&b.0));
        found
    }
}

/// Outcome of one admission attempt.
enum Admission {
    Granted,
    /// Costs were deducted but token buckets are in debt for `delay`.
    Reserved {
        delay: Duration,
        reservation: Vec<(Window, u64, Option<Instant>)>,
    },
    Wait(Duration),
}

/// Process-wide rate limiter shared by all providers.
#[derive(Debug, Default)]
pub struct RateLimiter {
    keys: RwLock<HashMap<String, Arc<KeyLimiter>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &str) -> Option<Arc<KeyLimiter>> {
        self.keys.read().get(key).cloned()
    }

    fn entry_or_create(&self, key: &str) -> Arc<KeyLimiter> {
        if let Some(entry) = self.entry(key) {
            return entry;
        }
        let mut keys = self.keys.write();
        Arc::clone(keys.entry(key.to_string()).or_default())
    }

    /// Block until every named window of `key` can afford its cost.
    ///
    /// Unknown keys and windows admit immediately. Fails with
    /// [`RateLimitError::RequestTooLarge`] when a cost exceeds the window's
    /// capacity and with [`RateLimitError::Cancelled`] when `cancel` fires.
    pub async fn take(
        &self,
        cancel: &CancellationToken,
        key: &str,
        costs: &[(&str, u64)],
    ) -> Result<()> {
        let Some(entry) = self.entry(key) else {
            debug!(key, "No rate limits known, admitting");
            return Ok(());
        };

        loop {
            if cancel.is_cancelled() {
                return Err(RateLimitError::Cancelled);
            }

            // Register interest before checking so a concurrent `set` is not missed.
            let updated = entry.updated.notified();
            tokio::pin!(updated);
            updated.as_mut().enable();

            let windows = entry.lookup(costs);
            if windows.is_empty() {
                return Ok(());
            }

            match admit(key, &windows)? {
                Admission::Granted => return Ok(()),
                Admission::Reserved { delay, reservation } => {
                    debug!(key, delay_ms = delay.as_millis(), "Waiting for token bucket reservation");
                    tokio::select! {
                        _ = sleep(delay) => return Ok(()),
                        _ = cancel.cancelled() => {
                            for (window, cost, epoch) in reservation {
                                window.lock().refund(cost, epoch);
                            }
                            return Err(RateLimitError::Cancelled);
                        }
                    }
                }
                Admission::Wait(delay) => {
                    debug!(key, delay_ms = delay.as_millis(), "Waiting for rate limit window");
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = &mut updated => debug!(key, "Rate limits updated, re-checking"),
                        _ = cancel.cancelled() => return Err(RateLimitError::Cancelled),
                    }
                }
            }
        }
    }

    /// Create or update windows of `key`. Existing windows are overwritten in
    /// place; blocked callers are woken to re-check.
    pub fn set(&self, key: &str, limits: &HashMap<String, WindowLimit>) {
        let entry = self.entry_or_create(key);
        let now = Instant::now();
        {
            let mut windows = entry.windows.write();
            for (name, limit) in limits {
                match windows.get(name) {
                    Some(window) => window.lock().update(limit, now),
                    None => {
                        windows.insert(name.clone(), Arc::new(Mutex::new(WindowState::new(limit, now))));
                    }
                }
            }
        }
        debug!(key, windows = limits.len(), "Rate limits set");
        entry.updated.notify_waiters();
    }

    /// Create windows of `key` that do not exist yet. Existing state is left
    /// untouched.
    pub fn ensure(&self, key: &str, limits: &HashMap<String, WindowLimit>) {
        let entry = self.entry_or_create(key);
        let now = Instant::now();
        let mut windows = entry.windows.write();
        for (name, limit) in limits {
            windows
                .entry(name.clone())
                .or_insert_with(|| Arc::new(Mutex::new(WindowState::new(limit, now))));
        }
    }

    /// Current state of every window of `key`, in window name order.
    pub fn status(&self, key: &str) -> Vec<WindowStatus> {
        let Some(entry) = self.entry(key) else {
            return Vec::new();
        };
        let now = Instant::now();
        let windows = entry.windows.read();
        windows
            .iter()
            .map(|(name, window)| {
                let mut state = window.lock();
                state.replenish(now);
                WindowStatus {
                    name: name.clone(),
                    limit: state.snapshot(),
                    available: state.available(),
                }
            })
            .collect()
    }
}

/// Check and deduct all windows at once. Locks are taken in window name order
/// and released before returning.
fn admit(key: &str, windows: &[(String, u64, Window)]) -> Result<Admission> {
    let now = Instant::now();
    let mut guards: Vec<_> = windows.iter().map(|(_, _, w)| w.lock()).collect();

    let mut wait = Duration::ZERO;
    for ((name, cost, _), state) in windows.iter().zip(guards.iter_mut()) {
        state.replenish(now);
        let capacity = state.capacity();
        if *cost > capacity {
            return Err(RateLimitError::RequestTooLarge {
                key: key.to_string(),
                window: name.clone(),
                cost: *cost,
                limit: capacity,
            });
        }
        wait = wait.max(state.wait_for(*cost, now));
    }

    if !wait.is_zero() {
        return Ok(Admission::Wait(wait));
    }

    let mut delay = Duration::ZERO;
    let mut reservation = Vec::with_capacity(windows.len());
    for ((_, cost, window), state) in windows.iter().zip(guards.iter_mut()) {
        let epoch = state.epoch();
        delay = delay.max(state.deduct(*cost));
        reservation.push((Arc::clone(window), *cost, epoch));
    }

    if delay.is_zero() {
        Ok(Admission::Granted)
    } else {
        Ok(Admission::Reserved { delay, reservation })
    }
}
