//! Window limiter state.

use std::time::Duration;

use tokio::time::Instant;

/// Limiter state for one named window, as pushed by [`crate::RateLimiter::set`].
#[derive(Debug, Clone, PartialEq)]
pub enum WindowLimit {
    /// Fixed capacity that fully replenishes every `window`.
    Resetting {
        limit: u64,
        remaining: u64,
        window: Duration,
        resets_at: Instant,
    },
    /// Continuously replenishing credit.
    TokenBucket {
        /// Units per second.
        rate: f64,
        /// Maximum accumulated credit.
        burst: u64,
    },
}

impl WindowLimit {
    /// A fresh resetting window with full capacity.
    pub fn resetting(limit: u64, window: Duration) -> Self {
        Self::Resetting {
            limit,
            remaining: limit,
            window,
            resets_at: Instant::now() + window,
        }
    }

    /// A resetting window with known remaining capacity and reset time.
    pub fn resetting_at(limit: u64, remaining: u64, window: Duration, resets_at: Instant) -> Self {
        Self::Resetting {
            limit,
            remaining: remaining.min(limit),
            window,
            resets_at,
        }
    }

    pub fn token_bucket(rate: f64, burst: u64) -> Self {
        Self::TokenBucket { rate, burst }
    }
}

/// Mutable counters of one window. Guarded by the window's own lock.
#[derive(Debug)]
pub(crate) enum WindowState {
    Resetting {
        limit: u64,
        remaining: u64,
        window: Duration,
        resets_at: Instant,
    },
    TokenBucket {
        rate: f64,
        burst: u64,
        credit: f64,
        updated: Instant,
    },
}

impl WindowState {
    pub(crate) fn new(limit: &WindowLimit, now: Instant) -> Self {
        match *limit {
            WindowLimit::Resetting {
                limit,
                remaining,
                window,
                resets_at,
            } => Self::Resetting {
                limit,
                remaining: remaining.min(limit),
                window,
                resets_at,
            },
            WindowLimit::TokenBucket { rate, burst } => Self::TokenBucket {
                rate,
                burst,
                credit: burst as f64,
                updated: now,
            },
        }
    }

    /// Overwrite fields in place. A token bucket keeps its accumulated credit.
    pub(crate) fn update(&mut self, limit: &WindowLimit, now: Instant) {
        let WindowLimit::TokenBucket {
            rate: new_rate,
            burst: new_burst,
        } = *limit
        else {
            *self = Self::new(limit, now);
            return;
        };

        self.replenish(now);
        match self {
            Self::TokenBucket {
                rate,
                burst,
                credit,
                ..
            } => {
                *rate = new_rate;
                *burst = new_burst;
                *credit = credit.min(new_burst as f64);
            }
            Self::Resetting { .. } => *self = Self::new(limit, now),
        }
    }

    /// Bring counters up to date with `now`.
    pub(crate) fn replenish(&mut self, now: Instant) {
        match self {
            Self::Resetting {
                limit,
                remaining,
                window,
                resets_at,
            } => {
                if now >= *resets_at {
                    *remaining = *limit;
                    *resets_at = now + *window;
                }
            }
            Self::TokenBucket {
                rate,
                burst,
                credit,
                updated,
            } => {
                let elapsed = now.saturating_duration_since(*updated).as_secs_f64();
                *credit = (*credit + elapsed * rate.max(0.0)).min(*burst as f64);
                *updated = now;
            }
        }
    }

    /// Largest cost this window can ever admit.
    pub(crate) fn capacity(&self) -> u64 {
        match self {
            Self::Resetting { limit, .. } => *limit,
            Self::TokenBucket { rate, burst, .. } if *rate > 0.0 => *burst,
            Self::TokenBucket { .. } => 0,
        }
    }

    /// How long until a resetting window can afford `cost`. Token buckets
    /// never make the caller wait here; they reserve instead.
    pub(crate) fn wait_for(&self, cost: u64, now: Instant) -> Duration {
        match self {
            Self::Resetting {
                remaining,
                resets_at,
                ..
            } if *remaining < cost => resets_at.saturating_duration_since(now),
            _ => Duration::ZERO,
        }
    }

    /// Deduct `cost`. Returns how long a token bucket reservation must wait
    /// for its credit to accrue.
    pub(crate) fn deduct(&mut self, cost: u64) -> Duration {
        match self {
            Self::Resetting { remaining, .. } => {
                *remaining = remaining.saturating_sub(cost);
                Duration::ZERO
            }
            Self::TokenBucket { rate, credit, .. } => {
                *credit -= cost as f64;
                if *credit >= 0.0 {
                    Duration::ZERO
                } else {
                    Duration::from_secs_f64(-*credit / *rate)
                }
            }
        }
    }

    /// Give back a deducted cost. A resetting window only takes it back if
    /// it has not reset since the deduction.
    pub(crate) fn refund(&mut self, cost: u64, epoch: Option<Instant>) {
        match self {
            Self::Resetting {
                limit,
                remaining,
                resets_at,
                ..
            } => {
                if epoch == Some(*resets_at) {
                    *remaining = (*remaining + cost).min(*limit);
                }
            }
            Self::TokenBucket { burst, credit, .. } => {
                *credit = (*credit + cost as f64).min(*burst as f64);
            }
        }
    }

    /// Reset time of a resetting window, used to detect resets between
    /// deduction and refund.
    pub(crate) fn epoch(&self) -> Option<Instant> {
        match self {
            Self::Resetting { resets_at, .. } => Some(*resets_at),
            Self::TokenBucket { .. } => None,
        }
    }

    pub(crate) fn snapshot(&self) -> WindowLimit {
        match *self {
            Self::Resetting {
                limit,
                remaining,
                window,
                resets_at,
            } => WindowLimit::Resetting {
                limit,
                remaining,
                window,
                resets_at,
            },
            Self::TokenBucket { rate, burst, .. } => WindowLimit::TokenBucket { rate, burst },
        }
    }

    /// Currently available units.
    pub(crate) fn available(&self) -> u64 {
        match self {
            Self::Resetting { remaining, .. } => *remaining,
            Self::TokenBucket { credit, .. } => credit.max(0.0).floor() as u64,
        }
    }
}
