//! Sliding-window admission control.
//!
//! Each key (a client connection or a conversation) may be admitted at
//! most `max` times within any `window`. A rejection tells the caller how
//! long until the oldest admission leaves the window.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::{PilotError, PilotResult};

/// Sliding-window counter keyed by string.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    window: Duration,
    max: usize,
    hits: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl SlidingWindowLimiter {
    /// Creates a limiter. `max == 0` admits everything.
    #[must_use]
    pub fn new(window: Duration, max: usize) -> Self {
        Self {
            window,
            max,
            hits: Mutex::new(HashMap::new()),
        }
    }

    /// Records an admission for `key`, or rejects it.
    ///
    /// # Errors
    ///
    /// Returns [`PilotError::RateLimited`] with the time until a slot frees
    /// up.
    pub fn check(&self, key: &str) -> PilotResult<()> {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &str, now: Instant) -> PilotResult<()> {
        if self.max == 0 {
            return Ok(());
        }

        let mut hits = self.hits.lock().unwrap_or_else(|p| p.into_inner());
        let entries = hits.entry(key.to_string()).or_default();
        while let Some(oldest) = entries.front() {
            if now.duration_since(*oldest) >= self.window {
                entries.pop_front();
            } else {
                break;
            }
        }

        if entries.len() >= self.max {
            let retry_after = entries
                .front()
                .map(|oldest| self.window.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(self.window);
            return Err(PilotError::rate_limited(retry_after.as_millis().max(1) as u64));
        }

        entries.push_back(now);
        Ok(())
    }

    /// Drops keys with no admission left inside the window. Returns how
    /// many keys were dropped.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    fn sweep_at(&self, now: Instant) -> usize {
        let mut hits = self.hits.lock().unwrap_or_else(|p| p.into_inner());
        let before = hits.len();
        hits.retain(|_, entries| {
            entries
                .back()
                .is_some_and(|latest| now.duration_since(*latest) < self.window)
        });
        before - hits.len()
    }
}
