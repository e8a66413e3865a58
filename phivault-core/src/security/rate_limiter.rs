//! Decryption Rate Limiting
//!
//! Guards against bulk PHI reads by tracking per-caller decryptions in three
//! sliding windows (burst, minute, hour). A caller is denied before any
//! plaintext is produced once any window is at its cap.
//!
//! State is per-process. Deployments running several instances must move
//! these counters into a shared store for the limits to hold globally.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Window sizes and caps for the decryption limiter
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    pub burst_window: Duration,
    pub burst_limit: u32,
    pub minute_window: Duration,
    pub minute_limit: u32,
    pub hour_window: Duration,
    pub hour_limit: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            burst_window: Duration::from_secs(5),   // 20 decryptions
            burst_limit: 20,                        // per 5 seconds
            minute_window: Duration::from_secs(60), // 100 per minute
            minute_limit: 100,
            hour_window: Duration::from_secs(3600), // 1000 per hour
            hour_limit: 1000,
        }
    }
}

impl RateLimitConfig {
    fn windows(&self) -> [(&'static str, Duration, u32); 3] {
        [
            ("burst", self.burst_window, self.burst_limit),
            ("minute", self.minute_window, self.minute_limit),
            ("hour", self.hour_window, self.hour_limit),
        ]
    }

    fn longest_window(&self) -> Duration {
        self.burst_window.max(self.minute_window).max(self.hour_window)
    }
}

/// Which window denied a caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDenial {
    pub window: &'static str,
    pub window_duration: Duration,
    pub limit: u32,
}

/// Decryption slot held by a caller between [`DecryptionRateLimiter::acquire`]
/// and the end of the decryption
#[must_use = "a failed decryption should hand its slot back with `release`"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitSlot {
    reserved_at: Instant,
}

/// Per-window usage for one caller
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RateLimitStats {
    pub user_id: String,
    pub burst_count: usize,
    pub burst_limit: u32,
    pub minute_count: usize,
    pub minute_limit: u32,
    pub hour_count: usize,
    pub hour_limit: u32,
    pub is_limited: bool,
}

#[derive(Debug)]
struct CallerWindows {
    /// Decryption timestamps, oldest first, trimmed to the longest window
    decryptions: VecDeque<Instant>,
    last_activity: Instant,
}

impl CallerWindows {
    fn new() -> Self {
        Self {
            decryptions: VecDeque::new(),
            last_activity: Instant::now(),
        }
    }

    fn trim(&mut self, longest: Duration, now: Instant) {
        while let Some(&oldest) = self.decryptions.front() {
            if now.duration_since(oldest) >= longest {
                self.decryptions.pop_front();
            } else {
                break;
            }
        }
    }

    fn count_within(&self, window: Duration, now: Instant) -> usize {
        self.decryptions
            .iter()
            .rev()
            .take_while(|&&t| now.duration_since(t) < window)
            .count()
    }
}

pub struct DecryptionRateLimiter {
    config: RateLimitConfig,
    callers: Mutex<HashMap<String, CallerWindows>>,
    last_cleanup: Mutex<Instant>,
}

impl DecryptionRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            callers: Mutex::new(HashMap::new()),
            last_cleanup: Mutex::new(Instant::now()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// True if `user_id` may decrypt now
    pub fn check_rate_limit(&self, user_id: &str) -> bool {
        self.check(user_id).is_ok()
    }

    /// Like [`check_rate_limit`](Self::check_rate_limit) but names the window that denied
    pub fn check(&self, user_id: &str) -> Result<(), RateLimitDenial> {
        self.maybe_cleanup();

        let now = Instant::now();
        let mut callers = self.callers.lock();
        let Some(caller) = callers.get_mut(user_id) else {
            return Ok(());
        };
        caller.trim(self.config.longest_window(), now);
        self.deny_if_capped(user_id, caller, now)
    }

    /// Check and count in one locked step.
    ///
    /// The returned slot already counts against every window, so concurrent
    /// callers can never pass a cap together. Hand it back with
    /// [`release`](Self::release) if no plaintext was produced.
    pub fn acquire(&self, user_id: &str) -> Result<RateLimitSlot, RateLimitDenial> {
        self.maybe_cleanup();

        let now = Instant::now();
        let mut callers = self.callers.lock();
        let caller = callers
            .entry(user_id.to_string())
            .or_insert_with(CallerWindows::new);
        caller.trim(self.config.longest_window(), now);
        self.deny_if_capped(user_id, caller, now)?;

        caller.decryptions.push_back(now);
        caller.last_activity = now;
        Ok(RateLimitSlot { reserved_at: now })
    }

    /// Return a slot taken by [`acquire`](Self::acquire)
    pub fn release(&self, user_id: &str, slot: RateLimitSlot) {
        let mut callers = self.callers.lock();
        let Some(caller) = callers.get_mut(user_id) else {
            return;
        };
        if let Some(pos) = caller.decryptions.iter().rposition(|&t| t == slot.reserved_at) {
            caller.decryptions.remove(pos);
            debug!(user_id = %user_id, "Decryption slot released");
        }
    }

    /// Count one completed decryption for `user_id`
    pub fn record_decryption(&self, user_id: &str) {
        let now = Instant::now();
        let mut callers = self.callers.lock();
        let caller = callers
            .entry(user_id.to_string())
            .or_insert_with(CallerWindows::new);
        caller.trim(self.config.longest_window(), now);
        caller.decryptions.push_back(now);
        caller.last_activity = now;
    }

    fn deny_if_capped(
        &self,
        user_id: &str,
        caller: &CallerWindows,
        now: Instant,
    ) -> Result<(), RateLimitDenial> {
        for (name, window, limit) in self.config.windows() {
            if caller.count_within(window, now) >= limit as usize {
                warn!(
                    user_id = %user_id,
                    window = name,
                    limit,
                    "Decryption rate limit reached"
                );
                return Err(RateLimitDenial {
                    window: name,
                    window_duration: window,
                    limit,
                });
            }
        }
        Ok(())
    }

    pub fn stats(&self, user_id: &str) -> RateLimitStats {
        let now = Instant::now();
        let callers = self.callers.lock();
        let count = |window: Duration| {
            callers
                .get(user_id)
                .map(|c| c.count_within(window, now))
                .unwrap_or(0)
        };

        let burst_count = count(self.config.burst_window);
        let minute_count = count(self.config.minute_window);
        let hour_count = count(self.config.hour_window);

        RateLimitStats {
            user_id: user_id.to_string(),
            burst_count,
            burst_limit: self.config.burst_limit,
            minute_count,
            minute_limit: self.config.minute_limit,
            hour_count,
            hour_limit: self.config.hour_limit,
            is_limited: burst_count >= self.config.burst_limit as usize
                || minute_count >= self.config.minute_limit as usize
                || hour_count >= self.config.hour_limit as usize,
        }
    }

    /// Forget a caller's history (operator action)
    pub fn reset(&self, user_id: &str) {
        if self.callers.lock().remove(user_id).is_some() {
            debug!(user_id = %user_id, "Decryption rate limit state reset");
        }
    }

    pub fn tracked_users(&self) -> usize {
        self.callers.lock().len()
    }

    /// Drop callers idle for longer than the longest window
    fn maybe_cleanup(&self) {
        const CLEANUP_INTERVAL: Duration = Duration::from_secs(300); // 5 minutes

        {
            let mut last = self.last_cleanup.lock();
            if last.elapsed() < CLEANUP_INTERVAL {
                return;
            }
            *last = Instant::now();
        }

        let idle_after = self.config.longest_window();
        let mut callers = self.callers.lock();
        let before = callers.len();
        callers.retain(|_, c| c.last_activity.elapsed() < idle_after);

        let removed = before - callers.len();
        if removed > 0 {
            debug!("Rate limiter cleanup: removed {} idle callers", removed);
        }
    }
}

impl Default for DecryptionRateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}
