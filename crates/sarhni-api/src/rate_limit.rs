use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Expired windows are dropped this often.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

const WINDOW: Duration = Duration::from_secs(60);

/// Outcome of one rate-limit check. `reset_at` is only set on refusal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub success: bool,
    pub reset_at: Option<Instant>,
}

impl RateLimitDecision {
    /// Time left until the window resets, zero if allowed.
    pub fn retry_after(&self) -> Duration {
        self.reset_at
            .map(|at| at.saturating_duration_since(Instant::now()))
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    reset_at: Instant,
}

/// Fixed-window counter per key, held in process memory.
///
/// Counts are not shared between processes; every replica limits on its own.
pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// 5 confessions per minute.
    pub fn confession_sends() -> Self {
        Self::new(5, WINDOW)
    }

    /// 20 username searches per minute.
    pub fn searches() -> Self {
        Self::new(20, WINDOW)
    }

    pub fn check(&self, key: &str) -> RateLimitDecision {
        self.check_at(key, Instant::now())
    }

    pub fn check_at(&self, key: &str, now: Instant) -> RateLimitDecision {
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);

        match windows.get_mut(key) {
            Some(window) if now < window.reset_at => {
                if window.count >= self.max_requests {
                    return RateLimitDecision {
                        success: false,
                        reset_at: Some(window.reset_at),
                    };
                }
                window.count += 1;
            }
            _ => {
                windows.insert(
                    key.to_string(),
                    Window {
                        count: 1,
                        reset_at: now + self.window,
                    },
                );
            }
        }

        RateLimitDecision {
            success: true,
            reset_at: None,
        }
    }

    /// Drop every window that has already expired. Returns how many went.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let before = windows.len();
        windows.retain(|_, window| window.reset_at > now);
        before - windows.len()
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
