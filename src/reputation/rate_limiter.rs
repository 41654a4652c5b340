use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

struct Window {
    started: Instant,
    used: u32,
}

/// Fixed-window request budget (free threat-intel tiers allow ~4 per minute)
pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    state: Mutex<Window>,
}

impl RateLimiter {
    /// `max_requests == 0` disables limiting
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            state: Mutex::new(Window {
                started: Instant::now(),
                used: 0,
            }),
        }
    }

    /// Take one slot from the current window if any are left
    pub fn try_acquire(&self) -> bool {
        if self.max_requests == 0 {
            return true;
        }

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        if now.duration_since(state.started) >= self.window {
            state.started = now;
            state.used = 0;
        }

        if state.used < self.max_requests {
            state.used += 1;
            true
        } else {
            false
        }
    }

    /// Time until the current window resets
    pub fn retry_after(&self) -> Duration {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.window
            .saturating_sub(Instant::now().duration_since(state.started))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_budget_resets_after_window() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        assert!(limiter.retry_after() <= Duration::from_secs(60));

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(limiter.try_acquire());
    }

    #[test]
    fn test_zero_means_unlimited() {
        let limiter = RateLimiter::new(0, Duration::from_secs(1));
        assert!((0..100).all(|_| limiter.try_acquire()));
    }
}
