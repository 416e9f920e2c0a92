use chrono::Utc;
use std::sync::Mutex;
use tokio::time::{Duration, Instant};
use tracing::info;

// Process-wide rate limit window, set when the API answers 429.
// `None` means no window is active.
#[derive(Default)]
pub struct RateLimitWindow {
    reset_at: Mutex<Option<Instant>>,
}

impl RateLimitWindow {
    pub fn new() -> Self {
        Self::default()
    }

    // reset_time is epoch seconds, as sent in x-rate-limit-reset
    pub fn set_reset_epoch(&self, reset_time: i64) {
        let wait_secs = reset_time - Utc::now().timestamp();
        if wait_secs <= 0 {
            self.clear();
            return;
        }
        info!("Rate limited, pausing lookups for {}s", wait_secs);
        self.set_until(Instant::now() + Duration::from_secs(wait_secs as u64));
    }

    pub fn set_until(&self, deadline: Instant) {
        *self.slot() = Some(deadline);
    }

    pub fn clear(&self) {
        *self.slot() = None;
    }

    // Time left in the window; clears it once the deadline has passed
    pub fn remaining(&self) -> Option<Duration> {
        let mut slot = self.slot();
        let deadline = (*slot)?;
        let now = Instant::now();
        if now >= deadline {
            *slot = None;
            return None;
        }
        Some(deadline - now)
    }

    pub fn is_active(&self) -> bool {
        self.remaining().is_some()
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<Instant>> {
        self.reset_at.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn window_clears_after_deadline() {
        let window = RateLimitWindow::new();
        assert!(!window.is_active());

        window.set_until(Instant::now() + Duration::from_secs(5));
        assert!(window.remaining().unwrap() <= Duration::from_secs(5));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(window.remaining(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_in_the_past_is_ignored() {
        let window = RateLimitWindow::new();
        window.set_reset_epoch(Utc::now().timestamp() - 10);
        assert!(!window.is_active());

        window.set_reset_epoch(Utc::now().timestamp() + 120);
        let left = window.remaining().unwrap();
        assert!(left > Duration::from_secs(110) && left <= Duration::from_secs(120));
    }
}
