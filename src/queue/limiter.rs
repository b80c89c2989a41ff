//! # Submission Limiter
//!
//! Spaces out job starts: at most `max_starts` starts in any sliding window of
//! `window`. Independent of the adaptive per-dependency limiter, this keeps a burst of
//! due jobs from hitting the provider at the same instant.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug)]
pub struct SubmissionLimiter {
    max_starts: u32,
    window: Duration,
    starts: Mutex<VecDeque<Instant>>,
}

impl SubmissionLimiter {
    pub fn new(max_starts: u32, window: Duration) -> Self {
        Self {
            max_starts: max_starts.max(1),
            window,
            starts: Mutex::new(VecDeque::new()),
        }
    }

    /// Record a start if the window has room, otherwise return the wait
    fn try_start(&self, now: Instant) -> Result<(), Duration> {
        let mut starts = self.starts.lock();
        while let Some(oldest) = starts.front() {
            if now.duration_since(*oldest) >= self.window {
                starts.pop_front();
            } else {
                break;
            }
        }

        if starts.len() < self.max_starts as usize {
            starts.push_back(now);
            Ok(())
        } else {
            let oldest = starts.front().copied().unwrap_or(now);
            Err((oldest + self.window).saturating_duration_since(now))
        }
    }

    /// Wait until a start slot is free and claim it
    pub async fn wait_turn(&self) {
        loop {
            match self.try_start(Instant::now()) {
                Ok(()) => return,
                Err(wait) => {
                    debug!(wait_ms = wait.as_millis() as u64, "Spacing out job start");
                    tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_allows_max_starts() {
        let limiter = SubmissionLimiter::new(2, Duration::from_secs(60));
        let now = Instant::now();
        assert!(limiter.try_start(now).is_ok());
        assert!(limiter.try_start(now).is_ok());
        assert!(limiter.try_start(now).is_err());
        assert!(limiter.try_start(now + Duration::from_secs(61)).is_ok());
    }

    #[tokio::test]
    async fn test_wait_turn_spaces_starts() {
        let limiter = SubmissionLimiter::new(1, Duration::from_millis(40));
        let started = Instant::now();
        limiter.wait_turn().await;
        limiter.wait_turn().await;
        assert!(started.elapsed() >= Duration::from_millis(35));
    }
}
