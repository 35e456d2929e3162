// Wall clock for the cycle schedule
//
// Wall-clock milliseconds are anchored to a `tokio::time::Instant`, so
// timers armed with `instant_at` and readings from `now_ms` always agree,
// including under a paused test runtime.

use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::{Duration, Instant};

#[derive(Clone, Copy, Debug)]
pub struct Clock {
    anchor: Instant,
    anchor_ms: u64,
}

impl Clock {
    /// Anchor to the system clock
    pub fn system() -> Self {
        let anchor_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self::at(anchor_ms)
    }

    /// Treat the current instant as `ms` since the epoch
    pub fn at(ms: u64) -> Self {
        Self {
            anchor: Instant::now(),
            anchor_ms: ms,
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.anchor_ms + self.anchor.elapsed().as_millis() as u64
    }

    pub fn now_secs(&self) -> u64 {
        self.now_ms() / 1000
    }

    /// Instant at which the clock reads `ms`; past readings map to the anchor
    pub fn instant_at(&self, ms: u64) -> Instant {
        self.anchor + Duration::from_millis(ms.saturating_sub(self.anchor_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_clock_follows_tokio_time() {
        let clock = Clock::at(1_000_000);
        assert_eq!(clock.now_ms(), 1_000_000);

        tokio::time::advance(Duration::from_millis(2_500)).await;
        assert_eq!(clock.now_ms(), 1_002_500);
        assert_eq!(clock.now_secs(), 1_002);
    }

    #[tokio::test(start_paused = true)]
    async fn test_instant_at() {
        let clock = Clock::at(5_000);
        let target = clock.instant_at(8_000);

        tokio::time::sleep_until(target).await;
        assert_eq!(clock.now_ms(), 8_000);
        assert!(clock.instant_at(1_000) <= Instant::now());
    }

    #[test]
    fn test_system_clock_is_recent() {
        let rt = tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap();
        rt.block_on(async {
            // 2020-01-01
            assert!(Clock::system().now_ms() > 1_577_836_800_000);
        });
    }
}
