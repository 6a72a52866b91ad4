use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Cooperative pause inserted between batches of streamed rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Rows pulled between pauses. Zero disables throttling.
    pub batch_size: usize,
    pub pause: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            pause: Duration::from_millis(10),
        }
    }
}

impl ThrottleConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }

    pub fn start(self) -> Throttle {
        Throttle {
            config: self,
            in_batch: 0,
            pauses: 0,
        }
    }
}

/// Counts rows and sleeps once per full batch.
#[derive(Debug)]
pub struct Throttle {
    config: ThrottleConfig,
    in_batch: usize,
    pauses: u64,
}

impl Throttle {
    /// Record one row; yields to the runtime after every `batch_size` rows.
    pub async fn tick(&mut self) {
        if self.config.batch_size == 0 {
            return;
        }
        self.in_batch += 1;
        if self.in_batch >= self.config.batch_size {
            self.in_batch = 0;
            self.pauses += 1;
            if self.config.pause.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(self.config.pause).await;
            }
        }
    }

    pub fn pauses(&self) -> u64 {
        self.pauses
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn pauses_once_per_full_batch() {
        let started = tokio::time::Instant::now();
        let mut throttle = ThrottleConfig::default()
            .with_batch_size(3)
            .with_pause(Duration::from_millis(50))
            .start();
        for _ in 0..7 {
            throttle.tick().await;
        }
        assert_eq!(throttle.pauses(), 2);
        assert_eq!(started.elapsed(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn zero_batch_never_pauses() {
        let mut throttle = ThrottleConfig::default().with_batch_size(0).start();
        for _ in 0..500 {
            throttle.tick().await;
        }
        assert_eq!(throttle.pauses(), 0);
    }
}
