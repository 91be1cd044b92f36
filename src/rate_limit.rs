use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::error::{LlmError, Result};

/// Paces upstream requests to a fixed rate, burst of one.
pub struct RequestPacer {
    interval: Duration,
    // next free request slot; None until the first acquire
    next_slot: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(rps: u32) -> Self {
        Self {
            interval: Duration::from_secs(1) / rps.max(1),
            next_slot: Mutex::new(None),
        }
    }

    /// Reserves the next slot and sleeps until it arrives.
    ///
    /// Fails without consuming a slot when the wait would exceed `budget`.
    pub async fn acquire(&self, budget: Duration) -> Result<()> {
        let wait = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = match *next {
                Some(at) if at > now => at,
                _ => now,
            };
            let wait = slot - now;
            if wait > budget {
                return Err(LlmError::RateLimited {
                    wait_ms: wait.as_millis() as u64,
                });
            }
            *next = Some(slot + self.interval);
            wait
        };

        if !wait.is_zero() {
            sleep(wait).await;
        }
        Ok(())
    }
}
