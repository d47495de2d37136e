//! Admission control against the network's published request caps
//!
//! Fixed-window counters per endpoint class. The gate only decides
//! whether a request may go out now; it is not a queue, and fairness
//! among waiting callers is best-effort.

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{PlumageError, Result};

/// Endpoint class for general API calls: 300 requests per 300 seconds.
pub const CLASS_API: &str = "api";
/// Endpoint class for OAuth endpoints: 60 requests per 60 seconds.
pub const CLASS_OAUTH: &str = "oauth";

struct Window {
    count: u32,
    resets_at: Instant,
    max: u32,
    len: Duration,
}

impl Window {
    fn roll(&mut self, now: Instant) {
        if now >= self.resets_at {
            self.count = 0;
            self.resets_at = now + self.len;
        }
    }
}

pub struct RateGate {
    windows: Mutex<HashMap<String, Window>>,
}

impl RateGate {
    /// Gate with the two mandatory endpoint classes registered.
    pub fn new() -> Self {
        let now = Instant::now();
        let mut windows = HashMap::new();
        windows.insert(
            CLASS_API.to_string(),
            Window {
                count: 0,
                resets_at: now + Duration::from_secs(300),
                max: 300,
                len: Duration::from_secs(300),
            },
        );
        windows.insert(
            CLASS_OAUTH.to_string(),
            Window {
                count: 0,
                resets_at: now + Duration::from_secs(60),
                max: 60,
                len: Duration::from_secs(60),
            },
        );

        Self {
            windows: Mutex::new(windows),
        }
    }

    /// Register an additional endpoint class.
    pub async fn register(&self, class: &str, max: u32, window_len: Duration) {
        let mut windows = self.windows.lock().await;
        windows.insert(
            class.to_string(),
            Window {
                count: 0,
                resets_at: Instant::now() + window_len,
                max,
                len: window_len,
            },
        );
    }

    /// Whether admitting `n` more requests would break the cap.
    /// Non-mutating. Unregistered classes are unlimited.
    pub async fn would_exceed(&self, class: &str, n: u32) -> bool {
        let mut windows = self.windows.lock().await;
        match windows.get_mut(class) {
            Some(window) => {
                window.roll(Instant::now());
                window.count + n > window.max
            }
            None => false,
        }
    }

    /// Admit `n` requests and return the remaining budget in the
    /// current window.
    pub async fn record(&self, class: &str, n: u32) -> u32 {
        let mut windows = self.windows.lock().await;
        match windows.get_mut(class) {
            Some(window) => {
                window.roll(Instant::now());
                window.count += n;
                window.max.saturating_sub(window.count)
            }
            None => u32::MAX,
        }
    }

    /// Block until `n` requests can be admitted, then admit them.
    ///
    /// Polls once per remaining window (plus a little jitter so
    /// contending workers do not wake in lockstep). Cancellation
    /// returns immediately without touching the counters.
    pub async fn wait_for(
        &self,
        class: &str,
        n: u32,
        cancel: &CancellationToken,
    ) -> Result<()> {
        loop {
            let wait = {
                let mut windows = self.windows.lock().await;
                match windows.get_mut(class) {
                    None => return Ok(()),
                    Some(window) => {
                        let now = Instant::now();
                        window.roll(now);
                        if window.count + n <= window.max {
                            window.count += n;
                            return Ok(());
                        }
                        window.resets_at.saturating_duration_since(now)
                    }
                }
            };

            let jitter = Duration::from_millis(rand::thread_rng().gen_range(10..250));
            debug!(class = %class, wait_secs = wait.as_secs(), "Rate window exhausted, waiting");

            tokio::select! {
                _ = tokio::time::sleep(wait + jitter) => {}
                _ = cancel.cancelled() => return Err(PlumageError::Cancelled),
            }
        }
    }
}

impl Default for RateGate {
    fn default() -> Self {
        Self::new()
    }
}
