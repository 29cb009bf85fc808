//! Token-limited warning helper for the completion context.
//!
//! A wedged endpoint can fail thousands of times per second; warn paths on the
//! hot path go through this limiter so the log stays readable.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::lock;

const WINDOW: Duration = Duration::from_secs(5);
const BURST: u32 = 10;

#[derive(Debug, Default)]
struct Window {
    started: Option<Instant>,
    emitted: u32,
}

#[derive(Debug, Default)]
pub(crate) struct RateLimit {
    window: Mutex<Window>,
}

impl RateLimit {
    /// Whether the caller may emit one more message in the current window.
    pub(crate) fn allow(&self) -> bool {
        let now = Instant::now();
        let mut w = lock(&self.window);
        match w.started {
            Some(started) if now.duration_since(started) < WINDOW => {
                if w.emitted < BURST {
                    w.emitted += 1;
                    true
                } else {
                    false
                }
            }
            _ => {
                w.started = Some(now);
                w.emitted = 1;
                true
            }
        }
    }
}
