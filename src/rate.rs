//! Minimum-period admission gate.
//!
//! Decouples the camera read rate from the inference rate: the session reads
//! every frame but only admitted frames reach the detector.

use std::time::{Duration, Instant};

#[derive(Clone, Debug)]
pub struct RateLimiter {
    period: Duration,
    last_admitted: Option<Instant>,
}

impl RateLimiter {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            last_admitted: None,
        }
    }

    /// Limiter admitting at most `fps` ticks per second. Zero admits everything.
    pub fn from_fps(fps: u32) -> Self {
        Self::new(frame_interval(fps))
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Admit `now` if at least one period has passed since the last admission.
    /// Rejections leave the state untouched.
    pub fn admit(&mut self, now: Instant) -> bool {
        let admitted = match self.last_admitted {
            Some(last) => now.saturating_duration_since(last) >= self.period,
            None => true,
        };
        if admitted {
            self.last_admitted = Some(now);
        }
        admitted
    }
}

fn frame_interval(fps: u32) -> Duration {
    if fps == 0 {
        Duration::ZERO
    } else {
        Duration::from_secs(1) / fps
    }
}
