//! RMS silence detection over capture blocks.

use std::time::Duration;

use crate::core::codec;

/// Default RMS level below which a block counts as silent.
pub const DEFAULT_SILENCE_THRESHOLD: f32 = 0.01;

/// Default length of continuous silence before notifying.
pub const DEFAULT_SILENCE_DURATION: Duration = Duration::from_millis(2000);

/// Tracks continuous silence across blocks and fires once per silent span.
///
/// Time is measured in samples, so the result depends only on the audio fed
/// in and not on when blocks arrive.
#[derive(Debug, Clone)]
pub struct SilenceDetector {
    threshold: f32,
    window_samples: u64,
    silent_samples: u64,
    fired: bool,
}

impl SilenceDetector {
    pub fn new(threshold: f32, window: Duration, sample_rate: u32) -> Self {
        let window_samples = (window.as_millis() as u64 * sample_rate as u64).div_ceil(1000);
        Self {
            threshold,
            window_samples: window_samples.max(1),
            silent_samples: 0,
            fired: false,
        }
    }

    /// Feed one block. Returns `true` exactly when this block completes a
    /// silent span long enough to notify.
    pub fn process(&mut self, block: &[f32]) -> bool {
        if block.is_empty() {
            return false;
        }

        if codec::rms(block) >= self.threshold {
            self.reset();
            return false;
        }

        self.silent_samples = self.silent_samples.saturating_add(block.len() as u64);
        if !self.fired && self.silent_samples >= self.window_samples {
            self.fired = true;
            return true;
        }
        false
    }

    /// Forget the current span.
    pub fn reset(&mut self) {
        self.silent_samples = 0;
        self.fired = false;
    }

    /// Silence accumulated in the current span.
    pub fn silent_samples(&self) -> u64 {
        self.silent_samples
    }

    pub fn has_fired(&self) -> bool {
        self.fired
    }
}
