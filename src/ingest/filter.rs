//! Moving-average smoothing of raw distance readings.

use crate::LocatorError;

/// Default number of readings in the smoothing window.
pub const DEFAULT_WINDOW: usize = 10;

/// Fixed-window moving average over raw range samples.
///
/// One filter exists per (tag, neighbor) pair. Until the window fills, the
/// output is the mean of the samples seen so far rather than the sum diluted
/// over the full window, so early readings are already usable.
#[derive(Debug, Clone)]
pub struct RangeFilter {
    buffer: Vec<f64>,
    head: usize,
    window_sum: f64,
    count: u64,
}

impl RangeFilter {
    /// Create a filter over a window of `capacity` samples.
    pub fn new(capacity: usize) -> Result<Self, LocatorError> {
        if capacity == 0 {
            return Err(LocatorError::InvalidFilterCapacity(capacity));
        }
        Ok(Self {
            buffer: vec![0.0; capacity],
            head: 0,
            window_sum: 0.0,
            count: 0,
        })
    }

    /// Push a raw reading and return the smoothed value.
    pub fn next(&mut self, value: f64) -> f64 {
        self.count += 1;
        let tail = (self.head + 1) % self.buffer.len();
        self.window_sum = self.window_sum - self.buffer[tail] + value;
        self.head = tail;
        self.buffer[self.head] = value;
        let effective = (self.buffer.len() as u64).min(self.count);
        self.window_sum / effective as f64
    }

    /// Number of samples pushed so far.
    pub fn samples_seen(&self) -> u64 {
        self.count
    }
}

impl Default for RangeFilter {
    fn default() -> Self {
        Self {
            buffer: vec![0.0; DEFAULT_WINDOW],
            head: 0,
            window_sum: 0.0,
            count: 0,
        }
    }
}
