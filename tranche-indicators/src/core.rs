//! Core building blocks shared by the estimators.

use thiserror::Error;

/// Common configuration errors emitted by estimators.
#[derive(Debug, Error, PartialEq)]
pub enum IndicatorError {
    /// Returned when a capacity of zero is provided.
    #[error("{name} requires capacity > 0 (got {capacity})")]
    InvalidCapacity {
        /// Human-readable component name.
        name: &'static str,
        /// User-provided capacity.
        capacity: usize,
    },
}

impl IndicatorError {
    /// Helper constructor for invalid capacity errors.
    pub fn invalid_capacity(name: &'static str, capacity: usize) -> Self {
        Self::InvalidCapacity { name, capacity }
    }
}

/// Fixed-capacity window of `f64` samples backed by a ring buffer.
///
/// Storage is allocated once; after the window fills, each push overwrites the
/// oldest sample in place.
#[derive(Clone, Debug)]
pub struct RollingWindow {
    data: Vec<f64>,
    capacity: usize,
    head: usize,
    len: usize,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Result<Self, IndicatorError> {
        if capacity == 0 {
            return Err(IndicatorError::invalid_capacity("RollingWindow", capacity));
        }
        Ok(Self {
            data: Vec::with_capacity(capacity),
            capacity,
            head: 0,
            len: 0,
        })
    }

    /// Append a sample, evicting the oldest once the window is full.
    pub fn push(&mut self, value: f64) {
        if self.data.len() < self.capacity {
            self.data.push(value);
        } else {
            self.data[self.head] = value;
        }
        self.head = (self.head + 1) % self.capacity;
        self.len = (self.len + 1).min(self.capacity);
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns true when the window contains `capacity` samples.
    pub fn is_full(&self) -> bool {
        self.len == self.capacity
    }

    /// Iterate samples from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        let start = if self.is_full() { self.head } else { 0 };
        (0..self.len).map(move |offset| self.data[(start + offset) % self.capacity])
    }

    /// Copy the samples into `scratch` sorted ascending.
    pub fn sorted_into(&self, scratch: &mut Vec<f64>) {
        scratch.clear();
        scratch.extend_from_slice(&self.data);
        scratch.sort_by(f64::total_cmp);
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.head = 0;
        self.len = 0;
    }
}

/// Inclusive linear-interpolation quantile of an ascending slice.
///
/// Uses `h = (n - 1) * q` and interpolates between the bracketing order
/// statistics. Returns `None` for an empty slice; `q` is clamped to `[0, 1]`.
pub fn quantile_inclusive(sorted: &[f64], q: f64) -> Option<f64> {
    let n = sorted.len();
    if n == 0 {
        return None;
    }
    if n == 1 {
        return Some(sorted[0]);
    }
    let h = (n - 1) as f64 * q.clamp(0.0, 1.0);
    let lower = h.floor() as usize;
    let upper = (lower + 1).min(n - 1);
    let frac = h - lower as f64;
    Some(sorted[lower] + frac * (sorted[upper] - sorted[lower]))
}
