//! Moving average over the last N multi-channel pressure readings.

use std::collections::VecDeque;

/// Element-wise mean of the last `depth` readings.
///
/// The window starts full of zero readings, so the first `depth - 1`
/// published values are pulled towards zero. Channel count is fixed at
/// construction; readings of another width are padded or truncated.
#[derive(Debug, Clone)]
pub struct MovingAverage {
    window: VecDeque<Vec<f64>>,
    depth: usize,
    channels: usize,
}

impl MovingAverage {
    pub fn new(depth: usize, channels: usize) -> Self {
        let depth = depth.max(1);
        let window = std::iter::repeat_with(|| vec![0.0; channels])
            .take(depth)
            .collect();
        Self {
            window,
            depth,
            channels,
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Push a reading, evicting the oldest, and return the new mean.
    pub fn push(&mut self, reading: &[f64]) -> Vec<f64> {
        let mut row = vec![0.0; self.channels];
        for (slot, value) in row.iter_mut().zip(reading) {
            *slot = *value;
        }
        if self.window.len() == self.depth {
            self.window.pop_front();
        }
        self.window.push_back(row);
        self.mean()
    }

    pub fn mean(&self) -> Vec<f64> {
        let mut sums = vec![0.0; self.channels];
        for row in &self.window {
            for (sum, value) in sums.iter_mut().zip(row) {
                *sum += value;
            }
        }
        let n = self.window.len().max(1) as f64;
        sums.into_iter().map(|s| s / n).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_reading_is_diluted_by_seed() {
        let mut avg = MovingAverage::new(3, 1);
        assert_eq!(avg.push(&[9.0]), vec![3.0]);
    }

    #[test]
    fn window_fills_then_slides() {
        let mut avg = MovingAverage::new(3, 2);
        avg.push(&[3.0, 30.0]);
        avg.push(&[3.0, 30.0]);
        assert_eq!(avg.push(&[3.0, 30.0]), vec![3.0, 30.0]);
        assert_eq!(avg.push(&[6.0, 0.0]), vec![4.0, 20.0]);
    }

    #[test]
    fn mismatched_width_is_padded() {
        let mut avg = MovingAverage::new(1, 3);
        assert_eq!(avg.push(&[1.0]), vec![1.0, 0.0, 0.0]);
        assert_eq!(avg.push(&[1.0, 2.0, 3.0, 4.0]), vec![1.0, 2.0, 3.0]);
    }
}
