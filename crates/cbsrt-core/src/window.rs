//! Fixed-capacity moving average.

use std::collections::VecDeque;

/// The last `capacity` observations of one rate; the oldest is evicted first.
#[derive(Debug, Clone)]
pub struct SmoothingWindow {
    values: VecDeque<f64>,
    capacity: usize,
}

impl SmoothingWindow {
    /// A capacity of 0 is treated as 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            values: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends `value` and returns the average of the window contents.
    pub fn push(&mut self, value: f64) -> f64 {
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
        self.average()
    }

    /// Average of the present contents; 0 before the first push.
    pub fn average(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().sum::<f64>() / self.values.len() as f64
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evicts_oldest() {
        let mut w = SmoothingWindow::new(5);
        for v in [10.0, 10.0, 10.0, 10.0, 10.0] {
            w.push(v);
        }
        assert_eq!(w.push(20.0), 12.0);
        assert_eq!(w.len(), 5);
    }

    #[test]
    fn test_partial_window_averages_present_values() {
        let mut w = SmoothingWindow::new(5);
        assert!(w.is_empty());
        assert_eq!(w.push(4.0), 4.0);
        assert_eq!(w.push(8.0), 6.0);
        assert_eq!(w.len(), 2);
    }

    #[test]
    fn test_zero_capacity_holds_one() {
        let mut w = SmoothingWindow::new(0);
        assert_eq!(w.capacity(), 1);
        w.push(1.0);
        assert_eq!(w.push(3.0), 3.0);
        assert_eq!(w.len(), 1);
    }
}
