use std::collections::VecDeque;

pub const DEFAULT_WINDOW: usize = 5;

/// Simple moving average over the last `window` temperature samples.
///
/// A failed read (`None`) leaves the window untouched and yields `None`.
#[derive(Debug, Clone)]
pub struct MovingAverage {
    window: usize,
    samples: VecDeque<f64>,
}

impl MovingAverage {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            samples: VecDeque::with_capacity(window),
        }
    }

    /// Pushes `raw` and returns the mean of the window, rounded to two
    /// decimals.
    pub fn filter(&mut self, raw: Option<f64>) -> Option<f64> {
        let raw = raw?;
        self.samples.push_back(raw);
        if self.samples.len() > self.window {
            self.samples.pop_front();
        }

        let mean = self.samples.iter().sum::<f64>() / self.samples.len() as f64;
        Some((mean * 100.0).round() / 100.0)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }
}

impl Default for MovingAverage {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}
