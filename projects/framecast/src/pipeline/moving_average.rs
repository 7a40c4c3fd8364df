use std::collections::VecDeque;

/// Rolling mean over the last `window` samples, or over every sample when
/// created with [`MovingAverage::unbounded`].
#[derive(Debug, Clone)]
pub struct MovingAverage {
    window: Option<usize>,
    samples: VecDeque<f64>,
    sum: f64,
    count: u64,
}

impl MovingAverage {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window: Some(window),
            samples: VecDeque::with_capacity(window),
            sum: 0.0,
            count: 0,
        }
    }

    pub fn unbounded() -> Self {
        Self {
            window: None,
            samples: VecDeque::new(),
            sum: 0.0,
            count: 0,
        }
    }

    pub fn update(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        match self.window {
            Some(window) => {
                if self.samples.len() == window {
                    if let Some(old) = self.samples.pop_front() {
                        self.sum -= old;
                    }
                }
                self.samples.push_back(value);
                self.sum += value;
                self.count = self.samples.len() as u64;
            }
            None => {
                self.sum += value;
                self.count += 1;
            }
        }
    }

    /// Mean of the tracked samples; `0.0` before the first update.
    pub fn get(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    pub fn len(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn reset(&mut self) {
        self.samples.clear();
        self.sum = 0.0;
        self.count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_drops_oldest() {
        let mut avg = MovingAverage::new(3);
        for v in [1.0, 2.0, 3.0, 4.0] {
            avg.update(v);
        }
        assert_eq!(avg.len(), 3);
        assert!((avg.get() - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_unbounded_tracks_everything() {
        let mut avg = MovingAverage::unbounded();
        for v in 1..=100 {
            avg.update(v as f64);
        }
        assert_eq!(avg.len(), 100);
        assert!((avg.get() - 50.5).abs() < 1e-9);
    }

    #[test]
    fn test_empty_and_reset() {
        let mut avg = MovingAverage::new(10);
        assert_eq!(avg.get(), 0.0);
        avg.update(5.0);
        avg.update(f64::INFINITY);
        assert_eq!(avg.len(), 1);
        avg.reset();
        assert!(avg.is_empty());
        assert_eq!(avg.get(), 0.0);
    }
}
