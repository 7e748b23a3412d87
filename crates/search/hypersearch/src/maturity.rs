//! Maturity tests for swarms and individual models
//!
//! Both tests fit a least-squares line through the most recent window of a
//! lower-is-better curve and call the curve flat once the slope, relative to
//! the window's mean magnitude, falls under a threshold.

use std::collections::VecDeque;

/// Magnitude floor used when normalizing a slope
const MIN_SCALE: f64 = 1e-12;

/// Least-squares slope of `values` against their index
pub fn slope(values: &[f64]) -> Option<f64> {
    let n = values.len();
    if n < 2 || values.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let n_f = n as f64;
    let mean_x = (n_f - 1.0) / 2.0;
    let mean_y = values.iter().sum::<f64>() / n_f;
    let mut num = 0.0;
    let mut den = 0.0;
    for (i, y) in values.iter().enumerate() {
        let dx = i as f64 - mean_x;
        num += dx * (y - mean_y);
        den += dx * dx;
    }
    Some(num / den)
}

/// Slope divided by the mean magnitude of the window
pub fn relative_slope(values: &[f64]) -> Option<f64> {
    let raw = slope(values)?;
    let scale = values.iter().map(|v| v.abs()).sum::<f64>() / values.len() as f64;
    if scale < MIN_SCALE {
        return Some(if raw.abs() < MIN_SCALE { 0.0 } else { raw.signum() * f64::INFINITY });
    }
    Some(raw / scale)
}

/// Running minimum of a curve
pub fn cumulative_best(values: &[f64]) -> Vec<f64> {
    let mut best = f64::INFINITY;
    values
        .iter()
        .map(|v| {
            if v.is_finite() && *v < best {
                best = *v;
            }
            best
        })
        .collect()
}

/// Whether the last `window` entries of `values` have flattened out
pub fn is_flat(values: &[f64], window: usize, max_slope: f64) -> bool {
    if window < 2 || values.len() < window {
        return false;
    }
    relative_slope(&values[values.len() - window..]).map_or(false, |s| s.abs() < max_slope)
}

/// Whether a swarm's per-generation best errors show it has converged
pub fn swarm_is_mature(generation_bests: &[f64], window: usize, max_slope: f64) -> bool {
    is_flat(&cumulative_best(generation_bests), window, max_slope)
}

/// Sliding window over a model's progressive score
#[derive(Debug, Clone)]
pub struct ModelMaturityTracker {
    window: usize,
    max_slope: f64,
    samples: VecDeque<f64>,
}

impl ModelMaturityTracker {
    pub fn new(window: usize, max_slope: f64) -> Self {
        Self {
            window,
            max_slope,
            samples: VecDeque::with_capacity(window),
        }
    }

    /// Add one error sample and report whether the model has matured
    pub fn push(&mut self, error: f64) -> bool {
        if !error.is_finite() {
            return false;
        }
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(error);
        self.is_mature()
    }

    pub fn is_mature(&self) -> bool {
        let samples: Vec<f64> = self.samples.iter().copied().collect();
        is_flat(&samples, self.window, self.max_slope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slope_of_line() {
        assert!((slope(&[1.0, 3.0, 5.0, 7.0]).unwrap() - 2.0).abs() < 1e-12);
        assert_eq!(slope(&[4.0]), None);
        assert_eq!(slope(&[1.0, f64::NAN]), None);
    }

    #[test]
    fn test_constant_curve_is_flat() {
        assert!(is_flat(&[0.5; 6], 5, 0.005));
        assert!(is_flat(&[0.0; 5], 5, 0.005));
        assert!(!is_flat(&[0.5; 4], 5, 0.005));
    }

    #[test]
    fn test_improving_curve_is_not_flat() {
        let curve = [1.0, 0.8, 0.6, 0.4, 0.2];
        assert!(!is_flat(&curve, 5, 0.005));
    }

    #[test]
    fn test_cumulative_best_only_improves() {
        assert_eq!(cumulative_best(&[0.5, 0.7, 0.3, 0.4]), vec![0.5, 0.5, 0.3, 0.3]);
    }

    #[test]
    fn test_swarm_matures_once_best_stops_moving() {
        let bests = [0.9, 0.5, 0.31, 0.30, 0.35, 0.4, 0.32, 0.33];
        assert!(!swarm_is_mature(&bests[..4], 4, 0.005));
        assert!(swarm_is_mature(&bests, 4, 0.005));
    }

    #[test]
    fn test_model_tracker_needs_a_full_window() {
        let mut tracker = ModelMaturityTracker::new(3, 0.01);
        assert!(!tracker.push(0.2));
        assert!(!tracker.push(0.2));
        assert!(tracker.push(0.2));
        assert!(!tracker.push(0.1));
    }
}
