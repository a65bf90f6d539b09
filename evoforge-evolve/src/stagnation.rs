//! Stagnation detection over a trailing window of round scores

use serde::{Deserialize, Serialize};

/// Decides when the inner loop has stopped paying off
///
/// Looks at the last `window` scores. The improvement is how far the best
/// later score rose above the first score of the window, relative to that
/// first score (absolute when it is zero). Fewer than `window` scores is
/// never stagnant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StagnationDetector {
    pub window: usize,
    pub epsilon: f64,
}

impl StagnationDetector {
    pub fn new(window: usize, epsilon: f64) -> Self {
        Self { window, epsilon }
    }

    /// Improvement across the trailing window, `None` until the window is full
    pub fn improvement(&self, scores: &[f64]) -> Option<f64> {
        if self.window < 2 || scores.len() < self.window {
            return None;
        }
        let window = &scores[scores.len() - self.window..];
        let first = window[0];
        let best = window[1..].iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let gain = best - first;

        Some(if first == 0.0 { gain } else { gain / first.abs() })
    }

    pub fn is_stagnant(&self, scores: &[f64]) -> bool {
        self.improvement(scores)
            .is_some_and(|improvement| improvement < self.epsilon)
    }
}
