//! Priority scoring.
//!
//! `score = priority * level + unblock * direct_dependents - depth * depth_from_roots`

use serde::{Deserialize, Serialize};

/// Weights of the three scoring signals.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreWeights {
    /// Weight of the declared priority level (1 to 4).
    #[serde(default = "default_priority")]
    pub priority: f64,
    /// Weight of the number of direct dependents.
    #[serde(default = "default_unblock")]
    pub unblock: f64,
    /// Penalty per layer of depth from the roots.
    #[serde(default = "default_depth")]
    pub depth: f64,
}

fn default_priority() -> f64 {
    1.0
}

fn default_unblock() -> f64 {
    2.0
}

fn default_depth() -> f64 {
    0.5
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            priority: default_priority(),
            unblock: default_unblock(),
            depth: default_depth(),
        }
    }
}

impl ScoreWeights {
    /// Sets the priority weight.
    #[must_use]
    pub fn with_priority(mut self, weight: f64) -> Self {
        self.priority = weight;
        self
    }

    /// Sets the unblocking weight.
    #[must_use]
    pub fn with_unblock(mut self, weight: f64) -> Self {
        self.unblock = weight;
        self
    }

    /// Sets the depth penalty.
    #[must_use]
    pub fn with_depth(mut self, weight: f64) -> Self {
        self.depth = weight;
        self
    }

    /// Combines the three signals.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn score(&self, priority_level: u8, dependents: usize, depth: usize) -> f64 {
        self.priority * f64::from(priority_level) + self.unblock * dependents as f64
            - self.depth * depth as f64
    }
}

/// The score of one item and the signals behind it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorityScore {
    /// Item id.
    pub id: String,
    /// Combined score; higher sorts first.
    pub score: f64,
    /// Declared priority level.
    pub priority_level: u8,
    /// Number of direct dependents.
    pub dependents: usize,
    /// Layer index from the roots.
    pub depth: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_weights_favor_unblocking() {
        let weights = ScoreWeights::default();
        let isolated_critical = weights.score(4, 0, 0);
        let medium_with_two_dependents = weights.score(2, 2, 0);
        assert!(medium_with_two_dependents > isolated_critical);
    }

    #[test]
    fn test_depth_penalizes() {
        let weights = ScoreWeights::default();
        assert!(weights.score(2, 0, 0) > weights.score(2, 0, 3));
    }

    #[test]
    fn test_custom_weights() {
        let weights = ScoreWeights::default().with_unblock(0.0).with_depth(0.0);
        assert!((weights.score(3, 10, 10) - 3.0).abs() < f64::EPSILON);
    }
}
