//! Analytic Hierarchy Process scoring.
//!
//! A cluster's pairwise comparison matrix is reduced once, at build time,
//! to a weight vector. Each tick, every eligible `(device, command)` pair
//! contributes one row of criterion scores, and the composite score is the
//! weighted sum of that row times the cluster priority.

use std::collections::HashMap;

use crate::error::ConfigError;

/// Saaty's random consistency index, indexed by matrix order.
const RANDOM_INDEX: [f64; 16] = [
    0.0, 0.0, 0.0, 0.58, 0.90, 1.12, 1.24, 1.32, 1.41, 1.45, 1.49, 1.51, 1.48, 1.56, 1.57, 1.59,
];

/// Weights derived from a validated pairwise comparison matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct CriteriaMatrix {
    labels: Vec<String>,
    weights: Vec<f64>,
    consistency_ratio: f64,
}

impl CriteriaMatrix {
    /// Validates `matrix` and derives the weight vector.
    ///
    /// # Arguments
    ///
    /// * `labels` - Criterion names in row/column order
    /// * `matrix` - Square matrix where `matrix[i][j]` rates `labels[i]` against `labels[j]`
    /// * `tolerance` - Allowed deviation of `matrix[i][j] * matrix[j][i]` from 1
    /// * `max_consistency_ratio` - Largest acceptable Saaty consistency ratio
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the matrix is empty, not square, has
    /// non-positive entries, breaks reciprocity beyond `tolerance`, or is
    /// inconsistent beyond `max_consistency_ratio`.
    pub fn new(
        labels: &[String],
        matrix: &[Vec<f64>],
        tolerance: f64,
        max_consistency_ratio: f64,
    ) -> Result<Self, ConfigError> {
        let n = labels.len();
        if n == 0 {
            return Err(ConfigError::new("criteria_labels", "must not be empty"));
        }
        if matrix.len() != n || matrix.iter().any(|row| row.len() != n) {
            return Err(ConfigError::new(
                "comparison_matrix",
                format!("must be a square {n}x{n} matrix matching criteria_labels"),
            ));
        }

        for (i, row) in matrix.iter().enumerate() {
            for (j, &v) in row.iter().enumerate() {
                if !(v > 0.0 && v.is_finite()) {
                    return Err(ConfigError::new(
                        format!("comparison_matrix[{i}][{j}]"),
                        format!("{v} is not a positive number"),
                    ));
                }
                if j >= i {
                    let product = v * matrix[j][i];
                    if (product - 1.0).abs() > tolerance {
                        return Err(ConfigError::new(
                            format!("comparison_matrix[{i}][{j}]"),
                            format!(
                                "{v} is not reciprocal to comparison_matrix[{j}][{i}] = {}",
                                matrix[j][i]
                            ),
                        ));
                    }
                }
            }
        }

        let weights = row_average_weights(matrix);
        let consistency_ratio = consistency_ratio(matrix, &weights);
        if consistency_ratio > max_consistency_ratio {
            return Err(ConfigError::new(
                "comparison_matrix",
                format!(
                    "consistency ratio {consistency_ratio:.3} exceeds {max_consistency_ratio}"
                ),
            ));
        }

        Ok(Self {
            labels: labels.to_vec(),
            weights,
            consistency_ratio,
        })
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// One weight per label, summing to 1.
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn consistency_ratio(&self) -> f64 {
        self.consistency_ratio
    }

    /// Orders `scores` to match the label order. Labels are checked against
    /// each command's criteria when the cluster is built; an absent one
    /// contributes `0.0`.
    pub fn input_row(&self, scores: &HashMap<String, f64>) -> Vec<f64> {
        self.labels
            .iter()
            .map(|label| scores.get(label).copied().unwrap_or(0.0))
            .collect()
    }

    /// `priority * sum(row[i] * weight[i])`
    pub fn composite(&self, row: &[f64], priority: f64) -> f64 {
        let weighted: f64 = row.iter().zip(&self.weights).map(|(x, w)| x * w).sum();
        priority * weighted
    }
}

/// Column sums, normalise each column, then average each row.
fn row_average_weights(matrix: &[Vec<f64>]) -> Vec<f64> {
    let n = matrix.len();
    let column_sums: Vec<f64> = (0..n).map(|j| matrix.iter().map(|row| row[j]).sum()).collect();
    matrix
        .iter()
        .map(|row| {
            row.iter()
                .zip(&column_sums)
                .map(|(v, sum)| v / sum)
                .sum::<f64>()
                / n as f64
        })
        .collect()
}

/// Saaty consistency ratio via the principal eigenvalue estimate.
fn consistency_ratio(matrix: &[Vec<f64>], weights: &[f64]) -> f64 {
    let n = matrix.len();
    if n < 3 {
        return 0.0;
    }
    let lambda_max = matrix
        .iter()
        .zip(weights)
        .map(|(row, w)| row.iter().zip(weights).map(|(a, wj)| a * wj).sum::<f64>() / w)
        .sum::<f64>()
        / n as f64;
    let consistency_index = (lambda_max - n as f64) / (n as f64 - 1.0);
    let random_index = RANDOM_INDEX[n.min(RANDOM_INDEX.len() - 1)];
    (consistency_index / random_index).max(0.0)
}

/// One ranked curtailment candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub device: String,
    pub command: String,
    pub score: f64,
}

/// Sorts candidates by descending score. Equal scores keep their input
/// (declaration) order.
pub fn rank(mut candidates: Vec<Candidate>) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
    candidates
}
