//! SVM fit/predict on precomputed kernels
//!
//! The kernel is always supplied precomputed: `fit` takes a train x train
//! Gram matrix plus integer class labels, and prediction takes a test x
//! train block whose columns follow the training order. Multiclass problems
//! are handled one-vs-one with majority voting.

pub mod smo;

use crate::core::{Result, SdmError, SvmParams};
use log::debug;
use nalgebra::DMatrix;
use std::collections::HashMap;

/// One binary machine of the one-vs-one decomposition
#[derive(Debug, Clone)]
struct PairMachine {
    pos: i32,
    neg: i32,
    /// (training-set index, alpha * y) for each support vector
    coeffs: Vec<(usize, f64)>,
    bias: f64,
}

impl PairMachine {
    fn decision(&self, cross: &DMatrix<f64>, t: usize) -> f64 {
        let mut dec = self.bias;
        for &(idx, coeff) in &self.coeffs {
            dec += coeff * cross[(t, idx)];
        }
        dec
    }
}

/// A fitted SVM over a precomputed kernel
#[derive(Debug, Clone)]
pub struct SvmModel {
    classes: Vec<i32>,
    machines: Vec<PairMachine>,
    n_train: usize,
}

impl SvmModel {
    /// Distinct class labels, ascending
    pub fn classes(&self) -> &[i32] {
        &self.classes
    }

    /// Number of training samples the kernel columns must follow
    pub fn n_train(&self) -> usize {
        self.n_train
    }

    /// Predict labels for a test x train kernel block.
    ///
    /// # Panics
    /// Panics if the block does not have one column per training sample.
    pub fn predict(&self, cross: &DMatrix<f64>) -> Vec<i32> {
        assert_eq!(
            cross.ncols(),
            self.n_train,
            "cross kernel must have one column per training sample"
        );
        (0..cross.nrows())
            .map(|t| {
                let mut votes: HashMap<i32, usize> = HashMap::new();
                for machine in &self.machines {
                    let winner = if machine.decision(cross, t) >= 0.0 {
                        machine.pos
                    } else {
                        machine.neg
                    };
                    *votes.entry(winner).or_insert(0) += 1;
                }
                // Majority vote; ties go to the smaller label since classes
                // are scanned in ascending order with strict improvement
                let mut best = self.classes[0];
                let mut best_votes = 0;
                for &class in &self.classes {
                    let v = votes.get(&class).copied().unwrap_or(0);
                    if v > best_votes {
                        best_votes = v;
                        best = class;
                    }
                }
                best
            })
            .collect()
    }
}

/// Fit an SVM on a precomputed train x train kernel.
///
/// Labels are arbitrary integers with at least two distinct values. With
/// `weight_classes`, each sample's box constraint is rescaled by
/// `n / (n_classes * n_class)` so smaller classes weigh more.
pub fn fit(gram: &DMatrix<f64>, labels: &[i32], params: &SvmParams) -> Result<SvmModel> {
    let n = gram.nrows();
    if gram.ncols() != n {
        return Err(SdmError::ShapeMismatch {
            expected: format!("{n}x{n} kernel"),
            actual: format!("{}x{}", gram.nrows(), gram.ncols()),
        });
    }
    if labels.len() != n {
        return Err(SdmError::ShapeMismatch {
            expected: format!("{n} labels"),
            actual: format!("{}", labels.len()),
        });
    }
    if n < 2 {
        return Err(SdmError::TooFewLabeled(n));
    }

    let mut classes: Vec<i32> = labels.to_vec();
    classes.sort_unstable();
    classes.dedup();
    if classes.len() < 2 {
        return Err(SdmError::InvalidLabels(
            "training labels must contain at least two classes".to_string(),
        ));
    }

    let mut counts: HashMap<i32, usize> = HashMap::new();
    for &y in labels {
        *counts.entry(y).or_insert(0) += 1;
    }
    let class_weight = |y: i32| -> f64 {
        if params.weight_classes {
            n as f64 / (classes.len() as f64 * counts[&y] as f64)
        } else {
            1.0
        }
    };

    let mut machines = Vec::with_capacity(classes.len() * (classes.len() - 1) / 2);
    for p in 0..classes.len() {
        for q in (p + 1)..classes.len() {
            let pos = classes[p];
            let neg = classes[q];

            let idx: Vec<usize> = (0..n).filter(|&i| labels[i] == pos || labels[i] == neg).collect();
            let y: Vec<f64> = idx
                .iter()
                .map(|&i| if labels[i] == pos { 1.0 } else { -1.0 })
                .collect();
            let c: Vec<f64> = idx
                .iter()
                .map(|&i| params.c * class_weight(labels[i]))
                .collect();

            let solution = smo::solve(&smo::BinaryProblem {
                gram,
                idx: &idx,
                y: &y,
                c: &c,
                tol: params.tol,
                max_iter: params.max_iter,
                shrinking: params.shrinking,
            });
            debug!(
                "pair ({pos}, {neg}): {} samples, {} iterations",
                idx.len(),
                solution.iterations
            );

            let coeffs: Vec<(usize, f64)> = solution
                .alpha
                .iter()
                .enumerate()
                .filter(|(_, &a)| a > 1e-12)
                .map(|(s, &a)| (idx[s], a * y[s]))
                .collect();
            machines.push(PairMachine {
                pos,
                neg,
                coeffs,
                bias: solution.bias,
            });
        }
    }

    Ok(SvmModel {
        classes,
        machines,
        n_train: n,
    })
}
