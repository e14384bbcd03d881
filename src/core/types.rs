//! Core type definitions for the SDM pipeline

use crate::core::{Result, SdmError};
use nalgebra::DMatrix;

/// A bag: one example represented as a matrix of row-instance feature
/// vectors, all drawn from the same underlying distribution.
pub type Bag = DMatrix<f64>;

/// Sentinel label marking a bag as unlabeled. Sentinel bags participate in
/// shaping the projected kernel but are excluded from the SVM objective and
/// from accuracy scoring.
pub const UNLABELED: i32 = -1;

/// Default number of nearest neighbors for the divergence estimator
pub const DEFAULT_K: usize = 3;

/// Default number of folds for hyperparameter tuning
pub const DEFAULT_TUNING_FOLDS: usize = 3;

/// Default SVM solution tolerance
pub const DEFAULT_SVM_TOL: f64 = 1e-3;

/// Default iteration cap for the final SVM fit
pub const DEFAULT_SVM_ITER: usize = 1_000_000;

/// Default iteration cap for SVM fits during tuning
pub const DEFAULT_SVM_ITER_TUNING: usize = 1_000;

/// Default regularization grid: 2^-9, 2^-6, ..., 2^18
pub fn default_c_grid() -> Vec<f64> {
    (-9..19).step_by(3).map(|e| 2f64.powi(e)).collect()
}

/// Default bandwidth grid: 2^-4, 2^-2, ..., 2^10
pub fn default_sigma_grid() -> Vec<f64> {
    (-4..11).step_by(2).map(|e| 2f64.powi(e)).collect()
}

/// Configuration for a single SVM fit on a precomputed kernel
#[derive(Debug, Clone)]
pub struct SvmParams {
    /// Regularization parameter (upper bound for the dual variables)
    pub c: f64,
    /// Tolerance for KKT conditions
    pub tol: f64,
    /// Iteration cap; reaching it is not an error, the current iterate is
    /// kept (possibly suboptimal)
    pub max_iter: usize,
    /// Restrict intermediate passes to non-bound multipliers
    pub shrinking: bool,
    /// Rescale each sample's box constraint so classes contribute equally
    pub weight_classes: bool,
}

impl Default for SvmParams {
    fn default() -> Self {
        Self {
            c: 1.0,
            tol: DEFAULT_SVM_TOL,
            max_iter: DEFAULT_SVM_ITER,
            shrinking: true,
            weight_classes: false,
        }
    }
}

impl SvmParams {
    /// Defaults for tuning-time fits (tight iteration cap)
    pub fn tuning() -> Self {
        Self {
            max_iter: DEFAULT_SVM_ITER_TUNING,
            ..Self::default()
        }
    }
}

/// Check that every bag is non-empty and shares one feature dimensionality.
/// Returns that dimensionality.
pub fn check_bags(bags: &[Bag]) -> Result<usize> {
    let first = bags.first().ok_or(SdmError::EmptyDataset)?;
    let dim = first.ncols();
    if dim == 0 {
        return Err(SdmError::InvalidParameter(
            "bags must have at least one feature column".to_string(),
        ));
    }
    for (i, bag) in bags.iter().enumerate() {
        if bag.nrows() == 0 {
            return Err(SdmError::InvalidParameter(format!(
                "bag {i} contains no points"
            )));
        }
        if bag.ncols() != dim {
            return Err(SdmError::ShapeMismatch {
                expected: format!("{dim} feature columns"),
                actual: format!("{} in bag {i}", bag.ncols()),
            });
        }
    }
    Ok(dim)
}

/// Validate a label vector against a bag count. Labels must be >= -1;
/// the sentinel is only admitted when `allow_sentinel` is set.
pub fn check_labels(labels: &[i32], n_bags: usize, allow_sentinel: bool) -> Result<()> {
    if labels.len() != n_bags {
        return Err(SdmError::ShapeMismatch {
            expected: format!("{n_bags} labels"),
            actual: format!("{}", labels.len()),
        });
    }
    for &y in labels {
        if y < UNLABELED {
            return Err(SdmError::InvalidLabels(format!(
                "label {y} is below the sentinel value {UNLABELED}"
            )));
        }
        if y == UNLABELED && !allow_sentinel {
            return Err(SdmError::InvalidLabels(
                "sentinel label not permitted here".to_string(),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_grids() {
        let c = default_c_grid();
        assert_eq!(c.len(), 10);
        assert_eq!(c[0], 2f64.powi(-9));
        assert_eq!(*c.last().unwrap(), 2f64.powi(18));

        let sigma = default_sigma_grid();
        assert_eq!(sigma.len(), 8);
        assert_eq!(sigma[0], 2f64.powi(-4));
        assert_eq!(*sigma.last().unwrap(), 2f64.powi(10));
    }

    #[test]
    fn test_svm_params_defaults() {
        let params = SvmParams::default();
        assert_eq!(params.c, 1.0);
        assert_eq!(params.tol, 1e-3);
        assert_eq!(params.max_iter, 1_000_000);
        assert!(params.shrinking);
        assert!(!params.weight_classes);

        let tuning = SvmParams::tuning();
        assert_eq!(tuning.max_iter, 1_000);
        assert_eq!(tuning.tol, 1e-3);
    }

    #[test]
    fn test_check_bags_accepts_consistent_dims() {
        let bags = vec![
            DMatrix::from_row_slice(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]),
            DMatrix::from_row_slice(1, 3, &[7.0, 8.0, 9.0]),
        ];
        assert_eq!(check_bags(&bags).unwrap(), 3);
    }

    #[test]
    fn test_check_bags_rejects_mismatched_dims() {
        let bags = vec![
            DMatrix::from_row_slice(1, 2, &[1.0, 2.0]),
            DMatrix::from_row_slice(1, 3, &[1.0, 2.0, 3.0]),
        ];
        assert!(matches!(
            check_bags(&bags),
            Err(SdmError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_check_bags_rejects_empty() {
        assert!(matches!(check_bags(&[]), Err(SdmError::EmptyDataset)));

        let bags = vec![DMatrix::<f64>::zeros(0, 2)];
        assert!(check_bags(&bags).is_err());
    }

    #[test]
    fn test_check_labels() {
        assert!(check_labels(&[0, 1, 2], 3, false).is_ok());
        assert!(check_labels(&[0, UNLABELED, 1], 3, true).is_ok());
        assert!(check_labels(&[0, UNLABELED, 1], 3, false).is_err());
        assert!(check_labels(&[-2, 0, 1], 3, true).is_err());
        assert!(check_labels(&[0, 1], 3, false).is_err());
    }
}
