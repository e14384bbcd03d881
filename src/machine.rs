//! Support distribution machines: SVM classification of sample bags
//! through Gaussian kernels on nonparametric divergence estimates.

use log::info;
use nalgebra::DMatrix;

use crate::cache::{get_divs_cached, DivCache};
use crate::core::{
    check_bags, check_labels, Bag, Result, SdmError, SvmParams, DEFAULT_TUNING_FOLDS, UNLABELED,
};
use crate::divergence::{estimate, DivOptions, DivSpec, PairMask};
use crate::kernel::{make_kernel, split_kernel};
use crate::svm::{self, SvmModel};
use crate::tuner::{tune, TuneOptions};

/// Full configuration for a support distribution machine.
#[derive(Debug, Clone)]
pub struct SdmParams {
    /// Divergence function estimated between bags.
    pub div_spec: DivSpec,
    /// Estimator knobs (neighbor count, degeneracy handling).
    pub div_opts: DivOptions,
    /// Inner folds used during parameter tuning.
    pub tuning_folds: usize,
    /// Worker thread override for the tuning pool.
    pub n_workers: Option<usize>,
    /// Candidate SVM costs.
    pub c_grid: Vec<f64>,
    /// Candidate bandwidths, scaled by the median divergence when
    /// `scale_sigma` is set.
    pub sigma_grid: Vec<f64>,
    pub scale_sigma: bool,
    /// Solver settings for the final fit.
    pub svm: SvmParams,
    /// Solver settings for the candidate fits during tuning.
    pub tuning_svm: SvmParams,
}

impl Default for SdmParams {
    fn default() -> Self {
        SdmParams {
            div_spec: DivSpec::default(),
            div_opts: DivOptions::default(),
            tuning_folds: DEFAULT_TUNING_FOLDS,
            n_workers: None,
            c_grid: crate::core::default_c_grid(),
            sigma_grid: crate::core::default_sigma_grid(),
            scale_sigma: true,
            svm: SvmParams::default(),
            tuning_svm: SvmParams::tuning(),
        }
    }
}

impl SdmParams {
    fn tune_options(&self) -> TuneOptions {
        TuneOptions {
            c_grid: self.c_grid.clone(),
            sigma_grid: self.sigma_grid.clone(),
            scale_sigma: self.scale_sigma,
            num_folds: self.tuning_folds,
            n_workers: self.n_workers,
            svm: self.tuning_svm.clone(),
        }
    }

    fn final_svm(&self, c: f64) -> SvmParams {
        SvmParams {
            c,
            ..self.svm.clone()
        }
    }
}

/// Labels plus the tuned parameters a transductive run settled on.
#[derive(Debug, Clone)]
pub struct TransductOutput {
    pub preds: Vec<i32>,
    pub sigma: f64,
    pub c: f64,
}

/// Transductive train-and-predict: the kernel over the union of training
/// and test bags is projected once, so test bags participate in the PSD
/// correction without leaking their labels.
///
/// Tuning only ever sees the training block of the divergence matrix.
pub fn transduct(
    train_bags: &[Bag],
    train_labels: &[i32],
    test_bags: &[Bag],
    params: &SdmParams,
    divs: Option<&DMatrix<f64>>,
    cache: Option<&DivCache>,
) -> Result<TransductOutput> {
    let n_train = train_bags.len();
    let n_test = test_bags.len();
    let n_total = n_train + n_test;
    if n_train < 2 {
        return Err(SdmError::TooFewLabeled(n_train));
    }
    check_labels(train_labels, n_train, false)?;

    let divs = match divs {
        Some(d) => {
            if d.nrows() != n_total || d.ncols() != n_total {
                return Err(SdmError::ShapeMismatch {
                    expected: format!("{}x{}", n_total, n_total),
                    actual: format!("{}x{}", d.nrows(), d.ncols()),
                });
            }
            d.clone()
        }
        None => {
            let all_bags: Vec<Bag> = train_bags.iter().chain(test_bags).cloned().collect();
            check_bags(&all_bags)?;
            get_divs_cached(&all_bags, params.div_spec, &params.div_opts, cache)?
        }
    };

    let train_divs = divs.view((0, 0), (n_train, n_train)).into_owned();
    let (sigma, c) = tune(&train_divs, train_labels, &params.tune_options())?;
    info!("transducting with sigma={:.6} C={:.6}", sigma, c);

    let km = make_kernel(&divs, sigma);
    let train_idx: Vec<usize> = (0..n_train).collect();
    let test_idx: Vec<usize> = (n_train..n_total).collect();
    let (train_km, test_km) = split_kernel(&km, &train_idx, &test_idx);

    let model = svm::fit(&train_km, train_labels, &params.final_svm(c))?;
    let preds = model.predict(&test_km);
    Ok(TransductOutput { preds, sigma, c })
}

/// Inductive estimator. [`Sdm::fit`] consumes labeled bags and returns a
/// [`FittedSdm`] that can classify bags unseen at training time.
#[derive(Debug, Clone, Default)]
pub struct Sdm {
    params: SdmParams,
}

impl Sdm {
    pub fn new(params: SdmParams) -> Self {
        Sdm { params }
    }

    pub fn params(&self) -> &SdmParams {
        &self.params
    }

    /// Tunes and trains on the labeled bags in `bags`.
    ///
    /// Bags labeled [`UNLABELED`] take part in the kernel projection but
    /// not in tuning or the final SVM. The labeled bags are retained in
    /// the fitted model, in their original order, for later prediction.
    pub fn fit(
        &self,
        bags: &[Bag],
        labels: &[i32],
        divs: Option<&DMatrix<f64>>,
        cache: Option<&DivCache>,
    ) -> Result<FittedSdm> {
        let n = bags.len();
        check_bags(bags)?;
        check_labels(labels, n, true)?;

        let labeled_idx: Vec<usize> = (0..n).filter(|&i| labels[i] != UNLABELED).collect();
        if labeled_idx.len() < 2 {
            return Err(SdmError::TooFewLabeled(labeled_idx.len()));
        }
        let labeled_labels: Vec<i32> = labeled_idx.iter().map(|&i| labels[i]).collect();

        let divs = match divs {
            Some(d) => {
                if d.nrows() != n || d.ncols() != n {
                    return Err(SdmError::ShapeMismatch {
                        expected: format!("{}x{}", n, n),
                        actual: format!("{}x{}", d.nrows(), d.ncols()),
                    });
                }
                d.clone()
            }
            None => get_divs_cached(bags, self.params.div_spec, &self.params.div_opts, cache)?,
        };

        let tune_divs = divs.select_rows(&labeled_idx).select_columns(&labeled_idx);
        let (sigma, c) = tune(&tune_divs, &labeled_labels, &self.params.tune_options())?;
        info!("fitting with sigma={:.6} C={:.6}", sigma, c);

        // Unlabeled bags shape the projection of the full kernel even
        // though only the labeled block reaches the solver.
        let km = make_kernel(&divs, sigma);
        let train_km = km.select_rows(&labeled_idx).select_columns(&labeled_idx);
        let model = svm::fit(&train_km, &labeled_labels, &self.params.final_svm(c))?;

        let train_bags: Vec<Bag> = labeled_idx.iter().map(|&i| bags[i].clone()).collect();
        Ok(FittedSdm {
            params: self.params.clone(),
            sigma,
            c,
            model,
            train_bags,
        })
    }
}

/// A trained support distribution machine.
#[derive(Debug, Clone)]
pub struct FittedSdm {
    params: SdmParams,
    sigma: f64,
    c: f64,
    model: SvmModel,
    train_bags: Vec<Bag>,
}

impl FittedSdm {
    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    pub fn c(&self) -> f64 {
        self.c
    }

    pub fn classes(&self) -> &[i32] {
        self.model.classes()
    }

    pub fn train_bags(&self) -> &[Bag] {
        &self.train_bags
    }

    /// Classifies new bags against the retained training bags.
    ///
    /// Only the test-by-train divergences are estimated. The resulting
    /// cross kernel is not PSD-projected; the decision functions only
    /// need rows of kernel values against the training bags.
    pub fn predict(&self, new_bags: &[Bag]) -> Result<Vec<i32>> {
        if new_bags.is_empty() {
            return Ok(Vec::new());
        }
        let dim = check_bags(new_bags)?;
        let train_dim = self.train_bags[0].ncols();
        if dim != train_dim {
            return Err(SdmError::ShapeMismatch {
                expected: format!("{} features", train_dim),
                actual: format!("{} features", dim),
            });
        }

        let n_train = self.train_bags.len();
        let n_test = new_bags.len();
        let union: Vec<Bag> = self.train_bags.iter().chain(new_bags).cloned().collect();
        let mask = PairMask::cross(n_train, n_test);
        let divs = estimate(&union, self.params.div_spec, &self.params.div_opts, Some(&mask))?;

        // Divergence estimates are asymmetric; average the two directions.
        let cross = DMatrix::from_fn(n_test, n_train, |t, s| {
            (divs[(n_train + t, s)] + divs[(s, n_train + t)]) / 2.0
        });
        self.predict_with_divs(&cross)
    }

    /// Classifies from precomputed test-by-train divergences.
    pub fn predict_with_divs(&self, cross_divs: &DMatrix<f64>) -> Result<Vec<i32>> {
        if cross_divs.ncols() != self.train_bags.len() {
            return Err(SdmError::ShapeMismatch {
                expected: format!("n_test x {}", self.train_bags.len()),
                actual: format!("{}x{}", cross_divs.nrows(), cross_divs.ncols()),
            });
        }
        let km = cross_divs.map(|d| (-(d / self.sigma).powi(2) / 2.0).exp());
        Ok(self.model.predict(&km))
    }
}
