//! Nonparametric divergence estimation between bags
//!
//! Estimates divergences between the underlying distributions of two bags
//! from k-nearest-neighbor distances: within-bag distances (rho, excluding
//! the point itself) and cross-bag distances (nu). Estimates are directional
//! in general, so the resulting matrix is not guaranteed symmetric; the
//! diagonal is zero.

use crate::core::{check_bags, Bag, Result, SdmError, DEFAULT_K};
use log::debug;
use mathru::special::gamma::ln_gamma;
use nalgebra::DMatrix;
use std::fmt;
use std::str::FromStr;

/// Default trimming fraction for the trimmed-mean fix mode
pub const DEFAULT_TAIL: f64 = 0.01;

/// Which divergence to estimate
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DivSpec {
    /// Renyi-alpha divergence, alpha in (0, 1) or (1, inf)
    Renyi { alpha: f64 },
    /// Kullback-Leibler divergence
    Kl,
}

impl Default for DivSpec {
    fn default() -> Self {
        DivSpec::Renyi { alpha: 0.9 }
    }
}

impl DivSpec {
    /// Canonical name, also used as the cache key component
    pub fn name(&self) -> String {
        match self {
            DivSpec::Renyi { alpha } => format!("renyi:{alpha}"),
            DivSpec::Kl => "kl".to_string(),
        }
    }
}

impl fmt::Display for DivSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for DivSpec {
    type Err = SdmError;

    fn from_str(s: &str) -> Result<Self> {
        if s == "kl" {
            return Ok(DivSpec::Kl);
        }
        if let Some(alpha_str) = s.strip_prefix("renyi:") {
            let alpha: f64 = alpha_str
                .parse()
                .map_err(|_| SdmError::UnknownDivergence(s.to_string()))?;
            if alpha <= 0.0 || alpha == 1.0 {
                return Err(SdmError::InvalidParameter(format!(
                    "renyi alpha must be positive and != 1, got: {alpha}"
                )));
            }
            return Ok(DivSpec::Renyi { alpha });
        }
        Err(SdmError::UnknownDivergence(s.to_string()))
    }
}

/// How degenerate per-point estimates are repaired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixMode {
    /// Plain mean of per-point terms; negative final estimates clipped to 0
    Clip,
    /// Two-sided trimmed mean of per-point terms; negative final estimates
    /// clipped to 0
    Trim,
}

impl fmt::Display for FixMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FixMode::Clip => write!(f, "clip"),
            FixMode::Trim => write!(f, "trim"),
        }
    }
}

impl FromStr for FixMode {
    type Err = SdmError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "clip" => Ok(FixMode::Clip),
            "trim" => Ok(FixMode::Trim),
            _ => Err(SdmError::InvalidParameter(format!(
                "unknown fix mode: {s} (expected 'clip' or 'trim')"
            ))),
        }
    }
}

/// Estimator configuration
#[derive(Debug, Clone)]
pub struct DivOptions {
    /// Which nearest neighbor to use
    pub k: usize,
    /// Repair mode for degenerate estimates
    pub fix_mode: FixMode,
    /// Trimming fraction in [0, 0.5) for [`FixMode::Trim`]
    pub tail: f64,
    /// Floor on nearest-neighbor distances, guarding against coincident
    /// points. `None` means `min(1e-2, 10^(-100 / dim))`.
    pub min_dist: Option<f64>,
}

impl Default for DivOptions {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            fix_mode: FixMode::Clip,
            tail: DEFAULT_TAIL,
            min_dist: None,
        }
    }
}

impl DivOptions {
    /// Checks the option values for internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.k == 0 {
            return Err(SdmError::InvalidParameter(
                "k must be at least 1".to_string(),
            ));
        }
        if !(0.0..0.5).contains(&self.tail) {
            return Err(SdmError::InvalidParameter(format!(
                "tail must be in [0, 0.5), got: {}",
                self.tail
            )));
        }
        if let Some(d) = self.min_dist {
            if d <= 0.0 {
                return Err(SdmError::InvalidParameter(format!(
                    "min_dist must be positive, got: {d}"
                )));
            }
        }
        Ok(())
    }

    /// Resolve the nearest-neighbor distance floor for a feature dimension
    pub fn effective_min_dist(&self, dim: usize) -> f64 {
        self.min_dist
            .unwrap_or_else(|| 1e-2_f64.min(10f64.powf(-100.0 / dim as f64)))
    }
}

/// Restricts divergence computation to a subset of (row, col) bag pairs.
#[derive(Debug, Clone)]
pub struct PairMask {
    n: usize,
    bits: Vec<bool>,
}

impl PairMask {
    /// Mask selecting only cross pairs between the first `n_train` bags and
    /// the last `n_test` bags (both directions), skipping intra-block pairs.
    pub fn cross(n_train: usize, n_test: usize) -> Self {
        let n = n_train + n_test;
        let mut bits = vec![false; n * n];
        for i in 0..n_train {
            for j in n_train..n {
                bits[i * n + j] = true;
                bits[j * n + i] = true;
            }
        }
        Self { n, bits }
    }

    /// Whether the (i, j) pair is selected
    pub fn contains(&self, i: usize, j: usize) -> bool {
        self.bits[i * self.n + j]
    }

    /// Number of bags the mask covers
    pub fn len(&self) -> usize {
        self.n
    }

    /// Whether the mask covers zero bags
    pub fn is_empty(&self) -> bool {
        self.n == 0
    }
}

/// Estimate the pairwise divergence matrix for a set of bags.
///
/// Entry (i, j) estimates the divergence from bag i's distribution to bag
/// j's. The diagonal is 0, and so is every pair a `mask` excludes. Every bag
/// must contain more than `k` points.
pub fn estimate(
    bags: &[Bag],
    spec: DivSpec,
    opts: &DivOptions,
    mask: Option<&PairMask>,
) -> Result<DMatrix<f64>> {
    let dim = check_bags(bags)?;
    opts.validate()?;
    let n = bags.len();

    if let Some(m) = mask {
        if m.len() != n {
            return Err(SdmError::ShapeMismatch {
                expected: format!("mask over {n} bags"),
                actual: format!("{}", m.len()),
            });
        }
    }
    for (i, bag) in bags.iter().enumerate() {
        if bag.nrows() <= opts.k {
            return Err(SdmError::InvalidParameter(format!(
                "bag {i} has {} points; the k={} estimator needs more than k",
                bag.nrows(),
                opts.k
            )));
        }
    }
    if let DivSpec::Renyi { alpha } = spec {
        if opts.k as f64 - alpha + 1.0 <= 0.0 {
            return Err(SdmError::InvalidParameter(format!(
                "k={} too small for renyi alpha={alpha}",
                opts.k
            )));
        }
    }

    let min_dist = opts.effective_min_dist(dim);
    debug!(
        "estimating {} over {} bags (k={}, min_dist={:.3e})",
        spec, n, opts.k, min_dist
    );

    // Within-bag kth-NN distances are independent of the pair; compute them
    // once per bag that appears as a row of some selected pair.
    let mut rho: Vec<Option<Vec<f64>>> = vec![None; n];
    for i in 0..n {
        let needed = match mask {
            Some(m) => (0..n).any(|j| j != i && m.contains(i, j)),
            None => n > 1,
        };
        if needed {
            rho[i] = Some(within_bag_knn(&bags[i], opts.k, min_dist));
        }
    }

    let mut divs = DMatrix::zeros(n, n);
    for i in 0..n {
        for j in 0..n {
            if i == j {
                continue;
            }
            if let Some(m) = mask {
                if !m.contains(i, j) {
                    continue;
                }
            }
            let rho_i = rho[i].as_ref().ok_or_else(|| {
                SdmError::InvalidParameter(format!("no within-bag distances for bag {i}"))
            })?;
            let nu = cross_bag_knn(&bags[i], &bags[j], opts.k, min_dist);
            divs[(i, j)] = pair_divergence(spec, opts, dim, rho_i, &nu, bags[j].nrows());
        }
    }
    Ok(divs)
}

/// Median of the strictly positive entries, used to rescale the sigma grid.
/// `None` when no entry is positive.
pub fn median_positive(divs: &DMatrix<f64>) -> Option<f64> {
    let mut positive: Vec<f64> = divs.iter().copied().filter(|&d| d > 0.0).collect();
    if positive.is_empty() {
        return None;
    }
    positive.sort_by(f64::total_cmp);
    let mid = positive.len() / 2;
    Some(if positive.len() % 2 == 1 {
        positive[mid]
    } else {
        (positive[mid - 1] + positive[mid]) / 2.0
    })
}

fn squared_distance(a: &Bag, p: usize, b: &Bag, q: usize) -> f64 {
    let mut sum = 0.0;
    for c in 0..a.ncols() {
        let diff = a[(p, c)] - b[(q, c)];
        sum += diff * diff;
    }
    sum
}

/// kth smallest of `dists` (1-indexed k), floored at `min_dist`.
fn kth_smallest(mut dists: Vec<f64>, k: usize, min_dist: f64) -> f64 {
    let (_, kth, _) = dists.select_nth_unstable_by(k - 1, f64::total_cmp);
    kth.sqrt().max(min_dist)
}

/// For every point of `bag`, distance to its kth nearest neighbor among the
/// other points of the same bag.
fn within_bag_knn(bag: &Bag, k: usize, min_dist: f64) -> Vec<f64> {
    let n = bag.nrows();
    (0..n)
        .map(|p| {
            let dists: Vec<f64> = (0..n)
                .filter(|&q| q != p)
                .map(|q| squared_distance(bag, p, bag, q))
                .collect();
            kth_smallest(dists, k, min_dist)
        })
        .collect()
}

/// For every point of `from`, distance to its kth nearest neighbor in `to`.
fn cross_bag_knn(from: &Bag, to: &Bag, k: usize, min_dist: f64) -> Vec<f64> {
    (0..from.nrows())
        .map(|p| {
            let dists: Vec<f64> = (0..to.nrows())
                .map(|q| squared_distance(from, p, to, q))
                .collect();
            kth_smallest(dists, k, min_dist)
        })
        .collect()
}

/// Aggregate per-point terms: plain mean for clip, two-sided trimmed mean
/// for trim. With small bags the trim drops nothing and matches the mean.
fn aggregate(terms: &[f64], opts: &DivOptions) -> f64 {
    match opts.fix_mode {
        FixMode::Clip => terms.iter().sum::<f64>() / terms.len() as f64,
        FixMode::Trim => {
            let drop = (opts.tail * terms.len() as f64).floor() as usize;
            if 2 * drop >= terms.len() {
                return terms.iter().sum::<f64>() / terms.len() as f64;
            }
            let mut sorted = terms.to_vec();
            sorted.sort_by(f64::total_cmp);
            let kept = &sorted[drop..terms.len() - drop];
            kept.iter().sum::<f64>() / kept.len() as f64
        }
    }
}

/// One directional divergence estimate from precomputed kNN distances.
fn pair_divergence(
    spec: DivSpec,
    opts: &DivOptions,
    dim: usize,
    rho: &[f64],
    nu: &[f64],
    m: usize,
) -> f64 {
    let n = rho.len();
    let d = dim as f64;
    let estimate = match spec {
        DivSpec::Renyi { alpha } => {
            let k = opts.k as f64;
            // ln B = 2 ln G(k) - ln G(k - alpha + 1) - ln G(k + alpha - 1)
            let ln_bias = 2.0 * ln_gamma(k) - ln_gamma(k - alpha + 1.0) - ln_gamma(k + alpha - 1.0);
            let terms: Vec<f64> = rho
                .iter()
                .zip(nu.iter())
                .map(|(&r, &v)| {
                    let ratio = ((n - 1) as f64 * r.powf(d)) / (m as f64 * v.powf(d));
                    ratio.powf(1.0 - alpha)
                })
                .collect();
            let mean = aggregate(&terms, opts);
            (mean.ln() + ln_bias) / (alpha - 1.0)
        }
        DivSpec::Kl => {
            let terms: Vec<f64> = rho
                .iter()
                .zip(nu.iter())
                .map(|(&r, &v)| (v / r).ln())
                .collect();
            d * aggregate(&terms, opts) + (m as f64 / (n - 1) as f64).ln()
        }
    };
    // Both fix modes repair degenerate negative estimates the same way
    if estimate.is_finite() {
        estimate.max(0.0)
    } else {
        0.0
    }
}
