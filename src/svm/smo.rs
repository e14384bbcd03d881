//! Sequential Minimal Optimization on a precomputed kernel
//!
//! Binary SMO specialized for dense precomputed Gram matrices: kernel values
//! are plain lookups, so there is no kernel cache, and each sample carries
//! its own box constraint so class reweighting is just a per-sample C.

use nalgebra::DMatrix;

/// A binary subproblem over a subset of a precomputed Gram matrix
pub struct BinaryProblem<'a> {
    /// Full train x train kernel
    pub gram: &'a DMatrix<f64>,
    /// Rows/columns of `gram` participating in this subproblem
    pub idx: &'a [usize],
    /// Labels in {-1, +1}, one per entry of `idx`
    pub y: &'a [f64],
    /// Per-sample box constraint, one per entry of `idx`
    pub c: &'a [f64],
    /// KKT tolerance
    pub tol: f64,
    /// Cap on outer-loop passes; reaching it yields the current iterate
    pub max_iter: usize,
    /// Restrict intermediate passes to non-bound multipliers
    pub shrinking: bool,
}

pub struct BinarySolution {
    pub alpha: Vec<f64>,
    pub bias: f64,
    pub iterations: usize,
}

impl BinaryProblem<'_> {
    fn kernel(&self, i: usize, j: usize) -> f64 {
        self.gram[(self.idx[i], self.idx[j])]
    }
}

/// Solve the dual problem. Non-convergence within `max_iter` is not an
/// error; the caller gets whatever iterate was reached.
pub fn solve(problem: &BinaryProblem) -> BinarySolution {
    let n = problem.idx.len();
    debug_assert_eq!(problem.y.len(), n);
    debug_assert_eq!(problem.c.len(), n);

    let mut alpha = vec![0.0; n];
    // E_i = output_i - y_i; all outputs start at zero
    let mut errors: Vec<f64> = problem.y.iter().map(|&y| -y).collect();

    let mut iterations = 0;
    let mut num_changed = 0;
    let mut examine_all = true;

    while (num_changed > 0 || examine_all) && iterations < problem.max_iter {
        num_changed = 0;

        if examine_all || !problem.shrinking {
            for i in 0..n {
                if examine_example(problem, i, &mut alpha, &mut errors) {
                    num_changed += 1;
                }
            }
        } else {
            // Non-bound multipliers only (0 < alpha < C_i)
            for i in 0..n {
                if alpha[i] > 0.0
                    && alpha[i] < problem.c[i]
                    && examine_example(problem, i, &mut alpha, &mut errors)
                {
                    num_changed += 1;
                }
            }
        }

        if examine_all {
            examine_all = false;
        } else if num_changed == 0 {
            examine_all = true;
        }

        iterations += 1;
    }

    let bias = calculate_bias(problem, &alpha, &errors);

    BinarySolution {
        alpha,
        bias,
        iterations,
    }
}

fn examine_example(
    problem: &BinaryProblem,
    i: usize,
    alpha: &mut [f64],
    errors: &mut [f64],
) -> bool {
    let y_i = problem.y[i];
    let e_i = errors[i];
    let r_i = e_i * y_i;

    // KKT violation: can increase alpha_i, or can decrease it
    if (r_i < -problem.tol && alpha[i] < problem.c[i]) || (r_i > problem.tol && alpha[i] > 0.0) {
        if let Some(j) = select_second(i, e_i, errors) {
            if take_step(problem, i, j, alpha, errors) {
                return true;
            }
        }
    }
    false
}

/// Second-variable heuristic: maximize |E_i - E_j|
fn select_second(i: usize, e_i: f64, errors: &[f64]) -> Option<usize> {
    let mut best = None;
    let mut max_diff = 0.0;
    for (j, &e_j) in errors.iter().enumerate() {
        if j == i {
            continue;
        }
        let diff = (e_i - e_j).abs();
        if diff > max_diff {
            max_diff = diff;
            best = Some(j);
        }
    }
    best
}

fn take_step(
    problem: &BinaryProblem,
    i: usize,
    j: usize,
    alpha: &mut [f64],
    errors: &mut [f64],
) -> bool {
    if i == j {
        return false;
    }

    let y_i = problem.y[i];
    let y_j = problem.y[j];
    let alpha_i_old = alpha[i];
    let alpha_j_old = alpha[j];
    let e_i = errors[i];
    let e_j = errors[j];
    let s = y_i * y_j;

    // Feasible segment for alpha_j, with per-sample box constraints
    let (low, high) = if y_i != y_j {
        let diff = alpha_j_old - alpha_i_old;
        (0f64.max(diff), problem.c[j].min(problem.c[i] + diff))
    } else {
        let sum = alpha_i_old + alpha_j_old;
        (0f64.max(sum - problem.c[i]), problem.c[j].min(sum))
    };
    if low >= high {
        return false;
    }

    let k_ii = problem.kernel(i, i);
    let k_ij = problem.kernel(i, j);
    let k_jj = problem.kernel(j, j);
    let eta = k_ii + k_jj - 2.0 * k_ij;
    if eta <= 0.0 {
        // Degenerate curvature; skip the pair
        return false;
    }

    let mut alpha_j_new = alpha_j_old + y_j * (e_i - e_j) / eta;
    alpha_j_new = alpha_j_new.clamp(low, high);

    if (alpha_j_new - alpha_j_old).abs()
        < problem.tol * (alpha_j_new + alpha_j_old + problem.tol)
    {
        return false;
    }

    let alpha_i_new = alpha_i_old + s * (alpha_j_old - alpha_j_new);
    alpha[i] = alpha_i_new;
    alpha[j] = alpha_j_new;

    let delta_i = alpha_i_new - alpha_i_old;
    let delta_j = alpha_j_new - alpha_j_old;
    for (k, e_k) in errors.iter_mut().enumerate() {
        *e_k += y_i * delta_i * problem.kernel(i, k) + y_j * delta_j * problem.kernel(j, k);
    }
    true
}

/// Bias from margin support vectors, falling back to all support vectors
fn calculate_bias(problem: &BinaryProblem, alpha: &[f64], errors: &[f64]) -> f64 {
    let margin: Vec<f64> = alpha
        .iter()
        .zip(errors.iter())
        .zip(problem.c.iter())
        .filter(|((&a, _), &c)| a > problem.tol && a < c - problem.tol)
        .map(|((_, &e), _)| e)
        .collect();
    if !margin.is_empty() {
        return -margin.iter().sum::<f64>() / margin.len() as f64;
    }

    let support: Vec<f64> = alpha
        .iter()
        .zip(errors.iter())
        .filter(|(&a, _)| a > problem.tol)
        .map(|(_, &e)| e)
        .collect();
    if support.is_empty() {
        0.0
    } else {
        -support.iter().sum::<f64>() / support.len() as f64
    }
}
