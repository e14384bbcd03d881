//! Kernel construction from divergence matrices
//!
//! A divergence matrix is mapped through a Gaussian, `exp(-(d/sigma)^2 / 2)`,
//! and then projected onto the PSD cone so the result is usable as a
//! precomputed SVM kernel. Dividing the (possibly asymmetric) divergence by
//! sigma and squaring removes most of the asymmetry before the explicit
//! symmetrization inside the projection; the exponential keeps every entry in
//! (0, 1] with the diagonal at or near 1.

use nalgebra::{DMatrix, SymmetricEigen};

/// Symmetrize in place by averaging with the transpose.
fn symmetrize(mat: &mut DMatrix<f64>) {
    let n = mat.nrows();
    for i in 0..n {
        for j in (i + 1)..n {
            let avg = (mat[(i, j)] + mat[(j, i)]) / 2.0;
            mat[(i, j)] = avg;
            mat[(j, i)] = avg;
        }
    }
}

/// Project a real square matrix onto the cone of symmetric matrices whose
/// eigenvalues are all >= `min_eig`, borrowing the input (always copies).
///
/// See [`project_psd_owned`] for the allocation-reusing form.
pub fn project_psd(mat: &DMatrix<f64>, min_eig: f64) -> DMatrix<f64> {
    project_psd_owned(mat.clone(), min_eig)
}

/// Project a real square matrix onto the cone of symmetric matrices whose
/// eigenvalues are all >= `min_eig`, taking ownership of the input so its
/// storage can be reused.
///
/// The matrix is symmetrized by averaging with its transpose. If its smallest
/// eigenvalue already meets the floor, the symmetrized matrix is returned
/// without reconstruction; most real-world kernels take this path. Otherwise
/// every eigenvalue below the floor is clamped up to it, the matrix is
/// rebuilt as `V diag(clamped) V^T`, and symmetrized once more (floating
/// point reconstruction can reintroduce tiny asymmetry).
///
/// # Panics
/// Panics if the matrix is not square.
pub fn project_psd_owned(mut mat: DMatrix<f64>, min_eig: f64) -> DMatrix<f64> {
    assert_eq!(mat.nrows(), mat.ncols(), "matrix must be square");
    symmetrize(&mut mat);

    let eigenvalues = mat.symmetric_eigenvalues();
    if eigenvalues.min() >= min_eig {
        return mat;
    }

    let mut eigen = SymmetricEigen::new(mat);
    for val in eigen.eigenvalues.iter_mut() {
        if *val < min_eig {
            *val = min_eig;
        }
    }
    let mut projected = eigen.recompose();
    symmetrize(&mut projected);
    projected
}

/// Build a PSD kernel matrix from a divergence matrix and a bandwidth.
///
/// Deterministic: the same divergences and sigma always produce a
/// bit-identical kernel.
///
/// # Panics
/// Panics if `sigma` is not strictly positive.
pub fn make_kernel(divs: &DMatrix<f64>, sigma: f64) -> DMatrix<f64> {
    assert!(sigma > 0.0, "sigma must be positive, got: {}", sigma);
    let km = divs.map(|d| {
        let z = d / sigma;
        (-z * z / 2.0).exp()
    });
    project_psd_owned(km, 0.0)
}

/// Extract the train x train and test x train blocks of a kernel matrix.
///
/// Index sets are arbitrary sequences, not necessarily contiguous or sorted.
/// Both blocks are freshly allocated, as required by the SVM solver's
/// precomputed-kernel interface.
pub fn split_kernel(
    km: &DMatrix<f64>,
    train_idx: &[usize],
    test_idx: &[usize],
) -> (DMatrix<f64>, DMatrix<f64>) {
    let train_km = km.select_rows(train_idx).select_columns(train_idx);
    let test_km = km.select_rows(test_idx).select_columns(train_idx);
    (train_km, test_km)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn max_abs_diff(a: &DMatrix<f64>, b: &DMatrix<f64>) -> f64 {
        (a - b).abs().max()
    }

    #[test]
    fn test_project_psd_idempotent_on_psd_input() {
        // A A^T is always PSD
        let a = DMatrix::from_row_slice(3, 3, &[1.0, 0.2, 0.0, 0.2, 1.0, 0.3, 0.1, 0.3, 1.0]);
        let psd = &a * a.transpose();

        let projected = project_psd(&psd, 0.0);
        assert!(max_abs_diff(&projected, &psd) < 1e-10);
    }

    #[test]
    fn test_project_psd_eigenvalue_floor() {
        // Indefinite symmetric matrix
        let mat = DMatrix::from_row_slice(2, 2, &[0.0, 2.0, 2.0, 0.0]);

        for &floor in &[0.0, 0.5, 1.0] {
            let projected = project_psd(&mat, floor);
            let eigenvalues = projected.symmetric_eigenvalues();
            assert!(
                eigenvalues.min() >= floor - 1e-10,
                "floor {} violated: min eigenvalue {}",
                floor,
                eigenvalues.min()
            );
        }
    }

    #[test]
    fn test_project_psd_symmetrizes_asymmetric_input() {
        let mat = DMatrix::from_row_slice(2, 2, &[1.0, 0.4, 0.2, 1.0]);
        let projected = project_psd(&mat, 0.0);

        assert_relative_eq!(projected[(0, 1)], 0.3, epsilon = 1e-12);
        assert_relative_eq!(projected[(1, 0)], 0.3, epsilon = 1e-12);
    }

    #[test]
    fn test_project_psd_owned_matches_borrowed() {
        let mat = DMatrix::from_row_slice(3, 3, &[1.0, -2.0, 0.5, -2.0, 1.0, 0.0, 0.5, 0.0, 1.0]);
        let borrowed = project_psd(&mat, 0.0);
        let owned = project_psd_owned(mat, 0.0);
        assert!(max_abs_diff(&borrowed, &owned) < 1e-14);
    }

    #[test]
    fn test_make_kernel_range_and_diagonal() {
        let divs = DMatrix::from_row_slice(3, 3, &[0.0, 1.0, 2.0, 1.1, 0.0, 0.5, 2.2, 0.4, 0.0]);

        // Pre-projection Gaussian values are in (0, 1] with unit diagonal;
        // the projection keeps the diagonal near 1 here since the matrix is
        // close to symmetric.
        let km = make_kernel(&divs, 1.0);
        for i in 0..3 {
            assert_relative_eq!(km[(i, i)], 1.0, epsilon = 0.1);
            for j in 0..3 {
                assert!(km[(i, j)] <= 1.0 + 1e-10);
            }
        }
        // Symmetric output
        assert!(max_abs_diff(&km, &km.transpose()) < 1e-12);
    }

    #[test]
    fn test_make_kernel_deterministic() {
        let divs = DMatrix::from_row_slice(3, 3, &[0.0, 1.0, 2.0, 1.0, 0.0, 0.5, 2.0, 0.5, 0.0]);
        let a = make_kernel(&divs, 0.7);
        let b = make_kernel(&divs, 0.7);
        assert_eq!(a.as_slice(), b.as_slice());
    }

    #[test]
    fn test_make_kernel_is_psd() {
        // Strongly asymmetric divergences still yield a PSD kernel
        let divs = DMatrix::from_row_slice(4, 4, &[
            0.0, 3.0, 0.1, 2.0, //
            0.5, 0.0, 1.5, 0.2, //
            2.5, 0.3, 0.0, 1.0, //
            0.4, 2.8, 0.6, 0.0,
        ]);
        let km = make_kernel(&divs, 0.5);
        let eigenvalues = km.symmetric_eigenvalues();
        assert!(eigenvalues.min() >= -1e-10);
    }

    #[test]
    #[should_panic(expected = "sigma must be positive")]
    fn test_make_kernel_rejects_nonpositive_sigma() {
        let divs = DMatrix::zeros(2, 2);
        make_kernel(&divs, 0.0);
    }

    #[test]
    fn test_split_kernel_blocks() {
        let km = DMatrix::from_row_slice(4, 4, &[
            11.0, 12.0, 13.0, 14.0, //
            21.0, 22.0, 23.0, 24.0, //
            31.0, 32.0, 33.0, 34.0, //
            41.0, 42.0, 43.0, 44.0,
        ]);

        // Non-contiguous, unsorted index sets
        let (train_km, test_km) = split_kernel(&km, &[3, 0], &[2]);

        assert_eq!(train_km.nrows(), 2);
        assert_eq!(train_km.ncols(), 2);
        assert_eq!(train_km[(0, 0)], 44.0);
        assert_eq!(train_km[(0, 1)], 41.0);
        assert_eq!(train_km[(1, 0)], 14.0);
        assert_eq!(train_km[(1, 1)], 11.0);

        assert_eq!(test_km.nrows(), 1);
        assert_eq!(test_km.ncols(), 2);
        assert_eq!(test_km[(0, 0)], 34.0);
        assert_eq!(test_km[(0, 1)], 31.0);
    }
}
