//! Outer cross-validation over bags.

use log::info;
use nalgebra::DMatrix;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::cache::{get_divs_cached, DivCache};
use crate::core::{check_bags, check_labels, Bag, Result, SdmError, UNLABELED};
use crate::machine::{transduct, Sdm, SdmParams};

/// Splits `0..n` into `k` shuffled folds of near-equal size.
///
/// Each returned pair is `(train, test)`. Test sets are disjoint and
/// together cover every index exactly once.
pub fn kfold<R: Rng + ?Sized>(n: usize, k: usize, rng: &mut R) -> Result<Vec<(Vec<usize>, Vec<usize>)>> {
    if k < 2 || k > n {
        return Err(SdmError::InvalidParameter(format!(
            "need 2 <= folds <= n, got {} folds for {} items",
            k, n
        )));
    }
    let mut order: Vec<usize> = (0..n).collect();
    order.shuffle(rng);

    let base = n / k;
    let extra = n % k;
    let mut folds = Vec::with_capacity(k);
    let mut start = 0;
    for f in 0..k {
        let size = base + usize::from(f < extra);
        let test: Vec<usize> = order[start..start + size].to_vec();
        let train: Vec<usize> = order[..start]
            .iter()
            .chain(&order[start + size..])
            .copied()
            .collect();
        folds.push((train, test));
        start += size;
    }
    Ok(folds)
}

/// Result of [`crossvalidate`].
#[derive(Debug, Clone)]
pub struct CvOutput {
    /// Fraction of bags classified correctly.
    pub accuracy: f64,
    /// Predicted label for every bag, in input order.
    pub preds: Vec<i32>,
}

/// k-fold cross-validation of the full pipeline.
///
/// When `project_all` is set each fold runs transductively, projecting
/// the kernel over its train-plus-test union; otherwise each fold trains
/// an inductive estimator and predicts from the test-by-train block of
/// the already computed divergence matrix.
pub fn crossvalidate(
    bags: &[Bag],
    labels: &[i32],
    num_folds: usize,
    project_all: bool,
    params: &SdmParams,
    divs: Option<&DMatrix<f64>>,
    cache: Option<&DivCache>,
) -> Result<CvOutput> {
    let n = bags.len();
    check_bags(bags)?;
    check_labels(labels, n, false)?;

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
        None => get_divs_cached(bags, params.div_spec, &params.div_opts, cache)?,
    };

    let folds = kfold(n, num_folds, &mut rand::thread_rng())?;
    let mut preds = vec![UNLABELED; n];

    for (fi, (train_idx, test_idx)) in folds.iter().enumerate() {
        info!("fold {}/{}: {} test bags", fi + 1, num_folds, test_idx.len());
        let train_bags: Vec<Bag> = train_idx.iter().map(|&i| bags[i].clone()).collect();
        let train_labels: Vec<i32> = train_idx.iter().map(|&i| labels[i]).collect();
        let test_bags: Vec<Bag> = test_idx.iter().map(|&i| bags[i].clone()).collect();

        let fold_preds = if project_all {
            let both: Vec<usize> = train_idx.iter().chain(test_idx).copied().collect();
            let sub_divs = divs.select_rows(&both).select_columns(&both);
            transduct(
                &train_bags,
                &train_labels,
                &test_bags,
                params,
                Some(&sub_divs),
                None,
            )?
            .preds
        } else {
            let train_divs = divs.select_rows(train_idx).select_columns(train_idx);
            let fitted = Sdm::new(params.clone()).fit(
                &train_bags,
                &train_labels,
                Some(&train_divs),
                None,
            )?;
            // Average the two estimate directions for the cross block.
            let cross = DMatrix::from_fn(test_idx.len(), train_idx.len(), |t, s| {
                (divs[(test_idx[t], train_idx[s])] + divs[(train_idx[s], test_idx[t])]) / 2.0
            });
            fitted.predict_with_divs(&cross)?
        };

        for (&i, &p) in test_idx.iter().zip(fold_preds.iter()) {
            preds[i] = p;
        }
    }

    let accuracy = accuracy(&preds, labels);
    info!("cross-validation accuracy: {:.4}", accuracy);
    Ok(CvOutput { accuracy, preds })
}

/// Fraction of predictions matching the reference labels.
pub fn accuracy(preds: &[i32], truth: &[i32]) -> f64 {
    assert_eq!(preds.len(), truth.len());
    if preds.is_empty() {
        return 0.0;
    }
    let hits = preds.iter().zip(truth).filter(|(p, t)| p == t).count();
    hits as f64 / preds.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};
    use std::collections::BTreeSet;

    #[test]
    fn kfold_partitions_exactly() {
        let mut rng = StdRng::seed_from_u64(11);
        let folds = kfold(10, 3, &mut rng).unwrap();
        assert_eq!(folds.len(), 3);
        let mut seen = BTreeSet::new();
        for (train, test) in &folds {
            assert_eq!(train.len() + test.len(), 10);
            for &i in test {
                assert!(seen.insert(i), "index {} in two test sets", i);
                assert!(!train.contains(&i));
            }
        }
        assert_eq!(seen.len(), 10);
    }

    #[test]
    fn kfold_uneven_sizes_differ_by_one() {
        let mut rng = StdRng::seed_from_u64(5);
        let folds = kfold(11, 4, &mut rng).unwrap();
        let mut sizes: Vec<usize> = folds.iter().map(|(_, t)| t.len()).collect();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![2, 3, 3, 3]);
    }

    #[test]
    fn kfold_rejects_bad_counts() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(kfold(5, 1, &mut rng).is_err());
        assert!(kfold(5, 6, &mut rng).is_err());
    }

    #[test]
    fn accuracy_counts_matches() {
        assert_eq!(accuracy(&[1, 0, 1, 1], &[1, 1, 1, 0]), 0.5);
        assert_eq!(accuracy(&[], &[]), 0.0);
    }

    fn two_class_bags(per_class: usize) -> (Vec<Bag>, Vec<i32>) {
        let mut rng = StdRng::seed_from_u64(21);
        let mut bags = Vec::new();
        let mut labels = Vec::new();
        for class in 0..2 {
            let dist = Normal::new(class as f64 * 5.0, 0.3).unwrap();
            for _ in 0..per_class {
                bags.push(Bag::from_fn(20, 2, |_, _| dist.sample(&mut rng)));
                labels.push(class);
            }
        }
        (bags, labels)
    }

    fn small_params() -> SdmParams {
        SdmParams {
            c_grid: vec![1.0],
            sigma_grid: vec![1.0],
            ..SdmParams::default()
        }
    }

    #[test]
    fn crossvalidate_transductive_separable() {
        let (bags, labels) = two_class_bags(4);
        let out = crossvalidate(&bags, &labels, 4, true, &small_params(), None, None).unwrap();
        assert_eq!(out.preds.len(), bags.len());
        assert!(out.preds.iter().all(|&p| p == 0 || p == 1));
        assert!((0.0..=1.0).contains(&out.accuracy));
    }

    #[test]
    fn crossvalidate_inductive_separable() {
        let (bags, labels) = two_class_bags(4);
        let out = crossvalidate(&bags, &labels, 4, false, &small_params(), None, None).unwrap();
        assert_eq!(out.preds.len(), bags.len());
        assert!(out.preds.iter().all(|&p| p != UNLABELED));
    }

    #[test]
    fn crossvalidate_rejects_sentinel_labels() {
        let (bags, mut labels) = two_class_bags(3);
        labels[0] = UNLABELED;
        assert!(crossvalidate(&bags, &labels, 2, true, &small_params(), None, None).is_err());
    }

    #[test]
    fn crossvalidate_rejects_wrong_divs_shape() {
        let (bags, labels) = two_class_bags(3);
        let divs = DMatrix::zeros(2, 2);
        let err = crossvalidate(&bags, &labels, 2, true, &small_params(), Some(&divs), None);
        assert!(err.is_err());
    }
}
