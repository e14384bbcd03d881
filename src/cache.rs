//! Persistent divergence cache
//!
//! Divergence estimation is by far the most expensive step of the pipeline,
//! so computed matrices can be cached in a keyed JSON container. Keys are
//! `<div_func>/<K>`; the file also records the estimator settings it was
//! built under, and a load against different settings fails loudly rather
//! than returning stale data.

use crate::core::{check_bags, Bag, Result, SdmError};
use crate::divergence::{self, DivOptions, DivSpec};
use log::info;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

/// Settings a cache file was built under, checked on every load
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CacheSettings {
    pub n_bags: usize,
    pub dim: usize,
    pub fix_mode: String,
    pub tail: f64,
    pub min_dist: Option<f64>,
}

impl CacheSettings {
    fn for_request(bags: &[Bag], opts: &DivOptions) -> Result<Self> {
        let dim = check_bags(bags)?;
        Ok(Self {
            n_bags: bags.len(),
            dim,
            fix_mode: opts.fix_mode.to_string(),
            tail: opts.tail,
            min_dist: opts.min_dist,
        })
    }
}

#[derive(Serialize, Deserialize)]
struct CacheFile {
    settings: CacheSettings,
    /// Row-major matrices keyed by "<div_func>/<K>"
    entries: BTreeMap<String, Vec<Vec<f64>>>,
}

/// A divergence cache backed by one JSON file
pub struct DivCache {
    path: PathBuf,
}

impl DivCache {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn key(spec: DivSpec, k: usize) -> String {
        format!("{}/{}", spec.name(), k)
    }

    fn read_file(&self) -> Result<Option<CacheFile>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let file = File::open(&self.path)?;
        let parsed = serde_json::from_reader(BufReader::new(file))?;
        Ok(Some(parsed))
    }

    /// Load the cached matrix for this request, if present.
    ///
    /// Returns `Err(CacheMismatch)` when the file exists but was built under
    /// different estimator settings, and `Ok(None)` when the file or the key
    /// is simply absent.
    pub fn load(
        &self,
        bags: &[Bag],
        spec: DivSpec,
        opts: &DivOptions,
    ) -> Result<Option<DMatrix<f64>>> {
        let Some(cache) = self.read_file()? else {
            return Ok(None);
        };

        let expected = CacheSettings::for_request(bags, opts)?;
        if cache.settings != expected {
            return Err(SdmError::CacheMismatch(format!(
                "cache '{}' was built with {:?}, request uses {:?}",
                self.path.display(),
                cache.settings,
                expected
            )));
        }

        let Some(rows) = cache.entries.get(&Self::key(spec, opts.k)) else {
            return Ok(None);
        };
        let n = bags.len();
        if rows.len() != n || rows.iter().any(|r| r.len() != n) {
            return Err(SdmError::CacheMismatch(format!(
                "cache '{}' entry has wrong shape for {} bags",
                self.path.display(),
                n
            )));
        }
        let flat: Vec<f64> = rows.iter().flatten().copied().collect();
        Ok(Some(DMatrix::from_row_slice(n, n, &flat)))
    }

    /// Store a matrix under this request's key, creating the file if needed.
    pub fn store(
        &self,
        bags: &[Bag],
        spec: DivSpec,
        opts: &DivOptions,
        divs: &DMatrix<f64>,
    ) -> Result<()> {
        let settings = CacheSettings::for_request(bags, opts)?;
        let mut cache = match self.read_file()? {
            Some(existing) => {
                if existing.settings != settings {
                    return Err(SdmError::CacheMismatch(format!(
                        "cache '{}' was built with {:?}, refusing to mix in {:?}",
                        self.path.display(),
                        existing.settings,
                        settings
                    )));
                }
                existing
            }
            None => CacheFile {
                settings,
                entries: BTreeMap::new(),
            },
        };

        let rows: Vec<Vec<f64>> = (0..divs.nrows())
            .map(|i| (0..divs.ncols()).map(|j| divs[(i, j)]).collect())
            .collect();
        cache.entries.insert(Self::key(spec, opts.k), rows);

        let file = File::create(&self.path)?;
        serde_json::to_writer(BufWriter::new(file), &cache)?;
        Ok(())
    }
}

/// Fetch divergences from the cache, or estimate and store them.
pub fn get_divs_cached(
    bags: &[Bag],
    spec: DivSpec,
    opts: &DivOptions,
    cache: Option<&DivCache>,
) -> Result<DMatrix<f64>> {
    if let Some(cache) = cache {
        if let Some(divs) = cache.load(bags, spec, opts)? {
            info!("loaded divergences from cache '{}'", cache.path().display());
            return Ok(divs);
        }
    }

    let divs = divergence::estimate(bags, spec, opts, None)?;

    if let Some(cache) = cache {
        info!("saving divergences to cache '{}'", cache.path().display());
        cache.store(bags, spec, opts, &divs)?;
    }
    Ok(divs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DMatrix;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};
    use tempfile::tempdir;

    fn test_bags(n: usize) -> Vec<Bag> {
        let mut rng = StdRng::seed_from_u64(5);
        let normal = Normal::new(0.0, 1.0).unwrap();
        (0..n)
            .map(|_| DMatrix::from_fn(10, 2, |_, _| normal.sample(&mut rng)))
            .collect()
    }

    #[test]
    fn test_cache_roundtrip() {
        let dir = tempdir().expect("tempdir");
        let cache = DivCache::new(dir.path().join("divs.json"));
        let bags = test_bags(3);
        let opts = DivOptions::default();
        let spec = DivSpec::Kl;

        // Empty cache: nothing to load
        assert!(cache.load(&bags, spec, &opts).unwrap().is_none());

        let divs = divergence::estimate(&bags, spec, &opts, None).unwrap();
        cache.store(&bags, spec, &opts, &divs).unwrap();

        let loaded = cache.load(&bags, spec, &opts).unwrap().expect("cached");
        assert_eq!(loaded.as_slice(), divs.as_slice());
    }

    #[test]
    fn test_cache_distinct_keys() {
        let dir = tempdir().expect("tempdir");
        let cache = DivCache::new(dir.path().join("divs.json"));
        let bags = test_bags(3);
        let opts = DivOptions::default();

        let kl = divergence::estimate(&bags, DivSpec::Kl, &opts, None).unwrap();
        cache.store(&bags, DivSpec::Kl, &opts, &kl).unwrap();

        // Different divergence function: key miss, not a settings mismatch
        let missing = cache
            .load(&bags, DivSpec::Renyi { alpha: 0.9 }, &opts)
            .unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn test_cache_settings_mismatch_fails_loudly() {
        let dir = tempdir().expect("tempdir");
        let cache = DivCache::new(dir.path().join("divs.json"));
        let bags = test_bags(3);
        let opts = DivOptions::default();
        let spec = DivSpec::Kl;

        let divs = divergence::estimate(&bags, spec, &opts, None).unwrap();
        cache.store(&bags, spec, &opts, &divs).unwrap();

        let changed = DivOptions {
            tail: 0.2,
            ..DivOptions::default()
        };
        assert!(matches!(
            cache.load(&bags, spec, &changed),
            Err(SdmError::CacheMismatch(_))
        ));

        // Different bag count is also a mismatch
        let fewer = test_bags(2);
        assert!(matches!(
            cache.load(&fewer, spec, &opts),
            Err(SdmError::CacheMismatch(_))
        ));
    }

    #[test]
    fn test_get_divs_cached_computes_then_hits() {
        let dir = tempdir().expect("tempdir");
        let cache = DivCache::new(dir.path().join("divs.json"));
        let bags = test_bags(3);
        let opts = DivOptions::default();
        let spec = DivSpec::Kl;

        let first = get_divs_cached(&bags, spec, &opts, Some(&cache)).unwrap();
        let second = get_divs_cached(&bags, spec, &opts, Some(&cache)).unwrap();
        assert_eq!(first.as_slice(), second.as_slice());

        // Cache file now holds the entry
        assert!(cache.load(&bags, spec, &opts).unwrap().is_some());
    }
}
