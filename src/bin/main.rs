//! SDM Command Line Interface
//!
//! Trains and evaluates support distribution machines on JSON datasets
//! of sample bags.

use clap::{Args, Parser, Subcommand};
use env_logger::Env;
use log::{error, info};
use sdm::cache::DivCache;
use sdm::core::{Result, SdmError, SvmParams};
use sdm::divergence::{DivOptions, DivSpec, FixMode};
use sdm::machine::SdmParams;
use sdm::{crossvalidate, transduct, Bag, Sdm};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(name = "sdm")]
#[command(about = "Support distribution machines on sample bags")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable debug output
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Transductively predict labels for the test bags of a dataset
    Predict(PredictArgs),
    /// Cross-validate on a labeled dataset
    Cv(CvArgs),
}

#[derive(Args)]
struct DivArgs {
    /// Divergence function: 'kl' or 'renyi:<alpha>'
    #[arg(long, default_value = "renyi:0.9")]
    div_func: String,

    /// Which nearest neighbor the estimator uses
    #[arg(short = 'K', long, default_value = "3")]
    k: usize,

    /// Degenerate-estimate repair: 'clip' or 'trim'
    #[arg(long, default_value = "clip")]
    fix_mode: String,

    /// Trimming fraction for the 'trim' fix mode
    #[arg(long, default_value = "0.01")]
    tail: f64,

    /// Floor on nearest-neighbor distances (default depends on dimension)
    #[arg(long)]
    min_dist: Option<f64>,

    /// JSON divergence cache file
    #[arg(long)]
    div_cache: Option<PathBuf>,
}

impl DivArgs {
    fn spec(&self) -> Result<DivSpec> {
        self.div_func.parse()
    }

    fn options(&self) -> Result<DivOptions> {
        let fix_mode: FixMode = self.fix_mode.parse()?;
        let opts = DivOptions {
            k: self.k,
            fix_mode,
            tail: self.tail,
            min_dist: self.min_dist,
        };
        opts.validate()?;
        Ok(opts)
    }

    fn cache(&self) -> Option<DivCache> {
        self.div_cache.as_ref().map(DivCache::new)
    }
}

#[derive(Args)]
struct TuneArgs {
    /// Candidate SVM costs (comma-separated)
    #[arg(long, value_delimiter = ',')]
    c_grid: Option<Vec<f64>>,

    /// Candidate kernel bandwidths (comma-separated)
    #[arg(long, value_delimiter = ',')]
    sigma_grid: Option<Vec<f64>>,

    /// Do not scale the sigma grid by the median divergence
    #[arg(long)]
    no_scale_sigma: bool,

    /// Number of inner tuning folds
    #[arg(long, default_value = "3")]
    tuning_folds: usize,

    /// Worker threads for the tuning grid (default: all cores)
    #[arg(short = 'j', long)]
    n_workers: Option<usize>,

    /// Weight each class inversely to its frequency
    #[arg(long)]
    weight_classes: bool,

    /// SVM convergence tolerance for the final fit
    #[arg(long, default_value = "0.001")]
    svm_tol: f64,

    /// SVM convergence tolerance for candidate fits during tuning
    #[arg(long, default_value = "0.001")]
    tuning_svm_tol: f64,

    /// Iteration cap for the final SVM fit
    #[arg(long, default_value = "1000000")]
    svm_max_iter: usize,

    /// Iteration cap for candidate fits during tuning
    #[arg(long, default_value = "1000")]
    tuning_max_iter: usize,
}

impl TuneArgs {
    fn params(&self, div: &DivArgs) -> Result<SdmParams> {
        let mut params = SdmParams {
            div_spec: div.spec()?,
            div_opts: div.options()?,
            tuning_folds: self.tuning_folds,
            n_workers: self.n_workers,
            scale_sigma: !self.no_scale_sigma,
            ..SdmParams::default()
        };
        if let Some(grid) = &self.c_grid {
            params.c_grid = sorted_grid("c-grid", grid)?;
        }
        if let Some(grid) = &self.sigma_grid {
            params.sigma_grid = sorted_grid("sigma-grid", grid)?;
        }
        params.svm = SvmParams {
            c: 1.0,
            tol: self.svm_tol,
            max_iter: self.svm_max_iter,
            shrinking: true,
            weight_classes: self.weight_classes,
        };
        params.tuning_svm = SvmParams {
            tol: self.tuning_svm_tol,
            max_iter: self.tuning_max_iter,
            ..params.svm.clone()
        };
        Ok(params)
    }
}

fn sorted_grid(name: &str, values: &[f64]) -> Result<Vec<f64>> {
    if values.is_empty() || values.iter().any(|&v| !v.is_finite() || v <= 0.0) {
        return Err(SdmError::InvalidParameter(format!(
            "{name} must be a non-empty list of positive numbers"
        )));
    }
    let mut grid = values.to_vec();
    grid.sort_by(f64::total_cmp);
    Ok(grid)
}

#[derive(Args)]
struct PredictArgs {
    /// Dataset file with train_bags, train_labels and test_bags
    data: PathBuf,

    /// Output predictions file (stdout if not specified)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Fit on the training bags alone and predict inductively, instead of
    /// the default transductive protocol that projects the kernel over
    /// train and test bags jointly
    #[arg(long)]
    induct: bool,

    #[command(flatten)]
    div: DivArgs,

    #[command(flatten)]
    tune: TuneArgs,
}

#[derive(Args)]
struct CvArgs {
    /// Dataset file with bags and labels
    data: PathBuf,

    /// Output results file (stdout if not specified)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Number of outer cross-validation folds
    #[arg(short, long, default_value = "10")]
    folds: usize,

    /// Run each fold inductively: train only on its training bags and
    /// predict from cross divergences, instead of the default transductive
    /// protocol that projects the kernel over train and test bags jointly
    #[arg(long)]
    induct: bool,

    #[command(flatten)]
    div: DivArgs,

    #[command(flatten)]
    tune: TuneArgs,
}

#[derive(Deserialize)]
struct PredictDataset {
    train_bags: Vec<Vec<Vec<f64>>>,
    train_labels: Vec<i32>,
    test_bags: Vec<Vec<Vec<f64>>>,
}

#[derive(Deserialize)]
struct CvDataset {
    bags: Vec<Vec<Vec<f64>>>,
    labels: Vec<i32>,
}

#[derive(Serialize)]
struct PredictReport {
    preds: Vec<i32>,
    sigma: f64,
    c: f64,
    finished_at: String,
}

#[derive(Serialize)]
struct CvReport {
    accuracy: f64,
    preds: Vec<i32>,
    folds: usize,
    finished_at: String,
}

fn main() {
    let cli = Cli::parse();

    let log_level = if cli.debug {
        "debug"
    } else if cli.verbose {
        "info"
    } else {
        "warn"
    };

    env_logger::Builder::from_env(Env::default().default_filter_or(log_level)).init();

    let result = match cli.command {
        Commands::Predict(args) => predict_command(args),
        Commands::Cv(args) => cv_command(args),
    };

    if let Err(e) = result {
        error!("Error: {e}");
        process::exit(1);
    }
}

fn to_bags(raw: Vec<Vec<Vec<f64>>>) -> Result<Vec<Bag>> {
    raw.into_iter()
        .map(|points| {
            let rows = points.len();
            let cols = points.first().map_or(0, Vec::len);
            if rows == 0 || cols == 0 {
                return Err(SdmError::EmptyDataset);
            }
            if points.iter().any(|p| p.len() != cols) {
                return Err(SdmError::ShapeMismatch {
                    expected: format!("{cols} features per point"),
                    actual: "ragged point list".to_string(),
                });
            }
            Ok(Bag::from_fn(rows, cols, |i, j| points[i][j]))
        })
        .collect()
}

fn write_report<T: Serialize>(report: &T, output: Option<&PathBuf>) -> Result<()> {
    let json = serde_json::to_string_pretty(report)?;
    match output {
        Some(path) => {
            fs::write(path, json)?;
            info!("Results written to: {:?}", path);
        }
        None => println!("{json}"),
    }
    Ok(())
}

fn predict_command(args: PredictArgs) -> Result<()> {
    info!("Loading dataset from: {:?}", args.data);
    let dataset: PredictDataset = serde_json::from_str(&fs::read_to_string(&args.data)?)?;
    let train_bags = to_bags(dataset.train_bags)?;
    let test_bags = to_bags(dataset.test_bags)?;
    info!(
        "Loaded {} training and {} test bags",
        train_bags.len(),
        test_bags.len()
    );

    let params = args.tune.params(&args.div)?;
    let cache = args.div.cache();
    let (preds, sigma, c) = if args.induct {
        let fitted = Sdm::new(params).fit(&train_bags, &dataset.train_labels, None, cache.as_ref())?;
        let preds = fitted.predict(&test_bags)?;
        (preds, fitted.sigma(), fitted.c())
    } else {
        let out = transduct(
            &train_bags,
            &dataset.train_labels,
            &test_bags,
            &params,
            None,
            cache.as_ref(),
        )?;
        (out.preds, out.sigma, out.c)
    };

    info!("Selected sigma={:.6} C={:.6}", sigma, c);
    let report = PredictReport {
        preds,
        sigma,
        c,
        finished_at: chrono::Utc::now().to_rfc3339(),
    };
    write_report(&report, args.output.as_ref())
}

fn cv_command(args: CvArgs) -> Result<()> {
    info!("Loading dataset from: {:?}", args.data);
    let dataset: CvDataset = serde_json::from_str(&fs::read_to_string(&args.data)?)?;
    let bags = to_bags(dataset.bags)?;
    info!("Loaded {} bags", bags.len());

    let params = args.tune.params(&args.div)?;
    let cache = args.div.cache();
    let out = crossvalidate(
        &bags,
        &dataset.labels,
        args.folds,
        !args.induct,
        &params,
        None,
        cache.as_ref(),
    )?;

    info!("Accuracy: {:.2}%", out.accuracy * 100.0);
    let report = CvReport {
        accuracy: out.accuracy,
        preds: out.preds,
        folds: args.folds,
        finished_at: chrono::Utc::now().to_rfc3339(),
    };
    write_report(&report, args.output.as_ref())
}
