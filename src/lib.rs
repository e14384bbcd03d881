//! Support distribution machines: SVM classification of sample sets
//! through kernels built from nonparametric divergence estimates.
//!
//! Based on "Kernels on Sample Sets via Nonparametric Divergence Estimates"
//! by Sutherland, Xiong, Poczos and Schneider.

pub mod cache;
pub mod core;
pub mod cv;
pub mod divergence;
pub mod kernel;
pub mod machine;
pub mod svm;
pub mod tuner;

// Re-export main types for convenience
pub use crate::cache::DivCache;
pub use crate::core::error::{Result, SdmError};
pub use crate::core::types::*;
pub use crate::cv::{crossvalidate, kfold, CvOutput};
pub use crate::divergence::{DivOptions, DivSpec, FixMode};
pub use crate::kernel::{make_kernel, project_psd, split_kernel};
pub use crate::machine::{transduct, FittedSdm, Sdm, SdmParams, TransductOutput};
pub use crate::tuner::{tune, TuneOptions};

// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
