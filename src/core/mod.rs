//! Core types shared across the SDM pipeline

pub mod error;
pub mod types;

pub use self::error::*;
pub use self::types::*;
