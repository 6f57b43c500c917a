//! # taufit
//!
//! `taufit` turns skimmed per-event ntuples into the binned, systematically varied templates that
//! a profile-likelihood fitter consumes, and reads the fitter's negative log-likelihood scans back
//! to extract best-fit values with asymmetric uncertainties.
//!
//! The crate is organised leaves first:
//!
//! - [`expression`]: opaque cut and weight expressions plus a column-wise evaluator.
//! - [`variable`] and [`selection`]: binned observables and named analysis regions.
//! - [`sample`]: the leaf / merged / split sample tree and the [`SampleSet`](sample::SampleSet).
//! - [`engine`] and [`results`]: the lazily booked histogram graph with its [`PlanCache`](engine::PlanCache).
//! - [`methods`]: data-driven jet-to-tau-fake and QCD multijet estimates.
//! - [`datacard`]: the per-observable datacard input writer.
//! - [`parabola`]: NLL scan reading, crossing extraction and the (asymmetric) parabola fit.
#![warn(clippy::perf, clippy::style)]
#![allow(clippy::excessive_precision)]

use std::sync::Arc;

use thiserror::Error;

/// Fitting campaign description (observables, regions, systematics table).
pub mod config;
/// Era, luminosity and process colours passed explicitly to writers.
pub mod context;
/// Columnar event tables, cutflows and the sources they are read from.
pub mod data;
/// Datacard input writer.
pub mod datacard;
/// The lazily booked histogram graph and the [`PlanCache`](engine::PlanCache) shared across
/// sample sets.
pub mod engine;
/// Opaque cut/weight expressions, joining rules and the column-wise evaluator.
pub mod expression;
/// Binned histograms and accumulated results.
pub mod histogram;
/// Data-driven background estimates.
pub mod methods;
/// NLL scan post-processing.
pub mod parabola;
/// Lazy results keyed by selection, variable and sample.
pub mod results;
/// Samples and sample sets.
pub mod sample;
/// Named selections (analysis regions).
pub mod selection;
/// Naming helpers and pattern matching.
pub mod utils;
/// Binned observables.
pub mod variable;

pub use context::PlotContext;
pub use engine::{EngineOptions, PlanCache};
pub use expression::Expression;
pub use histogram::{Hist1D, Hist2D};
pub use results::ResultDict;
pub use sample::{Sample, SampleSet};
pub use selection::Selection;
pub use variable::Variable;

/// The result type used throughout `taufit`.
pub type TauFitResult<T> = Result<T, TauFitError>;

/// The error type used by all `taufit` internal methods
///
/// Errors raised while a [`PlanCache`] is triggered are stored with every booking they affect
/// and handed out on each access, so foreign errors are held behind an [`Arc`] and the whole type
/// is [`Clone`].
#[derive(Error, Debug, Clone)]
pub enum TauFitError {
    /// An alias for [`std::io::Error`].
    #[error("IO Error: {0}")]
    IOError(#[source] Arc<std::io::Error>),
    /// An alias for [`parquet::errors::ParquetError`].
    #[error("Parquet Error: {0}")]
    ParquetError(#[source] Arc<parquet::errors::ParquetError>),
    /// An alias for [`arrow::error::ArrowError`].
    #[error("Arrow Error: {0}")]
    ArrowError(#[source] Arc<arrow::error::ArrowError>),
    /// An alias for [`shellexpand::LookupError`].
    #[error("Failed to expand path: {0}")]
    LookupError(#[source] Arc<shellexpand::LookupError<std::env::VarError>>),
    /// An alias for [`serde_json::Error`].
    #[error("JSON Error: {0}")]
    JsonError(#[source] Arc<serde_json::Error>),
    /// An alias for [`regex::Error`].
    #[error("Regex Error: {0}")]
    RegexError(#[from] regex::Error),
    /// An error type for [`rayon`] thread pools
    #[cfg(feature = "rayon")]
    #[error("Error building thread pool: {0}")]
    ThreadPoolError(#[source] Arc<rayon::ThreadPoolBuildError>),
    /// An input file which does not exist or cannot be opened.
    #[error("Missing input file \"{path}\"")]
    MissingFile {
        /// Path of the file
        path: String,
    },
    /// A tree which is not present in an input file.
    #[error("Missing tree \"{tree}\" in file \"{path}\"")]
    MissingTree {
        /// Path of the file
        path: String,
        /// Name of the tree
        tree: String,
    },
    /// A column (branch or alias) referenced by an expression but absent from the tree.
    #[error("Missing column \"{name}\"")]
    MissingColumn {
        /// Name of the column
        name: String,
    },
    /// A cutflow histogram which is absent from an input file.
    #[error("Missing cutflow in file \"{path}\" (sample \"{sample}\")")]
    MissingCutflow {
        /// Path of the file
        path: String,
        /// Name of the sample reading it
        sample: String,
    },
    /// An NLL scan file without usable points.
    #[error("Scan \"{path}\" has no usable points for \"{poi}\"")]
    MissingScan {
        /// Path of the scan
        path: String,
        /// Name of the scanned parameter
        poi: String,
    },
    /// An expression which could not be parsed.
    #[error("Invalid expression \"{expression}\": {reason}")]
    ExpressionError {
        /// The expression as written
        expression: String,
        /// What went wrong
        reason: String,
    },
    /// An error which occurs when the user tries to parse an invalid string of text, typically
    /// into an enum variant.
    #[error("Failed to parse string: \"{name}\" does not correspond to a valid \"{object}\"!")]
    ParseError {
        /// The string which was parsed
        name: String,
        /// The name of the object it failed to parse into
        object: String,
    },
    /// Bin edges which are empty or not strictly increasing.
    #[error("Invalid binning for \"{name}\": {reason}")]
    BinningError {
        /// Name of the object carrying the binning
        name: String,
        /// What went wrong
        reason: String,
    },
    /// Two sequences which must have equal lengths.
    #[error("Length mismatch in {context}: expected {expected}, got {actual}")]
    LengthMismatch {
        /// Where the mismatch was detected
        context: String,
        /// Expected length
        expected: usize,
        /// Observed length
        actual: usize,
    },
    /// A lookup (sample, selection, variable) without a match.
    #[error("Could not find {object} matching {terms:?}")]
    NotFound {
        /// What was searched for
        object: String,
        /// Search terms
        terms: Vec<String>,
    },
    /// A custom fallback error for errors too complex or too infrequent to warrant their own error
    /// category.
    #[error("{0}")]
    Custom(String),
}

macro_rules! shared_error {
    ($($variant:ident($error:ty)),* $(,)?) => {
        $(
            impl From<$error> for TauFitError {
                fn from(err: $error) -> Self {
                    TauFitError::$variant(Arc::new(err))
                }
            }
        )*
    };
}

shared_error!(
    IOError(std::io::Error),
    ParquetError(parquet::errors::ParquetError),
    ArrowError(arrow::error::ArrowError),
    LookupError(shellexpand::LookupError<std::env::VarError>),
    JsonError(serde_json::Error),
);

#[cfg(feature = "rayon")]
shared_error!(ThreadPoolError(rayon::ThreadPoolBuildError));
