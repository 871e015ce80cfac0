use miette::{Diagnostic, SourceSpan};
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum MutFeatError {
    #[error("Configuration error: {0}")]
    #[diagnostic(
        code("MUTFEAT-001"),
        help("Please check your mapper YAML syntax and structure.")
    )]
    ConfigError(#[source] serde_yaml::Error, #[label("here")] Option<SourceSpan>),

    #[error("I/O error: {0}")]
    #[diagnostic(code("MUTFEAT-002"), help("Check file paths and permissions."))]
    IoError(#[from] std::io::Error),

    #[error("Polars error: {0}")]
    #[diagnostic(
        code("MUTFEAT-003"),
        help("An error occurred within the data processing engine.")
    )]
    PolarsError(#[from] polars::error::PolarsError),

    #[error("Could not find feature name: {0} in transformed dataframe")]
    #[diagnostic(
        code("MUTFEAT-004"),
        help("The feature must be one of the underscore-separated parts of a transformed column group.")
    )]
    FeatureNotFound(String),

    #[error("Feature '{feature}' in column group '{group}' has no expanded count")]
    #[diagnostic(
        code("MUTFEAT-005"),
        help("Add the feature to the recognized feature list or fix the mapper grouping.")
    )]
    UncountedFeature { feature: String, group: String },

    #[error("Layout mismatch for '{group}': expanded counts sum to {expected}, transformed table has {actual} columns")]
    #[diagnostic(
        code("MUTFEAT-006"),
        help("Expanded counts must be computed from the same rows the transform was fitted on.")
    )]
    LayoutMismatch {
        group: String,
        expected: usize,
        actual: usize,
    },

    #[error("Data precondition violated: {0}")]
    #[diagnostic(code("MUTFEAT-007"), help("The input data does not have the expected shape."))]
    Precondition(String),

    #[error("Invalid arguments: {0}")]
    #[diagnostic(code("MUTFEAT-008"), help("Run with --help to see accepted values."))]
    InvalidArgs(String),

    #[error("Model error: {0}")]
    #[diagnostic(
        code("MUTFEAT-009"),
        help("Failed while fitting or applying a model.")
    )]
    ModelError(String),

    #[error("Serialization error: {0}")]
    #[diagnostic(code("MUTFEAT-010"), help("The artifact file is malformed or truncated."))]
    SerdeError(#[from] serde_json::Error),

    #[error(transparent)]
    #[diagnostic(code("MUTFEAT-000"))]
    Unknown(#[from] anyhow::Error),
}

pub type MutFeatResult<T> = Result<T, MutFeatError>;
