use std::fmt;

use thiserror::Error;

/// Pipeline stage an error surfaced from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stage {
    Load,
    Features,
    Encode,
    Scale,
    Detect(&'static str),
    Report,
    Export,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Load => write!(f, "load"),
            Stage::Features => write!(f, "features"),
            Stage::Encode => write!(f, "encode"),
            Stage::Scale => write!(f, "scale"),
            Stage::Detect(name) => write!(f, "detect:{name}"),
            Stage::Report => write!(f, "report"),
            Stage::Export => write!(f, "export"),
        }
    }
}

#[derive(Error, Debug)]
pub enum FraudError {
    #[error("schema error: {0}")]
    Schema(String),

    #[error("unknown category {value:?} for field {field}")]
    UnknownCategory { field: String, value: String },

    #[error("batch contains no records")]
    EmptyBatch,

    #[error("{0} has not been fitted")]
    NotFitted(&'static str),

    #[error("dimension mismatch: expected {expected} columns, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("row count mismatch: expected {expected} rows, got {actual}")]
    RowMismatch { expected: usize, actual: usize },

    #[error("detector error: {0}")]
    Detector(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("{stage} stage failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: Box<FraudError>,
    },
}

impl FraudError {
    /// The innermost error, skipping any stage wrappers.
    pub fn root(&self) -> &FraudError {
        match self {
            FraudError::Stage { source, .. } => source.root(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, FraudError>;

/// Attaches stage context to a failing result.
pub trait StageExt<T> {
    fn stage(self, stage: Stage) -> Result<T>;
}

impl<T> StageExt<T> for Result<T> {
    fn stage(self, stage: Stage) -> Result<T> {
        self.map_err(|source| match source {
            // Keep the innermost stage; it names where the failure happened.
            already @ FraudError::Stage { .. } => already,
            source => FraudError::Stage {
                stage,
                source: Box::new(source),
            },
        })
    }
}
