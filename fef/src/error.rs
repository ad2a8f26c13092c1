use std::io;

/// The error kinds surfaced by the segment store and the JSON-to-FEF
/// transducer. Every non-programming-error condition described in the
/// component design propagates out of `load` as one of these variants; only
/// `InvariantViolated` represents a bug in the transducer itself rather than
/// a property of the input.
#[derive(Debug, thiserror::Error)]
pub enum FefError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON parse error at byte {position} (last token: {last_token:?}): {message}")]
    Parse {
        position: usize,
        last_token: String,
        message: String,
    },

    #[error("unsupported JSON value kind: {0}")]
    UnsupportedValueKind(&'static str),

    #[error("CSV column '{column}' could not be parsed as Long, Double, or String")]
    CsvTypeInferenceFailed { column: String },

    #[error("failed to allocate segment '{0}'")]
    SegmentAlloc(String),

    #[error("segment '{0}' is not loaded")]
    SegmentNotLoaded(String),

    #[error("FEF invariant violated: {0}")]
    InvariantViolated(String),

    #[error("no child with key '{0}'")]
    KeyNotFound(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FefError>;
