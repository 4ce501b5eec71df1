use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExcavatorError {
    #[error("Input unavailable: {0}")]
    InputUnavailable(String),

    #[error("Malformed record: {0}")]
    MalformedRecord(String),

    #[error("Sink unavailable: {0}")]
    SinkUnavailable(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Conversion failed: {0}")]
    ConversionFailed(String),

    #[error("Cancelled while {0}")]
    Cancelled(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A field that could not be coerced into its canonical shape.
///
/// Anomalies never abort a record; the normalizer substitutes a fallback value
/// and keeps the anomaly on the document so callers can tell "absent" from
/// "present but malformed".
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NormalizationAnomaly {
    #[error("data field #{position} has no Name attribute")]
    MissingFieldName { position: usize },

    #[error("data field '{name}' has no text")]
    MissingFieldText { name: String },

    #[error("value '{value}' of field '{name}' matches no known date format")]
    UnparsedDate { name: String, value: String },

    #[error("unexpected shape at {path}")]
    UnexpectedShape { path: String },
}

pub type Result<T> = std::result::Result<T, ExcavatorError>;
