pub mod config;
pub mod constants;
pub mod convert;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod sink;

pub use error::{ExcavatorError, NormalizationAnomaly, Result};
