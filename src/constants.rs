//! Defaults shared by the CLI, the config file loader and the pipeline.

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 9200;
pub const DEFAULT_INDEX: &str = "excavator";
pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const ALL_FILES: &str = "*";

pub const ENV_USER: &str = "EXCAVATOR_USER";
pub const ENV_PASSWORD: &str = "EXCAVATOR_PASSWORD";
pub const ENV_METRICS_ADDR: &str = "EXCAVATOR_METRICS_ADDR";

// Record markers in the exported markup
pub const RECORD_OPEN: &str = "<Event";
pub const RECORD_CLOSE: &str = "</Event>";
pub const RECORD_ROOT: &str = "Event";

pub const EXPORT_EXTENSION: &str = ".xml";
pub const EVTX_EXTENSION: &str = ".evtx";
pub const CRASH_DUMP_SUFFIX: &str = "-logs.xml";

/// Name given to unattributed `EventData.Data` content.
pub const SYNTHETIC_FIELD: &str = "param1";
/// Value used when a data field carries no usable text.
pub const MISSING_VALUE: &str = "-";
pub const UNKNOWN_QUALIFIER: &str = "Unknown";

/// Known date encodings, tried in order; the first match wins.
pub const DATE_FORMATS: &[&str] = &[
    "%m/%d/%Y %I:%M:%S %p",
    "%m/%d/%Y %I:%M %p",
    "%Y-%m-%dT%H:%M:%S%.fZ",
];
