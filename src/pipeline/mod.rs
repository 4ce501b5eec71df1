//! Record pipeline: assemble line-broken records, parse them, normalize the
//! resulting trees, and dispatch documents to a bulk sink in bounded batches.

pub mod assembler;
pub mod crash_dump;
pub mod dispatcher;
pub mod normalize;
pub mod orchestrator;
pub mod parser;
pub mod stats;

pub use assembler::{RecordAssembler, RecordSpan, RecordSpans};
pub use crash_dump::CrashDump;
pub use dispatcher::BatchDispatcher;
pub use normalize::{EventId, EventLogNormalizer, FieldValue, NormalizedDocument, Normalizer};
pub use orchestrator::{select_files, FileReport, FileState, Orchestrator, PipelineOptions};
pub use parser::{parse_record, ParsedRecord};
pub use stats::{FileFailure, RunStats};
pub use tokio_util::sync::CancellationToken;
