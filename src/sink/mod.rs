//! Bulk-write destinations for normalized documents.

pub mod elasticsearch;
pub mod memory;
pub mod print;

pub use elasticsearch::ElasticsearchSink;
pub use memory::MemorySink;
pub use print::PrintSink;

use crate::error::Result;
use crate::pipeline::normalize::NormalizedDocument;
use async_trait::async_trait;
use serde_json::Value;

/// One document addressed to an index.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkAction {
    pub index: String,
    pub timestamp: Option<String>,
    pub document: NormalizedDocument,
}

impl BulkAction {
    pub fn new(index: &str, document: NormalizedDocument) -> Self {
        Self {
            index: index.to_string(),
            timestamp: document.created_at.clone(),
            document,
        }
    }

    /// Document body as stored by the index, `@timestamp` included.
    pub fn source(&self) -> Value {
        let mut body = self.document.to_json();
        if let (Some(ts), Value::Object(map)) = (&self.timestamp, &mut body) {
            map.insert("@timestamp".to_string(), Value::String(ts.clone()));
        }
        body
    }
}

/// Acknowledgement of a successful bulk write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BulkReceipt {
    pub items: usize,
    pub took_ms: Option<u64>,
}

/// A backend accepting whole batches in one call. An `Err` means nothing in
/// the batch can be assumed stored; callers retry the identical batch.
#[async_trait]
pub trait BulkSink: Send + Sync {
    async fn bulk(&self, actions: &[BulkAction]) -> Result<BulkReceipt>;

    fn describe(&self) -> String;
}
