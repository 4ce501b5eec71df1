use super::{BulkAction, BulkReceipt, BulkSink};
use crate::error::{ExcavatorError, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct State {
    /// Every successful bulk call, in arrival order
    calls: Vec<Vec<BulkAction>>,
    attempts: usize,
    failures_left: Option<usize>,
}

/// In-memory sink for development/testing. Cloning shares the recorded calls.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    state: Arc<Mutex<State>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the first `count` bulk calls.
    pub fn failing_first(count: usize) -> Self {
        let sink = Self::new();
        sink.state.lock().unwrap().failures_left = Some(count);
        sink
    }

    /// Reject every bulk call.
    pub fn unreachable() -> Self {
        let sink = Self::new();
        sink.state.lock().unwrap().failures_left = Some(usize::MAX);
        sink
    }

    pub fn calls(&self) -> Vec<Vec<BulkAction>> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn attempts(&self) -> usize {
        self.state.lock().unwrap().attempts
    }

    pub fn documents(&self) -> Vec<BulkAction> {
        self.calls().into_iter().flatten().collect()
    }
}

#[async_trait]
impl BulkSink for MemorySink {
    async fn bulk(&self, actions: &[BulkAction]) -> Result<BulkReceipt> {
        let mut state = self.state.lock().unwrap();
        state.attempts += 1;
        if let Some(left) = state.failures_left.as_mut() {
            if *left > 0 {
                *left -= 1;
                return Err(ExcavatorError::SinkUnavailable(format!(
                    "memory sink rejected attempt {}",
                    state.attempts
                )));
            }
        }
        state.calls.push(actions.to_vec());
        Ok(BulkReceipt {
            items: actions.len(),
            took_ms: Some(0),
        })
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
