//! Size-bounded batching in front of a [`BulkSink`].
//!
//! A batch is cleared only after the sink acknowledges it. A failed write is
//! retried with the identical batch according to the [`RetryPolicy`]; the
//! default policy retries forever without pausing, so an unreachable sink
//! stalls the pipeline instead of losing documents. Delivery is therefore
//! at-least-once: a partially applied batch is re-sent whole.

use crate::config::RetryPolicy;
use crate::error::{ExcavatorError, Result};
use crate::metrics::PipelineMetrics;
use crate::pipeline::normalize::NormalizedDocument;
use crate::sink::{BulkAction, BulkSink};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

pub struct BatchDispatcher {
    sink: Arc<dyn BulkSink>,
    batch: Vec<BulkAction>,
    batch_id: Uuid,
    max_size: usize,
    policy: RetryPolicy,
    cancel: CancellationToken,
    stream: String,
    run_started: Instant,
    delivered: usize,
}

impl BatchDispatcher {
    pub fn new(
        sink: Arc<dyn BulkSink>,
        max_size: usize,
        policy: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            sink,
            batch: Vec::with_capacity(max_size.max(1)),
            batch_id: Uuid::new_v4(),
            max_size: max_size.max(1),
            policy,
            cancel,
            stream: String::new(),
            run_started: Instant::now(),
            delivered: 0,
        }
    }

    /// Label used in flush logs, usually the source file name.
    pub fn for_stream(mut self, stream: &str, run_started: Instant) -> Self {
        self.stream = stream.to_string();
        self.run_started = run_started;
        self
    }

    pub fn pending(&self) -> usize {
        self.batch.len()
    }

    pub fn delivered(&self) -> usize {
        self.delivered
    }

    /// Queue one document. A full batch is flushed before the call returns, so
    /// the dispatcher never holds more than `max_size` unflushed documents.
    pub async fn add(&mut self, document: NormalizedDocument, index: &str) -> Result<()> {
        if self.batch.len() >= self.max_size {
            self.flush().await?;
        }
        self.batch.push(BulkAction::new(index, document));
        if self.batch.len() >= self.max_size {
            self.flush().await?;
        }
        Ok(())
    }

    /// One bulk attempt. The batch is left untouched on failure.
    pub async fn try_flush(&mut self) -> Result<usize> {
        if self.batch.is_empty() {
            return Ok(0);
        }
        let started = Instant::now();
        let receipt = self.sink.bulk(&self.batch).await?;
        let sent = self.batch.len();
        PipelineMetrics::record_flush(sent, started.elapsed().as_secs_f64());

        self.batch.clear();
        self.batch_id = Uuid::new_v4();
        self.delivered += sent;
        info!(
            "Time Passed: {:?} -- Sent {} logs from {} to {} (took {:?} ms, {} so far)",
            self.run_started.elapsed(),
            receipt.items,
            self.stream,
            self.sink.describe(),
            receipt.took_ms,
            self.delivered
        );
        Ok(sent)
    }

    /// Flush the whole batch, retrying until the sink accepts it, the policy
    /// gives up, or the run is cancelled. Returns the number of documents sent.
    pub async fn flush(&mut self) -> Result<usize> {
        let mut attempts: u32 = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Err(ExcavatorError::Cancelled(format!(
                    "flushing batch {} ({} documents pending)",
                    self.batch_id,
                    self.batch.len()
                )));
            }
            match self.try_flush().await {
                Ok(sent) => return Ok(sent),
                Err(e) => {
                    attempts = attempts.saturating_add(1);
                    PipelineMetrics::record_retry();
                    if !self.policy.allows(attempts) {
                        return Err(ExcavatorError::SinkUnavailable(format!(
                            "gave up on batch {} from {} after {} attempts: {}",
                            self.batch_id, self.stream, attempts, e
                        )));
                    }
                    warn!(
                        "Bulk attempt {} for batch {} from {} failed, retrying: {}",
                        attempts, self.batch_id, self.stream, e
                    );
                    self.pause().await;
                }
            }
        }
    }

    async fn pause(&self) {
        if self.policy.backoff.is_zero() {
            tokio::task::yield_now().await;
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(self.policy.backoff) => {}
            _ = self.cancel.cancelled() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::normalize::{EventLogNormalizer, Normalizer};
    use crate::pipeline::parser::parse_record;
    use crate::sink::MemorySink;
    use std::time::Duration;

    fn document(id: usize) -> NormalizedDocument {
        let record =
            parse_record(&format!("<Event><System><EventID>{id}</EventID></System></Event>")).unwrap();
        EventLogNormalizer::default().normalize(record, "test.xml")
    }

    fn dispatcher(sink: &MemorySink, size: usize, policy: RetryPolicy) -> BatchDispatcher {
        BatchDispatcher::new(Arc::new(sink.clone()), size, policy, CancellationToken::new())
    }

    fn event_ids(actions: &[BulkAction]) -> Vec<String> {
        actions
            .iter()
            .map(|a| a.document.event_id.clone().unwrap().text.unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_batches_flush_in_order_at_max_size() {
        let sink = MemorySink::new();
        let mut dispatcher = dispatcher(&sink, 2, RetryPolicy::unbounded());
        for id in 0..5 {
            dispatcher.add(document(id), "idx").await.unwrap();
            assert!(dispatcher.pending() <= 2);
        }
        assert_eq!(dispatcher.pending(), 1);
        dispatcher.flush().await.unwrap();

        let calls = sink.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(event_ids(&calls[0]), vec!["0", "1"]);
        assert_eq!(event_ids(&calls[1]), vec!["2", "3"]);
        assert_eq!(event_ids(&calls[2]), vec!["4"]);
        assert_eq!(dispatcher.delivered(), 5);
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_batch() {
        let sink = MemorySink::unreachable();
        let mut dispatcher = dispatcher(&sink, 10, RetryPolicy::unbounded());
        dispatcher.add(document(1), "idx").await.unwrap();
        dispatcher.add(document(2), "idx").await.unwrap();

        assert!(dispatcher.try_flush().await.is_err());
        assert_eq!(dispatcher.pending(), 2);
    }

    #[tokio::test]
    async fn test_unbounded_retry_resends_identical_batch() {
        let sink = MemorySink::failing_first(3);
        let mut dispatcher = dispatcher(&sink, 3, RetryPolicy::unbounded());
        dispatcher.add(document(1), "idx").await.unwrap();
        dispatcher.add(document(2), "idx").await.unwrap();
        dispatcher.add(document(3), "idx").await.unwrap();

        assert_eq!(sink.attempts(), 4);
        let calls = sink.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(event_ids(&calls[0]), vec!["1", "2", "3"]);
        assert_eq!(dispatcher.pending(), 0);
    }

    #[tokio::test]
    async fn test_bounded_policy_gives_up_without_clearing() {
        let sink = MemorySink::unreachable();
        let policy = RetryPolicy {
            max_attempts: Some(2),
            backoff: Duration::from_millis(1),
        };
        let mut dispatcher = dispatcher(&sink, 5, policy);
        dispatcher.add(document(1), "idx").await.unwrap();

        let err = dispatcher.flush().await.unwrap_err();
        assert!(matches!(err, ExcavatorError::SinkUnavailable(_)));
        assert_eq!(sink.attempts(), 2);
        assert_eq!(dispatcher.pending(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_stops_unbounded_retry() {
        let sink = MemorySink::unreachable();
        let cancel = CancellationToken::new();
        let policy = RetryPolicy {
            max_attempts: None,
            backoff: Duration::from_millis(5),
        };
        let mut dispatcher =
            BatchDispatcher::new(Arc::new(sink.clone()), 1, policy, cancel.clone());

        let trip = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trip.cancel();
        });

        let err = tokio::time::timeout(Duration::from_secs(5), dispatcher.add(document(1), "idx"))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, ExcavatorError::Cancelled(_)));
        assert_eq!(dispatcher.pending(), 1);
        assert!(sink.attempts() >= 1);
    }

    #[tokio::test]
    async fn test_empty_flush_does_not_call_sink() {
        let sink = MemorySink::new();
        let mut dispatcher = dispatcher(&sink, 4, RetryPolicy::unbounded());
        assert_eq!(dispatcher.flush().await.unwrap(), 0);
        assert_eq!(sink.attempts(), 0);
    }
}
