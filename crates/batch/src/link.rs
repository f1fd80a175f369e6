//! Batching as a pipeline stage.
//!
//! [`BatchLink`] plugs an [`OperationBatcher`] into a link chain. With a
//! terminating handler the link ends the pipeline and ignores any forward
//! link; with a forwarding handler every request carries its forward link
//! into the batch.

use std::sync::Arc;
use std::time::Duration;

use relink_core::{Link, NextLink, Observable, Operation, Response};

use crate::batcher::OperationBatcher;
use crate::config::BatchConfig;
use crate::handler::BatchHandler;
use crate::key::BatchKeyFn;

pub struct BatchLink {
    batcher: OperationBatcher,
}

impl BatchLink {
    /// Link with the given thresholds and the constant batch key.
    pub fn new(config: BatchConfig, handler: BatchHandler) -> Self {
        Self::builder(handler).config(config).build()
    }

    /// Start a builder; thresholds default to [`BatchConfig::default`].
    pub fn builder(handler: BatchHandler) -> BatchLinkBuilder {
        BatchLinkBuilder::new(handler)
    }
}

impl Link for BatchLink {
    fn request(&self, operation: Operation, forward: Option<NextLink>) -> Observable<Response> {
        let forward = if self.is_terminating() { None } else { forward };
        self.batcher.enqueue_request(operation, forward)
    }

    fn is_terminating(&self) -> bool {
        self.batcher.handler().is_terminating()
    }
}

// ── BatchLinkBuilder ─────────────────────────────────────────────────

/// Fluent builder for a [`BatchLink`].
///
/// # Example
/// ```ignore
/// let link = BatchLink::builder(BatchHandler::terminating(send_batch))
///     .batch_interval(Duration::from_millis(20))
///     .batch_max(10)
///     .batch_key_fn(by_operation_name())
///     .build();
/// ```
pub struct BatchLinkBuilder {
    config: BatchConfig,
    handler: BatchHandler,
    batch_key: Option<BatchKeyFn>,
}

impl BatchLinkBuilder {
    pub fn new(handler: BatchHandler) -> Self {
        Self {
            config: BatchConfig::default(),
            handler,
            batch_key: None,
        }
    }

    /// Maximum wait before a non-full batch flushes (default: 10ms).
    pub fn batch_interval(mut self, interval: Duration) -> Self {
        self.config.batch_interval = interval;
        self
    }

    /// Batch size that flushes immediately (default: 0 = unbounded).
    pub fn batch_max(mut self, max: usize) -> Self {
        self.config.batch_max = max;
        self
    }

    /// Replace both thresholds, e.g. with a loaded [`BatchConfig`].
    pub fn config(mut self, config: BatchConfig) -> Self {
        self.config = config;
        self
    }

    pub fn batch_key<F>(mut self, f: F) -> Self
    where
        F: Fn(&Operation) -> String + Send + Sync + 'static,
    {
        self.batch_key = Some(Arc::new(f));
        self
    }

    /// Use a prebuilt policy such as [`crate::key::by_operation_name`].
    pub fn batch_key_fn(mut self, f: BatchKeyFn) -> Self {
        self.batch_key = Some(f);
        self
    }

    pub fn build(self) -> BatchLink {
        BatchLink {
            batcher: OperationBatcher::new(self.config, self.handler, self.batch_key),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::handler::BatchResult;

    fn echo_next() -> NextLink {
        Arc::new(|_: Operation| Observable::empty())
    }

    fn answering() -> BatchHandler {
        BatchHandler::terminating(|ops| {
            Ok(Observable::of(BatchResult::Many(
                ops.iter().map(|_| Response::data(json!(true))).collect(),
            )))
        })
    }

    #[tokio::test]
    async fn terminating_link_queues_requests_without_forward() {
        let link = BatchLink::new(BatchConfig::default(), answering());
        link.request(Operation::query("{ a }"), Some(echo_next()))
            .subscribe(relink_core::FnObserver::new());

        let flushed = link.batcher.flush("").unwrap();
        assert_eq!(flushed.len(), 1);
        assert!(flushed[0].forward().is_none());
    }

    #[tokio::test]
    async fn forwarding_link_keeps_the_forward() {
        let link = BatchLink::new(BatchConfig::default(), BatchHandler::forward_each());
        link.request(Operation::query("{ a }"), Some(echo_next()))
            .subscribe(relink_core::FnObserver::new());

        let queued = link.batcher.queued_len("");
        let flushed = link.batcher.flush("").unwrap();
        assert_eq!(queued, 1);
        assert!(flushed[0].forward().is_some());
    }

    #[tokio::test]
    async fn builder_sets_thresholds_and_key() {
        let link = BatchLink::builder(answering())
            .batch_interval(Duration::from_millis(25))
            .batch_max(4)
            .batch_key(|op: &Operation| op.name.clone().unwrap_or_default())
            .build();
        assert_eq!(link.batcher.config(), &BatchConfig::new(Duration::from_millis(25), 4));

        link.request(Operation::query("{ a }").with_name("A"), None)
            .subscribe(relink_core::FnObserver::new());
        assert_eq!(link.batcher.queued_keys(), vec!["A".to_string()]);
    }
}
