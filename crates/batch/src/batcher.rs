//! Per-key request queue with time and size flush triggers.
//!
//! Requests are grouped by batch key. The first request of a key's pending
//! list arms a one-shot timer of `batch_interval`; reaching `batch_max`
//! flushes the list synchronously on the enqueue that crossed it. A flush
//! removes the whole list under the queue lock and hands it to the
//! dispatcher, which calls the handler outside the lock.
//!
//! Each pending list carries a generation number. A timer only flushes the
//! generation it was armed for, so a timer left over from a size-flushed
//! list cannot cut a newer list short.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use relink_core::{LinkError, NextLink, Observable, Operation, Response, Subscriber, Teardown};
use tracing::{debug, warn};

use crate::config::BatchConfig;
use crate::dispatcher::{dispatch, FlushTrigger};
use crate::handler::BatchHandler;
use crate::key::{default_batch_key, BatchKeyFn};
use crate::request::{Attach, BatchableRequest};

struct PendingBatch {
    generation: u64,
    requests: Vec<Arc<BatchableRequest>>,
}

struct BatcherInner {
    config: BatchConfig,
    handler: BatchHandler,
    batch_key: BatchKeyFn,
    queued: Mutex<HashMap<String, PendingBatch>>,
    next_generation: AtomicU64,
}

/// Batch queue and dispatcher for one handler.
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct OperationBatcher {
    inner: Arc<BatcherInner>,
}

impl OperationBatcher {
    /// A `None` key function puts every operation in one global batch.
    pub fn new(config: BatchConfig, handler: BatchHandler, batch_key: Option<BatchKeyFn>) -> Self {
        Self {
            inner: Arc::new(BatcherInner {
                config,
                handler,
                batch_key: batch_key.unwrap_or_else(default_batch_key),
                queued: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    /// Thresholds this batcher flushes on.
    pub fn config(&self) -> &BatchConfig {
        &self.inner.config
    }

    /// Handler every flushed batch is sent to.
    pub fn handler(&self) -> &BatchHandler {
        &self.inner.handler
    }

    /// Wrap `operation` and enqueue it, see [`OperationBatcher::enqueue`].
    pub fn enqueue_request(
        &self,
        operation: Operation,
        forward: Option<NextLink>,
    ) -> Observable<Response> {
        self.enqueue(&BatchableRequest::new(operation, forward))
    }

    /// Shared response stream for `request`.
    ///
    /// Nothing is queued until the stream is subscribed. The first
    /// subscription appends the request to its key's pending list; any
    /// further subscription (through this or another stream returned for the
    /// same request) only adds a listener. Subscribing after the result was
    /// delivered fails with [`LinkError::Settled`].
    ///
    /// The flush timer runs on the ambient Tokio runtime. Outside one, a
    /// request that would need a timer fails with [`LinkError::Other`];
    /// only `batch_max == 1` (flush on enqueue) works without a runtime.
    pub fn enqueue(&self, request: &Arc<BatchableRequest>) -> Observable<Response> {
        let inner = self.inner.clone();
        let request = request.clone();
        Observable::new(move |sink: Subscriber<Response>| {
            if inner.needs_timer()
                && !request.is_queued()
                && tokio::runtime::Handle::try_current().is_err()
            {
                sink.error(LinkError::Other(
                    "no tokio runtime available to arm the batch timer".into(),
                ));
                return None;
            }
            let id = match request.attach(sink.clone()) {
                Attach::Settled => {
                    sink.error(LinkError::Settled);
                    return None;
                }
                Attach::Listen(id) => id,
                Attach::Enqueue(id) => {
                    inner.push(&request);
                    id
                }
            };
            let weak = Arc::downgrade(&request);
            Some(Box::new(move || {
                if let Some(request) = weak.upgrade() {
                    request.detach(id);
                }
            }) as Teardown)
        })
    }

    /// Flush `batch_key` now, regardless of its timer or size.
    ///
    /// Returns the dispatched requests, or `None` when nothing was pending.
    pub fn flush(&self, batch_key: &str) -> Option<Vec<Arc<BatchableRequest>>> {
        self.inner.flush(batch_key, None, FlushTrigger::Manual)
    }

    /// Number of pending requests under `batch_key`.
    pub fn queued_len(&self, batch_key: &str) -> usize {
        self.inner
            .lock_queue()
            .get(batch_key)
            .map_or(0, |pending| pending.requests.len())
    }

    /// Keys that currently have pending requests.
    pub fn queued_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.lock_queue().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl BatcherInner {
    fn lock_queue(&self) -> MutexGuard<'_, HashMap<String, PendingBatch>> {
        self.queued.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every size except one leaves at least some batches to the timer.
    fn needs_timer(&self) -> bool {
        self.config.batch_max != 1
    }

    fn push(self: &Arc<Self>, request: &Arc<BatchableRequest>) {
        let key = request
            .batch_key_or_init(|| (self.batch_key)(request.operation()))
            .to_string();
        let batch_max = self.config.batch_max;

        let (len, generation, full) = {
            let mut queued = self.lock_queue();
            let pending = queued.entry(key.clone()).or_insert_with(|| PendingBatch {
                generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
                requests: Vec::new(),
            });
            pending.requests.push(request.clone());
            let len = pending.requests.len();
            let generation = pending.generation;
            let full = if batch_max > 0 && len == batch_max {
                queued.remove(&key).map(|pending| pending.requests)
            } else {
                None
            };
            (len, generation, full)
        };

        debug!(batch_key = %key, queued = len, "request enqueued");

        if let Some(batch) = full {
            debug!(batch_key = %key, size = batch.len(), trigger = "size", "flushing batch");
            dispatch(&self.handler, &key, batch, FlushTrigger::Size);
            return;
        }
        if len == 1 {
            self.arm_timer(key, generation);
        }
    }

    fn arm_timer(self: &Arc<Self>, key: String, generation: u64) {
        let interval = self.config.batch_interval;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(batch_key = %key, ?interval, generation, "flush timer armed");
                let inner = self.clone();
                handle.spawn(async move {
                    tokio::time::sleep(interval).await;
                    inner.flush(&key, Some(generation), FlushTrigger::Timer);
                });
            }
            Err(_) => {
                warn!(batch_key = %key, "no tokio runtime to arm flush timer, flushing immediately");
                self.flush(&key, Some(generation), FlushTrigger::Timer);
            }
        }
    }

    /// Take the pending list for `key` (only if it is still `generation`,
    /// when given) and dispatch it.
    fn flush(
        &self,
        key: &str,
        generation: Option<u64>,
        trigger: FlushTrigger,
    ) -> Option<Vec<Arc<BatchableRequest>>> {
        let batch = {
            let mut queued = self.lock_queue();
            let current = queued.get(key).map(|pending| pending.generation);
            match (current, generation) {
                (None, _) => None,
                (Some(current), Some(armed)) if current != armed => None,
                _ => queued.remove(key).map(|pending| pending.requests),
            }
        }?;

        debug!(batch_key = key, size = batch.len(), %trigger, "flushing batch");
        dispatch(&self.handler, key, batch.clone(), trigger);
        Some(batch)
    }
}
