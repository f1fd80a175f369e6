//! Turns a flushed batch into one handler call and fans the answer back out.

use std::fmt;
use std::sync::Arc;

use relink_core::{FnObserver, LinkError};
use tracing::{debug, warn};

use crate::handler::{BatchHandler, BatchResult, Forwards};
use crate::request::BatchableRequest;

/// What caused a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlushTrigger {
    Timer,
    Size,
    Manual,
}

impl fmt::Display for FlushTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlushTrigger::Timer => f.write_str("timer"),
            FlushTrigger::Size => f.write_str("size"),
            FlushTrigger::Manual => f.write_str("manual"),
        }
    }
}

/// Invoke `handler` once for `batch` and route its result positionally.
///
/// Must be called without any batcher lock held: the handler and the
/// listener callbacks may run synchronously from here.
pub(crate) fn dispatch(
    handler: &BatchHandler,
    batch_key: &str,
    batch: Vec<Arc<BatchableRequest>>,
    trigger: FlushTrigger,
) {
    if batch.is_empty() {
        return;
    }

    let operations: Vec<_> = batch.iter().map(|r| r.operation().clone()).collect();
    let forwards = if handler.is_terminating() {
        Forwards::default()
    } else {
        Forwards::new(batch.iter().map(|r| r.forward().cloned()).collect())
    };

    debug!(
        batch_key,
        size = batch.len(),
        %trigger,
        "dispatching batch"
    );

    let stream = match handler.call(operations, forwards) {
        Ok(stream) => stream,
        Err(e) => {
            debug!(batch_key, error = %e, "batch handler failed");
            fail_all(&batch, &e);
            return;
        }
    };

    let batch = Arc::new(batch);
    let (on_next, on_error, on_complete) = (batch.clone(), batch.clone(), batch);
    let key = batch_key.to_string();

    stream.subscribe(
        FnObserver::new()
            .on_next(move |result: BatchResult| {
                let responses = result.into_vec();
                if responses.len() != on_next.len() {
                    warn!(
                        batch_key = %key,
                        expected = on_next.len(),
                        actual = responses.len(),
                        "batch result length does not match batch size"
                    );
                    let error = LinkError::CardinalityMismatch {
                        expected: on_next.len(),
                        actual: responses.len(),
                        results: responses,
                    };
                    fail_all(&on_next, &error);
                    return;
                }
                for (request, response) in on_next.iter().zip(responses) {
                    request.deliver_next(response);
                }
            })
            .on_error(move |e| fail_all(&on_error, &e))
            .on_complete(move || {
                for request in on_complete.iter() {
                    request.deliver_complete();
                }
            }),
    );
}

fn fail_all(batch: &[Arc<BatchableRequest>], error: &LinkError) {
    for request in batch {
        request.deliver_error(error);
    }
}
