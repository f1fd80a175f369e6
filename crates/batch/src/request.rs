//! A request waiting in (or dispatched from) the batch queue.

use std::collections::BTreeMap;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use relink_core::{LinkError, NextLink, Operation, Response, Subscriber};
use tracing::trace;

/// One operation plus the listeners of every subscriber to its shared
/// response stream.
///
/// The request joins its batch key's queue on the first subscription only;
/// later subscriptions just add listeners. Listeners are keyed by a
/// per-request subscription id so an unsubscribe removes exactly its own
/// entry. Once a terminal event has been routed the request is settled and
/// accepts no further listeners.
pub struct BatchableRequest {
    operation: Operation,
    forward: Option<NextLink>,
    batch_key: OnceLock<String>,
    state: Mutex<RequestState>,
}

#[derive(Default)]
struct RequestState {
    queued: bool,
    settled: bool,
    next_id: u64,
    listeners: BTreeMap<u64, Subscriber<Response>>,
}

/// Outcome of registering a subscriber.
pub(crate) enum Attach {
    /// First subscriber: the request must now join the queue.
    Enqueue(u64),
    /// Already queued or dispatched; the subscriber just listens.
    Listen(u64),
    /// The result was already delivered.
    Settled,
}

impl BatchableRequest {
    /// Wrap an operation; `forward` is its next link, if any.
    pub fn new(operation: Operation, forward: Option<NextLink>) -> Arc<Self> {
        Arc::new(Self {
            operation,
            forward,
            batch_key: OnceLock::new(),
            state: Mutex::new(RequestState::default()),
        })
    }

    /// The operation sent to the handler.
    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    /// Next link handed to a forwarding handler.
    pub fn forward(&self) -> Option<&NextLink> {
        self.forward.as_ref()
    }

    /// Batch key, fixed by the first enqueue.
    pub fn batch_key(&self) -> Option<&str> {
        self.batch_key.get().map(String::as_str)
    }

    /// Subscribers still waiting for the result.
    pub fn listener_count(&self) -> usize {
        self.state().listeners.len()
    }

    /// Whether the request has joined a batch (pending or dispatched).
    pub fn is_queued(&self) -> bool {
        self.state().queued
    }

    /// Whether a terminal event has been delivered.
    pub fn is_settled(&self) -> bool {
        self.state().settled
    }

    pub(crate) fn batch_key_or_init(&self, f: impl FnOnce() -> String) -> &str {
        self.batch_key.get_or_init(f)
    }

    fn state(&self) -> MutexGuard<'_, RequestState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn attach(&self, subscriber: Subscriber<Response>) -> Attach {
        let mut state = self.state();
        if state.settled {
            return Attach::Settled;
        }
        let id = state.next_id;
        state.next_id += 1;
        state.listeners.insert(id, subscriber);
        if state.queued {
            Attach::Listen(id)
        } else {
            state.queued = true;
            Attach::Enqueue(id)
        }
    }

    pub(crate) fn detach(&self, id: u64) {
        self.state().listeners.remove(&id);
    }

    pub(crate) fn deliver_next(&self, response: Response) {
        let listeners: Vec<_> = {
            let state = self.state();
            if state.settled {
                return;
            }
            state.listeners.values().cloned().collect()
        };
        trace!(listeners = listeners.len(), "routing batch result");
        for listener in listeners {
            listener.next(response.clone());
        }
    }

    pub(crate) fn deliver_error(&self, error: &LinkError) {
        for listener in self.settle() {
            listener.error(error.clone());
        }
    }

    pub(crate) fn deliver_complete(&self) {
        for listener in self.settle() {
            listener.complete();
        }
    }

    /// Mark settled and hand back the listeners that still need the
    /// terminal event. A second call returns nothing.
    fn settle(&self) -> Vec<Subscriber<Response>> {
        let mut state = self.state();
        if state.settled {
            return Vec::new();
        }
        state.settled = true;
        mem::take(&mut state.listeners).into_values().collect()
    }
}

impl std::fmt::Debug for BatchableRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("BatchableRequest")
            .field("key", &self.operation.key())
            .field("batch_key", &self.batch_key.get())
            .field("has_forward", &self.forward.is_some())
            .field("queued", &state.queued)
            .field("settled", &state.settled)
            .field("listeners", &state.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use relink_core::{FnObserver, Observable};
    use serde_json::json;

    use super::*;

    /// A live subscriber whose events are appended to the returned log.
    fn listener() -> (Arc<Mutex<Vec<String>>>, Subscriber<Response>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let slot = Arc::new(Mutex::new(None));
        let stash = slot.clone();
        let (n, e, c) = (log.clone(), log.clone(), log.clone());
        Observable::new(move |sink: Subscriber<Response>| {
            *stash.lock().unwrap() = Some(sink);
            None
        })
        .subscribe(
            FnObserver::new()
                .on_next(move |r: Response| n.lock().unwrap().push(format!("next {}", r.data.unwrap())))
                .on_error(move |err| e.lock().unwrap().push(format!("error {err}")))
                .on_complete(move || c.lock().unwrap().push("complete".to_string())),
        );
        let sink = slot.lock().unwrap().take().unwrap();
        (log, sink)
    }

    #[test]
    fn only_the_first_listener_enqueues() {
        let request = BatchableRequest::new(Operation::query("{ a }"), None);
        let (_, first) = listener();
        let (_, second) = listener();
        assert!(matches!(request.attach(first), Attach::Enqueue(0)));
        assert!(matches!(request.attach(second), Attach::Listen(1)));
        assert!(request.is_queued());
        assert_eq!(request.listener_count(), 2);
    }

    #[test]
    fn detached_listener_misses_delivery() {
        let request = BatchableRequest::new(Operation::query("{ a }"), None);
        let (gone_log, gone) = listener();
        let (kept_log, kept) = listener();
        request.attach(gone);
        request.attach(kept);

        request.detach(0);
        request.deliver_next(Response::data(json!(1)));
        request.deliver_complete();

        assert!(gone_log.lock().unwrap().is_empty());
        assert_eq!(*kept_log.lock().unwrap(), vec!["next 1", "complete"]);
    }

    #[test]
    fn first_terminal_event_settles() {
        let request = BatchableRequest::new(Operation::query("{ a }"), None);
        let (log, sink) = listener();
        request.attach(sink);

        request.deliver_error(&LinkError::Handler("boom".into()));
        request.deliver_next(Response::data(json!(2)));
        request.deliver_complete();

        assert!(request.is_settled());
        assert_eq!(request.listener_count(), 0);
        assert_eq!(*log.lock().unwrap(), vec!["error batch handler failed: boom"]);

        let (_, late) = listener();
        assert!(matches!(request.attach(late), Attach::Settled));
    }
}
