//! The downstream collaborator that executes a whole batch.

use std::sync::{Arc, Mutex, PoisonError};

use relink_core::{
    FnObserver, LinkError, NextLink, Observable, Operation, Response, Subscription, Teardown,
};

/// What a batch handler emits: one response, or one response per operation
/// in batch order.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchResult {
    Single(Response),
    Many(Vec<Response>),
}

impl BatchResult {
    /// A bare single response counts as a one-element batch.
    pub fn into_vec(self) -> Vec<Response> {
        match self {
            BatchResult::Single(response) => vec![response],
            BatchResult::Many(responses) => responses,
        }
    }
}

impl From<Response> for BatchResult {
    fn from(response: Response) -> Self {
        BatchResult::Single(response)
    }
}

impl From<Vec<Response>> for BatchResult {
    fn from(responses: Vec<Response>) -> Self {
        BatchResult::Many(responses)
    }
}

/// Forward capabilities of a batch, one slot per operation, in batch order.
/// A slot is empty when the request reached the batcher without a next link.
#[derive(Clone, Default)]
pub struct Forwards {
    links: Vec<Option<NextLink>>,
}

impl Forwards {
    pub fn new(links: Vec<Option<NextLink>>) -> Self {
        Self { links }
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// The forward link for operation `index`.
    ///
    /// Asking for a slot that is empty (or out of range) is a contract
    /// violation reported as [`LinkError::MissingForward`].
    pub fn get(&self, index: usize) -> Result<&NextLink, LinkError> {
        self.links
            .get(index)
            .and_then(Option::as_ref)
            .ok_or(LinkError::MissingForward { index })
    }

    /// Send `operation` down the forward link at `index`. A missing link
    /// yields a failing stream.
    pub fn forward(&self, index: usize, operation: Operation) -> Observable<Response> {
        match self.get(index) {
            Ok(next) => next(operation),
            Err(e) => Observable::error(e),
        }
    }

    /// Forward every operation through its own link and gather the first
    /// response of each into a single [`BatchResult::Many`], in batch order.
    ///
    /// Fails as soon as any forwarded stream fails, or completes without a
    /// response.
    pub fn forward_all(&self, operations: Vec<Operation>) -> Observable<BatchResult> {
        let forwards = self.clone();
        Observable::new(move |sink| {
            if operations.is_empty() {
                sink.next(BatchResult::Many(Vec::new()));
                sink.complete();
                return None;
            }

            let total = operations.len();
            let slots: Arc<Mutex<Vec<Option<Response>>>> = Arc::new(Mutex::new(vec![None; total]));
            let mut subscriptions: Vec<Subscription> = Vec::with_capacity(total);

            for (index, operation) in operations.iter().cloned().enumerate() {
                let (on_next, on_error, on_complete) = (sink.clone(), sink.clone(), sink.clone());
                let next_slots = slots.clone();
                let done_slots = slots.clone();
                let subscription = forwards.forward(index, operation).subscribe(
                    FnObserver::new()
                        .on_next(move |response: Response| {
                            let gathered = {
                                let mut slots =
                                    next_slots.lock().unwrap_or_else(PoisonError::into_inner);
                                if slots[index].is_some() {
                                    return;
                                }
                                slots[index] = Some(response);
                                if slots.iter().all(Option::is_some) {
                                    Some(slots.iter_mut().filter_map(Option::take).collect())
                                } else {
                                    None
                                }
                            };
                            if let Some(responses) = gathered {
                                on_next.next(BatchResult::Many(responses));
                                on_next.complete();
                            }
                        })
                        .on_error(move |e| on_error.error(e))
                        .on_complete(move || {
                            let answered = done_slots
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)[index]
                                .is_some();
                            if !answered && !on_complete.is_closed() {
                                on_complete.error(LinkError::Handler(format!(
                                    "forwarded operation {index} completed without a response"
                                )));
                            }
                        }),
                );
                subscriptions.push(subscription);
            }

            Some(Box::new(move || {
                for subscription in &subscriptions {
                    subscription.unsubscribe();
                }
            }) as Teardown)
        })
    }
}

pub type HandlerResult = Result<Observable<BatchResult>, LinkError>;

type TerminatingFn = dyn Fn(Vec<Operation>) -> HandlerResult + Send + Sync;
type ForwardingFn = dyn Fn(Vec<Operation>, Forwards) -> HandlerResult + Send + Sync;

/// Executes a batch of operations as one downstream call.
///
/// The variant decides the shape of the pipeline: a `Terminating` handler is
/// the transport itself and never sees forward links, a `Forwarding` handler
/// receives the next link of every operation.
///
/// Returning `Err` and returning a stream that fails are equivalent: either
/// way every request in the batch receives the error.
#[derive(Clone)]
pub enum BatchHandler {
    Terminating(Arc<TerminatingFn>),
    Forwarding(Arc<ForwardingFn>),
}

impl BatchHandler {
    pub fn terminating<F>(f: F) -> Self
    where
        F: Fn(Vec<Operation>) -> HandlerResult + Send + Sync + 'static,
    {
        BatchHandler::Terminating(Arc::new(f))
    }

    pub fn forwarding<F>(f: F) -> Self
    where
        F: Fn(Vec<Operation>, Forwards) -> HandlerResult + Send + Sync + 'static,
    {
        BatchHandler::Forwarding(Arc::new(f))
    }

    /// Forwarding handler that sends every operation down its own next link
    /// and reassembles the answers, see [`Forwards::forward_all`].
    pub fn forward_each() -> Self {
        Self::forwarding(|operations, forwards| Ok(forwards.forward_all(operations)))
    }

    pub fn is_terminating(&self) -> bool {
        matches!(self, BatchHandler::Terminating(_))
    }

    pub(crate) fn call(&self, operations: Vec<Operation>, forwards: Forwards) -> HandlerResult {
        match self {
            BatchHandler::Terminating(f) => f(operations),
            BatchHandler::Forwarding(f) => f(operations, forwards),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn echo_next() -> NextLink {
        Arc::new(|op: Operation| Observable::of(Response::data(json!(op.variables["n"]))))
    }

    fn op(n: u32) -> Operation {
        Operation::query("{ n }").with_variable("n", json!(n))
    }

    #[test]
    fn single_result_becomes_one_element_batch() {
        let single = BatchResult::from(Response::data(json!(1)));
        assert_eq!(single.into_vec(), vec![Response::data(json!(1))]);
    }

    #[test]
    fn missing_forward_is_an_error() {
        let forwards = Forwards::new(vec![Some(echo_next()), None]);
        assert_eq!(forwards.len(), 2);
        assert!(forwards.get(0).is_ok());
        assert_eq!(
            forwards.get(1).err(),
            Some(LinkError::MissingForward { index: 1 })
        );
        assert_eq!(
            forwards.get(5).err(),
            Some(LinkError::MissingForward { index: 5 })
        );
    }

    #[tokio::test]
    async fn forward_surfaces_missing_link_as_stream_error() {
        let forwards = Forwards::default();
        let err = forwards.forward(0, op(1)).first().await.unwrap_err();
        assert_eq!(err, LinkError::MissingForward { index: 0 });
    }

    #[tokio::test]
    async fn forward_all_keeps_batch_order() {
        let forwards = Forwards::new(vec![Some(echo_next()), Some(echo_next()), Some(echo_next())]);
        let result = forwards
            .forward_all(vec![op(3), op(1), op(2)])
            .first()
            .await
            .unwrap();
        assert_eq!(
            result,
            Some(BatchResult::Many(vec![
                Response::data(json!(3)),
                Response::data(json!(1)),
                Response::data(json!(2)),
            ]))
        );
    }

    #[tokio::test]
    async fn forward_all_fails_when_a_link_answers_nothing() {
        let silent: NextLink = Arc::new(|_: Operation| Observable::empty());
        let forwards = Forwards::new(vec![Some(echo_next()), Some(silent)]);
        let err = forwards
            .forward_all(vec![op(1), op(2)])
            .first()
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::Handler(_)));
    }

    #[test]
    fn variant_decides_termination() {
        assert!(BatchHandler::terminating(|_| Ok(Observable::empty())).is_terminating());
        assert!(!BatchHandler::forward_each().is_terminating());
    }
}
