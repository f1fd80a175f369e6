//! Push-based, lazily subscribed, cancelable streams.
//!
//! An [`Observable`] does nothing until [`Observable::subscribe`] is called.
//! Every subscription runs the source function again with its own
//! [`Subscriber`], so one observable can serve many independent subscribers,
//! each able to unsubscribe on its own through the returned [`Subscription`].
//!
//! A subscriber is closed by its first `error` or `complete` (or by
//! unsubscribing); after that every event sent to it is dropped and its
//! teardown has run exactly once.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use futures::channel::mpsc;
use futures::{Stream, StreamExt};

use crate::error::LinkError;

/// Cleanup run once when a subscriber closes.
pub type Teardown = Box<dyn FnOnce() + Send>;

type SourceFn<T> = dyn Fn(Subscriber<T>) -> Option<Teardown> + Send + Sync;

// ── Observer ────────────────────────────────────────────────────────

/// Receives the events of one subscription.
pub trait Observer<T>: Send + Sync {
    fn next(&self, value: T);
    fn error(&self, error: LinkError);
    fn complete(&self);
}

/// Closure-backed [`Observer`]. Missing callbacks ignore their event.
pub struct FnObserver<T> {
    on_next: Option<Box<dyn Fn(T) + Send + Sync>>,
    on_error: Option<Box<dyn Fn(LinkError) + Send + Sync>>,
    on_complete: Option<Box<dyn Fn() + Send + Sync>>,
}

impl<T> FnObserver<T> {
    pub fn new() -> Self {
        Self {
            on_next: None,
            on_error: None,
            on_complete: None,
        }
    }

    pub fn on_next(mut self, f: impl Fn(T) + Send + Sync + 'static) -> Self {
        self.on_next = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(LinkError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    pub fn on_complete(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_complete = Some(Box::new(f));
        self
    }
}

impl<T> Default for FnObserver<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Observer<T> for FnObserver<T> {
    fn next(&self, value: T) {
        if let Some(f) = &self.on_next {
            f(value);
        }
    }

    fn error(&self, error: LinkError) {
        if let Some(f) = &self.on_error {
            f(error);
        }
    }

    fn complete(&self) {
        if let Some(f) = &self.on_complete {
            f();
        }
    }
}

// ── Subscriber ──────────────────────────────────────────────────────

struct SubscriberInner<T> {
    observer: Box<dyn Observer<T>>,
    closed: AtomicBool,
    teardown: Mutex<Option<Teardown>>,
}

impl<T> SubscriberInner<T> {
    /// Marks the subscriber closed. Returns `false` if it already was.
    fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    fn run_teardown(&self) {
        let teardown = self
            .teardown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(teardown) = teardown {
            teardown();
        }
    }
}

/// The sink handed to an observable's source function.
///
/// Cloning yields another handle to the same subscription.
pub struct Subscriber<T> {
    inner: Arc<SubscriberInner<T>>,
}

impl<T> Clone for Subscriber<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> Subscriber<T> {
    pub(crate) fn new(observer: Box<dyn Observer<T>>) -> Self {
        Self {
            inner: Arc::new(SubscriberInner {
                observer,
                closed: AtomicBool::new(false),
                teardown: Mutex::new(None),
            }),
        }
    }

    pub fn next(&self, value: T) {
        if !self.is_closed() {
            self.inner.observer.next(value);
        }
    }

    pub fn error(&self, error: LinkError) {
        if self.inner.close() {
            self.inner.observer.error(error);
            self.inner.run_teardown();
        }
    }

    pub fn complete(&self) {
        if self.inner.close() {
            self.inner.observer.complete();
            self.inner.run_teardown();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Cancelable handle for this subscriber.
    pub fn subscription(&self) -> Subscription {
        Subscription {
            inner: self.inner.clone(),
        }
    }

    fn set_teardown(&self, teardown: Teardown) {
        let mut slot = self
            .inner
            .teardown
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.is_closed() {
            drop(slot);
            teardown();
        } else {
            *slot = Some(teardown);
        }
    }
}

// ── Subscription ────────────────────────────────────────────────────

trait Cancel: Send + Sync {
    fn cancel(&self);
    fn is_closed(&self) -> bool;
}

impl<T> Cancel for SubscriberInner<T> {
    fn cancel(&self) {
        if self.close() {
            self.run_teardown();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Handle returned by [`Observable::subscribe`].
///
/// Dropping it does not cancel; call [`Subscription::unsubscribe`].
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<dyn Cancel>,
}

impl Subscription {
    /// Stop receiving events and run the source's teardown. Idempotent.
    pub fn unsubscribe(&self) {
        self.inner.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

// ── Observable ──────────────────────────────────────────────────────

/// Lazily subscribed push stream of `T` values terminated by an error or a
/// completion.
pub struct Observable<T> {
    source: Arc<SourceFn<T>>,
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
        }
    }
}

impl<T: Send + 'static> Observable<T> {
    /// Build an observable from a source function run once per subscription.
    pub fn new<F>(source: F) -> Self
    where
        F: Fn(Subscriber<T>) -> Option<Teardown> + Send + Sync + 'static,
    {
        Self {
            source: Arc::new(source),
        }
    }

    pub fn subscribe(&self, observer: impl Observer<T> + 'static) -> Subscription {
        let subscriber = Subscriber::new(Box::new(observer));
        if let Some(teardown) = (self.source)(subscriber.clone()) {
            subscriber.set_teardown(teardown);
        }
        subscriber.subscription()
    }

    /// Completes immediately without a value.
    pub fn empty() -> Self {
        Self::new(|sink| {
            sink.complete();
            None
        })
    }

    /// Fails immediately with `error`.
    pub fn error(error: LinkError) -> Self {
        Self::new(move |sink| {
            sink.error(error.clone());
            None
        })
    }

    /// Resolves a future per subscription on the ambient Tokio runtime.
    ///
    /// Unsubscribing aborts the spawned task.
    pub fn from_future<F, Fut>(make: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, LinkError>> + Send + 'static,
    {
        Self::new(move |sink| {
            let handle = match tokio::runtime::Handle::try_current() {
                Ok(handle) => handle,
                Err(_) => {
                    sink.error(LinkError::Other(
                        "no tokio runtime available to drive the future".into(),
                    ));
                    return None;
                }
            };
            let fut = make();
            let task_sink = sink.clone();
            let task = handle.spawn(async move {
                match fut.await {
                    Ok(value) => {
                        task_sink.next(value);
                        task_sink.complete();
                    }
                    Err(e) => task_sink.error(e),
                }
            });
            Some(Box::new(move || task.abort()) as Teardown)
        })
    }

    pub fn map<U, F>(&self, f: F) -> Observable<U>
    where
        U: Send + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        let upstream = self.clone();
        let f = Arc::new(f);
        Observable::new(move |sink: Subscriber<U>| {
            let f = Arc::clone(&f);
            let on_next = sink.clone();
            let on_error = sink.clone();
            let subscription = upstream.subscribe(
                FnObserver::new()
                    .on_next(move |value| on_next.next((*f)(value)))
                    .on_error(move |e| on_error.error(e))
                    .on_complete(move || sink.complete()),
            );
            Some(Box::new(move || subscription.unsubscribe()) as Teardown)
        })
    }

    /// Subscribe and expose the events as a [`Stream`]. Dropping the stream
    /// unsubscribes.
    pub fn into_stream(self) -> ObservableStream<T> {
        let (tx, rx) = mpsc::unbounded();
        let tx_next = tx.clone();
        let tx_error = tx.clone();
        let subscription = self.subscribe(
            FnObserver::new()
                .on_next(move |value| {
                    let _ = tx_next.unbounded_send(Ok(value));
                })
                .on_error(move |e| {
                    let _ = tx_error.unbounded_send(Err(e));
                    tx_error.close_channel();
                })
                .on_complete(move || tx.close_channel()),
        );
        ObservableStream { rx, subscription }
    }

    /// First value, `None` if the observable completed without one.
    pub async fn first(self) -> Result<Option<T>, LinkError> {
        let mut stream = self.into_stream();
        stream.next().await.transpose()
    }
}

impl<T: Clone + Send + Sync + 'static> Observable<T> {
    /// Emits `value` then completes.
    pub fn of(value: T) -> Self {
        Self::new(move |sink| {
            sink.next(value.clone());
            sink.complete();
            None
        })
    }

    /// Emits every value in order then completes.
    pub fn from_iter<I: IntoIterator<Item = T>>(values: I) -> Self {
        let values: Vec<T> = values.into_iter().collect();
        Self::new(move |sink| {
            for value in &values {
                if sink.is_closed() {
                    break;
                }
                sink.next(value.clone());
            }
            sink.complete();
            None
        })
    }
}

// ── Stream adapter ──────────────────────────────────────────────────

/// [`Stream`] view over one subscription, see [`Observable::into_stream`].
pub struct ObservableStream<T> {
    rx: mpsc::UnboundedReceiver<Result<T, LinkError>>,
    subscription: Subscription,
}

impl<T> Stream for ObservableStream<T> {
    type Item = Result<T, LinkError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx).poll_next(cx)
    }
}

impl<T> Drop for ObservableStream<T> {
    fn drop(&mut self) {
        self.subscription.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, FnObserver<u32>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (n, e, c) = (log.clone(), log.clone(), log.clone());
        let observer = FnObserver::new()
            .on_next(move |v: u32| n.lock().unwrap().push(format!("next {v}")))
            .on_error(move |err| e.lock().unwrap().push(format!("error {err}")))
            .on_complete(move || c.lock().unwrap().push("complete".into()));
        (log, observer)
    }

    #[test]
    fn source_runs_once_per_subscription() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let obs = Observable::new(move |sink: Subscriber<u32>| {
            counted.fetch_add(1, Ordering::SeqCst);
            sink.next(1);
            None
        });
        assert_eq!(calls.load(Ordering::SeqCst), 0, "subscription is lazy");
        obs.subscribe(FnObserver::new());
        obs.subscribe(FnObserver::new());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn nothing_is_delivered_after_error() {
        let (log, observer) = recorder();
        Observable::new(|sink: Subscriber<u32>| {
            sink.next(1);
            sink.error(LinkError::Other("boom".into()));
            sink.next(2);
            sink.complete();
            None
        })
        .subscribe(observer);
        assert_eq!(*log.lock().unwrap(), vec!["next 1", "error boom"]);
    }

    #[test]
    fn teardown_runs_once_even_when_closed_synchronously() {
        let torn = Arc::new(AtomicUsize::new(0));
        let t = torn.clone();
        let sub = Observable::new(move |sink: Subscriber<u32>| {
            sink.complete();
            let t = t.clone();
            Some(Box::new(move || {
                t.fetch_add(1, Ordering::SeqCst);
            }) as Teardown)
        })
        .subscribe(FnObserver::new());
        sub.unsubscribe();
        assert_eq!(torn.load(Ordering::SeqCst), 1);
        assert!(sub.is_closed());
    }

    #[test]
    fn unsubscribe_stops_delivery_for_that_subscriber_only() {
        let sinks: Arc<Mutex<Vec<Subscriber<u32>>>> = Arc::new(Mutex::new(Vec::new()));
        let stash = sinks.clone();
        let obs = Observable::new(move |sink| {
            stash.lock().unwrap().push(sink);
            None
        });
        let (first_log, first) = recorder();
        let (second_log, second) = recorder();
        let first_sub = obs.subscribe(first);
        obs.subscribe(second);

        first_sub.unsubscribe();
        for sink in sinks.lock().unwrap().iter() {
            sink.next(7);
        }
        assert!(first_log.lock().unwrap().is_empty());
        assert_eq!(*second_log.lock().unwrap(), vec!["next 7"]);
    }

    #[test]
    fn map_transforms_values() {
        let (log, observer) = recorder();
        Observable::from_iter([1u32, 2, 3]).map(|v| v * 10).subscribe(observer);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["next 10", "next 20", "next 30", "complete"]
        );
    }

    #[tokio::test]
    async fn stream_adapter_yields_values_then_ends() {
        let values: Vec<_> = Observable::from_iter([1u32, 2])
            .into_stream()
            .collect()
            .await;
        assert_eq!(values, vec![Ok(1), Ok(2)]);
    }

    #[tokio::test]
    async fn first_surfaces_errors() {
        let err = Observable::<u32>::error(LinkError::Network("down".into()))
            .first()
            .await
            .unwrap_err();
        assert_eq!(err, LinkError::Network("down".into()));
        assert_eq!(Observable::<u32>::empty().first().await, Ok(None));
    }

    #[tokio::test(start_paused = true)]
    async fn from_future_is_aborted_on_unsubscribe() {
        let (log, observer) = recorder();
        let sub = Observable::from_future(|| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(5u32)
        })
        .subscribe(observer);
        sub.unsubscribe();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(log.lock().unwrap().is_empty());

        let value = Observable::from_future(|| async { Ok(9u32) }).first().await;
        assert_eq!(value, Ok(Some(9)));
    }
}
