//! Links: composable request/response pipeline stages.
//!
//! A [`Link`] receives an [`Operation`] plus an optional [`NextLink`] to the
//! following stage and returns the response stream. Whether a link ends the
//! pipeline is declared explicitly through [`Link::is_terminating`] rather
//! than inferred from the handler's shape.

use std::sync::Arc;

use tracing::warn;

use crate::observable::Observable;
use crate::operation::{Operation, Response};

/// Forwarding capability handed to a link: runs the rest of the pipeline.
pub type NextLink = Arc<dyn Fn(Operation) -> Observable<Response> + Send + Sync>;

type RequestFn = dyn Fn(Operation, Option<NextLink>) -> Observable<Response> + Send + Sync;

pub trait Link: Send + Sync {
    fn request(&self, operation: Operation, forward: Option<NextLink>) -> Observable<Response>;

    /// Terminating links never call `forward`; concatenating after them has
    /// no effect.
    fn is_terminating(&self) -> bool {
        false
    }
}

/// Blanket implementation so `Arc<dyn Link>` can be used directly.
impl<T: Link + ?Sized> Link for Arc<T> {
    fn request(&self, operation: Operation, forward: Option<NextLink>) -> Observable<Response> {
        (**self).request(operation, forward)
    }

    fn is_terminating(&self) -> bool {
        (**self).is_terminating()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Terminating,
    Forwarding,
}

/// Link backed by a closure.
pub struct FnLink {
    kind: LinkKind,
    handler: Arc<RequestFn>,
}

impl FnLink {
    /// A link that produces responses itself and never forwards.
    pub fn terminating<F>(f: F) -> Self
    where
        F: Fn(Operation) -> Observable<Response> + Send + Sync + 'static,
    {
        Self {
            kind: LinkKind::Terminating,
            handler: Arc::new(move |operation: Operation, _: Option<NextLink>| f(operation)),
        }
    }

    /// A link that may hand the operation on to the next stage.
    pub fn forwarding<F>(f: F) -> Self
    where
        F: Fn(Operation, Option<NextLink>) -> Observable<Response> + Send + Sync + 'static,
    {
        Self {
            kind: LinkKind::Forwarding,
            handler: Arc::new(f),
        }
    }

    /// Forwards unchanged, or completes empty at the end of the pipeline.
    pub fn pass_through() -> Self {
        Self::forwarding(|operation, forward| match forward {
            Some(next) => next(operation),
            None => Observable::empty(),
        })
    }

    pub fn kind(&self) -> LinkKind {
        self.kind
    }
}

impl Link for FnLink {
    fn request(&self, operation: Operation, forward: Option<NextLink>) -> Observable<Response> {
        (self.handler)(operation, forward)
    }

    fn is_terminating(&self) -> bool {
        self.kind == LinkKind::Terminating
    }
}

/// Terminating link that completes without a response.
pub fn empty() -> Arc<dyn Link> {
    Arc::new(FnLink::terminating(|_| Observable::empty()))
}

/// Chain links left to right. An empty list yields [`empty`].
pub fn from(links: Vec<Arc<dyn Link>>) -> Arc<dyn Link> {
    links.into_iter().reduce(concat).unwrap_or_else(empty)
}

/// Run `first`, forwarding into `second`.
///
/// Concatenating onto a terminating link is a mistake; it is logged and
/// `first` is returned unchanged.
pub fn concat(first: Arc<dyn Link>, second: Arc<dyn Link>) -> Arc<dyn Link> {
    if first.is_terminating() {
        warn!("concat called on a terminating link, which will have no effect");
        return first;
    }

    if second.is_terminating() {
        Arc::new(FnLink::terminating(move |operation| {
            let second = second.clone();
            let next: NextLink = Arc::new(move |op: Operation| second.request(op, None));
            first.request(operation, Some(next))
        }))
    } else {
        Arc::new(FnLink::forwarding(move |operation, forward| {
            let second = second.clone();
            let next: NextLink = Arc::new(move |op: Operation| second.request(op, forward.clone()));
            first.request(operation, Some(next))
        }))
    }
}

/// Route each operation to `left` when `test` holds, otherwise to `right`
/// (a pass-through when absent). Terminating only if both sides are.
pub fn split<F>(test: F, left: Arc<dyn Link>, right: Option<Arc<dyn Link>>) -> Arc<dyn Link>
where
    F: Fn(&Operation) -> bool + Send + Sync + 'static,
{
    let right = right.unwrap_or_else(|| Arc::new(FnLink::pass_through()) as Arc<dyn Link>);
    if left.is_terminating() && right.is_terminating() {
        Arc::new(FnLink::terminating(move |operation| {
            if test(&operation) {
                left.request(operation, None)
            } else {
                right.request(operation, None)
            }
        }))
    } else {
        Arc::new(FnLink::forwarding(move |operation, forward| {
            if test(&operation) {
                left.request(operation, forward)
            } else {
                right.request(operation, forward)
            }
        }))
    }
}

/// Run an operation through a pipeline.
pub fn execute(link: &dyn Link, operation: Operation) -> Observable<Response> {
    link.request(operation, None)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;

    fn echo_name() -> Arc<dyn Link> {
        Arc::new(FnLink::terminating(|op| {
            Observable::of(Response::data(json!({ "name": op.name })))
        }))
    }

    fn tagging(tag: &'static str, seen: Arc<Mutex<Vec<&'static str>>>) -> Arc<dyn Link> {
        Arc::new(FnLink::forwarding(move |op, forward| {
            seen.lock().unwrap().push(tag);
            match forward {
                Some(next) => next(op),
                None => Observable::empty(),
            }
        }))
    }

    #[tokio::test]
    async fn from_runs_links_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let link = from(vec![
            tagging("a", seen.clone()),
            tagging("b", seen.clone()),
            echo_name(),
        ]);
        assert!(link.is_terminating());

        let response = execute(&*link, Operation::query("{ id }").with_name("Q"))
            .first()
            .await
            .unwrap();
        assert_eq!(response, Some(Response::data(json!({"name": "Q"}))));
        assert_eq!(*seen.lock().unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn empty_pipeline_completes_without_value() {
        let link = from(Vec::new());
        assert_eq!(execute(&*link, Operation::query("{ id }")).first().await, Ok(None));
    }

    #[test]
    fn concat_after_terminating_link_is_a_no_op() {
        let terminating = echo_name();
        let combined = concat(terminating.clone(), Arc::new(FnLink::pass_through()));
        assert!(Arc::ptr_eq(&terminating, &combined));
    }

    #[test]
    fn forwarding_concat_stays_forwarding() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let combined = concat(tagging("a", seen.clone()), tagging("b", seen));
        assert!(!combined.is_terminating());
    }

    #[tokio::test]
    async fn split_routes_by_predicate() {
        let left: Arc<dyn Link> =
            Arc::new(FnLink::terminating(|_| Observable::of(Response::data(json!("left")))));
        let right: Arc<dyn Link> =
            Arc::new(FnLink::terminating(|_| Observable::of(Response::data(json!("right")))));
        let link = split(
            |op| op.name.as_deref() == Some("L"),
            left,
            Some(right),
        );
        assert!(link.is_terminating());

        let l = execute(&*link, Operation::query("{ a }").with_name("L")).first().await;
        let r = execute(&*link, Operation::query("{ a }").with_name("R")).first().await;
        assert_eq!(l, Ok(Some(Response::data(json!("left")))));
        assert_eq!(r, Ok(Some(Response::data(json!("right")))));
    }

    #[test]
    fn split_without_right_side_forwards() {
        let link = split(|_| true, echo_name(), None);
        assert!(!link.is_terminating());
    }
}
