pub mod config;
pub mod error;
pub mod link;
pub mod observable;
pub mod operation;

pub use error::LinkError;
pub use link::{concat, execute, from, split, FnLink, Link, LinkKind, NextLink};
pub use observable::{
    FnObserver, Observable, ObservableStream, Observer, Subscriber, Subscription, Teardown,
};
pub use operation::{Operation, OperationKind, Response};
