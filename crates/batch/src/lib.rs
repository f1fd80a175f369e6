//! Operation batching for link pipelines.
//!
//! Requests issued close together are grouped per batch key, sent to a
//! [`BatchHandler`] as one call, and the batched answer is fanned back out
//! to each caller in enqueue order.

pub mod batcher;
pub mod config;
mod dispatcher;
pub mod error;
pub mod handler;
pub mod key;
pub mod link;
pub mod request;

pub use batcher::OperationBatcher;
pub use config::BatchConfig;
pub use error::ConfigError;
pub use handler::{BatchHandler, BatchResult, Forwards, HandlerResult};
pub use key::{by_context_field, by_operation_name, default_batch_key, BatchKeyFn};
pub use link::{BatchLink, BatchLinkBuilder};
pub use request::BatchableRequest;
