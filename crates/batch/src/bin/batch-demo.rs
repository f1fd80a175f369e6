//! batch-demo: drives a `BatchLink` with a simulated transport.
//!
//! Issues a burst of operations spread over a few operation names, lets the
//! batcher group them, and prints every response together with the batch it
//! travelled in. Run with `RUST_LOG=relink_batch=debug` to see enqueue and
//! flush events.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures::future::join_all;
use serde_json::{json, Map, Value};
use tracing::info;

use relink_batch::{by_operation_name, BatchConfig, BatchHandler, BatchLink, BatchResult};
use relink_core::config::load_dotenv;
use relink_core::{execute, Link, Observable, Operation, Response};

// ── CLI ─────────────────────────────────────────────────────────────

/// Batch a burst of simulated GraphQL operations and report the grouping.
#[derive(Parser, Debug)]
#[command(name = "batch-demo", version, about)]
struct Cli {
    /// Path to a TOML file with a `[batch]` table.
    #[arg(long, env = "RELINK_CONFIG")]
    config: Option<PathBuf>,

    /// Override the flush interval in milliseconds.
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Override the batch size limit (0 = unbounded).
    #[arg(long)]
    max: Option<usize>,

    /// Number of operations to issue.
    #[arg(long, default_value_t = 12)]
    operations: usize,

    /// Number of distinct operation names (one batch key each).
    #[arg(long, default_value_t = 2)]
    keys: usize,

    /// Simulated transport latency per batch, in milliseconds.
    #[arg(long, default_value_t = 25)]
    latency_ms: u64,
}

// ── transport ───────────────────────────────────────────────────────

/// Terminating handler that answers every operation with its own variables
/// after `latency`, tagging each response with the batch number.
fn simulated_transport(latency: Duration) -> BatchHandler {
    let batches = Arc::new(AtomicU64::new(0));
    BatchHandler::terminating(move |operations| {
        let batch = batches.fetch_add(1, Ordering::Relaxed) + 1;
        info!(batch, size = operations.len(), "sending batch");
        Ok(Observable::from_future(move || {
            let operations = operations.clone();
            async move {
                tokio::time::sleep(latency).await;
                let size = operations.len();
                let responses: Vec<Response> = operations
                    .iter()
                    .map(|op| {
                        let mut extensions = Map::new();
                        extensions.insert("batch".into(), json!(batch));
                        extensions.insert("batch_size".into(), json!(size));
                        Response {
                            data: Some(json!({
                                "operation": op.name,
                                "variables": Value::Object(op.variables.clone()),
                            })),
                            extensions: Some(Value::Object(extensions)),
                            ..Response::default()
                        }
                    })
                    .collect();
                Ok(BatchResult::Many(responses))
            }
        }))
    })
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    load_dotenv();
    let cli = Cli::parse();

    let mut config = BatchConfig::load(cli.config.as_deref())?;
    if let Some(ms) = cli.interval_ms {
        config = config.with_interval(Duration::from_millis(ms));
    }
    if let Some(max) = cli.max {
        config = config.with_max(max);
    }
    config.validate()?;
    info!(
        interval_ms = config.batch_interval.as_millis() as u64,
        batch_max = config.batch_max,
        "batch config"
    );

    let link = BatchLink::builder(simulated_transport(Duration::from_millis(cli.latency_ms)))
        .config(config)
        .batch_key_fn(by_operation_name())
        .build();
    info!(terminating = link.is_terminating(), "batch link ready");

    let keys = cli.keys.max(1);
    let pending = (0..cli.operations).map(|i| {
        let operation = Operation::query("query Item($id: Int!) { item(id: $id) { id } }")
            .with_name(format!("Item{}", i % keys))
            .with_variable("id", json!(i));
        execute(&link, operation).first()
    });

    for (i, result) in join_all(pending).await.into_iter().enumerate() {
        match result? {
            Some(response) => println!("{i:>3} {}", serde_json::to_string(&response)?),
            None => println!("{i:>3} <no response>"),
        }
    }

    Ok(())
}
