//! Batch writers.
//!
//! A writer owns the connection to one endpoint and submits batches to it. Every worker runs
//! [`process_batches`] with its own writer, pulling from the shared distribution queue.

use std::time::Duration;

use async_trait::async_trait;
use snafu::Snafu;
use tracing::{debug, error, info};

use crate::{
    backoff::BackoffSignal,
    batch::Batch,
    endpoint::Endpoint,
    queue::QueueReceiver,
    transport::{ProtocolError, TransportError},
};

mod http;
pub use self::http::{HttpWriter, MULTI_PUT_PATH};

mod rpc;
pub use self::rpc::RpcWriter;

/// Writer error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum WriteError {
    /// The HTTP request could not be sent, or its response could not be read.
    #[snafu(display("HTTP request to {} failed", endpoint))]
    Http { endpoint: Endpoint, source: reqwest::Error },

    /// The target answered with a status that is neither success nor backpressure.
    #[snafu(display("{} responded with unexpected status {}: {}", endpoint, status, body))]
    UnexpectedStatus {
        endpoint: Endpoint,
        status: u16,
        body: String,
    },

    /// The RPC transport gave up.
    #[snafu(display("RPC transport failed"))]
    Transport { source: TransportError },

    /// The writer was handed a batch it cannot send.
    #[snafu(display("protocol fault on {}", endpoint))]
    Protocol { endpoint: Endpoint, source: ProtocolError },
}

/// Submits batches to a single endpoint.
#[async_trait]
pub trait BatchWriter: Send {
    /// Returns the endpoint this writer submits to.
    fn endpoint(&self) -> &Endpoint;

    /// Submits a batch, returning the latency of the request that succeeded.
    ///
    /// Transient failures are retried internally. Time spent retrying is reported on the backoff signal, not in the
    /// returned latency.
    ///
    /// # Errors
    ///
    /// If the batch cannot be delivered, an error is returned. The batch is lost, so callers should treat this as fatal.
    async fn submit(&mut self, batch: Batch) -> Result<Duration, WriteError>;
}

/// What a single worker did.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct WorkerSummary {
    /// Worker index.
    pub worker_id: usize,

    /// Batches received from the queue.
    pub batches: u64,

    /// Points in those batches.
    pub items: u64,

    /// Field values in those batches.
    pub values: u64,

    /// Sum of the latencies of every submission.
    pub total_latency: Duration,
}

/// Pulls batches from the queue and submits them until the queue closes.
///
/// Batches are submitted in the order received. After each batch, the backoff signal is cleared. When `do_load` is
/// false, batches are counted and discarded.
///
/// # Errors
///
/// The first submission failure stops the worker and is returned.
pub async fn process_batches(
    worker_id: usize, mut writer: Box<dyn BatchWriter>, queue: QueueReceiver<Batch>, do_load: bool,
    backoff: BackoffSignal,
) -> Result<WorkerSummary, WriteError> {
    let endpoint = writer.endpoint().clone();
    debug!(worker_id, %endpoint, do_load, "Worker started.");

    let mut summary = WorkerSummary {
        worker_id,
        ..WorkerSummary::default()
    };

    while let Some(batch) = queue.recv().await {
        let items = batch.items() as u64;
        let values = batch.values() as u64;

        if do_load {
            match writer.submit(batch).await {
                Ok(latency) => summary.total_latency += latency,
                Err(e) => {
                    error!(worker_id, %endpoint, error = %e, "Failed to submit batch.");
                    return Err(e);
                }
            }
        }

        summary.batches += 1;
        summary.items += items;
        summary.values += values;

        backoff.signal(false).await;
    }

    info!(
        worker_id,
        %endpoint,
        batches = summary.batches,
        items = summary.items,
        "Worker finished."
    );
    Ok(summary)
}
