//! Load driver.
//!
//! Wires the reader, the distribution queue, one writer per worker, and the backoff tracker together, and turns the
//! whole run into a [`LoadSummary`].

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::Client;
use snafu::{ResultExt as _, Snafu};
use tokio::{io::AsyncRead, task::JoinSet, time::Instant};
use tracing::{debug, error, info};

use crate::{
    backoff::{BackoffSignal, BackoffTracker, DEFAULT_SIGNAL_CAPACITY},
    batch::Batch,
    endpoint::Endpoint,
    queue::distribution_queue,
    reader::{InputFormat, ReadSummary, ReaderError, StreamReader},
    registry::FieldOrderRegistry,
    transport::{GrpcConnector, RetryPolicy, RpcTransport},
    writer::{process_batches, BatchWriter, HttpWriter, RpcWriter, WorkerSummary, WriteError},
};

/// Path of the series listing endpoint used by the pre-flight check.
pub const SUGGEST_PATH: &str = "/api/suggest";

/// Default number of series the pre-flight check asks for.
pub const DEFAULT_PROBE_LIMIT: usize = 1;

/// How batches reach the target.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransportKind {
    /// Gzip-compressed JSON over HTTP.
    Http,

    /// Multi-value put RPC.
    Rpc,
}

impl TransportKind {
    /// Returns the only input format this transport can carry.
    pub const fn input_format(self) -> InputFormat {
        match self {
            Self::Http => InputFormat::Json,
            Self::Rpc => InputFormat::Binary,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http => f.write_str("http"),
            Self::Rpc => f.write_str("rpc"),
        }
    }
}

/// Driver error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum DriverError {
    /// The settings are unusable.
    #[snafu(display("invalid configuration: {}", reason))]
    InvalidConfiguration { reason: String },

    /// The pre-flight check could not ask the target for existing data.
    #[snafu(display("failed to check target for existing data"))]
    Probe { source: ProbeError },

    /// The target already holds data.
    #[snafu(display(
        "target already holds {} series (first: '{}'); drop the existing data before loading",
        count,
        first
    ))]
    TargetNotEmpty { first: String, count: usize },

    /// The reader failed.
    #[snafu(display("failed to read input"))]
    Read { source: ReaderError },

    /// A worker failed to submit a batch.
    #[snafu(display("worker {} failed", worker_id))]
    Worker { worker_id: usize, source: WriteError },

    /// A task panicked or was cancelled.
    #[snafu(display("{} task did not complete", task))]
    TaskFailed {
        task: &'static str,
        source: tokio::task::JoinError,
    },
}

/// Pre-flight check error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ProbeError {
    /// The request failed or its response could not be decoded.
    #[snafu(display("request to {} failed", endpoint))]
    ProbeRequest { endpoint: Endpoint, source: reqwest::Error },

    /// The target answered with a non-success status.
    #[snafu(display("{} responded with status {}", endpoint, status))]
    ProbeStatus { endpoint: Endpoint, status: u16 },
}

/// Load settings.
#[derive(Clone, Debug)]
pub struct LoadSettings {
    /// Target endpoints. Workers are assigned to them round-robin.
    pub endpoints: Vec<Endpoint>,

    /// Records per batch.
    pub batch_size: usize,

    /// Number of concurrent workers.
    pub workers: usize,

    /// Input encoding.
    pub input_format: InputFormat,

    /// Transport used to reach the target.
    pub transport: TransportKind,

    /// Whether batches are actually submitted.
    ///
    /// When false, the input is read and batched at full speed and every batch is discarded.
    pub do_load: bool,

    /// RPC retry policy.
    pub retry: RetryPolicy,

    /// How long HTTP workers wait after the target pushes back.
    pub http_backoff: Duration,
}

impl LoadSettings {
    /// Checks the settings for consistency.
    ///
    /// # Errors
    ///
    /// If there are no endpoints, no workers, a zero batch size, or the input format cannot be carried by the selected
    /// transport, an error is returned.
    pub fn validate(&self) -> Result<(), DriverError> {
        let reason = if self.endpoints.is_empty() {
            "at least one target host is required".to_string()
        } else if self.workers == 0 {
            "worker count must be at least 1".to_string()
        } else if self.batch_size == 0 {
            "batch size must be at least 1".to_string()
        } else if self.retry.max_send_attempts == 0 || self.retry.max_dial_attempts == 0 {
            "RPC attempt limits must be at least 1".to_string()
        } else if self.transport.input_format() != self.input_format {
            format!("{:?} input cannot be sent over {}", self.input_format, self.transport)
        } else {
            return Ok(());
        };

        Err(DriverError::InvalidConfiguration { reason })
    }

    /// Returns the endpoint assigned to the given worker.
    pub fn endpoint_for(&self, worker_id: usize) -> &Endpoint {
        &self.endpoints[worker_id % self.endpoints.len()]
    }
}

/// Asks the target which series it already holds.
#[async_trait]
pub trait TargetProbe: Send + Sync {
    /// Returns the names of existing series, up to the probe's limit.
    async fn existing_series(&self) -> Result<Vec<String>, ProbeError>;
}

/// Lists existing series through the target's HTTP suggest API.
pub struct HttpTargetProbe {
    client: Client,
    endpoint: Endpoint,
    limit: usize,
}

impl HttpTargetProbe {
    /// Creates a new `HttpTargetProbe` asking `endpoint` for up to `limit` series.
    pub fn new(client: Client, endpoint: Endpoint, limit: usize) -> Self {
        Self {
            client,
            endpoint,
            limit: limit.max(1),
        }
    }
}

#[async_trait]
impl TargetProbe for HttpTargetProbe {
    async fn existing_series(&self) -> Result<Vec<String>, ProbeError> {
        let max = self.limit.to_string();
        let response = self
            .client
            .get(self.endpoint.http_url(SUGGEST_PATH))
            .query(&[("type", "metrics"), ("max", max.as_str())])
            .send()
            .await
            .context(ProbeRequest {
                endpoint: self.endpoint.clone(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProbeError::ProbeStatus {
                endpoint: self.endpoint.clone(),
                status: status.as_u16(),
            });
        }

        response.json().await.context(ProbeRequest {
            endpoint: self.endpoint.clone(),
        })
    }
}

/// Creates the writer for each worker.
pub trait MakeWriter: Send + Sync {
    /// Creates the writer for `worker_id`, sending to `endpoint`.
    fn make_writer(&self, worker_id: usize, endpoint: &Endpoint, backoff: BackoffSignal) -> Box<dyn BatchWriter>;
}

/// Creates the HTTP or RPC writers used against a real target.
pub struct TransportWriters {
    kind: TransportKind,
    client: Client,
    registry: Arc<FieldOrderRegistry>,
    retry: RetryPolicy,
    http_backoff: Duration,
}

impl TransportWriters {
    /// Creates a new `TransportWriters` for the given settings.
    ///
    /// RPC writers share `registry`; HTTP writers share `client`.
    pub fn new(settings: &LoadSettings, client: Client, registry: Arc<FieldOrderRegistry>) -> Self {
        Self {
            kind: settings.transport,
            client,
            registry,
            retry: settings.retry.clone(),
            http_backoff: settings.http_backoff,
        }
    }
}

impl MakeWriter for TransportWriters {
    fn make_writer(&self, _worker_id: usize, endpoint: &Endpoint, backoff: BackoffSignal) -> Box<dyn BatchWriter> {
        match self.kind {
            TransportKind::Http => Box::new(HttpWriter::new(
                self.client.clone(),
                endpoint.clone(),
                self.http_backoff,
                backoff,
            )),
            TransportKind::Rpc => Box::new(RpcWriter::new(RpcTransport::new(
                GrpcConnector,
                endpoint.clone(),
                self.retry.clone(),
                Arc::clone(&self.registry),
                backoff,
            ))),
        }
    }
}

/// Outcome of a completed load.
#[derive(Clone, Debug)]
pub struct LoadSummary {
    /// Records read from the input.
    pub items: u64,

    /// Field values read from the input.
    pub values: u64,

    /// Batches handed to workers.
    pub batches: u64,

    /// Number of workers.
    pub workers: usize,

    /// Wall-clock time from the first read to the last submission.
    pub elapsed: Duration,

    /// Total time the target spent pushing back.
    pub backoff: Duration,

    /// Per-worker results, ordered by worker index.
    pub per_worker: Vec<WorkerSummary>,
}

impl LoadSummary {
    /// Returns the mean number of values loaded per second.
    pub fn values_rate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.values as f64 / secs
        } else {
            0.0
        }
    }
}

impl fmt::Display for LoadSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "loaded {} items and {} values in {:.06}sec with {} workers (mean values rate {:.06}/sec)",
            self.items,
            self.values,
            self.elapsed.as_secs_f64(),
            self.workers,
            self.values_rate()
        )
    }
}

/// Runs a load from start to finish.
pub struct Driver<P, W> {
    settings: LoadSettings,
    probe: P,
    writers: W,
}

impl<P, W> Driver<P, W>
where
    P: TargetProbe,
    W: MakeWriter,
{
    /// Creates a new `Driver`.
    ///
    /// # Errors
    ///
    /// If the settings are invalid, an error is returned.
    pub fn new(settings: LoadSettings, probe: P, writers: W) -> Result<Self, DriverError> {
        settings.validate()?;
        Ok(Self {
            settings,
            probe,
            writers,
        })
    }

    /// Reads `input` to the end, loading every batch into the target.
    ///
    /// When loading, the target must hold no data: otherwise the run stops before anything is read.
    ///
    /// # Errors
    ///
    /// If the pre-flight check fails, the input cannot be read, or any worker fails, an error is returned. A worker
    /// failure stops every other worker and the reader.
    pub async fn run<R>(self, input: R) -> Result<LoadSummary, DriverError>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        if self.settings.do_load {
            self.check_target_empty().await?;
        }
        let Self { settings, writers, .. } = self;

        let (backoff, tracker) = BackoffTracker::spawn(DEFAULT_SIGNAL_CAPACITY);
        let (batch_tx, batch_rx) = distribution_queue::<Batch>(settings.workers);

        let started = Instant::now();

        let mut workers = JoinSet::new();
        for worker_id in 0..settings.workers {
            let endpoint = settings.endpoint_for(worker_id);
            let writer = writers.make_writer(worker_id, endpoint, backoff.clone());
            debug!(worker_id, %endpoint, "Spawning worker.");
            let worker = process_batches(worker_id, writer, batch_rx.clone(), settings.do_load, backoff.clone());
            workers.spawn(async move { (worker_id, worker.await) });
        }
        drop(batch_rx);

        let reader = StreamReader::new(settings.batch_size);
        let input_format = settings.input_format;
        let reader_task = tokio::spawn(async move { reader.read(input_format, input, &batch_tx).await });

        let mut per_worker = Vec::with_capacity(settings.workers);
        while let Some(result) = workers.join_next().await {
            let failure = match result {
                Ok((_, Ok(summary))) => {
                    per_worker.push(summary);
                    continue;
                }
                Ok((worker_id, Err(e))) => {
                    error!(worker_id, error = %e, "Worker failed. Stopping load.");
                    DriverError::Worker { worker_id, source: e }
                }
                Err(e) => DriverError::TaskFailed {
                    task: "worker",
                    source: e,
                },
            };

            workers.abort_all();
            reader_task.abort();
            return Err(failure);
        }

        let read = reader_task
            .await
            .context(TaskFailed { task: "reader" })?
            .context(Read)?;

        drop(backoff);
        let backoff = tracker.wait().await.total;
        let elapsed = started.elapsed();

        per_worker.sort_by_key(|summary| summary.worker_id);
        let summary = build_summary(read, settings.workers, elapsed, backoff, per_worker);
        info!(
            items = summary.items,
            values = summary.values,
            batches = summary.batches,
            "Load complete."
        );
        Ok(summary)
    }

    async fn check_target_empty(&self) -> Result<(), DriverError> {
        let existing = self.probe.existing_series().await.context(Probe)?;
        match existing.first() {
            Some(first) => Err(DriverError::TargetNotEmpty {
                first: first.clone(),
                count: existing.len(),
            }),
            None => Ok(()),
        }
    }
}

fn build_summary(
    read: ReadSummary, workers: usize, elapsed: Duration, backoff: Duration, per_worker: Vec<WorkerSummary>,
) -> LoadSummary {
    LoadSummary {
        items: read.items_read,
        values: read.values_read,
        batches: read.batches,
        workers,
        elapsed,
        backoff,
        per_worker,
    }
}
