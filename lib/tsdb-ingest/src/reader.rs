//! Stream reader and batcher.
//!
//! Reads the pre-generated input corpus record by record, groups records into batches of a fixed size, and hands each
//! batch to the distribution queue. The input is a fixed corpus rather than a live source, so any read or decode
//! failure stops the run instead of skipping the bad record.

use std::{collections::BTreeMap, io, mem};

use async_compression::tokio::write::GzipEncoder;
use bytes::Bytes;
use serde::Deserialize;
use snafu::{ResultExt as _, Snafu};
use tokio::io::{AsyncBufReadExt as _, AsyncRead, AsyncReadExt as _, AsyncWriteExt as _, BufReader};
use tracing::{debug, info};

use crate::{
    batch::{Batch, CompressedBatch},
    codec::{decode_payload, CodecError},
    point::{MAX_TIMESTAMP_MILLIS, MIN_TIMESTAMP_MILLIS},
    queue::QueueSender,
};

/// Size of the buffer wrapped around the input stream.
const READ_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Largest frame the reader will accept in binary mode.
///
/// A single point is a few hundred bytes; anything near this size means the length prefix is garbage.
const MAX_FRAME_LEN: u64 = 64 * 1024 * 1024;

const JSON_ARRAY_OPEN: &[u8] = b"[\n";
const JSON_ARRAY_SEPARATOR: &[u8] = b", \n";
const JSON_ARRAY_CLOSE: &[u8] = b"\n]";

/// Input encoding.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InputFormat {
    /// One JSON record per line.
    Json,

    /// Length-prefixed binary wire points.
    Binary,
}

/// Reader error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ReaderError {
    /// Reading from the input stream failed.
    #[snafu(display("failed to read input after {} items: {}", items_read, source))]
    ReadInput { items_read: u64, source: io::Error },

    /// The input ended in the middle of a frame.
    #[snafu(display("input ended in the middle of item {} ({})", item, reason))]
    TruncatedInput { item: u64, reason: &'static str },

    /// A frame declared an impossible length.
    #[snafu(display("item {} declares a {} byte frame, over the {} byte limit", item, frame_len, MAX_FRAME_LEN))]
    FrameTooLarge { item: u64, frame_len: u64 },

    /// A binary frame could not be decoded.
    #[snafu(display("cannot decode item {}: {}", item, source))]
    DecodeFrame { item: u64, source: CodecError },

    /// A binary frame carried a timestamp that is not exactly 13 digits in milliseconds.
    #[snafu(display("item {} has timestamp {}, which is not exactly 13 digits", item, timestamp))]
    InvalidTimestamp { item: u64, timestamp: i64 },

    /// A JSON line was not a valid point record.
    #[snafu(display("malformed record on line {}: {}", line, reason))]
    MalformedRecord { line: u64, reason: String },

    /// Compressing a batch failed.
    #[snafu(display("failed to compress batch: {}", source))]
    CompressBatch { source: io::Error },

    /// Every worker stopped before the input was fully read.
    #[snafu(display("all workers stopped before the input was fully read ({} items read)", items_read))]
    WorkersGone { items_read: u64 },
}

/// Totals for one pass over the input stream.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ReadSummary {
    /// Number of records read.
    pub items_read: u64,

    /// Number of field values across every record read.
    pub values_read: u64,

    /// Number of input bytes consumed.
    pub bytes_read: u64,

    /// Number of batches handed to the queue.
    pub batches: u64,
}

/// A single line of JSON input.
#[derive(Deserialize)]
struct JsonRecord {
    metric: String,
    timestamp: i64,
    fields: BTreeMap<String, f64>,
}

impl JsonRecord {
    fn validate(&self) -> Result<(), String> {
        if self.metric.is_empty() {
            return Err("empty metric name".to_string());
        }
        if !(MIN_TIMESTAMP_MILLIS..=MAX_TIMESTAMP_MILLIS).contains(&self.timestamp) {
            return Err(format!("timestamp {} is not exactly 13 digits", self.timestamp));
        }
        Ok(())
    }
}

/// Accumulates JSON lines into a gzip-compressed JSON array.
struct JsonBatchBuilder {
    encoder: GzipEncoder<Vec<u8>>,
    items: usize,
    values: usize,
}

impl JsonBatchBuilder {
    fn new() -> Self {
        Self {
            encoder: GzipEncoder::new(Vec::new()),
            items: 0,
            values: 0,
        }
    }

    fn len(&self) -> usize {
        self.items
    }

    fn is_empty(&self) -> bool {
        self.items == 0
    }

    async fn push(&mut self, line: &[u8], values: usize) -> io::Result<()> {
        let prefix = if self.items == 0 {
            JSON_ARRAY_OPEN
        } else {
            JSON_ARRAY_SEPARATOR
        };
        self.encoder.write_all(prefix).await?;
        self.encoder.write_all(line).await?;

        self.items += 1;
        self.values += values;
        Ok(())
    }

    async fn finish(mut self) -> io::Result<CompressedBatch> {
        self.encoder.write_all(JSON_ARRAY_CLOSE).await?;
        self.encoder.shutdown().await?;

        Ok(CompressedBatch {
            payload: Bytes::from(self.encoder.into_inner()),
            items: self.items,
            values: self.values,
        })
    }
}

/// Reads an input stream into batches.
pub struct StreamReader {
    batch_size: usize,
}

impl StreamReader {
    /// Creates a new `StreamReader` that emits batches of `batch_size` records.
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    /// Reads `input` in the given format until end-of-stream, sending every batch to `queue`.
    ///
    /// The trailing partial batch, if any, is sent as well. Once this returns, no more batches are produced: dropping
    /// `queue` afterwards is what tells the workers that the input is exhausted.
    ///
    /// # Errors
    ///
    /// If the input cannot be read or contains a malformed record, or every worker has gone away, an error is returned.
    pub async fn read<R>(
        &self, format: InputFormat, input: R, queue: &QueueSender<Batch>,
    ) -> Result<ReadSummary, ReaderError>
    where
        R: AsyncRead + Unpin,
    {
        match format {
            InputFormat::Json => self.read_json(input, queue).await,
            InputFormat::Binary => self.read_binary(input, queue).await,
        }
    }

    /// Reads JSON lines, emitting gzip-compressed JSON array batches.
    ///
    /// # Errors
    ///
    /// If the input cannot be read, a line is not a valid point record, or every worker has gone away, an error is
    /// returned.
    pub async fn read_json<R>(&self, input: R, queue: &QueueSender<Batch>) -> Result<ReadSummary, ReaderError>
    where
        R: AsyncRead + Unpin,
    {
        let mut summary = ReadSummary::default();
        let mut lines = BufReader::with_capacity(READ_BUFFER_SIZE, input).lines();
        let mut builder = JsonBatchBuilder::new();
        let mut line_number = 0u64;

        while let Some(line) = lines.next_line().await.context(ReadInput {
            items_read: summary.items_read,
        })? {
            line_number += 1;
            summary.bytes_read += line.len() as u64 + 1;

            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }

            let record = serde_json::from_str::<JsonRecord>(line)
                .map_err(|e| e.to_string())
                .and_then(|record| record.validate().map(|()| record))
                .map_err(|reason| ReaderError::MalformedRecord {
                    line: line_number,
                    reason,
                })?;

            let values = record.fields.len();
            summary.items_read += 1;
            summary.values_read += values as u64;

            builder.push(line.as_bytes(), values).await.context(CompressBatch)?;
            if builder.len() >= self.batch_size {
                let full = mem::replace(&mut builder, JsonBatchBuilder::new());
                let batch = full.finish().await.context(CompressBatch)?;
                send_batch(queue, Batch::Compressed(batch), &mut summary).await?;
            }
        }

        if !builder.is_empty() {
            let batch = builder.finish().await.context(CompressBatch)?;
            send_batch(queue, Batch::Compressed(batch), &mut summary).await?;
        }

        info!(
            items = summary.items_read,
            batches = summary.batches,
            "Finished reading JSON input."
        );
        Ok(summary)
    }

    /// Reads length-prefixed binary wire points, emitting batches of points.
    ///
    /// # Errors
    ///
    /// If the input cannot be read, ends in the middle of a frame, contains a frame that cannot be decoded or carries a
    /// timestamp that is not exactly 13 digits, or every worker has gone away, an error is returned.
    pub async fn read_binary<R>(&self, input: R, queue: &QueueSender<Batch>) -> Result<ReadSummary, ReaderError>
    where
        R: AsyncRead + Unpin,
    {
        let mut summary = ReadSummary::default();
        let mut reader = BufReader::with_capacity(READ_BUFFER_SIZE, input);
        let mut points = Vec::with_capacity(self.batch_size);
        let mut payload = Vec::new();

        loop {
            // Only a completely empty buffer at a frame boundary counts as a clean end of the input.
            let at_eof = reader
                .fill_buf()
                .await
                .context(ReadInput {
                    items_read: summary.items_read,
                })?
                .is_empty();
            if at_eof {
                break;
            }

            let item = summary.items_read;
            let frame_len = reader.read_u64_le().await.map_err(|e| truncated_or_io(e, item, "length prefix"))?;
            if frame_len > MAX_FRAME_LEN {
                return Err(ReaderError::FrameTooLarge { item, frame_len });
            }

            payload.resize(frame_len as usize, 0);
            reader
                .read_exact(&mut payload)
                .await
                .map_err(|e| truncated_or_io(e, item, "payload"))?;

            let point = decode_payload(&payload).context(DecodeFrame { item })?;
            if !(MIN_TIMESTAMP_MILLIS..=MAX_TIMESTAMP_MILLIS).contains(&point.timestamp) {
                return Err(ReaderError::InvalidTimestamp {
                    item,
                    timestamp: point.timestamp,
                });
            }

            summary.items_read += 1;
            summary.values_read += point.value_count() as u64;
            summary.bytes_read += frame_len + 8;
            points.push(point);

            if points.len() >= self.batch_size {
                let full = mem::replace(&mut points, Vec::with_capacity(self.batch_size));
                send_batch(queue, Batch::Points(full), &mut summary).await?;
            }
        }

        if !points.is_empty() {
            send_batch(queue, Batch::Points(points), &mut summary).await?;
        }

        info!(
            items = summary.items_read,
            batches = summary.batches,
            "Finished reading binary input."
        );
        Ok(summary)
    }
}

async fn send_batch(queue: &QueueSender<Batch>, batch: Batch, summary: &mut ReadSummary) -> Result<(), ReaderError> {
    let items = batch.items();
    queue.send(batch).await.map_err(|_| ReaderError::WorkersGone {
        items_read: summary.items_read,
    })?;

    summary.batches += 1;
    debug!(batch = summary.batches, items, "Queued batch.");
    Ok(())
}

fn truncated_or_io(e: io::Error, item: u64, reason: &'static str) -> ReaderError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        ReaderError::TruncatedInput { item, reason }
    } else {
        ReaderError::ReadInput {
            items_read: item,
            source: e,
        }
    }
}
