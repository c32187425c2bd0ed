//! Bulk ingest pipeline for driving write load against a time-series store.
//!
//! ## Overview
//!
//! A load is a single pass over a pre-generated corpus of points:
//!
//! - the [reader](reader) splits the input into fixed-size batches and pushes them onto a bounded queue
//! - one worker per configured connection pulls batches off the queue and hands them to its [writer](writer)
//! - writers send over HTTP (gzip-compressed JSON) or over RPC (protobuf, through the [transport](transport))
//! - every worker reports backpressure to the [backoff tracker](backoff), which totals the time spent congested
//!
//! The [driver](driver) wires all of this together and produces the final summary.

pub mod backoff;
pub mod batch;
pub mod codec;
pub mod driver;
pub mod endpoint;
pub mod point;
pub mod queue;
pub mod reader;
pub mod registry;
pub mod transport;
pub mod writer;

pub use self::driver::{Driver, DriverError, LoadSettings, LoadSummary, TransportKind};
pub use self::endpoint::Endpoint;
