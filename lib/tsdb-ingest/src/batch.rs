use bytes::Bytes;

use crate::codec::WirePoint;

/// A gzip-compressed JSON array of point records, ready to be sent as-is.
#[derive(Clone, Debug)]
pub struct CompressedBatch {
    /// Gzip stream whose decompressed content is the JSON array.
    pub payload: Bytes,

    /// Number of records in the array.
    pub items: usize,

    /// Number of field values across every record in the array.
    pub values: usize,
}

/// A batch of points handed from the reader to a worker.
#[derive(Clone, Debug)]
pub enum Batch {
    /// Text-mode batch, sent over HTTP.
    Compressed(CompressedBatch),

    /// Binary-mode batch, sent over RPC.
    Points(Vec<WirePoint>),
}

impl Batch {
    /// Returns the number of points in the batch.
    pub fn items(&self) -> usize {
        match self {
            Self::Compressed(batch) => batch.items,
            Self::Points(points) => points.len(),
        }
    }

    /// Returns the number of field values in the batch.
    pub fn values(&self) -> usize {
        match self {
            Self::Compressed(batch) => batch.values,
            Self::Points(points) => points.iter().map(WirePoint::value_count).sum(),
        }
    }

    /// Returns the name of the batch variant.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Compressed(_) => "compressed JSON",
            Self::Points(_) => "points",
        }
    }
}
