use std::sync::Arc;

use snafu::Snafu;

use super::proto::{MultiFieldPoint, MultiFieldPutRequest};
use crate::{codec::WirePoint, registry::FieldOrderRegistry};

/// Protocol or consistency error.
///
/// Any of these means the batcher upstream grouped points incorrectly, so they are never coerced into a valid request.
#[derive(Debug, Snafu, Eq, PartialEq)]
#[snafu(context(suffix(false)))]
pub enum ProtocolError {
    /// The batch had no points.
    #[snafu(display("cannot build a request from an empty batch"))]
    EmptyBatch,

    /// A point belonged to a different metric than the first point in the batch.
    #[snafu(display(
        "point {} belongs to metric '{}', but the batch is for metric '{}'",
        index,
        found,
        expected
    ))]
    MixedMetrics {
        index: usize,
        expected: String,
        found: String,
    },

    /// A point's field set did not match the metric's canonical field order.
    #[snafu(display(
        "point {} of metric '{}' has fields {:?}, expected {:?}",
        index,
        metric,
        found,
        expected
    ))]
    FieldSetMismatch {
        index: usize,
        metric: String,
        expected: Vec<String>,
        found: Vec<String>,
    },

    /// The writer was handed a batch it cannot send.
    #[snafu(display("writer cannot send {} batches", kind))]
    UnsupportedBatch { kind: &'static str },
}

/// Converts a batch of points into a multi-value put request.
///
/// The first point decides the metric for the whole batch. Its fields seed the metric's canonical order in the registry
/// if none exists yet, and every point's values are laid out in that order.
///
/// # Errors
///
/// If the batch is empty, mixes metrics, or any point's field set differs from the canonical one (missing, extra, or
/// renamed fields), an error is returned.
pub fn shape_request(points: &[WirePoint], registry: &FieldOrderRegistry) -> Result<MultiFieldPutRequest, ProtocolError> {
    let first = points.first().ok_or(ProtocolError::EmptyBatch)?;
    let metric = first.metric();
    let field_order = registry.get_or_create(metric, first.fields.keys());

    let mut shaped = Vec::with_capacity(points.len());
    for (index, point) in points.iter().enumerate() {
        if point.metric() != metric {
            return Err(ProtocolError::MixedMetrics {
                index,
                expected: metric.to_string(),
                found: point.metric().to_string(),
            });
        }

        let values = project_values(point, &field_order).ok_or_else(|| ProtocolError::FieldSetMismatch {
            index,
            metric: metric.to_string(),
            expected: field_order.to_vec(),
            found: point.fields.keys().cloned().collect(),
        })?;

        shaped.push(MultiFieldPoint {
            timestamp: point.timestamp,
            serieskey: point.serieskey.clone(),
            values,
        });
    }

    Ok(MultiFieldPutRequest {
        points: shaped,
        field_names: field_order.to_vec(),
    })
}

fn project_values(point: &WirePoint, field_order: &Arc<[String]>) -> Option<Vec<f64>> {
    if point.fields.len() != field_order.len() {
        return None;
    }

    field_order
        .iter()
        .map(|name| point.fields.get(name).copied())
        .collect()
}
