use std::sync::Arc;

use papaya::HashMap;
use tracing::debug;

/// Canonical field order for each metric.
///
/// Values are written to the target positionally, so every batch for a given metric has to lay out its field values in
/// the same order. The first worker to see a metric decides that order; every other worker, concurrently or later, gets
/// the same order back. Once set, a metric's order never changes for the life of the registry.
///
/// The registry is created once by the driver and shared between workers behind an `Arc`. It does not need any
/// external locking.
#[derive(Default)]
pub struct FieldOrderRegistry {
    orders: HashMap<String, Arc<[String]>>,
}

impl FieldOrderRegistry {
    /// Creates an empty `FieldOrderRegistry`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets the canonical field order for `metric`, creating it from `candidate_fields` if none exists yet.
    ///
    /// When several callers race to create the order for the same metric, exactly one candidate wins and all callers
    /// observe that winning order.
    pub fn get_or_create<I, S>(&self, metric: &str, candidate_fields: I) -> Arc<[String]>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let orders = self.orders.pin();
        if let Some(existing) = orders.get(metric) {
            return Arc::clone(existing);
        }

        let candidate: Arc<[String]> = candidate_fields
            .into_iter()
            .map(|field| field.as_ref().to_string())
            .collect();

        let order = orders.get_or_insert_with(metric.to_string(), || {
            debug!(metric, fields = ?candidate, "Registered field order for metric.");
            Arc::clone(&candidate)
        });
        Arc::clone(order)
    }

    /// Looks up the canonical field order for `metric`.
    pub fn lookup(&self, metric: &str) -> Option<Arc<[String]>> {
        self.orders.pin().get(metric).map(Arc::clone)
    }

    /// Returns the number of metrics with a registered field order.
    pub fn len(&self) -> usize {
        self.orders.len()
    }

    /// Returns `true` if no field order has been registered yet.
    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }
}
