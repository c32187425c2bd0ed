//! Protobuf messages for the multi-value put RPC.
//!
//! These mirror the target's service definition, so the tags must never change.

/// A single point in a multi-value put request.
///
/// `values[i]` is the value of the request's `field_names[i]`.
#[derive(Clone, PartialEq, prost::Message)]
pub struct MultiFieldPoint {
    /// Milliseconds since the Unix epoch.
    #[prost(int64, tag = "1")]
    pub timestamp: i64,

    /// Series key.
    #[prost(string, tag = "2")]
    pub serieskey: String,

    /// Field values, positionally matching the request's field names.
    #[prost(double, repeated, tag = "3")]
    pub values: Vec<f64>,
}

/// Multi-value put request.
///
/// Every point in a request belongs to the same metric and shares one list of field names.
#[derive(Clone, PartialEq, prost::Message)]
pub struct MultiFieldPutRequest {
    /// Points to write.
    #[prost(message, repeated, tag = "1")]
    pub points: Vec<MultiFieldPoint>,

    /// Field names, in the order every point lays out its values.
    #[prost(string, repeated, tag = "2")]
    pub field_names: Vec<String>,
}

/// Multi-value put response.
#[derive(Clone, PartialEq, prost::Message)]
pub struct PutResponse {
    /// Whether the target accepted the write.
    #[prost(bool, tag = "1")]
    pub success: bool,
}
