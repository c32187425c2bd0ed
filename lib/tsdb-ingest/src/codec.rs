//! Binary point codec.
//!
//! Points are written as protobuf-encoded [`WirePoint`] messages, each prefixed with its length as an 8-byte
//! little-endian unsigned integer. The same framing is used by the data generator when it writes a binary corpus, and
//! by the stream reader when it reads one back.

use std::collections::BTreeMap;

use bytes::{BufMut as _, Bytes, BytesMut};
use prost::Message as _;
use snafu::Snafu;

use crate::point::{metric_from_series_key, parse_series_key, EncodeError, FieldValue, Point};

/// Size of the length prefix in front of every frame.
pub const FRAME_PREFIX_LEN: usize = 8;

/// Codec error.
#[derive(Debug, Snafu, PartialEq)]
#[snafu(context(suffix(false)))]
pub enum CodecError {
    /// The point could not be encoded.
    #[snafu(display("failed to encode point: {}", source))]
    Encode { source: EncodeError },

    /// The buffer ended before the frame did.
    #[snafu(display(
        "truncated frame (needed {} bytes, but only {} bytes available)",
        needed,
        available
    ))]
    TruncatedFrame { needed: usize, available: usize },

    /// The frame payload is not a valid wire point.
    #[snafu(display("malformed wire point: {}", reason))]
    Malformed { reason: String },
}

impl From<EncodeError> for CodecError {
    fn from(source: EncodeError) -> Self {
        Self::Encode { source }
    }
}

/// A point as it travels on the wire.
///
/// Tags are folded into the series key, and every field value is a 64-bit float.
#[derive(Clone, PartialEq, prost::Message)]
pub struct WirePoint {
    /// Milliseconds since the Unix epoch.
    #[prost(int64, tag = "1")]
    pub timestamp: i64,

    /// Series key: the measurement followed by `,key=value` for every tag.
    #[prost(string, tag = "2")]
    pub serieskey: String,

    /// Field values, keyed by field name.
    #[prost(btree_map = "string, double", tag = "3")]
    pub fields: BTreeMap<String, f64>,
}

impl WirePoint {
    /// Builds the wire representation of the given point.
    ///
    /// # Errors
    ///
    /// If the timestamp is not exactly 13 digits in milliseconds, the measurement or a tag contains a series key
    /// delimiter, or any field value is not an integer or float, an error is returned.
    pub fn from_point(point: &Point) -> Result<Self, EncodeError> {
        let timestamp = point.timestamp_millis()?;
        let serieskey = point.checked_series_key()?;

        let mut fields = BTreeMap::new();
        for (name, value) in point.fields() {
            let value = value.as_f64().ok_or_else(|| EncodeError::UnsupportedFieldValue {
                field: name.clone(),
                kind: value.kind(),
            })?;
            fields.insert(name.clone(), value);
        }

        Ok(Self {
            timestamp,
            serieskey,
            fields,
        })
    }

    /// Returns the metric name this point belongs to.
    pub fn metric(&self) -> &str {
        metric_from_series_key(&self.serieskey)
    }

    /// Returns the number of field values carried by this point.
    pub fn value_count(&self) -> usize {
        self.fields.len()
    }

    /// Converts this wire point back into a [`Point`].
    ///
    /// Field values come back as floats, in field name order.
    ///
    /// # Errors
    ///
    /// If the series key cannot be split back into a measurement and tags, or the timestamp is out of range, an error
    /// is returned.
    pub fn into_point(self) -> Result<Point, CodecError> {
        let (measurement, tags) = parse_series_key(&self.serieskey).ok_or_else(|| CodecError::Malformed {
            reason: format!("invalid series key '{}'", self.serieskey),
        })?;

        let timestamp = chrono::DateTime::from_timestamp_millis(self.timestamp).ok_or_else(|| CodecError::Malformed {
            reason: format!("timestamp {} out of range", self.timestamp),
        })?;

        let mut point = Point::new(measurement, timestamp);
        for (key, value) in tags {
            point = point.with_tag(key, value);
        }
        for (name, value) in self.fields {
            point = point.with_field(name, FieldValue::Float(value));
        }

        Ok(point)
    }
}

/// Encodes a point into a length-prefixed frame.
///
/// # Errors
///
/// If the point cannot be represented on the wire, an error is returned. Nothing is silently dropped or truncated.
pub fn encode(point: &Point) -> Result<Bytes, CodecError> {
    let wire_point = WirePoint::from_point(point)?;
    Ok(encode_wire_point(&wire_point))
}

/// Encodes an already-built wire point into a length-prefixed frame.
pub fn encode_wire_point(wire_point: &WirePoint) -> Bytes {
    let payload_len = wire_point.encoded_len();
    let mut buf = BytesMut::with_capacity(FRAME_PREFIX_LEN + payload_len);
    buf.put_u64_le(payload_len as u64);

    // `BytesMut` grows on demand, so encoding into it cannot run out of capacity.
    wire_point
        .encode(&mut buf)
        .expect("BytesMut should always have enough capacity");

    buf.freeze()
}

/// Splits the first length-prefixed frame off the front of `buf`.
///
/// Returns the frame payload and the remaining bytes after it.
///
/// # Errors
///
/// If `buf` is shorter than the length prefix, or shorter than the length it declares, an error is returned.
pub fn split_frame(buf: &[u8]) -> Result<(&[u8], &[u8]), CodecError> {
    if buf.len() < FRAME_PREFIX_LEN {
        return Err(CodecError::TruncatedFrame {
            needed: FRAME_PREFIX_LEN,
            available: buf.len(),
        });
    }

    let (prefix, rest) = buf.split_at(FRAME_PREFIX_LEN);
    let mut prefix_bytes = [0u8; FRAME_PREFIX_LEN];
    prefix_bytes.copy_from_slice(prefix);
    let frame_len = u64::from_le_bytes(prefix_bytes);

    // A length that does not even fit in `usize` can never be satisfied by the buffer we were handed.
    let frame_len = usize::try_from(frame_len).unwrap_or(usize::MAX);
    if rest.len() < frame_len {
        return Err(CodecError::TruncatedFrame {
            needed: frame_len,
            available: rest.len(),
        });
    }

    Ok(rest.split_at(frame_len))
}

/// Decodes a wire point from the payload of a frame, without the length prefix.
///
/// # Errors
///
/// If the payload is not a valid protobuf-encoded wire point, an error is returned.
pub fn decode_payload(payload: &[u8]) -> Result<WirePoint, CodecError> {
    WirePoint::decode(payload).map_err(|e| CodecError::Malformed { reason: e.to_string() })
}

/// Decodes the wire point in the first length-prefixed frame of `buf`.
///
/// # Errors
///
/// If the frame is truncated or its payload is malformed, an error is returned.
pub fn decode_wire_point(buf: &[u8]) -> Result<WirePoint, CodecError> {
    let (payload, _) = split_frame(buf)?;
    decode_payload(payload)
}

/// Decodes the point in the first length-prefixed frame of `buf`.
///
/// # Errors
///
/// If the frame is truncated, its payload is malformed, or the series key cannot be parsed, an error is returned.
pub fn decode(buf: &[u8]) -> Result<Point, CodecError> {
    decode_wire_point(buf)?.into_point()
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone as _, Utc};
    use proptest::{collection::btree_map, collection::vec as arb_vec, prelude::*};

    use super::*;

    fn sample_point() -> Point {
        Point::new("vehicle", Utc.with_ymd_and_hms(2019, 3, 1, 8, 0, 0).unwrap())
            .with_tag("vin", "LSVNV2182E2100001")
            .with_tag("city", "beijing")
            .with_field("mileage", 1200.25)
            .with_field("speed", 60.0)
    }

    fn arb_name() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9_]{0,11}"
    }

    fn arb_timestamp() -> impl Strategy<Value = DateTime<Utc>> {
        (crate::point::MIN_TIMESTAMP_MILLIS..=crate::point::MAX_TIMESTAMP_MILLIS)
            .prop_map(|millis| Utc.timestamp_millis_opt(millis).unwrap())
    }

    prop_compose! {
        fn arb_point()(
            measurement in arb_name(),
            tags in arb_vec((arb_name(), "[a-zA-Z0-9_.-]{1,16}"), 0..6),
            fields in btree_map(arb_name(), -1.0e12f64..1.0e12f64, 0..8),
            timestamp in arb_timestamp(),
        ) -> Point {
            let mut point = Point::new(measurement, timestamp);
            for (key, value) in tags {
                point = point.with_tag(key, value);
            }
            for (name, value) in fields {
                point = point.with_field(name, value);
            }
            point
        }
    }

    #[test]
    fn basic_roundtrip() {
        let point = sample_point();
        let frame = encode(&point).expect("should encode");
        let decoded = decode(&frame).expect("should decode");
        assert_eq!(decoded, point);
        assert_eq!(decoded.series_key(), "vehicle,vin=LSVNV2182E2100001,city=beijing");
    }

    #[test]
    fn integers_normalized_to_floats() {
        let point = Point::new("m", Utc.with_ymd_and_hms(2019, 3, 1, 8, 0, 0).unwrap()).with_field("count", 7i64);
        let decoded = decode(&encode(&point).unwrap()).unwrap();
        assert_eq!(decoded.fields(), &[("count".to_string(), FieldValue::Float(7.0))]);
    }

    #[test]
    fn unsupported_value_kind_rejected() {
        let point = sample_point().with_field("healthy", FieldValue::Boolean(true));
        assert_eq!(
            encode(&point),
            Err(CodecError::Encode {
                source: EncodeError::UnsupportedFieldValue {
                    field: "healthy".to_string(),
                    kind: "boolean",
                }
            })
        );
    }

    #[test]
    fn series_key_delimiters_rejected() {
        let tagged = |key: &str, value: &str| {
            Point::new("vehicle", Utc.with_ymd_and_hms(2019, 3, 1, 8, 0, 0).unwrap())
                .with_tag(key, value)
                .with_field("speed", 60.0)
        };
        let renamed = Point::new("vehicle,fleet=a", Utc.with_ymd_and_hms(2019, 3, 1, 8, 0, 0).unwrap())
            .with_field("speed", 60.0);

        for point in [tagged("city", "a,b=c"), tagged("ci,ty", "beijing"), tagged("city=x", "beijing"), renamed] {
            assert!(matches!(
                encode(&point),
                Err(CodecError::Encode {
                    source: EncodeError::ReservedCharacter { .. }
                })
            ));
        }
    }

    #[test]
    fn out_of_range_timestamps_rejected() {
        let before = Point::new("m", Utc.with_ymd_and_hms(1999, 12, 31, 0, 0, 0).unwrap()).with_field("v", 1.0);
        let after = Point::new("m", Utc.with_ymd_and_hms(2300, 1, 1, 0, 0, 0).unwrap()).with_field("v", 1.0);

        assert!(matches!(
            encode(&before),
            Err(CodecError::Encode {
                source: EncodeError::InvalidTimestamp { .. }
            })
        ));
        assert!(matches!(
            encode(&after),
            Err(CodecError::Encode {
                source: EncodeError::InvalidTimestamp { .. }
            })
        ));
    }

    #[test]
    fn truncated_frames_fail() {
        let frame = encode(&sample_point()).unwrap();

        // Not even a full length prefix.
        assert_eq!(
            decode(&frame[..5]),
            Err(CodecError::TruncatedFrame { needed: 8, available: 5 })
        );

        // Full prefix, partial payload.
        let payload_len = frame.len() - FRAME_PREFIX_LEN;
        assert_eq!(
            decode(&frame[..frame.len() - 1]),
            Err(CodecError::TruncatedFrame {
                needed: payload_len,
                available: payload_len - 1,
            })
        );
    }

    #[test]
    fn huge_declared_length_fails() {
        let mut buf = u64::MAX.to_le_bytes().to_vec();
        buf.extend_from_slice(b"abc");
        assert!(matches!(split_frame(&buf), Err(CodecError::TruncatedFrame { .. })));
    }

    #[test]
    fn garbage_payload_is_malformed() {
        let mut buf = 3u64.to_le_bytes().to_vec();
        buf.extend_from_slice(&[0xff, 0xff, 0xff]);
        assert!(matches!(decode_wire_point(&buf), Err(CodecError::Malformed { .. })));
    }

    proptest! {
        #[test]
        fn property_test_roundtrip(point in arb_point()) {
            let frame = encode(&point).expect("generated points are always encodable");
            let decoded = decode(&frame).expect("encoded frames are always decodable");
            prop_assert_eq!(decoded, point);
        }

        #[test]
        fn property_test_frame_reads_exact_length(
            payload in arb_vec(any::<u8>(), 0..512),
            trailing in arb_vec(any::<u8>(), 0..64),
        ) {
            let mut buf = (payload.len() as u64).to_le_bytes().to_vec();
            buf.extend_from_slice(&payload);
            buf.extend_from_slice(&trailing);

            let (frame, rest) = split_frame(&buf).expect("frame is complete");
            prop_assert_eq!(frame, &payload[..]);
            prop_assert_eq!(rest, &trailing[..]);

            // Every strict prefix of the frame must fail cleanly.
            let frame_end = FRAME_PREFIX_LEN + payload.len();
            for cut in 0..frame_end {
                let is_truncated = matches!(split_frame(&buf[..cut]), Err(CodecError::TruncatedFrame { .. }));
                prop_assert!(is_truncated);
            }
        }
    }
}
