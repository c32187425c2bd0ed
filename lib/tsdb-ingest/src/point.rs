use std::fmt;

use chrono::{DateTime, Utc};
use snafu::Snafu;

/// Delimiter between the measurement and each tag pair in a series key.
pub const SERIES_KEY_DELIMITER: char = ',';

/// Separator between a tag key and its value in a series key.
pub const KEY_VALUE_SEPARATOR: char = '=';

/// Smallest millisecond timestamp with exactly 13 decimal digits (2001-09-09T01:46:40Z).
pub const MIN_TIMESTAMP_MILLIS: i64 = 1_000_000_000_000;

/// Largest millisecond timestamp with exactly 13 decimal digits (2286-11-20T17:46:39.999Z).
pub const MAX_TIMESTAMP_MILLIS: i64 = 9_999_999_999_999;

/// Point encoding error.
#[derive(Debug, Snafu, PartialEq)]
#[snafu(context(suffix(false)))]
pub enum EncodeError {
    /// The field value is not a numeric kind that the wire format can carry.
    #[snafu(display("field '{}' has unsupported value kind '{}' (only integers and floats are supported)", field, kind))]
    UnsupportedFieldValue { field: String, kind: &'static str },

    /// The timestamp does not serialize to a 13 digit millisecond epoch value.
    #[snafu(display("timestamp {}ms is not exactly 13 digits", millis))]
    InvalidTimestamp { millis: i64 },

    /// A measurement name, tag key, or tag value contains a series key delimiter.
    #[snafu(display(
        "{} '{}' contains a reserved character ('{}' and '{}' delimit the series key)",
        part,
        value,
        SERIES_KEY_DELIMITER,
        KEY_VALUE_SEPARATOR
    ))]
    ReservedCharacter { part: &'static str, value: String },
}

/// A field value.
///
/// Generators can emit any of these kinds, but only integers and floats can be written to the target: both are
/// normalized to a 64-bit float on the wire.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    /// Signed integer.
    Integer(i64),

    /// Floating-point.
    Float(f64),

    /// Boolean.
    Boolean(bool),

    /// Text.
    Text(String),
}

impl FieldValue {
    /// Returns the name of this value's kind.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Integer(_) => "integer",
            Self::Float(_) => "float",
            Self::Boolean(_) => "boolean",
            Self::Text(_) => "text",
        }
    }

    /// Returns the value as a 64-bit float, if it is a supported numeric kind.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Boolean(_) | Self::Text(_) => None,
        }
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

/// A single measurement sample.
///
/// Tags and fields keep the order they were added in. Once built, a point is only read.
#[derive(Clone, Debug, PartialEq)]
pub struct Point {
    measurement: String,
    tags: Vec<(String, String)>,
    fields: Vec<(String, FieldValue)>,
    timestamp: DateTime<Utc>,
}

impl Point {
    /// Creates a new `Point` for the given measurement and timestamp, with no tags or fields.
    pub fn new<M>(measurement: M, timestamp: DateTime<Utc>) -> Self
    where
        M: Into<String>,
    {
        Self {
            measurement: measurement.into(),
            tags: Vec::new(),
            fields: Vec::new(),
            timestamp,
        }
    }

    /// Appends a tag.
    pub fn with_tag<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.tags.push((key.into(), value.into()));
        self
    }

    /// Appends a field.
    pub fn with_field<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<FieldValue>,
    {
        self.fields.push((key.into(), value.into()));
        self
    }

    /// Returns the measurement name.
    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    /// Returns the tags, in order.
    pub fn tags(&self) -> &[(String, String)] {
        &self.tags
    }

    /// Returns the fields, in order.
    pub fn fields(&self) -> &[(String, FieldValue)] {
        &self.fields
    }

    /// Returns the timestamp.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Returns the timestamp as milliseconds since the Unix epoch.
    ///
    /// # Errors
    ///
    /// If the value is not exactly 13 decimal digits long, an error is returned. The target only accepts
    /// millisecond-precision timestamps in that range, so anything shorter or longer means the producer is broken.
    pub fn timestamp_millis(&self) -> Result<i64, EncodeError> {
        let millis = self.timestamp.timestamp_millis();
        if (MIN_TIMESTAMP_MILLIS..=MAX_TIMESTAMP_MILLIS).contains(&millis) {
            Ok(millis)
        } else {
            Err(EncodeError::InvalidTimestamp { millis })
        }
    }

    /// Returns the series key of this point, checking that it can be split back into the same measurement and tags.
    ///
    /// # Errors
    ///
    /// If the measurement name, a tag key, or a tag value contains `,` or `=`, an error is returned.
    pub fn checked_series_key(&self) -> Result<String, EncodeError> {
        ensure_unreserved("measurement", &self.measurement)?;
        for (tag_key, tag_value) in &self.tags {
            ensure_unreserved("tag key", tag_key)?;
            ensure_unreserved("tag value", tag_value)?;
        }
        Ok(self.series_key())
    }

    /// Returns the series key of this point.
    pub fn series_key(&self) -> String {
        let tags_len = self.tags.iter().map(|(k, v)| k.len() + v.len() + 2).sum::<usize>();
        let mut key = String::with_capacity(self.measurement.len() + tags_len);
        key.push_str(&self.measurement);
        for (tag_key, tag_value) in &self.tags {
            key.push(SERIES_KEY_DELIMITER);
            key.push_str(tag_key);
            key.push(KEY_VALUE_SEPARATOR);
            key.push_str(tag_value);
        }
        key
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {}", self.series_key(), self.timestamp.timestamp_millis())
    }
}

fn ensure_unreserved(part: &'static str, value: &str) -> Result<(), EncodeError> {
    if value.contains(&[SERIES_KEY_DELIMITER, KEY_VALUE_SEPARATOR][..]) {
        return Err(EncodeError::ReservedCharacter {
            part,
            value: value.to_string(),
        });
    }
    Ok(())
}

/// Returns the metric name embedded in a series key.
pub fn metric_from_series_key(series_key: &str) -> &str {
    match series_key.split_once(SERIES_KEY_DELIMITER) {
        Some((metric, _)) => metric,
        None => series_key,
    }
}

/// Splits a series key back into its measurement and ordered tag pairs.
///
/// Returns `None` if any tag segment is missing its key/value separator.
pub fn parse_series_key(series_key: &str) -> Option<(String, Vec<(String, String)>)> {
    let mut segments = series_key.split(SERIES_KEY_DELIMITER);
    let measurement = segments.next()?.to_string();

    let mut tags = Vec::new();
    for segment in segments {
        let (key, value) = segment.split_once(KEY_VALUE_SEPARATOR)?;
        tags.push((key.to_string(), value.to_string()));
    }

    Some((measurement, tags))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone as _;

    use super::*;

    fn ts(year: i32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn series_key_layout() {
        let point = Point::new("vehicle", ts(2020))
            .with_tag("vin", "LSVNV2182E2100001")
            .with_tag("model", "k5")
            .with_field("speed", 42.5);

        assert_eq!(point.series_key(), "vehicle,vin=LSVNV2182E2100001,model=k5");
        assert_eq!(metric_from_series_key(&point.series_key()), "vehicle");
    }

    #[test]
    fn series_key_without_tags() {
        let point = Point::new("cpu", ts(2020));
        assert_eq!(point.series_key(), "cpu");
        assert_eq!(metric_from_series_key("cpu"), "cpu");
        assert_eq!(parse_series_key("cpu"), Some(("cpu".to_string(), vec![])));
    }

    #[test]
    fn series_key_parse_rejects_bad_segment() {
        assert_eq!(parse_series_key("cpu,host"), None);
        assert_eq!(
            parse_series_key("cpu,host=a,region=b"),
            Some((
                "cpu".to_string(),
                vec![
                    ("host".to_string(), "a".to_string()),
                    ("region".to_string(), "b".to_string())
                ]
            ))
        );
    }

    #[test]
    fn checked_series_key_rejects_delimiters() {
        let point = Point::new("vehicle", ts(2020)).with_tag("city", "beijing");
        assert_eq!(point.checked_series_key(), Ok("vehicle,city=beijing".to_string()));

        let cases = [
            (Point::new("vehicle,fleet=a", ts(2020)), "measurement", "vehicle,fleet=a"),
            (Point::new("vehicle", ts(2020)).with_tag("ci=ty", "beijing"), "tag key", "ci=ty"),
            (Point::new("vehicle", ts(2020)).with_tag("city", "a,b=c"), "tag value", "a,b=c"),
        ];
        for (point, part, value) in cases {
            assert_eq!(
                point.checked_series_key(),
                Err(EncodeError::ReservedCharacter {
                    part,
                    value: value.to_string(),
                })
            );
        }
    }

    #[test]
    fn timestamp_must_be_13_digits() {
        assert!(Point::new("m", ts(2020)).timestamp_millis().is_ok());

        let too_short = Point::new("m", ts(2000));
        assert!(matches!(
            too_short.timestamp_millis(),
            Err(EncodeError::InvalidTimestamp { .. })
        ));

        let too_long = Point::new("m", ts(2287));
        assert!(matches!(
            too_long.timestamp_millis(),
            Err(EncodeError::InvalidTimestamp { .. })
        ));
    }

    #[test]
    fn timestamp_range_edges() {
        let lower = Utc.timestamp_millis_opt(MIN_TIMESTAMP_MILLIS).unwrap();
        let upper = Utc.timestamp_millis_opt(MAX_TIMESTAMP_MILLIS).unwrap();
        assert_eq!(Point::new("m", lower).timestamp_millis(), Ok(MIN_TIMESTAMP_MILLIS));
        assert_eq!(Point::new("m", upper).timestamp_millis(), Ok(MAX_TIMESTAMP_MILLIS));

        let below = Utc.timestamp_millis_opt(MIN_TIMESTAMP_MILLIS - 1).unwrap();
        assert!(Point::new("m", below).timestamp_millis().is_err());
    }

    #[test]
    fn field_value_kinds() {
        assert_eq!(FieldValue::Integer(3).as_f64(), Some(3.0));
        assert_eq!(FieldValue::Float(1.5).as_f64(), Some(1.5));
        assert_eq!(FieldValue::Boolean(true).as_f64(), None);
        assert_eq!(FieldValue::Text("x".into()).kind(), "text");
    }
}
