//! Turns one raw uplink envelope into zero or more [`Measurement`]s.
//!
//! Accepts the raw The Things Stack uplink object as published on MQTT and the
//! `{ "name", "time", "data" }` event records found in captured event dumps.
//! Nothing here fails: malformed or uninteresting envelopes come back as
//! [`Normalized::Skipped`] with the reason, and the caller decides how to report it.

use crate::telemetry::{Measurement, Reading, UplinkContext};
use chrono::{DateTime, TimeZone, Utc};
use simd_json::prelude::ValueAsScalar;
use simd_json::{BorrowedValue, StaticNode};

pub const UPLINK_FORWARD_EVENT: &str = "as.up.data.forward";
pub const UNKNOWN: &str = "unknown";
pub const DEFAULT_SENSOR_ID: &str = "0";

/// Scalar fields of the flat decoded-payload shape, in emission order. The field
/// name doubles as the sensor type.
const FLAT_FIELDS: [&str; 2] = ["temperature", "humidity"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotAnObject,
    Filtered,
    MissingUplink,
    MissingDecodedPayload,
    NoMeasurements,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::NotAnObject => "not_an_object",
            SkipReason::Filtered => "filtered_event",
            SkipReason::MissingUplink => "missing_uplink",
            SkipReason::MissingDecodedPayload => "missing_decoded_payload",
            SkipReason::NoMeasurements => "no_measurements",
        }
    }

    /// Whether the envelope was broken rather than merely not carrying data.
    pub fn is_error(&self) -> bool {
        matches!(self, SkipReason::NotAnObject)
    }
}

#[derive(Debug)]
pub enum Normalized {
    Measurements(Vec<Measurement>),
    Skipped(SkipReason),
}

impl Normalized {
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn into_measurements(self) -> Vec<Measurement> {
        match self {
            Normalized::Measurements(measurements) => measurements,
            Normalized::Skipped(_) => Vec::new(),
        }
    }
}

pub fn normalize(envelope: &BorrowedValue<'_>, ingested_at: DateTime<Utc>) -> Normalized {
    if !matches!(envelope, BorrowedValue::Object(_)) {
        return Normalized::Skipped(SkipReason::NotAnObject);
    }

    if let Some(name) = present(field(envelope, "name")) {
        if name.as_str() != Some(UPLINK_FORWARD_EVENT) {
            return Normalized::Skipped(SkipReason::Filtered);
        }
    }

    let uplink = match field(envelope, "data") {
        Some(data @ BorrowedValue::Object(_)) => data,
        _ => envelope,
    };

    let Some(uplink_message) = present(field(uplink, "uplink_message")) else {
        return Normalized::Skipped(SkipReason::MissingUplink);
    };
    let Some(decoded) = present(field(uplink_message, "decoded_payload")) else {
        return Normalized::Skipped(SkipReason::MissingDecodedPayload);
    };

    let context = UplinkContext {
        device_name: resolve_name(path(uplink, &["end_device_ids", "device_id"])),
        application_name: resolve_name(path(
            uplink,
            &["end_device_ids", "application_ids", "application_id"],
        )),
        frame_count: coerce_u64(field(uplink_message, "f_cnt")),
        port_number: coerce_u64(field(uplink_message, "f_port")),
        timestamp: resolve_timestamp(
            field(uplink, "received_at"),
            field(envelope, "time"),
            ingested_at,
        ),
    };

    // A `messages` key selects the list shape; the flat scalar shape is only
    // considered when it is absent.
    let readings = match present(field(decoded, "messages")) {
        Some(list) => list_readings(list),
        None => flat_readings(decoded),
    };
    if readings.is_empty() {
        return Normalized::Skipped(SkipReason::NoMeasurements);
    }

    Normalized::Measurements(
        readings
            .into_iter()
            .map(|reading| Measurement::from_reading(&context, reading))
            .collect(),
    )
}

fn list_readings(list: &BorrowedValue<'_>) -> Vec<Reading> {
    let BorrowedValue::Array(records) = list else {
        return Vec::new();
    };
    records
        .iter()
        .map(|record| Reading {
            sensor_id: resolve_sensor_id(field(record, "measurementId")),
            sensor_value: coerce_f64(field(record, "measurementValue")),
            sensor_type: resolve_sensor_type(field(record, "type")),
        })
        .collect()
}

fn flat_readings(decoded: &BorrowedValue<'_>) -> Vec<Reading> {
    let recognized = FLAT_FIELDS
        .iter()
        .any(|name| present(field(decoded, name)).is_some());
    if !recognized {
        return Vec::new();
    }
    // Absent fields still produce a zero reading.
    FLAT_FIELDS
        .iter()
        .map(|name| Reading {
            sensor_id: DEFAULT_SENSOR_ID.to_string(),
            sensor_value: coerce_f64(field(decoded, name)),
            sensor_type: (*name).to_string(),
        })
        .collect()
}

fn field<'v, 'a>(value: &'v BorrowedValue<'a>, key: &str) -> Option<&'v BorrowedValue<'a>> {
    match value {
        BorrowedValue::Object(obj) => obj.get(key),
        _ => None,
    }
}

fn path<'v, 'a>(value: &'v BorrowedValue<'a>, keys: &[&str]) -> Option<&'v BorrowedValue<'a>> {
    keys.iter().try_fold(value, |current, key| field(current, key))
}

/// JSON `null` is treated the same as a missing member.
fn present<'v, 'a>(value: Option<&'v BorrowedValue<'a>>) -> Option<&'v BorrowedValue<'a>> {
    value.filter(|value| !matches!(value, BorrowedValue::Static(StaticNode::Null)))
}

fn scalar_text(value: &BorrowedValue<'_>) -> Option<String> {
    match value {
        BorrowedValue::String(text) => Some(text.to_string()),
        BorrowedValue::Static(StaticNode::I64(v)) => Some(v.to_string()),
        BorrowedValue::Static(StaticNode::U64(v)) => Some(v.to_string()),
        BorrowedValue::Static(StaticNode::F64(v)) if v.is_finite() => Some(v.to_string()),
        BorrowedValue::Static(StaticNode::Bool(v)) => Some(v.to_string()),
        _ => None,
    }
}

fn text_or(value: Option<&BorrowedValue<'_>>, default: &str) -> String {
    value
        .and_then(scalar_text)
        .filter(|text| !text.is_empty())
        .unwrap_or_else(|| default.to_string())
}

pub fn resolve_name(value: Option<&BorrowedValue<'_>>) -> String {
    text_or(value, UNKNOWN)
}

pub fn resolve_sensor_type(value: Option<&BorrowedValue<'_>>) -> String {
    text_or(value, UNKNOWN)
}

/// Sensor ids are always strings, whatever JSON type they arrived as.
pub fn resolve_sensor_id(value: Option<&BorrowedValue<'_>>) -> String {
    text_or(value, DEFAULT_SENSOR_ID)
}

pub fn coerce_f64(value: Option<&BorrowedValue<'_>>) -> f64 {
    let Some(value) = value else {
        return 0.0;
    };
    value
        .as_f64()
        .or_else(|| value.as_i64().map(|v| v as f64))
        .or_else(|| value.as_u64().map(|v| v as f64))
        .or_else(|| value.as_str().and_then(|raw| raw.trim().parse::<f64>().ok()))
        .filter(|v| v.is_finite())
        .unwrap_or(0.0)
}

pub fn coerce_u64(value: Option<&BorrowedValue<'_>>) -> u64 {
    let Some(value) = value else {
        return 0;
    };
    value
        .as_u64()
        .or_else(|| value.as_i64().and_then(|v| u64::try_from(v).ok()))
        .or_else(|| {
            value
                .as_f64()
                .filter(|v| v.is_finite() && *v >= 0.0)
                .map(|v| v as u64)
        })
        .or_else(|| value.as_str().and_then(|raw| raw.trim().parse::<u64>().ok()))
        .unwrap_or(0)
}

/// `received_at`, then the alternate envelope time, then the ingestion time.
pub fn resolve_timestamp(
    received_at: Option<&BorrowedValue<'_>>,
    alternate: Option<&BorrowedValue<'_>>,
    ingested_at: DateTime<Utc>,
) -> DateTime<Utc> {
    [received_at, alternate]
        .into_iter()
        .flatten()
        .find_map(parse_timestamp)
        .unwrap_or(ingested_at)
}

fn parse_timestamp(value: &BorrowedValue<'_>) -> Option<DateTime<Utc>> {
    let parsed = match value {
        BorrowedValue::String(raw) => DateTime::parse_from_rfc3339(raw.trim())
            .ok()
            .map(|ts| ts.with_timezone(&Utc)),
        // Numeric timestamps are epoch milliseconds.
        _ => value
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
    };
    // Points are written with nanosecond precision.
    parsed.filter(|ts| ts.timestamp_nanos_opt().is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ingested_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    fn run(json: &str) -> Normalized {
        let mut bytes = json.as_bytes().to_vec();
        let value = simd_json::to_borrowed_value(&mut bytes).expect("valid json");
        normalize(&value, ingested_at())
    }

    fn with_value<T>(json: &str, f: impl FnOnce(&BorrowedValue<'_>) -> T) -> T {
        let mut bytes = json.as_bytes().to_vec();
        let value = simd_json::to_borrowed_value(&mut bytes).expect("valid json");
        f(&value)
    }

    const LIST_UPLINK: &str = r#"{
        "end_device_ids": {
            "device_id": "estacion-meteorologica",
            "application_ids": {"application_id": "prueba1"}
        },
        "received_at": "2025-01-15T10:20:30.123456789Z",
        "uplink_message": {
            "f_cnt": 42,
            "f_port": 3,
            "decoded_payload": {
                "messages": [
                    {"measurementId": 1, "measurementValue": 22.5, "type": "temp"},
                    {"measurementId": "4097", "measurementValue": 60, "type": "hum"},
                    {"measurementValue": "n/a"}
                ]
            }
        }
    }"#;

    #[test]
    fn list_payload_yields_one_measurement_per_record_in_order() {
        let Normalized::Measurements(measurements) = run(LIST_UPLINK) else {
            panic!("expected measurements");
        };
        assert_eq!(measurements.len(), 3);

        let ids: Vec<&str> = measurements.iter().map(|m| m.sensor_id()).collect();
        assert_eq!(ids, vec!["1", "4097", "0"]);
        let types: Vec<&str> = measurements.iter().map(|m| m.sensor_type()).collect();
        assert_eq!(types, vec!["temp", "hum", "unknown"]);
        let values: Vec<f64> = measurements.iter().map(|m| m.sensor_value()).collect();
        assert_eq!(values, vec![22.5, 60.0, 0.0]);

        let expected_ts = DateTime::parse_from_rfc3339("2025-01-15T10:20:30.123456789Z")
            .unwrap()
            .with_timezone(&Utc);
        for measurement in &measurements {
            assert_eq!(measurement.device_name(), "estacion-meteorologica");
            assert_eq!(measurement.application_name(), "prueba1");
            assert_eq!(measurement.frame_count(), 42);
            assert_eq!(measurement.port_number(), 3);
            assert_eq!(measurement.timestamp(), expected_ts);
        }
    }

    #[test]
    fn wrapped_forward_event_is_unwrapped() {
        let json = r#"{
            "name": "as.up.data.forward",
            "time": "2025-01-15T10:20:31Z",
            "data": {
                "end_device_ids": {"device_id": "dev"},
                "uplink_message": {"decoded_payload": {"messages": [{"measurementId": 7}]}}
            }
        }"#;
        let measurements = run(json).into_measurements();
        assert_eq!(measurements.len(), 1);
        assert_eq!(measurements[0].sensor_id(), "7");
        assert_eq!(measurements[0].device_name(), "dev");
        assert_eq!(measurements[0].application_name(), UNKNOWN);
        assert_eq!(measurements[0].frame_count(), 0);
        assert_eq!(
            measurements[0].timestamp(),
            Utc.with_ymd_and_hms(2025, 1, 15, 10, 20, 31).unwrap()
        );
    }

    #[test]
    fn other_event_types_are_filtered() {
        for name in [r#""as.up.join.forward""#, r#""ns.up.data.receive""#, "17"] {
            let json = format!(
                r#"{{"name": {name}, "data": {{"uplink_message": {{"decoded_payload": {{"messages": [{{"measurementId": 1}}]}}}}}}}}"#
            );
            assert!(matches!(
                run(&json),
                Normalized::Skipped(SkipReason::Filtered)
            ));
        }
    }

    #[test]
    fn missing_sections_are_skipped_not_errors() {
        assert!(matches!(
            run(r#"{"end_device_ids": {"device_id": "d"}}"#),
            Normalized::Skipped(SkipReason::MissingUplink)
        ));
        assert!(matches!(
            run(r#"{"uplink_message": {"f_cnt": 1}}"#),
            Normalized::Skipped(SkipReason::MissingDecodedPayload)
        ));
        assert!(matches!(
            run(r#"{"uplink_message": {"decoded_payload": null}}"#),
            Normalized::Skipped(SkipReason::MissingDecodedPayload)
        ));
        assert!(matches!(run("[1, 2]"), Normalized::Skipped(SkipReason::NotAnObject)));
        assert!(run("42").into_measurements().is_empty());
    }

    #[test]
    fn empty_or_non_array_list_has_no_measurements() {
        for decoded in [r#"{"messages": []}"#, r#"{"messages": {"a": 1}}"#, r#"{"battery": 3.1}"#] {
            let json = format!(r#"{{"uplink_message": {{"decoded_payload": {decoded}}}}}"#);
            assert!(matches!(
                run(&json),
                Normalized::Skipped(SkipReason::NoMeasurements)
            ));
        }
    }

    #[test]
    fn flat_payload_emits_every_recognized_field_with_zero_default() {
        let json = r#"{"uplink_message": {"decoded_payload": {"temperature": 21.3}}}"#;
        let measurements = run(json).into_measurements();
        assert_eq!(measurements.len(), 2);
        assert_eq!(measurements[0].sensor_type(), "temperature");
        assert_eq!(measurements[0].sensor_value(), 21.3);
        assert_eq!(measurements[1].sensor_type(), "humidity");
        assert_eq!(measurements[1].sensor_value(), 0.0);
        assert_eq!(measurements[1].timestamp(), ingested_at());
    }

    #[test]
    fn list_shape_wins_over_flat_fields() {
        let json = r#"{"uplink_message": {"decoded_payload": {
            "temperature": 1, "humidity": 2,
            "messages": [{"measurementId": 9, "measurementValue": 3, "type": "co2"}]
        }}}"#;
        let measurements = run(json).into_measurements();
        assert_eq!(measurements.len(), 1);
        assert_eq!(measurements[0].sensor_type(), "co2");
    }

    #[test]
    fn sensor_id_is_always_text() {
        with_value(r#"[7, 7.0, 7.5, "abc", "", true, null, {"x": 1}]"#, |value| {
            let BorrowedValue::Array(items) = value else {
                panic!("array");
            };
            let ids: Vec<String> = items.iter().map(|v| resolve_sensor_id(Some(v))).collect();
            assert_eq!(ids, vec!["7", "7", "7.5", "abc", "0", "true", "0", "0"]);
        });
        assert_eq!(resolve_sensor_id(None), "0");
    }

    #[test]
    fn numeric_coercion_falls_back_to_zero() {
        with_value(r#"[3, -2, 2.5, "4.25", "x", null, [], -1.5]"#, |value| {
            let BorrowedValue::Array(items) = value else {
                panic!("array");
            };
            let floats: Vec<f64> = items.iter().map(|v| coerce_f64(Some(v))).collect();
            assert_eq!(floats[..7], [3.0, -2.0, 2.5, 4.25, 0.0, 0.0, 0.0]);
            let counters: Vec<u64> = items.iter().map(|v| coerce_u64(Some(v))).collect();
            assert_eq!(counters[..8], [3, 0, 2, 0, 0, 0, 0, 0]);
        });
        assert_eq!(coerce_f64(None), 0.0);
        assert_eq!(coerce_u64(None), 0);
    }

    #[test]
    fn timestamp_prefers_received_at_then_alternate_then_now() {
        with_value(
            r#"{"good": "2024-06-01T00:00:00Z", "bad": "yesterday", "ms": 1700000000000}"#,
            |value| {
                let good = field(value, "good");
                let bad = field(value, "bad");
                let ms = field(value, "ms");
                let expected = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();

                assert_eq!(resolve_timestamp(good, ms, ingested_at()), expected);
                assert_eq!(resolve_timestamp(bad, good, ingested_at()), expected);
                assert_eq!(
                    resolve_timestamp(None, ms, ingested_at()),
                    Utc.timestamp_millis_opt(1_700_000_000_000).unwrap()
                );
                assert_eq!(resolve_timestamp(bad, None, ingested_at()), ingested_at());
                assert_eq!(resolve_timestamp(None, None, ingested_at()), ingested_at());
            },
        );
    }

    #[test]
    fn empty_names_resolve_to_unknown() {
        let json = r#"{
            "end_device_ids": {"device_id": "", "application_ids": {"application_id": 12}},
            "uplink_message": {"f_cnt": -4, "f_port": "2", "decoded_payload": {"humidity": 55}}
        }"#;
        let measurements = run(json).into_measurements();
        assert_eq!(measurements[0].device_name(), UNKNOWN);
        assert_eq!(measurements[0].application_name(), "12");
        assert_eq!(measurements[0].frame_count(), 0);
        assert_eq!(measurements[0].port_number(), 2);
    }
}
