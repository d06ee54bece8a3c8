use chrono::{DateTime, Utc};
use std::fmt::Write as _;

pub const DEFAULT_MEASUREMENT_NAME: &str = "sensor_measurement";

/// Envelope-level metadata shared by every reading decoded from one uplink.
#[derive(Debug, Clone, PartialEq)]
pub struct UplinkContext {
    pub device_name: String,
    pub application_name: String,
    pub frame_count: u64,
    pub port_number: u64,
    pub timestamp: DateTime<Utc>,
}

/// One decoded sensor value before it is bound to its uplink.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub sensor_id: String,
    pub sensor_value: f64,
    pub sensor_type: String,
}

/// A normalized sensor reading, ready to be written as one point.
///
/// Only the normalizer builds these; once built they are read-only and are
/// moved into the sink queue.
#[derive(Debug, PartialEq)]
pub struct Measurement {
    device_name: String,
    application_name: String,
    sensor_type: String,
    sensor_id: String,
    sensor_value: f64,
    frame_count: u64,
    port_number: u64,
    timestamp: DateTime<Utc>,
}

impl Measurement {
    pub(crate) fn from_reading(uplink: &UplinkContext, reading: Reading) -> Self {
        Self {
            device_name: uplink.device_name.clone(),
            application_name: uplink.application_name.clone(),
            sensor_type: reading.sensor_type,
            sensor_id: reading.sensor_id,
            sensor_value: reading.sensor_value,
            frame_count: uplink.frame_count,
            port_number: uplink.port_number,
            timestamp: uplink.timestamp,
        }
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn application_name(&self) -> &str {
        &self.application_name
    }

    pub fn sensor_type(&self) -> &str {
        &self.sensor_type
    }

    pub fn sensor_id(&self) -> &str {
        &self.sensor_id
    }

    pub fn sensor_value(&self) -> f64 {
        self.sensor_value
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn port_number(&self) -> u64 {
        self.port_number
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Appends this measurement as one InfluxDB line-protocol point (no trailing newline).
    pub fn write_line(&self, measurement_name: &str, out: &mut String) {
        push_escaped(out, measurement_name, &[',', ' ']);
        for (key, value) in [
            ("application_name", self.application_name.as_str()),
            ("device_name", self.device_name.as_str()),
            ("sensor_type", self.sensor_type.as_str()),
        ] {
            out.push(',');
            out.push_str(key);
            out.push('=');
            push_escaped(out, value, &[',', '=', ' ']);
        }

        out.push_str(" sensor_id=\"");
        push_escaped(out, &self.sensor_id, &['"', '\\']);
        out.push('"');
        // Write never fails on a String.
        let _ = write!(
            out,
            ",sensor_value={},frame_count={}i,port_number={}i {}",
            self.sensor_value,
            self.frame_count,
            self.port_number,
            self.timestamp.timestamp_nanos_opt().unwrap_or_default()
        );
    }

    pub fn to_line_protocol(&self, measurement_name: &str) -> String {
        let mut line = String::with_capacity(160);
        self.write_line(measurement_name, &mut line);
        line
    }
}

pub fn render_batch(measurement_name: &str, batch: &[Measurement]) -> String {
    let mut body = String::with_capacity(batch.len() * 160);
    for (idx, measurement) in batch.iter().enumerate() {
        if idx > 0 {
            body.push('\n');
        }
        measurement.write_line(measurement_name, &mut body);
    }
    body
}

fn push_escaped(out: &mut String, raw: &str, special: &[char]) {
    for ch in raw.chars() {
        match ch {
            // Line protocol has no escape for line breaks.
            '\n' | '\r' => {
                if special.contains(&' ') {
                    out.push('\\');
                }
                out.push(' ');
            }
            ch if special.contains(&ch) => {
                out.push('\\');
                out.push(ch);
            }
            ch => out.push(ch),
        }
    }
}

#[cfg(test)]
pub(crate) fn sample_measurement(sensor_id: &str, value: f64) -> Measurement {
    use chrono::TimeZone;

    Measurement::from_reading(
        &UplinkContext {
            device_name: "dev-1".to_string(),
            application_name: "app-1".to_string(),
            frame_count: 7,
            port_number: 2,
            timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        },
        Reading {
            sensor_id: sensor_id.to_string(),
            sensor_value: value,
            sensor_type: "temp".to_string(),
        },
    )
}
