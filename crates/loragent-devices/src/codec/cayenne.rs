//! CayenneLPP payload decoder.
//!
//! A payload is a sequence of `channel (1 byte) | type (1 byte) | data`
//! records. The type selects a fixed-width big-endian field and a divisor.
//! Each record becomes one attribute named `<measurement>_<channel>`, so two
//! temperature sensors on channels 1 and 3 decode to `temperature_1` and
//! `temperature_3`.

use loragent_core::malformed_err;
use loragent_core::model::{attr_types, DecodedAttribute};
use loragent_core::Result;
use serde_json::json;

/// Value layout of a record type.
#[derive(Debug, Clone, Copy)]
enum Layout {
    /// One unsigned/signed integer of `size` bytes divided by `divisor`.
    Scalar { signed: bool, divisor: f64 },
    /// Three signed 16-bit axes, each divided by `divisor`.
    Axes { divisor: f64 },
    /// Latitude, longitude (signed 24-bit, 1e-4 deg) and altitude (signed 24-bit, 0.01 m).
    Gps,
}

#[derive(Debug, Clone, Copy)]
struct RecordType {
    tag: u8,
    name: &'static str,
    size: usize,
    layout: Layout,
}

const RECORD_TYPES: &[RecordType] = &[
    RecordType {
        tag: 0,
        name: "digital_input",
        size: 1,
        layout: Layout::Scalar { signed: false, divisor: 1.0 },
    },
    RecordType {
        tag: 1,
        name: "digital_output",
        size: 1,
        layout: Layout::Scalar { signed: false, divisor: 1.0 },
    },
    RecordType {
        tag: 2,
        name: "analog_input",
        size: 2,
        layout: Layout::Scalar { signed: true, divisor: 100.0 },
    },
    RecordType {
        tag: 3,
        name: "analog_output",
        size: 2,
        layout: Layout::Scalar { signed: true, divisor: 100.0 },
    },
    RecordType {
        tag: 101,
        name: "luminosity",
        size: 2,
        layout: Layout::Scalar { signed: false, divisor: 1.0 },
    },
    RecordType {
        tag: 102,
        name: "presence",
        size: 1,
        layout: Layout::Scalar { signed: false, divisor: 1.0 },
    },
    RecordType {
        tag: 103,
        name: "temperature",
        size: 2,
        layout: Layout::Scalar { signed: true, divisor: 10.0 },
    },
    RecordType {
        tag: 104,
        name: "relative_humidity",
        size: 1,
        layout: Layout::Scalar { signed: false, divisor: 2.0 },
    },
    RecordType {
        tag: 113,
        name: "accelerometer",
        size: 6,
        layout: Layout::Axes { divisor: 1000.0 },
    },
    RecordType {
        tag: 115,
        name: "barometric_pressure",
        size: 2,
        layout: Layout::Scalar { signed: false, divisor: 10.0 },
    },
    RecordType {
        tag: 134,
        name: "gyrometer",
        size: 6,
        layout: Layout::Axes { divisor: 100.0 },
    },
    RecordType {
        tag: 136,
        name: "gps",
        size: 9,
        layout: Layout::Gps,
    },
];

fn lookup(tag: u8) -> Option<&'static RecordType> {
    RECORD_TYPES.iter().find(|t| t.tag == tag)
}

fn read_unsigned(data: &[u8]) -> i64 {
    data.iter().fold(0i64, |acc, b| (acc << 8) | i64::from(*b))
}

/// Big-endian two's complement of arbitrary width (up to 7 bytes).
fn read_signed(data: &[u8]) -> i64 {
    let raw = read_unsigned(data);
    let bits = data.len() * 8;
    let sign = 1i64 << (bits - 1);
    if raw & sign != 0 {
        raw - (1i64 << bits)
    } else {
        raw
    }
}

fn record_value(ty: &RecordType, data: &[u8]) -> (serde_json::Value, &'static str) {
    match ty.layout {
        Layout::Scalar { signed, divisor } => {
            let raw = if signed {
                read_signed(data)
            } else {
                read_unsigned(data)
            };
            (json!(raw as f64 / divisor), attr_types::NUMBER)
        }
        Layout::Axes { divisor } => {
            let x = read_signed(&data[0..2]) as f64 / divisor;
            let y = read_signed(&data[2..4]) as f64 / divisor;
            let z = read_signed(&data[4..6]) as f64 / divisor;
            (json!({ "x": x, "y": y, "z": z }), attr_types::STRUCTURED_VALUE)
        }
        Layout::Gps => {
            let latitude = read_signed(&data[0..3]) as f64 / 10_000.0;
            let longitude = read_signed(&data[3..6]) as f64 / 10_000.0;
            let altitude = read_signed(&data[6..9]) as f64 / 100.0;
            (
                json!({ "latitude": latitude, "longitude": longitude, "altitude": altitude }),
                attr_types::STRUCTURED_VALUE,
            )
        }
    }
}

/// Decode a CayenneLPP payload.
///
/// Truncated records and unknown type tags reject the whole payload.
pub fn decode(payload: &[u8]) -> Result<Vec<DecodedAttribute>> {
    if payload.is_empty() {
        return Err(malformed_err!("empty CayenneLPP payload"));
    }

    let mut attributes = Vec::new();
    let mut offset = 0;
    while offset < payload.len() {
        let Some(header) = payload.get(offset..offset + 2) else {
            return Err(malformed_err!(
                "truncated CayenneLPP record header at offset {}",
                offset
            ));
        };
        let (channel, tag) = (header[0], header[1]);
        let ty = lookup(tag).ok_or_else(|| {
            malformed_err!(
                "unknown CayenneLPP type {} on channel {} at offset {}",
                tag,
                channel,
                offset
            )
        })?;
        offset += 2;

        let Some(data) = payload.get(offset..offset + ty.size) else {
            return Err(malformed_err!(
                "truncated CayenneLPP {} record on channel {}: need {} bytes, have {}",
                ty.name,
                channel,
                ty.size,
                payload.len() - offset
            ));
        };
        offset += ty.size;

        let (value, attr_type) = record_value(ty, data);
        attributes.push(DecodedAttribute::new(
            format!("{}_{}", ty.name, channel),
            attr_type,
            value,
        ));
    }
    Ok(attributes)
}
