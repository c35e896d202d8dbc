//! Built-in payload decoders
//!
//! Decoding turns a decrypted application payload into the JSON fields of
//! the published telemetry event. The decoder is selected per device by
//! name; an unknown or missing name falls back to the hex decoder so a
//! misconfigured device still produces inspectable telemetry.

use serde_json::{json, Value};
use tracing::warn;

use common::hex;

pub const VALUE_SENSOR: &str = "DecoderValueSensor";
pub const HEX_SENSOR: &str = "DecoderHexSensor";

/// Decode a decrypted payload with the device's configured decoder
pub fn decode(decoder: Option<&str>, payload: &[u8], fport: u8) -> Value {
    match decoder {
        Some(VALUE_SENSOR) => decode_value_sensor(payload, fport),
        Some(HEX_SENSOR) | None => decode_hex_sensor(payload, fport),
        Some(other) => {
            warn!(decoder = other, "unknown payload decoder, falling back to hex");
            decode_hex_sensor(payload, fport)
        },
    }
}

/// Interpret the payload as a UTF-8 number when possible, else as text
fn decode_value_sensor(payload: &[u8], fport: u8) -> Value {
    let text = String::from_utf8_lossy(payload);
    let value = match text.trim().parse::<f64>() {
        Ok(n) if n.is_finite() => json!(n),
        _ => json!(text),
    };
    json!({ "value": value, "port": fport })
}

fn decode_hex_sensor(payload: &[u8], fport: u8) -> Value {
    json!({ "value": hex::encode_upper(payload), "port": fport })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_sensor_parses_numbers() {
        let fields = decode(Some(VALUE_SENSOR), b"23.5", 2);
        assert_eq!(fields["value"], json!(23.5));
        assert_eq!(fields["port"], json!(2));
    }

    #[test]
    fn value_sensor_keeps_text() {
        let fields = decode(Some(VALUE_SENSOR), b"hello", 1);
        assert_eq!(fields["value"], json!("hello"));
    }

    #[test]
    fn hex_sensor_encodes_bytes() {
        let fields = decode(Some(HEX_SENSOR), &[0xDE, 0xAD], 1);
        assert_eq!(fields["value"], json!("DEAD"));
    }

    #[test]
    fn unknown_decoder_falls_back_to_hex() {
        let fields = decode(Some("DecoderDoesNotExist"), &[0x01], 1);
        assert_eq!(fields["value"], json!("01"));
    }
}
