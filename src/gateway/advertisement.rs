//! Advertisement data decoding.
//!
//! Turns the raw (type-code, value-bytes) fragments collected during a
//! scan pass into the wire shape of the scan response: a map keyed by the
//! decimal type code, each entry carrying the rendered value and a
//! human-readable description of the data type.
//!
//! Decoding is best-effort and never fails: a fragment that cannot be
//! interpreted is emitted with its raw hex value so a malformed
//! advertisement can never abort the enclosing scan.

use crate::domain::models::AdTypeField;
use std::collections::BTreeMap;

// GAP advertising data types, per the Bluetooth assigned numbers.
const AD_FLAGS: u8 = 0x01;
const AD_INCOMPLETE_16B_SERVICES: u8 = 0x02;
const AD_COMPLETE_16B_SERVICES: u8 = 0x03;
const AD_INCOMPLETE_32B_SERVICES: u8 = 0x04;
const AD_COMPLETE_32B_SERVICES: u8 = 0x05;
const AD_INCOMPLETE_128B_SERVICES: u8 = 0x06;
const AD_COMPLETE_128B_SERVICES: u8 = 0x07;
const AD_SHORT_LOCAL_NAME: u8 = 0x08;
const AD_COMPLETE_LOCAL_NAME: u8 = 0x09;
const AD_TX_POWER: u8 = 0x0A;
const AD_APPEARANCE: u8 = 0x19;
const AD_16B_SERVICE_DATA: u8 = 0x16;
const AD_32B_SERVICE_DATA: u8 = 0x20;
const AD_128B_SERVICE_DATA: u8 = 0x21;
const AD_MANUFACTURER: u8 = 0xFF;

pub fn description_of(adtype: u8) -> Option<&'static str> {
    match adtype {
        AD_FLAGS => Some("Flags"),
        AD_INCOMPLETE_16B_SERVICES => Some("Incomplete 16b Services"),
        AD_COMPLETE_16B_SERVICES => Some("Complete 16b Services"),
        AD_INCOMPLETE_32B_SERVICES => Some("Incomplete 32b Services"),
        AD_COMPLETE_32B_SERVICES => Some("Complete 32b Services"),
        AD_INCOMPLETE_128B_SERVICES => Some("Incomplete 128b Services"),
        AD_COMPLETE_128B_SERVICES => Some("Complete 128b Services"),
        AD_SHORT_LOCAL_NAME => Some("Short Local Name"),
        AD_COMPLETE_LOCAL_NAME => Some("Complete Local Name"),
        AD_TX_POWER => Some("Tx Power"),
        AD_APPEARANCE => Some("Appearance"),
        AD_16B_SERVICE_DATA => Some("16b Service Data"),
        AD_32B_SERVICE_DATA => Some("32b Service Data"),
        AD_128B_SERVICE_DATA => Some("128b Service Data"),
        AD_MANUFACTURER => Some("Manufacturer"),
        _ => None,
    }
}

/// Decode one advertisement fragment. Never fails.
pub fn decode_fragment(adtype: u8, value: &[u8]) -> AdTypeField {
    if value.is_empty() {
        return AdTypeField {
            value: String::new(),
            description: "Unparsed".to_string(),
        };
    }

    let description = description_of(adtype);
    match adtype {
        // Name and manufacturer payloads carry text in practice; fall back
        // to hex when the bytes aren't printable.
        AD_SHORT_LOCAL_NAME | AD_COMPLETE_LOCAL_NAME | AD_MANUFACTURER => AdTypeField {
            value: render_text_or_hex(value),
            description: description.unwrap_or("Unknown").to_string(),
        },
        AD_INCOMPLETE_16B_SERVICES | AD_COMPLETE_16B_SERVICES => decode_uuid_list(adtype, value, 2),
        AD_INCOMPLETE_32B_SERVICES | AD_COMPLETE_32B_SERVICES => decode_uuid_list(adtype, value, 4),
        AD_INCOMPLETE_128B_SERVICES | AD_COMPLETE_128B_SERVICES => {
            decode_uuid_list(adtype, value, 16)
        }
        _ => AdTypeField {
            value: hex_upper(value),
            description: description.unwrap_or("Unknown").to_string(),
        },
    }
}

/// Decode an ordered fragment sequence for one advertising address into
/// the scan-response mapping. Keys are the decimal type code; the first
/// occurrence of a type wins.
pub fn parse_fragments(fragments: &[(u8, Vec<u8>)]) -> BTreeMap<String, AdTypeField> {
    let mut decoded = BTreeMap::new();
    for (adtype, value) in fragments {
        decoded
            .entry(adtype.to_string())
            .or_insert_with(|| decode_fragment(*adtype, value));
    }
    decoded
}

fn decode_uuid_list(adtype: u8, value: &[u8], width: usize) -> AdTypeField {
    if value.len() % width != 0 {
        return AdTypeField {
            value: hex_upper(value),
            description: "Unparsed".to_string(),
        };
    }
    let uuids: Vec<String> = value
        .chunks(width)
        .map(|chunk| {
            // UUIDs are little-endian on the air
            let be: Vec<u8> = chunk.iter().rev().copied().collect();
            hex_upper(&be)
        })
        .collect();
    AdTypeField {
        value: uuids.join(","),
        description: description_of(adtype).unwrap_or("Unknown").to_string(),
    }
}

fn render_text_or_hex(value: &[u8]) -> String {
    match std::str::from_utf8(value) {
        Ok(text) if text.chars().all(|c| !c.is_control()) => text.to_string(),
        _ => hex_upper(value),
    }
}

fn hex_upper(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_local_name_as_text() {
        let field = decode_fragment(0x09, b"sensor-eu-01");
        assert_eq!(field.value, "sensor-eu-01");
        assert_eq!(field.description, "Complete Local Name");
    }

    #[test]
    fn local_name_falls_back_to_hex() {
        let field = decode_fragment(0x09, &[0xFF, 0xFE, 0x00]);
        assert_eq!(field.value, "FFFE00");
        assert_eq!(field.description, "Complete Local Name");
    }

    #[test]
    fn decodes_manufacturer_text() {
        let field = decode_fragment(0xFF, b"DOF-Assembly");
        assert_eq!(field.value, "DOF-Assembly");
        assert_eq!(field.description, "Manufacturer");
    }

    #[test]
    fn decodes_flags_as_hex() {
        let field = decode_fragment(0x01, &[0x06]);
        assert_eq!(field.value, "06");
        assert_eq!(field.description, "Flags");
    }

    #[test]
    fn unknown_type_code() {
        let field = decode_fragment(0x77, &[0xAB, 0xCD]);
        assert_eq!(field.value, "ABCD");
        assert_eq!(field.description, "Unknown");
    }

    #[test]
    fn decodes_16b_service_list() {
        // 0x180F (battery) on the air as LE
        let field = decode_fragment(0x03, &[0x0F, 0x18]);
        assert_eq!(field.value, "180F");
        assert_eq!(field.description, "Complete 16b Services");
    }

    #[test]
    fn truncated_service_list_is_unparsed() {
        let field = decode_fragment(0x03, &[0x0F, 0x18, 0x0A]);
        assert_eq!(field.value, "0F180A");
        assert_eq!(field.description, "Unparsed");
    }

    #[test]
    fn empty_fragment_is_unparsed() {
        let field = decode_fragment(0x01, &[]);
        assert_eq!(field.value, "");
        assert_eq!(field.description, "Unparsed");
    }

    #[test]
    fn fragment_sequence_first_occurrence_wins() {
        let fragments = vec![
            (0x09u8, b"first".to_vec()),
            (0x01u8, vec![0x06]),
            (0x09u8, b"second".to_vec()),
        ];
        let decoded = parse_fragments(&fragments);
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded["9"].value, "first");
        assert_eq!(decoded["1"].value, "06");
    }

    #[test]
    fn keys_are_decimal_type_codes() {
        let decoded = parse_fragments(&[(0xFFu8, b"x".to_vec())]);
        assert!(decoded.contains_key("255"));
    }
}
