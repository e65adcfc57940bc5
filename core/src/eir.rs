/// Advertisement (EIR) payload parsing
///
/// The payload is a sequence of `| len | type | data (len - 1 bytes) |`
/// structures. Parsing never fails: a zero length ends the payload, a
/// structure running past the end is dropped, and malformed fields are skipped
/// with a warning. Each field of [`Advertisement`] is `Some` only when the
/// payload actually carried it.

use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;
use uuid::Uuid;

/// Maximum device name length in bytes
pub const MAX_NAME_LEN: usize = 248;

/// Bluetooth base UUID, 0000xxxx-0000-1000-8000-00805F9B34FB
const BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5F9B_34FB;

const UUID16_SIZE: usize = 2;
const UUID32_SIZE: usize = 4;
const UUID128_SIZE: usize = 16;

// AD types from the Supplement to the Core Specification
const EIR_FLAGS: u8 = 0x01;
const EIR_UUID16_INCOMPLETE: u8 = 0x02;
const EIR_UUID16_COMPLETE: u8 = 0x03;
const EIR_UUID32_INCOMPLETE: u8 = 0x04;
const EIR_UUID32_COMPLETE: u8 = 0x05;
const EIR_UUID128_INCOMPLETE: u8 = 0x06;
const EIR_UUID128_COMPLETE: u8 = 0x07;
const EIR_NAME_SHORT: u8 = 0x08;
const EIR_NAME_COMPLETE: u8 = 0x09;
const EIR_TX_POWER: u8 = 0x0a;
const EIR_CLASS_OF_DEV: u8 = 0x0d;
const EIR_SVC_DATA16: u8 = 0x16;
const EIR_GAP_APPEARANCE: u8 = 0x19;
const EIR_SVC_DATA32: u8 = 0x20;
const EIR_SVC_DATA128: u8 = 0x21;
const EIR_MANUFACTURER_DATA: u8 = 0xff;

/// Fields extracted from one advertisement
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Advertisement {
    pub flags: Option<Vec<u8>>,
    pub name: Option<String>,
    pub tx_power: Option<i16>,
    pub class: Option<u32>,
    pub appearance: Option<u16>,
    pub service_uuids: BTreeSet<Uuid>,
    pub service_data: BTreeMap<Uuid, Vec<u8>>,
    pub manufacturer_data: Option<(u16, Vec<u8>)>,
}

impl Advertisement {
    /// Parse a raw payload
    pub fn parse(eir: &[u8]) -> Self {
        let mut adv = Advertisement::default();
        let mut pos = 0usize;

        while pos + 1 < eir.len() {
            let field_len = eir[pos] as usize;

            // End of EIR
            if field_len == 0 {
                break;
            }

            // Truncated structure
            if pos + field_len >= eir.len() {
                break;
            }

            let eir_type = eir[pos + 1];
            let data = &eir[pos + 2..pos + 1 + field_len];

            match eir_type {
                EIR_FLAGS => {
                    // Only the first octet is defined; zero-length flags are
                    // ignored.
                    if let Some(first) = data.first() {
                        adv.flags = Some(vec![*first]);
                    }
                }
                EIR_UUID16_INCOMPLETE | EIR_UUID16_COMPLETE => {
                    parse_service_uuids(&mut adv.service_uuids, UUID16_SIZE, data)
                }
                EIR_UUID32_INCOMPLETE | EIR_UUID32_COMPLETE => {
                    parse_service_uuids(&mut adv.service_uuids, UUID32_SIZE, data)
                }
                EIR_UUID128_INCOMPLETE | EIR_UUID128_COMPLETE => {
                    parse_service_uuids(&mut adv.service_uuids, UUID128_SIZE, data)
                }
                EIR_NAME_SHORT | EIR_NAME_COMPLETE => adv.name = Some(parse_name(data)),
                EIR_TX_POWER => {
                    if data.len() == 1 {
                        adv.tx_power = Some(data[0] as i8 as i16);
                    }
                }
                EIR_CLASS_OF_DEV => {
                    if data.len() == 3 {
                        adv.class =
                            Some(u32::from_le_bytes([data[0], data[1], data[2], 0]));
                    }
                }
                EIR_SVC_DATA16 => parse_service_data(&mut adv.service_data, UUID16_SIZE, data),
                EIR_SVC_DATA32 => parse_service_data(&mut adv.service_data, UUID32_SIZE, data),
                EIR_SVC_DATA128 => {
                    parse_service_data(&mut adv.service_data, UUID128_SIZE, data)
                }
                EIR_GAP_APPEARANCE => {
                    if data.len() == 2 {
                        adv.appearance = Some(u16::from_le_bytes([data[0], data[1]]));
                    }
                }
                EIR_MANUFACTURER_DATA => {
                    if data.len() >= 2 {
                        adv.manufacturer_data = Some((
                            u16::from_le_bytes([data[0], data[1]]),
                            data[2..].to_vec(),
                        ));
                    }
                }
                _ => {}
            }

            pos += field_len + 1;
        }

        adv
    }
}

/// Build a UUID from its little-endian over-the-air form (2, 4 or 16 bytes)
pub fn uuid_from_le_bytes(bytes: &[u8]) -> Option<Uuid> {
    match bytes.len() {
        UUID16_SIZE => {
            let short = u16::from_le_bytes([bytes[0], bytes[1]]) as u128;
            Some(Uuid::from_u128(BASE_UUID | (short << 96)))
        }
        UUID32_SIZE => {
            let short = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as u128;
            Some(Uuid::from_u128(BASE_UUID | (short << 96)))
        }
        UUID128_SIZE => {
            let mut be = [0u8; UUID128_SIZE];
            for (i, b) in bytes.iter().rev().enumerate() {
                be[i] = *b;
            }
            Some(Uuid::from_bytes(be))
        }
        _ => None,
    }
}

fn parse_service_uuids(uuids: &mut BTreeSet<Uuid>, uuid_size: usize, data: &[u8]) {
    if data.is_empty() || data.len() % uuid_size != 0 {
        warn!("Failed to parse EIR service UUIDs");
        return;
    }

    for chunk in data.chunks(uuid_size) {
        if let Some(uuid) = uuid_from_le_bytes(chunk) {
            uuids.insert(uuid);
        }
    }
}

fn parse_service_data(service_data: &mut BTreeMap<Uuid, Vec<u8>>, uuid_size: usize, data: &[u8]) {
    if data.len() <= uuid_size {
        warn!("Failed to parse EIR service data");
        return;
    }

    // {<UUID bytes LE>, <data bytes LE>}; the payload is exposed in
    // transmission-reversed order like the UUID.
    if let Some(uuid) = uuid_from_le_bytes(&data[..uuid_size]) {
        let payload: Vec<u8> = data[uuid_size..].iter().rev().copied().collect();
        service_data.insert(uuid, payload);
    }
}

fn parse_name(data: &[u8]) -> String {
    // Some devices send a trailing NUL.
    let end = data
        .iter()
        .position(|b| *b == 0)
        .unwrap_or(data.len())
        .min(MAX_NAME_LEN);

    data[..end]
        .iter()
        .map(|b| if b.is_ascii() { *b as char } else { ' ' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uuid16(short: u16) -> Uuid {
        Uuid::from_u128(BASE_UUID | ((short as u128) << 96))
    }

    #[test]
    fn test_parse_full_advertisement() {
        let eir = vec![
            // Flags
            0x02, 0x01, 0x06,
            // Complete 16-bit UUIDs: 0x1812, 0x180F
            0x05, 0x03, 0x12, 0x18, 0x0F, 0x18,
            // Complete name "Kbd" with trailing NUL
            0x05, 0x09, b'K', b'b', b'd', 0x00,
            // TX power -8
            0x02, 0x0a, 0xf8,
            // Class of device 0x002540
            0x04, 0x0d, 0x40, 0x25, 0x00,
            // Appearance 0x03c1 (keyboard)
            0x03, 0x19, 0xc1, 0x03,
            // Service data for 0x180F: 0x11 0x22
            0x05, 0x16, 0x0F, 0x18, 0x22, 0x11,
            // Manufacturer 0x004C with 0x01 0x02
            0x05, 0xff, 0x4c, 0x00, 0x01, 0x02,
        ];

        let adv = Advertisement::parse(&eir);
        assert_eq!(adv.flags, Some(vec![0x06]));
        assert_eq!(adv.name.as_deref(), Some("Kbd"));
        assert_eq!(adv.tx_power, Some(-8));
        assert_eq!(adv.class, Some(0x002540));
        assert_eq!(adv.appearance, Some(0x03c1));
        assert!(adv.service_uuids.contains(&uuid16(0x1812)));
        assert!(adv.service_uuids.contains(&uuid16(0x180F)));
        assert_eq!(adv.service_data.get(&uuid16(0x180F)), Some(&vec![0x11, 0x22]));
        assert_eq!(adv.manufacturer_data, Some((0x004c, vec![0x01, 0x02])));
    }

    #[test]
    fn test_uuid16_canonical_form() {
        let uuid = uuid_from_le_bytes(&[0x0F, 0x18]).expect("16-bit uuid");
        assert_eq!(uuid.to_string(), "0000180f-0000-1000-8000-00805f9b34fb");
    }

    #[test]
    fn test_uuid128_reversed() {
        let le: Vec<u8> = (0u8..16).collect();
        let uuid = uuid_from_le_bytes(&le).expect("128-bit uuid");
        assert_eq!(uuid.to_string(), "0f0e0d0c-0b0a-0908-0706-050403020100");
    }

    #[test]
    fn test_truncated_field_is_dropped() {
        // Name claims 10 bytes but only 3 follow.
        let eir = vec![0x02, 0x01, 0x05, 0x0a, 0x09, b'a', b'b'];
        let adv = Advertisement::parse(&eir);
        assert_eq!(adv.flags, Some(vec![0x05]));
        assert_eq!(adv.name, None);
    }

    #[test]
    fn test_zero_length_ends_payload() {
        let eir = vec![0x00, 0x02, 0x01, 0x06];
        assert_eq!(Advertisement::parse(&eir), Advertisement::default());
    }

    #[test]
    fn test_malformed_uuid_list_skipped() {
        let eir = vec![0x04, 0x03, 0x12, 0x18, 0x0F];
        let adv = Advertisement::parse(&eir);
        assert!(adv.service_uuids.is_empty());
    }

    #[test]
    fn test_zero_length_flags_ignored() {
        let eir = vec![0x01, 0x01, 0x02, 0x0a, 0x00];
        let adv = Advertisement::parse(&eir);
        assert_eq!(adv.flags, None);
        assert_eq!(adv.tx_power, Some(0));
    }

    #[test]
    fn test_non_ascii_name_replaced() {
        let eir = vec![0x04, 0x09, b'a', 0xc3, b'b'];
        let adv = Advertisement::parse(&eir);
        assert_eq!(adv.name.as_deref(), Some("a b"));
    }
}
