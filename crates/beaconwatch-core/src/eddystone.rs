//! Eddystone-UID frame decoding and namespace filtering.
//!
//! Frame layout (service data of UUID `0xFEAA`):
//!
//! | offset | size | field                         |
//! |--------|------|-------------------------------|
//! | 0      | 1    | frame type, `0x00` for UID    |
//! | 1      | 1    | calibrated tx power at 0 m    |
//! | 2      | 10   | namespace                     |
//! | 12     | 6    | instance                      |
//! | 18     | 2    | reserved (optional)           |

use crate::error::{ConfigError, DecodeError};
use crate::mapping::normalize_id;

/// 16-bit service UUID Eddystone frames are advertised under.
pub const EDDYSTONE_SERVICE_UUID: u16 = 0xFEAA;

pub const FRAME_TYPE_UID: u8 = 0x00;
pub const FRAME_TYPE_URL: u8 = 0x10;
pub const FRAME_TYPE_TLM: u8 = 0x20;

const UID_MIN_LEN: usize = 18;

/// A decoded Eddystone-UID frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UidFrame {
    pub tx_power: i8,
    pub namespace: [u8; 10],
    pub instance: [u8; 6],
}

impl UidFrame {
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let frame_type = *data.first().ok_or(DecodeError::TooShort {
            len: 0,
            need: UID_MIN_LEN,
        })?;
        if frame_type != FRAME_TYPE_UID {
            return Err(DecodeError::UnsupportedFrame(frame_type));
        }
        if data.len() < UID_MIN_LEN {
            return Err(DecodeError::TooShort {
                len: data.len(),
                need: UID_MIN_LEN,
            });
        }
        let mut namespace = [0u8; 10];
        namespace.copy_from_slice(&data[2..12]);
        let mut instance = [0u8; 6];
        instance.copy_from_slice(&data[12..18]);
        Ok(Self {
            tx_power: data[1] as i8,
            namespace,
            instance,
        })
    }

    /// Decode from a hex string such as `00e7edd1eb...`.
    pub fn decode_hex(text: &str) -> Result<Self, DecodeError> {
        Self::decode(&decode_hex_bytes(text)?)
    }

    /// Namespace in canonical id form (`0x` + lower-case hex).
    pub fn namespace_id(&self) -> String {
        format!("0x{}", hex::encode(self.namespace))
    }

    /// Instance in canonical id form.
    pub fn instance_id(&self) -> String {
        format!("0x{}", hex::encode(self.instance))
    }
}

/// Accepts only frames from one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceFilter {
    namespace: String,
}

impl NamespaceFilter {
    pub fn new(namespace: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            namespace: normalize_id(namespace)?,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// `candidate` may be in any case, with or without `0x`.
    pub fn matches(&self, candidate: &str) -> bool {
        normalize_id(candidate).is_ok_and(|ns| ns == self.namespace)
    }
}

/// Hex digits to bytes, ignoring an optional `0x` prefix and whitespace.
pub fn decode_hex_bytes(text: &str) -> Result<Vec<u8>, DecodeError> {
    let trimmed = text.trim();
    let digits: String = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed)
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    hex::decode(&digits).map_err(|e| DecodeError::Hex(format!("{e} in `{text}`")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const UID_HEX: &str = "00e7edd1ebeac04e5defa0170000000000a10000";

    #[test]
    fn decodes_uid_frame() {
        let frame = UidFrame::decode_hex(UID_HEX).unwrap();
        assert_eq!(frame.tx_power, -25);
        assert_eq!(frame.namespace_id(), "0xedd1ebeac04e5defa017");
        assert_eq!(frame.instance_id(), "0x0000000000a1");
    }

    #[test]
    fn reserved_bytes_are_optional() {
        let short = &UID_HEX[..36];
        assert!(UidFrame::decode_hex(short).is_ok());
    }

    #[test]
    fn rejects_truncated_frame() {
        let err = UidFrame::decode_hex("00e7edd1eb").unwrap_err();
        assert_eq!(err, DecodeError::TooShort { len: 5, need: 18 });
        assert!(UidFrame::decode(&[]).is_err());
    }

    #[test]
    fn rejects_other_frame_types() {
        let tlm = format!("20{}", &UID_HEX[2..]);
        assert_eq!(
            UidFrame::decode_hex(&tlm).unwrap_err(),
            DecodeError::UnsupportedFrame(FRAME_TYPE_TLM)
        );
    }

    #[test]
    fn hex_input_tolerates_prefix_and_spacing() {
        assert_eq!(
            decode_hex_bytes("0xDEad beef").unwrap(),
            vec![0xde, 0xad, 0xbe, 0xef]
        );
        assert_eq!(decode_hex_bytes(" 00ff\n").unwrap(), vec![0x00, 0xff]);
    }

    #[test]
    fn bad_hex_is_a_decode_error() {
        assert!(matches!(decode_hex_bytes("abc"), Err(DecodeError::Hex(_))));
        assert!(matches!(decode_hex_bytes("zz"), Err(DecodeError::Hex(_))));
        assert!(matches!(
            UidFrame::decode_hex("00e7edd1ebeac04e5defa0170000000000a1zz00"),
            Err(DecodeError::Hex(_))
        ));
    }

    #[test]
    fn namespace_filter_ignores_case_and_prefix() {
        let f = NamespaceFilter::new("0xEDD1EBEAC04E5DEFA017").unwrap();
        assert!(f.matches("edd1ebeac04e5defa017"));
        assert!(f.matches("0xedd1ebeac04e5defa017"));
        assert!(!f.matches("0x00000000000000000000"));
        assert!(!f.matches("not-hex"));
    }
}
