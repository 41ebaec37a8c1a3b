//! Advertisement payload decoding.
//!
//! Ranging tags broadcast their state inside the manufacturer-specific
//! record of a standard length-type-value (LTV) advertisement. The decoder
//! first splits the raw bytes into LTV records, then matches the vendor
//! signature, and finally walks the ranging/color sub-records of the matched
//! payload. Anything foreign or truncated is routine radio noise and yields
//! `None` rather than an error.

use std::collections::HashMap;

use crate::domain::ShortAddr;

/// LTV type carrying manufacturer-specific data.
pub const LTV_TYPE_MANUFACTURER: u8 = 0xff;

/// Vendor + protocol signature expected at the start of the payload.
pub const VENDOR_SIGNATURE: [u8; 4] = [0x77, 0x00, 0x0c, 0x00];

/// Flags bit marking the transmitter as an anchor.
const FLAG_ANCHOR: u8 = 0x02;

/// Sentinel distance meaning "no valid measurement".
pub const INVALID_RANGE_CM: u16 = 65535;

/// Byte offset of the flags field in a matched payload.
const FLAGS_OFFSET: usize = 6;
/// Byte range of the 8-byte long hardware address.
const LONG_ADDR_RANGE: std::ops::Range<usize> = 8..16;
/// Byte offset where sub-records begin.
const RECORDS_OFFSET: usize = 20;

/// Sub-record type for a ranging result.
const RECORD_RANGING: u8 = 0;
/// Sub-record type for the indicator LED color.
const RECORD_COLOR: u8 = 10;

/// One decoded (neighbor, raw distance) measurement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeSample {
    /// Short address of the neighbor the distance was measured against.
    pub neighbor: ShortAddr,
    /// Raw distance in centimeters.
    pub distance_cm: u16,
}

/// Indicator color carried by a color sub-record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct Rgb {
    /// Red channel.
    pub r: u8,
    /// Green channel.
    pub g: u8,
    /// Blue channel.
    pub b: u8,
}

/// Everything extracted from one advertisement we recognize.
#[derive(Debug, Clone)]
pub struct DecodedAdvertisement {
    /// 8-byte long hardware address.
    pub long_addr: [u8; 8],
    /// Short address derived from the last two bytes of the long address.
    pub short_addr: ShortAddr,
    /// True when the flags mark the transmitter as an anchor.
    pub is_anchor: bool,
    /// Valid ranging samples, sentinel readings already dropped.
    pub ranges: Vec<RangeSample>,
    /// Indicator color, if the advertisement carried one.
    pub color: Option<Rgb>,
}

/// Split raw advertisement bytes into LTV records.
///
/// Each record is a 1-byte length `L`, a 1-byte type, and `L - 1` value
/// bytes. A zero length terminates parsing; a record extending past the end
/// of the input is dropped along with everything after it.
pub fn parse_ltvs(data: &[u8]) -> HashMap<u8, Vec<Vec<u8>>> {
    let mut map: HashMap<u8, Vec<Vec<u8>>> = HashMap::new();
    let mut i = 0usize;
    while i < data.len() {
        let len = data[i] as usize;
        if len == 0 {
            break;
        }
        let Some(&ltv_type) = data.get(i + 1) else { break };
        let end = i + 1 + len;
        let Some(value) = data.get(i + 2..end) else { break };
        map.entry(ltv_type).or_default().push(value.to_vec());
        i = end;
    }
    map
}

/// Decoder for the vendor ranging protocol.
#[derive(Debug, Clone)]
pub struct AdvertisementDecoder {
    signature: Vec<u8>,
}

impl Default for AdvertisementDecoder {
    fn default() -> Self {
        Self {
            signature: VENDOR_SIGNATURE.to_vec(),
        }
    }
}

impl AdvertisementDecoder {
    /// Decoder matching a custom vendor signature prefix.
    pub fn with_signature(signature: Vec<u8>) -> Self {
        Self { signature }
    }

    /// Decode raw advertisement bytes.
    ///
    /// Returns `None` when the advertisement is not ours: no
    /// manufacturer-specific record, wrong signature, or a payload shorter
    /// than the fixed header. None of these are errors.
    pub fn decode(&self, data: &[u8]) -> Option<DecodedAdvertisement> {
        let ltvs = parse_ltvs(data);
        let payload = ltvs
            .get(&LTV_TYPE_MANUFACTURER)?
            .iter()
            .find(|v| v.starts_with(&self.signature))?;
        self.decode_payload(payload)
    }

    /// Decode a matched manufacturer payload.
    fn decode_payload(&self, payload: &[u8]) -> Option<DecodedAdvertisement> {
        if payload.len() < RECORDS_OFFSET {
            return None;
        }

        let mut long_addr = [0u8; 8];
        long_addr.copy_from_slice(&payload[LONG_ADDR_RANGE]);
        let short_addr = ShortAddr::new([long_addr[6], long_addr[7]]);
        let is_anchor = payload[FLAGS_OFFSET] & FLAG_ANCHOR != 0;

        let mut ranges = Vec::new();
        let mut color = None;
        let mut i = RECORDS_OFFSET;
        while i + 1 < payload.len() {
            let record_type = payload[i];
            let len = payload[i + 1] as usize;
            if len == 0 {
                break;
            }
            let Some(bytes) = payload.get(i + 2..i + 2 + len) else {
                // Declared length overruns the payload; stop rather than
                // desynchronize on garbage.
                debug_assert!(false, "sub-record length overruns payload");
                break;
            };
            match record_type {
                RECORD_RANGING if bytes.len() >= 4 => {
                    let distance_cm = u16::from_be_bytes([bytes[2], bytes[3]]);
                    if distance_cm != INVALID_RANGE_CM {
                        ranges.push(RangeSample {
                            neighbor: ShortAddr::new([bytes[0], bytes[1]]),
                            distance_cm,
                        });
                    }
                }
                RECORD_COLOR if bytes.len() >= 3 => {
                    color = Some(Rgb {
                        r: (bytes[0] as u16 * 10 % 255) as u8,
                        g: (bytes[1] as u16 * 10 % 255) as u8,
                        b: (bytes[2] as u16 * 10 % 255) as u8,
                    });
                }
                _ => {} // unknown type: skip by declared length
            }
            i += 2 + len;
        }

        Some(DecodedAdvertisement {
            long_addr,
            short_addr,
            is_anchor,
            ranges,
            color,
        })
    }
}
