//! Advertisement data: building ours and matching the peer's.

use crate::proto::types::SERVICE_UUID;

pub const AD_TYPE_FLAGS: u8 = 0x01;
pub const AD_TYPE_UUID128_COMPLETE: u8 = 0x07;
pub const AD_TYPE_COMPLETE_LOCAL_NAME: u8 = 0x09;

/// LE general discoverable, BR/EDR not supported.
const FLAGS_GENERAL_DISCOVERABLE: u8 = 0x06;

/// Legacy advertising PDU payload limit.
pub const MAX_ADV_DATA_LEN: usize = 31;

/// Advertisement payload for the peripheral: flags and complete local name.
pub fn build_adv_data(device_name: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(MAX_ADV_DATA_LEN);
    out.extend_from_slice(&[2, AD_TYPE_FLAGS, FLAGS_GENERAL_DISCOVERABLE]);
    out.push(device_name.len() as u8 + 1);
    out.push(AD_TYPE_COMPLETE_LOCAL_NAME);
    out.extend_from_slice(device_name.as_bytes());
    out
}

/// Scan response payload: the complete 128-bit service UUID list.
pub fn build_scan_response() -> Vec<u8> {
    // 128-bit UUIDs go over the air little-endian
    let mut uuid = *SERVICE_UUID.as_bytes();
    uuid.reverse();
    let mut out = Vec::with_capacity(uuid.len() + 2);
    out.push(uuid.len() as u8 + 1);
    out.push(AD_TYPE_UUID128_COMPLETE);
    out.extend_from_slice(&uuid);
    out
}

/// Iterator over `(type, payload)` AD records. Stops at the first record
/// that is empty or runs past the end of the buffer.
pub struct AdRecords<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> AdRecords<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }
}

impl<'a> Iterator for AdRecords<'a> {
    type Item = (u8, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let len = *self.data.get(self.pos)? as usize;
        if len == 0 {
            return None;
        }
        let start = self.pos + 1;
        let end = start + len;
        let record = self.data.get(start..end)?;
        self.pos = end;
        Some((record[0], &record[1..]))
    }
}

/// True when a Complete Local Name record equals `name` byte for byte.
/// Truncated or malformed data never matches.
pub fn matches_device_name(adv_data: &[u8], name: &str) -> bool {
    AdRecords::new(adv_data)
        .any(|(ty, payload)| ty == AD_TYPE_COMPLETE_LOCAL_NAME && payload == name.as_bytes())
}
