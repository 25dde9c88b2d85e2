//! Broker list of metadata responses.
//!
//! Only the leading fields up to and including the broker array are read;
//! topics and everything after them are left alone.

use bytes::Buf;

use super::codec::{read_unsigned_varint, skip, skip_tagged_fields};

/// First metadata version with a flexible (tagged-field) encoding.
const METADATA_FLEXIBLE_VERSION: i16 = 9;
/// First metadata version with a leading `throttle_time_ms`.
const METADATA_THROTTLE_VERSION: i16 = 3;
/// First metadata version whose brokers carry a rack.
const METADATA_RACK_VERSION: i16 = 1;

/// One broker as the upstream advertises it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub node_id: i32,
    pub host: String,
    pub port: i32,
}

/// Read the broker array of a metadata response body of `version`.
///
/// The body starts right after the correlation id, so flexible versions
/// begin with the response header's tagged fields. Returns `None` when the
/// body does not hold a well-formed broker array.
pub fn metadata_brokers(version: i16, mut body: &[u8]) -> Option<Vec<BrokerAddress>> {
    let flexible = version >= METADATA_FLEXIBLE_VERSION;
    if flexible {
        skip_tagged_fields(&mut body)?;
    }
    if version >= METADATA_THROTTLE_VERSION {
        skip(&mut body, 4)?;
    }

    let count = if flexible {
        // compact array: length + 1, zero means null
        (read_unsigned_varint(&mut body)? as usize).checked_sub(1)?
    } else {
        usize::try_from(read_i32(&mut body)?).ok()?
    };

    let mut brokers = Vec::new();
    for _ in 0..count {
        let node_id = read_i32(&mut body)?;
        let host = read_string(&mut body, flexible)?;
        let port = read_i32(&mut body)?;
        if version >= METADATA_RACK_VERSION {
            skip_nullable_string(&mut body, flexible)?;
        }
        if flexible {
            skip_tagged_fields(&mut body)?;
        }
        brokers.push(BrokerAddress { node_id, host, port });
    }
    Some(brokers)
}

fn read_i16(body: &mut &[u8]) -> Option<i16> {
    (body.len() >= 2).then(|| body.get_i16())
}

fn read_i32(body: &mut &[u8]) -> Option<i32> {
    (body.len() >= 4).then(|| body.get_i32())
}

fn string_len(body: &mut &[u8], flexible: bool) -> Option<Option<usize>> {
    if flexible {
        let len = read_unsigned_varint(body)? as usize;
        Some(len.checked_sub(1))
    } else {
        let len = read_i16(body)?;
        Some(usize::try_from(len).ok())
    }
}

fn read_string(body: &mut &[u8], flexible: bool) -> Option<String> {
    let len = string_len(body, flexible)??;
    if body.len() < len {
        return None;
    }
    let value = std::str::from_utf8(&body[..len]).ok()?.to_string();
    body.advance(len);
    Some(value)
}

fn skip_nullable_string(body: &mut &[u8], flexible: bool) -> Option<()> {
    match string_len(body, flexible)? {
        Some(len) => skip(body, len),
        None => Some(()),
    }
}
