//! Size-prefixed envelope codec.
//!
//! # Responsibilities
//! - Read and write request envelopes (api key, version, correlation id, client id)
//! - Read and write response envelopes (correlation id)
//! - Enforce the maximum frame size
//! - Decide whether a request expects a response
//!
//! # Design Decisions
//! - Bodies are passed through untouched, including flexible-version tagged header fields
//! - EOF at a frame boundary is a clean close (`Ok(None)`), EOF inside a frame is an error

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::frame::{ApiKey, RawResponse, RequestFrame, RequestHeader, ResponseFrame};

/// Fixed part of a request envelope: api key, api version, correlation id, client id length.
const REQUEST_HEADER_FIXED_LEN: usize = 2 + 2 + 4 + 2;
const RESPONSE_HEADER_LEN: usize = 4;

/// First produce version whose request header carries tagged fields.
const PRODUCE_FLEXIBLE_VERSION: i16 = 9;
/// First produce version with a transactional id ahead of `acks`.
const PRODUCE_TRANSACTIONAL_VERSION: i16 = 3;

/// Error type for envelope encoding and decoding.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {size} bytes exceeds the maximum of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    #[error("frame of {0} bytes is too short for its header")]
    Truncated(usize),

    #[error("client id is not valid UTF-8")]
    InvalidClientId,
}

/// Read the 4-byte size prefix, returning `None` on a clean EOF.
async fn read_frame_size<R>(reader: &mut R) -> Result<Option<usize>, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 4];
    let first = reader.read(&mut prefix).await?;
    if first == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut prefix[first..]).await?;
    Ok(Some(u32::from_be_bytes(prefix) as usize))
}

async fn read_frame<R>(
    reader: &mut R,
    max_frame_size: usize,
    min_len: usize,
) -> Result<Option<Bytes>, CodecError>
where
    R: AsyncRead + Unpin,
{
    let Some(size) = read_frame_size(reader).await? else {
        return Ok(None);
    };
    if size > max_frame_size {
        return Err(CodecError::FrameTooLarge {
            size,
            max: max_frame_size,
        });
    }
    if size < min_len {
        return Err(CodecError::Truncated(size));
    }
    let mut buf = vec![0u8; size];
    reader.read_exact(&mut buf).await?;
    Ok(Some(Bytes::from(buf)))
}

/// Read one request envelope from the client.
pub async fn read_request<R>(
    reader: &mut R,
    max_frame_size: usize,
) -> Result<Option<RequestFrame>, CodecError>
where
    R: AsyncRead + Unpin,
{
    let Some(mut buf) = read_frame(reader, max_frame_size, REQUEST_HEADER_FIXED_LEN).await? else {
        return Ok(None);
    };
    let size = buf.len();

    let api_key = ApiKey::from(buf.get_i16());
    let api_version = buf.get_i16();
    let correlation_id = buf.get_u32();
    let client_id_len = buf.get_i16();
    let client_id = if client_id_len < 0 {
        None
    } else {
        let len = client_id_len as usize;
        if buf.remaining() < len {
            return Err(CodecError::Truncated(size));
        }
        let raw = buf.split_to(len);
        Some(String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidClientId)?)
    };

    let header = RequestHeader {
        api_key,
        api_version,
        correlation_id,
        client_id,
    };
    let has_response = expects_response(&header, &buf);
    Ok(Some(RequestFrame {
        header,
        body: buf,
        has_response,
    }))
}

/// Write one request envelope towards the upstream.
pub async fn write_request<W>(writer: &mut W, frame: &RequestFrame) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let client_id = frame.header.client_id.as_deref().map(str::as_bytes);
    let size = REQUEST_HEADER_FIXED_LEN + client_id.map_or(0, <[u8]>::len) + frame.body.len();

    let mut buf = BytesMut::with_capacity(4 + size);
    buf.put_u32(size as u32);
    buf.put_i16(frame.header.api_key.id());
    buf.put_i16(frame.header.api_version);
    buf.put_u32(frame.header.correlation_id);
    match client_id {
        Some(id) => {
            buf.put_i16(id.len() as i16);
            buf.put_slice(id);
        }
        None => buf.put_i16(-1),
    }
    buf.put_slice(&frame.body);

    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one response envelope from the upstream.
pub async fn read_response<R>(
    reader: &mut R,
    max_frame_size: usize,
) -> Result<Option<RawResponse>, CodecError>
where
    R: AsyncRead + Unpin,
{
    let Some(mut buf) = read_frame(reader, max_frame_size, RESPONSE_HEADER_LEN).await? else {
        return Ok(None);
    };
    let correlation_id = buf.get_u32();
    Ok(Some(RawResponse {
        correlation_id,
        body: buf,
    }))
}

/// Write one response envelope towards the client.
pub async fn write_response<W>(writer: &mut W, frame: &ResponseFrame) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let size = RESPONSE_HEADER_LEN + frame.body.len();
    let mut buf = BytesMut::with_capacity(4 + size);
    buf.put_u32(size as u32);
    buf.put_u32(frame.header.correlation_id);
    buf.put_slice(&frame.body);

    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Whether the upstream will answer this request.
///
/// Only produce requests with `acks=0` go unanswered. A body too short to
/// carry `acks` is assumed to expect a response.
pub fn expects_response(header: &RequestHeader, body: &[u8]) -> bool {
    if header.api_key != ApiKey::Produce {
        return true;
    }
    produce_acks(header.api_version, body).map_or(true, |acks| acks != 0)
}

fn produce_acks(version: i16, mut body: &[u8]) -> Option<i16> {
    if version >= PRODUCE_FLEXIBLE_VERSION {
        skip_tagged_fields(&mut body)?;
        // compact nullable transactional id: length + 1, zero means null
        let len = read_unsigned_varint(&mut body)? as usize;
        skip(&mut body, len.saturating_sub(1))?;
    } else if version >= PRODUCE_TRANSACTIONAL_VERSION {
        if body.len() < 2 {
            return None;
        }
        let len = body.get_i16();
        if len > 0 {
            skip(&mut body, len as usize)?;
        }
    }
    if body.len() < 2 {
        return None;
    }
    Some(body.get_i16())
}

pub(super) fn skip_tagged_fields(body: &mut &[u8]) -> Option<()> {
    let count = read_unsigned_varint(body)?;
    for _ in 0..count {
        read_unsigned_varint(body)?;
        let size = read_unsigned_varint(body)? as usize;
        skip(body, size)?;
    }
    Some(())
}

pub(super) fn skip(body: &mut &[u8], len: usize) -> Option<()> {
    if body.len() < len {
        return None;
    }
    body.advance(len);
    Some(())
}

pub(super) fn read_unsigned_varint(body: &mut &[u8]) -> Option<u32> {
    let mut value = 0u32;
    for shift in (0..35).step_by(7) {
        if body.is_empty() {
            return None;
        }
        let byte = body.get_u8();
        value |= u32::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some(value);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::ResponseHeader;

    #[tokio::test]
    async fn request_envelope_survives_the_wire() {
        let header = RequestHeader::new(ApiKey::Metadata, 12, 7).with_client_id("app-1");
        let frame = RequestFrame::new(header, Bytes::from_static(b"\x00payload"));

        let mut wire = Vec::new();
        write_request(&mut wire, &frame).await.unwrap();

        let mut reader = wire.as_slice();
        let decoded = read_request(&mut reader, 1024).await.unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(read_request(&mut reader, 1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unlisted_api_keys_decode_and_reencode_unchanged() {
        // OffsetForLeaderEpoch v4, correlation id 7, null client id
        let wire = [0u8, 0, 0, 10, 0, 23, 0, 4, 0, 0, 0, 7, 0xff, 0xff];
        let decoded = read_request(&mut &wire[..], 1024).await.unwrap().unwrap();
        assert_eq!(decoded.header.api_key, ApiKey::Other(23));
        assert_eq!(decoded.header.api_version, 4);
        assert_eq!(decoded.correlation_id(), 7);
        assert!(decoded.header.client_id.is_none());
        assert!(decoded.has_response);

        let mut out = Vec::new();
        write_request(&mut out, &decoded).await.unwrap();
        assert_eq!(out, wire);
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected() {
        let frame = ResponseFrame {
            api_key: ApiKey::Fetch,
            api_version: 4,
            header: ResponseHeader { correlation_id: 1 },
            body: Bytes::from(vec![0u8; 64]),
        };
        let mut wire = Vec::new();
        write_response(&mut wire, &frame).await.unwrap();

        let err = read_response(&mut wire.as_slice(), 16).await.unwrap_err();
        assert!(matches!(err, CodecError::FrameTooLarge { size: 68, max: 16 }));
    }

    #[tokio::test]
    async fn eof_inside_a_frame_is_an_error() {
        let wire = [0u8, 0, 0, 20, 0, 3];
        let err = read_request(&mut &wire[..], 1024).await.unwrap_err();
        assert!(matches!(err, CodecError::Io(_)));
    }

    #[test]
    fn produce_with_zero_acks_expects_no_response() {
        let v2 = RequestHeader::new(ApiKey::Produce, 2, 1);
        assert!(!expects_response(&v2, &[0, 0, 0, 0, 0x75, 0x30]));
        assert!(expects_response(&v2, &[0, 1, 0, 0, 0x75, 0x30]));

        // v3: null transactional id, then acks
        let v3 = RequestHeader::new(ApiKey::Produce, 3, 1);
        assert!(!expects_response(&v3, &[0xff, 0xff, 0, 0]));
        // v3: transactional id "tx", then acks=-1
        assert!(expects_response(&v3, &[0, 2, b't', b'x', 0xff, 0xff]));

        // v9: no tagged fields, null compact transactional id, then acks
        let v9 = RequestHeader::new(ApiKey::Produce, 9, 1);
        assert!(!expects_response(&v9, &[0, 0, 0, 0]));

        let fetch = RequestHeader::new(ApiKey::Fetch, 11, 1);
        assert!(expects_response(&fetch, &[]));
    }
}
