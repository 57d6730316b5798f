//! Length-prefixed correlation frames
//!
//! Request frame:
//!
//! ```text
//! +------------+-----------------+-------------+-----------+
//! | len: u32   | request id: u64 | service: u8 | payload   |
//! +------------+-----------------+-------------+-----------+
//! ```
//!
//! Response frame:
//!
//! ```text
//! +------------+-----------------+-------------+-----------+
//! | len: u32   | request id: u64 | status: u8  | payload   |
//! +------------+-----------------+-------------+-----------+
//! ```
//!
//! `len` counts every byte after itself. All integers are big-endian. A
//! non-zero status marks a service error whose payload is a UTF-8 message.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{Frame, TransportError};
use crate::request::RequestId;
use crate::service::ServiceType;

const LEN_PREFIX: usize = 4;
const BODY_HEADER: usize = 8 + 1;

/// Largest frame body written to or accepted from the wire
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

pub const STATUS_OK: u8 = 0;
pub const STATUS_ERROR: u8 = 1;

/// A decoded response frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub id: RequestId,
    pub outcome: Result<Bytes, String>,
}

/// Fail when `payload_len` bytes do not fit in a single frame
pub fn check_payload_len(payload_len: usize) -> Result<(), TransportError> {
    if payload_len > MAX_FRAME_LEN - BODY_HEADER {
        return Err(TransportError::Malformed(format!(
            "payload of {} bytes exceeds the {} byte frame limit",
            payload_len, MAX_FRAME_LEN
        )));
    }
    Ok(())
}

pub fn encode_request(frame: &Frame, dst: &mut BytesMut) -> Result<(), TransportError> {
    check_payload_len(frame.payload.len())?;
    dst.reserve(LEN_PREFIX + BODY_HEADER + frame.payload.len());
    dst.put_u32((BODY_HEADER + frame.payload.len()) as u32);
    dst.put_u64(frame.id.as_u64());
    dst.put_u8(frame.service.code());
    dst.put_slice(&frame.payload);
    Ok(())
}

pub fn decode_request(src: &mut BytesMut) -> Result<Option<Frame>, TransportError> {
    let Some((id, tag, payload)) = split_frame(src)? else {
        return Ok(None);
    };
    let service = ServiceType::from_code(tag)
        .ok_or_else(|| TransportError::Malformed(format!("unknown service code {:#04x}", tag)))?;
    Ok(Some(Frame {
        id,
        service,
        payload,
    }))
}

pub fn encode_response(
    id: RequestId,
    outcome: &Result<Bytes, String>,
    dst: &mut BytesMut,
) -> Result<(), TransportError> {
    let (status, payload): (u8, &[u8]) = match outcome {
        Ok(body) => (STATUS_OK, body.as_ref()),
        Err(message) => (STATUS_ERROR, message.as_bytes()),
    };
    check_payload_len(payload.len())?;
    dst.reserve(LEN_PREFIX + BODY_HEADER + payload.len());
    dst.put_u32((BODY_HEADER + payload.len()) as u32);
    dst.put_u64(id.as_u64());
    dst.put_u8(status);
    dst.put_slice(payload);
    Ok(())
}

pub fn decode_response(src: &mut BytesMut) -> Result<Option<ResponseFrame>, TransportError> {
    let Some((id, status, payload)) = split_frame(src)? else {
        return Ok(None);
    };
    let outcome = match status {
        STATUS_OK => Ok(payload),
        _ => Err(String::from_utf8_lossy(&payload).into_owned()),
    };
    Ok(Some(ResponseFrame { id, outcome }))
}

/// Cut one complete frame off the front of `src`
fn split_frame(src: &mut BytesMut) -> Result<Option<(RequestId, u8, Bytes)>, TransportError> {
    if src.len() < LEN_PREFIX {
        return Ok(None);
    }

    let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
    if len < BODY_HEADER {
        return Err(TransportError::Malformed(format!("frame length {} below header size", len)));
    }
    if len > MAX_FRAME_LEN {
        return Err(TransportError::Malformed(format!("frame length {} exceeds limit", len)));
    }
    if src.len() < LEN_PREFIX + len {
        src.reserve(LEN_PREFIX + len - src.len());
        return Ok(None);
    }

    src.advance(LEN_PREFIX);
    let mut body = src.split_to(len);
    let id = RequestId::from_u64(body.get_u64());
    let tag = body.get_u8();
    Ok(Some((id, tag, body.freeze())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_frame_layout() {
        let frame = Frame {
            id: RequestId::from_u64(7),
            service: ServiceType::View,
            payload: Bytes::from_static(b"{}"),
        };
        let mut buf = BytesMut::new();
        encode_request(&frame, &mut buf).unwrap();

        assert_eq!(&buf[..4], &11u32.to_be_bytes());
        assert_eq!(&buf[4..12], &7u64.to_be_bytes());
        assert_eq!(buf[12], ServiceType::View.code());
        assert_eq!(&buf[13..], b"{}");

        assert_eq!(decode_request(&mut buf).unwrap(), Some(frame));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frames_wait_for_more_bytes() {
        let mut full = BytesMut::new();
        encode_response(RequestId::from_u64(1), &Ok(Bytes::from_static(b"hello")), &mut full).unwrap();

        let mut partial = BytesMut::from(&full[..6]);
        assert_eq!(decode_response(&mut partial).unwrap(), None);
        partial.extend_from_slice(&full[6..]);

        let decoded = decode_response(&mut partial).unwrap().unwrap();
        assert_eq!(decoded.id, RequestId::from_u64(1));
        assert_eq!(decoded.outcome, Ok(Bytes::from_static(b"hello")));
    }

    #[test]
    fn test_back_to_back_responses() {
        let mut buf = BytesMut::new();
        encode_response(RequestId::from_u64(1), &Ok(Bytes::from_static(b"a")), &mut buf).unwrap();
        encode_response(RequestId::from_u64(2), &Err("not found".to_string()), &mut buf).unwrap();

        let first = decode_response(&mut buf).unwrap().unwrap();
        let second = decode_response(&mut buf).unwrap().unwrap();
        assert_eq!(first.id, RequestId::from_u64(1));
        assert_eq!(second.outcome, Err("not found".to_string()));
        assert_eq!(decode_response(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_malformed_frames_rejected() {
        let mut short = BytesMut::new();
        short.put_u32(3);
        short.put_slice(&[0, 0, 0]);
        assert!(matches!(decode_response(&mut short), Err(TransportError::Malformed(_))));

        let mut huge = BytesMut::new();
        huge.put_u32(u32::MAX);
        assert!(matches!(decode_response(&mut huge), Err(TransportError::Malformed(_))));

        let mut unknown_service = BytesMut::new();
        unknown_service.put_u32(9);
        unknown_service.put_u64(1);
        unknown_service.put_u8(0xee);
        assert!(matches!(
            decode_request(&mut unknown_service),
            Err(TransportError::Malformed(_))
        ));
    }

    #[test]
    fn test_oversized_payload_not_encoded() {
        let limit = MAX_FRAME_LEN - BODY_HEADER;
        assert!(check_payload_len(limit).is_ok());

        let frame = Frame {
            id: RequestId::from_u64(3),
            service: ServiceType::Query,
            payload: Bytes::from(vec![b'x'; limit + 1]),
        };
        let mut buf = BytesMut::new();
        assert!(matches!(encode_request(&frame, &mut buf), Err(TransportError::Malformed(_))));
        assert!(buf.is_empty());

        let body = Ok(frame.payload.clone());
        assert!(matches!(
            encode_response(frame.id, &body, &mut buf),
            Err(TransportError::Malformed(_))
        ));
        assert!(buf.is_empty());
    }
}
