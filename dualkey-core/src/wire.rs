//! Fixed-offset binary framing for key-custody requests and responses.
//!
//! Request: `code(1) ‖ store_id(1) ‖ key_index(1) ‖ payload`.
//! Response: `status(1) ‖ body`, where status `0` is success and the body length is fixed per action.

use crate::errors::{Error, Result};
use crate::types::{Action, KeyLocation};

pub const REQUEST_HEADER_LEN: usize = 3;
pub const STATUS_OK: u8 = 0;
pub const STATUS_FAILED: u8 = 1;

/// An encoded request, ready to be written in one piece.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireRequest {
    bytes: Vec<u8>,
}

impl WireRequest {
    /// Splits raw request bytes back into their fields. The payload is returned verbatim.
    pub fn parse(bytes: &[u8]) -> Result<(RequestHeader, &[u8])> {
        if bytes.len() < REQUEST_HEADER_LEN {
            return Err(Error::ShortFrame {
                frame: "request",
                expected: REQUEST_HEADER_LEN,
                actual: bytes.len(),
            });
        }
        let (header, payload) = bytes.split_at(REQUEST_HEADER_LEN);
        Ok((RequestHeader::from_bytes([header[0], header[1], header[2]]), payload))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// The three positional header bytes of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub code: u8,
    pub location: KeyLocation,
}

impl RequestHeader {
    pub fn from_bytes(bytes: [u8; REQUEST_HEADER_LEN]) -> Self {
        Self {
            code: bytes[0],
            location: KeyLocation::new(bytes[1], bytes[2]),
        }
    }

    pub fn action(&self) -> Option<Action> {
        Action::from_code(self.code)
    }
}

/// A successfully decoded response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireResponse {
    pub status: u8,
    pub body: Vec<u8>,
}

pub fn encode(location: KeyLocation, action: Action, payload: &[u8]) -> WireRequest {
    let mut bytes = Vec::with_capacity(REQUEST_HEADER_LEN + payload.len());
    bytes.extend_from_slice(&[action.code(), location.store_id, location.key_index]);
    bytes.extend_from_slice(payload);
    WireRequest { bytes }
}

/// Decodes a response buffer that should hold exactly `expected_size` bytes.
///
/// A nonzero status byte is reported as [`Error::RequestRejected`] regardless of how much of the
/// body arrived; `endpoint` only labels the error.
pub fn decode(bytes: &[u8], expected_size: usize, endpoint: &str) -> Result<WireResponse> {
    let Some(&status) = bytes.first() else {
        return Err(Error::ShortFrame {
            frame: "response",
            expected: expected_size,
            actual: 0,
        });
    };
    if status != STATUS_OK {
        return Err(Error::RequestRejected {
            endpoint: endpoint.to_string(),
            status,
        });
    }
    if bytes.len() < expected_size {
        return Err(Error::ShortFrame {
            frame: "response",
            expected: expected_size,
            actual: bytes.len(),
        });
    }
    Ok(WireResponse {
        status,
        body: bytes[1..expected_size].to_vec(),
    })
}

/// Frames a successful response.
pub fn encode_success(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + body.len());
    out.push(STATUS_OK);
    out.extend_from_slice(body);
    out
}

/// Frames a failure response: the status byte alone.
pub fn encode_failure(status: u8) -> Vec<u8> {
    debug_assert_ne!(status, STATUS_OK);
    vec![status]
}
