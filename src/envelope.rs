//! Server response envelope handling.
//!
//! License and provisioning servers may wrap the binary payload in a
//! textual envelope: `GLS/<major>.<minor>\r\n\r\n<binary>`. Responses
//! without the marker are raw payloads and pass through unchanged.

use crate::error::ParseError;

const ENVELOPE_MARKER: &[u8] = b"GLS/";
const SUPPORTED_VERSION: &[u8] = b"GLS/1.";
const MESSAGE_DELIMITER: &[u8] = b"\r\n\r\n";

/// Validate a server response body and return the payload within.
///
/// Bodies that do not start with `GLS/` are returned unchanged. Enveloped
/// bodies must carry a `1.x` version and a `\r\n\r\n` delimiter; the payload
/// is everything after the first delimiter, which may be empty.
pub fn unwrap_response(body: &[u8]) -> Result<&[u8], ParseError> {
    if !body.starts_with(ENVELOPE_MARKER) {
        return Ok(body);
    }
    if !body.starts_with(SUPPORTED_VERSION) {
        return Err(ParseError::UnsupportedVersion);
    }
    let offset = body
        .windows(MESSAGE_DELIMITER.len())
        .position(|window| window == MESSAGE_DELIMITER)
        .ok_or(ParseError::MalformedEnvelope)?;
    Ok(&body[offset + MESSAGE_DELIMITER.len()..])
}
