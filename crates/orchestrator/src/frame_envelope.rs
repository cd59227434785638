//! Frame-envelope wire format (spec.md §6): either a binary payload with a
//! 4-byte little-endian capture-interval prefix, or a text `data:` URI with
//! base64-encoded JPEG bytes.

use base64::Engine as _;

use crate::OrchestratorError;

/// One frame as it arrives over the wire, already stripped of its
/// transport framing but not yet decoded from JPEG.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameEnvelope {
    /// Milliseconds since the previous frame was captured. `0` for the
    /// text/base64 form, which carries no interval of its own.
    pub capture_interval_ms: u32,
    pub jpeg_bytes: Vec<u8>,
}

impl FrameEnvelope {
    /// Parses a raw transport payload per spec.md §6. Payloads shorter than
    /// 4 bytes in binary form are rejected; a malformed base64 payload is
    /// also rejected.
    pub fn parse(bytes: &[u8]) -> Result<Self, OrchestratorError> {
        if let Some(envelope) = Self::parse_data_uri(bytes)? {
            return Ok(envelope);
        }
        if bytes.len() < 4 {
            return Err(OrchestratorError::MalformedEnvelope("payload shorter than the 4-byte interval prefix".into()));
        }
        let capture_interval_ms = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        Ok(Self { capture_interval_ms, jpeg_bytes: bytes[4..].to_vec() })
    }

    /// Recognizes the `data:image/<type>;base64,<...>` text form. Returns
    /// `Ok(None)` for anything that isn't UTF-8 text in that shape, so the
    /// caller falls through to binary parsing.
    fn parse_data_uri(bytes: &[u8]) -> Result<Option<Self>, OrchestratorError> {
        let Ok(text) = std::str::from_utf8(bytes) else { return Ok(None) };
        let Some(comma) = text.find(',') else { return Ok(None) };
        let (header, body) = text.split_at(comma);
        if !header.starts_with("data:image/") || !header.contains(";base64") {
            return Ok(None);
        }
        let body = &body[1..];
        let jpeg_bytes = base64::engine::general_purpose::STANDARD
            .decode(body)
            .map_err(|e| OrchestratorError::MalformedEnvelope(format!("invalid base64 payload: {e}")))?;
        Ok(Some(Self { capture_interval_ms: 0, jpeg_bytes }))
    }

    /// `None` when this envelope carries no interval of its own (the
    /// base64 form), so callers fall back to the configured base interval.
    #[must_use]
    pub fn capture_interval(&self) -> Option<f64> {
        if self.capture_interval_ms == 0 {
            None
        } else {
            Some(f64::from(self.capture_interval_ms))
        }
    }
}
