use crate::error::Error;

/// Close status codes from RFC 6455 section 7.4, plus a catch-all for the
/// registered (3000-3999) and private (4000-4999) ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    NormalClosure,
    GoingAway,
    ProtocolError,
    UnsupportedData,
    NoStatusReceived,
    AbnormalClosure,
    InvalidFramePayloadData,
    PolicyViolation,
    MessageTooBig,
    MandatoryExtension,
    InternalServerError,
    TlsHandshake,
    Unknown(u16),
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => CloseCode::NormalClosure,
            1001 => CloseCode::GoingAway,
            1002 => CloseCode::ProtocolError,
            1003 => CloseCode::UnsupportedData,
            1005 => CloseCode::NoStatusReceived,
            1006 => CloseCode::AbnormalClosure,
            1007 => CloseCode::InvalidFramePayloadData,
            1008 => CloseCode::PolicyViolation,
            1009 => CloseCode::MessageTooBig,
            1010 => CloseCode::MandatoryExtension,
            1011 => CloseCode::InternalServerError,
            1015 => CloseCode::TlsHandshake,
            other => CloseCode::Unknown(other),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        match code {
            CloseCode::NormalClosure => 1000,
            CloseCode::GoingAway => 1001,
            CloseCode::ProtocolError => 1002,
            CloseCode::UnsupportedData => 1003,
            CloseCode::NoStatusReceived => 1005,
            CloseCode::AbnormalClosure => 1006,
            CloseCode::InvalidFramePayloadData => 1007,
            CloseCode::PolicyViolation => 1008,
            CloseCode::MessageTooBig => 1009,
            CloseCode::MandatoryExtension => 1010,
            CloseCode::InternalServerError => 1011,
            CloseCode::TlsHandshake => 1015,
            CloseCode::Unknown(other) => other,
        }
    }
}

impl CloseCode {
    /// Whether this code may legally appear inside a close frame on the wire.
    /// 1005/1006/1015 are signalling-only, 1004 and 1016-2999 are reserved,
    /// and everything below 1000 is undefined.
    pub fn is_allowed(&self) -> bool {
        let code = u16::from(*self);
        matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
    }
}

/// Parsed body of a close frame: status code plus optional UTF-8 reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: CloseCode,
    pub reason: String,
}

impl CloseFrame {
    pub fn new(code: CloseCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Parses an incoming close payload. An empty payload is a close without
    /// status; a single byte, a disallowed code or a non-UTF-8 reason are
    /// protocol errors.
    pub fn parse(payload: &[u8]) -> Result<Option<Self>, Error> {
        if payload.is_empty() {
            return Ok(None);
        }
        if payload.len() == 1 {
            return Err(Error::InvalidClosePayload);
        }

        let code = CloseCode::from(u16::from_be_bytes([payload[0], payload[1]]));
        if !code.is_allowed() {
            return Err(Error::DisallowedCloseCode(code.into()));
        }

        let reason = String::from_utf8(payload[2..].to_vec())
            .map_err(|_| Error::InvalidClosePayload)?;

        Ok(Some(Self { code, reason }))
    }

    /// Serializes to the wire body. Control-frame payloads are capped at 125
    /// bytes, so the reason is truncated to the 123 that fit after the code.
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(2 + self.reason.len());
        payload.extend_from_slice(&u16::from(self.code).to_be_bytes());

        let mut reason = self.reason.as_bytes();
        if reason.len() > 123 {
            let mut end = 123;
            // don't split a UTF-8 sequence when truncating
            while end > 0 && !self.reason.is_char_boundary(end) {
                end -= 1;
            }
            reason = &reason[..end];
        }
        payload.extend_from_slice(reason);
        payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_roundtrip() {
        for raw in [1000u16, 1001, 1002, 1003, 1007, 1009, 1011, 3000, 4999] {
            assert_eq!(u16::from(CloseCode::from(raw)), raw);
        }
    }

    #[test]
    fn allowed_set_matches_rfc() {
        for raw in [0u16, 999, 1004, 1005, 1006, 1015, 1016, 2999] {
            assert!(!CloseCode::from(raw).is_allowed(), "{raw} should be rejected");
        }
        for raw in [1000u16, 1003, 1007, 1011, 3000, 3999, 4000, 4999] {
            assert!(CloseCode::from(raw).is_allowed(), "{raw} should be accepted");
        }
    }

    #[test]
    fn parse_empty_payload() {
        assert_eq!(CloseFrame::parse(&[]).unwrap(), None);
    }

    #[test]
    fn parse_one_byte_payload_is_protocol_error() {
        assert!(CloseFrame::parse(&[0x03]).is_err());
    }

    #[test]
    fn parse_bad_code_is_rejected() {
        let payload = 999u16.to_be_bytes();
        assert!(CloseFrame::parse(&payload).is_err());
    }

    #[test]
    fn parse_code_with_reason() {
        let mut payload = 1000u16.to_be_bytes().to_vec();
        payload.extend_from_slice(b"bye");
        let close = CloseFrame::parse(&payload).unwrap().unwrap();
        assert_eq!(close.code, CloseCode::NormalClosure);
        assert_eq!(close.reason, "bye");
    }

    #[test]
    fn parse_invalid_utf8_reason() {
        let mut payload = 1000u16.to_be_bytes().to_vec();
        payload.extend_from_slice(&[0xff, 0xfe]);
        assert!(CloseFrame::parse(&payload).is_err());
    }

    #[test]
    fn encode_truncates_long_reason() {
        let close = CloseFrame::new(CloseCode::NormalClosure, "x".repeat(200));
        let payload = close.encode();
        assert_eq!(payload.len(), 125);
        assert_eq!(&payload[..2], &1000u16.to_be_bytes());
    }
}
