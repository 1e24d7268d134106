//! CoAP response codes used by the server.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Response codes the server produces or interprets.
///
/// `Timeout` is a sentinel (`4.08`) reported when a request gets no answer
/// within the request timeout. It never goes on the wire from this server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResponseCode {
    Created,
    Deleted,
    Valid,
    Changed,
    Content,
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    NotAllowed,
    NotAcceptable,
    Timeout,
    UnsupportedFormat,
    ServerError,
    ServiceUnavailable,
    /// Any other code, kept as `class.detail`
    Other(u8, u8),
}

impl ResponseCode {
    /// Builds a code from its class and detail (`2`, `5` → `2.05`).
    pub fn from_parts(class: u8, detail: u8) -> Self {
        match (class, detail) {
            (2, 1) => Self::Created,
            (2, 2) => Self::Deleted,
            (2, 3) => Self::Valid,
            (2, 4) => Self::Changed,
            (2, 5) => Self::Content,
            (4, 0) => Self::BadRequest,
            (4, 1) => Self::Unauthorized,
            (4, 3) => Self::Forbidden,
            (4, 4) => Self::NotFound,
            (4, 5) => Self::NotAllowed,
            (4, 6) => Self::NotAcceptable,
            (4, 8) => Self::Timeout,
            (4, 15) => Self::UnsupportedFormat,
            (5, 0) => Self::ServerError,
            (5, 3) => Self::ServiceUnavailable,
            (class, detail) => Self::Other(class, detail),
        }
    }

    /// Returns the class and detail of the code.
    pub fn parts(self) -> (u8, u8) {
        match self {
            Self::Created => (2, 1),
            Self::Deleted => (2, 2),
            Self::Valid => (2, 3),
            Self::Changed => (2, 4),
            Self::Content => (2, 5),
            Self::BadRequest => (4, 0),
            Self::Unauthorized => (4, 1),
            Self::Forbidden => (4, 3),
            Self::NotFound => (4, 4),
            Self::NotAllowed => (4, 5),
            Self::NotAcceptable => (4, 6),
            Self::Timeout => (4, 8),
            Self::UnsupportedFormat => (4, 15),
            Self::ServerError => (5, 0),
            Self::ServiceUnavailable => (5, 3),
            Self::Other(class, detail) => (class, detail),
        }
    }

    /// Parses the dotted form (`"2.05"`).
    pub fn parse(s: &str) -> Option<Self> {
        let (class, detail) = s.split_once('.')?;
        Some(Self::from_parts(class.parse().ok()?, detail.parse().ok()?))
    }

    /// Packs the code into the single header byte (`class << 5 | detail`).
    pub fn to_byte(self) -> u8 {
        let (class, detail) = self.parts();
        (class << 5) | (detail & 0x1f)
    }

    pub fn from_byte(byte: u8) -> Self {
        Self::from_parts(byte >> 5, byte & 0x1f)
    }

    #[must_use]
    pub fn is_success(self) -> bool {
        self.parts().0 == 2
    }

    #[must_use]
    pub fn is_timeout(self) -> bool {
        self == Self::Timeout
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (class, detail) = self.parts();
        write!(f, "{class}.{detail:02}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_dotted() {
        assert_eq!(ResponseCode::Content.to_string(), "2.05");
        assert_eq!(ResponseCode::UnsupportedFormat.to_string(), "4.15");
        assert_eq!(ResponseCode::Timeout.to_string(), "4.08");
    }

    #[test]
    fn test_parse_and_byte_forms() {
        assert_eq!(ResponseCode::parse("2.01"), Some(ResponseCode::Created));
        assert_eq!(ResponseCode::parse("x"), None);
        assert_eq!(ResponseCode::Content.to_byte(), 0x45);
        assert_eq!(ResponseCode::from_byte(0x84), ResponseCode::NotFound);
        assert_eq!(ResponseCode::from_byte(0x5f), ResponseCode::Other(2, 31));
    }
}
