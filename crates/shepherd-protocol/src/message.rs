//! Message descriptors exchanged with the transport.
//!
//! - [`InboundRequest`] / [`OutboundResponse`]: a device talking to the server
//! - [`CoapRequest`] / [`CoapResponse`]: the server talking to a device

use crate::code::ResponseCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shepherd_core::DataFormat;
use std::fmt;
use std::net::SocketAddr;

// ============================================================================
// Methods and Content Formats
// ============================================================================

/// CoAP request methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    /// Request code detail (`0.01`..`0.04`).
    pub fn code(self) -> u8 {
        match self {
            Self::Get => 1,
            Self::Post => 2,
            Self::Put => 3,
            Self::Delete => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Get),
            2 => Some(Self::Post),
            3 => Some(Self::Put),
            4 => Some(Self::Delete),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Content-Format option values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContentFormat {
    TextPlain,
    LinkFormat,
    OctetStream,
    Json,
    Lwm2mTlv,
    Lwm2mJson,
    Other(u16),
}

impl ContentFormat {
    pub fn from_u16(value: u16) -> Self {
        match value {
            0 => Self::TextPlain,
            40 => Self::LinkFormat,
            42 => Self::OctetStream,
            50 => Self::Json,
            11542 => Self::Lwm2mTlv,
            11543 => Self::Lwm2mJson,
            other => Self::Other(other),
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            Self::TextPlain => 0,
            Self::LinkFormat => 40,
            Self::OctetStream => 42,
            Self::Json => 50,
            Self::Lwm2mTlv => 11542,
            Self::Lwm2mJson => 11543,
            Self::Other(other) => other,
        }
    }

    /// Accept format used when reading from a device with this data format.
    pub fn for_data_format(format: DataFormat) -> Self {
        match format {
            DataFormat::Json => Self::Lwm2mJson,
            DataFormat::Tlv => Self::Lwm2mTlv,
            DataFormat::Plain => Self::TextPlain,
        }
    }
}

// ============================================================================
// Device → Server
// ============================================================================

/// A request received from a device.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundRequest {
    /// `None` for an empty message (code `0.00`)
    pub method: Option<Method>,
    /// Uri-Path joined with `/`, always starting with `/`
    pub path: String,
    /// Raw Uri-Query items (`ep=dev1`)
    pub query: Vec<String>,
    pub confirmable: bool,
    pub payload: Vec<u8>,
    pub source: SocketAddr,
}

impl InboundRequest {
    pub fn new(method: Method, path: impl Into<String>, source: SocketAddr) -> Self {
        Self {
            method: Some(method),
            path: path.into(),
            query: Vec::new(),
            confirmable: true,
            payload: Vec::new(),
            source,
        }
    }

    /// An empty confirmable message (CoAP ping).
    pub fn empty(source: SocketAddr) -> Self {
        Self {
            method: None,
            path: "/".to_string(),
            query: Vec::new(),
            confirmable: true,
            payload: Vec::new(),
            source,
        }
    }

    /// Adds query items from an `a=1&b=2` string.
    #[must_use]
    pub fn with_query(mut self, query: &str) -> Self {
        self.query.extend(
            query
                .split('&')
                .filter(|item| !item.is_empty())
                .map(str::to_string),
        );
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Path segments without empty parts (`/rd/5` → `["rd", "5"]`).
    pub fn path_segments(&self) -> Vec<&str> {
        self.path.split('/').filter(|s| !s.is_empty()).collect()
    }

    /// Payload as text, replacing invalid UTF-8.
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Full url as `path?query`.
    pub fn url(&self) -> String {
        if self.query.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, self.query.join("&"))
        }
    }
}

/// The server's answer to an [`InboundRequest`].
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundResponse {
    pub code: ResponseCode,
    pub payload: Vec<u8>,
    pub location_path: Vec<String>,
    pub content_format: Option<ContentFormat>,
    /// Answer with a reset message instead of a response
    pub reset: bool,
}

impl OutboundResponse {
    pub fn new(code: ResponseCode) -> Self {
        Self {
            code,
            payload: Vec::new(),
            location_path: Vec::new(),
            content_format: None,
            reset: false,
        }
    }

    /// A reset message; used for empty confirmable messages.
    pub fn reset() -> Self {
        Self {
            reset: true,
            ..Self::new(ResponseCode::Other(0, 0))
        }
    }

    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.payload = text.into().into_bytes();
        self.content_format = Some(ContentFormat::TextPlain);
        self
    }

    #[must_use]
    pub fn with_link_format(mut self, links: impl Into<String>) -> Self {
        self.payload = links.into().into_bytes();
        self.content_format = Some(ContentFormat::LinkFormat);
        self
    }

    #[must_use]
    pub fn with_location<I, S>(mut self, segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.location_path = segments.into_iter().map(Into::into).collect();
        self
    }

    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

// ============================================================================
// Server → Device
// ============================================================================

/// Descriptor of a request the server sends to a device.
#[derive(Debug, Clone, PartialEq)]
pub struct CoapRequest {
    pub hostname: String,
    pub port: u16,
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub payload: Option<Vec<u8>>,
    pub accept: Option<ContentFormat>,
    pub content_format: Option<ContentFormat>,
    /// `Some(true)` registers an observation, `Some(false)` deregisters it
    pub observe: Option<bool>,
}

impl CoapRequest {
    pub fn new(
        method: Method,
        hostname: impl Into<String>,
        port: u16,
        path: impl Into<String>,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            method,
            path: path.into(),
            query: None,
            payload: None,
            accept: None,
            content_format: None,
            observe: None,
        }
    }

    #[must_use]
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        let query = query.into();
        self.query = (!query.is_empty()).then_some(query);
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>, format: ContentFormat) -> Self {
        self.payload = Some(payload.into());
        self.content_format = Some(format);
        self
    }

    #[must_use]
    pub fn with_accept(mut self, format: ContentFormat) -> Self {
        self.accept = Some(format);
        self
    }

    #[must_use]
    pub fn with_observe(mut self, register: bool) -> Self {
        self.observe = Some(register);
        self
    }

    /// `host:port` of the target device.
    pub fn authority(&self) -> String {
        if self.hostname.contains(':') {
            format!("[{}]:{}", self.hostname, self.port)
        } else {
            format!("{}:{}", self.hostname, self.port)
        }
    }
}

/// A decoded response (or notification) from a device.
#[derive(Debug, Clone, PartialEq)]
pub struct CoapResponse {
    pub code: ResponseCode,
    pub payload: Option<Value>,
    pub content_format: Option<ContentFormat>,
}

impl CoapResponse {
    pub fn new(code: ResponseCode) -> Self {
        Self {
            code,
            payload: None,
            content_format: None,
        }
    }

    /// The sentinel produced when no answer arrives in time.
    pub fn timeout() -> Self {
        Self::new(ResponseCode::Timeout)
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    #[must_use]
    pub fn is_timeout(&self) -> bool {
        self.code.is_timeout()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:5683".parse().unwrap()
    }

    #[test]
    fn test_inbound_query_and_segments() {
        let req = InboundRequest::new(Method::Post, "/rd", addr()).with_query("ep=dev1&lt=300");
        assert_eq!(req.query, vec!["ep=dev1", "lt=300"]);
        assert_eq!(req.path_segments(), vec!["rd"]);
        assert_eq!(req.url(), "/rd?ep=dev1&lt=300");
    }

    #[test]
    fn test_content_format_round_values() {
        assert_eq!(ContentFormat::from_u16(11543), ContentFormat::Lwm2mJson);
        assert_eq!(ContentFormat::Other(99).to_u16(), 99);
        assert_eq!(
            ContentFormat::for_data_format(DataFormat::Tlv),
            ContentFormat::Lwm2mTlv
        );
    }

    #[test]
    fn test_request_authority_brackets_ipv6() {
        let req = CoapRequest::new(Method::Get, "::1", 5683, "/3/0");
        assert_eq!(req.authority(), "[::1]:5683");
        let req = CoapRequest::new(Method::Get, "10.0.0.1", 5683, "/3/0").with_query("");
        assert_eq!(req.query, None);
    }
}
