//! Classification of inbound device requests.

use crate::message::{InboundRequest, Method};
use std::fmt;

/// What an inbound request asks the server to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// `POST /rd`
    Register,
    /// `POST /rd/<id>` (any other POST)
    Update,
    /// `DELETE /rd/<id>`
    Deregister,
    /// `PUT /rd/<id>?chk=..`
    Check,
    /// Any GET other than `/test`
    Lookup,
    /// `GET /test`, the server's own reachability check
    Diagnostic,
    /// Confirmable empty message; answered with a reset
    Empty,
}

impl RequestKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Register => "register",
            Self::Update => "update",
            Self::Deregister => "deregister",
            Self::Check => "check",
            Self::Lookup => "lookup",
            Self::Diagnostic => "test",
            Self::Empty => "empty",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classifies a request; `None` when the message is neither a known request
/// nor an empty confirmable message.
pub fn classify(request: &InboundRequest) -> Option<RequestKind> {
    let Some(method) = request.method else {
        return (request.confirmable && request.payload.is_empty()).then_some(RequestKind::Empty);
    };

    let segments = request.path_segments();
    let kind = match method {
        Method::Post if segments == ["rd"] => RequestKind::Register,
        Method::Post => RequestKind::Update,
        Method::Put => RequestKind::Check,
        Method::Delete => RequestKind::Deregister,
        Method::Get if segments.first() == Some(&"test") => RequestKind::Diagnostic,
        Method::Get => RequestKind::Lookup,
    };
    Some(kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn addr() -> SocketAddr {
        "192.168.1.20:56830".parse().unwrap()
    }

    #[test]
    fn test_classify_methods() {
        let cases = [
            (Method::Post, "/rd", RequestKind::Register),
            (Method::Post, "/rd/", RequestKind::Register),
            (Method::Post, "/rd/3", RequestKind::Update),
            (Method::Put, "/rd/3", RequestKind::Check),
            (Method::Delete, "/rd/3", RequestKind::Deregister),
            (Method::Get, "/test", RequestKind::Diagnostic),
            (Method::Get, "/rd-lookup/ep", RequestKind::Lookup),
        ];
        for (method, path, expected) in cases {
            let req = InboundRequest::new(method, path, addr());
            assert_eq!(classify(&req), Some(expected), "{method} {path}");
        }
    }

    #[test]
    fn test_classify_empty_message() {
        let req = InboundRequest::empty(addr());
        assert_eq!(classify(&req), Some(RequestKind::Empty));

        let mut non_confirmable = InboundRequest::empty(addr());
        non_confirmable.confirmable = false;
        assert_eq!(classify(&non_confirmable), None);
    }
}
