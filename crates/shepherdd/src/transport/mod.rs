//! CoAP transport interface.
//!
//! The registry only ever needs "send this request, give me the response or
//! a timeout". Inbound device requests arrive on a channel as
//! [`InboundExchange`]s carrying a [`Responder`] for the answer.
//!
//! ```text
//!  devices ──datagrams──▶ UdpTransport ──InboundExchange──▶ ShepherdServer
//!     ▲                        │  ▲
//!     └──── CoapRequest ───────┘  └── request()/observe()/send() ── registry
//! ```

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use shepherd_protocol::{CoapRequest, CoapResponse, InboundRequest, OutboundResponse};

mod udp;

pub use udp::UdpTransport;

/// Hard transport failures. A missing answer is not an error: it resolves
/// as [`CoapResponse::timeout`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("cannot resolve device address {0}")]
    InvalidAddress(String),

    #[error("socket error: {0}")]
    Io(String),

    #[error("transport is closed")]
    Closed,
}

/// Initial answer to an observe request plus the stream of later
/// notifications.
///
/// `notifications` is `None` when the device refused the observation.
/// Dropping the receiver ends the observation on the transport side.
#[derive(Debug)]
pub struct Observation {
    pub response: CoapResponse,
    pub notifications: Option<mpsc::Receiver<CoapResponse>>,
}

impl Observation {
    /// An observation the device refused or never answered.
    pub fn refused(response: CoapResponse) -> Self {
        Self {
            response,
            notifications: None,
        }
    }
}

/// Outbound side of the CoAP transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends a request and waits for its response or the timeout sentinel.
    async fn request(&self, request: CoapRequest) -> Result<CoapResponse, TransportError>;

    /// Sends an observe-register request.
    async fn observe(&self, request: CoapRequest) -> Result<Observation, TransportError>;

    /// Sends a request without waiting for any answer.
    async fn send(&self, request: CoapRequest) -> Result<(), TransportError>;
}

// ============================================================================
// Inbound side
// ============================================================================

/// One-shot channel back to the transport for the answer to an inbound
/// request.
#[derive(Debug)]
pub struct Responder {
    sender: oneshot::Sender<OutboundResponse>,
}

impl Responder {
    pub fn new(sender: oneshot::Sender<OutboundResponse>) -> Self {
        Self { sender }
    }

    /// Creates a responder and the receiver its answer arrives on.
    pub fn channel() -> (Self, oneshot::Receiver<OutboundResponse>) {
        let (tx, rx) = oneshot::channel();
        (Self::new(tx), rx)
    }

    /// Sends the answer; a transport that stopped listening is ignored.
    pub fn respond(self, response: OutboundResponse) {
        let _ = self.sender.send(response);
    }
}

/// An inbound request together with the channel for its answer.
#[derive(Debug)]
pub struct InboundExchange {
    pub request: InboundRequest,
    pub responder: Responder,
}
