//! UDP transport.
//!
//! One socket serves both directions. Responses are correlated to requests
//! by token; a request without an answer within the request timeout
//! resolves as the timeout sentinel. Retransmission is left to devices.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use shepherd_protocol::codec::{self, MessageClass, MessageType, Packet};
use shepherd_protocol::{CoapRequest, CoapResponse};

use super::{InboundExchange, Observation, Responder, Transport, TransportError};

/// Largest datagram accepted.
pub const MAX_DATAGRAM_SIZE: usize = 1152;

/// Inbound requests queued before the receive loop waits on the server
const INBOUND_BUFFER: usize = 256;

/// Notifications queued per observation
const NOTIFICATION_BUFFER: usize = 32;

struct Observer {
    path: String,
    sender: mpsc::Sender<CoapResponse>,
}

/// CoAP over a single UDP socket.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    req_timeout: Duration,
    next_message_id: AtomicU16,
    next_token: AtomicU64,
    /// token → waiter for the first answer
    pending: Mutex<HashMap<Vec<u8>, oneshot::Sender<Packet>>>,
    /// token → notification stream of an open observation
    observers: Arc<Mutex<HashMap<Vec<u8>, Observer>>>,
    cancel: CancellationToken,
}

impl UdpTransport {
    /// Binds the socket and starts the receive loop.
    ///
    /// Returns the transport and the channel inbound device requests arrive
    /// on.
    pub async fn bind(
        addr: SocketAddr,
        req_timeout: Duration,
    ) -> Result<(Arc<Self>, mpsc::Receiver<InboundExchange>), TransportError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;

        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1);

        let transport = Arc::new(Self {
            socket: Arc::new(socket),
            req_timeout,
            next_message_id: AtomicU16::new(seed as u16),
            next_token: AtomicU64::new(seed),
            pending: Mutex::new(HashMap::new()),
            observers: Arc::new(Mutex::new(HashMap::new())),
            cancel: CancellationToken::new(),
        });

        if let Ok(local) = transport.socket.local_addr() {
            info!(addr = %local, "CoAP transport listening");
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        tokio::spawn(Arc::clone(&transport).receive_loop(inbound_tx));

        Ok((transport, inbound_rx))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.socket
            .local_addr()
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    /// Stops the receive loop; in-flight requests fail with `Closed`.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn message_id(&self) -> u16 {
        self.next_message_id.fetch_add(1, Ordering::Relaxed)
    }

    fn token(&self) -> Vec<u8> {
        self.next_token
            .fetch_add(1, Ordering::Relaxed)
            .to_be_bytes()
            .to_vec()
    }

    async fn resolve(request: &CoapRequest) -> Result<SocketAddr, TransportError> {
        let authority = request.authority();
        let mut addrs = lookup_host(authority.clone())
            .await
            .map_err(|_| TransportError::InvalidAddress(authority.clone()))?;
        addrs.next().ok_or(TransportError::InvalidAddress(authority))
    }

    async fn send_packet(&self, packet: &Packet, target: SocketAddr) -> Result<(), TransportError> {
        let bytes = codec::encode(packet).map_err(|e| TransportError::Io(e.to_string()))?;
        self.socket
            .send_to(&bytes, target)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(())
    }

    /// Drops the observer entry for `token` once its notification receiver
    /// is gone.
    fn watch_observer(&self, token: Vec<u8>, sender: mpsc::Sender<CoapResponse>) {
        let observers = Arc::clone(&self.observers);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = sender.closed() => {
                    observers.lock().await.remove(&token);
                    debug!("Observation receiver dropped, forgetting token");
                }
            }
        });
    }

    /// Sends a confirmable request and waits for the first answer on `token`.
    async fn exchange(
        &self,
        request: &CoapRequest,
        token: Vec<u8>,
    ) -> Result<CoapResponse, TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let target = Self::resolve(request).await?;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(token.clone(), tx);

        let packet = codec::request_packet(request, self.message_id(), token.clone());
        if let Err(e) = self.send_packet(&packet, target).await {
            self.pending.lock().await.remove(&token);
            return Err(e);
        }
        debug!(method = %request.method, path = %request.path, target = %target, "Request sent");

        match timeout(self.req_timeout, rx).await {
            Ok(Ok(reply)) => Ok(codec::to_response(&reply, &request.path)),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.pending.lock().await.remove(&token);
                debug!(path = %request.path, target = %target, "Request timed out");
                Ok(CoapResponse::timeout())
            }
        }
    }

    async fn send_empty(&self, message_type: MessageType, message_id: u16, target: SocketAddr) {
        let packet = codec::empty(message_type, message_id);
        if let Err(e) = self.send_packet(&packet, target).await {
            warn!(target = %target, error = %e, "Failed to send empty message");
        }
    }

    // ========================================================================
    // Receive loop
    // ========================================================================

    async fn receive_loop(self: Arc<Self>, inbound: mpsc::Sender<InboundExchange>) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            let (len, source) = tokio::select! {
                _ = self.cancel.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        warn!(error = %e, "UDP receive failed");
                        continue;
                    }
                },
            };

            let Some(datagram) = buf.get(..len) else {
                continue;
            };
            let packet = match codec::decode(datagram) {
                Ok(packet) => packet,
                Err(e) => {
                    debug!(source = %source, error = %e, "Dropping undecodable datagram");
                    continue;
                }
            };

            if codec::is_request(&packet) {
                self.handle_request(packet, source, &inbound).await;
            } else {
                self.handle_response(packet, source).await;
            }
        }

        self.pending.lock().await.clear();
        self.observers.lock().await.clear();
        debug!("UDP receive loop stopped");
    }

    async fn handle_request(
        &self,
        packet: Packet,
        source: SocketAddr,
        inbound: &mpsc::Sender<InboundExchange>,
    ) {
        // Empty ACK/RST answers to our own messages carry nothing to act on
        if packet.header.code == MessageClass::Empty
            && packet.header.get_type() != MessageType::Confirmable
        {
            return;
        }
        let Some(request) = codec::to_inbound(&packet, source) else {
            debug!(source = %source, code = u8::from(packet.header.code), "Ignoring unsupported request code");
            return;
        };

        let (responder, answer) = Responder::channel();
        if inbound.send(InboundExchange { request, responder }).await.is_err() {
            debug!("Inbound channel closed, dropping request");
            return;
        }

        let socket = Arc::clone(&self.socket);
        tokio::spawn(async move {
            let Ok(response) = answer.await else {
                return;
            };
            let reply = codec::response_packet(&packet, &response);
            let sent = match codec::encode(&reply) {
                Ok(bytes) => socket
                    .send_to(&bytes, source)
                    .await
                    .map(|_| ())
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            if let Err(e) = sent {
                warn!(target = %source, error = %e, "Failed to send response");
            }
        });
    }

    async fn handle_response(&self, packet: Packet, source: SocketAddr) {
        let confirmable = packet.header.get_type() == MessageType::Confirmable;
        let message_id = packet.header.message_id;
        let token = packet.get_token().to_vec();

        let waiter = self.pending.lock().await.remove(&token);
        if let Some(waiter) = waiter {
            if confirmable {
                self.send_empty(MessageType::Acknowledgement, message_id, source).await;
            }
            let _ = waiter.send(packet);
            return;
        }

        let target = self
            .observers
            .lock()
            .await
            .get(&token)
            .map(|observer| (observer.path.clone(), observer.sender.clone()));

        let Some((path, sender)) = target else {
            // Unknown token: tell the device to stop sending
            if confirmable {
                self.send_empty(MessageType::Reset, message_id, source).await;
            }
            return;
        };

        if sender.send(codec::to_response(&packet, &path)).await.is_err() {
            self.observers.lock().await.remove(&token);
            debug!(path = %path, source = %source, "Observation closed, resetting notification");
            self.send_empty(MessageType::Reset, message_id, source).await;
        } else if confirmable {
            self.send_empty(MessageType::Acknowledgement, message_id, source).await;
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn request(&self, request: CoapRequest) -> Result<CoapResponse, TransportError> {
        let token = self.token();
        self.exchange(&request, token).await
    }

    async fn observe(&self, request: CoapRequest) -> Result<Observation, TransportError> {
        let token = self.token();
        let (tx, rx) = mpsc::channel(NOTIFICATION_BUFFER);
        self.observers.lock().await.insert(
            token.clone(),
            Observer {
                path: request.path.clone(),
                sender: tx.clone(),
            },
        );

        let response = match self.exchange(&request, token.clone()).await {
            Ok(response) => response,
            Err(e) => {
                self.observers.lock().await.remove(&token);
                return Err(e);
            }
        };

        if response.code.is_success() {
            self.watch_observer(token, tx);
            Ok(Observation {
                response,
                notifications: Some(rx),
            })
        } else {
            self.observers.lock().await.remove(&token);
            Ok(Observation::refused(response))
        }
    }

    async fn send(&self, request: CoapRequest) -> Result<(), TransportError> {
        let target = Self::resolve(&request).await?;
        let mut packet = codec::request_packet(&request, self.message_id(), self.token());
        packet.header.set_type(MessageType::NonConfirmable);
        self.send_packet(&packet, target).await
    }
}
