//! CoAP server front for the device registry.
//!
//! The server:
//! - Opens the configured storage and binds the UDP transport
//! - Spawns the registry and restores persisted devices
//! - Dispatches every inbound request on its own task
//! - Sends itself `GET /test` before announcing `ready`
//! - Supports graceful shutdown via CancellationToken
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐  InboundExchange  ┌─────────────────┐
//! │  UdpTransport   │──────────────────▶│ ShepherdServer  │
//! └─────────────────┘                   └───────┬─────────┘
//!         ▲                                     │ spawn per request
//!         │ OutboundResponse                    ▼
//!         │                             ┌─────────────────┐     ┌─────────────────┐
//!         └─────────────────────────────│   Dispatcher    │────▶│ RegistryHandle  │
//!                                       └─────────────────┘     └─────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Startup failures are returned as [`ServerError`]
//! - A failing request only affects its own response

mod dispatcher;

pub use dispatcher::{DispatchError, Dispatcher, DIAGNOSTIC_REPLY};

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use shepherd_protocol::{CoapRequest, Method, ResponseCode};

use crate::config::{ShepherdConfig, StorageKind};
use crate::registry::{
    spawn_registry, AdmissionPolicy, RegistryError, RegistryHandle, ShepherdEvent,
};
use crate::storage::{JsonFileStorage, MemoryStorage, Storage, StorageError};
use crate::transport::{InboundExchange, Transport, TransportError, UdpTransport};

/// Errors that stop the server from starting.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to open device store: {0}")]
    Storage(#[from] StorageError),

    #[error("Failed to bind {addr}: {error}")]
    Bind { addr: SocketAddr, error: TransportError },

    #[error("Failed to restore devices: {0}")]
    Restore(#[from] RegistryError),
}

/// The running server: transport, registry and request loop.
pub struct ShepherdServer {
    registry: RegistryHandle,

    transport: Arc<dyn Transport>,

    /// Inbound requests from devices
    inbound: mpsc::Receiver<InboundExchange>,

    /// Cancellation token for graceful shutdown
    cancel_token: CancellationToken,

    /// Address the self-test targets; `None` skips the self-test
    self_test_addr: Option<SocketAddr>,

    /// Kept to stop the receive loop on shutdown
    udp: Option<Arc<UdpTransport>>,
}

impl ShepherdServer {
    /// Opens storage, binds the socket, spawns the registry and restores
    /// persisted devices.
    pub async fn start(
        config: ShepherdConfig,
        policy: Arc<dyn AdmissionPolicy>,
        cancel_token: CancellationToken,
    ) -> Result<Self, ServerError> {
        let config = Arc::new(config);

        let storage: Arc<dyn Storage> = match config.storage.kind {
            StorageKind::Memory => Arc::new(MemoryStorage::new()),
            StorageKind::File => Arc::new(JsonFileStorage::open(&config.default_db_path).await?),
        };

        let addr = config.bind_addr();
        let (udp, inbound) = UdpTransport::bind(addr, config.request_timeout())
            .await
            .map_err(|error| ServerError::Bind { addr, error })?;
        let local = udp
            .local_addr()
            .map_err(|error| ServerError::Bind { addr, error })?;

        let transport: Arc<dyn Transport> = udp.clone();
        let registry = spawn_registry(Arc::clone(&config), storage, Arc::clone(&transport), policy);

        let restored = registry.restore().await?;
        info!(addr = %local, restored, "Server started");

        Ok(Self {
            registry,
            transport,
            inbound,
            cancel_token,
            self_test_addr: Some(self_test_target(local)),
            udp: Some(udp),
        })
    }

    /// Assembles a server around an already running registry and transport.
    ///
    /// No self-test is made; `ready` is published as soon as [`run`] starts.
    ///
    /// [`run`]: ShepherdServer::run
    pub fn with_transport(
        registry: RegistryHandle,
        transport: Arc<dyn Transport>,
        inbound: mpsc::Receiver<InboundExchange>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            registry,
            transport,
            inbound,
            cancel_token,
            self_test_addr: None,
            udp: None,
        }
    }

    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    /// Serves inbound requests until the cancellation token is triggered or
    /// the transport closes.
    pub async fn run(mut self) -> Result<(), ServerError> {
        let dispatcher = Dispatcher::new(self.registry.clone());
        self.spawn_self_test();

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Server shutdown requested");
                    break;
                }

                exchange = self.inbound.recv() => {
                    let Some(exchange) = exchange else {
                        warn!("Transport closed, stopping server");
                        break;
                    };
                    let dispatcher = dispatcher.clone();
                    tokio::spawn(async move {
                        let response = dispatcher.dispatch(exchange.request).await;
                        exchange.responder.respond(response);
                    });
                }
            }
        }

        self.cleanup().await;
        Ok(())
    }

    /// Publishes `ready` once the server answers its own `GET /test`.
    fn spawn_self_test(&self) {
        let registry = self.registry.clone();
        let Some(target) = self.self_test_addr else {
            registry.publish(ShepherdEvent::Ready);
            return;
        };

        let transport = Arc::clone(&self.transport);
        tokio::spawn(async move {
            let request =
                CoapRequest::new(Method::Get, target.ip().to_string(), target.port(), "/test");
            match transport.request(request).await {
                Ok(response) if response.code == ResponseCode::Content => {
                    debug!(addr = %target, "Self-test answered");
                    registry.publish(ShepherdEvent::Ready);
                }
                Ok(response) => {
                    error!(addr = %target, code = %response.code, "Self-test failed");
                    registry
                        .report_error(None, format!("self-test answered {}", response.code))
                        .await;
                }
                Err(e) => {
                    error!(addr = %target, error = %e, "Self-test failed");
                    registry.report_error(None, format!("self-test failed: {e}")).await;
                }
            }
        });
    }

    /// Stops the registry and the transport.
    async fn cleanup(&self) {
        if let Err(e) = self.registry.shutdown().await {
            debug!(error = %e, "Registry already stopped");
        }
        if let Some(udp) = &self.udp {
            udp.shutdown();
        }
        info!("Server cleanup complete");
    }
}

/// Address to reach the local socket; wildcard binds are reached on loopback.
fn self_test_target(local: SocketAddr) -> SocketAddr {
    let ip = match local.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    SocketAddr::new(ip, local.port())
}
