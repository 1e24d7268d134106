//! Shepherd Daemon - LWM2M device registry and CoAP server
//!
//! This crate provides the server side of coap-shepherd:
//! - `registry` - Device registry actor owning every device session
//! - `session` - Per-device state: status, timers, observations
//! - `server` - Request loop and dispatcher for inbound device requests
//! - `transport` - CoAP transport interface and its UDP implementation
//! - `storage` - Persistence of device records
//! - `config` - Server settings
//! - `testing` - Scripted transport and dispatch harness
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      shepherdd daemon                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐   │
//! │  │ ShepherdServer  │────▶│       RegistryActor         │   │
//! │  │  (UDP, CoAP)    │     │  (device session owner)     │   │
//! │  └────────┬────────┘     └──────────────┬──────────────┘   │
//! │           │                             │                   │
//! │           │ inbound requests            │ events            │
//! │           ▼                             ▼                   │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐   │
//! │  │   Dispatcher    │     │   broadcast::Sender         │   │
//! │  │  (per request)  │     │   (ShepherdEvent)           │   │
//! │  └─────────────────┘     └─────────────────────────────┘   │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod config;
pub mod registry;
pub mod server;
pub mod session;
pub mod storage;
pub mod testing;
pub mod transport;
