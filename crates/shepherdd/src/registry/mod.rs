//! Device registry using the Actor pattern.
//!
//! The registry is the central state manager for all registered devices.
//! It receives commands via a tokio mpsc channel and maintains the canonical
//! source of truth for device sessions.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌──────────────────┐
//! │   Dispatcher    │────▶│  RegistryActor  │────▶│ Broadcast Channel│
//! └─────────────────┘     └─────────────────┘     └──────────────────┘
//!         │                  ▲     │    ▲                  │
//!         │ RegistryCommand  │     │    │ timers, pings,   │ ShepherdEvent
//!         │ (mpsc channel)   │     ▼    │ notifications    ▼
//!    register / update /   Storage   background tasks   subscribers
//!    device operations
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All operations in this module follow the panic-free policy:
//! - No `.unwrap()` or `.expect()` in production code
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

mod actor;
mod bootstrap;
mod commands;
mod handle;
mod policy;

pub use actor::RegistryActor;
pub use bootstrap::BACKGROUND_RETRIES;
pub use commands::{
    Admission, DeviceOp, DeviceResponse, RegisterOutcome, RegistryCommand, RegistryError,
    ShepherdEvent, TimerEvent, UpdateOutcome,
};
pub use handle::RegistryHandle;
pub use policy::{AcceptAll, AdmissionPolicy, AllowList, PolicyDecision, PolicyError};

use crate::config::ShepherdConfig;
use crate::storage::Storage;
use crate::transport::Transport;

/// Channel buffer sizes
const COMMAND_BUFFER: usize = 100;
const EVENT_BUFFER: usize = 100;

/// Spawn the registry actor and return a handle for interaction.
///
/// This function:
/// 1. Creates command and event channels
/// 2. Spawns the RegistryActor on a tokio task
/// 3. Spawns the heartbeat sweep task (period `hb_timeout`)
/// 4. Returns a RegistryHandle for client use
///
/// Persisted devices are not loaded here; call
/// [`RegistryHandle::restore`] once the transport is up.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use shepherdd::config::ShepherdConfig;
/// use shepherdd::registry::{spawn_registry, AcceptAll};
/// use shepherdd::storage::MemoryStorage;
/// use shepherdd::testing::ScriptedTransport;
///
/// #[tokio::main]
/// async fn main() {
///     let handle = spawn_registry(
///         Arc::new(ShepherdConfig::default()),
///         Arc::new(MemoryStorage::new()),
///         ScriptedTransport::new(),
///         Arc::new(AcceptAll),
///     );
///     let devices = handle.list().await;
/// }
/// ```
pub fn spawn_registry(
    config: Arc<ShepherdConfig>,
    storage: Arc<dyn Storage>,
    transport: Arc<dyn Transport>,
    policy: Arc<dyn AdmissionPolicy>,
) -> RegistryHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let (event_tx, _) = broadcast::channel(EVENT_BUFFER);

    let actor = RegistryActor::new(
        cmd_rx,
        cmd_tx.downgrade(),
        Arc::clone(&config),
        storage,
        Arc::clone(&transport),
        event_tx.clone(),
    );
    tokio::spawn(actor.run());

    spawn_heartbeat_sweep(cmd_tx.clone(), &config);

    RegistryHandle::new(cmd_tx, event_tx, transport, policy, config)
}

/// Spawn a background task that triggers the periodic heartbeat sweep.
fn spawn_heartbeat_sweep(sender: mpsc::Sender<RegistryCommand>, config: &ShepherdConfig) {
    // A zero period would make the interval panic.
    let period = config.heartbeat_timeout().max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            if sender.send(RegistryCommand::HeartbeatSweep).await.is_err() {
                debug!("Heartbeat sweep stopping: registry channel closed");
                break;
            }
        }
    });
}
