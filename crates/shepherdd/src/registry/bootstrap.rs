//! Background work that follows a registration or a wake-up.
//!
//! Both loops retry twice and then give up with an `error` event; they never
//! take the registry down with them.

use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info, warn};

use shepherd_core::{ClientName, HEARTBEAT_PATH};
use shepherd_protocol::ResponseCode;

use super::commands::RegistryError;
use super::handle::RegistryHandle;

/// Attempts after the first one.
pub const BACKGROUND_RETRIES: usize = 2;

/// Delay before bootstrap starts, so the device sees its `2.01` first.
const BOOTSTRAP_DELAY: Duration = Duration::from_millis(100);

/// Delay before a woken device is pinged.
const CHECK_IN_DELAY: Duration = Duration::from_millis(50);

/// Post-registration bootstrap: read, save, observe heartbeat, announce,
/// go online, then re-observe.
pub(crate) async fn run_bootstrap(handle: RegistryHandle, client_name: ClientName, is_new: bool) {
    sleep(BOOTSTRAP_DELAY).await;

    let mut last_error = None;
    for attempt in 0..=BACKGROUND_RETRIES {
        match bootstrap_once(&handle, &client_name, is_new).await {
            Ok(()) => {
                info!(client_name = %client_name, is_new, "Device bootstrap complete");
                return;
            }
            Err(RegistryError::ChannelClosed) => return,
            // The device left while bootstrapping
            Err(RegistryError::DeviceNotFound(_)) => return,
            Err(e) => {
                warn!(client_name = %client_name, attempt, error = %e, "Bootstrap attempt failed");
                last_error = Some(e);
            }
        }
    }

    if let Some(e) = last_error {
        handle
            .report_error(Some(client_name), format!("bootstrap failed: {e}"))
            .await;
    }
}

async fn bootstrap_once(
    handle: &RegistryHandle,
    client_name: &ClientName,
    is_new: bool,
) -> Result<(), RegistryError> {
    if handle.config().auto_read_resources {
        handle.read_all(client_name).await?;
    }
    handle.persist(client_name).await?;

    let heartbeat_enabled = handle
        .find(client_name)
        .await
        .is_some_and(|device| device.heartbeat_enabled);
    if heartbeat_enabled {
        let reply = handle.observe(client_name, HEARTBEAT_PATH).await?;
        if reply.status != ResponseCode::Content {
            debug!(client_name = %client_name, code = %reply.status, "Heartbeat not observable");
        }
    }

    let paths = handle.bootstrap_complete(client_name, is_new).await?;

    let mut failed = Vec::new();
    for path in paths {
        match handle.observe(client_name, &path).await {
            Ok(reply) if reply.status == ResponseCode::Content => {}
            Ok(reply) => {
                debug!(client_name = %client_name, path, code = %reply.status, "Re-observe refused");
                failed.push(path);
            }
            Err(e) => {
                debug!(client_name = %client_name, path, error = %e, "Re-observe failed");
                failed.push(path);
            }
        }
    }
    handle.prune_observed(client_name, failed).await;
    Ok(())
}

/// Confirms a woken device is reachable, then marks it online.
pub(crate) async fn run_check_in(handle: RegistryHandle, client_name: ClientName) {
    sleep(CHECK_IN_DELAY).await;

    let heartbeat_enabled = match handle.find(&client_name).await {
        Some(device) => device.heartbeat_enabled,
        None => return,
    };

    let mut last_error = String::new();
    for attempt in 0..=BACKGROUND_RETRIES {
        let result = if heartbeat_enabled {
            handle.observe(&client_name, HEARTBEAT_PATH).await
        } else {
            handle.ping(&client_name).await
        };

        match result {
            Ok(reply) if reply.status == ResponseCode::Content => {
                handle.confirm_check_in(&client_name).await;
                debug!(client_name = %client_name, "Check-in confirmed");
                return;
            }
            Ok(reply) => last_error = format!("device answered {}", reply.status),
            Err(RegistryError::ChannelClosed) | Err(RegistryError::DeviceNotFound(_)) => return,
            Err(e) => last_error = e.to_string(),
        }
        warn!(client_name = %client_name, attempt, error = %last_error, "Check-in ping failed");
    }

    handle
        .report_error(Some(client_name), format!("check-in failed: {last_error}"))
        .await;
}
