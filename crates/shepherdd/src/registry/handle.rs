//! Client interface for interacting with the RegistryActor.
//!
//! The `RegistryHandle` provides a cheap-to-clone interface for sending commands
//! to the registry actor, for running device operations, and for subscribing
//! to lifecycle events.
//!
//! Device operations follow prepare → exchange → complete: the actor builds
//! and validates the request, the handle performs the exchange on the
//! caller's task, and the actor applies the result.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Channel errors are mapped to `RegistryError::ChannelClosed`

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

use shepherd_core::{
    ClientId, ClientName, DeviceAttrs, DeviceView, DomainError, ReportAttrs, ResourcePath,
};
use shepherd_protocol::{CoapResponse, ExecArg};

use super::bootstrap;
use super::commands::{
    Admission, DeviceOp, DeviceResponse, RegisterOutcome, RegistryCommand, RegistryError,
    ShepherdEvent, UpdateOutcome,
};
use super::policy::{AdmissionPolicy, PolicyDecision};
use crate::config::ShepherdConfig;
use crate::transport::Transport;

// ============================================================================
// Registry Handle
// ============================================================================

/// Handle for interacting with the registry actor.
///
/// # Usage
///
/// ```ignore
/// let handle = registry_handle.clone();
///
/// let reply = handle.read(&ClientName::new("dev1"), "/3/0/0").await?;
///
/// let mut events = handle.subscribe();
/// while let Ok(event) = events.recv().await {
///     // Handle event
/// }
/// ```
#[derive(Clone)]
pub struct RegistryHandle {
    sender: mpsc::Sender<RegistryCommand>,
    event_sender: broadcast::Sender<ShepherdEvent>,
    transport: Arc<dyn Transport>,
    policy: Arc<dyn AdmissionPolicy>,
    config: Arc<ShepherdConfig>,
}

impl RegistryHandle {
    pub fn new(
        sender: mpsc::Sender<RegistryCommand>,
        event_sender: broadcast::Sender<ShepherdEvent>,
        transport: Arc<dyn Transport>,
        policy: Arc<dyn AdmissionPolicy>,
        config: Arc<ShepherdConfig>,
    ) -> Self {
        Self {
            sender,
            event_sender,
            transport,
            policy,
            config,
        }
    }

    pub fn config(&self) -> &ShepherdConfig {
        &self.config
    }

    /// Sends a request-style command and waits for its answer.
    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> RegistryCommand,
    ) -> Result<T, RegistryError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(make(tx))
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;
        rx.await.map_err(|_| RegistryError::ChannelClosed)
    }

    /// Fire-and-forget; a stopped actor is ignored.
    async fn notify(&self, cmd: RegistryCommand) {
        let _ = self.sender.send(cmd).await;
    }

    // ========================================================================
    // Lookups
    // ========================================================================

    /// Returns `None` if the device is unknown or the actor is gone.
    pub async fn find(&self, client_name: &ClientName) -> Option<DeviceView> {
        let client_name = client_name.clone();
        self.call(|respond_to| RegistryCommand::Find {
            client_name,
            respond_to,
        })
        .await
        .ok()?
    }

    /// Every device registered with `mac`.
    pub async fn find_by_mac(&self, mac: &str) -> Vec<DeviceView> {
        let mac = mac.to_string();
        self.call(|respond_to| RegistryCommand::FindByMac { mac, respond_to })
            .await
            .unwrap_or_default()
    }

    pub async fn find_by_client_id(&self, client_id: ClientId) -> Option<DeviceView> {
        self.call(|respond_to| RegistryCommand::FindByClientId {
            client_id,
            respond_to,
        })
        .await
        .ok()?
    }

    /// Looks a device up by `/rd/<clientId>`.
    pub async fn find_by_location_path(&self, location_path: &str) -> Option<DeviceView> {
        let location_path = location_path.to_string();
        self.call(|respond_to| RegistryCommand::FindByLocationPath {
            location_path,
            respond_to,
        })
        .await
        .ok()?
    }

    /// Summaries of every device, ordered by client id.
    pub async fn list(&self) -> Vec<DeviceView> {
        self.call(|respond_to| RegistryCommand::List { respond_to })
            .await
            .unwrap_or_default()
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Registers a device, consulting the admission policy for new client
    /// names, and starts its bootstrap in the background.
    ///
    /// # Errors
    ///
    /// - `RegistryError::InvalidAttributes` without client name or object list
    /// - `RegistryError::NotJoinable` / `RegistryError::RegistryFull` for a new device
    /// - `RegistryError::AdmissionRejected` when the policy says no
    /// - `RegistryError::AdmissionFailed` when the policy itself fails
    /// - `RegistryError::Storage` when the record cannot be saved
    pub async fn register(&self, attrs: DeviceAttrs) -> Result<RegisterOutcome, RegistryError> {
        let admit_attrs = Box::new(attrs.clone());
        let admission = self
            .call(|respond_to| RegistryCommand::Admit {
                attrs: admit_attrs,
                respond_to,
            })
            .await??;

        let extra = match admission {
            Admission::Existing => None,
            Admission::New => {
                let client_name = attrs.client_name.clone().unwrap_or_default();
                match self.policy.admit(&attrs).await {
                    Ok(PolicyDecision::Accept { extra }) => extra,
                    Ok(PolicyDecision::Reject) => {
                        debug!(client_name = %client_name, "Admission policy rejected device");
                        return Err(RegistryError::AdmissionRejected(client_name));
                    }
                    Err(e) => {
                        let message = format!("admission policy failed: {e}");
                        self.report_error(Some(client_name), message).await;
                        return Err(RegistryError::AdmissionFailed(e.0));
                    }
                }
            }
        };

        let outcome = self
            .call(|respond_to| RegistryCommand::Register {
                attrs: Box::new(attrs),
                extra,
                respond_to,
            })
            .await??;

        tokio::spawn(bootstrap::run_bootstrap(
            self.clone(),
            outcome.client_name.clone(),
            outcome.is_new,
        ));
        Ok(outcome)
    }

    /// Registration update addressed by location path.
    ///
    /// When the object list changed and auto-read is on, resources are
    /// re-read and saved before this returns, and `device::update` fires
    /// only once that succeeded. A failed re-read is also reported as an
    /// `error` event.
    pub async fn update(
        &self,
        location_path: &str,
        attrs: DeviceAttrs,
    ) -> Result<UpdateOutcome, RegistryError> {
        let location_path = location_path.to_string();
        let outcome = self
            .call(|respond_to| RegistryCommand::Update {
                location_path,
                attrs: Box::new(attrs),
                respond_to,
            })
            .await??;

        if outcome.reread {
            let reread = match self.read_all(&outcome.client_name).await {
                Ok(()) => self.persist(&outcome.client_name).await,
                Err(e) => Err(e),
            };
            if let Err(e) = reread {
                // Transport failures were already reported by the exchange
                if !matches!(e, RegistryError::Transport(_)) {
                    let message = format!("update failed: {e}");
                    self.report_error(Some(outcome.client_name.clone()), message).await;
                }
                return Err(e);
            }
            self.publish(ShepherdEvent::Update {
                client_name: outcome.client_name.clone(),
                diff: outcome.diff.clone(),
            });
        }
        Ok(outcome)
    }

    /// Removes a device; `Ok(false)` when it was not registered.
    pub async fn deregister(&self, client_name: &ClientName) -> Result<bool, RegistryError> {
        let client_name = client_name.clone();
        self.call(|respond_to| RegistryCommand::Deregister {
            client_name,
            respond_to,
        })
        .await?
    }

    /// The device goes to sleep, optionally for `duration` seconds.
    pub async fn check_out(
        &self,
        client_name: &ClientName,
        duration: Option<u64>,
    ) -> Result<(), RegistryError> {
        let client_name = client_name.clone();
        self.call(|respond_to| RegistryCommand::CheckOut {
            client_name,
            duration,
            respond_to,
        })
        .await?
    }

    /// The device woke up at `ip:port`; reachability is confirmed in the
    /// background.
    pub async fn check_in(
        &self,
        client_name: &ClientName,
        ip: impl Into<String>,
        port: u16,
    ) -> Result<(), RegistryError> {
        let ip = ip.into();
        let name = client_name.clone();
        self.call(|respond_to| RegistryCommand::CheckIn {
            client_name: name,
            ip,
            port,
            respond_to,
        })
        .await??;

        tokio::spawn(bootstrap::run_check_in(self.clone(), client_name.clone()));
        Ok(())
    }

    // ========================================================================
    // Join Gate
    // ========================================================================

    /// Opens the join window for `seconds`; `0` closes it. Returns the gate.
    pub async fn permit_join(&self, seconds: u64) -> Result<bool, RegistryError> {
        self.call(|respond_to| RegistryCommand::PermitJoin {
            seconds,
            respond_to,
        })
        .await
    }

    pub async fn always_permit_join(&self, enabled: bool) -> Result<bool, RegistryError> {
        self.call(|respond_to| RegistryCommand::AlwaysPermitJoin {
            enabled,
            respond_to,
        })
        .await
    }

    pub async fn is_joinable(&self) -> bool {
        self.call(|respond_to| RegistryCommand::IsJoinable { respond_to })
            .await
            .unwrap_or(false)
    }

    // ========================================================================
    // Device Operations
    // ========================================================================

    pub async fn read(
        &self,
        client_name: &ClientName,
        path: &str,
    ) -> Result<DeviceResponse, RegistryError> {
        let path = ResourcePath::parse(path)?;
        self.run_op(client_name, DeviceOp::Read { path }).await
    }

    /// Reads the link-format attributes of a path.
    pub async fn discover(
        &self,
        client_name: &ClientName,
        path: &str,
    ) -> Result<DeviceResponse, RegistryError> {
        let path = ResourcePath::parse(path)?;
        self.run_op(client_name, DeviceOp::Discover { path }).await
    }

    /// Writes `value`; with `transparent` the value goes out as opaque bytes.
    pub async fn write(
        &self,
        client_name: &ClientName,
        path: &str,
        value: Value,
        transparent: bool,
    ) -> Result<DeviceResponse, RegistryError> {
        let path = ResourcePath::parse(path)?;
        self.run_op(
            client_name,
            DeviceOp::Write {
                path,
                value,
                transparent,
            },
        )
        .await
    }

    /// Writes notification attributes (`pmin`, `pmax`, `gt`, `lt`, `stp`/`step`).
    ///
    /// # Errors
    ///
    /// - `RegistryError::Domain(AttributeNotAllowed)` for any other name
    pub async fn write_attrs<'a, I>(
        &self,
        client_name: &ClientName,
        path: &str,
        attrs: I,
    ) -> Result<DeviceResponse, RegistryError>
    where
        I: IntoIterator<Item = (&'a str, f64)>,
    {
        let path = ResourcePath::parse(path)?;
        let attrs = ReportAttrs::from_pairs(attrs)?;
        self.run_op(client_name, DeviceOp::WriteAttrs { path, attrs }).await
    }

    /// Executes a resource; arguments must be strings or numbers.
    pub async fn execute(
        &self,
        client_name: &ClientName,
        path: &str,
        args: &[Value],
    ) -> Result<DeviceResponse, RegistryError> {
        let path = ResourcePath::parse(path)?;
        let args = ExecArg::from_values(args)
            .map_err(|e| DomainError::invalid_value(path.to_string(), e.to_string()))?;
        self.run_op(client_name, DeviceOp::Execute { path, args }).await
    }

    /// Observes a path; later notifications flow into `device::notify`.
    pub async fn observe(
        &self,
        client_name: &ClientName,
        path: &str,
    ) -> Result<DeviceResponse, RegistryError> {
        let path = ResourcePath::parse(path)?;
        let op = DeviceOp::Observe { path: path.clone() };
        let request = self.prepare(client_name, op).await?;

        let observation = match self.transport.observe(request).await {
            Ok(observation) => observation,
            Err(e) => {
                return Err(self.transport_failed(client_name, "observe", e.to_string()).await)
            }
        };

        let name = client_name.clone();
        self.call(|respond_to| RegistryCommand::CompleteObserve {
            client_name: name,
            path,
            response: observation.response,
            notifications: observation.notifications,
            respond_to,
        })
        .await?
    }

    pub async fn cancel_observe(
        &self,
        client_name: &ClientName,
        path: &str,
    ) -> Result<DeviceResponse, RegistryError> {
        let path = ResourcePath::parse(path)?;
        self.run_op(client_name, DeviceOp::CancelObserve { path }).await
    }

    /// Pings the device; on `2.05` the data is the round-trip time in ms.
    pub async fn ping(&self, client_name: &ClientName) -> Result<DeviceResponse, RegistryError> {
        self.run_op(client_name, DeviceOp::Ping).await
    }

    async fn prepare(
        &self,
        client_name: &ClientName,
        op: DeviceOp,
    ) -> Result<shepherd_protocol::CoapRequest, RegistryError> {
        let client_name = client_name.clone();
        self.call(|respond_to| RegistryCommand::Prepare {
            client_name,
            op: Box::new(op),
            respond_to,
        })
        .await?
    }

    async fn run_op(
        &self,
        client_name: &ClientName,
        op: DeviceOp,
    ) -> Result<DeviceResponse, RegistryError> {
        let request = self.prepare(client_name, op.clone()).await?;

        let started = Instant::now();
        let response = match self.transport.request(request).await {
            Ok(response) => response,
            Err(e) => {
                return Err(self.transport_failed(client_name, op.name(), e.to_string()).await)
            }
        };
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let name = client_name.clone();
        self.call(|respond_to| RegistryCommand::Complete {
            client_name: name,
            op: Box::new(op),
            response,
            elapsed_ms,
            respond_to,
        })
        .await?
    }

    async fn transport_failed(
        &self,
        client_name: &ClientName,
        op: &str,
        message: String,
    ) -> RegistryError {
        warn!(client_name = %client_name, op, error = %message, "Transport failure");
        self.report_error(Some(client_name.clone()), format!("{op} failed: {message}"))
            .await;
        RegistryError::Transport(message)
    }

    // ========================================================================
    // Bootstrap steps
    // ========================================================================

    /// Reads every listed object into the resource tree.
    ///
    /// # Errors
    ///
    /// - `RegistryError::ObjectReadFailed` if any object does not answer `2.05`
    pub async fn read_all(&self, client_name: &ClientName) -> Result<(), RegistryError> {
        let name = client_name.clone();
        let requests = self
            .call(|respond_to| RegistryCommand::PrepareReadAll {
                client_name: name,
                respond_to,
            })
            .await??;

        let mut responses: Vec<(String, CoapResponse)> = Vec::with_capacity(requests.len());
        for (oid, request) in requests {
            match self.transport.request(request).await {
                Ok(response) => responses.push((oid, response)),
                Err(e) => {
                    return Err(self.transport_failed(client_name, "readAll", e.to_string()).await)
                }
            }
        }

        let name = client_name.clone();
        self.call(|respond_to| RegistryCommand::CompleteReadAll {
            client_name: name,
            responses,
            respond_to,
        })
        .await?
    }

    /// Saves the full device record.
    pub async fn persist(&self, client_name: &ClientName) -> Result<(), RegistryError> {
        let client_name = client_name.clone();
        self.call(|respond_to| RegistryCommand::Persist {
            client_name,
            respond_to,
        })
        .await?
    }

    pub(crate) async fn bootstrap_complete(
        &self,
        client_name: &ClientName,
        is_new: bool,
    ) -> Result<Vec<String>, RegistryError> {
        let client_name = client_name.clone();
        self.call(|respond_to| RegistryCommand::BootstrapComplete {
            client_name,
            is_new,
            respond_to,
        })
        .await?
    }

    pub(crate) async fn prune_observed(&self, client_name: &ClientName, paths: Vec<String>) {
        self.notify(RegistryCommand::PruneObserved {
            client_name: client_name.clone(),
            paths,
        })
        .await;
    }

    pub(crate) async fn confirm_check_in(&self, client_name: &ClientName) {
        self.notify(RegistryCommand::CheckInConfirmed {
            client_name: client_name.clone(),
        })
        .await;
    }

    /// Publishes an `error` event.
    pub async fn report_error(&self, client_name: Option<ClientName>, message: String) {
        self.notify(RegistryCommand::ReportError {
            client_name,
            message,
        })
        .await;
    }

    // ========================================================================
    // Registry-wide
    // ========================================================================

    /// Sends `POST /announce` to every registered device without waiting
    /// for answers. Returns the number of devices addressed.
    pub async fn announce(&self, message: &str) -> Result<usize, RegistryError> {
        let message = message.to_string();
        let targets = self
            .call(|respond_to| RegistryCommand::AnnounceTargets {
                message,
                respond_to,
            })
            .await?;

        let count = targets.len();
        for request in targets {
            if let Err(e) = self.transport.send(request).await {
                warn!(error = %e, "Announce could not be sent");
            }
        }
        Ok(count)
    }

    /// Drops every session, optionally clearing storage, then reloads from
    /// storage. Returns the number of devices loaded.
    pub async fn reset(&self, purge: bool) -> Result<usize, RegistryError> {
        self.call(|respond_to| RegistryCommand::Reload { purge, respond_to })
            .await?
    }

    /// Loads persisted devices as unregistered sessions.
    pub async fn restore(&self) -> Result<usize, RegistryError> {
        self.reset(false).await
    }

    /// Stops the actor and all its timers.
    pub async fn shutdown(&self) -> Result<(), RegistryError> {
        self.call(|respond_to| RegistryCommand::Shutdown { respond_to })
            .await
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Subscribes to lifecycle events.
    ///
    /// This is a synchronous operation - it doesn't communicate with the actor.
    pub fn subscribe(&self) -> broadcast::Receiver<ShepherdEvent> {
        self.event_sender.subscribe()
    }

    /// Publishes an event that does not originate in the actor
    /// (`ready`, `lookup`).
    pub fn publish(&self, event: ShepherdEvent) {
        let _ = self.event_sender.send(event);
    }

    /// Returns `true` while the command channel is open.
    pub fn is_connected(&self) -> bool {
        !self.sender.is_closed()
    }
}
