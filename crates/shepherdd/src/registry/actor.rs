//! Registry actor - owns all device sessions and processes commands.
//!
//! The RegistryActor is the single owner of session state in the server.
//! It receives commands via an mpsc channel and publishes events via broadcast.
//!
//! The actor awaits storage but never a device: exchanges with devices are
//! performed by the caller between a `Prepare` and a `Complete` command, and
//! background work (timers, pings, notification forwarding) reports back by
//! sending commands.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Channel send failures are ignored; a dropped caller is not an error

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use shepherd_core::{
    AttrsDiff, ClientId, ClientName, DeviceAttrs, DeviceRecord, DeviceStatus, DeviceView,
    ReportDecision, ReportState, ResourcePath, ResourceTree,
};
use shepherd_protocol::{CoapRequest, CoapResponse, ContentFormat, Method, ResponseCode};

use super::commands::{
    Admission, DeviceOp, DeviceResponse, RegisterOutcome, RegistryCommand, RegistryError,
    ShepherdEvent, TimerEvent, UpdateOutcome,
};
use crate::config::ShepherdConfig;
use crate::session::{DeviceSession, ObserverEntry, TimerSlot, TIMER_GRACE};
use crate::storage::{Storage, StorageError};
use crate::transport::Transport;

/// Tick of the permit-join countdown.
const PERMIT_JOIN_TICK: Duration = Duration::from_secs(1);

// ============================================================================
// Registry Actor
// ============================================================================

/// The registry actor - owns all device sessions.
///
/// # Ownership
///
/// - `sessions`: clientName → [`DeviceSession`] (the identity key)
/// - the permit-join gate and its countdown
/// - the clientId counter
///
/// # Thread Safety
///
/// The actor runs in a single task and processes commands sequentially.
/// All state mutations happen within this single task.
pub struct RegistryActor {
    receiver: mpsc::Receiver<RegistryCommand>,

    /// Weak so timers and forwarding tasks never keep the actor alive
    self_sender: mpsc::WeakSender<RegistryCommand>,

    sessions: HashMap<ClientName, DeviceSession>,

    config: Arc<ShepherdConfig>,
    storage: Arc<dyn Storage>,
    transport: Arc<dyn Transport>,

    event_publisher: broadcast::Sender<ShepherdEvent>,

    next_client_id: u32,
    next_observation_id: u64,

    joinable: bool,
    permit_join: TimerSlot,
    join_remaining: u64,

    running: bool,
}

impl RegistryActor {
    /// Creates a new registry actor.
    ///
    /// `self_sender` must belong to the channel `receiver` reads from.
    pub fn new(
        receiver: mpsc::Receiver<RegistryCommand>,
        self_sender: mpsc::WeakSender<RegistryCommand>,
        config: Arc<ShepherdConfig>,
        storage: Arc<dyn Storage>,
        transport: Arc<dyn Transport>,
        event_publisher: broadcast::Sender<ShepherdEvent>,
    ) -> Self {
        let joinable = config.always_permit_join;
        Self {
            receiver,
            self_sender,
            sessions: HashMap::new(),
            config,
            storage,
            transport,
            event_publisher,
            next_client_id: 1,
            next_observation_id: 1,
            joinable,
            permit_join: TimerSlot::new(),
            join_remaining: 0,
            running: true,
        }
    }

    /// Runs the actor event loop until `Shutdown` or until every sender is
    /// dropped.
    pub async fn run(mut self) {
        info!("Registry actor starting");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd).await;
            if !self.running {
                break;
            }
        }

        self.stop_all();
        info!(devices = self.sessions.len(), "Registry actor stopped");
    }

    /// Dispatches a command to the appropriate handler.
    async fn handle_command(&mut self, cmd: RegistryCommand) {
        match cmd {
            RegistryCommand::Admit { attrs, respond_to } => {
                let result = self.handle_admit(&attrs);
                let _ = respond_to.send(result);
            }
            RegistryCommand::Register {
                attrs,
                extra,
                respond_to,
            } => {
                let result = self.handle_register(*attrs, extra).await;
                let _ = respond_to.send(result);
            }
            RegistryCommand::Update {
                location_path,
                attrs,
                respond_to,
            } => {
                let result = self.handle_update(&location_path, *attrs).await;
                let _ = respond_to.send(result);
            }
            RegistryCommand::Deregister {
                client_name,
                respond_to,
            } => {
                let result = self.handle_deregister(&client_name).await;
                let _ = respond_to.send(result);
            }
            RegistryCommand::CheckOut {
                client_name,
                duration,
                respond_to,
            } => {
                let result = self.handle_check_out(&client_name, duration);
                let _ = respond_to.send(result);
            }
            RegistryCommand::CheckIn {
                client_name,
                ip,
                port,
                respond_to,
            } => {
                let result = self.handle_check_in(&client_name, ip, port).await;
                let _ = respond_to.send(result);
            }
            RegistryCommand::CheckInConfirmed { client_name } => {
                if let Some(session) = self.sessions.get_mut(&client_name) {
                    transition(session, DeviceStatus::Online, &self.event_publisher);
                }
            }
            RegistryCommand::Find {
                client_name,
                respond_to,
            } => {
                let _ = respond_to.send(self.sessions.get(&client_name).map(DeviceSession::view));
            }
            RegistryCommand::FindByMac { mac, respond_to } => {
                let _ = respond_to
                    .send(self.views_where(|s| s.record.mac.as_deref() == Some(mac.as_str())));
            }
            RegistryCommand::FindByClientId {
                client_id,
                respond_to,
            } => {
                let view = self
                    .sessions
                    .values()
                    .find(|s| s.record.client_id == client_id)
                    .map(DeviceSession::view);
                let _ = respond_to.send(view);
            }
            RegistryCommand::FindByLocationPath {
                location_path,
                respond_to,
            } => {
                let view = self
                    .session_name_at(&location_path)
                    .and_then(|name| self.sessions.get(&name))
                    .map(DeviceSession::view);
                let _ = respond_to.send(view);
            }
            RegistryCommand::List { respond_to } => {
                let _ = respond_to.send(self.views_where(|_| true));
            }
            RegistryCommand::PermitJoin {
                seconds,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_permit_join(seconds));
            }
            RegistryCommand::AlwaysPermitJoin {
                enabled,
                respond_to,
            } => {
                self.permit_join.cancel();
                self.join_remaining = 0;
                self.joinable = enabled;
                info!(enabled, "Join gate set");
                let _ = respond_to.send(self.joinable);
            }
            RegistryCommand::IsJoinable { respond_to } => {
                let _ = respond_to.send(self.joinable);
            }
            RegistryCommand::Prepare {
                client_name,
                op,
                respond_to,
            } => {
                let result = self
                    .session(&client_name)
                    .and_then(|s| s.build_request(&op).map_err(RegistryError::from));
                let _ = respond_to.send(result);
            }
            RegistryCommand::Complete {
                client_name,
                op,
                response,
                elapsed_ms,
                respond_to,
            } => {
                let result = self
                    .handle_complete(&client_name, *op, response, elapsed_ms)
                    .await;
                let _ = respond_to.send(result);
            }
            RegistryCommand::CompleteObserve {
                client_name,
                path,
                response,
                notifications,
                respond_to,
            } => {
                let result = self
                    .handle_complete_observe(&client_name, path, response, notifications)
                    .await;
                let _ = respond_to.send(result);
            }
            RegistryCommand::PrepareReadAll {
                client_name,
                respond_to,
            } => {
                let result = self.session(&client_name).and_then(|s| {
                    s.ensure_registered()?;
                    Ok(s.read_all_requests())
                });
                let _ = respond_to.send(result);
            }
            RegistryCommand::CompleteReadAll {
                client_name,
                responses,
                respond_to,
            } => {
                let result = self.handle_complete_read_all(&client_name, responses);
                let _ = respond_to.send(result);
            }
            RegistryCommand::Persist {
                client_name,
                respond_to,
            } => {
                let result = self.handle_persist(&client_name).await;
                let _ = respond_to.send(result);
            }
            RegistryCommand::BootstrapComplete {
                client_name,
                is_new,
                respond_to,
            } => {
                let result = self.handle_bootstrap_complete(&client_name, is_new).await;
                let _ = respond_to.send(result);
            }
            RegistryCommand::PruneObserved { client_name, paths } => {
                self.handle_prune_observed(&client_name, &paths).await;
            }
            RegistryCommand::Notification {
                client_name,
                path,
                observation_id,
                response,
            } => {
                self.handle_notification(&client_name, &path, observation_id, response)
                    .await;
            }
            RegistryCommand::ObservationClosed {
                client_name,
                path,
                observation_id,
            } => {
                self.handle_observation_closed(&client_name, &path, observation_id);
            }
            RegistryCommand::Timer(event) => {
                self.handle_timer(event).await;
            }
            RegistryCommand::HeartbeatSweep => {
                self.handle_heartbeat_sweep();
            }
            RegistryCommand::HeartbeatResult {
                client_name,
                outcome,
            } => {
                self.handle_heartbeat_result(&client_name, outcome);
            }
            RegistryCommand::AnnounceTargets {
                message,
                respond_to,
            } => {
                let targets = self
                    .sessions
                    .values()
                    .filter(|s| s.registered)
                    .map(|s| {
                        CoapRequest::new(Method::Post, s.record.ip.clone(), s.record.port, "/announce")
                            .with_payload(message.clone().into_bytes(), ContentFormat::TextPlain)
                    })
                    .collect();
                let _ = respond_to.send(targets);
            }
            RegistryCommand::ReportError {
                client_name,
                message,
            } => {
                self.publish_error(client_name, message);
            }
            RegistryCommand::Reload { purge, respond_to } => {
                let result = self.handle_reload(purge).await;
                let _ = respond_to.send(result);
            }
            RegistryCommand::Shutdown { respond_to } => {
                self.stop_all();
                self.running = false;
                let _ = respond_to.send(());
            }
        }
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Decides whether a registration names a known device and, for a new
    /// one, whether it may join.
    fn handle_admit(&self, attrs: &DeviceAttrs) -> Result<Admission, RegistryError> {
        let (client_name, _) = attrs
            .require_registration()
            .map_err(|e| RegistryError::InvalidAttributes(e.to_string()))?;
        self.admission_for(&client_name)
    }

    fn admission_for(&self, client_name: &ClientName) -> Result<Admission, RegistryError> {
        if self.sessions.contains_key(client_name) {
            return Ok(Admission::Existing);
        }
        if !self.joinable {
            debug!(client_name = %client_name, "Registration refused, join gate closed");
            return Err(RegistryError::NotJoinable);
        }
        if self.sessions.len() >= self.config.max_devices {
            warn!(
                client_name = %client_name,
                current = self.sessions.len(),
                max = self.config.max_devices,
                "Registry is full, rejecting registration"
            );
            return Err(RegistryError::RegistryFull {
                max: self.config.max_devices,
            });
        }
        Ok(Admission::New)
    }

    async fn handle_register(
        &mut self,
        attrs: DeviceAttrs,
        extra: Option<Value>,
    ) -> Result<RegisterOutcome, RegistryError> {
        let (client_name, object_list) = attrs
            .require_registration()
            .map_err(|e| RegistryError::InvalidAttributes(e.to_string()))?;

        if self.admission_for(&client_name)? == Admission::Existing {
            return self.handle_reregister(client_name, attrs, extra).await;
        }

        let client_id = self.allocate_client_id();
        let record =
            DeviceRecord::from_registration(client_name.clone(), client_id, object_list, &attrs);

        // Nothing is kept in memory when the snapshot cannot be stored.
        self.storage.save(record.clone()).await?;

        let mut session = DeviceSession::new(record, extra);
        arm_lifetime(&mut session, &self.self_sender);
        let location_path = session.record.location_path();
        self.sessions.insert(client_name.clone(), session);

        info!(
            client_name = %client_name,
            client_id = %client_id,
            ip = %attrs.ip,
            port = attrs.port,
            total_devices = self.sessions.len(),
            "Device registered"
        );

        Ok(RegisterOutcome {
            client_name,
            client_id,
            location_path,
            is_new: true,
        })
    }

    /// A known client name registered again: merge attributes.
    async fn handle_reregister(
        &mut self,
        client_name: ClientName,
        attrs: DeviceAttrs,
        extra: Option<Value>,
    ) -> Result<RegisterOutcome, RegistryError> {
        let session = lookup_mut(&mut self.sessions, &client_name)?;
        let diff = session.record.diff(&attrs);
        session.record.apply_diff(&diff)?;
        if let Some(hb) = attrs.heartbeat_enabled {
            session.record.heartbeat_enabled = hb;
        }
        if let Some(format) = attrs.data_format {
            session.record.data_format = format;
        }
        if extra.is_some() {
            session.extra = extra;
        }
        session.registered = true;
        session.refresh_heartbeat();
        // Bootstrap re-opens whatever should stay observed.
        session.cancel_all_observers();
        arm_lifetime(session, &self.self_sender);

        let client_id = session.record.client_id;
        let location_path = session.record.location_path();
        let record = session.record.clone();

        self.store_diff(&record, &diff).await?;

        info!(
            client_name = %client_name,
            client_id = %client_id,
            changed = diff.len(),
            "Device re-registered"
        );

        if !diff.is_empty() {
            let _ = self.event_publisher.send(ShepherdEvent::Update {
                client_name: client_name.clone(),
                diff,
            });
        }

        Ok(RegisterOutcome {
            client_name,
            client_id,
            location_path,
            is_new: false,
        })
    }

    /// Persists a diff, falling back to a full save when storage has no
    /// record for the device.
    async fn store_diff(
        &self,
        record: &DeviceRecord,
        diff: &AttrsDiff,
    ) -> Result<(), RegistryError> {
        match self.storage.update_attrs(&record.client_name, diff).await {
            Ok(_) => Ok(()),
            Err(StorageError::NotFound(_)) => {
                self.storage.save(record.clone()).await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Next free client id; the counter wraps and skips ids in use.
    fn allocate_client_id(&mut self) -> ClientId {
        loop {
            let candidate = ClientId::new(self.next_client_id);
            self.next_client_id = self.next_client_id.checked_add(1).unwrap_or(1);
            if !self.sessions.values().any(|s| s.record.client_id == candidate) {
                return candidate;
            }
        }
    }

    async fn handle_update(
        &mut self,
        location_path: &str,
        attrs: DeviceAttrs,
    ) -> Result<UpdateOutcome, RegistryError> {
        let client_name = self
            .session_name_at(location_path)
            .ok_or_else(|| RegistryError::LocationNotFound(location_path.to_string()))?;

        let session = lookup_mut(&mut self.sessions, &client_name)?;
        // Restored sessions must register again before updates count
        if !session.registered {
            debug!(client_name = %client_name, "Update for unregistered session refused");
            return Err(RegistryError::LocationNotFound(location_path.to_string()));
        }
        let diff = session.record.diff(&attrs);
        session.record.apply_diff(&diff)?;
        session.refresh_heartbeat();
        arm_lifetime(session, &self.self_sender);
        transition(session, DeviceStatus::Online, &self.event_publisher);
        let record = session.record.clone();

        if !diff.is_empty() {
            self.store_diff(&record, &diff).await?;
        }

        let reread = diff.contains_key("objList") && self.config.auto_read_resources;
        debug!(
            client_name = %client_name,
            changed = diff.len(),
            reread,
            "Registration updated"
        );

        // With a re-read pending the handle publishes once resources are saved
        if !reread {
            let _ = self.event_publisher.send(ShepherdEvent::Update {
                client_name: client_name.clone(),
                diff: diff.clone(),
            });
        }

        Ok(UpdateOutcome {
            client_name,
            diff,
            reread,
        })
    }

    /// Removes a device. An absent client name is a successful no-op.
    async fn handle_deregister(&mut self, client_name: &ClientName) -> Result<bool, RegistryError> {
        let Some(session) = self.sessions.get_mut(client_name) else {
            debug!(client_name = %client_name, "Deregister of unknown device ignored");
            return Ok(false);
        };

        transition(session, DeviceStatus::Offline, &self.event_publisher);
        session.shutdown();

        self.storage.remove(client_name).await?;

        let mac = self.sessions.remove(client_name).and_then(|mut session| {
            session.registered = false;
            session.record.mac.take()
        });

        info!(
            client_name = %client_name,
            total_devices = self.sessions.len(),
            "Device deregistered"
        );

        let _ = self.event_publisher.send(ShepherdEvent::Leaving {
            client_name: client_name.clone(),
            mac,
        });
        Ok(true)
    }

    // ========================================================================
    // Sleep / Wake
    // ========================================================================

    fn handle_check_out(
        &mut self,
        client_name: &ClientName,
        duration: Option<u64>,
    ) -> Result<(), RegistryError> {
        let session = self
            .sessions
            .get_mut(client_name)
            .ok_or_else(|| RegistryError::DeviceNotFound(client_name.clone()))?;

        session.cancel_all_observers();
        match duration {
            Some(secs) => {
                let name = client_name.clone();
                session.sleep_timer.start(
                    Duration::from_secs(secs) + TIMER_GRACE,
                    &self.self_sender,
                    move |epoch| {
                        RegistryCommand::Timer(TimerEvent::Sleep {
                            client_name: name,
                            epoch,
                        })
                    },
                );
            }
            None => session.sleep_timer.cancel(),
        }
        transition(session, DeviceStatus::Sleep, &self.event_publisher);

        info!(client_name = %client_name, duration = ?duration, "Device checked out");
        Ok(())
    }

    async fn handle_check_in(
        &mut self,
        client_name: &ClientName,
        ip: String,
        port: u16,
    ) -> Result<(), RegistryError> {
        let session = lookup_mut(&mut self.sessions, client_name)?;
        arm_lifetime(session, &self.self_sender);
        session.sleep_timer.cancel();
        session.refresh_heartbeat();

        let attrs = DeviceAttrs {
            ip,
            port,
            ..DeviceAttrs::default()
        };
        let diff = session.record.diff(&attrs);
        session.record.apply_diff(&diff)?;
        let record = session.record.clone();

        if !diff.is_empty() {
            self.store_diff(&record, &diff).await?;
        }

        info!(client_name = %client_name, "Device checked in");
        Ok(())
    }

    // ========================================================================
    // Permit Join
    // ========================================================================

    fn handle_permit_join(&mut self, seconds: u64) -> bool {
        self.permit_join.cancel();
        self.join_remaining = seconds;
        self.joinable = seconds > 0;

        if seconds > 0 {
            self.permit_join.start(PERMIT_JOIN_TICK, &self.self_sender, |epoch| {
                RegistryCommand::Timer(TimerEvent::PermitJoinTick { epoch })
            });
        }

        info!(seconds, "Join window set");
        let _ = self
            .event_publisher
            .send(ShepherdEvent::PermitJoining { remaining: seconds });
        self.joinable
    }

    fn handle_permit_join_tick(&mut self, epoch: u64) {
        if !self.permit_join.take_expired(epoch) {
            return;
        }
        self.join_remaining = self.join_remaining.saturating_sub(1);
        if self.join_remaining == 0 {
            self.joinable = false;
            info!("Join window closed");
        } else {
            self.permit_join.start(PERMIT_JOIN_TICK, &self.self_sender, |epoch| {
                RegistryCommand::Timer(TimerEvent::PermitJoinTick { epoch })
            });
        }
        let _ = self.event_publisher.send(ShepherdEvent::PermitJoining {
            remaining: self.join_remaining,
        });
    }

    // ========================================================================
    // Device Operations
    // ========================================================================

    async fn handle_complete(
        &mut self,
        client_name: &ClientName,
        op: DeviceOp,
        response: CoapResponse,
        elapsed_ms: u64,
    ) -> Result<DeviceResponse, RegistryError> {
        let session = lookup_mut(&mut self.sessions, client_name)?;
        apply_exchange_status(session, &response, &self.event_publisher);

        let status = response.code;
        debug!(
            client_name = %client_name,
            op = op.name(),
            path = ?op.path().map(ToString::to_string),
            code = %status,
            elapsed_ms,
            "Device operation completed"
        );

        let mut reply = DeviceResponse::new(status);
        match op {
            DeviceOp::Read { path } | DeviceOp::Observe { path } => {
                if status == ResponseCode::Content {
                    if let Some(value) = &response.payload {
                        self.sync_resource(client_name, &path, value).await?;
                    }
                    reply = reply.with_data(response.payload);
                } else if status == ResponseCode::NotAllowed {
                    reply = reply.with_data(response.payload);
                }
            }
            DeviceOp::Discover { .. } => {
                if status == ResponseCode::Content {
                    reply = reply.with_data(response.payload);
                }
            }
            DeviceOp::Write { path, value, .. } => {
                if status == ResponseCode::Changed {
                    self.sync_resource(client_name, &path, &value).await?;
                }
            }
            DeviceOp::WriteAttrs { path, attrs } => {
                if status == ResponseCode::Changed {
                    let defaults = self.period_defaults();
                    let session = self.session_mut(client_name)?;
                    session.set_report_attrs(&path.to_string(), attrs, defaults);
                }
            }
            DeviceOp::Execute { .. } => {}
            DeviceOp::CancelObserve { path } => {
                if status == ResponseCode::Content {
                    let session = self.session_mut(client_name)?;
                    session.remove_observer(&path.to_string());
                    self.persist_observed_list(client_name).await?;
                }
            }
            DeviceOp::Ping => {
                if status == ResponseCode::Content {
                    reply = reply.with_data(Some(Value::from(elapsed_ms)));
                }
            }
        }
        Ok(reply)
    }

    async fn handle_complete_observe(
        &mut self,
        client_name: &ClientName,
        path: ResourcePath,
        response: CoapResponse,
        notifications: Option<mpsc::Receiver<CoapResponse>>,
    ) -> Result<DeviceResponse, RegistryError> {
        let defaults = self.period_defaults();
        let filtering = !self.config.disable_filtering;
        let observation_id = self.next_observation_id;
        self.next_observation_id = self.next_observation_id.wrapping_add(1);

        let session = lookup_mut(&mut self.sessions, client_name)?;
        apply_exchange_status(session, &response, &self.event_publisher);

        let reply = DeviceResponse::new(response.code).with_data(response.payload.clone());
        let Some(notifications) = notifications.filter(|_| response.code == ResponseCode::Content)
        else {
            debug!(
                client_name = %client_name,
                path = %path,
                code = %response.code,
                "Observation refused"
            );
            return Ok(reply);
        };

        let key = path.to_string();
        let forward = spawn_forwarder(
            self.self_sender.clone(),
            client_name.clone(),
            key.clone(),
            observation_id,
            notifications,
        );

        let attrs = session.report_attrs(&key).with_defaults(defaults.0, defaults.1);
        let mut report = ReportState::new(attrs);
        report.enable(response.payload.clone());
        let mut entry = ObserverEntry::new(observation_id, forward, report);
        if filtering && !path.is_heartbeat() {
            arm_max_period(&mut entry, &self.self_sender, client_name, &key);
        }
        session.add_observer(&path, entry);

        info!(client_name = %client_name, path = %path, "Observation started");

        if !path.is_heartbeat() {
            self.persist_observed_list(client_name).await?;
            if let Some(value) = &response.payload {
                self.sync_resource(client_name, &path, value).await?;
            }
        }
        Ok(reply)
    }

    fn handle_complete_read_all(
        &mut self,
        client_name: &ClientName,
        responses: Vec<(String, CoapResponse)>,
    ) -> Result<(), RegistryError> {
        let session = lookup_mut(&mut self.sessions, client_name)?;

        if responses.iter().any(|(_, r)| r.is_timeout())
            && session.status() != DeviceStatus::Sleep
        {
            transition(session, DeviceStatus::Offline, &self.event_publisher);
        }

        if let Some((oid, failed)) = responses
            .iter()
            .find(|(_, r)| r.code != ResponseCode::Content)
        {
            return Err(RegistryError::ObjectReadFailed {
                path: format!("/{oid}"),
                code: failed.code,
            });
        }

        let mut loaded = 0;
        for (oid, response) in &responses {
            if let Some(payload) = &response.payload {
                loaded += session.record.so.init_object(oid, payload);
            }
        }
        debug!(client_name = %client_name, instances = loaded, "Resources loaded");
        Ok(())
    }

    async fn handle_persist(&mut self, client_name: &ClientName) -> Result<(), RegistryError> {
        let record = self.session(client_name)?.record.clone();
        self.storage.save(record).await?;
        Ok(())
    }

    async fn handle_bootstrap_complete(
        &mut self,
        client_name: &ClientName,
        is_new: bool,
    ) -> Result<Vec<String>, RegistryError> {
        let fire = is_new || self.config.always_fire_dev_incoming;
        let forget_observed = self.config.dont_reinitiate_observe;

        let session = lookup_mut(&mut self.sessions, client_name)?;
        if fire {
            let _ = self.event_publisher.send(ShepherdEvent::Incoming {
                device: Box::new(session.view()),
            });
        }
        transition(session, DeviceStatus::Online, &self.event_publisher);

        if forget_observed {
            session.record.observed_list.clear();
            self.persist_observed_list(client_name).await?;
            return Ok(Vec::new());
        }
        Ok(session.record.observed_list.clone())
    }

    async fn handle_prune_observed(&mut self, client_name: &ClientName, paths: &[String]) {
        let Some(session) = self.sessions.get_mut(client_name) else {
            return;
        };
        for path in paths {
            session.remove_observer(path);
        }
        if !paths.is_empty() {
            info!(client_name = %client_name, pruned = paths.len(), "Pruned observed paths");
            if let Err(e) = self.persist_observed_list(client_name).await {
                warn!(client_name = %client_name, error = %e, "Failed to persist observed list");
            }
        }
    }

    // ========================================================================
    // Notifications
    // ========================================================================

    async fn handle_notification(
        &mut self,
        client_name: &ClientName,
        path: &str,
        observation_id: u64,
        response: CoapResponse,
    ) {
        let filtering = !self.config.disable_filtering;
        let Some(session) = self.sessions.get_mut(client_name) else {
            return;
        };
        let Some(entry) = session.observer_mut(path) else {
            debug!(client_name = %client_name, path, "Notification for closed observation dropped");
            return;
        };
        if entry.id != observation_id {
            debug!(client_name = %client_name, path, "Stale notification dropped");
            return;
        }

        let value = response.payload;
        let decision = match (&value, path == shepherd_core::HEARTBEAT_PATH) {
            (_, true) | (None, false) => None,
            (Some(value), false) if filtering => Some(entry.report.offer(value.clone())),
            (Some(value), false) => Some(ReportDecision::Report(value.clone())),
        };

        transition(session, DeviceStatus::Online, &self.event_publisher);
        if path == shepherd_core::HEARTBEAT_PATH {
            session.refresh_heartbeat();
            debug!(client_name = %client_name, "Heartbeat received");
            return;
        }

        match decision {
            Some(ReportDecision::Report(value)) => {
                self.publish_report(client_name, path, value).await;
            }
            Some(ReportDecision::Defer) => {
                debug!(client_name = %client_name, path, "Notification deferred until pmin");
            }
            Some(ReportDecision::Drop) | None => {
                debug!(client_name = %client_name, path, "Notification filtered");
            }
        }
    }

    /// Syncs a reported value, emits `device::notify` and restarts the
    /// path's report timers.
    async fn publish_report(&mut self, client_name: &ClientName, path: &str, value: Value) {
        if !self.config.disable_filtering {
            if let Some(entry) = self
                .sessions
                .get_mut(client_name)
                .and_then(|s| s.observer_mut(path))
            {
                arm_min_period(entry, &self.self_sender, client_name, path);
                arm_max_period(entry, &self.self_sender, client_name, path);
            }
        }

        match ResourcePath::parse(path) {
            Ok(parsed) => {
                if let Err(e) = self.sync_resource(client_name, &parsed, &value).await {
                    warn!(client_name = %client_name, path, error = %e, "Failed to sync notification");
                    self.publish_error(Some(client_name.clone()), e.to_string());
                }
            }
            Err(e) => warn!(client_name = %client_name, error = %e, "Notification on unparsable path"),
        }

        let _ = self.event_publisher.send(ShepherdEvent::Notify {
            client_name: client_name.clone(),
            path: path.to_string(),
            value,
        });
    }

    fn handle_observation_closed(
        &mut self,
        client_name: &ClientName,
        path: &str,
        observation_id: u64,
    ) {
        let Some(session) = self.sessions.get_mut(client_name) else {
            return;
        };
        if session.observer(path).map(|e| e.id) == Some(observation_id) {
            // The stream ended on the transport side; the path stays in the
            // observed list so a later registration re-observes it.
            session.cancel_observer_stream(path);
            debug!(client_name = %client_name, path, "Observation stream ended");
        }
    }

    // ========================================================================
    // Timers
    // ========================================================================

    async fn handle_timer(&mut self, event: TimerEvent) {
        match event {
            TimerEvent::Lifetime { client_name, epoch } => {
                let expired = self
                    .sessions
                    .get_mut(&client_name)
                    .is_some_and(|s| s.lifetime_timer.take_expired(epoch));
                if expired {
                    info!(client_name = %client_name, "Device lifetime expired");
                    if let Err(e) = self.handle_deregister(&client_name).await {
                        error!(client_name = %client_name, error = %e, "Failed to remove expired device");
                        self.publish_error(Some(client_name), e.to_string());
                    }
                }
            }
            TimerEvent::Sleep { client_name, epoch } => {
                if let Some(session) = self.sessions.get_mut(&client_name) {
                    if session.sleep_timer.take_expired(epoch) {
                        info!(client_name = %client_name, "Device did not wake up in time");
                        transition(session, DeviceStatus::Offline, &self.event_publisher);
                    }
                }
            }
            TimerEvent::MinPeriod {
                client_name,
                path,
                epoch,
            } => {
                let mut pending = None;
                if let Some(entry) = self
                    .sessions
                    .get_mut(&client_name)
                    .and_then(|s| s.observer_mut(&path))
                {
                    if entry.min_timer.take_expired(epoch) {
                        pending = entry.report.on_min_period();
                    }
                }
                if let Some(value) = pending {
                    self.publish_report(&client_name, &path, value).await;
                }
            }
            TimerEvent::MaxPeriod {
                client_name,
                path,
                epoch,
            } => {
                let mut forced = None;
                if let Some(entry) = self
                    .sessions
                    .get_mut(&client_name)
                    .and_then(|s| s.observer_mut(&path))
                {
                    if entry.max_timer.take_expired(epoch) {
                        forced = entry.report.on_max_period();
                    }
                }
                if let Some(value) = forced {
                    debug!(client_name = %client_name, path, "pmax reached, forcing report");
                    self.publish_report(&client_name, &path, value).await;
                }
            }
            TimerEvent::PermitJoinTick { epoch } => self.handle_permit_join_tick(epoch),
        }
    }

    // ========================================================================
    // Heartbeat
    // ========================================================================

    /// Marks stale heartbeat-capable devices offline and pings them.
    fn handle_heartbeat_sweep(&mut self) {
        let now = Utc::now();
        let timeout = self.config.heartbeat_timeout();

        for (client_name, session) in &mut self.sessions {
            let stale = session.registered
                && session.record.heartbeat_enabled
                && session.status() == DeviceStatus::Online
                && session.heartbeat_stale(now, timeout);
            if !stale {
                continue;
            }

            transition(session, DeviceStatus::Offline, &self.event_publisher);
            let request = match session.build_request(&DeviceOp::Ping) {
                Ok(request) => request,
                Err(e) => {
                    warn!(client_name = %client_name, error = %e, "Cannot ping device");
                    continue;
                }
            };

            info!(client_name = %client_name, "Heartbeat missed, probing device");
            let transport = Arc::clone(&self.transport);
            let sender = self.self_sender.clone();
            let name = client_name.clone();
            tokio::spawn(async move {
                let outcome = transport
                    .request(request)
                    .await
                    .map(|response| response.code)
                    .map_err(|e| e.to_string());
                if let Some(sender) = sender.upgrade() {
                    let _ = sender
                        .send(RegistryCommand::HeartbeatResult {
                            client_name: name,
                            outcome,
                        })
                        .await;
                }
            });
        }
    }

    fn handle_heartbeat_result(
        &mut self,
        client_name: &ClientName,
        outcome: Result<ResponseCode, String>,
    ) {
        let Some(session) = self.sessions.get_mut(client_name) else {
            return;
        };
        match outcome {
            Ok(ResponseCode::Content) => {
                session.refresh_heartbeat();
                transition(session, DeviceStatus::Online, &self.event_publisher);
                debug!(client_name = %client_name, "Heartbeat answered");
            }
            Ok(code) => {
                if session.status() != DeviceStatus::Online {
                    session.cancel_all_observers();
                }
                warn!(client_name = %client_name, code = %code, "Heartbeat ping failed");
            }
            Err(message) => {
                session.cancel_all_observers();
                warn!(client_name = %client_name, error = %message, "Heartbeat ping could not be sent");
                self.publish_error(Some(client_name.clone()), message);
            }
        }
    }

    // ========================================================================
    // Registry-wide
    // ========================================================================

    async fn handle_reload(&mut self, purge: bool) -> Result<usize, RegistryError> {
        self.stop_all();
        self.sessions.clear();

        if purge {
            let removed = self.storage.reset().await?;
            info!(removed, "Storage cleared");
        }

        let records = self.storage.load_all().await?;
        for record in records {
            self.next_client_id = self
                .next_client_id
                .max(record.client_id.get().saturating_add(1));
            self.sessions
                .insert(record.client_name.clone(), DeviceSession::restored(record));
        }

        info!(devices = self.sessions.len(), "Devices restored from storage");
        Ok(self.sessions.len())
    }

    fn stop_all(&mut self) {
        self.permit_join.cancel();
        for session in self.sessions.values_mut() {
            session.shutdown();
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn session(&self, client_name: &ClientName) -> Result<&DeviceSession, RegistryError> {
        self.sessions
            .get(client_name)
            .ok_or_else(|| RegistryError::DeviceNotFound(client_name.clone()))
    }

    fn session_mut(
        &mut self,
        client_name: &ClientName,
    ) -> Result<&mut DeviceSession, RegistryError> {
        lookup_mut(&mut self.sessions, client_name)
    }

    fn session_name_at(&self, location_path: &str) -> Option<ClientName> {
        let wanted = format!("/{}", location_path.trim_start_matches('/'));
        self.sessions
            .values()
            .find(|s| s.record.location_path() == wanted)
            .map(|s| s.client_name().clone())
    }

    fn views_where<F>(&self, predicate: F) -> Vec<DeviceView>
    where
        F: Fn(&DeviceSession) -> bool,
    {
        let mut views: Vec<DeviceView> = self
            .sessions
            .values()
            .filter(|s| predicate(s))
            .map(DeviceSession::view)
            .collect();
        views.sort_by_key(|v| v.client_id);
        views
    }

    fn period_defaults(&self) -> (u64, u64) {
        (self.config.default_min_period, self.config.default_max_period)
    }

    /// Applies a value to the resource tree and forwards the patch to storage.
    async fn sync_resource(
        &mut self,
        client_name: &ClientName,
        path: &ResourcePath,
        value: &Value,
    ) -> Result<(), RegistryError> {
        let Some(patch) = ResourceTree::patch_for(path, value) else {
            return Ok(());
        };
        if let Some(session) = self.sessions.get_mut(client_name) {
            session.record.so.apply_patch(&patch);
        }
        self.storage.patch_so(client_name, &patch).await?;
        Ok(())
    }

    async fn persist_observed_list(&self, client_name: &ClientName) -> Result<(), RegistryError> {
        let record = self.session(client_name)?.record.clone();
        let mut diff = Map::new();
        diff.insert(
            "observedList".to_string(),
            Value::from(record.observed_list.clone()),
        );
        self.store_diff(&record, &diff).await
    }

    fn publish_error(&self, client_name: Option<ClientName>, message: String) {
        warn!(client_name = ?client_name.as_ref().map(ClientName::as_str), error = %message, "Registry error");
        let _ = self
            .event_publisher
            .send(ShepherdEvent::Error { client_name, message });
    }

    // ========================================================================
    // Accessors (for testing)
    // ========================================================================

    #[cfg(test)]
    pub fn device_count(&self) -> usize {
        self.sessions.len()
    }
}

// ============================================================================
// Free helpers (borrow the session and the publisher separately)
// ============================================================================

/// Session lookup that borrows only the session map.
fn lookup_mut<'a>(
    sessions: &'a mut HashMap<ClientName, DeviceSession>,
    client_name: &ClientName,
) -> Result<&'a mut DeviceSession, RegistryError> {
    sessions
        .get_mut(client_name)
        .ok_or_else(|| RegistryError::DeviceNotFound(client_name.clone()))
}

/// Moves a session to `status`, emitting `device::status` on change.
fn transition(
    session: &mut DeviceSession,
    status: DeviceStatus,
    publisher: &broadcast::Sender<ShepherdEvent>,
) {
    if session.set_status(status) {
        debug!(client_name = %session.client_name(), status = %status, "Device status changed");
        let _ = publisher.send(ShepherdEvent::Status {
            client_name: session.client_name().clone(),
            status,
        });
    }
}

/// A timeout marks the device offline unless it sleeps; any answer marks it
/// online.
fn apply_exchange_status(
    session: &mut DeviceSession,
    response: &CoapResponse,
    publisher: &broadcast::Sender<ShepherdEvent>,
) {
    if response.is_timeout() {
        if session.status() != DeviceStatus::Sleep {
            transition(session, DeviceStatus::Offline, publisher);
        }
    } else {
        transition(session, DeviceStatus::Online, publisher);
    }
}

fn arm_lifetime(session: &mut DeviceSession, sender: &mpsc::WeakSender<RegistryCommand>) {
    let after = Duration::from_secs(session.record.lifetime) + TIMER_GRACE;
    let client_name = session.client_name().clone();
    session.lifetime_timer.start(after, sender, move |epoch| {
        RegistryCommand::Timer(TimerEvent::Lifetime { client_name, epoch })
    });
}

fn arm_min_period(
    entry: &mut ObserverEntry,
    sender: &mpsc::WeakSender<RegistryCommand>,
    client_name: &ClientName,
    path: &str,
) {
    let pmin = entry.report.attrs().pmin.unwrap_or(0);
    if pmin == 0 {
        entry.min_timer.cancel();
        return;
    }
    let (client_name, path) = (client_name.clone(), path.to_string());
    entry.min_timer.start(Duration::from_secs(pmin), sender, move |epoch| {
        RegistryCommand::Timer(TimerEvent::MinPeriod {
            client_name,
            path,
            epoch,
        })
    });
}

fn arm_max_period(
    entry: &mut ObserverEntry,
    sender: &mpsc::WeakSender<RegistryCommand>,
    client_name: &ClientName,
    path: &str,
) {
    let pmax = entry.report.attrs().pmax.unwrap_or(0);
    if pmax == 0 {
        entry.max_timer.cancel();
        return;
    }
    let (client_name, path) = (client_name.clone(), path.to_string());
    entry.max_timer.start(Duration::from_secs(pmax), sender, move |epoch| {
        RegistryCommand::Timer(TimerEvent::MaxPeriod {
            client_name,
            path,
            epoch,
        })
    });
}

/// Forwards every chunk of an observation to the actor, then reports the
/// end of the stream.
fn spawn_forwarder(
    sender: mpsc::WeakSender<RegistryCommand>,
    client_name: ClientName,
    path: String,
    observation_id: u64,
    mut notifications: mpsc::Receiver<CoapResponse>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(response) = notifications.recv().await {
            let Some(sender) = sender.upgrade() else {
                return;
            };
            let cmd = RegistryCommand::Notification {
                client_name: client_name.clone(),
                path: path.clone(),
                observation_id,
                response,
            };
            if sender.send(cmd).await.is_err() {
                return;
            }
        }
        if let Some(sender) = sender.upgrade() {
            let _ = sender
                .send(RegistryCommand::ObservationClosed {
                    client_name,
                    path,
                    observation_id,
                })
                .await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::testing::ScriptedTransport;
    use serde_json::json;
    use shepherd_core::ObjectList;
    use tokio::sync::oneshot;

    fn attrs(name: &str) -> DeviceAttrs {
        let mut objects = ObjectList::new();
        objects.insert("3".to_string(), vec!["0".to_string()]);
        DeviceAttrs {
            client_name: Some(ClientName::new(name)),
            lifetime: Some(86_400),
            mac: Some(format!("mac-{name}")),
            object_list: Some(objects),
            ip: "127.0.0.1".to_string(),
            port: 5683,
            ..DeviceAttrs::default()
        }
    }

    struct Fixture {
        _tx: mpsc::Sender<RegistryCommand>,
        actor: RegistryActor,
        events: broadcast::Receiver<ShepherdEvent>,
        storage: Arc<MemoryStorage>,
    }

    fn create_actor_with(config: ShepherdConfig) -> Fixture {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = broadcast::channel(64);
        let storage = Arc::new(MemoryStorage::new());
        let actor = RegistryActor::new(
            cmd_rx,
            cmd_tx.downgrade(),
            Arc::new(config),
            storage.clone(),
            ScriptedTransport::new(),
            event_tx,
        );
        Fixture {
            _tx: cmd_tx,
            actor,
            events: event_rx,
            storage,
        }
    }

    fn create_actor() -> Fixture {
        create_actor_with(ShepherdConfig::default())
    }

    async fn register(
        actor: &mut RegistryActor,
        name: &str,
    ) -> Result<RegisterOutcome, RegistryError> {
        let (tx, rx) = oneshot::channel();
        actor
            .handle_command(RegistryCommand::Register {
                attrs: Box::new(attrs(name)),
                extra: None,
                respond_to: tx,
            })
            .await;
        rx.await.unwrap()
    }

    async fn complete(
        actor: &mut RegistryActor,
        name: &str,
        op: DeviceOp,
        response: CoapResponse,
    ) -> Result<DeviceResponse, RegistryError> {
        let (tx, rx) = oneshot::channel();
        actor
            .handle_command(RegistryCommand::Complete {
                client_name: ClientName::new(name),
                op: Box::new(op),
                response,
                elapsed_ms: 12,
                respond_to: tx,
            })
            .await;
        rx.await.unwrap()
    }

    fn drain(events: &mut broadcast::Receiver<ShepherdEvent>) -> Vec<ShepherdEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn test_register_creates_session_and_record() {
        let mut f = create_actor();

        let outcome = register(&mut f.actor, "dev1").await.unwrap();
        assert!(outcome.is_new);
        assert_eq!(outcome.location_path, "/rd/1");
        assert_eq!(f.actor.device_count(), 1);
        assert_eq!(f.storage.len().await, 1);
    }

    #[tokio::test]
    async fn test_register_twice_keeps_one_entry() {
        let mut f = create_actor();

        register(&mut f.actor, "dev1").await.unwrap();
        let mut changed = attrs("dev1");
        changed.lifetime = Some(300);
        let (tx, rx) = oneshot::channel();
        f.actor
            .handle_command(RegistryCommand::Register {
                attrs: Box::new(changed),
                extra: None,
                respond_to: tx,
            })
            .await;
        let second = rx.await.unwrap().unwrap();

        assert!(!second.is_new);
        assert_eq!(second.client_id, ClientId::new(1));
        assert_eq!(f.actor.device_count(), 1);
        let update = drain(&mut f.events)
            .into_iter()
            .find(|e| matches!(e, ShepherdEvent::Update { .. }));
        assert!(matches!(update, Some(ShepherdEvent::Update { diff, .. }) if diff.get("lifetime") == Some(&json!(300))));
    }

    #[tokio::test]
    async fn test_admit_checks_gate_and_capacity() {
        let mut config = ShepherdConfig::default();
        config.max_devices = 1;
        let mut f = create_actor_with(config);

        assert_eq!(f.actor.handle_admit(&attrs("dev1")), Ok(Admission::New));
        register(&mut f.actor, "dev1").await.unwrap();
        assert_eq!(f.actor.handle_admit(&attrs("dev1")), Ok(Admission::Existing));
        assert_eq!(
            f.actor.handle_admit(&attrs("dev2")),
            Err(RegistryError::RegistryFull { max: 1 })
        );

        f.actor.handle_permit_join(0);
        assert_eq!(f.actor.handle_admit(&attrs("dev3")), Err(RegistryError::NotJoinable));
        // Re-registration ignores the gate.
        assert_eq!(f.actor.handle_admit(&attrs("dev1")), Ok(Admission::Existing));
    }

    #[tokio::test]
    async fn test_admit_requires_name_and_objects() {
        let f = create_actor();
        let mut bare = attrs("dev1");
        bare.object_list = None;
        assert!(matches!(
            f.actor.handle_admit(&bare),
            Err(RegistryError::InvalidAttributes(_))
        ));
    }

    #[tokio::test]
    async fn test_deregister_emits_leaving_and_clears_storage() {
        let mut f = create_actor();
        register(&mut f.actor, "dev1").await.unwrap();
        drain(&mut f.events);

        assert_eq!(f.actor.handle_deregister(&ClientName::new("dev1")).await, Ok(true));
        assert_eq!(f.actor.device_count(), 0);
        assert!(f.storage.is_empty().await);

        let events = drain(&mut f.events);
        assert!(events.contains(&ShepherdEvent::Leaving {
            client_name: ClientName::new("dev1"),
            mac: Some("mac-dev1".to_string()),
        }));
    }

    #[tokio::test]
    async fn test_deregister_absent_is_noop() {
        let mut f = create_actor();
        register(&mut f.actor, "dev1").await.unwrap();
        assert_eq!(f.actor.handle_deregister(&ClientName::new("ghost")).await, Ok(false));
        assert_eq!(f.actor.device_count(), 1);
    }

    #[tokio::test]
    async fn test_update_by_location() {
        let mut f = create_actor();
        register(&mut f.actor, "dev1").await.unwrap();

        let mut refreshed = attrs("dev1");
        refreshed.client_name = None;
        refreshed.version = Some("1.1".to_string());
        let outcome = f.actor.handle_update("/rd/1", refreshed).await.unwrap();
        assert_eq!(outcome.diff.get("version"), Some(&json!("1.1")));
        assert!(!outcome.reread);

        let missing = f.actor.handle_update("/rd/99", DeviceAttrs::default()).await;
        assert_eq!(missing, Err(RegistryError::LocationNotFound("/rd/99".to_string())));
    }

    #[tokio::test]
    async fn test_update_of_restored_session_requires_registration() {
        let mut f = create_actor();
        register(&mut f.actor, "dev1").await.unwrap();
        assert_eq!(f.actor.handle_reload(false).await, Ok(1));

        let refreshed = DeviceAttrs {
            lifetime: Some(100),
            ..DeviceAttrs::default()
        };
        let result = f.actor.handle_update("/rd/1", refreshed).await;

        assert_eq!(result, Err(RegistryError::LocationNotFound("/rd/1".to_string())));
        let session = &f.actor.sessions[&ClientName::new("dev1")];
        assert!(!session.registered);
        assert_eq!(session.status(), DeviceStatus::Offline);
        assert_eq!(session.record.lifetime, 86_400);
    }

    #[tokio::test]
    async fn test_timeout_marks_offline_unless_sleeping() {
        let mut f = create_actor();
        register(&mut f.actor, "dev1").await.unwrap();
        let name = ClientName::new("dev1");
        let read = DeviceOp::Read {
            path: ResourcePath::parse("/3/0/0").unwrap(),
        };

        complete(&mut f.actor, "dev1", read.clone(), CoapResponse::new(ResponseCode::Content))
            .await
            .unwrap();
        assert_eq!(f.actor.sessions[&name].status(), DeviceStatus::Online);

        complete(&mut f.actor, "dev1", read.clone(), CoapResponse::timeout())
            .await
            .unwrap();
        assert_eq!(f.actor.sessions[&name].status(), DeviceStatus::Offline);

        f.actor.handle_check_out(&name, None).unwrap();
        complete(&mut f.actor, "dev1", read, CoapResponse::timeout())
            .await
            .unwrap();
        assert_eq!(f.actor.sessions[&name].status(), DeviceStatus::Sleep);
    }

    #[tokio::test]
    async fn test_read_syncs_resource_tree() {
        let mut f = create_actor();
        register(&mut f.actor, "dev1").await.unwrap();

        let reply = complete(
            &mut f.actor,
            "dev1",
            DeviceOp::Read {
                path: ResourcePath::parse("/3/0/0").unwrap(),
            },
            CoapResponse::new(ResponseCode::Content).with_payload(json!("acme")),
        )
        .await
        .unwrap();

        assert_eq!(reply.data, Some(json!("acme")));
        let stored = f.storage.load(&ClientName::new("dev1")).await.unwrap();
        assert_eq!(stored.so.dump(), json!({"3": {"0": {"0": "acme"}}}));
    }

    #[tokio::test]
    async fn test_ping_reports_round_trip() {
        let mut f = create_actor();
        register(&mut f.actor, "dev1").await.unwrap();
        let reply = complete(&mut f.actor, "dev1", DeviceOp::Ping, CoapResponse::new(ResponseCode::Content))
            .await
            .unwrap();
        assert_eq!(reply.data, Some(json!(12)));
    }

    #[tokio::test]
    async fn test_read_all_fails_on_any_object() {
        let mut f = create_actor();
        register(&mut f.actor, "dev1").await.unwrap();
        let name = ClientName::new("dev1");

        let result = f.actor.handle_complete_read_all(
            &name,
            vec![
                ("1".to_string(), CoapResponse::new(ResponseCode::Content).with_payload(json!({"0": {"0": 1}}))),
                ("3".to_string(), CoapResponse::new(ResponseCode::NotFound)),
            ],
        );
        assert_eq!(
            result,
            Err(RegistryError::ObjectReadFailed {
                path: "/3".to_string(),
                code: ResponseCode::NotFound,
            })
        );
        assert!(f.actor.sessions[&name].record.so.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_permit_join_counts_down() {
        let mut f = create_actor();
        assert!(f.actor.handle_permit_join(2));
        assert!(f.actor.joinable);

        for _ in 0..2 {
            let cmd = f.actor.receiver.recv().await.unwrap();
            f.actor.handle_command(cmd).await;
        }
        assert!(!f.actor.joinable);

        let remaining: Vec<u64> = drain(&mut f.events)
            .into_iter()
            .filter_map(|e| match e {
                ShepherdEvent::PermitJoining { remaining } => Some(remaining),
                _ => None,
            })
            .collect();
        assert_eq!(remaining, vec![2, 1, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifetime_expiry_deregisters() {
        let mut f = create_actor();
        let mut short = attrs("dev1");
        short.lifetime = Some(1);
        let (tx, rx) = oneshot::channel();
        f.actor
            .handle_command(RegistryCommand::Register {
                attrs: Box::new(short),
                extra: None,
                respond_to: tx,
            })
            .await;
        rx.await.unwrap().unwrap();

        let cmd = f.actor.receiver.recv().await.unwrap();
        assert!(matches!(cmd, RegistryCommand::Timer(TimerEvent::Lifetime { .. })));
        f.actor.handle_command(cmd).await;
        assert_eq!(f.actor.device_count(), 0);
    }

    #[tokio::test]
    async fn test_reload_restores_unregistered_sessions() {
        let mut f = create_actor();
        register(&mut f.actor, "dev1").await.unwrap();
        register(&mut f.actor, "dev2").await.unwrap();

        assert_eq!(f.actor.handle_reload(false).await, Ok(2));
        let session = &f.actor.sessions[&ClientName::new("dev1")];
        assert!(!session.registered);
        assert_eq!(session.status(), DeviceStatus::Offline);

        let next = register(&mut f.actor, "dev3").await.unwrap();
        assert_eq!(next.client_id, ClientId::new(3));

        assert_eq!(f.actor.handle_reload(true).await, Ok(0));
    }

    #[tokio::test]
    async fn test_stale_notification_is_dropped() {
        let mut f = create_actor();
        register(&mut f.actor, "dev1").await.unwrap();
        drain(&mut f.events);

        f.actor
            .handle_notification(
                &ClientName::new("dev1"),
                "/3/0/0",
                42,
                CoapResponse::new(ResponseCode::Content).with_payload(json!(1)),
            )
            .await;
        assert!(drain(&mut f.events).is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_sweep_pings_stale_device() {
        let mut f = create_actor();
        register(&mut f.actor, "dev1").await.unwrap();
        let name = ClientName::new("dev1");
        {
            let session = f.actor.sessions.get_mut(&name).unwrap();
            session.record.heartbeat_enabled = true;
            session.set_status(DeviceStatus::Online);
            session.last_heartbeat = Some(Utc::now() - chrono::Duration::seconds(600));
        }
        drain(&mut f.events);

        f.actor.handle_heartbeat_sweep();
        assert_eq!(f.actor.sessions[&name].status(), DeviceStatus::Offline);

        let cmd = f.actor.receiver.recv().await.unwrap();
        assert!(matches!(cmd, RegistryCommand::HeartbeatResult { .. }));
        f.actor.handle_command(cmd).await;

        let session = &f.actor.sessions[&name];
        assert_eq!(session.status(), DeviceStatus::Online);
        assert!(session.registered);
        let statuses: Vec<DeviceStatus> = drain(&mut f.events)
            .into_iter()
            .filter_map(|e| match e {
                ShepherdEvent::Status { status, .. } => Some(status),
                _ => None,
            })
            .collect();
        assert_eq!(statuses, vec![DeviceStatus::Offline, DeviceStatus::Online]);
    }
}
