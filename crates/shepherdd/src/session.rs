//! Device session runtime.
//!
//! A `DeviceSession` is one registered device as the registry actor sees it:
//! the persisted [`DeviceRecord`] plus runtime state that never reaches
//! storage (status, timers, open observations, notification attributes).
//!
//! ```text
//!                register
//!   Unregistered ─────────▶ Registered ──deregister / lifetime expiry──▶ Unregistered
//!                           │  Offline ◀──timeout── Online ◀──response── │
//!                           │  Sleep ──check-in──▶ Online                │
//!                           │  Sleep ──wake timer──▶ Offline             │
//! ```
//!
//! # Panic-Free Guarantees
//!
//! Timer and forwarding tasks are aborted when their slot is re-armed,
//! cancelled, or dropped. No method here panics.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use shepherd_core::{
    ClientName, DeviceRecord, DeviceStatus, DeviceView, DomainError, DomainResult, PathKind,
    ReportAttrs, ReportState, ResourcePath,
};
use shepherd_protocol::{encode_exec_args, encode_write, CoapRequest, ContentFormat, Method};

use crate::registry::DeviceOp;

/// Grace added to lifetime and sleep timers.
pub const TIMER_GRACE: Duration = Duration::from_millis(500);

// ============================================================================
// Timer Slot
// ============================================================================

/// A single re-armable timer that reports its expiry as a command.
///
/// Each arming gets a new epoch. An expiry carries its epoch back so the
/// receiver can tell a live expiry from one that was superseded while queued.
#[derive(Debug, Default)]
pub struct TimerSlot {
    epoch: u64,
    task: Option<JoinHandle<()>>,
}

impl TimerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels any running timer and arms a new one.
    pub fn start<C, F>(&mut self, after: Duration, sender: &mpsc::WeakSender<C>, make: F)
    where
        C: Send + 'static,
        F: FnOnce(u64) -> C + Send + 'static,
    {
        self.cancel();
        let epoch = self.epoch;
        let sender = sender.clone();
        self.task = Some(tokio::spawn(async move {
            sleep(after).await;
            if let Some(sender) = sender.upgrade() {
                let _ = sender.send(make(epoch)).await;
            }
        }));
    }

    pub fn cancel(&mut self) {
        self.epoch = self.epoch.wrapping_add(1);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.task.is_some()
    }

    /// Accepts an expiry if it belongs to the current arming, leaving the
    /// slot idle.
    pub fn take_expired(&mut self, epoch: u64) -> bool {
        if self.task.is_some() && self.epoch == epoch {
            self.task = None;
            self.epoch = self.epoch.wrapping_add(1);
            true
        } else {
            false
        }
    }
}

impl Drop for TimerSlot {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ============================================================================
// Observations
// ============================================================================

/// An open observation: its forwarding task and filter state.
#[derive(Debug)]
pub struct ObserverEntry {
    /// Distinguishes this observation from earlier ones on the same path
    pub id: u64,
    forward: JoinHandle<()>,
    pub report: ReportState,
    pub min_timer: TimerSlot,
    pub max_timer: TimerSlot,
}

impl ObserverEntry {
    pub fn new(id: u64, forward: JoinHandle<()>, report: ReportState) -> Self {
        Self {
            id,
            forward,
            report,
            min_timer: TimerSlot::new(),
            max_timer: TimerSlot::new(),
        }
    }
}

impl Drop for ObserverEntry {
    fn drop(&mut self) {
        self.forward.abort();
    }
}

// ============================================================================
// Device Session
// ============================================================================

/// One device as seen by the server.
#[derive(Debug)]
pub struct DeviceSession {
    pub record: DeviceRecord,
    status: DeviceStatus,
    /// False for sessions restored from storage until the device registers
    pub registered: bool,
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Value attached by the admission policy
    pub extra: Option<Value>,
    pub lifetime_timer: TimerSlot,
    pub sleep_timer: TimerSlot,
    observers: BTreeMap<String, ObserverEntry>,
    report_attrs: HashMap<String, ReportAttrs>,
}

impl DeviceSession {
    /// A freshly registered device; offline until bootstrap completes.
    pub fn new(record: DeviceRecord, extra: Option<Value>) -> Self {
        Self {
            record,
            status: DeviceStatus::Offline,
            registered: true,
            last_heartbeat: Some(Utc::now()),
            extra,
            lifetime_timer: TimerSlot::new(),
            sleep_timer: TimerSlot::new(),
            observers: BTreeMap::new(),
            report_attrs: HashMap::new(),
        }
    }

    /// A device loaded from storage that has not registered since startup.
    pub fn restored(record: DeviceRecord) -> Self {
        Self {
            registered: false,
            last_heartbeat: None,
            ..Self::new(record, None)
        }
    }

    pub fn client_name(&self) -> &ClientName {
        &self.record.client_name
    }

    pub fn status(&self) -> DeviceStatus {
        self.status
    }

    /// Sets the status, returning whether it changed.
    pub fn set_status(&mut self, status: DeviceStatus) -> bool {
        if self.status == status {
            return false;
        }
        self.status = status;
        true
    }

    pub fn refresh_heartbeat(&mut self) {
        self.last_heartbeat = Some(Utc::now());
    }

    /// True when no heartbeat was seen within `timeout` of `now`.
    pub fn heartbeat_stale(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        let Ok(timeout) = chrono::Duration::from_std(timeout) else {
            return false;
        };
        match self.last_heartbeat {
            Some(seen) => now.signed_duration_since(seen) > timeout,
            None => true,
        }
    }

    pub fn view(&self) -> DeviceView {
        let r = &self.record;
        DeviceView {
            client_name: r.client_name.clone(),
            client_id: r.client_id,
            location_path: r.location_path(),
            lifetime: r.lifetime,
            version: r.version.clone(),
            ip: r.ip.clone(),
            port: r.port,
            mac: r.mac.clone(),
            object_list: r.object_list.clone(),
            observed_list: r.observed_list.clone(),
            heartbeat_enabled: r.heartbeat_enabled,
            join_time: r.join_time,
            data_format: r.data_format,
            status: self.status,
            registered: self.registered,
            last_heartbeat: self.last_heartbeat,
            extra: self.extra.clone(),
        }
    }

    // ========================================================================
    // Readiness
    // ========================================================================

    pub fn ensure_registered(&self) -> DomainResult<()> {
        if self.registered {
            Ok(())
        } else {
            Err(DomainError::Deregistered {
                client_name: self.client_name().clone(),
            })
        }
    }

    /// Registered, not offline, not sleeping; checked in that order.
    pub fn ensure_ready(&self) -> DomainResult<()> {
        self.ensure_registered()?;
        match self.status {
            DeviceStatus::Online => Ok(()),
            DeviceStatus::Offline => Err(DomainError::Offline {
                client_name: self.client_name().clone(),
            }),
            DeviceStatus::Sleep => Err(DomainError::Sleeping {
                client_name: self.client_name().clone(),
            }),
        }
    }

    // ========================================================================
    // Request Building
    // ========================================================================

    fn request(&self, method: Method, path: impl Into<String>) -> CoapRequest {
        CoapRequest::new(method, self.record.ip.clone(), self.record.port, path)
    }

    fn read_format(&self) -> ContentFormat {
        ContentFormat::for_data_format(self.record.data_format)
    }

    /// Validates `op` against the session state and builds its request.
    ///
    /// Ping and the heartbeat observation only need a registered session.
    pub fn build_request(&self, op: &DeviceOp) -> DomainResult<CoapRequest> {
        match op {
            DeviceOp::Ping => self.ensure_registered()?,
            DeviceOp::Observe { path } if path.is_heartbeat() => self.ensure_registered()?,
            _ => self.ensure_ready()?,
        }

        let request = match op {
            DeviceOp::Read { path } => {
                path.require(PathKind::Object, "read needs an object id")?;
                self.request(Method::Get, path.to_string())
                    .with_accept(self.read_format())
            }
            DeviceOp::Discover { path } => {
                path.require(PathKind::Object, "discover needs an object id")?;
                self.request(Method::Get, path.to_string())
                    .with_accept(ContentFormat::LinkFormat)
            }
            DeviceOp::Write {
                path,
                value,
                transparent,
            } => {
                path.require(
                    PathKind::Instance,
                    "path should contain Object ID and Object Instance ID.",
                )?;
                if value.is_null() {
                    return Err(DomainError::invalid_value(path.to_string(), "value is undefined."));
                }
                if path.kind() == PathKind::Instance && !value.is_object() {
                    return Err(DomainError::invalid_value(
                        path.to_string(),
                        "value should be an object.",
                    ));
                }
                let (payload, format) = if *transparent {
                    let bytes = match value {
                        Value::String(s) => s.clone().into_bytes(),
                        other => other.to_string().into_bytes(),
                    };
                    (bytes, ContentFormat::OctetStream)
                } else {
                    encode_write(path, value)
                };
                self.request(Method::Put, path.to_string())
                    .with_payload(payload, format)
            }
            DeviceOp::WriteAttrs { path, attrs } => {
                path.require(PathKind::Object, "attributes need an object id")?;
                self.request(Method::Put, path.to_string())
                    .with_query(attrs.to_query())
            }
            DeviceOp::Execute { path, args } => {
                path.require(
                    PathKind::Resource,
                    "path should contain Object ID, Object Instance ID and Resource ID.",
                )?;
                let request = self.request(Method::Post, path.to_string());
                if args.is_empty() {
                    request
                } else {
                    request.with_payload(encode_exec_args(args), ContentFormat::TextPlain)
                }
            }
            DeviceOp::Observe { path } => {
                if !path.is_heartbeat() {
                    path.require(PathKind::Object, "observe needs an object id")?;
                }
                self.request(Method::Get, path.to_string())
                    .with_observe(true)
                    .with_accept(self.read_format())
            }
            DeviceOp::CancelObserve { path } => {
                if !path.is_heartbeat() {
                    path.require(PathKind::Object, "cancelObserve needs an object id")?;
                }
                self.request(Method::Get, path.to_string()).with_observe(false)
            }
            DeviceOp::Ping => self.request(Method::Post, "/ping"),
        };
        Ok(request)
    }

    /// One read per listed object, used by bootstrap and re-reads.
    pub fn read_all_requests(&self) -> Vec<(String, CoapRequest)> {
        self.record
            .object_list
            .keys()
            .map(|oid| {
                let request = self
                    .request(Method::Get, format!("/{oid}"))
                    .with_accept(self.read_format());
                (oid.clone(), request)
            })
            .collect()
    }

    // ========================================================================
    // Notification Attributes
    // ========================================================================

    /// Attributes recorded for `path`, or none.
    pub fn report_attrs(&self, path: &str) -> ReportAttrs {
        self.report_attrs.get(path).copied().unwrap_or_default()
    }

    /// Records attributes; an open observation picks them up immediately.
    pub fn set_report_attrs(&mut self, path: &str, attrs: ReportAttrs, defaults: (u64, u64)) {
        let merged = self.report_attrs(path).merged(&attrs);
        self.report_attrs.insert(path.to_string(), merged);
        if let Some(entry) = self.observers.get_mut(path) {
            entry
                .report
                .set_attrs(merged.with_defaults(defaults.0, defaults.1));
        }
    }

    // ========================================================================
    // Observations
    // ========================================================================

    pub fn observer(&self, path: &str) -> Option<&ObserverEntry> {
        self.observers.get(path)
    }

    pub fn observer_mut(&mut self, path: &str) -> Option<&mut ObserverEntry> {
        self.observers.get_mut(path)
    }

    pub fn observed_paths(&self) -> Vec<String> {
        self.observers.keys().cloned().collect()
    }

    /// Opens an observation, replacing any previous one on the path.
    ///
    /// Non-heartbeat paths join the persisted observed list.
    pub fn add_observer(&mut self, path: &ResourcePath, entry: ObserverEntry) {
        let key = path.to_string();
        if !path.is_heartbeat() && !self.record.observed_list.contains(&key) {
            self.record.observed_list.push(key.clone());
        }
        self.observers.insert(key, entry);
    }

    /// Closes an observation and drops the path from the observed list.
    ///
    /// Returns whether a stream was open.
    pub fn remove_observer(&mut self, path: &str) -> bool {
        self.record.observed_list.retain(|p| p != path);
        self.observers.remove(path).is_some()
    }

    /// Closes one stream but keeps the path in the observed list.
    pub fn cancel_observer_stream(&mut self, path: &str) -> bool {
        self.observers.remove(path).is_some()
    }

    /// Closes every open stream.
    ///
    /// The observed list is kept so the paths can be re-observed on the next
    /// registration.
    pub fn cancel_all_observers(&mut self) {
        self.observers.clear();
    }

    /// Stops every timer and observation.
    pub fn shutdown(&mut self) {
        self.lifetime_timer.cancel();
        self.sleep_timer.cancel();
        self.cancel_all_observers();
    }
}
