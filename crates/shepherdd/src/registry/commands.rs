//! Registry actor commands, errors, and events.
//!
//! This module defines the message types for communicating with the `RegistryActor`:
//! - `RegistryCommand`: Commands sent to the actor
//! - `RegistryError`: Errors that can occur during registry operations
//! - `ShepherdEvent`: Lifecycle events published to subscribers
//! - `DeviceOp`: Operations the server issues against one device
//!
//! Device operations are split in two commands. `Prepare` validates the
//! session and builds the outbound request; the caller performs the exchange
//! and `Complete` applies the result. The actor never waits on a device.

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use shepherd_core::{
    AttrsDiff, ClientId, ClientName, DeviceAttrs, DeviceStatus, DeviceView, DomainError,
    ReportAttrs, ResourcePath,
};
use shepherd_protocol::{CoapRequest, CoapResponse, ExecArg, ResponseCode};

use crate::storage::StorageError;

// ============================================================================
// Device Operations
// ============================================================================

/// An operation issued against one device.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceOp {
    Read { path: ResourcePath },
    Discover { path: ResourcePath },
    Write {
        path: ResourcePath,
        value: Value,
        /// Send the value as opaque bytes (octet-stream)
        transparent: bool,
    },
    WriteAttrs { path: ResourcePath, attrs: ReportAttrs },
    Execute { path: ResourcePath, args: Vec<ExecArg> },
    Observe { path: ResourcePath },
    CancelObserve { path: ResourcePath },
    Ping,
}

impl DeviceOp {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Read { .. } => "read",
            Self::Discover { .. } => "discover",
            Self::Write { .. } => "write",
            Self::WriteAttrs { .. } => "writeAttrs",
            Self::Execute { .. } => "execute",
            Self::Observe { .. } => "observe",
            Self::CancelObserve { .. } => "cancelObserve",
            Self::Ping => "ping",
        }
    }

    pub fn path(&self) -> Option<&ResourcePath> {
        match self {
            Self::Read { path }
            | Self::Discover { path }
            | Self::Write { path, .. }
            | Self::WriteAttrs { path, .. }
            | Self::Execute { path, .. }
            | Self::Observe { path }
            | Self::CancelObserve { path } => Some(path),
            Self::Ping => None,
        }
    }
}

/// Result of a device operation as seen by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceResponse {
    pub status: ResponseCode,
    pub data: Option<Value>,
}

impl DeviceResponse {
    pub fn new(status: ResponseCode) -> Self {
        Self { status, data: None }
    }

    #[must_use]
    pub fn with_data(mut self, data: Option<Value>) -> Self {
        self.data = data;
        self
    }
}

/// Whether a registration names a known device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Unknown client name; the admission policy decides
    New,
    /// Known client name; a re-registration
    Existing,
}

/// What a successful registration hands back to the device.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterOutcome {
    pub client_name: ClientName,
    pub client_id: ClientId,
    pub location_path: String,
    pub is_new: bool,
}

/// Outcome of a registration update.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateOutcome {
    pub client_name: ClientName,
    pub diff: AttrsDiff,
    /// The object list changed and resources should be re-read
    pub reread: bool,
}

/// Timer expiries delivered back to the actor.
///
/// The epoch identifies the arming; an expiry whose epoch no longer
/// matches its slot was superseded and is ignored.
#[derive(Debug, Clone, PartialEq)]
pub enum TimerEvent {
    Lifetime { client_name: ClientName, epoch: u64 },
    Sleep { client_name: ClientName, epoch: u64 },
    MinPeriod { client_name: ClientName, path: String, epoch: u64 },
    MaxPeriod { client_name: ClientName, path: String, epoch: u64 },
    PermitJoinTick { epoch: u64 },
}

// ============================================================================
// Registry Commands
// ============================================================================

/// Commands sent to the registry actor.
///
/// Each request-style command carries a oneshot channel for its response;
/// background bookkeeping commands are fire-and-forget.
#[derive(Debug)]
pub enum RegistryCommand {
    /// Classifies a registration as new or existing before the admission
    /// policy runs.
    ///
    /// # Errors
    /// - `RegistryError::InvalidAttributes` without client name or object list
    /// - `RegistryError::NotJoinable` for a new device while joining is closed
    /// - `RegistryError::RegistryFull` for a new device at capacity
    Admit {
        attrs: Box<DeviceAttrs>,
        respond_to: oneshot::Sender<Result<Admission, RegistryError>>,
    },

    /// Creates a session, or merges attributes into an existing one.
    Register {
        attrs: Box<DeviceAttrs>,
        /// Value attached by the admission policy
        extra: Option<Value>,
        respond_to: oneshot::Sender<Result<RegisterOutcome, RegistryError>>,
    },

    /// Registration update addressed by location path.
    ///
    /// # Errors
    /// - `RegistryError::LocationNotFound` for an unknown location path
    Update {
        location_path: String,
        attrs: Box<DeviceAttrs>,
        respond_to: oneshot::Sender<Result<UpdateOutcome, RegistryError>>,
    },

    /// Removes a device. Absent client names succeed with `false`.
    Deregister {
        client_name: ClientName,
        respond_to: oneshot::Sender<Result<bool, RegistryError>>,
    },

    /// Device announced it goes to sleep.
    CheckOut {
        client_name: ClientName,
        duration: Option<u64>,
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },

    /// Device announced it woke up, possibly from a new address.
    CheckIn {
        client_name: ClientName,
        ip: String,
        port: u16,
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },

    /// Reachability confirmed after a check-in.
    CheckInConfirmed { client_name: ClientName },

    Find {
        client_name: ClientName,
        respond_to: oneshot::Sender<Option<DeviceView>>,
    },

    FindByMac {
        mac: String,
        respond_to: oneshot::Sender<Vec<DeviceView>>,
    },

    FindByClientId {
        client_id: ClientId,
        respond_to: oneshot::Sender<Option<DeviceView>>,
    },

    FindByLocationPath {
        location_path: String,
        respond_to: oneshot::Sender<Option<DeviceView>>,
    },

    List {
        respond_to: oneshot::Sender<Vec<DeviceView>>,
    },

    /// Opens the join window for `seconds`; `0` closes it.
    PermitJoin {
        seconds: u64,
        respond_to: oneshot::Sender<bool>,
    },

    /// Sets the join gate indefinitely.
    AlwaysPermitJoin {
        enabled: bool,
        respond_to: oneshot::Sender<bool>,
    },

    IsJoinable {
        respond_to: oneshot::Sender<bool>,
    },

    /// Validates a device operation and builds its request.
    Prepare {
        client_name: ClientName,
        op: Box<DeviceOp>,
        respond_to: oneshot::Sender<Result<CoapRequest, RegistryError>>,
    },

    /// Applies the response of a prepared operation.
    Complete {
        client_name: ClientName,
        op: Box<DeviceOp>,
        response: CoapResponse,
        /// Round-trip time of the exchange in milliseconds
        elapsed_ms: u64,
        respond_to: oneshot::Sender<Result<DeviceResponse, RegistryError>>,
    },

    /// Applies the initial response of an observation and takes over its
    /// notification stream.
    CompleteObserve {
        client_name: ClientName,
        path: ResourcePath,
        response: CoapResponse,
        notifications: Option<mpsc::Receiver<CoapResponse>>,
        respond_to: oneshot::Sender<Result<DeviceResponse, RegistryError>>,
    },

    /// Builds one read request per listed object.
    PrepareReadAll {
        client_name: ClientName,
        respond_to: oneshot::Sender<Result<Vec<(String, CoapRequest)>, RegistryError>>,
    },

    /// Loads the answers of a bulk read into the resource tree.
    ///
    /// # Errors
    /// - `RegistryError::ObjectReadFailed` naming the first object that failed
    CompleteReadAll {
        client_name: ClientName,
        responses: Vec<(String, CoapResponse)>,
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },

    /// Persists the full session record.
    Persist {
        client_name: ClientName,
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },

    /// Bootstrap reached its last step: fire `device::incoming` when due,
    /// mark online, and hand back the paths to re-observe.
    BootstrapComplete {
        client_name: ClientName,
        is_new: bool,
        respond_to: oneshot::Sender<Result<Vec<String>, RegistryError>>,
    },

    /// Drops paths that could not be re-observed.
    PruneObserved {
        client_name: ClientName,
        paths: Vec<String>,
    },

    /// A notification arrived on an open observation.
    Notification {
        client_name: ClientName,
        path: String,
        observation_id: u64,
        response: CoapResponse,
    },

    /// The notification stream of an observation ended.
    ObservationClosed {
        client_name: ClientName,
        path: String,
        observation_id: u64,
    },

    /// A timer fired.
    Timer(TimerEvent),

    /// Periodic heartbeat check, sent by the sweep task.
    HeartbeatSweep,

    /// Outcome of a heartbeat ping.
    HeartbeatResult {
        client_name: ClientName,
        outcome: Result<ResponseCode, String>,
    },

    /// Builds the `POST /announce` requests for every session.
    AnnounceTargets {
        message: String,
        respond_to: oneshot::Sender<Vec<CoapRequest>>,
    },

    /// Publishes an `error` event.
    ReportError {
        client_name: Option<ClientName>,
        message: String,
    },

    /// Drops every session, optionally clears storage, then reloads sessions
    /// from storage. Returns the number of sessions loaded.
    Reload {
        purge: bool,
        respond_to: oneshot::Sender<Result<usize, RegistryError>>,
    },

    /// Stops the actor and all its timers.
    Shutdown { respond_to: oneshot::Sender<()> },
}

// ============================================================================
// Registry Errors
// ============================================================================

/// Errors that can occur during registry operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    #[error("Registry full (max {max} devices)")]
    RegistryFull { max: usize },

    #[error("Device not found: {0}")]
    DeviceNotFound(ClientName),

    #[error("No device at location {0}")]
    LocationNotFound(String),

    #[error("Registration is not permitted at this time")]
    NotJoinable,

    #[error("Device {0} was rejected by the admission policy")]
    AdmissionRejected(ClientName),

    #[error("Admission policy failed: {0}")]
    AdmissionFailed(String),

    #[error("Invalid attributes: {0}")]
    InvalidAttributes(String),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Object requests fail: {path} answered {code}")]
    ObjectReadFailed { path: String, code: ResponseCode },

    #[error("Registry channel closed")]
    ChannelClosed,
}

// ============================================================================
// Lifecycle Events
// ============================================================================

/// Events published by the registry for subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum ShepherdEvent {
    /// The server finished starting
    Ready,

    /// A device joined (or re-joined with `always_fire_dev_incoming`)
    Incoming { device: Box<DeviceView> },

    /// A registration update changed attributes
    Update { client_name: ClientName, diff: AttrsDiff },

    /// An observed path reported a value
    Notify {
        client_name: ClientName,
        path: String,
        value: Value,
    },

    /// Connectivity status changed
    Status {
        client_name: ClientName,
        status: DeviceStatus,
    },

    /// A device deregistered or expired
    Leaving {
        client_name: ClientName,
        mac: Option<String>,
    },

    /// A device looked up another endpoint
    Lookup { client_name: ClientName },

    /// Seconds left in the join window
    PermitJoining { remaining: u64 },

    /// A failure outside any caller's reach
    Error {
        client_name: Option<ClientName>,
        message: String,
    },
}

impl ShepherdEvent {
    /// Event name as exposed to subscribers.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Incoming { .. } => "device::incoming",
            Self::Update { .. } => "device::update",
            Self::Notify { .. } => "device::notify",
            Self::Status { .. } => "device::status",
            Self::Leaving { .. } => "device::leaving",
            Self::Lookup { .. } => "lookup",
            Self::PermitJoining { .. } => "permitJoining",
            Self::Error { .. } => "error",
        }
    }

    /// Client the event is about, if any.
    pub fn client_name(&self) -> Option<&ClientName> {
        match self {
            Self::Incoming { device } => Some(&device.client_name),
            Self::Update { client_name, .. }
            | Self::Notify { client_name, .. }
            | Self::Status { client_name, .. }
            | Self::Leaving { client_name, .. }
            | Self::Lookup { client_name } => Some(client_name),
            Self::Error { client_name, .. } => client_name.as_ref(),
            Self::Ready | Self::PermitJoining { .. } => None,
        }
    }
}
