//! Device identity, attributes and persisted records.

use crate::error::{DomainError, DomainResult};
use crate::resource::ResourceTree;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Lifetime applied when a device registers without `lt`.
pub const DEFAULT_LIFETIME_SECS: u64 = 86_400;

/// LWM2M version assumed when a device registers without `lwm2m`.
pub const DEFAULT_LWM2M_VERSION: &str = "1.0.0";

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// Endpoint name a device registers with (`ep=`).
///
/// This is the identity key of the registry and of storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientName(String);

impl ClientName {
    /// Creates a new ClientName from a string.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the name is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ClientName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ClientName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ClientName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for ClientName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Secondary integer identity, unique within one registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(u32);

impl ClientId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    /// Location path handed to the device on registration (`/rd/<id>`).
    pub fn location_path(self) -> String {
        format!("/rd/{}", self.0)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Device Status
// ============================================================================

/// Connectivity status of a registered device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    /// Answered its last exchange
    Online,

    /// Registered but not reachable; the initial status
    #[default]
    Offline,

    /// Checked out for a while
    Sleep,
}

impl DeviceStatus {
    /// Returns the display label for this status.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Sleep => "sleep",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ============================================================================
// Data Format
// ============================================================================

/// Payload format negotiated at registration.
///
/// `ct=11543` in the registration payload selects JSON, anything else TLV.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataFormat {
    Json,
    #[default]
    Tlv,
    Plain,
}

impl DataFormat {
    /// Picks the format from a registration `ct` attribute.
    pub fn from_ct(ct: Option<&str>) -> Self {
        match ct {
            Some("11543") => Self::Json,
            _ => Self::Tlv,
        }
    }
}

/// Object id → instance ids, as announced in the registration payload.
pub type ObjectList = BTreeMap<String, Vec<String>>;

/// Attribute changes keyed by their persisted (camelCase) field names.
pub type AttrsDiff = Map<String, Value>;

// ============================================================================
// Registration Attributes
// ============================================================================

/// Attributes carried by a register or update request.
///
/// Everything is optional here; [`DeviceAttrs::require_registration`]
/// enforces what a registration needs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceAttrs {
    pub client_name: Option<ClientName>,
    pub lifetime: Option<u64>,
    pub version: Option<String>,
    pub mac: Option<String>,
    pub binding: Option<String>,
    pub object_list: Option<ObjectList>,
    pub data_format: Option<DataFormat>,
    pub heartbeat_enabled: Option<bool>,
    pub ip: String,
    pub port: u16,
}

impl DeviceAttrs {
    /// Checks that the attributes name a client and list its objects.
    pub fn require_registration(&self) -> DomainResult<(ClientName, ObjectList)> {
        let client_name = self
            .client_name
            .clone()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| DomainError::InvalidFieldValue {
                field: "ep".to_string(),
                value: String::new(),
                expected: "a client name".to_string(),
            })?;
        let object_list = self
            .object_list
            .clone()
            .ok_or_else(|| DomainError::InvalidFieldValue {
                field: "objList".to_string(),
                value: String::new(),
                expected: "a link-format object list".to_string(),
            })?;
        Ok((client_name, object_list))
    }
}

// ============================================================================
// Device Record (persisted snapshot)
// ============================================================================

/// Everything the storage adapter keeps about one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub client_name: ClientName,
    pub client_id: ClientId,
    pub lifetime: u64,
    pub version: String,
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub mac: Option<String>,
    #[serde(rename = "objList", default)]
    pub object_list: ObjectList,
    #[serde(default)]
    pub observed_list: Vec<String>,
    #[serde(default)]
    pub heartbeat_enabled: bool,
    pub join_time: DateTime<Utc>,
    #[serde(default)]
    pub data_format: DataFormat,
    #[serde(default)]
    pub so: ResourceTree,
}

impl DeviceRecord {
    /// Builds the record for a first registration.
    pub fn from_registration(
        client_name: ClientName,
        client_id: ClientId,
        object_list: ObjectList,
        attrs: &DeviceAttrs,
    ) -> Self {
        Self {
            client_name,
            client_id,
            lifetime: attrs.lifetime.unwrap_or(DEFAULT_LIFETIME_SECS),
            version: attrs
                .version
                .clone()
                .unwrap_or_else(|| DEFAULT_LWM2M_VERSION.to_string()),
            ip: attrs.ip.clone(),
            port: attrs.port,
            mac: attrs.mac.clone(),
            object_list,
            observed_list: Vec::new(),
            heartbeat_enabled: attrs.heartbeat_enabled.unwrap_or(false),
            join_time: Utc::now(),
            data_format: attrs.data_format.unwrap_or_default(),
            so: ResourceTree::default(),
        }
    }

    /// Location path handed to the device (`/rd/<clientId>`).
    pub fn location_path(&self) -> String {
        self.client_id.location_path()
    }

    /// Computes the fields of `attrs` that differ from this record.
    ///
    /// `hb` and `ct` are never part of a diff. Absent attributes are skipped.
    pub fn diff(&self, attrs: &DeviceAttrs) -> AttrsDiff {
        let mut diff = Map::new();

        let mut offer = |key: &str, current: Value, candidate: Option<Value>| {
            if let Some(candidate) = candidate {
                if candidate != current {
                    diff.insert(key.to_string(), candidate);
                }
            }
        };

        offer(
            "lifetime",
            Value::from(self.lifetime),
            attrs.lifetime.map(Value::from),
        );
        offer(
            "version",
            Value::from(self.version.clone()),
            attrs.version.clone().map(Value::from),
        );
        offer(
            "mac",
            self.mac.clone().map(Value::from).unwrap_or(Value::Null),
            attrs.mac.clone().map(Value::from),
        );
        offer(
            "objList",
            serde_json::to_value(&self.object_list).unwrap_or(Value::Null),
            attrs
                .object_list
                .as_ref()
                .and_then(|list| serde_json::to_value(list).ok()),
        );
        if !attrs.ip.is_empty() {
            offer("ip", Value::from(self.ip.clone()), Some(Value::from(attrs.ip.clone())));
        }
        if attrs.port != 0 {
            offer("port", Value::from(self.port), Some(Value::from(attrs.port)));
        }

        diff
    }

    /// Replaces top-level fields with the values in `diff`.
    ///
    /// The identity key cannot be changed this way.
    pub fn apply_diff(&mut self, diff: &AttrsDiff) -> DomainResult<()> {
        if diff.contains_key("clientName") {
            return Err(DomainError::InvalidFieldValue {
                field: "clientName".to_string(),
                value: self.client_name.to_string(),
                expected: "an unchanged identity".to_string(),
            });
        }

        let mut current = serde_json::to_value(&*self).map_err(|e| DomainError::ParseError {
            field: "record".to_string(),
            reason: e.to_string(),
        })?;
        if let Value::Object(fields) = &mut current {
            for (key, value) in diff {
                fields.insert(key.clone(), value.clone());
            }
        }
        *self = serde_json::from_value(current).map_err(|e| DomainError::ParseError {
            field: "diff".to_string(),
            reason: e.to_string(),
        })?;
        Ok(())
    }
}

// ============================================================================
// Device View (read-only summary)
// ============================================================================

/// Read-only summary of a device, as returned by `find`/`list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceView {
    pub client_name: ClientName,
    pub client_id: ClientId,
    pub location_path: String,
    pub lifetime: u64,
    pub version: String,
    pub ip: String,
    pub port: u16,
    pub mac: Option<String>,
    #[serde(rename = "objList")]
    pub object_list: ObjectList,
    pub observed_list: Vec<String>,
    pub heartbeat_enabled: bool,
    pub join_time: DateTime<Utc>,
    pub data_format: DataFormat,
    pub status: DeviceStatus,
    pub registered: bool,
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Value returned by the admission policy, if any
    pub extra: Option<Value>,
}
