//! Shepherd Core - Shared types for LWM2M device management
//!
//! This crate provides the domain types shared between the server
//! (shepherdd) and the wire protocol crate (shepherd-protocol):
//! device identity and records, resource paths, the resource tree mirror,
//! and the notification attribute filter.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod device;
pub mod error;
pub mod path;
pub mod report;
pub mod resource;

// Re-exports for convenience
pub use device::{
    AttrsDiff, ClientId, ClientName, DataFormat, DeviceAttrs, DeviceRecord, DeviceStatus,
    DeviceView, ObjectList, DEFAULT_LIFETIME_SECS, DEFAULT_LWM2M_VERSION,
};
pub use error::{DomainError, DomainResult};
pub use path::{PathKind, ResourcePath, HEARTBEAT_PATH};
pub use report::{should_report, ReportAttrs, ReportDecision, ReportState, ALLOWED_ATTRS};
pub use resource::{merge_into, ResourceTree};
