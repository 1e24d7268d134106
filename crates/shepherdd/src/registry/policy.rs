//! Admission policy for devices registering for the first time.
//!
//! Re-registrations of a known client name never consult the policy.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use shepherd_core::DeviceAttrs;

/// Admission decision for a new device.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyDecision {
    /// Accept; `extra` is kept with the session
    Accept { extra: Option<Value> },
    /// Answer the registration with `4.05`
    Reject,
}

impl PolicyDecision {
    pub fn accept() -> Self {
        Self::Accept { extra: None }
    }
}

/// The policy itself failed; the registration is answered with `5.00`.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{0}")]
pub struct PolicyError(pub String);

/// Decides whether a new device may join.
#[async_trait]
pub trait AdmissionPolicy: Send + Sync {
    async fn admit(&self, attrs: &DeviceAttrs) -> Result<PolicyDecision, PolicyError>;
}

/// Default policy: every device is accepted.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

#[async_trait]
impl AdmissionPolicy for AcceptAll {
    async fn admit(&self, _attrs: &DeviceAttrs) -> Result<PolicyDecision, PolicyError> {
        Ok(PolicyDecision::accept())
    }
}

/// Accepts only client names from a fixed list.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    names: Vec<String>,
}

impl AllowList {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl AdmissionPolicy for AllowList {
    async fn admit(&self, attrs: &DeviceAttrs) -> Result<PolicyDecision, PolicyError> {
        let allowed = attrs
            .client_name
            .as_ref()
            .is_some_and(|name| self.names.iter().any(|n| n == name.as_str()));
        Ok(if allowed {
            PolicyDecision::accept()
        } else {
            PolicyDecision::Reject
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shepherd_core::ClientName;

    fn attrs(name: &str) -> DeviceAttrs {
        DeviceAttrs {
            client_name: Some(ClientName::new(name)),
            ..DeviceAttrs::default()
        }
    }

    #[tokio::test]
    async fn test_accept_all() {
        assert_eq!(AcceptAll.admit(&attrs("x")).await, Ok(PolicyDecision::accept()));
    }

    #[tokio::test]
    async fn test_allow_list() {
        let policy = AllowList::new(["dev1"]);
        assert_eq!(policy.admit(&attrs("dev1")).await, Ok(PolicyDecision::accept()));
        assert_eq!(policy.admit(&attrs("dev2")).await, Ok(PolicyDecision::Reject));
    }
}
