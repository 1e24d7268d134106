//! Routing of inbound device requests to registry operations.
//!
//! Every request is classified, its query and payload parsed, and the
//! resulting registry call mapped back onto a CoAP response code. Parse
//! failures are answered with `4.00` before the registry sees anything.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()` or `.expect()`; every failure becomes a response code
//! - A closed registry channel is answered with `5.00`

use thiserror::Error;
use tracing::{debug, warn};

use shepherd_core::{ClientName, DataFormat, DeviceAttrs};
use shepherd_protocol::{
    classify, CheckDirection, CheckQuery, InboundRequest, Lwm2mVersion, ObjectListing,
    OutboundResponse, ParseError, RegistrationQuery, RequestKind, ResponseCode, VersionError,
};

use crate::registry::{RegistryError, RegistryHandle, ShepherdEvent};

/// Payload of the `/test` diagnostic answer.
pub const DIAGNOSTIC_REPLY: &str = "_test";

/// Errors raised while serving one inbound request.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    #[error("malformed request: {0}")]
    Parse(#[from] ParseError),

    #[error("unsupported lwm2m version: {0}")]
    Version(#[from] VersionError),

    #[error("request names no endpoint")]
    MissingEndpoint,

    #[error("unknown endpoint: {0}")]
    UnknownEndpoint(String),

    #[error("not a device request")]
    Unclassified,

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl DispatchError {
    /// Code the device receives for this failure.
    pub fn response_code(&self) -> ResponseCode {
        match self {
            Self::Parse(_) | Self::Version(_) | Self::MissingEndpoint | Self::Unclassified => {
                ResponseCode::BadRequest
            }
            Self::UnknownEndpoint(_) => ResponseCode::NotFound,
            Self::Registry(e) => match e {
                RegistryError::InvalidAttributes(_) | RegistryError::Domain(_) => {
                    ResponseCode::BadRequest
                }
                RegistryError::DeviceNotFound(_) | RegistryError::LocationNotFound(_) => {
                    ResponseCode::NotFound
                }
                RegistryError::NotJoinable | RegistryError::AdmissionRejected(_) => {
                    ResponseCode::NotAllowed
                }
                RegistryError::RegistryFull { .. } => ResponseCode::ServiceUnavailable,
                RegistryError::AdmissionFailed(_)
                | RegistryError::ObjectReadFailed { .. }
                | RegistryError::Storage(_)
                | RegistryError::Transport(_)
                | RegistryError::ChannelClosed => ResponseCode::ServerError,
            },
        }
    }
}

/// Serves inbound device requests against the registry.
#[derive(Clone)]
pub struct Dispatcher {
    registry: RegistryHandle,
}

impl Dispatcher {
    pub fn new(registry: RegistryHandle) -> Self {
        Self { registry }
    }

    /// Answers one request. Never fails: errors become response codes.
    pub async fn dispatch(&self, request: InboundRequest) -> OutboundResponse {
        let kind = classify(&request);
        debug!(
            kind = kind.map(RequestKind::as_str).unwrap_or("unknown"),
            url = %request.url(),
            source = %request.source,
            "Inbound request"
        );

        let result = match kind {
            Some(RequestKind::Register) => self.register(&request).await,
            Some(RequestKind::Update) => self.update(&request).await,
            Some(RequestKind::Deregister) => self.deregister(&request).await,
            Some(RequestKind::Check) => self.check(&request).await,
            Some(RequestKind::Lookup) => self.lookup(&request).await,
            Some(RequestKind::Diagnostic) => {
                Ok(OutboundResponse::new(ResponseCode::Content).with_text(DIAGNOSTIC_REPLY))
            }
            Some(RequestKind::Empty) => Ok(OutboundResponse::reset()),
            None => Err(DispatchError::Unclassified),
        };

        result.unwrap_or_else(|e| {
            let code = e.response_code();
            if code == ResponseCode::ServerError {
                warn!(url = %request.url(), error = %e, "Request failed");
            } else {
                debug!(url = %request.url(), code = %code, error = %e, "Request refused");
            }
            OutboundResponse::new(code)
        })
    }

    async fn register(&self, request: &InboundRequest) -> Result<OutboundResponse, DispatchError> {
        let query = RegistrationQuery::parse(&request.query)?;
        if let Some(version) = &query.version {
            Lwm2mVersion::check_supported(version)?;
        }
        let listing = ObjectListing::parse(&request.payload_text())?;

        let mut attrs = self.attrs_from(request, query);
        attrs.object_list = Some(listing.objects);
        attrs.data_format = Some(DataFormat::from_ct(listing.content_type.as_deref()));
        attrs.heartbeat_enabled = Some(listing.heartbeat);

        let outcome = self.registry.register(attrs).await?;
        let location = outcome
            .location_path
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(str::to_string)
            .collect::<Vec<_>>();

        Ok(OutboundResponse::new(ResponseCode::Created).with_location(location))
    }

    async fn update(&self, request: &InboundRequest) -> Result<OutboundResponse, DispatchError> {
        let query = RegistrationQuery::parse(&request.query)?;
        if let Some(version) = &query.version {
            Lwm2mVersion::check_supported(version)?;
        }

        let mut attrs = self.attrs_from(request, query);
        // The endpoint name is fixed by the location path
        attrs.client_name = None;
        let payload = request.payload_text();
        if !payload.trim().is_empty() {
            attrs.object_list = Some(ObjectListing::parse(&payload)?.objects);
        }

        self.registry.update(&request.path, attrs).await?;
        Ok(OutboundResponse::new(ResponseCode::Changed))
    }

    async fn deregister(
        &self,
        request: &InboundRequest,
    ) -> Result<OutboundResponse, DispatchError> {
        let client_name = self.name_at(request).await?;
        if self.registry.deregister(&client_name).await? {
            Ok(OutboundResponse::new(ResponseCode::Deleted))
        } else {
            Err(DispatchError::UnknownEndpoint(client_name.to_string()))
        }
    }

    async fn check(&self, request: &InboundRequest) -> Result<OutboundResponse, DispatchError> {
        let query = CheckQuery::parse(&request.query)?;
        let client_name = self.name_at(request).await?;

        match query.direction {
            CheckDirection::Out => self.registry.check_out(&client_name, query.duration).await?,
            CheckDirection::In => {
                self.registry
                    .check_in(&client_name, request.source.ip().to_string(), request.source.port())
                    .await?
            }
        }
        Ok(OutboundResponse::new(ResponseCode::Changed))
    }

    async fn lookup(&self, request: &InboundRequest) -> Result<OutboundResponse, DispatchError> {
        let query = RegistrationQuery::parse(&request.query)?;
        let endpoint = query
            .client_name
            .filter(|name| !name.is_empty())
            .ok_or(DispatchError::MissingEndpoint)?;
        let client_name =
            ClientName::new(self.registry.config().client_name_for(endpoint.as_str()));

        let device = self
            .registry
            .find(&client_name)
            .await
            .ok_or_else(|| DispatchError::UnknownEndpoint(client_name.to_string()))?;

        self.registry.publish(ShepherdEvent::Lookup {
            client_name: client_name.clone(),
        });

        let link = format!("<coap://{}:{}>;ep={}", device.ip, device.port, device.client_name);
        Ok(OutboundResponse::new(ResponseCode::Content).with_link_format(link))
    }

    /// Builds registration attributes from the query and the source address.
    fn attrs_from(&self, request: &InboundRequest, query: RegistrationQuery) -> DeviceAttrs {
        let client_name = query
            .client_name
            .map(|name| ClientName::new(self.registry.config().client_name_for(name.as_str())));

        DeviceAttrs {
            client_name,
            lifetime: query.lifetime,
            version: query.version,
            mac: query.mac,
            binding: query.binding,
            ip: request.source.ip().to_string(),
            port: request.source.port(),
            ..DeviceAttrs::default()
        }
    }

    /// Resolves the device registered at the request's location path.
    async fn name_at(&self, request: &InboundRequest) -> Result<ClientName, DispatchError> {
        self.registry
            .find_by_location_path(&request.path)
            .await
            .map(|device| device.client_name)
            .ok_or_else(|| {
                DispatchError::Registry(RegistryError::LocationNotFound(request.path.clone()))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shepherd_core::DomainError;

    #[test]
    fn test_registry_error_codes() {
        let cases = [
            (RegistryError::NotJoinable, ResponseCode::NotAllowed),
            (
                RegistryError::AdmissionRejected(ClientName::new("dev1")),
                ResponseCode::NotAllowed,
            ),
            (
                RegistryError::AdmissionFailed("policy down".to_string()),
                ResponseCode::ServerError,
            ),
            (RegistryError::RegistryFull { max: 1 }, ResponseCode::ServiceUnavailable),
            (
                RegistryError::LocationNotFound("/rd/9".to_string()),
                ResponseCode::NotFound,
            ),
            (
                RegistryError::Domain(DomainError::AttributeNotAllowed("foo".to_string())),
                ResponseCode::BadRequest,
            ),
            (RegistryError::ChannelClosed, ResponseCode::ServerError),
            (
                RegistryError::ObjectReadFailed {
                    path: "/5".to_string(),
                    code: ResponseCode::NotFound,
                },
                ResponseCode::ServerError,
            ),
        ];

        for (error, code) in cases {
            assert_eq!(DispatchError::from(error.clone()).response_code(), code, "{error}");
        }
    }

    #[test]
    fn test_parse_errors_are_bad_requests() {
        let parse = DispatchError::from(ParseError::UnknownParameter("foo".to_string()));
        assert_eq!(parse.response_code(), ResponseCode::BadRequest);

        let version = DispatchError::from(VersionError::InvalidFormat("x".to_string()));
        assert_eq!(version.response_code(), ResponseCode::BadRequest);

        assert_eq!(DispatchError::MissingEndpoint.response_code(), ResponseCode::BadRequest);
        assert_eq!(
            DispatchError::UnknownEndpoint("dev1".to_string()).response_code(),
            ResponseCode::NotFound
        );
    }
}
