//! Shepherd Protocol - CoAP and LWM2M wire handling
//!
//! This crate provides the message descriptors exchanged with devices,
//! the mapping to and from CoAP datagrams, request classification and the parsers
//! for registration queries, link-format and LWM2M payloads.

pub mod classify;
pub mod code;
pub mod codec;
pub mod content;
pub mod message;
pub mod parse;
pub mod version;

pub use classify::{classify, RequestKind};
pub use code::ResponseCode;
pub use codec::{CodecError, MessageType, Packet};
pub use content::{decode_payload, encode_write};
pub use message::{
    CoapRequest, CoapResponse, ContentFormat, InboundRequest, Method, OutboundResponse,
};
pub use parse::{
    decode_link_format, encode_exec_args, plain_value, CheckDirection, CheckQuery, ExecArg,
    ObjectListing, ParseError, RegistrationQuery,
};
pub use version::{Lwm2mVersion, VersionError};
