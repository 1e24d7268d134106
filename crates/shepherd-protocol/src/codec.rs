//! Mapping between CoAP datagrams and the message descriptors.
//!
//! Framing (header, token, option deltas, payload marker) is done by
//! `coap-lite`; this module only translates its [`Packet`] to and from
//! [`InboundRequest`], [`OutboundResponse`], [`CoapRequest`] and
//! [`CoapResponse`].

use std::net::SocketAddr;

use coap_lite::option_value::OptionValueU16;

use crate::code::ResponseCode;
use crate::content::decode_payload;
use crate::message::{
    CoapRequest, CoapResponse, ContentFormat, InboundRequest, Method, OutboundResponse,
};

pub use coap_lite::error::MessageError as CodecError;
pub use coap_lite::{CoapOption, MessageClass, MessageType, Packet};

/// Parses a datagram.
pub fn decode(bytes: &[u8]) -> Result<Packet, CodecError> {
    Packet::from_bytes(bytes)
}

/// Serializes a packet for the socket.
pub fn encode(packet: &Packet) -> Result<Vec<u8>, CodecError> {
    packet.to_bytes()
}

/// Empty ACK or RST for `message_id`.
pub fn empty(message_type: MessageType, message_id: u16) -> Packet {
    let mut packet = Packet::new();
    packet.header.set_type(message_type);
    packet.header.code = MessageClass::Empty;
    packet.header.message_id = message_id;
    packet
}

/// True for requests and empty messages (code class 0).
pub fn is_request(packet: &Packet) -> bool {
    matches!(packet.header.code, MessageClass::Empty | MessageClass::Request(_))
}

fn strings(packet: &Packet, option: CoapOption) -> Vec<String> {
    packet
        .get_option(option)
        .map(|values| {
            values
                .iter()
                .map(|v| String::from_utf8_lossy(v).into_owned())
                .collect()
        })
        .unwrap_or_default()
}

fn content_format(packet: &Packet) -> Option<ContentFormat> {
    packet
        .get_first_option_as::<OptionValueU16>(CoapOption::ContentFormat)
        .and_then(Result::ok)
        .map(|OptionValueU16(value)| ContentFormat::from_u16(value))
}

/// Interprets a datagram from a device as an [`InboundRequest`].
///
/// Returns `None` for responses and unsupported request codes.
pub fn to_inbound(packet: &Packet, source: SocketAddr) -> Option<InboundRequest> {
    let confirmable = packet.header.get_type() == MessageType::Confirmable;
    match packet.header.code {
        MessageClass::Empty => {
            let mut request = InboundRequest::empty(source);
            request.confirmable = confirmable;
            Some(request)
        }
        MessageClass::Request(_) => {
            let method = Method::from_code(u8::from(packet.header.code) & 0x1f)?;
            Some(InboundRequest {
                method: Some(method),
                path: format!("/{}", strings(packet, CoapOption::UriPath).join("/")),
                query: strings(packet, CoapOption::UriQuery),
                confirmable,
                payload: packet.payload.clone(),
                source,
            })
        }
        _ => None,
    }
}

/// Builds the answer to `request` (piggybacked ACK when confirmable).
pub fn response_packet(request: &Packet, response: &OutboundResponse) -> Packet {
    let message_id = request.header.message_id;
    if response.reset {
        return empty(MessageType::Reset, message_id);
    }

    let mut packet = Packet::new();
    packet.header.set_type(if request.header.get_type() == MessageType::Confirmable {
        MessageType::Acknowledgement
    } else {
        MessageType::NonConfirmable
    });
    packet.header.code = MessageClass::from(response.code.to_byte());
    packet.header.message_id = message_id;
    packet.set_token(request.get_token().to_vec());
    for segment in &response.location_path {
        packet.add_option(CoapOption::LocationPath, segment.as_bytes().to_vec());
    }
    if let Some(format) = response.content_format {
        packet.add_option_as(CoapOption::ContentFormat, OptionValueU16(format.to_u16()));
    }
    packet.payload = response.payload.clone();
    packet
}

/// Builds a confirmable request to a device.
pub fn request_packet(request: &CoapRequest, message_id: u16, token: Vec<u8>) -> Packet {
    let mut packet = Packet::new();
    packet.header.set_type(MessageType::Confirmable);
    packet.header.code = MessageClass::from(request.method.code());
    packet.header.message_id = message_id;
    packet.set_token(token);

    if let Some(register) = request.observe {
        packet.set_observe_value(if register { 0 } else { 1 });
    }
    for segment in request.path.split('/').filter(|s| !s.is_empty()) {
        packet.add_option(CoapOption::UriPath, segment.as_bytes().to_vec());
    }
    if let Some(format) = request.content_format {
        packet.add_option_as(CoapOption::ContentFormat, OptionValueU16(format.to_u16()));
    }
    if let Some(query) = &request.query {
        for item in query.split('&').filter(|s| !s.is_empty()) {
            packet.add_option(CoapOption::UriQuery, item.as_bytes().to_vec());
        }
    }
    if let Some(accept) = request.accept {
        packet.add_option_as(CoapOption::Accept, OptionValueU16(accept.to_u16()));
    }
    if let Some(payload) = &request.payload {
        packet.payload = payload.clone();
    }
    packet
}

/// Decodes a device's response for the resource at `path`.
pub fn to_response(packet: &Packet, path: &str) -> CoapResponse {
    let format = content_format(packet);
    CoapResponse {
        code: ResponseCode::from_byte(u8::from(packet.header.code)),
        payload: decode_payload(path, format, &packet.payload),
        content_format: format,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coap_lite::RequestType;

    fn source() -> SocketAddr {
        "10.0.0.2:5683".parse().unwrap()
    }

    #[test]
    fn test_inbound_registration() {
        let mut packet = Packet::new();
        packet.header.set_type(MessageType::Confirmable);
        packet.header.code = MessageClass::Request(RequestType::Post);
        packet.header.message_id = 1;
        packet.set_token(vec![1, 2]);
        packet.add_option(CoapOption::UriPath, b"rd".to_vec());
        packet.add_option(CoapOption::UriQuery, b"ep=dev1".to_vec());
        packet.add_option(CoapOption::UriQuery, b"lt=300".to_vec());
        packet.payload = b"</1/0>".to_vec();

        let wire = encode(&packet).unwrap();
        let packet = decode(&wire).unwrap();
        let req = to_inbound(&packet, source()).unwrap();
        assert_eq!(req.method, Some(Method::Post));
        assert_eq!(req.path, "/rd");
        assert_eq!(req.query, vec!["ep=dev1", "lt=300"]);
        assert!(req.confirmable);

        let resp = OutboundResponse::new(ResponseCode::Created).with_location(["rd", "1"]);
        let answer = response_packet(&packet, &resp);
        assert_eq!(answer.header.get_type(), MessageType::Acknowledgement);
        assert_eq!(answer.get_token().to_vec(), vec![1, 2]);
        assert_eq!(u8::from(answer.header.code), 0x41);
        assert_eq!(strings(&answer, CoapOption::LocationPath), vec!["rd", "1"]);
    }

    #[test]
    fn test_empty_confirmable_gets_reset() {
        let ping = empty(MessageType::Confirmable, 9);
        assert!(is_request(&ping));
        assert_eq!(to_inbound(&ping, source()).unwrap().method, None);

        let answer = response_packet(&ping, &OutboundResponse::reset());
        assert_eq!(answer.header.get_type(), MessageType::Reset);
        assert_eq!(answer.header.code, MessageClass::Empty);
        assert_eq!(answer.header.message_id, 9);
    }

    #[test]
    fn test_outgoing_observe_request() {
        let req = CoapRequest::new(Method::Get, "10.0.0.2", 5683, "/3303/0/5700")
            .with_observe(true)
            .with_accept(ContentFormat::Lwm2mJson);
        let packet = request_packet(&req, 42, vec![7]);

        assert_eq!(packet.get_observe_value().and_then(Result::ok), Some(0));
        assert_eq!(strings(&packet, CoapOption::UriPath), vec!["3303", "0", "5700"]);
        let accept = packet
            .get_first_option_as::<OptionValueU16>(CoapOption::Accept)
            .and_then(Result::ok)
            .map(|OptionValueU16(value)| value);
        assert_eq!(accept, Some(11543));
        assert!(is_request(&packet));
    }

    #[test]
    fn test_response_payload_decoded_by_format() {
        let mut reply = Packet::new();
        reply.header.set_type(MessageType::Acknowledgement);
        reply.header.code = MessageClass::from(0x45);
        reply.header.message_id = 42;
        reply.add_option_as(CoapOption::ContentFormat, OptionValueU16(0));
        reply.payload = b"21.5".to_vec();

        let reply = decode(&encode(&reply).unwrap()).unwrap();
        assert!(!is_request(&reply));
        let resp = to_response(&reply, "/3303/0/5700");
        assert_eq!(resp.code, ResponseCode::Content);
        assert_eq!(resp.content_format, Some(ContentFormat::TextPlain));
        assert_eq!(resp.payload, Some(serde_json::json!(21.5)));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode(&[0x40]).is_err());
    }
}
