//! Inbound packet classification and request parsing.
//!
//! The session engine feeds every decoded packet through [`classify`] and
//! then uses the typed parsers here to pull the pieces a handler needs.

use coap_lite::Packet;

use crate::codec::{self, UriCode};
use crate::core::{ProtocolError, MAX_PAYLOAD_LENGTH};
use crate::rpc::describe::DESCRIBE_FULL;
use crate::rpc::registry::FunctionCall;

/// What an inbound packet is, before routing.
#[derive(Debug)]
pub enum Inbound {
    /// Confirmable 0.00: a CoAP ping; answer with an empty ACK.
    EmptyPing {
        /// Message id to echo.
        message_id: u16,
    },
    /// ACK with code 0.00: pure acknowledgement.
    EmptyAck(Packet),
    /// ACK carrying a response code (piggybacked response).
    ResponseAck(Packet),
    /// Separate (non-ACK) response.
    Response(Packet),
    /// A request routed by its first URI-Path segment.
    Request {
        /// Routing code.
        uri: UriCode,
        /// Full packet.
        packet: Packet,
    },
    /// Anything else; raised as a non-fatal error event.
    Unknown(Packet),
}

/// Classify one decoded packet.
pub fn classify(packet: Packet) -> Inbound {
    let message_id = packet.header.message_id;

    if codec::is_ack(&packet) {
        if codec::is_empty_code(&packet) {
            return Inbound::EmptyAck(packet);
        }
        return Inbound::ResponseAck(packet);
    }

    if codec::is_empty_code(&packet) {
        if codec::is_confirmable(&packet) {
            return Inbound::EmptyPing { message_id };
        }
        return Inbound::Unknown(packet);
    }

    if codec::method(&packet).is_some() {
        let path = codec::uri_path(&packet);
        return match path.first().and_then(|s| UriCode::from_segment(s)) {
            Some(uri) => Inbound::Request { uri, packet },
            None => Inbound::Unknown(packet),
        };
    }

    // A response code on a CON/NON message: a separate response.
    Inbound::Response(packet)
}

/// Extract the function name and call arguments from a Function request.
pub fn function_target(packet: &Packet) -> Result<(String, FunctionCall), ProtocolError> {
    let path = codec::uri_path(packet);
    let name = path.get(1..).unwrap_or_default().join("/");
    if name.is_empty() {
        return Err(ProtocolError::FunctionNotFound(String::new()));
    }

    let queries = codec::uri_queries(packet);
    let args_bytes = queries.first().cloned().unwrap_or_default();
    if args_bytes.len() > MAX_PAYLOAD_LENGTH {
        return Err(ProtocolError::ArgsTooLong(args_bytes.len()));
    }
    let args = String::from_utf8_lossy(&args_bytes).into_owned();
    let caller = queries
        .get(1)
        .map(|c| String::from_utf8_lossy(c).into_owned());

    Ok((name, FunctionCall { args, caller }))
}

/// Extract the variable selector (first segment after `v`) and the full
/// remaining path handed to the callback.
pub fn variable_target(packet: &Packet) -> Option<(String, String)> {
    let path = codec::uri_path(packet);
    let full = path.get(1..).unwrap_or_default().join("/");
    if full.is_empty() {
        return None;
    }
    let selector = full.split('/').next().unwrap_or(&full).to_string();
    Some((selector, full))
}

/// The event name of a Public/Private event packet (path after the code).
pub fn event_name(packet: &Packet) -> String {
    codec::uri_path(packet)
        .get(1..)
        .unwrap_or_default()
        .join("/")
}

/// Whether a SignalStart request asks for the indication to turn on.
pub fn signal_on(packet: &Packet) -> bool {
    codec::uri_queries(packet)
        .first()
        .map(|q| codec::be_uint(q) == 1)
        .unwrap_or(false)
}

/// Decode the Describe Uri-Query flags; a missing query means the full
/// descriptor.
pub fn describe_flags(packet: &Packet) -> u8 {
    let Some(query) = codec::uri_queries(packet).into_iter().next() else {
        return DESCRIBE_FULL;
    };
    if !query.is_empty() && query.iter().all(u8::is_ascii_digit) {
        return String::from_utf8_lossy(&query).parse().unwrap_or(DESCRIBE_FULL);
    }
    codec::be_uint(&query) as u8
}

/// The file name of a FileRequest: path remainder, else the payload.
pub fn file_request_name(packet: &Packet) -> Option<String> {
    let path = codec::uri_path(packet);
    let from_path = path.get(1..).unwrap_or_default().join("/");
    if !from_path.is_empty() {
        return Some(from_path);
    }
    if packet.payload.is_empty() {
        return None;
    }
    Some(String::from_utf8_lossy(&packet.payload).into_owned())
}

/// Encode a function return value as the 4-byte big-endian payload.
pub fn encode_function_result(value: i32) -> Vec<u8> {
    value.to_be_bytes().to_vec()
}
