//! Thin bridge over the external CoAP packet codec.
//!
//! The session engine never touches `coap_lite` types directly outside this
//! module; everything flows through the typed builders and accessors here.

use std::collections::LinkedList;

use coap_lite::{CoapOption, MessageClass, MessageType, Packet, RequestType, ResponseType};

use crate::core::ProtocolError;

/// CoAP response code, re-exported so callers can pick error replies.
pub type Status = ResponseType;

/// CoAP request method.
pub type Method = RequestType;

/// First URI-Path segment codes used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UriCode {
    /// `h`: Hello.
    Hello,
    /// `d`: Describe.
    Describe,
    /// `f`: Function call.
    Function,
    /// `v`: Variable read.
    Variable,
    /// `e`: Public event / Subscribe.
    PublicEvent,
    /// `E`: Private event.
    PrivateEvent,
    /// `s`: SignalStart.
    Signal,
    /// `t`: GetTime.
    GetTime,
    /// `u`: UpdateBegin / UpdateReady / UpdateDone.
    Update,
    /// `c`: Chunk.
    Chunk,
    /// `g`: FileRequest.
    FileRequest,
    /// `p`: UpdateProperty.
    UpdateProperty,
}

impl UriCode {
    /// Map a first URI-Path segment to its code.
    pub fn from_segment(segment: &str) -> Option<Self> {
        match segment.as_bytes().first()? {
            b'h' => Some(Self::Hello),
            b'd' => Some(Self::Describe),
            b'f' => Some(Self::Function),
            b'v' => Some(Self::Variable),
            b'e' => Some(Self::PublicEvent),
            b'E' => Some(Self::PrivateEvent),
            b's' => Some(Self::Signal),
            b't' => Some(Self::GetTime),
            b'u' => Some(Self::Update),
            b'c' => Some(Self::Chunk),
            b'g' => Some(Self::FileRequest),
            b'p' => Some(Self::UpdateProperty),
            _ => None,
        }
    }

    /// The wire segment for this code.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hello => "h",
            Self::Describe => "d",
            Self::Function => "f",
            Self::Variable => "v",
            Self::PublicEvent => "e",
            Self::PrivateEvent => "E",
            Self::Signal => "s",
            Self::GetTime => "t",
            Self::Update => "u",
            Self::Chunk => "c",
            Self::FileRequest => "g",
            Self::UpdateProperty => "p",
        }
    }
}

/// Build a request packet with typed path and query options.
pub fn request(
    method: Method,
    confirmable: bool,
    message_id: u16,
    path: &[&str],
    queries: &[Vec<u8>],
    token: Vec<u8>,
    payload: Vec<u8>,
) -> Packet {
    let mut packet = Packet::new();
    packet.header.message_id = message_id;
    packet.header.set_type(if confirmable {
        MessageType::Confirmable
    } else {
        MessageType::NonConfirmable
    });
    packet.header.code = MessageClass::Request(method);
    packet.set_token(token);
    for segment in path {
        packet.add_option(CoapOption::UriPath, segment.as_bytes().to_vec());
    }
    for query in queries {
        packet.add_option(CoapOption::UriQuery, query.clone());
    }
    packet.payload = payload;
    packet
}

/// Build an empty ACK echoing the given message id (also answers CoAP pings).
pub fn ack_empty(message_id: u16) -> Packet {
    let mut packet = Packet::new();
    packet.header.message_id = message_id;
    packet.header.set_type(MessageType::Acknowledgement);
    packet.header.code = MessageClass::Empty;
    packet
}

/// Build a piggybacked ACK response with a status code and payload.
pub fn ack_with(status: Status, message_id: u16, token: Vec<u8>, payload: Vec<u8>) -> Packet {
    let mut packet = Packet::new();
    packet.header.message_id = message_id;
    packet.header.set_type(MessageType::Acknowledgement);
    packet.header.code = MessageClass::Response(status);
    packet.set_token(token);
    packet.payload = payload;
    packet
}

/// Build a separate (non-ACK) response correlated by token.
pub fn response(status: Status, message_id: u16, token: Vec<u8>, payload: Vec<u8>) -> Packet {
    let mut packet = Packet::new();
    packet.header.message_id = message_id;
    packet.header.set_type(MessageType::NonConfirmable);
    packet.header.code = MessageClass::Response(status);
    packet.set_token(token);
    packet.payload = payload;
    packet
}

/// Build an empty confirmable message (keepalive ping).
pub fn ping(message_id: u16) -> Packet {
    let mut packet = Packet::new();
    packet.header.message_id = message_id;
    packet.header.set_type(MessageType::Confirmable);
    packet.header.code = MessageClass::Empty;
    packet
}

/// Serialize a packet to wire bytes.
pub fn encode(packet: &Packet) -> Result<Vec<u8>, ProtocolError> {
    packet
        .to_bytes()
        .map_err(|e| ProtocolError::MalformedPacket(e.to_string()))
}

/// Parse wire bytes into a packet.
pub fn decode(bytes: &[u8]) -> Result<Packet, ProtocolError> {
    Packet::from_bytes(bytes).map_err(|e| ProtocolError::MalformedPacket(e.to_string()))
}

/// All URI-Path segments as strings.
pub fn uri_path(packet: &Packet) -> Vec<String> {
    option_values(packet, CoapOption::UriPath)
        .iter()
        .map(|v| String::from_utf8_lossy(v).into_owned())
        .collect()
}

/// All URI-Query option values, in option order.
pub fn uri_queries(packet: &Packet) -> Vec<Vec<u8>> {
    option_values(packet, CoapOption::UriQuery)
}

fn option_values(packet: &Packet, option: CoapOption) -> Vec<Vec<u8>> {
    packet
        .get_option(option)
        .map(|list: &LinkedList<Vec<u8>>| list.iter().cloned().collect())
        .unwrap_or_default()
}

/// The raw code byte (`class << 5 | detail`), for ordered comparisons.
pub fn code_byte(packet: &Packet) -> u8 {
    u8::from(packet.header.code)
}

/// Whether this packet is an acknowledgement.
pub fn is_ack(packet: &Packet) -> bool {
    packet.header.get_type() == MessageType::Acknowledgement
}

/// Whether this packet carries the confirmable bit.
pub fn is_confirmable(packet: &Packet) -> bool {
    packet.header.get_type() == MessageType::Confirmable
}

/// Whether this packet has the empty (0.00) code.
pub fn is_empty_code(packet: &Packet) -> bool {
    packet.header.code == MessageClass::Empty
}

/// The request method, if this packet is a request.
pub fn method(packet: &Packet) -> Option<Method> {
    match packet.header.code {
        MessageClass::Request(m) => Some(m),
        _ => None,
    }
}

/// The packet token as an owned vector.
pub fn token(packet: &Packet) -> Vec<u8> {
    packet.get_token().to_vec()
}

/// Interpret payload bytes as a big-endian unsigned integer.
pub fn be_uint(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
}
