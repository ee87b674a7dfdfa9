use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::engine::hex;
use crate::models::rule::Content;

/// Transport/application protocol as reported by the capture collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Http,
    Https,
    Tcp,
    Udp,
    Other,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "HTTP",
            Protocol::Https => "HTTPS",
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
            Protocol::Other => "OTHER",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Packet direction relative to the hooked process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Send,
    Receive,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Send => "send",
            Direction::Receive => "receive",
        }
    }
}

/// The socket API call that produced a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketFunction {
    Send,
    Recv,
    SendTo,
    RecvFrom,
    #[serde(rename = "WSASend")]
    WsaSend,
    #[serde(rename = "WSARecv")]
    WsaRecv,
    #[serde(rename = "WSASendTo")]
    WsaSendTo,
    #[serde(rename = "WSARecvFrom")]
    WsaRecvFrom,
}

impl PacketFunction {
    pub const ALL: [PacketFunction; 8] = [
        PacketFunction::Send,
        PacketFunction::Recv,
        PacketFunction::SendTo,
        PacketFunction::RecvFrom,
        PacketFunction::WsaSend,
        PacketFunction::WsaRecv,
        PacketFunction::WsaSendTo,
        PacketFunction::WsaRecvFrom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PacketFunction::Send => "Send",
            PacketFunction::Recv => "Recv",
            PacketFunction::SendTo => "SendTo",
            PacketFunction::RecvFrom => "RecvFrom",
            PacketFunction::WsaSend => "WSASend",
            PacketFunction::WsaRecv => "WSARecv",
            PacketFunction::WsaSendTo => "WSASendTo",
            PacketFunction::WsaRecvFrom => "WSARecvFrom",
        }
    }

    /// Direction implied by the call
    pub fn direction(&self) -> Direction {
        match self {
            PacketFunction::Send
            | PacketFunction::SendTo
            | PacketFunction::WsaSend
            | PacketFunction::WsaSendTo => Direction::Send,
            _ => Direction::Receive,
        }
    }
}

/// Owned payload bytes with lazily cached hex and text projections
#[derive(Clone)]
pub struct Payload {
    bytes: Arc<[u8]>,
    hex: OnceLock<String>,
    text: OnceLock<String>,
}

impl Payload {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::from(bytes),
            hex: OnceLock::new(),
            text: OnceLock::new(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// `aa bb cc` rendering, computed once
    pub fn hex(&self) -> &str {
        self.hex.get_or_init(|| hex::encode(&self.bytes))
    }

    /// Lossy UTF-8 rendering, computed once
    pub fn text(&self) -> &str {
        self.text
            .get_or_init(|| String::from_utf8_lossy(&self.bytes).into_owned())
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.to_vec()
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::new(bytes)
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Payload::new(bytes.to_vec())
    }
}

impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for Payload {}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Payload({})", self.hex())
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.hex())
    }
}

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Hex(String),
            Bytes(Vec<u8>),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Hex(s) => hex::decode(&s)
                .map(Payload::new)
                .map_err(serde::de::Error::custom),
            Repr::Bytes(bytes) => Ok(Payload::new(bytes)),
        }
    }
}

/// A single HTTP header, order preserved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpHeader {
    pub name: String,
    pub value: String,
}

/// Where an HTTP view came from; derived views are re-rendered into the payload on rewrite
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HttpOrigin {
    #[default]
    Supplied,
    Request,
    Response,
}

/// Structured HTTP exchange fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpInfo {
    #[serde(default = "default_http_version")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub headers: Vec<HttpHeader>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    #[serde(skip)]
    pub origin: HttpOrigin,
    /// Body bytes as parsed from the payload; the text bodies above are lossy
    #[serde(skip)]
    pub raw_body: Option<Payload>,
}

fn default_http_version() -> String {
    "HTTP/1.1".to_string()
}

impl Default for HttpInfo {
    fn default() -> Self {
        Self {
            version: default_http_version(),
            method: None,
            url: None,
            status_code: None,
            reason: None,
            headers: Vec::new(),
            request_body: None,
            response_body: None,
            origin: HttpOrigin::Supplied,
            raw_body: None,
        }
    }
}

impl HttpInfo {
    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// Overwrite an existing header (case-insensitive) or append it
    pub fn set_header(&mut self, name: &str, value: &str) {
        match self
            .headers
            .iter_mut()
            .find(|h| h.name.eq_ignore_ascii_case(name))
        {
            Some(header) => header.value = value.to_string(),
            None => self.headers.push(HttpHeader {
                name: name.to_string(),
                value: value.to_string(),
            }),
        }
    }

    /// Host from the `Host` header, falling back to an absolute URL
    pub fn host(&self) -> Option<String> {
        if let Some(host) = self.header("host") {
            return Some(strip_port(host).to_string());
        }
        let url = self.url.as_deref()?;
        let rest = url.split_once("://").map(|(_, rest)| rest)?;
        let authority = rest.split(['/', '?', '#']).next()?;
        if authority.is_empty() {
            None
        } else {
            Some(strip_port(authority).to_string())
        }
    }

    pub fn is_request(&self) -> bool {
        self.method.is_some()
    }

    /// Parsed from the payload rather than supplied by the source
    pub fn is_derived(&self) -> bool {
        matches!(self.origin, HttpOrigin::Request | HttpOrigin::Response)
    }

    pub fn set_request_body(&mut self, body: &str) {
        self.request_body = Some(body.to_string());
        self.raw_body = None;
    }

    pub fn set_response_body(&mut self, body: &str) {
        self.response_body = Some(body.to_string());
        self.raw_body = None;
    }
}

fn strip_port(authority: &str) -> &str {
    match authority.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => authority,
    }
}

/// TCP header fields reported by the collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpFields {
    pub seq: u32,
    pub ack: u32,
    pub flags: u16,
}

/// UDP header fields reported by the collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UdpFields {
    pub length: u16,
    pub checksum: u16,
}

/// Transport metadata; one variant per transport so fields cannot be mixed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportMeta {
    Tcp(TcpFields),
    Udp(UdpFields),
}

/// A packet as delivered by a capture source, before the engine assigns an id
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedPacket {
    pub timestamp: i64,
    #[serde(default)]
    pub process_id: u32,
    #[serde(default)]
    pub process_name: String,
    pub protocol: Protocol,
    pub direction: Direction,
    #[serde(default)]
    pub src_addr: String,
    #[serde(default)]
    pub dst_addr: String,
    #[serde(default)]
    pub size: usize,
    #[serde(default)]
    pub socket: Option<u64>,
    #[serde(default)]
    pub packet_function: Option<PacketFunction>,
    #[serde(default)]
    pub packet_data: Option<String>,
    #[serde(default)]
    pub raw_data: Option<Payload>,
    #[serde(default)]
    pub duration: Option<u64>,
    #[serde(default)]
    pub http: Option<HttpInfo>,
    #[serde(default)]
    pub transport: Option<TransportMeta>,
}

impl CapturedPacket {
    /// Stamp an id onto the captured record
    pub fn into_packet(self, id: u64) -> Packet {
        let size = match (&self.raw_data, self.size) {
            (Some(raw), 0) => raw.len(),
            (_, size) => size,
        };
        Packet {
            id,
            timestamp: self.timestamp,
            process_id: self.process_id,
            process_name: self.process_name,
            protocol: self.protocol,
            direction: self.direction,
            src_addr: self.src_addr,
            dst_addr: self.dst_addr,
            size,
            socket: self.socket,
            packet_function: self.packet_function,
            packet_data: self.packet_data,
            raw_data: self.raw_data,
            duration: self.duration,
            http: self.http,
            transport: self.transport,
            original_data: None,
            fired_rules: Vec::new(),
        }
    }
}

/// Represents a captured packet held by the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Packet {
    /// Unique identifier, monotonic within a session
    pub id: u64,

    /// Milliseconds since the epoch
    pub timestamp: i64,

    pub process_id: u32,
    pub process_name: String,
    pub protocol: Protocol,
    pub direction: Direction,
    pub src_addr: String,
    pub dst_addr: String,

    /// Length of the packet in bytes
    pub size: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packet_function: Option<PacketFunction>,

    /// Pre-rendered payload (hex or text)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packet_data: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_data: Option<Payload>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpInfo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportMeta>,

    /// Payload as captured, kept once a rule or edit rewrites the bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_data: Option<Payload>,

    /// Rules that recorded or rewrote this packet
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fired_rules: Vec<String>,
}

impl Packet {
    /// Swap in new payload bytes, preserving the captured original
    pub fn set_payload(&mut self, payload: Payload) {
        if self.original_data.is_none() {
            self.original_data = self.raw_data.clone();
        }
        self.size = payload.len();
        self.packet_data = Some(payload.hex().to_string());
        self.raw_data = Some(payload);
    }

    pub fn was_modified(&self) -> bool {
        self.original_data.is_some()
    }

    pub fn summary(&self) -> PacketSummary {
        PacketSummary {
            id: self.id,
            timestamp: self.timestamp,
            protocol: self.protocol,
            direction: self.direction,
            process_name: self.process_name.clone(),
            source: self.src_addr.clone(),
            destination: self.dst_addr.clone(),
            size: self.size,
            info: self.info(),
        }
    }

    /// Brief description for list views
    fn info(&self) -> String {
        if let Some(http) = &self.http {
            if let (Some(method), Some(url)) = (&http.method, &http.url) {
                return format!("{} {}", method, url);
            }
            if let Some(code) = http.status_code {
                return format!("{} {}", code, http.reason.as_deref().unwrap_or(""))
                    .trim_end()
                    .to_string();
            }
        }
        match self.packet_function {
            Some(function) => format!("{} {} bytes", function.as_str(), self.size),
            None => format!("{} {} bytes", self.protocol, self.size),
        }
    }
}

/// A more concise representation of a packet for list views
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PacketSummary {
    pub id: u64,
    pub timestamp: i64,
    pub protocol: Protocol,
    pub direction: Direction,
    pub process_name: String,
    pub source: String,
    pub destination: String,
    pub size: usize,
    pub info: String,
}

/// One user edit to a retained packet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "camelCase")]
pub enum PacketEdit {
    ProcessName(String),
    Protocol(Protocol),
    Direction(Direction),
    SrcAddr(String),
    DstAddr(String),
    Data(Content),
}

/// Parsed protocol fields of a packet
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp: Option<TcpFields>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub udp: Option<UdpFields>,
}

/// Packet plus its parsed protocol fields
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PacketDetail {
    #[serde(flatten)]
    pub packet: Packet,
    pub parsed_data: ParsedData,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_serializes_as_hex() {
        let payload = Payload::from(vec![0xde, 0xad]);
        assert_eq!(serde_json::to_string(&payload).unwrap(), "\"de ad\"");
    }

    #[test]
    fn test_payload_deserializes_from_hex_or_array() {
        let from_hex: Payload = serde_json::from_str("\"AA BB\"").unwrap();
        let from_array: Payload = serde_json::from_str("[170, 187]").unwrap();
        assert_eq!(from_hex, from_array);
        assert_eq!(from_hex.as_bytes(), &[0xaa, 0xbb]);
    }

    #[test]
    fn test_payload_text_projection() {
        let payload = Payload::from(b"GET /".as_slice());
        assert_eq!(payload.text(), "GET /");
        assert_eq!(payload.hex(), "47 45 54 20 2f");
    }

    #[test]
    fn test_packet_function_wire_names() {
        let json = serde_json::to_string(&PacketFunction::WsaRecvFrom).unwrap();
        assert_eq!(json, "\"WSARecvFrom\"");
        let parsed: PacketFunction = serde_json::from_str("\"SendTo\"").unwrap();
        assert_eq!(parsed, PacketFunction::SendTo);
        assert_eq!(PacketFunction::WsaSend.direction(), Direction::Send);
        assert_eq!(PacketFunction::RecvFrom.direction(), Direction::Receive);
    }

    #[test]
    fn test_captured_packet_size_falls_back_to_payload() {
        let captured: CapturedPacket = serde_json::from_value(serde_json::json!({
            "timestamp": 1,
            "protocol": "TCP",
            "direction": "send",
            "rawData": "01 02 03"
        }))
        .unwrap();
        let packet = captured.into_packet(7);
        assert_eq!(packet.id, 7);
        assert_eq!(packet.size, 3);
    }

    #[test]
    fn test_set_payload_keeps_original() {
        let captured: CapturedPacket = serde_json::from_value(serde_json::json!({
            "timestamp": 1,
            "protocol": "TCP",
            "direction": "send",
            "rawData": "01 02"
        }))
        .unwrap();
        let mut packet = captured.into_packet(1);
        packet.set_payload(Payload::from(vec![9, 9, 9]));
        packet.set_payload(Payload::from(vec![8]));
        assert_eq!(packet.original_data.as_ref().unwrap().as_bytes(), &[1, 2]);
        assert_eq!(packet.size, 1);
        assert_eq!(packet.packet_data.as_deref(), Some("08"));
    }

    #[test]
    fn test_http_host_sources() {
        let mut http = HttpInfo {
            url: Some("http://api.example.com:8080/v1?q=1".into()),
            ..HttpInfo::default()
        };
        assert_eq!(http.host().as_deref(), Some("api.example.com"));
        http.set_header("HOST", "cdn.example.org");
        assert_eq!(http.host().as_deref(), Some("cdn.example.org"));
        http.set_header("host", "other.example.org:443");
        assert_eq!(http.headers.len(), 1);
        assert_eq!(http.host().as_deref(), Some("other.example.org"));
    }
}
