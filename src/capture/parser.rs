use lazy_static::lazy_static;
use log::{log_enabled, trace, Level};
use std::collections::HashMap;

use crate::models::packet::{
    HttpHeader, HttpInfo, HttpOrigin, Packet, PacketDetail, ParsedData, Payload, Protocol,
    TransportMeta,
};

const MAX_HEADERS: usize = 64;

lazy_static! {
    static ref REASON_PHRASES: HashMap<u16, &'static str> = {
        let mut m = HashMap::new();
        m.insert(100, "Continue");
        m.insert(101, "Switching Protocols");
        m.insert(200, "OK");
        m.insert(201, "Created");
        m.insert(202, "Accepted");
        m.insert(204, "No Content");
        m.insert(206, "Partial Content");
        m.insert(301, "Moved Permanently");
        m.insert(302, "Found");
        m.insert(303, "See Other");
        m.insert(304, "Not Modified");
        m.insert(307, "Temporary Redirect");
        m.insert(308, "Permanent Redirect");
        m.insert(400, "Bad Request");
        m.insert(401, "Unauthorized");
        m.insert(403, "Forbidden");
        m.insert(404, "Not Found");
        m.insert(405, "Method Not Allowed");
        m.insert(408, "Request Timeout");
        m.insert(409, "Conflict");
        m.insert(410, "Gone");
        m.insert(413, "Payload Too Large");
        m.insert(415, "Unsupported Media Type");
        m.insert(429, "Too Many Requests");
        m.insert(500, "Internal Server Error");
        m.insert(501, "Not Implemented");
        m.insert(502, "Bad Gateway");
        m.insert(503, "Service Unavailable");
        m.insert(504, "Gateway Timeout");
        m
    };
}

/// Standard reason phrase for a status code, empty when unknown
pub fn reason_phrase(code: u16) -> &'static str {
    REASON_PHRASES.get(&code).copied().unwrap_or("")
}

/// Derives and re-renders the HTTP view of packet payloads
#[derive(Debug, Default, Clone, Copy)]
pub struct PacketParser {}

impl PacketParser {
    /// Create a new packet parser
    pub fn new() -> Self {
        Self {}
    }

    /// Attach an HTTP view derived from the payload when the collaborator did not supply one
    pub fn annotate(&self, packet: &mut Packet) {
        if packet.http.is_some() || packet.protocol == Protocol::Udp {
            return;
        }
        let Some(raw) = &packet.raw_data else {
            return;
        };
        if let Some(http) = self.parse_http(raw.as_bytes()) {
            if log_enabled!(Level::Trace) {
                trace!(
                    "Packet {} carries HTTP {:?} {:?} {:?}",
                    packet.id,
                    http.method,
                    http.url,
                    http.status_code
                );
            }
            packet.http = Some(http);
        }
    }

    /// Re-derive a parsed HTTP view after the payload bytes changed.
    /// Views supplied by the source are left as they are.
    pub fn refresh_http(&self, packet: &mut Packet) {
        if !packet.http.as_ref().is_some_and(HttpInfo::is_derived) {
            return;
        }
        packet.http = packet
            .raw_data
            .as_ref()
            .and_then(|raw| self.parse_http(raw.as_bytes()));
    }

    /// Parse a complete HTTP/1.x request or response head plus body
    pub fn parse_http(&self, data: &[u8]) -> Option<HttpInfo> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        if let Ok(httparse::Status::Complete(head_len)) = req.parse(data) {
            return Some(HttpInfo {
                version: version_string(req.version),
                method: req.method.map(str::to_string),
                url: req.path.map(str::to_string),
                headers: collect_headers(req.headers),
                request_body: body_text(&data[head_len..]),
                origin: HttpOrigin::Request,
                raw_body: raw_body(&data[head_len..]),
                ..HttpInfo::default()
            });
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut resp = httparse::Response::new(&mut headers);
        if let Ok(httparse::Status::Complete(head_len)) = resp.parse(data) {
            return Some(HttpInfo {
                version: version_string(resp.version),
                status_code: resp.code,
                reason: resp.reason.map(str::to_string),
                headers: collect_headers(resp.headers),
                response_body: body_text(&data[head_len..]),
                origin: HttpOrigin::Response,
                raw_body: raw_body(&data[head_len..]),
                ..HttpInfo::default()
            });
        }

        None
    }

    /// Render an HTTP view back to wire bytes. The parsed body bytes are
    /// written unchanged unless a body was set since; `Content-Length`, when
    /// present, is updated to the new body length.
    pub fn render_http(&self, http: &HttpInfo) -> Option<Vec<u8>> {
        let (start_line, text) = match http.origin {
            HttpOrigin::Request => (
                format!(
                    "{} {} {}",
                    http.method.as_deref().unwrap_or("GET"),
                    http.url.as_deref().unwrap_or("/"),
                    http.version
                ),
                http.request_body.as_deref(),
            ),
            HttpOrigin::Response => {
                let code = http.status_code.unwrap_or(200);
                let reason = http.reason.as_deref().unwrap_or_else(|| reason_phrase(code));
                (
                    format!("{} {} {}", http.version, code, reason).trim_end().to_string(),
                    http.response_body.as_deref(),
                )
            }
            HttpOrigin::Supplied => return None,
        };
        let body = match &http.raw_body {
            Some(raw) => raw.as_bytes(),
            None => text.unwrap_or("").as_bytes(),
        };

        let mut head = String::with_capacity(start_line.len() + 64);
        head.push_str(&start_line);
        head.push_str("\r\n");
        for header in &http.headers {
            head.push_str(&header.name);
            head.push_str(": ");
            if header.name.eq_ignore_ascii_case("content-length") {
                head.push_str(&body.len().to_string());
            } else {
                head.push_str(&header.value);
            }
            head.push_str("\r\n");
        }
        head.push_str("\r\n");

        let mut out = head.into_bytes();
        out.extend_from_slice(body);
        Some(out)
    }

    /// Packet plus its parsed protocol fields
    pub fn detail(&self, packet: &Packet) -> PacketDetail {
        let http = packet.http.clone().or_else(|| {
            packet
                .raw_data
                .as_ref()
                .and_then(|raw| self.parse_http(raw.as_bytes()))
        });
        let (tcp, udp) = match packet.transport {
            Some(TransportMeta::Tcp(fields)) => (Some(fields), None),
            Some(TransportMeta::Udp(fields)) => (None, Some(fields)),
            None => (None, None),
        };
        PacketDetail {
            packet: packet.clone(),
            parsed_data: ParsedData { http, tcp, udp },
        }
    }
}

fn version_string(minor: Option<u8>) -> String {
    format!("HTTP/1.{}", minor.unwrap_or(1))
}

fn collect_headers(headers: &[httparse::Header<'_>]) -> Vec<HttpHeader> {
    headers
        .iter()
        .map(|h| HttpHeader {
            name: h.name.to_string(),
            value: String::from_utf8_lossy(h.value).into_owned(),
        })
        .collect()
}

fn raw_body(body: &[u8]) -> Option<Payload> {
    (!body.is_empty()).then(|| Payload::from(body))
}

fn body_text(body: &[u8]) -> Option<String> {
    if body.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(body).into_owned())
    }
}
