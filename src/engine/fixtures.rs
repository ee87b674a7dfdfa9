use crate::models::packet::{
    CapturedPacket, Direction, HttpHeader, HttpInfo, Packet, PacketFunction, Payload, Protocol,
};

pub fn captured(protocol: Protocol, function: PacketFunction, data: &[u8]) -> CapturedPacket {
    CapturedPacket {
        timestamp: 1_000,
        process_id: 4242,
        process_name: "game.exe".to_string(),
        protocol,
        direction: function.direction(),
        src_addr: "10.0.0.2:50000".to_string(),
        dst_addr: "93.184.216.34:80".to_string(),
        size: data.len(),
        socket: Some(812),
        packet_function: Some(function),
        packet_data: None,
        raw_data: Some(Payload::from(data)),
        duration: None,
        http: None,
        transport: None,
    }
}

pub fn packet(id: u64, protocol: Protocol, function: PacketFunction, data: &[u8]) -> Packet {
    captured(protocol, function, data).into_packet(id)
}

pub fn http_request(id: u64, method: &str, url: &str, host: &str) -> Packet {
    let mut packet = packet(id, Protocol::Http, PacketFunction::Send, b"");
    packet.http = Some(HttpInfo {
        method: Some(method.to_string()),
        url: Some(url.to_string()),
        headers: vec![HttpHeader {
            name: "Host".to_string(),
            value: host.to_string(),
        }],
        ..HttpInfo::default()
    });
    packet
}

pub fn http_exchange(id: u64, method: &str, status: u16) -> Packet {
    let mut packet = http_request(id, method, "/index.html", "example.com");
    packet.direction = Direction::Receive;
    packet.packet_function = Some(PacketFunction::Recv);
    if let Some(http) = packet.http.as_mut() {
        http.status_code = Some(status);
        http.reason = Some("OK".to_string());
        http.response_body = Some("hello".to_string());
    }
    packet
}
