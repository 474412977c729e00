use bytes::{BufMut, Bytes, BytesMut};

/// Fixed header length of every tunnel frame.
pub const HEADER_LEN: usize = 8;

/// Client id 0 is reserved for keepalive (PING/PONG) frames.
pub const KEEPALIVE_CLIENT_ID: u32 = 0;

/// Frame types carried in byte 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Connect = 0x01,
    Connected = 0x02,
    Data = 0x03,
    Close = 0x04,
    Error = 0x05,
    Ping = 0x06,
    Pong = 0x07,
}

/// Transport protocol carried in byte 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TunnelProto {
    Tcp = 0x00,
    Udp = 0x01,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too short: {0} bytes, need at least {HEADER_LEN}")]
    TooShort(usize),
    #[error("unknown frame type 0x{0:02x}")]
    UnknownType(u8),
    #[error("unknown protocol 0x{0:02x}")]
    UnknownProto(u8),
}

impl FrameType {
    pub fn from_byte(b: u8) -> Result<Self, FrameError> {
        Ok(match b {
            0x01 => FrameType::Connect,
            0x02 => FrameType::Connected,
            0x03 => FrameType::Data,
            0x04 => FrameType::Close,
            0x05 => FrameType::Error,
            0x06 => FrameType::Ping,
            0x07 => FrameType::Pong,
            other => return Err(FrameError::UnknownType(other)),
        })
    }
}

impl TunnelProto {
    pub fn from_byte(b: u8) -> Result<Self, FrameError> {
        Ok(match b {
            0x00 => TunnelProto::Tcp,
            0x01 => TunnelProto::Udp,
            other => return Err(FrameError::UnknownProto(other)),
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelProto::Tcp => "tcp",
            TunnelProto::Udp => "udp",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tcp" => Some(TunnelProto::Tcp),
            "udp" => Some(TunnelProto::Udp),
            _ => None,
        }
    }
}

impl std::fmt::Display for TunnelProto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed 8-byte frame header.
///
/// Layout: type(1) proto(1) client_id(4, BE) port(2, BE).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub frame_type: FrameType,
    pub proto: TunnelProto,
    pub client_id: u32,
    pub port: u16,
}

/// Build a complete frame: header followed by the payload.
pub fn build_message(
    frame_type: FrameType,
    proto: TunnelProto,
    client_id: u32,
    port: u16,
    payload: &[u8],
) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u8(frame_type as u8);
    buf.put_u8(proto as u8);
    buf.put_u32(client_id);
    buf.put_u16(port);
    buf.put_slice(payload);
    buf.freeze()
}

/// Parse the fixed header. Rejects buffers shorter than [`HEADER_LEN`].
pub fn parse_header(data: &[u8]) -> Result<FrameHeader, FrameError> {
    if data.len() < HEADER_LEN {
        return Err(FrameError::TooShort(data.len()));
    }
    Ok(FrameHeader {
        frame_type: FrameType::from_byte(data[0])?,
        proto: TunnelProto::from_byte(data[1])?,
        client_id: u32::from_be_bytes([data[2], data[3], data[4], data[5]]),
        port: u16::from_be_bytes([data[6], data[7]]),
    })
}

/// Parse a full frame into header + payload slice.
pub fn parse_message(data: &[u8]) -> Result<(FrameHeader, &[u8]), FrameError> {
    let header = parse_header(data)?;
    Ok((header, &data[HEADER_LEN..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Reference vector: CONNECT tcp client_id=0x12345678 port=8888.
    #[test]
    fn connect_frame_bytes() {
        let msg = build_message(FrameType::Connect, TunnelProto::Tcp, 0x1234_5678, 8888, &[]);
        assert_eq!(&msg[..], &[0x01, 0x00, 0x12, 0x34, 0x56, 0x78, 0x22, 0xB8]);
    }

    #[test]
    fn header_round_trip() {
        let msg = build_message(
            FrameType::Data,
            TunnelProto::Udp,
            0xDEAD_BEEF,
            53,
            b"query",
        );
        let (header, payload) = parse_message(&msg).unwrap();
        assert_eq!(header.frame_type, FrameType::Data);
        assert_eq!(header.proto, TunnelProto::Udp);
        assert_eq!(header.client_id, 0xDEAD_BEEF);
        assert_eq!(header.port, 53);
        assert_eq!(payload, b"query");
    }

    #[test]
    fn round_trip_all_types_and_protos() {
        let types = [
            FrameType::Connect,
            FrameType::Connected,
            FrameType::Data,
            FrameType::Close,
            FrameType::Error,
            FrameType::Ping,
            FrameType::Pong,
        ];
        for t in types {
            for p in [TunnelProto::Tcp, TunnelProto::Udp] {
                let msg = build_message(t, p, 7, 9000, b"x");
                let (h, payload) = parse_message(&msg).unwrap();
                assert_eq!(h.frame_type, t);
                assert_eq!(h.proto, p);
                assert_eq!(h.client_id, 7);
                assert_eq!(h.port, 9000);
                assert_eq!(payload, b"x");
            }
        }
    }

    #[test]
    fn short_buffers_rejected() {
        for len in 0..HEADER_LEN {
            let buf = vec![0u8; len];
            assert_eq!(parse_header(&buf), Err(FrameError::TooShort(len)));
        }
    }

    #[test]
    fn unknown_type_rejected() {
        let mut msg = build_message(FrameType::Ping, TunnelProto::Tcp, 0, 0, &[]).to_vec();
        msg[0] = 0x7F;
        assert_eq!(parse_header(&msg), Err(FrameError::UnknownType(0x7F)));
    }

    #[test]
    fn unknown_proto_rejected() {
        let mut msg = build_message(FrameType::Ping, TunnelProto::Tcp, 0, 0, &[]).to_vec();
        msg[1] = 0x02;
        assert_eq!(parse_header(&msg), Err(FrameError::UnknownProto(0x02)));
    }

    #[test]
    fn error_payload_is_message_text() {
        let msg = build_message(
            FrameType::Error,
            TunnelProto::Tcp,
            42,
            8080,
            b"connection refused",
        );
        let (h, payload) = parse_message(&msg).unwrap();
        assert_eq!(h.frame_type, FrameType::Error);
        assert_eq!(std::str::from_utf8(payload).unwrap(), "connection refused");
    }

    #[test]
    fn proto_string_round_trip() {
        assert_eq!(TunnelProto::parse("tcp"), Some(TunnelProto::Tcp));
        assert_eq!(TunnelProto::parse("udp"), Some(TunnelProto::Udp));
        assert_eq!(TunnelProto::parse("sctp"), None);
    }
}
