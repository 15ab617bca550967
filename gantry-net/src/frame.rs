use bytes::{Buf, BufMut, Bytes, BytesMut};
use gantry_core::{GantryError, Result};

use crate::protocol::{
    FrameKind, HallStatus, StreamKind, GANTRY_MAGIC, HEADER_SIZE, MAX_FRAME_LEN, PROTOCOL_VERSION,
};

#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: FrameKind,
    pub session_id: u64,
    pub req_id: u64,
    pub payload: Bytes,
}

impl Frame {
    #[must_use]
    pub fn new(kind: FrameKind, session_id: u64, req_id: u64, payload: Bytes) -> Self {
        Self {
            kind,
            session_id,
            req_id,
            payload,
        }
    }

    #[must_use]
    pub fn hello(stream: StreamKind, session_id: u64, name: &str) -> Self {
        let mut payload = BytesMut::with_capacity(3 + name.len());
        payload.put_u8(stream as u8);
        put_str(&mut payload, name);
        Self::new(FrameKind::Hello, session_id, 0, payload.freeze())
    }

    #[must_use]
    pub fn info_request() -> Self {
        Self::new(FrameKind::InfoRequest, 0, 0, Bytes::new())
    }

    #[must_use]
    pub fn info_response(info: &Info) -> Self {
        Self::new(FrameKind::InfoResponse, 0, 0, info.encode())
    }

    #[must_use]
    pub fn health_request() -> Self {
        Self::new(FrameKind::HealthRequest, 0, 0, Bytes::new())
    }

    #[must_use]
    pub fn health_response(health: &Health) -> Self {
        Self::new(FrameKind::HealthResponse, 0, 0, health.encode())
    }

    #[must_use]
    pub fn gate_ping() -> Self {
        Self::new(FrameKind::GatePing, 0, 0, Bytes::new())
    }

    /// Gateway to hall: one client-originated message.
    #[must_use]
    pub fn session_data(session_id: u64, req_id: u64, member_id: &str, data: &Bytes) -> Self {
        let mut payload = BytesMut::with_capacity(2 + member_id.len() + data.len());
        put_str(&mut payload, member_id);
        payload.put_slice(data);
        Self::new(FrameKind::SessionData, session_id, req_id, payload.freeze())
    }

    /// Hall to gateway: a data frame, either a response (`req_id != 0`) or a
    /// push (`req_id == 0`).
    #[must_use]
    pub fn hall_data(session_id: u64, req_id: u64, route: &str, data: &Bytes) -> Self {
        let mut payload = BytesMut::with_capacity(2 + route.len() + data.len());
        put_str(&mut payload, route);
        payload.put_slice(data);
        Self::new(FrameKind::HallData, session_id, req_id, payload.freeze())
    }

    #[must_use]
    pub fn hall_user_instead(session_id: u64, reason: &str) -> Self {
        Self::new(
            FrameKind::HallUserInstead,
            session_id,
            0,
            Bytes::copy_from_slice(reason.as_bytes()),
        )
    }

    #[must_use]
    pub fn hall_kick(session_id: u64, reason: &str) -> Self {
        Self::new(
            FrameKind::HallKick,
            session_id,
            0,
            Bytes::copy_from_slice(reason.as_bytes()),
        )
    }

    #[must_use]
    pub fn client_hello(member_id: &str) -> Self {
        let mut payload = BytesMut::with_capacity(2 + member_id.len());
        put_str(&mut payload, member_id);
        Self::new(FrameKind::ClientHello, 0, 0, payload.freeze())
    }

    #[must_use]
    pub fn client_request(req_id: u64, data: &Bytes) -> Self {
        Self::new(FrameKind::ClientRequest, 0, req_id, data.clone())
    }

    #[must_use]
    pub fn client_response(req_id: u64, data: &Bytes) -> Self {
        Self::new(FrameKind::ClientResponse, 0, req_id, data.clone())
    }

    #[must_use]
    pub fn client_push(route: &str, data: &Bytes) -> Self {
        let mut payload = BytesMut::with_capacity(2 + route.len() + data.len());
        put_str(&mut payload, route);
        payload.put_slice(data);
        Self::new(FrameKind::ClientPush, 0, 0, payload.freeze())
    }

    #[must_use]
    pub fn client_error(req_id: u64, code: i32, message: &str) -> Self {
        let mut payload = BytesMut::with_capacity(4 + message.len());
        payload.put_i32_le(code);
        payload.put_slice(message.as_bytes());
        Self::new(FrameKind::ClientError, 0, req_id, payload.freeze())
    }

    #[must_use]
    pub fn reason_frame(kind: FrameKind, reason: &str) -> Self {
        Self::new(kind, 0, 0, Bytes::copy_from_slice(reason.as_bytes()))
    }

    /// Payload interpreted as a UTF-8 reason string.
    #[must_use]
    pub fn reason(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Hello payload: which stream this connection carries and who opened it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub stream: StreamKind,
    pub name: String,
}

impl Hello {
    pub fn parse(frame: &Frame) -> Result<Self> {
        let mut payload = frame.payload.clone();
        if payload.remaining() < 1 {
            return Err(GantryError::Protocol("short hello".to_string()));
        }
        let stream = StreamKind::try_from_u8(payload.get_u8())?;
        let name = get_str(&mut payload)?;
        Ok(Self { stream, name })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Info {
    pub build_time: i64,
    pub app_version: String,
}

impl Info {
    fn encode(&self) -> Bytes {
        let mut payload = BytesMut::with_capacity(10 + self.app_version.len());
        payload.put_i64_le(self.build_time);
        put_str(&mut payload, &self.app_version);
        payload.freeze()
    }

    pub fn parse(frame: &Frame) -> Result<Self> {
        let mut payload = frame.payload.clone();
        if payload.remaining() < 8 {
            return Err(GantryError::Protocol("short info".to_string()));
        }
        let build_time = payload.get_i64_le();
        let app_version = get_str(&mut payload)?;
        Ok(Self {
            build_time,
            app_version,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Health {
    pub status: HallStatus,
    pub player_count: i64,
}

impl Health {
    fn encode(&self) -> Bytes {
        let mut payload = BytesMut::with_capacity(9);
        payload.put_u8(self.status as u8);
        payload.put_i64_le(self.player_count);
        payload.freeze()
    }

    pub fn parse(frame: &Frame) -> Result<Self> {
        let mut payload = frame.payload.clone();
        if payload.remaining() < 9 {
            return Err(GantryError::Protocol("short health".to_string()));
        }
        let status = HallStatus::from_u8(payload.get_u8());
        let player_count = payload.get_i64_le();
        Ok(Self {
            status,
            player_count,
        })
    }
}

/// A hall-originated session frame, decoded for the forwarder.
#[derive(Debug, Clone)]
pub enum HallMessage {
    Data {
        route: String,
        req_id: u64,
        data: Bytes,
    },
    UserInstead(String),
    Kick(String),
}

impl HallMessage {
    pub fn parse(frame: &Frame) -> Result<Self> {
        match frame.kind {
            FrameKind::HallData => {
                let mut payload = frame.payload.clone();
                let route = get_str(&mut payload)?;
                Ok(Self::Data {
                    route,
                    req_id: frame.req_id,
                    data: payload,
                })
            }
            FrameKind::HallUserInstead => Ok(Self::UserInstead(frame.reason())),
            FrameKind::HallKick => Ok(Self::Kick(frame.reason())),
            other => Err(GantryError::Protocol(format!(
                "unexpected session frame {other:?}"
            ))),
        }
    }
}

/// Gateway-to-hall session payload: `member_id` plus the opaque client data.
pub fn parse_session_data(frame: &Frame) -> Result<(String, Bytes)> {
    let mut payload = frame.payload.clone();
    let member_id = get_str(&mut payload)?;
    Ok((member_id, payload))
}

/// Client-hello payload: the member id the client claims.
pub fn parse_client_hello(frame: &Frame) -> Result<String> {
    if frame.kind != FrameKind::ClientHello {
        return Err(GantryError::Protocol(format!(
            "expected client hello, got {:?}",
            frame.kind
        )));
    }
    let mut payload = frame.payload.clone();
    get_str(&mut payload)
}

/// Client-push payload: route plus data.
pub fn parse_client_push(frame: &Frame) -> Result<(String, Bytes)> {
    let mut payload = frame.payload.clone();
    let route = get_str(&mut payload)?;
    Ok((route, payload))
}

pub(crate) fn put_str(buf: &mut BytesMut, value: &str) {
    let len = value.len().min(u16::MAX as usize);
    buf.put_u16_le(len as u16);
    buf.put_slice(&value.as_bytes()[..len]);
}

pub(crate) fn get_str(buf: &mut Bytes) -> Result<String> {
    if buf.remaining() < 2 {
        return Err(GantryError::Protocol("short string".to_string()));
    }
    let len = buf.get_u16_le() as usize;
    if buf.remaining() < len {
        return Err(GantryError::Protocol("truncated string".to_string()));
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|_| GantryError::Protocol("invalid utf-8 string".to_string()))
}

pub fn encode_frame(frame: &Frame) -> BytesMut {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + frame.payload.len());
    buf.put_slice(&GANTRY_MAGIC);
    buf.put_u8(PROTOCOL_VERSION);
    buf.put_u8(frame.kind as u8);
    buf.put_u16_le(0);
    buf.put_u64_le(frame.session_id);
    buf.put_u64_le(frame.req_id);
    buf.put_u32_le(frame.payload.len() as u32);
    buf.put_slice(&frame.payload);
    buf
}

/// Parse one frame off the front of `buf`. `Ok(None)` means more bytes are
/// needed; `(frame, consumed)` otherwise.
pub fn parse_frame(buf: &[u8]) -> Result<Option<(Frame, usize)>> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }
    if buf[0..4] != GANTRY_MAGIC {
        return Err(GantryError::Protocol("bad magic".to_string()));
    }
    if buf[4] != PROTOCOL_VERSION {
        return Err(GantryError::Protocol(format!(
            "unsupported protocol version {}",
            buf[4]
        )));
    }
    let kind = FrameKind::try_from_u8(buf[5])?;
    let mut header = &buf[8..HEADER_SIZE];
    let session_id = header.get_u64_le();
    let req_id = header.get_u64_le();
    let payload_len = header.get_u32_le() as usize;
    if payload_len > MAX_FRAME_LEN {
        return Err(GantryError::Protocol(format!(
            "frame payload {payload_len} exceeds limit"
        )));
    }
    let total = HEADER_SIZE + payload_len;
    if buf.len() < total {
        return Ok(None);
    }
    let payload = Bytes::copy_from_slice(&buf[HEADER_SIZE..total]);
    Ok(Some((
        Frame {
            kind,
            session_id,
            req_id,
            payload,
        },
        total,
    )))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn session_data_roundtrip() {
        let data = Bytes::from_static(b"login payload");
        let frame = Frame::session_data(9, 7, "member-1", &data);

        let encoded = encode_frame(&frame);
        let (parsed, consumed) = parse_frame(&encoded).unwrap().unwrap();

        assert_eq!(consumed, encoded.len());
        assert_eq!(parsed.kind, FrameKind::SessionData);
        assert_eq!(parsed.session_id, 9);
        assert_eq!(parsed.req_id, 7);
        let (member_id, payload) = parse_session_data(&parsed).unwrap();
        assert_eq!(member_id, "member-1");
        assert_eq!(payload, data);
    }

    #[test]
    fn hall_message_decodes_by_kind() {
        let frame = Frame::hall_data(1, 7, "battle", &Bytes::from_static(b"ok"));
        let encoded = encode_frame(&frame);
        let (parsed, _) = parse_frame(&encoded).unwrap().unwrap();
        match HallMessage::parse(&parsed).unwrap() {
            HallMessage::Data { route, req_id, data } => {
                assert_eq!(route, "battle");
                assert_eq!(req_id, 7);
                assert_eq!(data, Bytes::from_static(b"ok"));
            }
            other => panic!("unexpected {other:?}"),
        }

        let kick = Frame::hall_kick(1, "logged in elsewhere");
        match HallMessage::parse(&kick).unwrap() {
            HallMessage::Kick(reason) => assert_eq!(reason, "logged in elsewhere"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn hello_carries_stream_kind_and_name() {
        let frame = Frame::hello(StreamKind::Session, 42, "member-9");
        let encoded = encode_frame(&frame);
        let (parsed, _) = parse_frame(&encoded).unwrap().unwrap();
        assert_eq!(parsed.session_id, 42);
        let hello = Hello::parse(&parsed).unwrap();
        assert_eq!(hello.stream, StreamKind::Session);
        assert_eq!(hello.name, "member-9");
    }

    #[test]
    fn partial_input_asks_for_more() {
        let frame = Frame::info_response(&Info {
            build_time: 100,
            app_version: "1.2.3".into(),
        });
        let encoded = encode_frame(&frame);
        assert!(parse_frame(&encoded[..HEADER_SIZE - 1]).unwrap().is_none());
        assert!(parse_frame(&encoded[..HEADER_SIZE + 2]).unwrap().is_none());
        let (parsed, _) = parse_frame(&encoded).unwrap().unwrap();
        let info = Info::parse(&parsed).unwrap();
        assert_eq!(info.build_time, 100);
        assert_eq!(info.app_version, "1.2.3");
    }

    #[test]
    fn bad_magic_is_rejected() {
        let frame = Frame::health_request();
        let mut encoded = encode_frame(&frame);
        encoded[0] = b'X';
        assert!(parse_frame(&encoded).is_err());
    }
}
