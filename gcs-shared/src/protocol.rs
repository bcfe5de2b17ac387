//! Wire framing for the host↔guest bridge.
//!
//! Every message is a fixed 12-byte little-endian header followed by a UTF-8
//! JSON body:
//!
//! | field | bytes | meaning |
//! |-------|-------|---------|
//! | type  | 4     | message identifier |
//! | id    | 4     | per-connection sequence number pairing requests to responses |
//! | size  | 4     | total frame size including the header |
//!
//! Response type codes are the request code with [`RESPONSE_FLAG`] OR'd in;
//! notifications use a dedicated type partition.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::{GcsError, GcsResult};

/// Size of the framing header in bytes.
pub const HEADER_SIZE: usize = 12;

/// Upper bound on a single frame; anything larger is a corrupt stream.
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Oldest protocol revision the agent speaks.
pub const PROTOCOL_VERSION_MIN: u32 = 3;
/// Newest protocol revision the agent speaks.
pub const PROTOCOL_VERSION_MAX: u32 = 4;
/// Sentinel for "no version negotiated yet"; the negotiation handler itself
/// is registered under this value.
pub const PROTOCOL_VERSION_INVALID: u32 = 0;

/// Bridge vsock port unless the agent was started with `--use-inouterr`.
pub const COMMAND_PORT: u32 = 0x4000_0000;

/// Wait-timeout sentinel disabling the timeout entirely.
pub const INFINITE_WAIT_TIMEOUT: u32 = 0xFFFF_FFFF;

const MSG_TYPE_REQUEST: u32 = 0x1010_0000;
const MSG_TYPE_NOTIFY: u32 = 0x3010_0000;

/// OR'd into a request code to produce the paired response code.
pub const RESPONSE_FLAG: u32 = 0x0100_0000;

/// Message identifiers carried in the header `type` field.
///
/// Each request variant selects exactly one response body shape; the handler
/// table is keyed by `(MessageType, protocol version)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageType {
    NegotiateProtocol = MSG_TYPE_REQUEST | 0x01,
    Create = MSG_TYPE_REQUEST | 0x02,
    Start = MSG_TYPE_REQUEST | 0x03,
    ShutdownGraceful = MSG_TYPE_REQUEST | 0x04,
    ShutdownForced = MSG_TYPE_REQUEST | 0x05,
    ExecuteProcess = MSG_TYPE_REQUEST | 0x06,
    WaitForProcess = MSG_TYPE_REQUEST | 0x07,
    SignalProcess = MSG_TYPE_REQUEST | 0x08,
    ResizeConsole = MSG_TYPE_REQUEST | 0x09,
    GetProperties = MSG_TYPE_REQUEST | 0x0A,
    ModifySettings = MSG_TYPE_REQUEST | 0x0B,
    DumpStacks = MSG_TYPE_REQUEST | 0x0C,
    DeleteContainerState = MSG_TYPE_REQUEST | 0x0D,
    Notification = MSG_TYPE_NOTIFY | 0x01,
}

impl MessageType {
    /// Decode a raw header `type` field. Unknown codes return `None`; the
    /// bridge answers those with `NotImplemented` rather than dropping the
    /// connection.
    pub fn from_code(code: u32) -> Option<MessageType> {
        use MessageType::*;
        let ty = match code {
            c if c == NegotiateProtocol as u32 => NegotiateProtocol,
            c if c == Create as u32 => Create,
            c if c == Start as u32 => Start,
            c if c == ShutdownGraceful as u32 => ShutdownGraceful,
            c if c == ShutdownForced as u32 => ShutdownForced,
            c if c == ExecuteProcess as u32 => ExecuteProcess,
            c if c == WaitForProcess as u32 => WaitForProcess,
            c if c == SignalProcess as u32 => SignalProcess,
            c if c == ResizeConsole as u32 => ResizeConsole,
            c if c == GetProperties as u32 => GetProperties,
            c if c == ModifySettings as u32 => ModifySettings,
            c if c == DumpStacks as u32 => DumpStacks,
            c if c == DeleteContainerState as u32 => DeleteContainerState,
            c if c == Notification as u32 => Notification,
            _ => return None,
        };
        Some(ty)
    }

    /// The response code paired with this request code.
    pub fn response_code(self) -> u32 {
        self as u32 | RESPONSE_FLAG
    }
}

/// Decoded framing header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Raw message identifier. Kept raw so unknown codes can be echoed back.
    pub message_type: u32,
    /// Sequence number pairing this frame to its response.
    pub id: u32,
    /// Total frame size including the header.
    pub size: u32,
}

impl MessageHeader {
    pub fn new(message_type: u32, id: u32, body_len: usize) -> Self {
        MessageHeader {
            message_type,
            id,
            size: (HEADER_SIZE + body_len) as u32,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.message_type.to_le_bytes());
        buf[4..8].copy_from_slice(&self.id.to_le_bytes());
        buf[8..12].copy_from_slice(&self.size.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Self {
        MessageHeader {
            message_type: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            id: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            size: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
        }
    }
}

/// Read one frame. Returns `Ok(None)` on a clean EOF at a frame boundary,
/// which is the peer's normal way of hanging up.
pub async fn read_frame<R>(reader: &mut R) -> GcsResult<Option<(MessageHeader, Vec<u8>)>>
where
    R: AsyncRead + Unpin,
{
    let mut header_buf = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut header_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(GcsError::io("read message header", e)),
    }
    let header = MessageHeader::decode(&header_buf);

    if header.size < HEADER_SIZE as u32 || header.size > MAX_FRAME_SIZE {
        return Err(GcsError::Unexpected(format!(
            "frame size {} out of range",
            header.size
        )));
    }

    let mut body = vec![0u8; header.size as usize - HEADER_SIZE];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| GcsError::io("read message body", e))?;
    Ok(Some((header, body)))
}

/// Write one frame: header then body, no interleaving. Callers serialize
/// writes through a single task so this never races.
pub async fn write_frame<W>(writer: &mut W, header: &MessageHeader, body: &[u8]) -> GcsResult<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(&header.encode())
        .await
        .map_err(|e| GcsError::io("write message header", e))?;
    writer
        .write_all(body)
        .await
        .map_err(|e| GcsError::io("write message body", e))?;
    writer
        .flush()
        .await
        .map_err(|e| GcsError::io("flush message", e))?;
    Ok(())
}

/// Select the protocol version for a session: `min(host_max, guest_max)`,
/// rejected when the ranges do not overlap.
pub fn negotiate_version(host_version: u32) -> GcsResult<u32> {
    if host_version < PROTOCOL_VERSION_MIN {
        return Err(GcsError::UnsupportedProtocolVersion(host_version));
    }
    Ok(host_version.min(PROTOCOL_VERSION_MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_header_roundtrip() {
        let h = MessageHeader::new(MessageType::Create as u32, 7, 100);
        let decoded = MessageHeader::decode(&h.encode());
        assert_eq!(decoded, h);
        assert_eq!(decoded.size, 112);
    }

    #[test]
    fn test_header_is_little_endian() {
        let h = MessageHeader {
            message_type: 0x0102_0304,
            id: 1,
            size: HEADER_SIZE as u32,
        };
        let bytes = h.encode();
        assert_eq!(&bytes[0..4], &[0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_response_code_sets_flag() {
        let req = MessageType::WaitForProcess;
        assert_eq!(req.response_code(), req as u32 | 0x0100_0000);
        // Response codes are not themselves request codes.
        assert!(MessageType::from_code(req.response_code()).is_none());
    }

    #[test]
    fn test_unknown_code_decodes_to_none() {
        assert!(MessageType::from_code(0xDEAD_BEEF).is_none());
    }

    #[test]
    fn test_negotiate_version_picks_min() {
        assert_eq!(negotiate_version(4).unwrap(), 4);
        assert_eq!(negotiate_version(9).unwrap(), PROTOCOL_VERSION_MAX);
        assert!(matches!(
            negotiate_version(2),
            Err(GcsError::UnsupportedProtocolVersion(2))
        ));
    }

    #[tokio::test]
    async fn test_read_frame_clean_eof_is_none() {
        let mut empty = Cursor::new(Vec::<u8>::new());
        assert!(read_frame(&mut empty).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let body = br#"{"activity_id":"a"}"#.to_vec();
        let header = MessageHeader::new(MessageType::Start as u32, 3, body.len());

        let mut wire = Vec::new();
        write_frame(&mut wire, &header, &body).await.unwrap();

        let mut cursor = Cursor::new(wire);
        let (got_header, got_body) = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(got_header, header);
        assert_eq!(got_body, body);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let header = MessageHeader {
            message_type: MessageType::Start as u32,
            id: 1,
            size: MAX_FRAME_SIZE + 1,
        };
        let mut wire = header.encode().to_vec();
        wire.extend_from_slice(b"junk");
        let mut cursor = Cursor::new(wire);
        assert!(read_frame(&mut cursor).await.is_err());
    }
}
