//! Shared wire constants and framed I/O for the backup transport
//!
//! A frame is an 8-byte little-endian payload length followed by that many
//! payload bytes. The first payload byte is the message type; the rest is a
//! sequence of TLV records (see `message`).

use anyhow::{bail, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frame budget for client->server traffic; file chunks are sized so a whole
/// CREATE/UPDATE frame fits in this many bytes.
pub const CLIENT_CHUNK_SIZE: usize = 16 * 1024;

/// Frame budget for server->client traffic (replies and RETRIEVE chunks).
pub const SERVER_CHUNK_SIZE: usize = 4 * 1024;

/// Upper bound accepted from the wire on either endpoint - prevents memory
/// exhaustion from a hostile or corrupted length header.
pub const MAX_FRAME_SIZE: usize = CLIENT_CHUNK_SIZE;

pub const HEADER_SIZE: usize = 8;

/// Size of an encoded TLV header (1-byte type + 4-byte length).
pub const TLV_HEADER_SIZE: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    None = 0,
    Create = 1,
    Update = 2,
    Erase = 3,
    List = 4,
    Auth = 5,
    Retrieve = 6,
    KeepAlive = 7,
}

impl MsgType {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => MsgType::Create,
            2 => MsgType::Update,
            3 => MsgType::Erase,
            4 => MsgType::List,
            5 => MsgType::Auth,
            6 => MsgType::Retrieve,
            7 => MsgType::KeepAlive,
            _ => MsgType::None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MsgType::None => "-",
            MsgType::Create => "CREATE",
            MsgType::Update => "UPDATE",
            MsgType::Erase => "ERASE",
            MsgType::List => "LIST",
            MsgType::Auth => "AUTH",
            MsgType::Retrieve => "RETRIEVE",
            MsgType::KeepAlive => "KEEP_ALIVE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TlvType {
    Usrn = 0,
    Pswd = 1,
    Item = 2,
    End = 3,
    Ok = 4,
    Error = 5,
    Content = 6,
}

impl TlvType {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => TlvType::Usrn,
            1 => TlvType::Pswd,
            2 => TlvType::Item,
            3 => TlvType::End,
            4 => TlvType::Ok,
            5 => TlvType::Error,
            6 => TlvType::Content,
            _ => return None,
        })
    }
}

/// Error codes carried as ASCII decimal inside an ERROR record. Numeric
/// values are part of the wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrType {
    None = 0,
    NoContent = 1,
    MsgTypeRejected = 2,
    CreateNoItem = 101,
    CreateNoContent = 102,
    CreateAlreadyExist = 103,
    CreateFailed = 104,
    CreateNoMatch = 105,
    UpdateNoItem = 201,
    UpdateNoContent = 202,
    UpdateNotExist = 203,
    UpdateAlreadyUpdated = 204,
    UpdateFailed = 205,
    UpdateNoMatch = 206,
    EraseNoItem = 301,
    EraseNoMatch = 302,
    EraseFailed = 303,
    ListFailed = 401,
    AuthNoUsrn = 501,
    AuthNoPswd = 502,
    AuthFailed = 503,
    RetrieveFailed = 601,
}

impl ErrType {
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            0 => ErrType::None,
            1 => ErrType::NoContent,
            2 => ErrType::MsgTypeRejected,
            101 => ErrType::CreateNoItem,
            102 => ErrType::CreateNoContent,
            103 => ErrType::CreateAlreadyExist,
            104 => ErrType::CreateFailed,
            105 => ErrType::CreateNoMatch,
            201 => ErrType::UpdateNoItem,
            202 => ErrType::UpdateNoContent,
            203 => ErrType::UpdateNotExist,
            204 => ErrType::UpdateAlreadyUpdated,
            205 => ErrType::UpdateFailed,
            206 => ErrType::UpdateNoMatch,
            301 => ErrType::EraseNoItem,
            302 => ErrType::EraseNoMatch,
            303 => ErrType::EraseFailed,
            401 => ErrType::ListFailed,
            501 => ErrType::AuthNoUsrn,
            502 => ErrType::AuthNoPswd,
            503 => ErrType::AuthFailed,
            601 => ErrType::RetrieveFailed,
            _ => return None,
        })
    }

    /// Decode the ASCII decimal form used inside ERROR records.
    pub fn parse(value: &[u8]) -> Option<Self> {
        std::str::from_utf8(value)
            .ok()
            .and_then(|s| s.parse::<u16>().ok())
            .and_then(Self::from_code)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrType::None => "OK",
            ErrType::NoContent => "ERR_NO_CONTENT",
            ErrType::MsgTypeRejected => "ERR_MSG_TYPE_REJECTED",
            ErrType::CreateNoItem => "ERR_CREATE_NO_ITEM",
            ErrType::CreateNoContent => "ERR_CREATE_NO_CONTENT",
            ErrType::CreateAlreadyExist => "ERR_CREATE_ALREADY_EXIST",
            ErrType::CreateFailed => "ERR_CREATE_FAILED",
            ErrType::CreateNoMatch => "ERR_CREATE_NO_MATCH",
            ErrType::UpdateNoItem => "ERR_UPDATE_NO_ITEM",
            ErrType::UpdateNoContent => "ERR_UPDATE_NO_CONTENT",
            ErrType::UpdateNotExist => "ERR_UPDATE_NOT_EXIST",
            ErrType::UpdateAlreadyUpdated => "ERR_UPDATE_ALREADY_UPDATED",
            ErrType::UpdateFailed => "ERR_UPDATE_FAILED",
            ErrType::UpdateNoMatch => "ERR_UPDATE_NO_MATCH",
            ErrType::EraseNoItem => "ERR_ERASE_NO_ITEM",
            ErrType::EraseNoMatch => "ERR_ERASE_NO_MATCH",
            ErrType::EraseFailed => "ERR_ERASE_FAILED",
            ErrType::ListFailed => "ERR_LIST_FAILED",
            ErrType::AuthNoUsrn => "ERR_AUTH_NO_USRN",
            ErrType::AuthNoPswd => "ERR_AUTH_NO_PSWD",
            ErrType::AuthFailed => "ERR_AUTH_FAILED",
            ErrType::RetrieveFailed => "ERR_RETRIEVE_FAILED",
        }
    }
}

pub fn validate_frame_size(size: usize) -> Result<()> {
    if size == 0 || size > MAX_FRAME_SIZE {
        bail!("frame payload size out of range: {} bytes (max {})", size, MAX_FRAME_SIZE);
    }
    Ok(())
}

/// Write one frame: 8-byte little-endian length, then the payload.
pub async fn write_frame<S>(stream: &mut S, payload: &[u8]) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let header = (payload.len() as u64).to_le_bytes();
    stream.write_all(&header).await?;
    stream.write_all(payload).await?;
    stream.flush().await
}

/// Read one frame payload. The caller decides how much of it to keep.
pub async fn read_frame<S>(stream: &mut S) -> std::io::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_SIZE];
    stream.read_exact(&mut header).await?;
    let len = u64::from_le_bytes(header) as usize;
    if validate_frame_size(len).is_err() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame payload size out of range: {} bytes", len),
        ));
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn msg_type_round_trip() {
        for v in 0u8..=7 {
            let t = MsgType::from_u8(v);
            assert_eq!(t as u8, v);
        }
        assert_eq!(MsgType::from_u8(200), MsgType::None);
    }

    #[test]
    fn err_type_codes_are_stable() {
        assert_eq!(ErrType::CreateAlreadyExist.code(), 103);
        assert_eq!(ErrType::UpdateAlreadyUpdated.code(), 204);
        assert_eq!(ErrType::RetrieveFailed.code(), 601);
        assert_eq!(ErrType::from_code(503), Some(ErrType::AuthFailed));
        assert_eq!(ErrType::from_code(999), None);
    }

    #[test]
    fn err_type_parses_ascii_decimal() {
        assert_eq!(ErrType::parse(b"103"), Some(ErrType::CreateAlreadyExist));
        assert_eq!(ErrType::parse(b"xyz"), None);
        assert_eq!(ErrType::parse(b""), None);
    }

    #[test]
    fn frame_size_guard() {
        assert!(validate_frame_size(1).is_ok());
        assert!(validate_frame_size(MAX_FRAME_SIZE).is_ok());
        assert!(validate_frame_size(0).is_err());
        assert!(validate_frame_size(MAX_FRAME_SIZE + 1).is_err());
    }

    #[tokio::test]
    async fn frame_round_trip_little_endian_header() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"\x04hello").await.unwrap();
        let mut raw = [0u8; HEADER_SIZE];
        b.read_exact(&mut raw).await.unwrap();
        assert_eq!(raw, 6u64.to_le_bytes());
        let mut payload = [0u8; 6];
        b.read_exact(&mut payload).await.unwrap();
        assert_eq!(&payload, b"\x04hello");
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let bogus = ((MAX_FRAME_SIZE + 1) as u64).to_le_bytes();
        a.write_all(&bogus).await.unwrap();
        let err = read_frame(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
