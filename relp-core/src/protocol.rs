//! Command names, protocol version and the `rsp` payload format.

use crate::error::ProtocolError;

/// Protocol version carried in the mandatory `relp_version` offer.
pub const PROTOCOL_VERSION: u32 = 1;

pub const CMD_INIT: &str = "init";
pub const CMD_GO: &str = "go";
pub const CMD_MSG: &str = "msg";
pub const CMD_CLOSE: &str = "close";
pub const CMD_RSP: &str = "rsp";

/// Three-digit response code. Only 200 means success; anything else is an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RspCode(u16);

impl RspCode {
    pub const OK: RspCode = RspCode(200);
    pub const ERROR: RspCode = RspCode(500);

    pub fn new(code: u16) -> Option<Self> {
        (100..=999).contains(&code).then_some(Self(code))
    }

    pub fn as_u16(self) -> u16 {
        self.0
    }

    pub fn is_success(self) -> bool {
        self == Self::OK
    }
}

/// Parsed `rsp` data: `RSP-CODE [SP HUMANMSG] LF [CMDDATA]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: RspCode,
    pub message: Option<String>,
    pub data: Vec<u8>,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            code: RspCode::OK,
            message: Some("OK".to_string()),
            data: Vec::new(),
        }
    }

    pub fn ok_with_data(data: Vec<u8>) -> Self {
        Self {
            data,
            ..Self::ok()
        }
    }

    /// Error response. LFs in the reason are replaced so the header stays one line.
    pub fn error(reason: &str) -> Self {
        Self {
            code: RspCode::ERROR,
            message: Some(reason.replace('\n', " ")),
            data: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code.is_success()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.code.0.to_string().into_bytes();
        if let Some(msg) = &self.message {
            out.push(b' ');
            out.extend_from_slice(msg.as_bytes());
        }
        out.push(b'\n');
        out.extend_from_slice(&self.data);
        out
    }

    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        let end = data
            .iter()
            .position(|&b| b == b'\n')
            .ok_or(ProtocolError::MalformedResponse("response header without LF"))?;
        let header = std::str::from_utf8(&data[..end])
            .map_err(|_| ProtocolError::MalformedResponse("response header is not UTF-8"))?;
        let (code, message) = match header.split_once(' ') {
            Some((code, msg)) => (code, Some(msg.to_string())),
            None => (header, None),
        };
        if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ProtocolError::MalformedResponse("response code is not three digits"));
        }
        let code = code
            .parse()
            .ok()
            .and_then(RspCode::new)
            .ok_or(ProtocolError::MalformedResponse("response code out of range"))?;
        Ok(Self {
            code,
            message,
            data: data[end + 1..].to_vec(),
        })
    }
}
