//! Framing: `TXNR SP COMMAND SP DATALEN [SP DATA] LF`.
//!
//! The header is plain ASCII. `DATA` is exactly `DATALEN` octets and is only
//! preceded by a space when it is non-empty. Every frame ends in a single LF,
//! which is checked on decode to catch framing errors early.

use std::fmt;

/// Largest transaction number representable on the wire (nine digits).
pub const MAX_TXNR: u32 = 999_999_999;
/// Longest permitted command name.
pub const MAX_COMMAND_LEN: usize = 32;
/// Default upper bound on `DATALEN` accepted from a peer (128 KiB).
pub const DEFAULT_MAX_DATA_LEN: usize = 128 * 1024;

const MAX_DIGITS: usize = 9;
const SP: u8 = b' ';
const LF: u8 = b'\n';

/// One parsed frame. `data_len()` always equals `data().len()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    txnr: u32,
    command: String,
    data: Vec<u8>,
}

impl Frame {
    /// Build a frame, validating the header fields against the wire grammar.
    pub fn new(
        txnr: u32,
        command: impl Into<String>,
        data: impl Into<Vec<u8>>,
    ) -> Result<Self, FrameEncodeError> {
        let command = command.into();
        if txnr > MAX_TXNR {
            return Err(FrameEncodeError::TxnrOutOfRange(txnr));
        }
        if !is_valid_command(&command) {
            return Err(FrameEncodeError::InvalidCommand(command));
        }
        let data = data.into();
        if data.len() > MAX_TXNR as usize {
            return Err(FrameEncodeError::TooLarge);
        }
        Ok(Self {
            txnr,
            command,
            data,
        })
    }

    pub fn txnr(&self) -> u32 {
        self.txnr
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_len(&self) -> usize {
        self.data.len()
    }

    /// Append the wire form of this frame to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.reserve(self.command.len() + self.data.len() + 2 * MAX_DIGITS + 4);
        out.extend_from_slice(self.txnr.to_string().as_bytes());
        out.push(SP);
        out.extend_from_slice(self.command.as_bytes());
        out.push(SP);
        out.extend_from_slice(self.data.len().to_string().as_bytes());
        if !self.data.is_empty() {
            out.push(SP);
            out.extend_from_slice(&self.data);
        }
        out.push(LF);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.txnr, self.command, self.data.len())
    }
}

fn is_valid_command(command: &str) -> bool {
    !command.is_empty()
        && command.len() <= MAX_COMMAND_LEN
        && command.bytes().all(|b| b.is_ascii_alphabetic())
}

/// Encode a frame from its parts. Fails if the header would not be valid on the wire.
pub fn encode_frame(txnr: u32, command: &str, data: &[u8]) -> Result<Vec<u8>, FrameEncodeError> {
    Ok(Frame::new(txnr, command, data)?.encode())
}

/// Error building a frame for sending.
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("transaction number {0} out of range")]
    TxnrOutOfRange(u32),
    #[error("invalid command name {0:?}")]
    InvalidCommand(String),
    #[error("frame too large")]
    TooLarge,
}

/// Decode one frame from the front of `bytes`. Returns the frame and the number of bytes consumed.
/// Call with a partial buffer; `NeedMore` means the caller should try again after more data arrives.
pub fn decode_frame(bytes: &[u8], max_data_len: usize) -> Result<(Frame, usize), FrameDecodeError> {
    let mut pos = 0;
    let txnr = read_number(bytes, &mut pos)?;
    expect(bytes, &mut pos, SP, "expected space after txnr")?;
    let command = read_command(bytes, &mut pos)?;
    expect(bytes, &mut pos, SP, "expected space after command")?;
    let len = read_number(bytes, &mut pos)? as usize;
    if len > max_data_len {
        return Err(FrameDecodeError::TooLarge {
            len,
            max: max_data_len,
        });
    }
    let data = if len > 0 {
        expect(bytes, &mut pos, SP, "expected space before data")?;
        if bytes.len() < pos + len {
            return Err(FrameDecodeError::NeedMore);
        }
        let data = bytes[pos..pos + len].to_vec();
        pos += len;
        data
    } else {
        Vec::new()
    };
    expect(bytes, &mut pos, LF, "missing LF trailer")?;
    Ok((
        Frame {
            txnr,
            command,
            data,
        },
        pos,
    ))
}

fn expect(bytes: &[u8], pos: &mut usize, want: u8, what: &'static str) -> Result<(), FrameDecodeError> {
    match bytes.get(*pos) {
        None => Err(FrameDecodeError::NeedMore),
        Some(&b) if b == want => {
            *pos += 1;
            Ok(())
        }
        Some(_) => Err(FrameDecodeError::Malformed(what)),
    }
}

fn read_number(bytes: &[u8], pos: &mut usize) -> Result<u32, FrameDecodeError> {
    let start = *pos;
    let mut value: u32 = 0;
    loop {
        match bytes.get(*pos) {
            None => return Err(FrameDecodeError::NeedMore),
            Some(b) if b.is_ascii_digit() => {
                if *pos - start == MAX_DIGITS {
                    return Err(FrameDecodeError::Malformed("number exceeds nine digits"));
                }
                value = value * 10 + u32::from(b - b'0');
                *pos += 1;
            }
            Some(_) if *pos == start => {
                return Err(FrameDecodeError::Malformed("expected digit"));
            }
            Some(_) => return Ok(value),
        }
    }
}

fn read_command(bytes: &[u8], pos: &mut usize) -> Result<String, FrameDecodeError> {
    let start = *pos;
    loop {
        match bytes.get(*pos) {
            None => return Err(FrameDecodeError::NeedMore),
            Some(b) if b.is_ascii_alphabetic() => {
                if *pos - start == MAX_COMMAND_LEN {
                    return Err(FrameDecodeError::Malformed("command longer than 32 characters"));
                }
                *pos += 1;
            }
            Some(_) if *pos == start => {
                return Err(FrameDecodeError::Malformed("empty command"));
            }
            Some(_) => {
                // ASCII letters only, so this cannot fail.
                return Ok(String::from_utf8_lossy(&bytes[start..*pos]).into_owned());
            }
        }
    }
}

/// Error decoding a frame (need more bytes, too large, or not a valid frame).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame data length {len} exceeds limit {max}")]
    TooLarge { len: usize, max: usize },
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
}
