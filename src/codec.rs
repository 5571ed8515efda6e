//! Wire format for the peer channel (§6.2).
//!
//! Every message is `[u8 opcode][payload]`. Strings (paths) are encoded as
//! `[u64 length little-endian][bytes]`; integers are always little-endian.
//! [`Message::read_from`] is used by the dispatcher's single reader thread;
//! [`Message::write_to`] is used by pipe operations while holding the
//! channel's send mutex, so that one message is never interleaved with
//! another.

use std::io::{self, Read, Write};

use crate::pipe::OpenMode;

const OP_OPEN: u8 = 1;
const OP_CLOSE: u8 = 2;
const OP_WRITE: u8 = 3;
const OP_READ_REQUEST: u8 = 4;
const OP_READ_UPDATE: u8 = 5;

/// A single framed message exchanged between the two peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// The sender opened `path` in `mode`.
    Open { path: String, mode: OpenMode },
    /// The sender closed its endpoint on `path` in `mode`.
    Close { path: String, mode: OpenMode },
    /// `data` bytes of payload for `path`.
    Write { path: String, data: Vec<u8> },
    /// The sender grants `size` additional bytes of credit for `path`.
    ReadRequest { path: String, size: u64 },
    /// The sender has consumed `size` bytes previously sent for `path`.
    ReadUpdate { path: String, size: u64 },
}

fn write_string<W: Write + ?Sized>(w: &mut W, s: &str) -> io::Result<()> {
    w.write_all(&(s.len() as u64).to_le_bytes())?;
    w.write_all(s.as_bytes())
}

fn read_string<R: Read + ?Sized>(r: &mut R) -> io::Result<String> {
    let mut len_buf = [0u8; 8];
    r.read_exact(&mut len_buf)?;
    let len = u64::from_le_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn mode_to_byte(mode: OpenMode) -> u8 {
    match mode {
        OpenMode::ReadOnly => 0,
        OpenMode::WriteOnly => 1,
    }
}

fn byte_to_mode(byte: u8) -> io::Result<OpenMode> {
    match byte {
        0 => Ok(OpenMode::ReadOnly),
        1 => Ok(OpenMode::WriteOnly),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown open mode byte {other}"),
        )),
    }
}

impl Message {
    /// Serializes and writes this message in full. The caller is expected
    /// to hold the peer channel's send mutex for the duration of this call.
    pub fn write_to<W: Write + ?Sized>(&self, w: &mut W) -> io::Result<()> {
        match self {
            Message::Open { path, mode } => {
                w.write_all(&[OP_OPEN])?;
                write_string(w, path)?;
                w.write_all(&[mode_to_byte(*mode)])?;
            }
            Message::Close { path, mode } => {
                w.write_all(&[OP_CLOSE])?;
                write_string(w, path)?;
                w.write_all(&[mode_to_byte(*mode)])?;
            }
            Message::Write { path, data } => {
                w.write_all(&[OP_WRITE])?;
                write_string(w, path)?;
                w.write_all(&(data.len() as u64).to_le_bytes())?;
                w.write_all(data)?;
            }
            Message::ReadRequest { path, size } => {
                w.write_all(&[OP_READ_REQUEST])?;
                write_string(w, path)?;
                w.write_all(&size.to_le_bytes())?;
            }
            Message::ReadUpdate { path, size } => {
                w.write_all(&[OP_READ_UPDATE])?;
                write_string(w, path)?;
                w.write_all(&size.to_le_bytes())?;
            }
        }
        w.flush()
    }

    /// Reads the opcode and its header (path + any fixed-size fields), but
    /// for [`Message::Write`] stops short of reading the data payload,
    /// returning how many bytes of payload remain so the dispatcher can
    /// hand the pipe object a `recv` call that reads the body directly into
    /// the right place (buffer or pending read requests) without an extra
    /// copy through this codec.
    pub fn read_header<R: Read + ?Sized>(r: &mut R) -> io::Result<Header> {
        let mut op = [0u8; 1];
        let n = r.read(&mut op)?;
        if n == 0 {
            return Ok(Header::Eof);
        }
        let header = match op[0] {
            OP_OPEN => {
                let path = read_string(r)?;
                let mut mode_buf = [0u8; 1];
                r.read_exact(&mut mode_buf)?;
                Header::Open {
                    path,
                    mode: byte_to_mode(mode_buf[0])?,
                }
            }
            OP_CLOSE => {
                let path = read_string(r)?;
                let mut mode_buf = [0u8; 1];
                r.read_exact(&mut mode_buf)?;
                Header::Close {
                    path,
                    mode: byte_to_mode(mode_buf[0])?,
                }
            }
            OP_WRITE => {
                let path = read_string(r)?;
                let mut len_buf = [0u8; 8];
                r.read_exact(&mut len_buf)?;
                Header::Write {
                    path,
                    size: u64::from_le_bytes(len_buf),
                }
            }
            OP_READ_REQUEST => {
                let path = read_string(r)?;
                let mut size_buf = [0u8; 8];
                r.read_exact(&mut size_buf)?;
                Header::ReadRequest {
                    path,
                    size: u64::from_le_bytes(size_buf),
                }
            }
            OP_READ_UPDATE => {
                let path = read_string(r)?;
                let mut size_buf = [0u8; 8];
                r.read_exact(&mut size_buf)?;
                Header::ReadUpdate {
                    path,
                    size: u64::from_le_bytes(size_buf),
                }
            }
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown opcode {other}"),
                ))
            }
        };
        Ok(header)
    }
}

/// Result of reading just the framing header of a message off the wire.
/// `Write`'s data payload is read separately by the dispatcher, directly
/// into the target pipe's buffer or pending requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Header {
    Open { path: String, mode: OpenMode },
    Close { path: String, mode: OpenMode },
    Write { path: String, size: u64 },
    ReadRequest { path: String, size: u64 },
    ReadUpdate { path: String, size: u64 },
    /// The peer closed the connection (a zero-length opcode read).
    Eof,
}
