//! The single duplex stream connecting the two peers, plus the codec-level
//! send helpers pipe operations use.
//!
//! There is exactly one [`Channel`] per mounted instance (see [`crate::handshake`]).
//! Its write half may be used concurrently by any number of pipe operations,
//! serialized by `send_mutex`; its read half is used by exactly one thread,
//! the dispatcher (§4.17), and is therefore not behind a lock at all.

use std::io;
use std::net::TcpStream;
use std::sync::Mutex;

use crate::codec::{Header, Message};
use crate::pipe::OpenMode;

/// The peer channel: one TCP stream, split into an unsynchronized read half
/// (owned by the dispatcher) and a mutex-guarded write half (shared by every
/// pipe operation that needs to talk to the peer).
pub struct Channel {
    write_half: Mutex<TcpStream>,
    read_half: Mutex<TcpStream>,
    /// The peer's advertised pipe buffer capacity, exchanged during the
    /// handshake (§4.18). New pipes initialize `remote_max` from this.
    pub remote_capacity: u64,
}

impl Channel {
    pub fn new(stream: TcpStream, remote_capacity: u64) -> io::Result<Self> {
        let read_half = stream.try_clone()?;
        Ok(Self {
            write_half: Mutex::new(stream),
            read_half: Mutex::new(read_half),
            remote_capacity,
        })
    }

    /// Sends a fully-formed message, holding `send_mutex` for the duration
    /// so no other sender's bytes can interleave with it.
    pub fn send(&self, msg: &Message) -> io::Result<()> {
        let mut stream = self
            .write_half
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        msg.write_to(&mut *stream)
    }

    pub fn send_open(&self, path: &str, mode: OpenMode) -> io::Result<()> {
        self.send(&Message::Open {
            path: path.to_string(),
            mode,
        })
    }

    pub fn send_close(&self, path: &str, mode: OpenMode) -> io::Result<()> {
        self.send(&Message::Close {
            path: path.to_string(),
            mode,
        })
    }

    pub fn send_write(&self, path: &str, data: &[u8]) -> io::Result<()> {
        self.send(&Message::Write {
            path: path.to_string(),
            data: data.to_vec(),
        })
    }

    pub fn send_read_request(&self, path: &str, size: u64) -> io::Result<()> {
        self.send(&Message::ReadRequest {
            path: path.to_string(),
            size,
        })
    }

    pub fn send_read_update(&self, path: &str, size: u64) -> io::Result<()> {
        self.send(&Message::ReadUpdate {
            path: path.to_string(),
            size,
        })
    }

    /// Reads the next message's header off the read half. Only ever called
    /// by the dispatcher thread.
    pub fn read_header(&self) -> io::Result<Header> {
        let mut stream = self
            .read_half
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        Message::read_header(&mut *stream)
    }

    /// Reads `n` bytes of a `Write` message's data payload directly off the
    /// read half into `buf` (`buf.len() >= n`). Used by the dispatcher when
    /// handing payload bytes straight to a pipe's `recv`.
    pub fn read_payload_exact(&self, buf: &mut [u8]) -> io::Result<()> {
        use std::io::Read;
        let mut stream = self
            .read_half
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        stream.read_exact(buf)
    }

    /// Gives the dispatcher direct, unbuffered access to the read half so
    /// it can read a bounded, possibly-partial amount (used when draining a
    /// `Write` payload straight into a pipe's circular buffer or into a
    /// pending read request without first copying it into a `Vec`).
    pub fn read_half(&self) -> std::sync::MutexGuard<'_, TcpStream> {
        self.read_half.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    /// Shuts down both directions of the underlying socket, used by the
    /// dispatcher's stop path to unblock a pending read.
    pub fn shutdown(&self) {
        if let Ok(stream) = self.write_half.lock() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }
}
