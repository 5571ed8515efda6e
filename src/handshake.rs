//! Peer handshake (§4.18): establishes the single duplex [`Channel`] this
//! process will use for the rest of its life.
//!
//! Both peers listen and connect concurrently, so two independent TCP
//! connections momentarily exist between them. A deterministic tuple
//! comparison — computed identically (and oppositely) on both sides —
//! decides, without any further negotiation, which of the two connections
//! survives: both sides always agree, because each is comparing the same
//! pair of endpoints, just from its own side.

use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::str::FromStr;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::channel::Channel;
use crate::config::Options;
use crate::error::{Error, Result};

const RETRY_INTERVAL: Duration = Duration::from_millis(200);

fn write_host_string(stream: &mut TcpStream, host: &str) -> io::Result<()> {
    stream.write_all(host.as_bytes())?;
    stream.write_all(&[0u8])?;
    stream.flush()
}

fn read_host_string(stream: &mut TcpStream) -> io::Result<String> {
    let mut bytes = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte)?;
        if byte[0] == 0 {
            break;
        }
        bytes.push(byte[0]);
    }
    String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// `(host, port)` compared as dotted-quad octets first, falling back to a
/// byte-string comparison for non-literal hosts, with port as tiebreaker.
fn tuple_key(host: &str, port: u16) -> ([u8; 4], String, u16) {
    let octets = Ipv4Addr::from_str(host).map(|ip| ip.octets()).unwrap_or([0, 0, 0, 0]);
    (octets, host.to_string(), port)
}

fn we_keep_accepted(my_host: &str, my_port: u16, peer_host: &str, peer_port: u16) -> Result<bool> {
    let mine = tuple_key(my_host, my_port);
    let theirs = tuple_key(peer_host, peer_port);
    if mine == theirs {
        return Err(Error::Internal(
            "handshake tuple tie: peers have identical (host, port)".into(),
        ));
    }
    Ok(mine > theirs)
}

fn connect_with_retry(remote: &str, timeout: Duration) -> io::Result<TcpStream> {
    let deadline = Instant::now() + timeout;
    loop {
        match TcpStream::connect(remote) {
            Ok(stream) => return Ok(stream),
            Err(e) if Instant::now() < deadline => {
                debug!("connect to {remote} failed ({e}), retrying");
                thread::sleep(RETRY_INTERVAL);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Runs the handshake and returns the established [`Channel`], ready for
/// the dispatcher to read from and pipes to write to.
pub fn perform(opts: &Options) -> Result<Channel> {
    let local_bind = format!("0.0.0.0:{}", opts.port);
    let listener = TcpListener::bind(&local_bind)?;
    info!("handshake: listening on {local_bind}");

    let remote = format!("{}:{}", opts.host_ip, opts.host_port);
    let outbound = connect_with_retry(&remote, Duration::from_millis(opts.timeout_ms))?;
    info!("handshake: connected to {remote}");

    let (mut inbound, peer_addr) = listener.accept()?;
    info!("handshake: accepted connection from {peer_addr}");

    let mut outbound_for_write = outbound.try_clone()?;
    let my_host = outbound.local_addr()?.ip().to_string();
    write_host_string(&mut outbound_for_write, &my_host)?;
    let peer_host = read_host_string(&mut inbound)?;
    debug!("handshake: exchanged host strings (me={my_host}, peer={peer_host})");

    let keep_accepted = we_keep_accepted(&my_host, opts.port, &peer_host, opts.host_port)?;

    let chosen = if keep_accepted {
        drop(outbound);
        inbound
    } else {
        drop(listener);
        drop(inbound);
        outbound
    };

    let mut cap_writer = chosen.try_clone()?;
    cap_writer.write_all(&(opts.pipe_capacity as u64).to_le_bytes())?;
    cap_writer.flush()?;

    let mut cap_reader = chosen.try_clone()?;
    let mut cap_buf = [0u8; 8];
    cap_reader.read_exact(&mut cap_buf)?;
    let remote_capacity = u64::from_le_bytes(cap_buf);

    info!(
        "handshake: complete, peer advertises {remote_capacity} bytes of buffer capacity"
    );

    match Channel::new(chosen, remote_capacity) {
        Ok(channel) => Ok(channel),
        Err(e) => {
            warn!("handshake: failed to finalize channel: {e}");
            Err(Error::Io(e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tuple_comparison_prefers_larger_octets() {
        assert!(we_keep_accepted("10.0.0.2", 9000, "10.0.0.1", 9000).unwrap());
        assert!(!we_keep_accepted("10.0.0.1", 9000, "10.0.0.2", 9000).unwrap());
    }

    #[test]
    fn tuple_comparison_uses_port_as_tiebreaker() {
        assert!(we_keep_accepted("10.0.0.1", 9001, "10.0.0.1", 9000).unwrap());
        assert!(!we_keep_accepted("10.0.0.1", 9000, "10.0.0.1", 9001).unwrap());
    }

    #[test]
    fn tuple_comparison_rejects_exact_tie() {
        let err = we_keep_accepted("10.0.0.1", 9000, "10.0.0.1", 9000).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }
}
