//! Command-line configuration (§4.20, §6.3).

use std::path::PathBuf;

use clap::Parser;

/// A distributed pipe filesystem: files under the mountpoint behave as
/// bidirectional named pipes spanning this host and a configured peer.
#[derive(Debug, Parser)]
#[command(name = "netpipefs", version, about)]
pub struct Options {
    /// Local TCP port to listen on for the peer connection.
    #[arg(long)]
    pub port: u16,

    /// The peer's address to connect to.
    #[arg(long = "host-ip")]
    pub host_ip: String,

    /// The peer's port to connect to.
    #[arg(long = "host-port")]
    pub host_port: u16,

    /// Per-pipe local buffer capacity, in bytes.
    #[arg(long = "pipe-capacity", default_value_t = 65536)]
    pub pipe_capacity: usize,

    /// How long to keep retrying the outbound connection before giving up,
    /// in milliseconds.
    #[arg(long = "timeout-ms", default_value_t = 30_000)]
    pub timeout_ms: u64,

    /// Where to mount the filesystem.
    pub mountpoint: PathBuf,

    /// Raise the log filter to debug (and enable FUSE's own debug output,
    /// where supported) instead of the default info level.
    #[arg(long)]
    pub debug: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_required_and_default_fields() {
        let opts = Options::parse_from([
            "netpipefs",
            "--port",
            "9000",
            "--host-ip",
            "10.0.0.2",
            "--host-port",
            "9001",
            "/mnt/pipes",
        ]);
        assert_eq!(opts.port, 9000);
        assert_eq!(opts.host_ip, "10.0.0.2");
        assert_eq!(opts.host_port, 9001);
        assert_eq!(opts.pipe_capacity, 65536);
        assert_eq!(opts.timeout_ms, 30_000);
        assert_eq!(opts.mountpoint, PathBuf::from("/mnt/pipes"));
        assert!(!opts.debug);
    }

    #[test]
    fn overrides_apply() {
        let opts = Options::parse_from([
            "netpipefs",
            "--port",
            "9000",
            "--host-ip",
            "10.0.0.2",
            "--host-port",
            "9001",
            "--pipe-capacity",
            "4096",
            "--debug",
            "/mnt/pipes",
        ]);
        assert_eq!(opts.pipe_capacity, 4096);
        assert!(opts.debug);
    }
}
