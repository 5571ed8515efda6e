//! End-to-end scenarios (§8) driven directly against two in-process
//! `Context`s connected by a loopback `TcpStream` pair — no real FUSE mount
//! is needed since `fs::NetPipeFs` is a thin, untested-here adapter over
//! exactly the `Pipe` operations exercised below.

use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use netpipefs::channel::Channel;
use netpipefs::config::Options;
use netpipefs::context::Context;
use netpipefs::dispatcher::{Dispatcher, StopHandle};
use netpipefs::error::Error;
use netpipefs::pipe::{OpenMode, Pipe};

fn test_options(cap: usize) -> Options {
    Options {
        port: 0,
        host_ip: String::new(),
        host_port: 0,
        pipe_capacity: cap,
        timeout_ms: 0,
        mountpoint: PathBuf::new(),
        debug: false,
    }
}

struct Endpoint {
    ctx: Arc<Context>,
    stop: StopHandle,
    dispatcher_thread: thread::JoinHandle<()>,
}

impl Endpoint {
    fn shutdown(self) {
        self.stop.stop();
        let _ = self.dispatcher_thread.join();
    }
}

fn loopback_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let accept_thread = thread::spawn(move || listener.accept().unwrap().0);
    let a = TcpStream::connect(addr).unwrap();
    let b = accept_thread.join().unwrap();
    (a, b)
}

fn spawn_pair(cap: usize) -> (Endpoint, Endpoint) {
    let (a_stream, b_stream) = loopback_pair();

    let a_channel = Channel::new(a_stream, cap as u64).unwrap();
    let b_channel = Channel::new(b_stream, cap as u64).unwrap();

    let a_ctx = Arc::new(Context::new(a_channel, test_options(cap)));
    let b_ctx = Arc::new(Context::new(b_channel, test_options(cap)));

    let a_dispatcher = Dispatcher::new(a_ctx.clone());
    let a_stop = a_dispatcher.stop_handle();
    let a_thread = thread::spawn(move || a_dispatcher.run());

    let b_dispatcher = Dispatcher::new(b_ctx.clone());
    let b_stop = b_dispatcher.stop_handle();
    let b_thread = thread::spawn(move || b_dispatcher.run());

    (
        Endpoint {
            ctx: a_ctx,
            stop: a_stop,
            dispatcher_thread: a_thread,
        },
        Endpoint {
            ctx: b_ctx,
            stop: b_stop,
            dispatcher_thread: b_thread,
        },
    )
}

#[test]
fn rendezvous_open_completes_on_both_sides() {
    let (a, b) = spawn_pair(64);

    let a_ctx = a.ctx.clone();
    let writer_thread =
        thread::spawn(move || Pipe::open_local(&a_ctx.table, "/p", OpenMode::WriteOnly, false));

    thread::sleep(Duration::from_millis(50));
    let reader = Pipe::open_local(&b.ctx.table, "/p", OpenMode::ReadOnly, false);
    assert!(reader.is_ok());

    let writer = writer_thread.join().unwrap();
    assert!(writer.is_ok());

    a.shutdown();
    b.shutdown();
}

#[test]
fn small_bidirectional_write_then_eof() {
    let (a, b) = spawn_pair(64);

    let a_ctx = a.ctx.clone();
    let writer_thread = thread::spawn(move || {
        let pipe = Pipe::open_local(&a_ctx.table, "/p", OpenMode::WriteOnly, false).unwrap();
        pipe.send(&[0x00, 0x01, 0x02, 0x03], false).unwrap();
        pipe.close(&a_ctx.table, OpenMode::WriteOnly).unwrap();
    });

    thread::sleep(Duration::from_millis(50));
    let reader = Pipe::open_local(&b.ctx.table, "/p", OpenMode::ReadOnly, false).unwrap();

    let mut buf = [0u8; 4];
    let n = reader.read(&mut buf, false).unwrap();
    assert_eq!(n, 4);
    assert_eq!(buf, [0x00, 0x01, 0x02, 0x03]);

    let mut buf2 = [0u8; 4];
    let n2 = reader.read(&mut buf2, false).unwrap();
    assert_eq!(n2, 0);

    writer_thread.join().unwrap();
    a.shutdown();
    b.shutdown();
}

#[test]
fn flow_control_limits_in_flight_bytes() {
    let (a, b) = spawn_pair(16);

    let a_ctx = a.ctx.clone();
    let writer_thread = thread::spawn(move || {
        let pipe = Pipe::open_local(&a_ctx.table, "/p", OpenMode::WriteOnly, false).unwrap();
        let payload = vec![7u8; 40];
        pipe.send(&payload, false)
    });

    thread::sleep(Duration::from_millis(50));
    let reader = Pipe::open_local(&b.ctx.table, "/p", OpenMode::ReadOnly, false).unwrap();

    let mut total = 0;
    let mut buf = [0u8; 10];
    while total < 40 {
        let n = reader.read(&mut buf, false).unwrap();
        assert!(n > 0);
        total += n;
    }
    assert_eq!(total, 40);

    let sent = writer_thread.join().unwrap().unwrap();
    assert_eq!(sent, 40);

    a.shutdown();
    b.shutdown();
}

#[test]
fn nonblocking_write_returns_partial_then_try_again() {
    let (a, b) = spawn_pair(16);

    // B opens read-only but never reads, so credit stays at local_cap = 16.
    let b_ctx = b.ctx.clone();
    let reader_thread =
        thread::spawn(move || Pipe::open_local(&b_ctx.table, "/p", OpenMode::ReadOnly, false));

    let writer = Pipe::open_local(&a.ctx.table, "/p", OpenMode::WriteOnly, false).unwrap();
    reader_thread.join().unwrap().unwrap();

    let payload = vec![9u8; 32];
    let first = writer.send(&payload, true).unwrap();
    assert_eq!(first, 32);

    let err = writer.send(&[1, 2, 3], true).unwrap_err();
    assert!(matches!(err, Error::TryAgain));

    a.shutdown();
    b.shutdown();
}

#[test]
fn peer_close_delivers_eof_to_reader() {
    let (a, b) = spawn_pair(64);

    let a_ctx = a.ctx.clone();
    let writer_thread = thread::spawn(move || {
        let pipe = Pipe::open_local(&a_ctx.table, "/p", OpenMode::WriteOnly, false).unwrap();
        pipe.send(&[0xAA, 0xBB], false).unwrap();
        pipe.close(&a_ctx.table, OpenMode::WriteOnly).unwrap();
    });

    thread::sleep(Duration::from_millis(50));
    let reader = Pipe::open_local(&b.ctx.table, "/p", OpenMode::ReadOnly, false).unwrap();

    let mut buf = [0u8; 2];
    assert_eq!(reader.read(&mut buf, false).unwrap(), 2);
    assert_eq!(buf, [0xAA, 0xBB]);
    assert_eq!(reader.read(&mut buf, false).unwrap(), 0);

    writer_thread.join().unwrap();
    a.shutdown();
    b.shutdown();
}

#[test]
fn connection_loss_breaks_blocked_operations() {
    let (a, b) = spawn_pair(16);

    let a_ctx = a.ctx.clone();
    let writer_thread = thread::spawn(move || {
        let pipe = Pipe::open_local(&a_ctx.table, "/p", OpenMode::WriteOnly, false).unwrap();
        let payload = vec![1u8; 1024 * 1024];
        pipe.send(&payload, false)
    });

    // A second path, opened on both ends but never written to, so the
    // reader blocked on it can never make partial progress on its own —
    // when force_exit hits it, `bytes_processed` is guaranteed to still be
    // 0, which is exactly the case the broken-pipe-vs-EOF distinction below
    // depends on.
    let a_ctx = a.ctx.clone();
    thread::spawn(move || {
        Pipe::open_local(&a_ctx.table, "/silent", OpenMode::WriteOnly, false)
    });

    thread::sleep(Duration::from_millis(50));
    let reader = Pipe::open_local(&b.ctx.table, "/silent", OpenMode::ReadOnly, false).unwrap();

    let reader_thread = thread::spawn(move || {
        let mut buf = [0u8; 4];
        reader.read(&mut buf, false)
    });

    thread::sleep(Duration::from_millis(50));

    // Sever the connection out from under both dispatchers.
    a.ctx.channel.shutdown();
    b.ctx.channel.shutdown();

    let result = writer_thread.join().unwrap();
    assert!(result.is_err());

    let read_result = reader_thread.join().unwrap();
    assert!(matches!(read_result, Err(Error::BrokenPipe)));

    let a_ctx = a.ctx.clone();
    a.shutdown();
    b.shutdown();

    let reopen = Pipe::open_local(&a_ctx.table, "/q", OpenMode::WriteOnly, true);
    assert!(reopen.is_err());
}

#[test]
fn nonblocking_open_before_peer_returns_try_again() {
    let (a, _b) = spawn_pair(64);

    let err = Pipe::open_local(&a.ctx.table, "/p", OpenMode::WriteOnly, true).unwrap_err();
    assert!(matches!(err, Error::TryAgain));

    a.shutdown();
    _b.shutdown();
}

#[test]
fn close_with_buffered_backlog_still_flushes() {
    // Capacity small enough that a chunk of the write lands in the local
    // buffer (not just direct-sent), so close()'s flush has real queued-write
    // work to do via flush_buffer_locked/push_queued_writes_locked.
    let (a, b) = spawn_pair(8);

    let a_ctx = a.ctx.clone();
    let writer_thread = thread::spawn(move || {
        let pipe = Pipe::open_local(&a_ctx.table, "/p", OpenMode::WriteOnly, false).unwrap();
        // Larger than remote credit (8), so part of this sits in the local
        // circular buffer until close()'s flush drains it to the peer.
        pipe.send(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10], false).unwrap();
        pipe.close(&a_ctx.table, OpenMode::WriteOnly).unwrap();
    });

    thread::sleep(Duration::from_millis(50));
    let reader = Pipe::open_local(&b.ctx.table, "/p", OpenMode::ReadOnly, false).unwrap();

    let mut total = Vec::new();
    let mut buf = [0u8; 4];
    loop {
        let n = reader.read(&mut buf, false).unwrap();
        if n == 0 {
            break;
        }
        total.extend_from_slice(&buf[..n]);
    }
    assert_eq!(total, vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);

    writer_thread.join().unwrap();
    a.shutdown();
    b.shutdown();
}
