//! The single dispatcher thread (§4.17): the only reader of the peer
//! channel's socket, fanning incoming messages out to pipes by path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, error, warn};

use crate::codec::Header;
use crate::context::Context;

pub struct Dispatcher {
    ctx: Arc<Context>,
    stopping: Arc<AtomicBool>,
}

impl Dispatcher {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A handle that can be used to request the dispatcher loop stop; it
    /// unblocks the pending socket read by shutting down the channel.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            stopping: self.stopping.clone(),
            ctx: self.ctx.clone(),
        }
    }

    /// Runs the dispatch loop until stopped or the connection is lost.
    /// On return, every pipe has had `force_exit` called on it.
    pub fn run(&self) {
        loop {
            if self.stopping.load(Ordering::SeqCst) {
                break;
            }

            let header = match self.ctx.channel.read_header() {
                Ok(h) => h,
                Err(e) => {
                    if !self.stopping.load(Ordering::SeqCst) {
                        warn!("dispatcher: connection lost: {e}");
                    }
                    break;
                }
            };

            match header {
                Header::Eof => {
                    warn!("dispatcher: peer closed the connection");
                    break;
                }
                Header::Open { path, mode } => {
                    crate::pipe::Pipe::open_update(&self.ctx.table, &path, mode);
                }
                Header::Close { path, mode } => {
                    if let Some(pipe) = self.ctx.table.get(&path) {
                        pipe.close_update(&self.ctx.table, mode);
                        debug!("dispatcher: peer closed {path} ({mode:?})");
                    } else {
                        warn!("dispatcher: CLOSE for unknown path {path}");
                    }
                }
                Header::Write { path, size } => {
                    self.handle_write(&path, size);
                }
                Header::ReadRequest { path, size } => {
                    if let Some(pipe) = self.ctx.table.get(&path) {
                        pipe.read_request(size);
                    } else {
                        warn!("dispatcher: READ-REQUEST for unknown path {path}");
                    }
                }
                Header::ReadUpdate { path, size } => {
                    if let Some(pipe) = self.ctx.table.get(&path) {
                        pipe.read_update(size);
                    } else {
                        warn!("dispatcher: READ-UPDATE for unknown path {path}");
                    }
                }
            }
        }

        self.teardown();
    }

    fn handle_write(&self, path: &str, size: u64) {
        match self.ctx.table.get(path) {
            Some(pipe) => {
                if let Err(e) = pipe.recv(size) {
                    error!("dispatcher: recv failed for {path}: {e}");
                }
            }
            None => {
                warn!("dispatcher: WRITE for unknown path {path}, draining {size} bytes");
                let mut remaining = size as usize;
                let mut scratch = [0u8; 4096];
                while remaining > 0 {
                    let chunk = remaining.min(scratch.len());
                    {
                        use std::io::Read;
                        let mut guard = self.ctx.channel.read_half();
                        if guard.read_exact(&mut scratch[..chunk]).is_err() {
                            break;
                        }
                    }
                    remaining -= chunk;
                }
            }
        }
    }

    fn teardown(&self) {
        for pipe in self.ctx.table.all() {
            pipe.force_exit();
        }
    }
}

pub struct StopHandle {
    stopping: Arc<AtomicBool>,
    ctx: Arc<Context>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.ctx.channel.shutdown();
    }
}
