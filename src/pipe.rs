//! The per-file state machine: the heart of the distributed pipe engine.
//!
//! A [`Pipe`] is shared between (up to) two local endpoints and mediates
//! everything that touches `path`: local buffering, remote credit, and the
//! reader/writer rendezvous. Two call paths reach it — the VFS adapter
//! (`open`/`send`/`read`/`flush`/`close`/`poll`) and the dispatcher
//! (`open_update`/`recv`/`read_request`/`read_update`/`close_update`/
//! `force_exit`) — and they serialize on the same [`Mutex`].

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, Mutex};

use log::{debug, error};

use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::openfiles::OpenFilesTable;

/// The access mode a local (or remote) endpoint opened a pipe in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    WriteOnly,
}

/// The lightweight error a pending request can carry; kept separate from
/// [`Error`] because [`Error::Io`] isn't `Copy`/`Clone` and requests never
/// need to carry a raw `io::Error` — only the two outcomes the dispatcher
/// can observe while pushing queued data.
#[derive(Debug, Clone, Copy)]
enum ReqError {
    BrokenPipe,
    ConnectionReset,
}

impl From<ReqError> for Error {
    fn from(e: ReqError) -> Self {
        match e {
            ReqError::BrokenPipe => Error::BrokenPipe,
            ReqError::ConnectionReset => Error::ConnectionReset,
        }
    }
}

/// A pending read or write request. For a write request, `staging` holds
/// the remaining bytes still to be sent; for a read request, it is a
/// zeroed buffer of the requested size that the dispatcher fills in as data
/// arrives. Owned jointly by the queue it's enqueued in and the blocked
/// caller's stack frame, via `Arc<Mutex<_>>`.
struct PendingRequest {
    staging: Vec<u8>,
    bytes_processed: usize,
    error: Option<ReqError>,
}

impl PendingRequest {
    fn new(staging: Vec<u8>) -> Self {
        Self {
            staging,
            bytes_processed: 0,
            error: None,
        }
    }

    fn size(&self) -> usize {
        self.staging.len()
    }
}

type ReqHandle = Arc<Mutex<PendingRequest>>;

struct PipeState {
    buffer: crate::cbuf::CircularBuffer,
    remote_max: u64,
    remote_size: u64,
    readers: u32,
    writers: u32,
    open_mode: Option<OpenMode>,
    wr_reqs: VecDeque<ReqHandle>,
    rd_reqs: VecDeque<ReqHandle>,
    poll_handles: Vec<u64>,
    force_exit: bool,
}

/// The per-path pipe object (§3, §4.4–§4.17).
pub struct Pipe {
    path: String,
    channel: Arc<Channel>,
    state: Mutex<PipeState>,
    can_open: Condvar,
    wr: Condvar,
    rd: Condvar,
}

impl Pipe {
    pub(crate) fn new(path: &str, local_cap: usize, channel: Arc<Channel>) -> Arc<Self> {
        let remote_max = channel.remote_capacity;
        Arc::new(Self {
            path: path.to_string(),
            channel,
            state: Mutex::new(PipeState {
                buffer: crate::cbuf::CircularBuffer::new(local_cap),
                remote_max,
                remote_size: 0,
                readers: 0,
                writers: 0,
                open_mode: None,
                wr_reqs: VecDeque::new(),
                rd_reqs: VecDeque::new(),
                poll_handles: Vec::new(),
                force_exit: false,
            }),
            can_open: Condvar::new(),
            wr: Condvar::new(),
            rd: Condvar::new(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn undo_counter(state: &mut PipeState, mode: OpenMode) {
        match mode {
            OpenMode::ReadOnly => {
                state.readers -= 1;
                if state.readers == 0 {
                    state.open_mode = None;
                }
            }
            OpenMode::WriteOnly => {
                state.writers -= 1;
                if state.writers == 0 {
                    state.open_mode = None;
                }
            }
        }
    }

    fn increment_counter(state: &mut PipeState, mode: OpenMode) {
        match mode {
            OpenMode::ReadOnly => state.readers += 1,
            OpenMode::WriteOnly => state.writers += 1,
        }
    }

    // ---- §4.4 local open ----------------------------------------------

    /// Opens `path` locally for `mode`, creating the pipe on first use.
    /// Blocks (unless `nonblock`) until a matching remote (or local)
    /// endpoint has opened the other side.
    pub fn open_local(
        table: &OpenFilesTable,
        path: &str,
        mode: OpenMode,
        nonblock: bool,
    ) -> Result<Arc<Pipe>> {
        let (pipe, just_created) = table.get_or_create(path);
        match pipe.do_open(mode, nonblock) {
            Ok(()) => Ok(pipe),
            Err(e) => {
                if just_created {
                    let state = pipe.state.lock().unwrap_or_else(|p| p.into_inner());
                    if state.readers == 0 && state.writers == 0 {
                        drop(state);
                        table.remove(path);
                    }
                }
                Err(e)
            }
        }
    }

    fn do_open(&self, mode: OpenMode, nonblock: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());

        if state.force_exit {
            return Err(Error::NoSuchEntry);
        }

        if let Some(existing) = state.open_mode {
            if existing != mode {
                return Err(Error::PermissionDenied);
            }
        }

        Self::increment_counter(&mut state, mode);

        if nonblock && (state.readers == 0 || state.writers == 0) {
            Self::undo_counter(&mut state, mode);
            return Err(Error::TryAgain);
        }

        self.can_open.notify_all();

        if self.channel.send_open(&self.path, mode).is_err() {
            Self::undo_counter(&mut state, mode);
            return Err(Error::BrokenPipe);
        }

        state.open_mode = Some(mode);

        while !state.force_exit && (state.readers == 0 || state.writers == 0) {
            state = self
                .can_open
                .wait(state)
                .unwrap_or_else(|p| p.into_inner());
        }

        if state.force_exit {
            Self::undo_counter(&mut state, mode);
            return Err(Error::NoSuchEntry);
        }

        debug!("opened {} in {:?} mode", self.path, mode);
        Ok(())
    }

    // ---- §4.5 remote open (dispatcher path) ----------------------------

    /// Invoked when the peer's `OPEN` message arrives. Never blocks.
    pub fn open_update(table: &OpenFilesTable, path: &str, mode: OpenMode) -> Arc<Pipe> {
        let (pipe, _just_created) = table.get_or_create(path);
        {
            let mut state = pipe.state.lock().unwrap_or_else(|p| p.into_inner());
            Self::increment_counter(&mut state, mode);
            debug!("peer opened {} in {:?} mode", pipe.path, mode);
        }
        pipe.can_open.notify_all();
        pipe
    }

    // ---- internal send helpers ------------------------------------------

    fn flush_buffer_locked(&self, state: &mut PipeState) -> io::Result<u64> {
        let available = state.remote_max.saturating_sub(state.remote_size);
        let to_send = (state.buffer.len() as u64).min(available);
        if to_send == 0 {
            return Ok(0);
        }
        let mut tmp = vec![0u8; to_send as usize];
        let got = state.buffer.get(&mut tmp);
        self.channel.send_write(&self.path, &tmp[..got])?;
        state.remote_size += got as u64;
        Ok(got as u64)
    }

    fn direct_send_locked(&self, state: &mut PipeState, data: &[u8]) -> io::Result<u64> {
        let available = state.remote_max.saturating_sub(state.remote_size);
        let to_send = (data.len() as u64).min(available);
        if to_send == 0 {
            return Ok(0);
        }
        self.channel.send_write(&self.path, &data[..to_send as usize])?;
        state.remote_size += to_send;
        Ok(to_send)
    }

    fn notify_poll_handles_locked(state: &mut PipeState) {
        state.poll_handles.clear();
    }

    /// §4.11: push as much queued write data to the peer (and, failing
    /// that, into the local buffer) as current credit and space allow.
    /// Called whenever the peer grants new credit or acknowledges data.
    fn push_queued_writes_locked(&self, state: &mut PipeState) -> u64 {
        let mut total = 0u64;

        match self.flush_buffer_locked(state) {
            Ok(n) => total += n,
            Err(e) => {
                error!("send failed while flushing buffer for {}: {e}", self.path);
                return total;
            }
        }

        loop {
            let available = state.remote_max.saturating_sub(state.remote_size);
            if available == 0 {
                break;
            }
            let Some(front) = state.wr_reqs.front().cloned() else {
                break;
            };
            let (start, to_send, data) = {
                let req = front.lock().unwrap_or_else(|p| p.into_inner());
                let remaining = req.size() - req.bytes_processed;
                if remaining == 0 {
                    (0, 0, Vec::new())
                } else {
                    let to_send = remaining.min(available as usize);
                    let start = req.bytes_processed;
                    (start, to_send, req.staging[start..start + to_send].to_vec())
                }
            };
            if to_send == 0 {
                // front request is already fully processed; reap it and retry
                let completed = {
                    let req = front.lock().unwrap_or_else(|p| p.into_inner());
                    req.bytes_processed == req.size()
                };
                if completed {
                    state.wr_reqs.pop_front();
                    continue;
                }
                break;
            }
            match self.channel.send_write(&self.path, &data) {
                Ok(()) => {
                    let completed = {
                        let mut req = front.lock().unwrap_or_else(|p| p.into_inner());
                        req.bytes_processed = start + to_send;
                        req.bytes_processed == req.size()
                    };
                    state.remote_size += to_send as u64;
                    total += to_send as u64;
                    if completed {
                        state.wr_reqs.pop_front();
                    } else {
                        break;
                    }
                }
                Err(e) => {
                    error!("send failed for queued write on {}: {e}", self.path);
                    let mut req = front.lock().unwrap_or_else(|p| p.into_inner());
                    req.error = Some(ReqError::ConnectionReset);
                    drop(req);
                    state.wr_reqs.pop_front();
                    self.wr.notify_all();
                    return total;
                }
            }
        }

        while let Some(front) = state.wr_reqs.front().cloned() {
            if state.buffer.is_full() {
                break;
            }
            let (start, remaining) = {
                let req = front.lock().unwrap_or_else(|p| p.into_inner());
                (req.bytes_processed, req.size() - req.bytes_processed)
            };
            if remaining == 0 {
                state.wr_reqs.pop_front();
                continue;
            }
            let staged: Vec<u8> = {
                let req = front.lock().unwrap_or_else(|p| p.into_inner());
                req.staging[start..start + remaining].to_vec()
            };
            let n = state.buffer.put(&staged);
            let completed = {
                let mut req = front.lock().unwrap_or_else(|p| p.into_inner());
                req.bytes_processed += n;
                req.bytes_processed == req.size()
            };
            total += n as u64;
            if completed {
                state.wr_reqs.pop_front();
            } else {
                break;
            }
        }

        if total > 0 {
            Self::notify_poll_handles_locked(state);
        }

        total
    }

    // ---- §4.6 local write -----------------------------------------------

    pub fn send(&self, data: &[u8], nonblock: bool) -> Result<usize> {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());

        if state.force_exit || state.readers == 0 {
            return Err(Error::BrokenPipe);
        }

        let flushed = self
            .flush_buffer_locked(&mut state)
            .map_err(|_| Error::BrokenPipe)?;
        if flushed > 0 {
            self.wr.notify_all();
        }

        let mut sent = 0usize;
        if state.buffer.is_empty() {
            let direct = self
                .direct_send_locked(&mut state, data)
                .map_err(|_| Error::BrokenPipe)?;
            sent += direct as usize;
        }

        if sent == data.len() {
            return Ok(sent);
        }

        let put = state.buffer.put(&data[sent..]);
        sent += put;

        if sent == data.len() || nonblock {
            if sent == 0 && nonblock {
                return Err(Error::TryAgain);
            }
            return Ok(sent);
        }

        let remainder = data[sent..].to_vec();
        let req: ReqHandle = Arc::new(Mutex::new(PendingRequest::new(remainder)));
        state.wr_reqs.push_back(req.clone());

        loop {
            let (done, err) = {
                let r = req.lock().unwrap_or_else(|p| p.into_inner());
                (r.bytes_processed == r.size(), r.error)
            };
            if state.force_exit || done || err.is_some() {
                break;
            }
            state = self.wr.wait(state).unwrap_or_else(|p| p.into_inner());
        }

        let (bytes_processed, error) = {
            let r = req.lock().unwrap_or_else(|p| p.into_inner());
            (r.bytes_processed, r.error)
        };

        if bytes_processed == 0 && (state.force_exit || error.is_some()) {
            return Err(error.map(Error::from).unwrap_or(Error::BrokenPipe));
        }

        Ok(sent + bytes_processed)
    }

    // ---- §4.7 local read --------------------------------------------------

    pub fn read(&self, buf: &mut [u8], nonblock: bool) -> Result<usize> {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());

        if state.force_exit {
            return Err(Error::BrokenPipe);
        }

        let mut read = state.buffer.get(buf);
        if read > 0 {
            self.channel
                .send_read_update(&self.path, read as u64)
                .map_err(|_| Error::BrokenPipe)?;
        }

        if read == buf.len() || nonblock {
            if read == 0 && nonblock {
                return Err(Error::TryAgain);
            }
            return Ok(read);
        }

        if state.writers == 0 {
            return Ok(read);
        }

        let remaining = buf.len() - read;
        let req: ReqHandle = Arc::new(Mutex::new(PendingRequest::new(vec![0u8; remaining])));
        state.rd_reqs.push_back(req.clone());

        if self
            .channel
            .send_read_request(&self.path, remaining as u64)
            .is_err()
        {
            state.rd_reqs.retain(|r| !Arc::ptr_eq(r, &req));
            return Err(Error::BrokenPipe);
        }

        loop {
            let (done, err) = {
                let r = req.lock().unwrap_or_else(|p| p.into_inner());
                (r.bytes_processed == r.size(), r.error)
            };
            if state.force_exit || done || err.is_some() {
                break;
            }
            state = self.rd.wait(state).unwrap_or_else(|p| p.into_inner());
        }

        let (bytes_processed, error, staging) = {
            let r = req.lock().unwrap_or_else(|p| p.into_inner());
            (r.bytes_processed, r.error, r.staging.clone())
        };

        if bytes_processed > 0 {
            buf[read..read + bytes_processed].copy_from_slice(&staging[..bytes_processed]);
        }

        if bytes_processed == 0 && (state.force_exit || error.is_some()) {
            return match error {
                Some(ReqError::BrokenPipe) => Ok(read),
                Some(other) => Err(other.into()),
                None => Err(Error::BrokenPipe),
            };
        }

        read += bytes_processed;
        Ok(read)
    }

    // ---- §4.8 recv (dispatcher path for incoming WRITE) ------------------

    /// Consumes `size` bytes of WRITE payload still pending on the channel's
    /// read half, routing them to waiting readers first and into the local
    /// buffer (readahead) for whatever's left over.
    pub fn recv(&self, size: u64) -> io::Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let mut wakeup = false;

        // Drain already-buffered bytes into pending read requests.
        loop {
            if state.buffer.is_empty() {
                break;
            }
            let Some(front) = state.rd_reqs.front().cloned() else {
                break;
            };
            let (start, remaining) = {
                let req = front.lock().unwrap_or_else(|p| p.into_inner());
                (req.bytes_processed, req.size() - req.bytes_processed)
            };
            if remaining == 0 {
                state.rd_reqs.pop_front();
                continue;
            }
            let mut tmp = vec![0u8; remaining];
            let n = state.buffer.get(&mut tmp);
            let completed = {
                let mut req = front.lock().unwrap_or_else(|p| p.into_inner());
                req.staging[start..start + n].copy_from_slice(&tmp[..n]);
                req.bytes_processed += n;
                req.bytes_processed == req.size()
            };
            if n > 0 {
                self.channel.send_read_update(&self.path, n as u64)?;
            }
            if completed {
                wakeup = true;
                state.rd_reqs.pop_front();
            } else {
                break;
            }
        }

        // Read directly off the wire into pending read requests while the
        // buffer has nothing left to offer.
        let mut remaining = size as usize;
        loop {
            if remaining == 0 || !state.buffer.is_empty() {
                break;
            }
            let Some(front) = state.rd_reqs.front().cloned() else {
                break;
            };
            let (start, req_remaining) = {
                let req = front.lock().unwrap_or_else(|p| p.into_inner());
                (req.bytes_processed, req.size() - req.bytes_processed)
            };
            if req_remaining == 0 {
                state.rd_reqs.pop_front();
                continue;
            }
            let to_read = req_remaining.min(remaining);
            {
                let mut req = front.lock().unwrap_or_else(|p| p.into_inner());
                self.channel
                    .read_payload_exact(&mut req.staging[start..start + to_read])?;
                req.bytes_processed += to_read;
            }
            remaining -= to_read;
            self.channel.send_read_update(&self.path, to_read as u64)?;
            let completed = {
                let req = front.lock().unwrap_or_else(|p| p.into_inner());
                req.bytes_processed == req.size()
            };
            if completed {
                wakeup = true;
                state.rd_reqs.pop_front();
            } else {
                break;
            }
        }

        // Whatever's left (no one waiting) goes into the local buffer.
        let mut left = remaining;
        while left > 0 {
            let n = {
                let mut guard = self.channel.read_half();
                state.buffer.read_from(&mut *guard, left)?
            };
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection lost while reading ahead",
                ));
            }
            left -= n;
            if left > 0 && state.buffer.is_full() {
                error!(
                    "protocol violation: peer over-sent credit for {} ({} bytes undeliverable)",
                    self.path, left
                );
                break;
            }
        }

        if wakeup {
            self.rd.notify_all();
        }
        Self::notify_poll_handles_locked(&mut state);

        Ok(())
    }

    // ---- §4.9 / §4.10 credit updates (dispatcher path) -------------------

    pub fn read_request(&self, size: u64) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.remote_max += size;
        debug!("{} granted {} bytes of credit", self.path, size);
        let moved = self.push_queued_writes_locked(&mut state);
        if moved > 0 {
            self.wr.notify_all();
        }
    }

    pub fn read_update(&self, size: u64) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.remote_max = state.remote_max.saturating_sub(size);
        state.remote_size = state.remote_size.saturating_sub(size);
        let moved = self.push_queued_writes_locked(&mut state);
        if moved > 0 {
            self.wr.notify_all();
        }
    }

    // ---- §4.12 flush ------------------------------------------------------

    pub fn flush(&self, nonblock: bool) -> Result<usize> {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());

        if state.force_exit || state.readers == 0 {
            return Err(Error::BrokenPipe);
        }

        let flushed = self
            .flush_buffer_locked(&mut state)
            .map_err(|_| Error::BrokenPipe)?;
        if flushed > 0 {
            self.wr.notify_all();
        }

        let mut sent = flushed as usize;
        let leftover = state.buffer.len();
        if leftover == 0 || nonblock {
            return Ok(sent);
        }

        let mut data = vec![0u8; leftover];
        state.buffer.get(&mut data);

        let req: ReqHandle = Arc::new(Mutex::new(PendingRequest::new(data)));
        state.wr_reqs.push_back(req.clone());

        loop {
            let (done, err) = {
                let r = req.lock().unwrap_or_else(|p| p.into_inner());
                (r.bytes_processed == r.size(), r.error)
            };
            if state.force_exit || done || err.is_some() {
                break;
            }
            state = self.wr.wait(state).unwrap_or_else(|p| p.into_inner());
        }

        let (bytes_processed, error) = {
            let r = req.lock().unwrap_or_else(|p| p.into_inner());
            (r.bytes_processed, r.error)
        };

        if bytes_processed == 0 && (state.force_exit || error.is_some()) {
            return Err(error.map(Error::from).unwrap_or(Error::BrokenPipe));
        }

        sent += bytes_processed;
        Ok(sent)
    }

    // ---- §4.13 / §4.14 close ----------------------------------------------

    pub fn close(&self, table: &OpenFilesTable, mode: OpenMode) -> Result<()> {
        let writers_now_zero = {
            let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            match mode {
                OpenMode::WriteOnly => {
                    state.writers -= 1;
                    state.writers == 0
                }
                OpenMode::ReadOnly => {
                    state.readers -= 1;
                    false
                }
            }
        };

        if writers_now_zero {
            // Best-effort drain; errors here are swallowed (drain semantics).
            let _ = self.flush(false);
        }

        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let send_result = self.channel.send_close(&self.path, mode);
        let done = state.readers == 0 && state.writers == 0;
        drop(state);

        if done {
            debug!("closing {} (no endpoints remain)", self.path);
            table.remove(&self.path);
        }

        send_result.map_err(|_| Error::BrokenPipe)
    }

    pub fn close_update(&self, table: &OpenFilesTable, mode: OpenMode) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());

        match mode {
            OpenMode::WriteOnly => {
                state.writers -= 1;
                if state.writers == 0 {
                    for req in state.rd_reqs.drain(..) {
                        req.lock().unwrap_or_else(|p| p.into_inner()).error =
                            Some(ReqError::BrokenPipe);
                    }
                    self.rd.notify_all();
                }
            }
            OpenMode::ReadOnly => {
                state.readers -= 1;
                if state.readers == 0 {
                    for req in state.wr_reqs.drain(..) {
                        req.lock().unwrap_or_else(|p| p.into_inner()).error =
                            Some(ReqError::BrokenPipe);
                    }
                    self.wr.notify_all();
                }
            }
        }

        Self::notify_poll_handles_locked(&mut state);

        let done = state.readers == 0 && state.writers == 0;
        drop(state);
        if done {
            table.remove(&self.path);
        }
    }

    // ---- §4.15 force-exit ---------------------------------------------

    pub fn force_exit(&self) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.force_exit = true;
        drop(state);
        self.can_open.notify_all();
        self.wr.notify_all();
        self.rd.notify_all();
    }

    // ---- §4.16 poll --------------------------------------------------

    /// Registers `handle` for the next state-change notification and
    /// returns the poll events ready *right now*.
    pub fn poll(&self, handle: u64) -> i16 {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.poll_handles.push(handle);

        let mut events = 0i16;
        match state.open_mode {
            Some(OpenMode::ReadOnly) => {
                if !state.buffer.is_empty() || state.writers > 0 {
                    events |= libc::POLLIN as i16;
                }
                if state.writers == 0 && state.buffer.is_empty() {
                    events |= libc::POLLHUP as i16;
                }
            }
            Some(OpenMode::WriteOnly) => {
                if state.readers == 0 {
                    events |= libc::POLLERR as i16;
                } else {
                    let avail = state.remote_max.saturating_sub(state.remote_size)
                        + state.buffer.free_space() as u64;
                    if avail > 0 {
                        events |= libc::POLLOUT as i16;
                    }
                }
            }
            None => {}
        }
        events
    }
}
