//! The FUSE adapter (§4.19, §6.1): a thin translation from kernel VFS
//! callbacks to [`Pipe`] operations. All the interesting state machinery
//! lives in `pipe`; this module only knows how to map `fuser`'s
//! inode-based protocol onto `path`-keyed pipes and back.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::Arc;
use std::time::Duration;

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use log::{debug, warn};

use crate::context::Context;
use crate::pipe::{OpenMode, Pipe};

const ROOT_INO: u64 = 1;
const TTL: Duration = Duration::from_secs(1);

fn dir_attr(ino: u64) -> FileAttr {
    let now = std::time::UNIX_EPOCH;
    FileAttr {
        ino,
        size: 0,
        blocks: 0,
        atime: now,
        mtime: now,
        ctime: now,
        crtime: now,
        kind: FileType::Directory,
        perm: 0o755,
        nlink: 2,
        uid: 0,
        gid: 0,
        rdev: 0,
        blksize: 512,
        flags: 0,
    }
}

fn file_attr(ino: u64) -> FileAttr {
    let now = std::time::UNIX_EPOCH;
    FileAttr {
        ino,
        size: 0,
        blocks: 0,
        atime: now,
        mtime: now,
        ctime: now,
        crtime: now,
        kind: FileType::RegularFile,
        perm: 0o444,
        nlink: 1,
        uid: 0,
        gid: 0,
        rdev: 0,
        blksize: 512,
        flags: 0,
    }
}

struct OpenHandle {
    pipe: Arc<Pipe>,
    mode: OpenMode,
}

/// Implements [`fuser::Filesystem`] over a shared [`Context`]. Every
/// `Filesystem` callback takes `&mut self`, so `fuser` already serializes
/// access to the inode/handle tables below; only the pipes themselves need
/// their own locking.
pub struct NetPipeFs {
    ctx: Arc<Context>,
    ino_to_path: HashMap<u64, String>,
    path_to_ino: HashMap<String, u64>,
    next_ino: u64,
    handles: HashMap<u64, OpenHandle>,
    next_fh: u64,
}

impl NetPipeFs {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            ino_to_path: HashMap::new(),
            path_to_ino: HashMap::new(),
            next_ino: 2,
            handles: HashMap::new(),
            next_fh: 1,
        }
    }

    fn ino_for_path(&mut self, path: &str) -> u64 {
        if let Some(&ino) = self.path_to_ino.get(path) {
            return ino;
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.path_to_ino.insert(path.to_string(), ino);
        self.ino_to_path.insert(ino, path.to_string());
        ino
    }
}

impl Filesystem for NetPipeFs {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        if parent != ROOT_INO {
            reply.error(libc::ENOENT);
            return;
        }
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let path = format!("/{name}");
        let ino = self.ino_for_path(&path);
        reply.entry(&TTL, &file_attr(ino), 0);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        if ino == ROOT_INO {
            reply.attr(&TTL, &dir_attr(ROOT_INO));
        } else if self.ino_to_path.contains_key(&ino) {
            reply.attr(&TTL, &file_attr(ino));
        } else {
            reply.error(libc::ENOENT);
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        _size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<std::time::SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<std::time::SystemTime>,
        _chgtime: Option<std::time::SystemTime>,
        _bkuptime: Option<std::time::SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        if ino == ROOT_INO {
            reply.attr(&TTL, &dir_attr(ROOT_INO));
        } else {
            reply.attr(&TTL, &file_attr(ino));
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(path) = self.ino_to_path.get(&ino).cloned() else {
            reply.error(libc::ENOENT);
            return;
        };

        let accmode = flags & libc::O_ACCMODE;
        let mode = match accmode {
            libc::O_RDONLY => OpenMode::ReadOnly,
            libc::O_WRONLY => OpenMode::WriteOnly,
            _ => {
                reply.error(libc::EINVAL);
                return;
            }
        };
        let nonblock = flags & libc::O_NONBLOCK != 0;

        match Pipe::open_local(&self.ctx.table, &path, mode, nonblock) {
            Ok(pipe) => {
                let fh = self.next_fh;
                self.next_fh += 1;
                self.handles.insert(fh, OpenHandle { pipe, mode });
                debug!("open {path} ({mode:?}) -> fh {fh}");
                reply.opened(fh, fuser::consts::FOPEN_DIRECT_IO);
            }
            Err(e) => {
                warn!("open {path} failed: {e}");
                reply.error(e.to_errno());
            }
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _offset: i64,
        size: u32,
        flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(handle) = self.handles.get(&fh) else {
            reply.error(libc::EBADF);
            return;
        };
        let mut buf = vec![0u8; size as usize];
        let nonblock = flags & libc::O_NONBLOCK != 0;
        match handle.pipe.read(&mut buf, nonblock) {
            Ok(n) => reply.data(&buf[..n]),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _offset: i64,
        data: &[u8],
        _write_flags: u32,
        flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Some(handle) = self.handles.get(&fh) else {
            reply.error(libc::EBADF);
            return;
        };
        let nonblock = flags & libc::O_NONBLOCK != 0;
        match handle.pipe.send(data, nonblock) {
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        if let Some(handle) = self.handles.remove(&fh) {
            if let Err(e) = handle.pipe.close(&self.ctx.table, handle.mode) {
                warn!("close failed for fh {fh}: {e}");
            }
        }
        reply.ok();
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        if ino != ROOT_INO {
            reply.error(libc::ENOENT);
            return;
        }
        let entries = [
            (ROOT_INO, FileType::Directory, "."),
            (ROOT_INO, FileType::Directory, ".."),
        ];
        for (i, (ino, kind, name)) in entries.iter().enumerate().skip(offset as usize) {
            if reply.add(*ino, (i + 1) as i64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }
}
