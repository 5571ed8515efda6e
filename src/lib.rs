//! `netpipefs`: a FUSE filesystem whose files are bidirectional named pipes
//! spanning two hosts over a single TCP channel, with credit-based flow
//! control standing in for the kernel's normal pipe buffer.

pub mod cbuf;
pub mod channel;
pub mod codec;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod fs;
pub mod handshake;
pub mod openfiles;
pub mod pipe;
