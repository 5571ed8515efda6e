//! Shared state handed to both the dispatcher thread and the VFS adapter.

use std::sync::Arc;

use crate::channel::Channel;
use crate::config::Options;
use crate::openfiles::OpenFilesTable;

pub struct Context {
    pub table: OpenFilesTable,
    pub channel: Arc<Channel>,
    pub options: Options,
}

impl Context {
    pub fn new(channel: Channel, options: Options) -> Self {
        let channel = Arc::new(channel);
        let table = OpenFilesTable::new(channel.clone(), options.pipe_capacity);
        Self {
            table,
            channel,
            options,
        }
    }
}
