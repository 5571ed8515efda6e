//! The open files table: the map from path to live [`Pipe`] shared by the
//! VFS adapter and the dispatcher.
//!
//! Lock order is strict and one-directional for the *acquisition* path:
//! the table mutex is never held while blocking on a pipe's own mutex.
//! `close`/`close_update` remove an entry while still holding that pipe's
//! mutex, which is safe because the table's own critical sections never
//! themselves wait on a pipe mutex — there is no cycle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::channel::Channel;
use crate::pipe::Pipe;

pub struct OpenFilesTable {
    files: Mutex<HashMap<String, Arc<Pipe>>>,
    channel: Arc<Channel>,
    local_capacity: usize,
}

impl OpenFilesTable {
    pub fn new(channel: Arc<Channel>, local_capacity: usize) -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
            channel,
            local_capacity,
        }
    }

    /// Returns the pipe for `path`, creating (and inserting) it if absent.
    /// The bool is `true` when this call created the entry.
    pub fn get_or_create(&self, path: &str) -> (Arc<Pipe>, bool) {
        let mut files = self.files.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(pipe) = files.get(path) {
            return (pipe.clone(), false);
        }
        let pipe = Pipe::new(path, self.local_capacity, self.channel.clone());
        files.insert(path.to_string(), pipe.clone());
        (pipe, true)
    }

    pub fn get(&self, path: &str) -> Option<Arc<Pipe>> {
        let files = self.files.lock().unwrap_or_else(|p| p.into_inner());
        files.get(path).cloned()
    }

    pub fn remove(&self, path: &str) {
        let mut files = self.files.lock().unwrap_or_else(|p| p.into_inner());
        files.remove(path);
    }

    /// Every live pipe, used for teardown broadcasting `force_exit`.
    pub fn all(&self) -> Vec<Arc<Pipe>> {
        let files = self.files.lock().unwrap_or_else(|p| p.into_inner());
        files.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};

    fn test_channel() -> Arc<Channel> {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        std::mem::drop(server);
        Arc::new(Channel::new(client, 64).unwrap())
    }

    #[test]
    fn get_or_create_is_idempotent_by_path() {
        let table = OpenFilesTable::new(test_channel(), 64);
        let (a, created_a) = table.get_or_create("/p");
        let (b, created_b) = table.get_or_create("/p");
        assert!(created_a);
        assert!(!created_b);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn remove_drops_the_entry() {
        let table = OpenFilesTable::new(test_channel(), 64);
        table.get_or_create("/p");
        table.remove("/p");
        assert!(table.get("/p").is_none());
    }
}
