//! Descriptor identity index
//!
//! Bidirectional `(pid, fd) <-> socket` index for hooks that only hold a
//! file descriptor (sendfile). Populated the first time a descriptor is
//! resolved to a TCP stream socket and cleared when that socket closes.

use crate::bounded::BoundedMap;
use crate::error::Result;
use crate::sock::{SockId, Socket, AF_INET, AF_INET6};
use crate::telemetry::Table;
use conntrace_common::PidFd;

pub struct SockFdIndex {
    sock_by_pid_fd: BoundedMap<PidFd, SockId>,
    pid_fd_by_sock: BoundedMap<SockId, PidFd>,
}

impl SockFdIndex {
    pub fn new(capacity: usize) -> Self {
        Self {
            sock_by_pid_fd: BoundedMap::new(Table::SockByPidFd, capacity),
            pid_fd_by_sock: BoundedMap::new(Table::PidFdBySock, capacity),
        }
    }

    /// Only stream sockets of an inet family are indexed
    pub fn is_indexable(socket: &Socket) -> bool {
        let Some(family) = socket.ops_family else {
            return false;
        };
        socket.is_stream() && (family == AF_INET || family == AF_INET6) && socket.sk.is_some()
    }

    /// Index `pid_fd <-> sock` unless the descriptor is already indexed.
    ///
    /// Returns `Ok(false)` when an entry already existed. Both directions
    /// are written or neither: if the second insert fails the first is
    /// rolled back.
    pub fn register_if_absent(&self, pid_fd: PidFd, sock: SockId) -> Result<bool> {
        if self.sock_by_pid_fd.contains_key(&pid_fd) {
            return Ok(false);
        }

        let previous = self.pid_fd_by_sock.insert(sock, pid_fd)?;
        match self.sock_by_pid_fd.insert_if_absent(pid_fd, sock) {
            Ok(true) => Ok(true),
            Ok(false) => {
                self.restore(sock, previous);
                Ok(false)
            }
            Err(e) => {
                self.restore(sock, previous);
                Err(e)
            }
        }
    }

    /// Socket currently named by `pid_fd`
    pub fn resolve(&self, pid_fd: &PidFd) -> Option<SockId> {
        self.sock_by_pid_fd.get(pid_fd)
    }

    /// Descriptor currently naming `sock`
    pub fn pid_fd(&self, sock: &SockId) -> Option<PidFd> {
        self.pid_fd_by_sock.get(sock)
    }

    /// Remove both directions for `sock`
    pub fn remove_by_sock(&self, sock: &SockId) {
        let Some(pid_fd) = self.pid_fd_by_sock.remove(sock) else {
            return;
        };
        // the descriptor may have been reused for another socket already
        if self.sock_by_pid_fd.get(&pid_fd) == Some(*sock) {
            self.sock_by_pid_fd.remove(&pid_fd);
        }
    }

    pub fn len(&self) -> usize {
        self.sock_by_pid_fd.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn restore(&self, sock: SockId, previous: Option<PidFd>) {
        match previous {
            Some(pid_fd) => {
                let _ = self.pid_fd_by_sock.insert(sock, pid_fd);
            }
            None => {
                self.pid_fd_by_sock.remove(&sock);
            }
        }
    }
}
