// src/state.rs
use crate::syscalls::Epoll;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Process-wide state every connection refers to.
///
/// Connections are handled on many worker threads at once, so the
/// counters are atomics rather than plain integers.
#[repr(C, align(64))]
#[derive(Debug)]
pub struct ServerState {
    pub epoll: Epoll,
    doc_root: PathBuf,
    live_conns: AtomicUsize,
    req_count: AtomicUsize,
    bytes_sent: AtomicUsize,
}

impl ServerState {
    pub fn new(epoll: Epoll, doc_root: impl Into<PathBuf>) -> Self {
        Self {
            epoll,
            doc_root: doc_root.into(),
            live_conns: AtomicUsize::new(0),
            req_count: AtomicUsize::new(0),
            bytes_sent: AtomicUsize::new(0),
        }
    }

    pub fn doc_root(&self) -> &Path {
        &self.doc_root
    }

    pub fn inc_conn(&self) {
        self.live_conns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_conn(&self) {
        self.live_conns.fetch_sub(1, Ordering::Relaxed);
    }

    /// Connections currently open.
    pub fn live_conns(&self) -> usize {
        self.live_conns.load(Ordering::Relaxed)
    }

    pub fn inc_req(&self) {
        self.req_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn req_count(&self) -> usize {
        self.req_count.load(Ordering::Relaxed)
    }

    pub fn add_bytes(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn bytes_sent(&self) -> usize {
        self.bytes_sent.load(Ordering::Relaxed)
    }
}
