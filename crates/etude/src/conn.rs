// src/conn.rs
//! Per-connection state machine.
//!
//! A [`Connection`] is driven by three calls, each running to completion on
//! whichever worker picked up the readiness event:
//!
//! 1. [`Connection::read`] drains the socket into the read buffer.
//! 2. [`Connection::process`] parses what is buffered and, once a request is
//!    complete, formats the response and rearms for write readiness.
//! 3. [`Connection::write`] sends the response with scatter/gather I/O,
//!    resuming where the previous call stopped.
//!
//! Every path out of these calls rearms the descriptor exactly once or
//! reports that the connection must be closed. The one-shot registration
//! then guarantees that no other worker sees this connection meanwhile.

use crate::buffer::{READ_BUFFER_SIZE, ReadBuffer, WRITE_BUFFER_SIZE, WriteBuffer};
use crate::error::{EtudeError, EtudeResult};
use crate::fs::{self, ServedFile};
use crate::parser::{HttpCode, RequestParser};
use crate::response;
use crate::state::ServerState;
use crate::syscalls::{self, Interest};
use libc::c_int;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Reading = 0,
    Writing = 1,
    Closed = 2,
}

/// Result of [`Connection::process`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processed {
    /// The request is incomplete; rearmed for read readiness.
    NeedMore,
    /// A response is queued; rearmed for write readiness.
    Ready,
}

/// Result of [`Connection::write`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// The socket would block; rearmed for write readiness.
    Pending,
    /// Response sent, state reset, rearmed for read readiness.
    KeepAlive,
    /// Response sent and the next request is already buffered. Not rearmed:
    /// the caller must call [`Connection::process`] again.
    Pipelined,
    /// Response sent and the peer did not ask for keep-alive. Not rearmed:
    /// the caller must close the connection.
    Close,
}

/// Progress through the scatter/gather list: header bytes from the write
/// buffer, then the mapped file when there is one.
#[derive(Debug, Default, Clone, Copy)]
struct SendPlan {
    iov_count: usize,
    header_sent: usize,
    body_sent: usize,
}

pub struct Connection {
    fd: c_int,
    peer: Option<SocketAddr>,
    state: Arc<ServerState>,
    phase: ConnState,
    requests_served: u32,

    read_buf: ReadBuffer,
    parser: RequestParser,
    request_end: Option<usize>,

    write_buf: WriteBuffer,
    file: Option<ServedFile>,
    plan: SendPlan,
}

impl Connection {
    /// Take ownership of an accepted socket and register it one-shot.
    pub fn open(fd: c_int, peer: Option<SocketAddr>, state: Arc<ServerState>) -> EtudeResult<Self> {
        Self::with_capacity(fd, peer, state, READ_BUFFER_SIZE, WRITE_BUFFER_SIZE)
    }

    pub fn with_capacity(
        fd: c_int,
        peer: Option<SocketAddr>,
        state: Arc<ServerState>,
        read_capacity: usize,
        write_capacity: usize,
    ) -> EtudeResult<Self> {
        // Not fatal: only matters for quick restarts while debugging.
        if let Err(e) = syscalls::set_reuseaddr(fd) {
            debug!(fd, error = %e, "SO_REUSEADDR not applied");
        }
        if let Err(e) = state.epoll.register(fd, true) {
            syscalls::close_fd(fd);
            return Err(e);
        }
        state.inc_conn();
        debug!(fd, peer = ?peer, live = state.live_conns(), "connection opened");

        let mut conn = Self {
            fd,
            peer,
            state,
            phase: ConnState::Reading,
            requests_served: 0,
            read_buf: ReadBuffer::new(read_capacity),
            parser: RequestParser::new(),
            request_end: None,
            write_buf: WriteBuffer::new(write_capacity),
            file: None,
            plan: SendPlan::default(),
        };
        conn.reset();
        Ok(conn)
    }

    pub fn fd(&self) -> c_int {
        self.fd
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn conn_state(&self) -> ConnState {
        self.phase
    }

    pub fn is_open(&self) -> bool {
        self.fd != -1
    }

    pub fn requests_served(&self) -> u32 {
        self.requests_served
    }

    pub fn parser(&self) -> &RequestParser {
        &self.parser
    }

    pub fn read_buf(&self) -> &ReadBuffer {
        &self.read_buf
    }

    /// Whether a file mapping is currently held.
    pub fn has_mapping(&self) -> bool {
        self.file.as_ref().is_some_and(|f| f.mapping.is_some())
    }

    /// Start over for the next request. Bytes past the end of a completed
    /// request are kept for pipelining; a request that never parsed is
    /// dropped whole.
    fn reset(&mut self) {
        match self.request_end.take() {
            Some(end) => self.read_buf.recycle(end),
            None => self.read_buf.clear(),
        }
        self.parser.reset();
        self.write_buf.clear();
        self.file = None;
        self.plan = SendPlan::default();
        if self.is_open() {
            self.phase = ConnState::Reading;
        }
    }

    /// Deregister and close the socket. A no-op once closed.
    pub fn close(&mut self, real_close: bool) {
        if real_close && self.is_open() {
            if let Err(e) = self.state.epoll.deregister(self.fd) {
                debug!(fd = self.fd, error = %e, "deregister failed");
            }
            debug!(
                fd = self.fd,
                peer = ?self.peer,
                served = self.requests_served,
                "connection closed"
            );
            self.fd = -1;
            self.phase = ConnState::Closed;
            self.release_file();
            self.state.dec_conn();
        }
    }

    /// Drop the mapping. Whatever of the response is still unsent is
    /// abandoned, so the send plan is marked finished along with it.
    fn release_file(&mut self) {
        self.file = None;
        self.plan = SendPlan {
            iov_count: 1,
            header_sent: self.write_buf.len(),
            body_sent: 0,
        };
    }

    /// Drain the socket until it would block.
    ///
    /// Fails on end of stream, on socket errors, and when the read buffer was
    /// already full; the caller must close the connection then.
    pub fn read(&mut self) -> EtudeResult<()> {
        if !self.is_open() {
            return Err(EtudeError::Closed);
        }
        if self.read_buf.is_full() {
            return Err(EtudeError::ReadBufferFull);
        }

        while !self.read_buf.is_full() {
            match syscalls::read_nonblocking(self.fd, self.read_buf.spare_mut())? {
                None => break,
                Some(0) => return Err(EtudeError::PeerClosed),
                Some(n) => {
                    trace!(fd = self.fd, bytes = n, "read");
                    self.read_buf.commit(n);
                }
            }
        }
        Ok(())
    }

    /// Parse what has been read and queue the response once the request is
    /// complete. On error the connection is already closed.
    pub fn process(&mut self) -> EtudeResult<Processed> {
        if !self.is_open() {
            return Err(EtudeError::Closed);
        }

        let code = self.process_read();
        if code == HttpCode::NoRequest {
            if self.read_buf.is_full() {
                warn!(fd = self.fd, "request does not fit the read buffer");
                self.close(true);
                return Err(EtudeError::ReadBufferFull);
            }
            self.state.epoll.rearm(self.fd, Interest::Readable)?;
            return Ok(Processed::NeedMore);
        }

        if let Err(e) = self.process_write(code) {
            warn!(fd = self.fd, error = %e, "could not build response");
            self.close(true);
            return Err(e);
        }
        self.phase = ConnState::Writing;
        self.requests_served += 1;
        self.state.inc_req();
        self.state.epoll.rearm(self.fd, Interest::Writable)?;
        Ok(Processed::Ready)
    }

    fn process_read(&mut self) -> HttpCode {
        match self.parser.parse(&mut self.read_buf) {
            HttpCode::GetRequest => {
                self.request_end = Some(self.parser.request_end());
                self.do_request()
            }
            other => other,
        }
    }

    fn do_request(&mut self) -> HttpCode {
        let Some(url) = self.parser.url(&self.read_buf) else {
            return HttpCode::InternalError;
        };
        match fs::resolve(self.state.doc_root(), url) {
            Ok(file) => {
                self.file = Some(file);
                HttpCode::FileRequest
            }
            Err(code) => code,
        }
    }

    fn process_write(&mut self, code: HttpCode) -> EtudeResult<()> {
        let keep_alive = self.parser.keep_alive();
        let layout =
            response::process_write(&mut self.write_buf, code, keep_alive, self.file.as_ref())?;
        debug!(fd = self.fd, outcome = ?code, keep_alive, "response queued");
        self.plan = SendPlan {
            iov_count: layout.iov_count(),
            header_sent: 0,
            body_sent: 0,
        };
        Ok(())
    }

    fn body(&self) -> &[u8] {
        match self.file.as_ref().and_then(|f| f.mapping.as_ref()) {
            Some(mapping) if self.plan.iov_count == 2 => mapping.as_slice(),
            _ => &[],
        }
    }

    /// Bytes of the response not yet handed to the socket.
    pub fn bytes_to_send(&self) -> usize {
        (self.write_buf.len() - self.plan.header_sent) + (self.body().len() - self.plan.body_sent)
    }

    /// Move the plan forward by `n` bytes sent, headers first.
    fn advance(&mut self, mut n: usize) {
        let header_left = self.write_buf.len() - self.plan.header_sent;
        let from_header = n.min(header_left);
        self.plan.header_sent += from_header;
        n -= from_header;
        self.plan.body_sent += n;
        debug_assert!(self.plan.body_sent <= self.body().len());
    }

    /// Send the queued response.
    pub fn write(&mut self) -> EtudeResult<WriteStatus> {
        if !self.is_open() {
            return Err(EtudeError::Closed);
        }
        if self.bytes_to_send() == 0 {
            self.release_file();
            return self.finish_keep_alive();
        }

        loop {
            let sent = {
                let header = &self.write_buf.as_bytes()[self.plan.header_sent..];
                let body = &self.body()[self.plan.body_sent..];
                let iov = [header, body];
                syscalls::sendmsg_nonblocking(self.fd, &iov[..self.plan.iov_count])
            };

            let n = match sent {
                Ok(Some(0)) => {
                    self.release_file();
                    return Err(io::Error::from(io::ErrorKind::WriteZero).into());
                }
                Ok(Some(n)) => n,
                Ok(None) => {
                    trace!(fd = self.fd, left = self.bytes_to_send(), "write would block");
                    self.state.epoll.rearm(self.fd, Interest::Writable)?;
                    return Ok(WriteStatus::Pending);
                }
                Err(e) => {
                    self.release_file();
                    return Err(e);
                }
            };
            self.state.add_bytes(n);
            self.advance(n);
            if self.bytes_to_send() > 0 {
                continue;
            }

            self.release_file();
            if !self.parser.keep_alive() {
                return Ok(WriteStatus::Close);
            }
            return self.finish_keep_alive();
        }
    }

    fn finish_keep_alive(&mut self) -> EtudeResult<WriteStatus> {
        self.reset();
        if self.read_buf.read_idx() > 0 {
            return Ok(WriteStatus::Pipelined);
        }
        self.state.epoll.rearm(self.fd, Interest::Readable)?;
        Ok(WriteStatus::KeepAlive)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close(true);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("fd", &self.fd)
            .field("peer", &self.peer)
            .field("phase", &self.phase)
            .field("read_buf", &self.read_buf)
            .field("write_buf", &self.write_buf)
            .field("bytes_to_send", &self.bytes_to_send())
            .finish()
    }
}
