// src/server.rs
use crate::config::Config;
use crate::conn::{Connection, WriteStatus};
use crate::error::EtudeResult;
use crate::pool::ThreadPool;
use crate::state::ServerState;
use crate::syscalls::{self, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP, Epoll, epoll_event};
use crate::table::ConnectionTable;
use libc::c_int;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};

/// Readiness events handled per wakeup.
const MAX_EVENT_NUMBER: usize = 10_000;

/// Poll timeout, so the shutdown flag is seen promptly.
const POLL_TIMEOUT_MS: i32 = 100;

const BUSY_REPLY: &[u8] = b"Internal server busy";

/// Work handed to the pool: which descriptor became ready, and for what.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    Readable(c_int),
    Writable(c_int),
}

impl Task {
    pub fn fd(self) -> c_int {
        match self {
            Task::Readable(fd) | Task::Writable(fd) => fd,
        }
    }
}

pub struct Server {
    config: Config,
    shutdown: Arc<AtomicBool>,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Use `flag` to stop the event loop. The loop exits within one poll
    /// timeout after it is set.
    pub fn shutdown_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown = flag;
        self
    }

    /// Create the listener, the epoll instance, the connection table and the
    /// worker pool.
    pub fn bind(self) -> EtudeResult<BoundServer> {
        let Server { config, shutdown } = self;

        let table = Arc::new(ConnectionTable::new(config.max_fd)?);
        let pool = {
            let table = table.clone();
            ThreadPool::new(
                config.workers,
                config.max_requests,
                config.pin_workers,
                move |task: Task| handle(&table, task),
            )?
        };

        let epoll = Epoll::new()?;
        let listen_fd = syscalls::create_listen_socket(&config.server_addr())?;
        let local_addr = match syscalls::local_addr(listen_fd) {
            Ok(addr) => addr,
            Err(e) => {
                syscalls::close_fd(listen_fd);
                return Err(e);
            }
        };
        if let Err(e) = epoll.register(listen_fd, false) {
            syscalls::close_fd(listen_fd);
            return Err(e);
        }
        let state = Arc::new(ServerState::new(epoll, config.doc_root.clone()));

        Ok(BoundServer {
            config,
            shutdown,
            listen_fd,
            local_addr,
            state,
            table,
            pool,
        })
    }

    pub fn serve(self) -> EtudeResult<()> {
        self.bind()?.serve()
    }
}

/// A server whose listener is open but whose event loop is not running yet.
pub struct BoundServer {
    config: Config,
    shutdown: Arc<AtomicBool>,
    listen_fd: c_int,
    local_addr: SocketAddr,
    state: Arc<ServerState>,
    table: Arc<ConnectionTable>,
    pool: ThreadPool<Task>,
}

impl BoundServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    /// Run the event loop until the shutdown flag is raised.
    pub fn serve(mut self) -> EtudeResult<()> {
        info!(
            addr = %self.local_addr,
            workers = self.pool.threads(),
            doc_root = %self.config.doc_root.display(),
            "etude listening"
        );

        let mut events = vec![epoll_event { events: 0, u64: 0 }; MAX_EVENT_NUMBER];
        let result = self.event_loop(&mut events);
        if let Err(e) = &result {
            error!(error = %e, "event loop failed");
        }

        self.pool.shutdown();
        self.table.clear()?;
        info!(
            requests = self.state.req_count(),
            bytes_sent = self.state.bytes_sent(),
            "etude shut down"
        );
        result
    }

    fn event_loop(&self, events: &mut [epoll_event]) -> EtudeResult<()> {
        while !self.shutdown.load(Ordering::Acquire) {
            let round = self.table.next_round();
            let n = self.state.epoll.wait(events, POLL_TIMEOUT_MS)?;
            for ev in &events[..n] {
                let fd = ev.u64 as c_int;
                let flags = ev.events;

                if fd == self.listen_fd {
                    self.accept_all();
                    continue;
                }
                // Reported for the socket that held this number before an
                // accept earlier in this batch reused it.
                if !self.table.predates(fd, round).unwrap_or(false) {
                    debug!(fd, flags, "stale event skipped");
                    continue;
                }
                if flags & (EPOLLRDHUP | EPOLLHUP | EPOLLERR) as u32 != 0 {
                    debug!(fd, flags, "peer hung up");
                    self.evict(fd);
                } else if flags & EPOLLIN as u32 != 0 {
                    self.dispatch(Task::Readable(fd));
                } else if flags & EPOLLOUT as u32 != 0 {
                    self.dispatch(Task::Writable(fd));
                }
            }
        }
        Ok(())
    }

    fn dispatch(&self, task: Task) {
        if !self.pool.append(task) {
            warn!(fd = task.fd(), "request queue full, dropping connection");
            self.evict(task.fd());
        }
    }

    fn evict(&self, fd: c_int) {
        if let Err(e) = self.table.evict(fd) {
            error!(fd, error = %e, "evict failed");
        }
    }

    /// Edge-triggered listener: accept until the backlog is empty.
    fn accept_all(&self) {
        loop {
            match syscalls::accept_connection(self.listen_fd) {
                Ok(Some((fd, peer))) => self.admit(fd, peer),
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn admit(&self, fd: c_int, peer: Option<SocketAddr>) {
        let over_capacity = usize::try_from(fd).map_or(true, |idx| idx >= self.table.capacity())
            || self.state.live_conns() >= self.table.capacity();
        if over_capacity {
            warn!(fd, peer = ?peer, "connection table full, turning client away");
            // Best effort; the socket is closed either way.
            let _ = syscalls::send_nonblocking(fd, BUSY_REPLY);
            syscalls::close_fd(fd);
            return;
        }

        match Connection::open(fd, peer, self.state.clone()) {
            Ok(conn) => {
                if let Err(e) = self.table.install(fd, conn) {
                    warn!(fd, error = %e, "could not install connection");
                }
            }
            Err(e) => warn!(fd, error = %e, "could not register connection"),
        }
    }
}

impl Drop for BoundServer {
    fn drop(&mut self) {
        if let Err(e) = self.state.epoll.deregister(self.listen_fd) {
            debug!(fd = self.listen_fd, error = %e, "listener deregister failed");
        }
    }
}

/// Worker side: drive one connection through the step its event calls for.
fn handle(table: &ConnectionTable, task: Task) {
    let fd = task.fd();
    let outcome = table.with(fd, |conn| match task {
        Task::Readable(_) => on_readable(conn),
        Task::Writable(_) => on_writable(conn),
    });
    match outcome {
        Ok(Some(())) => {}
        Ok(None) => debug!(fd, "event for a connection already gone"),
        Err(e) => error!(fd, error = %e, "connection slot unavailable"),
    }
}

fn on_readable(conn: &mut Connection) {
    if let Err(e) = conn.read() {
        debug!(fd = conn.fd(), peer = ?conn.peer(), error = %e, "read failed");
        conn.close(true);
        return;
    }
    if let Err(e) = conn.process() {
        debug!(fd = conn.fd(), error = %e, "process failed");
        conn.close(true);
    }
}

fn on_writable(conn: &mut Connection) {
    match conn.write() {
        Ok(WriteStatus::Pending | WriteStatus::KeepAlive) => {}
        Ok(WriteStatus::Pipelined) => {
            if let Err(e) = conn.process() {
                debug!(fd = conn.fd(), error = %e, "process failed");
                conn.close(true);
            }
        }
        Ok(WriteStatus::Close) => conn.close(true),
        Err(e) => {
            debug!(fd = conn.fd(), error = %e, "write failed");
            conn.close(true);
        }
    }
}
