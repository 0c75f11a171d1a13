//! Accept loop and I/O worker pool.
//!
//! The main reactor owns the listening socket; accepted sockets are handed
//! round-robin to worker reactors, each running its own poll loop on a named
//! thread. Workers own their connections through reactor registration; the
//! pool keeps only weak handles so it can force-close everything on stop
//! without extending any connection's lifetime.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::config::RpcConfig;
use crate::connection::{ConnRef, Connection};
use crate::dispatcher::Dispatcher;
use crate::error::{RpcError, RpcResult};
use crate::reactor::{Reactor, READABLE};

/// Non-blocking listening socket.
pub struct Acceptor {
    listener: TcpListener,
    local: SocketAddr,
}

impl Acceptor {
    pub fn bind(addr: SocketAddr) -> RpcResult<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local = listener.local_addr()?;
        info!(addr = %local, "listening");
        Ok(Self { listener, local })
    }

    pub fn fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Accept every pending connection; returns once the backlog is drained.
    pub fn accept_ready(&self) -> Vec<(TcpStream, SocketAddr)> {
        let mut accepted = Vec::new();
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "accepted");
                    accepted.push((stream, peer));
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!("accept failed: {}", err);
                    break;
                }
            }
        }
        accepted
    }
}

struct Worker {
    reactor: Arc<Reactor>,
    handle: Option<JoinHandle<()>>,
}

/// Fixed set of I/O reactors, each on its own thread, with round-robin
/// connection placement.
pub struct WorkerPool {
    workers: Vec<Worker>,
    next: AtomicUsize,
    conns: Mutex<HashMap<RawFd, Weak<parking_lot::Mutex<Connection>>>>,
}

impl WorkerPool {
    pub fn start(size: usize) -> RpcResult<Self> {
        let size = size.max(1);
        let mut workers = Vec::with_capacity(size);
        for i in 0..size {
            let reactor = Reactor::new()?;
            let r = Arc::clone(&reactor);
            let handle = std::thread::Builder::new()
                .name(format!("rpc-io-{}", i))
                .spawn(move || {
                    if let Err(err) = r.run() {
                        error!("io worker loop failed: {}", err);
                    }
                })?;
            workers.push(Worker {
                reactor,
                handle: Some(handle),
            });
        }
        info!("worker pool started with {} reactors", size);
        Ok(Self {
            workers,
            next: AtomicUsize::new(0),
            conns: Mutex::new(HashMap::new()),
        })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn next_reactor(&self) -> Arc<Reactor> {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        Arc::clone(&self.workers[i].reactor)
    }

    /// Remember a live connection; dead entries are pruned on the way in.
    pub fn track(&self, conn: &ConnRef) {
        let fd = conn.lock().fd();
        let mut conns = self.conns.lock();
        conns.retain(|_, weak| weak.strong_count() > 0);
        conns.insert(fd, Arc::downgrade(conn));
    }

    /// Force-close every tracked connection still alive.
    pub fn clear_connections(&self) {
        let live: Vec<ConnRef> = {
            let mut conns = self.conns.lock();
            let live = conns.values().filter_map(Weak::upgrade).collect();
            conns.clear();
            live
        };
        for conn in live {
            Connection::clear(&conn);
        }
    }

    /// Stop every worker reactor and join the threads.
    pub fn stop(&self) {
        for worker in &self.workers {
            worker.reactor.stop();
        }
    }

    fn join(&mut self) {
        for worker in &mut self.workers {
            if let Some(handle) = worker.handle.take() {
                if handle.join().is_err() {
                    error!("io worker thread panicked");
                }
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

struct ServerInner {
    acceptor: Acceptor,
    pool: WorkerPool,
    dispatcher: Arc<Dispatcher>,
}

/// The serving endpoint: accepts on the main reactor, serves on the pool.
pub struct Server {
    reactor: Arc<Reactor>,
    inner: Arc<ServerInner>,
}

impl Server {
    pub fn new(
        addr: SocketAddr,
        io_threads: usize,
        dispatcher: Arc<Dispatcher>,
    ) -> RpcResult<Self> {
        let reactor = Reactor::new()?;
        let acceptor = Acceptor::bind(addr)?;
        let pool = WorkerPool::start(io_threads)?;
        Ok(Self {
            reactor,
            inner: Arc::new(ServerInner {
                acceptor,
                pool,
                dispatcher,
            }),
        })
    }

    pub fn from_config(config: &RpcConfig, dispatcher: Arc<Dispatcher>) -> RpcResult<Self> {
        let addr: SocketAddr = config
            .network
            .listen
            .parse()
            .map_err(|_| RpcError::InvalidAddress(config.network.listen.clone()))?;
        Self::new(addr, config.network.io_threads, dispatcher)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.acceptor.local_addr()
    }

    pub fn main_reactor(&self) -> &Arc<Reactor> {
        &self.reactor
    }

    /// Register the accept handler on the main reactor. Accepted sockets are
    /// queued onto a worker, which builds the server-role connection on its
    /// own thread.
    pub fn start(&self) -> RpcResult<()> {
        let inner = Arc::clone(&self.inner);
        self.reactor.add_interest(
            self.inner.acceptor.fd(),
            READABLE,
            Arc::new(move || {
                for (stream, peer) in inner.acceptor.accept_ready() {
                    let worker = inner.pool.next_reactor();
                    let dispatcher = Arc::clone(&inner.dispatcher);
                    let inner = Arc::clone(&inner);
                    let reactor = Arc::clone(&worker);
                    worker.run_later(
                        move || match Connection::server(reactor, stream, peer, dispatcher) {
                            Ok(conn) => inner.pool.track(&conn),
                            Err(err) => {
                                error!(peer = %peer, "accepted connection setup failed: {}", err)
                            }
                        },
                        true,
                    );
                }
            }),
        )
    }

    /// Start accepting and block on the main reactor until `stop`.
    pub fn run(&self) -> RpcResult<()> {
        self.start()?;
        self.reactor.run()
    }

    /// Stop accepting, close every live connection, stop the pool and the
    /// main reactor. Safe to call from any thread.
    pub fn stop(&self) {
        if let Err(err) = self.reactor.deregister(self.inner.acceptor.fd()) {
            debug!("deregistering acceptor failed: {}", err);
        }
        self.inner.pool.clear_connections();
        self.inner.pool.stop();
        self.reactor.stop();
        info!(addr = %self.inner.acceptor.local_addr(), "server stopped");
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_acceptor_drains_backlog() {
        let acceptor = Acceptor::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        assert!(acceptor.accept_ready().is_empty());
        let a = TcpStream::connect(acceptor.local_addr()).unwrap();
        let b = TcpStream::connect(acceptor.local_addr()).unwrap();
        // give the kernel a moment to finish both handshakes
        std::thread::sleep(std::time::Duration::from_millis(50));
        let accepted = acceptor.accept_ready();
        assert_eq!(accepted.len(), 2);
        drop((a, b));
    }

    #[test]
    fn test_worker_pool_round_robin_and_stop() {
        let pool = WorkerPool::start(2).unwrap();
        assert_eq!(pool.size(), 2);
        let first = pool.next_reactor();
        let second = pool.next_reactor();
        let third = pool.next_reactor();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&first, &third));
        drop(pool); // stop + join must not hang
    }
}
