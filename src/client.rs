//! Outbound endpoint: owns one client-role connection on a reactor and exposes
//! the write/read primitives the call path is built from.
//!
//! Connect is non-blocking. When `connect(2)` returns EINPROGRESS the client
//! arms a one-shot writable interest; the handler resolves the outcome with
//! `SO_ERROR`, attaches the read side and flushes anything queued in the
//! meantime. The completion callback runs exactly once either way.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::codec::Envelope;
use crate::connection::{ConnRef, Connection, RecvCallback, SendCallback};
use crate::error::RpcResult;
use crate::reactor::{Reactor, WRITABLE};
use crate::utils;

pub type ConnectCallback = Box<dyn FnOnce(RpcResult<()>) + Send>;

#[derive(Clone)]
pub struct Client {
    reactor: Arc<Reactor>,
    peer: SocketAddr,
    conn: ConnRef,
}

impl Client {
    /// Start connecting to `peer`. `on_connect` fires once the socket is
    /// usable (or failed); with an already-established local connect it fires
    /// before this function returns.
    pub fn connect(
        reactor: Arc<Reactor>,
        peer: SocketAddr,
        on_connect: impl FnOnce(RpcResult<()>) + Send + 'static,
    ) -> RpcResult<Self> {
        let (stream, established) = utils::connect_nonblocking(&peer)?;
        let conn = Connection::client(Arc::clone(&reactor), stream, peer, established);
        let client = Self {
            reactor: Arc::clone(&reactor),
            peer,
            conn: Arc::clone(&conn),
        };

        if established {
            debug!(peer = %peer, "connected immediately");
            Connection::attach_read(&conn)?;
            on_connect(Ok(()));
            return Ok(client);
        }

        let fd = conn.lock().fd();
        // one-shot: the writable handler may fire more than once before the
        // interest removal lands, the Option guards the callback
        let pending: Arc<Mutex<Option<ConnectCallback>>> =
            Arc::new(Mutex::new(Some(Box::new(on_connect))));
        let handler = {
            let reactor = Arc::clone(&reactor);
            let conn = Arc::clone(&conn);
            Arc::new(move || {
                let Some(cb) = pending.lock().take() else {
                    return;
                };
                if let Err(err) = reactor.remove_interest(fd, WRITABLE) {
                    debug!(fd, "removing connect interest failed: {}", err);
                }
                match utils::take_socket_error(fd) {
                    Ok(()) => {
                        conn.lock().mark_connected();
                        let attached = Connection::attach_read(&conn)
                            .and_then(|()| Connection::kick_writes(&conn));
                        match attached {
                            Ok(()) => {
                                info!(fd, "connected");
                                cb(Ok(()));
                            }
                            Err(err) => {
                                Connection::clear(&conn);
                                cb(Err(err));
                            }
                        }
                    }
                    Err(err) => {
                        info!(fd, "connect failed: {}", err);
                        Connection::clear(&conn);
                        cb(Err(err.into()));
                    }
                }
            })
        };
        reactor.add_interest(fd, WRITABLE, handler)?;
        Ok(client)
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn reactor(&self) -> &Arc<Reactor> {
        &self.reactor
    }

    /// Queue an envelope; `on_sent` fires once its bytes fully drain to the
    /// socket.
    pub fn write(&self, env: Envelope, on_sent: Option<SendCallback>) -> RpcResult<()> {
        Connection::send(&self.conn, env, on_sent)
    }

    /// Register a reply callback for a correlation id.
    pub fn read(&self, msg_id: String, on_recv: RecvCallback) {
        Connection::expect_reply(&self.conn, msg_id, on_recv);
    }

    /// Drop a registered reply callback.
    pub fn forget(&self, msg_id: &str) {
        Connection::forget_reply(&self.conn, msg_id);
    }

    /// Graceful half-close; the connection clears once EOF reaches the read
    /// handler, failing any pending replies with peer-closed.
    pub fn shutdown(&self) {
        Connection::shutdown(&self.conn);
    }

    /// Tear the connection down; pending replies fail with peer-closed.
    pub fn close(&self) {
        Connection::clear(&self.conn);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::utils::DeadlineTimer;
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn drive_until(reactor: &Reactor, flag: &AtomicBool) {
        let deadline = DeadlineTimer::new_millis(2000);
        while !flag.load(Ordering::Acquire) && !deadline.expired() {
            reactor.poll_once(Some(Duration::from_millis(20))).unwrap();
        }
    }

    #[test]
    fn test_connect_to_listener_succeeds() {
        let reactor = Reactor::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let ok = Arc::new(AtomicBool::new(false));
        let done = Arc::new(AtomicBool::new(false));
        let (ok2, done2) = (Arc::clone(&ok), Arc::clone(&done));
        let client = Client::connect(Arc::clone(&reactor), addr, move |result| {
            ok2.store(result.is_ok(), Ordering::Release);
            done2.store(true, Ordering::Release);
        })
        .unwrap();
        drive_until(&reactor, &done);
        assert!(ok.load(Ordering::Acquire));
        client.close();
    }

    #[test]
    fn test_connect_refused_reports_error() {
        let reactor = Reactor::new().unwrap();
        // bind then drop to get a port with no listener
        let addr = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap()
        };
        let failed = Arc::new(AtomicBool::new(false));
        let done = Arc::new(AtomicBool::new(false));
        let (failed2, done2) = (Arc::clone(&failed), Arc::clone(&done));
        let _client = Client::connect(Arc::clone(&reactor), addr, move |result| {
            failed2.store(result.is_err(), Ordering::Release);
            done2.store(true, Ordering::Release);
        })
        .unwrap();
        drive_until(&reactor, &done);
        assert!(failed.load(Ordering::Acquire));
    }
}
