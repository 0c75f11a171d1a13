//! One established TCP connection driven by a reactor: non-blocking reads into
//! an in-buffer, frame decode, role-specific handling (server dispatch or
//! client reply correlation), and drain-or-stay-armed writes from an
//! out-buffer.
//!
//! A connection is shared as `ConnRef = Arc<Mutex<Connection>>`. The reactor's
//! interest handlers hold strong clones, so deregistering the descriptor in
//! `clear` is what ultimately drops the connection. User callbacks always run
//! after the connection lock is released.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::buffer::ByteBuffer;
use crate::codec::{Envelope, FrameCodec};
use crate::dispatcher::Dispatcher;
use crate::error::{code, RpcError, RpcResult};
use crate::reactor::{Reactor, READABLE, WRITABLE};

pub type ConnRef = Arc<Mutex<Connection>>;
/// Runs once the encoded request has fully drained to the socket.
pub type SendCallback = Box<dyn FnOnce(&Envelope) + Send>;
/// Runs when the reply matching a correlation id arrives (or the connection
/// dies first).
pub type RecvCallback = Box<dyn FnOnce(Envelope) + Send>;

const INITIAL_BUF_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    NotConnected,
    Connected,
    HalfClosing,
    Closed,
}

struct ClientSide {
    /// Envelopes accepted by `send` but not yet encoded into the out-buffer.
    send_queue: VecDeque<(Envelope, Option<SendCallback>)>,
    /// Encoded envelopes awaiting full drain, keyed by the out-buffer's
    /// lifetime written count at the end of each frame.
    in_flight: VecDeque<(usize, Envelope, Option<SendCallback>)>,
    /// Reply callbacks keyed by correlation id.
    pending_reads: HashMap<String, RecvCallback>,
}

enum ConnRole {
    Server { dispatcher: Arc<Dispatcher> },
    Client(ClientSide),
}

pub struct Connection {
    reactor: Arc<Reactor>,
    stream: Option<TcpStream>,
    fd: RawFd,
    peer: SocketAddr,
    state: ConnState,
    in_buf: ByteBuffer,
    out_buf: ByteBuffer,
    codec: FrameCodec,
    role: ConnRole,
    write_armed: bool,
}

impl Connection {
    /// Wrap an accepted socket; registers read interest immediately.
    pub fn server(
        reactor: Arc<Reactor>,
        stream: TcpStream,
        peer: SocketAddr,
        dispatcher: Arc<Dispatcher>,
    ) -> RpcResult<ConnRef> {
        stream.set_nonblocking(true)?;
        let conn = Self::build(
            reactor,
            stream,
            peer,
            ConnState::Connected,
            ConnRole::Server { dispatcher },
        );
        Self::attach_read(&conn)?;
        Ok(conn)
    }

    /// Wrap an outbound socket. Read interest is attached by the owner once
    /// the connect completes; until then sends queue up.
    pub fn client(
        reactor: Arc<Reactor>,
        stream: TcpStream,
        peer: SocketAddr,
        connected: bool,
    ) -> ConnRef {
        let state = if connected {
            ConnState::Connected
        } else {
            ConnState::NotConnected
        };
        Self::build(
            reactor,
            stream,
            peer,
            state,
            ConnRole::Client(ClientSide {
                send_queue: VecDeque::new(),
                in_flight: VecDeque::new(),
                pending_reads: HashMap::new(),
            }),
        )
    }

    fn build(
        reactor: Arc<Reactor>,
        stream: TcpStream,
        peer: SocketAddr,
        state: ConnState,
        role: ConnRole,
    ) -> ConnRef {
        let fd = stream.as_raw_fd();
        Arc::new(Mutex::new(Self {
            reactor,
            stream: Some(stream),
            fd,
            peer,
            state,
            in_buf: ByteBuffer::with_capacity(INITIAL_BUF_CAPACITY),
            out_buf: ByteBuffer::with_capacity(INITIAL_BUF_CAPACITY),
            codec: FrameCodec,
            role,
            write_armed: false,
        }))
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn mark_connected(&mut self) {
        if self.state == ConnState::NotConnected {
            self.state = ConnState::Connected;
        }
    }

    pub fn pending_reply_count(&self) -> usize {
        match &self.role {
            ConnRole::Client(side) => side.pending_reads.len(),
            ConnRole::Server { .. } => 0,
        }
    }

    /// Register the read-side handler with the reactor. The closure keeps the
    /// connection alive until `clear` deregisters it.
    pub fn attach_read(conn: &ConnRef) -> RpcResult<()> {
        let (reactor, fd) = {
            let c = conn.lock();
            (Arc::clone(&c.reactor), c.fd)
        };
        let handle = Arc::clone(conn);
        reactor.add_interest(
            fd,
            READABLE,
            Arc::new(move || Connection::handle_readable(&handle)),
        )
    }

    /// Queue an envelope for sending; arms write interest when the socket is
    /// already connected (otherwise the owner arms it on connect completion).
    /// Client role only; server responses go out through the dispatch path.
    pub fn send(conn: &ConnRef, env: Envelope, on_sent: Option<SendCallback>) -> RpcResult<()> {
        let state = {
            let mut guard = conn.lock();
            let c = &mut *guard;
            match &mut c.role {
                ConnRole::Client(side) => side.send_queue.push_back((env, on_sent)),
                ConnRole::Server { .. } => {
                    return Err(RpcError::IllegalState(
                        "server-role connections reply through dispatch".to_owned(),
                    ));
                }
            }
            c.state
        };
        if state == ConnState::Connected {
            Self::arm_write(conn)?;
        }
        Ok(())
    }

    /// Register a reply callback for a correlation id.
    pub fn expect_reply(conn: &ConnRef, msg_id: String, on_recv: RecvCallback) {
        let mut guard = conn.lock();
        if let ConnRole::Client(side) = &mut guard.role {
            side.pending_reads.insert(msg_id, on_recv);
        }
    }

    /// Drop the reply callback for a correlation id, if still pending.
    pub fn forget_reply(conn: &ConnRef, msg_id: &str) {
        let mut guard = conn.lock();
        if let ConnRole::Client(side) = &mut guard.role {
            side.pending_reads.remove(msg_id);
        }
    }

    /// Half-close: send FIN and wait for the peer's EOF to reach the read
    /// handler, which then clears the connection.
    pub fn shutdown(conn: &ConnRef) {
        let mut guard = conn.lock();
        if guard.state != ConnState::Connected {
            return;
        }
        guard.state = ConnState::HalfClosing;
        let rc = unsafe { libc::shutdown(guard.fd, libc::SHUT_RDWR) };
        if rc != 0 {
            debug!(
                fd = guard.fd,
                "shutdown failed: {}",
                io::Error::last_os_error()
            );
        }
    }

    /// Tear the connection down: deregister from the reactor, close the
    /// socket, fail every pending reply with a peer-closed envelope.
    /// Idempotent.
    pub fn clear(conn: &ConnRef) {
        let failed = {
            let mut guard = conn.lock();
            guard.do_clear()
        };
        for (cb, env) in failed {
            cb(env);
        }
    }

    fn do_clear(&mut self) -> Vec<(RecvCallback, Envelope)> {
        if self.state == ConnState::Closed {
            return Vec::new();
        }
        self.state = ConnState::Closed;
        // deregister before the fd is closed by dropping the stream
        if let Err(err) = self.reactor.deregister(self.fd) {
            debug!(fd = self.fd, "deregister on clear failed: {}", err);
        }
        self.write_armed = false;
        self.stream = None;
        info!(fd = self.fd, peer = %self.peer, "connection closed");

        let mut failed = Vec::new();
        if let ConnRole::Client(side) = &mut self.role {
            let dropped = side.send_queue.len() + side.in_flight.len();
            if dropped > 0 {
                debug!(
                    fd = self.fd,
                    "dropping {} unsent envelopes on close", dropped
                );
            }
            side.send_queue.clear();
            side.in_flight.clear();
            for (msg_id, cb) in side.pending_reads.drain() {
                let env = Envelope {
                    msg_id,
                    err_code: code::ERROR_PEER_CLOSED,
                    err_info: "connection closed by peer".to_owned(),
                    ..Default::default()
                };
                failed.push((cb, env));
            }
        }
        failed
    }

    /// Arm write interest if anything queued up before the socket finished
    /// connecting.
    pub(crate) fn kick_writes(conn: &ConnRef) -> RpcResult<()> {
        let has_work = {
            let guard = conn.lock();
            guard.out_buf.readable() > 0
                || matches!(&guard.role, ConnRole::Client(side) if !side.send_queue.is_empty())
        };
        if has_work {
            Self::arm_write(conn)?;
        }
        Ok(())
    }

    fn arm_write(conn: &ConnRef) -> RpcResult<()> {
        let armed = {
            let mut guard = conn.lock();
            if guard.write_armed || guard.state == ConnState::Closed {
                None
            } else {
                guard.write_armed = true;
                Some((Arc::clone(&guard.reactor), guard.fd))
            }
        };
        if let Some((reactor, fd)) = armed {
            let handle = Arc::clone(conn);
            reactor.add_interest(
                fd,
                WRITABLE,
                Arc::new(move || Connection::handle_writable(&handle)),
            )?;
        }
        Ok(())
    }

    /// Readable event: read until EAGAIN (growing the in-buffer as needed),
    /// decode complete frames, then dispatch (server) or correlate (client).
    /// EOF clears the connection without decoding; frames that arrived in the
    /// same event are dropped and pending replies fail with peer-closed.
    fn handle_readable(conn: &ConnRef) {
        let (need_write, matched) = {
            let mut guard = conn.lock();
            if guard.state == ConnState::Closed {
                return;
            }
            if guard.fill_from_socket() {
                drop(guard);
                Self::clear(conn);
                return;
            }
            let c = &mut *guard;
            let frames = c.codec.decode(&mut c.in_buf);
            let mut need_write = false;
            let mut matched: Vec<(RecvCallback, Envelope)> = Vec::new();
            for env in frames {
                match &mut c.role {
                    ConnRole::Server { dispatcher } => {
                        let resp = dispatcher.dispatch(&env);
                        c.codec.encode(&resp, &mut c.out_buf);
                        need_write = true;
                    }
                    ConnRole::Client(side) => match side.pending_reads.remove(&env.msg_id) {
                        Some(cb) => matched.push((cb, env)),
                        None => {
                            debug!(
                                fd = c.fd,
                                msg_id = %env.msg_id,
                                "dropping reply with no pending call"
                            );
                        }
                    },
                }
            }
            (need_write, matched)
        };
        for (cb, env) in matched {
            cb(env);
        }
        if need_write {
            if let Err(err) = Self::arm_write(conn) {
                error!("arming write interest failed: {}", err);
                Self::clear(conn);
            }
        }
    }

    /// Writable event: encode queued envelopes, write until drained or EAGAIN,
    /// fire send callbacks for frames fully flushed, disarm once empty.
    fn handle_writable(conn: &ConnRef) {
        let (broken, disarm, sent) = {
            let mut guard = conn.lock();
            if guard.state == ConnState::Closed {
                return;
            }
            guard.encode_queued();
            let broken = guard.flush_to_socket();
            let c = &mut *guard;
            let mut sent: Vec<(SendCallback, Envelope)> = Vec::new();
            if let ConnRole::Client(side) = &mut c.role {
                let consumed = c.out_buf.total_consumed();
                while side
                    .in_flight
                    .front()
                    .is_some_and(|(mark, _, _)| *mark <= consumed)
                {
                    if let Some((_, env, cb)) = side.in_flight.pop_front() {
                        if let Some(cb) = cb {
                            sent.push((cb, env));
                        }
                    }
                }
            }
            let disarm = if !broken && c.out_buf.readable() == 0 {
                c.write_armed = false;
                Some((Arc::clone(&c.reactor), c.fd))
            } else {
                None
            };
            (broken, disarm, sent)
        };
        if let Some((reactor, fd)) = disarm {
            if let Err(err) = reactor.remove_interest(fd, WRITABLE) {
                debug!(fd, "disarming write interest failed: {}", err);
            }
        }
        for (cb, env) in sent {
            cb(&env);
        }
        if broken {
            Self::clear(conn);
        }
    }

    fn encode_queued(&mut self) {
        loop {
            let next = match &mut self.role {
                ConnRole::Client(side) => side.send_queue.pop_front(),
                ConnRole::Server { .. } => None,
            };
            let Some((env, cb)) = next else {
                break;
            };
            self.codec.encode(&env, &mut self.out_buf);
            let mark = self.out_buf.total_written();
            if let ConnRole::Client(side) = &mut self.role {
                side.in_flight.push_back((mark, env, cb));
            }
        }
    }

    /// Returns true on EOF or a fatal read error.
    fn fill_from_socket(&mut self) -> bool {
        loop {
            if self.in_buf.writable() == 0 {
                self.in_buf.grow();
            }
            let Some(stream) = self.stream.as_ref() else {
                return true;
            };
            let mut stream = stream;
            match stream.read(self.in_buf.spare_mut()) {
                Ok(0) => {
                    debug!(fd = self.fd, peer = %self.peer, "peer closed");
                    return true;
                }
                // keep reading: a short read may still be followed by EOF in
                // the same event, which must be seen before anything decodes
                Ok(n) => self.in_buf.advance_write(n),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return false,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!(fd = self.fd, peer = %self.peer, "read failed: {}", err);
                    return true;
                }
            }
        }
    }

    /// Returns true on a fatal write error.
    fn flush_to_socket(&mut self) -> bool {
        while self.out_buf.readable() > 0 {
            let Some(stream) = self.stream.as_ref() else {
                return true;
            };
            let mut stream = stream;
            match stream.write(self.out_buf.peek()) {
                Ok(n) => self.out_buf.advance_read(n),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return false,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!(fd = self.fd, peer = %self.peer, "write failed: {}", err);
                    return true;
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_send_rejected_on_server_role() {
        let reactor = Reactor::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let peer = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, addr) = listener.accept().unwrap();
        let conn =
            Connection::server(reactor, accepted, addr, Arc::new(Dispatcher::new())).unwrap();
        let result = Connection::send(&conn, Envelope::default(), None);
        assert!(matches!(result, Err(RpcError::IllegalState(_))));
        Connection::clear(&conn);
        drop(peer);
    }
}
