//! Client call path: typed request/response calls over a per-call connection,
//! with correlation, timeout and exactly-once completion.
//!
//! Each call owns one `CallState` behind a mutex. The reply callback and the
//! timeout timer race; whichever runs `complete` first wins, flips the
//! `finished` flag under the lock and takes the completion closure, the
//! client handle and the timer out of the state. The timer only ever holds a
//! `Weak` reference plus a generation stamp, so an expired timer for a
//! finished call can never touch a live one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::client::Client;
use crate::codec::Envelope;
use crate::config::RouteTable;
use crate::dispatcher::Message;
use crate::error::{code, RpcStatus};
use crate::reactor::Reactor;
use crate::timer::TimerEvent;
use crate::utils::{DeadlineTimer, MsgIdGenerator};

pub const DEFAULT_CALL_TIMEOUT_MS: i64 = 1000;

/// Per-call knobs and results. Configure before the call; read inside the
/// completion closure.
pub struct Controller {
    msg_id: String,
    timeout_ms: i64,
    err_code: i32,
    err_info: String,
    finished: bool,
}

impl Default for Controller {
    fn default() -> Self {
        Self {
            msg_id: String::new(),
            timeout_ms: DEFAULT_CALL_TIMEOUT_MS,
            err_code: code::OK,
            err_info: String::new(),
            finished: false,
        }
    }
}

impl Controller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the generated correlation id; must be unique per in-flight
    /// call.
    pub fn set_msg_id(&mut self, msg_id: impl Into<String>) {
        self.msg_id = msg_id.into();
    }

    pub fn msg_id(&self) -> &str {
        &self.msg_id
    }

    pub fn set_timeout_ms(&mut self, timeout_ms: i64) {
        self.timeout_ms = timeout_ms;
    }

    pub fn timeout_ms(&self) -> i64 {
        self.timeout_ms
    }

    pub fn err_code(&self) -> i32 {
        self.err_code
    }

    pub fn err_info(&self) -> &str {
        &self.err_info
    }

    pub fn is_ok(&self) -> bool {
        self.err_code == code::OK
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn status(&self) -> RpcStatus {
        RpcStatus::new(self.err_code, self.err_info.clone())
    }

    fn set_error(&mut self, err_code: i32, err_info: impl Into<String>) {
        self.err_code = err_code;
        self.err_info = err_info.into();
    }
}

type DoneFn = Box<dyn FnOnce(&Controller) + Send>;

/// Everything one in-flight call owns. `finished` flips exactly once; the
/// winner takes the fields, closing the per-call connection and with it any
/// path back into this state.
struct CallState {
    controller: Option<Controller>,
    client: Option<Client>,
    done: Option<DoneFn>,
    timer: Option<Arc<TimerEvent>>,
    generation: u64,
    finished: bool,
}

fn complete(state: &Arc<Mutex<CallState>>, err_code: i32, err_info: &str) {
    complete_gen(state, None, err_code, err_info);
}

fn complete_gen(
    state: &Arc<Mutex<CallState>>,
    expected_generation: Option<u64>,
    err_code: i32,
    err_info: &str,
) {
    let (controller, client, done, timer) = {
        let mut s = state.lock();
        if s.finished {
            return;
        }
        if let Some(generation) = expected_generation {
            if s.generation != generation {
                debug!(generation, "stale timer generation, ignoring");
                return;
            }
        }
        s.finished = true;
        (
            s.controller.take(),
            s.client.take(),
            s.done.take(),
            s.timer.take(),
        )
    };
    if let Some(timer) = timer {
        timer.cancel();
    }
    let Some(mut controller) = controller else {
        return;
    };
    if err_code != code::OK {
        controller.set_error(err_code, err_info);
    }
    controller.finished = true;
    if let Some(client) = client {
        client.forget(&controller.msg_id);
        client.close();
    }
    if let Some(done) = done {
        done(&controller);
    }
}

/// A logical route to one peer. Each `call` opens its own connection, sends
/// one request and closes on completion.
pub struct Channel {
    reactor: Arc<Reactor>,
    routes: Arc<RouteTable>,
    peer: String,
    id_gen: MsgIdGenerator,
    generation: AtomicU64,
}

impl Channel {
    /// `peer` is either a literal `host:port` or a route name resolved
    /// through `routes`.
    pub fn new(reactor: Arc<Reactor>, peer: impl Into<String>) -> Self {
        Self::with_routes(reactor, peer, Arc::new(RouteTable::default()))
    }

    pub fn with_routes(
        reactor: Arc<Reactor>,
        peer: impl Into<String>,
        routes: Arc<RouteTable>,
    ) -> Self {
        Self {
            reactor,
            routes,
            peer: peer.into(),
            id_gen: MsgIdGenerator::new(),
            generation: AtomicU64::new(1),
        }
    }

    /// Issue one call. Never blocks; the completion closure runs exactly once
    /// with the final controller status and the decoded response on success.
    /// All failures (resolve, serialize, connect, dispatch, decode, timeout)
    /// arrive through the closure as status codes.
    pub fn call<Req, Resp, F>(&self, method: &str, controller: Controller, request: &Req, done: F)
    where
        Req: Message,
        Resp: Message + Send + 'static,
        F: FnOnce(&Controller, Option<Resp>) + Send + 'static,
    {
        let mut controller = controller;
        if controller.msg_id.is_empty() {
            controller.msg_id = self.id_gen.next_id();
        }
        let msg_id = controller.msg_id.clone();
        let timeout_ms = controller.timeout_ms;
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);

        let resp_slot: Arc<Mutex<Option<Resp>>> = Arc::new(Mutex::new(None));
        let done_erased: DoneFn = {
            let slot = Arc::clone(&resp_slot);
            Box::new(move |ctrl: &Controller| done(ctrl, slot.lock().take()))
        };
        let state = Arc::new(Mutex::new(CallState {
            controller: Some(controller),
            client: None,
            done: Some(done_erased),
            timer: None,
            generation,
            finished: false,
        }));

        let addr = match self.routes.resolve(&self.peer) {
            Ok(addr) => addr,
            Err(err) => {
                error!(peer = %self.peer, "peer resolve failed: {}", err);
                complete(&state, code::ERROR_RPC_PEER_ADDR, &err.to_string());
                return;
            }
        };
        let payload = match request.encode() {
            Ok(payload) => payload,
            Err(err) => {
                complete(&state, code::ERROR_FAILED_SERIALIZE, &err.to_string());
                return;
            }
        };
        let env = Envelope::request(msg_id.clone(), method.to_owned(), payload.into());

        // start the timeout clock before any network step
        let timer = {
            let weak: Weak<Mutex<CallState>> = Arc::downgrade(&state);
            TimerEvent::one_shot(timeout_ms, move || {
                if let Some(state) = weak.upgrade() {
                    complete_gen(
                        &state,
                        Some(generation),
                        code::ERROR_RPC_CALL_TIMEOUT,
                        "rpc call timed out",
                    );
                }
            })
        };
        state.lock().timer = Some(Arc::clone(&timer));
        self.reactor.schedule(timer);

        let client = {
            let state = Arc::clone(&state);
            Client::connect(Arc::clone(&self.reactor), addr, move |result| {
                if let Err(err) = result {
                    complete(
                        &state,
                        code::ERROR_FAILED_CONNECT,
                        &format!("connect to peer failed: {}", err),
                    );
                }
            })
        };
        let client = match client {
            Ok(client) => client,
            Err(err) => {
                complete(
                    &state,
                    code::ERROR_FAILED_CONNECT,
                    &format!("connect to peer failed: {}", err),
                );
                return;
            }
        };

        // reply registration precedes the request write, so a fast peer
        // cannot answer into a void
        {
            let state = Arc::clone(&state);
            let slot = Arc::clone(&resp_slot);
            client.read(
                msg_id.clone(),
                Box::new(move |env: Envelope| {
                    if !env.parse_ok {
                        complete(
                            &state,
                            code::ERROR_FAILED_DECODE,
                            "response frame failed to decode",
                        );
                        return;
                    }
                    if env.err_code != code::OK {
                        complete(&state, env.err_code, &env.err_info);
                        return;
                    }
                    match Resp::decode(&env.payload) {
                        Ok(resp) => {
                            *slot.lock() = Some(resp);
                            complete(&state, code::OK, "");
                        }
                        Err(err) => {
                            complete(&state, code::ERROR_FAILED_DESERIALIZE, &err.to_string())
                        }
                    }
                }),
            );
        }
        if let Err(err) = client.write(env, None) {
            complete(&state, code::ERROR_FAILED_GET_REPLY, &err.to_string());
            return;
        }

        let mut s = state.lock();
        if s.finished {
            drop(s);
            client.close();
        } else {
            s.client = Some(client);
        }
    }

    /// Convenience wrapper: issue the call and wait for completion. When the
    /// reactor runs on another thread this parks on a condvar; otherwise it
    /// drives the reactor's poll loop itself. Must not be called from inside
    /// a reactor callback.
    pub fn call_blocking<Req, Resp>(
        &self,
        method: &str,
        controller: Controller,
        request: &Req,
    ) -> (RpcStatus, Option<Resp>)
    where
        Req: Message,
        Resp: Message + Send + 'static,
    {
        let timeout_ms = controller.timeout_ms;
        let pair = Arc::new((
            Mutex::new(None::<(RpcStatus, Option<Resp>)>),
            Condvar::new(),
        ));
        {
            let pair = Arc::clone(&pair);
            self.call(
                method,
                controller,
                request,
                move |ctrl: &Controller, resp: Option<Resp>| {
                    let (slot, cvar) = &*pair;
                    *slot.lock() = Some((ctrl.status(), resp));
                    cvar.notify_all();
                },
            );
        }
        let (slot, cvar) = &*pair;
        if self.reactor.is_running() {
            let mut guard = slot.lock();
            loop {
                if let Some(result) = guard.take() {
                    return result;
                }
                cvar.wait_for(&mut guard, Duration::from_millis(100));
            }
        } else {
            // the per-call timer bounds this loop, the deadline is a backstop
            let deadline = DeadlineTimer::new_millis(timeout_ms.max(0) as u64 + 5000);
            loop {
                if let Some(result) = slot.lock().take() {
                    return result;
                }
                if deadline.expired() {
                    return (
                        RpcStatus::new(code::ERROR_RPC_CALL_TIMEOUT, "rpc call timed out"),
                        None,
                    );
                }
                let _ = self.reactor.poll_once(Some(Duration::from_millis(20)));
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn state_with_done(counter: Arc<AtomicU32>) -> Arc<Mutex<CallState>> {
        let mut controller = Controller::new();
        controller.set_msg_id("11");
        Arc::new(Mutex::new(CallState {
            controller: Some(controller),
            client: None,
            done: Some(Box::new(move |_ctrl| {
                counter.fetch_add(1, Ordering::Relaxed);
            })),
            timer: None,
            generation: 3,
            finished: false,
        }))
    }

    #[test]
    fn test_complete_runs_done_exactly_once() {
        let count = Arc::new(AtomicU32::new(0));
        let state = state_with_done(Arc::clone(&count));
        complete(&state, code::ERROR_RPC_CALL_TIMEOUT, "rpc call timed out");
        complete(&state, code::OK, "");
        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert!(state.lock().finished);
    }

    #[test]
    fn test_stale_generation_does_not_complete() {
        let count = Arc::new(AtomicU32::new(0));
        let state = state_with_done(Arc::clone(&count));
        complete_gen(&state, Some(99), code::ERROR_RPC_CALL_TIMEOUT, "late");
        assert_eq!(count.load(Ordering::Relaxed), 0);
        assert!(!state.lock().finished);
        complete_gen(&state, Some(3), code::OK, "");
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_first_completion_wins() {
        let results: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));
        let r = Arc::clone(&results);
        let mut controller = Controller::new();
        controller.set_msg_id("12");
        let state = Arc::new(Mutex::new(CallState {
            controller: Some(controller),
            client: None,
            done: Some(Box::new(move |ctrl: &Controller| {
                r.lock().push(ctrl.err_code());
            })),
            timer: None,
            generation: 0,
            finished: false,
        }));
        complete(&state, code::OK, "");
        complete(&state, code::ERROR_RPC_CALL_TIMEOUT, "too late");
        assert_eq!(*results.lock(), vec![code::OK]);
    }
}
