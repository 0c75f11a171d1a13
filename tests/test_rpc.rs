//! End-to-end calls against a live server: success, application errors,
//! dispatch errors, timeouts, refused connects and half-close.

use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rpcio::demo::{order_service, MakeOrderRequest, MakeOrderResponse};
use rpcio::utils::DeadlineTimer;
use rpcio::{
    code, Channel, Client, Controller, Dispatcher, Envelope, FrameCodec, Reactor, RpcStatus,
    Server,
};

fn start_server() -> Arc<Server> {
    let dispatcher = Arc::new(Dispatcher::new());
    dispatcher.register(order_service());
    let server = Arc::new(Server::new("127.0.0.1:0".parse().unwrap(), 2, dispatcher).unwrap());
    let s = Arc::clone(&server);
    std::thread::spawn(move || {
        let _ = s.run();
    });
    server
}

fn order_call(
    addr: SocketAddr,
    method: &str,
    price: i64,
    timeout_ms: i64,
) -> (RpcStatus, Option<MakeOrderResponse>) {
    let reactor = Reactor::new().unwrap();
    let channel = Channel::new(reactor, addr.to_string());
    let mut controller = Controller::new();
    controller.set_timeout_ms(timeout_ms);
    let request = MakeOrderRequest {
        price,
        goods: "apple".to_owned(),
    };
    channel.call_blocking(method, controller, &request)
}

#[test]
fn test_make_order_success() {
    let server = start_server();
    let (status, resp) = order_call(server.local_addr(), "Order.makeOrder", 100, 2000);
    assert!(status.is_ok(), "unexpected status: {}", status);
    assert_eq!(resp.unwrap().order_id, "2024-05-21");
    server.stop();
}

#[test]
fn test_make_order_short_balance() {
    let server = start_server();
    let (status, resp) = order_call(server.local_addr(), "Order.makeOrder", 5, 2000);
    assert_eq!(status.code, -1);
    assert_eq!(status.info, "short balance");
    assert!(resp.is_none());
    server.stop();
}

#[test]
fn test_unknown_method_and_service() {
    let server = start_server();
    let (status, _) = order_call(server.local_addr(), "Order.cancelOrder", 100, 2000);
    assert_eq!(status.code, code::ERROR_METHOD_NOT_FOUND);
    let (status, _) = order_call(server.local_addr(), "Billing.makeOrder", 100, 2000);
    assert_eq!(status.code, code::ERROR_SERVICE_NOT_FOUND);
    server.stop();
}

#[test]
fn test_call_times_out_against_silent_peer() {
    // bound but never accepted: the kernel completes the handshake, the
    // request is sent, no reply ever comes
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let started = Instant::now();
    let (status, resp): (_, Option<MakeOrderResponse>) =
        order_call(addr, "Order.makeOrder", 100, 100);
    let elapsed = started.elapsed();
    assert_eq!(status.code, code::ERROR_RPC_CALL_TIMEOUT);
    assert!(resp.is_none());
    assert!(elapsed >= Duration::from_millis(50), "fired too early: {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(2000), "fired too late: {:?}", elapsed);
}

#[test]
fn test_connect_refused_surfaces_status() {
    let addr = {
        let l = TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap()
    };
    let (status, _) = order_call(addr, "Order.makeOrder", 100, 2000);
    assert_eq!(status.code, code::ERROR_FAILED_CONNECT);
}

#[test]
fn test_concurrent_calls_correlate() {
    let server = start_server();
    let reactor = Reactor::new().unwrap();
    let channel = Channel::new(Arc::clone(&reactor), server.local_addr().to_string());

    let results: Arc<Mutex<Vec<(i64, i32, Option<String>)>>> = Arc::new(Mutex::new(Vec::new()));
    for price in [100i64, 5, 50] {
        let results = Arc::clone(&results);
        let request = MakeOrderRequest {
            price,
            goods: "apple".to_owned(),
        };
        channel.call(
            "Order.makeOrder",
            Controller::new(),
            &request,
            move |ctrl: &Controller, resp: Option<MakeOrderResponse>| {
                results
                    .lock()
                    .unwrap()
                    .push((price, ctrl.err_code(), resp.map(|r| r.order_id)));
            },
        );
    }

    let deadline = DeadlineTimer::new_millis(3000);
    while results.lock().unwrap().len() < 3 && !deadline.expired() {
        reactor.poll_once(Some(Duration::from_millis(20))).unwrap();
    }

    let mut results = results.lock().unwrap().clone();
    results.sort();
    assert_eq!(
        results,
        vec![
            (5, -1, None),
            (50, code::OK, Some("2024-05-21".to_owned())),
            (100, code::OK, Some("2024-05-21".to_owned())),
        ]
    );
    server.stop();
}

#[test]
fn test_reply_arriving_with_peer_close_fails_peer_closed() {
    use std::io::Write;

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let reactor = Reactor::new().unwrap();
    let connected = Arc::new(AtomicBool::new(false));
    let c = Arc::clone(&connected);
    let client = Client::connect(Arc::clone(&reactor), addr, move |result| {
        c.store(result.is_ok(), Ordering::Release);
    })
    .unwrap();
    let (mut peer, _) = listener.accept().unwrap();

    let deadline = DeadlineTimer::new_millis(2000);
    while !connected.load(Ordering::Acquire) && !deadline.expired() {
        reactor.poll_once(Some(Duration::from_millis(20))).unwrap();
    }
    assert!(connected.load(Ordering::Acquire));

    let observed = Arc::new(Mutex::new(None::<i32>));
    let o = Arc::clone(&observed);
    client.read(
        "1".to_owned(),
        Box::new(move |env| {
            *o.lock().unwrap() = Some(env.err_code);
        }),
    );

    // a complete reply frame and the FIN both land before the next poll, so
    // the client sees them in one readable event
    let mut env = Envelope::default();
    env.msg_id = "1".to_owned();
    env.method_name = "Order.makeOrder".to_owned();
    let frame = FrameCodec.encode_to_bytes(&env);
    peer.write_all(&frame).unwrap();
    drop(peer);

    let deadline = DeadlineTimer::new_millis(2000);
    while observed.lock().unwrap().is_none() && !deadline.expired() {
        reactor.poll_once(Some(Duration::from_millis(20))).unwrap();
    }
    assert_eq!(*observed.lock().unwrap(), Some(code::ERROR_PEER_CLOSED));
}

#[test]
fn test_shutdown_fails_pending_reply_with_peer_closed() {
    let server = start_server();
    let reactor = Reactor::new().unwrap();
    let connected = Arc::new(AtomicBool::new(false));
    let c = Arc::clone(&connected);
    let client = Client::connect(Arc::clone(&reactor), server.local_addr(), move |result| {
        c.store(result.is_ok(), Ordering::Release);
    })
    .unwrap();

    let deadline = DeadlineTimer::new_millis(2000);
    while !connected.load(Ordering::Acquire) && !deadline.expired() {
        reactor.poll_once(Some(Duration::from_millis(20))).unwrap();
    }
    assert!(connected.load(Ordering::Acquire));

    let failed_code = Arc::new(Mutex::new(None::<i32>));
    let f = Arc::clone(&failed_code);
    client.read(
        "never-answered".to_owned(),
        Box::new(move |env| {
            *f.lock().unwrap() = Some(env.err_code);
        }),
    );
    client.shutdown();

    let deadline = DeadlineTimer::new_millis(2000);
    while failed_code.lock().unwrap().is_none() && !deadline.expired() {
        reactor.poll_once(Some(Duration::from_millis(20))).unwrap();
    }
    assert_eq!(*failed_code.lock().unwrap(), Some(code::ERROR_PEER_CLOSED));
    server.stop();
}
