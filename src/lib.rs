//! Event-driven RPC runtime: explicit reactor handles, a framed TCP
//! transport with correlation ids, typed service registration on the server
//! and a per-call channel with timeouts on the client.
//!
//! A server registers services on a [`Dispatcher`], accepts on a main
//! reactor and serves connections on a pool of I/O reactors. A client builds
//! a [`Channel`] to a peer and issues calls; every failure mode (connect,
//! serialize, dispatch, decode, timeout) arrives through the completion
//! closure as a status code on the [`Controller`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use rpcio::demo::{order_service, MakeOrderRequest, MakeOrderResponse};
//! use rpcio::{Channel, Controller, Dispatcher, Reactor, RpcResult, Server};
//!
//! fn main() -> RpcResult<()> {
//!     let dispatcher = Arc::new(Dispatcher::new());
//!     dispatcher.register(order_service());
//!     let server = Server::new("127.0.0.1:12345".parse().unwrap(), 2, dispatcher)?;
//!     std::thread::spawn(move || server.run());
//!
//!     let reactor = Reactor::new()?;
//!     let channel = Channel::new(reactor, "127.0.0.1:12345");
//!     let request = MakeOrderRequest { price: 100, goods: "apple".into() };
//!     let (status, response): (_, Option<MakeOrderResponse>) =
//!         channel.call_blocking("Order.makeOrder", Controller::new(), &request);
//!     println!("{} {:?}", status, response);
//!     Ok(())
//! }
//! ```

pub mod buffer;
pub mod channel;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod demo;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod reactor;
pub mod server;
pub mod timer;
pub mod utils;

pub use channel::{Channel, Controller, DEFAULT_CALL_TIMEOUT_MS};
pub use client::Client;
pub use codec::{Envelope, FrameCodec};
pub use config::{LogConfig, NetworkConfig, RouteTable, RpcConfig};
pub use connection::{ConnRef, Connection};
pub use dispatcher::{Dispatcher, Message, ServiceBuilder, ServiceDescriptor};
pub use error::{code, RpcError, RpcResult, RpcStatus};
pub use reactor::Reactor;
pub use server::{Acceptor, Server, WorkerPool};
pub use timer::TimerEvent;
