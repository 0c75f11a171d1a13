//! Serves the Order service. Pass a config file path to override the listen
//! address, worker count and log settings.

use std::sync::Arc;

use rpcio::demo::order_service;
use rpcio::{logging, Dispatcher, RpcConfig, RpcResult, Server};
use tracing::info;

fn main() -> RpcResult<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => RpcConfig::from_file(&path)?,
        None => RpcConfig::default(),
    };
    let _log = logging::init(&config.log);

    let dispatcher = Arc::new(Dispatcher::new());
    dispatcher.register(order_service());

    let server = Server::from_config(&config, dispatcher)?;
    info!(addr = %server.local_addr(), io_threads = config.network.io_threads, "order server up");
    server.run()
}
