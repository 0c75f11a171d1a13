//! Calls Order.makeOrder once. Usage: `order_client [host:port] [price]`.

use rpcio::demo::{MakeOrderRequest, MakeOrderResponse};
use rpcio::{logging, Channel, Controller, LogConfig, Reactor, RpcResult};
use tracing::{error, info};

fn main() -> RpcResult<()> {
    let _log = logging::init(&LogConfig::default());
    let peer = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:12345".to_owned());
    let price: i64 = std::env::args()
        .nth(2)
        .and_then(|p| p.parse().ok())
        .unwrap_or(100);

    let reactor = Reactor::new()?;
    let channel = Channel::new(reactor, peer);
    let mut controller = Controller::new();
    controller.set_timeout_ms(2000);

    let request = MakeOrderRequest {
        price,
        goods: "apple".to_owned(),
    };
    let (status, response): (_, Option<MakeOrderResponse>) =
        channel.call_blocking("Order.makeOrder", controller, &request);

    if status.is_ok() {
        match response {
            Some(resp) => info!(order_id = %resp.order_id, "order placed"),
            None => error!("ok status but empty response"),
        }
    } else {
        error!(%status, "makeOrder failed");
    }
    Ok(())
}
