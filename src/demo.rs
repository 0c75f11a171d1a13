//! The Order service used by the example binaries and the end-to-end tests:
//! one `makeOrder` method with a plain-text payload encoding.

use tracing::info;

use crate::dispatcher::{Message, ServiceBuilder, ServiceDescriptor};
use crate::error::{RpcError, RpcResult, RpcStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MakeOrderRequest {
    pub price: i64,
    pub goods: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MakeOrderResponse {
    pub order_id: String,
}

impl Message for MakeOrderRequest {
    fn encode(&self) -> RpcResult<Vec<u8>> {
        Ok(format!("{}|{}", self.price, self.goods).into_bytes())
    }

    fn decode(data: &[u8]) -> RpcResult<Self> {
        let text =
            std::str::from_utf8(data).map_err(|err| RpcError::Deserialize(err.to_string()))?;
        let (price, goods) = text
            .split_once('|')
            .ok_or_else(|| RpcError::Deserialize("missing field separator".to_owned()))?;
        Ok(Self {
            price: price
                .parse()
                .map_err(|_| RpcError::Deserialize(format!("bad price [{}]", price)))?,
            goods: goods.to_owned(),
        })
    }
}

impl Message for MakeOrderResponse {
    fn encode(&self) -> RpcResult<Vec<u8>> {
        Ok(self.order_id.clone().into_bytes())
    }

    fn decode(data: &[u8]) -> RpcResult<Self> {
        Ok(Self {
            order_id: std::str::from_utf8(data)
                .map_err(|err| RpcError::Deserialize(err.to_string()))?
                .to_owned(),
        })
    }
}

/// Build the Order service: orders below price 10 are rejected with an
/// application status, everything else gets an order id.
pub fn order_service() -> ServiceDescriptor {
    ServiceBuilder::new("Order")
        .method(
            "makeOrder",
            |req: MakeOrderRequest| -> Result<MakeOrderResponse, RpcStatus> {
                info!(price = req.price, goods = %req.goods, "makeOrder");
                if req.price < 10 {
                    return Err(RpcStatus::new(-1, "short balance"));
                }
                Ok(MakeOrderResponse {
                    order_id: "2024-05-21".to_owned(),
                })
            },
        )
        .build()
}
