//! Error taxonomy.
//!
//! Local faults (socket setup, poller failures, config loading) are `RpcError`
//! values and propagate with `?`. RPC-level failures travel end-to-end as a
//! numeric code plus a human-readable message (`RpcStatus`), carried in the
//! wire envelope and in the per-call `Controller` — never as a Rust error
//! across the network boundary.

pub type RpcResult<T> = Result<T, RpcError>;

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config file error: {0}")]
    ConfigFile(#[from] config::ConfigError),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("serialize failed: {0}")]
    Serialize(String),

    #[error("deserialize failed: {0}")]
    Deserialize(String),
}

/// Status codes carried in envelopes and controllers. One distinct code per
/// RPC failure class; 0 means success.
pub mod code {
    pub const OK: i32 = 0;

    pub const ERROR_PEER_CLOSED: i32 = 10000000;
    pub const ERROR_FAILED_CONNECT: i32 = 10000001;
    pub const ERROR_FAILED_GET_REPLY: i32 = 10000002;
    pub const ERROR_FAILED_DESERIALIZE: i32 = 10000003;
    pub const ERROR_FAILED_SERIALIZE: i32 = 10000004;
    /// Carried for wire compatibility; frame encoding here is infallible, so
    /// this code is never produced locally.
    pub const ERROR_FAILED_ENCODE: i32 = 10000005;
    pub const ERROR_FAILED_DECODE: i32 = 10000006;
    pub const ERROR_RPC_CALL_TIMEOUT: i32 = 10000007;
    pub const ERROR_SERVICE_NOT_FOUND: i32 = 10000008;
    pub const ERROR_METHOD_NOT_FOUND: i32 = 10000009;
    pub const ERROR_PARSE_SERVICE_NAME: i32 = 10000010;
    /// Carried for wire compatibility; channels here have no uninitialized
    /// state, so this code is never produced locally.
    pub const ERROR_RPC_CHANNEL_INIT: i32 = 10000011;
    pub const ERROR_RPC_PEER_ADDR: i32 = 10000012;
}

/// A code/message pair. Services return `Err(RpcStatus)` for application
/// failures; the dispatcher and call path use it for the RPC-level codes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcStatus {
    pub code: i32,
    pub info: String,
}

impl RpcStatus {
    pub fn new(code: i32, info: impl Into<String>) -> Self {
        Self {
            code,
            info: info.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == code::OK
    }
}

impl std::fmt::Display for RpcStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.info)
    }
}
