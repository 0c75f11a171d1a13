//! Server-side request routing.
//!
//! Services are registered as capability tables: a `ServiceDescriptor` maps
//! method names to boxed closures that own the decode/invoke/encode sequence
//! for one method. The dispatcher resolves `service.method` from the request
//! envelope, runs the closure, and folds any failure into the response
//! envelope's status fields.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::{debug, error, info};

use crate::codec::Envelope;
use crate::error::{code, RpcResult, RpcStatus};

/// Payload serialization boundary for request and response bodies.
pub trait Message: Sized {
    fn encode(&self) -> RpcResult<Vec<u8>>;
    fn decode(data: &[u8]) -> RpcResult<Self>;
}

type MethodFn = Box<dyn Fn(&[u8]) -> Result<Vec<u8>, RpcStatus> + Send + Sync>;

/// One registered service: a name plus its method table.
pub struct ServiceDescriptor {
    name: String,
    methods: HashMap<String, MethodFn>,
}

impl ServiceDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Builds a service method-by-method. Each typed handler is wrapped so the
/// dispatcher only ever sees raw payload bytes.
pub struct ServiceBuilder {
    name: String,
    methods: HashMap<String, MethodFn>,
}

impl ServiceBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: HashMap::new(),
        }
    }

    /// Register a typed handler. Request decode failures and response encode
    /// failures become RPC-level statuses; the handler's own `Err(RpcStatus)`
    /// passes through as the application status.
    pub fn method<Req, Resp, F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        Req: Message,
        Resp: Message,
        F: Fn(Req) -> Result<Resp, RpcStatus> + Send + Sync + 'static,
    {
        let wrapped: MethodFn = Box::new(move |payload: &[u8]| {
            let req = Req::decode(payload).map_err(|err| {
                RpcStatus::new(
                    code::ERROR_FAILED_DESERIALIZE,
                    format!("deserialize request failed: {}", err),
                )
            })?;
            let resp = handler(req)?;
            resp.encode().map_err(|err| {
                RpcStatus::new(
                    code::ERROR_FAILED_SERIALIZE,
                    format!("serialize response failed: {}", err),
                )
            })
        });
        self.methods.insert(name.into(), wrapped);
        self
    }

    pub fn build(self) -> ServiceDescriptor {
        ServiceDescriptor {
            name: self.name,
            methods: self.methods,
        }
    }
}

/// Routes request envelopes to registered service methods.
#[derive(Default)]
pub struct Dispatcher {
    services: RwLock<HashMap<String, ServiceDescriptor>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, service: ServiceDescriptor) {
        info!(service = %service.name, "service registered");
        self.services.write().insert(service.name.clone(), service);
    }

    /// Handle one request envelope, producing the response envelope. Every
    /// failure class maps to a distinct status code; the response always
    /// echoes the request's correlation id and method name.
    pub fn dispatch(&self, req: &Envelope) -> Envelope {
        let mut resp = Envelope::response_to(req);
        if !req.parse_ok {
            error!(msg_id = %req.msg_id, "request frame failed to decode");
            set_status(
                &mut resp,
                code::ERROR_FAILED_DECODE,
                "request frame failed to decode",
            );
            return resp;
        }

        let Some((service_name, method_name)) = req.method_name.split_once('.') else {
            error!(msg_id = %req.msg_id, method = %req.method_name, "malformed method name");
            set_status(
                &mut resp,
                code::ERROR_PARSE_SERVICE_NAME,
                format!("malformed method name [{}]", req.method_name),
            );
            return resp;
        };

        let services = self.services.read();
        let Some(service) = services.get(service_name) else {
            error!(msg_id = %req.msg_id, service = service_name, "service not found");
            set_status(
                &mut resp,
                code::ERROR_SERVICE_NOT_FOUND,
                format!("service [{}] not found", service_name),
            );
            return resp;
        };
        let Some(method) = service.methods.get(method_name) else {
            error!(msg_id = %req.msg_id, service = service_name, method = method_name, "method not found");
            set_status(
                &mut resp,
                code::ERROR_METHOD_NOT_FOUND,
                format!("method [{}] not found in service [{}]", method_name, service_name),
            );
            return resp;
        };

        match method(&req.payload) {
            Ok(payload) => {
                debug!(msg_id = %req.msg_id, method = %req.method_name, "dispatch ok");
                resp.payload = payload.into();
            }
            Err(status) => {
                info!(msg_id = %req.msg_id, method = %req.method_name, %status, "dispatch failed");
                set_status(&mut resp, status.code, status.info);
            }
        }
        resp
    }
}

fn set_status(resp: &mut Envelope, code: i32, info: impl Into<String>) {
    resp.err_code = code;
    resp.err_info = info.into();
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::RpcError;
    use bytes::Bytes;

    struct Echo(String);

    impl Message for Echo {
        fn encode(&self) -> RpcResult<Vec<u8>> {
            Ok(self.0.as_bytes().to_vec())
        }
        fn decode(data: &[u8]) -> RpcResult<Self> {
            Ok(Echo(
                std::str::from_utf8(data)
                    .map_err(|e| RpcError::Deserialize(e.to_string()))?
                    .to_owned(),
            ))
        }
    }

    fn dispatcher() -> Dispatcher {
        let d = Dispatcher::new();
        d.register(
            ServiceBuilder::new("Echo")
                .method("say", |req: Echo| -> Result<Echo, RpcStatus> {
                    if req.0 == "fail" {
                        return Err(RpcStatus::new(-7, "requested failure"));
                    }
                    Ok(Echo(format!("you said {}", req.0)))
                })
                .build(),
        );
        d
    }

    fn request(method: &str, payload: &[u8]) -> Envelope {
        Envelope::request(
            "77".to_owned(),
            method.to_owned(),
            Bytes::copy_from_slice(payload),
        )
    }

    #[test]
    fn test_dispatch_success() {
        let resp = dispatcher().dispatch(&request("Echo.say", b"hello"));
        assert_eq!(resp.err_code, code::OK);
        assert_eq!(resp.msg_id, "77");
        assert_eq!(resp.method_name, "Echo.say");
        assert_eq!(&resp.payload[..], b"you said hello");
    }

    #[test]
    fn test_dispatch_application_error() {
        let resp = dispatcher().dispatch(&request("Echo.say", b"fail"));
        assert_eq!(resp.err_code, -7);
        assert_eq!(resp.err_info, "requested failure");
        assert!(resp.payload.is_empty());
    }

    #[test]
    fn test_unknown_service_and_method() {
        let d = dispatcher();
        let resp = d.dispatch(&request("Nope.say", b""));
        assert_eq!(resp.err_code, code::ERROR_SERVICE_NOT_FOUND);
        let resp = d.dispatch(&request("Echo.nope", b""));
        assert_eq!(resp.err_code, code::ERROR_METHOD_NOT_FOUND);
    }

    #[test]
    fn test_malformed_method_name() {
        let resp = dispatcher().dispatch(&request("nodot", b""));
        assert_eq!(resp.err_code, code::ERROR_PARSE_SERVICE_NAME);
    }

    #[test]
    fn test_parse_failed_request() {
        let mut req = request("Echo.say", b"hello");
        req.parse_ok = false;
        let resp = dispatcher().dispatch(&req);
        assert_eq!(resp.err_code, code::ERROR_FAILED_DECODE);
        assert_eq!(resp.msg_id, "77");
    }
}
