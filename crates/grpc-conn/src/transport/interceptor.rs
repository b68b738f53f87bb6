//! Client-side RPC instrumentation.
//!
//! [`RpcMetricsLayer`] wraps a tonic channel so every unary and streaming
//! call records started/handled counters and a latency histogram. When the
//! layer is attached to a [`super::grpc::GrpcConnection`] it also reports
//! transport outcomes into the connection's connectivity state.
//!
//! Status codes are read from the `grpc-status` response header. For
//! streaming calls whose status only arrives in trailers the code is
//! recorded as `OK` once headers arrive.

use super::grpc::StateTracker;
use crate::observability::{record_rpc_handled, record_rpc_started};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;
use tonic::codegen::http;
use tower::{Layer, Service};

/// Tower layer adding RPC metrics.
#[derive(Debug, Clone, Default)]
pub struct RpcMetricsLayer {
    instrumented: bool,
    state: Option<StateTracker>,
}

impl RpcMetricsLayer {
    /// Create a layer. With `instrumented == false` no metrics are written.
    #[must_use]
    pub fn new(instrumented: bool) -> Self {
        Self {
            instrumented,
            state: None,
        }
    }

    pub(crate) fn with_state(mut self, state: StateTracker) -> Self {
        self.state = Some(state);
        self
    }
}

impl<S> Layer<S> for RpcMetricsLayer {
    type Service = RpcMetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RpcMetricsService {
            inner,
            instrumented: self.instrumented,
            state: self.state.clone(),
        }
    }
}

/// Tower service produced by [`RpcMetricsLayer`].
#[derive(Debug, Clone)]
pub struct RpcMetricsService<S> {
    inner: S,
    instrumented: bool,
    state: Option<StateTracker>,
}

impl<S, ReqBody, ResBody> Service<http::Request<ReqBody>> for RpcMetricsService<S>
where
    S: Service<http::Request<ReqBody>, Response = http::Response<ResBody>>,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    ResBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: http::Request<ReqBody>) -> Self::Future {
        let method = RpcMethod::from_path(req.uri().path());
        let instrumented = self.instrumented;
        let state = self.state.clone();

        if instrumented {
            record_rpc_started(&method.service, &method.method);
        }

        let started = Instant::now();
        let future = self.inner.call(req);

        Box::pin(async move {
            let result = future.await;

            let code = match &result {
                Ok(response) => {
                    if let Some(state) = &state {
                        state.mark_ready();
                    }
                    grpc_code(response.headers())
                }
                Err(_) => {
                    if let Some(state) = &state {
                        state.mark_transient_failure();
                    }
                    "Unavailable".to_string()
                }
            };

            if instrumented {
                record_rpc_handled(&method.service, &method.method, &code, started.elapsed());
            }

            result
        })
    }
}

/// `/package.Service/Method` split into labels.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RpcMethod {
    service: String,
    method: String,
}

impl RpcMethod {
    fn from_path(path: &str) -> Self {
        match path.trim_start_matches('/').split_once('/') {
            Some((service, method)) if !service.is_empty() && !method.is_empty() => Self {
                service: service.to_string(),
                method: method.to_string(),
            },
            _ => Self {
                service: "unknown".to_string(),
                method: "unknown".to_string(),
            },
        }
    }
}

fn grpc_code(headers: &http::HeaderMap) -> String {
    match headers.get("grpc-status") {
        None => "OK".to_string(),
        Some(value) => match tonic::Code::from_bytes(value.as_bytes()) {
            tonic::Code::Ok => "OK".to_string(),
            code => format!("{code:?}"),
        },
    }
}
