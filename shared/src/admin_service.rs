use crate::http::{make_boxed_error_response, make_json_response, make_text_response};
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode};
use std::convert::Infallible;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// What the admin listener needs to know about the running service.
pub trait AdminState: Send + Sync + 'static {
    /// Used by the readiness probe.
    fn is_ready(&self) -> bool;

    /// Body of the `/health` endpoint.
    fn health(&self) -> serde_json::Value;

    /// Prometheus exposition text, if a Prometheus recorder is installed.
    fn render_metrics(&self) -> Option<String> {
        None
    }
}

pub struct AdminService<S, E> {
    state: Arc<S>,
    _error: PhantomData<E>,
}

impl<S, E> AdminService<S, E>
where
    S: AdminState,
{
    pub fn new(state: Arc<S>) -> Self {
        Self {
            state,
            _error: PhantomData,
        }
    }

    fn respond(&self, method: &Method, path: &str) -> Response<BoxBody<Bytes, Infallible>> {
        if method != Method::GET {
            return make_boxed_error_response(StatusCode::METHOD_NOT_ALLOWED);
        }

        match path {
            "/health" => make_json_response(StatusCode::OK, &self.state.health()),
            "/ready" => match self.state.is_ready() {
                true => make_json_response(StatusCode::OK, &serde_json::json!({"status": "ready"})),
                false => make_json_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    &serde_json::json!({
                        "status": "not_ready",
                        "reason": "scheduler_not_running",
                    }),
                ),
            },
            "/metrics" => match self.state.render_metrics() {
                Some(body) => make_text_response(PROMETHEUS_CONTENT_TYPE, body),
                None => make_boxed_error_response(StatusCode::NOT_FOUND),
            },
            _ => make_boxed_error_response(StatusCode::NOT_FOUND),
        }
    }
}

impl<S, E> Service<Request<Incoming>> for AdminService<S, E>
where
    S: AdminState,
    E: Send + 'static,
{
    type Response = Response<BoxBody<Bytes, Infallible>>;
    type Error = E;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let res = self.respond(req.method(), req.uri().path());
        Box::pin(async move { Ok(res) })
    }
}
