use futures::future::BoxFuture;
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use http::{HeaderMap, Request, Response, StatusCode};
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::debug;

use crate::context::RequestContext;
use crate::ratelimit::{RateLimitBackend, RateLimitResponse};

/// A layer that enforces rate limits using a [`RateLimitBackend`].
#[derive(Debug)]
pub struct RateLimitLayer<L: ?Sized> {
    backend: Arc<L>,
}

impl<L> RateLimitLayer<L> {
    pub fn new(backend: L) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }
}

impl<L: ?Sized> RateLimitLayer<L> {
    /// Share a backend that is also used elsewhere, e.g. for reloads.
    pub fn from_shared(backend: Arc<L>) -> Self {
        Self { backend }
    }
}

impl<L: ?Sized> Clone for RateLimitLayer<L> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
        }
    }
}

impl<S, L: ?Sized> Layer<S> for RateLimitLayer<L> {
    type Service = RateLimitService<S, L>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            backend: self.backend.clone(),
        }
    }
}

/// Middleware service that counts requests and short-circuits denied ones.
#[derive(Debug)]
pub struct RateLimitService<S, L: ?Sized> {
    inner: S,
    backend: Arc<L>,
}

impl<S: Clone, L: ?Sized> Clone for RateLimitService<S, L> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            backend: self.backend.clone(),
        }
    }
}

impl<S, L, ReqBody, ResBody> Service<Request<ReqBody>> for RateLimitService<S, L>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    L: RateLimitBackend + ?Sized + 'static,
    ReqBody: Send + 'static,
    ResBody: From<String> + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let decision = self.backend.check(&RequestContext::from_request(&req));

        if let Some(decision) = decision.as_ref().filter(|decision| !decision.allow) {
            debug!(path = req.uri().path(), "Request denied by rate limit");
            let response = denial_response(self.backend.error_code(), decision);
            return Box::pin(async move { Ok(response) });
        }

        let attach = decision.filter(|_| self.backend.headers_always_set());
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let mut response = inner.call(req).await?;
            if let Some(decision) = attach {
                apply_headers(response.headers_mut(), &decision);
            }
            Ok(response)
        })
    }
}

fn apply_headers(headers: &mut HeaderMap, decision: &RateLimitResponse) {
    for (name, value) in &decision.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            headers.insert(name, value);
        }
    }
}

fn denial_response<B: From<String>>(status: StatusCode, decision: &RateLimitResponse) -> Response<B> {
    let body = serde_json::to_string(decision).unwrap_or_default();
    let mut response = Response::new(B::from(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    apply_headers(response.headers_mut(), decision);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{RATELIMIT_LIMIT, RETRY_AFTER};
    use std::collections::BTreeMap;

    #[test]
    fn test_denial_response_carries_headers_and_json() {
        let mut headers = BTreeMap::new();
        headers.insert(RATELIMIT_LIMIT.to_string(), "5/s".to_string());
        headers.insert(RETRY_AFTER.to_string(), "1".to_string());
        let decision = RateLimitResponse {
            allow: false,
            headers,
        };

        let response: Response<String> = denial_response(StatusCode::TOO_MANY_REQUESTS, &decision);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["content-type"], "application/json");
        assert_eq!(response.headers()["retry-after"], "1");
        assert_eq!(response.headers()["x-ratelimit-limit"], "5/s");

        let body: serde_json::Value = serde_json::from_str(response.body()).unwrap();
        assert_eq!(body["allow"], false);
    }
}
