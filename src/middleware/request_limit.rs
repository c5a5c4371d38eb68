use futures::future::BoxFuture;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{Request, Response, StatusCode};
use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};

use crate::admission::{AdmissionError, RequestLimit};

/// Builds the response sent to a request that was not admitted.
pub trait RejectionHandler: Send + Sync {
    fn reject(&self, error: &AdmissionError, status: StatusCode) -> Response<String>;
}

/// Replies with `{"code": <status>, "message": <reason>}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonRejection;

impl RejectionHandler for JsonRejection {
    fn reject(&self, error: &AdmissionError, status: StatusCode) -> Response<String> {
        let body = serde_json::json!({
            "code": status.as_u16(),
            "message": error.to_string(),
        });
        let mut response = Response::new(body.to_string());
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response
    }
}

/// A layer that bounds in-flight requests with a [`RequestLimit`].
pub struct RequestLimitLayer<H = JsonRejection> {
    limit: RequestLimit,
    handler: Arc<H>,
}

impl RequestLimitLayer {
    pub fn new(limit: RequestLimit) -> Self {
        Self {
            limit,
            handler: Arc::new(JsonRejection),
        }
    }
}

impl<H> RequestLimitLayer<H> {
    /// Use a custom response for rejected requests.
    pub fn with_rejection_handler<R: RejectionHandler>(self, handler: R) -> RequestLimitLayer<R> {
        RequestLimitLayer {
            limit: self.limit,
            handler: Arc::new(handler),
        }
    }
}

impl<H> Clone for RequestLimitLayer<H> {
    fn clone(&self) -> Self {
        Self {
            limit: self.limit.clone(),
            handler: self.handler.clone(),
        }
    }
}

impl<H> fmt::Debug for RequestLimitLayer<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestLimitLayer")
            .field("limit", &self.limit)
            .finish()
    }
}

impl<S, H> Layer<S> for RequestLimitLayer<H> {
    type Service = RequestLimitService<S, H>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestLimitService {
            inner,
            limit: self.limit.clone(),
            handler: self.handler.clone(),
        }
    }
}

/// Middleware service that holds a request slot until the inner future completes.
pub struct RequestLimitService<S, H = JsonRejection> {
    inner: S,
    limit: RequestLimit,
    handler: Arc<H>,
}

impl<S: Clone, H> Clone for RequestLimitService<S, H> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limit: self.limit.clone(),
            handler: self.handler.clone(),
        }
    }
}

impl<S, H, ReqBody, ResBody> Service<Request<ReqBody>> for RequestLimitService<S, H>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    H: RejectionHandler + 'static,
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
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        if !self.limit.is_enabled() {
            return Box::pin(inner.call(req));
        }

        let limit = self.limit.clone();
        let handler = self.handler.clone();
        Box::pin(async move {
            match limit.acquire().await {
                Ok(permit) => {
                    let response = inner.call(req).await;
                    drop(permit);
                    response
                }
                Err(error) => Ok(handler
                    .reject(&error, limit.error_code())
                    .map(ResBody::from)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_rejection_body() {
        let response = JsonRejection.reject(&AdmissionError::QueueFull, StatusCode::SERVICE_UNAVAILABLE);

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body: serde_json::Value = serde_json::from_str(response.body()).unwrap();
        assert_eq!(body["code"], 503);
        assert_eq!(body["message"], AdmissionError::QueueFull.to_string());
    }
}
