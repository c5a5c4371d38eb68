use http::{Request, Response, StatusCode};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tower::{service_fn, BoxError, Service, ServiceBuilder, ServiceExt};

use turnstile::clock::ManualClock;
use turnstile::ratelimit::{
    LimitConfig, RateLimiter, ResolverRegistry, RATELIMIT_LIMIT, RATELIMIT_REMAINING,
    RATELIMIT_RESET, RETRY_AFTER,
};
use turnstile::{AdmissionError, RateLimitLayer, RequestLimit, RequestLimitLayer};

fn rate_limiter(yaml: &str) -> RateLimiter {
    let policy = LimitConfig::from_yaml(yaml).unwrap().validate().unwrap();
    RateLimiter::with_clock(
        policy,
        &ResolverRegistry::default(),
        Arc::new(ManualClock::new(1_700_000_000)),
    )
    .unwrap()
}

fn request(path: &str) -> Request<String> {
    Request::builder().uri(path).body(String::new()).unwrap()
}

fn request_from(path: &str, addr: &str) -> Request<String> {
    let mut request = request(path);
    let addr: SocketAddr = addr.parse().unwrap();
    request.extensions_mut().insert(addr);
    request
}

async fn hello(request: Request<String>) -> Result<Response<String>, Infallible> {
    Ok(Response::new(format!("hello {}", request.uri().path())))
}

async fn send<S>(service: &S, request: Request<String>) -> Response<String>
where
    S: Service<Request<String>, Response = Response<String>> + Clone,
    S::Error: Into<BoxError>,
{
    match service.clone().oneshot(request).await {
        Ok(response) => response,
        Err(e) => panic!("service failed: {}", e.into()),
    }
}

#[tokio::test]
async fn test_server_limit_denies_with_headers_and_json() {
    let service = ServiceBuilder::new()
        .layer(RateLimitLayer::new(rate_limiter("enabled: true\nrateLimit: 5/s")))
        .service(service_fn(hello));

    for _ in 0..5 {
        let response = send(&service, request("/v1/users")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body(), "hello /v1/users");
        // Headers are only attached to allowed responses when asked for
        assert!(response.headers().get(RATELIMIT_LIMIT).is_none());
    }

    let response = send(&service, request("/v1/users")).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.headers()["content-type"], "application/json");
    assert_eq!(response.headers()[RATELIMIT_REMAINING], "0");
    assert_eq!(response.headers()[RATELIMIT_LIMIT], "5/s");
    assert_eq!(response.headers()[RETRY_AFTER], "1");

    let body: serde_json::Value = serde_json::from_str(response.body()).unwrap();
    assert_eq!(body["allow"], false);
    assert_eq!(body["headers"][RATELIMIT_REMAINING], "0");

    // Other paths have their own counters
    let response = send(&service, request("/v1/orders")).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_address_override_and_default() {
    let yaml = "enabled: true\nkey: address\nerrorCode: 429\nrateLimit: 10/m\naddress:\n  1.2.3.4: 2/m\n";
    let service = ServiceBuilder::new()
        .layer(RateLimitLayer::new(rate_limiter(yaml)))
        .service(service_fn(hello));

    for _ in 0..2 {
        let response = send(&service, request_from("/", "1.2.3.4:5000")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = send(&service, request_from("/", "1.2.3.4:5001")).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()[RATELIMIT_LIMIT], "2/m");

    for _ in 0..10 {
        let response = send(&service, request_from("/", "5.6.7.8:5000")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = send(&service, request_from("/", "5.6.7.8:5000")).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()[RATELIMIT_LIMIT], "10/m");
}

#[tokio::test]
async fn test_headers_always_set_on_allowed_responses() {
    let yaml = "enabled: true\nheadersAlwaysSet: true\nrateLimit: 3/m 100/d";
    let service = ServiceBuilder::new()
        .layer(RateLimitLayer::new(rate_limiter(yaml)))
        .service(service_fn(hello));

    let response = send(&service, request("/")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[RATELIMIT_LIMIT], "3/m");
    assert_eq!(response.headers()[RATELIMIT_REMAINING], "2");
    assert_eq!(response.headers()[RATELIMIT_RESET], "60");
    assert!(response.headers().get(RETRY_AFTER).is_none());
}

#[tokio::test]
async fn test_disabled_limits_pass_through() {
    let limit = RequestLimit::from_policy(&LimitConfig::default().validate().unwrap());
    let service = ServiceBuilder::new()
        .layer(RequestLimitLayer::new(limit.clone()))
        .layer(RateLimitLayer::new(rate_limiter("enabled: false\nrateLimit: 0/s")))
        .service(service_fn(hello));

    for _ in 0..3 {
        let response = send(&service, request("/")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().is_empty());
    }
    assert_eq!(limit.active(), 0);
}

#[tokio::test]
async fn test_admission_queues_then_rejects() {
    let limit = RequestLimit::new(1, Some(1));
    let gate = Arc::new(Semaphore::new(0));
    let inner = {
        let gate = gate.clone();
        service_fn(move |request: Request<String>| {
            let gate = gate.clone();
            async move {
                let _pass = gate.acquire().await;
                hello(request).await
            }
        })
    };
    let service = ServiceBuilder::new()
        .layer(RequestLimitLayer::new(limit.clone()))
        .service(inner);

    let running = tokio::spawn(service.clone().oneshot(request("/running")));
    while limit.active() < 1 {
        tokio::task::yield_now().await;
    }
    let queued = tokio::spawn(service.clone().oneshot(request("/queued")));
    while limit.queued() < 1 {
        tokio::task::yield_now().await;
    }

    let rejected = send(&service, request("/rejected")).await;
    assert_eq!(rejected.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: serde_json::Value = serde_json::from_str(rejected.body()).unwrap();
    assert_eq!(body["code"], 503);
    assert_eq!(body["message"], AdmissionError::QueueFull.to_string());

    gate.add_permits(1);
    let running = tokio_test::assert_ok!(running.await.unwrap());
    let queued = tokio_test::assert_ok!(queued.await.unwrap());
    assert_eq!(running.body(), "hello /running");
    assert_eq!(queued.body(), "hello /queued");
    assert_eq!(limit.active(), 0);
}

#[tokio::test]
async fn test_full_chain_releases_slot_on_denial() {
    let limit = RequestLimit::new(2, Some(0));
    let service = ServiceBuilder::new()
        .layer(RequestLimitLayer::new(limit.clone()))
        .layer(RateLimitLayer::new(rate_limiter("enabled: true\nrateLimit: 1/m")))
        .service(service_fn(hello));

    assert_eq!(send(&service, request("/")).await.status(), StatusCode::OK);
    assert_eq!(
        send(&service, request("/")).await.status(),
        StatusCode::SERVICE_UNAVAILABLE
    );
    assert_eq!(limit.active(), 0);
}
