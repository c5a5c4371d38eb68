//! Per-request view handed to key resolvers.

use http::{HeaderMap, Request};
use std::collections::HashMap;
use std::net::SocketAddr;

/// Claim holding the OAuth client id.
pub const CLIENT_ID_CLAIM: &str = "client_id";
/// Claim holding the authenticated end user id.
pub const USER_ID_CLAIM: &str = "user_id";

/// Verified credential claims, placed in the request extensions by upstream
/// authentication middleware.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditInfo(HashMap<String, String>);

impl AuditInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_claim(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }
}

/// Everything a resolver may look at to identify the caller.
#[derive(Debug, Clone)]
pub struct RequestContext<'a> {
    pub path: &'a str,
    pub headers: &'a HeaderMap,
    /// Address of the connected peer
    pub remote_addr: Option<SocketAddr>,
    pub audit: Option<&'a AuditInfo>,
}

impl<'a> RequestContext<'a> {
    pub fn new(path: &'a str, headers: &'a HeaderMap) -> Self {
        Self {
            path,
            headers,
            remote_addr: None,
            audit: None,
        }
    }

    /// Build a context from a request, picking the peer address and audit
    /// claims out of its extensions.
    pub fn from_request<B>(request: &'a Request<B>) -> Self {
        Self {
            path: request.uri().path(),
            headers: request.headers(),
            remote_addr: request.extensions().get::<SocketAddr>().copied(),
            audit: request.extensions().get::<AuditInfo>(),
        }
    }

    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    pub fn with_audit(mut self, audit: &'a AuditInfo) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Header value as a string, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&'a str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}
