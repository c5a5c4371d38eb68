//! Strategies that turn a request into a rate limit key.
//!
//! Resolvers are looked up by name from the limit configuration
//! (`clientIdKeyResolver`, `addressKeyResolver`, `userIdKeyResolver`). The
//! [`ResolverRegistry`] ships the built-in ones and accepts custom resolvers
//! under new names.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::context::{RequestContext, CLIENT_ID_CLAIM, USER_ID_CLAIM};
use crate::error::{Result, TurnstileError};

pub const REMOTE_ADDRESS: &str = "remote-address";
pub const FORWARDED_ADDRESS: &str = "forwarded-address";
pub const JWT_CLIENT_ID: &str = "jwt-client-id";
pub const JWT_USER_ID: &str = "jwt-user-id";
pub const API_KEY_HEADER: &str = "api-key-header";

/// Extracts the caller identity a limit is keyed on.
pub trait KeyResolver: Send + Sync + fmt::Debug {
    /// Returns `None` when the request carries no usable identity.
    fn resolve(&self, ctx: &RequestContext<'_>) -> Option<String>;
}

/// Keys on the IP address of the connected peer.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoteAddressResolver;

impl KeyResolver for RemoteAddressResolver {
    fn resolve(&self, ctx: &RequestContext<'_>) -> Option<String> {
        ctx.remote_addr.map(|addr| addr.ip().to_string())
    }
}

/// Keys on the client address reported by a fronting proxy.
///
/// Uses the first `X-Forwarded-For` hop, then `X-Real-IP`, then the peer.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForwardedAddressResolver;

impl KeyResolver for ForwardedAddressResolver {
    fn resolve(&self, ctx: &RequestContext<'_>) -> Option<String> {
        let forwarded = ctx
            .header("x-forwarded-for")
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|hop| !hop.is_empty());
        if let Some(hop) = forwarded {
            return Some(hop.to_string());
        }

        let real_ip = ctx
            .header("x-real-ip")
            .map(str::trim)
            .filter(|ip| !ip.is_empty());
        if let Some(ip) = real_ip {
            return Some(ip.to_string());
        }

        RemoteAddressResolver.resolve(ctx)
    }
}

/// Keys on a verified credential claim.
#[derive(Debug, Clone)]
pub struct ClaimResolver {
    claim: String,
}

impl ClaimResolver {
    pub fn new(claim: impl Into<String>) -> Self {
        Self {
            claim: claim.into(),
        }
    }
}

impl KeyResolver for ClaimResolver {
    fn resolve(&self, ctx: &RequestContext<'_>) -> Option<String> {
        ctx.audit?.get(&self.claim).map(str::to_string)
    }
}

/// Keys on a request header.
#[derive(Debug, Clone)]
pub struct HeaderResolver {
    header: String,
}

impl HeaderResolver {
    pub fn new(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
        }
    }
}

impl KeyResolver for HeaderResolver {
    fn resolve(&self, ctx: &RequestContext<'_>) -> Option<String> {
        ctx.header(&self.header).map(str::to_string)
    }
}

type ResolverFactory = Arc<dyn Fn() -> Arc<dyn KeyResolver> + Send + Sync>;

/// Named resolver constructors.
#[derive(Clone)]
pub struct ResolverRegistry {
    factories: HashMap<String, ResolverFactory>,
}

impl ResolverRegistry {
    /// A registry with no resolvers at all.
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a resolver under `name`, replacing any previous one.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn KeyResolver> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    /// Construct the resolver registered under `name`.
    pub fn build(&self, name: &str) -> Result<Arc<dyn KeyResolver>> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| TurnstileError::UnknownResolver(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

impl Default for ResolverRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(REMOTE_ADDRESS, || Arc::new(RemoteAddressResolver));
        registry.register(FORWARDED_ADDRESS, || Arc::new(ForwardedAddressResolver));
        registry.register(JWT_CLIENT_ID, || Arc::new(ClaimResolver::new(CLIENT_ID_CLAIM)));
        registry.register(JWT_USER_ID, || Arc::new(ClaimResolver::new(USER_ID_CLAIM)));
        registry.register(API_KEY_HEADER, || Arc::new(HeaderResolver::new("x-api-key")));
        registry
    }
}

impl fmt::Debug for ResolverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("ResolverRegistry")
            .field("resolvers", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::AuditInfo;
    use http::HeaderMap;
    use std::net::SocketAddr;

    fn peer() -> SocketAddr {
        "10.1.1.1:40000".parse().unwrap()
    }

    #[test]
    fn test_remote_address_drops_port() {
        let headers = HeaderMap::new();
        let ctx = RequestContext::new("/", &headers).with_remote_addr(peer());
        assert_eq!(RemoteAddressResolver.resolve(&ctx).as_deref(), Some("10.1.1.1"));

        let ctx = RequestContext::new("/", &headers);
        assert_eq!(RemoteAddressResolver.resolve(&ctx), None);
    }

    #[test]
    fn test_forwarded_address_precedence() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "192.168.0.7".parse().unwrap());
        let ctx = RequestContext::new("/", &headers).with_remote_addr(peer());
        assert_eq!(
            ForwardedAddressResolver.resolve(&ctx).as_deref(),
            Some("192.168.0.7")
        );

        headers.insert("x-forwarded-for", " 203.0.113.5, 10.0.0.1".parse().unwrap());
        let ctx = RequestContext::new("/", &headers).with_remote_addr(peer());
        assert_eq!(
            ForwardedAddressResolver.resolve(&ctx).as_deref(),
            Some("203.0.113.5")
        );

        let empty = HeaderMap::new();
        let ctx = RequestContext::new("/", &empty).with_remote_addr(peer());
        assert_eq!(ForwardedAddressResolver.resolve(&ctx).as_deref(), Some("10.1.1.1"));
    }

    #[test]
    fn test_claim_resolvers() {
        let headers = HeaderMap::new();
        let audit = AuditInfo::new()
            .with_claim(CLIENT_ID_CLAIM, "billing")
            .with_claim(USER_ID_CLAIM, "alice");
        let ctx = RequestContext::new("/", &headers).with_audit(&audit);

        let registry = ResolverRegistry::default();
        let client = registry.build(JWT_CLIENT_ID).unwrap();
        let user = registry.build(JWT_USER_ID).unwrap();
        assert_eq!(client.resolve(&ctx).as_deref(), Some("billing"));
        assert_eq!(user.resolve(&ctx).as_deref(), Some("alice"));

        let bare = RequestContext::new("/", &headers);
        assert_eq!(client.resolve(&bare), None);
    }

    #[test]
    fn test_registry_unknown_name() {
        let registry = ResolverRegistry::default();
        assert!(registry.contains(API_KEY_HEADER));
        assert!(matches!(
            registry.build("com.example.Resolver"),
            Err(TurnstileError::UnknownResolver(name)) if name == "com.example.Resolver"
        ));
    }

    #[test]
    fn test_registry_custom_resolver() {
        let mut registry = ResolverRegistry::empty();
        registry.register("tenant", || Arc::new(HeaderResolver::new("x-tenant")));

        let mut headers = HeaderMap::new();
        headers.insert("x-tenant", "acme".parse().unwrap());
        let ctx = RequestContext::new("/", &headers);
        let resolver = registry.build("tenant").unwrap();
        assert_eq!(resolver.resolve(&ctx).as_deref(), Some("acme"));
    }
}
