use async_trait::async_trait;

use crate::{common::types::AnyResult, configs::GatewayConfig};

/// Supplies the base gateway URL (normally fetched from the HTTP API).
#[async_trait]
pub trait EndpointResolver: Send + Sync + 'static {
    async fn gateway_url(&self) -> AnyResult<String>;
}

/// Resolver that always returns the same URL.
#[derive(Debug, Clone)]
pub struct StaticEndpoint(pub String);

#[async_trait]
impl EndpointResolver for StaticEndpoint {
    async fn gateway_url(&self) -> AnyResult<String> {
        Ok(self.0.clone())
    }
}

/// Appends encoding and protocol version to a resolved base URL.
///
/// A host-only base gets a `/` path so the handshake request target is valid.
pub fn connection_url(base: &str, config: &GatewayConfig) -> String {
    let (location, query) = match base.split_once('?') {
        Some((location, query)) => (location, Some(query)),
        None => (base, None),
    };
    let authority_start = location.find("://").map_or(0, |i| i + 3);

    let mut url = location.to_string();
    if !location[authority_start..].contains('/') {
        url.push('/');
    }
    url.push('?');
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        url.push_str(query);
        url.push('&');
    }
    url.push_str(&format!(
        "encoding={}&v={}",
        config.encoding, config.version
    ));
    url
}
