use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};

use axum::{
    extract::{ConnectInfo, FromRequestParts, Request, State},
    http::{HeaderMap, HeaderName, header, request::Parts},
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{DecodingKey, Validation, decode};
use tracing::debug;

use sarhni_types::api::Claims;

use crate::state::AppState;

/// Decode the bearer token, if any, into request extensions.
///
/// A missing or invalid token is not an error here: the request simply
/// carries no session and the authorization helper decides what that means.
pub async fn session(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    if let Some(claims) = bearer_claims(req.headers(), &state.jwt_secret) {
        req.extensions_mut().insert(claims);
    }
    next.run(req).await
}

fn bearer_claims(headers: &HeaderMap, secret: &str) -> Option<Claims> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))?;

    match decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    ) {
        Ok(data) => Some(data.claims),
        Err(e) => {
            debug!("Ignoring invalid session token: {}", e);
            None
        }
    }
}

/// The caller's session claims, as decoded by [`session`].
#[derive(Debug, Clone, Default)]
pub struct Session(pub Option<Claims>);

impl Session {
    pub fn anonymous() -> Self {
        Self(None)
    }

    pub fn claims(&self) -> Option<&Claims> {
        self.0.as_ref()
    }
}

impl<S> FromRequestParts<S> for Session
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Session(parts.extensions.get::<Claims>().cloned()))
    }
}

/// Best-known client address, used to key rate limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientIp {
    /// Direct loopback connection that carried no forwarded address.
    Local,
    Remote(IpAddr),
    Unknown,
}

impl ClientIp {
    /// Rate-limit key for this client. Only [`ClientIp::Local`] is exempt
    /// (`None`); callers with no known address share a single bucket.
    pub fn limiter_key(&self) -> Option<String> {
        match self {
            ClientIp::Local => None,
            ClientIp::Remote(ip) => Some(ip.to_canonical().to_string()),
            ClientIp::Unknown => Some("unknown".to_string()),
        }
    }
}

impl FromRequestParts<AppState> for ClientIp {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        Ok(client_ip(&parts.headers, &state.trusted_ip_header, peer))
    }
}

/// Resolution order: the header our own proxy sets, then the socket peer.
/// `X-Forwarded-For` is client-controlled, so its first hop is only read when
/// the peer is a local proxy. An address taken from a header is never
/// treated as local, whatever it says.
pub fn client_ip(
    headers: &HeaderMap,
    trusted_header: &HeaderName,
    peer: Option<SocketAddr>,
) -> ClientIp {
    let header_ip = |name: &HeaderName, first_hop: bool| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| if first_hop { s.split(',').next() } else { Some(s) })
            .and_then(|s| s.trim().parse::<IpAddr>().ok())
    };

    if let Some(ip) = header_ip(trusted_header, false) {
        return ClientIp::Remote(ip);
    }
    match peer.map(|addr| addr.ip().to_canonical()) {
        Some(ip) if ip.is_loopback() => {
            header_ip(&HeaderName::from_static("x-forwarded-for"), true)
                .map_or(ClientIp::Local, ClientIp::Remote)
        }
        Some(ip) => ClientIp::Remote(ip),
        None => ClientIp::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn trusted() -> HeaderName {
        HeaderName::from_static("x-real-ip")
    }

    fn forwarded(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static(value));
        headers
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn trusted_header_wins_over_forwarded_for() {
        let mut headers = forwarded("198.51.100.1, 10.0.0.1");
        headers.insert("x-real-ip", HeaderValue::from_static("203.0.113.7"));
        let ip = client_ip(&headers, &trusted(), Some(addr("127.0.0.1:4000")));
        assert_eq!(ip, ClientIp::Remote("203.0.113.7".parse().unwrap()));
    }

    #[test]
    fn forwarded_for_only_counts_behind_a_local_proxy() {
        let headers = forwarded("198.51.100.1, 10.0.0.1");
        assert_eq!(
            client_ip(&headers, &trusted(), Some(addr("127.0.0.1:4000"))),
            ClientIp::Remote("198.51.100.1".parse().unwrap())
        );
        assert_eq!(
            client_ip(&headers, &trusted(), Some(addr("192.0.2.9:5555"))),
            ClientIp::Remote("192.0.2.9".parse().unwrap())
        );
        assert_eq!(client_ip(&headers, &trusted(), None), ClientIp::Unknown);
    }

    #[test]
    fn spoofed_loopback_headers_are_still_limited() {
        let remote = Some(addr("192.0.2.9:5555"));
        let ip = client_ip(&forwarded("127.0.0.1"), &trusted(), remote);
        assert_eq!(ip.limiter_key(), Some("192.0.2.9".to_string()));

        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("::1"));
        let ip = client_ip(&headers, &trusted(), remote);
        assert_eq!(ip, ClientIp::Remote("::1".parse().unwrap()));
        assert_eq!(ip.limiter_key(), Some("::1".to_string()));

        let ip = client_ip(&forwarded("127.0.0.1"), &trusted(), Some(addr("127.0.0.1:4000")));
        assert_eq!(ip.limiter_key(), Some("127.0.0.1".to_string()));
    }

    #[test]
    fn only_a_direct_loopback_peer_is_exempt() {
        let local = client_ip(&HeaderMap::new(), &trusted(), Some(addr("127.0.0.1:4000")));
        assert_eq!(local, ClientIp::Local);
        assert_eq!(local.limiter_key(), None);

        let mapped = client_ip(&HeaderMap::new(), &trusted(), Some(addr("[::ffff:127.0.0.1]:4000")));
        assert_eq!(mapped, ClientIp::Local);

        assert_eq!(
            ClientIp::Remote("::ffff:203.0.113.7".parse().unwrap()).limiter_key(),
            Some("203.0.113.7".to_string())
        );
        assert_eq!(ClientIp::Unknown.limiter_key(), Some("unknown".to_string()));
    }
}
