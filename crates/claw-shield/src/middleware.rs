//! axum middleware around [`RequestShield`].
//!
//! Each guard is a `from_fn_with_state` handler that either forwards the
//! request or returns the [`ShieldError`] it was rejected with. [`protect`]
//! installs all of them in pipeline order.
//!
//! A request with no resolvable source address skips every per-source guard.
//! Only the size cap still applies, since it keeps no state.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::Json;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderValue, header};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::Router;
use tracing::warn;

use crate::error::ShieldError;
use crate::protection::RequestShield;
use crate::stats::StatsSnapshot;

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Wrap `router` with every guard. The gate runs first, the classifier last.
pub fn protect<S>(router: Router<S>, shield: Arc<RequestShield>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    // Layers added later run earlier.
    router
        .layer(middleware::from_fn_with_state(
            Arc::clone(&shield),
            suspicious_activity_guard,
        ))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&shield),
            enumeration_guard,
        ))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&shield),
            brute_force_guard,
        ))
        .layer(middleware::from_fn_with_state(Arc::clone(&shield), size_guard))
        .layer(middleware::from_fn_with_state(shield, block_gate))
}

/// Reject blocked sources.
pub async fn block_gate(
    State(shield): State<Arc<RequestShield>>,
    request: Request,
    next: Next,
) -> Result<Response, ShieldError> {
    let Some(source) = request_source(&shield, &request) else {
        warn!(
            path = %request.uri().path(),
            "No source address, per-source guards skipped"
        );
        return Ok(next.run(request).await);
    };
    shield.check_gate(&source, request.uri().path())?;
    Ok(next.run(request).await)
}

/// Reject requests whose `Content-Length` is over the cap.
pub async fn size_guard(
    State(shield): State<Arc<RequestShield>>,
    request: Request,
    next: Next,
) -> Result<Response, ShieldError> {
    let source =
        request_source(&shield, &request).unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    shield.check_size(
        &source,
        request.uri().path(),
        content_length(request.headers()),
    )?;
    Ok(next.run(request).await)
}

/// Count attempts on protected endpoints.
pub async fn brute_force_guard(
    State(shield): State<Arc<RequestShield>>,
    request: Request,
    next: Next,
) -> Result<Response, ShieldError> {
    let Some(source) = request_source(&shield, &request) else {
        return Ok(next.run(request).await);
    };
    shield.check_brute_force(&source, request.uri().path())?;
    Ok(next.run(request).await)
}

/// Throttle ID lookups.
pub async fn enumeration_guard(
    State(shield): State<Arc<RequestShield>>,
    request: Request,
    next: Next,
) -> Result<Response, ShieldError> {
    let Some(source) = request_source(&shield, &request) else {
        return Ok(next.run(request).await);
    };
    shield.check_enumeration(&source, request.uri().path())?;
    Ok(next.run(request).await)
}

/// Classify the request and escalate repeat offenders.
pub async fn suspicious_activity_guard(
    State(shield): State<Arc<RequestShield>>,
    request: Request,
    next: Next,
) -> Result<Response, ShieldError> {
    let Some(source) = request_source(&shield, &request) else {
        return Ok(next.run(request).await);
    };
    let uri = request.uri();
    let url = uri.path_and_query().map_or_else(|| uri.path(), |pq| pq.as_str());
    let user_agent = request
        .headers()
        .get(header::USER_AGENT)
        .map(HeaderValue::as_bytes);

    shield.inspect(&source, uri.path(), url, user_agent)?;
    Ok(next.run(request).await)
}

/// Handle GET on the stats route.
pub async fn stats_handler(State(shield): State<Arc<RequestShield>>) -> Json<StatsSnapshot> {
    Json(shield.snapshot())
}

/// Source address of `request`.
///
/// With `trust_forwarded_for` the first valid `X-Forwarded-For` hop wins.
/// Otherwise the peer address from `ConnectInfo` is used. Returns `None`
/// when the server was not started with connect info.
#[must_use]
pub fn source_ip(request: &Request, trust_forwarded_for: bool) -> Option<IpAddr> {
    if trust_forwarded_for {
        if let Some(ip) = forwarded_for(request.headers()) {
            return Some(ip);
        }
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}

fn request_source(shield: &RequestShield, request: &Request) -> Option<IpAddr> {
    source_ip(request, shield.config().trust_forwarded_for)
}

fn forwarded_for(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get(X_FORWARDED_FOR)?
        .to_str()
        .ok()?
        .split(',')
        .next()?
        .trim()
        .parse()
        .ok()
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}
