//! Per-client request rate limiting.

use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use governor::{DefaultKeyedRateLimiter, Quota};

use super::error::ApiError;

/// Clients tracked before stale entries are dropped
const MAX_TRACKED_CLIENTS: usize = 10_000;

/// Span the per-client limit applies to
const WINDOW: Duration = Duration::from_secs(60);

pub type ClientRateLimiter = DefaultKeyedRateLimiter<IpAddr>;

/// Middleware state: the limiter and how clients are identified
#[derive(Clone)]
pub struct RateLimitState {
    pub limiter: Arc<ClientRateLimiter>,
    /// Honour `X-Forwarded-For`/`X-Real-IP`; otherwise only the socket address counts
    pub trust_proxy: bool,
}

impl RateLimitState {
    pub fn new(per_minute: u32, trust_proxy: bool) -> Self {
        Self {
            limiter: Arc::new(ClientRateLimiter::keyed(client_quota(per_minute))),
            trust_proxy,
        }
    }
}

/// GCRA quota admitting at most `per_minute` requests in any 60 s window.
///
/// Half of the limit (rounded up) is available as an immediate burst. The rest
/// refills one at a time, evenly spread over the window.
pub fn client_quota(per_minute: u32) -> Quota {
    let limit = per_minute.max(1);
    let burst = limit.div_ceil(2);
    let refills = limit - burst;
    let period = if refills == 0 { WINDOW } else { WINDOW / refills };

    Quota::with_period(period)
        .unwrap_or_else(|| Quota::per_minute(NonZeroU32::MIN))
        .allow_burst(NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN))
}

pub async fn rate_limit(
    State(state): State<RateLimitState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    // Requests with no attributable address are not limited
    if let Some(ip) = client_ip(&request, state.trust_proxy) {
        if state.limiter.len() > MAX_TRACKED_CLIENTS {
            state.limiter.retain_recent();
        }
        if state.limiter.check_key(&ip).is_err() {
            tracing::warn!(ip = %ip, path = request.uri().path(), "rate limit exceeded");
            return ApiError::RateLimited.into_response();
        }
    }

    next.run(request).await
}

/// Client address used as the rate limit key.
///
/// The socket address by default. With `trust_proxy`, `X-Forwarded-For` then
/// `X-Real-IP` take precedence over it.
pub fn client_ip(request: &Request<Body>, trust_proxy: bool) -> Option<IpAddr> {
    if trust_proxy {
        if let Some(ip) = forwarded_ip(request) {
            return Some(ip);
        }
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip())
}

fn forwarded_ip(request: &Request<Body>) -> Option<IpAddr> {
    let header = |name: &str| {
        request
            .headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
    };

    if let Some(forwarded) = header("X-Forwarded-For") {
        // First hop is the original client
        if let Some(Ok(ip)) = forwarded.split(',').next().map(|first| first.trim().parse()) {
            return Some(ip);
        }
    }

    header("X-Real-IP").and_then(|value| value.trim().parse().ok())
}
