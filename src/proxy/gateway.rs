//! Pingora ProxyHttp implementation for the edge router.
//!
//! Ties the route table, rate limiters, and upstream classes into
//! Pingora's request lifecycle: classification and rate limiting in
//! `request_filter`, least-connections selection in `upstream_peer`,
//! path rewriting and forwarded headers in `upstream_request_filter`,
//! security headers on every response, and failure accounting with
//! bounded retry across the failure hooks.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use pingora_core::prelude::*;
use pingora_core::upstreams::peer::HttpPeer;
use pingora_http::{RequestHeader, ResponseHeader};
use pingora_proxy::{ProxyHttp, Session};

use crate::config::{ClientKeySource, Config};
use crate::error::GatewayError;

use super::rate_limit::{
    ClientKeyExtractor, Decision, ForwardedForKey, RateLimiter, RemoteAddrKey,
};
use super::router::{RateClass, Route, RouteAction, RouteClass, RouteTable};
use super::upstream::UpstreamClass;

/// Response headers applied to every response, success or error.
const SECURITY_HEADERS: &[(&str, &str)] = &[
    ("X-Frame-Options", "DENY"),
    ("X-Content-Type-Options", "nosniff"),
    ("X-XSS-Protection", "1; mode=block"),
];

const HEALTH_BODY: &str = "healthy\n";

/// Per-request context for the edge proxy.
///
/// Carries the matched route and the replica picked for this attempt so
/// the failure hooks can account against the right health state.
#[derive(Default)]
pub struct EdgeCtx {
    /// Route matched in `request_filter`; `None` for requests answered
    /// synthetically before upstream selection.
    pub route: Option<Route>,
    /// Index of the replica currently holding an active-connection slot.
    pub selected: Option<usize>,
    /// Replica indices already attempted for this request.
    pub tried: Vec<usize>,
}

/// The edge router proxy.
pub struct EdgeProxy {
    routes: RouteTable,
    frontend: UpstreamClass,
    backend: UpstreamClass,
    monitoring: UpstreamClass,
    api_limiter: Arc<RateLimiter>,
    frontend_limiter: Arc<RateLimiter>,
    key_extractor: Box<dyn ClientKeyExtractor>,
    connect_timeout: Duration,
    send_timeout: Duration,
    read_timeout: Duration,
}

impl EdgeProxy {
    pub fn new(cfg: &Config) -> Self {
        let key_extractor: Box<dyn ClientKeyExtractor> = match cfg.client_key_source {
            ClientKeySource::RemoteAddr => Box::new(RemoteAddrKey),
            ClientKeySource::ForwardedFor => Box::new(ForwardedForKey),
        };
        Self {
            routes: RouteTable::standard(),
            frontend: UpstreamClass::new(
                "frontend",
                &cfg.frontend_upstreams,
                cfg.max_fails,
                cfg.fail_timeout,
            ),
            backend: UpstreamClass::new(
                "backend",
                &cfg.planner_upstreams,
                cfg.max_fails,
                cfg.fail_timeout,
            ),
            monitoring: UpstreamClass::new(
                "monitoring",
                &cfg.monitoring_upstreams,
                cfg.max_fails,
                cfg.fail_timeout,
            ),
            api_limiter: Arc::new(RateLimiter::new(cfg.api_rate)),
            frontend_limiter: Arc::new(RateLimiter::new(cfg.frontend_rate)),
            key_extractor,
            connect_timeout: cfg.connect_timeout,
            send_timeout: cfg.send_timeout,
            read_timeout: cfg.read_timeout,
        }
    }

    /// Handles to the rate limiters, for the idle-bucket sweeper.
    pub fn rate_limiters(&self) -> Vec<Arc<RateLimiter>> {
        vec![Arc::clone(&self.api_limiter), Arc::clone(&self.frontend_limiter)]
    }

    fn upstreams(&self, class: RouteClass) -> &UpstreamClass {
        match class {
            RouteClass::Frontend => &self.frontend,
            RouteClass::Backend => &self.backend,
            RouteClass::Monitoring => &self.monitoring,
        }
    }

    fn limiter(&self, rate: RateClass) -> &RateLimiter {
        match rate {
            RateClass::Api => &self.api_limiter,
            RateClass::Frontend => &self.frontend_limiter,
        }
    }

    /// Final per-request accounting: returns the least-connections slot
    /// and, only when the request finished without an upstream error,
    /// resets the replica's failure window.
    ///
    /// A replica that accepts connections but fails every request must
    /// still accumulate failures, so success is recorded at completion,
    /// never at connect time.
    fn finish_request(&self, ctx: &mut EdgeCtx, failed: bool) {
        if let (Some(route), Some(idx)) = (ctx.route, ctx.selected.take()) {
            if let RouteAction::Proxy { class, .. } = route.action {
                let upstreams = self.upstreams(class);
                if !failed {
                    upstreams.record_success(idx);
                }
                upstreams.release(idx);
            }
        }
    }

    /// Maps a proxy-phase error to the taxonomy reported to the client.
    fn classify_proxy_error(&self, e: &Error, ctx: &EdgeCtx) -> GatewayError {
        let class = ctx
            .route
            .and_then(|route| match route.action {
                RouteAction::Proxy { class, .. } => Some(self.upstreams(class).name()),
                RouteAction::Health => None,
            })
            .unwrap_or("unknown");
        match e.etype() {
            ErrorType::ConnectTimedout | ErrorType::ReadTimedout | ErrorType::WriteTimedout => {
                GatewayError::UpstreamTimeout {
                    tries: ctx.tried.len(),
                }
            }
            _ => GatewayError::NoHealthyUpstream(class),
        }
    }
}

/// Adds the immutable security headers and drops the server banner.
fn apply_security_headers(resp: &mut ResponseHeader) -> Result<()> {
    for (name, value) in SECURITY_HEADERS {
        resp.insert_header(*name, *value)?;
    }
    resp.remove_header("Server");
    Ok(())
}

/// Writes a complete synthetic response with the security headers.
async fn respond(
    session: &mut Session,
    status: u16,
    body: &'static str,
    retry_after: Option<Duration>,
) -> Result<()> {
    let mut header = ResponseHeader::build(status, Some(5))?;
    header.insert_header("Content-Type", "text/plain")?;
    header.insert_header("Content-Length", body.len().to_string())?;
    if let Some(backoff) = retry_after {
        header.insert_header("Retry-After", backoff.as_secs().max(1).to_string())?;
    }
    apply_security_headers(&mut header)?;
    session
        .write_response_header(Box::new(header), false)
        .await?;
    session
        .write_response_body(Some(Bytes::from_static(body.as_bytes())), true)
        .await?;
    Ok(())
}

async fn respond_with_error(session: &mut Session, err: &GatewayError) -> Result<()> {
    session.set_keepalive(None);
    respond(session, err.status_code(), err.body(), err.retry_after()).await
}

/// The remote peer as a plain inet address, when it has one.
fn client_inet(session: &Session) -> Option<SocketAddr> {
    session
        .client_addr()
        .and_then(|addr| addr.as_inet())
        .copied()
}

/// Appends the client to an existing `X-Forwarded-For` chain rather
/// than replacing it, preserving upstream proxy hops.
fn append_forwarded_for(existing: Option<&str>, client_ip: &str) -> String {
    match existing {
        Some(chain) if !chain.is_empty() => format!("{chain}, {client_ip}"),
        _ => client_ip.to_string(),
    }
}

/// Hostname portion of a `host:port` spec, used for SNI.
fn host_only(spec: &str) -> String {
    if spec.starts_with('[') {
        if let Some(end) = spec.find(']') {
            return spec[1..end].to_string();
        }
    }
    spec.rsplit_once(':')
        .map(|(host, _)| host.to_string())
        .unwrap_or_else(|| spec.to_string())
}

#[async_trait]
impl ProxyHttp for EdgeProxy {
    type CTX = EdgeCtx;

    fn new_ctx(&self) -> Self::CTX {
        EdgeCtx::default()
    }

    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<bool> {
        let path = session.req_header().uri.path().to_string();

        let Some(route) = self.routes.classify(&path).copied() else {
            let err = GatewayError::BadRoute(path);
            tracing::debug!(error = %err, "unroutable request");
            respond_with_error(session, &err).await?;
            return Ok(true);
        };

        match route.action {
            RouteAction::Health => {
                // Terminal: never rate limited, never proxied.
                respond(session, 200, HEALTH_BODY, None).await?;
                Ok(true)
            }
            RouteAction::Proxy { class, rate, .. } => {
                let client = client_inet(session);
                let key = self
                    .key_extractor
                    .client_key(client.as_ref(), &session.req_header().headers);

                if let Decision::Limited { retry_after } = self.limiter(rate).check(&key) {
                    let err = GatewayError::RateLimited {
                        class: rate.name(),
                        retry_after,
                    };
                    tracing::info!(client = %key, class = rate.name(), "rate limit exceeded");
                    respond_with_error(session, &err).await?;
                    return Ok(true);
                }

                let upstreams = self.upstreams(class);
                if !upstreams.has_available(Instant::now()) {
                    let err = GatewayError::NoHealthyUpstream(upstreams.name());
                    tracing::warn!(class = upstreams.name(), "all replicas ejected");
                    respond_with_error(session, &err).await?;
                    return Ok(true);
                }

                ctx.route = Some(route);
                Ok(false)
            }
        }
    }

    async fn upstream_peer(
        &self,
        _session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        let route = ctx
            .route
            .ok_or_else(|| Error::explain(ErrorType::InternalError, "no route selected"))?;
        let RouteAction::Proxy { class, .. } = route.action else {
            return Err(Error::explain(
                ErrorType::InternalError,
                "terminal route reached upstream selection",
            ));
        };

        let upstreams = self.upstreams(class);
        // A retry re-selects; the failed attempt's slot goes back first.
        if let Some(prev) = ctx.selected.take() {
            upstreams.release(prev);
        }

        let idx = upstreams.select(&ctx.tried, Instant::now()).ok_or_else(|| {
            Error::explain(
                ErrorType::HTTPStatus(502),
                format!("no healthy replica left in class {}", upstreams.name()),
            )
        })?;
        ctx.selected = Some(idx);
        ctx.tried.push(idx);

        let replica = upstreams.replica(idx);
        tracing::debug!(
            class = upstreams.name(),
            replica = %replica.host,
            active = replica.active_connections(),
            "selected upstream"
        );

        let mut peer = HttpPeer::new(replica.addr, false, host_only(&replica.host));
        peer.options.connection_timeout = Some(self.connect_timeout);
        peer.options.write_timeout = Some(self.send_timeout);
        peer.options.read_timeout = Some(self.read_timeout);
        Ok(Box::new(peer))
    }

    async fn upstream_request_filter(
        &self,
        session: &mut Session,
        upstream_request: &mut RequestHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        if let Some(route) = ctx.route {
            let rewritten = {
                let path = upstream_request.uri.path();
                let new_path = route.upstream_path(path);
                if new_path != path {
                    Some(match upstream_request.uri.query() {
                        Some(query) => format!("{new_path}?{query}"),
                        None => new_path.into_owned(),
                    })
                } else {
                    None
                }
            };
            if let Some(path_and_query) = rewritten {
                let uri = path_and_query.parse::<http::Uri>().map_err(|e| {
                    Error::explain(
                        ErrorType::InternalError,
                        format!("rewritten uri {path_and_query:?} invalid: {e}"),
                    )
                })?;
                upstream_request.set_uri(uri);
            }
        }

        if let Some(client) = client_inet(session) {
            let client_ip = client.ip().to_string();
            let chain = session
                .req_header()
                .headers
                .get("x-forwarded-for")
                .and_then(|value| value.to_str().ok());
            let forwarded = append_forwarded_for(chain, &client_ip);
            upstream_request.insert_header("X-Real-IP", client_ip)?;
            upstream_request.insert_header("X-Forwarded-For", forwarded)?;
        }
        upstream_request.insert_header("X-Forwarded-Proto", "http")?;
        Ok(())
    }

    async fn response_filter(
        &self,
        _session: &mut Session,
        upstream_response: &mut ResponseHeader,
        _ctx: &mut Self::CTX,
    ) -> Result<()> {
        apply_security_headers(upstream_response)
    }

    fn fail_to_connect(
        &self,
        _session: &mut Session,
        _peer: &HttpPeer,
        ctx: &mut Self::CTX,
        mut e: Box<Error>,
    ) -> Box<Error> {
        if let (Some(route), Some(idx)) = (ctx.route, ctx.selected) {
            if let RouteAction::Proxy { class, .. } = route.action {
                let upstreams = self.upstreams(class);
                upstreams.record_failure(idx, Instant::now());
                // Bounded by replica count: tried indices are excluded.
                if upstreams.has_candidate(&ctx.tried, Instant::now()) {
                    e.set_retry(true);
                }
            }
        }
        e
    }

    fn error_while_proxy(
        &self,
        peer: &HttpPeer,
        session: &mut Session,
        e: Box<Error>,
        ctx: &mut Self::CTX,
        client_reused: bool,
    ) -> Box<Error> {
        let mut remaining = false;
        if let (Some(route), Some(idx)) = (ctx.route, ctx.selected) {
            if let RouteAction::Proxy { class, .. } = route.action {
                let upstreams = self.upstreams(class);
                upstreams.record_failure(idx, Instant::now());
                remaining = upstreams.has_candidate(&ctx.tried, Instant::now());
            }
        }

        let mut e = e.more_context(format!("Peer: {peer}"));
        // Retry only if the client saw nothing and another replica remains.
        if remaining
            && client_reused
            && session.response_written().is_none()
            && !session.as_ref().retry_buffer_truncated()
        {
            e.set_retry(true);
        }
        e
    }

    async fn fail_to_proxy(&self, session: &mut Session, e: &Error, ctx: &mut Self::CTX) -> u16 {
        let err = self.classify_proxy_error(e, ctx);
        let code = match e.etype() {
            ErrorType::HTTPStatus(code) => *code,
            _ => err.status_code(),
        };
        tracing::warn!(error = %e, surfaced = %err, status = code, "request failed");
        if session.response_written().is_none() {
            if let Err(write_err) = respond(session, code, err.body(), None).await {
                tracing::debug!(error = %write_err, "failed to write error response");
            }
        }
        code
    }

    async fn logging(&self, session: &mut Session, e: Option<&Error>, ctx: &mut Self::CTX) {
        let replica = ctx.route.and_then(|route| match route.action {
            RouteAction::Proxy { class, .. } => ctx
                .selected
                .map(|idx| self.upstreams(class).replica(idx).host.clone()),
            RouteAction::Health => None,
        });

        self.finish_request(ctx, e.is_some());

        let status = session
            .response_written()
            .map(|resp| resp.status.as_u16())
            .unwrap_or(0);
        let method = session.req_header().method.as_str();
        let path = session.req_header().uri.path();

        tracing::info!(
            method = method,
            path = path,
            status = status,
            replica = replica.as_deref().unwrap_or("-"),
            error = ?e,
            "request completed"
        );
    }
}
