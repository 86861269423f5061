//! Error taxonomy for requests the router rejects itself.
//!
//! Replica-level failures (refused connections, timeouts) are absorbed
//! and retried against sibling replicas; the variants here are what is
//! left to report to the client once that absorption is exhausted.

use std::time::Duration;

use thiserror::Error;

/// A request-scoped failure surfaced to the client.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The client exhausted its token bucket for the matched rate class.
    #[error("rate limit exceeded for class {class}")]
    RateLimited {
        class: &'static str,
        retry_after: Duration,
    },

    /// Every replica of the target upstream class is currently ejected.
    #[error("no healthy upstream in class {0}")]
    NoHealthyUpstream(&'static str),

    /// Connect/send/read deadlines expired and no untried replica remained.
    #[error("upstream timed out after {tries} tries")]
    UpstreamTimeout { tries: usize },

    /// No route matched the request path.
    #[error("no route for path {0}")]
    BadRoute(String),
}

impl GatewayError {
    /// HTTP status reported to the client.
    ///
    /// Rate-limit rejections use 503 with a `Retry-After` hint; the
    /// rejection status was never pinned by the edge configuration this
    /// router replaces, so the proxied-convention default applies.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::RateLimited { .. } => 503,
            Self::NoHealthyUpstream(_) => 503,
            Self::UpstreamTimeout { .. } => 502,
            Self::BadRoute(_) => 404,
        }
    }

    /// Suggested client backoff, when one applies.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Short plain-text body for the rejection response.
    pub fn body(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate limit exceeded\n",
            Self::NoHealthyUpstream(_) => "service unavailable\n",
            Self::UpstreamTimeout { .. } => "upstream timeout\n",
            Self::BadRoute(_) => "not found\n",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let limited = GatewayError::RateLimited {
            class: "api",
            retry_after: Duration::from_secs(1),
        };
        assert_eq!(limited.status_code(), 503);
        assert_eq!(GatewayError::NoHealthyUpstream("backend").status_code(), 503);
        assert_eq!(GatewayError::UpstreamTimeout { tries: 2 }.status_code(), 502);
        assert_eq!(GatewayError::BadRoute("*".into()).status_code(), 404);
    }

    #[test]
    fn test_retry_after_only_for_rate_limit() {
        let limited = GatewayError::RateLimited {
            class: "frontend",
            retry_after: Duration::from_secs(3),
        };
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(3)));
        assert_eq!(GatewayError::NoHealthyUpstream("backend").retry_after(), None);
    }

    #[test]
    fn test_display_names_the_class() {
        let err = GatewayError::NoHealthyUpstream("monitoring");
        assert_eq!(err.to_string(), "no healthy upstream in class monitoring");
    }
}
