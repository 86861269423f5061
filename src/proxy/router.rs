//! Route classification for incoming HTTP requests.
//!
//! The route table is a fixed, ordered list of path prefixes checked
//! longest-prefix-first, so exactly one route matches any request path.
//! Matched routes carry the upstream class, the rate class, and whether
//! the prefix is stripped before forwarding.

use std::borrow::Cow;

/// Upstream class a route proxies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteClass {
    Frontend,
    Backend,
    Monitoring,
}

/// Rate-limit class applied before proxying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateClass {
    /// Backend and monitoring traffic share the stricter api budget.
    Api,
    Frontend,
}

impl RateClass {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::Frontend => "frontend",
        }
    }
}

/// What to do with a matched request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteAction {
    /// Proxy to `class`, optionally stripping the matched prefix from
    /// the forwarded path.
    Proxy {
        class: RouteClass,
        rate: RateClass,
        strip_prefix: bool,
    },
    /// Answer locally with the synthetic health response; never rate
    /// limited, never proxied.
    Health,
}

/// One entry of the route table.
#[derive(Debug, Clone, Copy)]
pub struct Route {
    pub prefix: &'static str,
    pub action: RouteAction,
}

impl Route {
    /// Path forwarded upstream: the matched prefix stripped exactly
    /// once, `/api/cache/stats` becoming `/cache/stats`.
    pub fn upstream_path<'a>(&self, path: &'a str) -> Cow<'a, str> {
        let strip = matches!(self.action, RouteAction::Proxy { strip_prefix: true, .. });
        if !strip {
            return Cow::Borrowed(path);
        }
        let stripped = self.prefix.trim_end_matches('/');
        match path.strip_prefix(stripped) {
            Some("") => Cow::Borrowed("/"),
            Some(rest) => Cow::Borrowed(rest),
            None => Cow::Borrowed(path),
        }
    }
}

/// The ordered route table.
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    /// The edge topology: `/monitoring/` and `/api/` are stripped and
    /// proxied, `/health` answers locally, `/` catches everything else
    /// for the frontend.
    pub fn standard() -> Self {
        Self::new(vec![
            Route {
                prefix: "/monitoring/",
                action: RouteAction::Proxy {
                    class: RouteClass::Monitoring,
                    rate: RateClass::Api,
                    strip_prefix: true,
                },
            },
            Route {
                prefix: "/health",
                action: RouteAction::Health,
            },
            Route {
                prefix: "/api/",
                action: RouteAction::Proxy {
                    class: RouteClass::Backend,
                    rate: RateClass::Api,
                    strip_prefix: true,
                },
            },
            Route {
                prefix: "/",
                action: RouteAction::Proxy {
                    class: RouteClass::Frontend,
                    rate: RateClass::Frontend,
                    strip_prefix: false,
                },
            },
        ])
    }

    /// Builds a table from routes, ordering them longest-prefix-first so
    /// the first match during classification is the longest.
    pub fn new(mut routes: Vec<Route>) -> Self {
        routes.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Self { routes }
    }

    /// Longest-prefix classification. `None` only for paths that do not
    /// start with `/` (the `/` route catches everything else).
    pub fn classify(&self, path: &str) -> Option<&Route> {
        self.routes.iter().find(|route| path.starts_with(route.prefix))
    }
}
