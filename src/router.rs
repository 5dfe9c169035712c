//! Pattern-matching HTTP multiplexer with ordered middleware
//!
//! Routes are kept sorted by descending pattern length and the first pattern
//! that matches wins. Longer patterns are assumed to be more specific; this is
//! a plain string-length rule, not true longest-match.
//!
//! Patterns are `/`-separated segments matched on segment boundaries against
//! the start of the request path:
//! - `literal` must equal the path segment
//! - `:name` or `{name}` captures one segment
//! - `*` captures the remainder of the path (possibly empty)
//!
//! Captures are handed to handlers as positional parameters.

use crate::module::Route;
use futures::future::BoxFuture;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::{Request, Response};
use parking_lot::RwLock;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

pub type HubBody = BoxBody<Bytes, hyper::Error>;
pub type HubResponse = Response<HubBody>;

pub fn full_body(data: impl Into<Bytes>) -> HubBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

pub fn empty_body() -> HubBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// Everything a handler gets for one request
pub struct RequestContext {
    pub request: Request<HubBody>,
    pub remote_addr: SocketAddr,
    pub is_tls: bool,
    /// Positional captures of the matched pattern
    pub params: Vec<String>,
    /// Module owning the matched route, `None` when unmatched
    pub module: Option<String>,
    pub route: Option<Route>,
}

impl RequestContext {
    pub fn new(request: Request<HubBody>, remote_addr: SocketAddr) -> Self {
        Self {
            request,
            remote_addr,
            is_tls: false,
            params: Vec::new(),
            module: None,
            route: None,
        }
    }

    pub fn with_tls(mut self, is_tls: bool) -> Self {
        self.is_tls = is_tls;
        self
    }

    pub fn path(&self) -> &str {
        self.request.uri().path()
    }

    pub fn is_routed(&self) -> bool {
        self.module.is_some()
    }
}

/// Terminal request handler
pub trait Handler: Send + Sync {
    fn call(&self, ctx: RequestContext) -> BoxFuture<'_, HubResponse>;
}

/// Wraps a handler with extra behaviour. The first registered middleware runs outermost.
pub trait Middleware: Send + Sync {
    fn wrap(&self, next: Arc<dyn Handler>) -> Arc<dyn Handler>;
}

struct FnHandler<F>(F);

impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(RequestContext) -> Fut + Send + Sync,
    Fut: Future<Output = HubResponse> + Send + 'static,
{
    fn call(&self, ctx: RequestContext) -> BoxFuture<'_, HubResponse> {
        Box::pin((self.0)(ctx))
    }
}

/// Handler from an async closure
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HubResponse> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param,
    Rest,
}

/// A compiled route pattern
#[derive(Debug, Clone)]
pub struct Pattern {
    raw: String,
    segments: Vec<Segment>,
}

impl Pattern {
    pub fn parse(raw: &str) -> Self {
        let mut segments = Vec::new();
        for part in raw.split('/').filter(|p| !p.is_empty()) {
            if part == "*" {
                segments.push(Segment::Rest);
                break;
            }
            let is_param = part.starts_with(':')
                || (part.starts_with('{') && part.ends_with('}') && part.len() > 2);
            if is_param {
                segments.push(Segment::Param);
            } else {
                segments.push(Segment::Literal(part.to_string()));
            }
        }
        Self {
            raw: raw.to_string(),
            segments,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// True when this pattern would be tried before an exact route for `path` and match it
    pub fn shadows(&self, path: &str) -> bool {
        self.len() >= path.len() && self.matches(path).is_some()
    }

    /// Captured parameters when `path` starts with this pattern
    pub fn matches(&self, path: &str) -> Option<Vec<String>> {
        let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
        let mut params = Vec::new();

        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Rest => {
                    params.push(parts.get(i..).map(|rest| rest.join("/")).unwrap_or_default());
                    return Some(params);
                }
                Segment::Literal(expected) => {
                    if parts.get(i) != Some(&expected.as_str()) {
                        return None;
                    }
                }
                Segment::Param => {
                    let value = parts.get(i)?;
                    params.push(
                        urlencoding::decode(value)
                            .map(|v| v.into_owned())
                            .unwrap_or_else(|_| value.to_string()),
                    );
                }
            }
        }

        Some(params)
    }
}

struct PatternRoute {
    pattern: Pattern,
    handler: Arc<dyn Handler>,
    module: Option<String>,
    route: Option<Route>,
}

pub struct Router {
    routes: RwLock<Vec<PatternRoute>>,
    middlewares: RwLock<Vec<Arc<dyn Middleware>>>,
    not_found: Arc<dyn Handler>,
}

impl Router {
    pub fn new(not_found: Arc<dyn Handler>) -> Self {
        Self {
            routes: RwLock::new(Vec::new()),
            middlewares: RwLock::new(Vec::new()),
            not_found,
        }
    }

    /// Register `pattern`. An existing route with the identical pattern is replaced.
    pub fn handle(
        &self,
        pattern: &str,
        handler: Arc<dyn Handler>,
        module: Option<String>,
        route: Option<Route>,
    ) {
        let entry = PatternRoute {
            pattern: Pattern::parse(pattern),
            handler,
            module,
            route,
        };

        let mut routes = self.routes.write();
        match routes.iter_mut().find(|r| r.pattern.as_str() == pattern) {
            Some(existing) => *existing = entry,
            None => routes.push(entry),
        }
        routes.sort_by(|a, b| b.pattern.len().cmp(&a.pattern.len()));
        debug!(pattern, routes = routes.len(), "Route registered");
    }

    pub fn use_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.middlewares.write().push(middleware);
    }

    /// Patterns in match order
    pub fn patterns(&self) -> Vec<String> {
        self.routes
            .read()
            .iter()
            .map(|r| r.pattern.as_str().to_string())
            .collect()
    }

    pub async fn dispatch(&self, mut ctx: RequestContext) -> HubResponse {
        let matched = {
            let routes = self.routes.read();
            routes.iter().find_map(|r| {
                r.pattern.matches(ctx.path()).map(|params| {
                    (params, Arc::clone(&r.handler), r.module.clone(), r.route.clone())
                })
            })
        };

        let terminal = match matched {
            Some((params, handler, module, route)) => {
                ctx.params = params;
                ctx.module = module;
                ctx.route = route;
                handler
            }
            None => {
                ctx.params.clear();
                ctx.module = None;
                ctx.route = None;
                Arc::clone(&self.not_found)
            }
        };

        let middlewares: Vec<_> = self.middlewares.read().iter().cloned().collect();
        let handler = middlewares
            .iter()
            .rev()
            .fold(terminal, |next, middleware| middleware.wrap(next));

        handler.call(ctx).await
    }
}
