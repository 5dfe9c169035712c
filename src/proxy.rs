//! Reverse proxy handler for module routes
//!
//! Every request re-reads the module from the Registry, so state changes take
//! effect immediately: non-`Online` modules get a placeholder page, `bind`
//! modules with a root serve files, `reverse` modules are forwarded.

use crate::error::{ErrorPage, PageRenderer};
use crate::files;
use crate::module::{ModuleDescriptor, ModuleState, Route};
use crate::pool::ConnectionPool;
use crate::registry::Registry;
use crate::router::{Handler, HubResponse, RequestContext};
use dashmap::DashMap;
use futures::future::BoxFuture;
use hyper::header::HeaderValue;
use hyper::{StatusCode, Uri};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

const DEFAULT_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Rewrite a request path for the backend.
///
/// The `from` prefix is stripped unless it is `/`, then `to` is prepended
/// unless it is `/` or the path already starts with it. Identical `from` and
/// `to` leave the path untouched.
pub fn rewrite_path(path: &str, from: &str, to: &str) -> String {
    if from == to {
        return path.to_string();
    }

    let from = from.trim_end_matches('/');
    let mut rewritten = if from.is_empty() {
        path.to_string()
    } else {
        path.strip_prefix(from).unwrap_or(path).to_string()
    };
    if !rewritten.starts_with('/') {
        rewritten.insert(0, '/');
    }

    let to = to.trim_end_matches('/');
    if !to.is_empty() && !starts_with_segment(&rewritten, to) {
        rewritten = if rewritten == "/" {
            to.to_string()
        } else {
            format!("{}{}", to, rewritten)
        };
    }
    rewritten
}

fn starts_with_segment(path: &str, prefix: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

pub struct ReverseProxy {
    registry: Arc<Registry>,
    pool: Arc<ConnectionPool>,
    pages: Arc<PageRenderer>,
    request_timeout: Duration,
    /// Consecutive backend failures after which a module is marked `Error` (0 disables)
    error_threshold: u32,
    failures: DashMap<String, u32>,
}

impl ReverseProxy {
    pub fn new(
        registry: Arc<Registry>,
        pool: Arc<ConnectionPool>,
        pages: Arc<PageRenderer>,
        request_timeout: Duration,
        error_threshold: u32,
    ) -> Self {
        Self {
            registry,
            pool,
            pages,
            request_timeout,
            error_threshold,
            failures: DashMap::new(),
        }
    }

    pub async fn serve(&self, ctx: RequestContext) -> HubResponse {
        let module = ctx.module.as_deref().and_then(|name| self.registry.get(name));
        let module = match module {
            Some(module) if module.state == ModuleState::Online => module,
            other => {
                let state = other.map(|m| m.state);
                debug!(module = ?ctx.module, state = ?state, path = ctx.path(), "Module not online, serving placeholder");
                return self.pages.placeholder(state);
            }
        };
        let route = ctx.route.clone().unwrap_or_else(|| Route::new("/", "/"));

        if module.types.is_bind() {
            if let Some(root) = &module.binding.root {
                let path = rewrite_path(ctx.path(), &route.from, "/");
                return files::serve(root, &path, ctx.request.method()).await;
            }
        }

        if module.types.is_reverse() {
            return self.forward(ctx, &module, &route).await;
        }

        if module.types.is_bind() {
            warn!(module = %module.name, "Bind module has no root configured");
            return self.pages.render(&ErrorPage::new(
                "Error",
                StatusCode::BAD_REQUEST,
                "Bind root not configured",
            ));
        }

        warn!(module = %module.name, "Module has neither bind nor reverse type");
        self.pages.render(&ErrorPage::new(
            "Error",
            StatusCode::INTERNAL_SERVER_ERROR,
            "Module is not routable",
        ))
    }

    async fn forward(
        &self,
        mut ctx: RequestContext,
        module: &ModuleDescriptor,
        route: &Route,
    ) -> HubResponse {
        if module.binding.protocol != "http" {
            warn!(module = %module.name, protocol = %module.binding.protocol, "Unsupported backend protocol");
            return self.backend_error(&module.name, StatusCode::BAD_GATEWAY, "Backend protocol not supported");
        }
        let authority = match module.binding.authority() {
            Some(authority) => authority,
            None => {
                warn!(module = %module.name, "Module has no port bound");
                return self.backend_error(&module.name, StatusCode::BAD_GATEWAY, "Backend address unknown");
            }
        };

        let path = rewrite_path(ctx.path(), &route.from, &route.to);
        let path_and_query = match ctx.request.uri().query() {
            Some(query) => format!("{}?{}", path, query),
            None => path,
        };
        match path_and_query.parse::<Uri>() {
            Ok(uri) => *ctx.request.uri_mut() = uri,
            Err(e) => {
                warn!(module = %module.name, error = %e, "Rewritten path is not a valid URI");
                return self.backend_error(&module.name, StatusCode::BAD_REQUEST, "Invalid request path");
            }
        }

        let request_id = ctx
            .request
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        // X-Forwarded-* are overwritten, never appended: this gateway is the first trusted hop
        let headers = ctx.request.headers_mut();
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            headers.insert(X_REQUEST_ID, value);
        }
        if let Ok(value) = HeaderValue::from_str(&ctx.remote_addr.ip().to_string()) {
            headers.insert(X_FORWARDED_FOR, value);
        }
        if let Some(host) = headers.get(hyper::header::HOST).cloned() {
            headers.insert(X_FORWARDED_HOST, host);
        }
        let proto = if ctx.is_tls { "https" } else { "http" };
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));
        if let Ok(value) = HeaderValue::from_str(&authority) {
            headers.insert(hyper::header::HOST, value);
        }
        if !headers.contains_key(hyper::header::USER_AGENT) {
            headers.insert(
                hyper::header::USER_AGENT,
                HeaderValue::from_static(DEFAULT_USER_AGENT),
            );
        }

        debug!(
            module = %module.name,
            backend = %authority,
            path = %path_and_query,
            request_id,
            "Forwarding request"
        );

        let result =
            tokio::time::timeout(self.request_timeout, self.pool.send_request(ctx.request, &authority))
                .await;

        match result {
            Ok(Ok(response)) if response.status() == StatusCode::NOT_FOUND => {
                warn!(module = %module.name, path = %path_and_query, "Backend answered 404");
                self.backend_error(&module.name, StatusCode::BAD_GATEWAY, "404 error from the host")
            }
            Ok(Ok(response)) => {
                self.failures.remove(&module.name);
                response
            }
            Ok(Err(e)) => {
                error!(module = %module.name, backend = %authority, error = %e, "Failed to forward request");
                self.backend_error(&module.name, StatusCode::BAD_GATEWAY, "Failed to connect to backend")
            }
            Err(_) => {
                warn!(
                    module = %module.name,
                    backend = %authority,
                    timeout_secs = self.request_timeout.as_secs(),
                    "Request timed out"
                );
                self.backend_error(
                    &module.name,
                    StatusCode::GATEWAY_TIMEOUT,
                    format!("Request timed out after {} seconds", self.request_timeout.as_secs()),
                )
            }
        }
    }

    fn backend_error(&self, module: &str, code: StatusCode, message: impl Into<String>) -> HubResponse {
        if self.error_threshold > 0 {
            let failures = {
                let mut count = self.failures.entry(module.to_string()).or_insert(0);
                *count += 1;
                *count
            };
            if failures >= self.error_threshold {
                error!(module, failures, "Backend failing repeatedly, marking module as errored");
                self.registry.set_state(module, ModuleState::Error);
                self.failures.remove(module);
            }
        }
        self.pages.render(&ErrorPage::new("Error", code, message))
    }
}

impl Handler for ReverseProxy {
    fn call(&self, ctx: RequestContext) -> BoxFuture<'_, HubResponse> {
        Box::pin(self.serve(ctx))
    }
}
