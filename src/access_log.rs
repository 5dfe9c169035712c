//! Request auditing middleware writing Combined Log Format lines

use crate::router::{Handler, HubResponse, Middleware, RequestContext};
use chrono::Utc;
use futures::future::BoxFuture;
use hyper::body::Body;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Append-only access log shared by every request
pub struct AccessLog {
    file: Option<Mutex<File>>,
}

impl AccessLog {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Some(Mutex::new(file)),
        })
    }

    /// Trace-only log, nothing written to disk
    pub fn disabled() -> Self {
        Self { file: None }
    }

    fn write_line(&self, line: &str) {
        if let Some(file) = &self.file {
            if let Err(e) = writeln!(file.lock(), "{}", line) {
                warn!(error = %e, "Failed to write access log");
            }
        }
    }
}

struct RequestLine {
    remote: String,
    user: String,
    method: String,
    target: String,
    version: String,
    referer: String,
    agent: String,
}

impl RequestLine {
    fn from_ctx(ctx: &RequestContext) -> Self {
        let headers = ctx.request.headers();
        let header = |name: hyper::header::HeaderName| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("-")
                .to_string()
        };
        let user = headers
            .get(hyper::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(crate::auth::decode_basic)
            .map(|(user, _)| user)
            .unwrap_or_else(|| "-".to_string());

        Self {
            remote: ctx.remote_addr.ip().to_string(),
            user,
            method: ctx.request.method().to_string(),
            target: ctx
                .request
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| "/".to_string()),
            version: format!("{:?}", ctx.request.version()),
            referer: header(hyper::header::REFERER),
            agent: header(hyper::header::USER_AGENT),
        }
    }

    fn combined(&self, status: u16, size: Option<u64>) -> String {
        format!(
            "{} - {} [{}] \"{} {} {}\" {} {} \"{}\" \"{}\"",
            self.remote,
            self.user,
            Utc::now().format("%d/%b/%Y:%H:%M:%S %z"),
            self.method,
            self.target,
            self.version,
            status,
            size.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string()),
            self.referer,
            self.agent,
        )
    }
}

/// Router middleware recording every request
pub struct AccessLogMiddleware {
    log: Arc<AccessLog>,
}

impl AccessLogMiddleware {
    pub fn new(log: Arc<AccessLog>) -> Self {
        Self { log }
    }
}

impl Middleware for AccessLogMiddleware {
    fn wrap(&self, next: Arc<dyn Handler>) -> Arc<dyn Handler> {
        Arc::new(AccessLogHandler {
            log: Arc::clone(&self.log),
            next,
        })
    }
}

struct AccessLogHandler {
    log: Arc<AccessLog>,
    next: Arc<dyn Handler>,
}

impl Handler for AccessLogHandler {
    fn call(&self, ctx: RequestContext) -> BoxFuture<'_, HubResponse> {
        Box::pin(async move {
            let started = Instant::now();
            let line = RequestLine::from_ctx(&ctx);
            let module = ctx.module.clone();

            let response = self.next.call(ctx).await;

            let status = response.status().as_u16();
            let size = response.body().size_hint().exact();
            debug!(
                method = %line.method,
                path = %line.target,
                status,
                module = module.as_deref().unwrap_or("-"),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Request served"
            );
            self.log.write_line(&line.combined(status, size));
            response
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::text_response;
    use crate::router::{empty_body, handler_fn, Router};
    use hyper::{Request, StatusCode};

    #[tokio::test]
    async fn test_writes_combined_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");
        let log = Arc::new(AccessLog::open(&path).unwrap());

        let router = Router::new(handler_fn(|_ctx: RequestContext| async {
            text_response(StatusCode::NOT_FOUND, "nope")
        }));
        router.handle(
            "/blog",
            handler_fn(|_ctx: RequestContext| async { text_response(StatusCode::OK, "ok") }),
            Some("blog".into()),
            None,
        );
        router.use_middleware(Arc::new(AccessLogMiddleware::new(log)));

        for path in ["/blog/post?id=1", "/missing"] {
            let request = Request::builder()
                .uri(path)
                .header("user-agent", "test-agent")
                .body(empty_body())
                .unwrap();
            router
                .dispatch(RequestContext::new(request, "10.1.2.3:5555".parse().unwrap()))
                .await;
        }

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("10.1.2.3 - - ["));
        assert!(lines[0].contains("\"GET /blog/post?id=1 HTTP/1.1\" 200 3"));
        assert!(lines[0].ends_with("\"-\" \"test-agent\""));
        assert!(lines[1].contains("\"GET /missing HTTP/1.1\" 404"));
    }
}
