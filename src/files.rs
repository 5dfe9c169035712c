//! Static file serving for `bind` modules

use crate::error::text_response;
use crate::router::{full_body, HubResponse};
use hyper::{Method, Response, StatusCode};
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Serve `request_path` (already stripped of the route prefix) from `root`.
///
/// A file root is always served as-is. A directory root resolves the path
/// inside it, rejecting `..` and mapping directories to `index.html`.
pub async fn serve(root: &Path, request_path: &str, method: &Method) -> HubResponse {
    if method != Method::GET && method != Method::HEAD {
        return text_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed");
    }

    let target = match resolve(root, request_path).await {
        Some(target) => target,
        None => return text_response(StatusCode::NOT_FOUND, "File not found"),
    };

    match tokio::fs::read(&target).await {
        Ok(contents) => {
            debug!(path = %target.display(), bytes = contents.len(), "Serving static file");
            let length = contents.len();
            let body = if method == Method::HEAD {
                full_body(Vec::new())
            } else {
                full_body(contents)
            };
            Response::builder()
                .status(StatusCode::OK)
                .header(hyper::header::CONTENT_TYPE, content_type_for(&target))
                .header(hyper::header::CONTENT_LENGTH, length)
                .body(body)
                .expect("valid response builder")
        }
        Err(e) => {
            debug!(path = %target.display(), error = %e, "Static file unreadable");
            text_response(StatusCode::NOT_FOUND, "File not found")
        }
    }
}

async fn resolve(root: &Path, request_path: &str) -> Option<PathBuf> {
    let root_meta = tokio::fs::metadata(root).await.ok()?;
    if root_meta.is_file() {
        return Some(root.to_path_buf());
    }

    let decoded = urlencoding::decode(request_path).ok()?;
    let mut target = root.to_path_buf();
    for component in Path::new(decoded.as_ref()).components() {
        match component {
            Component::Normal(part) => target.push(part),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => return None,
        }
    }

    let meta = tokio::fs::metadata(&target).await.ok()?;
    if meta.is_dir() {
        target.push("index.html");
    }
    Some(target)
}

pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js") | Some("mjs") => "application/javascript",
        Some("json") => "application/json",
        Some("txt") => "text/plain; charset=utf-8",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("ico") => "image/x-icon",
        Some("wasm") => "application/wasm",
        Some("pdf") => "application/pdf",
        _ => "application/octet-stream",
    }
}
