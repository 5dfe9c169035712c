//! Basic-auth gating for modules with `auth.enabled`
//!
//! Credentials live in an htpasswd-style file, one `user:password` per line.
//! The password is plaintext or `{SHA256}` followed by the base64 digest.

use crate::credentials::constant_time_eq;
use crate::error::text_response;
use crate::router::{Handler, HubResponse, RequestContext};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::future::BoxFuture;
use hyper::header::HeaderValue;
use hyper::StatusCode;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Challenge sent with 401 responses
pub const CHALLENGE: &str = "Basic realm=\"modhub\"";

/// Header carrying the authenticated user to the backend
pub const X_AUTHENTICATED_USER: &str = "x-authenticated-user";

#[derive(Debug, Clone, PartialEq, Eq)]
enum StoredPassword {
    Plain(String),
    Sha256(String),
}

#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    users: HashMap<String, StoredPassword>,
}

impl CredentialStore {
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let store = Self::parse(&content);
        debug!(path = %path.display(), users = store.users.len(), "Credential file loaded");
        Ok(store)
    }

    pub fn parse(content: &str) -> Self {
        let users = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| line.split_once(':'))
            .map(|(user, password)| {
                let stored = match password.strip_prefix("{SHA256}") {
                    Some(digest) => StoredPassword::Sha256(digest.to_string()),
                    None => StoredPassword::Plain(password.to_string()),
                };
                (user.to_string(), stored)
            })
            .collect();
        Self { users }
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn verify(&self, user: &str, password: &str) -> bool {
        match self.users.get(user) {
            Some(StoredPassword::Plain(expected)) => constant_time_eq(expected, password),
            Some(StoredPassword::Sha256(expected)) => {
                let digest = STANDARD.encode(Sha256::digest(password.as_bytes()));
                constant_time_eq(expected, &digest)
            }
            None => false,
        }
    }

    /// The authenticated user for an `Authorization` header value
    pub fn check_header(&self, header: &str) -> Option<String> {
        let (user, password) = decode_basic(header)?;
        self.verify(&user, &password).then_some(user)
    }
}

/// Decode `Basic <base64(user:password)>`
pub fn decode_basic(header: &str) -> Option<(String, String)> {
    let (scheme, encoded) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

/// Handler wrapper that demands valid basic-auth credentials
pub struct BasicAuthGate {
    module: String,
    store: Option<Arc<CredentialStore>>,
    inner: Arc<dyn Handler>,
}

impl BasicAuthGate {
    /// A missing store makes every request fail with 500 instead of passing through
    pub fn new(module: &str, store: Option<Arc<CredentialStore>>, inner: Arc<dyn Handler>) -> Self {
        Self {
            module: module.to_string(),
            store,
            inner,
        }
    }
}

impl Handler for BasicAuthGate {
    fn call(&self, mut ctx: RequestContext) -> BoxFuture<'_, HubResponse> {
        Box::pin(async move {
            let store = match &self.store {
                Some(store) => store,
                None => {
                    error!(module = %self.module, "Credential file missing for auth-enabled module");
                    return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Authentication unavailable");
                }
            };

            let user = ctx
                .request
                .headers()
                .get(hyper::header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| store.check_header(v));

            match user {
                Some(user) => {
                    debug!(module = %self.module, user = %user, "Authenticated request");
                    if let Ok(value) = HeaderValue::from_str(&user) {
                        ctx.request.headers_mut().insert(X_AUTHENTICATED_USER, value);
                    }
                    self.inner.call(ctx).await
                }
                None => {
                    warn!(module = %self.module, client = %ctx.remote_addr, "Rejected unauthenticated request");
                    let mut response = text_response(StatusCode::UNAUTHORIZED, "Unauthorized");
                    response.headers_mut().insert(
                        hyper::header::WWW_AUTHENTICATE,
                        HeaderValue::from_static(CHALLENGE),
                    );
                    response
                }
            }
        })
    }
}
