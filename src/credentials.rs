//! Shared secret and per-module API key handling
//!
//! Secrets are only ever compared through their one-way hash:
//! `base64url(sha256(raw))`.

use anyhow::Context;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::{debug, info};

/// Length of generated raw secrets
pub const SECRET_LEN: usize = 64;

/// File holding a raw secret, both at the gateway root and in module directories
pub const SECRET_FILE: &str = ".secret";

/// Random alphanumeric string
pub fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// One-way hash presented in place of a raw secret
pub fn hash_secret(raw: &str) -> String {
    let digest = Sha256::digest(raw.as_bytes());
    URL_SAFE.encode(digest)
}

/// Fresh API key for one setup cycle
pub fn generate_api_key() -> String {
    URL_SAFE.encode(random_token(SECRET_LEN))
}

pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}

/// Load the raw shared secret from `path`, generating and persisting one if absent.
///
/// Returns the hashed form modules must present in `/connect`.
pub fn load_or_generate_shared_secret(path: &Path) -> anyhow::Result<String> {
    if let Ok(existing) = std::fs::read_to_string(path) {
        let raw = existing.trim();
        if !raw.is_empty() {
            debug!(path = %path.display(), "Loaded shared secret");
            return Ok(hash_secret(raw));
        }
    }

    let raw = random_token(SECRET_LEN);
    std::fs::write(path, &raw)
        .with_context(|| format!("Failed to write shared secret to {}", path.display()))?;
    info!(path = %path.display(), "Generated shared secret");
    Ok(hash_secret(&raw))
}

/// Write a module's API key into its working directory so the module can read it
pub async fn write_api_key(dir: &Path, api_key: &str) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    tokio::fs::write(dir.join(SECRET_FILE), api_key).await
}
