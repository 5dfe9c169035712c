//! Module descriptors and the lifecycle state machine

use crate::credentials;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

/// Reserved name of the descriptor that stands for the gateway itself
pub const HUB_NAME: &str = "hub";

/// Lifecycle state of a module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ModuleState {
    /// Initial state, or liveness evidence went stale
    Unknown,
    /// Setup sequence is running
    Loading,
    /// Source fetch or update completed
    Downloaded,
    /// Handshake confirmed, traffic is routed
    Online,
    /// Shut down by an explicit command
    Stopped,
    /// Credential mismatch or liveness confirmation exhausted
    Failed,
    /// Unrecoverable backend failure observed by the proxy
    Error,
}

impl ModuleState {
    /// States the Supervisor keeps an eye on
    pub fn is_managed(&self) -> bool {
        matches!(
            self,
            ModuleState::Unknown
                | ModuleState::Loading
                | ModuleState::Downloaded
                | ModuleState::Online
        )
    }

    /// States that are already progressing towards (or at) `Online`
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ModuleState::Online | ModuleState::Loading | ModuleState::Downloaded
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleState::Unknown => "UNKNOWN",
            ModuleState::Loading => "LOADING",
            ModuleState::Downloaded => "DOWNLOADED",
            ModuleState::Online => "ONLINE",
            ModuleState::Stopped => "STOPPED",
            ModuleState::Failed => "FAILED",
            ModuleState::Error => "ERROR",
        }
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `(from, to)` pair binding a URL prefix to a backend path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub from: String,
    #[serde(default = "default_route_to")]
    pub to: String,
}

fn default_route_to() -> String {
    "/".to_string()
}

impl Route {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

/// Where and how a module serves traffic
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Binding {
    pub address: String,
    pub port: Option<u16>,
    pub protocol: String,
    pub routes: Vec<Route>,
    pub root: Option<PathBuf>,
    pub cert: Option<String>,
    pub cert_key: Option<String>,
}

impl Default for Binding {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: None,
            protocol: "http".to_string(),
            routes: Vec::new(),
            root: None,
            cert: None,
            cert_key: None,
        }
    }
}

impl Binding {
    /// Host reachable from the gateway; wildcard binds map to loopback
    pub fn host(&self) -> &str {
        match self.address.as_str() {
            "" | "0.0.0.0" | "::" | "[::]" => "127.0.0.1",
            other => other,
        }
    }

    /// `host:port`, if a port is known
    pub fn authority(&self) -> Option<String> {
        let port = self.port?;
        let host = self.host();
        if host.contains(':') && !host.starts_with('[') {
            Some(format!("[{}]:{}", host, port))
        } else {
            Some(format!("{}:{}", host, port))
        }
    }

    /// `protocol://host:port`, if a port is known
    pub fn base_url(&self) -> Option<String> {
        self.authority()
            .map(|authority| format!("{}://{}", self.protocol, authority))
    }
}

/// How a module is fetched and launched
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecConfig {
    /// Git URL or local path of the module source
    pub src: Option<String>,
    /// Command line started in `bin`
    pub main: Option<String>,
    /// Working directory of the module
    pub bin: Option<PathBuf>,
    /// Module runs elsewhere and only connects back
    pub remote: bool,
    /// Register with the Supervisor once confirmed
    pub supervised: bool,
}

impl ExecConfig {
    pub fn source_is_git(&self) -> bool {
        self.src
            .as_deref()
            .map(|src| src.starts_with("http") || src.starts_with("git@"))
            .unwrap_or(false)
    }
}

/// Basic-auth gating of a module's routes
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AuthSettings {
    pub enabled: bool,
    pub kind: String,
}

/// Free-form proxy behaviour flags such as `bind` or `reverse`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct TypeTags(Vec<String>);

impl TypeTags {
    /// Split a comma or whitespace separated tag list
    pub fn parse(raw: &str) -> Self {
        let tags = raw
            .split(|c: char| c == ',' || c.is_whitespace())
            .map(|t| t.trim().to_ascii_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        Self(tags)
    }

    pub fn has(&self, tag: &str) -> bool {
        self.0.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }

    pub fn is_bind(&self) -> bool {
        self.has("bind")
    }

    pub fn is_reverse(&self) -> bool {
        self.has("reverse")
    }
}

/// One registered module. The Registry owns every descriptor; callers work on copies.
#[derive(Debug, Clone, Serialize)]
pub struct ModuleDescriptor {
    pub name: String,
    pub version: Option<String>,
    pub state: ModuleState,
    pub types: TypeTags,
    pub binding: Binding,
    pub exe: Option<ExecConfig>,
    pub auth: AuthSettings,
    /// Issued at setup, never serialized
    #[serde(skip)]
    pub api_key: Option<String>,
    /// Identifier the module presents in command requests
    #[serde(skip)]
    pub module_hash: Option<String>,
    pub pid: u32,
    pub custom_commands: BTreeSet<String>,
    pub resource_path: Option<String>,
    pub last_ping: DateTime<Utc>,
}

impl ModuleDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
            state: ModuleState::Unknown,
            types: TypeTags::default(),
            binding: Binding::default(),
            exe: None,
            auth: AuthSettings::default(),
            api_key: None,
            module_hash: None,
            pid: 0,
            custom_commands: BTreeSet::new(),
            resource_path: None,
            last_ping: Utc::now(),
        }
    }

    /// The synthetic descriptor addressed by commands meant for the gateway
    pub fn hub() -> Self {
        let mut hub = Self::new(HUB_NAME);
        hub.state = ModuleState::Online;
        hub.module_hash = Some(HUB_NAME.to_string());
        hub.pid = std::process::id();
        hub.version = Some(env!("CARGO_PKG_VERSION").to_string());
        hub
    }

    pub fn is_hub(&self) -> bool {
        self.name == HUB_NAME
    }

    pub fn is_remote(&self) -> bool {
        self.exe.as_ref().map(|e| e.remote).unwrap_or(false)
    }

    pub fn is_supervised(&self) -> bool {
        self.exe.as_ref().map(|e| e.supervised).unwrap_or(false)
    }

    /// Compare a presented secret against the one-way hash of the issued API key
    pub fn api_key_matches(&self, presented: &str) -> bool {
        match self.api_key.as_deref() {
            Some(key) if !key.is_empty() => {
                credentials::constant_time_eq(&credentials::hash_secret(key), presented.trim())
            }
            _ => false,
        }
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_ping = now;
    }

    pub fn with_state(mut self, state: ModuleState) -> Self {
        self.state = state;
        self
    }
}
