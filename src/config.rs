use crate::hub::reserved_conflict;
use crate::module::{
    AuthSettings, Binding, ExecConfig, ModuleDescriptor, ModuleState, Route, TypeTags, HUB_NAME,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Gateway configuration
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Display name printed at startup
    #[serde(default = "default_name")]
    pub name: String,

    /// Hashed shared secret; generated into `.secret` when absent
    pub secret: Option<String>,

    /// Directory git-sourced modules are cloned into
    #[serde(default = "default_mods_dir")]
    pub mods_dir: PathBuf,

    /// Directory holding `html/loading.html` and `html/404.html`
    #[serde(default = "default_resource_dir")]
    pub resource_dir: PathBuf,

    /// Combined-log-format access log
    #[serde(default = "default_access_log")]
    pub access_log: PathBuf,

    /// Basic-auth credential file
    #[serde(default = "default_htpasswd")]
    pub htpasswd: PathBuf,

    /// File printed after the startup banner
    pub motd: Option<PathBuf>,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub handshake: HandshakeConfig,

    #[serde(default)]
    pub supervisor: SupervisorConfig,

    #[serde(default)]
    pub modules: HashMap<String, ModuleConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub address: String,

    /// Listen port (default: 2000)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// TLS certificate (PEM); TLS is enabled when both cert and key are set
    pub cert: Option<String>,

    /// TLS private key (PEM)
    pub cert_key: Option<String>,

    /// Time given to in-flight requests on shutdown (default: 10)
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,

    /// Timeout for proxied requests (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Timeout for commands sent to modules (default: 10)
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Maximum idle connections per backend (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Consecutive backend failures before a module is marked ERROR, 0 disables (default: 5)
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,
}

impl ServerConfig {
    pub fn tls_enabled(&self) -> bool {
        self.cert.is_some() && self.cert_key.is_some()
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_bind_address(),
            port: default_listen_port(),
            cert: None,
            cert_key: None,
            shutdown_grace_secs: default_shutdown_grace(),
            request_timeout_secs: default_request_timeout(),
            command_timeout_secs: default_command_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            error_threshold: default_error_threshold(),
        }
    }
}

/// Liveness confirmation after a successful `/connect`
#[derive(Debug, Deserialize, Clone)]
pub struct HandshakeConfig {
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,

    #[serde(default = "default_ping_attempts")]
    pub ping_attempts: u32,

    #[serde(default = "default_ping_interval")]
    pub ping_interval_ms: u64,
}

impl HandshakeConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: default_settle_delay(),
            ping_attempts: default_ping_attempts(),
            ping_interval_ms: default_ping_interval(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SupervisorConfig {
    /// Sweep interval (default: 1000ms)
    #[serde(default = "default_sweep_interval")]
    pub interval_ms: u64,

    /// Watermark age after which a module is demoted (default: 300s)
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,

    /// Minimum time between liveness probes of one module (default: 30s)
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,
}

impl SupervisorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_sweep_interval(),
            stale_after_secs: default_stale_after(),
            probe_interval_secs: default_probe_interval(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ModuleConfig {
    /// Comma or space separated tags, e.g. "reverse" or "bind"
    #[serde(default)]
    pub types: String,

    pub version: Option<String>,

    #[serde(default)]
    pub binding: BindingConfig,

    pub exe: Option<ExecSection>,

    #[serde(default)]
    pub auth: AuthSection,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BindingConfig {
    #[serde(default = "default_bind_address")]
    pub address: String,

    /// Left unset, the port announced by the module in `/connect` is used
    pub port: Option<u16>,

    #[serde(default = "default_protocol")]
    pub protocol: String,

    #[serde(default)]
    pub routes: Vec<Route>,

    /// Static file or directory served by `bind` modules
    pub root: Option<PathBuf>,

    pub cert: Option<String>,
    pub cert_key: Option<String>,
}

impl Default for BindingConfig {
    fn default() -> Self {
        Self {
            address: default_bind_address(),
            port: None,
            protocol: default_protocol(),
            routes: Vec::new(),
            root: None,
            cert: None,
            cert_key: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ExecSection {
    pub src: Option<String>,
    pub main: Option<String>,
    pub bin: Option<PathBuf>,
    #[serde(default)]
    pub remote: bool,
    #[serde(default)]
    pub supervised: bool,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AuthSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_auth_type", rename = "type")]
    pub kind: String,
}

impl ModuleConfig {
    pub fn validate(&self, name: &str) -> Result<(), String> {
        if name == HUB_NAME {
            return Err(format!("Module '{}': name is reserved for the gateway", name));
        }

        if self.binding.routes.is_empty() {
            return Err(format!("Module '{}': at least one route is required", name));
        }

        for route in &self.binding.routes {
            if !route.from.starts_with('/') {
                return Err(format!(
                    "Module '{}': route '{}' must start with '/'",
                    name, route.from
                ));
            }
            if let Some(reserved) = reserved_conflict(&route.from) {
                return Err(format!(
                    "Module '{}': route '{}' overlaps the gateway endpoint '{}'",
                    name, route.from, reserved
                ));
            }
        }

        if !matches!(self.binding.protocol.as_str(), "http" | "https") {
            return Err(format!(
                "Module '{}': unsupported protocol '{}'",
                name, self.binding.protocol
            ));
        }

        if let Some(exe) = &self.exe {
            if !exe.remote && exe.main.is_none() {
                return Err(format!(
                    "Module '{}': local module requires 'exe.main'",
                    name
                ));
            }
        }

        Ok(())
    }

    /// Initial Registry entry. `bind` modules start `Online`, the rest `Unknown`.
    pub fn to_descriptor(&self, name: &str) -> ModuleDescriptor {
        let types = TypeTags::parse(&self.types);
        let state = if types.is_bind() {
            ModuleState::Online
        } else {
            ModuleState::Unknown
        };

        let mut descriptor = ModuleDescriptor::new(name).with_state(state);
        descriptor.version = self.version.clone();
        descriptor.types = types;
        descriptor.binding = Binding {
            address: self.binding.address.clone(),
            port: self.binding.port,
            protocol: self.binding.protocol.clone(),
            routes: self.binding.routes.clone(),
            root: self.binding.root.clone(),
            cert: self.binding.cert.clone(),
            cert_key: self.binding.cert_key.clone(),
        };
        descriptor.exe = self.exe.as_ref().map(|exe| ExecConfig {
            src: exe.src.clone(),
            main: exe.main.clone(),
            bin: exe.bin.clone(),
            remote: exe.remote,
            supervised: exe.supervised,
        });
        descriptor.auth = AuthSettings {
            enabled: self.auth.enabled,
            kind: self.auth.kind.clone(),
        };
        descriptor
    }
}

fn default_name() -> String {
    env!("CARGO_PKG_NAME").to_string()
}

fn default_mods_dir() -> PathBuf {
    PathBuf::from("mods")
}

fn default_resource_dir() -> PathBuf {
    PathBuf::from("resources")
}

fn default_access_log() -> PathBuf {
    PathBuf::from("access.log")
}

fn default_htpasswd() -> PathBuf {
    PathBuf::from(".htpasswd")
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    2000
}

fn default_protocol() -> String {
    "http".to_string()
}

fn default_auth_type() -> String {
    "basic".to_string()
}

fn default_shutdown_grace() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    30
}

fn default_command_timeout() -> u64 {
    10
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_error_threshold() -> u32 {
    5
}

fn default_settle_delay() -> u64 {
    2000
}

fn default_ping_attempts() -> u32 {
    15
}

fn default_ping_interval() -> u64 {
    1000
}

fn default_sweep_interval() -> u64 {
    1000
}

fn default_stale_after() -> u64 {
    300
}

fn default_probe_interval() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: default_name(),
            secret: None,
            mods_dir: default_mods_dir(),
            resource_dir: default_resource_dir(),
            access_log: default_access_log(),
            htpasswd: default_htpasswd(),
            motd: None,
            server: ServerConfig::default(),
            handshake: HandshakeConfig::default(),
            supervisor: SupervisorConfig::default(),
            modules: HashMap::new(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        let mut names: Vec<_> = self.modules.keys().collect();
        names.sort();
        for name in names {
            if let Err(e) = self.modules[name].validate(name) {
                errors.push(e);
            }
        }

        if self.server.cert.is_some() != self.server.cert_key.is_some() {
            errors.push("Server: 'cert' and 'cert_key' must be set together".to_string());
        }

        if self.handshake.ping_attempts == 0 {
            errors.push("Handshake: 'ping_attempts' must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    /// Initial Registry population, sorted by name
    pub fn descriptors(&self) -> Vec<ModuleDescriptor> {
        let mut descriptors: Vec<_> = self
            .modules
            .iter()
            .map(|(name, module)| module.to_descriptor(name))
            .collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
name = "gateway"
mods_dir = "/srv/mods"

[server]
address = "127.0.0.1"
port = 8080

[modules.blog]
types = "reverse"
version = "1.2.0"

[modules.blog.binding]
address = "10.0.0.2"
port = 3000
routes = [{ from = "/blog", to = "/" }]

[modules.blog.exe]
src = "https://example.com/blog.git"
main = "./blog --port 3000"
supervised = true

[modules.site]
types = "bind"

[modules.site.binding]
root = "/var/www/site"
routes = [{ from = "/" }]
"#;

        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.name, "gateway");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.mods_dir, PathBuf::from("/srv/mods"));
        assert_eq!(config.modules.len(), 2);

        let blog = &config.modules["blog"];
        assert_eq!(blog.binding.port, Some(3000));
        assert_eq!(blog.binding.routes[0], Route::new("/blog", "/"));
        assert!(blog.exe.as_ref().unwrap().supervised);

        let site = &config.modules["site"];
        assert_eq!(site.binding.routes[0].to, "/");
    }

    #[test]
    fn test_default_config() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.address, "0.0.0.0");
        assert_eq!(config.server.port, 2000);
        assert_eq!(config.server.shutdown_grace_secs, 10);
        assert_eq!(config.server.error_threshold, 5);
        assert_eq!(config.mods_dir, PathBuf::from("mods"));
        assert_eq!(config.resource_dir, PathBuf::from("resources"));
        assert_eq!(config.access_log, PathBuf::from("access.log"));
        assert_eq!(config.handshake.ping_attempts, 15);
        assert_eq!(config.handshake.ping_interval(), Duration::from_secs(1));
        assert_eq!(config.supervisor.stale_after(), Duration::from_secs(300));
        assert!(!config.server.tls_enabled());
        assert!(config.modules.is_empty());
    }

    #[test]
    fn test_initial_states() {
        let mut bind = ModuleConfig::default();
        bind.types = "bind".to_string();
        bind.binding.routes.push(Route::new("/", "/"));
        assert_eq!(bind.to_descriptor("site").state, ModuleState::Online);

        let mut reverse = ModuleConfig::default();
        reverse.types = "reverse".to_string();
        let descriptor = reverse.to_descriptor("api");
        assert_eq!(descriptor.state, ModuleState::Unknown);
        assert!(descriptor.types.is_reverse());
        assert_eq!(descriptor.binding.protocol, "http");
        assert!(descriptor.api_key.is_none());
    }

    #[test]
    fn test_validate_reserved_name() {
        let mut module = ModuleConfig::default();
        module.binding.routes.push(Route::new("/", "/"));
        assert!(module.validate("hub").unwrap_err().contains("reserved"));
    }

    #[test]
    fn test_validate_rejects_gateway_endpoints() {
        for from in ["/cmd", "/connect", "/cmd/", "/:name"] {
            let mut module = ModuleConfig::default();
            module.binding.routes.push(Route::new(from, "/"));
            let err = module.validate("evil").unwrap_err();
            assert!(err.contains("overlaps the gateway endpoint"), "{}: {}", from, err);
        }

        let mut module = ModuleConfig::default();
        module.binding.routes.push(Route::new("/commands", "/"));
        assert!(module.validate("ok").is_ok());
    }

    #[test]
    fn test_validate_local_requires_main() {
        let mut module = ModuleConfig::default();
        module.binding.routes.push(Route::new("/a", "/"));
        module.exe = Some(ExecSection::default());
        assert!(module.validate("a").unwrap_err().contains("exe.main"));

        module.exe = Some(ExecSection {
            remote: true,
            ..Default::default()
        });
        assert!(module.validate("a").is_ok());
    }

    #[test]
    fn test_validate_multiple_errors() {
        let toml = r#"
[server]
cert = "cert.pem"

[modules.a.binding]
routes = [{ from = "nope" }]

[modules.b.binding]
protocol = "ftp"
routes = [{ from = "/b" }]
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("must start with '/'"));
        assert!(err.contains("unsupported protocol"));
        assert!(err.contains("cert_key"));
    }

    #[test]
    fn test_descriptors_sorted() {
        let toml = r#"
[modules.zeta.binding]
routes = [{ from = "/z" }]

[modules.alpha.binding]
routes = [{ from = "/a" }]
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let names: Vec<_> = config.descriptors().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }
}
