//! The gateway service object tying Registry, Router, Supervisor and the
//! module-facing endpoints together

use crate::access_log::{AccessLog, AccessLogMiddleware};
use crate::auth::{BasicAuthGate, CredentialStore};
use crate::client::{ModuleClient, COMMAND_PATH};
use crate::command::CommandTable;
use crate::config::Config;
use crate::credentials;
use crate::error::{text_response, HubError, PageRenderer};
use crate::module::{ModuleDescriptor, ModuleState, HUB_NAME};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::process::ModuleLauncher;
use crate::proxy::ReverseProxy;
use crate::registry::Registry;
use crate::router::{handler_fn, Handler, HubBody, HubResponse, Pattern, RequestContext, Router};
use crate::supervisor::{ModuleProbe, Supervisor, SupervisorPolicy};
use chrono::Utc;
use dashmap::DashMap;
use http_body_util::BodyExt;
use hyper::body::Bytes;
use hyper::{Method, Request, StatusCode};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const CONNECT_PATH: &str = "/connect";

/// Gateway endpoints no module route may claim
pub const RESERVED_PATHS: [&str; 2] = [CONNECT_PATH, COMMAND_PATH];

/// The reserved endpoint `from` would take over, if any
pub fn reserved_conflict(from: &str) -> Option<&'static str> {
    let pattern = Pattern::parse(from);
    RESERVED_PATHS.into_iter().find(|path| pattern.shadows(path))
}

pub struct Hub {
    pub(crate) config: Config,
    /// Hashed secret modules present in `/connect` and hub commands
    pub(crate) shared_secret: String,
    pub(crate) registry: Arc<Registry>,
    pub(crate) router: Arc<Router>,
    pub(crate) supervisor: Arc<Supervisor>,
    pub(crate) client: ModuleClient,
    pub(crate) launcher: Arc<dyn ModuleLauncher>,
    pub(crate) proxy: Arc<ReverseProxy>,
    pub(crate) credentials: Option<Arc<CredentialStore>>,
    pub(crate) commands: CommandTable,
    /// In-flight ping confirmations, keyed by module name
    pub(crate) confirmations: DashMap<String, (u64, JoinHandle<()>)>,
    pub(crate) confirmation_ids: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
}

impl Hub {
    pub fn new(
        config: Config,
        shared_secret: String,
        launcher: Arc<dyn ModuleLauncher>,
        access_log: Arc<AccessLog>,
    ) -> Result<Arc<Self>, HubError> {
        let registry = Arc::new(Registry::with_modules(config.descriptors())?);
        let pages = Arc::new(PageRenderer::from_resource_dir(&config.resource_dir));
        let pool = Arc::new(ConnectionPool::new(PoolConfig {
            max_idle_per_host: config.server.pool_max_idle_per_host,
            idle_timeout: std::time::Duration::from_secs(config.server.pool_idle_timeout_secs),
        }));
        let proxy = Arc::new(ReverseProxy::new(
            Arc::clone(&registry),
            pool,
            Arc::clone(&pages),
            config.server.request_timeout(),
            config.server.error_threshold,
        ));
        let client = ModuleClient::new(shared_secret.clone(), config.server.command_timeout());
        let supervisor = Arc::new(Supervisor::new(
            Arc::clone(&registry),
            Arc::new(ModuleProbe::new(client.clone())),
            SupervisorPolicy::from(&config.supervisor),
        ));
        let credentials = load_credentials(&config);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new_cyclic(|weak: &Weak<Hub>| {
            let not_found = {
                let pages = Arc::clone(&pages);
                handler_fn(move |_ctx: RequestContext| {
                    let response = pages.not_found();
                    async move { response }
                })
            };
            let router = Arc::new(Router::new(not_found));
            router.handle(
                CONNECT_PATH,
                endpoint(weak.clone(), |hub, ctx| async move { hub.connect_endpoint(ctx).await }),
                None,
                None,
            );
            router.handle(
                COMMAND_PATH,
                endpoint(weak.clone(), |hub, ctx| async move { hub.command_endpoint(ctx).await }),
                None,
                None,
            );
            router.use_middleware(Arc::new(AccessLogMiddleware::new(access_log)));

            Hub {
                config,
                shared_secret,
                registry,
                router,
                supervisor,
                client,
                launcher,
                proxy,
                credentials,
                commands: CommandTable::builtin(),
                confirmations: DashMap::new(),
                confirmation_ids: AtomicU64::new(0),
                shutdown_tx,
            }
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn shared_secret(&self) -> &str {
        &self.shared_secret
    }

    /// Route one inbound request through the multiplexer
    pub async fn handle(&self, request: Request<HubBody>, remote_addr: SocketAddr, is_tls: bool) -> HubResponse {
        let ctx = RequestContext::new(request, remote_addr).with_tls(is_tls);
        self.router.dispatch(ctx).await
    }

    /// Bind every route of `module` to the proxy handler, replacing earlier bindings
    pub fn hook_routes(&self, module: &ModuleDescriptor) {
        for route in &module.binding.routes {
            if let Some(reserved) = reserved_conflict(&route.from) {
                warn!(module = %module.name, from = %route.from, reserved, "Route overlaps a gateway endpoint, not hooked");
                continue;
            }
            let proxy: Arc<dyn Handler> = Arc::clone(&self.proxy) as Arc<dyn Handler>;
            let handler: Arc<dyn Handler> = if module.auth.enabled {
                Arc::new(BasicAuthGate::new(
                    &module.name,
                    self.credentials.clone(),
                    proxy,
                ))
            } else {
                proxy
            };
            self.router
                .handle(&route.from, handler, Some(module.name.clone()), Some(route.clone()));
            debug!(module = %module.name, from = %route.from, to = %route.to, "Route hooked");
        }
    }

    /// Run the setup sequence for `name`: fetch, key issue and start as its exe section requires
    pub async fn setup_module(&self, name: &str) -> Result<(), HubError> {
        let module = self
            .registry
            .get(name)
            .ok_or_else(|| HubError::ModuleNotFound(name.to_string()))?;
        if module.is_hub() {
            return Ok(());
        }

        let exe = match module.exe.clone() {
            Some(exe) => exe,
            None => {
                self.hook_routes(&module);
                self.registry.set_state(name, ModuleState::Online);
                info!(module = name, "Module without exe section online");
                return Ok(());
            }
        };

        let api_key = credentials::generate_api_key();
        let module = self
            .registry
            .update(name, |m| {
                m.api_key = Some(api_key.clone());
                m.state = ModuleState::Loading;
            })
            .ok_or_else(|| HubError::ModuleNotFound(name.to_string()))?;
        info!(module = name, remote = exe.remote, "Module setup started");

        if exe.remote {
            debug!(module = name, "Remote module, waiting for handshake");
            return Ok(());
        }

        let dir = match self.launcher.fetch(&module, &self.config.mods_dir).await {
            Ok(dir) => dir,
            Err(e) => return Err(self.setup_failed(name, e)),
        };
        let module = if exe.source_is_git() {
            self.registry
                .update(name, |m| {
                    m.state = ModuleState::Downloaded;
                    if let Some(exe) = m.exe.as_mut() {
                        exe.bin = Some(dir.clone());
                    }
                })
                .unwrap_or(module)
        } else {
            module
        };

        if let Err(e) = credentials::write_api_key(&dir, &api_key).await {
            return Err(self.setup_failed(name, e.into()));
        }

        let pid = match self.launcher.start(&module, &dir).await {
            Ok(pid) => pid,
            Err(e) => return Err(self.setup_failed(name, e)),
        };
        self.registry.update(name, |m| {
            m.pid = pid;
            m.touch(Utc::now());
        });
        info!(module = name, pid, dir = %dir.display(), "Module started, waiting for handshake");
        Ok(())
    }

    fn setup_failed(&self, name: &str, err: HubError) -> HubError {
        error!(module = name, error = %err, "Module setup failed");
        self.registry.set_state(name, ModuleState::Failed);
        err
    }

    /// Set up every configured module; failures are logged, never fatal
    pub async fn load_modules(&self) {
        for module in self.registry.snapshot() {
            if module.is_hub() {
                continue;
            }
            if let Err(e) = self.setup_module(&module.name).await {
                warn!(module = %module.name, error = %e, "Module not loaded");
            }
        }
        info!(modules = self.registry.len() - 1, "Module setup pass finished");
    }

    /// Fire the gateway's graceful-shutdown trigger
    pub fn request_shutdown(&self) {
        info!("Shutdown requested");
        self.shutdown_tx.send_replace(true);
    }

    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Resolves once shutdown was requested
    pub async fn shutdown_signal(&self) {
        let mut rx = self.subscribe_shutdown();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Abort every pending ping confirmation
    pub fn abort_confirmations(&self) {
        let pending: Vec<String> = self.confirmations.iter().map(|e| e.key().clone()).collect();
        for name in pending {
            if let Some((_, (_, handle))) = self.confirmations.remove(&name) {
                handle.abort();
            }
        }
    }

    pub fn hub_descriptor(&self) -> ModuleDescriptor {
        self.registry
            .get(HUB_NAME)
            .unwrap_or_else(ModuleDescriptor::hub)
    }
}

/// Handler calling into the hub while it is alive
fn endpoint<F, Fut>(hub: Weak<Hub>, f: F) -> Arc<dyn Handler>
where
    F: Fn(Arc<Hub>, RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HubResponse> + Send + 'static,
{
    let f = Arc::new(f);
    handler_fn(move |ctx: RequestContext| {
        let hub = hub.upgrade();
        let f = Arc::clone(&f);
        async move {
            match hub {
                Some(hub) => f(hub, ctx).await,
                None => text_response(StatusCode::SERVICE_UNAVAILABLE, "Shutting down"),
            }
        }
    })
}

/// Collect a request body for the JSON endpoints, POST only
pub(crate) async fn read_post_body(ctx: RequestContext) -> Result<Bytes, HubResponse> {
    if ctx.request.method() != Method::POST {
        return Err(text_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed"));
    }
    match ctx.request.into_body().collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) => {
            debug!(error = %e, "Failed to read request body");
            Err(text_response(StatusCode::BAD_REQUEST, HubError::InvalidRequest(e.to_string()).to_string()))
        }
    }
}

fn load_credentials(config: &Config) -> Option<Arc<CredentialStore>> {
    let needed = config.modules.values().any(|m| m.auth.enabled);
    match CredentialStore::load(&config.htpasswd) {
        Ok(store) => Some(Arc::new(store)),
        Err(e) if needed => {
            error!(path = %config.htpasswd.display(), error = %e, "Credential file unavailable, auth-enabled routes will fail");
            None
        }
        Err(_) => None,
    }
}
