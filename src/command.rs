//! `/cmd`: authenticated commands addressed to the hub or to a module
//!
//! Built-in commands live in a fixed table; anything else must be one of the
//! custom commands the module declared during its handshake and is forwarded
//! to the module unchanged.

use crate::client::{is_shutdown_ack, Acknowledgement};
use crate::credentials;
use crate::error::{error_response, text_response, HubError};
use crate::hub::{read_post_body, Hub};
use crate::module::{ModuleDescriptor, ModuleState, HUB_NAME};
use crate::process::{module_dir, process_running, sample_usage, MODULE_LOG};
use crate::router::{HubResponse, RequestContext};
use chrono::Utc;
use futures::future::BoxFuture;
use hyper::body::Bytes;
use hyper::StatusCode;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

/// The only request type the dispatcher accepts
pub const COMMAND_TYPE: &str = "Command";

/// Fields extracted from a command body
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommandRequest {
    pub command: String,
    pub content: String,
    pub hash: String,
    pub name: String,
    pub secret: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl CommandRequest {
    /// Parse a generic JSON object; keys match case-insensitively
    pub fn from_json(body: &[u8]) -> Result<Self, HubError> {
        let map: Map<String, Value> =
            serde_json::from_slice(body).map_err(|e| HubError::InvalidRequest(e.to_string()))?;

        let field = |key: &str| -> String {
            map.iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| match v {
                    Value::String(s) => s.clone(),
                    Value::Null => String::new(),
                    other => other.to_string(),
                })
                .unwrap_or_default()
        };

        Ok(Self {
            command: field("command"),
            content: field("content"),
            hash: field("hash").trim().to_string(),
            name: field("name"),
            secret: field("secret"),
            kind: field("type"),
        })
    }
}

pub struct CommandInvocation {
    pub request: CommandRequest,
    /// Original body, forwarded verbatim for custom commands
    pub raw: Bytes,
    pub remote_addr: SocketAddr,
}

pub type Executor = for<'a> fn(
    &'a Hub,
    &'a CommandInvocation,
    ModuleDescriptor,
) -> BoxFuture<'a, Result<String, HubError>>;

/// Built-in commands, registered once
pub struct CommandTable {
    executors: HashMap<&'static str, Executor>,
}

impl CommandTable {
    pub fn builtin() -> Self {
        let mut executors: HashMap<&'static str, Executor> = HashMap::new();
        executors.insert("List", list as Executor);
        executors.insert("Log", log as Executor);
        executors.insert("Performance", performance as Executor);
        executors.insert("Ping", ping as Executor);
        executors.insert("Restart", restart as Executor);
        executors.insert("Shutdown", shutdown as Executor);
        executors.insert("Start", start as Executor);
        Self { executors }
    }

    pub fn get(&self, command: &str) -> Option<Executor> {
        self.executors.get(command).copied()
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.executors.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

fn list<'a>(
    hub: &'a Hub,
    _inv: &'a CommandInvocation,
    _target: ModuleDescriptor,
) -> BoxFuture<'a, Result<String, HubError>> {
    Box::pin(async move { Ok(serde_json::to_string_pretty(&hub.registry.snapshot())?) })
}

fn log<'a>(
    hub: &'a Hub,
    inv: &'a CommandInvocation,
    target: ModuleDescriptor,
) -> BoxFuture<'a, Result<String, HubError>> {
    Box::pin(async move {
        if target.is_remote() {
            return hub.client.send_command(&target, "Log", &inv.request.content).await;
        }
        let path = if target.is_hub() {
            hub.config.access_log.clone()
        } else {
            module_dir(&target, &hub.config.mods_dir).join(MODULE_LOG)
        };
        Ok(tokio::fs::read_to_string(&path).await?)
    })
}

fn performance<'a>(
    hub: &'a Hub,
    inv: &'a CommandInvocation,
    target: ModuleDescriptor,
) -> BoxFuture<'a, Result<String, HubError>> {
    Box::pin(async move {
        if target.is_remote() {
            return hub
                .client
                .send_command(&target, "Performance", &inv.request.content)
                .await;
        }
        let usage = sample_usage(target.pid)
            .await
            .ok_or_else(|| HubError::unreachable(&target.name, "process not running"))?;
        Ok(format!(
            "CPU/RAM : {:.2}/{:.2}",
            usage.cpu_percent, usage.memory_percent
        ))
    })
}

fn ping<'a>(
    hub: &'a Hub,
    inv: &'a CommandInvocation,
    target: ModuleDescriptor,
) -> BoxFuture<'a, Result<String, HubError>> {
    Box::pin(async move {
        if target.is_hub() {
            hub.registry.update(HUB_NAME, |m| m.touch(Utc::now()));
            return Ok("Pong".to_string());
        }
        let answer = hub
            .client
            .send_command(&target, "Ping", &inv.request.content)
            .await?;
        hub.registry.update(&target.name, |m| m.touch(Utc::now()));
        Ok(answer)
    })
}

fn shutdown<'a>(
    hub: &'a Hub,
    inv: &'a CommandInvocation,
    target: ModuleDescriptor,
) -> BoxFuture<'a, Result<String, HubError>> {
    Box::pin(async move {
        if target.is_hub() {
            hub.request_shutdown();
            return Ok(serde_json::to_string(&Acknowledgement::shutdown(HUB_NAME))?);
        }
        hub.shutdown_module(&target, &inv.request.content).await
    })
}

fn restart<'a>(
    hub: &'a Hub,
    _inv: &'a CommandInvocation,
    target: ModuleDescriptor,
) -> BoxFuture<'a, Result<String, HubError>> {
    Box::pin(async move {
        if target.is_hub() {
            return Err(HubError::InvalidRequest("hub cannot be restarted".into()));
        }
        hub.shutdown_module(&target, "").await?;
        hub.wait_until_stopped(&target).await;
        hub.setup_module(&target.name).await?;
        Ok(format!("Module {} restarted", target.name))
    })
}

fn start<'a>(
    hub: &'a Hub,
    _inv: &'a CommandInvocation,
    target: ModuleDescriptor,
) -> BoxFuture<'a, Result<String, HubError>> {
    Box::pin(async move {
        if target.is_hub() || target.state == ModuleState::Online {
            return Err(HubError::AlreadyOnline(target.name));
        }
        hub.setup_module(&target.name).await?;
        Ok(format!("Module {} starting", target.name))
    })
}

impl Hub {
    pub(crate) async fn command_endpoint(self: &Arc<Self>, ctx: RequestContext) -> HubResponse {
        let remote_addr = ctx.remote_addr;
        match read_post_body(ctx).await {
            Ok(body) => self.handle_command(body, remote_addr).await,
            Err(response) => response,
        }
    }

    pub async fn handle_command(&self, body: Bytes, remote_addr: SocketAddr) -> HubResponse {
        let request = match CommandRequest::from_json(&body) {
            Ok(request) => request,
            Err(e) => {
                warn!(remote = %remote_addr, error = %e, "Malformed command request");
                return error_response(&e);
            }
        };
        let invocation = CommandInvocation {
            request,
            raw: body,
            remote_addr,
        };

        match self.execute(&invocation).await {
            Ok((module, answer)) => {
                info!(
                    remote = %remote_addr,
                    module = %module,
                    command = %invocation.request.command,
                    "Command executed"
                );
                text_response(StatusCode::OK, answer)
            }
            Err(e) => {
                warn!(
                    remote = %remote_addr,
                    hash = %invocation.request.hash,
                    name = %invocation.request.name,
                    command = %invocation.request.command,
                    error = %e,
                    "Command failed"
                );
                error_response(&e)
            }
        }
    }

    /// Authenticate, resolve the target and run the command; returns the target name and answer
    async fn execute(&self, inv: &CommandInvocation) -> Result<(String, String), HubError> {
        let request = &inv.request;
        if request.kind != COMMAND_TYPE {
            return Err(HubError::InvalidRequest(format!(
                "unsupported type '{}'",
                request.kind
            )));
        }

        let caller = self.authenticate(request)?;
        let target = self.resolve_target(&caller, request)?;
        let name = target.name.clone();

        if let Some(executor) = self.commands.get(&request.command) {
            return executor(self, inv, target).await.map(|answer| (name, answer));
        }

        if target.custom_commands.contains(&request.command) {
            let answer = self.client.forward_raw(&target, inv.raw.clone()).await?;
            return Ok((name, answer));
        }

        Err(HubError::CommandNotFound(request.command.clone()))
    }

    fn authenticate(&self, request: &CommandRequest) -> Result<ModuleDescriptor, HubError> {
        if request.hash.is_empty() {
            return Err(HubError::EmptyHash);
        }

        if request.hash == HUB_NAME {
            if !credentials::constant_time_eq(request.secret.trim(), &self.shared_secret) {
                return Err(HubError::Unauthorized(HUB_NAME.to_string()));
            }
            return Ok(self.hub_descriptor());
        }

        let module = self
            .registry
            .find_by_credential(&request.hash)
            .ok_or_else(|| HubError::ModuleNotFound(request.hash.clone()))?;
        if !module.api_key_matches(&request.secret) {
            self.registry.set_state(&module.name, ModuleState::Failed);
            return Err(HubError::Unauthorized(module.name));
        }
        Ok(module)
    }

    /// Hub callers may address any module by `name`, or by `content` for `Start`.
    /// Modules only ever act on themselves.
    fn resolve_target(
        &self,
        caller: &ModuleDescriptor,
        request: &CommandRequest,
    ) -> Result<ModuleDescriptor, HubError> {
        let named = if !caller.is_hub() {
            None
        } else if request.command == "Start" && !request.content.trim().is_empty() {
            Some(request.content.trim())
        } else if !request.name.is_empty() && request.name != HUB_NAME {
            Some(request.name.as_str())
        } else {
            None
        };

        match named {
            Some(name) => self
                .registry
                .get(name)
                .ok_or_else(|| HubError::ModuleNotFound(name.to_string())),
            None => Ok(caller.clone()),
        }
    }

    /// Forward `Shutdown` and mark the module stopped once it acknowledges
    pub(crate) async fn shutdown_module(
        &self,
        target: &ModuleDescriptor,
        content: &str,
    ) -> Result<String, HubError> {
        let answer = self.client.send_command(target, "Shutdown", content).await?;
        if !is_shutdown_ack(&answer, &target.name) {
            warn!(module = %target.name, answer = %answer.trim(), "Shutdown not acknowledged");
            return Err(HubError::ShutdownNotConfirmed(target.name.clone()));
        }

        self.registry.set_state(&target.name, ModuleState::Stopped);
        self.supervisor.remove(&target.name);
        info!(module = %target.name, "Module stopped");
        Ok(answer)
    }

    /// Poll until the module stops answering, bounded by the handshake retry budget
    pub(crate) async fn wait_until_stopped(&self, target: &ModuleDescriptor) {
        let policy = &self.config.handshake;
        for _ in 0..policy.ping_attempts {
            let running = if !target.is_remote() && target.pid > 0 {
                process_running(target.pid)
            } else {
                self.client.ping(target).await
            };
            if !running {
                return;
            }
            tokio::time::sleep(policy.ping_interval()).await;
        }
        warn!(module = %target.name, "Module still running after shutdown, restarting anyway");
    }
}
