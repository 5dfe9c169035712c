//! `/connect`: modules announce themselves and get confirmed by ping
//!
//! The caller gets its answer as soon as the credentials are checked. Route
//! hooking and supervision only happen after a background task has reached
//! the module's own command endpoint.

use crate::credentials;
use crate::error::{error_response, HubError};
use crate::hub::{read_post_body, Hub};
use crate::module::ModuleState;
use crate::router::{full_body, HubResponse, RequestContext};
use chrono::Utc;
use hyper::{Response, StatusCode};
use serde::{Deserialize, Deserializer, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Handshake body sent by a module, echoed back with `state` filled in
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionRequest {
    pub name: String,
    pub secret: String,
    pub module_hash: String,
    #[serde(alias = "processId")]
    pub pid: u32,
    #[serde(deserialize_with = "port_from_any")]
    pub port: Option<u16>,
    #[serde(alias = "customCommandNames")]
    pub custom_commands: Vec<String>,
    pub resource_path: String,
    /// `"true"` or `"false"` in responses
    pub state: String,
}

/// Modules send the port as a number or as a string
fn port_from_any<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    let port = match value {
        Some(serde_json::Value::Number(n)) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
        Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    };
    Ok(port.filter(|p| *p != 0))
}

fn connection_response(mut request: ConnectionRequest, accepted: bool) -> HubResponse {
    request.secret.clear();
    request.state = accepted.to_string();
    let body = serde_json::to_vec(&request).unwrap_or_default();
    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static headers")
}

impl Hub {
    pub(crate) async fn connect_endpoint(self: &Arc<Self>, ctx: RequestContext) -> HubResponse {
        let remote_addr = ctx.remote_addr;
        match read_post_body(ctx).await {
            Ok(body) => self.handle_connect(&body, remote_addr),
            Err(response) => response,
        }
    }

    /// Check a module's credentials and answer immediately; confirmation runs in the background
    pub fn handle_connect(self: &Arc<Self>, body: &[u8], remote_addr: SocketAddr) -> HubResponse {
        let request: ConnectionRequest = match serde_json::from_slice(body) {
            Ok(request) => request,
            Err(e) => {
                debug!(remote = %remote_addr, error = %e, "Malformed connect request");
                return error_response(&HubError::InvalidRequest(e.to_string()));
            }
        };

        let module = match self.registry.get(&request.name) {
            Some(module) if !module.is_hub() => module,
            _ => {
                warn!(remote = %remote_addr, module = %request.name, "Connect from unknown module");
                return error_response(&HubError::InvalidRequest(format!(
                    "unknown module {}",
                    request.name
                )));
            }
        };

        let hash = request.module_hash.trim().to_string();
        let secret_ok = credentials::constant_time_eq(request.secret.trim(), &self.shared_secret);
        if !secret_ok || hash.is_empty() {
            warn!(
                remote = %remote_addr,
                module = %module.name,
                empty_hash = hash.is_empty(),
                "Handshake rejected"
            );
            self.registry.update(&module.name, |m| {
                m.state = ModuleState::Failed;
                m.api_key = None;
            });
            return connection_response(request, false);
        }

        let now = Utc::now();
        let claimed = self.registry.update_claiming(&module.name, &hash, |m| {
            if !m.is_remote() {
                m.binding.address = remote_addr.ip().to_string();
            }
            m.state = ModuleState::Online;
            m.pid = request.pid;
            m.module_hash = Some(hash.clone());
            m.custom_commands = request.custom_commands.iter().cloned().collect();
            m.resource_path = Some(request.resource_path.clone()).filter(|p| !p.is_empty());
            if m.binding.port.is_none() {
                m.binding.port = request.port;
            }
            m.touch(now);
        });

        let updated = match claimed {
            Ok(updated) => updated,
            Err(holder) => {
                warn!(
                    remote = %remote_addr,
                    module = %module.name,
                    holder = %holder,
                    "Handshake rejected, module hash already in use"
                );
                self.registry.update(&module.name, |m| {
                    m.state = ModuleState::Failed;
                    m.api_key = None;
                });
                return connection_response(request, false);
            }
        };

        if let Some(module) = updated {
            info!(
                remote = %remote_addr,
                module = %module.name,
                pid = module.pid,
                port = ?module.binding.port,
                commands = module.custom_commands.len(),
                "Handshake accepted"
            );
            self.spawn_confirmation(&module.name);
        }
        connection_response(request, true)
    }

    /// Track one confirmation task per module, replacing any still running
    fn spawn_confirmation(self: &Arc<Self>, name: &str) {
        let id = self.confirmation_ids.fetch_add(1, Ordering::Relaxed);
        let hub = Arc::clone(self);
        let task_name = name.to_string();
        let handle = tokio::spawn(async move {
            hub.confirm_liveness(&task_name).await;
            hub.confirmations
                .remove_if(&task_name, |_, (task_id, _)| *task_id == id);
        });

        if let Some((_, previous)) = self.confirmations.insert(name.to_string(), (id, handle)) {
            debug!(module = name, "Replacing pending confirmation");
            previous.abort();
        }
    }

    async fn confirm_liveness(&self, name: &str) {
        let policy = &self.config.handshake;
        tokio::time::sleep(policy.settle_delay()).await;

        for attempt in 1..=policy.ping_attempts {
            let module = match self.registry.get(name) {
                Some(module) if module.state == ModuleState::Online => module,
                other => {
                    debug!(module = name, state = ?other.map(|m| m.state), "Module left ONLINE, confirmation dropped");
                    return;
                }
            };

            if self.client.ping(&module).await {
                self.registry.update(name, |m| m.touch(Utc::now()));
                self.hook_routes(&module);
                if module.is_supervised() {
                    self.supervisor.add(name);
                }
                info!(module = name, attempt, "Module confirmed");
                return;
            }

            debug!(module = name, attempt, max = policy.ping_attempts, "Confirmation ping failed");
            if attempt < policy.ping_attempts {
                tokio::time::sleep(policy.ping_interval()).await;
            }
        }

        warn!(module = name, attempts = policy.ping_attempts, "Module never answered, marking FAILED");
        self.registry.set_state(name, ModuleState::Failed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::test_support::*;
    use std::time::Duration;

    fn connect_body(name: &str, secret: &str, hash: &str, port: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "name": name,
            "secret": secret,
            "moduleHash": hash,
            "pid": 77,
            "port": port,
            "customCommands": ["Greet"],
            "resourcePath": "/res",
        }))
        .unwrap()
    }

    async fn answer(response: HubResponse) -> (StatusCode, serde_json::Value) {
        use http_body_util::BodyExt;
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null))
    }

    fn remote_addr() -> SocketAddr {
        "10.9.8.7:40000".parse().unwrap()
    }

    #[test]
    fn test_port_accepts_number_or_string() {
        let parsed: ConnectionRequest = serde_json::from_str(r#"{"name":"a","port":"8081"}"#).unwrap();
        assert_eq!(parsed.port, Some(8081));
        let parsed: ConnectionRequest = serde_json::from_str(r#"{"name":"a","port":8082}"#).unwrap();
        assert_eq!(parsed.port, Some(8082));
        let parsed: ConnectionRequest = serde_json::from_str(r#"{"name":"a","port":"x"}"#).unwrap();
        assert_eq!(parsed.port, None);
        let parsed: ConnectionRequest =
            serde_json::from_str(r#"{"name":"a","processId":9,"customCommandNames":["X"]}"#).unwrap();
        assert_eq!(parsed.pid, 9);
        assert_eq!(parsed.custom_commands, vec!["X"]);
    }

    #[tokio::test]
    async fn test_unknown_module_rejected_without_state_change() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with(vec![("blog", reverse_module("/blog", remote()))], dir.path());
        let hub = hub_with(config, Arc::new(RecordingLauncher::default()));
        let before = hub.registry().snapshot().len();

        let response = hub.handle_connect(&connect_body("ghost", SECRET, "h", 1.into()), remote_addr());
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(hub.registry().snapshot().len(), before);
        assert_eq!(hub.registry().state_of("blog"), Some(ModuleState::Unknown));

        let response = hub.handle_connect(b"not json", remote_addr());
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_wrong_secret_fails_and_clears_key() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with(vec![("blog", reverse_module("/blog", remote()))], dir.path());
        let hub = hub_with(config, Arc::new(RecordingLauncher::default()));
        hub.setup_module("blog").await.unwrap();
        assert!(hub.registry().get("blog").unwrap().api_key.is_some());

        let response = hub.handle_connect(&connect_body("blog", "wrong", "h", 1.into()), remote_addr());
        let (status, json) = answer(response).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["state"], "false");
        assert_eq!(json["secret"], "");

        let module = hub.registry().get("blog").unwrap();
        assert_eq!(module.state, ModuleState::Failed);
        assert!(module.api_key.is_none());
        assert!(hub.confirmations.is_empty());
    }

    #[tokio::test]
    async fn test_empty_hash_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with(vec![("blog", reverse_module("/blog", remote()))], dir.path());
        let hub = hub_with(config, Arc::new(RecordingLauncher::default()));

        let response = hub.handle_connect(&connect_body("blog", SECRET, "  ", 1.into()), remote_addr());
        let (_, json) = answer(response).await;
        assert_eq!(json["state"], "false");
        assert_eq!(hub.registry().state_of("blog"), Some(ModuleState::Failed));
    }

    #[tokio::test]
    async fn test_accepted_handshake_updates_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let exe = crate::config::ExecSection {
            main: Some("./run".into()),
            ..Default::default()
        };
        let mut fixed = reverse_module("/fixed", Some(exe.clone()));
        fixed.binding.port = Some(9000);
        let config = config_with(
            vec![("blog", reverse_module("/blog", Some(exe))), ("fixed", fixed)],
            dir.path(),
        );
        let hub = hub_with(config, Arc::new(RecordingLauncher::default()));

        let secret = format!("{}\n", SECRET);
        let response = hub.handle_connect(&connect_body("blog", &secret, "blog-hash", "8081".into()), remote_addr());
        let (_, json) = answer(response).await;
        assert_eq!(json["state"], "true");
        assert_eq!(json["name"], "blog");

        let blog = hub.registry().get("blog").unwrap();
        assert_eq!(blog.state, ModuleState::Online);
        assert_eq!(blog.pid, 77);
        assert_eq!(blog.binding.port, Some(8081));
        assert_eq!(blog.binding.address, "10.9.8.7");
        assert_eq!(blog.module_hash.as_deref(), Some("blog-hash"));
        assert!(blog.custom_commands.contains("Greet"));
        assert_eq!(blog.resource_path.as_deref(), Some("/res"));

        hub.handle_connect(&connect_body("fixed", SECRET, "fixed-hash", 8082.into()), remote_addr());
        assert_eq!(hub.registry().get("fixed").unwrap().binding.port, Some(9000));
        hub.abort_confirmations();
    }

    #[tokio::test]
    async fn test_hash_held_by_another_module_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with(
            vec![
                ("blog", reverse_module("/blog", remote())),
                ("shop", reverse_module("/shop", remote())),
            ],
            dir.path(),
        );
        let hub = hub_with(config, Arc::new(RecordingLauncher::default()));

        hub.handle_connect(&connect_body("blog", SECRET, "same-hash", 1.into()), remote_addr());
        assert_eq!(hub.registry().state_of("blog"), Some(ModuleState::Online));

        let response = hub.handle_connect(&connect_body("shop", SECRET, "same-hash", 1.into()), remote_addr());
        let (_, json) = answer(response).await;
        assert_eq!(json["state"], "false");

        let shop = hub.registry().get("shop").unwrap();
        assert_eq!(shop.state, ModuleState::Failed);
        assert!(shop.module_hash.is_none());
        assert_eq!(hub.registry().find_by_credential("same-hash").unwrap().name, "blog");

        let response = hub.handle_connect(&connect_body("shop", SECRET, "hub", 1.into()), remote_addr());
        let (_, json) = answer(response).await;
        assert_eq!(json["state"], "false");
        hub.abort_confirmations();
    }

    #[tokio::test]
    async fn test_remote_module_keeps_configured_address() {
        let dir = tempfile::tempdir().unwrap();
        let mut module = reverse_module("/edge", remote());
        module.binding.address = "192.168.1.20".to_string();
        let config = config_with(vec![("edge", module)], dir.path());
        let hub = hub_with(config, Arc::new(RecordingLauncher::default()));

        hub.handle_connect(&connect_body("edge", SECRET, "edge-hash", 1.into()), remote_addr());
        assert_eq!(hub.registry().get("edge").unwrap().binding.address, "192.168.1.20");
        hub.abort_confirmations();
    }

    #[tokio::test]
    async fn test_unreachable_module_fails_after_retries() {
        let dir = tempfile::tempdir().unwrap();
        let mut module = reverse_module("/edge", remote());
        module.binding.address = "127.0.0.1".to_string();
        // nothing listens on the discard port
        module.binding.port = Some(9);
        let config = config_with(vec![("edge", module)], dir.path());
        let hub = hub_with(config, Arc::new(RecordingLauncher::default()));

        hub.handle_connect(&connect_body("edge", SECRET, "edge-hash", 9.into()), remote_addr());
        assert_eq!(hub.registry().state_of("edge"), Some(ModuleState::Online));

        let mut state = None;
        for _ in 0..100 {
            state = hub.registry().state_of("edge");
            if state == Some(ModuleState::Failed) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(state, Some(ModuleState::Failed));
        assert!(!hub.router().patterns().contains(&"/edge".to_string()));
    }
}
