//! Gateway to module command channel
//!
//! Commands are POSTed as JSON to `<protocol>://<address>:<port>/cmd` on the
//! module. A module acknowledges `Shutdown` with
//! `{"name": "<module>", "ack": "Shutdown"}`; nothing else counts.

use crate::error::HubError;
use crate::module::ModuleDescriptor;
use hyper::body::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

pub const COMMAND_PATH: &str = "/cmd";

/// Body of a command sent to a module
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutgoingCommand {
    pub name: String,
    pub hash: String,
    pub secret: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub command: String,
    pub content: String,
}

/// Structured acknowledgement a module returns for `Shutdown`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Acknowledgement {
    pub name: String,
    pub ack: String,
}

impl Acknowledgement {
    pub fn shutdown(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ack: "Shutdown".to_string(),
        }
    }
}

/// True when `body` is the shutdown acknowledgement of `module`
pub fn is_shutdown_ack(body: &str, module: &str) -> bool {
    serde_json::from_str::<Acknowledgement>(body.trim())
        .map(|ack| ack.name == module && ack.ack == "Shutdown")
        .unwrap_or(false)
}

#[derive(Clone)]
pub struct ModuleClient {
    http: reqwest::Client,
    shared_secret: String,
}

impl ModuleClient {
    pub fn new(shared_secret: impl Into<String>, timeout: Duration) -> Self {
        // modules are always dialed directly, never through an environment proxy
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .no_proxy()
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            shared_secret: shared_secret.into(),
        }
    }

    fn command_url(module: &ModuleDescriptor) -> Result<String, HubError> {
        module
            .binding
            .base_url()
            .map(|base| format!("{}{}", base, COMMAND_PATH))
            .ok_or_else(|| HubError::unreachable(&module.name, "no port bound"))
    }

    /// Send a built-in command and return the module's text answer
    pub async fn send_command(
        &self,
        module: &ModuleDescriptor,
        command: &str,
        content: &str,
    ) -> Result<String, HubError> {
        let body = OutgoingCommand {
            name: module.name.clone(),
            hash: module.module_hash.clone().unwrap_or_default(),
            secret: self.shared_secret.clone(),
            kind: "Command".to_string(),
            command: command.to_string(),
            content: content.to_string(),
        };
        let url = Self::command_url(module)?;
        debug!(module = %module.name, command, url = %url, "Sending command to module");

        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| HubError::unreachable(&module.name, e))?;
        read_answer(&module.name, response).await
    }

    /// Forward a raw command body to the module unchanged
    pub async fn forward_raw(
        &self,
        module: &ModuleDescriptor,
        body: Bytes,
    ) -> Result<String, HubError> {
        let url = Self::command_url(module)?;
        debug!(module = %module.name, url = %url, bytes = body.len(), "Forwarding command to module");

        let response = self
            .http
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.to_vec())
            .send()
            .await
            .map_err(|e| HubError::unreachable(&module.name, e))?;
        read_answer(&module.name, response).await
    }

    /// `Ping` succeeds on any successful answer
    pub async fn ping(&self, module: &ModuleDescriptor) -> bool {
        match self.send_command(module, "Ping", "").await {
            Ok(_) => true,
            Err(e) => {
                debug!(module = %module.name, error = %e, "Ping failed");
                false
            }
        }
    }
}

async fn read_answer(name: &str, response: reqwest::Response) -> Result<String, HubError> {
    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| HubError::unreachable(name, e))?;
    if !status.is_success() {
        return Err(HubError::unreachable(
            name,
            format!("status {} : {}", status.as_u16(), text.trim()),
        ));
    }
    Ok(text)
}
