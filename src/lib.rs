//! modhub - A self-registering reverse-proxy hub
//!
//! This library provides a gateway that:
//! - Routes HTTP traffic by path prefix to independently run modules
//! - Launches local modules and waits for remote ones to connect back
//! - Confirms modules with a `/connect` handshake followed by ping checks
//! - Accepts authenticated `/cmd` commands for the hub and its modules
//! - Supervises module liveness and demotes modules that go quiet
//! - Serves static `bind` modules and placeholder pages directly

pub mod access_log;
pub mod auth;
pub mod client;
pub mod command;
pub mod config;
pub mod credentials;
pub mod error;
pub mod files;
pub mod git;
pub mod handshake;
pub mod hub;
pub mod module;
pub mod pool;
pub mod process;
pub mod proxy;
pub mod registry;
pub mod router;
pub mod server;
pub mod supervisor;
