//! Local module processes: launching, presence checks and usage sampling

use crate::error::HubError;
use crate::git;
use crate::module::ModuleDescriptor;
use futures::future::BoxFuture;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{info, warn};

/// File module output is redirected to, inside the module directory
pub const MODULE_LOG: &str = "log.log";

/// Fetches module sources and starts module processes during setup
pub trait ModuleLauncher: Send + Sync {
    /// Make the module source available and return the directory it runs in
    fn fetch<'a>(
        &'a self,
        module: &'a ModuleDescriptor,
        mods_dir: &'a Path,
    ) -> BoxFuture<'a, Result<PathBuf, HubError>>;

    /// Start the module in `dir`, returning its process id
    fn start<'a>(
        &'a self,
        module: &'a ModuleDescriptor,
        dir: &'a Path,
    ) -> BoxFuture<'a, Result<u32, HubError>>;
}

/// Directory a module runs in when nothing was fetched
pub fn module_dir(module: &ModuleDescriptor, mods_dir: &Path) -> PathBuf {
    let exe = module.exe.as_ref();
    if let Some(bin) = exe.and_then(|e| e.bin.clone()) {
        return bin;
    }
    match exe.and_then(|e| e.src.as_deref()) {
        Some(src) if !exe.map(|e| e.source_is_git()).unwrap_or(false) => PathBuf::from(src),
        _ => mods_dir.join(&module.name),
    }
}

/// Launcher using git for sources and the platform shell for processes
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    /// Gateway address handed to modules so they know where to connect
    hub_url: String,
}

impl ProcessLauncher {
    pub fn new(hub_url: impl Into<String>) -> Self {
        Self {
            hub_url: hub_url.into(),
        }
    }

    async fn fetch_source(
        &self,
        module: &ModuleDescriptor,
        mods_dir: &Path,
    ) -> Result<PathBuf, HubError> {
        let exe = module.exe.as_ref();
        match exe.and_then(|e| e.src.as_deref()) {
            Some(url) if exe.map(|e| e.source_is_git()).unwrap_or(false) => {
                let dest = mods_dir.join(&module.name);
                git::clone_or_update(url, &dest).await?;
                Ok(exe
                    .and_then(|e| e.bin.as_ref())
                    .map(|bin| if bin.is_relative() { dest.join(bin) } else { bin.clone() })
                    .unwrap_or(dest))
            }
            _ => Ok(module_dir(module, mods_dir)),
        }
    }

    async fn start_process(&self, module: &ModuleDescriptor, dir: &Path) -> Result<u32, HubError> {
        let main = module
            .exe
            .as_ref()
            .and_then(|e| e.main.clone())
            .ok_or_else(|| HubError::Setup(format!("module {} has no exe.main", module.name)))?;

        tokio::fs::create_dir_all(dir).await?;
        let log = std::fs::File::create(dir.join(MODULE_LOG))?;
        let log_err = log.try_clone()?;

        info!(module = %module.name, command = %main, dir = %dir.display(), "Starting module process");

        #[cfg(unix)]
        let mut cmd = {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(&main);
            cmd
        };
        #[cfg(not(unix))]
        let mut cmd = {
            let mut cmd = Command::new("cmd");
            cmd.arg("/C").arg(&main);
            cmd
        };

        cmd.current_dir(dir);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::from(log));
        cmd.stderr(Stdio::from(log_err));
        cmd.env("MODHUB_NAME", &module.name);
        cmd.env("MODHUB_URL", &self.hub_url);
        if let Some(port) = module.binding.port {
            cmd.env("MODHUB_PORT", port.to_string());
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| HubError::Setup(format!("failed to start {}: {}", module.name, e)))?;
        let pid = child.id().unwrap_or(0);
        info!(module = %module.name, pid, "Module process spawned");

        let name = module.name.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => info!(module = %name, ?status, "Module process exited"),
                Err(e) => warn!(module = %name, error = %e, "Error waiting for module process"),
            }
        });

        Ok(pid)
    }
}

impl ModuleLauncher for ProcessLauncher {
    fn fetch<'a>(
        &'a self,
        module: &'a ModuleDescriptor,
        mods_dir: &'a Path,
    ) -> BoxFuture<'a, Result<PathBuf, HubError>> {
        Box::pin(self.fetch_source(module, mods_dir))
    }

    fn start<'a>(
        &'a self,
        module: &'a ModuleDescriptor,
        dir: &'a Path,
    ) -> BoxFuture<'a, Result<u32, HubError>> {
        Box::pin(self.start_process(module, dir))
    }
}

/// Whether an OS process with `pid` exists
pub fn process_running(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }

    #[cfg(unix)]
    {
        // Non-positive pids address process groups
        let pid = match libc::pid_t::try_from(pid) {
            Ok(pid) if pid > 0 => pid,
            _ => return false,
        };
        // Signal 0 only checks for existence and permission
        let result = unsafe { libc::kill(pid, 0) };
        if result == 0 {
            return true;
        }
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    #[cfg(not(unix))]
    {
        let mut system = sysinfo::System::new();
        let pid = sysinfo::Pid::from_u32(pid);
        system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
        system.process(pid).is_some()
    }
}

/// CPU and memory usage of a process, both in percent
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessUsage {
    pub cpu_percent: f32,
    pub memory_percent: f32,
}

/// Sample a process twice, one CPU update interval apart
pub async fn sample_usage(pid: u32) -> Option<ProcessUsage> {
    use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

    if pid == 0 {
        return None;
    }

    let pid = Pid::from_u32(pid);
    let kind = ProcessRefreshKind::new().with_cpu().with_memory();
    let mut system = System::new();
    system.refresh_memory();
    system.refresh_processes_specifics(ProcessesToUpdate::Some(&[pid]), true, kind);
    tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;
    system.refresh_processes_specifics(ProcessesToUpdate::Some(&[pid]), true, kind);

    let process = system.process(pid)?;
    let total = system.total_memory();
    let memory_percent = if total > 0 {
        (process.memory() as f64 / total as f64 * 100.0) as f32
    } else {
        0.0
    };

    Some(ProcessUsage {
        cpu_percent: process.cpu_usage(),
        memory_percent,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ExecConfig;

    fn local_module(main: &str) -> ModuleDescriptor {
        let mut module = ModuleDescriptor::new("echo");
        module.exe = Some(ExecConfig {
            main: Some(main.to_string()),
            ..Default::default()
        });
        module
    }

    #[test]
    fn test_current_process_is_running() {
        assert!(process_running(std::process::id()));
        assert!(!process_running(0));
    }

    #[test]
    fn test_out_of_range_pids_are_not_running() {
        assert!(!process_running(u32::MAX));
        assert!(!process_running(i32::MAX as u32 + 1));
    }

    #[test]
    fn test_module_dir_resolution() {
        let mods = Path::new("/srv/mods");
        let mut module = local_module("true");
        assert_eq!(module_dir(&module, mods), PathBuf::from("/srv/mods/echo"));

        module.exe.as_mut().unwrap().src = Some("/opt/echo".to_string());
        assert_eq!(module_dir(&module, mods), PathBuf::from("/opt/echo"));

        module.exe.as_mut().unwrap().bin = Some(PathBuf::from("/opt/echo/bin"));
        assert_eq!(module_dir(&module, mods), PathBuf::from("/opt/echo/bin"));
    }

    #[tokio::test]
    async fn test_sample_own_usage() {
        let usage = sample_usage(std::process::id()).await.unwrap();
        assert!(usage.cpu_percent >= 0.0);
        assert!(usage.memory_percent >= 0.0);
        assert!(sample_usage(0).await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_redirects_output_to_log() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = ProcessLauncher::new("http://127.0.0.1:2000");
        let module = local_module("echo started $MODHUB_NAME");

        let pid = launcher.start(&module, dir.path()).await.unwrap();
        assert!(pid > 0);

        let log = dir.path().join(MODULE_LOG);
        let mut content = String::new();
        for _ in 0..50 {
            content = std::fs::read_to_string(&log).unwrap_or_default();
            if !content.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(content.trim(), "started echo");
    }

    #[tokio::test]
    async fn test_start_without_main_fails() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = ProcessLauncher::new("http://127.0.0.1:2000");
        let module = ModuleDescriptor::new("nothing");
        assert!(matches!(
            launcher.start(&module, dir.path()).await,
            Err(HubError::Setup(_))
        ));
    }
}
