//! OS-level process creation.
//!
//! A [`ProcessLauncher`] turns a [`LaunchRequest`] into a running child. It
//! is used directly for conservative spawns and to start framework spawner
//! helpers; everything else is created by helpers.

mod command;
mod recipe;

pub use command::CommandLauncher;
pub(crate) use command::ensure_socket_dir;
pub use recipe::{FrameworkKey, LaunchRecipe, RecipeBook};

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hatch_protocol::ENVIRONMENT_ENV;
use log::warn;
use tokio::io::BufReader;
use tokio::process::{Child, ChildStdin, ChildStdout};

use crate::error::LaunchError;
use crate::privilege::PrivilegeResolution;

/// How long to wait for a killed child to be reaped.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// What kind of process to launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchRole {
    /// An application worker, started from the recipe's worker command.
    Worker,
    /// A framework spawner helper speaking the helper protocol on stdio.
    FrameworkSpawner,
}

/// Everything needed to start one process.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub privilege: PrivilegeResolution,
    pub app_root: PathBuf,
    pub environment: String,
    pub recipe: Arc<LaunchRecipe>,
    pub role: LaunchRole,
}

impl LaunchRequest {
    /// Command line for this role (never empty for a validated recipe).
    pub fn command(&self) -> &[String] {
        match self.role {
            LaunchRole::Worker => &self.recipe.worker_command,
            LaunchRole::FrameworkSpawner => &self.recipe.framework_command,
        }
    }

    /// Program name, for error messages.
    pub fn program(&self) -> &str {
        self.command().first().map(String::as_str).unwrap_or_default()
    }

    /// Environment variables carrying the deployment environment.
    pub fn environment_variables(&self) -> BTreeMap<String, String> {
        environment_variables(&self.recipe, &self.environment)
    }
}

/// The recipe's environment variables plus `HATCH_ENV`, all set to
/// `environment`.
pub fn environment_variables(recipe: &LaunchRecipe, environment: &str) -> BTreeMap<String, String> {
    let mut vars: BTreeMap<String, String> = recipe
        .environment_variables
        .iter()
        .map(|name| (name.clone(), environment.to_string()))
        .collect();
    vars.insert(ENVIRONMENT_ENV.to_string(), environment.to_string());
    vars
}

/// The protocol pipes of a helper process.
#[derive(Debug)]
pub struct HelperPipes {
    pub stdin: ChildStdin,
    pub stdout: BufReader<ChildStdout>,
}

/// A process that was started successfully.
#[derive(Debug)]
pub struct LaunchedProcess {
    pub pid: u32,
    pub child: Child,
    /// Socket the worker was told to listen on (workers only).
    pub listen_socket: Option<PathBuf>,
    /// Protocol pipes (framework spawner helpers only).
    pub pipes: Option<HelperPipes>,
}

/// Creates OS processes.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Start the process described by `request`.
    ///
    /// On error no child of this attempt is left running.
    async fn launch(&self, request: &LaunchRequest) -> Result<LaunchedProcess, LaunchError>;
}

/// Kill `child` and wait for it to be reaped.
pub async fn terminate(child: &mut Child, pid: u32) {
    if let Err(e) = child.kill().await {
        // Already gone is fine; anything else is worth a note.
        if e.kind() != std::io::ErrorKind::InvalidInput {
            warn!("Failed to kill process {}: {}", pid, e);
        }
    }

    match tokio::time::timeout(REAP_TIMEOUT, child.wait()).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => warn!("Error waiting for process {}: {:?}", pid, e),
        Err(_) => warn!("Timeout waiting for process {} to exit", pid),
    }
}
