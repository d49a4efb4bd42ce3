//! Long-lived spawner processes.
//!
//! A framework spawner has a framework preloaded and starts application
//! spawners. An application spawner has one application preloaded and
//! starts workers. Both are helper processes driven over the
//! `hatch-protocol` wire format.

mod application;
mod framework;

pub use application::SocketApplicationSpawner;
pub use framework::{HelperFrameworkSpawner, HelperSpawnerFactory};

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::SpawnResult;
use crate::launcher::{FrameworkKey, LaunchRecipe};
use crate::privilege::PrivilegeResolution;

/// Common lifecycle of pooled spawners.
#[async_trait]
pub trait Spawner: Send + Sync {
    /// Process id of the helper.
    fn pid(&self) -> u32;

    /// Whether the helper can still take requests.
    async fn is_alive(&self) -> bool;

    /// Stop the helper. Idempotent.
    async fn shutdown(&self);
}

/// Parameters for starting an application spawner.
#[derive(Debug, Clone)]
pub struct AppSpawnerRequest {
    pub app_root: PathBuf,
    pub environment: String,
    /// Identity the application spawner and its workers run as.
    pub privilege: PrivilegeResolution,
    pub recipe: Arc<LaunchRecipe>,
}

/// A spawner with a framework preloaded.
#[async_trait]
pub trait FrameworkSpawner: Spawner {
    /// Start an application spawner for one app.
    async fn start_application_spawner(
        &self,
        request: AppSpawnerRequest,
    ) -> SpawnResult<Arc<dyn ApplicationSpawner>>;
}

/// A worker started by an application spawner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpawnedWorker {
    pub pid: u32,
    pub listen_socket: PathBuf,
    pub using_abstract_namespace: bool,
}

/// A spawner with one application preloaded.
#[async_trait]
pub trait ApplicationSpawner: Spawner {
    /// Start one worker.
    async fn spawn_worker(&self) -> SpawnResult<SpawnedWorker>;
}

/// Parameters for starting a framework spawner.
#[derive(Debug, Clone)]
pub struct FrameworkSpawnerRequest {
    pub key: FrameworkKey,
    pub recipe: Arc<LaunchRecipe>,
    /// App root of the request that triggered creation; used as the
    /// helper's working directory.
    pub app_root: PathBuf,
    pub environment: String,
}

/// Creates framework spawners.
#[async_trait]
pub trait SpawnerFactory: Send + Sync {
    async fn start_framework_spawner(
        &self,
        request: FrameworkSpawnerRequest,
    ) -> SpawnResult<Arc<dyn FrameworkSpawner>>;
}
