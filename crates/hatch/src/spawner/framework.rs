//! Framework spawner helper reached over its stdio.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use hatch_protocol::{HelperRequest, HelperResponse, read_message, write_message};
use log::{debug, info, warn};
use tokio::process::Child;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    AppSpawnerRequest, ApplicationSpawner, FrameworkSpawner, FrameworkSpawnerRequest,
    SocketApplicationSpawner, Spawner, SpawnerFactory,
};
use crate::config::LauncherConfig;
use crate::error::{LaunchError, LaunchFailureKind, SpawnResult};
use crate::launcher::{
    FrameworkKey, HelperPipes, LaunchRequest, LaunchRole, LaunchedProcess, ProcessLauncher,
    ensure_socket_dir, environment_variables, terminate,
};
use crate::privilege::{PrivilegeResolution, UnchangedReason};

/// How long a helper gets to exit on its own after `shutdown`.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A framework spawner helper that is a child of this process.
pub struct HelperFrameworkSpawner {
    key: FrameworkKey,
    pid: u32,
    program: String,
    child: Mutex<Child>,
    pipes: Mutex<HelperPipes>,
    socket_dir: PathBuf,
    request_timeout: Duration,
    /// Set when the protocol stream can no longer be trusted.
    broken: AtomicBool,
    stopped: AtomicBool,
}

impl std::fmt::Debug for HelperFrameworkSpawner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HelperFrameworkSpawner")
            .field("key", &self.key)
            .field("pid", &self.pid)
            .field("program", &self.program)
            .finish_non_exhaustive()
    }
}

impl HelperFrameworkSpawner {
    /// Wrap a launched helper. The process must have its protocol pipes.
    pub fn new(
        key: FrameworkKey,
        launched: LaunchedProcess,
        program: impl Into<String>,
        socket_dir: PathBuf,
        request_timeout: Duration,
    ) -> Result<Self, LaunchError> {
        let program = program.into();
        let LaunchedProcess {
            pid, child, pipes, ..
        } = launched;
        let Some(pipes) = pipes else {
            return Err(LaunchError::new(
                program,
                LaunchFailureKind::Io,
                "framework spawner was launched without protocol pipes",
            ));
        };
        Ok(Self {
            key,
            pid,
            program,
            child: Mutex::new(child),
            pipes: Mutex::new(pipes),
            socket_dir,
            request_timeout,
            broken: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn key(&self) -> &FrameworkKey {
        &self.key
    }

    async fn request(&self, request: &HelperRequest) -> Result<HelperResponse, LaunchError> {
        let mut guard = self.pipes.lock().await;
        let pipes = &mut *guard;
        let exchange = async {
            write_message(&mut pipes.stdin, request).await?;
            read_message::<_, HelperResponse>(&mut pipes.stdout).await
        };

        let outcome = match tokio::time::timeout(self.request_timeout, exchange).await {
            Ok(Ok(Some(response))) => return Ok(response),
            Ok(Ok(None)) => "helper closed its output".to_string(),
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!(
                "no response within {}s",
                self.request_timeout.as_secs()
            ),
        };
        self.broken.store(true, Ordering::SeqCst);
        Err(LaunchError::helper(&self.program, outcome))
    }
}

#[async_trait]
impl Spawner for HelperFrameworkSpawner {
    fn pid(&self) -> u32 {
        self.pid
    }

    async fn is_alive(&self) -> bool {
        if self.broken.load(Ordering::SeqCst) || self.stopped.load(Ordering::SeqCst) {
            return false;
        }
        matches!(self.child.lock().await.try_wait(), Ok(None))
    }

    async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down framework spawner {} (pid={})", self.key, self.pid);

        if !self.broken.load(Ordering::SeqCst)
            && let Err(e) = self.request(&HelperRequest::Shutdown).await
        {
            debug!("Framework spawner {} ignored shutdown: {}", self.pid, e);
        }

        let mut child = self.child.lock().await;
        match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("Error waiting for framework spawner {}: {:?}", self.pid, e),
            Err(_) => terminate(&mut child, self.pid).await,
        }
    }
}

#[async_trait]
impl FrameworkSpawner for HelperFrameworkSpawner {
    async fn start_application_spawner(
        &self,
        request: AppSpawnerRequest,
    ) -> SpawnResult<Arc<dyn ApplicationSpawner>> {
        ensure_socket_dir(&self.socket_dir)
            .await
            .map_err(|e| LaunchError::from_io(&self.program, &e))?;
        let control_socket = self
            .socket_dir
            .join(format!("app-{}.sock", Uuid::new_v4().simple()));
        let identity = request.privilege.identity();

        let message = HelperRequest::StartAppSpawner {
            app_root: request.app_root.to_string_lossy().into_owned(),
            environment: request.environment.clone(),
            env: environment_variables(&request.recipe, &request.environment),
            worker_command: request.recipe.worker_command.clone(),
            control_socket: control_socket.to_string_lossy().into_owned(),
            uid: identity.map(|i| i.uid),
            gid: identity.map(|i| i.gid),
        };

        match self.request(&message).await? {
            HelperResponse::AppSpawnerStarted {
                pid,
                control_socket,
            } => {
                info!(
                    "Framework spawner {} started application spawner pid={} for {}",
                    self.key,
                    pid,
                    request.app_root.display()
                );
                Ok(Arc::new(SocketApplicationSpawner::new(
                    pid,
                    PathBuf::from(control_socket),
                    self.socket_dir.clone(),
                    self.request_timeout,
                )))
            }
            HelperResponse::Error { message } => {
                Err(LaunchError::helper(&self.program, message).into())
            }
            other => Err(LaunchError::helper(
                &self.program,
                format!("unexpected response to start_app_spawner: {other:?}"),
            )
            .into()),
        }
    }
}

/// [`SpawnerFactory`] that launches framework helpers with a
/// [`ProcessLauncher`].
pub struct HelperSpawnerFactory {
    launcher: Arc<dyn ProcessLauncher>,
    socket_dir: PathBuf,
    request_timeout: Duration,
}

impl HelperSpawnerFactory {
    pub fn new(
        launcher: Arc<dyn ProcessLauncher>,
        socket_dir: impl Into<PathBuf>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            launcher,
            socket_dir: socket_dir.into(),
            request_timeout,
        }
    }

    pub fn from_config(launcher: Arc<dyn ProcessLauncher>, config: &LauncherConfig) -> Self {
        Self::new(
            launcher,
            config.socket_dir_path(),
            config.helper_request_timeout(),
        )
    }
}

#[async_trait]
impl SpawnerFactory for HelperSpawnerFactory {
    async fn start_framework_spawner(
        &self,
        request: FrameworkSpawnerRequest,
    ) -> SpawnResult<Arc<dyn FrameworkSpawner>> {
        // Shared across app owners, so it keeps our identity; each
        // application spawner is lowered individually.
        let launch = LaunchRequest {
            privilege: PrivilegeResolution::unchanged(UnchangedReason::Disabled),
            app_root: request.app_root,
            environment: request.environment,
            recipe: request.recipe,
            role: LaunchRole::FrameworkSpawner,
        };
        let program = launch.program().to_string();
        let launched = self.launcher.launch(&launch).await?;
        let pid = launched.pid;
        let spawner = HelperFrameworkSpawner::new(
            request.key,
            launched,
            program,
            self.socket_dir.clone(),
            self.request_timeout,
        )?;
        debug!("Framework spawner {} ready (pid={})", spawner.key(), pid);
        Ok(Arc::new(spawner))
    }
}
