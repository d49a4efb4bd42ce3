//! [`ProcessLauncher`] backed by `tokio::process::Command`.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use hatch_protocol::{HelperResponse, LISTEN_SOCKET_ENV, read_message};
use log::{debug, info};
use tokio::io::BufReader;
use tokio::process::{Child, Command};
use uuid::Uuid;

use super::{HelperPipes, LaunchRequest, LaunchRole, LaunchedProcess, ProcessLauncher, terminate};
use crate::config::LauncherConfig;
use crate::error::{LaunchError, LaunchFailureKind};
use crate::privilege::PrivilegeResolution;

/// Sockets are created by processes running as arbitrary users.
const SOCKET_DIR_MODE: u32 = 0o1777;

/// Starts processes as direct children of the current process.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    socket_dir: PathBuf,
    helper_startup_timeout: Duration,
}

impl CommandLauncher {
    pub fn new(socket_dir: impl Into<PathBuf>, helper_startup_timeout: Duration) -> Self {
        Self {
            socket_dir: socket_dir.into(),
            helper_startup_timeout,
        }
    }

    pub fn from_config(config: &LauncherConfig) -> Self {
        Self::new(config.socket_dir_path(), config.helper_startup_timeout())
    }

    pub fn socket_dir(&self) -> &Path {
        &self.socket_dir
    }

    fn build_command(&self, request: &LaunchRequest) -> Result<Command, LaunchError> {
        let Some((program, args)) = request.command().split_first() else {
            return Err(LaunchError::new(
                "",
                LaunchFailureKind::Io,
                format!("empty {:?} command for {}", request.role, request.recipe.app_type),
            ));
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&request.app_root)
            .envs(request.environment_variables())
            .kill_on_drop(true);

        if let PrivilegeResolution::Lowered(identity) = &request.privilege {
            cmd.uid(identity.uid)
                .gid(identity.gid)
                .env("USER", &identity.user)
                .env("LOGNAME", &identity.user);
        }

        Ok(cmd)
    }

    async fn launch_worker(
        &self,
        request: &LaunchRequest,
        mut cmd: Command,
    ) -> Result<LaunchedProcess, LaunchError> {
        let program = request.program().to_string();
        ensure_socket_dir(&self.socket_dir)
            .await
            .map_err(|e| LaunchError::from_io(&program, &e))?;
        let listen_socket = self
            .socket_dir
            .join(format!("worker-{}.sock", Uuid::new_v4().simple()));

        cmd.env(LISTEN_SOCKET_ENV, &listen_socket)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let child = cmd
            .spawn()
            .map_err(|e| LaunchError::from_io(&program, &e))?;
        let pid = child_pid(&child, &program)?;

        info!(
            "Started worker {} (pid={}) for {}",
            program,
            pid,
            request.app_root.display()
        );
        Ok(LaunchedProcess {
            pid,
            child,
            listen_socket: Some(listen_socket),
            pipes: None,
        })
    }

    async fn launch_helper(
        &self,
        request: &LaunchRequest,
        mut cmd: Command,
    ) -> Result<LaunchedProcess, LaunchError> {
        let program = request.program().to_string();
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = cmd
            .spawn()
            .map_err(|e| LaunchError::from_io(&program, &e))?;
        let pid = match child_pid(&child, &program) {
            Ok(pid) => pid,
            Err(e) => {
                terminate(&mut child, 0).await;
                return Err(e);
            }
        };

        match self.wait_ready(&mut child, &program).await {
            Ok(pipes) => {
                info!(
                    "Started framework spawner {} (pid={}) for {}",
                    program, pid, request.recipe.app_type
                );
                Ok(LaunchedProcess {
                    pid,
                    child,
                    listen_socket: None,
                    pipes: Some(pipes),
                })
            }
            Err(e) => {
                terminate(&mut child, pid).await;
                Err(e)
            }
        }
    }

    async fn wait_ready(&self, child: &mut Child, program: &str) -> Result<HelperPipes, LaunchError> {
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(LaunchError::new(
                program,
                LaunchFailureKind::Io,
                "helper stdio was not captured",
            ));
        };
        let mut stdout = BufReader::new(stdout);

        let first = tokio::time::timeout(
            self.helper_startup_timeout,
            read_message::<_, HelperResponse>(&mut stdout),
        )
        .await;

        match first {
            Ok(Ok(Some(HelperResponse::Ready { pid, .. }))) => {
                debug!("Helper {} reported ready (pid={})", program, pid);
                Ok(HelperPipes { stdin, stdout })
            }
            Ok(Ok(Some(HelperResponse::Error { message }))) => {
                Err(LaunchError::helper(program, message))
            }
            Ok(Ok(Some(other))) => Err(LaunchError::helper(
                program,
                format!("expected ready, got {other:?}"),
            )),
            Ok(Ok(None)) => {
                let status = child
                    .wait()
                    .await
                    .map(|s| s.to_string())
                    .unwrap_or_else(|e| e.to_string());
                Err(LaunchError::new(
                    program,
                    LaunchFailureKind::EarlyExit,
                    format!("helper exited before becoming ready ({status})"),
                ))
            }
            Ok(Err(e)) => Err(LaunchError::helper(program, e.to_string())),
            Err(_) => Err(LaunchError::new(
                program,
                LaunchFailureKind::StartupTimeout,
                format!(
                    "helper not ready after {}s",
                    self.helper_startup_timeout.as_secs()
                ),
            )),
        }
    }
}

#[async_trait]
impl ProcessLauncher for CommandLauncher {
    async fn launch(&self, request: &LaunchRequest) -> Result<LaunchedProcess, LaunchError> {
        let cmd = self.build_command(request)?;
        match request.role {
            LaunchRole::Worker => self.launch_worker(request, cmd).await,
            LaunchRole::FrameworkSpawner => self.launch_helper(request, cmd).await,
        }
    }
}

fn child_pid(child: &Child, program: &str) -> Result<u32, LaunchError> {
    child.id().ok_or_else(|| {
        LaunchError::new(
            program,
            LaunchFailureKind::EarlyExit,
            "process exited before its pid was read",
        )
    })
}

/// Create the socket directory if needed and make it world-writable (sticky).
pub(crate) async fn ensure_socket_dir(dir: &Path) -> std::io::Result<()> {
    if tokio::fs::metadata(dir).await.is_ok_and(|m| m.is_dir()) {
        return Ok(());
    }
    tokio::fs::create_dir_all(dir).await?;
    if let Err(e) =
        tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(SOCKET_DIR_MODE)).await
    {
        debug!("Could not set mode on {}: {}", dir.display(), e);
    }
    Ok(())
}
