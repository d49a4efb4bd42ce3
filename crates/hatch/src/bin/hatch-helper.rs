//! hatch-helper - spawner helper process.
//!
//! Runs in one of two modes:
//!
//! - `framework`: talks to hatch over stdin/stdout and starts application
//!   helpers on request, each under the identity hatch asks for.
//! - `app`: listens on a Unix socket and starts workers for one application.
//!
//! Protocol messages use stdout (framework mode) or the socket (app mode);
//! logs go to stderr.
//!
//! Each helper holds the write end of its children's stdin. A helper whose
//! stdin reaches EOF exits, so application helpers follow their framework
//! helper, which follows hatch.

use std::collections::BTreeMap;
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use hatch_protocol::{
    HelperRequest, HelperResponse, LISTEN_SOCKET_ENV, ProtocolError, read_message, write_message,
};
use log::{debug, error, info, warn};
use tokio::io::{AsyncReadExt, AsyncWrite, BufReader};
use tokio::net::unix::pipe;
use tokio::net::{UnixListener, UnixStream};
use tokio::process::{Child, Command};
use tokio::sync::broadcast;

/// How long an application helper may take to report ready.
const APP_HELPER_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "hatch-helper", about = "Spawner helper process for hatch")]
struct Args {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Framework spawner: start application helpers over stdio.
    Framework {
        /// Application type this helper serves.
        #[arg(long)]
        app_type: String,
    },

    /// Application spawner: start workers over a Unix socket.
    App {
        /// Control socket to listen on.
        #[arg(long)]
        socket: PathBuf,

        /// Application root directory.
        #[arg(long)]
        app_root: PathBuf,

        /// Deployment environment.
        #[arg(long)]
        environment: String,

        /// Worker command line.
        #[arg(last = true, required = true)]
        worker_command: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    match args.mode {
        Mode::Framework { app_type } => run_framework(&app_type).await,
        Mode::App {
            socket,
            app_root,
            environment,
            worker_command,
        } => {
            AppHelper::new(socket, app_root, environment, worker_command)
                .run()
                .await
        }
    }
}

// ============================================================================
// Framework mode
// ============================================================================

async fn run_framework(app_type: &str) -> Result<()> {
    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();

    info!(
        "Framework helper for {} starting (pid={})",
        app_type,
        std::process::id()
    );
    write_message(
        &mut stdout,
        &HelperResponse::Ready {
            pid: std::process::id(),
            control_socket: None,
        },
    )
    .await
    .context("writing ready message")?;

    loop {
        let request = match read_message::<_, HelperRequest>(&mut stdin).await {
            Ok(Some(request)) => request,
            Ok(None) => {
                // Exiting closes every application helper's stdin.
                info!("hatch closed the connection, exiting with application helpers");
                return Ok(());
            }
            Err(ProtocolError::Json(e)) => {
                reply(&mut stdout, &HelperResponse::error(format!("invalid request: {e}"))).await?;
                continue;
            }
            Err(e) => return Err(e).context("reading request"),
        };
        debug!("Received request: {:?}", request);

        let response = match request {
            HelperRequest::Ping => HelperResponse::Pong,
            HelperRequest::Shutdown => {
                reply(&mut stdout, &HelperResponse::ShuttingDown).await?;
                info!("Shutdown requested");
                return Ok(());
            }
            HelperRequest::StartAppSpawner {
                app_root,
                environment,
                env,
                worker_command,
                control_socket,
                uid,
                gid,
            } => {
                let launch = AppHelperLaunch {
                    app_root: PathBuf::from(app_root),
                    environment,
                    env,
                    worker_command,
                    control_socket: PathBuf::from(control_socket),
                    uid,
                    gid,
                };
                match start_app_helper(&launch).await {
                    Ok(pid) => HelperResponse::AppSpawnerStarted {
                        pid,
                        control_socket: launch.control_socket.to_string_lossy().into_owned(),
                    },
                    Err(e) => {
                        error!("Failed to start application helper: {:#}", e);
                        HelperResponse::error(format!("{e:#}"))
                    }
                }
            }
            HelperRequest::SpawnWorker { .. } => {
                HelperResponse::error("framework helpers do not spawn workers directly")
            }
        };
        reply(&mut stdout, &response).await?;
    }
}

struct AppHelperLaunch {
    app_root: PathBuf,
    environment: String,
    env: BTreeMap<String, String>,
    worker_command: Vec<String>,
    control_socket: PathBuf,
    uid: Option<u32>,
    gid: Option<u32>,
}

/// Start an application helper and wait for it to listen.
async fn start_app_helper(launch: &AppHelperLaunch) -> Result<u32> {
    if launch.worker_command.is_empty() {
        bail!("empty worker command");
    }
    let exe = std::env::current_exe().context("locating hatch-helper executable")?;

    let mut cmd = Command::new(&exe);
    cmd.arg("app")
        .arg("--socket")
        .arg(&launch.control_socket)
        .arg("--app-root")
        .arg(&launch.app_root)
        .arg("--environment")
        .arg(&launch.environment)
        .arg("--")
        .args(&launch.worker_command)
        .current_dir(&launch.app_root)
        .envs(&launch.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());
    if let Some(gid) = launch.gid {
        cmd.gid(gid);
    }
    if let Some(uid) = launch.uid {
        cmd.uid(uid);
    }

    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawning application helper for {}", launch.app_root.display()))?;
    let pid = child.id().context("application helper exited immediately")?;

    let Some(stdout) = child.stdout.take() else {
        bail!("application helper stdout was not captured");
    };
    let mut stdout = BufReader::new(stdout);
    let ready = tokio::time::timeout(
        APP_HELPER_STARTUP_TIMEOUT,
        read_message::<_, HelperResponse>(&mut stdout),
    )
    .await;

    match ready {
        Ok(Ok(Some(HelperResponse::Ready { .. }))) => {
            info!(
                "Application helper pid={} ready for {}",
                pid,
                launch.app_root.display()
            );
            reap(child, pid);
            Ok(pid)
        }
        Ok(Ok(Some(HelperResponse::Error { message }))) => {
            let _ = child.kill().await;
            bail!("application helper failed: {message}")
        }
        Ok(Ok(other)) => {
            let _ = child.kill().await;
            bail!("application helper did not become ready ({other:?})")
        }
        Ok(Err(e)) => {
            let _ = child.kill().await;
            Err(e).context("reading application helper ready message")
        }
        Err(_) => {
            let _ = child.kill().await;
            bail!(
                "application helper not ready after {}s",
                APP_HELPER_STARTUP_TIMEOUT.as_secs()
            )
        }
    }
}

/// Wait for a child in the background so it never lingers as a zombie.
///
/// The child's stdin, if piped, stays open until it exits.
fn reap(mut child: Child, pid: u32) {
    let link = child.stdin.take();
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => debug!("Child {} exited with {}", pid, status),
            Err(e) => warn!("Error waiting for child {}: {}", pid, e),
        }
        drop(link);
    });
}

/// Resolves when the process that started us closes our stdin.
///
/// Never resolves if stdin is not a pipe.
async fn parent_closed() {
    let receiver = std::io::stdin()
        .as_fd()
        .try_clone_to_owned()
        .map(std::fs::File::from)
        .and_then(pipe::Receiver::from_file);
    let mut receiver = match receiver {
        Ok(receiver) => receiver,
        Err(e) => {
            debug!("Not watching for parent exit, stdin is not a pipe: {}", e);
            return std::future::pending().await;
        }
    };

    let mut buf = [0u8; 64];
    loop {
        match receiver.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

async fn reply<W: AsyncWrite + Unpin>(writer: &mut W, response: &HelperResponse) -> Result<()> {
    write_message(writer, response)
        .await
        .context("writing response")
}

// ============================================================================
// App mode
// ============================================================================

struct AppHelper {
    socket: PathBuf,
    app_root: PathBuf,
    environment: String,
    worker_command: Arc<Vec<String>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl AppHelper {
    fn new(
        socket: PathBuf,
        app_root: PathBuf,
        environment: String,
        worker_command: Vec<String>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            socket,
            app_root,
            environment,
            worker_command: Arc::new(worker_command),
            shutdown_tx,
        }
    }

    async fn run(self) -> Result<()> {
        let _ = tokio::fs::remove_file(&self.socket).await;
        let listener = UnixListener::bind(&self.socket)
            .with_context(|| format!("binding to {:?}", self.socket))?;
        info!(
            "Application helper for {} ({}) listening on {:?}",
            self.app_root.display(),
            self.environment,
            self.socket
        );

        let mut stdout = tokio::io::stdout();
        write_message(
            &mut stdout,
            &HelperResponse::Ready {
                pid: std::process::id(),
                control_socket: Some(self.socket.to_string_lossy().into_owned()),
            },
        )
        .await
        .context("writing ready message")?;
        drop(stdout);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let parent = parent_closed();
        tokio::pin!(parent);
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let connection = Connection {
                                app_root: self.app_root.clone(),
                                worker_command: Arc::clone(&self.worker_command),
                                shutdown_tx: self.shutdown_tx.clone(),
                            };
                            tokio::spawn(async move {
                                connection.handle(stream).await;
                            });
                        }
                        Err(e) => error!("Accept error: {}", e),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutting down...");
                    break;
                }
                _ = &mut parent => {
                    info!("Framework spawner went away, shutting down");
                    break;
                }
            }
        }

        let _ = tokio::fs::remove_file(&self.socket).await;
        Ok(())
    }
}

struct Connection {
    app_root: PathBuf,
    worker_command: Arc<Vec<String>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Connection {
    async fn handle(&self, stream: UnixStream) {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        loop {
            let request = match read_message::<_, HelperRequest>(&mut reader).await {
                Ok(Some(request)) => request,
                Ok(None) => {
                    debug!("Client disconnected");
                    break;
                }
                Err(ProtocolError::Json(e)) => {
                    let response = HelperResponse::error(format!("invalid request: {e}"));
                    if write_message(&mut writer, &response).await.is_err() {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    warn!("Connection error: {}", e);
                    break;
                }
            };
            debug!("Received request: {:?}", request);

            let shutdown = matches!(request, HelperRequest::Shutdown);
            let response = self.handle_request(request);
            if let Err(e) = write_message(&mut writer, &response).await {
                warn!("Failed to write response: {}", e);
                break;
            }
            if shutdown {
                let _ = self.shutdown_tx.send(());
                break;
            }
        }
    }

    fn handle_request(&self, request: HelperRequest) -> HelperResponse {
        match request {
            HelperRequest::Ping => HelperResponse::Pong,
            HelperRequest::Shutdown => {
                info!("Shutdown requested");
                HelperResponse::ShuttingDown
            }
            HelperRequest::SpawnWorker { listen_socket } => {
                match spawn_worker(&self.app_root, &self.worker_command, Path::new(&listen_socket)) {
                    Ok(pid) => HelperResponse::WorkerSpawned {
                        pid,
                        listen_socket,
                        using_abstract_namespace: false,
                    },
                    Err(e) => {
                        error!("Failed to spawn worker: {:#}", e);
                        HelperResponse::error(format!("{e:#}"))
                    }
                }
            }
            HelperRequest::StartAppSpawner { .. } => {
                HelperResponse::error("application helpers do not start other helpers")
            }
        }
    }
}

/// Start one worker. It inherits this helper's identity and environment.
fn spawn_worker(app_root: &Path, command: &[String], listen_socket: &Path) -> Result<u32> {
    let Some((program, args)) = command.split_first() else {
        bail!("empty worker command");
    };

    let child = Command::new(program)
        .args(args)
        .current_dir(app_root)
        .env(LISTEN_SOCKET_ENV, listen_socket)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit())
        .spawn()
        .with_context(|| format!("spawning worker {program}"))?;
    let pid = child.id().context("worker exited immediately")?;

    info!("Started worker {} (pid={})", program, pid);
    reap(child, pid);
    Ok(pid)
}
