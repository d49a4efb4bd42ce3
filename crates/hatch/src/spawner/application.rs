//! Application spawner helper reached over a Unix socket.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use hatch_protocol::{HelperRequest, HelperResponse, ProtocolError, read_message, write_message};
use log::{debug, info, warn};
use tokio::io::BufReader;
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{ApplicationSpawner, SpawnedWorker, Spawner};
use crate::error::{LaunchError, SpawnResult};

const PROGRAM: &str = "application spawner";

/// An application spawner started by a framework spawner.
///
/// The helper is a grandchild of this process, so liveness is checked by pid
/// and the helper exits when asked through its control socket.
#[derive(Debug)]
pub struct SocketApplicationSpawner {
    pid: u32,
    control_socket: PathBuf,
    socket_dir: PathBuf,
    request_timeout: Duration,
    /// Serializes requests to the helper.
    lock: Mutex<()>,
    stopped: AtomicBool,
}

impl SocketApplicationSpawner {
    pub fn new(
        pid: u32,
        control_socket: PathBuf,
        socket_dir: PathBuf,
        request_timeout: Duration,
    ) -> Self {
        Self {
            pid,
            control_socket,
            socket_dir,
            request_timeout,
            lock: Mutex::new(()),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn control_socket(&self) -> &Path {
        &self.control_socket
    }

    /// Ask the helper whether it still answers.
    pub async fn ping(&self) -> bool {
        matches!(
            self.request(&HelperRequest::Ping).await,
            Ok(HelperResponse::Pong)
        )
    }

    async fn request(&self, request: &HelperRequest) -> Result<HelperResponse, LaunchError> {
        let _guard = self.lock.lock().await;
        let exchange = async {
            let stream = UnixStream::connect(&self.control_socket).await?;
            let (read, mut write) = stream.into_split();
            write_message(&mut write, request).await?;
            let mut reader = BufReader::new(read);
            read_message::<_, HelperResponse>(&mut reader).await
        };

        match tokio::time::timeout(self.request_timeout, exchange).await {
            Ok(Ok(Some(response))) => Ok(response),
            Ok(Ok(None)) => Err(LaunchError::helper(PROGRAM, "connection closed without a reply")),
            Ok(Err(ProtocolError::Io(e))) => Err(LaunchError::helper(
                PROGRAM,
                format!("{}: {}", self.control_socket.display(), e),
            )),
            Ok(Err(e)) => Err(LaunchError::helper(PROGRAM, e.to_string())),
            Err(_) => Err(LaunchError::helper(
                PROGRAM,
                format!("no response within {}s", self.request_timeout.as_secs()),
            )),
        }
    }

    fn signal(&self, signal: libc::c_int) -> std::io::Result<()> {
        let Ok(pid) = libc::pid_t::try_from(self.pid) else {
            return Err(std::io::Error::from(std::io::ErrorKind::InvalidInput));
        };
        // SAFETY: kill(2) has no memory-safety requirements.
        if unsafe { libc::kill(pid, signal) } == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }
}

#[async_trait]
impl Spawner for SocketApplicationSpawner {
    fn pid(&self) -> u32 {
        self.pid
    }

    async fn is_alive(&self) -> bool {
        if self.stopped.load(Ordering::SeqCst) {
            return false;
        }
        let exists = match self.signal(0) {
            Ok(()) => true,
            // Lowered helpers belong to another user.
            Err(e) => e.raw_os_error() == Some(libc::EPERM),
        };
        exists && tokio::fs::metadata(&self.control_socket).await.is_ok()
    }

    async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            "Shutting down application spawner pid={} ({})",
            self.pid,
            self.control_socket.display()
        );

        match self.request(&HelperRequest::Shutdown).await {
            Ok(HelperResponse::ShuttingDown) => {}
            Ok(other) => debug!("Unexpected reply to shutdown from {}: {:?}", self.pid, other),
            Err(e) => {
                debug!("Application spawner {} ignored shutdown: {}", self.pid, e);
                if let Err(e) = self.signal(libc::SIGTERM)
                    && e.raw_os_error() != Some(libc::ESRCH)
                {
                    warn!("Failed to stop application spawner {}: {}", self.pid, e);
                }
            }
        }

        if let Err(e) = tokio::fs::remove_file(&self.control_socket).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            debug!("Could not remove {}: {}", self.control_socket.display(), e);
        }
    }
}

#[async_trait]
impl ApplicationSpawner for SocketApplicationSpawner {
    async fn spawn_worker(&self) -> SpawnResult<SpawnedWorker> {
        let listen_socket = self
            .socket_dir
            .join(format!("worker-{}.sock", Uuid::new_v4().simple()));
        let request = HelperRequest::SpawnWorker {
            listen_socket: listen_socket.to_string_lossy().into_owned(),
        };

        match self.request(&request).await? {
            HelperResponse::WorkerSpawned {
                pid,
                listen_socket,
                using_abstract_namespace,
            } => {
                debug!("Application spawner {} started worker {}", self.pid, pid);
                Ok(SpawnedWorker {
                    pid,
                    listen_socket: PathBuf::from(listen_socket),
                    using_abstract_namespace,
                })
            }
            HelperResponse::Error { message } => Err(LaunchError::helper(PROGRAM, message).into()),
            other => Err(LaunchError::helper(
                PROGRAM,
                format!("unexpected response to spawn_worker: {other:?}"),
            )
            .into()),
        }
    }
}
