//! End-to-end smart spawning through the real `hatch-helper` binary.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use hatch::config::LauncherConfig;
use hatch::launcher::{CommandLauncher, LaunchRecipe, RecipeBook};
use hatch::{AppType, HatchConfig, SpawnManager, SpawnMethod, SpawnOptions};

const HELPER: &str = env!("CARGO_BIN_EXE_hatch-helper");

struct Setup {
    manager: SpawnManager,
    socket_dir: TempDir,
    app_root: TempDir,
}

fn setup() -> Setup {
    let socket_dir = TempDir::new().unwrap();
    let app_root = TempDir::new().unwrap();

    let mut config = HatchConfig::default();
    config.launcher = LauncherConfig {
        helper_binary: HELPER.to_string(),
        socket_dir: socket_dir.path().to_string_lossy().into_owned(),
        helper_startup_timeout_secs: 10,
        helper_request_timeout_secs: 10,
    };

    let mut recipes = RecipeBook::new();
    recipes
        .insert(LaunchRecipe {
            app_type: AppType::Rack,
            worker_command: vec!["sleep".to_string(), "30".to_string()],
            framework_command: vec![
                HELPER.to_string(),
                "framework".to_string(),
                "--app-type".to_string(),
                "rack".to_string(),
            ],
            environment_variables: vec!["RACK_ENV".to_string()],
            ownership_file: PathBuf::from("config.ru"),
        })
        .unwrap();

    let launcher = Arc::new(CommandLauncher::from_config(&config.launcher));
    let manager = SpawnManager::builder(config)
        .recipes(recipes)
        .launcher(launcher)
        .build()
        .unwrap();

    Setup {
        manager,
        socket_dir,
        app_root,
    }
}

fn options(setup: &Setup) -> SpawnOptions {
    SpawnOptions::builder(setup.app_root.path())
        .app_type(AppType::Rack)
        .lower_privilege(false)
        .build()
        .unwrap()
}

fn pid_alive(pid: u32) -> bool {
    // SAFETY: signal 0 only checks for existence.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

fn app_sockets(dir: &TempDir) -> usize {
    std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name().to_string_lossy().starts_with("app-"))
        .count()
}

fn kill_worker(pid: u32) {
    // SAFETY: pid belongs to a sleep process started by this test.
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
}

#[tokio::test]
async fn test_smart_spawn_through_helpers() {
    let setup = setup();
    let opts = options(&setup);

    let first = setup.manager.spawn(&opts).await.unwrap();
    let second = setup.manager.spawn(&opts).await.unwrap();

    assert_eq!(first.method, SpawnMethod::Smart);
    assert_ne!(first.pid, second.pid);
    assert!(first.listen_socket.starts_with(setup.socket_dir.path()));
    assert!(pid_alive(first.pid));
    assert!(pid_alive(second.pid));

    let stats = setup.manager.stats().await;
    assert_eq!(stats.framework_spawners.ready, 1);
    assert_eq!(stats.application_spawners.ready, 1);

    kill_worker(first.pid);
    kill_worker(second.pid);
    setup.manager.shutdown().await;
}

#[tokio::test]
async fn test_workers_outlive_spawner_shutdown() {
    let setup = setup();
    let spawned = setup.manager.spawn(&options(&setup)).await.unwrap();

    setup.manager.shutdown().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(pid_alive(spawned.pid));
    assert_eq!(app_sockets(&setup.socket_dir), 0);

    kill_worker(spawned.pid);
}

#[tokio::test]
async fn test_reload_starts_fresh_app_spawner() {
    let setup = setup();
    let opts = options(&setup);

    let before = setup.manager.spawn(&opts).await.unwrap();
    assert_eq!(setup.manager.reload(setup.app_root.path()).await, 1);
    assert_eq!(setup.manager.stats().await.application_spawners.ready, 0);

    let after = setup.manager.spawn(&opts).await.unwrap();
    let stats = setup.manager.stats().await;
    assert_eq!(stats.application_spawners.ready, 1);
    assert_eq!(stats.framework_spawners.ready, 1);

    kill_worker(before.pid);
    kill_worker(after.pid);
    setup.manager.shutdown().await;
}

#[tokio::test]
async fn test_app_helper_exits_when_manager_dropped() {
    let Setup {
        manager,
        socket_dir,
        app_root,
    } = setup();
    let opts = SpawnOptions::builder(app_root.path())
        .app_type(AppType::Rack)
        .lower_privilege(false)
        .build()
        .unwrap();

    let spawned = manager.spawn(&opts).await.unwrap();
    assert_eq!(app_sockets(&socket_dir), 1);

    // No shutdown: the framework helper is killed and its children follow.
    drop(manager);
    for _ in 0..100 {
        if app_sockets(&socket_dir) == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert_eq!(app_sockets(&socket_dir), 0);
    assert!(pid_alive(spawned.pid));
    kill_worker(spawned.pid);
}
