//! The spawn orchestrator.
//!
//! [`SpawnManager::spawn`] resolves privileges, then either goes through the
//! two spawner pools (smart) or launches a fresh worker (conservative).

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::Serialize;
use tokio::process::Child;
use tokio::task::JoinHandle;

use crate::config::HatchConfig;
use crate::error::{ConfigError, PoolTier, SpawnResult};
use crate::launcher::{
    CommandLauncher, FrameworkKey, LaunchRecipe, LaunchRequest, LaunchRole, ProcessLauncher,
    RecipeBook,
};
use crate::options::{SpawnMethod, SpawnOptions};
use crate::pool::{PoolStats, SpawnerHandle, SpawnerPool};
use crate::privilege::{Identity, PrivilegeResolution, PrivilegeResolver};
use crate::spawner::{
    AppSpawnerRequest, ApplicationSpawner, FrameworkSpawner, FrameworkSpawnerRequest,
    HelperSpawnerFactory, SpawnedWorker, SpawnerFactory,
};

pub type FrameworkPool = SpawnerPool<FrameworkKey, dyn FrameworkSpawner>;
pub type ApplicationPool = SpawnerPool<AppSpawnerKey, dyn ApplicationSpawner>;

/// Cache key of an application spawner.
///
/// Everything that changes what a preloaded application looks like: the
/// framework it was forked from, where it lives, which environment it runs
/// in and whose identity it has.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AppSpawnerKey {
    pub framework: FrameworkKey,
    pub app_root: PathBuf,
    pub environment: String,
    pub identity: Option<Identity>,
}

impl fmt::Display for AppSpawnerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}, {}, ",
            self.app_root.display(),
            self.framework,
            self.environment
        )?;
        match &self.identity {
            Some(identity) => write!(f, "{identity}]"),
            None => write!(f, "unchanged]"),
        }
    }
}

/// A spawned worker. Ownership passes to the caller.
#[derive(Debug, Serialize)]
pub struct SpawnedProcess {
    pub pid: u32,
    pub app_root: PathBuf,
    pub method: SpawnMethod,
    pub privilege: PrivilegeResolution,
    /// Socket the worker listens on.
    pub listen_socket: PathBuf,
    pub using_abstract_namespace: bool,
    pub spawned_at: DateTime<Utc>,
    /// The worker process, for conservative spawns. Smart-spawned workers
    /// are children of their application spawner.
    ///
    /// The worker's stdout is piped and must be drained by whoever holds the
    /// child, or the worker blocks once the pipe fills. Its stderr goes to
    /// ours.
    #[serde(skip)]
    pub child: Option<Child>,
}

impl SpawnedProcess {
    /// Take ownership of the child process, if this process has one.
    pub fn take_child(&mut self) -> Option<Child> {
        self.child.take()
    }
}

/// Counters for both pools.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ManagerStats {
    pub framework_spawners: PoolStats,
    pub application_spawners: PoolStats,
}

/// Builder for [`SpawnManager`].
pub struct SpawnManagerBuilder {
    config: HatchConfig,
    recipes: Option<RecipeBook>,
    resolver: Option<PrivilegeResolver>,
    launcher: Option<Arc<dyn ProcessLauncher>>,
    factory: Option<Arc<dyn SpawnerFactory>>,
}

impl SpawnManagerBuilder {
    pub fn recipes(mut self, recipes: RecipeBook) -> Self {
        self.recipes = Some(recipes);
        self
    }

    pub fn resolver(mut self, resolver: PrivilegeResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn launcher(mut self, launcher: Arc<dyn ProcessLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn factory(mut self, factory: Arc<dyn SpawnerFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Build the manager and start both reapers.
    ///
    /// Fails with [`ConfigError::NoRuntime`] outside a Tokio runtime.
    pub fn build(self) -> Result<SpawnManager, ConfigError> {
        let config = self.config;
        config.validate()?;
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(ConfigError::NoRuntime);
        }

        let recipes = match self.recipes {
            Some(recipes) => recipes,
            None => RecipeBook::from_config(&config)?,
        };
        let launcher: Arc<dyn ProcessLauncher> = match self.launcher {
            Some(launcher) => launcher,
            None => Arc::new(CommandLauncher::from_config(&config.launcher)),
        };
        let factory: Arc<dyn SpawnerFactory> = match self.factory {
            Some(factory) => factory,
            None => Arc::new(HelperSpawnerFactory::from_config(
                launcher.clone(),
                &config.launcher,
            )),
        };

        let framework_pool = Arc::new(FrameworkPool::new(
            PoolTier::Framework,
            config.pool.framework_spawner_timeout(),
        ));
        let app_pool = Arc::new(ApplicationPool::new(
            PoolTier::Application,
            config.pool.app_spawner_timeout(),
        ));
        let interval = config.pool.reap_interval();
        let reapers = vec![
            framework_pool.spawn_reaper(interval),
            app_pool.spawn_reaper(interval),
        ];

        Ok(SpawnManager {
            recipes,
            resolver: self.resolver.unwrap_or_default(),
            launcher,
            factory,
            framework_pool,
            app_pool,
            reapers: Mutex::new(reapers),
        })
    }
}

/// Produces application workers.
///
/// Each manager owns its pools; several managers can coexist.
pub struct SpawnManager {
    recipes: RecipeBook,
    resolver: PrivilegeResolver,
    launcher: Arc<dyn ProcessLauncher>,
    factory: Arc<dyn SpawnerFactory>,
    framework_pool: Arc<FrameworkPool>,
    app_pool: Arc<ApplicationPool>,
    reapers: Mutex<Vec<JoinHandle<()>>>,
}

impl SpawnManager {
    pub fn builder(config: HatchConfig) -> SpawnManagerBuilder {
        SpawnManagerBuilder {
            config,
            recipes: None,
            resolver: None,
            launcher: None,
            factory: None,
        }
    }

    /// A manager with the system launcher, helpers and accounts.
    pub fn new(config: HatchConfig) -> Result<Self, ConfigError> {
        Self::builder(config).build()
    }

    pub fn resolver(&self) -> &PrivilegeResolver {
        &self.resolver
    }

    pub fn recipes(&self) -> &RecipeBook {
        &self.recipes
    }

    /// Spawn one worker for `options`.
    ///
    /// Privilege problems never fail a spawn; only configuration errors and
    /// process creation failures do.
    pub async fn spawn(&self, options: &SpawnOptions) -> SpawnResult<SpawnedProcess> {
        options.validate()?;
        let recipe = self.recipes.get(options.app_type())?;
        let privilege = self.resolver.resolve(options, &recipe.ownership_file);

        debug!(
            "Spawning {} ({}, {}) with {} method",
            options.app_root().display(),
            options.app_type(),
            options.environment(),
            options.spawn_method()
        );

        match options.spawn_method() {
            SpawnMethod::Smart => self.spawn_smart(options, recipe, privilege).await,
            SpawnMethod::Conservative => self.spawn_conservative(options, recipe, privilege).await,
        }
    }

    async fn spawn_smart(
        &self,
        options: &SpawnOptions,
        recipe: Arc<LaunchRecipe>,
        privilege: PrivilegeResolution,
    ) -> SpawnResult<SpawnedProcess> {
        let framework_key = FrameworkKey::detect(options.app_type(), options.app_root()).await;

        let framework = self
            .framework_pool
            .get_or_create(
                framework_key.clone(),
                options.framework_spawner_timeout(),
                || {
                    let factory = self.factory.clone();
                    let request = FrameworkSpawnerRequest {
                        key: framework_key.clone(),
                        recipe: recipe.clone(),
                        app_root: options.app_root().to_path_buf(),
                        environment: options.environment().to_string(),
                    };
                    async move { factory.start_framework_spawner(request).await }
                },
            )
            .await?;

        let worker = self
            .spawn_through(&framework, framework_key, options, recipe, &privilege)
            .await;
        self.framework_pool.release(&framework).await;
        let worker = worker?;

        info!(
            "Spawned worker pid={} for {} (smart)",
            worker.pid,
            options.app_root().display()
        );
        Ok(SpawnedProcess {
            pid: worker.pid,
            app_root: options.app_root().to_path_buf(),
            method: SpawnMethod::Smart,
            privilege,
            listen_socket: worker.listen_socket,
            using_abstract_namespace: worker.using_abstract_namespace,
            spawned_at: Utc::now(),
            child: None,
        })
    }

    /// Get the application spawner under `framework` and start a worker.
    async fn spawn_through(
        &self,
        framework: &Arc<SpawnerHandle<dyn FrameworkSpawner>>,
        framework_key: FrameworkKey,
        options: &SpawnOptions,
        recipe: Arc<LaunchRecipe>,
        privilege: &PrivilegeResolution,
    ) -> SpawnResult<SpawnedWorker> {
        let key = AppSpawnerKey {
            framework: framework_key,
            app_root: options.app_root().to_path_buf(),
            environment: options.environment().to_string(),
            identity: privilege.identity().cloned(),
        };

        let app = self
            .app_pool
            .get_or_create(key, options.app_spawner_timeout(), || {
                let framework = framework.spawner().clone();
                let request = AppSpawnerRequest {
                    app_root: options.app_root().to_path_buf(),
                    environment: options.environment().to_string(),
                    privilege: privilege.clone(),
                    recipe,
                };
                async move { framework.start_application_spawner(request).await }
            })
            .await?;

        let worker = app.spawner().spawn_worker().await;
        self.app_pool.release(&app).await;
        worker
    }

    async fn spawn_conservative(
        &self,
        options: &SpawnOptions,
        recipe: Arc<LaunchRecipe>,
        privilege: PrivilegeResolution,
    ) -> SpawnResult<SpawnedProcess> {
        let request = LaunchRequest {
            privilege: privilege.clone(),
            app_root: options.app_root().to_path_buf(),
            environment: options.environment().to_string(),
            recipe,
            role: LaunchRole::Worker,
        };
        let launched = self.launcher.launch(&request).await?;

        info!(
            "Spawned worker pid={} for {} (conservative)",
            launched.pid,
            options.app_root().display()
        );
        Ok(SpawnedProcess {
            pid: launched.pid,
            app_root: request.app_root,
            method: SpawnMethod::Conservative,
            privilege,
            listen_socket: launched.listen_socket.unwrap_or_default(),
            using_abstract_namespace: false,
            spawned_at: Utc::now(),
            child: Some(launched.child),
        })
    }

    /// Retire every application spawner for `app_root`, so the next smart
    /// spawn loads the application afresh. Returns how many were retired.
    pub async fn reload(&self, app_root: &Path) -> usize {
        let retired = self
            .app_pool
            .remove_where(|key| key.app_root == app_root)
            .await;
        info!(
            "Reloaded {}: retired {} application spawner(s)",
            app_root.display(),
            retired
        );
        retired
    }

    pub async fn stats(&self) -> ManagerStats {
        ManagerStats {
            framework_spawners: self.framework_pool.stats().await,
            application_spawners: self.app_pool.stats().await,
        }
    }

    /// Stop the reapers and every pooled spawner, application spawners
    /// first.
    pub async fn shutdown(&self) {
        info!("Shutting down spawn manager");
        self.app_pool.shutdown().await;
        self.framework_pool.shutdown().await;
    }
}

impl Drop for SpawnManager {
    fn drop(&mut self) {
        let reapers = self.reapers.get_mut().unwrap_or_else(|e| e.into_inner());
        for reaper in reapers.drain(..) {
            reaper.abort();
        }
    }
}

impl fmt::Debug for SpawnManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpawnManager")
            .field("recipes", &self.recipes)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::AppType;

    #[test]
    fn test_app_key_display() {
        let key = AppSpawnerKey {
            framework: FrameworkKey::new(AppType::Rails, "gem:2.0.2"),
            app_root: PathBuf::from("/srv/app"),
            environment: "production".to_string(),
            identity: None,
        };
        assert_eq!(key.to_string(), "/srv/app [rails:gem:2.0.2, production, unchanged]");
    }

    #[test]
    fn test_app_key_separates_identities() {
        let base = AppSpawnerKey {
            framework: FrameworkKey::new(AppType::Rack, "default"),
            app_root: PathBuf::from("/srv/app"),
            environment: "production".to_string(),
            identity: None,
        };
        let lowered = AppSpawnerKey {
            identity: Some(Identity {
                user: "alice".to_string(),
                uid: 1001,
                group: "alice".to_string(),
                gid: 1001,
            }),
            ..base.clone()
        };
        assert_ne!(base, lowered);
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_config() {
        let mut config = HatchConfig::default();
        config.pool.reap_interval_secs = 0;
        assert!(matches!(
            SpawnManager::new(config),
            Err(ConfigError::InvalidPool(_))
        ));
    }

    #[test]
    fn test_build_outside_runtime_is_an_error() {
        assert!(matches!(
            SpawnManager::new(HatchConfig::default()),
            Err(ConfigError::NoRuntime)
        ));
    }

    #[tokio::test]
    async fn test_missing_recipe_fails_before_process_work() {
        let manager = SpawnManager::builder(HatchConfig::default())
            .recipes(RecipeBook::new())
            .build()
            .unwrap();
        let options = SpawnOptions::builder("/srv/app")
            .app_type(AppType::Wsgi)
            .lower_privilege(false)
            .build()
            .unwrap();

        let err = manager.spawn(&options).await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::SpawnError::Config(ConfigError::MissingRecipe(AppType::Wsgi))
        ));
        assert_eq!(manager.stats().await, ManagerStats::default());
        manager.shutdown().await;
    }
}
