//! Configuration for the spawn manager.
//!
//! Loaded from `$XDG_CONFIG_HOME/hatch/config.toml` (or an explicit path),
//! then overridden by `HATCH__<SECTION>__<KEY>` environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::options::AppType;

pub const APP_NAME: &str = "hatch";
const ENV_PREFIX: &str = "HATCH";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HatchConfig {
    pub pool: PoolConfig,
    pub launcher: LauncherConfig,
    pub recipes: RecipesConfig,
}

/// Spawner pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Idle timeout for framework spawners when the spawn options say 0.
    pub framework_spawner_timeout_secs: u64,
    /// Idle timeout for application spawners when the spawn options say 0.
    pub app_spawner_timeout_secs: u64,
    /// How often the reapers look for idle spawners.
    pub reap_interval_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            framework_spawner_timeout_secs: 30 * 60,
            app_spawner_timeout_secs: 10 * 60,
            reap_interval_secs: 10,
        }
    }
}

impl PoolConfig {
    pub fn framework_spawner_timeout(&self) -> Duration {
        Duration::from_secs(self.framework_spawner_timeout_secs)
    }

    pub fn app_spawner_timeout(&self) -> Duration {
        Duration::from_secs(self.app_spawner_timeout_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.framework_spawner_timeout_secs == 0 {
            return Err(ConfigError::InvalidPool(
                "framework_spawner_timeout_secs must be positive".to_string(),
            ));
        }
        if self.app_spawner_timeout_secs == 0 {
            return Err(ConfigError::InvalidPool(
                "app_spawner_timeout_secs must be positive".to_string(),
            ));
        }
        if self.reap_interval_secs == 0 {
            return Err(ConfigError::InvalidPool(
                "reap_interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Process launcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    /// Helper program used for framework and application spawners.
    /// Supports ~ and environment variables.
    pub helper_binary: String,
    /// Directory for worker and application spawner sockets.
    /// Supports ~ and environment variables.
    pub socket_dir: String,
    /// How long a helper may take to report ready.
    pub helper_startup_timeout_secs: u64,
    /// How long a single helper request may take.
    pub helper_request_timeout_secs: u64,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            helper_binary: "hatch-helper".to_string(),
            socket_dir: std::env::temp_dir()
                .join(APP_NAME)
                .to_string_lossy()
                .into_owned(),
            helper_startup_timeout_secs: 30,
            helper_request_timeout_secs: 60,
        }
    }
}

impl LauncherConfig {
    pub fn helper_binary_path(&self) -> String {
        expand(&self.helper_binary)
    }

    pub fn socket_dir_path(&self) -> PathBuf {
        PathBuf::from(expand(&self.socket_dir))
    }

    pub fn helper_startup_timeout(&self) -> Duration {
        Duration::from_secs(self.helper_startup_timeout_secs)
    }

    pub fn helper_request_timeout(&self) -> Duration {
        Duration::from_secs(self.helper_request_timeout_secs)
    }
}

/// Launch recipes, one per application type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecipesConfig {
    pub rails: RecipeConfig,
    pub rack: RecipeConfig,
    pub wsgi: RecipeConfig,
}

impl Default for RecipesConfig {
    fn default() -> Self {
        Self {
            rails: RecipeConfig::defaults_for(AppType::Rails),
            rack: RecipeConfig::defaults_for(AppType::Rack),
            wsgi: RecipeConfig::defaults_for(AppType::Wsgi),
        }
    }
}

impl RecipesConfig {
    pub fn get(&self, app_type: AppType) -> &RecipeConfig {
        match app_type {
            AppType::Rails => &self.rails,
            AppType::Rack => &self.rack,
            AppType::Wsgi => &self.wsgi,
        }
    }
}

/// How to start processes for one application type.
///
/// Workers are started in the app root and find the socket to listen on in
/// `HATCH_LISTEN_SOCKET`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipeConfig {
    /// Worker command line.
    pub worker_command: Vec<String>,
    /// Framework spawner command line. Defaults to
    /// `<helper_binary> framework --app-type <type>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framework_command: Option<Vec<String>>,
    /// Variables set to the deployment environment name.
    #[serde(default)]
    pub environment_variables: Vec<String>,
    /// File whose owner the application runs as, relative to the app root.
    pub ownership_file: String,
}

impl RecipeConfig {
    pub fn defaults_for(app_type: AppType) -> Self {
        let (worker, vars, ownership_file): (&[&str], &[&str], &str) = match app_type {
            AppType::Rails => (
                &["ruby", "script/server"],
                &["RAILS_ENV", "RACK_ENV"],
                "config/environment.rb",
            ),
            AppType::Rack => (&["rackup", "config.ru"], &["RACK_ENV"], "config.ru"),
            AppType::Wsgi => (&["python3", "passenger_wsgi.py"], &[], "passenger_wsgi.py"),
        };
        Self {
            worker_command: worker.iter().map(|s| s.to_string()).collect(),
            framework_command: None,
            environment_variables: vars.iter().map(|s| s.to_string()).collect(),
            ownership_file: ownership_file.to_string(),
        }
    }
}

impl HatchConfig {
    /// Load configuration. `path` overrides the default location; an
    /// explicit path must exist.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let (file, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (default_config_path(), false),
        };

        let built = Config::builder()
            .add_source(
                File::from(file.as_path())
                    .format(FileFormat::Toml)
                    .required(required),
            )
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let config: HatchConfig = built.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pool.validate()?;
        for app_type in AppType::ALL {
            let recipe = self.recipes.get(app_type);
            if recipe.worker_command.is_empty() {
                return Err(ConfigError::EmptyCommand {
                    app_type,
                    command: "worker",
                });
            }
            if recipe.framework_command.as_ref().is_some_and(|c| c.is_empty()) {
                return Err(ConfigError::EmptyCommand {
                    app_type,
                    command: "framework",
                });
            }
        }
        Ok(())
    }

    /// Render as TOML with a short header.
    pub fn to_toml(&self) -> anyhow::Result<String> {
        let mut body = format!("# Configuration for {APP_NAME}\n\n");
        body.push_str(&toml::to_string_pretty(self)?);
        Ok(body)
    }
}

/// `$XDG_CONFIG_HOME/hatch/config.toml`, falling back to `~/.config`.
pub fn default_config_path() -> PathBuf {
    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        dir.push("config.toml");
        return dir;
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join(APP_NAME)
        .join("config.toml")
}

fn expand(value: &str) -> String {
    shellexpand::full(value)
        .map(|v| v.into_owned())
        .unwrap_or_else(|_| shellexpand::tilde(value).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = HatchConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pool.framework_spawner_timeout(), Duration::from_secs(1800));
        assert_eq!(config.pool.app_spawner_timeout(), Duration::from_secs(600));
    }

    #[test]
    fn test_zero_pool_timeout_rejected() {
        let mut config = HatchConfig::default();
        config.pool.app_spawner_timeout_secs = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidPool(_))));
    }

    #[test]
    fn test_empty_worker_command_rejected() {
        let mut config = HatchConfig::default();
        config.recipes.rack.worker_command.clear();
        assert_eq!(
            config.validate(),
            Err(ConfigError::EmptyCommand {
                app_type: AppType::Rack,
                command: "worker",
            })
        );
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[pool]
app_spawner_timeout_secs = 42

[recipes.wsgi]
worker_command = ["gunicorn", "app:application"]
ownership_file = "app.py"
"#,
        )
        .unwrap();

        let config = HatchConfig::load(Some(&path)).unwrap();
        assert_eq!(config.pool.app_spawner_timeout_secs, 42);
        assert_eq!(config.pool.framework_spawner_timeout_secs, 1800);
        assert_eq!(config.recipes.wsgi.worker_command, vec!["gunicorn", "app:application"]);
        assert_eq!(config.recipes.wsgi.ownership_file, "app.py");
        assert_eq!(config.recipes.rails.ownership_file, "config/environment.rb");
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(HatchConfig::load(Some(&dir.path().join("missing.toml"))).is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = HatchConfig::default();
        let rendered = config.to_toml().unwrap();
        let parsed: HatchConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.recipes.rack.worker_command, config.recipes.rack.worker_command);
        assert_eq!(parsed.launcher.helper_binary, "hatch-helper");
    }

    #[test]
    fn test_expand_tilde() {
        let launcher = LauncherConfig {
            socket_dir: "~/hatch-sockets".to_string(),
            ..Default::default()
        };
        assert!(!launcher.socket_dir_path().starts_with("~"));
    }
}
