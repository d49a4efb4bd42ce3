//! Spawn options.
//!
//! A [`SpawnOptions`] value describes which application to spawn and how.
//! It is built once per spawn request and read-only afterwards.
//!
//! ## Defaults
//!
//! | field | default |
//! |---|---|
//! | `lower_privilege` | `true` |
//! | `lowest_user` | `"nobody"` |
//! | `environment` | `"production"` |
//! | `spawn_method` | `smart` |
//! | `app_type` | `rails` |
//! | `framework_spawner_timeout` | `0` (pool default) |
//! | `app_spawner_timeout` | `0` (pool default) |
//!
//! ## Privilege lowering
//!
//! If `lower_privilege` is true, the spawned application runs as the user
//! owning the application's ownership-bearing file (e.g.
//! `config/environment.rb` for Rails) and that user's default group. If that
//! user doesn't exist or is root, `lowest_user` is tried instead. If neither
//! works, or switching isn't permitted, the application is spawned anyway
//! without reporting an error. See [`crate::privilege`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_LOWEST_USER: &str = "nobody";
pub const DEFAULT_ENVIRONMENT: &str = "production";

/// How workers are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpawnMethod {
    /// Reuse pooled framework and application spawners.
    #[default]
    Smart,
    /// Start a fully independent worker for every request.
    Conservative,
}

impl fmt::Display for SpawnMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Smart => write!(f, "smart"),
            Self::Conservative => write!(f, "conservative"),
        }
    }
}

impl FromStr for SpawnMethod {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "smart" => Ok(Self::Smart),
            "conservative" => Ok(Self::Conservative),
            other => Err(ConfigError::UnknownSpawnMethod(other.to_string())),
        }
    }
}

/// Application stack. Selects the launch recipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppType {
    #[default]
    Rails,
    Rack,
    Wsgi,
}

impl AppType {
    pub const ALL: [AppType; 3] = [AppType::Rails, AppType::Rack, AppType::Wsgi];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rails => "rails",
            Self::Rack => "rack",
            Self::Wsgi => "wsgi",
        }
    }
}

impl fmt::Display for AppType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rails" => Ok(Self::Rails),
            "rack" => Ok(Self::Rack),
            "wsgi" => Ok(Self::Wsgi),
            other => Err(ConfigError::UnknownAppType(other.to_string())),
        }
    }
}

/// Options for one spawn request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawSpawnOptions", into = "RawSpawnOptions")]
pub struct SpawnOptions {
    app_root: PathBuf,
    lower_privilege: bool,
    lowest_user: String,
    environment: String,
    spawn_method: SpawnMethod,
    app_type: AppType,
    framework_spawner_timeout: u32,
    app_spawner_timeout: u32,
}

impl SpawnOptions {
    /// Start building options for the given application root.
    pub fn builder(app_root: impl Into<PathBuf>) -> SpawnOptionsBuilder {
        SpawnOptionsBuilder::new(app_root)
    }

    /// Options with every default filled in.
    pub fn new(app_root: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        Self::builder(app_root).build()
    }

    /// Root directory of the application. Need not be absolute.
    pub fn app_root(&self) -> &Path {
        &self.app_root
    }

    /// Whether to lower the application's privileges.
    pub fn lower_privilege(&self) -> bool {
        self.lower_privilege
    }

    /// The user to fall back to if the application owner can't be used.
    pub fn lowest_user(&self) -> &str {
        &self.lowest_user
    }

    /// Deployment environment (RAILS_ENV/RACK_ENV).
    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn spawn_method(&self) -> SpawnMethod {
        self.spawn_method
    }

    pub fn app_type(&self) -> AppType {
        self.app_type
    }

    /// Idle timeout of the framework spawner in seconds. 0 = pool default.
    pub fn framework_spawner_timeout(&self) -> u32 {
        self.framework_spawner_timeout
    }

    /// Idle timeout of the application spawner in seconds. 0 = pool default.
    pub fn app_spawner_timeout(&self) -> u32 {
        self.app_spawner_timeout
    }

    /// Check the invariants a constructed value must satisfy.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.app_root.as_os_str().is_empty() {
            return Err(ConfigError::EmptyAppRoot);
        }
        if self.environment.is_empty() {
            return Err(ConfigError::EmptyEnvironment);
        }
        Ok(())
    }
}

/// Builder for [`SpawnOptions`].
#[derive(Debug, Clone)]
pub struct SpawnOptionsBuilder {
    options: SpawnOptions,
}

impl SpawnOptionsBuilder {
    fn new(app_root: impl Into<PathBuf>) -> Self {
        Self {
            options: SpawnOptions {
                app_root: app_root.into(),
                lower_privilege: true,
                lowest_user: DEFAULT_LOWEST_USER.to_string(),
                environment: DEFAULT_ENVIRONMENT.to_string(),
                spawn_method: SpawnMethod::Smart,
                app_type: AppType::Rails,
                framework_spawner_timeout: 0,
                app_spawner_timeout: 0,
            },
        }
    }

    pub fn lower_privilege(mut self, lower: bool) -> Self {
        self.options.lower_privilege = lower;
        self
    }

    pub fn lowest_user(mut self, user: impl Into<String>) -> Self {
        self.options.lowest_user = user.into();
        self
    }

    pub fn environment(mut self, environment: impl Into<String>) -> Self {
        self.options.environment = environment.into();
        self
    }

    pub fn spawn_method(mut self, method: SpawnMethod) -> Self {
        self.options.spawn_method = method;
        self
    }

    pub fn app_type(mut self, app_type: AppType) -> Self {
        self.options.app_type = app_type;
        self
    }

    pub fn framework_spawner_timeout(mut self, secs: u32) -> Self {
        self.options.framework_spawner_timeout = secs;
        self
    }

    pub fn app_spawner_timeout(mut self, secs: u32) -> Self {
        self.options.app_spawner_timeout = secs;
        self
    }

    pub fn build(self) -> Result<SpawnOptions, ConfigError> {
        self.options.validate()?;
        Ok(self.options)
    }
}

/// Serialized form of [`SpawnOptions`]; enum fields stay strings so that
/// unknown values surface as [`ConfigError`]s.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawSpawnOptions {
    app_root: PathBuf,
    #[serde(default = "default_true")]
    lower_privilege: bool,
    #[serde(default = "default_lowest_user")]
    lowest_user: String,
    #[serde(default = "default_environment")]
    environment: String,
    #[serde(default = "default_spawn_method")]
    spawn_method: String,
    #[serde(default = "default_app_type")]
    app_type: String,
    #[serde(default)]
    framework_spawner_timeout: u32,
    #[serde(default)]
    app_spawner_timeout: u32,
}

fn default_true() -> bool {
    true
}

fn default_lowest_user() -> String {
    DEFAULT_LOWEST_USER.to_string()
}

fn default_environment() -> String {
    DEFAULT_ENVIRONMENT.to_string()
}

fn default_spawn_method() -> String {
    SpawnMethod::default().to_string()
}

fn default_app_type() -> String {
    AppType::default().to_string()
}

impl TryFrom<RawSpawnOptions> for SpawnOptions {
    type Error = ConfigError;

    fn try_from(raw: RawSpawnOptions) -> Result<Self, Self::Error> {
        SpawnOptions::builder(raw.app_root)
            .lower_privilege(raw.lower_privilege)
            .lowest_user(raw.lowest_user)
            .environment(raw.environment)
            .spawn_method(raw.spawn_method.parse()?)
            .app_type(raw.app_type.parse()?)
            .framework_spawner_timeout(raw.framework_spawner_timeout)
            .app_spawner_timeout(raw.app_spawner_timeout)
            .build()
    }
}

impl From<SpawnOptions> for RawSpawnOptions {
    fn from(options: SpawnOptions) -> Self {
        Self {
            app_root: options.app_root,
            lower_privilege: options.lower_privilege,
            lowest_user: options.lowest_user,
            environment: options.environment,
            spawn_method: options.spawn_method.to_string(),
            app_type: options.app_type.to_string(),
            framework_spawner_timeout: options.framework_spawner_timeout,
            app_spawner_timeout: options.app_spawner_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = SpawnOptions::new("/srv/app").unwrap();
        assert_eq!(options.app_root(), Path::new("/srv/app"));
        assert!(options.lower_privilege());
        assert_eq!(options.lowest_user(), "nobody");
        assert_eq!(options.environment(), "production");
        assert_eq!(options.spawn_method(), SpawnMethod::Smart);
        assert_eq!(options.app_type(), AppType::Rails);
        assert_eq!(options.framework_spawner_timeout(), 0);
        assert_eq!(options.app_spawner_timeout(), 0);
    }

    #[test]
    fn test_overrides_are_kept() {
        let options = SpawnOptions::builder("relative/app")
            .lower_privilege(false)
            .lowest_user("www-data")
            .environment("staging")
            .spawn_method(SpawnMethod::Conservative)
            .app_type(AppType::Wsgi)
            .framework_spawner_timeout(30)
            .app_spawner_timeout(45)
            .build()
            .unwrap();

        assert_eq!(options.app_root(), Path::new("relative/app"));
        assert!(!options.lower_privilege());
        assert_eq!(options.lowest_user(), "www-data");
        assert_eq!(options.environment(), "staging");
        assert_eq!(options.spawn_method(), SpawnMethod::Conservative);
        assert_eq!(options.app_type(), AppType::Wsgi);
        assert_eq!(options.framework_spawner_timeout(), 30);
        assert_eq!(options.app_spawner_timeout(), 45);
    }

    #[test]
    fn test_empty_app_root_rejected() {
        assert_eq!(SpawnOptions::new(""), Err(ConfigError::EmptyAppRoot));
    }

    #[test]
    fn test_empty_environment_rejected() {
        let result = SpawnOptions::builder("/srv/app").environment("").build();
        assert_eq!(result, Err(ConfigError::EmptyEnvironment));
    }

    #[test]
    fn test_parse_enums() {
        assert_eq!("rack".parse::<AppType>(), Ok(AppType::Rack));
        assert_eq!(
            "django".parse::<AppType>(),
            Err(ConfigError::UnknownAppType("django".to_string()))
        );
        assert_eq!(
            "conservative".parse::<SpawnMethod>(),
            Ok(SpawnMethod::Conservative)
        );
        assert!(matches!(
            "lazy".parse::<SpawnMethod>(),
            Err(ConfigError::UnknownSpawnMethod(_))
        ));
    }

    #[test]
    fn test_deserialize_applies_defaults() {
        let options: SpawnOptions =
            serde_json::from_str(r#"{"app_root": "/srv/app", "app_type": "rack"}"#).unwrap();
        assert_eq!(options.app_type(), AppType::Rack);
        assert_eq!(options.lowest_user(), "nobody");
        assert_eq!(options.environment(), "production");
        assert_eq!(options.spawn_method(), SpawnMethod::Smart);
    }

    #[test]
    fn test_deserialize_rejects_unknown_app_type() {
        let result: Result<SpawnOptions, _> =
            serde_json::from_str(r#"{"app_root": "/srv/app", "app_type": "php"}"#);
        let err = result.unwrap_err().to_string();
        assert!(err.contains("unknown application type 'php'"), "{err}");
    }

    #[test]
    fn test_serialize_uses_lowercase_names() {
        let options = SpawnOptions::builder("/srv/app")
            .app_type(AppType::Wsgi)
            .build()
            .unwrap();
        let json = serde_json::to_value(&options).unwrap();
        assert_eq!(json["app_type"], "wsgi");
        assert_eq!(json["spawn_method"], "smart");
    }
}
