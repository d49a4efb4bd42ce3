//! Launch recipes and framework identity.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use log::debug;
use regex::Regex;

use crate::config::HatchConfig;
use crate::error::ConfigError;
use crate::options::AppType;

static RAILS_GEM_VERSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^\s*RAILS_GEM_VERSION\s*=\s*['"]([^'"]+)['"]"#)
        .expect("Invalid regex pattern for RAILS_GEM_VERSION")
});

/// How processes for one application type are started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRecipe {
    pub app_type: AppType,
    /// Worker command line (program first).
    pub worker_command: Vec<String>,
    /// Framework spawner helper command line (program first).
    pub framework_command: Vec<String>,
    /// Variables set to the deployment environment name.
    pub environment_variables: Vec<String>,
    /// File whose owner the application runs as, relative to the app root.
    pub ownership_file: PathBuf,
}

impl LaunchRecipe {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_command.is_empty() {
            return Err(ConfigError::EmptyCommand {
                app_type: self.app_type,
                command: "worker",
            });
        }
        if self.framework_command.is_empty() {
            return Err(ConfigError::EmptyCommand {
                app_type: self.app_type,
                command: "framework",
            });
        }
        Ok(())
    }
}

/// The recipes known to a spawn manager.
#[derive(Debug, Clone, Default)]
pub struct RecipeBook {
    recipes: HashMap<AppType, Arc<LaunchRecipe>>,
}

impl RecipeBook {
    /// An empty book.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build recipes for every application type from configuration.
    pub fn from_config(config: &HatchConfig) -> Result<Self, ConfigError> {
        let helper = config.launcher.helper_binary_path();
        let mut book = Self::new();
        for app_type in AppType::ALL {
            let recipe = config.recipes.get(app_type);
            let framework_command = recipe.framework_command.clone().unwrap_or_else(|| {
                vec![
                    helper.clone(),
                    "framework".to_string(),
                    "--app-type".to_string(),
                    app_type.to_string(),
                ]
            });
            book.insert(LaunchRecipe {
                app_type,
                worker_command: recipe.worker_command.clone(),
                framework_command,
                environment_variables: recipe.environment_variables.clone(),
                ownership_file: PathBuf::from(&recipe.ownership_file),
            })?;
        }
        Ok(book)
    }

    /// Add or replace a recipe.
    pub fn insert(&mut self, recipe: LaunchRecipe) -> Result<(), ConfigError> {
        recipe.validate()?;
        self.recipes.insert(recipe.app_type, Arc::new(recipe));
        Ok(())
    }

    /// The recipe for `app_type`.
    pub fn get(&self, app_type: AppType) -> Result<Arc<LaunchRecipe>, ConfigError> {
        self.recipes
            .get(&app_type)
            .cloned()
            .ok_or(ConfigError::MissingRecipe(app_type))
    }
}

/// Cache key of a framework spawner.
///
/// Applications with the same key can share one framework spawner. For Rails
/// the signature names the framework copy the app loads:
///
/// - `vendor:<canonical path>` when the app vendors Rails in `vendor/rails`
/// - `gem:<version>` when `config/environment.rb` pins `RAILS_GEM_VERSION`
/// - `default` otherwise
///
/// Rack and WSGI apps share one framework spawner per type (`default`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FrameworkKey {
    pub app_type: AppType,
    pub signature: String,
}

impl FrameworkKey {
    pub const DEFAULT_SIGNATURE: &'static str = "default";

    pub fn new(app_type: AppType, signature: impl Into<String>) -> Self {
        Self {
            app_type,
            signature: signature.into(),
        }
    }

    /// Derive the key for the application at `app_root`.
    pub async fn detect(app_type: AppType, app_root: &Path) -> Self {
        let signature = match app_type {
            AppType::Rails => rails_signature(app_root).await,
            AppType::Rack | AppType::Wsgi => Self::DEFAULT_SIGNATURE.to_string(),
        };
        debug!(
            "Framework key for {} is {}:{}",
            app_root.display(),
            app_type,
            signature
        );
        Self::new(app_type, signature)
    }
}

impl fmt::Display for FrameworkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.app_type, self.signature)
    }
}

async fn rails_signature(app_root: &Path) -> String {
    let vendored = app_root.join("vendor").join("rails");
    if tokio::fs::metadata(&vendored)
        .await
        .is_ok_and(|m| m.is_dir())
    {
        let canonical = tokio::fs::canonicalize(&vendored)
            .await
            .unwrap_or(vendored);
        return format!("vendor:{}", canonical.display());
    }

    let environment_rb = app_root.join("config").join("environment.rb");
    if let Ok(contents) = tokio::fs::read_to_string(&environment_rb).await {
        if let Some(version) = RAILS_GEM_VERSION
            .captures(&contents)
            .and_then(|c| c.get(1))
        {
            return format!("gem:{}", version.as_str());
        }
    }

    FrameworkKey::DEFAULT_SIGNATURE.to_string()
}
