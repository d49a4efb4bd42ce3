use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use log::{debug, info, warn};

use hatch::config::default_config_path;
use hatch::launcher::RecipeBook;
use hatch::{
    AppType, HatchConfig, PrivilegeResolver, SpawnManager, SpawnMethod, SpawnOptions,
};

fn main() {
    if let Err(err) = try_main() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.common);

    match cli.command {
        Command::Spawn(args) => {
            let config = load_config(&cli.common)?;
            run_spawn(config, args)
        }
        Command::Resolve(args) => {
            let config = load_config(&cli.common)?;
            handle_resolve(&config, args)
        }
        Command::Config(args) => handle_config(&cli.common, args),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Hatch - application worker spawner.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Spawn one worker and print it as JSON
    Spawn(SpawnArgs),
    /// Print the identity an application would be spawned as
    Resolve(ResolveArgs),
    /// Print the effective configuration as TOML
    Config(ConfigArgs),
}

#[derive(Debug, Clone, Args)]
struct AppArgs {
    /// Application root directory
    #[arg(value_name = "APP_ROOT")]
    app_root: PathBuf,
    /// Application type (rails, rack, wsgi)
    #[arg(short = 't', long, default_value_t = AppType::Rails)]
    app_type: AppType,
    /// Keep the current identity instead of lowering privileges
    #[arg(long = "no-lower-privilege")]
    no_lower_privilege: bool,
    /// Fallback user when the app owner is unusable
    #[arg(long, default_value = hatch::options::DEFAULT_LOWEST_USER)]
    lowest_user: String,
}

#[derive(Debug, Clone, Args)]
struct SpawnArgs {
    #[command(flatten)]
    app: AppArgs,
    /// Deployment environment
    #[arg(short, long, default_value = hatch::options::DEFAULT_ENVIRONMENT)]
    environment: String,
    /// Spawn method (smart, conservative)
    #[arg(short = 'm', long, default_value_t = SpawnMethod::Smart)]
    spawn_method: SpawnMethod,
    /// Framework spawner idle timeout in seconds (0 = configured default)
    #[arg(long, value_name = "SECONDS", default_value_t = 0)]
    framework_spawner_timeout: u32,
    /// Application spawner idle timeout in seconds (0 = configured default)
    #[arg(long, value_name = "SECONDS", default_value_t = 0)]
    app_spawner_timeout: u32,
}

impl SpawnArgs {
    fn options(&self) -> Result<SpawnOptions> {
        SpawnOptions::builder(&self.app.app_root)
            .app_type(self.app.app_type)
            .lower_privilege(!self.app.no_lower_privilege)
            .lowest_user(&self.app.lowest_user)
            .environment(&self.environment)
            .spawn_method(self.spawn_method)
            .framework_spawner_timeout(self.framework_spawner_timeout)
            .app_spawner_timeout(self.app_spawner_timeout)
            .build()
            .context("invalid spawn options")
    }
}

#[derive(Debug, Clone, Args)]
struct ResolveArgs {
    #[command(flatten)]
    app: AppArgs,
}

#[derive(Debug, Clone, Args)]
struct ConfigArgs {
    /// Write the default configuration file
    #[arg(long)]
    init: bool,
    /// Overwrite an existing file with --init
    #[arg(long, requires = "init")]
    force: bool,
}

fn init_logging(common: &CommonOpts) {
    let log_level = if common.quiet {
        "error"
    } else {
        match common.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();
}

fn load_config(common: &CommonOpts) -> Result<HatchConfig> {
    let config = HatchConfig::load(common.config.as_deref()).with_context(|| match &common.config {
        Some(path) => format!("loading config from {}", path.display()),
        None => "loading config".to_string(),
    })?;
    debug!("Effective config: {:?}", config);
    Ok(config)
}

#[tokio::main]
async fn run_spawn(config: HatchConfig, args: SpawnArgs) -> Result<()> {
    handle_spawn(config, args).await
}

async fn handle_spawn(config: HatchConfig, args: SpawnArgs) -> Result<()> {
    let options = args.options()?;
    let manager = SpawnManager::new(config).context("creating spawn manager")?;

    let result = manager.spawn(&options).await;
    let mut spawned = match result {
        Ok(spawned) => spawned,
        Err(e) => {
            manager.shutdown().await;
            return Err(e).with_context(|| format!("spawning {}", options.app_root().display()));
        }
    };

    println!(
        "{}",
        serde_json::to_string_pretty(&spawned).context("serializing spawn result")?
    );

    // Smart-spawned workers outlive their spawners; nothing else keeps them.
    manager.shutdown().await;

    // Conservative workers are our children and die with us.
    let Some(mut child) = spawned.take_child() else {
        return Ok(());
    };

    info!("Waiting for worker {} to exit", spawned.pid);
    let stdout = child.stdout.take();
    let forward_stdout = async {
        if let Some(mut out) = stdout {
            tokio::io::copy(&mut out, &mut tokio::io::stdout()).await?;
        }
        Ok::<_, std::io::Error>(())
    };
    let (forwarded, status) = tokio::join!(forward_stdout, child.wait());
    if let Err(e) = forwarded {
        warn!("Lost worker output: {}", e);
    }

    let status = status.context("waiting for worker")?;
    if !status.success() {
        bail!("worker {} exited with {}", spawned.pid, status);
    }
    Ok(())
}

fn handle_resolve(config: &HatchConfig, args: ResolveArgs) -> Result<()> {
    let options = SpawnOptions::builder(&args.app.app_root)
        .app_type(args.app.app_type)
        .lower_privilege(!args.app.no_lower_privilege)
        .lowest_user(&args.app.lowest_user)
        .build()
        .context("invalid options")?;
    let recipes = RecipeBook::from_config(config).context("building launch recipes")?;
    let recipe = recipes.get(options.app_type())?;

    let resolution = PrivilegeResolver::default().resolve(&options, &recipe.ownership_file);
    println!(
        "{}",
        serde_json::to_string_pretty(&resolution).context("serializing resolution")?
    );
    Ok(())
}

fn handle_config(common: &CommonOpts, args: ConfigArgs) -> Result<()> {
    if args.init {
        let path = common.config.clone().unwrap_or_else(default_config_path);
        return write_default_config(&path, args.force);
    }

    let config = load_config(common)?;
    print!("{}", config.to_toml().context("rendering config")?);
    Ok(())
}

fn write_default_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {}", parent.display()))?;
    }
    let body = HatchConfig::default().to_toml()?;
    std::fs::write(path, body).with_context(|| format!("writing {}", path.display()))?;
    info!("Wrote default config to {}", path.display());
    Ok(())
}
