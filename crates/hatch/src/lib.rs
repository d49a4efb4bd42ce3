//! Hatch spawn manager library.
//!
//! Spawns application workers, either through pooled framework and
//! application spawners (smart) or from scratch (conservative), optionally
//! under a lowered identity.

pub mod config;
pub mod error;
pub mod launcher;
pub mod manager;
pub mod options;
pub mod pool;
pub mod privilege;
pub mod spawner;

pub use config::HatchConfig;
pub use error::{ConfigError, LaunchError, LaunchFailureKind, PoolTier, SpawnError, SpawnResult};
pub use manager::{AppSpawnerKey, ManagerStats, SpawnManager, SpawnManagerBuilder, SpawnedProcess};
pub use options::{AppType, SpawnMethod, SpawnOptions};
pub use privilege::{Identity, PrivilegeResolution, PrivilegeResolver, UnchangedReason};
