//! Privilege resolution.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use log::{debug, info, warn};
use serde::Serialize;

use super::accounts::{Account, AccountDatabase, IdentitySwitcher, SystemAccounts, SystemSwitcher};
use crate::options::SpawnOptions;

/// A user/group pair a process can run as.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Identity {
    pub user: String,
    pub uid: u32,
    pub group: String,
    pub gid: u32,
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}):{}({})", self.user, self.uid, self.group, self.gid)
    }
}

/// Why privileges were left unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnchangedReason {
    /// `lower_privilege` was false.
    Disabled,
    /// Neither the app owner nor `lowest_user` is usable.
    NoCandidate,
    /// A target was found but switching to it isn't permitted.
    SwitchFailed,
}

/// Outcome of privilege resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum PrivilegeResolution {
    /// Run as this identity.
    Lowered(Identity),
    /// Run as the current process's identity.
    Unchanged { reason: UnchangedReason },
}

impl PrivilegeResolution {
    pub fn unchanged(reason: UnchangedReason) -> Self {
        Self::Unchanged { reason }
    }

    pub fn identity(&self) -> Option<&Identity> {
        match self {
            Self::Lowered(identity) => Some(identity),
            Self::Unchanged { .. } => None,
        }
    }

    pub fn is_unchanged(&self) -> bool {
        matches!(self, Self::Unchanged { .. })
    }
}

/// Computes the identity a spawned application runs as.
#[derive(Clone)]
pub struct PrivilegeResolver {
    accounts: Arc<dyn AccountDatabase>,
    switcher: Arc<dyn IdentitySwitcher>,
}

impl Default for PrivilegeResolver {
    fn default() -> Self {
        Self::new(Arc::new(SystemAccounts), Arc::new(SystemSwitcher))
    }
}

impl fmt::Debug for PrivilegeResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivilegeResolver").finish_non_exhaustive()
    }
}

impl PrivilegeResolver {
    pub fn new(accounts: Arc<dyn AccountDatabase>, switcher: Arc<dyn IdentitySwitcher>) -> Self {
        Self { accounts, switcher }
    }

    /// Resolve the identity for `options`.
    ///
    /// `ownership_file` is relative to the app root (e.g.
    /// `config/environment.rb`); its owner is the preferred target.
    pub fn resolve(&self, options: &SpawnOptions, ownership_file: &Path) -> PrivilegeResolution {
        if !options.lower_privilege() {
            return PrivilegeResolution::unchanged(UnchangedReason::Disabled);
        }

        let Some(target) = self.target_for(options, ownership_file) else {
            info!(
                "No usable identity for {} (lowest user '{}' not found), keeping current privileges",
                options.app_root().display(),
                options.lowest_user()
            );
            return PrivilegeResolution::unchanged(UnchangedReason::NoCandidate);
        };

        match self.switcher.try_switch_to(&target) {
            Ok(()) => {
                debug!("Spawning {} as {}", options.app_root().display(), target);
                PrivilegeResolution::Lowered(target)
            }
            Err(e) => {
                warn!(
                    "Cannot lower privileges for {}: {}. Spawning with current privileges",
                    options.app_root().display(),
                    e
                );
                PrivilegeResolution::unchanged(UnchangedReason::SwitchFailed)
            }
        }
    }

    fn target_for(&self, options: &SpawnOptions, ownership_file: &Path) -> Option<Identity> {
        let owned_path = options.app_root().join(ownership_file);
        match self.accounts.owner_of(&owned_path) {
            Some(owner) if !owner.is_superuser() => return Some(self.identity_for(owner)),
            Some(_) => debug!("{} is owned by root, trying lowest user", owned_path.display()),
            None => debug!("{} has no known owner, trying lowest user", owned_path.display()),
        }

        self.accounts
            .user_by_name(options.lowest_user())
            .map(|account| self.identity_for(account))
    }

    fn identity_for(&self, account: Account) -> Identity {
        let group = self
            .accounts
            .group_name(account.gid)
            .unwrap_or_else(|| account.gid.to_string());
        Identity {
            user: account.name,
            uid: account.uid,
            group,
            gid: account.gid,
        }
    }
}
