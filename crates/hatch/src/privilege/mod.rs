//! Privilege lowering for spawned processes.
//!
//! Decides which user and group a spawned application runs as. The decision
//! never fails: when no suitable identity is found, or switching to it isn't
//! permitted, the process is spawned with the current identity.
//!
//! Resolution order:
//!
//! 1. `lower_privilege == false` → unchanged
//! 2. owner of the app's ownership-bearing file, unless missing or root
//! 3. `lowest_user`, if it exists
//! 4. otherwise unchanged
//!
//! The chosen identity is then checked with an [`IdentitySwitcher`]; a failed
//! check degrades to unchanged.

mod accounts;
mod resolver;

pub use accounts::{Account, AccountDatabase, IdentitySwitcher, SwitchError, SystemAccounts, SystemSwitcher};
pub use resolver::{Identity, PrivilegeResolution, PrivilegeResolver, UnchangedReason};
