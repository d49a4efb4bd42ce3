//! System account lookups and identity-switch checks.

use std::ffi::{CStr, CString};
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use log::debug;
use rustix::process::{getegid, geteuid};
use thiserror::Error;

use super::resolver::Identity;

/// A system user account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub name: String,
    pub uid: u32,
    /// The user's default (primary) group.
    pub gid: u32,
}

impl Account {
    pub fn is_superuser(&self) -> bool {
        self.uid == 0
    }
}

/// Lookup of users, groups and file ownership.
pub trait AccountDatabase: Send + Sync {
    /// The account owning `path`. `None` if the path doesn't exist or its
    /// owner has no account on this system.
    fn owner_of(&self, path: &Path) -> Option<Account>;

    /// The account with the given login name.
    fn user_by_name(&self, name: &str) -> Option<Account>;

    /// The name of a group.
    fn group_name(&self, gid: u32) -> Option<String>;
}

/// Why an identity switch isn't possible.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SwitchError {
    #[error("switching to {user} requires root (effective uid is {euid})")]
    PermissionDenied { user: String, euid: u32 },

    #[error("cannot switch to {user}: {reason}")]
    Unavailable { user: String, reason: String },
}

/// Decides whether a process may be started under an identity.
pub trait IdentitySwitcher: Send + Sync {
    fn try_switch_to(&self, identity: &Identity) -> Result<(), SwitchError>;
}

// ============================================================================
// System implementations
// ============================================================================

/// [`AccountDatabase`] backed by the system user database (NSS).
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemAccounts;

impl AccountDatabase for SystemAccounts {
    fn owner_of(&self, path: &Path) -> Option<Account> {
        let metadata = std::fs::metadata(path).ok()?;
        let account = passwd_by_uid(metadata.uid());
        if account.is_none() {
            debug!(
                "Owner uid {} of {} has no account",
                metadata.uid(),
                path.display()
            );
        }
        account
    }

    fn user_by_name(&self, name: &str) -> Option<Account> {
        passwd_by_name(name)
    }

    fn group_name(&self, gid: u32) -> Option<String> {
        group_by_gid(gid)
    }
}

/// [`IdentitySwitcher`] for the current process.
///
/// The switch itself is performed in the child at exec time. This only checks
/// that it is allowed: either we run as root, or the target is who we already
/// are.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemSwitcher;

impl IdentitySwitcher for SystemSwitcher {
    fn try_switch_to(&self, identity: &Identity) -> Result<(), SwitchError> {
        let euid = geteuid();
        if euid.is_root() {
            return Ok(());
        }
        if euid.as_raw() == identity.uid && getegid().as_raw() == identity.gid {
            return Ok(());
        }
        Err(SwitchError::PermissionDenied {
            user: identity.user.clone(),
            euid: euid.as_raw(),
        })
    }
}

const INITIAL_BUF_LEN: usize = 1024;
const MAX_BUF_LEN: usize = 1 << 20;

fn passwd_by_uid(uid: u32) -> Option<Account> {
    let mut buf_len = INITIAL_BUF_LEN;
    loop {
        let mut buf = vec![0 as libc::c_char; buf_len];
        // SAFETY: zeroed passwd is a valid out-parameter for getpwuid_r.
        let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
        let mut result: *mut libc::passwd = std::ptr::null_mut();
        // SAFETY: all pointers are valid for the duration of the call and
        // `buf` outlives every read of `pwd`.
        let rc = unsafe { libc::getpwuid_r(uid, &mut pwd, buf.as_mut_ptr(), buf.len(), &mut result) };
        if rc == libc::ERANGE && buf_len < MAX_BUF_LEN {
            buf_len *= 2;
            continue;
        }
        if rc != 0 || result.is_null() {
            return None;
        }
        // SAFETY: on success pw_name points into `buf` and is NUL-terminated.
        return Some(unsafe { account_from_passwd(&pwd) });
    }
}

fn passwd_by_name(name: &str) -> Option<Account> {
    let c_name = CString::new(name).ok()?;
    let mut buf_len = INITIAL_BUF_LEN;
    loop {
        let mut buf = vec![0 as libc::c_char; buf_len];
        // SAFETY: zeroed passwd is a valid out-parameter for getpwnam_r.
        let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
        let mut result: *mut libc::passwd = std::ptr::null_mut();
        // SAFETY: see passwd_by_uid.
        let rc = unsafe {
            libc::getpwnam_r(
                c_name.as_ptr(),
                &mut pwd,
                buf.as_mut_ptr(),
                buf.len(),
                &mut result,
            )
        };
        if rc == libc::ERANGE && buf_len < MAX_BUF_LEN {
            buf_len *= 2;
            continue;
        }
        if rc != 0 || result.is_null() {
            return None;
        }
        // SAFETY: see passwd_by_uid.
        return Some(unsafe { account_from_passwd(&pwd) });
    }
}

fn group_by_gid(gid: u32) -> Option<String> {
    let mut buf_len = INITIAL_BUF_LEN;
    loop {
        let mut buf = vec![0 as libc::c_char; buf_len];
        // SAFETY: zeroed group is a valid out-parameter for getgrgid_r.
        let mut grp: libc::group = unsafe { std::mem::zeroed() };
        let mut result: *mut libc::group = std::ptr::null_mut();
        // SAFETY: all pointers are valid for the duration of the call.
        let rc = unsafe { libc::getgrgid_r(gid, &mut grp, buf.as_mut_ptr(), buf.len(), &mut result) };
        if rc == libc::ERANGE && buf_len < MAX_BUF_LEN {
            buf_len *= 2;
            continue;
        }
        if rc != 0 || result.is_null() {
            return None;
        }
        // SAFETY: on success gr_name points into `buf` and is NUL-terminated.
        let name = unsafe { CStr::from_ptr(grp.gr_name) };
        return Some(name.to_string_lossy().into_owned());
    }
}

/// # Safety
///
/// `pwd` must have been filled in by a successful `getpw*_r` call whose
/// buffer is still alive.
unsafe fn account_from_passwd(pwd: &libc::passwd) -> Account {
    // SAFETY: guaranteed by the caller.
    let name = unsafe { CStr::from_ptr(pwd.pw_name) };
    Account {
        name: name.to_string_lossy().into_owned(),
        uid: pwd.pw_uid,
        gid: pwd.pw_gid,
    }
}
