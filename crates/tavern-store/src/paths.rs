//! On-disk layout of the local store.
//!
//! Everything lives under one data directory:
//!
//! ```text
//! <data_dir>/
//!   users/<user_id>.json          per-user documents
//!   <section>.json                named global sections
//!   backups/<file>.<millis>.bak.json
//!   ledgers/<name>.log            append-only NDJSON
//! ```
//!
//! Section and ledger names are validated here so a hostile name can never
//! escape the data directory. User ids are validated by construction in
//! `tavern_core::UserId` and need no second check.

use std::path::{Path, PathBuf};

use tavern_core::UserId;

use crate::error::{Result, StoreError};

/// Directory holding per-user documents.
pub const USERS_DIR: &str = "users";
/// Directory holding pre-overwrite backups.
pub const BACKUPS_DIR: &str = "backups";
/// Directory holding append-only ledgers.
pub const LEDGERS_DIR: &str = "ledgers";

const MAX_NAME_LEN: usize = 64;

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

pub(crate) fn checked_name(name: &str) -> Result<&str> {
    if valid_name(name) {
        Ok(name)
    } else {
        Err(StoreError::InvalidKey(name.to_string()))
    }
}

/// Directory of per-user documents.
#[must_use]
pub fn users_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(USERS_DIR)
}

/// Directory of backups.
#[must_use]
pub fn backups_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(BACKUPS_DIR)
}

/// Directory of ledgers.
#[must_use]
pub fn ledgers_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(LEDGERS_DIR)
}

/// Document file for one user.
#[must_use]
pub fn user_file(data_dir: &Path, user_id: &UserId) -> PathBuf {
    users_dir(data_dir).join(format!("{}.json", user_id.as_str()))
}

/// Document file for a named section.
///
/// # Errors
/// `InvalidKey` when the section name is empty, too long or contains
/// anything outside `[A-Za-z0-9_-]`.
pub fn section_file(data_dir: &Path, section: &str) -> Result<PathBuf> {
    let section = checked_name(section)?;
    Ok(data_dir.join(format!("{section}.json")))
}

/// Append-only log file for a named ledger.
///
/// # Errors
/// `InvalidKey` when the ledger name is empty, too long or contains
/// anything outside `[A-Za-z0-9_-]`.
pub fn ledger_file(data_dir: &Path, name: &str) -> Result<PathBuf> {
    let name = checked_name(name)?;
    Ok(ledgers_dir(data_dir).join(format!("{name}.log")))
}

/// Backup destination for `file_name` taken at `millis` (unix epoch).
#[must_use]
pub fn backup_file(data_dir: &Path, file_name: &str, millis: i64) -> PathBuf {
    backups_dir(data_dir).join(format!("{file_name}.{millis}.bak.json"))
}

/// Epoch milliseconds encoded in a backup file name, if it is one.
#[must_use]
pub fn backup_millis(file_name: &str) -> Option<i64> {
    let stem = file_name.strip_suffix(".bak.json")?;
    let (_, millis) = stem.rsplit_once('.')?;
    millis.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_files_live_under_users() {
        let user = UserId::new("alice").unwrap();
        let path = user_file(Path::new("data"), &user);
        assert_eq!(path, Path::new("data/users/alice.json"));
    }

    #[test]
    fn section_names_are_validated() {
        let data = Path::new("data");
        assert_eq!(
            section_file(data, "store_catalog").unwrap(),
            Path::new("data/store_catalog.json")
        );
        assert!(section_file(data, "").is_err());
        assert!(section_file(data, "../evil").is_err());
        assert!(section_file(data, "a/b").is_err());
        assert!(section_file(data, "dotted.name").is_err());
    }

    #[test]
    fn ledger_names_are_validated() {
        let data = Path::new("data");
        assert_eq!(
            ledger_file(data, "purchases").unwrap(),
            Path::new("data/ledgers/purchases.log")
        );
        assert!(ledger_file(data, "..").is_err());
    }

    #[test]
    fn backup_names_roundtrip_their_timestamp() {
        let path = backup_file(Path::new("data"), "alice.json", 1_700_000_000_123);
        assert_eq!(
            path,
            Path::new("data/backups/alice.json.1700000000123.bak.json")
        );
        assert_eq!(
            backup_millis("alice.json.1700000000123.bak.json"),
            Some(1_700_000_000_123)
        );
        assert_eq!(backup_millis("alice.json"), None);
        assert_eq!(backup_millis("weird.bak.json"), None);
    }
}
