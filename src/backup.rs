use std::{
    fs,
    path::{Path, PathBuf},
};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{DbError, Result};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const BACKUP_VERSION: &str = "1.0";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupManifest {
    pub timestamp: String,
    /// Collection file names (`<name>.tdbx`) captured by the backup.
    pub collections: Vec<String>,
    pub version: String,
    pub mode: String,
}

/// Copies every collection file, metadata document, and index file
/// byte-for-byte into a fresh `backup-<timestamp>/` directory and writes the
/// manifest describing it. Encrypted files are copied as-is, never
/// re-encrypted.
pub fn create_backup(db_dir: &Path, mode: &str) -> Result<PathBuf> {
    let now = Utc::now();
    let target = db_dir.join(format!("backup-{}", now.format("%Y-%m-%dT%H-%M-%S%.3fZ")));
    fs::create_dir_all(&target)
        .map_err(|err| DbError::Backup(format!("{}: {err}", target.display())))?;

    let mut collections = Vec::new();
    for name in database_files(db_dir)? {
        copy_file(&db_dir.join(&name), &target.join(&name), DbError::Backup)?;
        if name.ends_with(".tdbx") {
            collections.push(name);
        }
    }
    collections.sort();

    let manifest = BackupManifest {
        timestamp: now.to_rfc3339(),
        collections,
        version: BACKUP_VERSION.to_string(),
        mode: mode.to_string(),
    };
    let manifest_path = target.join(MANIFEST_FILE);
    fs::write(&manifest_path, serde_json::to_string_pretty(&manifest)?)
        .map_err(|err| DbError::Backup(format!("{}: {err}", manifest_path.display())))?;

    info!(
        "backed up {} collection(s) to {}",
        manifest.collections.len(),
        target.display()
    );
    Ok(target)
}

/// Validates the manifest (it must exist and its mode must match), then
/// copies the backed-up files over the current database. The caller clears
/// caches and reloads metadata afterwards.
pub fn restore_backup(db_dir: &Path, backup_dir: &Path, expected_mode: &str) -> Result<BackupManifest> {
    let manifest_path = backup_dir.join(MANIFEST_FILE);
    if !manifest_path.exists() {
        return Err(DbError::Restore(format!(
            "backup {} has no {MANIFEST_FILE}",
            backup_dir.display()
        )));
    }
    let contents = fs::read_to_string(&manifest_path)
        .map_err(|err| DbError::Restore(format!("{}: {err}", manifest_path.display())))?;
    let manifest: BackupManifest = serde_json::from_str(&contents)
        .map_err(|err| DbError::Restore(format!("invalid manifest: {err}")))?;

    if manifest.mode != expected_mode {
        return Err(DbError::Validation(format!(
            "backup mode '{}' does not match engine mode '{expected_mode}'",
            manifest.mode
        )));
    }

    for name in &manifest.collections {
        copy_file(&backup_dir.join(name), &db_dir.join(name), DbError::Restore)?;
    }
    // Metadata and index files ride along when the backup captured them.
    for name in database_files(backup_dir)? {
        if !name.ends_with(".tdbx") {
            copy_file(&backup_dir.join(&name), &db_dir.join(&name), DbError::Restore)?;
        }
    }

    info!(
        "restored {} collection(s) from {}",
        manifest.collections.len(),
        backup_dir.display()
    );
    Ok(manifest)
}

/// Files a backup captures: collection files, the metadata documents, and
/// persisted index files. Backup directories and scratch files are skipped.
fn database_files(dir: &Path) -> Result<Vec<String>> {
    let entries =
        fs::read_dir(dir).map_err(|err| DbError::FileRead(format!("{}: {err}", dir.display())))?;
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| DbError::FileRead(err.to_string()))?;
        if !entry.path().is_file() {
            continue;
        }
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        let is_collection = name.ends_with(".tdbx");
        let is_metadata = name == ".auth" || name == ".users";
        let is_index = name.contains(".index.") && name.ends_with(".json");
        if is_collection || is_metadata || is_index {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

fn copy_file(
    from: &Path,
    to: &Path,
    wrap: fn(String) -> DbError,
) -> Result<()> {
    fs::copy(from, to)
        .map(|_| ())
        .map_err(|err| wrap(format!("{} -> {}: {err}", from.display(), to.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed_database(dir: &Path) {
        fs::write(dir.join("users.tdbx"), "[]").unwrap();
        fs::write(dir.join("orders.tdbx"), "[{\"id\":1}]").unwrap();
        fs::write(dir.join(".auth"), "{\"admin\":[\"query\"]}").unwrap();
        fs::write(dir.join("users.index.age.json"), "{}").unwrap();
        fs::write(dir.join("notes.txt"), "ignored").unwrap();
    }

    #[test]
    fn backup_copies_files_and_writes_manifest() {
        let dir = tempfile::tempdir().unwrap();
        seed_database(dir.path());

        let target = create_backup(dir.path(), "plain").unwrap();
        assert!(target.join("users.tdbx").exists());
        assert!(target.join("orders.tdbx").exists());
        assert!(target.join(".auth").exists());
        assert!(target.join("users.index.age.json").exists());
        assert!(!target.join("notes.txt").exists());

        let manifest: BackupManifest =
            serde_json::from_str(&fs::read_to_string(target.join(MANIFEST_FILE)).unwrap()).unwrap();
        assert_eq!(manifest.collections, vec!["orders.tdbx", "users.tdbx"]);
        assert_eq!(manifest.version, BACKUP_VERSION);
        assert_eq!(manifest.mode, "plain");
    }

    #[test]
    fn second_backup_does_not_swallow_the_first() {
        let dir = tempfile::tempdir().unwrap();
        seed_database(dir.path());

        let first = create_backup(dir.path(), "plain").unwrap();
        let second = create_backup(dir.path(), "plain").unwrap();
        // The first backup directory must not leak into the second.
        assert!(first.exists());
        assert!(!second.join(first.file_name().unwrap()).exists());
    }

    #[test]
    fn restore_requires_manifest_and_matching_mode() {
        let dir = tempfile::tempdir().unwrap();
        seed_database(dir.path());

        let bare = dir.path().join("backup-bare");
        fs::create_dir_all(&bare).unwrap();
        let err = restore_backup(dir.path(), &bare, "plain").unwrap_err();
        assert_eq!(err.kind(), "restore-error");

        let target = create_backup(dir.path(), "plain").unwrap();
        let err = restore_backup(dir.path(), &target, "encrypted").unwrap_err();
        assert_eq!(err.kind(), "validation-error");
    }

    #[test]
    fn restore_overwrites_current_files() {
        let dir = tempfile::tempdir().unwrap();
        seed_database(dir.path());
        let target = create_backup(dir.path(), "plain").unwrap();

        fs::write(dir.path().join("orders.tdbx"), "[{\"id\":999}]").unwrap();
        restore_backup(dir.path(), &target, "plain").unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("orders.tdbx")).unwrap(),
            "[{\"id\":1}]"
        );
    }
}
