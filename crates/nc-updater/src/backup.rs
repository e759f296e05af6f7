// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of nc-updater.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! Backup module for pre-upgrade snapshots of the install root

use crate::error::{Result, UpdaterError};
use crate::layout::BACKUP_EXCLUSIONS;
use crate::walker::{TreeWalker, remove_tree, unreadable};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct BackupReport {
    pub path: PathBuf,
    pub version: String,
    pub files: usize,
    pub directories: usize,
}

/// Snapshots the install root below the per-instance updater directory
#[derive(Debug, Clone)]
pub struct BackupManager {
    install_root: PathBuf,
    backups_dir: PathBuf,
    data_directory: PathBuf,
}

impl BackupManager {
    pub fn new(install_root: &Path, updater_dir: &Path, data_directory: &Path) -> Self {
        Self {
            install_root: install_root.to_path_buf(),
            backups_dir: updater_dir.join("backups"),
            data_directory: data_directory.to_path_buf(),
        }
    }

    /// Backup location for `version`; one backup per version, last one wins
    pub fn backup_path(&self, version: &str) -> PathBuf {
        self.backups_dir.join(format!("nextcloud-{version}"))
    }

    /// Copy the install root, minus its data, into the backup for `version`
    ///
    /// A previous backup at the same location is deleted first. A failed copy
    /// aborts without cleanup; the next attempt starts by deleting it.
    pub fn create_backup(&self, version: &str) -> Result<BackupReport> {
        let destination = self.backup_path(version);

        if destination.exists() {
            tracing::info!("Removing previous backup at {}", destination.display());
            remove_tree(&destination)?;
        }
        fs::create_dir_all(&destination)
            .map_err(|e| UpdaterError::io_at("create backup folder", &destination, e))?;

        let mut walker = TreeWalker::new(&self.install_root).excluding(&BACKUP_EXCLUSIONS);
        if let Ok(relative) = self.data_directory.strip_prefix(&self.install_root) {
            walker = walker.excluding_path(relative);
        }

        let mut report = BackupReport {
            path: destination.clone(),
            version: version.to_string(),
            files: 0,
            directories: 0,
        };

        for item in walker.walk() {
            let entry = item.map_err(unreadable)?;
            let target = destination.join(&entry.relative);

            if entry.is_dir {
                fs::create_dir_all(&target)
                    .map_err(|e| UpdaterError::io_at("create folder", &target, e))?;
                report.directories += 1;
                continue;
            }

            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| UpdaterError::io_at("create folder", parent, e))?;
            }
            copy_entry(&entry.path, &target, entry.is_symlink).map_err(|e| {
                UpdaterError::io(
                    format!(
                        "Could not copy \"{}\" to \"{}\"",
                        entry.path.display(),
                        target.display()
                    ),
                    e,
                )
            })?;
            report.files += 1;
        }

        tracing::info!(
            "Created backup at {} ({} files, {} folders)",
            destination.display(),
            report.files,
            report.directories
        );
        Ok(report)
    }
}

fn copy_entry(source: &Path, target: &Path, is_symlink: bool) -> std::io::Result<()> {
    if is_symlink {
        return copy_symlink(source, target);
    }
    fs::copy(source, target).map(|_| ())
}

#[cfg(unix)]
fn copy_symlink(source: &Path, target: &Path) -> std::io::Result<()> {
    let link = fs::read_link(source)?;
    if fs::symlink_metadata(target).is_ok() {
        fs::remove_file(target)?;
    }
    std::os::unix::fs::symlink(link, target)
}

#[cfg(not(unix))]
fn copy_symlink(source: &Path, target: &Path) -> std::io::Result<()> {
    fs::copy(source, target).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        manager: BackupManager,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("nextcloud");
        let data = root.join("data");
        for folder in ["lib/private", "apps/files", "config", "themes/empty"] {
            fs::create_dir_all(root.join(folder)).unwrap();
        }
        fs::create_dir_all(&data).unwrap();
        fs::write(root.join("index.php"), b"<?php // index").unwrap();
        fs::write(root.join("lib/private/Server.php"), b"server").unwrap();
        fs::write(root.join("apps/files/appinfo.xml"), b"files").unwrap();
        fs::write(root.join("config/config.json"), b"{}").unwrap();
        fs::write(data.join("owncloud.db"), b"sqlite").unwrap();

        let manager = BackupManager::new(&root, &data.join("updater-abc"), &data);
        Fixture {
            _dir: dir,
            root,
            manager,
        }
    }

    #[test]
    fn test_backup_path() {
        let fixture = fixture();
        assert_eq!(
            fixture.manager.backup_path("20.0.5.2"),
            fixture
                .root
                .join("data/updater-abc/backups/nextcloud-20.0.5.2")
        );
    }

    #[test]
    fn test_create_backup_copies_tree_without_data() {
        let fixture = fixture();
        let report = fixture.manager.create_backup("20.0.5").unwrap();

        assert_eq!(report.files, 4);
        assert!(report.path.join("index.php").exists());
        assert!(report.path.join("lib/private/Server.php").exists());
        assert!(report.path.join("config/config.json").exists());
        assert!(report.path.join("themes/empty").is_dir());
        assert!(!report.path.join("data").exists());
        assert_eq!(
            fs::read(report.path.join("apps/files/appinfo.xml")).unwrap(),
            b"files"
        );
    }

    #[test]
    fn test_create_backup_replaces_previous_backup() {
        let fixture = fixture();
        let first = fixture.manager.create_backup("20.0.5").unwrap();
        fs::write(first.path.join("leftover.txt"), b"stale").unwrap();

        let second = fixture.manager.create_backup("20.0.5").unwrap();
        assert_eq!(first.path, second.path);
        assert_eq!(first.files, second.files);
        assert!(!second.path.join("leftover.txt").exists());

        let backups: Vec<_> = fs::read_dir(second.path.parent().unwrap())
            .unwrap()
            .collect();
        assert_eq!(backups.len(), 1);
    }

    #[test]
    fn test_data_directory_outside_default_name_is_skipped() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("nextcloud");
        let data = root.join("storage");
        fs::create_dir_all(data.join("admin")).unwrap();
        fs::write(data.join("admin/secret.txt"), b"secret").unwrap();
        fs::write(root.join("cron.php"), b"cron").unwrap();

        let manager = BackupManager::new(&root, &data.join("updater-abc"), &data);
        let report = manager.create_backup("20.0.5").unwrap();
        assert!(report.path.join("cron.php").exists());
        assert!(!report.path.join("storage").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_are_recreated() {
        let fixture = fixture();
        std::os::unix::fs::symlink("lib/private", fixture.root.join("private-link")).unwrap();

        let report = fixture.manager.create_backup("20.0.5").unwrap();
        let link = report.path.join("private-link");
        assert_eq!(fs::read_link(link).unwrap(), PathBuf::from("lib/private"));
    }
}
