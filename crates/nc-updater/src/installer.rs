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

//! Removing the superseded release and moving the new one into place

use crate::error::{Result, UpdaterError};
use crate::layout::{DELETE_EXCLUSIONS, MOVE_EXCLUSIONS, SHIPPED_MANIFEST};
use crate::walker::{TreeEntry, TreeWalker, remove_tree, unreadable};
use serde::Deserialize;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

/// Leftovers of the old release that the tree walk would keep
const OBSOLETE_FILES: &[&str] = &["config/config.sample.php", "themes/README"];
const OBSOLETE_FOLDERS: &[&str] = &["themes/example"];

#[derive(Debug, Deserialize)]
struct ShippedManifest {
    #[serde(rename = "shippedApps")]
    shipped_apps: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteReport {
    pub components: usize,
    pub files: usize,
    pub directories: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MoveReport {
    pub files: usize,
    /// Files moved by the second pass (updater and entry points)
    pub deferred: usize,
}

#[derive(Debug, Clone)]
pub struct Installer {
    install_root: PathBuf,
    data_directory: PathBuf,
}

impl Installer {
    pub fn new(install_root: &Path, data_directory: &Path) -> Self {
        Self {
            install_root: install_root.to_path_buf(),
            data_directory: data_directory.to_path_buf(),
        }
    }

    /// Apps bundled with the installed release, from `core/shipped.json`
    pub fn shipped_components(&self) -> Result<Vec<String>> {
        let path = self.install_root.join(SHIPPED_MANIFEST);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(UpdaterError::Precondition(format!(
                    "{SHIPPED_MANIFEST} is not available"
                )));
            }
            Err(e) => return Err(UpdaterError::io_at("read", &path, e)),
        };
        let manifest: ShippedManifest = serde_json::from_str(&content).map_err(|e| {
            UpdaterError::Precondition(format!("{SHIPPED_MANIFEST} is not valid: {e}"))
        })?;
        Ok(manifest.shipped_apps)
    }

    /// Delete the shipped apps and every file the new release replaces
    ///
    /// Data, config, themes, apps, the updater and the stubbed entry points
    /// survive. Directories go only once they are empty.
    pub fn delete_old_files(&self, shipped: &[String]) -> Result<DeleteReport> {
        let mut report = DeleteReport::default();

        for name in shipped {
            if !is_plain_name(name) {
                tracing::warn!("Ignoring shipped app with invalid name {name:?}");
                continue;
            }
            let path = self.install_root.join("apps").join(name);
            remove_tree(&path)?;
            tracing::debug!("Removed shipped app {name}");
            report.components += 1;
        }

        for file in OBSOLETE_FILES {
            let path = self.install_root.join(file);
            match fs::remove_file(&path) {
                Ok(()) => report.files += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(UpdaterError::io_at("unlink", &path, e)),
            }
        }
        for folder in OBSOLETE_FOLDERS {
            remove_tree(&self.install_root.join(folder))?;
        }

        let mut walker = TreeWalker::new(&self.install_root).excluding(&DELETE_EXCLUSIONS);
        if let Ok(relative) = self.data_directory.strip_prefix(&self.install_root) {
            walker = walker.excluding_path(relative);
        }

        for item in walker.walk() {
            let entry = item.map_err(unreadable)?;
            if entry.is_dir {
                if is_empty_dir(&entry.path)? {
                    fs::remove_dir(&entry.path)
                        .map_err(|e| UpdaterError::io_at("rmdir", &entry.path, e))?;
                    report.directories += 1;
                }
                continue;
            }
            fs::remove_file(&entry.path)
                .map_err(|e| UpdaterError::io_at("unlink", &entry.path, e))?;
            tracing::debug!("Deleted {}", entry.relative.display());
            report.files += 1;
        }

        tracing::info!(
            "Deleted {} shipped apps, {} files and {} folders",
            report.components,
            report.files,
            report.directories
        );
        Ok(report)
    }

    /// Move the unpacked release from `staging` into the install root
    ///
    /// The first pass leaves the updater and the stubbed entry points
    /// staged; the second moves whatever remains, so requests only reach the
    /// new code once everything behind it is in place.
    pub fn move_new_version(&self, staging: &Path) -> Result<MoveReport> {
        if !staging.is_dir() {
            return Err(UpdaterError::Precondition(format!(
                "{} does not exist, nothing to install",
                staging.display()
            )));
        }

        let files = self.move_pass(TreeWalker::new(staging).excluding(&MOVE_EXCLUSIONS))?;
        let deferred = self.move_pass(TreeWalker::new(staging))?;

        fs::remove_dir(staging).map_err(|e| UpdaterError::io_at("rmdir", staging, e))?;

        tracing::info!("Moved {files} files into place, then {deferred} entry files");
        Ok(MoveReport { files, deferred })
    }

    fn move_pass(&self, walker: TreeWalker) -> Result<usize> {
        let mut moved = 0;
        for item in walker.walk() {
            let entry = item.map_err(unreadable)?;
            if entry.is_dir {
                if is_empty_dir(&entry.path)? {
                    fs::remove_dir(&entry.path)
                        .map_err(|e| UpdaterError::io_at("rmdir", &entry.path, e))?;
                }
                continue;
            }
            self.move_entry(&entry)?;
            moved += 1;
        }
        Ok(moved)
    }

    fn move_entry(&self, entry: &TreeEntry) -> Result<()> {
        let target = self.install_root.join(&entry.relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| UpdaterError::io_at("mkdir", parent, e))?;
        }

        move_path(&entry.path, &target, entry.is_symlink).map_err(|e| {
            UpdaterError::io(
                format!(
                    "Could not move \"{}\" to \"{}\"",
                    entry.path.display(),
                    target.display()
                ),
                e,
            )
        })?;
        tracing::debug!("Moved {}", entry.relative.display());
        Ok(())
    }
}

fn is_plain_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

fn is_empty_dir(path: &Path) -> Result<bool> {
    let mut entries = fs::read_dir(path).map_err(|e| UpdaterError::io_at("read", path, e))?;
    Ok(entries.next().is_none())
}

fn move_path(source: &Path, target: &Path, is_symlink: bool) -> io::Result<()> {
    match fs::rename(source, target) {
        Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
            copy_then_remove(source, target, is_symlink)
        }
        other => other,
    }
}

fn copy_then_remove(source: &Path, target: &Path, is_symlink: bool) -> io::Result<()> {
    if is_symlink {
        copy_symlink(source, target)?;
    } else {
        fs::copy(source, target)?;
    }
    fs::remove_file(source)
}

#[cfg(unix)]
fn copy_symlink(source: &Path, target: &Path) -> io::Result<()> {
    let link = fs::read_link(source)?;
    if fs::symlink_metadata(target).is_ok() {
        fs::remove_file(target)?;
    }
    std::os::unix::fs::symlink(link, target)
}

#[cfg(not(unix))]
fn copy_symlink(source: &Path, target: &Path) -> io::Result<()> {
    fs::copy(source, target).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry_points::{entry_points_stubbed, replace_entry_points};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        data: PathBuf,
    }

    impl Fixture {
        fn installer(&self) -> Installer {
            Installer::new(&self.root, &self.data)
        }

        fn staging(&self) -> PathBuf {
            self.data.join("updater-abc/downloads/nextcloud")
        }
    }

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn installed() -> Fixture {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("nextcloud");
        let data = root.join("data");
        for file in [
            "lib/base.php",
            "lib/private/Server.php",
            "core/js/main.js",
            "apps/files/appinfo/info.xml",
            "apps/calendar/appinfo/info.xml",
            "config/config.json",
            "config/config.sample.php",
            "themes/README",
            "themes/example/defaults.php",
            "themes/custom/defaults.php",
            "updater/index.php",
            "3rdparty/autoload.php",
            "ocs/v2.php",
            "data/admin/files/notes.txt",
            "cron.php",
        ] {
            write(&root.join(file), "old");
        }
        write(
            &root.join(SHIPPED_MANIFEST),
            r#"{"shippedApps": ["files", "dav"], "alwaysEnabled": ["files"]}"#,
        );
        replace_entry_points(&root).unwrap();
        Fixture {
            _dir: dir,
            root,
            data,
        }
    }

    fn stage_release(fixture: &Fixture) {
        let staging = fixture.staging();
        for file in [
            "lib/base.php",
            "lib/public/IUser.php",
            "core/js/main.js",
            "apps/files/appinfo/info.xml",
            "updater/index.php",
            "3rdparty/autoload.php",
            "ocs/v1.php",
            "ocs/v2.php",
            "index.php",
            "status.php",
            "remote.php",
            "public.php",
            "cron.php",
            "version.php",
        ] {
            write(&staging.join(file), &format!("new {file}"));
        }
    }

    #[test]
    fn test_shipped_components() {
        let fixture = installed();
        let apps = fixture.installer().shipped_components().unwrap();
        assert_eq!(apps, vec!["files".to_string(), "dav".to_string()]);
    }

    #[test]
    fn test_missing_manifest_is_a_precondition() {
        let fixture = installed();
        fs::remove_file(fixture.root.join(SHIPPED_MANIFEST)).unwrap();
        let err = fixture.installer().shipped_components().unwrap_err();
        assert!(matches!(err, UpdaterError::Precondition(_)));
    }

    #[test]
    fn test_delete_old_files() {
        let fixture = installed();
        let installer = fixture.installer();
        let shipped = installer.shipped_components().unwrap();
        let report = installer.delete_old_files(&shipped).unwrap();
        assert_eq!(report.components, 2);

        let root = &fixture.root;
        assert!(!root.join("apps/files").exists());
        assert!(root.join("apps/calendar/appinfo/info.xml").exists());
        assert!(!root.join("lib").exists());
        assert!(!root.join("core").exists());
        assert!(!root.join("3rdparty").exists());
        assert!(!root.join("cron.php").exists());
        assert!(!root.join("ocs/v2.php").exists());
        assert!(!root.join("config/config.sample.php").exists());
        assert!(!root.join("themes/README").exists());
        assert!(!root.join("themes/example").exists());

        assert!(root.join("config/config.json").exists());
        assert!(root.join("themes/custom/defaults.php").exists());
        assert!(root.join("updater/index.php").exists());
        assert!(root.join("data/admin/files/notes.txt").exists());
        assert!(entry_points_stubbed(root));
    }

    #[test]
    fn test_delete_can_be_retried_without_manifest() {
        let fixture = installed();
        let installer = fixture.installer();
        let shipped = installer.shipped_components().unwrap();
        installer.delete_old_files(&shipped).unwrap();

        // core/shipped.json went with the first attempt
        assert!(installer.shipped_components().is_err());
        let report = installer.delete_old_files(&shipped).unwrap();
        assert_eq!(report.files, 0);
    }

    #[test]
    fn test_shipped_names_cannot_escape_apps() {
        let fixture = installed();
        let report = fixture
            .installer()
            .delete_old_files(&["../config".to_string(), "".to_string()])
            .unwrap();
        assert_eq!(report.components, 0);
        assert!(fixture.root.join("config/config.json").exists());
    }

    #[test]
    fn test_move_new_version_in_place() {
        let fixture = installed();
        let installer = fixture.installer();
        let shipped = installer.shipped_components().unwrap();
        installer.delete_old_files(&shipped).unwrap();
        stage_release(&fixture);

        let report = installer.move_new_version(&fixture.staging()).unwrap();
        assert_eq!(report.files, 8);
        assert_eq!(report.deferred, 6);

        let root = &fixture.root;
        assert!(!fixture.staging().exists());
        assert!(!entry_points_stubbed(root));
        assert_eq!(
            fs::read_to_string(root.join("ocs/v1.php")).unwrap(),
            "new ocs/v1.php"
        );
        assert_eq!(
            fs::read_to_string(root.join("lib/public/IUser.php")).unwrap(),
            "new lib/public/IUser.php"
        );
        assert_eq!(
            fs::read_to_string(root.join("updater/index.php")).unwrap(),
            "new updater/index.php"
        );
        assert!(root.join("config/config.json").exists());
        assert!(root.join("apps/calendar/appinfo/info.xml").exists());
    }

    #[test]
    fn test_move_without_staging_is_a_precondition() {
        let fixture = installed();
        let err = fixture
            .installer()
            .move_new_version(&fixture.staging())
            .unwrap_err();
        assert!(matches!(err, UpdaterError::Precondition(_)));
        assert!(entry_points_stubbed(&fixture.root));
    }

    #[test]
    fn test_copy_then_remove() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("a.php");
        let target = dir.path().join("b.php");
        fs::write(&source, "a").unwrap();
        fs::write(&target, "old").unwrap();

        copy_then_remove(&source, &target, false).unwrap();
        assert!(!source.exists());
        assert_eq!(fs::read_to_string(&target).unwrap(), "a");
    }

    #[test]
    fn test_plain_names() {
        assert!(is_plain_name("files_sharing"));
        assert!(!is_plain_name("../config"));
        assert!(!is_plain_name("a/b"));
        assert!(!is_plain_name("/etc"));
        assert!(!is_plain_name(""));
    }
}
