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

//! Lease record persistence
//!
//! The lease is the only upgrade state kept between invocations: who owns the
//! running upgrade, how far it got and the facts later steps must re-check.

use crate::config::write_atomic;
use crate::error::{Result, UpdaterError};
use crate::step::Step;
use chrono::{DateTime, Duration, Utc};
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const LEASE_FILE: &str = "lease.json";

/// Guards every read-modify-write of the lease record. Never removed.
pub const LOCK_FILE: &str = "lease.lock";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpgradeLease {
    /// Token of the driver running this upgrade
    pub owner: Uuid,

    pub acquired_at: DateTime<Utc>,

    /// Last time a step ran under this lease
    pub renewed_at: DateTime<Utc>,

    /// Last step that completed successfully
    #[serde(default)]
    pub completed: Option<Step>,

    /// Entry points currently serve the 503 stub
    #[serde(default)]
    pub stub_active: bool,

    /// SHA-256 of the archive fetched by the download step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_sha256: Option<String>,

    /// Shipped apps read by the first delete attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shipped_components: Option<Vec<String>>,
}

impl UpgradeLease {
    pub fn new(owner: Uuid) -> Self {
        let now = Utc::now();
        Self {
            owner,
            acquired_at: now,
            renewed_at: now,
            completed: None,
            stub_active: false,
            archive_sha256: None,
            shipped_components: None,
        }
    }

    /// Step the owner is expected to run next, `None` once everything completed
    pub fn expected_step(&self) -> Option<Step> {
        match self.completed {
            None => Some(Step::CheckExpectedFiles),
            Some(step) => step.next(),
        }
    }

    pub fn is_stale(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.renewed_at) > ttl
    }

    pub fn record_completed(&mut self, step: Step) {
        self.completed = Some(step);
        self.renewed_at = Utc::now();
    }
}

/// Lease file inside the per-instance updater directory
#[derive(Debug, Clone)]
pub struct LeaseStore {
    path: PathBuf,
    lock_path: PathBuf,
}

/// Exclusive hold on the lease record, released on drop
pub struct LeaseLock {
    _file: Flock<File>,
    path: PathBuf,
}

impl std::fmt::Debug for LeaseLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseLock").field("path", &self.path).finish()
    }
}

impl LeaseStore {
    pub fn new(updater_dir: &Path) -> Self {
        Self {
            path: updater_dir.join(LEASE_FILE),
            lock_path: updater_dir.join(LOCK_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block until no other driver holds the lease record.
    ///
    /// The lock is per open file description, so two locks taken in one
    /// process exclude each other as well.
    pub fn lock(&self) -> Result<LeaseLock> {
        if let Some(parent) = self.lock_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| UpdaterError::io_at("create", parent, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(|e| UpdaterError::io_at("open", &self.lock_path, e))?;
        let file = Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| UpdaterError::io_at("lock", &self.lock_path, errno.into()))?;
        Ok(LeaseLock {
            _file: file,
            path: self.lock_path.clone(),
        })
    }

    pub fn load(&self) -> Result<Option<UpgradeLease>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.path)
            .map_err(|e| UpdaterError::io_at("read", &self.path, e))?;
        serde_json::from_str(&content).map(Some).map_err(|e| {
            UpdaterError::Precondition(format!(
                "lease record {} is corrupt ({e}), remove it to start over",
                self.path.display()
            ))
        })
    }

    pub fn save(&self, lease: &UpgradeLease) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| UpdaterError::io_at("create", parent, e))?;
        }
        write_atomic(&self.path, &serde_json::to_string_pretty(lease)?)
    }

    pub fn release(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(UpdaterError::io_at("remove", &self.path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_new_lease_expects_first_step() {
        let lease = UpgradeLease::new(Uuid::new_v4());
        assert_eq!(lease.expected_step(), Some(Step::CheckExpectedFiles));
        assert!(!lease.stub_active);
    }

    #[test]
    fn test_expected_step_follows_completed() {
        let mut lease = UpgradeLease::new(Uuid::new_v4());
        lease.record_completed(Step::Extract);
        assert_eq!(lease.expected_step(), Some(Step::ReplaceEntryPoints));
        lease.record_completed(Step::MoveNewVersion);
        assert_eq!(lease.expected_step(), None);
    }

    #[test]
    fn test_staleness() {
        let mut lease = UpgradeLease::new(Uuid::new_v4());
        let now = Utc::now();
        lease.renewed_at = now - Duration::hours(25);
        assert!(lease.is_stale(Duration::hours(24), now));
        lease.renewed_at = now - Duration::hours(2);
        assert!(!lease.is_stale(Duration::hours(24), now));
    }

    #[test]
    fn test_store_roundtrip_and_release() {
        let dir = TempDir::new().unwrap();
        let store = LeaseStore::new(&dir.path().join("updater-abc"));
        assert!(store.load().unwrap().is_none());

        let mut lease = UpgradeLease::new(Uuid::new_v4());
        lease.record_completed(Step::Download);
        lease.archive_sha256 = Some("ab12".to_string());
        store.save(&lease).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded, lease);
        let leftovers: Vec<_> = std::fs::read_dir(store.path().parent().unwrap())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .filter(|name| name.to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");

        store.release().unwrap();
        assert!(store.load().unwrap().is_none());
        store.release().unwrap();
    }

    #[test]
    fn test_lock_excludes_second_holder_until_dropped() {
        let dir = TempDir::new().unwrap();
        let store = LeaseStore::new(&dir.path().join("updater-abc"));
        let held = store.lock().unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        let other = store.clone();
        let waiter = std::thread::spawn(move || {
            let _lock = other.lock().unwrap();
            tx.send(()).unwrap();
        });
        assert!(rx.recv_timeout(std::time::Duration::from_millis(200)).is_err());

        drop(held);
        rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
        waiter.join().unwrap();
        assert!(dir.path().join("updater-abc").join(LOCK_FILE).exists());
    }

    #[test]
    fn test_corrupt_lease_is_reported() {
        let dir = TempDir::new().unwrap();
        let store = LeaseStore::new(dir.path());
        std::fs::write(store.path(), "{not json").unwrap();
        assert!(matches!(
            store.load().unwrap_err(),
            UpdaterError::Precondition(_)
        ));
    }
}
