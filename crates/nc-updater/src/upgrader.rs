// SPDX-License-Identifier: CC-BY-NC-ND-4.0

//! Main updater that orchestrates the nine upgrade steps
//!
//! Every step is a separate invocation. Progress lives in the lease record,
//! never in memory, so a driver may crash between steps and a later one can
//! pick up where it stopped.

use crate::backup::BackupManager;
use crate::config::{InstanceConfig, UpdaterOptions, installed_version, set_maintenance_mode};
use crate::downloader::ReleaseFetcher;
use crate::entry_points::{entry_points_stubbed, replace_entry_points};
use crate::error::{Result, UpdaterError};
use crate::installer::Installer;
use crate::layout::{PERMISSION_CHECK_EXCLUSIONS, REQUIRED_ELEMENTS, is_expected_element};
use crate::release_checker::{ReleaseChecker, USER_AGENT, UpdateCheckResult};
use crate::state::{LeaseStore, UpgradeLease};
use crate::step::{Stage, Step, StepOutcome};
use crate::version::is_newer;
use crate::walker::TreeWalker;
use chrono::Utc;
use nix::unistd::{AccessFlags, access};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Answer of the update server, rendered for humans
#[derive(Debug, Clone)]
pub struct UpdateStatus {
    pub installed_version: String,
    pub offer: Option<UpdateCheckResult>,
    pub update_available: bool,
    pub text: String,
}

/// Orchestrator for one install root
#[derive(Debug)]
pub struct Updater {
    root: PathBuf,
    config: InstanceConfig,
    options: UpdaterOptions,
    owner: Uuid,
    leases: LeaseStore,
    release_checker: ReleaseChecker,
    fetcher: ReleaseFetcher,
    backup_manager: BackupManager,
    installer: Installer,
}

impl Updater {
    /// Build an updater for the installation at `root`
    ///
    /// Fails when the instance configuration is missing or invalid; nothing
    /// else is touched.
    pub fn new(root: &Path, options: UpdaterOptions) -> Result<Self> {
        let config = InstanceConfig::load(root)?;
        let updater_dir = config.updater_dir();

        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(options.http_timeout())
            .build()
            .map_err(|e| UpdaterError::Network(format!("Failed to create HTTP client: {e}")))?;

        let release_checker = ReleaseChecker::new(
            client.clone(),
            config.updater_server(),
            options.http_timeout(),
        );
        let fetcher = ReleaseFetcher::new(client, &updater_dir);
        let backup_manager = BackupManager::new(root, &updater_dir, &config.data_directory);
        let installer = Installer::new(root, &config.data_directory);

        Ok(Self {
            root: root.to_path_buf(),
            leases: LeaseStore::new(&updater_dir),
            owner: Uuid::new_v4(),
            config,
            options,
            release_checker,
            fetcher,
            backup_manager,
            installer,
        })
    }

    /// Act as `owner`, e.g. to continue an upgrade started by an earlier run
    #[must_use]
    pub fn with_owner(mut self, owner: Uuid) -> Self {
        self.owner = owner;
        self
    }

    pub fn owner(&self) -> Uuid {
        self.owner
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    pub fn lease(&self) -> Result<Option<UpgradeLease>> {
        self.leases.load()
    }

    pub fn stage(&self) -> Result<Stage> {
        Ok(Stage::after(self.leases.load()?.and_then(|l| l.completed)))
    }

    /// Step that would run next, `None` when the lease says all are done
    pub fn next_step(&self) -> Result<Option<Step>> {
        Ok(match self.leases.load()? {
            None => Some(Step::CheckExpectedFiles),
            Some(lease) => lease.expected_step(),
        })
    }

    pub fn installed_version(&self) -> String {
        installed_version(&self.root, &self.config)
    }

    pub async fn check_for_update(&self) -> Result<UpdateStatus> {
        let installed = self.installed_version();
        let offer = self.release_checker.check(&self.config.version).await?;

        let update_available = match &offer {
            Some(offer) => is_newer(&installed, &offer.version)?,
            None => false,
        };
        let text = match &offer {
            Some(offer) if update_available => {
                format!("Update to {} available.", offer.version_string)
            }
            _ => "No update available.".to_string(),
        };

        Ok(UpdateStatus {
            installed_version: installed,
            offer,
            update_available,
            text,
        })
    }

    /// Run `step` and report the result in the driving protocol's shape
    pub async fn run_step(&self, step: Step) -> StepOutcome {
        self.execute(step).await.into()
    }

    /// Run one step under the lease
    ///
    /// The lease record stays locked until the step's outcome is saved, so a
    /// concurrent driver waits and then sees the updated lease.
    pub async fn execute(&self, step: Step) -> Result<()> {
        let _lock = self.leases.lock()?;
        let (mut lease, acquired) = self.claim(step)?;
        info!("Step {step}: {}", step.title());

        if let Err(e) = self.perform(step, &mut lease).await {
            error!("Step {step} failed: {e}");
            if acquired {
                self.leases.release()?;
            }
            return Err(e);
        }

        lease.record_completed(step);
        if step == Step::MoveNewVersion {
            self.leases.release()?;
            info!("Upgrade finished, lease released");
        } else {
            self.leases.save(&lease)?;
        }
        info!("Step {step} done ({:?})", Stage::after(lease.completed));
        Ok(())
    }

    /// Run every remaining step in order, stopping at the first failure
    pub async fn run_remaining(&self) -> Result<Vec<Step>> {
        let mut completed = Vec::new();
        while let Some(step) = self.next_step()? {
            self.execute(step).await?;
            completed.push(step);
            if step == Step::MoveNewVersion {
                break;
            }
        }
        Ok(completed)
    }

    /// Finish an upgrade whose entry points are already stubbed
    ///
    /// A stale lease of another driver is taken over; a live one is refused.
    pub async fn resume(&self) -> Result<Vec<Step>> {
        // Each remaining step locks on its own, drop ours before running them
        let lease = {
            let _lock = self.leases.lock()?;
            self.take_over_for_resume()?
        };
        info!("Resuming upgrade after step {:?}", lease.completed.map(Step::number));
        self.run_remaining().await
    }

    fn take_over_for_resume(&self) -> Result<UpgradeLease> {
        let mut lease = self.leases.load()?.ok_or(UpdaterError::NoLease)?;
        if !lease.stub_active {
            return Err(UpdaterError::Precondition(
                "nothing to resume: entry points were never replaced".to_string(),
            ));
        }

        if lease.owner != self.owner {
            if !lease.is_stale(self.options.lease_ttl(), Utc::now()) {
                return Err(UpdaterError::LeaseHeld {
                    owner: lease.owner,
                    since: lease.acquired_at,
                });
            }
            warn!(
                "Taking over stale lease of {} (last renewed {})",
                lease.owner, lease.renewed_at
            );
            lease.owner = self.owner;
            lease.renewed_at = Utc::now();
            self.leases.save(&lease)?;
        }
        Ok(lease)
    }

    /// Release the lease without finishing the upgrade
    ///
    /// Refused once entry points are stubbed unless forced: the tree would
    /// keep answering 503 with nobody owning it.
    pub fn abort(&self, force: bool) -> Result<()> {
        let _lock = self.leases.lock()?;
        let lease = self.leases.load()?.ok_or(UpdaterError::NoLease)?;

        if !force {
            if lease.owner != self.owner {
                return Err(UpdaterError::LeaseHeld {
                    owner: lease.owner,
                    since: lease.acquired_at,
                });
            }
            if lease.stub_active {
                return Err(UpdaterError::Precondition(
                    "entry points are stubbed, resume the upgrade or force the abort".to_string(),
                ));
            }
        }

        self.leases.release()?;
        if force {
            warn!("Lease of {} released by force", lease.owner);
        } else {
            info!("Lease released");
        }
        if lease
            .completed
            .is_some_and(|step| step.number() >= Step::EnableMaintenance.number())
        {
            warn!("Maintenance mode stays enabled");
        }
        Ok(())
    }

    /// Check ownership and sequencing, then renew or acquire the lease
    ///
    /// The flag tells whether the lease was acquired by this call.
    fn claim(&self, step: Step) -> Result<(UpgradeLease, bool)> {
        let now = Utc::now();

        let Some(mut lease) = self.leases.load()? else {
            if step != Step::CheckExpectedFiles {
                return Err(UpdaterError::OutOfSequence {
                    requested: step,
                    expected: Step::CheckExpectedFiles,
                });
            }
            let lease = UpgradeLease::new(self.owner);
            self.leases.save(&lease)?;
            info!("Acquired lease as {}", self.owner);
            return Ok((lease, true));
        };

        if lease.owner != self.owner {
            let takeover = step == Step::CheckExpectedFiles
                && !lease.stub_active
                && lease.is_stale(self.options.lease_ttl(), now);
            if !takeover {
                if lease.stub_active && lease.is_stale(self.options.lease_ttl(), now) {
                    return Err(UpdaterError::Precondition(format!(
                        "stale lease of {} has entry points stubbed, resume it instead",
                        lease.owner
                    )));
                }
                return Err(UpdaterError::LeaseHeld {
                    owner: lease.owner,
                    since: lease.acquired_at,
                });
            }
            warn!(
                "Taking over stale lease of {} (last renewed {})",
                lease.owner, lease.renewed_at
            );
            let lease = UpgradeLease::new(self.owner);
            self.leases.save(&lease)?;
            return Ok((lease, true));
        }

        match lease.expected_step() {
            Some(expected) if expected == step => {}
            Some(expected) => {
                return Err(UpdaterError::OutOfSequence {
                    requested: step,
                    expected,
                });
            }
            None => {
                return Err(UpdaterError::Precondition(
                    "all steps already completed".to_string(),
                ));
            }
        }

        lease.renewed_at = now;
        self.leases.save(&lease)?;
        Ok((lease, false))
    }

    async fn perform(&self, step: Step, lease: &mut UpgradeLease) -> Result<()> {
        match step {
            Step::CheckExpectedFiles => self.check_expected_files(),
            Step::CheckWritePermissions => self.check_write_permissions(),
            Step::EnableMaintenance => set_maintenance_mode(&self.root, true),
            Step::CreateBackup => self
                .backup_manager
                .create_backup(&self.config.version)
                .map(|_| ()),
            Step::Download => self.download_update(lease).await,
            Step::Extract => self
                .fetcher
                .extract(lease.archive_sha256.as_deref())
                .map(|_| ()),
            Step::ReplaceEntryPoints => self.replace_entry_points(lease),
            Step::DeleteOldFiles => self.delete_old_files(lease),
            Step::MoveNewVersion => self.move_new_version(),
        }
    }

    fn check_expected_files(&self) -> Result<()> {
        let listing = fs::read_dir(&self.root)
            .map_err(|e| UpdaterError::io_at("read", &self.root, e))?;
        let mut names = Vec::new();
        for entry in listing {
            let entry = entry.map_err(|e| UpdaterError::io_at("read", &self.root, e))?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();

        let mut offending: Vec<String> = names
            .iter()
            .filter(|name| !is_expected_element(name))
            .cloned()
            .collect();
        offending.extend(
            REQUIRED_ELEMENTS
                .iter()
                .filter(|required| !names.iter().any(|name| name == *required))
                .map(|required| (*required).to_string()),
        );

        if offending.is_empty() {
            Ok(())
        } else {
            Err(UpdaterError::UnexpectedElements(offending))
        }
    }

    fn check_write_permissions(&self) -> Result<()> {
        let mut walker = TreeWalker::new(&self.root).excluding(&PERMISSION_CHECK_EXCLUSIONS);
        if let Ok(relative) = self.config.data_directory.strip_prefix(&self.root) {
            walker = walker.excluding_path(relative);
        }

        let mut not_writable = Vec::new();
        for item in walker.walk() {
            match item {
                Ok(entry) => {
                    if access(entry.path.as_path(), AccessFlags::W_OK).is_err() {
                        not_writable.push(entry.path.display().to_string());
                    }
                }
                Err(e) => {
                    let path = e
                        .path()
                        .map_or_else(|| self.root.clone(), Path::to_path_buf);
                    warn!("Unreadable entry {}: {e}", path.display());
                    not_writable.push(path.display().to_string());
                }
            }
        }

        if not_writable.is_empty() {
            Ok(())
        } else {
            Err(UpdaterError::NotWritable(not_writable))
        }
    }

    async fn download_update(&self, lease: &mut UpgradeLease) -> Result<()> {
        let status = self.check_for_update().await?;
        let Some(offer) = status.offer else {
            return Err(UpdaterError::Precondition("no update available".to_string()));
        };
        if !status.update_available {
            warn!(
                "Server offers {} which is not newer than {}",
                offer.version, status.installed_version
            );
        }

        let archive = self.fetcher.download(&offer.download_url).await?;
        lease.archive_sha256 = Some(archive.sha256);
        Ok(())
    }

    fn replace_entry_points(&self, lease: &mut UpgradeLease) -> Result<()> {
        if !lease.stub_active {
            lease.stub_active = true;
            self.leases.save(lease)?;
        }
        replace_entry_points(&self.root)
    }

    fn delete_old_files(&self, lease: &mut UpgradeLease) -> Result<()> {
        let shipped = match &lease.shipped_components {
            Some(cached) => cached.clone(),
            None => {
                let shipped = self.installer.shipped_components()?;
                lease.shipped_components = Some(shipped.clone());
                self.leases.save(lease)?;
                shipped
            }
        };
        self.installer.delete_old_files(&shipped).map(|_| ())
    }

    fn move_new_version(&self) -> Result<()> {
        let staging = self.fetcher.staging_dir();
        if !staging.exists() && !entry_points_stubbed(&self.root) {
            // An earlier attempt moved everything but failed afterwards
            warn!("{} is gone and entry points are live, skipping move", staging.display());
        } else {
            self.installer.move_new_version(&staging)?;
        }
        set_maintenance_mode(&self.root, false)
    }
}
