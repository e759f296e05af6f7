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

//! Nextcloud Updater - step-wise in-place upgrade of a deployed install root
//!
//! The [`Updater`] drives nine externally invoked steps: layout and permission
//! checks, maintenance mode, backup, download, extraction, entry-point stubbing,
//! removal of the old release and moving the new one into place. A lease record
//! next to the instance data keeps concurrent drivers apart and lets an
//! interrupted upgrade be resumed.

pub mod backup;
pub mod config;
pub mod downloader;
pub mod entry_points;
pub mod error;
pub mod installer;
pub mod layout;
pub mod release_checker;
pub mod state;
pub mod step;
pub mod upgrader;
pub mod version;
pub mod walker;

pub use config::{InstanceConfig, UpdaterOptions};
pub use error::{Result, UpdaterError};
pub use state::UpgradeLease;
pub use step::{Stage, Step, StepDetail, StepOutcome};
pub use upgrader::{UpdateStatus, Updater};
pub use version::{is_newer, normalize_version, parse_version};
