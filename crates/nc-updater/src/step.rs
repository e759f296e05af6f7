// SPDX-License-Identifier: CC-BY-NC-ND-4.0

//! The nine upgrade steps and the outcome reported to the driver

use crate::error::UpdaterError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One externally invocable upgrade step, numbered 1-9 on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Step {
    CheckExpectedFiles,
    CheckWritePermissions,
    EnableMaintenance,
    CreateBackup,
    Download,
    Extract,
    ReplaceEntryPoints,
    DeleteOldFiles,
    MoveNewVersion,
}

impl Step {
    pub const ALL: [Step; 9] = [
        Step::CheckExpectedFiles,
        Step::CheckWritePermissions,
        Step::EnableMaintenance,
        Step::CreateBackup,
        Step::Download,
        Step::Extract,
        Step::ReplaceEntryPoints,
        Step::DeleteOldFiles,
        Step::MoveNewVersion,
    ];

    pub fn number(self) -> u8 {
        match self {
            Self::CheckExpectedFiles => 1,
            Self::CheckWritePermissions => 2,
            Self::EnableMaintenance => 3,
            Self::CreateBackup => 4,
            Self::Download => 5,
            Self::Extract => 6,
            Self::ReplaceEntryPoints => 7,
            Self::DeleteOldFiles => 8,
            Self::MoveNewVersion => 9,
        }
    }

    pub fn from_number(number: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|step| step.number() == number)
    }

    /// The step that follows this one, `None` after the last step
    pub fn next(self) -> Option<Self> {
        Self::from_number(self.number() + 1)
    }

    /// Human readable title, as shown by progress UIs
    pub fn title(self) -> &'static str {
        match self {
            Self::CheckExpectedFiles => "Check for expected files",
            Self::CheckWritePermissions => "Check for write permissions",
            Self::EnableMaintenance => "Enable maintenance mode",
            Self::CreateBackup => "Create backup",
            Self::Download => "Downloading",
            Self::Extract => "Extracting",
            Self::ReplaceEntryPoints => "Replace entry points",
            Self::DeleteOldFiles => "Delete old files",
            Self::MoveNewVersion => "Move new files in place",
        }
    }

    /// Lifecycle stage reached once this step has completed
    pub fn completes(self) -> Stage {
        match self {
            Self::CheckExpectedFiles => Stage::FilesChecked,
            Self::CheckWritePermissions => Stage::PermissionsChecked,
            Self::EnableMaintenance => Stage::MaintenanceOn,
            Self::CreateBackup => Stage::BackedUp,
            Self::Download => Stage::Downloaded,
            Self::Extract => Stage::Extracted,
            Self::ReplaceEntryPoints => Stage::EntryPointsReplaced,
            Self::DeleteOldFiles => Stage::OldFilesDeleted,
            Self::MoveNewVersion => Stage::Done,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

impl From<Step> for u8 {
    fn from(step: Step) -> Self {
        step.number()
    }
}

impl TryFrom<u8> for Step {
    type Error = String;

    fn try_from(number: u8) -> Result<Self, Self::Error> {
        Self::from_number(number).ok_or_else(|| format!("invalid step number: {number}"))
    }
}

/// Upgrade lifecycle, one stage per completed step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    FilesChecked,
    PermissionsChecked,
    MaintenanceOn,
    BackedUp,
    Downloaded,
    Extracted,
    EntryPointsReplaced,
    OldFilesDeleted,
    Done,
}

impl Stage {
    pub fn after(completed: Option<Step>) -> Self {
        completed.map_or(Self::Init, Step::completes)
    }
}

/// Detail attached to a failed step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepDetail {
    /// Structural failure: the offending paths
    Paths(Vec<String>),
    /// Operational failure: what went wrong
    Message(String),
}

/// Response of one step invocation, `{"proceed": bool, "response"?: ...}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub proceed: bool,
    #[serde(default, rename = "response", skip_serializing_if = "Option::is_none")]
    pub detail: Option<StepDetail>,
}

impl StepOutcome {
    pub fn proceed() -> Self {
        Self {
            proceed: true,
            detail: None,
        }
    }

    pub fn failed(err: &UpdaterError) -> Self {
        let detail = match err.offending_paths() {
            Some(paths) => StepDetail::Paths(paths.to_vec()),
            None => StepDetail::Message(err.to_string()),
        };
        Self {
            proceed: false,
            detail: Some(detail),
        }
    }
}

impl From<crate::error::Result<()>> for StepOutcome {
    fn from(result: crate::error::Result<()>) -> Self {
        match result {
            Ok(()) => Self::proceed(),
            Err(e) => Self::failed(&e),
        }
    }
}
