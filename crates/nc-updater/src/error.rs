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

//! Error types for the updater crate

use crate::step::Step;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum UpdaterError {
    #[error("config error: {0}")]
    Config(String),

    /// Top-level elements that are not part of the expected layout
    #[error("unexpected or missing elements: {}", .0.join(", "))]
    UnexpectedElements(Vec<String>),

    #[error("paths not writable: {}", .0.join(", "))]
    NotWritable(Vec<String>),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("could not reach update server: {0}")]
    Network(String),

    #[error("could not parse update server response: {0}")]
    Protocol(String),

    #[error("{0}")]
    Precondition(String),

    #[error("cannot handle archive {path}, error code is: {code}")]
    Archive { path: PathBuf, code: String },

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("version parse error: {0}")]
    VersionParse(String),

    #[error("step {requested} requested out of sequence, expected step {expected}")]
    OutOfSequence { requested: Step, expected: Step },

    #[error("upgrade already in progress, owned by {owner} since {since}")]
    LeaseHeld { owner: Uuid, since: DateTime<Utc> },

    #[error("no upgrade in progress")]
    NoLease,
}

impl UpdaterError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Shorthand for the common "could not <verb> <path>" I/O failure
    pub fn io_at(action: &str, path: &Path, source: std::io::Error) -> Self {
        Self::io(format!("could not {action} {}", path.display()), source)
    }

    /// Offending paths for failures that concern specific tree entries
    pub fn offending_paths(&self) -> Option<&[String]> {
        match self {
            Self::UnexpectedElements(paths) | Self::NotWritable(paths) => Some(paths),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, UpdaterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structural_errors_expose_paths() {
        let err = UpdaterError::UnexpectedElements(vec!["lib".to_string()]);
        assert_eq!(err.offending_paths(), Some(&["lib".to_string()][..]));

        let err = UpdaterError::Precondition("core/shipped.json is not available".to_string());
        assert!(err.offending_paths().is_none());
    }

    #[test]
    fn test_io_at_names_path() {
        let err = UpdaterError::io_at(
            "unlink",
            Path::new("/srv/cloud/lib/base.php"),
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        );
        assert!(err.to_string().starts_with("could not unlink /srv/cloud/lib/base.php"));
    }

    #[test]
    fn test_out_of_sequence_message() {
        let err = UpdaterError::OutOfSequence {
            requested: Step::Download,
            expected: Step::CreateBackup,
        };
        assert_eq!(
            err.to_string(),
            "step 5 requested out of sequence, expected step 4"
        );
    }
}
