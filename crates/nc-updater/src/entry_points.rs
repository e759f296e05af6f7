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

//! Swapping the request entry points for the maintenance stub

use crate::error::{Result, UpdaterError};
use crate::layout::{ENTRY_POINT_STUB, ENTRY_POINTS};
use std::fs;
use std::path::Path;

/// Overwrite every entry point below `root` with the 503 stub
pub fn replace_entry_points(root: &Path) -> Result<()> {
    for entry in ENTRY_POINTS {
        let path = root.join(entry);
        if let Some(parent) = path.parent()
            && !parent.exists()
        {
            fs::create_dir_all(parent).map_err(|e| UpdaterError::io_at("create", parent, e))?;
        }
        fs::write(&path, ENTRY_POINT_STUB).map_err(|e| {
            UpdaterError::io(format!("Can't replace entry point: {}", path.display()), e)
        })?;
        tracing::debug!("Stubbed {entry}");
    }
    Ok(())
}

/// True once every entry point serves the stub
pub fn entry_points_stubbed(root: &Path) -> bool {
    ENTRY_POINTS.iter().all(|entry| {
        fs::read_to_string(root.join(entry)).is_ok_and(|content| content == ENTRY_POINT_STUB)
    })
}
