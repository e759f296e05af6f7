// SPDX-License-Identifier: CC-BY-NC-ND-4.0

//! Filesystem layout of an installation and the per-operation skip policies

use std::fmt;
use std::path::Path;

/// Top-level elements every installation must contain
pub const REQUIRED_ELEMENTS: &[&str] = &[
    // Folders
    "3rdparty",
    "apps",
    "config",
    "core",
    "l10n",
    "lib",
    "ocs",
    "resources",
    "settings",
    "themes",
    // Files
    "console.php",
    "cron.php",
    "index.php",
    "occ",
    "public.php",
    "remote.php",
    "status.php",
    "version.php",
];

/// Top-level elements an installation may contain
pub const OPTIONAL_ELEMENTS: &[&str] = &[
    "data",
    "ocs-provider",
    "updater",
    ".htaccess",
    ".user.ini",
    "AUTHORS",
    "COPYING-AGPL",
    "db_structure.xml",
    "index.html",
    "indie.json",
    "robots.txt",
];

/// Files reachable directly by incoming requests
pub const ENTRY_POINTS: &[&str] = &[
    "index.php",
    "status.php",
    "remote.php",
    "public.php",
    "ocs/v1.php",
];

/// Served from every entry point while the tree is being replaced
pub const ENTRY_POINT_STUB: &str = "<?php\nhttp_response_code(503);\ndie('Update in process.');";

pub const SHIPPED_MANIFEST: &str = "core/shipped.json";

/// Name of the single folder a release archive unpacks into
pub const RELEASE_FOLDER: &str = "nextcloud";

pub fn is_expected_element(name: &str) -> bool {
    REQUIRED_ELEMENTS.contains(&name) || OPTIONAL_ELEMENTS.contains(&name)
}

/// Tree walks that carry their own skip policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeOperation {
    PermissionCheck,
    Backup,
    Delete,
    Move,
}

impl fmt::Display for TreeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PermissionCheck => "permission-check",
            Self::Backup => "backup",
            Self::Delete => "delete",
            Self::Move => "move",
        };
        f.write_str(name)
    }
}

/// Relative path prefixes one tree operation skips
///
/// An entry matches a path component-wise from its first segment: `data`
/// covers `data/` and everything below it but not `database`, `ocs/v1.php`
/// covers exactly that file.
#[derive(Debug, Clone, Copy)]
pub struct ExclusionSet {
    pub operation: TreeOperation,
    /// Bumped whenever `entries` changes
    pub revision: u32,
    pub entries: &'static [&'static str],
}

impl ExclusionSet {
    pub fn excludes(&self, relative: &Path) -> bool {
        self.entries.iter().any(|entry| relative.starts_with(entry))
    }
}

pub const PERMISSION_CHECK_EXCLUSIONS: ExclusionSet = ExclusionSet {
    operation: TreeOperation::PermissionCheck,
    revision: 1,
    entries: &["data"],
};

pub const BACKUP_EXCLUSIONS: ExclusionSet = ExclusionSet {
    operation: TreeOperation::Backup,
    revision: 1,
    entries: &["data"],
};

pub const DELETE_EXCLUSIONS: ExclusionSet = ExclusionSet {
    operation: TreeOperation::Delete,
    revision: 1,
    entries: &[
        "data",
        "index.php",
        "status.php",
        "remote.php",
        "public.php",
        "ocs/v1.php",
        "config",
        "themes",
        "apps",
        "updater",
    ],
};

pub const MOVE_EXCLUSIONS: ExclusionSet = ExclusionSet {
    operation: TreeOperation::Move,
    revision: 1,
    entries: &[
        "updater",
        "index.php",
        "status.php",
        "remote.php",
        "public.php",
        "ocs/v1.php",
    ],
};
