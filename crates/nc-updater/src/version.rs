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

//! Version parsing and comparison module

use crate::error::{Result, UpdaterError};

/// Keep the first three dot-separated components ("20.0.5.2" -> "20.0.5")
pub fn normalize_version(s: &str) -> String {
    s.trim().split('.').take(3).collect::<Vec<_>>().join(".")
}

/// Parse the leading `X.Y.Z` of a version string ("20.0.5", "21.0.0.18")
pub fn parse_version(s: &str) -> Result<(u32, u32, u32)> {
    let normalized = normalize_version(s);
    let parts: Vec<&str> = normalized.split('.').collect();

    if parts.len() != 3 {
        return Err(UpdaterError::VersionParse(format!(
            "Invalid version format: {s}, expected X.Y.Z"
        )));
    }

    let component = |part: &str, name: &str| {
        part.parse::<u32>()
            .map_err(|_| UpdaterError::VersionParse(format!("Invalid {name} version: {part}")))
    };

    Ok((
        component(parts[0], "major")?,
        component(parts[1], "minor")?,
        component(parts[2], "patch")?,
    ))
}

/// Returns true if `remote` is newer than `local`
pub fn is_newer(local: &str, remote: &str) -> Result<bool> {
    Ok(parse_version(remote)? > parse_version(local)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_version() {
        assert_eq!(normalize_version("20.0.5.2"), "20.0.5");
        assert_eq!(normalize_version("21.0.0"), "21.0.0");
        assert_eq!(normalize_version("9.1"), "9.1");
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("20.0.5").unwrap(), (20, 0, 5));
        assert_eq!(parse_version("21.0.0.18").unwrap(), (21, 0, 0));
        assert!(parse_version("unknown").is_err());
        assert!(parse_version("20.0").is_err());
        assert!(parse_version("a.b.c").is_err());
    }

    #[test]
    fn test_is_newer() {
        assert!(is_newer("20.0.5", "21.0.0").unwrap());
        assert!(is_newer("20.0.5", "20.0.6.1").unwrap());
        assert!(!is_newer("20.0.5", "20.0.5.3").unwrap());
        assert!(!is_newer("21.0.0", "20.0.9").unwrap());
    }
}
