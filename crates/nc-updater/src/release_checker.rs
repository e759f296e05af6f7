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

//! Update server query

use crate::error::{Result, UpdaterError};
use serde::Deserialize;
use std::time::Duration;

pub const USER_AGENT: &str = "Nextcloud Updater";

/// Release channel marker appended to every query; channel selection is not
/// configurable, so this is always `stable`
const CHANNEL_SUFFIX: &str = "xxxstablexx";

/// Release offered by the update server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateCheckResult {
    /// Raw version, e.g. "21.0.0.18"
    pub version: String,
    /// Display version, e.g. "Nextcloud 21.0.0"
    pub version_string: String,
    pub download_url: String,
}

#[derive(Debug, Default, Deserialize)]
struct UpdateServerReply {
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    versionstring: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

/// `20.0.5.2` -> `20x0x5x2xxxstablexx`
pub fn encode_version(version: &str) -> String {
    format!("{}{CHANNEL_SUFFIX}", version.replace('.', "x"))
}

/// Project the server's XML reply onto [`UpdateCheckResult`]
///
/// An empty reply element means the server offers nothing for this version.
pub fn parse_reply(body: &str) -> Result<Option<UpdateCheckResult>> {
    let reply: UpdateServerReply =
        quick_xml::de::from_str(body).map_err(|e| UpdaterError::Protocol(e.to_string()))?;

    let present = |field: Option<String>| field.filter(|value| !value.trim().is_empty());
    let (version, version_string, url) = (
        present(reply.version),
        present(reply.versionstring),
        present(reply.url),
    );

    match (version, version_string, url) {
        (None, None, None) => Ok(None),
        (Some(version), Some(version_string), Some(download_url)) => Ok(Some(UpdateCheckResult {
            version: version.trim().to_string(),
            version_string: version_string.trim().to_string(),
            download_url: download_url.trim().to_string(),
        })),
        (version, version_string, url) => {
            let missing: Vec<&str> = [
                ("version", version.is_none()),
                ("versionstring", version_string.is_none()),
                ("url", url.is_none()),
            ]
            .iter()
            .filter(|(_, missing)| *missing)
            .map(|(name, _)| *name)
            .collect();
            Err(UpdaterError::Protocol(format!(
                "reply lacks {}",
                missing.join(", ")
            )))
        }
    }
}

/// Client for the single update server query
#[derive(Debug, Clone)]
pub struct ReleaseChecker {
    client: reqwest::Client,
    server_url: String,
    timeout: Duration,
}

impl ReleaseChecker {
    pub fn new(client: reqwest::Client, server_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            server_url: server_url.into(),
            timeout,
        }
    }

    /// Ask the update server what follows `version`
    ///
    /// No retries: the caller decides whether to ask again.
    pub async fn check(&self, version: &str) -> Result<Option<UpdateCheckResult>> {
        let encoded = encode_version(version);
        tracing::debug!("Querying {} for version {encoded}", self.server_url);

        let response = self
            .client
            .get(&self.server_url)
            .query(&[("version", encoded.as_str())])
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| UpdaterError::Network(format!("Request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(UpdaterError::Network(format!(
                "update server responded with status {}",
                response.status()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| UpdaterError::Network(format!("Failed to read response: {e}")))?;

        parse_reply(&body)
    }
}
