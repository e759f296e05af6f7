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

//! Release archive download and extraction

use crate::error::{Result, UpdaterError};
use crate::layout::RELEASE_FOLDER;
use crate::walker::remove_tree;
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone)]
pub struct DownloadedArchive {
    pub path: PathBuf,
    pub sha256: String,
    pub bytes: u64,
}

/// Last non-empty path segment of the archive URL
pub fn archive_name(url: &str) -> Result<String> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| UpdaterError::Protocol(format!("invalid download url {url}: {e}")))?;
    parsed
        .path_segments()
        .and_then(|mut segments| segments.rfind(|segment| !segment.is_empty()))
        .map(str::to_string)
        .ok_or_else(|| UpdaterError::Protocol(format!("download url {url} names no file")))
}

/// Fetches and unpacks releases in the per-instance download directory
#[derive(Debug, Clone)]
pub struct ReleaseFetcher {
    client: reqwest::Client,
    download_dir: PathBuf,
}

impl ReleaseFetcher {
    pub fn new(client: reqwest::Client, updater_dir: &Path) -> Self {
        Self {
            client,
            download_dir: updater_dir.join("downloads"),
        }
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    /// Folder the release unpacks into; files are moved into place from here
    pub fn staging_dir(&self) -> PathBuf {
        self.download_dir.join(RELEASE_FOLDER)
    }

    /// Recreate the download directory and stream `url` into it
    pub async fn download(&self, url: &str) -> Result<DownloadedArchive> {
        let name = archive_name(url)?;

        remove_tree(&self.download_dir)?;
        fs::create_dir_all(&self.download_dir)
            .map_err(|e| UpdaterError::io_at("mkdir storage location", &self.download_dir, e))?;

        tracing::info!("Downloading {url}");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| UpdaterError::Network(format!("Request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(UpdaterError::Network(format!(
                "Download failed with status: {}",
                response.status()
            )));
        }

        let path = self.download_dir.join(&name);
        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| UpdaterError::io_at("create", &path, e))?;
        let mut hasher = Sha256::new();
        let mut bytes = 0_u64;

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| UpdaterError::Network(format!("Failed to download bytes: {e}")))?;
            hasher.update(&chunk);
            file.write_all(&chunk)
                .await
                .map_err(|e| UpdaterError::io_at("write", &path, e))?;
            bytes += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|e| UpdaterError::io_at("write", &path, e))?;

        let sha256 = format!("{:x}", hasher.finalize());
        tracing::info!("Downloaded {} ({bytes} bytes, sha256 {sha256})", path.display());

        Ok(DownloadedArchive {
            path,
            sha256,
            bytes,
        })
    }

    /// Unpack the single downloaded archive in place and delete it
    ///
    /// Anything but exactly one entry in the download directory is refused
    /// before touching it. When the download step recorded a digest the
    /// archive must still match it.
    pub fn extract(&self, expected_sha256: Option<&str>) -> Result<PathBuf> {
        let entries = fs::read_dir(&self.download_dir)
            .map_err(|e| UpdaterError::io_at("read", &self.download_dir, e))?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<std::io::Result<Vec<_>>>()
            .map_err(|e| UpdaterError::io_at("read", &self.download_dir, e))?;

        let [archive] = entries.as_slice() else {
            return Err(UpdaterError::Precondition(format!(
                "Expected exactly one file in {}, found {}",
                self.download_dir.display(),
                entries.len()
            )));
        };
        if !archive.is_file() {
            return Err(UpdaterError::Precondition(format!(
                "{} is not an archive",
                archive.display()
            )));
        }

        if let Some(expected) = expected_sha256 {
            let actual = file_sha256(archive)?;
            if actual != expected {
                return Err(UpdaterError::ChecksumMismatch {
                    expected: expected.to_string(),
                    actual,
                });
            }
        }

        let archive_error = |e: zip::result::ZipError| UpdaterError::Archive {
            path: archive.clone(),
            code: e.to_string(),
        };
        let file = fs::File::open(archive).map_err(|e| UpdaterError::io_at("open", archive, e))?;
        let mut zip = zip::ZipArchive::new(file).map_err(archive_error)?;
        let release_prefix = format!("{RELEASE_FOLDER}/");
        if !zip.file_names().any(|name| name.starts_with(&release_prefix)) {
            return Err(UpdaterError::Precondition(format!(
                "{} does not contain a {release_prefix} folder",
                archive.display()
            )));
        }
        zip.extract(&self.download_dir).map_err(archive_error)?;
        tracing::info!(
            "Extracted {} entries from {}",
            zip.len(),
            archive.display()
        );
        drop(zip);

        fs::remove_file(archive).map_err(|e| UpdaterError::io_at("unlink", archive, e))?;
        Ok(self.staging_dir())
    }
}

fn file_sha256(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path).map_err(|e| UpdaterError::io_at("open", path, e))?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher).map_err(|e| UpdaterError::io_at("read", path, e))?;
    Ok(format!("{:x}", hasher.finalize()))
}
