// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `node_modules.tar.gz` packing and unpacking.

use std::io::Write;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use super::DependencyError;

/// Pack `{dir}/node_modules` into a gzipped tarball rooted at `node_modules/`.
pub async fn pack_node_modules(dir: &Path) -> Result<Bytes, DependencyError> {
    let source = dir.join("node_modules");
    tokio::task::spawn_blocking(move || pack_blocking(&source))
        .await
        .map_err(|e| DependencyError::Archive(format!("pack task failed: {}", e)))?
}

fn pack_blocking(source: &Path) -> Result<Bytes, DependencyError> {
    if !source.is_dir() {
        return Err(DependencyError::Archive(format!(
            "installer produced no node_modules at {}",
            source.display()
        )));
    }

    let mut tar = tar::Builder::new(Vec::new());
    tar.follow_symlinks(false);
    tar.append_dir_all("node_modules", source)
        .map_err(|e| DependencyError::Archive(e.to_string()))?;
    let uncompressed = tar
        .into_inner()
        .map_err(|e| DependencyError::Archive(e.to_string()))?;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&uncompressed)?;
    let compressed = encoder.finish()?;

    Ok(Bytes::from(compressed))
}

/// Unpack a dependency tarball into `dest`, producing `dest/node_modules`.
pub async fn unpack_node_modules(archive: Bytes, dest: &Path) -> Result<(), DependencyError> {
    let dest: PathBuf = dest.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut tarball = tar::Archive::new(GzDecoder::new(&archive[..]));
        tarball
            .unpack(&dest)
            .map_err(|e| DependencyError::Archive(e.to_string()))
    })
    .await
    .map_err(|e| DependencyError::Archive(format!("unpack task failed: {}", e)))?
}
