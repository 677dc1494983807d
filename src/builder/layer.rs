//! Per-package layer content: which host paths a package owns, and the
//! deterministic layer id derived from its metadata.
//!
//! Copyright (c) conda-docker contributors. All rights reserved.
//!
//! Redistribution and use in source and binary forms, with or without
//! modification, are permitted provided that the following conditions
//! are met:
//!
//! * Redistributions of source code must retain the above copyright
//!   notice, this list of conditions and the following disclaimer.
//! * Redistributions in binary form must reproduce the above copyright
//!   notice, this list of conditions and the following disclaimer in
//!   the documentation and/or other materials provided with the
//!   distribution.
//!
//! THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
//! "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES ARE DISCLAIMED.
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use walkdir::WalkDir;

use crate::package::PackageCacheRecord;
use crate::tar_codec;

/// The subset of `conda-meta/<dist_name>.json` this crate reads.
#[derive(Debug, Default, Deserialize)]
struct CondaMeta {
    #[serde(default)]
    files: Vec<String>,
    #[serde(default)]
    sha256: Option<String>,
}

/// Build the ordered (host path, archive path) pairs one package owns:
/// its installed files (plus every ancestor directory), its pkgs-cache
/// entry, and its own conda-meta record.
///
/// `claimed` is a global set of host paths already assigned to an
/// earlier package's layer in this build, shared across every call
/// `layer_per_package` makes. A path already in `claimed` (most often a
/// shared ancestor directory, e.g. two Python packages both installing
/// under `opt/conda/lib/python3.11/site-packages/`) is skipped here, so
/// each path is emitted into exactly one appended layer; new paths this
/// call adds are inserted into `claimed` before returning.
pub fn owned_paths(
    staging_root: &Path,
    record: &PackageCacheRecord,
    claimed: &mut BTreeSet<PathBuf>,
) -> Result<Vec<(PathBuf, String)>> {
    let dist_name = record.record.dist_name();
    let conda_meta_rel = Path::new("opt/conda/conda-meta").join(format!("{dist_name}.json"));
    let conda_meta_path = staging_root.join(&conda_meta_rel);
    let meta: CondaMeta = serde_json::from_str(
        &fs::read_to_string(&conda_meta_path)
            .with_context(|| format!("reading `{}`", conda_meta_path.display()))?,
    )
    .with_context(|| format!("parsing `{}`", conda_meta_path.display()))?;

    let mut paths: Vec<(PathBuf, String)> = Vec::new();

    for file in &meta.files {
        let rel = Path::new("opt/conda").join(file);
        add_ancestor_dirs(staging_root, &rel, claimed, &mut paths);
        let host = staging_root.join(&rel);
        if host.exists() && claimed.insert(host.clone()) {
            paths.push((host, format!("/{}", rel.display())));
        }
    }

    let pkgs_dir_rel = Path::new("opt/conda/pkgs").join(dist_name);
    if staging_root.join(&pkgs_dir_rel).exists() {
        add_ancestor_dirs(staging_root, &pkgs_dir_rel, claimed, &mut paths);
        add_dir_recursive(staging_root, &pkgs_dir_rel, claimed, &mut paths)?;
    }

    add_ancestor_dirs(staging_root, &conda_meta_rel, claimed, &mut paths);
    if claimed.insert(conda_meta_path.clone()) {
        paths.push((conda_meta_path, format!("/{}", conda_meta_rel.display())));
    }

    Ok(paths)
}

fn add_ancestor_dirs(
    staging_root: &Path,
    rel: &Path,
    claimed: &mut BTreeSet<PathBuf>,
    paths: &mut Vec<(PathBuf, String)>,
) {
    let mut ancestors: Vec<&Path> = rel.ancestors().skip(1).collect();
    ancestors.reverse();
    for ancestor in ancestors {
        if ancestor == Path::new("") {
            continue;
        }
        let host = staging_root.join(ancestor);
        if claimed.insert(host.clone()) && host.is_dir() {
            paths.push((host, format!("/{}", ancestor.display())));
        }
    }
}

fn add_dir_recursive(
    staging_root: &Path,
    rel: &Path,
    claimed: &mut BTreeSet<PathBuf>,
    paths: &mut Vec<(PathBuf, String)>,
) -> Result<()> {
    for entry in WalkDir::new(staging_root.join(rel)).sort_by_file_name() {
        let entry = entry.context("walking package pkgs-cache directory")?;
        let host = entry.path().to_path_buf();
        if !claimed.insert(host.clone()) {
            continue;
        }
        let rel_entry = entry
            .path()
            .strip_prefix(staging_root)
            .expect("walkdir entries are under staging_root");
        paths.push((host, format!("/{}", rel_entry.display())));
    }
    Ok(())
}

/// `base_id = sha256 or md5 + "0"*32`. The metadata's own `sha256` field
/// (when present) wins; otherwise the record's MD5 is zero-padded to the
/// width of a sha256 digest.
pub fn layer_base_id(record: &PackageCacheRecord, meta_bytes: &[u8]) -> String {
    let meta: CondaMeta = serde_json::from_slice(meta_bytes).unwrap_or_default();
    match meta.sha256 {
        Some(sha256) => sha256,
        None => format!("{}{}", record.record.md5, "0".repeat(32)),
    }
}

/// Build the tar content for a set of owned paths, preserving hard
/// links within that set.
pub fn build_layer_content(paths: &[(PathBuf, String)]) -> Result<Vec<u8>> {
    tar_codec::write_from_paths(paths, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_id_prefers_sha256_field() {
        let meta = br#"{"sha256": "abc123"}"#;
        let record = PackageCacheRecord::new(
            crate::package::PackageRecord {
                url: "https://x/y.conda".to_string(),
                fn_: "y.conda".to_string(),
                md5: "deadbeef".to_string(),
                sha256: None,
                name: "y".to_string(),
                version: "1".to_string(),
                build_string: "0".to_string(),
                build_number: 0,
                subdir: "linux-64".to_string(),
                channel: "c".to_string(),
                base_url: "https://x".to_string(),
                extras: Default::default(),
            },
            PathBuf::from("/cache/y.conda"),
        );
        assert_eq!(layer_base_id(&record, meta), "abc123");
    }

    #[test]
    fn base_id_falls_back_to_zero_padded_md5() {
        let record = PackageCacheRecord::new(
            crate::package::PackageRecord {
                url: "https://x/y.conda".to_string(),
                fn_: "y.conda".to_string(),
                md5: "deadbeef".to_string(),
                sha256: None,
                name: "y".to_string(),
                version: "1".to_string(),
                build_string: "0".to_string(),
                build_number: 0,
                subdir: "linux-64".to_string(),
                channel: "c".to_string(),
                base_url: "https://x".to_string(),
                extras: Default::default(),
            },
            PathBuf::from("/cache/y.conda"),
        );
        assert_eq!(
            layer_base_id(&record, b"{}"),
            format!("deadbeef{}", "0".repeat(32))
        );
    }

    fn write_package(staging_root: &Path, dist_name: &str, files: &[&str]) -> PackageCacheRecord {
        let meta_dir = staging_root.join("opt/conda/conda-meta");
        fs::create_dir_all(&meta_dir).unwrap();
        let meta = serde_json::json!({ "files": files });
        fs::write(meta_dir.join(format!("{dist_name}.json")), meta.to_string()).unwrap();
        for file in files {
            let path = staging_root.join("opt/conda").join(file);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, b"x").unwrap();
        }
        PackageCacheRecord::new(
            crate::package::PackageRecord {
                url: format!("https://x/{dist_name}.conda"),
                fn_: format!("{dist_name}.conda"),
                md5: "deadbeef".to_string(),
                sha256: None,
                name: dist_name.to_string(),
                version: "1".to_string(),
                build_string: "0".to_string(),
                build_number: 0,
                subdir: "linux-64".to_string(),
                channel: "c".to_string(),
                base_url: "https://x".to_string(),
                extras: Default::default(),
            },
            PathBuf::from(format!("/cache/{dist_name}.conda")),
        )
    }

    #[test]
    fn owned_paths_claims_a_shared_ancestor_directory_only_once() {
        let staging = tempfile::tempdir().unwrap();
        let root = staging.path();
        let a = write_package(root, "a-1-0", &["lib/python3.11/site-packages/a.py"]);
        let b = write_package(root, "b-1-0", &["lib/python3.11/site-packages/b.py"]);

        let mut claimed = BTreeSet::new();
        let paths_a = owned_paths(root, &a, &mut claimed).unwrap();
        let paths_b = owned_paths(root, &b, &mut claimed).unwrap();

        let shared_dir = root.join("opt/conda/lib/python3.11/site-packages");
        let in_a = paths_a.iter().any(|(host, _)| *host == shared_dir);
        let in_b = paths_b.iter().any(|(host, _)| *host == shared_dir);
        assert!(in_a, "first package should claim the shared directory");
        assert!(!in_b, "second package must not re-emit an already-claimed directory");
    }
}
