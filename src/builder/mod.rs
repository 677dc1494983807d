//! Orchestrates the staging, install-sandbox, catalog-writing and
//! layering steps that turn a verified package cache into appended
//! image layers.
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
mod archive;
mod layer;

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use walkdir::WalkDir;

use crate::config::{apply_remaps, BuildConfig, LayeringStrategy};
use crate::external::Installer;
use crate::package::PackageCacheRecord;
use crate::tar_codec;
use crate::write;

/// Everything the builder needs beyond [`BuildConfig`]: the resolved,
/// fetched records, where their tarballs live, the standalone installer
/// binary, and the argv the conda-meta history header should record.
pub struct BuildInputs<'a> {
    /// Verified, cached package records in install order.
    pub records: &'a [PackageCacheRecord],
    /// Path to the standalone installer binary (`_conda.exe` source).
    pub installer_exe: &'a Path,
    /// The command line to record in `conda-meta/history`.
    pub command_line: Vec<String>,
}

/// Stage, install, layer, and return the appended layers' tar content
/// with an optional fixed id, in append order (first tuple becomes the
/// bottommost of the new layers). The staging root is always removed
/// before returning, on every exit path.
pub fn build(
    cfg: &BuildConfig,
    inputs: &BuildInputs,
    installer: &dyn Installer,
) -> Result<Vec<(Vec<u8>, Option<String>)>> {
    let staging = tempfile::tempdir().context("creating staging root")?;
    let staging_root = staging.path();

    let result = (|| {
        stage(cfg, inputs, staging_root)?;
        run_install(staging_root, inputs.installer_exe, installer)?;
        cleanup_pre_layering(staging_root)?;
        match cfg.layering_strategy {
            LayeringStrategy::Single => Ok(vec![layer_single(staging_root)?]),
            LayeringStrategy::Layered => layer_per_package(cfg, staging_root, inputs.records),
        }
    })();

    result
}

fn stage(cfg: &BuildConfig, inputs: &BuildInputs, staging_root: &Path) -> Result<()> {
    write::ok("Staging", "package environment")?;
    let pkgs_dir = staging_root.join("opt/conda/pkgs");
    fs::create_dir_all(&pkgs_dir).with_context(|| format!("creating `{}`", pkgs_dir.display()))?;

    for record in inputs.records {
        let dest = pkgs_dir.join(&record.record.fn_);
        archive::link_or_copy(&record.tarball_path, &dest)?;
    }
    archive::link_or_copy(inputs.installer_exe, &staging_root.join("_conda.exe"))?;

    write_env_txt(&pkgs_dir, inputs.records)?;
    write_environments_txt(staging_root)?;
    write_urls_files(cfg, &pkgs_dir, inputs.records)?;
    write_history(staging_root, &inputs.command_line, inputs.records)?;
    write_repodata_records(cfg, staging_root, inputs.records)?;

    archive::copy_host_binary("bash", staging_root)?;
    archive::copy_host_binary("mv", staging_root)?;

    Ok(())
}

fn write_env_txt(pkgs_dir: &Path, records: &[PackageCacheRecord]) -> Result<()> {
    let mut out = String::from("@EXPLICIT\n");
    for record in records {
        out.push_str(&format!("file:///opt/conda/pkgs/{}\n", record.record.fn_));
    }
    fs::write(pkgs_dir.join("env.txt"), out).context("writing env.txt")
}

fn write_environments_txt(staging_root: &Path) -> Result<()> {
    let dir = staging_root.join("root/.conda");
    fs::create_dir_all(&dir).with_context(|| format!("creating `{}`", dir.display()))?;
    fs::write(dir.join("environments.txt"), "/opt/conda\n").context("writing environments.txt")
}

fn write_urls_files(cfg: &BuildConfig, pkgs_dir: &Path, records: &[PackageCacheRecord]) -> Result<()> {
    let mut urls = String::new();
    let mut urls_txt = String::new();
    for record in records {
        let remapped = apply_remaps(&cfg.channel_remaps, &record.record.url);
        urls.push_str(&format!("{}#{}\n", remapped, record.record.md5));
        urls_txt.push_str(&format!("{}\n", remapped));
    }
    urls.push('\n');
    urls_txt.push('\n');
    fs::write(pkgs_dir.join("urls"), urls).context("writing urls")?;
    fs::write(pkgs_dir.join("urls.txt"), urls_txt).context("writing urls.txt")
}

fn write_history(staging_root: &Path, command_line: &[String], records: &[PackageCacheRecord]) -> Result<()> {
    let dir = staging_root.join("opt/conda/conda-meta");
    fs::create_dir_all(&dir).with_context(|| format!("creating `{}`", dir.display()))?;
    let mut out = format!(
        "==> {} <==\n# cmd: {}\n",
        Utc::now().format("%Y-%m-%d %H:%M:%S"),
        command_line.join(" ")
    );
    for record in records {
        out.push_str(&format!("+{}::{}\n", record.record.channel, record.record.dist_name()));
    }
    fs::write(dir.join("history"), out).context("writing conda-meta/history")
}

fn write_repodata_records(cfg: &BuildConfig, staging_root: &Path, records: &[PackageCacheRecord]) -> Result<()> {
    for record in records {
        let dist_dir = staging_root
            .join("opt/conda/pkgs")
            .join(record.record.dist_name())
            .join("info");
        fs::create_dir_all(&dist_dir).with_context(|| format!("creating `{}`", dist_dir.display()))?;
        let src = record.extracted_dir.join("info/repodata_record.json");
        let mut value: serde_json::Value = serde_json::from_str(
            &fs::read_to_string(&src).with_context(|| format!("reading `{}`", src.display()))?,
        )
        .with_context(|| format!("parsing `{}`", src.display()))?;
        if let serde_json::Value::Object(ref mut map) = value {
            let url = map
                .get("url")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            map.insert(
                "url".into(),
                serde_json::Value::String(apply_remaps(&cfg.channel_remaps, &url)),
            );
            let channel = map
                .get("channel")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            map.insert(
                "channel".into(),
                serde_json::Value::String(apply_remaps(&cfg.channel_remaps, &channel)),
            );
        }
        let dest = dist_dir.join("repodata_record.json");
        fs::write(&dest, serde_json::to_string_pretty(&value)?)
            .with_context(|| format!("writing `{}`", dest.display()))?;
    }
    Ok(())
}

fn run_install(staging_root: &Path, installer_exe: &Path, installer: &dyn Installer) -> Result<()> {
    write::ok("Installing", "package environment")?;
    installer.extract_pkgs(installer_exe, &staging_root.join("opt/conda"))?;
    let status = installer.install(
        staging_root,
        Path::new("/opt/conda/pkgs/env.txt"),
        Path::new("/opt/conda"),
    )?;
    if !status.success() {
        // A known sandbox segfault can follow a successful install;
        // don't guess, check for the install's actual on-disk
        // artifacts before deciding this is fatal.
        write::error(
            "Warning",
            format!(
                "sandboxed installer exited with {}; checking for on-disk evidence of success",
                status
            ),
        )?;
        let conda_meta = staging_root.join("opt/conda/conda-meta");
        let populated = conda_meta.is_dir()
            && fs::read_dir(&conda_meta)
                .map(|mut entries| entries.next().is_some())
                .unwrap_or(false);
        if !populated {
            bail!(
                "sandboxed installer exited with {} and left no conda-meta records; install did not succeed",
                status
            );
        }
    }
    Ok(())
}

fn cleanup_pre_layering(staging_root: &Path) -> Result<()> {
    let pkgs_dir = staging_root.join("opt/conda/pkgs");
    for entry in fs::read_dir(&pkgs_dir).with_context(|| format!("reading `{}`", pkgs_dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        let is_tarball = path
            .extension()
            .map(|ext| ext == "conda" || ext == "bz2")
            .unwrap_or(false);
        if is_tarball {
            fs::remove_file(&path).with_context(|| format!("removing `{}`", path.display()))?;
        }
    }
    let _ = fs::remove_file(pkgs_dir.join("env.txt"));
    let _ = fs::remove_file(staging_root.join("_conda.exe"));
    let _ = fs::remove_dir_all(staging_root.join("bin"));

    for entry in fs::read_dir(staging_root).with_context(|| format!("reading `{}`", staging_root.display()))? {
        let entry = entry?;
        if entry.file_name() == "opt" {
            continue;
        }
        let path = entry.path();
        if path.is_dir() {
            fs::remove_dir_all(&path).with_context(|| format!("removing `{}`", path.display()))?;
        } else {
            fs::remove_file(&path).with_context(|| format!("removing `{}`", path.display()))?;
        }
    }
    Ok(())
}

fn layer_single(staging_root: &Path) -> Result<(Vec<u8>, Option<String>)> {
    write::ok("Writing", "single environment layer")?;
    let content = tar_codec::write_from_path(staging_root, "/", true, None)?;
    Ok((content, None))
}

fn layer_per_package(
    cfg: &BuildConfig,
    staging_root: &Path,
    records: &[PackageCacheRecord],
) -> Result<Vec<(Vec<u8>, Option<String>)>> {
    write::ok("Writing", "per-package environment layers")?;
    let mut layers = Vec::new();
    // Host paths already assigned to an earlier package's layer. Shared
    // across every `owned_paths` call so a directory two packages both
    // write into (e.g. a shared `site-packages/`) is only emitted once,
    // into the first package that claims it.
    let mut owned_union: BTreeSet<PathBuf> = BTreeSet::new();

    for record in records.iter().take(cfg.max_package_layers) {
        let meta_path = staging_root
            .join("opt/conda/conda-meta")
            .join(format!("{}.json", record.record.dist_name()));
        let meta_bytes = fs::read(&meta_path)
            .with_context(|| format!("reading `{}`", meta_path.display()))?;
        let base_id = layer::layer_base_id(record, &meta_bytes);
        let paths = layer::owned_paths(staging_root, record, &mut owned_union)?;
        let content = layer::build_layer_content(&paths)?;
        layers.push((content, Some(base_id)));
    }

    if records.len() > cfg.max_package_layers {
        log::debug!(
            "{} package(s) exceed the {}-layer cap; folding the remainder into the catch-all layer",
            records.len() - cfg.max_package_layers,
            cfg.max_package_layers
        );
    }

    let remaining = catch_all_paths(staging_root, &owned_union)?;
    layers.push((layer::build_layer_content(&remaining)?, None));

    Ok(layers)
}

fn catch_all_paths(staging_root: &Path, owned: &BTreeSet<PathBuf>) -> Result<Vec<(PathBuf, String)>> {
    let mut paths = Vec::new();
    for entry in WalkDir::new(staging_root).sort_by_file_name() {
        let entry = entry.context("walking staging root for the catch-all layer")?;
        if entry.path() == staging_root || owned.contains(entry.path()) {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(staging_root)
            .expect("walkdir entries are under staging_root");
        paths.push((entry.path().to_path_buf(), format!("/{}", rel.display())));
    }
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_env_txt_lists_files_in_record_order() {
        let dir = tempfile::tempdir().unwrap();
        let records = vec![
            PackageCacheRecord::new(sample_record("a-1-0.conda"), PathBuf::from("/cache/a-1-0.conda")),
            PackageCacheRecord::new(sample_record("b-1-0.conda"), PathBuf::from("/cache/b-1-0.conda")),
        ];
        write_env_txt(dir.path(), &records).unwrap();
        let content = fs::read_to_string(dir.path().join("env.txt")).unwrap();
        assert_eq!(
            content,
            "@EXPLICIT\nfile:///opt/conda/pkgs/a-1-0.conda\nfile:///opt/conda/pkgs/b-1-0.conda\n"
        );
    }

    #[test]
    fn write_urls_files_remaps_and_trails_a_blank_line() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = BuildConfig::default();
        cfg.channel_remaps.push(crate::config::ChannelRemap {
            src: "https://a/".to_string(),
            dst: "https://b/".to_string(),
        });
        let mut record = sample_record("a-1-0.conda");
        record.url = "https://a/linux-64/a-1-0.conda".to_string();
        let records = vec![PackageCacheRecord::new(record, PathBuf::from("/cache/a-1-0.conda"))];
        write_urls_files(&cfg, dir.path(), &records).unwrap();
        let urls = fs::read_to_string(dir.path().join("urls")).unwrap();
        assert!(urls.starts_with("https://b/linux-64/a-1-0.conda#"));
        assert!(urls.ends_with("\n\n"));
    }

    fn sample_record(fn_: &str) -> crate::package::PackageRecord {
        crate::package::PackageRecord {
            url: format!("https://conda.anaconda.org/conda-forge/linux-64/{fn_}"),
            fn_: fn_.to_string(),
            md5: "deadbeef".to_string(),
            sha256: None,
            name: "pkg".to_string(),
            version: "1".to_string(),
            build_string: "0".to_string(),
            build_number: 0,
            subdir: "linux-64".to_string(),
            channel: "conda-forge".to_string(),
            base_url: "https://conda.anaconda.org/conda-forge".to_string(),
            extras: Default::default(),
        }
    }
}
