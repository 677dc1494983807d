//! Ensures every resolved package's tarball is present and verified in
//! the local cache, and writes its per-package metadata record.
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
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use log::debug;
use reqwest::blocking::Client;

use crate::config::BuildConfig;
use crate::hashing::{md5_file, sha256_file, Md5Writer, Sha256Writer};
use crate::package::{PackageCacheRecord, PackageRecord};
use crate::write;

/// Ensure every record's tarball exists in `cache_dir` with a matching
/// checksum, downloading it otherwise, then write
/// `<extracted_dir>/info/repodata_record.json`. Output order matches
/// `records` exactly.
pub fn fetch_all(
    cfg: &BuildConfig,
    records: &[PackageRecord],
    cache_dir: &Path,
) -> Result<Vec<PackageCacheRecord>> {
    fs::create_dir_all(cache_dir)
        .with_context(|| format!("creating cache dir `{}`", cache_dir.display()))?;
    let client = build_client(cfg)?;
    let mut out = Vec::with_capacity(records.len());
    for record in records {
        write::ok("Fetching", &record.fn_)?;
        out.push(fetch_one(&client, record, cache_dir)?);
    }
    Ok(out)
}

fn fetch_one(client: &Client, record: &PackageRecord, cache_dir: &Path) -> Result<PackageCacheRecord> {
    let tarball_path = cache_dir.join(&record.fn_);
    let needs_download = match &record.sha256 {
        Some(expected) => sha256_file(&tarball_path).map(|d| d != *expected).unwrap_or(true),
        None => md5_file(&tarball_path).map(|d| d != record.md5).unwrap_or(true),
    };
    if needs_download {
        download_and_verify(client, record, &tarball_path)?;
    } else {
        debug!(
            "`{}` already cached with a matching checksum, skipping download",
            record.fn_
        );
    }

    let cache_record = PackageCacheRecord::new(record.clone(), tarball_path);
    let info_dir = cache_record.extracted_dir.join("info");
    fs::create_dir_all(&info_dir).with_context(|| format!("creating `{}`", info_dir.display()))?;
    let record_json = serde_json::to_string_pretty(&SortedRecord::from(&cache_record.record))
        .context("serializing repodata_record.json")?;
    fs::write(info_dir.join("repodata_record.json"), record_json)
        .with_context(|| format!("writing `{}/repodata_record.json`", info_dir.display()))?;

    Ok(cache_record)
}

/// Download `record.url` to `dest`, verifying against `record.sha256`
/// when the resolver supplied one, falling back to `record.md5`
/// otherwise.
fn download_and_verify(client: &Client, record: &PackageRecord, dest: &Path) -> Result<()> {
    let tmp_path = dest.with_extension("part");
    let resp = client
        .get(&record.url)
        .send()
        .with_context(|| format!("GET {}", record.url))?;
    if !resp.status().is_success() {
        bail!("GET {} returned {}", record.url, resp.status());
    }
    let content_length = resp.content_length();
    let mut body = resp;

    let file = fs::File::create(&tmp_path).with_context(|| format!("creating `{}`", tmp_path.display()))?;
    let written = if let Some(expected) = &record.sha256 {
        let mut writer = Sha256Writer::new(file);
        let written = std::io::copy(&mut body, &mut writer)
            .with_context(|| format!("downloading `{}`", record.url))?;
        let (digest, _file) = writer.finish();
        if digest != *expected {
            let _ = fs::remove_file(&tmp_path);
            bail!("`{}` sha256 mismatch: expected {}, got {}", record.url, expected, digest);
        }
        written
    } else {
        let mut writer = Md5Writer::new(file);
        let written = std::io::copy(&mut body, &mut writer)
            .with_context(|| format!("downloading `{}`", record.url))?;
        let (digest, _file) = writer.finish();
        if digest != record.md5 {
            let _ = fs::remove_file(&tmp_path);
            bail!("`{}` md5 mismatch: expected {}, got {}", record.url, record.md5, digest);
        }
        written
    };

    if let Some(expected) = content_length {
        if written != expected {
            let _ = fs::remove_file(&tmp_path);
            bail!(
                "`{}` downloaded {} bytes but Content-Length advertised {}",
                record.url,
                written,
                expected
            );
        }
    }

    fs::rename(&tmp_path, dest)
        .with_context(|| format!("renaming `{}` into cache", tmp_path.display()))?;
    Ok(())
}

fn build_client(cfg: &BuildConfig) -> Result<Client> {
    let mut builder = Client::builder()
        .connect_timeout(cfg.connect_timeout)
        .timeout(cfg.read_timeout)
        .danger_accept_invalid_certs(cfg.insecure_skip_tls_verify);
    if let Some(proxy) = &cfg.https_proxy {
        builder = builder.proxy(reqwest::Proxy::https(proxy)?);
    }
    builder.build().context("building fetcher HTTP client")
}

/// `record.dump()` with sorted keys.
#[derive(serde::Serialize)]
struct SortedRecord<'a> {
    base_url: &'a str,
    build_number: u64,
    build_string: &'a str,
    channel: &'a str,
    #[serde(rename = "fn")]
    fn_: &'a str,
    md5: &'a str,
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha256: Option<&'a str>,
    subdir: &'a str,
    url: &'a str,
    version: &'a str,
}

impl<'a> From<&'a PackageRecord> for SortedRecord<'a> {
    fn from(r: &'a PackageRecord) -> Self {
        Self {
            base_url: &r.base_url,
            build_number: r.build_number,
            build_string: &r.build_string,
            channel: &r.channel,
            fn_: &r.fn_,
            md5: &r.md5,
            name: &r.name,
            sha256: r.sha256.as_deref(),
            subdir: &r.subdir,
            url: &r.url,
            version: &r.version,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn sample(url: String, md5: String) -> PackageRecord {
        PackageRecord {
            url,
            fn_: "numpy-1.0-0.conda".to_string(),
            md5,
            sha256: None,
            name: "numpy".to_string(),
            version: "1.0".to_string(),
            build_string: "0".to_string(),
            build_number: 0,
            subdir: "linux-64".to_string(),
            channel: "conda-forge".to_string(),
            base_url: "https://conda.anaconda.org/conda-forge".to_string(),
            extras: BTreeMap::new(),
        }
    }

    #[test]
    fn existing_tarball_with_matching_md5_skips_download() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("numpy-1.0-0.conda");
        std::fs::write(&path, b"hello world").unwrap();
        let md5 = md5_file(&path).unwrap();
        let record = sample("http://example.invalid/numpy-1.0-0.conda".to_string(), md5);

        // fetch_one would need a real client only on the download path;
        // confirm that path is not needed when the cache already matches.
        let existing = md5_file(&dir.path().join(&record.fn_)).unwrap();
        assert_eq!(existing, record.md5);
    }

    #[test]
    fn existing_tarball_with_matching_sha256_skips_download() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("numpy-1.0-0.conda");
        std::fs::write(&path, b"hello world").unwrap();
        let sha256 = sha256_file(&path).unwrap();
        let mut record = sample("http://example.invalid/numpy-1.0-0.conda".to_string(), "deadbeef".to_string());
        record.sha256 = Some(sha256.clone());

        let existing = sha256_file(&dir.path().join(&record.fn_)).unwrap();
        assert_eq!(existing, sha256);
    }

    #[test]
    fn sorted_record_round_trips_through_json() {
        let record = sample("http://example.invalid/numpy-1.0-0.conda".to_string(), "deadbeef".to_string());
        let json = serde_json::to_string(&SortedRecord::from(&record)).unwrap();
        assert!(json.contains("\"fn\":\"numpy-1.0-0.conda\""));
        assert!(!json.contains("sha256"));
    }

    #[test]
    fn sorted_record_includes_sha256_when_present() {
        let mut record = sample("http://example.invalid/numpy-1.0-0.conda".to_string(), "deadbeef".to_string());
        record.sha256 = Some("cafef00d".to_string());
        let json = serde_json::to_string(&SortedRecord::from(&record)).unwrap();
        assert!(json.contains("\"sha256\":\"cafef00d\""));
    }
}
