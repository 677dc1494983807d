//! Produces the ordered package closure by one of three strategies:
//! introspecting an existing environment, solving package specs, or
//! accepting precomputed records directly.
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
use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use log::{debug, warn};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde_json::Value;

use crate::config::BuildConfig;
use crate::external::{CondaExe, EnvironmentRef};
use crate::package::PackageRecord;

/// How the package closure for this build was specified.
pub enum ResolveSource {
    /// `-n`/`-p`: introspect an existing environment (strategy a).
    Environment(EnvironmentRef),
    /// Positional package specs: ask the solver for a fresh closure
    /// (strategy b).
    Specs(Vec<String>),
    /// Precomputed records, bypassing resolution entirely (strategy c,
    /// used by tests).
    Direct(Vec<PackageRecord>),
}

/// Resolve `source` into an ordered package closure. Ordering matches
/// the explicit-file order (strategy a) or the solver's `LINK` order
/// (strategy b); both are authoritative and preserved downstream.
pub fn resolve(
    cfg: &BuildConfig,
    conda: &dyn CondaExe,
    source: &ResolveSource,
) -> Result<Vec<PackageRecord>> {
    match source {
        ResolveSource::Environment(env) => resolve_from_environment(conda, env),
        ResolveSource::Specs(specs) => resolve_from_specs(cfg, conda, specs),
        ResolveSource::Direct(records) => Ok(records.clone()),
    }
}

fn resolve_from_environment(
    conda: &dyn CondaExe,
    env: &EnvironmentRef,
) -> Result<Vec<PackageRecord>> {
    let by_dist = conda
        .list_json(env)?
        .into_iter()
        .map(|entry| (entry.dist_name.clone(), entry))
        .collect::<BTreeMap<_, _>>();

    let explicit = conda.list_explicit(env)?;
    let mut records = Vec::new();
    for line in explicit.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('@') {
            continue;
        }
        let (url, md5) = line
            .rsplit_once('#')
            .with_context(|| format!("explicit line `{line}` is missing an `#md5` suffix"))?;
        let fn_ = url
            .rsplit('/')
            .next()
            .with_context(|| format!("explicit line `{line}` has no path segment"))?
            .to_string();
        let dist_name = crate::package::strip_package_extension(&fn_).to_string();
        let entry = by_dist.get(&dist_name).with_context(|| {
            format!("`{dist_name}` is in the explicit install list but missing from `list --json`")
        })?;
        records.push(PackageRecord {
            url: url.to_string(),
            fn_,
            md5: md5.to_lowercase(),
            sha256: None,
            name: entry.name.clone(),
            version: entry.version.clone(),
            build_string: entry.build_string.clone(),
            build_number: entry.build_number,
            subdir: entry.platform.clone(),
            channel: entry.channel.clone(),
            base_url: entry.base_url.clone(),
            extras: BTreeMap::new(),
        });
    }
    Ok(records)
}

fn resolve_from_specs(
    cfg: &BuildConfig,
    conda: &dyn CondaExe,
    specs: &[String],
) -> Result<Vec<PackageRecord>> {
    let scratch = tempfile::tempdir().context("creating scratch solve prefix")?;
    let solved = conda.solve(scratch.path(), specs)?;
    let mut cache = RepodataCache::new(cfg)?;
    let mut records = Vec::with_capacity(solved.actions.link.len());

    for action in solved.actions.link {
        let repodata = cache.get(cfg, &action.base_url, &action.platform)?;
        let candidates = [
            format!(
                "{}-{}-{}.tar.bz2",
                action.name, action.version, action.build_string
            ),
            format!(
                "{}-{}-{}.conda",
                action.name, action.version, action.build_string
            ),
        ];
        let md5 = find_md5(&repodata, &candidates)
            .with_context(|| {
                format!(
                    "`{}` resolved by the solver but not found in `{}`'s repodata",
                    action.dist_name, action.base_url
                )
            })?;
        let fn_ = candidates
            .into_iter()
            .find(|c| repodata_has(&repodata, c))
            .expect("find_md5 succeeded above");
        let sha256 = find_sha256(&repodata, std::slice::from_ref(&fn_));

        records.push(PackageRecord {
            url: format!("{}/{}/{}", action.base_url, action.platform, fn_),
            fn_,
            md5,
            sha256,
            name: action.name,
            version: action.version,
            build_string: action.build_string,
            build_number: action.build_number,
            subdir: action.platform,
            channel: action.channel,
            base_url: action.base_url,
            extras: BTreeMap::new(),
        });
    }
    Ok(records)
}

fn repodata_has(repodata: &Value, fn_: &str) -> bool {
    ["packages", "packages.conda"]
        .iter()
        .filter_map(|key| repodata.get(key).and_then(Value::as_object))
        .any(|map| map.contains_key(fn_))
}

fn find_md5(repodata: &Value, candidates: &[String]) -> Option<String> {
    for key in ["packages", "packages.conda"] {
        let Some(map) = repodata.get(key).and_then(Value::as_object) else {
            continue;
        };
        for candidate in candidates {
            if let Some(md5) = map
                .get(candidate)
                .and_then(|meta| meta.get("md5"))
                .and_then(Value::as_str)
            {
                return Some(md5.to_string());
            }
        }
    }
    None
}

/// Repodata entries occasionally carry a `sha256` alongside `md5`;
/// prefer it for verification when present.
fn find_sha256(repodata: &Value, candidates: &[String]) -> Option<String> {
    for key in ["packages", "packages.conda"] {
        let Some(map) = repodata.get(key).and_then(Value::as_object) else {
            continue;
        };
        for candidate in candidates {
            if let Some(sha256) = map
                .get(candidate)
                .and_then(|meta| meta.get("sha256"))
                .and_then(Value::as_str)
            {
                return Some(sha256.to_string());
            }
        }
    }
    None
}

/// Per-channel repodata, fetched once and reused across every record the
/// solver resolved from that channel+subdir. Honors `ETag`/`Last-Modified`
/// conditional GET on repeat runs.
struct RepodataCache {
    client: Client,
    cache_dir: PathBuf,
    memo: BTreeMap<String, Value>,
}

impl RepodataCache {
    fn new(cfg: &BuildConfig) -> Result<Self> {
        let mut builder = Client::builder()
            .connect_timeout(cfg.connect_timeout)
            .timeout(cfg.read_timeout)
            .danger_accept_invalid_certs(cfg.insecure_skip_tls_verify);
        if let Some(proxy) = &cfg.https_proxy {
            builder = builder.proxy(reqwest::Proxy::https(proxy)?);
        }
        let client = builder.build().context("building HTTP client")?;
        let cache_dir = std::env::temp_dir().join("conda-docker-repodata-cache");
        std::fs::create_dir_all(&cache_dir)
            .with_context(|| format!("creating `{}`", cache_dir.display()))?;
        Ok(Self {
            client,
            cache_dir,
            memo: BTreeMap::new(),
        })
    }

    fn get(&mut self, cfg: &BuildConfig, base_url: &str, subdir: &str) -> Result<Value> {
        let key = format!("{base_url}/{subdir}");
        if let Some(v) = self.memo.get(&key) {
            return Ok(v.clone());
        }

        let url = format!("{base_url}/{subdir}/repodata.json");
        let cache_path = self.cache_dir.join(cache_file_name(&key));
        let cached: Option<Value> = std::fs::read(&cache_path)
            .ok()
            .and_then(|b| serde_json::from_slice(&b).ok());

        let mut req = self.client.get(&url);
        if let Some(cached) = &cached {
            if let Some(etag) = cached.get("_etag").and_then(Value::as_str) {
                req = req.header(reqwest::header::IF_NONE_MATCH, etag);
            }
            if let Some(last_mod) = cached.get("_mod").and_then(Value::as_str) {
                req = req.header(reqwest::header::IF_MODIFIED_SINCE, last_mod);
            }
        }
        let resp = req.send().with_context(|| format!("GET {url}"))?;
        let is_noarch = subdir == "noarch";

        let value = match resp.status() {
            StatusCode::NOT_MODIFIED => {
                debug!("repodata `{url}` unchanged (304, ContentUnchanged)");
                cached.context("304 Not Modified but no cached repodata on disk")?
            }
            status if status.is_success() => {
                let etag = resp
                    .headers()
                    .get(reqwest::header::ETAG)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                let last_mod = resp
                    .headers()
                    .get(reqwest::header::LAST_MODIFIED)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                let mut value: Value = resp
                    .json()
                    .with_context(|| format!("parsing repodata from {url}"))?;
                if let Value::Object(ref mut map) = value {
                    if let Some(etag) = etag {
                        map.insert("_etag".into(), Value::String(etag));
                    }
                    if let Some(last_mod) = last_mod {
                        map.insert("_mod".into(), Value::String(last_mod));
                    }
                }
                if let Ok(bytes) = serde_json::to_vec(&value) {
                    let _ = std::fs::write(&cache_path, bytes);
                }
                value
            }
            StatusCode::FORBIDDEN | StatusCode::NOT_FOUND if !is_noarch => {
                warn!(
                    "repodata `{url}` returned {}; treating channel subdir as empty",
                    resp.status()
                );
                Value::Object(Default::default())
            }
            StatusCode::FORBIDDEN | StatusCode::NOT_FOUND
                if is_noarch && cfg.allow_non_channel_urls =>
            {
                warn!(
                    "repodata `{url}` returned {}; continuing because non-channel URLs are allowed",
                    resp.status()
                );
                Value::Object(Default::default())
            }
            status if status.as_u16() >= 500 => {
                bail!("GET {url} returned {status}; transient server error, retry the build")
            }
            status => bail!("GET {url} returned {status}"),
        };

        self.memo.insert(key, value.clone());
        Ok(value)
    }
}

fn cache_file_name(key: &str) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    format!("{:016x}.json", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::CondaListEntry;

    #[test]
    fn parses_explicit_lines_and_joins_on_dist_name() {
        let by_dist = vec![CondaListEntry {
            base_url: "https://conda.anaconda.org/conda-forge".to_string(),
            build_number: 0,
            build_string: "h123".to_string(),
            channel: "conda-forge".to_string(),
            dist_name: "numpy-1.26.0-h123".to_string(),
            name: "numpy".to_string(),
            platform: "linux-64".to_string(),
            version: "1.26.0".to_string(),
        }]
        .into_iter()
        .map(|e| (e.dist_name.clone(), e))
        .collect::<BTreeMap<_, _>>();

        let explicit = "# comment\n@EXPLICIT\nhttps://conda.anaconda.org/conda-forge/linux-64/numpy-1.26.0-h123.conda#deadbeef\n\n";

        let mut records = Vec::new();
        for line in explicit.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('@') {
                continue;
            }
            let (url, md5) = line.rsplit_once('#').unwrap();
            let fn_ = url.rsplit('/').next().unwrap().to_string();
            let dist_name = crate::package::strip_package_extension(&fn_).to_string();
            let entry = by_dist.get(&dist_name).unwrap();
            records.push((url.to_string(), md5.to_string(), entry.name.clone()));
        }
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].1, "deadbeef");
        assert_eq!(records[0].2, "numpy");
    }

    #[test]
    fn find_md5_checks_both_package_keys() {
        let repodata = serde_json::json!({
            "packages": {"a-1.0-0.tar.bz2": {"md5": "aaa"}},
            "packages.conda": {"a-1.0-0.conda": {"md5": "bbb"}},
        });
        assert_eq!(
            find_md5(&repodata, &["a-1.0-0.conda".to_string()]),
            Some("bbb".to_string())
        );
        assert_eq!(
            find_md5(&repodata, &["a-1.0-0.tar.bz2".to_string()]),
            Some("aaa".to_string())
        );
    }
}
