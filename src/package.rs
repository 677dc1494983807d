//! Package data model: [`PackageRecord`] and [`PackageCacheRecord`].
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

use serde::{Deserialize, Serialize};

/// An immutable record of a single resolved package, as produced by the
/// resolver from either an explicit install file or a solver `LINK`
/// action.
///
/// Known fields are named explicitly; anything else the introspection
/// tool emits is kept in `extras` for forward compatibility rather than
/// silently discarded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackageRecord {
    /// The canonical origin URL the tarball was (or will be) downloaded
    /// from.
    pub url: String,
    /// Basename of the tarball, e.g. `numpy-1.26.0-py311ha4adb4c_0.conda`.
    /// Suffix is always `.tar.bz2` or `.conda`.
    #[serde(rename = "fn")]
    pub fn_: String,
    /// Lowercase hex MD5 of the tarball.
    pub md5: String,
    /// Lowercase hex SHA-256 of the tarball, when the resolver strategy
    /// that produced this record supplied one. Preferred over `md5` for
    /// integrity verification when present.
    #[serde(default)]
    pub sha256: Option<String>,
    /// Package name, e.g. `numpy`.
    pub name: String,
    /// Package version, e.g. `1.26.0`.
    pub version: String,
    /// Build string, e.g. `py311ha4adb4c_0`.
    pub build_string: String,
    /// Build number, e.g. `0`.
    pub build_number: u64,
    /// Platform tag, e.g. `linux-64`.
    pub subdir: String,
    /// Channel name or URL the package was resolved from.
    pub channel: String,
    /// Base URL of the channel (without subdir), used to locate repodata.
    pub base_url: String,
    /// Forward-compatibility bag for fields the introspection/solver tool
    /// emits that this crate doesn't model explicitly.
    #[serde(default)]
    pub extras: BTreeMap<String, String>,
}

impl PackageRecord {
    /// The distribution name: `fn_` with its package extension stripped.
    /// Uniquely determines the package.
    pub fn dist_name(&self) -> &str {
        strip_package_extension(&self.fn_)
    }
}

/// Strip a `.tar.bz2` or `.conda` suffix from a tarball filename, returning
/// the distribution name. Returns the input unchanged if neither suffix
/// matches.
pub fn strip_package_extension(fn_: &str) -> &str {
    fn_.strip_suffix(".tar.bz2")
        .or_else(|| fn_.strip_suffix(".conda"))
        .unwrap_or(fn_)
}

/// A [`PackageRecord`] extended with its on-disk cache locations, produced
/// once the fetcher has ensured the tarball is present and verified.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackageCacheRecord {
    /// The underlying resolved package identity.
    #[serde(flatten)]
    pub record: PackageRecord,
    /// Absolute local path of the downloaded tarball.
    pub tarball_path: PathBuf,
    /// Absolute local path of its expanded contents. Conventionally
    /// `tarball_path` with its extension stripped.
    pub extracted_dir: PathBuf,
}

impl PackageCacheRecord {
    /// Build a cache record for `record`, deriving `extracted_dir` from
    /// `tarball_path` the conventional way (extension stripped).
    pub fn new(record: PackageRecord, tarball_path: PathBuf) -> Self {
        let extracted_dir = {
            let file_stem = strip_package_extension(
                tarball_path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or_default(),
            );
            tarball_path
                .parent()
                .map(|p| p.join(file_stem))
                .unwrap_or_else(|| PathBuf::from(file_stem))
        };
        Self {
            record,
            tarball_path,
            extracted_dir,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PackageRecord {
        PackageRecord {
            url: "https://conda.anaconda.org/conda-forge/linux-64/numpy-1.26.0-py311h.conda"
                .to_string(),
            fn_: "numpy-1.26.0-py311h.conda".to_string(),
            md5: "deadbeef".to_string(),
            sha256: None,
            name: "numpy".to_string(),
            version: "1.26.0".to_string(),
            build_string: "py311h".to_string(),
            build_number: 0,
            subdir: "linux-64".to_string(),
            channel: "conda-forge".to_string(),
            base_url: "https://conda.anaconda.org/conda-forge".to_string(),
            extras: BTreeMap::new(),
        }
    }

    #[test]
    fn dist_name_strips_conda_extension() {
        assert_eq!(sample().dist_name(), "numpy-1.26.0-py311h");
    }

    #[test]
    fn dist_name_strips_tar_bz2_extension() {
        let mut r = sample();
        r.fn_ = "numpy-1.26.0-py311h.tar.bz2".to_string();
        assert_eq!(r.dist_name(), "numpy-1.26.0-py311h");
    }

    #[test]
    fn cache_record_derives_extracted_dir() {
        let record = PackageCacheRecord::new(sample(), PathBuf::from("/pkgs/numpy-1.26.0-py311h.conda"));
        assert_eq!(record.extracted_dir, PathBuf::from("/pkgs/numpy-1.26.0-py311h"));
    }
}
