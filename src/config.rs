//! Process-wide build configuration.
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
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// One of the two layering strategies the builder can use, see
/// [`crate::builder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LayeringStrategy {
    /// One layer per package (up to `max_package_layers`), plus a catch-all
    /// layer for everything else.
    Layered,
    /// A single layer containing the whole staged environment.
    Single,
}

impl Default for LayeringStrategy {
    fn default() -> Self {
        Self::Layered
    }
}

/// A URL-prefix rewrite rule applied only to image-visible catalog files
/// (`urls`, `urls.txt`, `repodata_record.json`). The local
/// [`crate::package::PackageRecord::url`] is never mutated.
#[derive(Debug, Clone)]
pub struct ChannelRemap {
    /// The URL prefix to match.
    pub src: String,
    /// The URL prefix to substitute.
    pub dst: String,
}

impl ChannelRemap {
    /// Rewrite `url` if it starts with `self.src`, otherwise return it
    /// unchanged.
    pub fn apply(&self, url: &str) -> String {
        match url.strip_prefix(self.src.as_str()) {
            Some(rest) => format!("{}{}", self.dst, rest),
            None => url.to_string(),
        }
    }
}

/// Apply a list of remaps in order, returning the first one that matches.
pub fn apply_remaps(remaps: &[ChannelRemap], url: &str) -> String {
    for remap in remaps {
        let rewritten = remap.apply(url);
        if rewritten != url {
            return rewritten;
        }
    }
    url.to_string()
}

/// Registry connection settings, overridable via environment variables so
/// that private/mirrored registries can be used without a flag for every
/// field.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Base URL of the registry's v2 API, e.g. `https://registry-1.docker.io`.
    pub registry_url: String,
    /// Base URL of the token service, e.g.
    /// `https://auth.docker.io/token?service=registry.docker.io`.
    pub token_url: String,
    /// Optional basic-auth username for the token request.
    pub username: Option<String>,
    /// Optional basic-auth password for the token request.
    pub password: Option<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            registry_url: env::var("CONDA_DOCKER_REGISTRY_URL")
                .unwrap_or_else(|_| "https://registry-1.docker.io".to_string()),
            token_url: env::var("CONDA_DOCKER_REGISTRY_TOKEN_URL").unwrap_or_else(|_| {
                "https://auth.docker.io/token?service=registry.docker.io".to_string()
            }),
            username: env::var("CONDA_DOCKER_REGISTRY_USERNAME").ok(),
            password: env::var("CONDA_DOCKER_REGISTRY_PASSWORD").ok(),
        }
    }
}

/// Top-level configuration threaded explicitly through the resolver,
/// fetcher and builder. Built once in `main` and passed by reference
/// rather than held in any mutable singleton.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Registry connection settings for pulling the base image.
    pub registry: RegistryConfig,
    /// Path to the conda/mamba-compatible introspection and solver tool.
    /// Auto-detected from `PATH` (or `CONDA_EXE`) when not set explicitly.
    pub conda_exe: Option<PathBuf>,
    /// Override for the solver tool, if it differs from `conda_exe`.
    pub solver_exe: Option<PathBuf>,
    /// Layering strategy for the builder.
    pub layering_strategy: LayeringStrategy,
    /// Maximum number of per-package layers the `Layered` strategy will
    /// create before the remainder rolls into the catch-all layer.
    pub max_package_layers: usize,
    /// URL-prefix remaps applied to image-visible catalog files.
    pub channel_remaps: Vec<ChannelRemap>,
    /// Whether non-channel (arbitrary host) URLs are permitted for
    /// `noarch` repodata lookups that 403/404.
    pub allow_non_channel_urls: bool,
    /// HTTP connect timeout for every network call the pipeline makes.
    pub connect_timeout: Duration,
    /// HTTP read timeout for every network call the pipeline makes.
    pub read_timeout: Duration,
    /// Disable TLS certificate verification. Off by default; exists for
    /// talking to internal mirrors with self-signed certificates.
    pub insecure_skip_tls_verify: bool,
    /// `HTTPS_PROXY`-style proxy, applied to every outbound request the
    /// resolver and fetcher make.
    pub https_proxy: Option<String>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            conda_exe: env::var_os("CONDA_EXE").map(PathBuf::from),
            solver_exe: None,
            layering_strategy: LayeringStrategy::default(),
            max_package_layers: 100,
            channel_remaps: Vec::new(),
            allow_non_channel_urls: false,
            connect_timeout: Duration::from_millis(9150),
            read_timeout: Duration::from_secs(60),
            insecure_skip_tls_verify: false,
            https_proxy: env::var("HTTPS_PROXY")
                .or_else(|_| env::var("https_proxy"))
                .ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remap_rewrites_matching_prefix() {
        let remap = ChannelRemap {
            src: "https://a/".to_string(),
            dst: "https://b/".to_string(),
        };
        assert_eq!(
            remap.apply("https://a/linux-64/foo.conda"),
            "https://b/linux-64/foo.conda"
        );
        assert_eq!(remap.apply("https://other/x"), "https://other/x");
    }

    #[test]
    fn apply_remaps_first_match_wins() {
        let remaps = vec![
            ChannelRemap {
                src: "https://a/".into(),
                dst: "https://b/".into(),
            },
            ChannelRemap {
                src: "https://a/sub/".into(),
                dst: "https://c/".into(),
            },
        ];
        assert_eq!(
            apply_remaps(&remaps, "https://a/sub/pkg.conda"),
            "https://b/sub/pkg.conda"
        );
    }
}
