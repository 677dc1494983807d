//! HTTPS client that pulls a base image's layers from a remote
//! Docker/OCI registry without the Docker daemon.
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
use std::io::Read;

use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::Value;

use crate::config::BuildConfig;
use crate::image::{Image, Layer};

/// Bearer-token-authenticated client for one registry, built once per
/// build from [`BuildConfig::registry`].
pub struct Registry<'a> {
    cfg: &'a BuildConfig,
    client: Client,
}

impl<'a> Registry<'a> {
    /// Build a client honoring the configured timeouts, proxy and TLS
    /// verification settings.
    pub fn new(cfg: &'a BuildConfig) -> Result<Self> {
        let mut builder = Client::builder()
            .connect_timeout(cfg.connect_timeout)
            .timeout(cfg.read_timeout)
            .danger_accept_invalid_certs(cfg.insecure_skip_tls_verify);
        if let Some(proxy) = &cfg.https_proxy {
            builder = builder.proxy(reqwest::Proxy::https(proxy)?);
        }
        let client = builder.build().context("building registry HTTP client")?;
        Ok(Self { cfg, client })
    }

    /// Pull `image:tag`, returning an [`Image`] whose layers mirror the
    /// manifest order (index 0 = topmost). `scratch` is special-cased to
    /// an empty-layered image with no network I/O.
    pub fn pull(&self, image: &str, tag: &str) -> Result<Image> {
        if image == "scratch" {
            return Ok(Image::new(String::new(), String::new()));
        }

        let token = self.fetch_token(image)?;
        let manifest = self.fetch_manifest(image, tag, &token)?;
        self.build_image(image, tag, manifest, &token)
    }

    fn fetch_token(&self, image: &str) -> Result<String> {
        let mut req = self
            .client
            .get(&self.cfg.registry.token_url)
            .query(&[("scope", format!("repository:{image}:pull"))]);
        if let Some(username) = &self.cfg.registry.username {
            req = req.basic_auth(username, self.cfg.registry.password.as_ref());
        }
        let resp = req
            .send()
            .with_context(|| format!("GET {}", self.cfg.registry.token_url))?;
        if !resp.status().is_success() {
            bail!(
                "GET {} returned {}",
                self.cfg.registry.token_url,
                resp.status()
            );
        }
        let body: Value = resp.json().context("parsing token response")?;
        body.get("token")
            .or_else(|| body.get("access_token"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .context("token response had no `token` field")
    }

    fn fetch_manifest(&self, image: &str, tag: &str, token: &str) -> Result<Schema1Manifest> {
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.cfg.registry.registry_url, image, tag
        );
        let resp = self
            .client
            .get(&url)
            .bearer_auth(token)
            .send()
            .with_context(|| format!("GET {url}"))?;
        if !resp.status().is_success() {
            bail!("GET {} returned {}", url, resp.status());
        }
        resp.json().with_context(|| format!("parsing manifest from {url}"))
    }

    fn build_image(
        &self,
        image: &str,
        tag: &str,
        manifest: Schema1Manifest,
        token: &str,
    ) -> Result<Image> {
        if manifest.fs_layers.len() != manifest.history.len() {
            bail!(
                "MalformedManifest: `{}`/`{}` has {} fsLayers but {} history entries",
                image,
                tag,
                manifest.fs_layers.len(),
                manifest.history.len()
            );
        }

        let mut layers = Vec::with_capacity(manifest.fs_layers.len());
        for (fs_layer, history) in manifest.fs_layers.iter().zip(manifest.history.iter()) {
            let compat: V1Compatibility = serde_json::from_str(&history.v1_compatibility)
                .context("parsing `v1Compatibility`")?;
            let content = self.fetch_blob(image, &fs_layer.blob_sum, token)?;
            let config = compat
                .config
                .or(compat.container_config)
                .unwrap_or(Value::Null);
            layers.push(Layer {
                id: compat.id,
                parent_id: compat.parent.unwrap_or_default(),
                architecture: compat.architecture.unwrap_or_default(),
                os: compat.os.unwrap_or_default(),
                created: compat.created.unwrap_or_default(),
                author: compat.author.unwrap_or_default(),
                size: content.len() as u64,
                checksum: Some(fs_layer.blob_sum.clone()),
                content,
                config,
            });
        }

        for pair in layers.windows(2) {
            if pair[0].parent_id != pair[1].id {
                bail!(
                    "MalformedManifest: layer `{}`'s parent `{}` does not match the next layer's id `{}`",
                    pair[0].id,
                    pair[0].parent_id,
                    pair[1].id
                );
            }
        }

        Ok(Image {
            name: image.to_string(),
            tag: tag.to_string(),
            layers,
        })
    }

    fn fetch_blob(&self, image: &str, digest: &str, token: &str) -> Result<Vec<u8>> {
        let url = format!(
            "{}/v2/{}/blobs/{}",
            self.cfg.registry.registry_url, image, digest
        );
        let resp = self
            .client
            .get(&url)
            .bearer_auth(token)
            .send()
            .with_context(|| format!("GET {url}"))?;
        if !resp.status().is_success() {
            bail!("GET {} returned {}", url, resp.status());
        }
        let gz_bytes = resp.bytes().with_context(|| format!("reading body of {url}"))?;
        let mut decoder = GzDecoder::new(gz_bytes.as_ref());
        let mut content = Vec::new();
        decoder
            .read_to_end(&mut content)
            .with_context(|| format!("gunzipping blob `{digest}`"))?;
        Ok(content)
    }
}

#[derive(Debug, Deserialize)]
struct Schema1Manifest {
    #[serde(rename = "fsLayers")]
    fs_layers: Vec<FsLayer>,
    history: Vec<HistoryEntry>,
}

#[derive(Debug, Deserialize)]
struct FsLayer {
    #[serde(rename = "blobSum")]
    blob_sum: String,
}

#[derive(Debug, Deserialize)]
struct HistoryEntry {
    #[serde(rename = "v1Compatibility")]
    v1_compatibility: String,
}

#[derive(Debug, Deserialize)]
struct V1Compatibility {
    id: String,
    #[serde(default)]
    parent: Option<String>,
    #[serde(default)]
    architecture: Option<String>,
    #[serde(default)]
    os: Option<String>,
    #[serde(default)]
    created: Option<String>,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    config: Option<Value>,
    #[serde(default)]
    container_config: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scratch_pulls_without_network_io() {
        let cfg = BuildConfig::default();
        let registry = Registry::new(&cfg).unwrap();
        let image = registry.pull("scratch", "latest").unwrap();
        assert!(image.layers.is_empty());
    }
}
