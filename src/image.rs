//! In-memory representation of a named, tagged image as an ordered list
//! of layers.
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
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rand::RngCore;
use serde_json::json;

use crate::tar_codec::{self, EntryFilter};

/// A tar blob plus metadata: one node in the parent chain of an
/// [`Image`].
#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    /// 64-hex-character opaque identifier.
    pub id: String,
    /// Identifier of the next layer down, or empty for the bottom layer.
    pub parent_id: String,
    /// Target architecture, e.g. `amd64`.
    pub architecture: String,
    /// Target OS, e.g. `linux`.
    pub os: String,
    /// RFC 3339 creation timestamp.
    pub created: String,
    /// Author string, often empty.
    pub author: String,
    /// Byte length of `content`.
    pub size: u64,
    /// Optional content checksum (e.g. the registry blob digest).
    pub checksum: Option<String>,
    /// Raw bytes of the layer tar.
    pub content: Vec<u8>,
    /// Docker runtime config object (`Env`, `Cmd`, `Entrypoint`, ...).
    pub config: serde_json::Value,
}

/// A named, tagged image: an ordered list of layers, head-first. For
/// `layers = [L0, L1, ..., Ln-1]`, `L_i.parent_id == L_{i+1}.id` and
/// `L_{n-1}.parent_id` is empty.
#[derive(Debug, Clone)]
pub struct Image {
    /// Repository name.
    pub name: String,
    /// Tag within the repository.
    pub tag: String,
    /// Layers, head (most recently added) first.
    pub layers: Vec<Layer>,
}

impl Image {
    /// Build an empty image with no layers.
    pub fn new(name: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tag: tag.into(),
            layers: Vec::new(),
        }
    }

    /// Read the first image described by a v1-format image tar.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .with_context(|| format!("opening `{}`", path.display()))?;
        let mut images = tar_codec::parse_v1(file)?;
        if images.is_empty() {
            anyhow::bail!("`{}` contains no images", path.display());
        }
        Ok(images.remove(0))
    }

    /// Overwrite the repository name and tag, e.g. just before emitting
    /// the final built image. The pulled image carries no name until
    /// this is called.
    pub fn set_name_and_tag(&mut self, name: impl Into<String>, tag: impl Into<String>) {
        self.name = name.into();
        self.tag = tag.into();
    }

    /// Append a layer built from a single host path.
    pub fn append_layer_from_path(
        &mut self,
        path: &Path,
        arcname: &str,
        recursive: bool,
        filter: Option<&dyn EntryFilter>,
    ) -> Result<()> {
        let content = tar_codec::write_from_path(path, arcname, recursive, filter)?;
        self.wrap(content, None);
        Ok(())
    }

    /// Append a layer built from a host-path -> archive-name map,
    /// preserving hard links between entries.
    pub fn append_layer_from_paths(
        &mut self,
        paths: &[(PathBuf, String)],
        filter: Option<&dyn EntryFilter>,
    ) -> Result<()> {
        let content = tar_codec::write_from_paths(paths, filter)?;
        self.wrap(content, None);
        Ok(())
    }

    /// Append a layer built from synthetic in-memory contents.
    pub fn append_layer_from_contents(
        &mut self,
        entries: &[(String, Vec<u8>)],
        filter: Option<&dyn EntryFilter>,
    ) -> Result<()> {
        let content = tar_codec::write_from_contents(entries, filter)?;
        self.wrap(content, None);
        Ok(())
    }

    /// Append a layer whose tar bytes have already been produced by a
    /// caller (the builder composes per-package path sets itself). Used
    /// internally in place of the path/paths/contents helpers above when
    /// the caller already holds tar bytes and, optionally, a fixed id
    /// (the per-package layering strategy derives one from package
    /// metadata rather than using a random id).
    pub fn append_raw_layer(&mut self, content: Vec<u8>, base_id: Option<String>) {
        self.wrap(content, base_id);
    }

    fn head_id(&self) -> String {
        self.layers.first().map(|l| l.id.clone()).unwrap_or_default()
    }

    fn wrap(&mut self, content: Vec<u8>, base_id: Option<String>) {
        let id = base_id.unwrap_or_else(random_layer_id);
        let layer = Layer {
            id,
            parent_id: self.head_id(),
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
            created: chrono::Utc::now().to_rfc3339(),
            author: String::new(),
            size: content.len() as u64,
            checksum: None,
            content,
            config: default_layer_config(),
        };
        self.layers.insert(0, layer);
    }
}

fn random_layer_id() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// The default layer config, emitted verbatim for interoperability with
/// the Docker image-tar format.
pub fn default_layer_config() -> serde_json::Value {
    json!({
        "Hostname": "",
        "Domainname": "",
        "User": "root",
        "AttachStdin": false,
        "AttachStdout": false,
        "AttachStderr": false,
        "Tty": false,
        "OpenStdin": false,
        "StdinOnce": false,
        "Env": ["PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin"],
        "Cmd": ["/bin/bash"],
        "Entrypoint": ["/bin/sh", "-c"],
        "Image": "",
        "Volumes": null,
        "WorkingDir": "",
        "Labels": {"CONDA_DOCKER": env!("CARGO_PKG_VERSION")},
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_maintains_parent_chain() {
        let mut image = Image::new("x", "y");
        image
            .append_layer_from_contents(&[("a".to_string(), b"1".to_vec())], None)
            .unwrap();
        image
            .append_layer_from_contents(&[("b".to_string(), b"2".to_vec())], None)
            .unwrap();
        image
            .append_layer_from_contents(&[("c".to_string(), b"3".to_vec())], None)
            .unwrap();

        assert_eq!(image.layers.len(), 3);
        for i in 0..image.layers.len() - 1 {
            assert_eq!(image.layers[i].parent_id, image.layers[i + 1].id);
        }
        assert_eq!(image.layers.last().unwrap().parent_id, "");
    }

    #[test]
    fn first_layer_in_empty_image_has_empty_parent() {
        let mut image = Image::new("x", "y");
        image
            .append_layer_from_contents(&[("a".to_string(), b"1".to_vec())], None)
            .unwrap();
        assert_eq!(image.layers[0].parent_id, "");
    }

    #[test]
    fn default_config_has_expected_fields() {
        let cfg = default_layer_config();
        assert_eq!(cfg["User"], "root");
        assert_eq!(cfg["Cmd"][0], "/bin/bash");
        assert_eq!(cfg["Entrypoint"][0], "/bin/sh");
    }
}
