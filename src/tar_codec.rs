//! The only code in this crate that reads or writes tar bytes.
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
use std::collections::HashMap;
use std::io::{Read, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::image::{Image, Layer};

/// A predicate applied to every tar entry a write operation considers.
/// Modeled as a plain capability with one method rather than a raw
/// closure: an entry for which `allow` returns `false` is dropped from
/// the output.
pub trait EntryFilter {
    /// Return `false` to drop `arcname` from the tar being written.
    fn allow(&self, arcname: &Path, header: &tar::Header) -> bool;
}

impl<F> EntryFilter for F
where
    F: Fn(&Path, &tar::Header) -> bool,
{
    fn allow(&self, arcname: &Path, header: &tar::Header) -> bool {
        self(arcname, header)
    }
}

/// Tar a single path (file or, if `recursive`, directory tree) rooted at
/// `arcname` in the output archive. `arcname` is trimmed of any leading
/// `/`, and if it is empty (the staging root itself, `"/"`) its own
/// directory entry is not emitted, only its descendants — tar members
/// must be relative paths.
pub fn write_from_path(
    path: &Path,
    arcname: &str,
    recursive: bool,
    filter: Option<&dyn EntryFilter>,
) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);
    let meta = std::fs::symlink_metadata(path)
        .with_context(|| format!("reading metadata of `{}`", path.display()))?;
    let arc_root = Path::new(arcname.trim_start_matches('/'));

    if recursive && meta.is_dir() {
        if arc_root != Path::new("") {
            append_entry(&mut builder, path, arc_root, filter)?;
        }
        for entry in WalkDir::new(path).min_depth(1).sort_by_file_name() {
            let entry = entry.context("walking directory tree")?;
            let rel = entry
                .path()
                .strip_prefix(path)
                .expect("walkdir entries are under the walked root");
            let arc = arc_root.join(rel);
            append_entry(&mut builder, entry.path(), &arc, filter)?;
        }
    } else {
        append_entry(&mut builder, path, arc_root, filter)?;
    }

    builder.into_inner().context("finishing tar stream")
}

/// Tar multiple host paths under their mapped archive names, preserving
/// the order of `paths` (callers choose an ordering; this crate always
/// passes insertion order). Host paths sharing device+inode are written
/// only once; later occurrences become POSIX hard-link entries pointing
/// at the first archive name that owned that inode. Each entry is
/// non-recursive: callers must include every directory they want
/// present.
pub fn write_from_paths(
    paths: &[(PathBuf, String)],
    filter: Option<&dyn EntryFilter>,
) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);
    let mut seen_inodes: HashMap<(u64, u64), PathBuf> = HashMap::new();

    for (host_path, arcname) in paths {
        let meta = std::fs::symlink_metadata(host_path)
            .with_context(|| format!("reading metadata of `{}`", host_path.display()))?;
        let arc_path = Path::new(arcname.trim_start_matches('/'));

        if let Some(header) = build_header(host_path, &meta)? {
            if let Some(filter) = filter {
                if !filter.allow(arc_path, &header) {
                    continue;
                }
            }
        }

        if meta.is_file() && meta.nlink() > 1 {
            let inode_key = (meta.dev(), meta.ino());
            if let Some(first_arc_path) = seen_inodes.get(&inode_key) {
                let mut header = tar::Header::new_gnu();
                header.set_metadata(&meta);
                header.set_entry_type(tar::EntryType::Link);
                header.set_size(0);
                header.set_cksum();
                builder
                    .append_link(&mut header, arc_path, first_arc_path)
                    .with_context(|| format!("writing hardlink entry for `{}`", arcname))?;
                continue;
            }
            seen_inodes.insert(inode_key, arc_path.to_path_buf());
        }

        append_entry(&mut builder, host_path, arc_path, filter)?;
    }

    builder.into_inner().context("finishing tar stream")
}

/// Tar synthetic in-memory contents: every entry is a regular file of
/// mode `0o644` sized to its bytes, subject to the same entry filter the
/// path-based writers accept.
pub fn write_from_contents(
    entries: &[(String, Vec<u8>)],
    filter: Option<&dyn EntryFilter>,
) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, content) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        let arc_path = Path::new(name.trim_start_matches('/'));
        if let Some(filter) = filter {
            if !filter.allow(arc_path, &header) {
                continue;
            }
        }
        builder
            .append_data(&mut header, arc_path, content.as_slice())
            .with_context(|| format!("writing synthetic entry `{}`", name))?;
    }
    builder.into_inner().context("finishing tar stream")
}

fn append_entry<W: Write>(
    builder: &mut tar::Builder<W>,
    host_path: &Path,
    arc_path: &Path,
    filter: Option<&dyn EntryFilter>,
) -> Result<()> {
    let meta = std::fs::symlink_metadata(host_path)
        .with_context(|| format!("reading metadata of `{}`", host_path.display()))?;

    if let Some(header) = build_header(host_path, &meta)? {
        if let Some(filter) = filter {
            if !filter.allow(arc_path, &header) {
                return Ok(());
            }
        }
    }

    if meta.file_type().is_symlink() {
        let target = std::fs::read_link(host_path)
            .with_context(|| format!("reading symlink `{}`", host_path.display()))?;
        let mut header = tar::Header::new_gnu();
        header.set_metadata(&meta);
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        header.set_cksum();
        builder
            .append_link(&mut header, arc_path, &target)
            .with_context(|| format!("writing symlink entry `{}`", arc_path.display()))?;
    } else if meta.is_dir() {
        let mut header = tar::Header::new_gnu();
        header.set_metadata(&meta);
        header.set_entry_type(tar::EntryType::Directory);
        header.set_size(0);
        header.set_cksum();
        builder
            .append_data(&mut header, arc_path, std::io::empty())
            .with_context(|| format!("writing directory entry `{}`", arc_path.display()))?;
    } else {
        let mut header = tar::Header::new_gnu();
        header.set_metadata(&meta);
        header.set_size(meta.len());
        header.set_cksum();
        let mut file = std::fs::File::open(host_path)
            .with_context(|| format!("opening `{}`", host_path.display()))?;
        builder
            .append_data(&mut header, arc_path, &mut file)
            .with_context(|| format!("writing file entry `{}`", arc_path.display()))?;
    }
    Ok(())
}

fn build_header(_host_path: &Path, meta: &std::fs::Metadata) -> Result<Option<tar::Header>> {
    let mut header = tar::Header::new_gnu();
    header.set_metadata(meta);
    Ok(Some(header))
}

/// On-disk metadata JSON for one layer directory's `json` file.
/// `config` and `container_config` are intentionally identical, matching
/// the v1 format for interoperability.
#[derive(Debug, Serialize, Deserialize)]
struct LayerMeta {
    id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent: Option<String>,
    architecture: String,
    os: String,
    created: String,
    author: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    checksum: Option<String>,
    size: u64,
    config: serde_json::Value,
    container_config: serde_json::Value,
}

/// Write `image` in the v1 image-tar format: a `repositories` index
/// followed by one `<id>/{VERSION,layer.tar,json}` directory per layer.
pub fn write_v1<W: Write>(image: &Image, writer: W) -> Result<()> {
    let mut builder = tar::Builder::new(writer);

    let head_id = image.layers.first().map(|l| l.id.clone()).unwrap_or_default();
    let mut tags = std::collections::BTreeMap::new();
    tags.insert(image.tag.clone(), head_id);
    let mut repos = std::collections::BTreeMap::new();
    repos.insert(image.name.clone(), tags);
    let repos_bytes = serde_json::to_vec(&repos).context("serializing repositories index")?;
    append_bytes(&mut builder, "repositories", &repos_bytes, 0o644)?;

    for layer in &image.layers {
        let dir = &layer.id;
        append_bytes(&mut builder, &format!("{dir}/VERSION"), b"1.0", 0o644)?;
        append_bytes(&mut builder, &format!("{dir}/layer.tar"), &layer.content, 0o644)?;
        let meta = LayerMeta {
            id: layer.id.clone(),
            parent: if layer.parent_id.is_empty() {
                None
            } else {
                Some(layer.parent_id.clone())
            },
            architecture: layer.architecture.clone(),
            os: layer.os.clone(),
            created: layer.created.clone(),
            author: layer.author.clone(),
            checksum: layer.checksum.clone(),
            size: layer.size,
            config: layer.config.clone(),
            container_config: layer.config.clone(),
        };
        let meta_bytes = serde_json::to_vec_pretty(&meta)
            .with_context(|| format!("serializing metadata for layer `{dir}`"))?;
        append_bytes(&mut builder, &format!("{dir}/json"), &meta_bytes, 0o644)?;
    }

    builder.into_inner().context("finishing v1 image tar")?;
    Ok(())
}

fn append_bytes<W: Write>(
    builder: &mut tar::Builder<W>,
    name: &str,
    content: &[u8],
    mode: u32,
) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(mode);
    header.set_cksum();
    builder
        .append_data(&mut header, name, content)
        .with_context(|| format!("writing `{}`", name))
}

/// Parse a v1-format image tar, returning every (name, tag) image it
/// describes. Fails with a descriptive error on a missing
/// `repositories` index, a dangling parent reference, or a missing
/// `layer.tar`/`json` pair.
pub fn parse_v1<R: Read>(reader: R) -> Result<Vec<Image>> {
    let mut archive = tar::Archive::new(reader);
    let mut entries: HashMap<String, Vec<u8>> = HashMap::new();
    for entry in archive.entries().context("reading v1 image tar")? {
        let mut entry = entry.context("reading tar entry")?;
        let path = entry
            .path()
            .context("reading tar entry path")?
            .to_string_lossy()
            .into_owned();
        let mut buf = Vec::new();
        entry
            .read_to_end(&mut buf)
            .with_context(|| format!("reading tar entry `{}`", path))?;
        entries.insert(path, buf);
    }

    let repos_bytes = entries
        .get("repositories")
        .context("v1 image tar is missing `repositories`")?;
    let repos: std::collections::BTreeMap<String, std::collections::BTreeMap<String, String>> =
        serde_json::from_slice(repos_bytes).context("parsing `repositories`")?;

    let mut images = Vec::new();
    for (name, tags) in &repos {
        for (tag, head_id) in tags {
            let mut layers = Vec::new();
            let mut current = head_id.clone();
            while !current.is_empty() {
                let json_key = format!("{current}/json");
                let meta_bytes = entries
                    .get(&json_key)
                    .with_context(|| format!("v1 image tar is missing `{json_key}`"))?;
                let meta: LayerMeta =
                    serde_json::from_slice(meta_bytes).with_context(|| format!("parsing `{json_key}`"))?;
                let layer_key = format!("{current}/layer.tar");
                let content = entries
                    .get(&layer_key)
                    .with_context(|| format!("v1 image tar is missing `{layer_key}`"))?
                    .clone();
                let parent = meta.parent.clone().unwrap_or_default();
                layers.push(Layer {
                    id: meta.id,
                    parent_id: parent.clone(),
                    architecture: meta.architecture,
                    os: meta.os,
                    created: meta.created,
                    author: meta.author,
                    size: content.len() as u64,
                    checksum: meta.checksum,
                    content,
                    config: meta.config,
                });
                current = parent;
            }
            images.push(Image {
                name: name.clone(),
                tag: tag.clone(),
                layers,
            });
        }
    }
    Ok(images)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::Image;

    #[test]
    fn write_from_path_roots_at_slash_without_absolute_or_root_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("opt/conda")).unwrap();
        std::fs::write(dir.path().join("opt/conda/file"), b"x").unwrap();

        let bytes = write_from_path(dir.path(), "/", true, None).unwrap();
        let mut archive = tar::Archive::new(bytes.as_slice());
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();

        assert!(!names.iter().any(|n| n.is_empty() || n == "/"));
        assert!(names.iter().all(|n| !n.starts_with('/')));
        assert!(names.contains(&"opt/conda/file".to_string()));
    }

    #[test]
    fn write_from_contents_round_trips_a_single_entry() {
        let mut entries = Vec::new();
        entries.push(("a".to_string(), b"x".to_vec()));
        let bytes = write_from_contents(&entries, None).unwrap();
        let mut archive = tar::Archive::new(bytes.as_slice());
        let mut found = Vec::new();
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            found.push((
                entry.path().unwrap().to_string_lossy().into_owned(),
                entry.header().size().unwrap(),
            ));
        }
        assert_eq!(found, vec![("a".to_string(), 1)]);
    }

    #[test]
    fn write_from_paths_dedupes_hardlinked_inodes() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        std::fs::write(&a, b"hi").unwrap();
        let b = dir.path().join("b");
        std::fs::hard_link(&a, &b).unwrap();

        let paths = vec![(a.clone(), "/a".to_string()), (b.clone(), "/b".to_string())];
        let bytes = write_from_paths(&paths, None).unwrap();
        let mut archive = tar::Archive::new(bytes.as_slice());
        let entries: Vec<_> = archive
            .entries()
            .unwrap()
            .map(|e| {
                let e = e.unwrap();
                (
                    e.header().entry_type(),
                    e.path().unwrap().to_string_lossy().into_owned(),
                    e.link_name().unwrap().map(|p| p.to_string_lossy().into_owned()),
                )
            })
            .collect();
        assert_eq!(entries[0].0, tar::EntryType::Regular);
        assert_eq!(entries[0].1, "a");
        assert_eq!(entries[1].0, tar::EntryType::Link);
        assert_eq!(entries[1].1, "b");
        // The hard-link target must name a member that actually exists in
        // the archive (the first, untrimmed-slash regression pointed at
        // `/a`, which matches nothing).
        assert_eq!(entries[1].2.as_deref(), Some("a"));
    }

    #[test]
    fn parse_v1_round_trips_write_v1() {
        let mut image = Image::new("empty", "v1");
        let mut entries = Vec::new();
        entries.push(("a".to_string(), b"x".to_vec()));
        image.append_layer_from_contents(&entries, None).unwrap();

        let mut buf = Vec::new();
        write_v1(&image, &mut buf).unwrap();
        let mut images = parse_v1(buf.as_slice()).unwrap();
        assert_eq!(images.len(), 1);
        let parsed = images.remove(0);
        assert_eq!(parsed.name, "empty");
        assert_eq!(parsed.tag, "v1");
        assert_eq!(parsed.layers.len(), 1);
        assert_eq!(parsed.layers[0].id, image.layers[0].id);
        assert_eq!(parsed.layers[0].parent_id, "");
        assert_eq!(parsed.layers[0].config, image.layers[0].config);
    }

    #[test]
    fn write_v1_of_empty_image_has_blank_head_id() {
        let image = Image::new("empty", "v1");
        let mut buf = Vec::new();
        write_v1(&image, &mut buf).unwrap();
        let images = parse_v1(buf.as_slice()).unwrap();
        assert_eq!(images.len(), 1);
        assert!(images[0].layers.is_empty());
    }
}
