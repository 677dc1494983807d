#![deny(missing_docs)]
//! Builds container images containing an installed conda package
//! environment, without invoking the Docker daemon.
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
use std::time::Instant;

use anyhow::{bail, Context, Result};

pub mod builder;
pub mod cli;
pub mod config;
pub mod external;
pub mod fetcher;
pub mod hashing;
pub mod image;
pub mod package;
pub mod registry;
pub mod resolver;
pub mod tar_codec;
pub mod write;

use builder::BuildInputs;
use cli::Command;
use config::BuildConfig;
use external::{EnvironmentRef, Installer, SandboxInstaller};
use resolver::ResolveSource;

/// Run conda-docker
pub fn main(command: Command) -> Result<()> {
    match command {
        Command::Build {
            base,
            image,
            prefix,
            name,
            conda_exe,
            output,
            solver,
            layering_strategy,
            label,
            insecure_skip_tls_verify,
            specs,
        } => {
            let now = Instant::now();

            let source = match (prefix, name, specs.is_empty()) {
                (Some(prefix), None, _) => ResolveSource::Environment(EnvironmentRef::Prefix(prefix)),
                (None, Some(name), _) => ResolveSource::Environment(EnvironmentRef::Name(name)),
                (None, None, false) => ResolveSource::Specs(specs),
                (None, None, true) => {
                    bail!("no source given: pass --prefix, --name, or one or more package specs")
                }
                (Some(_), Some(_), _) => unreachable!("clap enforces --prefix/--name are mutually exclusive"),
            };

            let mut cfg = BuildConfig {
                layering_strategy,
                insecure_skip_tls_verify,
                ..BuildConfig::default()
            };
            cfg.conda_exe = Some(external::locate_conda_exe(conda_exe.as_deref())?);
            cfg.solver_exe = solver;

            let (base_image, base_tag) = split_image_ref(&base);
            let (output_name, output_tag) = split_image_ref(&image);

            write::ok("Pulling", format!("{base_image}:{base_tag}"))?;
            let registry = registry::Registry::new(&cfg)?;
            let mut built_image = registry.pull(base_image, base_tag)?;

            write::ok("Resolving", "package closure")?;
            let conda_exe_path = cfg.conda_exe.clone().expect("set above");
            let solver_exe_path = cfg.solver_exe.clone().unwrap_or_else(|| conda_exe_path.clone());
            let conda = external::ExternalCondaExe { path: conda_exe_path.clone() };
            let solver = external::ExternalCondaExe { path: solver_exe_path };
            let active: &dyn external::CondaExe = match &source {
                ResolveSource::Specs(_) => &solver,
                _ => &conda,
            };
            let records = resolver::resolve(&cfg, active, &source)?;
            if records.is_empty() {
                bail!("resolved package closure is empty");
            }

            let cache_dir = std::env::temp_dir().join("conda-docker-pkgs-cache");
            let cache_records = fetcher::fetch_all(&cfg, &records, &cache_dir)?;

            let installer: Box<dyn Installer> = Box::new(SandboxInstaller::default());
            let inputs = BuildInputs {
                records: &cache_records,
                installer_exe: &conda_exe_path,
                command_line: std::env::args().collect(),
            };
            let layers = builder::build(&cfg, &inputs, installer.as_ref())?;

            for (content, base_id) in layers {
                built_image.append_raw_layer(content, base_id);
            }
            apply_labels(&mut built_image, &label);
            built_image.set_name_and_tag(output_name, output_tag);

            let file = std::fs::File::create(&output)
                .with_context(|| format!("creating `{}`", output.display()))?;
            tar_codec::write_v1(&built_image, file)
                .with_context(|| format!("writing `{}`", output.display()))?;

            let elapsed = now.elapsed();
            write::ok(
                "Success",
                format!(
                    "image '{}:{}' written to {} in {:.2}s",
                    output_name,
                    output_tag,
                    output.display(),
                    elapsed.as_secs_f32()
                ),
            )?;
        }
    }
    Ok(())
}

fn split_image_ref(image_ref: &str) -> (&str, &str) {
    match image_ref.rsplit_once(':') {
        Some((name, tag)) => (name, tag),
        None => (image_ref, "latest"),
    }
}

fn apply_labels(image: &mut image::Image, labels: &[(String, String)]) {
    if labels.is_empty() {
        return;
    }
    if let Some(layer) = image.layers.first_mut() {
        if let serde_json::Value::Object(ref mut config) = layer.config {
            let entry = config
                .entry("Labels")
                .or_insert_with(|| serde_json::json!({}));
            if let serde_json::Value::Object(ref mut map) = entry {
                for (key, value) in labels {
                    map.insert(key.clone(), serde_json::Value::String(value.clone()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_image_ref_defaults_tag_to_latest() {
        assert_eq!(split_image_ref("alpine"), ("alpine", "latest"));
    }

    #[test]
    fn split_image_ref_splits_on_last_colon() {
        assert_eq!(split_image_ref("frolvlad/alpine-glibc:latest"), ("frolvlad/alpine-glibc", "latest"));
    }

    #[test]
    fn apply_labels_merges_into_head_layer() {
        let mut image = image::Image::new("x", "y");
        image
            .append_layer_from_contents(&[("a".to_string(), b"1".to_vec())], None)
            .unwrap();
        apply_labels(&mut image, &[("org.example".to_string(), "1".to_string())]);
        assert_eq!(image.layers[0].config["Labels"]["org.example"], "1");
    }
}
