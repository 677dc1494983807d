//! conda-docker CLI
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
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_verbosity_flag::Verbosity;

use crate::config::LayeringStrategy;

/// Main CLI struct
#[derive(Debug, Parser)]
#[clap(
    about = "Builds container images containing an installed conda package environment",
    long_about = "See 'conda-docker help <subcommand>' for more information on a specific subcommand",
    version
)]
pub struct Cli {
    #[clap(subcommand)]
    /// The available subcommand
    pub command: Command,
    /// Verbosity
    #[clap(flatten)]
    pub verbose: Verbosity,
}

fn label_parser(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) => Ok((key.to_string(), value.to_string())),
        None => Err(format!("`{}` should be of the form KEY=VALUE.", s)),
    }
}

/// Subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Build an image containing an installed conda package environment
    Build {
        /// Base image to pull layers from, as `image:tag`. Use `scratch` to
        /// start from an empty image.
        #[clap(short = 'b', long = "base", default_value = "frolvlad/alpine-glibc:latest")]
        base: String,
        /// Name and tag to give the built image, as `name:tag`.
        #[clap(short = 'i', long = "image", default_value = "conda-docker:latest")]
        image: String,
        /// Build from an existing conda/mamba environment at this prefix
        /// instead of solving `specs`. Conflicts with `--name`.
        #[clap(short = 'p', long = "prefix", conflicts_with = "name")]
        prefix: Option<PathBuf>,
        /// Build from an existing named conda/mamba environment instead of
        /// solving `specs`. Conflicts with `--prefix`.
        #[clap(short = 'n', long = "name", conflicts_with = "prefix")]
        name: Option<String>,
        /// Path to a conda/mamba/micromamba-compatible executable. Auto
        /// detected from `PATH` or `CONDA_EXE` when not set.
        #[clap(long = "conda-exe")]
        conda_exe: Option<PathBuf>,
        /// Path to write the built v1-format image tar to.
        #[clap(short = 'o', long = "output")]
        output: PathBuf,
        /// Override the executable used to solve `specs`, if it differs
        /// from `--conda-exe`.
        #[clap(short = 's', long = "solver")]
        solver: Option<PathBuf>,
        /// How to split the installed environment into layers.
        #[clap(long = "layering-strategy", value_enum, default_value = "layered")]
        layering_strategy: LayeringStrategy,
        /// Specify additional labels to apply to the image.
        /// Labels are specified as KEY=VALUE
        #[clap(long = "label", value_parser = label_parser)]
        label: Vec<(String, String)>,
        /// Skip TLS certificate verification on registry/fetch/repodata
        /// HTTP calls. Off by default.
        #[clap(long = "insecure-skip-tls-verify")]
        insecure_skip_tls_verify: bool,
        /// Package specs to solve and install, e.g. `python=3.11`. Ignored
        /// when `--prefix`/`--name` is given.
        specs: Vec<String>,
    },
}
