//! Documented JSON/process contracts for the external collaborators
//! this crate treats as narrow, swappable capabilities rather than
//! reimplementing: the conda-compatible introspection/solver tool, the
//! extraction/installation helper, and the chroot-like sandbox runner.
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
use std::process::{Command, ExitStatus};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Either a named environment (`-n`) or an explicit prefix (`-p`), as
/// accepted by the CLI's mutually exclusive flags.
#[derive(Debug, Clone)]
pub enum EnvironmentRef {
    /// `-n NAME`
    Name(String),
    /// `-p PREFIX`
    Prefix(PathBuf),
}

/// One entry of `conda list --json`.
#[derive(Debug, Clone, Deserialize)]
pub struct CondaListEntry {
    /// Base URL of the channel (without subdir).
    pub base_url: String,
    /// Build number.
    pub build_number: u64,
    /// Build string.
    pub build_string: String,
    /// Channel name or URL.
    pub channel: String,
    /// `fn` minus its package extension; joins against the explicit file.
    pub dist_name: String,
    /// Package name.
    pub name: String,
    /// Platform tag, e.g. `linux-64`.
    pub platform: String,
    /// Package version.
    pub version: String,
}

/// One resolved action from `conda create --dry-run --json`'s
/// `actions.LINK`.
#[derive(Debug, Clone, Deserialize)]
pub struct CondaLinkAction {
    /// Base URL of the channel (without subdir).
    pub base_url: String,
    /// Build number.
    pub build_number: u64,
    /// Build string.
    pub build_string: String,
    /// Channel name or URL.
    pub channel: String,
    /// `fn` minus its package extension.
    pub dist_name: String,
    /// Package name.
    pub name: String,
    /// Platform tag, e.g. `linux-64`.
    pub platform: String,
    /// Package version.
    pub version: String,
}

/// Top-level shape of a solver's dry-run JSON output.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct CondaSolveResult {
    /// The `actions` object.
    #[serde(default)]
    pub actions: CondaActions,
}

/// The subset of `actions` this crate reads.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct CondaActions {
    /// The ordered install closure.
    #[serde(default, rename = "LINK")]
    pub link: Vec<CondaLinkAction>,
}

/// The documented contract for the external conda-compatible
/// introspection and solver tool. Production callers shell out to the
/// real `conda`/`mamba`/`micromamba` binary via [`ExternalCondaExe`];
/// tests substitute a fake returning canned JSON.
pub trait CondaExe {
    /// `<exe> list [-n NAME|-p PREFIX] --json`
    fn list_json(&self, env: &EnvironmentRef) -> Result<Vec<CondaListEntry>>;
    /// `<exe> list [-n NAME|-p PREFIX] --explicit --json --md5`
    fn list_explicit(&self, env: &EnvironmentRef) -> Result<String>;
    /// `<exe> create --dry-run --prefix <prefix> --json <specs...>`
    fn solve(&self, prefix: &Path, specs: &[String]) -> Result<CondaSolveResult>;
}

/// Shells out to a real conda-compatible binary on disk.
pub struct ExternalCondaExe {
    /// Path to the `conda`/`mamba`/`micromamba`-compatible binary.
    pub path: PathBuf,
}

impl CondaExe for ExternalCondaExe {
    fn list_json(&self, env: &EnvironmentRef) -> Result<Vec<CondaListEntry>> {
        let mut cmd = Command::new(&self.path);
        cmd.arg("list");
        push_env_flag(&mut cmd, env);
        cmd.arg("--json");
        let output = run(&mut cmd)?;
        serde_json::from_slice(&output).context("parsing `list --json` output")
    }

    fn list_explicit(&self, env: &EnvironmentRef) -> Result<String> {
        let mut cmd = Command::new(&self.path);
        cmd.arg("list");
        push_env_flag(&mut cmd, env);
        cmd.args(["--explicit", "--json", "--md5"]);
        let output = run(&mut cmd)?;
        String::from_utf8(output).context("`list --explicit` output was not UTF-8")
    }

    fn solve(&self, prefix: &Path, specs: &[String]) -> Result<CondaSolveResult> {
        let mut cmd = Command::new(&self.path);
        cmd.args(["create", "--dry-run", "--prefix"])
            .arg(prefix)
            .arg("--json")
            .args(specs);
        let output = run(&mut cmd)?;
        serde_json::from_slice(&output).context("parsing solver `--json` output")
    }
}

fn push_env_flag(cmd: &mut Command, env: &EnvironmentRef) {
    match env {
        EnvironmentRef::Name(name) => {
            cmd.arg("-n").arg(name);
        }
        EnvironmentRef::Prefix(prefix) => {
            cmd.arg("-p").arg(prefix);
        }
    }
}

fn run(cmd: &mut Command) -> Result<Vec<u8>> {
    log::debug!("Running `{:?}`", cmd);
    let output = cmd
        .output()
        .with_context(|| format!("failed to run `{:?}`", cmd))?;
    if !output.status.success() {
        bail!(
            "`{:?}` exited with {}: {}",
            cmd,
            output.status,
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(output.stdout)
}

/// Auto-detect a conda-compatible executable on `PATH`. `configured`
/// wins when set (the CLI's `--conda-exe` flag or `CONDA_EXE`). This
/// crate never reimplements the solver, it only locates and shells out
/// to one.
pub fn locate_conda_exe(configured: Option<&Path>) -> Result<PathBuf> {
    if let Some(p) = configured {
        return Ok(p.to_path_buf());
    }
    for candidate in ["conda", "mamba", "micromamba"] {
        if let Ok(path) = which(candidate) {
            return Ok(path);
        }
    }
    bail!("could not locate a conda-compatible executable on PATH; pass --conda-exe or set CONDA_EXE")
}

fn which(bin: &str) -> Result<PathBuf> {
    let path_var = std::env::var_os("PATH").context("PATH is not set")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(bin);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    bail!("`{}` not found on PATH", bin)
}

/// The extractor/installer pair invoked inside the sandboxed staging
/// root. A narrow trait so tests can substitute a no-op fake instead of
/// requiring a real standalone installer binary and a real sandboxing
/// tool.
pub trait Installer {
    /// `<installer> constructor --prefix <prefix> --extract-conda-pkgs`
    fn extract_pkgs(&self, installer_path: &Path, prefix: &Path) -> Result<()>;
    /// Runs `/_conda.exe install --offline --file <env_file> -y --prefix
    /// <prefix>` inside a chroot-like sandbox rooted at `sandbox_root`,
    /// with the environment variables the real installer expects.
    fn install(
        &self,
        sandbox_root: &Path,
        env_file_in_sandbox: &Path,
        prefix_in_sandbox: &Path,
    ) -> Result<ExitStatus>;
}

/// Production [`Installer`]: shells out to the standalone installer
/// binary directly for extraction, and to a separately provided
/// chroot-like sandbox runner for the install step itself.
pub struct SandboxInstaller {
    /// Path to the sandbox runner binary. Defaults to
    /// `$CONDA_DOCKER_SANDBOX_EXE` or `conda-docker-sandbox` on `PATH`.
    pub sandbox_exe: PathBuf,
}

impl Default for SandboxInstaller {
    fn default() -> Self {
        Self {
            sandbox_exe: std::env::var_os("CONDA_DOCKER_SANDBOX_EXE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("conda-docker-sandbox")),
        }
    }
}

impl Installer for SandboxInstaller {
    fn extract_pkgs(&self, installer_path: &Path, prefix: &Path) -> Result<()> {
        let mut cmd = Command::new(installer_path);
        cmd.arg("constructor")
            .arg("--prefix")
            .arg(prefix)
            .arg("--extract-conda-pkgs");
        log::debug!("Running `{:?}`", cmd);
        let status = cmd
            .status()
            .with_context(|| format!("running `{:?}`", cmd))?;
        if !status.success() {
            bail!("`{:?}` exited with {}", cmd, status);
        }
        Ok(())
    }

    fn install(
        &self,
        sandbox_root: &Path,
        env_file_in_sandbox: &Path,
        prefix_in_sandbox: &Path,
    ) -> Result<ExitStatus> {
        let mut cmd = Command::new(&self.sandbox_exe);
        cmd.arg("--root")
            .arg(sandbox_root)
            .arg("--")
            .arg("/_conda.exe")
            .arg("install")
            .arg("--offline")
            .arg("--file")
            .arg(env_file_in_sandbox)
            .arg("-y")
            .arg("--prefix")
            .arg(prefix_in_sandbox)
            .env("CONDA_SAFETY_CHECKS", "disabled")
            .env("CONDA_EXTRA_SAFETY_CHECKS", "no")
            .env("CONDA_PKGS_DIRS", "/opt/conda/pkgs")
            .env("CONDA_ROOT", "/opt/conda")
            .env("HOME", "/root");
        log::debug!("Running `{:?}`", cmd);
        cmd.status()
            .with_context(|| format!("running `{:?}`", cmd))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeCondaExe {
        list: Vec<CondaListEntry>,
        explicit: String,
    }

    impl CondaExe for FakeCondaExe {
        fn list_json(&self, _env: &EnvironmentRef) -> Result<Vec<CondaListEntry>> {
            Ok(self.list.clone())
        }
        fn list_explicit(&self, _env: &EnvironmentRef) -> Result<String> {
            Ok(self.explicit.clone())
        }
        fn solve(&self, _prefix: &Path, _specs: &[String]) -> Result<CondaSolveResult> {
            Ok(CondaSolveResult::default())
        }
    }

    #[test]
    fn fake_conda_exe_satisfies_the_trait() {
        let fake = FakeCondaExe {
            list: vec![],
            explicit: "@EXPLICIT\n".to_string(),
        };
        let explicit = fake.list_explicit(&EnvironmentRef::Name("base".into())).unwrap();
        assert_eq!(explicit, "@EXPLICIT\n");
    }
}
