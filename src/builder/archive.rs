//! Host filesystem helpers for staging: probed hard-linking with a copy
//! fallback, and host-binary copies into the staging tree's `/bin`.
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

use anyhow::{Context, Result};

/// Hard-link `src` to `dst`, falling back to a copy when linking fails
/// for any reason: cross-device, permission denied, or a platform that
/// disallows hard links to that file type. Probed by attempting the
/// link, never assumed from filesystem type.
pub fn link_or_copy(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating `{}`", parent.display()))?;
    }
    if dst.exists() {
        fs::remove_file(dst).with_context(|| format!("removing stale `{}`", dst.display()))?;
    }
    match fs::hard_link(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => fs::copy(src, dst)
            .map(|_| ())
            .with_context(|| format!("copying `{}` to `{}`", src.display(), dst.display())),
    }
}

/// Copy a host binary (`bash`, `mv`) from `/bin` into the staging tree's
/// `/bin`, preserving the executable bit.
pub fn copy_host_binary(name: &str, staging_root: &Path) -> Result<()> {
    let src = Path::new("/bin").join(name);
    let dst = staging_root.join("bin").join(name);
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating `{}`", parent.display()))?;
    }
    fs::copy(&src, &dst).with_context(|| format!("copying host `{}`", src.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_or_copy_falls_back_across_tempdirs_on_same_fs() {
        let src_dir = tempfile::tempdir().unwrap();
        let dst_dir = tempfile::tempdir().unwrap();
        let src = src_dir.path().join("a");
        std::fs::write(&src, b"hi").unwrap();
        let dst = dst_dir.path().join("nested/a");
        link_or_copy(&src, &dst).unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), b"hi");
    }
}
