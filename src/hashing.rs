//! Streaming digest writers used by the package fetcher and tar codec.
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
use md5::Digest;
use std::io::{Result, Write};

/// Wraps a writer and incrementally computes a digest of everything written
/// to the inner writer.
pub struct DigestWriter<D, W> {
    writer: W,
    hasher: D,
}

impl<D: Digest, W> DigestWriter<D, W> {
    /// Wrap `writer`, hashing every byte passed through it with `D`.
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            hasher: D::new(),
        }
    }

    /// Return the lowercase hex digest of the written data, and the
    /// underlying writer.
    pub fn finish(self) -> (String, W) {
        (hex::encode(self.hasher.finalize()), self.writer)
    }
}

impl<D: Digest, W: Write> Write for DigestWriter<D, W> {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let len = self.writer.write(buf)?;
        self.hasher.update(&buf[..len]);
        Ok(len)
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()
    }
}

/// Convenience alias for the MD5 digest writer, used for the legacy conda
/// tarball checksum.
pub type Md5Writer<W> = DigestWriter<md5::Md5, W>;

/// Convenience alias for the SHA-256 digest writer, used when a record
/// supplies a SHA-256 checksum instead of MD5.
pub type Sha256Writer<W> = DigestWriter<sha2::Sha256, W>;

/// Compute the hex-encoded MD5 digest of a file on disk, streaming it in
/// fixed-size chunks so arbitrarily large tarballs don't need to be loaded
/// into memory.
pub fn md5_file(path: impl AsRef<std::path::Path>) -> std::io::Result<String> {
    digest_file::<md5::Md5>(path)
}

/// Compute the hex-encoded SHA-256 digest of a file on disk, the same way
/// [`md5_file`] does for MD5.
pub fn sha256_file(path: impl AsRef<std::path::Path>) -> std::io::Result<String> {
    digest_file::<sha2::Sha256>(path)
}

fn digest_file<D: Digest>(path: impl AsRef<std::path::Path>) -> std::io::Result<String> {
    use std::io::Read;
    let mut file = std::fs::File::open(path)?;
    let mut hasher = D::new();
    let mut buf = [0u8; 1 << 16];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_writer_matches_direct_hash() {
        let mut writer = Md5Writer::new(Vec::new());
        writer.write_all(b"hello world").unwrap();
        let (digest, buf) = writer.finish();
        assert_eq!(buf, b"hello world");
        assert_eq!(digest, "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }

    #[test]
    fn md5_file_reads_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"hello world").unwrap();
        assert_eq!(md5_file(&path).unwrap(), "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }
}
