//! Integration tests for conda-docker: CLI-level usage errors and the
//! empty-from-scratch image scenario, exercised without a real package
//! registry or conda installation.

use std::io::Cursor;
use std::process::Command;

use conda_docker::image::Image;
use conda_docker::tar_codec;

// Path to the conda-docker binary under test
const EXE: &str = env!("CARGO_BIN_EXE_conda-docker");

#[test]
fn test_no_subcommand_prints_usage() {
    let output = Command::new(EXE).output().unwrap();
    assert!(!output.status.success());
    let stderr = std::str::from_utf8(&output.stderr).unwrap();
    eprintln!("stderr: {}", stderr);
    assert!(stderr.contains("Usage"));
}

#[test]
fn test_build_requires_output() {
    let output = Command::new(EXE)
        .args(["build", "python=3.11"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = std::str::from_utf8(&output.stderr).unwrap();
    eprintln!("stderr: {}", stderr);
    assert!(stderr.contains("--output") || stderr.contains("required"));
}

#[test]
fn test_build_rejects_both_name_and_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.tar");
    let output = Command::new(EXE)
        .args(["build", "--output"])
        .arg(&out)
        .args(["--name", "base", "--prefix", "/opt/conda"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = std::str::from_utf8(&output.stderr).unwrap();
    eprintln!("stderr: {}", stderr);
    assert!(stderr.contains("cannot be used with"));
}

#[test]
fn test_build_rejects_empty_source() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.tar");
    let output = Command::new(EXE)
        .args(["build", "--output"])
        .arg(&out)
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = std::str::from_utf8(&output.stderr).unwrap();
    eprintln!("stderr: {}", stderr);
    assert!(stderr.contains("no source given"));
}

#[test]
fn test_build_fails_without_conda_exe_on_path() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.tar");
    let output = Command::new(EXE)
        .args(["build", "--output"])
        .arg(&out)
        .arg("python=3.11")
        .env("PATH", "")
        .env_remove("CONDA_EXE")
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = std::str::from_utf8(&output.stderr).unwrap();
    eprintln!("stderr: {}", stderr);
    assert!(stderr.contains("could not locate a conda-compatible executable"));
}

#[test]
fn test_empty_image_from_scratch_round_trips() {
    let image = Image::new("empty", "v1");
    let mut buf = Vec::new();
    tar_codec::write_v1(&image, &mut buf).unwrap();

    let mut archive = tar::Archive::new(Cursor::new(&buf));
    let mut names: Vec<String> = Vec::new();
    for entry in archive.entries().unwrap() {
        let entry = entry.unwrap();
        names.push(entry.path().unwrap().to_string_lossy().into_owned());
    }
    assert_eq!(names, vec!["repositories"]);

    let mut parsed = tar_codec::parse_v1(Cursor::new(&buf)).unwrap();
    assert_eq!(parsed.len(), 1);
    let parsed = parsed.remove(0);
    assert_eq!(parsed.name, "empty");
    assert_eq!(parsed.tag, "v1");
    assert!(parsed.layers.is_empty());
}

#[test]
fn test_single_layer_append_produces_one_entry() {
    let mut image = Image::new("x", "y");
    image
        .append_layer_from_contents(&[("a".to_string(), b"x".to_vec())], None)
        .unwrap();

    let mut buf = Vec::new();
    tar_codec::write_v1(&image, &mut buf).unwrap();
    let parsed = tar_codec::parse_v1(Cursor::new(&buf)).unwrap();
    assert_eq!(parsed[0].layers.len(), 1);

    let mut layer_archive = tar::Archive::new(parsed[0].layers[0].content.as_slice());
    let mut entries = layer_archive.entries().unwrap();
    let entry = entries.next().unwrap().unwrap();
    assert_eq!(entry.path().unwrap().to_string_lossy(), "a");
    assert_eq!(entry.header().size().unwrap(), 1);
    assert!(entries.next().is_none());
}
