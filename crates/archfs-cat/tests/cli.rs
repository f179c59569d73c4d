// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use std::path::Path;
use std::process::Command;

use archfs_cat::{run, EXIT_FAILURE, EXIT_OK, EXIT_USAGE};

fn tar_with(dir: &Path, name: &str, entries: &[(&str, &[u8])]) {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, *data).unwrap();
    }
    std::fs::write(dir.join(name), builder.into_inner().unwrap()).unwrap();
}

fn invoke(args: &[&str]) -> (u8, String, String) {
    let mut out = Vec::new();
    let mut err = Vec::new();
    let mut argv = vec!["archfs-cat"];
    argv.extend_from_slice(args);
    let code = run(argv, &mut out, &mut err);
    (code, String::from_utf8(out).unwrap(), String::from_utf8(err).unwrap())
}

#[test]
fn prints_plain_files_and_archive_entries_in_order() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("plain.txt"), "plain\n").unwrap();
    tar_with(dir.path(), "bundle.tar", &[("docs/note.txt", b"inside\n".as_slice())]);

    let plain = dir.path().join("plain.txt").display().to_string();
    let entry = format!("{}/bundle.tar/docs/note.txt", dir.path().display());
    let (code, out, err) = invoke(&[&entry, &plain]);
    assert_eq!(code, EXIT_OK, "{err}");
    assert_eq!(out, "inside\nplain\n");
    assert!(err.is_empty());
}

#[test]
fn missing_paths_fail_but_the_rest_is_printed() {
    let dir = tempfile::tempdir().unwrap();
    tar_with(dir.path(), "bundle.tar", &[("a.txt", b"a".as_slice())]);
    let missing = format!("{}/bundle.tar/missing.txt", dir.path().display());
    let present = format!("{}/bundle.tar/a.txt", dir.path().display());

    let (code, out, err) = invoke(&[&missing, &present]);
    assert_eq!(code, EXIT_FAILURE);
    assert_eq!(out, "a");
    assert!(err.contains("missing.txt"), "{err}");
}

#[test]
fn directories_cannot_be_printed() {
    let dir = tempfile::tempdir().unwrap();
    tar_with(dir.path(), "bundle.tar", &[("docs/note.txt", b"x".as_slice())]);
    let docs = format!("{}/bundle.tar/docs", dir.path().display());
    let (code, _, err) = invoke(&[&docs]);
    assert_eq!(code, EXIT_FAILURE);
    assert!(err.contains("is a directory"), "{err}");
}

#[test]
fn usage_errors_exit_with_two() {
    let (code, out, err) = invoke(&[]);
    assert_eq!(code, EXIT_USAGE);
    assert!(out.is_empty());
    assert!(err.contains("PATH"), "{err}");

    let (code, _, _) = invoke(&["--log-level", "loud", "/tmp"]);
    assert_eq!(code, EXIT_USAGE);
}

#[test]
fn help_is_not_an_error() {
    let (code, out, err) = invoke(&["--help"]);
    assert_eq!(code, EXIT_OK);
    assert!(out.contains("nested archives"), "{out}");
    assert!(err.is_empty());
}

#[test]
fn broken_config_is_a_usage_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("archfs.toml");
    std::fs::write(&config, "[pool]\nkind = \"floppy\"\n").unwrap();
    let file = dir.path().join("f.txt");
    std::fs::write(&file, "f").unwrap();

    let (code, out, err) = invoke(&["--config", config.to_str().unwrap(), file.to_str().unwrap()]);
    assert_eq!(code, EXIT_USAGE);
    assert!(out.is_empty());
    assert!(err.contains("archfs.toml"), "{err}");
}

#[test]
fn binary_exit_codes() {
    let dir = tempfile::tempdir().unwrap();
    tar_with(dir.path(), "bundle.tar", &[("x", b"payload".as_slice())]);
    let entry = format!("{}/bundle.tar/x", dir.path().display());

    let output = Command::new(env!("CARGO_BIN_EXE_archfs-cat")).arg(&entry).output().unwrap();
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(output.stdout, b"payload");

    let output = Command::new(env!("CARGO_BIN_EXE_archfs-cat")).output().unwrap();
    assert_eq!(output.status.code(), Some(2));

    let output = Command::new(env!("CARGO_BIN_EXE_archfs-cat"))
        .arg(dir.path().join("nope").display().to_string())
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
}
