use assert_cmd::Command;
use predicates::prelude::*;

const KIB: usize = 1024;

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i / 511) % 251) as u8 + 1).collect()
}

fn bcp() -> Command {
    Command::cargo_bin("bcp").unwrap()
}

#[test]
fn test_help_runs() {
    bcp().arg("--help").assert().success();
}

#[test]
fn test_version_runs() {
    bcp().arg("--version").assert().success();
}

#[test]
fn test_progress_type_accepts_both_spellings() {
    for value in [
        "auto",
        "Auto",
        "progress-bar",
        "ProgressBar",
        "text-updates",
        "TextUpdates",
    ] {
        bcp()
            .args(["--progress-type", value, "--help"])
            .assert()
            .success();
    }
}

#[test]
fn test_invalid_size_is_rejected() {
    bcp()
        .args(["--cluster-size", "lots", "a", "b"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--cluster-size"));
}

#[test]
fn test_full_copy() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src.img");
    let dst = tmp.path().join("dst.img");
    // last cluster is partial
    let data = pattern(KIB * KIB + 1000);
    std::fs::write(&src, &data).unwrap();
    bcp()
        .arg(&src)
        .arg(&dst)
        .arg("--summary")
        .assert()
        .success()
        .stdout(predicate::str::contains("bytes copied"));
    assert_eq!(std::fs::read(&dst).unwrap(), data);
}

#[test]
fn test_buffered_copy_into_existing_target() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src.img");
    let dst = tmp.path().join("dst.img");
    let data = pattern(512 * KIB);
    std::fs::write(&src, &data).unwrap();
    std::fs::write(&dst, vec![0xff; 512 * KIB]).unwrap();
    bcp()
        .arg(&src)
        .arg(&dst)
        .args(["--no-copy-range", "--max-workers", "2", "--cluster-size", "4KiB"])
        .assert()
        .success();
    assert_eq!(std::fs::read(&dst).unwrap(), data);
}

#[test]
fn test_copy_sub_range() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src.img");
    let dst = tmp.path().join("dst.img");
    let data = pattern(512 * KIB);
    std::fs::write(&src, &data).unwrap();
    bcp()
        .arg(&src)
        .arg(&dst)
        .args(["--offset", "64KiB", "--length", "128KiB"])
        .assert()
        .success();
    let copied = std::fs::read(&dst).unwrap();
    assert_eq!(copied.len(), data.len());
    assert!(copied[..64 * KIB].iter().all(|b| *b == 0));
    assert_eq!(copied[64 * KIB..192 * KIB], data[64 * KIB..192 * KIB]);
    assert!(copied[192 * KIB..].iter().all(|b| *b == 0));
}

#[test]
fn test_sparse_copy_with_skip_unallocated() {
    use std::io::{Seek, Write};
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src.img");
    let dst = tmp.path().join("dst.img");
    let chunk = pattern(64 * KIB);
    {
        let mut file = std::fs::File::create(&src).unwrap();
        file.set_len(KIB as u64 * KIB as u64).unwrap();
        file.seek(std::io::SeekFrom::Start(256 * KIB as u64)).unwrap();
        file.write_all(&chunk).unwrap();
    }
    bcp()
        .arg(&src)
        .arg(&dst)
        .args(["--skip-unallocated", "--summary"])
        .assert()
        .success()
        .stdout(predicate::str::contains("bytes skipped"));
    let copied = std::fs::read(&dst).unwrap();
    assert_eq!(copied, std::fs::read(&src).unwrap());
    assert_eq!(copied[256 * KIB..320 * KIB], chunk[..]);
}

#[test]
fn test_missing_source_fails() {
    let tmp = tempfile::tempdir().unwrap();
    bcp()
        .arg(tmp.path().join("missing.img"))
        .arg(tmp.path().join("dst.img"))
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("cannot open"));
}

#[test]
fn test_missing_source_fails_quietly() {
    let tmp = tempfile::tempdir().unwrap();
    bcp()
        .arg(tmp.path().join("missing.img"))
        .arg(tmp.path().join("dst.img"))
        .arg("--quiet")
        .assert()
        .failure()
        .stderr(predicate::str::is_empty());
}

#[test]
fn test_offset_past_end_fails() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src.img");
    std::fs::write(&src, pattern(64 * KIB)).unwrap();
    bcp()
        .arg(&src)
        .arg(tmp.path().join("dst.img"))
        .args(["--offset", "1MiB"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("past the end"));
}
