use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

fn mfstool(image: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_mfstool"))
        .arg(image)
        .args(args)
        .output()
        .unwrap()
}

fn new_image(dir: &TempDir, extra: &[&str]) -> PathBuf {
    let image = dir.path().join("disk.img");
    let mut args = vec!["mkfs", "--blocks", "128"];
    args.extend_from_slice(extra);
    let out = mfstool(&image, &args);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    image
}

fn ok(image: &Path, args: &[&str]) -> Vec<u8> {
    let out = mfstool(image, args);
    assert!(
        out.status.success(),
        "{:?}: {}",
        args,
        String::from_utf8_lossy(&out.stderr)
    );
    out.stdout
}

fn status(image: &Path, args: &[&str]) -> i32 {
    mfstool(image, args).status.code().unwrap()
}

#[test]
fn edit_session_round_trips_through_the_image() {
    let dir = TempDir::new().unwrap();
    let image = new_image(&dir, &[]);

    ok(&image, &["touch", "notes"]);
    ok(&image, &["append", "notes", "hello"]);
    ok(&image, &["append", "notes", " world"]);
    ok(&image, &["mkdir", "docs"]);
    ok(&image, &["touch", "docs/readme"]);
    ok(&image, &["append", "docs/readme", "nested"]);

    assert_eq!(ok(&image, &["cat", "notes"]), b"hello world".to_vec());
    assert_eq!(ok(&image, &["cat", "docs/readme"]), b"nested".to_vec());
    assert_eq!(ok(&image, &["ls"]), b".\n..\nnotes\ndocs\n".to_vec());
    assert_eq!(ok(&image, &["ls", "docs"]), b".\n..\nreadme\n".to_vec());
}

#[test]
fn info_reports_geometry() {
    let dir = TempDir::new().unwrap();
    let image = new_image(&dir, &["--fs-version", "v2", "--names", "14"]);

    let info = String::from_utf8(ok(&image, &["info"])).unwrap();
    assert!(info.contains("version:          V2"), "{}", info);
    assert!(info.contains("name length:      14"), "{}", info);
}

#[test]
fn failures_have_distinct_exit_codes() {
    let dir = TempDir::new().unwrap();
    let image = new_image(&dir, &["--names", "14"]);
    ok(&image, &["touch", "f"]);
    ok(&image, &["mkdir", "d"]);

    assert_eq!(status(&image, &["cat", "missing"]), 4);
    assert_eq!(status(&image, &["cat", "d"]), 5);
    assert_eq!(status(&image, &["ls", "f"]), 6);
    assert_eq!(status(&image, &["touch", "f"]), 7);
    assert_eq!(status(&image, &["touch", "fifteen_chars__"]), 8);
}

#[test]
fn unformatted_image_is_rejected() {
    let dir = TempDir::new().unwrap();
    let image = dir.path().join("blank.img");
    std::fs::write(&image, vec![0; 8 * 1024]).unwrap();

    let out = mfstool(&image, &["ls"]);
    assert_eq!(out.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&out.stderr).starts_with("error:"));
}

#[test]
fn mkfs_refuses_to_overwrite_and_cleans_up_bad_geometry() {
    let dir = TempDir::new().unwrap();
    let image = new_image(&dir, &[]);
    assert_eq!(status(&image, &["mkfs", "--blocks", "128"]), 1);
    assert_eq!(ok(&image, &["ls"]), b".\n..\n".to_vec());

    let tiny = dir.path().join("tiny.img");
    assert_eq!(status(&tiny, &["mkfs", "--blocks", "3"]), 12);
    assert!(!tiny.exists());
}
