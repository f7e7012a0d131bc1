use std::{
    fs,
    path::{Path, PathBuf},
    process::{Command, Output},
};

use tempfile::tempdir;
use visionnova_core::logging::{
    install_panic_hook, PanicHookInstallPlan, DEFAULT_CRASH_DIR_NAME, DEFAULT_LOG_DIR_NAME,
};

const MODE_ENV: &str = "VISIONNOVA_PANIC_CHILD_MODE";
const DATA_DIR_ENV: &str = "VISIONNOVA_PANIC_CHILD_DATA_DIR";

fn crash_dir(data_dir: &Path) -> PathBuf {
    data_dir
        .join(DEFAULT_LOG_DIR_NAME)
        .join(DEFAULT_CRASH_DIR_NAME)
}

/// Re-run this test binary, filtered to the child entrypoint, so the panic
/// happens in a separate process.
fn run_panic_child(mode: &str, data_dir: &Path) -> Output {
    Command::new(std::env::current_exe().expect("test executable path"))
        .args(["panic_hook_child_entrypoint", "--exact", "--nocapture"])
        .env(MODE_ENV, mode)
        .env(DATA_DIR_ENV, data_dir)
        .output()
        .expect("run panic hook child")
}

fn crash_artifacts(dir: &Path) -> Vec<PathBuf> {
    let mut paths: Vec<_> = fs::read_dir(dir)
        .expect("read crash directory")
        .map(|entry| entry.expect("crash directory entry").path())
        .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some("log"))
        .collect();
    paths.sort();
    paths
}

#[test]
fn panic_hook_child_entrypoint() {
    let Ok(mode) = std::env::var(MODE_ENV) else {
        return;
    };
    let data_dir = PathBuf::from(std::env::var(DATA_DIR_ENV).expect("data dir env must be set"));

    assert!(matches!(
        install_panic_hook(Some(data_dir.as_path())),
        PanicHookInstallPlan::Installed { .. } | PanicHookInstallPlan::AlreadyInstalled { .. }
    ));
    assert!(matches!(
        install_panic_hook(Some(data_dir.as_path())),
        PanicHookInstallPlan::AlreadyInstalled { .. }
    ));

    match mode.as_str() {
        "writable" => panic!("stitcher received a foreign layout"),
        "unwritable" => {
            let dir = crash_dir(&data_dir);
            if dir.exists() {
                fs::remove_dir_all(&dir).expect("remove crash directory");
            }
            fs::write(&dir, b"not-a-directory").expect("replace crash directory with file");
            panic!("tile batch lost its shape");
        }
        other => panic!("unknown panic hook child mode: {other}"),
    }
}

#[test]
fn panic_writes_crash_artifact() {
    let data_dir = tempdir().expect("tempdir");
    let output = run_panic_child("writable", data_dir.path());
    assert!(!output.status.success(), "child process should panic");

    let artifacts = crash_artifacts(&crash_dir(data_dir.path()));
    let newest = artifacts.last().expect("expected a crash artifact");
    let contents = fs::read_to_string(newest).expect("read crash artifact");

    assert!(contents.contains("timestamp_utc="));
    assert!(contents.contains("payload=stitcher received a foreign layout"));
    assert!(contents.contains("location="));
    assert!(contents.contains("backtrace_policy="));
    assert!(contents.contains("backtrace:"));

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!stderr.contains("thread panicked while panicking"));
}

#[test]
fn unwritable_crash_dir_warns_without_double_panic() {
    let data_dir = tempdir().expect("tempdir");
    let output = run_panic_child("unwritable", data_dir.path());
    assert!(!output.status.success(), "child process should panic");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("tile batch lost its shape"));
    assert!(stderr.contains("Warning: failed to write panic crash artifact under"));
    assert!(!stderr.contains("thread panicked while panicking"));
}
