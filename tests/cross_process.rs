//! Contention between real processes: the test process and worker processes
//! of the `shm-spinlock` binary share one file-backed region.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{Duration, Instant};

use shm_spinlock::{LockOptions, ShmLock};
use tempfile::TempDir;

const BIN: &str = env!("CARGO_BIN_EXE_shm-spinlock");

fn region_path(dir: &TempDir) -> PathBuf {
    dir.path().join("region")
}

fn open_lock(path: &Path, offset: usize) -> ShmLock {
    ShmLock::open(
        LockOptions::new(path.to_str().unwrap())
            .offset(offset)
            .min_size(64),
    )
    .unwrap()
}

fn run(args: &[&str]) -> Output {
    Command::new(BIN).args(args).output().unwrap()
}

#[test]
fn worker_times_out_then_succeeds_after_release() {
    let dir = TempDir::new().unwrap();
    let path = region_path(&dir);
    let region = path.to_str().unwrap();
    let holder = open_lock(&path, 0);

    assert!(holder.acquire(None));

    let start = Instant::now();
    let out = run(&["worker", "--region", region, "--timeout-ms", "500", "--quiet"]);
    assert_eq!(out.status.code(), Some(2), "worker should time out");
    assert!(start.elapsed() >= Duration::from_millis(500));
    assert!(String::from_utf8_lossy(&out.stdout).contains("timeout"));
    assert!(holder.is_locked(), "timed out worker must not touch the flag");

    holder.release();

    let out = run(&["worker", "--region", region, "--quiet"]);
    assert!(out.status.success());
    assert!(!holder.is_locked());
}

#[test]
fn worker_processes_never_overlap() {
    const WORKERS: usize = 4;
    const ITERATIONS: u64 = 500;

    let dir = TempDir::new().unwrap();
    let path = region_path(&dir);
    let region = path.to_str().unwrap();
    let lock = open_lock(&path, 3);

    let children: Vec<_> = (0..WORKERS)
        .map(|id| {
            Command::new(BIN)
                .args(["worker", "--region", region, "--offset", "3"])
                .args(["--iterations", &ITERATIONS.to_string()])
                .args(["--counter-offset", "8"])
                .args(["--id", &id.to_string(), "--quiet"])
                .spawn()
                .unwrap()
        })
        .collect();

    for mut child in children {
        assert!(child.wait().unwrap().success());
    }

    let bytes = std::fs::read(&path).unwrap();
    let total = u64::from_ne_bytes(bytes[8..16].try_into().unwrap());
    assert_eq!(total, WORKERS as u64 * ITERATIONS);
    assert_eq!(bytes[3], 0);
    assert!(!lock.is_locked());
}

#[test]
fn status_and_reset_recover_an_abandoned_lock() {
    let dir = TempDir::new().unwrap();
    let path = region_path(&dir);
    let region = path.to_str().unwrap();
    let lock = open_lock(&path, 5);

    let out = run(&["status", "--region", region, "--offset", "5"]);
    assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "unlocked");

    // a holder that never releases
    assert!(lock.acquire(None));
    let out = run(&["status", "--region", region, "--offset", "5"]);
    assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "locked");

    let out = run(&["reset", "--region", region, "--offset", "5"]);
    assert!(out.status.success());
    assert!(!lock.is_locked());
}

#[test]
fn worker_refuses_region_that_is_too_small() {
    let dir = TempDir::new().unwrap();
    let path = region_path(&dir);
    std::fs::write(&path, [0u8; 64]).unwrap();

    let out = run(&["worker", "--region", path.to_str().unwrap(), "--offset", "128"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&out.stderr).contains("at least 129"));
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 64);
}

#[test]
fn worker_rejects_counter_past_the_region_end() {
    let dir = TempDir::new().unwrap();
    let path = region_path(&dir);
    let _lock = open_lock(&path, 0);
    let max = usize::MAX.to_string();

    for offset in [max.as_str(), "64", "12"] {
        let out = run(&[
            "worker",
            "--region",
            path.to_str().unwrap(),
            "--counter-offset",
            offset,
            "--quiet",
        ]);
        assert_eq!(out.status.code(), Some(1), "offset {offset}");
        assert!(String::from_utf8_lossy(&out.stderr).contains("8-byte aligned"));
    }
}

#[test]
fn demo_runs_two_workers() {
    let dir = TempDir::new().unwrap();
    let path = region_path(&dir);

    let out = run(&[
        "demo",
        "--region",
        path.to_str().unwrap(),
        "--hold-ms",
        "100",
        "--timeout-ms",
        "5000",
    ]);
    assert!(out.status.success());

    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("[worker 1] released"));
    assert!(stdout.contains("[worker 2] released"));
    assert!(stdout.contains("Demo complete."));

    let out = run(&["remove", "--region", path.to_str().unwrap()]);
    assert!(out.status.success());
    assert!(!path.exists());
}
