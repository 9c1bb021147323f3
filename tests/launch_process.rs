#![cfg(all(feature = "cli", target_os = "linux"))]

use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use handoff::core::layout::Geometry;
use handoff::{CoordinationStore, FileStore};
use tempfile::tempdir;

const BIN: &str = env!("CARGO_BIN_EXE_handoff-launch");

fn wait_for_owner(path: &std::path::Path) -> handoff::Result<()> {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if path.exists() {
            let store = FileStore::open(path, Geometry { capacity: 32, max_payload: 512 })?;
            if store.read_lease()?.is_some() {
                return Ok(());
            }
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    panic!("no owner appeared at {}", path.display());
}

#[test]
fn second_launch_hands_uri_to_running_instance() -> handoff::Result<()> {
    let dir = tempdir()?;
    let store = dir.path().join("qtox.handoff");

    let owner = Command::new(BIN)
        .arg("--store")
        .arg(&store)
        .args(["--run-for-secs", "3"])
        .stdout(Stdio::piped())
        .spawn()?;
    wait_for_owner(&store)?;

    let second = Command::new(BIN)
        .arg("--store")
        .arg(&store)
        .arg("tox:abc")
        .output()?;
    assert!(second.status.success());
    assert!(second.stdout.is_empty(), "second launch handled the uri itself");

    let owner = owner.wait_with_output()?;
    assert!(owner.status.success());
    assert_eq!(String::from_utf8_lossy(&owner.stdout).trim(), "tox:abc");
    Ok(())
}

#[test]
fn launch_without_owner_handles_uri_itself() -> handoff::Result<()> {
    let dir = tempdir()?;
    let store = dir.path().join("qtox.handoff");
    let out = Command::new(BIN)
        .arg("--store")
        .arg(&store)
        .args(["--run-for-secs", "0", "tox:solo"])
        .output()?;
    assert!(out.status.success());
    assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "tox:solo");

    // Clean exit released the lease.
    let store = FileStore::open(&store, Geometry { capacity: 32, max_payload: 512 })?;
    assert!(store.read_lease()?.is_none());
    Ok(())
}

#[test]
fn launch_without_uri_stays_up_and_takes_over() -> handoff::Result<()> {
    let dir = tempdir()?;
    let store = dir.path().join("qtox.handoff");

    let owner = Command::new(BIN)
        .arg("--store")
        .arg(&store)
        .args(["--run-for-secs", "1"])
        .stdout(Stdio::null())
        .spawn()?;
    wait_for_owner(&store)?;

    let mut client = Command::new(BIN)
        .arg("--store")
        .arg(&store)
        .args(["--run-for-secs", "4"])
        .stdout(Stdio::null())
        .spawn()?;
    let client_pid = client.id();
    std::thread::sleep(Duration::from_millis(300));
    assert!(client.try_wait()?.is_none(), "client exited while owner was up");

    assert!(owner.wait_with_output()?.status.success());
    let handle = FileStore::open(&store, Geometry { capacity: 32, max_payload: 512 })?;
    let deadline = Instant::now() + Duration::from_secs(3);
    let mut took_over = false;
    while Instant::now() < deadline {
        if handle.read_lease()?.is_some_and(|lease| lease.owner_pid == client_pid) {
            took_over = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(took_over, "client never claimed the lease");
    assert!(client.wait()?.success());
    Ok(())
}
