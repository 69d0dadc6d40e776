//! End-to-end handoff of the daemon binary between two generations.

use std::net::SocketAddr;
use std::os::unix::process::ExitStatusExt;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

mod common;

fn spawn_daemon(config: &std::path::Path) -> Child {
    Command::new(env!("CARGO_BIN_EXE_grace-handoff"))
        .arg("--config")
        .arg(config)
        .env("RUST_LOG", "grace_handoff=debug")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap()
}

async fn wait_for_exit(child: &mut Child, timeout: Duration) -> Option<std::process::ExitStatus> {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if let Some(status) = child.try_wait().unwrap() {
            return Some(status);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    None
}

async fn body(client: &reqwest::Client, url: String) -> String {
    client.get(url).send().await.unwrap().text().await.unwrap()
}

#[tokio::test]
async fn restart_hands_sockets_to_successor_without_refusals() {
    let a: SocketAddr = "127.0.0.1:28401".parse().unwrap();
    let b: SocketAddr = "127.0.0.1:28402".parse().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let (config, pid_file) = common::write_config(dir.path(), &[a, b]);

    let mut parent = spawn_daemon(&config);
    common::wait_for_port(a).await;
    common::wait_for_port(b).await;
    assert!(common::eventually(Duration::from_secs(5), || common::read_pid(&pid_file).is_some()).await);
    let first = common::read_pid(&pid_file).unwrap();
    assert_eq!(first as u32, parent.id());

    let client = common::client();
    assert_eq!(body(&client, format!("http://{}/", a)).await.trim(), first.to_string());

    // Hammer both servers for the whole handoff.
    let stop = Arc::new(AtomicBool::new(false));
    let failures = Arc::new(AtomicU32::new(0));
    let mut load = Vec::new();
    for addr in [a, b] {
        let (stop, failures, client) = (stop.clone(), failures.clone(), client.clone());
        load.push(tokio::spawn(async move {
            while !stop.load(Ordering::SeqCst) {
                if client.get(format!("http://{}/", addr)).send().await.is_err() {
                    failures.fetch_add(1, Ordering::SeqCst);
                }
            }
        }));
    }

    // A slow request the old generation must finish after handing off.
    let slow_client = client.clone();
    let slow = tokio::spawn(async move { body(&slow_client, format!("http://{}/slow/2", b)).await });
    tokio::time::sleep(Duration::from_millis(200)).await;

    kill(Pid::from_raw(first), Signal::SIGUSR2).unwrap();

    assert!(
        common::eventually(Duration::from_secs(10), || {
            common::read_pid(&pid_file).is_some_and(|pid| pid != first)
        })
        .await
    );
    let second = common::read_pid(&pid_file).unwrap();

    assert_eq!(slow.await.unwrap().trim(), first.to_string());

    let status = wait_for_exit(&mut parent, Duration::from_secs(10)).await;
    assert!(status.is_some_and(|s| s.success()), "old generation did not exit cleanly");

    stop.store(true, Ordering::SeqCst);
    for task in load {
        task.await.unwrap();
    }
    assert_eq!(failures.load(Ordering::SeqCst), 0);

    // Only the successor answers now.
    assert_eq!(body(&client, format!("http://{}/", a)).await.trim(), second.to_string());
    assert_eq!(body(&client, format!("http://{}/", b)).await.trim(), second.to_string());

    kill(Pid::from_raw(second), Signal::SIGTERM).unwrap();
    for _ in 0..250 {
        if common::is_refused(a).await && common::is_refused(b).await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("successor kept serving after SIGTERM");
}

#[tokio::test]
async fn terminate_drains_and_exits() {
    let addr: SocketAddr = "127.0.0.1:28411".parse().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let (config, _pid_file) = common::write_config(dir.path(), &[addr]);

    let mut daemon = spawn_daemon(&config);
    common::wait_for_port(addr).await;

    let client = common::client();
    let slow_client = client.clone();
    let slow = tokio::spawn(async move { body(&slow_client, format!("http://{}/slow/1", addr)).await });
    tokio::time::sleep(Duration::from_millis(200)).await;

    kill(Pid::from_raw(daemon.id() as i32), Signal::SIGTERM).unwrap();
    assert_eq!(slow.await.unwrap().trim(), daemon.id().to_string());

    let status = wait_for_exit(&mut daemon, Duration::from_secs(10)).await;
    assert!(status.is_some_and(|s| s.success()));
    assert!(common::is_refused(addr).await);
}

#[tokio::test]
async fn second_terminate_while_draining_kills_the_process() {
    let addr: SocketAddr = "127.0.0.1:28412".parse().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let (config, _pid_file) = common::write_config(dir.path(), &[addr]);

    let mut daemon = spawn_daemon(&config);
    common::wait_for_port(addr).await;

    // Keeps the drain busy far longer than the test waits.
    let client = common::client();
    let _slow = tokio::spawn(async move { client.get(format!("http://{}/slow/30", addr)).send().await });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let pid = Pid::from_raw(daemon.id() as i32);
    kill(pid, Signal::SIGTERM).unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(daemon.try_wait().unwrap().is_none(), "daemon exited before the drain finished");

    kill(pid, Signal::SIGTERM).unwrap();
    let status = wait_for_exit(&mut daemon, Duration::from_secs(5))
        .await
        .expect("daemon survived the second SIGTERM");
    assert_eq!(status.signal(), Some(Signal::SIGTERM as i32));
}

#[tokio::test]
async fn invalid_config_exits_with_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("grace.toml");
    std::fs::write(&config, "[lifecycle]\nrestart_signal = \"SIGUSR2\"\n").unwrap();

    let mut daemon = spawn_daemon(&config);
    let status = wait_for_exit(&mut daemon, Duration::from_secs(10)).await;
    assert!(status.is_some_and(|s| !s.success()));
}
