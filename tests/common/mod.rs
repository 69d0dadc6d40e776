//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use axum::{extract::Path as UrlPath, routing::get, Router};

/// HTTP client that opens a fresh connection per request.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .pool_max_idle_per_host(0)
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}

/// Router answering `/` with `body` and `/slow/{ms}` after a delay.
pub fn test_router(body: &'static str) -> Router {
    Router::new()
        .route("/", get(move || async move { body }))
        .route(
            "/slow/{ms}",
            get(move |UrlPath(ms): UrlPath<u64>| async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                body
            }),
        )
}

/// Poll `check` every 20ms until it holds or `timeout` passes.
pub async fn eventually<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

/// Wait until something accepts TCP connections on `addr`.
pub async fn wait_for_port(addr: SocketAddr) {
    for _ in 0..250 {
        if tokio::net::TcpStream::connect(addr).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("nothing listening on {}", addr);
}

/// Whether a TCP connection to `addr` is refused.
pub async fn is_refused(addr: SocketAddr) -> bool {
    tokio::net::TcpStream::connect(addr).await.is_err()
}

/// Write a daemon config serving `addrs` with its pid file in `dir`.
pub fn write_config(dir: &Path, addrs: &[SocketAddr]) -> (PathBuf, PathBuf) {
    let pid_file = dir.join("grace.pid");
    let mut content = String::new();
    for (i, addr) in addrs.iter().enumerate() {
        content.push_str(&format!(
            "[[servers]]\nname = \"server-{}\"\naddress = \"{}\"\n\n",
            i, addr
        ));
    }
    content.push_str(&format!("[lifecycle]\npid_file = \"{}\"\n", pid_file.display()));

    let config = dir.join("grace.toml");
    std::fs::write(&config, content).unwrap();
    (config, pid_file)
}

/// Pid in `path`, if the file exists and is complete.
pub fn read_pid(path: &Path) -> Option<i32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}
