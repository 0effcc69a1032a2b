//! Shared fixtures for end-to-end tests: a mock upstream served by axum on
//! an ephemeral port and a proxy application pointed at it.

#![allow(dead_code)]

use axum::Router;
use llm_proxy::config::{Settings, UpstreamOverride};
use llm_proxy::providers::bedrock::auth::{SigV4Signer, StaticCredentialSource};
use llm_proxy::Application;
use serde_json::Value;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub const ACCESS_KEY_ID: &str = "AKIDEXAMPLE";

/// Serve `router` on 127.0.0.1 and return its address
pub async fn spawn_upstream(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

pub struct TestProxy {
    pub addr: SocketAddr,
    pub dir: TempDir,
    shutdown: Option<oneshot::Sender<()>>,
    server: Option<JoinHandle<llm_proxy::Result<()>>>,
}

impl TestProxy {
    /// Start a proxy that sends `upstream_host` to `upstream`
    pub async fn start(
        upstream_host: &str,
        upstream: SocketAddr,
        configure: impl FnOnce(&mut Settings),
    ) -> Self {
        let signer = SigV4Signer::new(StaticCredentialSource::new(ACCESS_KEY_ID, "secret", None));
        Self::start_with_signer(upstream_host, upstream, configure, signer).await
    }

    /// Like `start`, signing Bedrock requests with `signer`
    pub async fn start_with_signer(
        upstream_host: &str,
        upstream: SocketAddr,
        configure: impl FnOnce(&mut Settings),
        signer: SigV4Signer,
    ) -> Self {
        let dir = TempDir::new().unwrap();
        let mut settings = Settings {
            listen_port: 0,
            log_root: dir.path().to_path_buf(),
            machine_id: "test-host".to_string(),
            upstream_overrides: vec![UpstreamOverride {
                host: upstream_host.to_string(),
                base_url: format!("http://{upstream}"),
            }],
            ..Settings::default()
        };
        configure(&mut settings);

        let app = Application::build_with_signer(settings, Some(signer))
            .await
            .unwrap();
        let addr = app.local_addr().unwrap();

        let (tx, rx) = oneshot::channel::<()>();
        let server = tokio::spawn(app.run_until(async {
            let _ = rx.await;
        }));

        Self {
            addr,
            dir,
            shutdown: Some(tx),
            server: Some(server),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub fn log_root(&self) -> &Path {
        self.dir.path()
    }

    /// Every `.jsonl` file under `<log-root>/<host>/<date>/`
    pub fn session_files(&self, upstream_host: &str) -> Vec<PathBuf> {
        let host_dir = self.dir.path().join(upstream_host);
        let Ok(days) = std::fs::read_dir(&host_dir) else {
            return Vec::new();
        };
        let mut files: Vec<PathBuf> = days
            .flat_map(|day| std::fs::read_dir(day.unwrap().path()).unwrap())
            .map(|file| file.unwrap().path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "jsonl"))
            .collect();
        files.sort();
        files
    }

    pub fn session_file(&self, upstream_host: &str, session_id: &str) -> PathBuf {
        self.session_files(upstream_host)
            .into_iter()
            .find(|path| path.file_stem().is_some_and(|stem| stem == session_id))
            .unwrap_or_else(|| panic!("no log file for session {session_id}"))
    }

    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(server) = self.server.take() {
            server.await.unwrap().unwrap();
        }
    }
}

pub fn read_entries(path: &Path) -> Vec<Value> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

/// Streamed responses are logged after the client has the last byte, so
/// poll until the file holds `count` entries
pub async fn wait_for_entries(path: &Path, count: usize) -> Vec<Value> {
    for _ in 0..100 {
        let entries = read_entries(path);
        if entries.len() >= count {
            return entries;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("{} never reached {count} entries", path.display());
}

pub fn today() -> String {
    chrono::Utc::now().format("%Y-%m-%d").to_string()
}
