#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;

/// Core stand-in: `-v` prints a version, `-t` accepts configs mentioning
/// `proxies`, run mode exits on SIGTERM (or at once with code 3 on `crash`)
pub const FAKE_CORE: &str = r#"#!/bin/sh
trap 'exit 0' TERM
case " $* " in
  *" -v "*) echo "Mihomo Meta v1.19.10 linux amd64 with go1.24.2"; exit 0 ;;
esac
cfg=""
check=0
while [ $# -gt 0 ]; do
  case "$1" in
    -f) cfg="$2"; shift ;;
    -t) check=1 ;;
  esac
  shift
done
if [ "$check" = 1 ]; then
  grep -q "proxies" "$cfg" && exit 0
  echo "configuration file test failed"
  exit 1
fi
if grep -q "crash" "$cfg"; then
  exit 3
fi
echo "core running with $cfg"
while true; do sleep 0.1; done
"#;

/// Ignores SIGTERM and exits by itself after about three seconds
pub const STUBBORN_CORE: &str = r#"#!/bin/sh
trap '' TERM
i=0
while [ $i -lt 30 ]; do sleep 0.1; i=$((i+1)); done
"#;

/// Minimal runnable subscription
pub const VALID_SUB: &str = "proxies:\n  - {name: a, type: direct}\nrules:\n  - MATCH,a\n";

pub fn write_executable(path: &Path, content: &str) {
    use std::os::unix::fs::PermissionsExt;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

pub fn fake_core(dir: &Path) -> PathBuf {
    let path = dir.join("fake-core");
    write_executable(&path, FAKE_CORE);
    path
}

pub fn mode(path: &Path) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).unwrap().permissions().mode()
}

/// Request counter shared with handlers
#[derive(Clone, Default)]
pub struct Hits(Arc<AtomicUsize>);

impl Hits {
    pub fn hit(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Bind first so routes can embed their own address
pub async fn bind() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

pub fn serve(listener: TcpListener, app: Router) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    })
}

pub async fn start_server(app: Router) -> SocketAddr {
    let (listener, addr) = bind().await;
    serve(listener, app);
    addr
}

/// Architecture label used in release asset names
pub fn release_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

pub fn zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
    use std::io::Write;

    let mut zip = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::FileOptions::default();
    for (name, body) in entries {
        zip.start_file(*name, options).unwrap();
        zip.write_all(body).unwrap();
    }
    zip.finish().unwrap().into_inner()
}

/// Wait until the core has announced itself in its log
pub async fn wait_for_running(log: &Path) {
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        let text = std::fs::read_to_string(log).unwrap_or_default();
        if text.contains("core running") {
            return;
        }
        assert!(std::time::Instant::now() < deadline, "core never reported running");
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
}
