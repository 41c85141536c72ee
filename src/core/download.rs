//! Single-flight HTTP downloader with whole-percent progress reporting
//!
//! One engine owns at most one transfer. A `download()` issued while a
//! transfer is in flight joins it, and every caller receives a clone of the
//! same result.

use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use reqwest::header::{HeaderMap, CONTENT_DISPOSITION};
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Write buffer size for file destinations
pub const CHUNK_SIZE: usize = 128 * 1024;

/// Download failure, shared verbatim by every waiter of a transfer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DownloadError {
    #[error("HTTP status {0}")]
    Status(u16),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("invalid JSON: {0}")]
    Json(String),

    #[error("download cancelled")]
    Cancelled,
}

impl DownloadError {
    fn io(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }

    fn transport(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

/// Where a response body goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// Stream into a file, replacing it only once the body is complete
    File(PathBuf),
    /// Buffer and parse as JSON
    Json,
}

/// Successful transfer
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadOutput {
    File {
        bytes: u64,
        /// Name advertised by the `Content-Disposition` header
        filename: Option<String>,
    },
    Json(serde_json::Value),
}

pub type DownloadResult = Result<DownloadOutput, DownloadError>;

/// Progress observer, called with each new whole percent
pub type ProgressHook = Arc<dyn Fn(u8) + Send + Sync>;

/// Build the shared HTTP client
pub fn http_client(
    user_agent: &str,
    timeout: Duration,
    disable_verify: bool,
) -> reqwest::Result<Client> {
    if disable_verify {
        warn!("TLS certificate verification is disabled");
    }
    Client::builder()
        .user_agent(user_agent)
        .timeout(timeout)
        .danger_accept_invalid_certs(disable_verify)
        .build()
}

struct InFlight {
    id: u64,
    url: String,
    cancel: CancellationToken,
    result: watch::Receiver<Option<DownloadResult>>,
    percent: Arc<AtomicU8>,
}

/// Downloader owning at most one in-flight transfer
pub struct DownloadEngine {
    client: Client,
    hook: RwLock<Option<ProgressHook>>,
    slot: Arc<Mutex<Option<InFlight>>>,
    next_id: AtomicU64,
}

impl DownloadEngine {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            hook: RwLock::new(None),
            slot: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(0),
        }
    }

    /// Register the progress observer used by subsequent transfers
    pub fn set_progress_hook(&self, hook: ProgressHook) {
        *self.hook.write().unwrap_or_else(PoisonError::into_inner) = Some(hook);
    }

    /// Download `url`, or join the transfer already in flight
    pub async fn download(&self, url: &str, destination: Destination) -> DownloadResult {
        let mut result = {
            let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
            match slot.as_ref() {
                Some(task) => {
                    if task.url != url {
                        warn!(
                            "Download of {} requested while {} is in flight, joining it",
                            url, task.url
                        );
                    } else {
                        debug!("Joining in-flight download of {}", url);
                    }
                    task.result.clone()
                }
                None => {
                    let task = self.launch(url, destination);
                    let receiver = task.result.clone();
                    *slot = Some(task);
                    receiver
                }
            }
        };

        let outcome = match result.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or(Err(DownloadError::Cancelled))
    }

    /// Cancel the in-flight transfer, if any
    pub fn cancel(&self) {
        let task = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            info!("Cancelling download of {}", task.url);
            task.cancel.cancel();
        }
    }

    /// Last reported percent of the in-flight transfer
    pub fn progress(&self) -> Option<u8> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|task| task.percent.load(Ordering::SeqCst))
    }

    pub fn is_downloading(&self) -> bool {
        self.progress().is_some()
    }

    fn launch(&self, url: &str, destination: Destination) -> InFlight {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = watch::channel(None);
        let cancel = CancellationToken::new();
        let percent = Arc::new(AtomicU8::new(0));
        let hook = self
            .hook
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let client = self.client.clone();
        let slot = Arc::clone(&self.slot);
        let token = cancel.clone();
        let task_url = url.to_string();
        let reporter = Reporter::new(Arc::clone(&percent), hook);
        // Every transfer stages under its own name
        let staging = match &destination {
            Destination::File(path) => {
                Some(part_path(path, &Uuid::new_v4().simple().to_string()))
            }
            Destination::Json => None,
        };

        tokio::spawn(async move {
            info!("Downloading {}", task_url);
            let result = tokio::select! {
                result = transfer(&client, &task_url, &destination, staging.as_deref(), reporter) => {
                    result
                }
                _ = token.cancelled() => Err(DownloadError::Cancelled),
            };

            match &result {
                Ok(_) => info!("Downloaded {}", task_url),
                Err(e) => {
                    warn!("Download of {} failed: {}", task_url, e);
                    if let Some(part) = &staging {
                        let _ = tokio::fs::remove_file(part).await;
                    }
                }
            }

            // Free the slot before publishing so a waiter can start a fresh transfer
            {
                let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
                if slot.as_ref().is_some_and(|task| task.id == id) {
                    *slot = None;
                }
            }
            let _ = sender.send(Some(result));
        });

        InFlight {
            id,
            url: url.to_string(),
            cancel,
            result: receiver,
            percent,
        }
    }
}

/// Tracks the last whole percent and notifies the hook on increases
struct Reporter {
    percent: Arc<AtomicU8>,
    hook: Option<ProgressHook>,
    total: u64,
    downloaded: u64,
    last: u8,
}

impl Reporter {
    fn new(percent: Arc<AtomicU8>, hook: Option<ProgressHook>) -> Self {
        Self {
            percent,
            hook,
            total: 0,
            downloaded: 0,
            last: 0,
        }
    }

    /// Progress stays unreported until completion when the length is unknown
    fn start(&mut self, total: u64) {
        self.total = total;
        if total > 0 {
            self.emit(0);
        }
    }

    fn advance(&mut self, bytes: usize) {
        self.downloaded += bytes as u64;
        if self.total == 0 {
            return;
        }
        let percent = (self.downloaded.saturating_mul(100) / self.total).min(100) as u8;
        if percent > self.last {
            self.emit(percent);
        }
    }

    fn finish(&mut self) {
        if self.last < 100 {
            self.emit(100);
        }
    }

    fn emit(&mut self, percent: u8) {
        self.last = percent;
        self.percent.store(percent, Ordering::SeqCst);
        if let Some(hook) = &self.hook {
            if std::panic::catch_unwind(AssertUnwindSafe(|| hook(percent))).is_err() {
                error!("Progress hook panicked at {}%", percent);
            }
        }
    }
}

async fn transfer(
    client: &Client,
    url: &str,
    destination: &Destination,
    staging: Option<&Path>,
    mut reporter: Reporter,
) -> DownloadResult {
    let mut response = client
        .get(url)
        .send()
        .await
        .map_err(DownloadError::transport)?;

    let status = response.status();
    if status != StatusCode::OK {
        return Err(DownloadError::Status(status.as_u16()));
    }

    let filename = disposition_filename(response.headers());
    reporter.start(response.content_length().unwrap_or(0));

    match destination {
        Destination::File(path) => {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(DownloadError::io)?;
            }
            let part = staging.map(Path::to_path_buf).unwrap_or_else(|| part_path(path, "0"));
            let file = tokio::fs::File::create(&part)
                .await
                .map_err(DownloadError::io)?;
            let mut writer = BufWriter::with_capacity(CHUNK_SIZE, file);

            while let Some(chunk) = response.chunk().await.map_err(DownloadError::transport)? {
                writer.write_all(&chunk).await.map_err(DownloadError::io)?;
                reporter.advance(chunk.len());
            }
            writer.flush().await.map_err(DownloadError::io)?;
            writer
                .into_inner()
                .sync_all()
                .await
                .map_err(DownloadError::io)?;
            tokio::fs::rename(&part, path)
                .await
                .map_err(DownloadError::io)?;

            reporter.finish();
            Ok(DownloadOutput::File {
                bytes: reporter.downloaded,
                filename,
            })
        }
        Destination::Json => {
            let mut body = Vec::new();
            while let Some(chunk) = response.chunk().await.map_err(DownloadError::transport)? {
                body.extend_from_slice(&chunk);
                reporter.advance(chunk.len());
            }
            let value =
                serde_json::from_slice(&body).map_err(|e| DownloadError::Json(e.to_string()))?;
            reporter.finish();
            Ok(DownloadOutput::Json(value))
        }
    }
}

/// Staging path `<name>.<tag>.part` a file download is written to before the final rename
pub fn part_path(path: &Path, tag: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{}.part", tag));
    path.with_file_name(name)
}

fn disposition_filename(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CONTENT_DISPOSITION)
        .and_then(|value| value.to_str().ok())
        .and_then(filename_from_disposition)
}

/// Extract the file name from a `Content-Disposition` value.
///
/// `filename*` (RFC 5987) wins over `filename`.
pub fn filename_from_disposition(value: &str) -> Option<String> {
    let mut plain = None;
    let mut extended = None;

    for param in value.split(';').map(str::trim) {
        let Some((key, raw)) = param.split_once('=') else {
            continue;
        };
        match key.trim().to_ascii_lowercase().as_str() {
            "filename*" => {
                let encoded = raw.trim().trim_matches('"');
                let encoded = encoded
                    .split_once("''")
                    .map(|(_, rest)| rest)
                    .unwrap_or(encoded);
                let decoded = urlencoding::decode_binary(encoded.as_bytes());
                extended = Some(String::from_utf8_lossy(&decoded).into_owned());
            }
            "filename" => plain = Some(raw.trim().trim_matches('"').to_string()),
            _ => {}
        }
    }

    extended.or(plain).filter(|name| !name.is_empty())
}
