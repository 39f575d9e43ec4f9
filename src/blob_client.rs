use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

use crate::config::CoreConfig;
use crate::errors::{CoreError, Result};

const CHUNK_STALL_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);
const LARGE_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const LARGE_READ_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const CYCLE_POINTER_NAME: &str = "whichgefs";
const CYCLE_POINTER_TTL: Duration = Duration::from_secs(60);

/// Authenticated HTTP client to the remote weather/elevation object store.
///
/// Handles only transport concerns (auth, retry, streaming, verification).
/// On-disk placement and cross-process coordination belong to
/// [`crate::weather_store::WeatherArrayStore`].
#[derive(Clone)]
pub struct BlobClient {
    client: Client,
    base_url: String,
    secret: String,
    cycle_pointer_cache: std::sync::Arc<Mutex<Option<(Instant, String)>>>,
}

/// Outcome of a streaming download, used by the caller to decide whether to
/// validate archive structure.
pub struct Download {
    pub bytes_written: u64,
}

impl BlobClient {
    pub fn new(config: &CoreConfig) -> Self {
        let client = Client::builder()
            .build()
            .expect("failed to build reqwest client");
        Self {
            client,
            base_url: config.object_store_url.clone(),
            secret: config.object_store_secret.clone(),
            cycle_pointer_cache: std::sync::Arc::new(Mutex::new(None)),
        }
    }

    fn object_url(&self, name: &str) -> String {
        format!("{}/storage/v1/object/{}", self.base_url, name)
    }

    /// Fetch a small text object. The cycle-pointer object (`whichgefs`) is
    /// cached in-process for 60s to avoid hammering the store with the
    /// ~5-second status-poll cadence clients use.
    #[instrument(skip(self))]
    pub async fn open_text(&self, name: &str) -> Result<String> {
        if name == CYCLE_POINTER_NAME {
            if let Some((fetched_at, value)) = self.cycle_pointer_cache.lock().unwrap().clone() {
                if fetched_at.elapsed() < CYCLE_POINTER_TTL {
                    return Ok(value);
                }
            }
        }

        let resp = self
            .client
            .get(self.object_url(name))
            .bearer_auth(&self.secret)
            .timeout(DEFAULT_CONNECT_TIMEOUT + DEFAULT_READ_TIMEOUT)
            .send()
            .await?;
        let resp = self.check_status(resp, name).await?;
        let text = resp.text().await?;

        if name == CYCLE_POINTER_NAME {
            *self.cycle_pointer_cache.lock().unwrap() = Some((Instant::now(), text.clone()));
        }
        Ok(text)
    }

    /// List object names in the bucket.
    #[instrument(skip(self))]
    pub async fn list(&self) -> Result<Vec<String>> {
        #[derive(serde::Deserialize)]
        struct Item {
            name: String,
        }
        let resp = self
            .client
            .post(format!("{}/storage/v1/object/list", self.base_url))
            .bearer_auth(&self.secret)
            .json(&serde_json::json!({ "prefix": "" }))
            .send()
            .await?;
        let resp = self.check_status(resp, "list").await?;
        let items: Vec<Item> = resp.json().await?;
        Ok(items.into_iter().map(|i| i.name).collect())
    }

    /// Stream an object to `dest`, retrying on transient failures with
    /// exponential backoff. `is_npz` governs the retry budget (5 attempts vs
    /// 3 for other large files) and whether the caller should validate
    /// archive structure afterwards.
    #[instrument(skip(self), fields(name = %name))]
    pub async fn download_to(&self, name: &str, dest: &Path, is_large: bool, is_npz: bool) -> Result<Download> {
        let max_attempts = if is_npz { 5 } else if is_large { 3 } else { 1 };
        let mut last_err = None;

        for attempt in 0..max_attempts {
            match self.try_download_once(name, dest, is_large).await {
                Ok(dl) => return Ok(dl),
                Err(e) => {
                    let _ = tokio::fs::remove_file(dest).await;
                    if attempt + 1 < max_attempts {
                        let wait = Duration::from_secs(1 << (attempt + 1));
                        warn!(attempt = attempt + 1, max_attempts, error = %e, "download attempt failed, retrying in {:?}", wait);
                        tokio::time::sleep(wait).await;
                    }
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| CoreError::other("download failed with no recorded error")))
    }

    async fn try_download_once(&self, name: &str, dest: &Path, is_large: bool) -> Result<Download> {
        let (connect_timeout, read_timeout) = if is_large {
            (LARGE_CONNECT_TIMEOUT, LARGE_READ_TIMEOUT)
        } else {
            (DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT)
        };

        let resp = self
            .client
            .get(self.object_url(name))
            .bearer_auth(&self.secret)
            .timeout(connect_timeout + read_timeout)
            .send()
            .await?;

        if resp.status() == StatusCode::BAD_REQUEST || resp.status() == StatusCode::NOT_FOUND {
            return Err(CoreError::WeatherUnavailable {
                cycle: String::new(),
                model: 0,
                reason: format!("{} not found in object store (status {})", name, resp.status()),
            });
        }
        let resp = self.check_status(resp, name).await?;

        let expected_len = resp.content_length();
        let mut file = File::create(dest).await?;
        let mut stream = resp.bytes_stream();
        let mut written: u64 = 0;
        let mut last_chunk = Instant::now();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if is_large && last_chunk.elapsed() > CHUNK_STALL_TIMEOUT {
                return Err(CoreError::DownloadStalled(CHUNK_STALL_TIMEOUT.as_secs()));
            }
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            last_chunk = Instant::now();
        }
        file.sync_all().await?;

        if written == 0 {
            return Err(CoreError::other(format!("download of {name} produced an empty file")));
        }
        if let Some(expected) = expected_len {
            if expected != written {
                return Err(CoreError::other(format!(
                    "download of {name} incomplete: expected {expected} bytes, got {written}"
                )));
            }
        }

        debug!(name, written, "download complete");
        Ok(Download { bytes_written: written })
    }

    pub async fn put(&self, name: &str, body: Vec<u8>) -> Result<()> {
        let len = body.len();
        let resp = self
            .client
            .put(self.object_url(name))
            .bearer_auth(&self.secret)
            .header("Content-Type", "application/octet-stream")
            .body(body)
            .send()
            .await?;
        self.check_status(resp, name).await?;
        info!(name, len, "uploaded object");
        Ok(())
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        let resp = self
            .client
            .delete(self.object_url(name))
            .bearer_auth(&self.secret)
            .send()
            .await?;
        self.check_status(resp, name).await?;
        Ok(())
    }

    async fn check_status(&self, resp: reqwest::Response, name: &str) -> Result<reqwest::Response> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Err(CoreError::Http {
            status: status.as_u16(),
            message: format!("request for {name} failed: {body}"),
        })
    }
}
