// HTTP fetching for scripts and auxiliary binaries.
//
// Logical scripts are fetched once with no retry. Auxiliary binaries go
// through `Downloader`, which retries transport errors with exponential
// backoff and reports every failed attempt when it gives up.

use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::DownloadConfig;
use crate::error::{CibootError, DownloadError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &DownloadConfig) -> Self {
        Self {
            attempts: config.attempts.max(1),
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            ..Self::default()
        }
    }

    fn next_delay(&self, current: Duration) -> Duration {
        std::cmp::min(
            Duration::from_millis((current.as_millis() as f64 * self.backoff_multiplier) as u64),
            self.max_delay,
        )
    }
}

/// Run `operation` until it succeeds or the policy's attempts run out.
///
/// On failure every attempt's error message is returned, oldest first.
pub fn retry_with_backoff<T, F>(
    policy: &RetryPolicy,
    what: &str,
    mut operation: F,
) -> std::result::Result<T, Vec<String>>
where
    F: FnMut(usize) -> std::result::Result<T, String>,
{
    let mut errors = Vec::new();
    let mut delay = policy.initial_delay;

    for attempt in 1..=policy.attempts.max(1) {
        if attempt > 1 {
            tracing::info!(
                "Retrying {} (attempt {}/{}) after {:?}",
                what,
                attempt,
                policy.attempts,
                delay
            );
            std::thread::sleep(delay);
            delay = policy.next_delay(delay);
        }

        match operation(attempt) {
            Ok(value) => return Ok(value),
            Err(error) => {
                tracing::debug!(attempt, "{} failed: {}", what, error);
                errors.push(error);
            }
        }
    }

    Err(errors)
}

#[derive(Debug)]
pub(crate) enum FetchError {
    Transport(String),
    Status(u16),
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Transport(error) => f.write_str(error),
            FetchError::Status(status) => write!(f, "HTTP {status}"),
        }
    }
}

pub(crate) fn http_client() -> std::result::Result<reqwest::blocking::Client, FetchError> {
    reqwest::blocking::Client::builder()
        .user_agent(concat!("ciboot/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| FetchError::Transport(e.to_string()))
}

pub(crate) fn fetch_bytes(
    client: &reqwest::blocking::Client,
    url: &str,
) -> std::result::Result<Vec<u8>, FetchError> {
    let response = client
        .get(url)
        .send()
        .map_err(|e| FetchError::Transport(e.to_string()))?;
    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::Status(status.as_u16()));
    }
    response
        .bytes()
        .map(|body| body.to_vec())
        .map_err(|e| FetchError::Transport(e.to_string()))
}

/// Write `contents` to `dest` so readers never observe a partial file.
pub(crate) fn write_atomically(dest: &Path, contents: &[u8]) -> std::io::Result<()> {
    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    temp.write_all(contents)?;
    temp.persist(dest).map_err(|e| e.error)?;
    Ok(())
}

/// Retrying downloader for auxiliary binaries and packages
pub struct Downloader {
    client: reqwest::blocking::Client,
    policy: RetryPolicy,
}

impl Downloader {
    pub fn new(policy: RetryPolicy) -> Result<Self> {
        let client = http_client().map_err(|e| {
            CibootError::Download(Box::new(DownloadError::RetriesExhausted {
                url: String::new(),
                attempts: vec![e.to_string()],
            }))
        })?;
        Ok(Self { client, policy })
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Download `url` to `dest`, retrying failed transfers.
    pub fn download(&self, url: &str, dest: &Path) -> Result<PathBuf> {
        let body = retry_with_backoff(&self.policy, url, |_| {
            fetch_bytes(&self.client, url).map_err(|e| e.to_string())
        })
        .map_err(|attempts| {
            CibootError::Download(Box::new(DownloadError::RetriesExhausted {
                url: url.to_string(),
                attempts,
            }))
        })?;

        write_atomically(dest, &body).map_err(|e| {
            CibootError::Download(Box::new(DownloadError::WriteFailed {
                path: dest.to_path_buf(),
                error: e.to_string(),
            }))
        })?;

        tracing::debug!(url, path = %dest.display(), bytes = body.len(), "Downloaded");
        Ok(dest.to_path_buf())
    }
}
