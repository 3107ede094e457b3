//! Release transports: local files and HTTP(S) downloads.
//!
//! ```text
//!   SourceDescriptor ──► Fetcher::fetch ──► retry(backoff) ──► checksum gate ──► Payload
//!                         (file | http)       SourceUnavailable    SourceFormatChanged
//! ```
//!
//! Credentials are opaque: a descriptor names the environment variables it
//! needs and how each is applied to the request. Values are read at fetch time
//! and never logged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use termgraph_model::digest::sha256_checksum;
use tracing::{debug, info, warn};

use crate::SourceError;

// ============================================================================
// Descriptor
// ============================================================================

/// How a credential value is attached to a download request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "apply", rename_all = "snake_case")]
pub enum CredentialUse {
    /// `name: <prefix><value>` request header.
    Header { name: String, prefix: String },
    /// `?<param>=<value>` query parameter.
    Query { param: String },
    /// Substitutes `{<placeholder>}` in the location.
    Location { placeholder: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialKey {
    /// Environment variable holding the secret.
    pub env: String,
    #[serde(flatten)]
    pub usage: CredentialUse,
}

/// Everything needed to download one release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub name: String,
    /// Local path, `file://` URL, or `http(s)://` URL. `{version}` is
    /// replaced by `version` when set.
    pub location: String,
    #[serde(default)]
    pub version: Option<String>,
    /// Expected `sha256:<hex>` of the payload.
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub credentials: Vec<CredentialKey>,
}

impl SourceDescriptor {
    pub fn new(name: &str, location: &str) -> Self {
        Self {
            name: name.to_string(),
            location: location.to_string(),
            version: None,
            checksum: None,
            credentials: Vec::new(),
        }
    }

    pub fn with_version(mut self, version: Option<String>) -> Self {
        self.version = version;
        self
    }

    pub fn with_checksum(mut self, checksum: Option<String>) -> Self {
        self.checksum = checksum;
        self
    }

    pub fn with_credentials(mut self, credentials: Vec<CredentialKey>) -> Self {
        self.credentials = credentials;
        self
    }
}

// ============================================================================
// Payload
// ============================================================================

/// A fetched release. Cheap to clone; parsing borrows the bytes, so the
/// payload can be parsed any number of times without re-fetching.
#[derive(Debug, Clone)]
pub struct Payload {
    pub source_name: String,
    /// Where the bytes came from (path or URL without credentials).
    pub locator: String,
    pub bytes: Arc<[u8]>,
    /// `sha256:<hex>` of `bytes`.
    pub digest: String,
    pub version: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

impl Payload {
    pub fn from_bytes(
        source_name: &str,
        locator: &str,
        bytes: Vec<u8>,
        version: Option<String>,
    ) -> Self {
        let digest = sha256_checksum(&bytes);
        Self {
            source_name: source_name.to_string(),
            locator: locator.to_string(),
            bytes: Arc::from(bytes),
            digest,
            version,
            fetched_at: Utc::now(),
        }
    }

    /// Release version as declared, or the payload digest when the source is
    /// unversioned.
    pub fn version_or_digest(&self) -> &str {
        self.version.as_deref().unwrap_or(&self.digest)
    }
}

/// Reject a payload whose digest does not match the declared checksum.
pub fn verify_checksum(payload: &Payload, expected: Option<&str>) -> Result<(), SourceError> {
    let Some(expected) = expected.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(());
    };
    let expected = if expected.contains(':') {
        expected.to_ascii_lowercase()
    } else {
        format!("sha256:{}", expected.to_ascii_lowercase())
    };
    if expected != payload.digest {
        return Err(SourceError::FormatChanged {
            source_name: payload.source_name.clone(),
            reason: format!(
                "checksum mismatch: expected {expected}, got {}",
                payload.digest
            ),
        });
    }
    Ok(())
}

// ============================================================================
// Retry
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// Run `op` until it succeeds, fails permanently, or attempts run out.
/// Only retryable [`SourceError::Unavailable`] errors are retried.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, name: &str, mut op: F) -> Result<T, SourceError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, SourceError>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt < attempts => {
                let wait = policy.backoff(attempt);
                warn!(source = name, attempt, wait_ms = wait.as_millis() as u64, error = %e, "fetch failed, retrying");
                tokio::time::sleep(wait).await;
            }
            Err(e) => return Err(e),
        }
    }
}

// ============================================================================
// Fetcher
// ============================================================================

/// Shared download client used by every built-in adapter.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    policy: RetryPolicy,
    download_dir: Option<PathBuf>,
}

impl Default for Fetcher {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl Fetcher {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            client: reqwest::Client::new(),
            policy,
            download_dir: None,
        }
    }

    /// Keep a copy of every remote download under `dir/<source>/`.
    pub fn with_download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.download_dir = Some(dir.into());
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn fetch(&self, desc: &SourceDescriptor) -> Result<Payload, SourceError> {
        let location = match &desc.version {
            Some(v) => desc.location.replace("{version}", v),
            None => desc.location.clone(),
        };

        let payload = if is_remote(&location) {
            let bytes = with_retry(&self.policy, &desc.name, || self.get_http(desc, &location)).await?;
            let payload = Payload::from_bytes(&desc.name, &location, bytes, desc.version.clone());
            self.keep_download(&payload).await;
            payload
        } else {
            let path = local_path(&location);
            let bytes = tokio::fs::read(&path)
                .await
                .map_err(|e| SourceError::Unavailable {
                    source_name: desc.name.clone(),
                    reason: format!("read {}: {e}", path.display()),
                    retryable: false,
                })?;
            Payload::from_bytes(&desc.name, &location, bytes, desc.version.clone())
        };

        verify_checksum(&payload, desc.checksum.as_deref())?;
        info!(
            source = %desc.name,
            bytes = payload.bytes.len(),
            digest = %payload.digest,
            "fetched release"
        );
        Ok(payload)
    }

    async fn get_http(&self, desc: &SourceDescriptor, location: &str) -> Result<Vec<u8>, SourceError> {
        let unavailable = |reason: String, retryable: bool| SourceError::Unavailable {
            source_name: desc.name.clone(),
            reason,
            retryable,
        };

        let mut location = location.to_string();
        let mut headers: Vec<(String, String)> = Vec::new();
        let mut query: Vec<(String, String)> = Vec::new();
        for key in &desc.credentials {
            let value = std::env::var(&key.env).map_err(|_| {
                unavailable(format!("credential env var `{}` is not set", key.env), false)
            })?;
            match &key.usage {
                CredentialUse::Header { name, prefix } => {
                    headers.push((name.clone(), format!("{prefix}{value}")))
                }
                CredentialUse::Query { param } => query.push((param.clone(), value)),
                CredentialUse::Location { placeholder } => {
                    location = location.replace(&format!("{{{placeholder}}}"), &value)
                }
            }
        }

        let url = url::Url::parse(&location)
            .map_err(|e| unavailable(format!("invalid url: {e}"), false))?;
        let mut req = self.client.get(url).query(&query);
        for (name, value) in &headers {
            req = req.header(name.as_str(), value.as_str());
        }

        debug!(source = %desc.name, "http get");
        let resp = req.send().await.map_err(|e| {
            // Avoid echoing the url: it may carry a credential.
            let retryable = e.is_timeout() || e.is_connect() || e.is_request();
            unavailable(format!("request failed: {}", e.without_url()), retryable)
        })?;

        let status = resp.status();
        if !status.is_success() {
            let retryable = status.is_server_error() || status.as_u16() == 429;
            return Err(unavailable(format!("http status {status}"), retryable));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| unavailable(format!("read body: {}", e.without_url()), true))?;
        Ok(bytes.to_vec())
    }

    async fn keep_download(&self, payload: &Payload) {
        let Some(dir) = &self.download_dir else {
            return;
        };
        let hex = payload.digest.trim_start_matches("sha256:");
        let path = dir.join(&payload.source_name).join(format!("{hex}.bin"));
        let write = async {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, &payload.bytes[..]).await
        };
        if let Err(e) = write.await {
            warn!(source = %payload.source_name, error = %e, "failed to keep downloaded payload");
        }
    }
}

fn is_remote(location: &str) -> bool {
    location.starts_with("http://") || location.starts_with("https://")
}

fn local_path(location: &str) -> PathBuf {
    Path::new(location.strip_prefix("file://").unwrap_or(location)).to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = RetryPolicy {
            max_attempts: 10,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
        };
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(400));
        assert_eq!(p.backoff(9), Duration::from_millis(1_000));
        assert_eq!(p.backoff(200), Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn retries_only_transient_failures() {
        let calls = AtomicU32::new(0);
        let res: Result<(), SourceError> = with_retry(&fast(), "hgnc", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(SourceError::Unavailable {
                source_name: "hgnc".into(),
                reason: "503".into(),
                retryable: true,
            })
        })
        .await;
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let calls = AtomicU32::new(0);
        let res: Result<(), SourceError> = with_retry(&fast(), "omim", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(SourceError::Unavailable {
                source_name: "omim".into(),
                reason: "401".into(),
                retryable: false,
            })
        })
        .await;
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_returns_first_success() {
        let calls = AtomicU32::new(0);
        let res = with_retry(&fast(), "hpo", || async {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(SourceError::Unavailable {
                    source_name: "hpo".into(),
                    reason: "reset".into(),
                    retryable: true,
                })
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(res.unwrap(), 42);
    }

    #[tokio::test]
    async fn fetches_local_file_and_checks_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hgnc.tsv");
        std::fs::write(&path, b"hgnc_id\tsymbol\nHGNC:1100\tBRCA1\n").unwrap();

        let desc = SourceDescriptor::new("HGNC", path.to_str().unwrap());
        let payload = Fetcher::new(fast()).fetch(&desc).await.unwrap();
        assert!(payload.digest.starts_with("sha256:"));
        assert_eq!(payload.version_or_digest(), payload.digest);

        let ok = desc.clone().with_checksum(Some(payload.digest.clone()));
        assert!(Fetcher::new(fast()).fetch(&ok).await.is_ok());

        let bad = desc.with_checksum(Some("sha256:00".into()));
        let err = Fetcher::new(fast()).fetch(&bad).await.unwrap_err();
        assert!(matches!(err, SourceError::FormatChanged { .. }));
    }

    #[tokio::test]
    async fn missing_file_is_unavailable() {
        let desc = SourceDescriptor::new("HPO", "/nonexistent/hp.owl");
        let err = Fetcher::new(fast()).fetch(&desc).await.unwrap_err();
        assert!(matches!(err, SourceError::Unavailable { retryable: false, .. }));
    }

    #[tokio::test]
    async fn missing_credential_is_not_retried() {
        let desc = SourceDescriptor::new("OMIM", "https://data.example.invalid/omim.csv")
            .with_credentials(vec![CredentialKey {
                env: "TERMGRAPH_TEST_UNSET_CREDENTIAL_9F2C".into(),
                usage: CredentialUse::Header {
                    name: "Authorization".into(),
                    prefix: "apikey token=".into(),
                },
            }]);
        let err = Fetcher::new(fast()).fetch(&desc).await.unwrap_err();
        match err {
            SourceError::Unavailable { reason, retryable, .. } => {
                assert!(!retryable);
                assert!(reason.contains("TERMGRAPH_TEST_UNSET_CREDENTIAL_9F2C"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
