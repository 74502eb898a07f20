//! Artifact repository client and build discovery
//!
//! The repository is abstracted behind [`ArtifactSource`] so discovery and
//! the download pipeline run against fakes in tests; [`JfrogClient`] is the
//! reqwest-backed production implementation with basic auth and a shared
//! keep-alive connection pool.
//!
//! Discovery finds the greatest existing `(date, sequence)` for a tuple by
//! ramping the sequence exponentially within a day, binary-searching between
//! the last hit and the first miss, and walking back one day at a time when
//! a day has no builds at all.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::TryStreamExt;
use futures_util::stream::BoxStream;
use rand::Rng;
use reqwest::StatusCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::clock::Clock;
use crate::coordinate::BuildCoordinate;
use crate::error::{ProbeError, SourceError, UrlTemplateError};
use crate::types::Component;

/// Doubling of the probe step stops here to bound discovery latency.
const STEP_CAP: u32 = 1024;

/// Connect timeout for the shared HTTP client.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// HEAD probes are cheap; they get a tighter deadline than downloads.
const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Default response header carrying the upstream SHA-256, when present.
pub const DEFAULT_CHECKSUM_HEADER: &str = "X-Checksum-Sha256";

/// An open artifact download.
pub struct ArtifactPayload {
    /// Size promised by the server, when known.
    pub content_length: Option<u64>,
    /// Upstream SHA-256 from the checksum header, lowercased hex, when
    /// present. Absence means verification is skipped.
    pub checksum_sha256: Option<String>,
    /// The response body.
    pub stream: BoxStream<'static, Result<Bytes, SourceError>>,
}

/// Seam over the artifact repository.
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    /// Does this artifact URL exist? `Ok(false)` is the 404 case; errors are
    /// reserved for auth and transport faults.
    async fn exists(&self, url: &Url) -> Result<bool, SourceError>;

    /// Open an authenticated streaming download.
    async fn fetch(&self, url: &Url) -> Result<ArtifactPayload, SourceError>;
}

/// Retry policy for transient repository errors: capped exponential backoff
/// with full jitter.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn with_attempts(attempts: u32) -> Self {
        Self {
            attempts,
            ..Self::default()
        }
    }

    /// Sleep duration before retry `attempt` (zero-based): a uniform draw
    /// from zero up to the capped exponential ceiling.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let ceiling = self
            .base
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.cap);
        let millis = ceiling.as_millis() as u64;
        if millis == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
    }
}

/// Run `op` retrying transient failures within the policy budget.
/// Unauthorized and fatal errors surface immediately; cancellation wins over
/// any pending backoff sleep.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, SourceError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, SourceError>>,
{
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(SourceError::Cancelled);
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(SourceError::Transient(msg)) if attempt < policy.attempts => {
                let delay = policy.backoff(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, error = %msg, "transient repository error, backing off");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(SourceError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Build the artifact URL for one coordinate.
///
/// Without a per-component pattern the canonical template applies:
/// `{base}/{projectShortKey}/{componentGuid}/{branch}/Build{date}.{seq}/{name}.zip`.
/// Branch names containing `/` become nested path segments, and every
/// segment is percent-encoded on push.
pub fn build_artifact_url(
    base: &Url,
    component: &Component,
    branch: &str,
    coord: &BuildCoordinate,
) -> Result<Url, UrlTemplateError> {
    let path = match &component.url_pattern {
        Some(pattern) => expand_pattern(pattern, component, branch, coord)?,
        None => format!(
            "{}/{}/{}/{}/{}.zip",
            component.project_key,
            component.guid,
            branch,
            coord.url_segment(),
            component.name
        ),
    };
    let mut url = base.clone();
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| UrlTemplateError::InvalidBase(base.to_string()))?;
        segments.pop_if_empty();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            segments.push(segment);
        }
    }
    Ok(url)
}

/// Substitute `{branch}`, `{date}`, `{buildNumber}` and `{componentName}`
/// in a per-component pattern. Any other placeholder is a config error for
/// the tuple.
fn expand_pattern(
    pattern: &str,
    component: &Component,
    branch: &str,
    coord: &BuildCoordinate,
) -> Result<String, UrlTemplateError> {
    let mut out = String::with_capacity(pattern.len() + 32);
    let mut rest = pattern;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let tail = &rest[open + 1..];
        let Some(close) = tail.find('}') else {
            return Err(UrlTemplateError::UnknownPlaceholder {
                placeholder: tail.to_string(),
                component: component.name.clone(),
            });
        };
        match &tail[..close] {
            "branch" => out.push_str(branch),
            "date" => out.push_str(&coord.date_str()),
            "buildNumber" => out.push_str(&coord.seq().to_string()),
            "componentName" => out.push_str(&component.name),
            other => {
                return Err(UrlTemplateError::UnknownPlaceholder {
                    placeholder: other.to_string(),
                    component: component.name.clone(),
                });
            }
        }
        rest = &tail[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// reqwest-backed artifact source with basic auth.
pub struct JfrogClient {
    http: reqwest::Client,
    base: Url,
    user: String,
    pass: String,
    checksum_header: String,
}

impl JfrogClient {
    pub fn new(base: Url, user: String, pass: String) -> Result<Self, SourceError> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .use_rustls_tls()
            .build()
            .map_err(|e| SourceError::Fatal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base,
            user,
            pass,
            checksum_header: DEFAULT_CHECKSUM_HEADER.to_string(),
        })
    }

    /// Override the response header consulted for the upstream checksum.
    pub fn with_checksum_header(mut self, header: &str) -> Self {
        self.checksum_header = header.to_string();
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Probe the base URL to verify credentials and reachability. Any
    /// authenticated response, including 404, proves both.
    pub async fn check(&self) -> Result<(), SourceError> {
        let resp = self
            .http
            .head(self.base.clone())
            .basic_auth(&self.user, Some(&self.pass))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map_err(map_transport_error)?;
        match resp.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(SourceError::Unauthorized(
                format!("repository returned {}", resp.status()),
            )),
            s if s.is_server_error() => Err(SourceError::Transient(format!(
                "repository returned {s}"
            ))),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl ArtifactSource for JfrogClient {
    async fn exists(&self, url: &Url) -> Result<bool, SourceError> {
        let resp = self
            .http
            .head(url.clone())
            .basic_auth(&self.user, Some(&self.pass))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map_err(map_transport_error)?;
        map_probe_status(resp.status())
    }

    async fn fetch(&self, url: &Url) -> Result<ArtifactPayload, SourceError> {
        let resp = self
            .http
            .get(url.clone())
            .basic_auth(&self.user, Some(&self.pass))
            .send()
            .await
            .map_err(map_transport_error)?;
        if !map_probe_status(resp.status())? {
            return Err(SourceError::NotFound);
        }
        let content_length = resp.content_length();
        let checksum_sha256 = resp
            .headers()
            .get(self.checksum_header.as_str())
            .and_then(|v| v.to_str().ok())
            .map(|s| s.trim().to_ascii_lowercase());
        let stream = resp.bytes_stream().map_err(map_transport_error);
        Ok(ArtifactPayload {
            content_length,
            checksum_sha256,
            stream: Box::pin(stream),
        })
    }
}

fn map_probe_status(status: StatusCode) -> Result<bool, SourceError> {
    match status {
        s if s.is_success() => Ok(true),
        StatusCode::NOT_FOUND => Ok(false),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(SourceError::Unauthorized(
            format!("repository returned {status}"),
        )),
        s if s.is_server_error() => Err(SourceError::Transient(format!(
            "repository returned {status}"
        ))),
        _ => Err(SourceError::Fatal(format!("repository returned {status}"))),
    }
}

// Timeouts, connect failures and mid-transfer body errors are all
// retryable; auth and missing artifacts are mapped from status codes.
fn map_transport_error(err: reqwest::Error) -> SourceError {
    SourceError::Transient(err.to_string())
}

/// Latest-build discovery over an [`ArtifactSource`].
pub struct Discovery<'a> {
    pub source: &'a dyn ArtifactSource,
    pub clock: &'a dyn Clock,
    pub lookback_days: u32,
    pub retry: RetryPolicy,
}

impl Discovery<'_> {
    /// Find the greatest coordinate that exists for `(component, branch)`,
    /// starting from today's local date and walking back up to
    /// `lookback_days` days. `hint` is the latest tracked coordinate and
    /// seeds the sequence ramp when it falls on the day being probed.
    pub async fn latest_for(
        &self,
        base: &Url,
        component: &Component,
        branch: &str,
        hint: Option<BuildCoordinate>,
        cancel: &CancellationToken,
    ) -> Result<Option<BuildCoordinate>, ProbeError> {
        let mut date = self.clock.today();
        for _ in 0..=self.lookback_days {
            let start_seq = match hint {
                Some(h) if h.date() == date => h.seq() + 1,
                _ => 1,
            };

            if let Some(best) = self
                .latest_on_date(base, component, branch, date, start_seq, cancel)
                .await?
            {
                return Ok(Some(best));
            }
            // Nothing (new) on this date; if the hint lives here, it is
            // still the latest build and the caller sees "no new build".
            if let Some(h) = hint {
                if h.date() == date {
                    return Ok(Some(h));
                }
            }
            match date.pred_opt() {
                Some(prev) => date = prev,
                None => break,
            }
        }
        Ok(None)
    }

    /// Largest existing sequence on `date`, ramping exponentially from
    /// `start_seq` and binary-searching between the last hit and the first
    /// miss. `None` when not even `start_seq` exists.
    async fn latest_on_date(
        &self,
        base: &Url,
        component: &Component,
        branch: &str,
        date: chrono::NaiveDate,
        start_seq: u32,
        cancel: &CancellationToken,
    ) -> Result<Option<BuildCoordinate>, ProbeError> {
        if !self.probe(base, component, branch, date, start_seq, cancel).await? {
            return Ok(None);
        }

        let mut last_hit = start_seq;
        let mut step = 1u32;
        let mut first_miss = loop {
            let candidate = last_hit.saturating_add(step);
            if self.probe(base, component, branch, date, candidate, cancel).await? {
                last_hit = candidate;
                step = (step * 2).min(STEP_CAP);
            } else {
                break candidate;
            }
        };

        // Narrow to the largest existing sequence in (last_hit, first_miss).
        while first_miss - last_hit > 1 {
            let mid = last_hit + (first_miss - last_hit) / 2;
            if self.probe(base, component, branch, date, mid, cancel).await? {
                last_hit = mid;
            } else {
                first_miss = mid;
            }
        }

        let coord = BuildCoordinate::new(date, last_hit)
            .map_err(|e| ProbeError::Source(SourceError::Fatal(e.to_string())))?;
        Ok(Some(coord))
    }

    async fn probe(
        &self,
        base: &Url,
        component: &Component,
        branch: &str,
        date: chrono::NaiveDate,
        seq: u32,
        cancel: &CancellationToken,
    ) -> Result<bool, ProbeError> {
        let coord = BuildCoordinate::new(date, seq)
            .map_err(|e| ProbeError::Source(SourceError::Fatal(e.to_string())))?;
        let url = build_artifact_url(base, component, branch, &coord)?;
        let exists = with_retry(&self.retry, cancel, || self.source.exists(&url)).await?;
        debug!(url = %url, exists, "probed artifact");
        Ok(exists)
    }
}
