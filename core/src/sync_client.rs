/// Rate-limited sync client for the notification server
///
/// Two gates sit in front of every network call: a local minimum interval and
/// a server-issued backoff (`rate_limited_until`). Both entry points share one
/// `SyncWindow`, so a 429 seen by either path throttles both.
use crate::config::SyncConfig;
use crate::error::{NotifyError, Result};
use crate::event::NotificationPage;
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{ACCEPT, AUTHORIZATION, RETRY_AFTER};
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
/// Longest server-requested backoff we honour
pub const MAX_RATE_LIMIT_WAIT: Duration = Duration::from_secs(3600);

/// Server collaborator serving `GET /notifications`
#[async_trait]
pub trait NotificationApi: Send + Sync {
    /// Fetch one page. A 429 must surface as `NotifyError::RateLimited`.
    async fn fetch_notifications(&self, page: u32, limit: u32) -> Result<NotificationPage>;
}

/// `NotificationApi` over plain HTTP/1.1
pub struct HttpNotificationApi {
    base_url: String,
    auth_token: Option<String>,
    client: Client<HttpConnector, Full<Bytes>>,
}

impl HttpNotificationApi {
    pub fn new(base_url: impl Into<String>, auth_token: Option<String>) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth_token,
            client,
        }
    }
}

#[async_trait]
impl NotificationApi for HttpNotificationApi {
    async fn fetch_notifications(&self, page: u32, limit: u32) -> Result<NotificationPage> {
        let url = format!("{}/notifications?page={}&limit={}", self.base_url, page, limit);
        let uri: hyper::Uri = url
            .parse()
            .map_err(|e| NotifyError::Http(format!("Invalid URL {}: {}", url, e)))?;

        let mut builder = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .header(ACCEPT, "application/json");
        if let Some(token) = &self.auth_token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        let request = builder
            .body(Full::new(Bytes::new()))
            .map_err(|e| NotifyError::Http(format!("Failed to build request: {}", e)))?;

        let response = timeout(REQUEST_TIMEOUT, self.client.request(request))
            .await
            .map_err(|_| NotifyError::Http(format!("Request to {} timed out", url)))?
            .map_err(|e| NotifyError::Http(format!("Request to {} failed: {}", url, e)))?;

        let status = response.status();
        let header_wait = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| NotifyError::Http(format!("Failed to read body: {}", e)))?
            .to_bytes();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = header_wait.or_else(|| retry_after_from_body(&body));
            return Err(NotifyError::RateLimited { retry_after });
        }
        if !status.is_success() {
            return Err(NotifyError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).chars().take(200).collect(),
            });
        }

        Ok(serde_json::from_slice(&body)?)
    }
}

/// `Retry-After` in delta-seconds
fn parse_retry_after(value: &str) -> Option<Duration> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .map(|wait| wait.min(MAX_RATE_LIMIT_WAIT))
}

fn retry_after_from_body(body: &[u8]) -> Option<Duration> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    value
        .get("retryAfter")
        .and_then(serde_json::Value::as_f64)
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .map(|wait| wait.min(MAX_RATE_LIMIT_WAIT))
}

/// Fetch pacing state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncWindow {
    pub last_fetch_at: Option<Instant>,
    pub rate_limited_until: Option<Instant>,
    pub min_interval: Duration,
    pub background_interval: Duration,
}

impl SyncWindow {
    fn new(config: &SyncConfig) -> Self {
        Self {
            last_fetch_at: None,
            rate_limited_until: None,
            min_interval: config.min_interval,
            background_interval: config.background_min_interval,
        }
    }

    fn skip_reason(&self, now: Instant, min_interval: Duration) -> Option<&'static str> {
        if matches!(self.rate_limited_until, Some(until) if now < until) {
            return Some("server backoff active");
        }
        if matches!(self.last_fetch_at, Some(last) if now.duration_since(last) < min_interval) {
            return Some("minimum interval not elapsed");
        }
        None
    }
}

/// Sync client shared by the badge store and the poller
#[derive(Clone)]
pub struct SyncClient {
    api: Arc<dyn NotificationApi>,
    window: Arc<Mutex<SyncWindow>>,
    rate_limit_fallback: Duration,
}

impl SyncClient {
    pub fn new(api: Arc<dyn NotificationApi>, config: &SyncConfig) -> Self {
        Self {
            api,
            window: Arc::new(Mutex::new(SyncWindow::new(config))),
            rate_limit_fallback: config.rate_limit_fallback,
        }
    }

    /// Fetch a page. `Ok(None)` means skipped (paced or rate limited), not failed.
    pub async fn fetch(&self, page: u32, limit: u32, force: bool) -> Result<Option<NotificationPage>> {
        let min_interval = self.window().min_interval;
        self.fetch_paced(page, limit, force, min_interval).await
    }

    /// Opportunistic refresh on app foreground. Shorter interval, same backoff.
    pub async fn background_fetch(&self, page: u32, limit: u32) -> Result<Option<NotificationPage>> {
        let min_interval = self.window().background_interval;
        self.fetch_paced(page, limit, false, min_interval).await
    }

    async fn fetch_paced(
        &self,
        page: u32,
        limit: u32,
        force: bool,
        min_interval: Duration,
    ) -> Result<Option<NotificationPage>> {
        {
            let mut window = self.lock_window();
            let now = Instant::now();
            if !force {
                if let Some(reason) = window.skip_reason(now, min_interval) {
                    debug!("Skipping fetch of page {}: {}", page, reason);
                    return Ok(None);
                }
            }
            window.last_fetch_at = Some(now);
        }

        match self.api.fetch_notifications(page, limit).await {
            Ok(result) => {
                self.lock_window().rate_limited_until = None;
                debug!(
                    "Fetched page {} ({} notifications, {} unread)",
                    page,
                    result.notifications.len(),
                    result.unread_count
                );
                Ok(Some(result))
            }
            Err(NotifyError::RateLimited { retry_after }) => {
                let wait = retry_after
                    .unwrap_or(self.rate_limit_fallback)
                    .min(MAX_RATE_LIMIT_WAIT);
                let now = Instant::now();
                let until = now
                    .checked_add(wait)
                    .or_else(|| now.checked_add(self.rate_limit_fallback))
                    .unwrap_or(now);
                self.lock_window().rate_limited_until = Some(until);
                warn!("Notification server rate limited us; backing off for {:?}", wait);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Snapshot of the pacing state
    pub fn window(&self) -> SyncWindow {
        *self.lock_window()
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self.window().rate_limited_until, Some(until) if Instant::now() < until)
    }

    /// Forget pacing state (logout)
    pub fn reset(&self) {
        let mut window = self.lock_window();
        window.last_fetch_at = None;
        window.rate_limited_until = None;
        info!("Sync window reset");
    }

    fn lock_window(&self) -> MutexGuard<'_, SyncWindow> {
        // SyncWindow is plain data; a poisoned guard is still consistent
        self.window.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
