//! Rate-limited Steam storefront client.
//!
//! One client per credential. A minimum inter-request interval is enforced
//! across every outbound call the client issues, and transient failures are
//! retried with exponential backoff plus jitter. The backoff schedule and the
//! sleep primitive are both injected so retry behavior is unit-testable
//! without real delays.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{error, warn};

use crate::util::env as env_util;

const USER_AGENT: &str = "steam-harvest/0.1 (catalog ETL)";
const APP_LIST_URL: &str = "https://api.steampowered.com/ISteamApps/GetAppList/v2/";

/// Typed failure for a single work item.
///
/// `Transient` covers network errors, timeouts, non-200 statuses and
/// malformed bodies; the client retries these. `Permanent` covers hard HTTP
/// rejections (401/403/404) and exhausted retries; the item is recorded as
/// failed and becomes eligible for a later backfill pass.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transient source failure: {0}")]
    Transient(String),
    #[error("permanent source failure: {0}")]
    Permanent(String),
}

/// One appdetails response node, validated once at the harvest boundary.
/// The storefront encodes delisted/restricted content as `success: false`
/// with no payload; that is an expected outcome, not a transport error.
#[derive(Debug, Clone)]
pub enum ApiRecord {
    Success { data: Value },
    Failure,
}

impl ApiRecord {
    pub fn from_node(node: &Value) -> Self {
        let success = node.get("success").and_then(Value::as_bool).unwrap_or(false);
        match node.get("data") {
            Some(data) if success && data.is_object() => ApiRecord::Success { data: data.clone() },
            _ => ApiRecord::Failure,
        }
    }

    /// Raw batch representation, shaped like the source response with the
    /// fetch timestamp added.
    pub fn into_raw(self, fetched_at: DateTime<Utc>) -> Value {
        match self {
            ApiRecord::Success { data } => json!({
                "success": true,
                "data": data,
                "fetched_at": fetched_at.to_rfc3339(),
            }),
            ApiRecord::Failure => json!({
                "success": false,
                "fetched_at": fetched_at.to_rfc3339(),
            }),
        }
    }
}

/// Retry schedule as a value object: delay for attempt `n` (zero-based) is
/// `base_delay^n + jitter * rand(0..1)`, matching the collector's geometric
/// growth (1s, 5s, 25s with the defaults).
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
            jitter: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn from_env() -> Self {
        Self {
            max_attempts: env_util::env_parse("API_MAX_RETRIES", 3u32),
            base_delay: Duration::from_secs_f64(env_util::env_parse("API_BACKOFF_BASE_SECONDS", 5.0)),
            jitter: Duration::from_secs_f64(env_util::env_parse("API_BACKOFF_JITTER_SECONDS", 0.5)),
        }
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self
            .base_delay
            .as_secs_f64()
            .powi(attempt.min(8) as i32)
            .min(300.0);
        let jitter = self.jitter.mul_f64(rand::thread_rng().gen::<f64>());
        Duration::from_secs_f64(base) + jitter
    }
}

/// Sleep seam so retry/pacing tests run without wall-clock time.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug, Deserialize)]
struct AppListResp {
    applist: AppList,
}
#[derive(Debug, Deserialize)]
struct AppList {
    apps: Vec<AppEntry>,
}
#[derive(Debug, Deserialize)]
pub struct AppEntry {
    pub appid: i64,
    pub name: String,
}

pub struct SteamClient {
    http: reqwest::Client,
    policy: RetryPolicy,
    min_interval: Duration,
    sleeper: Arc<dyn Sleeper>,
    last_request: Mutex<Option<Instant>>,
}

impl SteamClient {
    pub fn new(policy: RetryPolicy, min_interval: Duration) -> Result<Self> {
        Self::with_sleeper(policy, min_interval, Arc::new(TokioSleeper))
    }

    pub fn with_sleeper(
        policy: RetryPolicy,
        min_interval: Duration,
        sleeper: Arc<dyn Sleeper>,
    ) -> Result<Self> {
        let timeout = Duration::from_secs(env_util::env_parse("API_HTTP_TIMEOUT_SECS", 20u64));
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .context("building http client")?;
        Ok(Self {
            http,
            policy,
            min_interval,
            sleeper,
            last_request: Mutex::new(None),
        })
    }

    pub fn from_env() -> Result<Self> {
        let min_interval =
            Duration::from_secs_f64(env_util::env_parse("API_DELAY_SECONDS", 1.5f64));
        Self::new(RetryPolicy::from_env(), min_interval)
    }

    // Per-credential pacing: wait out the remainder of the minimum interval
    // before any outbound request. Serialized through a mutex so concurrent
    // callers on the same credential cannot interleave below the floor.
    async fn pace(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                self.sleeper.sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    /// GET a JSON document with pacing and bounded retries. Exhausting the
    /// retry budget yields `Permanent` for this attempt; the caller records
    /// the item as failed and moves on.
    async fn get_json(&self, url: &str) -> Result<Value, FetchError> {
        let mut last_reason = String::new();
        for attempt in 0..self.policy.max_attempts {
            if attempt > 0 {
                self.sleeper.sleep(self.policy.backoff(attempt - 1)).await;
            }
            self.pace().await;
            match self.http.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        match resp.json::<Value>().await {
                            Ok(body) => return Ok(body),
                            Err(e) => {
                                last_reason = format!("malformed body: {e}");
                                warn!(url, attempt, error = %e, "malformed response body; retrying");
                            }
                        }
                    } else if matches!(status.as_u16(), 401 | 403 | 404) {
                        return Err(FetchError::Permanent(format!("HTTP {status}")));
                    } else if status.as_u16() == 429 {
                        last_reason = "rate limited (HTTP 429)".into();
                        warn!(url, attempt, "rate limited; backing off before retry");
                    } else {
                        last_reason = format!("HTTP {status}");
                        warn!(url, attempt, %status, "server error; retrying");
                    }
                }
                Err(e) => {
                    last_reason = format!("network error: {e}");
                    warn!(url, attempt, error = %e, "network error; retrying");
                }
            }
        }
        error!(url, attempts = self.policy.max_attempts, reason = %last_reason, "retries exhausted");
        Err(FetchError::Permanent(format!(
            "exhausted {} attempts: {last_reason}",
            self.policy.max_attempts
        )))
    }

    /// Fetch the appdetails node for one appid. The response keys the node
    /// by the appid as a string; a missing node is a permanent failure.
    pub async fn app_details(&self, appid: i64) -> Result<ApiRecord, FetchError> {
        let url = format!("https://store.steampowered.com/api/appdetails?appids={appid}");
        let body = self.get_json(&url).await?;
        match body.get(appid.to_string()) {
            Some(node) => Ok(ApiRecord::from_node(node)),
            None => Err(FetchError::Permanent("appdetails node missing".into())),
        }
    }

    /// Fetch the review summary page for one appid. `Ok(None)` means the
    /// endpoint answered but had nothing usable (application-level failure
    /// or zero reviews), which is checkpointed as done without a payload.
    pub async fn app_reviews(&self, appid: i64) -> Result<Option<Value>, FetchError> {
        let url = format!(
            "https://store.steampowered.com/appreviews/{appid}?json=1&num_per_page=100&language=all"
        );
        match self.get_json(&url).await {
            Ok(body) => {
                let success = body.get("success").and_then(Value::as_i64) == Some(1);
                let has_reviews = body
                    .get("reviews")
                    .and_then(Value::as_array)
                    .is_some_and(|r| !r.is_empty());
                if success && has_reviews {
                    Ok(Some(body))
                } else {
                    Ok(None)
                }
            }
            // Restricted/unavailable review pages are common; treat a hard
            // rejection as "no reviews" rather than a failed work item.
            Err(FetchError::Permanent(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Full catalog listing. Cached to `cache_path` on first fetch so the
    /// work queue is deterministic across restarts.
    pub async fn app_list(&self, cache_path: &std::path::Path) -> Result<Vec<i64>> {
        if cache_path.exists() {
            let raw = std::fs::read_to_string(cache_path)
                .with_context(|| format!("reading app list cache {}", cache_path.display()))?;
            let apps: Vec<AppEntry> = serde_json::from_str(&raw).context("parsing app list cache")?;
            return Ok(dedup_appids(apps));
        }
        let body = self
            .get_json(APP_LIST_URL)
            .await
            .map_err(|e| anyhow::anyhow!("fetching app list: {e}"))?;
        let parsed: AppListResp =
            serde_json::from_value(body).context("parsing app list response")?;
        let raw = serde_json::to_string(&json!(parsed
            .applist
            .apps
            .iter()
            .map(|a| json!({"appid": a.appid, "name": a.name}))
            .collect::<Vec<_>>()))?;
        if let Some(parent) = cache_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(cache_path, raw)
            .with_context(|| format!("caching app list to {}", cache_path.display()))?;
        Ok(dedup_appids(parsed.applist.apps))
    }
}

fn dedup_appids(apps: Vec<AppEntry>) -> Vec<i64> {
    let mut seen = std::collections::HashSet::with_capacity(apps.len());
    apps.into_iter()
        .map(|a| a.appid)
        .filter(|id| seen.insert(*id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// Records requested sleeps instead of waiting them out.
    struct RecordingSleeper {
        slept: StdMutex<Vec<Duration>>,
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.slept.lock().unwrap().push(duration);
        }
    }

    #[tokio::test]
    async fn pacing_waits_out_the_remaining_interval() {
        let sleeper = Arc::new(RecordingSleeper {
            slept: StdMutex::new(Vec::new()),
        });
        let client = SteamClient::with_sleeper(
            RetryPolicy::default(),
            Duration::from_millis(100),
            sleeper.clone(),
        )
        .unwrap();

        client.pace().await;
        client.pace().await;

        let slept = sleeper.slept.lock().unwrap();
        // First call has no predecessor; second waits the interval remainder.
        assert_eq!(slept.len(), 1);
        assert!(slept[0] <= Duration::from_millis(100));
        assert!(slept[0] > Duration::ZERO);
    }

    #[test]
    fn backoff_grows_geometrically_with_bounded_jitter() {
        let policy = RetryPolicy::default();
        for attempt in 0..3u32 {
            let expected = 5f64.powi(attempt as i32);
            let d = policy.backoff(attempt).as_secs_f64();
            assert!(d >= expected, "attempt {attempt}: {d} < {expected}");
            assert!(d < expected + 0.5, "attempt {attempt}: {d} jitter too large");
        }
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            ..RetryPolicy::default()
        };
        assert!(policy.backoff(9).as_secs_f64() <= 300.5);
    }

    #[test]
    fn api_record_requires_success_and_payload() {
        let ok = serde_json::json!({"success": true, "data": {"steam_appid": 10}});
        assert!(matches!(ApiRecord::from_node(&ok), ApiRecord::Success { .. }));

        let delisted = serde_json::json!({"success": false});
        assert!(matches!(ApiRecord::from_node(&delisted), ApiRecord::Failure));

        // success:true with a missing payload is still a failure record;
        // primary entities are never created speculatively.
        let hollow = serde_json::json!({"success": true});
        assert!(matches!(ApiRecord::from_node(&hollow), ApiRecord::Failure));
    }

    #[test]
    fn raw_form_round_trips_success_flag() {
        let now = Utc::now();
        let raw = ApiRecord::Success {
            data: serde_json::json!({"steam_appid": 10}),
        }
        .into_raw(now);
        assert_eq!(raw["success"], Value::Bool(true));
        assert_eq!(raw["data"]["steam_appid"], 10);
        assert!(raw["fetched_at"].is_string());

        let raw = ApiRecord::Failure.into_raw(now);
        assert_eq!(raw["success"], Value::Bool(false));
        assert!(raw.get("data").is_none());
    }

    #[test]
    fn dedup_preserves_first_occurrence_order() {
        let apps = vec![
            AppEntry { appid: 10, name: "a".into() },
            AppEntry { appid: 20, name: "b".into() },
            AppEntry { appid: 10, name: "a again".into() },
        ];
        assert_eq!(dedup_appids(apps), vec![10, 20]);
    }
}
