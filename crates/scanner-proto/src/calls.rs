//! Client for the call-polling API and the pure bookkeeping around it.
//!
//! `GET {base}/{system_id}/calls/newer?time={unix_millis}` returns
//! `{ "calls": [ { "url" | "filename", "len", "time" }, ... ] }`.
//! Everything strictly newer than `time` comes back; the caller keeps a
//! watermark and advances it past the newest call so nothing is fetched twice.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::ScannerConfig;
use crate::protocol::{deserialize_call_time, CallRecord};

#[derive(Debug, thiserror::Error)]
pub enum CallsError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("polling API returned HTTP {0}")]
    Status(u16),
    #[error("malformed response: {0}")]
    Decode(String),
}

/// Anything that can answer "which calls are newer than this instant?".
/// `CallsClient` is the real one; tests substitute a scripted source.
pub trait CallSource: Clone + Send + Sync + 'static {
    fn fetch_newer(
        &self,
        system_id: &str,
        since: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<CallRecord>, CallsError>> + Send;
}

/// Records are decoded one by one so a single bad entry cannot sink the
/// whole batch.
#[derive(Debug, Deserialize)]
struct CallsResponse {
    #[serde(default)]
    calls: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
struct CallTime {
    #[serde(deserialize_with = "deserialize_call_time")]
    time: DateTime<Utc>,
}

/// Decode what can be decoded.  A record that is malformed but still has a
/// readable `time` comes back as a silent zero-length call: it is never
/// played, but it still moves the watermark past itself.
fn decode_calls(raw: Vec<serde_json::Value>) -> Vec<CallRecord> {
    raw.into_iter()
        .filter_map(|value| match CallRecord::deserialize(&value) {
            Ok(call) => Some(call),
            Err(e) => match CallTime::deserialize(&value) {
                Ok(CallTime { time }) => {
                    warn!("[calls] unusable call at {}: {}", time, e);
                    Some(CallRecord {
                        url: None,
                        filename: None,
                        len: 0.0,
                        time,
                    })
                }
                Err(_) => {
                    warn!("[calls] dropping call without a usable time: {}", e);
                    None
                }
            },
        })
        .collect()
}

#[derive(Clone)]
pub struct CallsClient {
    http: reqwest::Client,
    api_base: String,
}

impl CallsClient {
    pub fn new(config: &ScannerConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("scannerd/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .build()?;
        Ok(Self::with_client(http, &config.api_base_url))
    }

    pub fn with_client(http: reqwest::Client, api_base: &str) -> Self {
        Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
        }
    }

    pub fn newer_url(&self, system_id: &str) -> String {
        format!("{}/{}/calls/newer", self.api_base, system_id)
    }
}

impl CallSource for CallsClient {
    async fn fetch_newer(
        &self,
        system_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<CallRecord>, CallsError> {
        let url = self.newer_url(system_id);
        let millis = since.timestamp_millis();
        debug!("[calls] GET {} time={}", url, millis);

        let resp = self
            .http
            .get(&url)
            .query(&[("time", millis)])
            .header("Accept", "application/json")
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(CallsError::Status(status.as_u16()));
        }

        let body = resp.bytes().await?;
        let parsed: CallsResponse =
            serde_json::from_slice(&body).map_err(|e| CallsError::Decode(e.to_string()))?;
        Ok(decode_calls(parsed.calls))
    }
}

/// Result of applying one fetched batch to the queue bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct CallBatch {
    /// Calls worth playing, oldest first.
    pub accepted: Vec<CallRecord>,
    /// Number of calls dropped for being too short.
    pub discarded: usize,
    /// Next watermark (`newest.time + 1ms`), `None` for an empty batch.
    pub watermark: Option<DateTime<Utc>>,
}

impl CallBatch {
    /// Filter out calls of trivial duration (`len <= min_len_secs`) and work
    /// out the next watermark.  The watermark covers every fetched call,
    /// discarded ones included, so a dropped call is never requested again.
    pub fn accept(mut calls: Vec<CallRecord>, min_len_secs: f64) -> Self {
        calls.sort_by_key(|c| c.time);

        let watermark = calls
            .last()
            .map(|newest| newest.time + chrono::Duration::milliseconds(1));

        let total = calls.len();
        let accepted: Vec<CallRecord> = calls
            .into_iter()
            .filter(|c| c.len > min_len_secs)
            .collect();

        Self {
            discarded: total - accepted.len(),
            accepted,
            watermark,
        }
    }
}
