use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use reqwest::header::RETRY_AFTER;
use serde::Deserialize;

use crate::upstream::types::{
    newest_first, CatalogItem, Event, FetchOutcome, ItemId, Upstream,
};

#[derive(Debug, Deserialize)]
struct EventsBody {
    #[serde(default)]
    events: Vec<Event>,
}

/// JSON-over-HTTP provider.
///
/// `GET {base}/items/{id}/events` and `GET {base}/catalog`. 429 means rate limited,
/// 403 means blocked; both may carry a `Retry-After` header.
pub struct HttpUpstream {
    base: String,
    client: reqwest::Client,
}

impl HttpUpstream {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("catalog-watch/0.1")
            .connect_timeout(Duration::from_secs(4))
            .timeout(Duration::from_secs(10))
            .build()
            .context("building upstream http client")?;
        Ok(Self {
            base: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn fetch_events(&self, item: ItemId) -> FetchOutcome {
        let url = format!("{}/items/{item}/events", self.base);
        let t0 = std::time::Instant::now();
        let resp = match self.client.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(target: "upstream", error = ?e, item, "upstream transport error");
                return FetchOutcome::Failure { status: 0 };
            }
        };
        histogram!("upstream_fetch_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);

        let status = resp.status();
        let retry_after = parse_retry_after(
            resp.headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok()),
            Utc::now(),
        );

        match status.as_u16() {
            429 => FetchOutcome::RateLimited { retry_after },
            403 => FetchOutcome::Blocked { retry_after },
            code if !status.is_success() => FetchOutcome::Failure { status: code },
            code => match resp.json::<EventsBody>().await {
                Ok(body) => FetchOutcome::Success(newest_first(body.events)),
                Err(e) => {
                    tracing::warn!(target: "upstream", error = ?e, item, "undecodable events body");
                    counter!("upstream_decode_errors_total").increment(1);
                    FetchOutcome::Failure { status: code }
                }
            },
        }
    }

    async fn fetch_catalog(&self) -> Result<Vec<CatalogItem>> {
        let url = format!("{}/catalog", self.base);
        self.client
            .get(&url)
            .send()
            .await
            .context("catalog get()")?
            .error_for_status()
            .context("catalog non-2xx")?
            .json::<Vec<CatalogItem>>()
            .await
            .context("catalog json")
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// `Retry-After` is either delta-seconds or an HTTP date. Zero, past or garbage yields `None`.
pub fn parse_retry_after(raw: Option<&str>, now: DateTime<Utc>) -> Option<Duration> {
    let raw = raw?.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return (secs > 0).then(|| Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
    (at - now).to_std().ok().filter(|d| !d.is_zero())
}
