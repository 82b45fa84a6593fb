use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::config::FeedConfig;
use crate::models::Article;

static CVSS_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bcvss(?:\s*v?[23](?:\.\d)?)?(?:\s+base)?(?:\s+score)?(?:\s+of)?\s*[:=]?\s*(\d{1,2}(?:\.\d)?)")
        .expect("valid CVSS pattern")
});

static KEV_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bkev\b|known exploited|actively exploited|exploited in the wild")
        .expect("valid KEV pattern")
});

static ZERO_DAY_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bzero[- ]?day\b|\b0[- ]?day\b|ゼロデイ").expect("valid zero-day pattern")
});

const SUMMARY_WIDTH: usize = 10_000;

pub struct FeedFetcher {
    client: Client,
    semaphore: Arc<Semaphore>,
}

impl FeedFetcher {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .user_agent("security-digest/1.0")
            .build()
            .context("Failed to create HTTP client")?;

        let semaphore = Arc::new(Semaphore::new(8));

        Ok(Self { client, semaphore })
    }

    /// Fetches every feed; feeds that keep failing are logged and skipped.
    /// Articles come back in feed order.
    pub async fn fetch_all(&self, feeds: &[FeedConfig]) -> Vec<Article> {
        let results: Vec<Vec<Article>> = stream::iter(feeds)
            .map(|feed| async move {
                match self.fetch_feed(feed).await {
                    Ok(articles) => articles,
                    Err(e) => {
                        warn!(feed = %feed.name, error = %e, "failed to fetch feed");
                        Vec::new()
                    }
                }
            })
            .buffered(8)
            .collect()
            .await;

        let articles: Vec<Article> = results.into_iter().flatten().collect();
        info!(feeds = feeds.len(), articles = articles.len(), "fetched feeds");
        articles
    }

    pub async fn fetch_feed(&self, feed: &FeedConfig) -> Result<Vec<Article>> {
        let _permit = self.semaphore.acquire().await?;

        let mut last_error = None;
        for attempt in 0..3 {
            match self.try_fetch(&feed.url).await {
                Ok(body) => return parse_feed(&body, feed),
                Err(e) => {
                    debug!(feed = %feed.name, attempt, error = %e, "feed fetch attempt failed");
                    last_error = Some(e);
                    let backoff = std::time::Duration::from_millis(500 * 2_u64.pow(attempt));
                    tokio::time::sleep(backoff).await;
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("Failed to fetch {}", feed.url)))
    }

    async fn try_fetch(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to send HTTP request")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("HTTP error: {}", status);
        }

        let body = response.bytes().await.context("Failed to read response body")?;
        Ok(body.to_vec())
    }
}

/// Parses an RSS or Atom document into articles attributed to `feed`.
pub fn parse_feed(body: &[u8], feed: &FeedConfig) -> Result<Vec<Article>> {
    let parsed = feed_rs::parser::parse(body)
        .with_context(|| format!("Failed to parse feed {}", feed.url))?;

    let articles = parsed
        .entries
        .into_iter()
        .map(|entry| {
            let title = entry
                .title
                .map(|t| t.content.trim().to_string())
                .unwrap_or_default();
            let url = entry
                .links
                .first()
                .map(|l| l.href.trim().to_string())
                .unwrap_or_default();
            let summary_html = entry
                .summary
                .map(|s| s.content)
                .or_else(|| entry.content.and_then(|c| c.body))
                .unwrap_or_default();
            let published_at = entry.published.or(entry.updated);
            if published_at.is_none() {
                debug!(feed = %feed.name, title = %title, "entry has no usable date");
            }

            let mut article = Article::new(url, title, feed.name.clone())
                .with_lang(feed.lang.clone())
                .with_summary(clean_summary(&summary_html));
            article.published_at = published_at;
            detect_signals(article)
        })
        .collect();

    Ok(articles)
}

fn clean_summary(html: &str) -> String {
    if html.trim().is_empty() {
        return String::new();
    }
    let text = html2text::from_read(html.as_bytes(), SUMMARY_WIDTH);
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Fills CVSS, KEV and zero-day flags from the title and summary text.
pub fn detect_signals(mut article: Article) -> Article {
    let text = format!("{} {}", article.title, article.summary_raw);

    let cvss = CVSS_PATTERN
        .captures_iter(&text)
        .filter_map(|c| c.get(1)?.as_str().parse::<f64>().ok())
        .filter(|v| (0.0..=10.0).contains(v))
        .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |m| m.max(v))));
    if let Some(score) = cvss {
        article.cvss = Some(article.cvss.map_or(score, |existing| existing.max(score)));
    }

    article.kev |= KEV_PATTERN.is_match(&text);
    article.zero_day |= ZERO_DAY_PATTERN.is_match(&text);
    article
}

/// Start of the window; `None` when `window_days` reaches past the representable range.
pub fn window_start(window_days: i64, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    Duration::try_days(window_days).and_then(|days| now.checked_sub_signed(days))
}

/// Whether `published_at` lies in `[now - window_days, now]`. Undated items count as inside.
pub fn within_window(published_at: Option<DateTime<Utc>>, window_days: i64, now: DateTime<Utc>) -> bool {
    match published_at {
        Some(at) => window_start(window_days, now).map_or(true, |start| at >= start) && at <= now,
        None => true,
    }
}

/// Splits fetched articles into (inside, outside) the time window.
pub fn split_by_window(
    articles: &[Article],
    window_days: i64,
    now: DateTime<Utc>,
) -> (Vec<Article>, Vec<Article>) {
    articles
        .iter()
        .cloned()
        .partition(|a| within_window(a.published_at, window_days, now))
}
