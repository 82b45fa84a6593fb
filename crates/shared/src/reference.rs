use anyhow::{Context, Result};
use reqwest::Client;
use scraper::{Html, Selector};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::info;
use url::Url;

use crate::formatter::MAX_URLS;
use crate::gap::ReferenceItem;
use crate::models::{Article, RankedGroup};
use crate::normalize::NormalizedKey;

/// One headline and link as it appears in a rendered digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestEntry {
    pub title: String,
    pub url: String,
}

/// Scrapes every link with visible text from a reference page.
pub async fn fetch_reference(url: &str) -> Result<Vec<ReferenceItem>> {
    let client = Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .user_agent("security-digest/1.0")
        .build()
        .context("Failed to create HTTP client")?;

    let response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("Failed to fetch reference page {}", url))?;

    let status = response.status();
    if !status.is_success() {
        anyhow::bail!("Reference page returned HTTP {}", status);
    }

    let html = response.text().await.context("Failed to read reference page")?;
    let items = extract_links(&html);
    info!(url, items = items.len(), "collected reference links");
    Ok(items)
}

/// Absolute http(s) links with non-empty text, first occurrence of each href kept.
pub fn extract_links(html: &str) -> Vec<ReferenceItem> {
    let document = Html::parse_document(html);
    let Ok(selector) = Selector::parse("a[href]") else {
        return Vec::new();
    };

    let mut seen = HashSet::new();
    let mut items = Vec::new();

    for element in document.select(&selector) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        let Ok(link) = Url::parse(href.trim()) else {
            continue;
        };
        if link.scheme() != "http" && link.scheme() != "https" {
            continue;
        }

        let title = element.text().collect::<Vec<_>>().join(" ");
        let title = title.split_whitespace().collect::<Vec<_>>().join(" ");
        if title.is_empty() {
            continue;
        }

        let href = link.to_string();
        if seen.insert(href.clone()) {
            items.push(ReferenceItem::new(title, href));
        }
    }

    items
}

/// Reads `title<TAB>url` lines or bare URLs; blank lines and `#` comments are skipped.
pub fn load_reference_file(path: &Path) -> Result<Vec<ReferenceItem>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read reference file {}", path.display()))?;
    Ok(parse_reference_list(&content))
}

pub fn parse_reference_list(content: &str) -> Vec<ReferenceItem> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| match line.split_once('\t') {
            Some((title, url)) => ReferenceItem::new(title.trim(), url.trim()),
            None => ReferenceItem::new("", line),
        })
        .collect()
}

/// Pulls `### Title` headings and the `- <url>` lines under them out of a digest.
pub fn parse_digest_markdown(text: &str) -> Vec<DigestEntry> {
    let mut entries = Vec::new();
    let mut current_title: Option<String> = None;

    for line in text.lines() {
        let line = line.trim();
        if let Some(title) = line.strip_prefix("### ") {
            current_title = Some(title.trim().to_string());
        } else if line.starts_with("## ") || line.starts_with("# ") {
            current_title = None;
        } else if let Some(rest) = line.strip_prefix("- ") {
            let Some(title) = &current_title else { continue };
            let url = rest.trim().trim_start_matches('<').trim_end_matches('>');
            if url.starts_with("http://") || url.starts_with("https://") {
                entries.push(DigestEntry {
                    title: title.clone(),
                    url: url.to_string(),
                });
            }
        }
    }

    entries
}

/// Digest entries for the URLs a rendered digest would list for a run's output.
pub fn entries_from_output(output: &[RankedGroup]) -> Vec<DigestEntry> {
    output
        .iter()
        .flat_map(|ranked| {
            let title = ranked.display_title().to_string();
            ranked.group.urls().into_iter().take(MAX_URLS).map(move |url| DigestEntry {
                title: title.clone(),
                url: url.to_string(),
            })
        })
        .collect()
}

/// Reference items not covered by any digest entry, by URL key or title similarity.
pub fn find_gaps(
    reference: &[ReferenceItem],
    entries: &[DigestEntry],
    threshold: f64,
) -> Vec<ReferenceItem> {
    let entry_keys: Vec<NormalizedKey> = entries
        .iter()
        .map(|e| NormalizedKey::from_article(&Article::new(&e.url, &e.title, "")))
        .collect();

    reference
        .iter()
        .filter(|item| {
            let key = NormalizedKey::from_article(&Article::new(&item.url, &item.title, ""));
            !entry_keys
                .iter()
                .any(|entry| key.same_url(entry) || key.titles_match(entry, threshold))
        })
        .cloned()
        .collect()
}
