use once_cell::sync::Lazy;
use regex::Regex;
use rust_stemmers::{Algorithm, Stemmer};
use std::collections::BTreeSet;
use url::Url;

use crate::models::Article;

static CVE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)CVE-\d{4}-\d{4,}").expect("valid CVE pattern"));

static EN_STEMMER: Lazy<Stemmer> = Lazy::new(|| Stemmer::create(Algorithm::English));

/// Suffixes aggregators append to headlines, matched case-insensitively.
const SOURCE_SUFFIXES: &[&str] = &[
    " - the hacker news",
    " - bleepingcomputer",
    " - securityweek",
    " - dark reading",
    " - krebs on security",
    " - gbhackers on security",
    " - ars technica",
    " - cisa",
    " | the hacker news",
    " | bleepingcomputer",
    " | securityweek",
];

const TRACKING_PARAMS: &[&str] = &[
    "fbclid", "gclid", "mc_cid", "mc_eid", "ref", "ref_src", "source", "cmpid", "guccounter",
];

pub(crate) const STOPWORDS: &[&str] = &[
    "a", "an", "the", "in", "on", "of", "for", "to", "and", "or", "with", "by", "at", "is",
    "are", "as", "from", "new", "its", "via",
];

/// Titles with fewer content tokens than this only compare by subsequence ratio.
const MIN_TOKENS_FOR_OVERLAP: usize = 3;

/// Identity of an article as seen by the clustering engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedKey {
    pub url_key: String,
    pub title_key: String,
    pub title_tokens: BTreeSet<String>,
    pub cve_ids: BTreeSet<String>,
}

impl NormalizedKey {
    pub fn from_article(article: &Article) -> Self {
        let title_key = normalize_title(&article.title);
        let title_tokens = title_tokens(&title_key);
        Self {
            url_key: normalize_url(&article.url),
            title_key,
            title_tokens,
            cve_ids: article.cve_ids.clone(),
        }
    }

    pub fn same_url(&self, other: &Self) -> bool {
        !self.url_key.is_empty() && self.url_key == other.url_key
    }

    pub fn shares_cve(&self, other: &Self) -> bool {
        !self.cve_ids.is_disjoint(&other.cve_ids)
    }

    /// Empty titles never match anything, including other empty titles.
    pub fn titles_match(&self, other: &Self, threshold: f64) -> bool {
        if self.title_key.is_empty() || other.title_key.is_empty() {
            return false;
        }
        if self.title_key == other.title_key {
            return true;
        }
        if token_overlap(&self.title_tokens, &other.title_tokens) >= threshold {
            return true;
        }

        // Upper bound of the subsequence ratio, skip the DP when it can't reach the threshold.
        let (la, lb) = (
            self.title_key.chars().count(),
            other.title_key.chars().count(),
        );
        let bound = 2.0 * la.min(lb) as f64 / (la + lb) as f64;
        if bound < threshold {
            return false;
        }
        sequence_ratio(&self.title_key, &other.title_key) >= threshold
    }
}

/// All distinct CVE ids in `text`, uppercased.
pub fn extract_cves(text: &str) -> BTreeSet<String> {
    CVE_PATTERN
        .find_iter(text)
        .map(|m| m.as_str().to_uppercase())
        .collect()
}

/// Purely syntactic URL key: scheme and `www.` are ignored, tracking parameters
/// and fragments dropped, remaining query pairs sorted, trailing slash removed.
pub fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    let parsed = match Url::parse(trimmed) {
        Ok(url) if url.host_str().is_some() => url,
        _ => return trimmed.trim_end_matches('/').to_lowercase(),
    };

    let host = parsed.host_str().unwrap_or_default().to_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);

    let mut key = format!("https://{}", host);
    if let Some(port) = parsed.port() {
        if port != 80 && port != 443 {
            key.push_str(&format!(":{}", port));
        }
    }
    key.push_str(parsed.path().trim_end_matches('/'));

    let mut params: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| {
            let k = k.to_lowercase();
            !k.starts_with("utm_") && !TRACKING_PARAMS.contains(&k.as_str())
        })
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if !params.is_empty() {
        params.sort();
        let query = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        key.push('?');
        key.push_str(&query);
    }

    key.to_lowercase()
}

/// Host of `raw` without a leading `www.`, or `None` when it can't be parsed.
pub fn url_host(raw: &str) -> Option<String> {
    let parsed = Url::parse(raw.trim()).ok()?;
    let host = parsed.host_str()?.to_lowercase();
    Some(host.strip_prefix("www.").unwrap_or(&host).to_string())
}

pub fn normalize_title(title: &str) -> String {
    let mut t = title.trim().to_lowercase();

    for suffix in SOURCE_SUFFIXES {
        if let Some(stripped) = t.strip_suffix(suffix) {
            t = stripped.to_string();
            break;
        }
    }

    // "[Breaking] Title" -> "Title"
    if t.starts_with('[') {
        if let Some(end) = t.find(']') {
            t = t[end + 1..].to_string();
        }
    }

    let cleaned: String = t
        .chars()
        .filter(|c| *c != '\'' && *c != '\u{2019}')
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();

    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Stemmed content words of an already-normalized title.
pub fn title_tokens(title_key: &str) -> BTreeSet<String> {
    title_key
        .split_whitespace()
        .filter(|w| !STOPWORDS.contains(w))
        .map(|w| EN_STEMMER.stem(w).into_owned())
        .collect()
}

/// Symmetric similarity in [0, 1] between two normalized titles: the larger of the
/// character subsequence ratio and the content-word overlap.
pub fn title_similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let overlap = token_overlap(&title_tokens(a), &title_tokens(b));
    sequence_ratio(a, b).max(overlap)
}

/// `2 * LCS / (len(a) + len(b))` over characters.
pub fn sequence_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }

    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];
    for ca in &a {
        for (j, cb) in b.iter().enumerate() {
            curr[j + 1] = if ca == cb {
                prev[j] + 1
            } else {
                curr[j].max(prev[j + 1])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    2.0 * prev[b.len()] as f64 / total as f64
}

fn token_overlap(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let smaller = a.len().min(b.len());
    if smaller < MIN_TOKENS_FOR_OVERLAP {
        return 0.0;
    }
    a.intersection(b).count() as f64 / smaller as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== CVE Extraction Tests ====================

    #[test]
    fn test_extract_cves_found() {
        let cves = extract_cves("Patch for CVE-2024-1234 and cve-2024-56789 released");
        let expected: BTreeSet<String> = ["CVE-2024-1234", "CVE-2024-56789"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(cves, expected);
    }

    #[test]
    fn test_extract_cves_dedupes() {
        assert_eq!(extract_cves("CVE-2024-1234, again CVE-2024-1234").len(), 1);
    }

    #[test]
    fn test_extract_cves_empty() {
        assert!(extract_cves("No CVEs here, CVE-24-1 is not one").is_empty());
    }

    // ==================== URL Normalization Tests ====================

    #[test]
    fn test_normalize_url_scheme_and_www_equivalent() {
        assert_eq!(
            normalize_url("http://www.Example.com/News/Item/"),
            normalize_url("https://example.com/news/item")
        );
    }

    #[test]
    fn test_normalize_url_strips_tracking_params() {
        assert_eq!(
            normalize_url("https://example.com/a?utm_source=rss&utm_medium=feed#top"),
            "https://example.com/a"
        );
        assert_eq!(
            normalize_url("https://example.com/a?p=42&fbclid=x"),
            "https://example.com/a?p=42"
        );
    }

    #[test]
    fn test_normalize_url_is_idempotent() {
        let once = normalize_url("https://www.example.com/Path/?b=2&a=1");
        assert_eq!(normalize_url(&once), once);
    }

    #[test]
    fn test_normalize_url_empty_and_garbage() {
        assert_eq!(normalize_url("  "), "");
        assert_eq!(normalize_url("not a url/"), "not a url");
    }

    #[test]
    fn test_url_host() {
        assert_eq!(
            url_host("https://www.bleepingcomputer.com/news/x"),
            Some("bleepingcomputer.com".to_string())
        );
        assert_eq!(url_host("::nonsense"), None);
    }

    // ==================== Title Normalization Tests ====================

    #[test]
    fn test_normalize_title_removes_suffix() {
        assert_eq!(normalize_title("Big Vuln - The Hacker News"), "big vuln");
        assert_eq!(normalize_title("Big Vuln - BleepingComputer"), "big vuln");
    }

    #[test]
    fn test_normalize_title_removes_bracket_prefix() {
        assert_eq!(normalize_title("[Breaking] Big Vuln"), "big vuln");
    }

    #[test]
    fn test_normalize_title_strips_punctuation() {
        assert_eq!(
            normalize_title("  Microsoft's  Patch-Tuesday: 60 flaws!  "),
            "microsofts patch tuesday 60 flaws"
        );
    }

    #[test]
    fn test_normalize_title_is_idempotent() {
        let once = normalize_title("[Update] Fortinet warns: FortiOS bug - SecurityWeek");
        assert_eq!(normalize_title(&once), once);
    }

    #[test]
    fn test_normalize_title_empty() {
        assert_eq!(normalize_title(""), "");
        assert_eq!(normalize_title("  ?! "), "");
    }

    // ==================== Similarity Tests ====================

    #[test]
    fn test_similarity_identical() {
        assert_eq!(title_similarity("apache struts rce", "apache struts rce"), 1.0);
    }

    #[test]
    fn test_similarity_disjoint() {
        let score = title_similarity("apple releases ios update", "google patches android flaw");
        assert!(score < 0.5, "score was {}", score);
    }

    #[test]
    fn test_similarity_small_edit() {
        let score = title_similarity(
            "critical vulnerability in linux kernel",
            "critical vulnerabilities in linux kernel",
        );
        assert!(score > 0.9, "score was {}", score);
    }

    #[test]
    fn test_similarity_reordered_headline() {
        let a = normalize_title("Critical RCE in Apache Struts");
        let b = normalize_title("Apache Struts RCE flaw disclosed");
        assert!(title_similarity(&a, &b) >= 0.75);
    }

    #[test]
    fn test_similarity_is_symmetric() {
        let a = "fortinet patches fortios flaw";
        let b = "fortios zero day exploited";
        assert_eq!(title_similarity(a, b), title_similarity(b, a));
    }

    #[test]
    fn test_similarity_empty_never_raises() {
        assert_eq!(title_similarity("", ""), 1.0);
        assert_eq!(title_similarity("", "something"), 0.0);
    }

    #[test]
    fn test_sequence_ratio_bounds() {
        assert_eq!(sequence_ratio("abc", "abc"), 1.0);
        assert_eq!(sequence_ratio("abc", "xyz"), 0.0);
    }

    // ==================== NormalizedKey Tests ====================

    #[test]
    fn test_empty_titles_never_match() {
        let a = NormalizedKey::from_article(&Article::new("https://a.com/1", "", "A"));
        let b = NormalizedKey::from_article(&Article::new("https://b.com/2", "", "B"));
        assert!(!a.titles_match(&b, 0.75));
        assert!(!a.same_url(&b));
    }

    #[test]
    fn test_key_is_deterministic() {
        let article = Article::new(
            "https://www.example.com/a/?utm_source=x",
            "CVE-2025-0001 exploited - SecurityWeek",
            "SecurityWeek",
        );
        assert_eq!(
            NormalizedKey::from_article(&article),
            NormalizedKey::from_article(&article)
        );
    }
}
