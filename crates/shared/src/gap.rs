//! Explains why a known article is missing from a digest run.
//!
//! Causes are checked in a fixed order and the first one that applies wins:
//! outside_window, feed_missing, dedup_merged, interest_filtered, low_rank.
//! An item can satisfy several of them; the earliest is the most actionable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::config::{DigestConfig, FeedConfig};
use crate::fetcher::{window_start, within_window};
use crate::interests::InterestFilter;
use crate::models::Article;
use crate::normalize::{normalize_title, url_host, NormalizedKey, STOPWORDS};
use crate::pipeline::PipelineRun;

/// Words too generic to be useful as interest keywords.
const GENERIC_WORDS: &[&str] = &[
    "security", "vulnerability", "vulnerabilities", "flaw", "flaws", "bug", "bugs", "update",
    "updates", "patch", "patches", "attack", "attacks", "new", "report", "warns", "says",
    "after", "over", "about", "this", "that", "into", "more",
];

const REPORT_ITEMS_PER_CAUSE: usize = 10;

/// A known article (title and URL) from an outside source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceItem {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
}

impl ReferenceItem {
    pub fn new(title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
            published_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapCause {
    OutsideWindow,
    FeedMissing,
    DedupMerged,
    InterestFiltered,
    LowRank,
}

impl GapCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            GapCause::OutsideWindow => "outside_window",
            GapCause::FeedMissing => "feed_missing",
            GapCause::DedupMerged => "dedup_merged",
            GapCause::InterestFiltered => "interest_filtered",
            GapCause::LowRank => "low_rank",
        }
    }
}

impl fmt::Display for GapCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the operator could change. `feed_entry`/`keyword` are set only when the
/// fix can be applied mechanically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggestedFix {
    pub feed_entry: Option<FeedConfig>,
    pub keyword: Option<String>,
    pub note: String,
}

impl SuggestedFix {
    fn note(note: impl Into<String>) -> Self {
        Self {
            feed_entry: None,
            keyword: None,
            note: note.into(),
        }
    }

    pub fn is_applicable(&self) -> bool {
        self.feed_entry.is_some() || self.keyword.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gap {
    pub reference_title: String,
    pub reference_url: String,
    pub cause: GapCause,
    pub detail: String,
    pub suggested_fix: SuggestedFix,
}

/// Diagnoses reference items against one pipeline run.
pub struct GapAnalyzer<'a> {
    config: &'a DigestConfig,
    run: &'a PipelineRun,
    now: DateTime<Utc>,
}

impl<'a> GapAnalyzer<'a> {
    pub fn new(config: &'a DigestConfig, run: &'a PipelineRun, now: DateTime<Utc>) -> Self {
        Self { config, run, now }
    }

    pub fn diagnose_all(&self, items: &[ReferenceItem]) -> Vec<Gap> {
        items.iter().map(|item| self.diagnose(item)).collect()
    }

    pub fn diagnose(&self, item: &ReferenceItem) -> Gap {
        let reference = NormalizedKey::from_article(&Article::new(&item.url, &item.title, ""));
        let same_url = |article: &Article| reference.same_url(&NormalizedKey::from_article(article));
        let same_title = |article: &Article| {
            reference.titles_match(
                &NormalizedKey::from_article(article),
                self.config.similarity_threshold,
            )
        };

        let host = url_host(&item.url);
        let host_note = if host.is_none() {
            format!("Could not parse a host from '{}'. ", item.url)
        } else {
            String::new()
        };
        let gap = |cause, detail: String, suggested_fix| Gap {
            reference_title: item.title.clone(),
            reference_url: item.url.clone(),
            cause,
            detail: format!("{}{}", host_note, detail),
            suggested_fix,
        };

        // An exact URL hit beats a similar headline elsewhere
        let fetched = self
            .run
            .fetched
            .iter()
            .find(|a| same_url(*a))
            .or_else(|| self.run.fetched.iter().find(|a| same_title(*a)));

        // 1. outside_window
        if let Some(published) = item.published_at.or_else(|| fetched.and_then(|a| a.published_at)) {
            let window_days = self.run.window_days;
            if !within_window(Some(published), window_days, self.now) {
                let since = window_start(window_days, self.now)
                    .map_or("any date".to_string(), |s| s.format("%Y-%m-%d %H:%M UTC").to_string());
                return gap(
                    GapCause::OutsideWindow,
                    format!(
                        "Published {}, outside the run's {}-day window (since {}).",
                        published.format("%Y-%m-%d %H:%M UTC"),
                        window_days,
                        since
                    ),
                    SuggestedFix::note(format!(
                        "Increase window_days (the run used {}) if items this old should be covered.",
                        window_days
                    )),
                );
            }
        }

        let clustered = self
            .run
            .group_of(|a| same_url(a))
            .or_else(|| self.run.group_of(|a| same_title(a)));

        // 2. feed_missing
        if clustered.is_none() && fetched.is_none() {
            match &host {
                Some(h) if !self.config.feed_hosts().contains(h) => {
                    return gap(
                        GapCause::FeedMissing,
                        format!(
                            "No configured feed is hosted on {} and the article was not fetched.",
                            h
                        ),
                        SuggestedFix {
                            feed_entry: Some(draft_feed_entry(h)),
                            keyword: None,
                            note: format!("Add a feed for {} (verify the guessed feed URL).", h),
                        },
                    );
                }
                None => {
                    return gap(
                        GapCause::FeedMissing,
                        "The article was not fetched from any configured feed.".to_string(),
                        SuggestedFix::note("Find the publisher's RSS feed and add it manually."),
                    );
                }
                Some(_) => {}
            }
        }

        // 3. dedup_merged
        if let Some((group_id, member)) = clustered {
            let group = &self.run.groups[group_id];
            if group.representative != member {
                let rep = group.representative();
                let mut rules: Vec<String> = group
                    .merge_reasons
                    .iter()
                    .filter(|r| r.left == member || r.right == member)
                    .map(|r| r.rule.to_string())
                    .collect();
                if rules.is_empty() {
                    rules = group.merge_rules().iter().map(|r| r.to_string()).collect();
                }
                rules.sort();
                rules.dedup();
                return gap(
                    GapCause::DedupMerged,
                    format!(
                        "Merged into the group headed by \"{}\" ({}) via {}; {} article(s) in the group.",
                        rep.title,
                        rep.source,
                        rules.join(", "),
                        group.members.len()
                    ),
                    SuggestedFix::note(format!(
                        "If these are different events, raise similarity_threshold (currently {:.2}) \
                         or review CVE-based merging.",
                        self.config.similarity_threshold
                    )),
                );
            }
        }

        // 4. interest_filtered
        if self.run.interests_active {
            let filter = InterestFilter::new(&self.config.interest_keywords);
            let filtered = match clustered {
                Some((group_id, _)) => !self.run.was_kept(group_id),
                None => !filter.matches_text(&item.title),
            };
            if filtered {
                let keyword = suggest_keyword(&item.title, &self.config.interest_keywords);
                let note = match &keyword {
                    Some(k) => format!("Add \"{}\" to interest_keywords.", k),
                    None => "No distinctive word found; pick a keyword manually.".to_string(),
                };
                return gap(
                    GapCause::InterestFiltered,
                    format!(
                        "No interest keyword matched (keywords: {}).",
                        filter.keywords().join(", ")
                    ),
                    SuggestedFix {
                        feed_entry: None,
                        keyword,
                        note,
                    },
                );
            }
        }

        // 5. low_rank
        let detail = match clustered.and_then(|(gid, _)| self.run.ranked_group(gid)) {
            Some(ranked) if !self.run.in_output(ranked.id) => {
                let position = self
                    .run
                    .ranked
                    .iter()
                    .position(|r| r.id == ranked.id)
                    .map_or(0, |p| p + 1);
                format!(
                    "Ranked #{} of {} ({}, score {:.1}), below the output cutoff of {}.",
                    position,
                    self.run.ranked.len(),
                    ranked.category,
                    ranked.score,
                    self.run
                        .max_items
                        .map_or("none".to_string(), |m| m.to_string())
                )
            }
            Some(ranked) => format!(
                "In the digest as \"{}\" under {} (score {:.1}) but not recognisable as the same headline.",
                ranked.display_title(),
                ranked.category,
                ranked.score
            ),
            None if fetched.is_some() => {
                "Fetched but not part of this run's clustered articles.".to_string()
            }
            None => "A feed for this host is configured, but the article was not in the fetched items."
                .to_string(),
        };

        gap(
            GapCause::LowRank,
            detail,
            SuggestedFix::note(
                "Consider adding the source to trusted_sources, raising max_items, \
                 or adjusting notable_score_threshold.",
            ),
        )
    }
}

/// Draft feed entry for `host`; the feed path is a guess the operator must verify.
pub fn draft_feed_entry(host: &str) -> FeedConfig {
    let lang = if host.ends_with(".jp") { "ja" } else { "en" };
    FeedConfig {
        name: host.to_string(),
        url: format!("https://{}/feed", host),
        lang: lang.to_string(),
    }
}

/// The most specific word of `title` not already covered by `keywords`.
pub fn suggest_keyword(title: &str, keywords: &[String]) -> Option<String> {
    let known: Vec<String> = keywords.iter().map(|k| k.to_lowercase()).collect();
    let normalized = normalize_title(title);

    let mut best: Option<&str> = None;
    for word in normalized.split_whitespace() {
        if word.chars().count() < 3
            || word.chars().all(|c| c.is_ascii_digit())
            || STOPWORDS.contains(&word)
            || GENERIC_WORDS.contains(&word)
            || known.iter().any(|k| word.contains(k.as_str()))
        {
            continue;
        }
        if best.map_or(true, |b| word.chars().count() > b.chars().count()) {
            best = Some(word);
        }
    }

    best.map(str::to_string)
}

/// Plain-text improvement report grouped by cause, largest group first.
pub fn suggestion_report(gaps: &[Gap]) -> String {
    let mut by_cause: BTreeMap<GapCause, Vec<&Gap>> = BTreeMap::new();
    for gap in gaps {
        by_cause.entry(gap.cause).or_default().push(gap);
    }

    let mut causes: Vec<(GapCause, Vec<&Gap>)> = by_cause.into_iter().collect();
    causes.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then(a.0.as_str().cmp(b.0.as_str())));

    let mut report = String::new();
    report.push_str("## Summary\n\n");
    report.push_str(&format!("Gaps found: {}\n\n", gaps.len()));
    report.push_str("## Suggestions\n\n");

    for (cause, items) in causes {
        report.push_str(&format!("### {} ({})\n", cause, items.len()));
        for gap in items.iter().take(REPORT_ITEMS_PER_CAUSE) {
            report.push_str(&format!(
                "- [ ] {} -- {}\n",
                gap.reference_title, gap.suggested_fix.note
            ));
        }
        if items.len() > REPORT_ITEMS_PER_CAUSE {
            report.push_str(&format!(
                "- ... ({} more)\n",
                items.len() - REPORT_ITEMS_PER_CAUSE
            ));
        }
        report.push('\n');
    }

    report
}

/// User prompt asking an LLM for an improvement plan covering `gaps`.
pub fn improvement_prompt(gaps: &[Gap]) -> String {
    let listed = gaps
        .iter()
        .enumerate()
        .map(|(i, gap)| {
            format!(
                "[{}] Title: {}\nURL: {}\nCause: {}\nDetail: {}\nHeuristic fix: {}\n",
                i + 1,
                gap.reference_title,
                gap.reference_url,
                gap.cause,
                gap.detail,
                gap.suggested_fix.note
            )
        })
        .collect::<Vec<_>>()
        .join("\n---\n");

    format!(
        "The following articles were covered by a reference source but are missing from our digest. \
Each cause has already been classified. Your job is to:\n\
1. Summarize the gaps\n\
2. Group improvement suggestions by category\n\
3. For EACH suggestion, give the EXACT change to digest.toml as a TOML snippet\n\
4. Order suggestions by impact (how many gaps each fix addresses)\n\n\
Output format:\n\
## Summary\n...\n\
## Suggestions\n\
### 1. Add feeds\n- [ ] ...\n\
### 2. Add interest keywords\n- [ ] ...\n\
### 3. Tune settings\n- [ ] ...\n\n\
GAPS ({}):\n{}",
        gaps.len(),
        listed
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Pipeline;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 2, 10, 12, 0, 0).unwrap()
    }

    fn config() -> DigestConfig {
        DigestConfig {
            feeds: vec![FeedConfig {
                name: "Example".to_string(),
                url: "https://example.com/rss".to_string(),
                lang: "en".to_string(),
            }],
            ..DigestConfig::default()
        }
    }

    fn run_with(config: &DigestConfig, fetched: Vec<Article>, interests: bool) -> PipelineRun {
        Pipeline::new(config).run(fetched, interests, now())
    }

    fn hours_ago(h: i64) -> DateTime<Utc> {
        now() - Duration::hours(h)
    }

    // ==================== Cause Tests ====================

    #[test]
    fn test_feed_missing_with_draft_entry() {
        let cfg = config();
        let run = run_with(&cfg, Vec::new(), false);
        let gap = GapAnalyzer::new(&cfg, &run, now())
            .diagnose(&ReferenceItem::new("Test", "https://missed.example.net/post"));

        assert_eq!(gap.cause, GapCause::FeedMissing);
        let entry = gap.suggested_fix.feed_entry.as_ref().expect("feed entry");
        assert_eq!(entry.name, "missed.example.net");
        assert_eq!(entry.url, "https://missed.example.net/feed");
        assert!(gap.suggested_fix.is_applicable());
    }

    #[test]
    fn test_outside_window_by_fetched_date() {
        let cfg = DigestConfig {
            window_days: 1,
            ..config()
        };
        let old = Article::new("https://example.com/old", "Old", "Example").published(now() - Duration::days(10));
        let run = run_with(&cfg, vec![old], false);
        let gap = GapAnalyzer::new(&cfg, &run, now())
            .diagnose(&ReferenceItem::new("Old", "https://example.com/old"));
        assert_eq!(gap.cause, GapCause::OutsideWindow);
        assert!(!gap.suggested_fix.is_applicable());
    }

    #[test]
    fn test_saved_run_keeps_its_own_window() {
        let run_cfg = DigestConfig {
            window_days: 1,
            ..config()
        };
        let article = Article::new("https://example.com/late", "Late story", "Example")
            .published(now() - Duration::days(3));
        let run = run_with(&run_cfg, vec![article], false);

        // window_days was raised after the run was saved
        let current = DigestConfig {
            window_days: 7,
            ..config()
        };
        let gap = GapAnalyzer::new(&current, &run, now())
            .diagnose(&ReferenceItem::new("Late story", "https://example.com/late"));
        assert_eq!(gap.cause, GapCause::OutsideWindow);
        assert!(gap.detail.contains("1-day window"));
    }

    #[test]
    fn test_saved_run_keeps_its_own_cutoff() {
        let run_cfg = DigestConfig {
            max_items: Some(1),
            ..config()
        };
        let fetched = vec![
            Article::new("https://example.com/a", "Chrome zero-day patched", "Example")
                .with_zero_day(true)
                .published(hours_ago(3)),
            Article::new("https://example.com/z", "Fetched but missing", "Example").published(hours_ago(1)),
        ];
        let run = run_with(&run_cfg, fetched, false);

        let current = DigestConfig {
            max_items: Some(20),
            ..config()
        };
        let gap = GapAnalyzer::new(&current, &run, now())
            .diagnose(&ReferenceItem::new("Fetched but missing", "https://example.com/z"));
        assert_eq!(gap.cause, GapCause::LowRank);
        assert!(gap.detail.contains("output cutoff of 1"));
    }

    #[test]
    fn test_huge_run_window_does_not_panic() {
        let cfg = DigestConfig {
            window_days: i64::MAX,
            ..config()
        };
        let run = run_with(&cfg, Vec::new(), false);
        let mut item = ReferenceItem::new("Ancient", "https://elsewhere.org/a");
        item.published_at = Some(now() - Duration::days(40));
        let gap = GapAnalyzer::new(&cfg, &run, now()).diagnose(&item);
        assert_eq!(gap.cause, GapCause::FeedMissing);
    }

    #[test]
    fn test_outside_window_beats_feed_missing() {
        let cfg = config();
        let run = run_with(&cfg, Vec::new(), false);
        let mut item = ReferenceItem::new("Ancient", "https://elsewhere.org/a");
        item.published_at = Some(now() - Duration::days(40));
        let gap = GapAnalyzer::new(&cfg, &run, now()).diagnose(&item);
        assert_eq!(gap.cause, GapCause::OutsideWindow);
    }

    #[test]
    fn test_dedup_merged() {
        let cfg = config();
        let fetched = vec![
            Article::new("https://example.com/patch", "Patch released for CVE-2024-1234", "Example")
                .published(hours_ago(5)),
            Article::new("https://example.com/x", "CVE-2024-1234 exploited", "Example")
                .published(hours_ago(2)),
        ];
        let run = run_with(&cfg, fetched, false);
        let gap = GapAnalyzer::new(&cfg, &run, now())
            .diagnose(&ReferenceItem::new("CVE-2024-1234 exploited", "https://example.com/x"));

        assert_eq!(gap.cause, GapCause::DedupMerged);
        assert!(gap.detail.contains("Patch released for CVE-2024-1234"));
        assert!(gap.detail.contains("cve"));
    }

    #[test]
    fn test_interest_filtered_with_keyword() {
        let cfg = DigestConfig {
            interest_keywords: vec!["windows".to_string()],
            ..config()
        };
        let fetched = vec![Article::new("https://example.com/k", "Linux kernel update", "Example")
            .published(hours_ago(1))];
        let run = run_with(&cfg, fetched, true);
        let gap = GapAnalyzer::new(&cfg, &run, now())
            .diagnose(&ReferenceItem::new("Linux kernel update", "https://example.com/k"));

        assert_eq!(gap.cause, GapCause::InterestFiltered);
        assert_eq!(gap.suggested_fix.keyword.as_deref(), Some("kernel"));
    }

    #[test]
    fn test_interest_filtered_when_not_fetched_from_configured_host() {
        let cfg = DigestConfig {
            interest_keywords: vec!["windows".to_string()],
            ..config()
        };
        let run = run_with(&cfg, Vec::new(), true);
        let gap = GapAnalyzer::new(&cfg, &run, now())
            .diagnose(&ReferenceItem::new("Ivanti VPN exploited", "https://example.com/ivanti"));
        assert_eq!(gap.cause, GapCause::InterestFiltered);
    }

    #[test]
    fn test_low_rank_below_cutoff() {
        let cfg = DigestConfig {
            max_items: Some(1),
            ..config()
        };
        let fetched = vec![
            Article::new("https://example.com/a", "Chrome zero-day patched", "Example")
                .with_zero_day(true)
                .published(hours_ago(3)),
            Article::new("https://example.com/z", "Fetched but missing", "Example").published(hours_ago(1)),
        ];
        let run = run_with(&cfg, fetched, false);
        let gap = GapAnalyzer::new(&cfg, &run, now())
            .diagnose(&ReferenceItem::new("Fetched but missing", "https://example.com/z"));
        assert_eq!(gap.cause, GapCause::LowRank);
        assert!(gap.detail.contains("Ranked #2 of 2"));
    }

    #[test]
    fn test_low_rank_fallback_when_host_configured() {
        let cfg = config();
        let run = run_with(&cfg, Vec::new(), false);
        let gap = GapAnalyzer::new(&cfg, &run, now())
            .diagnose(&ReferenceItem::new("Something", "https://www.example.com/gone"));
        assert_eq!(gap.cause, GapCause::LowRank);
    }

    #[test]
    fn test_malformed_url_does_not_panic() {
        let cfg = config();
        let run = run_with(&cfg, Vec::new(), false);
        let gap = GapAnalyzer::new(&cfg, &run, now())
            .diagnose(&ReferenceItem::new("Broken link", "not a url"));
        assert_eq!(gap.cause, GapCause::FeedMissing);
        assert!(gap.detail.contains("Could not parse a host"));
        assert!(gap.suggested_fix.feed_entry.is_none());
    }

    #[test]
    fn test_diagnosis_is_stable() {
        let cfg = DigestConfig {
            interest_keywords: vec!["windows".to_string()],
            ..config()
        };
        let fetched = vec![Article::new("https://example.com/k", "Linux kernel update", "Example")
            .published(hours_ago(1))];
        let run = run_with(&cfg, fetched, true);
        let items = vec![
            ReferenceItem::new("Linux kernel update", "https://example.com/k"),
            ReferenceItem::new("Elsewhere", "https://other.net/x"),
        ];
        let analyzer = GapAnalyzer::new(&cfg, &run, now());
        assert_eq!(analyzer.diagnose_all(&items), analyzer.diagnose_all(&items));
    }

    // ==================== Helper Tests ====================

    #[test]
    fn test_suggest_keyword_skips_known_and_generic() {
        let keywords = vec!["fortinet".to_string()];
        assert_eq!(
            suggest_keyword("Fortinet patches critical FortiOS vulnerability", &keywords),
            Some("critical".to_string())
        );
        assert_eq!(suggest_keyword("A new bug", &keywords), None);
    }

    #[test]
    fn test_draft_feed_entry_japanese_host() {
        assert_eq!(draft_feed_entry("security.example.jp").lang, "ja");
    }

    #[test]
    fn test_suggestion_report_groups_by_cause() {
        let gap = |cause, title: &str| Gap {
            reference_title: title.to_string(),
            reference_url: String::new(),
            cause,
            detail: String::new(),
            suggested_fix: SuggestedFix::note("fix it"),
        };
        let report = suggestion_report(&[
            gap(GapCause::LowRank, "One"),
            gap(GapCause::FeedMissing, "Two"),
            gap(GapCause::FeedMissing, "Three"),
        ]);
        assert!(report.contains("Gaps found: 3"));
        let feed = report.find("### feed_missing (2)").unwrap();
        let low = report.find("### low_rank (1)").unwrap();
        assert!(feed < low);
        assert!(report.contains("- [ ] Two -- fix it"));
    }

    #[test]
    fn test_improvement_prompt_lists_every_gap() {
        let cfg = config();
        let run = run_with(&cfg, Vec::new(), false);
        let analyzer = GapAnalyzer::new(&cfg, &run, now());
        let gaps = analyzer.diagnose_all(&[
            ReferenceItem::new("First missed", "https://one.example.org/a"),
            ReferenceItem::new("Second missed", "https://www.example.com/b"),
        ]);

        let prompt = improvement_prompt(&gaps);
        assert!(prompt.contains("GAPS (2):"));
        assert!(prompt.contains("[1] Title: First missed"));
        assert!(prompt.contains("Cause: feed_missing"));
        assert!(prompt.contains("[2] Title: Second missed"));
        assert!(prompt.contains("Cause: low_rank"));
        assert!(prompt.contains("TOML snippet"));
    }
}
