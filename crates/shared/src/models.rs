use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::normalize::extract_cves;
use crate::summarizer::Summary;

/// One fetched feed item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    pub url: String,
    pub title: String,
    /// Display name of the feed the item came from
    pub source: String,
    pub lang: String,
    pub published_at: Option<DateTime<Utc>>,
    pub summary_raw: String,
    pub cve_ids: BTreeSet<String>,
    pub cvss: Option<f64>,
    pub kev: bool,
    pub zero_day: bool,
}

impl Article {
    pub fn new(url: impl Into<String>, title: impl Into<String>, source: impl Into<String>) -> Self {
        let title = title.into();
        Self {
            url: url.into(),
            cve_ids: extract_cves(&title),
            title,
            source: source.into(),
            lang: "en".to_string(),
            published_at: None,
            summary_raw: String::new(),
            cvss: None,
            kev: false,
            zero_day: false,
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary_raw = summary.into();
        self.cve_ids = extract_cves(&format!("{} {}", self.title, self.summary_raw));
        self
    }

    pub fn with_lang(mut self, lang: impl Into<String>) -> Self {
        self.lang = lang.into();
        self
    }

    pub fn published(mut self, at: DateTime<Utc>) -> Self {
        self.published_at = Some(at);
        self
    }

    pub fn with_cvss(mut self, cvss: f64) -> Self {
        self.cvss = Some(cvss.clamp(0.0, 10.0));
        self
    }

    pub fn with_kev(mut self, kev: bool) -> Self {
        self.kev = kev;
        self
    }

    pub fn with_zero_day(mut self, zero_day: bool) -> Self {
        self.zero_day = zero_day;
        self
    }
}

/// Which dedup rule joined two articles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeRule {
    Url,
    Cve,
    TitleSimilarity,
}

impl fmt::Display for MergeRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MergeRule::Url => "url",
            MergeRule::Cve => "cve",
            MergeRule::TitleSimilarity => "title_similarity",
        };
        f.write_str(name)
    }
}

/// One union performed while clustering; `left`/`right` index into the group's members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReason {
    pub rule: MergeRule,
    pub left: usize,
    pub right: usize,
}

/// Articles judged to report the same event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArticleGroup {
    pub members: Vec<Article>,
    /// Index into `members`
    pub representative: usize,
    pub merged_cve_ids: BTreeSet<String>,
    pub merged_cvss: Option<f64>,
    pub sources: BTreeSet<String>,
    pub merge_reasons: Vec<MergeReason>,
}

impl ArticleGroup {
    /// Builds a group, deriving the merged fields from `members`.
    pub fn from_members(
        members: Vec<Article>,
        representative: usize,
        merge_reasons: Vec<MergeReason>,
    ) -> Self {
        let merged_cve_ids = members
            .iter()
            .flat_map(|a| a.cve_ids.iter().cloned())
            .collect();
        let merged_cvss = members
            .iter()
            .filter_map(|a| a.cvss)
            .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |m| m.max(v))));
        let sources = members
            .iter()
            .filter(|a| !a.source.is_empty())
            .map(|a| a.source.clone())
            .collect();

        Self {
            representative: representative.min(members.len().saturating_sub(1)),
            members,
            merged_cve_ids,
            merged_cvss,
            sources,
            merge_reasons,
        }
    }

    pub fn representative(&self) -> &Article {
        &self.members[self.representative]
    }

    /// Whether the representative and every merge reason point at a member.
    pub fn is_well_formed(&self) -> bool {
        let len = self.members.len();
        self.representative < len
            && self
                .merge_reasons
                .iter()
                .all(|r| r.left < len && r.right < len)
    }

    pub fn merge_rules(&self) -> Vec<MergeRule> {
        self.merge_reasons.iter().map(|r| r.rule).collect()
    }

    pub fn any_kev(&self) -> bool {
        self.members.iter().any(|a| a.kev)
    }

    pub fn any_zero_day(&self) -> bool {
        self.members.iter().any(|a| a.zero_day)
    }

    /// Distinct member URLs in member order.
    pub fn urls(&self) -> Vec<&str> {
        let mut seen = BTreeSet::new();
        self.members
            .iter()
            .map(|a| a.url.as_str())
            .filter(|u| !u.is_empty() && seen.insert(*u))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Critical,
    Notable,
    Japan,
    General,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::Critical,
        Category::Notable,
        Category::Japan,
        Category::General,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Critical => "critical",
            Category::Notable => "notable",
            Category::Japan => "japan",
            Category::General => "general",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scored and categorized group, ready for the formatter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedGroup {
    /// Position of the group in the clustering output
    pub id: usize,
    pub group: ArticleGroup,
    pub score: f64,
    pub category: Category,
    #[serde(default)]
    pub summary: Option<Summary>,
}

impl RankedGroup {
    pub fn representative(&self) -> &Article {
        self.group.representative()
    }

    /// Headline shown in the digest: the summarizer's title when one was attached.
    pub fn display_title(&self) -> &str {
        match &self.summary {
            Some(summary) if !summary.title.is_empty() => &summary.title,
            _ => &self.representative().title,
        }
    }
}
