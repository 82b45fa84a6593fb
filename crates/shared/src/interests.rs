//! Interest filtering for `--interests` runs.
//!
//! Matching is a case-insensitive substring test, not a whole-word one, so
//! "auth" also matches "author". Operators tune the keyword list with that in mind.

use crate::models::{ArticleGroup, RankedGroup};

pub struct InterestFilter {
    keywords: Vec<String>,
}

impl InterestFilter {
    pub fn new(keywords: &[String]) -> Self {
        Self {
            keywords: keywords
                .iter()
                .map(|k| k.trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }

    /// First configured keyword contained in `text`.
    pub fn matched_keyword(&self, text: &str) -> Option<&str> {
        let text = text.to_lowercase();
        self.keywords
            .iter()
            .find(|k| text.contains(k.as_str()))
            .map(String::as_str)
    }

    pub fn matches_text(&self, text: &str) -> bool {
        self.matched_keyword(text).is_some()
    }

    /// True when any member's title or raw summary contains a keyword.
    pub fn matches_group(&self, group: &ArticleGroup) -> bool {
        group
            .members
            .iter()
            .any(|a| self.matches_text(&a.title) || self.matches_text(&a.summary_raw))
    }

    pub fn retain(&self, ranked: Vec<RankedGroup>) -> Vec<RankedGroup> {
        ranked
            .into_iter()
            .filter(|r| self.matches_group(&r.group))
            .collect()
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }
}
