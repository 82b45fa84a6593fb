use std::cmp::Ordering;
use tracing::info;

use crate::config::DigestConfig;
use crate::models::{ArticleGroup, Category, RankedGroup};

pub const CRITICAL_CVSS: f64 = 9.0;

const CORROBORATION_POINTS: f64 = 1.0;
const TRUSTED_SOURCE_POINTS: f64 = 2.0;
const CRITICAL_CVSS_POINTS: f64 = 3.0;
const KEV_POINTS: f64 = 3.0;
const ZERO_DAY_POINTS: f64 = 2.0;

/// Scores and categorizes groups from their aggregated attributes only.
pub struct Ranker<'a> {
    config: &'a DigestConfig,
}

impl<'a> Ranker<'a> {
    pub fn new(config: &'a DigestConfig) -> Self {
        Self { config }
    }

    pub fn score(&self, group: &ArticleGroup) -> f64 {
        let mut score = 0.0;

        let source_count = group.sources.len();
        if source_count > 1 {
            score += CORROBORATION_POINTS * (source_count - 1) as f64;
        }

        let trusted = group
            .sources
            .iter()
            .filter(|s| self.config.is_trusted(s))
            .map(|s| s.to_lowercase())
            .collect::<std::collections::BTreeSet<_>>()
            .len();
        score += TRUSTED_SOURCE_POINTS * trusted as f64;

        if is_critical_cvss(group) {
            score += CRITICAL_CVSS_POINTS;
        }
        if group.any_kev() {
            score += KEV_POINTS;
        }
        if group.any_zero_day() {
            score += ZERO_DAY_POINTS;
        }

        score
    }

    /// First match wins: severity is never shadowed by source count or language.
    pub fn categorize(&self, group: &ArticleGroup, score: f64) -> Category {
        if is_critical_cvss(group) || group.any_kev() || group.any_zero_day() {
            Category::Critical
        } else if group.sources.len() >= 2 || score > self.config.notable_score_threshold {
            Category::Notable
        } else if group.representative().lang.eq_ignore_ascii_case("ja") {
            Category::Japan
        } else {
            Category::General
        }
    }

    pub fn rank_group(&self, id: usize, group: ArticleGroup) -> RankedGroup {
        let score = self.score(&group);
        let category = self.categorize(&group, score);
        RankedGroup {
            id,
            group,
            score,
            category,
            summary: None,
        }
    }

    /// Ranks every group and orders them by category priority, then score
    /// (highest first); equal entries keep clustering order.
    pub fn rank(&self, groups: Vec<ArticleGroup>) -> Vec<RankedGroup> {
        let mut ranked: Vec<RankedGroup> = groups
            .into_iter()
            .enumerate()
            .map(|(id, group)| self.rank_group(id, group))
            .collect();
        ranked.sort_by(compare_ranked);

        for category in Category::ALL {
            let count = ranked.iter().filter(|r| r.category == category).count();
            info!(category = %category, count, "ranked groups");
        }

        ranked
    }
}

fn is_critical_cvss(group: &ArticleGroup) -> bool {
    group.merged_cvss.map_or(false, |cvss| cvss >= CRITICAL_CVSS)
}

fn compare_ranked(a: &RankedGroup, b: &RankedGroup) -> Ordering {
    a.category
        .cmp(&b.category)
        .then_with(|| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal))
}

/// Keeps the first `max_items` ranked groups when a cutoff is configured.
pub fn apply_cutoff(ranked: &[RankedGroup], max_items: Option<usize>) -> Vec<RankedGroup> {
    let limit = max_items.unwrap_or(ranked.len());
    ranked.iter().take(limit).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Article;

    fn config() -> DigestConfig {
        DigestConfig {
            trusted_sources: vec!["BleepingComputer".to_string(), "CISA".to_string()],
            ..DigestConfig::default()
        }
    }

    fn group(members: Vec<Article>) -> ArticleGroup {
        ArticleGroup::from_members(members, 0, Vec::new())
    }

    // ==================== Scoring Tests ====================

    #[test]
    fn test_score_single_untrusted_source_is_zero() {
        let cfg = config();
        let g = group(vec![Article::new("https://a.com", "News", "Blog")]);
        assert_eq!(Ranker::new(&cfg).score(&g), 0.0);
    }

    #[test]
    fn test_score_corroboration_and_trust() {
        let cfg = config();
        let g = group(vec![
            Article::new("https://a.com", "News", "Blog"),
            Article::new("https://b.com", "News", "bleepingcomputer"),
            Article::new("https://c.com", "News", "CISA"),
        ]);
        // +2 corroboration, +2 per trusted source
        assert_eq!(Ranker::new(&cfg).score(&g), 6.0);
    }

    #[test]
    fn test_score_duplicate_source_counts_once() {
        let cfg = config();
        let g = group(vec![
            Article::new("https://a.com/1", "News", "CISA"),
            Article::new("https://a.com/2", "News", "CISA"),
        ]);
        assert_eq!(Ranker::new(&cfg).score(&g), 2.0);
    }

    #[test]
    fn test_score_severity_terms() {
        let cfg = config();
        let g = group(vec![Article::new("https://a.com", "Bad", "Blog")
            .with_cvss(9.8)
            .with_kev(true)
            .with_zero_day(true)]);
        assert_eq!(Ranker::new(&cfg).score(&g), 8.0);
    }

    // ==================== Categorization Tests ====================

    #[test]
    fn test_critical_cvss_single_source() {
        let cfg = config();
        let ranker = Ranker::new(&cfg);
        let g = group(vec![Article::new("https://a.com", "Bug", "Blog").with_cvss(9.1)]);
        let ranked = ranker.rank_group(0, g);
        assert_eq!(ranked.category, Category::Critical);
        assert_eq!(ranked.score, 3.0);
    }

    #[test]
    fn test_kev_beats_multi_source_rule() {
        let cfg = config();
        let ranker = Ranker::new(&cfg);
        let g = group(vec![Article::new("https://a.com", "Bug", "Blog").with_kev(true)]);
        assert_eq!(ranker.rank_group(0, g).category, Category::Critical);
    }

    #[test]
    fn test_severity_beats_japanese_language() {
        let cfg = config();
        let g = group(vec![Article::new("https://a.jp", "脆弱性", "JPCERT")
            .with_lang("ja")
            .with_zero_day(true)]);
        assert_eq!(Ranker::new(&cfg).rank_group(0, g).category, Category::Critical);
    }

    #[test]
    fn test_notable_by_sources() {
        let cfg = config();
        let g = group(vec![
            Article::new("https://a.com", "News", "Blog A"),
            Article::new("https://b.com", "News", "Blog B"),
        ]);
        assert_eq!(Ranker::new(&cfg).rank_group(0, g).category, Category::Notable);
    }

    #[test]
    fn test_notable_by_score_threshold() {
        let cfg = DigestConfig {
            notable_score_threshold: 1.5,
            ..config()
        };
        let g = group(vec![Article::new("https://a.com", "News", "CISA")]);
        assert_eq!(Ranker::new(&cfg).rank_group(0, g).category, Category::Notable);
    }

    #[test]
    fn test_japan_category() {
        let cfg = config();
        let g = group(vec![Article::new("https://a.jp", "ランサムウェア被害", "Security NEXT")
            .with_lang("ja")]);
        assert_eq!(Ranker::new(&cfg).rank_group(0, g).category, Category::Japan);
    }

    #[test]
    fn test_general_default() {
        let cfg = config();
        let g = group(vec![Article::new("https://a.com", "News", "Blog")]);
        assert_eq!(Ranker::new(&cfg).rank_group(0, g).category, Category::General);
    }

    #[test]
    fn test_cvss_below_threshold_not_critical() {
        let cfg = config();
        let g = group(vec![Article::new("https://a.com", "Bug", "Blog").with_cvss(8.9)]);
        assert_eq!(Ranker::new(&cfg).rank_group(0, g).category, Category::General);
    }

    // ==================== Ordering Tests ====================

    #[test]
    fn test_rank_orders_by_category_then_score() {
        let cfg = config();
        let groups = vec![
            group(vec![Article::new("https://g.com", "General", "Blog")]),
            group(vec![
                Article::new("https://n.com/1", "Notable", "Blog A"),
                Article::new("https://n.com/2", "Notable", "CISA"),
            ]),
            group(vec![Article::new("https://c.com", "Critical", "Blog").with_kev(true)]),
            group(vec![
                Article::new("https://n2.com/1", "Notable two", "Blog A"),
                Article::new("https://n2.com/2", "Notable two", "Blog B"),
            ]),
        ];
        let ranked = Ranker::new(&cfg).rank(groups);
        let ids: Vec<usize> = ranked.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![2, 1, 3, 0]);
    }

    #[test]
    fn test_apply_cutoff() {
        let cfg = config();
        let groups = (0..5)
            .map(|i| group(vec![Article::new(format!("https://a.com/{}", i), "x", "Blog")]))
            .collect();
        let ranked = Ranker::new(&cfg).rank(groups);
        assert_eq!(apply_cutoff(&ranked, Some(2)).len(), 2);
        assert_eq!(apply_cutoff(&ranked, None).len(), 5);
    }
}
