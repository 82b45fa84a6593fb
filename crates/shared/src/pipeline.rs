use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::clustering::Deduplicator;
use crate::config::DigestConfig;
use crate::fetcher::split_by_window;
use crate::interests::InterestFilter;
use crate::models::{Article, ArticleGroup, RankedGroup};
use crate::ranking::{apply_cutoff, Ranker};

/// Every intermediate stage of one digest run, kept for gap diagnosis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub generated_at: DateTime<Utc>,
    pub window_days: i64,
    /// Output cutoff the run applied
    #[serde(default)]
    pub max_items: Option<usize>,
    /// Everything the fetcher returned, including items outside the window
    pub fetched: Vec<Article>,
    /// Clusters of in-window articles; `RankedGroup::id` indexes this list
    pub groups: Vec<ArticleGroup>,
    /// All groups, scored and ordered
    pub ranked: Vec<RankedGroup>,
    pub interests_active: bool,
    /// Group ids that survived the interest filter (all of them when inactive)
    pub kept: Vec<usize>,
    /// What the digest shows, after filtering and the output cutoff
    pub output: Vec<RankedGroup>,
}

impl PipelineRun {
    /// (group id, member index) of the first clustered article matching `predicate`.
    pub fn group_of(&self, predicate: impl Fn(&Article) -> bool) -> Option<(usize, usize)> {
        self.groups.iter().enumerate().find_map(|(gid, group)| {
            group
                .members
                .iter()
                .position(&predicate)
                .map(|member| (gid, member))
        })
    }

    pub fn in_output(&self, group_id: usize) -> bool {
        self.output.iter().any(|r| r.id == group_id)
    }

    pub fn was_kept(&self, group_id: usize) -> bool {
        self.kept.contains(&group_id)
    }

    pub fn ranked_group(&self, group_id: usize) -> Option<&RankedGroup> {
        self.ranked.iter().find(|r| r.id == group_id)
    }
}

pub struct Pipeline<'a> {
    config: &'a DigestConfig,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: &'a DigestConfig) -> Self {
        Self { config }
    }

    /// Window, cluster, rank, optionally filter by interests, then cut off.
    pub fn run(&self, fetched: Vec<Article>, interests_active: bool, now: DateTime<Utc>) -> PipelineRun {
        let (in_window, outside) = split_by_window(&fetched, self.config.window_days, now);
        info!(
            in_window = in_window.len(),
            outside = outside.len(),
            window_days = self.config.window_days,
            "applied time window"
        );

        let groups = Deduplicator::new(self.config).cluster(in_window);
        let ranked = Ranker::new(self.config).rank(groups.clone());

        let survivors = if interests_active {
            let filter = InterestFilter::new(&self.config.interest_keywords);
            let kept = filter.retain(ranked.clone());
            info!(before = ranked.len(), after = kept.len(), "interest filter applied");
            kept
        } else {
            ranked.clone()
        };

        let kept = survivors.iter().map(|r| r.id).collect();
        let output = apply_cutoff(&survivors, self.config.max_items);

        PipelineRun {
            generated_at: now,
            window_days: self.config.window_days,
            max_items: self.config.max_items,
            fetched,
            groups,
            ranked,
            interests_active,
            kept,
            output,
        }
    }
}
