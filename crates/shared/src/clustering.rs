use std::collections::HashMap;
use tracing::{debug, info};

use crate::config::DigestConfig;
use crate::models::{Article, ArticleGroup, MergeReason, MergeRule};
use crate::normalize::NormalizedKey;

/// Disjoint-set forest over article indices.
#[derive(Debug)]
pub struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    pub fn new(size: usize) -> Self {
        Self {
            parent: (0..size).collect(),
            rank: vec![0; size],
        }
    }

    pub fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }

        // Path compression
        let mut node = x;
        while self.parent[node] != root {
            let next = self.parent[node];
            self.parent[node] = root;
            node = next;
        }

        root
    }

    /// Returns false when `a` and `b` were already in the same set.
    pub fn union(&mut self, a: usize, b: usize) -> bool {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return false;
        }

        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
        true
    }

    pub fn connected(&mut self, a: usize, b: usize) -> bool {
        self.find(a) == self.find(b)
    }
}

/// Groups articles that report the same event.
pub struct Deduplicator<'a> {
    config: &'a DigestConfig,
}

impl<'a> Deduplicator<'a> {
    pub fn new(config: &'a DigestConfig) -> Self {
        Self { config }
    }

    /// Cheap exact checks first, title similarity last.
    pub fn match_rule(&self, a: &NormalizedKey, b: &NormalizedKey) -> Option<MergeRule> {
        if a.same_url(b) {
            Some(MergeRule::Url)
        } else if a.shares_cve(b) {
            Some(MergeRule::Cve)
        } else if a.titles_match(b, self.config.similarity_threshold) {
            Some(MergeRule::TitleSimilarity)
        } else {
            None
        }
    }

    /// Partitions `articles` into groups. Every article lands in exactly one group;
    /// groups appear in order of their first member and keep input order inside.
    pub fn cluster(&self, articles: Vec<Article>) -> Vec<ArticleGroup> {
        if articles.is_empty() {
            return Vec::new();
        }

        let keys: Vec<NormalizedKey> = articles.iter().map(NormalizedKey::from_article).collect();
        let mut forest = UnionFind::new(articles.len());
        let mut unions: Vec<(usize, usize, MergeRule)> = Vec::new();

        for i in 0..articles.len() {
            for j in (i + 1)..articles.len() {
                if forest.connected(i, j) {
                    continue;
                }
                if let Some(rule) = self.match_rule(&keys[i], &keys[j]) {
                    debug!(
                        rule = %rule,
                        left = %articles[i].title,
                        right = %articles[j].title,
                        "merging articles"
                    );
                    forest.union(i, j);
                    unions.push((i, j, rule));
                }
            }
        }

        // root -> (group slot, member indices in input order)
        let mut slot_of_root: HashMap<usize, usize> = HashMap::new();
        let mut components: Vec<Vec<usize>> = Vec::new();
        let mut position: Vec<(usize, usize)> = Vec::with_capacity(articles.len());
        for idx in 0..articles.len() {
            let root = forest.find(idx);
            let slot = *slot_of_root.entry(root).or_insert_with(|| {
                components.push(Vec::new());
                components.len() - 1
            });
            position.push((slot, components[slot].len()));
            components[slot].push(idx);
        }

        let mut reasons: Vec<Vec<MergeReason>> = vec![Vec::new(); components.len()];
        for (i, j, rule) in unions {
            let (slot, left) = position[i];
            let (_, right) = position[j];
            reasons[slot].push(MergeReason { rule, left, right });
        }

        let mut articles: Vec<Option<Article>> = articles.into_iter().map(Some).collect();
        let groups: Vec<ArticleGroup> = components
            .into_iter()
            .zip(reasons)
            .map(|(indices, merge_reasons)| {
                let members: Vec<Article> = indices
                    .iter()
                    .filter_map(|&idx| articles[idx].take())
                    .collect();
                let representative = self.pick_representative(&members);
                ArticleGroup::from_members(members, representative, merge_reasons)
            })
            .collect();

        info!(
            articles = position.len(),
            groups = groups.len(),
            "clustering complete"
        );

        groups
    }

    /// Earliest-published trusted member, else the first member. Undated trusted
    /// members sort after dated ones; ties keep input order.
    fn pick_representative(&self, members: &[Article]) -> usize {
        members
            .iter()
            .enumerate()
            .filter(|(_, a)| self.config.is_trusted(&a.source))
            .min_by_key(|(idx, a)| (a.published_at.is_none(), a.published_at, *idx))
            .map(|(idx, _)| idx)
            .unwrap_or(0)
    }
}
