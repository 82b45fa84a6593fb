use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::fs;
use std::path::PathBuf;

use crate::config::OutputConfig;
use crate::models::{Category, RankedGroup};

/// URLs listed per item.
pub const MAX_URLS: usize = 3;

pub struct DigestFormatter;

impl DigestFormatter {
    fn section_header(category: Category) -> &'static str {
        match category {
            Category::Critical => "🔴 Critical / Actively Exploited",
            Category::Notable => "⚠️ Notable",
            Category::Japan => "🇯🇵 Japan / Japanese Sources",
            Category::General => "📰 General",
        }
    }

    fn format_published(at: Option<DateTime<Utc>>) -> String {
        match at {
            Some(dt) => dt.format("%-d-%b-%Y %H:%M UTC").to_string(),
            None => "date unknown".to_string(),
        }
    }

    /// Markdown digest with one section per non-empty category.
    pub fn generate(groups: &[RankedGroup], date: DateTime<Utc>, generated_at: DateTime<Utc>) -> String {
        let mut md = String::new();

        md.push_str(&format!(
            "# Security News Digest - {}\n\n",
            date.format("%A, %-d %B %Y")
        ));
        md.push_str(&format!(
            "_Generated {} · {} item(s)_\n\n",
            generated_at.format("%Y-%m-%d %H:%M UTC"),
            groups.len()
        ));

        for category in Category::ALL {
            let items: Vec<&RankedGroup> = groups.iter().filter(|g| g.category == category).collect();
            if items.is_empty() {
                continue;
            }

            md.push_str(&format!("## {} ({})\n\n", Self::section_header(category), items.len()));

            for ranked in items {
                Self::push_item(&mut md, ranked);
            }
        }

        if groups.is_empty() {
            md.push_str("No stories in this window.\n");
        }

        md
    }

    fn push_item(md: &mut String, ranked: &RankedGroup) {
        let rep = ranked.representative();

        md.push_str(&format!("### {}\n\n", Self::escape_markdown(ranked.display_title())));

        let mut meta = vec![format!("Score: {:.1}", ranked.score)];
        if !ranked.group.merged_cve_ids.is_empty() {
            let cves: Vec<&str> = ranked.group.merged_cve_ids.iter().map(String::as_str).collect();
            meta.push(format!("CVE: {}", cves.join(", ")));
        }
        if let Some(cvss) = ranked.group.merged_cvss {
            meta.push(format!("CVSS: {:.1}", cvss));
        }
        if ranked.group.any_kev() {
            meta.push("KEV".to_string());
        }
        if ranked.group.any_zero_day() {
            meta.push("Zero-day".to_string());
        }
        meta.push(Self::format_published(rep.published_at));
        md.push_str(&format!("{}\n\n", meta.join(" | ")));

        let summary = match &ranked.summary {
            Some(s) if !s.text.trim().is_empty() => s.text.trim().to_string(),
            _ => rep.summary_raw.trim().to_string(),
        };
        if !summary.is_empty() {
            md.push_str(&format!("{}\n\n", summary));
        }

        let sources: Vec<&str> = ranked.group.sources.iter().map(String::as_str).collect();
        md.push_str(&format!(
            "**Sources ({}):** {}\n\n",
            sources.len(),
            sources.join(", ")
        ));

        for url in ranked.group.urls().into_iter().take(MAX_URLS) {
            md.push_str(&format!("- <{}>\n", url));
        }
        md.push('\n');
    }

    fn escape_markdown(text: &str) -> String {
        text.replace('\n', " ")
            .replace('*', "\\*")
            .replace('_', "\\_")
            .replace('`', "\\`")
    }

    /// Writes the digest to `output.directory`, naming it from the `{date}` template.
    pub fn save(content: &str, output: &OutputConfig, date: DateTime<Utc>) -> Result<PathBuf> {
        let filename = output
            .filename_template
            .replace("{date}", &date.format("%Y-%m-%d").to_string());

        fs::create_dir_all(&output.directory).with_context(|| {
            format!(
                "Failed to create output directory {}",
                output.directory.display()
            )
        })?;

        let filepath = output.directory.join(filename);
        fs::write(&filepath, content).context("Failed to write digest file")?;

        Ok(filepath)
    }
}
