use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::env;
use tracing::{info, warn};

use crate::config::{LlmConfig, LlmEndpoint};
use crate::gap::{improvement_prompt, suggestion_report, Gap};
use crate::models::RankedGroup;

/// Groups per LLM request.
const BATCH_SIZE: usize = 15;
const MAX_ATTEMPTS: u32 = 3;
const SUMMARY_CHARS: usize = 500;

const SYSTEM_PROMPT: &str = r#"You are a cybersecurity news analyst. For each numbered article group, write:
1. "title" - a short descriptive title in Japanese
2. "summary" - a concise summary in Japanese (2-3 sentences). Include CVE IDs and CVSS scores if mentioned.

Be concise and accurate. Always include CVE IDs when present.
Respond with valid JSON only: {"articles": [{"title": "...", "summary": "..."}]} in the same order as the input."#;

const PLAN_SYSTEM_PROMPT: &str = "You are a security news feed optimization assistant. \
Given gaps (articles a reference source covered but the digest missed) and their pre-classified causes, \
suggest specific improvements to the digest configuration.";

/// Text attached to a ranked group; never changes its score or category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    #[serde(default)]
    pub title: String,
    #[serde(alias = "summary")]
    pub text: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<Message>,
}

#[derive(Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Deserialize)]
struct SummaryBatch {
    articles: Vec<Summary>,
}

/// OpenAI-compatible chat client with a primary and an optional fallback endpoint.
pub struct LlmSummarizer {
    client: Client,
    config: LlmConfig,
}

impl LlmSummarizer {
    pub fn new(config: LlmConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(90))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client, config })
    }

    /// Attaches summaries in place and returns how many groups received one.
    /// Batches that fail on every endpoint are left without summaries.
    pub async fn summarize(&self, groups: &mut [RankedGroup]) -> usize {
        let prompts: Vec<(usize, String)> = groups
            .chunks(BATCH_SIZE)
            .enumerate()
            .map(|(batch, chunk)| (batch * BATCH_SIZE, build_prompt(chunk)))
            .collect();

        let results: Vec<(usize, Option<Vec<Summary>>)> = stream::iter(prompts)
            .map(|(offset, prompt)| async move { (offset, self.summarize_batch(&prompt).await) })
            .buffer_unordered(2)
            .collect()
            .await;

        let mut attached = 0;
        for (offset, summaries) in results {
            let Some(summaries) = summaries else { continue };
            for (i, summary) in summaries.into_iter().take(BATCH_SIZE).enumerate() {
                if summary.text.trim().is_empty() {
                    continue;
                }
                if let Some(group) = groups.get_mut(offset + i) {
                    group.summary = Some(summary);
                    attached += 1;
                }
            }
        }

        info!(attached, total = groups.len(), "summaries attached");
        attached
    }

    async fn summarize_batch(&self, prompt: &str) -> Option<Vec<Summary>> {
        self.complete(SYSTEM_PROMPT, prompt, parse_reply).await
    }

    /// Improvement plan for `gaps` from the LLM, or the heuristic report when
    /// no endpoint produces one.
    pub async fn improvement_report(&self, gaps: &[Gap]) -> String {
        if gaps.is_empty() {
            return suggestion_report(gaps);
        }

        let prompt = improvement_prompt(gaps);
        match self.complete(PLAN_SYSTEM_PROMPT, &prompt, parse_plan).await {
            Some(plan) => {
                info!(gaps = gaps.len(), "LLM improvement plan generated");
                plan
            }
            None => {
                warn!("no LLM improvement plan, using the heuristic report");
                suggestion_report(gaps)
            }
        }
    }

    /// Tries the primary endpoint, then the fallback, returning the first parsed reply.
    async fn complete<T>(&self, system: &str, prompt: &str, parse: fn(&str) -> Result<T>) -> Option<T> {
        let endpoints = std::iter::once(&self.config.primary).chain(self.config.fallback.as_ref());

        for endpoint in endpoints {
            match self.call_with_retries(endpoint, system, prompt, parse).await {
                Ok(reply) => return Some(reply),
                Err(e) => warn!(model = %endpoint.model, error = %e, "LLM endpoint failed"),
            }
        }
        None
    }

    async fn call_with_retries<T>(
        &self,
        endpoint: &LlmEndpoint,
        system: &str,
        prompt: &str,
        parse: fn(&str) -> Result<T>,
    ) -> Result<T> {
        let api_key = env::var(&endpoint.api_key_env)
            .with_context(|| format!("{} is not set", endpoint.api_key_env))?;

        let mut last_error = None;
        for attempt in 0..MAX_ATTEMPTS {
            match self
                .try_call(endpoint, &api_key, system, prompt)
                .await
                .and_then(|content| parse(&content))
            {
                Ok(reply) => return Ok(reply),
                Err(e) => {
                    let is_rate_limit = e.to_string().contains("429");
                    let backoff = if is_rate_limit {
                        std::time::Duration::from_secs(15 * (attempt + 1) as u64)
                    } else {
                        std::time::Duration::from_millis(1000 * 2_u64.pow(attempt))
                    };
                    last_error = Some(e);
                    if attempt + 1 < MAX_ATTEMPTS {
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("Max retries reached")))
    }

    async fn try_call(&self, endpoint: &LlmEndpoint, api_key: &str, system: &str, prompt: &str) -> Result<String> {
        let request = ChatRequest {
            model: &endpoint.model,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                Message {
                    role: "user".to_string(),
                    content: prompt.to_string(),
                },
            ],
        };

        let url = format!("{}/chat/completions", endpoint.api_base.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await
            .context("Failed to send request to LLM endpoint")?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("unknown error"));
            anyhow::bail!("LLM API error {}: {}", status.as_u16(), error_text);
        }

        let chat = response
            .json::<ChatResponse>()
            .await
            .context("Failed to parse LLM API response")?;

        Ok(chat
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default())
    }
}

fn build_prompt(groups: &[RankedGroup]) -> String {
    groups
        .iter()
        .enumerate()
        .map(|(i, ranked)| {
            let rep = ranked.representative();
            let sources = ranked
                .group
                .sources
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(", ");
            let cves = ranked
                .group
                .merged_cve_ids
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(", ");
            let summary: String = rep.summary_raw.chars().take(SUMMARY_CHARS).collect();
            format!(
                "[Article {}]\nTitle: {}\nSources ({}): {}\nCVEs: {}\nLanguage: {}\nSummary: {}\n",
                i + 1,
                rep.title,
                ranked.group.members.len(),
                if sources.is_empty() { "unknown" } else { sources.as_str() },
                if cves.is_empty() { "none" } else { cves.as_str() },
                rep.lang,
                if summary.is_empty() { "N/A" } else { summary.as_str() },
            )
        })
        .collect::<Vec<_>>()
        .join("\n---\n")
}

/// Markdown plan from the model's reply, without a surrounding code fence.
fn parse_plan(text: &str) -> Result<String> {
    let mut plan = text.trim();
    if let Some(rest) = plan.strip_prefix("```") {
        let body = rest.split_once('\n').map_or("", |(_, body)| body);
        plan = body.trim_end().trim_end_matches("```").trim();
    }
    if plan.is_empty() {
        anyhow::bail!("LLM returned an empty improvement plan");
    }
    Ok(format!("{}\n", plan))
}

/// Parses the model's JSON reply, tolerating surrounding prose or code fences.
fn parse_reply(text: &str) -> Result<Vec<Summary>> {
    let json_text = match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if end > start => &text[start..=end],
        _ => text,
    };

    let batch: SummaryBatch =
        serde_json::from_str(json_text).context("Failed to parse summary JSON response")?;
    Ok(batch.articles)
}
