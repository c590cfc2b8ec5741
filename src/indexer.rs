//! Indexer collaborator abstraction and implementations.
//!
//! Defines the [`Indexer`] trait and concrete implementations:
//! - **[`DisabledIndexer`]**: returns errors; used when classification is
//!   not configured. Ingested shards land in the retryable `error` state.
//! - **[`KeywordIndexer`]**: deterministic local heuristic; the default.
//!
//! The indexer receives the set of domain labels already present in the
//! store and must bias toward reusing one when it fits, so the taxonomy
//! stays consistent instead of fragmenting into near-duplicate labels.
//!
//! # Provider Selection
//!
//! Use [`create_indexer`] to instantiate the appropriate implementation
//! from configuration:
//!
//! ```rust
//! # use collectio::config::IndexerConfig;
//! # use collectio::indexer::create_indexer;
//! let config = IndexerConfig::default(); // provider = "keyword"
//! let indexer = create_indexer(&config).unwrap();
//! assert_eq!(indexer.name(), "keyword");
//! ```

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::IndexerConfig;
use crate::models::{estimate_tokens, Classification, Usage};

/// Classifies shard content into `{title, domain, abstract, tags}`.
#[async_trait]
pub trait Indexer: Send + Sync {
    /// Returns the implementation name (e.g. `"keyword"`).
    fn name(&self) -> &str;

    /// Classify one piece of content.
    ///
    /// `existing_domains` holds the distinct domain labels already present
    /// in the store; implementations should reuse an apt label rather than
    /// minting a near-duplicate. A returned error leaves the shard in the
    /// `error` state, recoverable via retry.
    async fn classify(
        &self,
        content: &str,
        existing_domains: &[String],
    ) -> Result<Classification>;
}

/// Instantiate the indexer named by the configuration.
pub fn create_indexer(config: &IndexerConfig) -> Result<Arc<dyn Indexer>> {
    match config.provider.as_str() {
        "keyword" => Ok(Arc::new(KeywordIndexer)),
        "disabled" => Ok(Arc::new(DisabledIndexer)),
        other => bail!("Unknown indexer provider: {}", other),
    }
}

// ============ Disabled Indexer ============

/// A no-op indexer that always returns errors.
pub struct DisabledIndexer;

#[async_trait]
impl Indexer for DisabledIndexer {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn classify(
        &self,
        _content: &str,
        _existing_domains: &[String],
    ) -> Result<Classification> {
        bail!("Indexer is disabled")
    }
}

// ============ Keyword Indexer ============

/// Fixed keyword table mapping content markers to domain labels.
const DOMAIN_KEYWORDS: &[(&str, &[&str])] = &[
    ("Rust", &["rust", "cargo", "crate", "fn ", "impl ", "borrow"]),
    ("Python", &["python", "def ", "pip ", "numpy", "pandas"]),
    ("JavaScript", &["javascript", "typescript", "npm", "node", "const "]),
    ("Databases", &["sql", "database", "query", "index", "schema", "table"]),
    ("Infrastructure", &["docker", "kubernetes", "deploy", "terraform", "server"]),
    ("Machine Learning", &["model", "training", "neural", "embedding", "dataset"]),
    ("Web", &["http", "html", "css", "api", "endpoint", "request"]),
    ("Security", &["encryption", "vulnerability", "auth", "token", "certificate"]),
];

const STOPWORDS: &[&str] = &[
    "the", "and", "that", "this", "with", "from", "have", "are", "for",
    "was", "were", "its", "has", "had", "not", "but", "they", "their",
    "will", "would", "should", "about", "which", "when", "then", "than",
    "into", "over", "also", "been", "more", "some", "such", "can",
];

/// Deterministic local classifier.
///
/// Title from the first non-empty line, domain from the keyword table
/// (biased toward an apt existing label), tags from the most frequent
/// significant words, abstract from the opening sentence. Usage is
/// estimated from the token heuristic.
pub struct KeywordIndexer;

#[async_trait]
impl Indexer for KeywordIndexer {
    fn name(&self) -> &str {
        "keyword"
    }

    async fn classify(
        &self,
        content: &str,
        existing_domains: &[String],
    ) -> Result<Classification> {
        let trimmed = content.trim();
        if trimmed.is_empty() {
            bail!("Cannot classify empty content");
        }

        let lower = trimmed.to_lowercase();
        let domain = pick_domain(&lower, existing_domains);
        let title = extract_title(trimmed);
        let tags = extract_tags(&lower, 4);
        let synopsis = extract_synopsis(trimmed);

        Ok(Classification {
            title,
            domain,
            synopsis,
            tags,
            usage: Usage {
                input_tokens: estimate_tokens(trimmed) as u64,
                output_tokens: 48,
            },
        })
    }
}

/// First non-empty line, truncated to 80 chars.
fn extract_title(content: &str) -> String {
    let line = content
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("Untitled")
        .trim_start_matches(['#', ' ']);
    let line = if line.is_empty() { "Untitled" } else { line };
    if line.chars().count() > 80 {
        let truncated: String = line.chars().take(79).collect();
        format!("{}…", truncated)
    } else {
        line.to_string()
    }
}

/// Opening sentence, capped at 200 chars.
fn extract_synopsis(content: &str) -> String {
    let flat = content.split_whitespace().collect::<Vec<_>>().join(" ");
    let sentence = flat
        .split_inclusive(['.', '!', '?'])
        .next()
        .unwrap_or(&flat);
    sentence.chars().take(200).collect()
}

fn keyword_score(lower: &str, keywords: &[&str]) -> usize {
    keywords
        .iter()
        .map(|kw| lower.matches(kw).count())
        .sum()
}

/// Choose a domain label, preferring an existing one when it fits.
fn pick_domain(lower: &str, existing_domains: &[String]) -> String {
    // An existing label is apt when its own table keywords hit, or when the
    // label itself appears in the content.
    let mut best_existing: Option<(&String, usize)> = None;
    for label in existing_domains {
        let table_score = DOMAIN_KEYWORDS
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(label))
            .map(|(_, kws)| keyword_score(lower, kws))
            .unwrap_or(0);
        let mention_score = lower.matches(label.to_lowercase().as_str()).count();
        let score = table_score + mention_score * 2;
        if score > 0 && best_existing.map_or(true, |(_, s)| score > s) {
            best_existing = Some((label, score));
        }
    }
    if let Some((label, _)) = best_existing {
        return label.clone();
    }

    let mut best_table: Option<(&str, usize)> = None;
    for (name, kws) in DOMAIN_KEYWORDS {
        let score = keyword_score(lower, kws);
        if score > 0 && best_table.map_or(true, |(_, s)| score > s) {
            best_table = Some((name, score));
        }
    }
    if let Some((name, _)) = best_table {
        return name.to_string();
    }

    // No table hit: mint a Title-Case domain from the most frequent
    // significant word.
    extract_tags(lower, 1)
        .first()
        .map(|w| title_case(w))
        .unwrap_or_else(|| "General".to_string())
}

/// Most frequent significant words, alphabetical on ties.
fn extract_tags(lower: &str, limit: usize) -> Vec<String> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for word in lower.split(|c: char| !c.is_alphanumeric()) {
        if word.chars().count() >= 4 && !STOPWORDS.contains(&word) {
            *counts.entry(word).or_insert(0) += 1;
        }
    }
    let mut ranked: Vec<(&str, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
    ranked
        .into_iter()
        .take(limit)
        .map(|(w, _)| w.to_string())
        .collect()
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}
