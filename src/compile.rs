//! Compilation of ready shards into a manifest plus rendered document.
//!
//! The working set (selection-scoped or all ready shards) is ordered by
//! `ingest_seq` and summarized for the [`Curator`] collaborator, which
//! classifies the aggregate as one of the four collection types and
//! proposes a title, description, and filename. A curator failure never
//! fails the compile: a deterministic fallback manifest is substituted.
//!
//! Implementations mirror the indexer pattern:
//! - **[`KeywordCurator`]**: deterministic local keyword-vote classifier.
//! - **[`DisabledCurator`]**: always errors; the fallback path in practice.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;

use crate::config::CuratorConfig;
use crate::models::{
    CollectionManifest, CollectionType, Compilation, Shard, ShardSummary, Usage,
};

/// Characters of shard content included in a summary excerpt.
const EXCERPT_CHARS: usize = 500;

/// Manifest proposal returned by the curator collaborator.
#[derive(Debug, Clone)]
pub struct ManifestDraft {
    pub title: String,
    pub collection_type: CollectionType,
    pub description: String,
    pub suggested_filename: String,
    pub usage: Usage,
}

/// Classifies a set of shard summaries into a collection manifest.
#[async_trait]
pub trait Curator: Send + Sync {
    fn name(&self) -> &str;

    async fn summarize(&self, summaries: &[ShardSummary]) -> Result<ManifestDraft>;
}

/// Instantiate the curator named by the configuration.
pub fn create_curator(config: &CuratorConfig) -> Result<Arc<dyn Curator>> {
    match config.provider.as_str() {
        "keyword" => Ok(Arc::new(KeywordCurator)),
        "disabled" => Ok(Arc::new(DisabledCurator)),
        other => bail!("Unknown curator provider: {}", other),
    }
}

/// A no-op curator that always returns errors.
pub struct DisabledCurator;

#[async_trait]
impl Curator for DisabledCurator {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn summarize(&self, _summaries: &[ShardSummary]) -> Result<ManifestDraft> {
        bail!("Curator is disabled")
    }
}

/// Deterministic local curator using keyword votes.
pub struct KeywordCurator;

#[async_trait]
impl Curator for KeywordCurator {
    fn name(&self) -> &str {
        "keyword"
    }

    async fn summarize(&self, summaries: &[ShardSummary]) -> Result<ManifestDraft> {
        if summaries.is_empty() {
            bail!("Nothing to summarize");
        }
        let collection_type = vote_collection_type(summaries);
        let title = collection_title(summaries);
        let domains = distinct_domains(summaries);
        let description = format!(
            "A {} collection of {} shard{} covering {}.",
            collection_type.as_str(),
            summaries.len(),
            if summaries.len() == 1 { "" } else { "s" },
            domains.join(", "),
        );
        Ok(ManifestDraft {
            suggested_filename: format!("{}.md", slugify(&title)),
            title,
            collection_type,
            description,
            usage: Usage {
                input_tokens: summaries
                    .iter()
                    .map(|s| s.excerpt.chars().count() as u64 / 4)
                    .sum(),
                output_tokens: 32,
            },
        })
    }
}

/// Build the summary handed to the curator for one shard.
pub fn summarize_shard(shard: &Shard) -> ShardSummary {
    let meta = shard.metadata.as_ref();
    ShardSummary {
        id: shard.id.clone(),
        title: meta.map(|m| m.title.clone()).unwrap_or_else(|| "Untitled".to_string()),
        domain: meta.map(|m| m.domain.clone()).unwrap_or_default(),
        tags: meta.map(|m| m.tags.clone()).unwrap_or_default(),
        excerpt: shard.content.chars().take(EXCERPT_CHARS).collect(),
    }
}

/// Deterministic manifest used when the working set is empty or the
/// curator fails.
pub fn fallback_manifest(summaries: &[ShardSummary]) -> CollectionManifest {
    if summaries.is_empty() {
        return CollectionManifest {
            title: "Empty Collection".to_string(),
            collection_type: CollectionType::Mixed,
            description: "No ready shards were available to compile.".to_string(),
            suggested_filename: "empty-collection.md".to_string(),
        };
    }
    let title = collection_title(summaries);
    CollectionManifest {
        collection_type: vote_collection_type(summaries),
        description: format!(
            "A collection of {} shard{}.",
            summaries.len(),
            if summaries.len() == 1 { "" } else { "s" },
        ),
        suggested_filename: format!("{}.md", slugify(&title)),
        title,
    }
}

/// Compile an ordered working set into a manifest and rendered document.
///
/// `shards` must already be in compilation order. Never fails: curator
/// errors degrade to the fallback manifest, an empty set produces the
/// placeholder manifest and an empty document.
pub async fn compile(shards: &[Shard], curator: &dyn Curator) -> (Compilation, Option<Usage>) {
    if shards.is_empty() {
        return (
            Compilation {
                manifest: fallback_manifest(&[]),
                document: String::new(),
                shard_count: 0,
            },
            None,
        );
    }

    let summaries: Vec<ShardSummary> = shards.iter().map(summarize_shard).collect();
    let (manifest, usage) = match curator.summarize(&summaries).await {
        Ok(draft) => (
            CollectionManifest {
                title: draft.title,
                collection_type: draft.collection_type,
                description: draft.description,
                suggested_filename: draft.suggested_filename,
            },
            Some(draft.usage),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "curator failed, using fallback manifest");
            (fallback_manifest(&summaries), None)
        }
    };

    let document = render_document(&manifest, shards);
    (
        Compilation {
            manifest,
            document,
            shard_count: shards.len(),
        },
        usage,
    )
}

fn render_document(manifest: &CollectionManifest, shards: &[Shard]) -> String {
    let mut doc = String::new();
    doc.push_str(&format!("# {}\n\n{}\n\n", manifest.title, manifest.description));

    doc.push_str("## Contents\n\n");
    for (idx, shard) in shards.iter().enumerate() {
        let title = shard
            .metadata
            .as_ref()
            .map(|m| m.title.as_str())
            .unwrap_or("Untitled");
        doc.push_str(&format!("{}. {}\n", idx + 1, title));
    }
    doc.push('\n');

    for (idx, shard) in shards.iter().enumerate() {
        if idx > 0 {
            doc.push_str("\n---\n\n");
        }
        let meta = shard.metadata.as_ref();
        let title = meta.map(|m| m.title.as_str()).unwrap_or("Untitled");
        let domain = meta.map(|m| m.domain.as_str()).unwrap_or("");
        let tags = meta
            .map(|m| m.tags.join(", "))
            .unwrap_or_default();

        doc.push_str(&format!("## {}\n\n", title));
        doc.push_str(&format!(
            "*Domain: {} | Tags: {} | ~{} tokens*\n\n",
            domain, tags, shard.token_count
        ));

        if manifest.collection_type == CollectionType::Codebase {
            let lang = meta
                .map(|m| guess_language(&m.domain, &m.tags))
                .unwrap_or("text");
            doc.push_str(&format!("```{}\n{}\n```\n", lang, shard.content));
        } else {
            doc.push_str(&shard.content);
            doc.push('\n');
        }
    }
    doc
}

/// Fixed keyword table mapping domain/tag markers to a fence language hint.
const LANGUAGE_KEYWORDS: &[(&str, &str)] = &[
    ("rust", "rust"),
    ("python", "python"),
    ("typescript", "typescript"),
    ("javascript", "javascript"),
    ("golang", "go"),
    ("java", "java"),
    ("sql", "sql"),
    ("database", "sql"),
    ("shell", "bash"),
    ("bash", "bash"),
    ("html", "html"),
    ("css", "css"),
    ("json", "json"),
    ("yaml", "yaml"),
];

/// Guess a fence language from a shard's domain and tags.
pub fn guess_language(domain: &str, tags: &[String]) -> &'static str {
    let mut haystack = domain.to_lowercase();
    for tag in tags {
        haystack.push(' ');
        haystack.push_str(&tag.to_lowercase());
    }
    for (keyword, lang) in LANGUAGE_KEYWORDS {
        if haystack.contains(keyword) {
            return lang;
        }
    }
    "text"
}

const CODE_MARKERS: &[&str] = &[
    "rust", "python", "javascript", "typescript", "golang", "java", "code",
    "programming", "shell", "bash",
];
const DATA_MARKERS: &[&str] = &[
    "dataset", "data", "database", "sql", "csv", "json", "metrics", "table",
];

fn vote_collection_type(summaries: &[ShardSummary]) -> CollectionType {
    let mut code = 0usize;
    let mut data = 0usize;
    let mut prose = 0usize;
    for summary in summaries {
        let mut haystack = summary.domain.to_lowercase();
        for tag in &summary.tags {
            haystack.push(' ');
            haystack.push_str(&tag.to_lowercase());
        }
        if CODE_MARKERS.iter().any(|m| haystack.contains(m)) {
            code += 1;
        } else if DATA_MARKERS.iter().any(|m| haystack.contains(m)) {
            data += 1;
        } else {
            prose += 1;
        }
    }
    let majority = summaries.len().div_ceil(2);
    if code >= majority && code > data && code > prose {
        CollectionType::Codebase
    } else if data >= majority && data > code && data > prose {
        CollectionType::Dataset
    } else if prose >= majority && prose > code && prose > data {
        CollectionType::Document
    } else {
        CollectionType::Mixed
    }
}

fn collection_title(summaries: &[ShardSummary]) -> String {
    if summaries.len() == 1 {
        return summaries[0].title.clone();
    }
    let domains = distinct_domains(summaries);
    if domains.len() == 1 && !domains[0].is_empty() {
        format!("{} Collection", domains[0])
    } else {
        "Knowledge Collection".to_string()
    }
}

fn distinct_domains(summaries: &[ShardSummary]) -> Vec<String> {
    let mut domains: Vec<String> = summaries
        .iter()
        .map(|s| {
            if s.domain.is_empty() {
                "Uncategorized".to_string()
            } else {
                s.domain.clone()
            }
        })
        .collect();
    domains.sort();
    domains.dedup();
    domains
}

fn slugify(title: &str) -> String {
    let slug: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect();
    let collapsed: Vec<&str> = slug.split('-').filter(|p| !p.is_empty()).collect();
    if collapsed.is_empty() {
        "collection".to_string()
    } else {
        collapsed.join("-")
    }
}
