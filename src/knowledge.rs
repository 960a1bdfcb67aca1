//! Knowledge and host-profile interfaces.
//!
//! The engine consumes knowledge through the narrow [`KnowledgeStore`]
//! trait; the bundled implementation is an in-memory BM25 index, which
//! keeps ranked recall useful without an embedding service. Facts are
//! keyed by host identity so one host's quirks never leak into another's
//! prompt.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// One ranked hit from a knowledge query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeHit {
    pub fact: String,
    pub host_id: Option<String>,
    pub score: f32,
}

/// Relevance-ranked store of durable facts.
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    /// Persist a fact, optionally scoped to one host.
    async fn remember(&self, host_id: Option<&str>, fact: &str);

    /// Top-k facts relevant to `query`. With a host filter, global facts
    /// are excluded.
    async fn search(&self, query: &str, top_k: usize, host_id: Option<&str>) -> Vec<KnowledgeHit>;

    /// Host facts formatted for prompt injection, best first.
    async fn host_memories_for_prompt(
        &self,
        host_id: &str,
        context_query: &str,
        max_count: usize,
    ) -> Vec<String>;
}

#[derive(Debug, Clone)]
struct StoredFact {
    host_id: Option<String>,
    fact: String,
    terms: HashMap<String, u32>,
    length: u32,
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect()
}

/// In-memory BM25 knowledge store.
///
/// Scores are recomputed per query over the fact set; at the scale of
/// per-host operator notes this stays well under a millisecond and avoids
/// index invalidation entirely.
pub struct Bm25KnowledgeStore {
    facts: RwLock<Vec<StoredFact>>,
    k1: f32,
    b: f32,
}

impl Bm25KnowledgeStore {
    pub fn new() -> Self {
        Self {
            facts: RwLock::new(Vec::new()),
            k1: 1.5,
            b: 0.75,
        }
    }

    fn score(&self, query_terms: &[String], facts: &[StoredFact], doc: &StoredFact) -> f32 {
        let n = facts.len() as f32;
        let avgdl =
            facts.iter().map(|f| f.length as f32).sum::<f32>() / n.max(1.0);
        let mut score = 0.0;
        for term in query_terms {
            let df = facts
                .iter()
                .filter(|f| f.terms.contains_key(term))
                .count() as f32;
            if df == 0.0 {
                continue;
            }
            let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
            let tf = *doc.terms.get(term).unwrap_or(&0) as f32;
            let denom = tf + self.k1 * (1.0 - self.b + self.b * doc.length as f32 / avgdl.max(1.0));
            score += idf * (tf * (self.k1 + 1.0)) / denom.max(f32::EPSILON);
        }
        score
    }
}

impl Default for Bm25KnowledgeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KnowledgeStore for Bm25KnowledgeStore {
    async fn remember(&self, host_id: Option<&str>, fact: &str) {
        let fact = fact.trim();
        if fact.is_empty() {
            return;
        }
        let tokens = tokenize(fact);
        let mut terms = HashMap::new();
        for t in &tokens {
            *terms.entry(t.clone()).or_insert(0) += 1;
        }
        let mut facts = self.facts.write().await;
        // Re-remembering an identical fact for the same host is a no-op.
        if facts
            .iter()
            .any(|f| f.fact == fact && f.host_id.as_deref() == host_id)
        {
            return;
        }
        facts.push(StoredFact {
            host_id: host_id.map(String::from),
            fact: fact.to_string(),
            length: tokens.len() as u32,
            terms,
        });
    }

    async fn search(&self, query: &str, top_k: usize, host_id: Option<&str>) -> Vec<KnowledgeHit> {
        let query_terms = tokenize(query);
        let facts = self.facts.read().await;
        let mut hits: Vec<KnowledgeHit> = facts
            .iter()
            .filter(|f| match host_id {
                Some(h) => f.host_id.as_deref() == Some(h),
                None => true,
            })
            .map(|f| KnowledgeHit {
                fact: f.fact.clone(),
                host_id: f.host_id.clone(),
                score: self.score(&query_terms, &facts, f),
            })
            .filter(|h| h.score > 0.0)
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_k);
        hits
    }

    async fn host_memories_for_prompt(
        &self,
        host_id: &str,
        context_query: &str,
        max_count: usize,
    ) -> Vec<String> {
        let ranked = self.search(context_query, max_count, Some(host_id)).await;
        if !ranked.is_empty() {
            return ranked.into_iter().map(|h| h.fact).collect();
        }
        // Nothing matched the query; fall back to the most recent facts so
        // the prompt still carries what the operator taught us.
        let facts = self.facts.read().await;
        facts
            .iter()
            .filter(|f| f.host_id.as_deref() == Some(host_id))
            .rev()
            .take(max_count)
            .map(|f| f.fact.clone())
            .collect()
    }
}

/// Mutable per-host facts the prompt builder reads: shell, OS, working dir.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostProfile {
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default)]
    pub os: Option<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
}

/// Single-writer host profile store; the owning engine serialises writes.
#[derive(Default)]
pub struct HostProfileStore {
    profiles: RwLock<HashMap<String, HostProfile>>,
}

impl HostProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, host_id: &str) -> HostProfile {
        self.profiles
            .read()
            .await
            .get(host_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn update(&self, host_id: &str, patch: HostProfile) {
        let mut profiles = self.profiles.write().await;
        let entry = profiles.entry(host_id.to_string()).or_default();
        if patch.shell.is_some() {
            entry.shell = patch.shell;
        }
        if patch.os.is_some() {
            entry.os = patch.os;
        }
        if patch.working_dir.is_some() {
            entry.working_dir = patch.working_dir;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_remember_and_search() {
        let store = Bm25KnowledgeStore::new();
        store
            .remember(Some("web-1"), "nginx config lives in /etc/nginx/sites-enabled")
            .await;
        store
            .remember(Some("web-1"), "deploy user is called shipit")
            .await;
        store.remember(Some("db-1"), "postgres 14 on port 5433").await;

        let hits = store.search("where is the nginx config", 5, Some("web-1")).await;
        assert!(!hits.is_empty());
        assert!(hits[0].fact.contains("nginx"));

        // Host scoping: db-1 facts never surface for web-1.
        assert!(hits.iter().all(|h| h.host_id.as_deref() == Some("web-1")));
    }

    #[tokio::test]
    async fn test_search_global() {
        let store = Bm25KnowledgeStore::new();
        store.remember(None, "maintenance window is Sunday 02:00").await;
        let hits = store.search("maintenance window", 3, None).await;
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_fact_ignored() {
        let store = Bm25KnowledgeStore::new();
        store.remember(Some("h"), "fact one").await;
        store.remember(Some("h"), "fact one").await;
        let hits = store.search("fact one", 10, Some("h")).await;
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn test_host_memories_fallback_to_recent() {
        let store = Bm25KnowledgeStore::new();
        store.remember(Some("h"), "alpha").await;
        store.remember(Some("h"), "beta").await;
        // Query shares no terms with any fact: recency fallback.
        let memories = store.host_memories_for_prompt("h", "zzz qqq", 1).await;
        assert_eq!(memories, vec!["beta".to_string()]);
    }

    #[tokio::test]
    async fn test_top_k_truncation() {
        let store = Bm25KnowledgeStore::new();
        for i in 0..10 {
            store.remember(Some("h"), &format!("disk fact number {}", i)).await;
        }
        let hits = store.search("disk fact", 3, Some("h")).await;
        assert_eq!(hits.len(), 3);
    }

    #[tokio::test]
    async fn test_host_profile_patch_merges() {
        let store = HostProfileStore::new();
        store
            .update(
                "web-1",
                HostProfile {
                    shell: Some("bash".into()),
                    os: None,
                    working_dir: None,
                },
            )
            .await;
        store
            .update(
                "web-1",
                HostProfile {
                    shell: None,
                    os: Some("Ubuntu 24.04".into()),
                    working_dir: None,
                },
            )
            .await;
        let profile = store.get("web-1").await;
        assert_eq!(profile.shell.as_deref(), Some("bash"));
        assert_eq!(profile.os.as_deref(), Some("Ubuntu 24.04"));
    }
}
