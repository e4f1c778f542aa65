use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Where a search result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceKind {
    Google,
    LegiScan,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Google => f.write_str("Google"),
            SourceKind::LegiScan => f.write_str("LegiScan"),
        }
    }
}

/// A single retrieved document. Has no `url` field; a `url` key in model
/// output is dropped when parsing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub source: SourceKind,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
}

impl ResultRecord {
    pub fn new(source: SourceKind, title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            source,
            title: title.into(),
            description: description.into(),
        }
    }

    /// Placeholder standing in for a failed search so the rest of the
    /// pipeline still sees the failure.
    pub fn error(source: SourceKind, err: &impl fmt::Display) -> Self {
        Self::new(source, "Error", err.to_string())
    }

    pub fn key(&self) -> RecordKey<'_> {
        RecordKey {
            title: &self.title,
            source: self.source,
        }
    }
}

/// Identity of a record for subset checks: title plus source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordKey<'a> {
    pub title: &'a str,
    pub source: SourceKind,
}

/// Keywords extracted from the user's question.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SearchTerms(pub Vec<String>);

impl SearchTerms {
    pub fn as_query(&self) -> String {
        self.0.join(" ")
    }

    pub fn contains(&self, term: &str) -> bool {
        self.0.iter().any(|t| t.eq_ignore_ascii_case(term))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub title: String,
    pub source: SourceKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposedResponse {
    #[serde(default)]
    pub reasoning: String,
    pub summary: String,
    #[serde(default)]
    pub sources: Vec<Citation>,
}

impl ComposedResponse {
    /// User-facing text: the summary followed by the cited sources.
    /// `reasoning` stays internal.
    pub fn render(&self) -> String {
        let mut output = self.summary.trim().to_string();
        if !self.sources.is_empty() {
            output.push_str("\n\nSources:\n");
            for citation in &self.sources {
                output.push_str(&format!("- {} ({})\n", citation.title, citation.source));
            }
        }
        output.trim_end().to_string()
    }
}

/// Web results first, then legislative results. Nothing is deduplicated or
/// modified.
pub fn combine(google: &[ResultRecord], legiscan: &[ResultRecord]) -> Vec<ResultRecord> {
    let mut combined = Vec::with_capacity(google.len() + legiscan.len());
    combined.extend_from_slice(google);
    combined.extend_from_slice(legiscan);
    combined
}

/// Orders `pool` by the model's ranking: for each ranked entry whose title
/// and source name a pool record, emits that pool record unchanged. Unknown
/// entries and repeats are dropped; at most `limit` records are kept.
pub fn retain_known(ranked: &[ResultRecord], pool: &[ResultRecord], limit: usize) -> Vec<ResultRecord> {
    let mut by_key: HashMap<RecordKey<'_>, &ResultRecord> = HashMap::with_capacity(pool.len());
    for record in pool {
        by_key.entry(record.key()).or_insert(record);
    }

    let mut emitted = HashSet::new();
    let mut kept = Vec::with_capacity(limit.min(ranked.len()));
    for record in ranked {
        if kept.len() == limit {
            break;
        }
        let key = record.key();
        match by_key.get(&key) {
            Some(original) if emitted.insert(key) => kept.push((*original).clone()),
            Some(_) => debug!(title = %record.title, "dropping repeated ranking entry"),
            None => warn!(title = %record.title, source = %record.source, "dropping record not present in input"),
        }
    }
    kept
}

/// Drops citations that do not name one of `pool`'s records.
pub fn retain_cited(response: &mut ComposedResponse, pool: &[ResultRecord]) {
    let known: HashSet<RecordKey<'_>> = pool.iter().map(ResultRecord::key).collect();
    response.sources.retain(|c| {
        let ok = known.contains(&RecordKey {
            title: &c.title,
            source: c.source,
        });
        if !ok {
            warn!(title = %c.title, source = %c.source, "dropping citation not present in top results");
        }
        ok
    });
}
