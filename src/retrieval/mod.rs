//! Schema retrieval for querytalk.
//!
//! Finds the table definitions relevant to a question. The default
//! retriever ranks `CREATE TABLE` statements by lexical overlap with the
//! question; any other strategy plugs in through [`SchemaRetriever`].

use async_trait::async_trait;
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;
use tracing::debug;

use crate::error::{QueryTalkError, Result};

/// Trait for schema retrievers.
#[async_trait]
pub trait SchemaRetriever: Send + Sync {
    /// Returns up to `limit` schema contexts, most relevant first.
    async fn retrieve(&self, question: &str, limit: usize) -> Result<Vec<String>>;

    /// Picks the single table a question is about, if one stands out.
    async fn select_table(&self, question: &str) -> Result<Option<String>>;
}

/// One table definition known to the retriever.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaDocument {
    /// Table name, when the statement declares one.
    pub table: Option<String>,
    /// The statement text.
    pub ddl: String,
    search_text: String,
}

impl SchemaDocument {
    /// Creates a document from one DDL statement.
    pub fn new(ddl: impl Into<String>) -> Self {
        let ddl = ddl.into();
        let table = table_name(&ddl);
        let search_text = ddl.to_lowercase();
        Self {
            table,
            ddl,
            search_text,
        }
    }

    fn score(&self, tokens: &[String]) -> usize {
        let mut score = tokens
            .iter()
            .filter(|token| self.search_text.contains(token.as_str()))
            .count();

        if let Some(table) = &self.table {
            let table = table.to_lowercase();
            if tokens.iter().any(|token| *token == table) {
                score += 3;
            }
        }

        score
    }
}

/// Ranks table definitions by how many question tokens they contain.
#[derive(Debug, Clone, Default)]
pub struct KeywordRetriever {
    documents: Vec<SchemaDocument>,
}

impl KeywordRetriever {
    /// Creates a retriever that knows no tables.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Creates a retriever from `;`-separated DDL statements.
    pub fn from_ddl(ddl: &str) -> Self {
        let documents = ddl
            .split(';')
            .map(str::trim)
            .filter(|statement| !statement.is_empty())
            .map(|statement| SchemaDocument::new(format!("{statement};")))
            .collect();
        Self { documents }
    }

    /// Loads DDL statements from a schema file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let ddl = std::fs::read_to_string(path).map_err(|e| {
            QueryTalkError::retrieval(format!("Failed to read schema file {}: {e}", path.display()))
        })?;
        let retriever = Self::from_ddl(&ddl);
        debug!(
            documents = retriever.documents.len(),
            "Loaded schema contexts from {}",
            path.display()
        );
        Ok(retriever)
    }

    /// Returns the known documents.
    pub fn documents(&self) -> &[SchemaDocument] {
        &self.documents
    }

    /// Returns documents with their scores, best first, ties in file order.
    fn ranked(&self, question: &str) -> Vec<(usize, &SchemaDocument)> {
        let tokens = tokenize(question);
        let mut ranked: Vec<_> = self
            .documents
            .iter()
            .map(|doc| (doc.score(&tokens), doc))
            .collect();
        ranked.sort_by(|a, b| b.0.cmp(&a.0));
        ranked
    }
}

#[async_trait]
impl SchemaRetriever for KeywordRetriever {
    async fn retrieve(&self, question: &str, limit: usize) -> Result<Vec<String>> {
        Ok(self
            .ranked(question)
            .into_iter()
            .take(limit)
            .map(|(_, doc)| doc.ddl.clone())
            .collect())
    }

    async fn select_table(&self, question: &str) -> Result<Option<String>> {
        let ranked = self.ranked(question);

        let best = match ranked.as_slice() {
            [(score, doc), rest @ ..]
                if *score > 0 && rest.first().map_or(true, |r| r.0 < *score) =>
            {
                doc.table.clone()
            }
            [(_, only)] => only.table.clone(),
            _ => None,
        };
        Ok(best)
    }
}

/// Splits a question into lowercase search tokens of at least two characters.
fn tokenize(text: &str) -> Vec<String> {
    let mut tokens: Vec<String> = text
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|token| token.chars().count() >= 2)
        .map(str::to_lowercase)
        .collect();
    tokens.sort();
    tokens.dedup();
    tokens
}

fn create_table() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)CREATE\s+TABLE\s+(?:IF\s+NOT\s+EXISTS\s+)?(.+?)\s*\(")
            .expect("valid regex")
    })
}

fn table_name(ddl: &str) -> Option<String> {
    create_table()
        .captures(ddl)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().replace(['`', '"'], "").trim().to_string())
        .filter(|name| !name.is_empty())
}

/// Extracts the table names declared in schema contexts, without duplicates.
pub fn extract_context_tables(contexts: &[String]) -> Vec<String> {
    let mut tables = Vec::new();
    for context in contexts {
        for caps in create_table().captures_iter(context) {
            if let Some(name) = caps
                .get(1)
                .map(|m| m.as_str().replace(['`', '"'], "").trim().to_string())
            {
                if !name.is_empty() && !tables.contains(&name) {
                    tables.push(name);
                }
            }
        }
    }
    tables
}
