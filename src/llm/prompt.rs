//! Prompt templates for the workflow stages.
//!
//! Every stage renders a system message from a template plus a fixed user
//! message. Built-in templates can be overridden from a prompts directory:
//!
//! ```text
//! prompts/
//!   question_evaluation.prompt
//!   question_analysis.prompt
//!   ...
//!   query_creation/
//!     orders.prompt      # used when `orders` is the selected table
//! ```
//!
//! Placeholders are written `{name}`; unknown placeholders are left as is.

use std::collections::HashMap;
use std::path::Path;

use tracing::debug;

use crate::error::{QueryTalkError, Result};
use crate::llm::types::Message;

const CLASSIFICATION: &str = r#"Task: classify the user question.
Decide whether the question asks for data or business information that lives in the company database, or whether it is everyday conversation.
Answer with a single character: 1 for a data or business question, 0 for conversation. Do not explain."#;

const GENERAL_CONVERSATION: &str = r#"Task: general conversation.
You are a friendly assistant of a data analytics service. Reply naturally and briefly.
If the user seems to want numbers, invite them to ask a concrete question about their data."#;

const ANALYSIS: &str = r#"Task: analyze the user question for SQL generation.
Today is {today}.

Available tables:
{context}

Describe the intent, the metrics, the filters and the time range the question asks for.
On its own line name the table to query, in the form
- 조회 필요 테이블: <table name> (<short reason>)
If the available tables cannot answer the question, write {error_marker} followed by the reason."#;

const CLARIFICATION: &str = r#"Task: clarify the user question.
You help a user make a data question precise enough for a single SQL query.
You get the original question, its analysis and the follow-up questions asked so far together with the user's answers.
Ask the one follow-up question that matters most. Ask it in the user's language.
When nothing important is missing any more, reply with a line starting with {termination_marker}."#;

const REFINEMENT: &str = r#"Task: refine the user question.
Rewrite the question into one self-contained question that carries every detail the user confirmed in the follow-up dialogue.
Reply with the rewritten question only."#;

const QUERY_CREATION: &str = r#"Task: write SQL for PostgreSQL.
Today is {today}.

Schema:
{context}

Question analysis:
{analysis}

Target table: {table}

Write one read-only SELECT statement that answers the question and return it in a ```sql code block.{previous_error}"#;

const ANSWER: &str = r#"Task: answer the user question from the query result.
Explain the result in plain language. Mention the SQL query that produced it.
Only use numbers that appear in the result."#;

/// The prompt used by each workflow stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromptKind {
    /// Data vs. conversation classification.
    Classification,
    /// Reply to a conversational question.
    GeneralConversation,
    /// Intent and table analysis.
    Analysis,
    /// Next clarifying question.
    Clarification,
    /// Rewrite of the question after clarification.
    Refinement,
    /// SQL generation.
    QueryCreation,
    /// Final natural-language answer.
    Answer,
}

impl PromptKind {
    /// All prompt kinds.
    pub const ALL: [PromptKind; 7] = [
        Self::Classification,
        Self::GeneralConversation,
        Self::Analysis,
        Self::Clarification,
        Self::Refinement,
        Self::QueryCreation,
        Self::Answer,
    ];

    /// File stem of the override template.
    pub fn file_stem(&self) -> &'static str {
        match self {
            Self::Classification => "question_evaluation",
            Self::GeneralConversation => "general_conversation",
            Self::Analysis => "question_analysis",
            Self::Clarification => "additional_question",
            Self::Refinement => "question_refinement",
            Self::QueryCreation => "query_creation",
            Self::Answer => "final_answer",
        }
    }

    fn builtin(&self) -> &'static str {
        match self {
            Self::Classification => CLASSIFICATION,
            Self::GeneralConversation => GENERAL_CONVERSATION,
            Self::Analysis => ANALYSIS,
            Self::Clarification => CLARIFICATION,
            Self::Refinement => REFINEMENT,
            Self::QueryCreation => QUERY_CREATION,
            Self::Answer => ANSWER,
        }
    }

    fn user_template(&self) -> &'static str {
        match self {
            Self::Classification => "질문(user_question): {user_question}",
            Self::GeneralConversation => "{user_question}",
            Self::Analysis => "사용자 질문: {user_question}",
            Self::Clarification => {
                "원래 사용자 질문:\n{user_question}\n\n초기 질문 분석:\n{analysis}\n\n이전 질문 기록:\n{collected_questions}"
            }
            Self::Refinement => {
                "사용자 질문:\n{user_question}\n\n추가 질문과 답변:\n{clarification}\n\n구체화된 질문:"
            }
            Self::QueryCreation => "{user_question}",
            Self::Answer => "질문: {user_question}\n\nSQL:\n{sql_query}\n\n결과:\n{query_result}",
        }
    }
}

/// Prompt templates, built-in or loaded from a directory.
#[derive(Debug, Clone, Default)]
pub struct PromptLibrary {
    overrides: HashMap<PromptKind, String>,
    table_templates: HashMap<String, String>,
}

impl PromptLibrary {
    /// Creates a library with only the built-in templates.
    pub fn builtin() -> Self {
        Self::default()
    }

    /// Loads overrides and table-specific query templates from `dir`.
    ///
    /// Missing files fall back to the built-in templates.
    pub fn load(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Err(QueryTalkError::config(format!(
                "Prompts directory {} does not exist",
                dir.display()
            )));
        }

        let mut library = Self::default();

        for kind in PromptKind::ALL {
            let path = dir.join(format!("{}.prompt", kind.file_stem()));
            if path.is_file() {
                library.overrides.insert(kind, read_template(&path)?);
            }
        }

        let tables_dir = dir.join(PromptKind::QueryCreation.file_stem());
        if tables_dir.is_dir() {
            let entries = std::fs::read_dir(&tables_dir).map_err(|e| {
                QueryTalkError::config(format!("Failed to read {}: {e}", tables_dir.display()))
            })?;
            for entry in entries {
                let path = entry
                    .map_err(|e| QueryTalkError::config(format!("Failed to read entry: {e}")))?
                    .path();
                if path.extension().and_then(|e| e.to_str()) != Some("prompt") {
                    continue;
                }
                if let Some(table) = path.file_stem().and_then(|s| s.to_str()) {
                    library
                        .table_templates
                        .insert(table.to_string(), read_template(&path)?);
                }
            }
        }

        debug!(
            overrides = library.overrides.len(),
            table_templates = library.table_templates.len(),
            "Loaded prompt templates from {}",
            dir.display()
        );
        Ok(library)
    }

    /// Registers a table-specific query template.
    pub fn with_table_template(
        mut self,
        table: impl Into<String>,
        template: impl Into<String>,
    ) -> Self {
        self.table_templates.insert(table.into(), template.into());
        self
    }

    /// Returns the system template for a stage.
    pub fn template(&self, kind: PromptKind) -> &str {
        self.overrides
            .get(&kind)
            .map(String::as_str)
            .unwrap_or_else(|| kind.builtin())
    }

    /// Renders the messages for a stage.
    pub fn render(&self, kind: PromptKind, vars: &[(&str, &str)]) -> Vec<Message> {
        vec![
            Message::system(fill(self.template(kind), vars)),
            Message::user(fill(kind.user_template(), vars)),
        ]
    }

    /// Renders the query creation messages.
    ///
    /// With `table` set, the template registered for that table is used and
    /// its absence is a configuration error. Without it the generic template
    /// applies.
    pub fn render_query(&self, table: Option<&str>, vars: &[(&str, &str)]) -> Result<Vec<Message>> {
        let template = match table {
            Some(table) => self
                .table_templates
                .get(table)
                .map(String::as_str)
                .ok_or_else(|| {
                    QueryTalkError::config(format!("No query template for table '{table}'"))
                })?,
            None => self.template(PromptKind::QueryCreation),
        };

        Ok(vec![
            Message::system(fill(template, vars)),
            Message::user(fill(PromptKind::QueryCreation.user_template(), vars)),
        ])
    }
}

fn read_template(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| QueryTalkError::config(format!("Failed to read {}: {e}", path.display())))
}

/// Substitutes `{name}` placeholders in one pass.
///
/// Values are not rescanned, so a question containing braces stays intact.
fn fill(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let value = after.find('}').and_then(|end| {
            let name = &after[..end];
            vars.iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| (*value, end))
        });

        match value {
            Some((value, end)) => {
                out.push_str(value);
                rest = &after[end + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }

    out.push_str(rest);
    out
}
