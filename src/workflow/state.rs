//! Conversation state threaded through every workflow stage.

use serde::{Deserialize, Serialize};

use crate::db::QueryResult;
use crate::error::{QueryTalkError, Result};
use crate::workflow::machine::Node;

/// Prefix appended to the last clarifying question when the user replies.
pub const REPLY_PREFIX: &str = "\n답변: ";

/// Label assigned by the classification stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QuestionClass {
    /// Everyday conversation; answered without touching the database.
    Conversational,
    /// A data or business question; goes through SQL generation.
    Data,
}

/// The persisted record of one conversation.
///
/// A fresh state has no classification; each stage fills in its own fields.
/// `cursor` names the node execution resumes from and is `None` once the
/// conversation reached a terminal node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationState {
    pub thread_id: String,
    /// Current question; replaced by refinement.
    pub user_question: String,
    /// The question as first asked.
    pub original_question: String,
    pub question_classification: Option<QuestionClass>,
    pub question_analysis: String,
    /// Schema contexts returned by the retriever.
    pub table_contexts: Vec<String>,
    pub selected_table: Option<String>,
    /// Clarifying questions, each with the user's answer appended once given.
    pub collected_clarifications: Vec<String>,
    pub awaiting_user_reply: bool,
    pub sql_query: String,
    /// Regenerations after database errors so far.
    pub query_fix_count: u32,
    pub query_result: QueryResult,
    pub final_answer: String,
    pub error_message: Option<String>,
    pub cursor: Option<Node>,
    /// Number of times the thread was saved; a store only accepts the next one.
    pub revision: u32,
}

impl ConversationState {
    /// Creates the state for a new question, positioned at classification.
    pub fn fresh(thread_id: impl Into<String>, question: impl Into<String>) -> Self {
        let question = question.into();
        Self {
            thread_id: thread_id.into(),
            original_question: question.clone(),
            user_question: question,
            cursor: Some(Node::Classify),
            ..Default::default()
        }
    }

    /// Returns true once the conversation reached a terminal node.
    pub fn is_terminal(&self) -> bool {
        self.cursor.is_none()
    }

    /// Returns true for a conversation paused on a clarifying question.
    pub fn is_paused(&self) -> bool {
        self.awaiting_user_reply && self.cursor == Some(Node::Clarify)
    }

    /// Returns the clarifying question waiting for an answer.
    pub fn pending_question(&self) -> Option<&str> {
        if self.is_paused() {
            self.collected_clarifications.last().map(String::as_str)
        } else {
            None
        }
    }

    /// Returns the most recent clarification round, answer included.
    pub fn last_clarification(&self) -> Option<&str> {
        self.collected_clarifications.last().map(String::as_str)
    }

    /// Renders the clarification history as a numbered transcript.
    pub fn clarification_transcript(&self) -> String {
        self.collected_clarifications
            .iter()
            .enumerate()
            .map(|(i, q)| format!("{}. {}", i + 1, q))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Applies the user's reply to a paused conversation.
    ///
    /// The reply is appended to the last clarifying question in place; no
    /// new entry is created.
    pub fn apply_reply(&mut self, reply: &str) -> Result<()> {
        if !self.is_paused() {
            return Err(QueryTalkError::NotAwaitingReply(self.thread_id.clone()));
        }

        let last = self.collected_clarifications.last_mut().ok_or_else(|| {
            QueryTalkError::internal(format!(
                "Conversation '{}' is paused without a clarifying question",
                self.thread_id
            ))
        })?;

        last.push_str(REPLY_PREFIX);
        last.push_str(reply);
        self.awaiting_user_reply = false;
        Ok(())
    }
}
