//! The conversation workflow.
//!
//! Stages are plain async functions over a [`StageContext`]; the
//! [`Orchestrator`] runs them as an explicit state machine and persists the
//! [`ConversationState`] after every turn.

pub mod answer;
pub mod clarify;
pub mod classify;
pub mod execution;
pub mod machine;
pub mod orchestrator;
pub mod signals;
pub mod state;
pub mod store;
pub mod synthesis;

pub use machine::{transition, Event, Node, Transition};
pub use orchestrator::{
    FeedbackOutcome, Orchestrator, SkipReason, TurnOutcome, TurnRequest, TurnStatus,
    WorkflowSettings,
};
pub use signals::{MarkerSignals, OutputSignals};
pub use state::{ConversationState, QuestionClass};
pub use store::{FeedbackRecord, MemoryStore, SnapshotStore};

use chrono::{Local, NaiveDate};

use crate::llm::{LlmClient, PromptLibrary};

/// Everything a prompt-driven stage needs besides the conversation state.
pub struct StageContext<'a> {
    pub llm: &'a dyn LlmClient,
    pub prompts: &'a PromptLibrary,
    pub signals: &'a dyn OutputSignals,
    /// Date the prompts treat as today, `YYYY-MM-DD`.
    pub today: String,
    pub termination_marker: &'a str,
    pub error_marker: &'a str,
}

impl<'a> StageContext<'a> {
    /// Creates a context dated today with the default markers.
    pub fn new(
        llm: &'a dyn LlmClient,
        prompts: &'a PromptLibrary,
        signals: &'a dyn OutputSignals,
    ) -> Self {
        Self {
            llm,
            prompts,
            signals,
            today: format_date(Local::now().date_naive()),
            termination_marker: signals::DEFAULT_TERMINATION_MARKER,
            error_marker: signals::DEFAULT_ERROR_MARKER,
        }
    }

    pub fn with_today(mut self, today: impl Into<String>) -> Self {
        self.today = today.into();
        self
    }

    pub fn with_markers(mut self, termination_marker: &'a str, error_marker: &'a str) -> Self {
        self.termination_marker = termination_marker;
        self.error_marker = error_marker;
        self
    }
}

pub(crate) fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}
