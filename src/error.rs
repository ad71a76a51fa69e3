//! Error types for querytalk.
//!
//! Defines the main error enum used throughout the workflow. Variants are
//! grouped so callers can tell transport failures (LLM gateway, retriever,
//! database) apart from best-effort parsing failures over LLM output.

use thiserror::Error;

/// Main error type for querytalk operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryTalkError {
    /// The LLM gateway could not be reached (connect failure, timeout).
    #[error("LLM gateway unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The LLM gateway answered with an error or an unreadable response.
    #[error("LLM error: {0}")]
    Upstream(String),

    /// Schema lookup failed.
    #[error("Schema retrieval unavailable: {0}")]
    RetrievalUnavailable(String),

    /// Query synthesis could not find a statement in the completion.
    #[error("No SQL query found in completion")]
    NoQueryFound {
        /// The raw completion text, kept for diagnostics.
        raw: String,
    },

    /// Question analysis carried the error marker.
    #[error("Question analysis rejected the question")]
    AnalysisRejected(String),

    /// Database connection or driver error.
    #[error("Database error [{code}]: {message}")]
    Database {
        /// Driver or SQLSTATE code (`"connection"` when no server code exists).
        code: String,
        /// Driver message.
        message: String,
    },

    /// Execution was attempted without a synthesized statement.
    #[error("No SQL query to execute")]
    MissingQuery,

    /// The read-only guard refused a statement.
    #[error("Refusing to run non read-only SQL: {0}")]
    UnsafeQuery(String),

    /// A single invocation ran more stages than the configured budget.
    #[error("Step budget of {budget} exceeded")]
    StepBudgetExceeded {
        /// The budget that was exhausted.
        budget: u32,
    },

    /// No persisted conversation exists for the thread.
    #[error("Unknown conversation thread '{0}'")]
    UnknownThread(String),

    /// A reply was sent to a conversation that is not waiting for one.
    #[error("Conversation '{0}' is not waiting for a reply")]
    NotAwaitingReply(String),

    /// Another turn saved the conversation after this turn loaded it.
    #[error("Conversation '{0}' was updated by another turn")]
    SnapshotConflict(String),

    /// Configuration errors (invalid config file, missing template, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// State database errors.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Internal application errors (unexpected states, bugs, etc.)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl QueryTalkError {
    /// Creates an upstream-unavailable error with the given message.
    pub fn upstream_unavailable(msg: impl Into<String>) -> Self {
        Self::UpstreamUnavailable(msg.into())
    }

    /// Creates an upstream error with the given message.
    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::Upstream(msg.into())
    }

    /// Creates a retrieval error with the given message.
    pub fn retrieval(msg: impl Into<String>) -> Self {
        Self::RetrievalUnavailable(msg.into())
    }

    /// Creates a database error with the given code and message.
    pub fn database(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Database {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Creates a configuration error with the given message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates a persistence error with the given message.
    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    /// Creates an internal error with the given message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns the error category as a string for display purposes.
    pub fn category(&self) -> &'static str {
        match self {
            Self::UpstreamUnavailable(_) | Self::Upstream(_) => "LLM Error",
            Self::RetrievalUnavailable(_) => "Retrieval Error",
            Self::NoQueryFound { .. } | Self::AnalysisRejected(_) => "Extraction Error",
            Self::Database { .. } | Self::MissingQuery | Self::UnsafeQuery(_) => "Query Error",
            Self::StepBudgetExceeded { .. } => "Workflow Error",
            Self::UnknownThread(_) | Self::NotAwaitingReply(_) | Self::SnapshotConflict(_) => {
                "Conversation Error"
            }
            Self::Config(_) => "Configuration Error",
            Self::Persistence(_) => "Persistence Error",
            Self::Internal(_) => "Internal Error",
        }
    }

    /// Returns true for failures of the text heuristics applied to LLM output,
    /// as opposed to transport failures.
    pub fn is_extraction_failure(&self) -> bool {
        matches!(self, Self::NoQueryFound { .. } | Self::AnalysisRejected(_))
    }

    /// Returns true when re-running the same turn may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::UpstreamUnavailable(_)
                | Self::Upstream(_)
                | Self::RetrievalUnavailable(_)
                | Self::NoQueryFound { .. }
                | Self::AnalysisRejected(_)
                | Self::Database { .. }
        )
    }
}

/// Result type alias using QueryTalkError.
pub type Result<T> = std::result::Result<T, QueryTalkError>;
