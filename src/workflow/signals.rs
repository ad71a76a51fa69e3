//! Predicates over free-text LLM output.
//!
//! The orchestrator only asks these questions; how they are answered
//! (string markers today) stays behind [`OutputSignals`].

/// Prefix that ends the clarification loop unless configured otherwise.
pub const DEFAULT_TERMINATION_MARKER: &str = "종료";

/// Token that marks a failed analysis unless configured otherwise.
pub const DEFAULT_ERROR_MARKER: &str = "[ERROR]";

/// Detects control signals in LLM output.
pub trait OutputSignals: Send + Sync {
    /// Returns true when a clarifying-question completion ends the loop.
    fn clarification_complete(&self, completion: &str) -> bool;

    /// Returns true when a question analysis reports that it failed.
    fn analysis_error(&self, analysis: &str) -> bool;
}

/// Marker-based signals.
///
/// Clarification ends when the completion starts with the termination
/// marker, optionally behind an opening double quote. Analyses fail when they
/// contain the error marker anywhere.
#[derive(Debug, Clone)]
pub struct MarkerSignals {
    termination_marker: String,
    error_marker: String,
}

impl MarkerSignals {
    /// Creates signals with the given markers.
    pub fn new(termination_marker: impl Into<String>, error_marker: impl Into<String>) -> Self {
        Self {
            termination_marker: termination_marker.into(),
            error_marker: error_marker.into(),
        }
    }
}

impl Default for MarkerSignals {
    fn default() -> Self {
        Self::new(DEFAULT_TERMINATION_MARKER, DEFAULT_ERROR_MARKER)
    }
}

impl OutputSignals for MarkerSignals {
    fn clarification_complete(&self, completion: &str) -> bool {
        let text = completion.trim_start();
        let text = text.strip_prefix('"').unwrap_or(text);
        text.starts_with(&self.termination_marker)
    }

    fn analysis_error(&self, analysis: &str) -> bool {
        !self.error_marker.is_empty() && analysis.contains(&self.error_marker)
    }
}
