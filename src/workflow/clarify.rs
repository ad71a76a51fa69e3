//! Analysis and clarification stage.
//!
//! Analyzes the question against the retrieved schema contexts, asks
//! clarifying questions one round at a time and finally folds the answers
//! back into a single refined question.

use tracing::{debug, info};

use crate::error::{QueryTalkError, Result};
use crate::llm::PromptKind;
use crate::workflow::state::ConversationState;
use crate::workflow::StageContext;

/// Line marker naming the table an analysis wants to query.
pub const TABLE_MARKER: &str = "조회 필요 테이블:";

/// What the clarification loop does next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClarificationStep {
    /// Ask the user this question and wait for the answer.
    Ask(String),
    /// Nothing left to ask.
    Complete,
}

/// Analyzes a question against the schema contexts.
///
/// An analysis carrying the error marker is `AnalysisRejected`.
pub async fn analyze(
    ctx: &StageContext<'_>,
    question: &str,
    table_contexts: &[String],
) -> Result<String> {
    let context = table_contexts.join("\n\n");
    let messages = ctx.prompts.render(
        PromptKind::Analysis,
        &[
            ("today", ctx.today.as_str()),
            ("context", context.as_str()),
            ("error_marker", ctx.error_marker),
            ("user_question", question),
        ],
    );

    let analysis = ctx.llm.complete(&messages).await?;

    if ctx.signals.analysis_error(&analysis) {
        return Err(QueryTalkError::AnalysisRejected(analysis));
    }

    debug!(contexts = table_contexts.len(), "Question analyzed");
    Ok(analysis)
}

/// Extracts the table named on the analysis line marked `조회 필요 테이블:`.
///
/// Leading whitespace and list dashes are ignored. The name ends at the
/// first `(`. No marker line or an empty name yields `None`.
pub fn extract_table_name(analysis: &str) -> Option<String> {
    analysis.lines().find_map(|line| {
        let content = line.trim_start().trim_start_matches('-').trim_start();
        let rest = content.strip_prefix(TABLE_MARKER)?;
        let name = rest.split('(').next().unwrap_or("").trim();
        (!name.is_empty()).then(|| name.to_string())
    })
}

/// Decides the next clarification round.
///
/// Once `max_rounds` questions were asked the loop completes without a
/// model call. Otherwise the model proposes the next question, and the
/// termination signal completes the loop.
pub async fn next_clarification(
    ctx: &StageContext<'_>,
    state: &ConversationState,
    max_rounds: usize,
) -> Result<ClarificationStep> {
    if state.collected_clarifications.len() >= max_rounds {
        info!(
            rounds = state.collected_clarifications.len(),
            "Clarification round limit reached"
        );
        return Ok(ClarificationStep::Complete);
    }

    let completion = clarify(
        ctx,
        &state.user_question,
        &state.question_analysis,
        &state.clarification_transcript(),
    )
    .await?;

    if ctx.signals.clarification_complete(&completion) {
        return Ok(ClarificationStep::Complete);
    }

    Ok(ClarificationStep::Ask(completion.trim().to_string()))
}

/// Asks the model for the next clarifying question.
pub async fn clarify(
    ctx: &StageContext<'_>,
    question: &str,
    analysis: &str,
    transcript: &str,
) -> Result<String> {
    let messages = ctx.prompts.render(
        PromptKind::Clarification,
        &[
            ("termination_marker", ctx.termination_marker),
            ("user_question", question),
            ("analysis", analysis),
            ("collected_questions", transcript),
        ],
    );
    ctx.llm.complete(&messages).await
}

/// Rewrites the question with the last clarification round.
///
/// An empty rewrite keeps the question unchanged.
pub async fn refine(
    ctx: &StageContext<'_>,
    question: &str,
    last_clarification: &str,
) -> Result<String> {
    let messages = ctx.prompts.render(
        PromptKind::Refinement,
        &[
            ("user_question", question),
            ("clarification", last_clarification),
        ],
    );

    let refined = ctx.llm.complete(&messages).await?;
    let refined = refined.trim();

    if refined.is_empty() {
        debug!("Refinement returned nothing; keeping the question");
        return Ok(question.to_string());
    }
    Ok(refined.to_string())
}
