//! Answer synthesis, for both branches of the workflow.

use crate::db::QueryResult;
use crate::error::Result;
use crate::llm::PromptKind;
use crate::workflow::StageContext;

/// Explains a query result in natural language.
///
/// The result is embedded as text; numbers are not post-processed.
pub async fn synthesize_answer(
    ctx: &StageContext<'_>,
    question: &str,
    sql: &str,
    result: &QueryResult,
) -> Result<String> {
    let result_text = result.to_prompt_text();
    let messages = ctx.prompts.render(
        PromptKind::Answer,
        &[
            ("user_question", question),
            ("sql_query", sql),
            ("query_result", result_text.as_str()),
        ],
    );
    Ok(ctx.llm.complete(&messages).await?.trim().to_string())
}

/// Replies to a conversational question from the raw question alone.
pub async fn general_answer(ctx: &StageContext<'_>, question: &str) -> Result<String> {
    let messages = ctx
        .prompts
        .render(PromptKind::GeneralConversation, &[("user_question", question)]);
    Ok(ctx.llm.complete(&messages).await?.trim().to_string())
}
