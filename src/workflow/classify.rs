//! Classification stage: conversational vs data question.

use tracing::debug;

use crate::error::Result;
use crate::llm::PromptKind;
use crate::workflow::state::QuestionClass;
use crate::workflow::StageContext;

/// Classifies a question.
///
/// A blank question is conversational without asking the model. Gateway
/// failures are returned, never defaulted.
pub async fn classify(ctx: &StageContext<'_>, question: &str) -> Result<QuestionClass> {
    if question.trim().is_empty() {
        return Ok(QuestionClass::Conversational);
    }

    let messages = ctx
        .prompts
        .render(PromptKind::Classification, &[("user_question", question)]);
    let completion = ctx.llm.complete(&messages).await?;
    let class = parse_classification(&completion);

    debug!(completion = %completion.trim(), ?class, "Classified question");
    Ok(class)
}

/// Parses a classification completion.
///
/// A leading `1` or the word `DATA` means a data question; anything else is
/// conversational.
pub fn parse_classification(completion: &str) -> QuestionClass {
    let text = completion.trim().trim_start_matches(['"', '\'', '`']);

    let is_data = text.starts_with('1')
        || text
            .get(..4)
            .is_some_and(|head| head.eq_ignore_ascii_case("data"));

    if is_data {
        QuestionClass::Data
    } else {
        QuestionClass::Conversational
    }
}
