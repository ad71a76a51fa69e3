//! Query synthesis stage.

use tracing::debug;

use crate::error::Result;
use crate::llm::extract_sql;
use crate::llm::types::prompt_chars;
use crate::workflow::state::ConversationState;
use crate::workflow::StageContext;

/// A failed execution handed back to synthesis for a corrected query.
#[derive(Debug, Clone, Copy)]
pub struct QueryFailure<'a> {
    pub sql: &'a str,
    pub error: &'a str,
}

/// Writes the SQL statement for the state's current question.
///
/// With `table_templates` on and a selected table, the template named after
/// that table is used; its absence is a configuration error. The completion
/// goes through [`extract_sql`], so a reply without a statement is
/// `NoQueryFound`.
pub async fn synthesize(
    ctx: &StageContext<'_>,
    state: &ConversationState,
    table_templates: bool,
    previous: Option<QueryFailure<'_>>,
) -> Result<String> {
    let context = state.table_contexts.join("\n\n");
    let table = state.selected_table.as_deref();
    let previous_error = previous.map(previous_error_section).unwrap_or_default();

    let vars = [
        ("today", ctx.today.as_str()),
        ("context", context.as_str()),
        ("analysis", state.question_analysis.as_str()),
        ("table", table.unwrap_or("(not selected)")),
        ("previous_error", previous_error.as_str()),
        ("user_question", state.user_question.as_str()),
    ];

    let template_table = if table_templates { table } else { None };
    let messages = ctx.prompts.render_query(template_table, &vars)?;
    debug!(
        prompt_chars = prompt_chars(&messages),
        table = table.unwrap_or("-"),
        fix = previous.is_some(),
        "Requesting SQL"
    );

    let completion = ctx.llm.complete(&messages).await?;
    extract_sql(&completion)
}

fn previous_error_section(failure: QueryFailure<'_>) -> String {
    format!(
        "\n\nPrevious error:\nThis query failed.\n```sql\n{}\n```\nDatabase error: {}\nWrite a corrected query.",
        failure.sql, failure.error
    )
}
