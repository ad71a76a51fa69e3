//! querytalk - ask a PostgreSQL database questions in natural language.

mod cli;

use std::sync::Arc;

use cli::{retry_hint, Cli, Command};
use querytalk::config::Config;
use querytalk::db::{MockSqlExecutor, PostgresExecutor, SqlExecutor};
use querytalk::error::{QueryTalkError, Result};
use querytalk::llm::{create_client, FailingLlmClient, LlmClient, PromptLibrary};
use querytalk::logging;
use querytalk::persistence::StateDb;
use querytalk::retrieval::{KeywordRetriever, SchemaRetriever};
use querytalk::workflow::{
    FeedbackOutcome, Orchestrator, SnapshotStore, TurnOutcome, TurnStatus, WorkflowSettings,
};
use serde_json::{json, Value};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    let cli = Cli::parse_args();
    let log_to_file = cli.log_file;
    if log_to_file {
        logging::init_file_logging();
    } else {
        logging::init_stderr_logging();
    }

    let thread = cli.thread.clone();
    if let Err(e) = run(cli).await {
        error!("{}: {}", e.category(), e);
        if log_to_file {
            eprintln!("{}: {}", e.category(), e);
        }
        if let Some(hint) = retry_hint(&e, &thread) {
            eprintln!("{hint}");
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config_path();
    info!("Loading config from: {}", config_path.display());
    let mut config = Config::load_from_file(&config_path)?;

    if let Some(provider) = &cli.llm {
        config.llm.provider = provider.clone();
    }
    if let Some(schema) = &cli.schema {
        config.retrieval.schema_file = Some(schema.clone());
    }

    let state_db = Arc::new(match &config.storage.state_db {
        Some(path) => StateDb::open(path).await?,
        None => StateDb::open_default().await?,
    });

    let orchestrator = build_orchestrator(&cli, &config, state_db.clone())?;
    let output = run_command(&cli, &orchestrator, state_db.as_ref()).await;
    state_db.close().await;

    let text = serde_json::to_string_pretty(&output?)
        .map_err(|e| QueryTalkError::internal(format!("Failed to encode output: {e}")))?;
    println!("{text}");
    Ok(())
}

fn build_orchestrator(cli: &Cli, config: &Config, state_db: Arc<StateDb>) -> Result<Orchestrator> {
    let llm: Arc<dyn LlmClient> = if needs_llm(&cli.command) {
        create_client(&config.llm, cli.api_key.clone())?
    } else {
        Arc::new(FailingLlmClient::new(QueryTalkError::internal(
            "This command does not call the LLM",
        )))
    };

    let executor: Arc<dyn SqlExecutor> = if cli.mock_db {
        Arc::new(MockSqlExecutor::empty())
    } else {
        Arc::new(PostgresExecutor::new())
    };

    let mut connection = cli
        .to_connection_config()?
        .unwrap_or_else(|| config.database.clone());
    connection.apply_env_defaults();
    info!("Connection: {}", connection.display_string());

    let retriever: Arc<dyn SchemaRetriever> = match &config.retrieval.schema_file {
        Some(path) => Arc::new(KeywordRetriever::from_file(path)?),
        None => {
            warn!("No schema file configured; prompts will carry no table definitions");
            Arc::new(KeywordRetriever::empty())
        }
    };

    let prompts = match &config.workflow.prompts_dir {
        Some(dir) => PromptLibrary::load(dir)?,
        None => PromptLibrary::builtin(),
    };

    Ok(Orchestrator::new(llm, executor, state_db)
        .with_retriever(retriever)
        .with_prompts(prompts)
        .with_connection(connection)
        .with_settings(WorkflowSettings::from_config(config)))
}

fn needs_llm(command: &Command) -> bool {
    matches!(
        command,
        Command::Ask { .. } | Command::Reply { .. } | Command::Retry
    )
}

async fn run_command(cli: &Cli, orchestrator: &Orchestrator, state_db: &StateDb) -> Result<Value> {
    let thread = cli.thread.as_str();

    match &cli.command {
        Command::Ask { .. } => {
            let question = cli.command.text().unwrap_or_default();
            let outcome = orchestrator.start(thread, &question).await?;
            Ok(turn_json(&outcome))
        }
        Command::Reply { .. } => {
            let reply = cli.command.text().unwrap_or_default();
            let outcome = orchestrator.resume(thread, &reply).await?;
            Ok(turn_json(&outcome))
        }
        Command::Retry => {
            let outcome = orchestrator.retry_turn(thread).await?;
            Ok(turn_json(&outcome))
        }
        Command::Feedback { satisfied, .. } => {
            let outcome = orchestrator.record_feedback(thread, *satisfied).await?;
            Ok(match outcome {
                FeedbackOutcome::Recorded(id) => {
                    json!({ "thread_id": thread, "feedback": "recorded", "id": id })
                }
                FeedbackOutcome::Skipped(reason) => json!({
                    "thread_id": thread,
                    "feedback": "skipped",
                    "reason": format!("{reason:?}").to_lowercase(),
                }),
            })
        }
        Command::Show { history: false } => {
            let state = orchestrator.snapshot(thread).await?;
            to_json(&state)
        }
        Command::Show { history: true } => {
            let history = state_db.history(thread).await?;
            to_json(&history)
        }
        Command::End => {
            let removed = orchestrator.end_session(thread).await?;
            Ok(json!({ "thread_id": thread, "ended": removed }))
        }
    }
}

fn turn_json(outcome: &TurnOutcome) -> Value {
    let state = &outcome.state;
    match &outcome.status {
        TurnStatus::AwaitingReply { question } => json!({
            "thread_id": state.thread_id,
            "status": "awaiting_reply",
            "question": question,
        }),
        TurnStatus::Completed => json!({
            "thread_id": state.thread_id,
            "status": "completed",
            "classification": state.question_classification,
            "question": state.user_question,
            "sql": (!state.sql_query.is_empty()).then_some(&state.sql_query),
            "result": (!state.sql_query.is_empty()).then_some(&state.query_result),
            "notice": state.query_result.truncation_warning(),
            "answer": state.final_answer,
        }),
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value)
        .map_err(|e| QueryTalkError::internal(format!("Failed to encode output: {e}")))
}
