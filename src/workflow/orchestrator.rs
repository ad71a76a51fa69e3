//! Workflow orchestrator.
//!
//! Runs one turn of a conversation: loads or creates the state, executes
//! stages until the machine finishes or suspends, and persists the result.
//! Turns of the same thread are serialized; different threads run
//! concurrently on one shared orchestrator.

use chrono::{Local, NaiveDate};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::config::{Config, ConnectionConfig};
use crate::db::SqlExecutor;
use crate::error::{QueryTalkError, Result};
use crate::llm::{LlmClient, PromptLibrary};
use crate::retrieval::{extract_context_tables, KeywordRetriever, SchemaRetriever};
use crate::workflow::answer::{general_answer, synthesize_answer};
use crate::workflow::clarify::{
    analyze, extract_table_name, next_clarification, refine, ClarificationStep,
};
use crate::workflow::classify::classify;
use crate::workflow::execution::execute_and_shape;
use crate::workflow::machine::{transition, Event, Node, Transition};
use crate::workflow::signals::{MarkerSignals, OutputSignals};
use crate::workflow::state::{ConversationState, QuestionClass};
use crate::workflow::store::{FeedbackRecord, SnapshotStore};
use crate::workflow::synthesis::{synthesize, QueryFailure};
use crate::workflow::{format_date, StageContext};

/// Limits and switches of the workflow.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowSettings {
    pub step_budget: u32,
    pub max_rows: usize,
    pub clarification: bool,
    pub max_clarification_rounds: usize,
    pub max_query_fix: u32,
    pub read_only: bool,
    pub termination_marker: String,
    pub error_marker: String,
    pub table_templates: bool,
    /// Schema contexts requested from the retriever.
    pub context_count: usize,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl WorkflowSettings {
    pub fn from_config(config: &Config) -> Self {
        let workflow = &config.workflow;
        Self {
            step_budget: workflow.step_budget,
            max_rows: workflow.max_rows,
            clarification: workflow.clarification,
            max_clarification_rounds: workflow.max_clarification_rounds,
            max_query_fix: workflow.max_query_fix,
            read_only: workflow.read_only,
            termination_marker: workflow.termination_marker.clone(),
            error_marker: workflow.error_marker.clone(),
            table_templates: workflow.table_templates,
            context_count: config.retrieval.context_count,
        }
    }
}

/// Input of one turn.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub thread_id: String,
    /// The question on an initial turn, the reply otherwise.
    pub user_question: String,
    pub is_initial_turn: bool,
    /// State to resume instead of the persisted snapshot.
    pub previous_state: Option<ConversationState>,
}

impl TurnRequest {
    /// Starts a new conversation on `thread_id`.
    pub fn initial(thread_id: impl Into<String>, question: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            user_question: question.into(),
            is_initial_turn: true,
            previous_state: None,
        }
    }

    /// Answers the pending clarifying question of `thread_id`.
    pub fn reply(thread_id: impl Into<String>, reply: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            user_question: reply.into(),
            is_initial_turn: false,
            previous_state: None,
        }
    }

    pub fn with_previous_state(mut self, state: ConversationState) -> Self {
        self.previous_state = Some(state);
        self
    }
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnStatus {
    /// The conversation reached a terminal node.
    Completed,
    /// The conversation paused on a clarifying question.
    AwaitingReply { question: String },
}

/// Result of one turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    pub state: ConversationState,
    pub status: TurnStatus,
}

/// Why feedback was not logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Conversational,
    /// The conversation has not produced a final answer yet.
    Incomplete,
}

/// Result of [`Orchestrator::record_feedback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackOutcome {
    Recorded(i64),
    Skipped(SkipReason),
}

type ThreadLocks = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// Holds the turn lock of one thread.
///
/// On drop the map entry is removed once no other turn holds or waits for
/// the lock.
struct TurnGuard<'a> {
    locks: &'a ThreadLocks,
    thread_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // Released under the map lock so no new turn can clone the entry in between.
        drop(self.guard.take());
        let idle = locks
            .get(&self.thread_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1);
        if idle {
            locks.remove(&self.thread_id);
        }
    }
}

/// Drives conversations through the workflow.
pub struct Orchestrator {
    llm: Arc<dyn LlmClient>,
    executor: Arc<dyn SqlExecutor>,
    store: Arc<dyn SnapshotStore>,
    retriever: Arc<dyn SchemaRetriever>,
    prompts: PromptLibrary,
    signals: Option<Arc<dyn OutputSignals>>,
    connection: ConnectionConfig,
    settings: WorkflowSettings,
    as_of_date: Option<NaiveDate>,
    locks: ThreadLocks,
}

impl Orchestrator {
    /// Creates an orchestrator with default settings, built-in prompts and
    /// a retriever that knows no tables.
    pub fn new(
        llm: Arc<dyn LlmClient>,
        executor: Arc<dyn SqlExecutor>,
        store: Arc<dyn SnapshotStore>,
    ) -> Self {
        Self {
            llm,
            executor,
            store,
            retriever: Arc::new(KeywordRetriever::empty()),
            prompts: PromptLibrary::builtin(),
            signals: None,
            connection: ConnectionConfig::default(),
            settings: WorkflowSettings::default(),
            as_of_date: None,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_retriever(mut self, retriever: Arc<dyn SchemaRetriever>) -> Self {
        self.retriever = retriever;
        self
    }

    pub fn with_settings(mut self, settings: WorkflowSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    pub fn with_prompts(mut self, prompts: PromptLibrary) -> Self {
        self.prompts = prompts;
        self
    }

    /// Replaces the marker-based signals built from the settings.
    pub fn with_signals(mut self, signals: Arc<dyn OutputSignals>) -> Self {
        self.signals = Some(signals);
        self
    }

    /// Fixes the date prompts treat as today.
    pub fn with_as_of_date(mut self, date: NaiveDate) -> Self {
        self.as_of_date = Some(date);
        self
    }

    /// Starts a conversation.
    pub async fn start(&self, thread_id: &str, question: &str) -> Result<TurnOutcome> {
        self.run_turn(TurnRequest::initial(thread_id, question)).await
    }

    /// Answers the pending clarifying question and continues.
    pub async fn resume(&self, thread_id: &str, reply: &str) -> Result<TurnOutcome> {
        self.run_turn(TurnRequest::reply(thread_id, reply)).await
    }

    /// Runs one turn.
    ///
    /// An initial turn starts a fresh state at classification. A follow-up
    /// turn applies the reply to the paused state and resumes at the
    /// clarification node. On failure the state is persisted with
    /// `error_message` set and the cursor left on the failing node.
    ///
    /// If another process saved the thread while this turn ran, the turn
    /// fails with `SnapshotConflict` and its state is discarded.
    pub async fn run_turn(&self, request: TurnRequest) -> Result<TurnOutcome> {
        let _guard = self.lock_thread(&request.thread_id).await;

        let mut state = self.prepare(request).await?;
        let result = self.drive(&mut state).await;
        self.finish_turn(state, result).await
    }

    /// Re-runs a failed turn from the node it failed on.
    ///
    /// Paused and finished conversations are returned as they are.
    pub async fn retry_turn(&self, thread_id: &str) -> Result<TurnOutcome> {
        let _guard = self.lock_thread(thread_id).await;

        let mut state = self.load_existing(thread_id).await?;

        if let Some(question) = state.pending_question() {
            let status = TurnStatus::AwaitingReply {
                question: question.to_string(),
            };
            return Ok(TurnOutcome { state, status });
        }
        if state.is_terminal() {
            return Ok(TurnOutcome {
                state,
                status: TurnStatus::Completed,
            });
        }

        info!(
            thread_id,
            cursor = ?state.cursor,
            error = state.error_message.as_deref().unwrap_or(""),
            "Retrying turn"
        );
        state.error_message = None;
        let result = self.drive(&mut state).await;
        self.finish_turn(state, result).await
    }

    /// Appends the finished conversation to the feedback log.
    ///
    /// Only completed data conversations are logged. After
    /// [`end_session`](Self::end_session) the last snapshot of the history
    /// is used.
    pub async fn record_feedback(
        &self,
        thread_id: &str,
        satisfied: bool,
    ) -> Result<FeedbackOutcome> {
        let _guard = self.lock_thread(thread_id).await;

        let state = match self.store.load(thread_id).await? {
            Some(state) => state,
            None => self
                .store
                .history(thread_id)
                .await?
                .pop()
                .ok_or_else(|| QueryTalkError::UnknownThread(thread_id.to_string()))?,
        };

        if state.question_classification != Some(QuestionClass::Data) {
            debug!(thread_id, "Skipping feedback for conversational thread");
            return Ok(FeedbackOutcome::Skipped(SkipReason::Conversational));
        }
        if !state.is_terminal() || state.final_answer.is_empty() {
            debug!(thread_id, "Skipping feedback for unfinished thread");
            return Ok(FeedbackOutcome::Skipped(SkipReason::Incomplete));
        }

        // The resolved table leads, followed by the other retrieved ones.
        let mut table_names: Vec<String> = state.selected_table.iter().cloned().collect();
        for table in extract_context_tables(&state.table_contexts) {
            if !table_names.contains(&table) {
                table_names.push(table);
            }
        }

        let record = FeedbackRecord::from_state(&state, table_names, satisfied);
        let id = self.store.append_feedback(&record).await?;
        info!(thread_id, id, satisfied, "Feedback recorded");
        Ok(FeedbackOutcome::Recorded(id))
    }

    /// Ends a conversation. The snapshot history is kept.
    ///
    /// Returns false when the thread had no live snapshot.
    pub async fn end_session(&self, thread_id: &str) -> Result<bool> {
        let _guard = self.lock_thread(thread_id).await;
        let removed = self.store.remove(thread_id).await?;

        info!(thread_id, removed, "Session ended");
        Ok(removed)
    }

    /// Returns the latest snapshot of a thread.
    pub async fn snapshot(&self, thread_id: &str) -> Result<ConversationState> {
        self.load_existing(thread_id).await
    }

    /// Returns every saved snapshot of a thread, oldest first.
    pub async fn history(&self, thread_id: &str) -> Result<Vec<ConversationState>> {
        self.store.history(thread_id).await
    }

    fn thread_lock(&self, thread_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(thread_id.to_string()).or_default().clone()
    }

    async fn lock_thread(&self, thread_id: &str) -> TurnGuard<'_> {
        let guard = self.thread_lock(thread_id).lock_owned().await;
        TurnGuard {
            locks: &self.locks,
            thread_id: thread_id.to_string(),
            guard: Some(guard),
        }
    }

    async fn load_existing(&self, thread_id: &str) -> Result<ConversationState> {
        self.store
            .load(thread_id)
            .await?
            .ok_or_else(|| QueryTalkError::UnknownThread(thread_id.to_string()))
    }

    async fn prepare(&self, request: TurnRequest) -> Result<ConversationState> {
        if request.is_initial_turn {
            info!(thread_id = %request.thread_id, "Starting conversation");
            // A new question replaces whatever the thread held before.
            let revision = self
                .store
                .load(&request.thread_id)
                .await?
                .map_or(0, |existing| existing.revision);
            return Ok(ConversationState {
                revision,
                ..ConversationState::fresh(request.thread_id, request.user_question)
            });
        }

        let mut state = match request.previous_state {
            Some(state) if state.thread_id != request.thread_id => {
                return Err(QueryTalkError::internal(format!(
                    "State of thread '{}' passed for thread '{}'",
                    state.thread_id, request.thread_id
                )));
            }
            Some(state) => state,
            None => self.load_existing(&request.thread_id).await?,
        };

        state.apply_reply(&request.user_question)?;
        state.error_message = None;
        info!(
            thread_id = %state.thread_id,
            rounds = state.collected_clarifications.len(),
            "Resuming conversation"
        );
        Ok(state)
    }

    async fn finish_turn(
        &self,
        mut state: ConversationState,
        result: Result<TurnStatus>,
    ) -> Result<TurnOutcome> {
        state.revision += 1;
        match result {
            Ok(status) => {
                self.store.save(&state).await?;
                Ok(TurnOutcome { state, status })
            }
            Err(err) => {
                warn!(
                    thread_id = %state.thread_id,
                    node = ?state.cursor,
                    category = err.category(),
                    "Turn failed: {err}"
                );
                state.error_message = Some(err.to_string());
                if let Err(save_err) = self.store.save(&state).await {
                    warn!("Failed to persist failed turn: {save_err}");
                }
                Err(err)
            }
        }
    }

    /// Executes stages until the machine finishes or suspends.
    async fn drive(&self, state: &mut ConversationState) -> Result<TurnStatus> {
        let default_signals = MarkerSignals::new(
            self.settings.termination_marker.as_str(),
            self.settings.error_marker.as_str(),
        );
        let signals: &dyn OutputSignals = match &self.signals {
            Some(signals) => signals.as_ref(),
            None => &default_signals,
        };
        let today = format_date(self.as_of_date.unwrap_or_else(|| Local::now().date_naive()));
        let ctx = StageContext::new(self.llm.as_ref(), &self.prompts, signals)
            .with_today(today)
            .with_markers(&self.settings.termination_marker, &self.settings.error_marker);

        let budget = self.settings.step_budget;
        let mut steps = 0u32;
        let mut failure: Option<(String, String)> = None;

        while let Some(node) = state.cursor {
            if steps >= budget {
                return Err(QueryTalkError::StepBudgetExceeded { budget });
            }
            steps += 1;

            let event = self.run_stage(node, state, &ctx, &mut failure).await?;
            debug!(thread_id = %state.thread_id, %node, ?event, step = steps, "Stage finished");

            match transition(node, &event)? {
                Transition::Goto(next) => state.cursor = Some(next),
                Transition::Suspend(resume_at) => {
                    state.cursor = Some(resume_at);
                    state.awaiting_user_reply = true;
                    let question = state.last_clarification().unwrap_or_default().to_string();
                    info!(
                        thread_id = %state.thread_id,
                        round = state.collected_clarifications.len(),
                        "Waiting for clarification"
                    );
                    return Ok(TurnStatus::AwaitingReply { question });
                }
                Transition::Finish => {
                    state.cursor = None;
                    info!(thread_id = %state.thread_id, steps, "Conversation completed");
                    return Ok(TurnStatus::Completed);
                }
            }
        }

        Ok(TurnStatus::Completed)
    }

    async fn run_stage(
        &self,
        node: Node,
        state: &mut ConversationState,
        ctx: &StageContext<'_>,
        failure: &mut Option<(String, String)>,
    ) -> Result<Event> {
        let settings = &self.settings;

        let event = match node {
            Node::Classify => {
                let class = classify(ctx, &state.user_question).await?;
                state.question_classification = Some(class);
                info!(thread_id = %state.thread_id, ?class, "Question classified");
                Event::Classified(class)
            }
            Node::GeneralAnswer => {
                state.final_answer = general_answer(ctx, &state.user_question).await?;
                Event::Answered
            }
            Node::Analyze => {
                state.table_contexts = self
                    .retriever
                    .retrieve(&state.user_question, settings.context_count)
                    .await?;
                state.question_analysis =
                    analyze(ctx, &state.user_question, &state.table_contexts).await?;

                state.selected_table = match extract_table_name(&state.question_analysis) {
                    Some(table) => Some(table),
                    None => self.retriever.select_table(&state.user_question).await?,
                };
                info!(
                    thread_id = %state.thread_id,
                    table = state.selected_table.as_deref().unwrap_or("-"),
                    "Question analyzed"
                );
                Event::Analyzed {
                    clarify: settings.clarification,
                }
            }
            Node::Clarify => {
                match next_clarification(ctx, state, settings.max_clarification_rounds).await? {
                    ClarificationStep::Ask(question) => {
                        state.collected_clarifications.push(question);
                        Event::ClarificationNeeded
                    }
                    ClarificationStep::Complete => Event::ClarificationComplete {
                        rounds: state.collected_clarifications.len(),
                    },
                }
            }
            Node::Refine => {
                let last = state.last_clarification().unwrap_or_default().to_string();
                state.user_question = refine(ctx, &state.user_question, &last).await?;
                info!(
                    thread_id = %state.thread_id,
                    question = %state.user_question,
                    "Question refined"
                );
                Event::Refined
            }
            Node::SynthesizeQuery => {
                let previous = failure.as_ref().map(|(sql, error)| QueryFailure {
                    sql: sql.as_str(),
                    error: error.as_str(),
                });
                let sql = synthesize(ctx, state, settings.table_templates, previous).await?;
                state.sql_query = sql;
                *failure = None;
                info!(thread_id = %state.thread_id, sql = %state.sql_query, "Query synthesized");
                Event::QuerySynthesized
            }
            Node::Execute => {
                let outcome = execute_and_shape(
                    self.executor.as_ref(),
                    &self.connection,
                    &state.sql_query,
                    settings.max_rows,
                    settings.read_only,
                )
                .await;

                match outcome {
                    Ok(result) => {
                        info!(
                            thread_id = %state.thread_id,
                            rows = result.rows.len(),
                            truncated = result.was_truncated,
                            "Query executed"
                        );
                        state.query_result = result;
                        Event::ResultShaped
                    }
                    Err(QueryTalkError::Database { code, message })
                        if state.query_fix_count < settings.max_query_fix =>
                    {
                        state.query_fix_count += 1;
                        warn!(
                            thread_id = %state.thread_id,
                            attempt = state.query_fix_count,
                            max = settings.max_query_fix,
                            code = %code,
                            "Query failed, regenerating: {message}"
                        );
                        *failure = Some((state.sql_query.clone(), format!("[{code}] {message}")));
                        Event::QueryFailed
                    }
                    Err(err) => return Err(err),
                }
            }
            Node::Answer => {
                state.final_answer = synthesize_answer(
                    ctx,
                    &state.user_question,
                    &state.sql_query,
                    &state.query_result,
                )
                .await?;
                Event::Answered
            }
        };

        Ok(event)
    }
}
