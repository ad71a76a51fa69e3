//! End-to-end conversation tests against scripted doubles.

use super::common::YieldingLlm;
use chrono::NaiveDate;
use pretty_assertions::assert_eq;
use querytalk::db::{MockSqlExecutor, QueryResult, Value};
use querytalk::error::QueryTalkError;
use querytalk::llm::MockLlmClient;
use querytalk::retrieval::KeywordRetriever;
use querytalk::workflow::{
    FeedbackOutcome, MemoryStore, Node, Orchestrator, QuestionClass, SkipReason, SnapshotStore,
    TurnRequest, TurnStatus, WorkflowSettings,
};
use std::sync::Arc;

const SCHEMA: &str = r#"
CREATE TABLE sales (
    id bigint PRIMARY KEY,
    sold_at date NOT NULL,
    region text,
    amount numeric -- 매출액
);
CREATE TABLE customers (
    id bigint PRIMARY KEY,
    name text
);
"#;

const CLARIFYING_QUESTION: &str = "어느 지역의 매출을 보여드릴까요?";
const REFINED_QUESTION: &str = "2024년 4월 서울 지역 매출 합계를 보여줘";
const SALES_SQL: &str =
    "SELECT SUM(amount) AS total FROM sales WHERE region = '서울' AND sold_at >= '2024-04-01' AND sold_at < '2024-05-01';";

fn sales_llm() -> MockLlmClient {
    MockLlmClient::new()
        .with_response("task: classify", "1")
        .with_response(
            "task: analyze",
            "- 의도: 지난달 매출 조회\n- 조회 필요 테이블: sales (매출 내역)",
        )
        .with_responses("task: clarify", [CLARIFYING_QUESTION, "종료"])
        .with_response("task: refine", REFINED_QUESTION)
        .with_response("previous error", format!("```sql\n{SALES_SQL}\n```"))
        .with_response("task: write sql", format!("```sql\n{SALES_SQL}\n```"))
        .with_response(
            "task: answer",
            "2024년 4월 서울 지역 매출은 1,200,000원입니다.",
        )
}

fn sales_result() -> QueryResult {
    QueryResult::with_data(
        vec!["total".to_string()],
        vec![vec![Value::String("1200000".to_string())]],
    )
}

struct Harness {
    orchestrator: Arc<Orchestrator>,
    llm: Arc<MockLlmClient>,
    executor: Arc<MockSqlExecutor>,
    store: Arc<MemoryStore>,
}

fn harness(llm: MockLlmClient, executor: MockSqlExecutor, settings: WorkflowSettings) -> Harness {
    let llm = Arc::new(llm);
    let executor = Arc::new(executor);
    let store = Arc::new(MemoryStore::new());

    let orchestrator = Orchestrator::new(llm.clone(), executor.clone(), store.clone())
        .with_retriever(Arc::new(KeywordRetriever::from_ddl(SCHEMA)))
        .with_settings(settings)
        .with_as_of_date(NaiveDate::from_ymd_opt(2024, 5, 15).unwrap());

    Harness {
        orchestrator: Arc::new(orchestrator),
        llm,
        executor,
        store,
    }
}

fn db_error() -> QueryTalkError {
    QueryTalkError::database("42703", "column \"amout\" does not exist")
}

#[tokio::test]
async fn test_greeting_is_answered_without_sql() {
    let llm = MockLlmClient::new()
        .with_response("task: classify", "0")
        .with_response(
            "task: general conversation",
            "안녕하세요! 무엇을 도와드릴까요?",
        );
    let h = harness(llm, MockSqlExecutor::new(sales_result()), WorkflowSettings::default());

    let outcome = h.orchestrator.start("greeting", "안녕").await.unwrap();

    assert_eq!(outcome.status, TurnStatus::Completed);
    let state = outcome.state;
    assert_eq!(state.question_classification, Some(QuestionClass::Conversational));
    assert_eq!(state.final_answer, "안녕하세요! 무엇을 도와드릴까요?");
    assert_eq!(state.sql_query, "");
    assert!(state.collected_clarifications.is_empty());
    assert!(state.is_terminal());
    assert_eq!(h.executor.call_count(), 0);
    assert_eq!(h.llm.calls_matching("task: analyze"), 0);
}

#[tokio::test]
async fn test_sales_question_with_one_clarification_round() {
    let h = harness(sales_llm(), MockSqlExecutor::new(sales_result()), WorkflowSettings::default());

    // Turn 1: pauses on the clarifying question.
    let first = h.orchestrator.start("sales", "지난달 매출 보여줘").await.unwrap();

    assert_eq!(
        first.status,
        TurnStatus::AwaitingReply {
            question: CLARIFYING_QUESTION.to_string()
        }
    );
    assert!(first.state.awaiting_user_reply);
    assert_eq!(first.state.cursor, Some(Node::Clarify));
    assert_eq!(first.state.selected_table, Some("sales".to_string()));
    assert_eq!(first.state.sql_query, "");
    assert_eq!(h.executor.call_count(), 0);

    // Turn 2: the reply is folded in and the data branch runs to the end.
    let second = h.orchestrator.resume("sales", "서울").await.unwrap();

    assert_eq!(second.status, TurnStatus::Completed);
    let state = second.state;
    assert_eq!(
        state.collected_clarifications,
        vec![format!("{CLARIFYING_QUESTION}\n답변: 서울")]
    );
    assert_eq!(state.user_question, REFINED_QUESTION);
    assert_eq!(state.original_question, "지난달 매출 보여줘");
    assert_eq!(state.sql_query, SALES_SQL);
    assert_eq!(state.query_result, sales_result());
    assert_eq!(state.final_answer, "2024년 4월 서울 지역 매출은 1,200,000원입니다.");
    assert!(!state.awaiting_user_reply);
    assert!(state.is_terminal());
    assert_eq!(state.error_message, None);

    assert_eq!(h.executor.executed(), vec![SALES_SQL.to_string()]);
    assert_eq!(h.llm.calls_matching("task: clarify"), 2);
    assert_eq!(h.llm.calls_matching("task: refine"), 1);

    let calls = h.llm.calls();
    let analysis_prompt = &calls[1][0].content;
    assert!(analysis_prompt.contains("Today is 2024-05-15."));
    assert!(analysis_prompt.contains("CREATE TABLE sales"));

    let saved = h.store.load("sales").await.unwrap().unwrap();
    assert_eq!(saved, state);
}

#[tokio::test]
async fn test_reply_can_carry_previous_state() {
    let h = harness(sales_llm(), MockSqlExecutor::new(sales_result()), WorkflowSettings::default());
    let paused = h.orchestrator.start("sales", "지난달 매출 보여줘").await.unwrap().state;

    let request = TurnRequest::reply("sales", "서울").with_previous_state(paused);
    let outcome = h.orchestrator.run_turn(request).await.unwrap();

    assert_eq!(outcome.status, TurnStatus::Completed);
    assert_eq!(outcome.state.sql_query, SALES_SQL);
}

#[tokio::test]
async fn test_reply_to_finished_conversation_is_rejected() {
    let llm = MockLlmClient::new()
        .with_response("task: classify", "0")
        .with_response("task: general conversation", "반가워요");
    let h = harness(llm, MockSqlExecutor::empty(), WorkflowSettings::default());
    h.orchestrator.start("t", "안녕").await.unwrap();

    let result = h.orchestrator.resume("t", "서울").await;

    assert_eq!(result, Err(QueryTalkError::NotAwaitingReply("t".to_string())));
}

#[tokio::test]
async fn test_clarification_can_be_disabled() {
    let settings = WorkflowSettings {
        clarification: false,
        ..WorkflowSettings::default()
    };
    let h = harness(sales_llm(), MockSqlExecutor::new(sales_result()), settings);

    let outcome = h.orchestrator.start("t", "지난달 매출 보여줘").await.unwrap();

    assert_eq!(outcome.status, TurnStatus::Completed);
    assert_eq!(outcome.state.user_question, "지난달 매출 보여줘");
    assert_eq!(h.llm.calls_matching("task: clarify"), 0);
    assert_eq!(h.llm.calls_matching("task: refine"), 0);
}

#[tokio::test]
async fn test_no_clarification_rounds_skip_refinement() {
    let llm = MockLlmClient::new()
        .with_response("task: classify", "1")
        .with_response("task: analyze", "- 조회 필요 테이블: sales (매출)")
        .with_response("task: clarify", "종료")
        .with_response("task: write sql", SALES_SQL)
        .with_response("task: answer", "done");
    let h = harness(llm, MockSqlExecutor::new(sales_result()), WorkflowSettings::default());

    let outcome = h.orchestrator.start("t", "2024년 4월 서울 매출 합계").await.unwrap();

    assert_eq!(outcome.status, TurnStatus::Completed);
    assert_eq!(outcome.state.user_question, "2024년 4월 서울 매출 합계");
    assert_eq!(h.llm.calls_matching("task: refine"), 0);
}

#[tokio::test]
async fn test_round_limit_ends_clarification() {
    let llm = MockLlmClient::new()
        .with_response("task: classify", "1")
        .with_response("task: analyze", "- 조회 필요 테이블: sales (매출)")
        .with_response("task: clarify", CLARIFYING_QUESTION)
        .with_response("task: refine", REFINED_QUESTION)
        .with_response("task: write sql", SALES_SQL)
        .with_response("task: answer", "done");
    let settings = WorkflowSettings {
        max_clarification_rounds: 1,
        ..WorkflowSettings::default()
    };
    let h = harness(llm, MockSqlExecutor::new(sales_result()), settings);

    h.orchestrator.start("t", "지난달 매출 보여줘").await.unwrap();
    let outcome = h.orchestrator.resume("t", "서울").await.unwrap();

    assert_eq!(outcome.status, TurnStatus::Completed);
    assert_eq!(h.llm.calls_matching("task: clarify"), 1);
}

#[tokio::test]
async fn test_rejected_analysis_stops_the_turn() {
    let llm = MockLlmClient::new()
        .with_response("task: classify", "1")
        .with_response(
            "task: analyze",
            "[ERROR] 날씨 정보는 데이터베이스에 없습니다.",
        );
    let h = harness(llm, MockSqlExecutor::empty(), WorkflowSettings::default());

    let result = h.orchestrator.start("t", "내일 날씨 데이터 보여줘").await;

    assert!(matches!(result, Err(QueryTalkError::AnalysisRejected(_))));
    let state = h.store.load("t").await.unwrap().unwrap();
    assert_eq!(state.cursor, Some(Node::Analyze));
    assert!(state.error_message.is_some());
    assert_eq!(h.executor.call_count(), 0);
}

#[tokio::test]
async fn test_completion_without_sql_is_no_query_found() {
    let llm = MockLlmClient::new()
        .with_response("task: classify", "1")
        .with_response("task: analyze", "- 조회 필요 테이블: sales (매출)")
        .with_response("task: write sql", "죄송하지만 쿼리를 만들 수 없습니다.");
    let settings = WorkflowSettings {
        clarification: false,
        ..WorkflowSettings::default()
    };
    let h = harness(llm, MockSqlExecutor::empty(), settings);

    let err = h.orchestrator.start("t", "지난달 매출").await.unwrap_err();

    assert!(err.is_extraction_failure());
    let state = h.store.load("t").await.unwrap().unwrap();
    assert_eq!(state.cursor, Some(Node::SynthesizeQuery));
    assert_eq!(state.sql_query, "");
}

#[tokio::test]
async fn test_database_error_regenerates_query() {
    let executor = MockSqlExecutor::with_outcomes([Err(db_error()), Ok(Some(sales_result()))]);
    let settings = WorkflowSettings {
        clarification: false,
        ..WorkflowSettings::default()
    };
    let llm = MockLlmClient::new()
        .with_response("task: classify", "1")
        .with_response("task: analyze", "- 조회 필요 테이블: sales (매출)")
        .with_response("previous error", format!("```sql\n{SALES_SQL}\n```"))
        .with_response("task: write sql", "```sql\nSELECT SUM(amout) FROM sales;\n```")
        .with_response("task: answer", "done");
    let h = harness(llm, executor, settings);

    let outcome = h.orchestrator.start("t", "지난달 매출").await.unwrap();

    assert_eq!(outcome.status, TurnStatus::Completed);
    assert_eq!(outcome.state.query_fix_count, 1);
    assert_eq!(outcome.state.sql_query, SALES_SQL);
    assert_eq!(
        h.executor.executed(),
        vec!["SELECT SUM(amout) FROM sales;".to_string(), SALES_SQL.to_string()]
    );

    let calls = h.llm.calls();
    let fix_prompt = &calls[3][0].content;
    assert!(fix_prompt.contains("SELECT SUM(amout) FROM sales;"));
    assert!(fix_prompt.contains("column \"amout\" does not exist"));
}

#[tokio::test]
async fn test_exhausted_fix_budget_surfaces_database_error() {
    let executor = MockSqlExecutor::with_outcomes([Err(db_error())]);
    let settings = WorkflowSettings {
        clarification: false,
        max_query_fix: 2,
        ..WorkflowSettings::default()
    };
    let h = harness(sales_llm(), executor, settings);

    let result = h.orchestrator.start("t", "지난달 매출").await;

    assert_eq!(result, Err(db_error()));
    assert_eq!(h.executor.call_count(), 3);
    let state = h.store.load("t").await.unwrap().unwrap();
    assert_eq!(state.query_fix_count, 2);
    assert_eq!(state.cursor, Some(Node::Execute));
    assert_eq!(state.final_answer, "");
}

#[tokio::test]
async fn test_retry_resumes_from_failed_node() {
    let executor = MockSqlExecutor::with_outcomes([
        Err(db_error()),
        Err(db_error()),
        Err(db_error()),
        Ok(Some(sales_result())),
    ]);
    let settings = WorkflowSettings {
        clarification: false,
        ..WorkflowSettings::default()
    };
    let h = harness(sales_llm(), executor, settings);
    h.orchestrator.start("t", "지난달 매출").await.unwrap_err();
    let classify_calls = h.llm.calls_matching("task: classify");

    let outcome = h.orchestrator.retry_turn("t").await.unwrap();

    assert_eq!(outcome.status, TurnStatus::Completed);
    assert_eq!(outcome.state.error_message, None);
    assert_eq!(outcome.state.query_result, sales_result());
    assert_eq!(h.llm.calls_matching("task: classify"), classify_calls);
    assert_eq!(h.executor.call_count(), 4);
}

#[tokio::test]
async fn test_large_result_is_capped() {
    let rows = (0..250).map(|i| vec![Value::Int(i)]).collect();
    let executor = MockSqlExecutor::new(QueryResult::with_data(vec!["n".to_string()], rows));
    let settings = WorkflowSettings {
        clarification: false,
        ..WorkflowSettings::default()
    };
    let h = harness(sales_llm(), executor, settings);

    let state = h.orchestrator.start("t", "지난달 매출").await.unwrap().state;

    assert_eq!(state.query_result.rows.len(), 100);
    assert_eq!(state.query_result.rows[99], vec![Value::Int(99)]);
    assert_eq!(state.query_result.total_rows, 250);
    assert!(state.query_result.was_truncated);
}

#[tokio::test]
async fn test_threads_run_concurrently() {
    let settings = WorkflowSettings {
        clarification: false,
        ..WorkflowSettings::default()
    };
    let h = harness(sales_llm(), MockSqlExecutor::new(sales_result()), settings);

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let orchestrator = h.orchestrator.clone();
            tokio::spawn(async move {
                let thread = format!("thread-{i}");
                let outcome = orchestrator.start(&thread, "지난달 매출").await;
                outcome
            })
        })
        .collect();

    for result in futures::future::join_all(handles).await {
        let outcome = result.unwrap().unwrap();
        assert_eq!(outcome.status, TurnStatus::Completed);
    }
    for i in 0..8 {
        let state = h.store.load(&format!("thread-{i}")).await.unwrap().unwrap();
        assert_eq!(state.thread_id, format!("thread-{i}"));
        assert!(state.is_terminal());
    }
    assert_eq!(h.executor.call_count(), 8);
}

#[tokio::test]
async fn test_turns_of_one_thread_are_serialized() {
    let h = harness(sales_llm(), MockSqlExecutor::new(sales_result()), WorkflowSettings::default());
    h.orchestrator.start("t", "지난달 매출 보여줘").await.unwrap();

    let a = h.orchestrator.clone();
    let b = h.orchestrator.clone();
    let (first, second) = tokio::join!(
        tokio::spawn(async move {
            let outcome = a.resume("t", "서울").await;
            outcome
        }),
        tokio::spawn(async move {
            let outcome = b.resume("t", "부산").await;
            outcome
        }),
    );
    let results = [first.unwrap(), second.unwrap()];

    let completed = results.iter().filter(|r| r.is_ok()).count();
    let rejected = results
        .iter()
        .filter(|r| matches!(r, Err(QueryTalkError::NotAwaitingReply(_))))
        .count();
    assert_eq!((completed, rejected), (1, 1));

    let state = h.store.load("t").await.unwrap().unwrap();
    assert_eq!(state.collected_clarifications.len(), 1);
    assert_eq!(state.collected_clarifications[0].matches("답변:").count(), 1);
}

#[tokio::test]
async fn test_feedback_is_logged_for_finished_data_conversation() {
    let h = harness(sales_llm(), MockSqlExecutor::new(sales_result()), WorkflowSettings::default());
    h.orchestrator.start("t", "지난달 매출 보여줘").await.unwrap();

    let pending = h.orchestrator.record_feedback("t", true).await.unwrap();
    assert_eq!(pending, FeedbackOutcome::Skipped(SkipReason::Incomplete));

    h.orchestrator.resume("t", "서울").await.unwrap();
    let outcome = h.orchestrator.record_feedback("t", true).await.unwrap();

    assert!(matches!(outcome, FeedbackOutcome::Recorded(_)));
    let records = h.store.feedback("t").await.unwrap();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.original_question, "지난달 매출 보여줘");
    assert_eq!(record.user_question, REFINED_QUESTION);
    assert_eq!(record.table_names, vec!["sales".to_string(), "customers".to_string()]);
    assert_eq!(record.sql_query, SALES_SQL);
    assert!(record.satisfied);
}

#[tokio::test]
async fn test_feedback_is_skipped_for_conversation() {
    let llm = MockLlmClient::new()
        .with_response("task: classify", "0")
        .with_response("task: general conversation", "반가워요");
    let h = harness(llm, MockSqlExecutor::empty(), WorkflowSettings::default());
    h.orchestrator.start("t", "안녕").await.unwrap();

    let outcome = h.orchestrator.record_feedback("t", false).await.unwrap();

    assert_eq!(outcome, FeedbackOutcome::Skipped(SkipReason::Conversational));
    assert!(h.store.feedback("t").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_end_session_removes_snapshot_but_keeps_history() {
    let settings = WorkflowSettings {
        clarification: false,
        ..WorkflowSettings::default()
    };
    let h = harness(sales_llm(), MockSqlExecutor::new(sales_result()), settings);
    h.orchestrator.start("t", "지난달 매출").await.unwrap();

    assert!(h.orchestrator.end_session("t").await.unwrap());
    assert!(!h.orchestrator.end_session("t").await.unwrap());

    assert!(matches!(
        h.orchestrator.snapshot("t").await,
        Err(QueryTalkError::UnknownThread(_))
    ));
    assert!(!h.orchestrator.history("t").await.unwrap().is_empty());

    let outcome = h.orchestrator.record_feedback("t", false).await.unwrap();
    assert!(matches!(outcome, FeedbackOutcome::Recorded(_)));
}

#[tokio::test]
async fn test_feedback_lists_resolved_table_first() {
    let llm = MockLlmClient::new()
        .with_response("task: classify", "1")
        .with_response("task: analyze", "- 조회 필요 테이블: customers (고객 목록)")
        .with_response("task: write sql", "```sql\nSELECT COUNT(*) AS n FROM customers;\n```")
        .with_response("task: answer", "고객은 3명입니다.");
    let settings = WorkflowSettings {
        clarification: false,
        ..WorkflowSettings::default()
    };
    let h = harness(llm, MockSqlExecutor::new(sales_result()), settings);

    // Retrieval ranks sales first for this question; the analysis picks customers.
    let outcome = h.orchestrator.start("t", "지난달 매출 고객 수").await.unwrap();
    assert_eq!(outcome.state.selected_table, Some("customers".to_string()));
    h.orchestrator.record_feedback("t", true).await.unwrap();

    let records = h.store.feedback("t").await.unwrap();
    assert_eq!(
        records[0].table_names,
        vec!["customers".to_string(), "sales".to_string()]
    );
}

fn resumed_llm() -> MockLlmClient {
    MockLlmClient::new()
        .with_response("task: clarify", "종료")
        .with_response("task: refine", REFINED_QUESTION)
        .with_response("task: write sql", format!("```sql\n{SALES_SQL}\n```"))
        .with_response("task: answer", "답변드립니다.")
}

#[tokio::test]
async fn test_replies_from_separate_orchestrators_commit_once() {
    // Two orchestrators over one store stand in for two processes; they share
    // no turn lock.
    let store = Arc::new(MemoryStore::new());
    let process = |llm: MockLlmClient| {
        Orchestrator::new(
            Arc::new(YieldingLlm(llm)),
            Arc::new(MockSqlExecutor::new(sales_result())),
            store.clone(),
        )
        .with_retriever(Arc::new(KeywordRetriever::from_ddl(SCHEMA)))
    };
    process(sales_llm()).start("t", "지난달 매출 보여줘").await.unwrap();

    let a = process(resumed_llm());
    let b = process(resumed_llm());
    let (first, second) = tokio::join!(a.resume("t", "서울"), b.resume("t", "부산"));

    let results = [first, second];
    assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|result| matches!(result, Err(QueryTalkError::SnapshotConflict(id)) if id == "t")));

    let stored = store.load("t").await.unwrap().unwrap();
    assert!(stored.is_terminal());
    assert_eq!(stored.revision, 2);
    assert_eq!(stored.collected_clarifications.len(), 1);
    assert_eq!(stored.collected_clarifications[0].matches("답변:").count(), 1);
    assert_eq!(store.history("t").await.unwrap().len(), 2);
}
