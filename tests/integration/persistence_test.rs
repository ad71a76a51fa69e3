//! State database tests: conversations survive a process restart.

use pretty_assertions::assert_eq;
use querytalk::db::{MockSqlExecutor, QueryResult, Value};
use querytalk::error::QueryTalkError;
use querytalk::llm::MockLlmClient;
use querytalk::persistence::StateDb;
use querytalk::retrieval::KeywordRetriever;
use querytalk::workflow::{
    FeedbackOutcome, Node, Orchestrator, SnapshotStore, TurnRequest, TurnStatus, WorkflowSettings,
};
use std::sync::Arc;
use tempfile::TempDir;

const SCHEMA: &str = "CREATE TABLE sales (id bigint, region text, amount numeric);";

fn scripted_llm() -> MockLlmClient {
    MockLlmClient::new()
        .with_response("task: classify", "1")
        .with_response("task: analyze", "- 조회 필요 테이블: sales (매출)")
        .with_responses("task: clarify", ["어느 지역인가요?", "종료"])
        .with_response("task: refine", "서울 지역 매출 합계")
        .with_response("task: write sql", SUM_SQL)
        .with_response("task: answer", "서울 매출 합계는 42입니다.")
}

const SUM_SQL: &str = "```sql\nSELECT SUM(amount) AS total FROM sales;\n```";

fn resumed_llm() -> MockLlmClient {
    MockLlmClient::new()
        .with_response("task: clarify", "종료")
        .with_response("task: refine", "서울 지역 매출 합계")
        .with_response("task: write sql", SUM_SQL)
        .with_response("task: answer", "서울 매출 합계는 42입니다.")
}

fn orchestrator(db: Arc<StateDb>, llm: MockLlmClient) -> Orchestrator {
    let result = QueryResult::with_data(
        vec!["total".to_string()],
        vec![vec![Value::String("42".to_string())]],
    );
    Orchestrator::new(Arc::new(llm), Arc::new(MockSqlExecutor::new(result)), db)
        .with_retriever(Arc::new(KeywordRetriever::from_ddl(SCHEMA)))
        .with_settings(WorkflowSettings::default())
}

#[tokio::test]
async fn test_paused_conversation_resumes_after_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state.db");

    {
        let db = Arc::new(StateDb::open(&path).await.unwrap());
        let first = orchestrator(db.clone(), scripted_llm())
            .start("t1", "매출 알려줘")
            .await
            .unwrap();
        assert!(matches!(first.status, TurnStatus::AwaitingReply { .. }));
        db.close().await;
    }

    // The reopened process only sees what was persisted; its model is past
    // the clarifying question.
    let db = Arc::new(StateDb::open(&path).await.unwrap());
    let llm = resumed_llm();
    let paused = db.load("t1").await.unwrap().unwrap();
    assert!(paused.is_paused());
    assert_eq!(paused.cursor, Some(Node::Clarify));
    assert_eq!(paused.collected_clarifications, vec!["어느 지역인가요?".to_string()]);

    let second = orchestrator(db.clone(), llm)
        .resume("t1", "서울")
        .await
        .unwrap();

    assert_eq!(second.status, TurnStatus::Completed);
    assert_eq!(
        second.state.collected_clarifications,
        vec!["어느 지역인가요?\n답변: 서울".to_string()]
    );
    assert_eq!(second.state.original_question, "매출 알려줘");
    assert_eq!(second.state.user_question, "서울 지역 매출 합계");
    assert_eq!(second.state.final_answer, "서울 매출 합계는 42입니다.");

    let stored = db.load("t1").await.unwrap().unwrap();
    assert_eq!(stored, second.state);

    let history = db.history("t1").await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[0].is_paused());
    assert!(history[1].is_terminal());
}

#[tokio::test]
async fn test_feedback_and_end_session_persist() {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(StateDb::open(&dir.path().join("state.db")).await.unwrap());
    let settings = WorkflowSettings {
        clarification: false,
        ..WorkflowSettings::default()
    };
    let orchestrator = orchestrator(db.clone(), scripted_llm()).with_settings(settings);

    orchestrator.start("t1", "매출 알려줘").await.unwrap();
    let outcome = orchestrator.record_feedback("t1", false).await.unwrap();
    let FeedbackOutcome::Recorded(id) = outcome else {
        panic!("expected feedback to be recorded, got {outcome:?}");
    };
    assert!(id > 0);

    assert!(orchestrator.end_session("t1").await.unwrap());
    assert_eq!(db.load("t1").await.unwrap(), None);
    assert_eq!(db.history("t1").await.unwrap().len(), 1);

    let records = db.feedback("t1").await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].table_names, vec!["sales".to_string()]);
    assert_eq!(records[0].sql_query, "SELECT SUM(amount) AS total FROM sales;");
    assert!(!records[0].satisfied);
}

#[tokio::test]
async fn test_failed_turn_is_persisted_with_error() {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(StateDb::open(&dir.path().join("state.db")).await.unwrap());
    let llm = MockLlmClient::new()
        .with_response("task: classify", "1")
        .with_response("task: analyze", "[ERROR] 관련 테이블이 없습니다.");

    let result = orchestrator(db.clone(), llm).start("t1", "날씨 알려줘").await;

    assert!(result.is_err());
    let stored = db.load("t1").await.unwrap().unwrap();
    assert_eq!(stored.cursor, Some(Node::Analyze));
    assert!(stored
        .error_message
        .as_deref()
        .is_some_and(|msg| msg.contains("rejected")));
}

#[tokio::test]
async fn test_stale_reply_from_second_process_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state.db");
    let first_db = Arc::new(StateDb::open(&path).await.unwrap());
    let second_db = Arc::new(StateDb::open(&path).await.unwrap());

    orchestrator(first_db.clone(), scripted_llm())
        .start("t1", "매출 알려줘")
        .await
        .unwrap();

    // Both processes read the paused snapshot before either one answers.
    let paused = second_db.load("t1").await.unwrap().unwrap();
    let winner = orchestrator(first_db.clone(), resumed_llm())
        .run_turn(TurnRequest::reply("t1", "서울").with_previous_state(paused.clone()))
        .await
        .unwrap();
    let loser = orchestrator(second_db.clone(), resumed_llm())
        .run_turn(TurnRequest::reply("t1", "부산").with_previous_state(paused))
        .await;

    assert_eq!(loser, Err(QueryTalkError::SnapshotConflict("t1".to_string())));
    let stored = second_db.load("t1").await.unwrap().unwrap();
    assert_eq!(stored, winner.state);
    assert_eq!(
        stored.collected_clarifications,
        vec!["어느 지역인가요?\n답변: 서울".to_string()]
    );
    assert_eq!(first_db.history("t1").await.unwrap().len(), 2);
}
