//! Database decorators against in-memory exporters.

mod common;

use async_trait::async_trait;
use common::{attribute, Harness};
use opentelemetry::trace::{SpanKind, Status};
use opentelemetry::Context;
use service_observability::middleware::{DbTracer, Executor, TracedDatabase};

#[derive(Debug, PartialEq, thiserror::Error)]
#[error("duplicate key value violates unique constraint \"users_email_key\"")]
struct UniqueViolation;

/// Accepts reads, rejects every write.
struct ReadOnlyUsers;

#[async_trait]
impl Executor for ReadOnlyUsers {
    type Param = String;
    type Rows = Vec<String>;
    type Row = String;
    type Outcome = u64;
    type Error = UniqueViolation;

    async fn query(&self, _cx: &Context, _sql: &str, params: &[String]) -> Result<Vec<String>, UniqueViolation> {
        Ok(params.to_vec())
    }

    async fn query_row(&self, _cx: &Context, _sql: &str, params: &[String]) -> Result<String, UniqueViolation> {
        Ok(params.join(","))
    }

    async fn execute(&self, _cx: &Context, _sql: &str, _params: &[String]) -> Result<u64, UniqueViolation> {
        Err(UniqueViolation)
    }
}

fn traced(harness: &Harness) -> TracedDatabase<ReadOnlyUsers> {
    let tracer = DbTracer::new(harness.tracer.clone(), harness.metrics.clone(), "accounts", "postgresql");
    TracedDatabase::new(ReadOnlyUsers, tracer)
}

#[tokio::test]
async fn test_failing_query_is_measured_and_returned_unchanged() {
    let harness = Harness::new();
    let db = traced(&harness);

    let err = db
        .execute(
            &Context::new(),
            "INSERT INTO users (email) VALUES ($1)",
            &["ada@example.com".to_string()],
        )
        .await
        .unwrap_err();
    assert_eq!(err, UniqueViolation);

    let counts = harness.u64_sum("db_queries_total");
    assert_eq!(counts.len(), 1);
    assert_eq!(counts[0].0, 1);
    assert_eq!(attribute(&counts[0].1, "db_name").as_deref(), Some("accounts"));
    assert_eq!(attribute(&counts[0].1, "db_type").as_deref(), Some("postgresql"));
    assert_eq!(harness.histogram_count("db_query_duration_seconds"), 1);

    let span = harness.span("db.query");
    assert_eq!(span.span_kind, SpanKind::Client);
    assert_eq!(span.status, Status::error(UniqueViolation.to_string()));
    assert!(span.events.events.iter().any(|event| event.name == "exception"));
    assert_eq!(
        attribute(&span.attributes, "db.query.text").as_deref(),
        Some("INSERT INTO users (email) VALUES ($1)")
    );
    assert_eq!(attribute(&span.attributes, "db.system").as_deref(), Some("postgresql"));
    assert_eq!(attribute(&span.attributes, "db.namespace").as_deref(), Some("accounts"));
}

#[tokio::test]
async fn test_successful_queries_leave_status_unset() {
    let harness = Harness::new();
    let db = traced(&harness);

    let rows = db
        .query(&Context::new(), "SELECT email FROM users", &["a".to_string(), "b".to_string()])
        .await
        .unwrap();
    assert_eq!(rows, vec!["a", "b"]);
    let row = db
        .query_row(&Context::new(), "SELECT email FROM users LIMIT 1", &["c".to_string()])
        .await
        .unwrap();
    assert_eq!(row, "c");

    assert_eq!(harness.u64_sum("db_queries_total")[0].0, 2);
    assert_eq!(harness.histogram_count("db_query_duration_seconds"), 2);
    assert!(harness.spans().iter().all(|span| span.status == Status::Unset));
}

#[tokio::test]
async fn test_query_span_is_child_of_caller_context() {
    let harness = Harness::new();
    let db = traced(&harness);

    let request = harness.tracer.start_span(&Context::new(), "GET /users", Default::default());
    db.query(request.context(), "SELECT 1", &[]).await.unwrap();
    request.end();

    let parent = harness.span("GET /users");
    let query = harness.span("db.query");
    assert_eq!(query.parent_span_id, parent.span_context.span_id());
}
