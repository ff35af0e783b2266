//! Database instrumentation.
//!
//! Database access is described by capability traits ([`Executor`],
//! [`Database`], [`Statement`], [`Transaction`]). The `Traced*` decorators
//! implement the same traits over any driver and route every call through
//! [`DbTracer::trace`], so prepared statements and transactions opened from
//! a traced handle stay traced.

use std::error::Error;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use opentelemetry::context::FutureExt;
use opentelemetry::{Context, KeyValue};

use crate::metrics::CommonMetrics;
use crate::span::{SpanOptions, Tracer};
use crate::telemetry::Provider;

const SPAN_NAME: &str = "db.query";

/// Runs statements directly.
#[async_trait]
pub trait Executor: Send + Sync {
    type Param: Sync;
    type Rows: Send;
    type Row: Send;
    /// Result of a statement that returns no rows, e.g. rows affected.
    type Outcome: Send;
    type Error: Error + Send + Sync + 'static;

    async fn query(&self, cx: &Context, sql: &str, params: &[Self::Param]) -> Result<Self::Rows, Self::Error>;

    async fn query_row(&self, cx: &Context, sql: &str, params: &[Self::Param]) -> Result<Self::Row, Self::Error>;

    async fn execute(&self, cx: &Context, sql: &str, params: &[Self::Param]) -> Result<Self::Outcome, Self::Error>;
}

/// A connection or pool handle.
#[async_trait]
pub trait Database: Executor {
    type Statement: Statement;
    type Transaction: Transaction;

    async fn prepare(&self, cx: &Context, sql: &str) -> Result<Self::Statement, Self::Error>;

    async fn begin(&self, cx: &Context) -> Result<Self::Transaction, Self::Error>;

    async fn ping(&self, cx: &Context) -> Result<(), Self::Error>;
}

/// A prepared statement bound to its SQL text.
#[async_trait]
pub trait Statement: Send + Sync {
    type Param: Sync;
    type Rows: Send;
    type Row: Send;
    type Outcome: Send;
    type Error: Error + Send + Sync + 'static;

    async fn query(&self, cx: &Context, params: &[Self::Param]) -> Result<Self::Rows, Self::Error>;

    async fn query_row(&self, cx: &Context, params: &[Self::Param]) -> Result<Self::Row, Self::Error>;

    async fn execute(&self, cx: &Context, params: &[Self::Param]) -> Result<Self::Outcome, Self::Error>;

    async fn close(self) -> Result<(), Self::Error>;
}

/// An open transaction. Committing or rolling back consumes it.
#[async_trait]
pub trait Transaction: Executor {
    type Statement: Statement;

    async fn prepare(&self, cx: &Context, sql: &str) -> Result<Self::Statement, Self::Error>;

    async fn commit(self, cx: &Context) -> Result<(), Self::Error>;

    async fn rollback(self, cx: &Context) -> Result<(), Self::Error>;
}

/// Traces and measures individual database operations for one database.
#[derive(Clone)]
pub struct DbTracer {
    db_name: String,
    db_system: String,
    tracer: Tracer,
    metrics: Arc<CommonMetrics>,
}

impl std::fmt::Debug for DbTracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbTracer")
            .field("db_name", &self.db_name)
            .field("db_system", &self.db_system)
            .finish_non_exhaustive()
    }
}

impl DbTracer {
    /// `db_system` is the database product, e.g. `"postgresql"`.
    pub fn new(
        tracer: Tracer,
        metrics: Arc<CommonMetrics>,
        db_name: impl Into<String>,
        db_system: impl Into<String>,
    ) -> Self {
        Self {
            db_name: db_name.into(),
            db_system: db_system.into(),
            tracer,
            metrics,
        }
    }

    pub fn from_provider(provider: &Provider, db_name: impl Into<String>, db_system: impl Into<String>) -> Self {
        Self::new(provider.tracer().clone(), provider.metrics(), db_name, db_system)
    }

    pub fn db_name(&self) -> &str {
        &self.db_name
    }

    pub fn db_system(&self) -> &str {
        &self.db_system
    }

    /// Runs `operation` inside a client span named `db.query`.
    ///
    /// The query count and duration are recorded whatever the outcome. An
    /// error is recorded on the span and returned as is.
    pub async fn trace<T, E, F, Fut>(&self, cx: &Context, query: &str, operation: F) -> Result<T, E>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Error + 'static,
    {
        let span = self.tracer.start_span(
            cx,
            SPAN_NAME,
            SpanOptions::client().with_attributes([
                KeyValue::new("db.query.text", query.to_string()),
                KeyValue::new("db.system", self.db_system.clone()),
                KeyValue::new("db.namespace", self.db_name.clone()),
            ]),
        );
        let child = span.context().clone();

        let started = Instant::now();
        let result = operation(child.clone()).with_context(child).await;
        let elapsed = started.elapsed().as_secs_f64();

        let attributes = [
            KeyValue::new("db_name", self.db_name.clone()),
            KeyValue::new("db_type", self.db_system.clone()),
        ];
        self.metrics.db_queries_total.add(1, &attributes);
        self.metrics.db_query_duration.record(elapsed, &attributes);

        if let Err(error) = &result {
            span.record_error(error);
        }
        span.end();
        result
    }
}

/// [`Database`] decorator tracing every call of the wrapped handle.
#[derive(Debug, Clone)]
pub struct TracedDatabase<D> {
    inner: D,
    tracer: DbTracer,
}

impl<D> TracedDatabase<D> {
    pub fn new(inner: D, tracer: DbTracer) -> Self {
        Self { inner, tracer }
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    pub fn into_inner(self) -> D {
        self.inner
    }

    pub fn tracer(&self) -> &DbTracer {
        &self.tracer
    }
}

#[async_trait]
impl<D: Executor> Executor for TracedDatabase<D> {
    type Param = D::Param;
    type Rows = D::Rows;
    type Row = D::Row;
    type Outcome = D::Outcome;
    type Error = D::Error;

    async fn query(&self, cx: &Context, sql: &str, params: &[Self::Param]) -> Result<Self::Rows, Self::Error> {
        self.tracer
            .trace(cx, sql, |cx| async move { self.inner.query(&cx, sql, params).await })
            .await
    }

    async fn query_row(&self, cx: &Context, sql: &str, params: &[Self::Param]) -> Result<Self::Row, Self::Error> {
        self.tracer
            .trace(cx, sql, |cx| async move { self.inner.query_row(&cx, sql, params).await })
            .await
    }

    async fn execute(&self, cx: &Context, sql: &str, params: &[Self::Param]) -> Result<Self::Outcome, Self::Error> {
        self.tracer
            .trace(cx, sql, |cx| async move { self.inner.execute(&cx, sql, params).await })
            .await
    }
}

#[async_trait]
impl<D: Database> Database for TracedDatabase<D> {
    type Statement = TracedStatement<D::Statement>;
    type Transaction = TracedTransaction<D::Transaction>;

    async fn prepare(&self, cx: &Context, sql: &str) -> Result<Self::Statement, Self::Error> {
        let statement = self
            .tracer
            .trace(cx, sql, |cx| async move { self.inner.prepare(&cx, sql).await })
            .await?;
        Ok(TracedStatement::new(statement, sql, self.tracer.clone()))
    }

    async fn begin(&self, cx: &Context) -> Result<Self::Transaction, Self::Error> {
        let transaction = self
            .tracer
            .trace(cx, "BEGIN", |cx| async move { self.inner.begin(&cx).await })
            .await?;
        Ok(TracedTransaction::new(transaction, self.tracer.clone()))
    }

    async fn ping(&self, cx: &Context) -> Result<(), Self::Error> {
        self.tracer
            .trace(cx, "PING", |cx| async move { self.inner.ping(&cx).await })
            .await
    }
}

/// [`Statement`] decorator; spans carry the SQL it was prepared from.
#[derive(Debug)]
pub struct TracedStatement<S> {
    inner: S,
    sql: String,
    tracer: DbTracer,
}

impl<S> TracedStatement<S> {
    pub fn new(inner: S, sql: impl Into<String>, tracer: DbTracer) -> Self {
        Self {
            inner,
            sql: sql.into(),
            tracer,
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: Statement> Statement for TracedStatement<S> {
    type Param = S::Param;
    type Rows = S::Rows;
    type Row = S::Row;
    type Outcome = S::Outcome;
    type Error = S::Error;

    async fn query(&self, cx: &Context, params: &[Self::Param]) -> Result<Self::Rows, Self::Error> {
        self.tracer
            .trace(cx, &self.sql, |cx| async move { self.inner.query(&cx, params).await })
            .await
    }

    async fn query_row(&self, cx: &Context, params: &[Self::Param]) -> Result<Self::Row, Self::Error> {
        self.tracer
            .trace(cx, &self.sql, |cx| async move { self.inner.query_row(&cx, params).await })
            .await
    }

    async fn execute(&self, cx: &Context, params: &[Self::Param]) -> Result<Self::Outcome, Self::Error> {
        self.tracer
            .trace(cx, &self.sql, |cx| async move { self.inner.execute(&cx, params).await })
            .await
    }

    /// Not traced.
    async fn close(self) -> Result<(), Self::Error> {
        self.inner.close().await
    }
}

/// [`Transaction`] decorator.
#[derive(Debug)]
pub struct TracedTransaction<T> {
    inner: T,
    tracer: DbTracer,
}

impl<T> TracedTransaction<T> {
    pub fn new(inner: T, tracer: DbTracer) -> Self {
        Self { inner, tracer }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }
}

#[async_trait]
impl<T: Transaction> Executor for TracedTransaction<T> {
    type Param = T::Param;
    type Rows = T::Rows;
    type Row = T::Row;
    type Outcome = T::Outcome;
    type Error = T::Error;

    async fn query(&self, cx: &Context, sql: &str, params: &[Self::Param]) -> Result<Self::Rows, Self::Error> {
        self.tracer
            .trace(cx, sql, |cx| async move { self.inner.query(&cx, sql, params).await })
            .await
    }

    async fn query_row(&self, cx: &Context, sql: &str, params: &[Self::Param]) -> Result<Self::Row, Self::Error> {
        self.tracer
            .trace(cx, sql, |cx| async move { self.inner.query_row(&cx, sql, params).await })
            .await
    }

    async fn execute(&self, cx: &Context, sql: &str, params: &[Self::Param]) -> Result<Self::Outcome, Self::Error> {
        self.tracer
            .trace(cx, sql, |cx| async move { self.inner.execute(&cx, sql, params).await })
            .await
    }
}

#[async_trait]
impl<T: Transaction> Transaction for TracedTransaction<T> {
    type Statement = TracedStatement<T::Statement>;

    async fn prepare(&self, cx: &Context, sql: &str) -> Result<Self::Statement, Self::Error> {
        let statement = self
            .tracer
            .trace(cx, sql, |cx| async move { self.inner.prepare(&cx, sql).await })
            .await?;
        Ok(TracedStatement::new(statement, sql, self.tracer.clone()))
    }

    async fn commit(self, cx: &Context) -> Result<(), Self::Error> {
        let Self { inner, tracer } = self;
        tracer
            .trace(cx, "COMMIT", |cx| async move { inner.commit(&cx).await })
            .await
    }

    async fn rollback(self, cx: &Context) -> Result<(), Self::Error> {
        let Self { inner, tracer } = self;
        tracer
            .trace(cx, "ROLLBACK", |cx| async move { inner.rollback(&cx).await })
            .await
    }
}
