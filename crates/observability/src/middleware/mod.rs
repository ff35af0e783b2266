//! Instrumentation adapters that wrap HTTP services and database handles
//! with spans and the common metrics.

pub mod database;
pub mod http;

pub use self::database::{Database, DbTracer, Executor, Statement, TracedDatabase, TracedStatement, TracedTransaction, Transaction};
pub use self::http::{HttpTelemetry, HttpTelemetryLayer};
