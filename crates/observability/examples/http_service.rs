//! Example HTTP service with traced requests, logs and a custom counter.
//!
//! Exports to an OTLP collector on `localhost:4317`; set `OTEL_DEBUG=1` to
//! print telemetry to stdout instead.
//!
//! ```text
//! cargo run -p service-observability --example http_service
//! curl localhost:8080/users
//! ```

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::routing::get;
use axum::{Extension, Router};
use opentelemetry::metrics::Counter;
use opentelemetry::trace::TraceContextExt;
use opentelemetry::{Context, KeyValue};
use service_observability::{HttpTelemetryLayer, InstrumentOptions, Provider, Settings, SpanOptions};
use tokio::net::TcpListener;

#[derive(Clone)]
struct AppState {
    provider: Arc<Provider>,
    operations: Counter<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let settings = Settings::new("example-app")
        .with_service_info("example-app", "1.0.0", "development")
        .with_endpoint("localhost:4317")
        .with_resource_attribute("team", "platform")
        .with_debug(std::env::var("OTEL_DEBUG").is_ok());
    let provider = Arc::new(Provider::init(settings)?);

    let operations = provider.registry().counter(
        "custom_operations_total",
        "Total custom operations",
        &InstrumentOptions::new(),
    )?;

    let state = AppState {
        provider: Arc::clone(&provider),
        operations,
    };
    let app = Router::new()
        .route("/", get(home))
        .route("/users", get(users))
        .with_state(state)
        .layer(HttpTelemetryLayer::from_provider(&provider));

    let listener = TcpListener::bind("0.0.0.0:8080").await?;
    provider.logger().info(&Context::new(), "Starting server on port 8080");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;

    provider.logger().info(&Context::new(), "Shutting down server...");
    if let Err(e) = provider.shutdown(Duration::from_secs(5)) {
        eprintln!("Failed to shut down telemetry: {}", e);
    }
    Ok(())
}

async fn home(State(state): State<AppState>, Extension(cx): Extension<Context>) -> &'static str {
    state.provider.logger().info(&cx, "Handling home request");
    "Hello, from the home page!\n"
}

async fn users(State(state): State<AppState>, Extension(cx): Extension<Context>) -> &'static str {
    let provider = Arc::clone(&state.provider);
    let result = provider
        .tracer()
        .in_span(&cx, "handle_users", SpanOptions::new(), |cx| async move {
            cx.span().set_attribute(KeyValue::new("user_id", "123"));
            state.provider.logger().info(&cx, "Handling users request");
            state.operations.add(1, &[KeyValue::new("user", "test")]);
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<_, Infallible>("Hello, from the users page!\n")
        })
        .await;

    match result {
        Ok(body) => body,
        Err(never) => match never {},
    }
}
