//! HTTP middleware against in-memory exporters.

mod common;

use std::convert::Infallible;

use common::{attribute, Harness};
use http::{Request, Response, StatusCode};
use opentelemetry::trace::{SpanKind, Status, TraceContextExt};
use service_observability::middleware::http::HttpTelemetryLayer;
use tower::{Layer, ServiceExt};

#[tokio::test]
async fn test_not_found_is_counted_and_marks_span_errored() {
    let harness = Harness::new();
    let service = HttpTelemetryLayer::new(harness.tracer.clone(), harness.metrics.clone()).layer(tower::service_fn(
        |_request: Request<()>| async move {
            let mut response = Response::new("missing");
            *response.status_mut() = StatusCode::NOT_FOUND;
            Ok::<_, Infallible>(response)
        },
    ));

    let response = service
        .oneshot(Request::get("/orders/17").body(()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    assert_eq!(harness.i64_sum_total("http_active_requests"), 0);

    let counts = harness.u64_sum("http_requests_total");
    assert_eq!(counts.len(), 1);
    let (count, labels) = &counts[0];
    assert_eq!(*count, 1);
    assert_eq!(attribute(labels, "status_code").as_deref(), Some("404"));
    assert_eq!(attribute(labels, "method").as_deref(), Some("GET"));
    assert_eq!(attribute(labels, "route").as_deref(), Some("/orders/17"));

    assert_eq!(harness.histogram_count("http_request_duration_seconds"), 1);

    let span = harness.span("GET /orders/17");
    assert_eq!(span.span_kind, SpanKind::Server);
    assert_eq!(span.status, Status::error("HTTP Request Failed"));
    assert_eq!(
        attribute(&span.attributes, "http.response.status_code").as_deref(),
        Some("404")
    );
}

#[tokio::test]
async fn test_successful_request_is_not_errored() {
    let harness = Harness::new();
    let service = HttpTelemetryLayer::new(harness.tracer.clone(), harness.metrics.clone()).layer(tower::service_fn(
        |_request: Request<()>| async move { Ok::<_, Infallible>(Response::new("ok")) },
    ));

    service
        .oneshot(Request::post("/orders").body(()).unwrap())
        .await
        .unwrap();

    let span = harness.span("POST /orders");
    assert_eq!(span.status, Status::Unset);
    assert_eq!(harness.u64_sum("http_requests_total")[0].0, 1);
}

#[tokio::test]
async fn test_incoming_trace_context_becomes_parent() {
    let harness = Harness::new();
    let service = HttpTelemetryLayer::new(harness.tracer.clone(), harness.metrics.clone()).layer(tower::service_fn(
        |request: Request<()>| async move {
            let cx = request
                .extensions()
                .get::<opentelemetry::Context>()
                .cloned()
                .unwrap_or_default();
            let handler_trace = cx.span().span_context().trace_id().to_string();
            Ok::<_, Infallible>(Response::new(handler_trace))
        },
    ));

    let response = service
        .oneshot(
            Request::get("/health")
                .header("traceparent", "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01")
                .body(())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.body(), "4bf92f3577b34da6a3ce929d0e0e4736");
    let span = harness.span("GET /health");
    assert_eq!(span.parent_span_id.to_string(), "00f067aa0ba902b7");
}

#[tokio::test]
async fn test_service_error_counts_as_server_error() {
    let harness = Harness::new();
    let service = HttpTelemetryLayer::new(harness.tracer.clone(), harness.metrics.clone()).layer(tower::service_fn(
        |_request: Request<()>| async move { Err::<Response<()>, _>("connection reset".to_string()) },
    ));

    let err = service
        .oneshot(Request::get("/stream").body(()).unwrap())
        .await
        .unwrap_err();
    assert_eq!(err, "connection reset");

    let counts = harness.u64_sum("http_requests_total");
    assert_eq!(attribute(&counts[0].1, "status_code").as_deref(), Some("500"));
    assert_eq!(harness.i64_sum_total("http_active_requests"), 0);
    assert_eq!(harness.span("GET /stream").status, Status::error("connection reset"));
}
