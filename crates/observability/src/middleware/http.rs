//! Tower middleware tracing and measuring every HTTP request.
//!
//! Per request: the propagated trace context is extracted from the headers,
//! a server span named `"{method} {path}"` is started, the active-request
//! counter is held up for the lifetime of the handler, and once the
//! response is known the status, request count and duration are recorded.

use std::fmt;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Instant;

use ::http::{HeaderMap, Request, Response};
use futures::future::BoxFuture;
use opentelemetry::context::FutureExt;
use opentelemetry::metrics::UpDownCounter;
use opentelemetry::propagation::{Extractor, TextMapPropagator};
use opentelemetry::trace::Status;
use opentelemetry::KeyValue;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use tower::{Layer, Service};

use crate::metrics::CommonMetrics;
use crate::span::{SpanOptions, Tracer};
use crate::telemetry::Provider;

/// Status recorded when the wrapped service fails instead of responding.
const SERVICE_ERROR_STATUS: u16 = 500;

struct HeaderExtractor<'a>(&'a HeaderMap);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|value| value.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|name| name.as_str()).collect()
    }
}

/// Holds one unit on the active-request counter until dropped.
struct ActiveRequest {
    counter: UpDownCounter<i64>,
    attributes: [KeyValue; 2],
}

impl ActiveRequest {
    fn start(counter: &UpDownCounter<i64>, attributes: [KeyValue; 2]) -> Self {
        counter.add(1, &attributes);
        Self {
            counter: counter.clone(),
            attributes,
        }
    }
}

impl Drop for ActiveRequest {
    fn drop(&mut self) {
        self.counter.add(-1, &self.attributes);
    }
}

/// [`Layer`] applying [`HttpTelemetry`] to a service.
#[derive(Clone)]
pub struct HttpTelemetryLayer {
    tracer: Tracer,
    metrics: Arc<CommonMetrics>,
    propagator: Arc<dyn TextMapPropagator + Send + Sync>,
}

impl fmt::Debug for HttpTelemetryLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTelemetryLayer").finish_non_exhaustive()
    }
}

impl HttpTelemetryLayer {
    /// Layer extracting W3C trace-context headers.
    pub fn new(tracer: Tracer, metrics: Arc<CommonMetrics>) -> Self {
        Self {
            tracer,
            metrics,
            propagator: Arc::new(TraceContextPropagator::new()),
        }
    }

    pub fn from_provider(provider: &Provider) -> Self {
        Self::new(provider.tracer().clone(), provider.metrics()).with_propagator(provider.propagator())
    }

    pub fn with_propagator(mut self, propagator: Arc<dyn TextMapPropagator + Send + Sync>) -> Self {
        self.propagator = propagator;
        self
    }
}

impl<S> Layer<S> for HttpTelemetryLayer {
    type Service = HttpTelemetry<S>;

    fn layer(&self, inner: S) -> Self::Service {
        HttpTelemetry {
            inner,
            telemetry: self.clone(),
        }
    }
}

/// Service wrapper produced by [`HttpTelemetryLayer`].
///
/// The request reaches the inner service with the request span's
/// [`opentelemetry::Context`] in its extensions and attached to the
/// handler future.
#[derive(Clone)]
pub struct HttpTelemetry<S> {
    inner: S,
    telemetry: HttpTelemetryLayer,
}

impl<S: fmt::Debug> fmt::Debug for HttpTelemetry<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTelemetry").field("inner", &self.inner).finish_non_exhaustive()
    }
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for HttpTelemetry<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: fmt::Display + Send + 'static,
    ReqBody: Send + 'static,
    ResBody: Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<ReqBody>) -> Self::Future {
        let method = request.method().as_str().to_string();
        let route = request.uri().path().to_string();

        let parent = self.telemetry.propagator.extract(&HeaderExtractor(request.headers()));
        let span = self.telemetry.tracer.start_span(
            &parent,
            format!("{} {}", method, route),
            SpanOptions::server().with_attributes([
                KeyValue::new("http.request.method", method.clone()),
                KeyValue::new("url.path", request.uri().to_string()),
            ]),
        );
        let cx = span.context().clone();
        request.extensions_mut().insert(cx.clone());

        let metrics = Arc::clone(&self.telemetry.metrics);
        let route_attributes = [KeyValue::new("method", method), KeyValue::new("route", route)];
        let active = ActiveRequest::start(&metrics.http_active_requests, route_attributes.clone());

        // The ready service is the one that must handle this request.
        let ready = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, ready);

        Box::pin(async move {
            let _active = active;
            let started = Instant::now();
            let result = inner.call(request).with_context(cx).await;
            let elapsed = started.elapsed().as_secs_f64();

            let status = match &result {
                Ok(response) => response.status().as_u16(),
                Err(_) => SERVICE_ERROR_STATUS,
            };
            span.set_attribute(KeyValue::new("http.response.status_code", i64::from(status)));
            match &result {
                Err(error) => {
                    span.set_status(Status::error(error.to_string()));
                }
                Ok(_) if status >= 400 => {
                    span.set_status(Status::error("HTTP Request Failed"));
                }
                Ok(_) => {}
            }

            let [method, route] = route_attributes;
            metrics.http_requests_total.add(
                1,
                &[
                    method.clone(),
                    route.clone(),
                    KeyValue::new("status_code", status.to_string()),
                ],
            );
            metrics.http_request_duration.record(elapsed, &[method, route]);

            span.end();
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::metrics::MeterProvider as _;
    use opentelemetry::trace::TraceContextExt;
    use opentelemetry_sdk::metrics::SdkMeterProvider;
    use std::convert::Infallible;
    use tower::ServiceExt;

    use crate::metrics::MetricRegistry;

    fn layer() -> HttpTelemetryLayer {
        let meter = SdkMeterProvider::builder().build().meter("http-tests");
        let metrics = CommonMetrics::new(&MetricRegistry::new(meter)).unwrap();
        HttpTelemetryLayer::new(Tracer::noop(), Arc::new(metrics))
    }

    #[test]
    fn test_header_extractor_reads_traceparent() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "traceparent",
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01".parse().unwrap(),
        );

        let cx = TraceContextPropagator::new().extract(&HeaderExtractor(&headers));
        let remote = cx.span().span_context().clone();
        assert!(remote.is_remote());
        assert_eq!(remote.trace_id().to_string(), "4bf92f3577b34da6a3ce929d0e0e4736");
        assert_eq!(HeaderExtractor(&headers).keys(), vec!["traceparent"]);
    }

    #[tokio::test]
    async fn test_handler_sees_request_context() {
        let service = layer().layer(tower::service_fn(|request: Request<()>| async move {
            let has_context = request.extensions().get::<opentelemetry::Context>().is_some();
            Ok::<_, Infallible>(Response::new(has_context))
        }));

        let response = service
            .oneshot(Request::get("/orders").body(()).unwrap())
            .await
            .unwrap();
        assert!(*response.body());
    }

    #[tokio::test]
    async fn test_inner_error_is_returned_unchanged() {
        let service = layer().layer(tower::service_fn(|_request: Request<()>| async move {
            Err::<Response<()>, _>("upstream unavailable".to_string())
        }));

        let err = service
            .oneshot(Request::get("/orders").body(()).unwrap())
            .await
            .unwrap_err();
        assert_eq!(err, "upstream unavailable");
    }
}
