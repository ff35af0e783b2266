//! Span and tracer wrappers that map operation outcomes to span status.
//!
//! A [`Span`] owns the OpenTelemetry [`Context`] carrying the underlying span,
//! so child operations can be parented on [`Span::context`]. Ending consumes
//! the wrapper: [`Span::end`] and [`Span::end_with_error`] are mutually
//! exclusive and at most one can run. A span dropped without being ended is
//! ended on drop.

use std::borrow::Cow;
use std::error::Error;
use std::future::Future;
use std::sync::Arc;

use opentelemetry::context::FutureExt;
use opentelemetry::global::BoxedTracer;
use opentelemetry::trace::noop::NoopTracer;
use opentelemetry::trace::{SpanContext, SpanKind, Status, TraceContextExt, Tracer as _};
use opentelemetry::{Context, KeyValue};

/// Message recorded with the ok status by [`Span::end_with_error`].
pub const SUCCESS: &str = "success";

/// Start options for a span.
#[derive(Debug, Clone)]
pub struct SpanOptions {
    pub kind: SpanKind,
    pub attributes: Vec<KeyValue>,
}

impl Default for SpanOptions {
    fn default() -> Self {
        Self {
            kind: SpanKind::Internal,
            attributes: Vec::new(),
        }
    }
}

impl SpanOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn server() -> Self {
        Self::default().with_kind(SpanKind::Server)
    }

    pub fn client() -> Self {
        Self::default().with_kind(SpanKind::Client)
    }

    pub fn with_kind(mut self, kind: SpanKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_attribute(mut self, attribute: KeyValue) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn with_attributes(mut self, attributes: impl IntoIterator<Item = KeyValue>) -> Self {
        self.attributes.extend(attributes);
        self
    }
}

/// Produces [`Span`]s from any OpenTelemetry tracer.
#[derive(Clone)]
pub struct Tracer {
    inner: Arc<BoxedTracer>,
}

impl std::fmt::Debug for Tracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracer").finish_non_exhaustive()
    }
}

impl Tracer {
    pub fn new<T>(tracer: T) -> Self
    where
        T: opentelemetry::trace::Tracer + Send + Sync + 'static,
        T::Span: Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(BoxedTracer::new(Box::new(tracer))),
        }
    }

    /// Tracer whose spans are never recorded.
    pub fn noop() -> Self {
        Self::new(NoopTracer::new())
    }

    /// Starts a span named `name` as a child of `parent`.
    pub fn start_span(
        &self,
        parent: &Context,
        name: impl Into<Cow<'static, str>>,
        options: SpanOptions,
    ) -> Span {
        let span = self
            .inner
            .span_builder(name)
            .with_kind(options.kind)
            .with_attributes(options.attributes)
            .start_with_context(self.inner.as_ref(), parent);

        Span {
            cx: parent.with_span(span),
            tracer: self.clone(),
            ended: false,
        }
    }

    /// Runs `operation` inside a new span and returns its result unchanged.
    ///
    /// The operation receives the child context and the span. On return the
    /// span is ended with ok or error status matching the result; a panic
    /// still ends the span when it unwinds.
    pub fn with_span<T, E, F>(
        &self,
        parent: &Context,
        name: impl Into<Cow<'static, str>>,
        options: SpanOptions,
        operation: F,
    ) -> Result<T, E>
    where
        F: FnOnce(&Context, &Span) -> Result<T, E>,
        E: Error + 'static,
    {
        let span = self.start_span(parent, name, options);
        let cx = span.context().clone();
        let result = {
            let _guard = cx.clone().attach();
            operation(&cx, &span)
        };
        span.end_with_result(&result);
        result
    }

    /// Async counterpart of [`Tracer::with_span`]. The operation's future
    /// runs with the child context attached. If the future is dropped before
    /// completion the span is still ended.
    pub async fn in_span<T, E, F, Fut>(
        &self,
        parent: &Context,
        name: impl Into<Cow<'static, str>>,
        options: SpanOptions,
        operation: F,
    ) -> Result<T, E>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Error + 'static,
    {
        let span = self.start_span(parent, name, options);
        let cx = span.context().clone();
        let result = operation(cx.clone()).with_context(cx).await;
        span.end_with_result(&result);
        result
    }
}

/// One traced operation. See the module docs for the ending rules.
pub struct Span {
    cx: Context,
    tracer: Tracer,
    ended: bool,
}

impl std::fmt::Debug for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Span")
            .field("span_context", &self.span_context())
            .field("ended", &self.ended)
            .finish()
    }
}

impl Span {
    /// Context carrying this span; parent for child operations.
    pub fn context(&self) -> &Context {
        &self.cx
    }

    pub fn span_context(&self) -> SpanContext {
        self.cx.span().span_context().clone()
    }

    pub fn is_recording(&self) -> bool {
        self.cx.span().is_recording()
    }

    pub fn set_attribute(&self, attribute: KeyValue) -> &Self {
        self.cx.span().set_attribute(attribute);
        self
    }

    pub fn set_attributes(&self, attributes: impl IntoIterator<Item = KeyValue>) -> &Self {
        self.cx.span().set_attributes(attributes);
        self
    }

    pub fn add_event(&self, name: impl Into<Cow<'static, str>>, attributes: Vec<KeyValue>) -> &Self {
        self.cx.span().add_event(name, attributes);
        self
    }

    pub fn set_status(&self, status: Status) -> &Self {
        self.cx.span().set_status(status);
        self
    }

    /// Records `error` as an exception event and sets error status.
    pub fn record_error(&self, error: &(dyn Error + 'static)) -> &Self {
        let span = self.cx.span();
        span.record_error(error);
        span.set_status(Status::error(error.to_string()));
        self
    }

    /// Starts a child span from the same tracer.
    pub fn child(&self, name: impl Into<Cow<'static, str>>, options: SpanOptions) -> Span {
        self.tracer.start_span(&self.cx, name, options)
    }

    pub fn end(mut self) {
        self.finish();
    }

    /// Ends the span with ok status when `error` is `None`, otherwise
    /// records the error and ends with error status.
    pub fn end_with_error(self, error: Option<&(dyn Error + 'static)>) {
        match error {
            Some(error) => {
                self.record_error(error);
            }
            None => {
                // Ok carries no description, so the message travels as an attribute.
                self.set_attribute(KeyValue::new("otel.status_description", SUCCESS));
                self.set_status(Status::Ok);
            }
        }
        self.end();
    }

    pub fn end_with_result<T, E>(self, result: &Result<T, E>)
    where
        E: Error + 'static,
    {
        self.end_with_error(result.as_ref().err().map(|e| e as &(dyn Error + 'static)));
    }

    fn finish(&mut self) {
        if !self.ended {
            self.ended = true;
            self.cx.span().end();
        }
    }
}

impl Drop for Span {
    fn drop(&mut self) {
        self.finish();
    }
}
