//! Observability façade.
//!
//! One process-wide façade routes three signal classes (errors, metrics,
//! traces) to two backends according to the routing policy. Every operation
//! is total: before `init`, or when a routed backend is disabled, calls
//! degrade to a debug log and return nothing. A failure in one backend
//! never affects the other signal paths.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use regex::Regex;
use uuid::Uuid;

use crate::prelude::*;

pub mod backends;
pub mod config;

pub use config::{ObservabilitySettings, RoutingSettings, SignalTarget};

use backends::{Backend, ErrorTrackerBackend, MetricsBackend};

/// Metric instrument kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Counter,
    Histogram,
    Gauge,
    UpdownCounter,
}

/// Severity for captured errors and messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalLevel {
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
}

impl SignalLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalLevel::Debug => "debug",
            SignalLevel::Info => "info",
            SignalLevel::Warning => "warning",
            SignalLevel::Error => "error",
            SignalLevel::Fatal => "fatal",
        }
    }
}

/// Identifiers of the active trace and span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
}

/// An error event as handed to backends, after scope enrichment.
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub message: String,
    pub level: SignalLevel,
    pub context: Value,
    pub tags: BTreeMap<String, String>,
    pub trace: Option<TraceContext>,
}

/// One metric sample as handed to backends.
#[derive(Debug, Clone)]
pub struct MetricRecord {
    pub name: String,
    pub metric_type: MetricType,
    pub value: f64,
    pub labels: Vec<(String, String)>,
}

#[derive(Debug, Default)]
struct Scope {
    user: Option<Value>,
    tags: BTreeMap<String, String>,
    contexts: BTreeMap<String, Value>,
}

#[derive(Debug)]
struct Inner {
    routing: RoutingSettings,
    error_tracker: Option<Arc<ErrorTrackerBackend>>,
    metrics_tracker: Option<Arc<MetricsBackend>>,
    service_name: String,
    environment: String,
}

/// The façade. Constructed uninitialized; `init` wires up the backends.
/// Cheap to share via `Arc`.
#[derive(Debug, Default)]
pub struct Observability {
    inner: Mutex<Option<Inner>>,
    scope: Mutex<Scope>,
    span_stack: Mutex<Vec<TraceContext>>,
}

impl Observability {
    /// An uninitialized façade: every operation no-ops.
    pub fn new() -> Self {
        Self::default()
    }

    /// An initialized façade.
    pub fn init(settings: ObservabilitySettings) -> Self {
        let facade = Self::new();
        facade.initialize(settings);
        facade
    }

    /// Initialize (or re-initialize) backends from settings.
    pub fn initialize(&self, settings: ObservabilitySettings) {
        let error_tracker = settings
            .error_tracker
            .enabled
            .then(|| Arc::new(ErrorTrackerBackend::new(settings.error_tracker.clone())));
        let metrics_tracker = settings
            .metrics_tracker
            .enabled
            .then(|| Arc::new(MetricsBackend::new(settings.metrics_tracker.clone())));
        let environment = settings.error_tracker.environment.clone();
        let service_name = settings.metrics_tracker.service_name.clone();
        info!(
            error_tracker = error_tracker.is_some(),
            metrics_tracker = metrics_tracker.is_some(),
            "observability initialized"
        );
        *self.inner.lock().expect("observability lock poisoned") = Some(Inner {
            routing: settings.routing,
            error_tracker,
            metrics_tracker,
            service_name,
            environment,
        });
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.lock().expect("observability lock poisoned").is_some()
    }

    /// Backends a signal routes to, cloned out so no lock is held while
    /// backends run.
    fn route(&self, pick: impl Fn(&RoutingSettings) -> SignalTarget) -> Vec<Arc<dyn Backend>> {
        let guard = self.inner.lock().expect("observability lock poisoned");
        let Some(inner) = guard.as_ref() else {
            debug!("observability not initialized; dropping signal");
            return Vec::new();
        };
        let target = pick(&inner.routing);
        let mut backends: Vec<Arc<dyn Backend>> = Vec::new();
        if target.includes_error_tracker() {
            match &inner.error_tracker {
                Some(backend) => backends.push(backend.clone()),
                None => debug!("error tracker disabled; dropping signal"),
            }
        }
        if target.includes_metrics_tracker() {
            match &inner.metrics_tracker {
                Some(backend) => backends.push(backend.clone()),
                None => debug!("metrics tracker disabled; dropping signal"),
            }
        }
        backends
    }

    /// Capture an error with optional extra context. Returns the first
    /// backend-assigned event id, or `None` when nothing captured it.
    pub fn capture_error(
        &self,
        error: &dyn std::fmt::Display,
        level: SignalLevel,
        context: Option<Value>,
    ) -> Option<String> {
        let backends = self.route(|r| r.errors);
        if backends.is_empty() {
            return None;
        }

        let (service_name, environment) = {
            let guard = self.inner.lock().expect("observability lock poisoned");
            let inner = guard.as_ref()?;
            (inner.service_name.clone(), inner.environment.clone())
        };
        let scope = self.scope.lock().expect("scope lock poisoned");
        let mut enriched = json!({
            "service": service_name,
            "environment": environment,
        });
        if let Some(user) = &scope.user {
            enriched["user"] = user.clone();
        }
        for (key, value) in &scope.contexts {
            enriched[key.as_str()] = value.clone();
        }
        if let Some(extra) = context {
            enriched["extra"] = extra;
        }
        let event = ErrorEvent {
            message: error.to_string(),
            level,
            context: enriched,
            tags: scope.tags.clone(),
            trace: self.get_trace_context(),
        };
        drop(scope);

        let mut event_id = None;
        for backend in backends {
            let id = backend.capture_error(&event);
            event_id = event_id.or(id);
        }
        event_id
    }

    /// Capture a standalone message.
    pub fn capture_message(&self, message: &str, level: SignalLevel) -> Option<String> {
        let mut event_id = None;
        for backend in self.route(|r| r.errors) {
            event_id = event_id.or(backend.capture_message(message, level));
        }
        event_id
    }

    /// Record a metric sample. Non-conforming names and high-cardinality
    /// label names are warned about and passed through.
    pub fn record_metric(
        &self,
        name: &str,
        metric_type: MetricType,
        value: f64,
        labels: &[(String, String)],
    ) {
        if !valid_metric_name(name) {
            warn!(
                metric = name,
                "metric name does not match [a-z][a-z0-9_.]*; passing through"
            );
        }
        for (label, _) in labels {
            if high_cardinality_label(label) {
                warn!(metric = name, label, "label name looks high-cardinality");
            }
        }
        let record = MetricRecord {
            name: name.to_owned(),
            metric_type,
            value,
            labels: labels.to_vec(),
        };
        for backend in self.route(|r| r.metrics) {
            backend.record_metric(&record);
        }
    }

    /// Start a span. The guard records the span to the routed backends and
    /// restores the previous trace context when dropped.
    pub fn start_span(&self, name: &str) -> SpanGuard<'_> {
        let context = TraceContext {
            trace_id: self
                .get_trace_context()
                .map(|ctx| ctx.trace_id)
                .unwrap_or_else(|| Uuid::new_v4().simple().to_string()),
            span_id: Uuid::new_v4().simple().to_string(),
        };
        self.span_stack.lock().expect("span stack lock poisoned").push(context);
        SpanGuard {
            facade: self,
            name: name.to_owned(),
            started: Instant::now(),
            status: Mutex::new("ok".to_owned()),
        }
    }

    /// Identifiers of the innermost active span, if any.
    pub fn get_trace_context(&self) -> Option<TraceContext> {
        self.span_stack.lock().expect("span stack lock poisoned").last().cloned()
    }

    pub fn set_user(&self, user: Value) {
        self.scope.lock().expect("scope lock poisoned").user = Some(user);
    }

    pub fn set_tag(&self, key: &str, value: &str) {
        self.scope
            .lock()
            .expect("scope lock poisoned")
            .tags
            .insert(key.to_owned(), value.to_owned());
    }

    pub fn set_context(&self, key: &str, value: Value) {
        self.scope
            .lock()
            .expect("scope lock poisoned")
            .contexts
            .insert(key.to_owned(), value);
    }

    /// Record a discrete event with attributes.
    pub fn record_event(&self, name: &str, attributes: Value) {
        for backend in self.route(|r| r.traces) {
            backend.record_event(name, &attributes);
        }
    }

    /// Flush every backend; true when all flushed within the timeout.
    pub fn flush(&self, timeout: Duration) -> bool {
        let guard = self.inner.lock().expect("observability lock poisoned");
        let Some(inner) = guard.as_ref() else {
            return true;
        };
        let mut ok = true;
        if let Some(backend) = &inner.error_tracker {
            ok &= backend.flush(timeout);
        }
        if let Some(backend) = &inner.metrics_tracker {
            ok &= backend.flush(timeout);
        }
        ok
    }

    /// Shut everything down. State is cleared even when a backend's
    /// shutdown misbehaves, so a second shutdown is always a no-op.
    pub fn shutdown(&self) {
        let inner = self.inner.lock().expect("observability lock poisoned").take();
        if let Some(inner) = inner {
            if let Some(backend) = inner.error_tracker {
                backend.shutdown();
            }
            if let Some(backend) = inner.metrics_tracker {
                backend.shutdown();
            }
        }
        self.span_stack.lock().expect("span stack lock poisoned").clear();
        *self.scope.lock().expect("scope lock poisoned") = Scope::default();
        debug!("observability shut down");
    }

    fn finish_span(&self, name: &str, duration: Duration, status: &str) {
        self.span_stack.lock().expect("span stack lock poisoned").pop();
        for backend in self.route(|r| r.traces) {
            backend.record_span(name, duration, status);
        }
    }
}

/// Scoped span handle. Closes the span on drop.
#[must_use = "the span stays open until this guard drops"]
pub struct SpanGuard<'a> {
    facade: &'a Observability,
    name: String,
    started: Instant,
    status: Mutex<String>,
}

impl SpanGuard<'_> {
    /// Override the span status ("ok", "error", "cancelled").
    pub fn set_status(&self, status: &str) {
        *self.status.lock().expect("span status lock poisoned") = status.to_owned();
    }
}

impl Drop for SpanGuard<'_> {
    fn drop(&mut self) {
        let status = self.status.lock().expect("span status lock poisoned").clone();
        self.facade.finish_span(&self.name, self.started.elapsed(), &status);
    }
}

fn valid_metric_name(name: &str) -> bool {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[a-z][a-z0-9_.]*$").expect("valid regex"))
        .is_match(name)
}

fn high_cardinality_label(label: &str) -> bool {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"(?i)^(user_?id|request_?id|session_?id|timestamp|email|ip(_?addr(ess)?)?|uuid)$")
                .expect("valid regex")
        })
        .is_match(label)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn initialized() -> Observability {
        Observability::init(ObservabilitySettings::default())
    }

    #[test]
    fn uninitialized_facade_is_total() {
        let obs = Observability::new();
        assert!(!obs.is_initialized());
        assert!(obs.capture_error(&"boom", SignalLevel::Error, None).is_none());
        assert!(obs.capture_message("hello", SignalLevel::Info).is_none());
        obs.record_metric("x", MetricType::Counter, 1.0, &[]);
        obs.record_event("event", json!({}));
        obs.set_tag("k", "v");
        obs.set_user(json!({"id": 1}));
        assert!(obs.flush(Duration::from_secs(1)));
        obs.shutdown();
        // Spans still work as plain guards.
        let span = obs.start_span("noop");
        drop(span);
    }

    #[test]
    fn errors_route_to_the_error_tracker_by_default() {
        let obs = initialized();
        let event_id = obs.capture_error(&"kaboom", SignalLevel::Error, None);
        assert!(event_id.is_some());
    }

    #[test]
    fn metrics_route_to_the_metrics_tracker_by_default() {
        let obs = initialized();
        obs.record_metric("pipeline_runs", MetricType::Counter, 1.0, &[]);
        let guard = obs.inner.lock().unwrap();
        let backend = guard.as_ref().unwrap().metrics_tracker.as_ref().unwrap();
        assert_eq!(backend.counter_value("pipeline_runs", &[]), Some(1.0));
    }

    #[test]
    fn disabled_backend_degrades_to_noop() {
        let mut settings = ObservabilitySettings::default();
        settings.error_tracker.enabled = false;
        let obs = Observability::init(settings);
        // Errors route to the (disabled) error tracker: no-op, no panic.
        assert!(obs.capture_error(&"lost", SignalLevel::Error, None).is_none());
        // Metrics still work: one backend's absence must not affect the
        // other signal.
        obs.record_metric("still_works", MetricType::Counter, 1.0, &[]);
        let guard = obs.inner.lock().unwrap();
        let backend = guard.as_ref().unwrap().metrics_tracker.as_ref().unwrap();
        assert_eq!(backend.counter_value("still_works", &[]), Some(1.0));
    }

    #[test]
    fn both_routing_fans_out() {
        let mut settings = ObservabilitySettings::default();
        settings.routing.errors = SignalTarget::Both;
        let obs = Observability::init(settings);
        let event_id = obs.capture_error(&"fan out", SignalLevel::Warning, None);
        // The error tracker assigns the id; the metrics tracker counted it.
        assert!(event_id.is_some());
        let guard = obs.inner.lock().unwrap();
        let backend = guard.as_ref().unwrap().metrics_tracker.as_ref().unwrap();
        assert_eq!(
            backend.counter_value(
                "errors_total",
                &[("level".to_owned(), "warning".to_owned())]
            ),
            Some(1.0)
        );
    }

    #[test]
    fn spans_nest_and_expose_trace_context() {
        let obs = initialized();
        assert!(obs.get_trace_context().is_none());

        let outer = obs.start_span("pipeline");
        let outer_ctx = obs.get_trace_context().unwrap();

        {
            let _inner = obs.start_span("generation");
            let inner_ctx = obs.get_trace_context().unwrap();
            // Same trace, different span.
            assert_eq!(inner_ctx.trace_id, outer_ctx.trace_id);
            assert_ne!(inner_ctx.span_id, outer_ctx.span_id);
        }

        assert_eq!(obs.get_trace_context().unwrap().span_id, outer_ctx.span_id);
        drop(outer);
        assert!(obs.get_trace_context().is_none());
    }

    #[test]
    fn span_status_can_be_overridden() {
        let obs = initialized();
        let span = obs.start_span("cancelled_work");
        span.set_status("cancelled");
        drop(span);
        // Span durations land in the metrics backend histogram.
        let guard = obs.inner.lock().unwrap();
        let backend = guard.as_ref().unwrap().metrics_tracker.as_ref().unwrap();
        let labels = vec![
            ("span".to_owned(), "cancelled_work".to_owned()),
            ("status".to_owned(), "cancelled".to_owned()),
        ];
        assert_eq!(backend.histogram_len("span_duration_seconds", &labels), 1);
    }

    #[test]
    fn metric_name_validation() {
        assert!(valid_metric_name("questions_generated"));
        assert!(valid_metric_name("pipeline.stage.duration"));
        assert!(!valid_metric_name("Questions"));
        assert!(!valid_metric_name("9lives"));
        assert!(!valid_metric_name("has-dash"));
        // Non-conforming names still pass through.
        let obs = initialized();
        obs.record_metric("BadName", MetricType::Counter, 1.0, &[]);
        let guard = obs.inner.lock().unwrap();
        let backend = guard.as_ref().unwrap().metrics_tracker.as_ref().unwrap();
        assert_eq!(backend.counter_value("BadName", &[]), Some(1.0));
    }

    #[test]
    fn high_cardinality_label_detection() {
        for label in ["user_id", "userid", "request_id", "timestamp", "email", "ip", "uuid"] {
            assert!(high_cardinality_label(label), "{label}");
        }
        for label in ["provider", "question_type", "stage"] {
            assert!(!high_cardinality_label(label), "{label}");
        }
    }

    #[test]
    fn shutdown_clears_state_and_is_idempotent() {
        let obs = initialized();
        obs.set_tag("run", "test");
        let _ctx = obs.start_span("leaky");
        obs.shutdown();
        assert!(!obs.is_initialized());
        assert!(obs.scope.lock().unwrap().tags.is_empty());
        obs.shutdown(); // second shutdown is a no-op
    }

    #[test]
    fn capture_error_enriches_with_scope_and_trace() {
        let obs = initialized();
        obs.set_user(json!({"id": "service-account"}));
        obs.set_tag("component", "judge");
        obs.set_context("run", json!({"batch": 3}));
        let _span = obs.start_span("evaluation");
        // The enriched event is only observable through the backend logs
        // here; what matters is that enrichment never panics with an active
        // scope and span, and still returns an event id.
        let id = obs.capture_error(&"enriched", SignalLevel::Error, Some(json!({"k": "v"})));
        assert!(id.is_some());
    }
}
