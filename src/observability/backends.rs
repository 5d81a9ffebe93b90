//! Observability backends.
//!
//! Two concrete backends sit behind the façade: an error tracker (scoped
//! error events with user/tag/context enrichment) and a metrics tracker
//! (counters, histograms, observable gauges, spans). Both degrade to
//! logging when no external endpoint is configured; neither ever panics
//! into the pipeline.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use uuid::Uuid;

use crate::prelude::*;

use super::config::{ErrorTrackerSettings, MetricsTrackerSettings};
use super::{ErrorEvent, MetricRecord, MetricType, SignalLevel};

/// Cap on stored histogram samples per metric.
const HISTOGRAM_SAMPLE_CAP: usize = 1024;

/// Operations a backend supports. Implementations must be infallible from
/// the caller's point of view: internal failures are logged and swallowed.
pub trait Backend: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Record an error event; returns an event id when one was assigned.
    fn capture_error(&self, event: &ErrorEvent) -> Option<String>;

    /// Record a standalone message at a level.
    fn capture_message(&self, message: &str, level: SignalLevel) -> Option<String>;

    fn record_metric(&self, metric: &MetricRecord);

    /// Record a discrete event with attributes.
    fn record_event(&self, name: &str, attributes: &Value);

    /// Record a finished span.
    fn record_span(&self, name: &str, duration: Duration, status: &str);

    /// Flush buffered data; true when everything was flushed in time.
    fn flush(&self, timeout: Duration) -> bool;

    fn shutdown(&self);
}

/// Error-tracking backend. Events are enriched with service metadata and
/// emitted through structured logging; the DSN marks where a real exporter
/// would ship them.
#[derive(Debug)]
pub struct ErrorTrackerBackend {
    settings: ErrorTrackerSettings,
    events_captured: Mutex<u64>,
}

impl ErrorTrackerBackend {
    pub fn new(settings: ErrorTrackerSettings) -> Self {
        if settings.dsn.as_deref().unwrap_or("").is_empty() {
            debug!("error tracker has no DSN; events will only be logged");
        }
        Self { settings, events_captured: Mutex::new(0) }
    }

    #[cfg(test)]
    pub fn events_captured(&self) -> u64 {
        *self.events_captured.lock().expect("error tracker lock poisoned")
    }
}

impl Backend for ErrorTrackerBackend {
    fn name(&self) -> &'static str {
        "error_tracker"
    }

    fn capture_error(&self, event: &ErrorEvent) -> Option<String> {
        let event_id = Uuid::new_v4().to_string();
        *self.events_captured.lock().expect("error tracker lock poisoned") += 1;
        error!(
            event_id = %event_id,
            level = event.level.as_str(),
            environment = %self.settings.environment,
            context = %event.context,
            tags = ?event.tags,
            trace_id = event.trace.as_ref().map(|t| t.trace_id.as_str()),
            span_id = event.trace.as_ref().map(|t| t.span_id.as_str()),
            "captured error: {}",
            event.message
        );
        Some(event_id)
    }

    fn capture_message(&self, message: &str, level: SignalLevel) -> Option<String> {
        let event_id = Uuid::new_v4().to_string();
        info!(event_id = %event_id, level = level.as_str(), "captured message: {message}");
        Some(event_id)
    }

    fn record_metric(&self, metric: &MetricRecord) {
        // The error tracker accepts metrics only when routing sends them
        // here; they are logged rather than aggregated.
        debug!(
            name = %metric.name,
            value = metric.value,
            kind = ?metric.metric_type,
            "error tracker received metric"
        );
    }

    fn record_event(&self, name: &str, attributes: &Value) {
        debug!(event = name, %attributes, "error tracker received event");
    }

    fn record_span(&self, name: &str, duration: Duration, status: &str) {
        debug!(span = name, ?duration, status, "error tracker received span");
    }

    fn flush(&self, _timeout: Duration) -> bool {
        true
    }

    fn shutdown(&self) {
        debug!("error tracker shut down");
    }
}

/// Key for counter/histogram aggregation: name plus sorted labels.
type MetricKey = (String, Vec<(String, String)>);

#[derive(Debug, Default)]
struct MetricsState {
    counters: HashMap<MetricKey, f64>,
    histograms: HashMap<MetricKey, Vec<f64>>,
}

/// Metrics/traces backend with in-memory aggregation.
///
/// Gauges are observable: writers update a lock-protected
/// `name -> label-tuple -> value` map and the exporter copies the map under
/// the same lock. Concurrent writes and export reads must never race, which
/// is exactly what the single mutex guarantees.
#[derive(Debug)]
pub struct MetricsBackend {
    settings: MetricsTrackerSettings,
    state: Mutex<MetricsState>,
    gauges: Mutex<HashMap<String, HashMap<Vec<(String, String)>, f64>>>,
}

impl MetricsBackend {
    pub fn new(settings: MetricsTrackerSettings) -> Self {
        if settings.endpoint.as_deref().unwrap_or("").is_empty() {
            debug!("metrics tracker has no endpoint; metrics stay in-process");
        }
        Self {
            settings,
            state: Mutex::new(MetricsState::default()),
            gauges: Mutex::new(HashMap::new()),
        }
    }

    /// The export callback: copy every gauge's label map under the lock.
    pub fn export_gauges(&self) -> HashMap<String, HashMap<Vec<(String, String)>, f64>> {
        self.gauges.lock().expect("gauge map lock poisoned").clone()
    }

    /// Current value of a counter.
    #[cfg(test)]
    pub fn counter_value(&self, name: &str, labels: &[(String, String)]) -> Option<f64> {
        let state = self.state.lock().expect("metrics state lock poisoned");
        state.counters.get(&(name.to_owned(), sorted(labels))).copied()
    }

    /// Recorded histogram samples for a metric.
    #[cfg(test)]
    pub fn histogram_len(&self, name: &str, labels: &[(String, String)]) -> usize {
        let state = self.state.lock().expect("metrics state lock poisoned");
        state
            .histograms
            .get(&(name.to_owned(), sorted(labels)))
            .map(Vec::len)
            .unwrap_or(0)
    }
}

impl Backend for MetricsBackend {
    fn name(&self) -> &'static str {
        "metrics_tracker"
    }

    fn capture_error(&self, event: &ErrorEvent) -> Option<String> {
        // Errors routed here become a counter, not an event record.
        self.record_metric(&MetricRecord {
            name: "errors_total".into(),
            metric_type: MetricType::Counter,
            value: 1.0,
            labels: vec![("level".into(), event.level.as_str().to_owned())],
        });
        None
    }

    fn capture_message(&self, message: &str, level: SignalLevel) -> Option<String> {
        debug!(level = level.as_str(), "metrics tracker received message: {message}");
        None
    }

    fn record_metric(&self, metric: &MetricRecord) {
        if !self.settings.metrics_enabled {
            return;
        }
        let key = (metric.name.clone(), sorted(&metric.labels));
        match metric.metric_type {
            MetricType::Counter | MetricType::UpdownCounter => {
                let mut state = self.state.lock().expect("metrics state lock poisoned");
                *state.counters.entry(key).or_insert(0.0) += metric.value;
            }
            MetricType::Histogram => {
                let mut state = self.state.lock().expect("metrics state lock poisoned");
                let samples = state.histograms.entry(key).or_default();
                if samples.len() < HISTOGRAM_SAMPLE_CAP {
                    samples.push(metric.value);
                }
            }
            MetricType::Gauge => {
                let mut gauges = self.gauges.lock().expect("gauge map lock poisoned");
                gauges
                    .entry(metric.name.clone())
                    .or_default()
                    .insert(sorted(&metric.labels), metric.value);
            }
        }
    }

    fn record_event(&self, name: &str, attributes: &Value) {
        debug!(event = name, %attributes, "recorded event");
    }

    fn record_span(&self, name: &str, duration: Duration, status: &str) {
        if !self.settings.traces_enabled {
            return;
        }
        self.record_metric(&MetricRecord {
            name: "span_duration_seconds".into(),
            metric_type: MetricType::Histogram,
            value: duration.as_secs_f64(),
            labels: vec![
                ("span".into(), name.to_owned()),
                ("status".into(), status.to_owned()),
            ],
        });
    }

    fn flush(&self, _timeout: Duration) -> bool {
        // The gauge export is the flush-time observation: copy the label
        // maps under the lock exactly as an exporter callback would.
        let gauges = self.export_gauges();
        debug!(gauge_series = gauges.len(), "metrics flushed");
        true
    }

    fn shutdown(&self) {
        let mut gauges = self.gauges.lock().expect("gauge map lock poisoned");
        gauges.clear();
        debug!("metrics tracker shut down");
    }
}

fn sorted(labels: &[(String, String)]) -> Vec<(String, String)> {
    let mut labels = labels.to_vec();
    labels.sort();
    labels
}

/// Test backend that records every call for assertions.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct RecordingBackend {
    pub errors: Mutex<Vec<String>>,
    pub messages: Mutex<Vec<String>>,
    pub metrics: Mutex<Vec<MetricRecord>>,
    pub spans: Mutex<Vec<(String, String)>>,
    pub shutdowns: Mutex<u32>,
}

#[cfg(test)]
impl Backend for RecordingBackend {
    fn name(&self) -> &'static str {
        "recording"
    }
    fn capture_error(&self, event: &ErrorEvent) -> Option<String> {
        self.errors.lock().unwrap().push(event.message.clone());
        Some("recorded".into())
    }
    fn capture_message(&self, message: &str, _level: SignalLevel) -> Option<String> {
        self.messages.lock().unwrap().push(message.to_owned());
        Some("recorded".into())
    }
    fn record_metric(&self, metric: &MetricRecord) {
        self.metrics.lock().unwrap().push(metric.clone());
    }
    fn record_event(&self, _name: &str, _attributes: &Value) {}
    fn record_span(&self, name: &str, _duration: Duration, status: &str) {
        self.spans.lock().unwrap().push((name.to_owned(), status.to_owned()));
    }
    fn flush(&self, _timeout: Duration) -> bool {
        true
    }
    fn shutdown(&self) {
        *self.shutdowns.lock().unwrap() += 1;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::observability::TraceContext;

    fn metrics_backend() -> MetricsBackend {
        MetricsBackend::new(MetricsTrackerSettings::default())
    }

    fn counter(name: &str, value: f64) -> MetricRecord {
        MetricRecord {
            name: name.into(),
            metric_type: MetricType::Counter,
            value,
            labels: vec![],
        }
    }

    #[test]
    fn counters_accumulate() {
        let backend = metrics_backend();
        backend.record_metric(&counter("api_calls", 1.0));
        backend.record_metric(&counter("api_calls", 2.0));
        assert_eq!(backend.counter_value("api_calls", &[]), Some(3.0));
    }

    #[test]
    fn label_order_does_not_split_series() {
        let backend = metrics_backend();
        let a = MetricRecord {
            name: "calls".into(),
            metric_type: MetricType::Counter,
            value: 1.0,
            labels: vec![("x".into(), "1".into()), ("y".into(), "2".into())],
        };
        let b = MetricRecord {
            labels: vec![("y".into(), "2".into()), ("x".into(), "1".into())],
            ..a.clone()
        };
        backend.record_metric(&a);
        backend.record_metric(&b);
        assert_eq!(backend.counter_value("calls", &a.labels), Some(2.0));
    }

    #[test]
    fn gauge_writes_land_in_the_label_map() {
        let backend = metrics_backend();
        backend.record_metric(&MetricRecord {
            name: "queue_depth".into(),
            metric_type: MetricType::Gauge,
            value: 7.0,
            labels: vec![("stage".into(), "judge".into())],
        });
        let export = backend.export_gauges();
        let series = &export["queue_depth"];
        assert_eq!(series[&vec![("stage".to_owned(), "judge".to_owned())]], 7.0);
    }

    #[test]
    fn gauge_map_survives_concurrent_writes_and_exports() {
        // Property: >= 8 writer threads x >= 100 writes each, with a reader
        // exporting concurrently, never corrupt the label map.
        let backend = Arc::new(metrics_backend());
        let mut handles = Vec::new();
        for thread in 0..8 {
            let backend = backend.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..200 {
                    backend.record_metric(&MetricRecord {
                        name: format!("gauge_{}", thread % 4),
                        metric_type: MetricType::Gauge,
                        value: i as f64,
                        labels: vec![("thread".into(), thread.to_string())],
                    });
                }
            }));
        }
        let reader = {
            let backend = backend.clone();
            std::thread::spawn(move || {
                for _ in 0..200 {
                    let export = backend.export_gauges();
                    for (_, series) in export {
                        for (labels, _) in series {
                            assert_eq!(labels.len(), 1);
                        }
                    }
                }
            })
        };
        for handle in handles {
            handle.join().unwrap();
        }
        reader.join().unwrap();

        let export = backend.export_gauges();
        assert_eq!(export.len(), 4);
        for series in export.values() {
            assert_eq!(series.len(), 2); // two threads per gauge name
            for value in series.values() {
                assert_eq!(*value, 199.0);
            }
        }
    }

    #[test]
    fn histogram_samples_are_bounded() {
        let backend = metrics_backend();
        for i in 0..(HISTOGRAM_SAMPLE_CAP + 100) {
            backend.record_metric(&MetricRecord {
                name: "latency".into(),
                metric_type: MetricType::Histogram,
                value: i as f64,
                labels: vec![],
            });
        }
        assert_eq!(backend.histogram_len("latency", &[]), HISTOGRAM_SAMPLE_CAP);
    }

    #[test]
    fn disabled_metrics_are_dropped() {
        let backend = MetricsBackend::new(MetricsTrackerSettings {
            metrics_enabled: false,
            ..Default::default()
        });
        backend.record_metric(&counter("ignored", 1.0));
        assert_eq!(backend.counter_value("ignored", &[]), None);
    }

    #[test]
    fn error_tracker_assigns_event_ids() {
        let backend = ErrorTrackerBackend::new(ErrorTrackerSettings::default());
        let event = ErrorEvent {
            message: "boom".into(),
            level: SignalLevel::Error,
            context: json!({"component": "judge"}),
            tags: Default::default(),
            trace: Some(TraceContext {
                trace_id: "trace".into(),
                span_id: "span".into(),
            }),
        };
        let id = backend.capture_error(&event);
        assert!(id.is_some());
        assert_eq!(backend.events_captured(), 1);
    }

    #[test]
    fn recording_backend_captures_through_the_trait() {
        let backend = RecordingBackend::default();
        let dyn_backend: &dyn Backend = &backend;

        dyn_backend.capture_error(&ErrorEvent {
            message: "recorded failure".into(),
            level: SignalLevel::Error,
            context: json!({}),
            tags: Default::default(),
            trace: None,
        });
        dyn_backend.capture_message("note", SignalLevel::Info);
        dyn_backend.record_metric(&counter("seen", 1.0));
        dyn_backend.record_span("stage", Duration::from_millis(3), "ok");
        dyn_backend.shutdown();

        assert_eq!(backend.errors.lock().unwrap().as_slice(), ["recorded failure"]);
        assert_eq!(backend.messages.lock().unwrap().as_slice(), ["note"]);
        assert_eq!(backend.metrics.lock().unwrap().len(), 1);
        assert_eq!(
            backend.spans.lock().unwrap().as_slice(),
            [("stage".to_owned(), "ok".to_owned())]
        );
        assert_eq!(*backend.shutdowns.lock().unwrap(), 1);
    }

    #[test]
    fn shutdown_clears_gauges() {
        let backend = metrics_backend();
        backend.record_metric(&MetricRecord {
            name: "g".into(),
            metric_type: MetricType::Gauge,
            value: 1.0,
            labels: vec![],
        });
        backend.shutdown();
        assert!(backend.export_gauges().is_empty());
    }
}
