//! Metric forwarding and threshold monitoring.
//!
//! The monitor forwards derived metrics to an external [`MetricSink`]
//! (fire-and-forget: sink trouble is logged, never propagated to the
//! caller), evaluates threshold rules against each observation, and records
//! breaches as [`Incident`]s. Alerts go to an optional [`AlertSink`] on a
//! best-effort basis.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;
use crate::regression::{RegressionReport, RegressionSeverity};

/// External metrics sink, consumed fire-and-forget.
pub trait MetricSink: Send + Sync {
    fn publish_metric(&self, name: &str, value: f64, labels: &HashMap<String, String>);
}

/// External alerting sink, consumed best-effort.
pub trait AlertSink: Send + Sync {
    fn create_alert(&self, alert: &AlertSpec) -> Result<AlertHandle>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertSpec {
    pub name: String,
    pub condition: String,
    pub threshold: f64,
    pub channels: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertHandle {
    pub id: String,
}

/// Default sink: structured log events only.
pub struct TracingMetricSink;

impl MetricSink for TracingMetricSink {
    fn publish_metric(&self, name: &str, value: f64, labels: &HashMap<String, String>) {
        debug!(metric = name, value, ?labels, "metric published");
    }
}

/// Prometheus-backed sink. Gauges are registered lazily on first publish
/// with that publish's label names; later publishes with different label
/// names are logged and dropped rather than surfaced, matching the
/// fire-and-forget contract.
pub struct PrometheusMetricSink {
    registry: Registry,
    gauges: RwLock<HashMap<String, (GaugeVec, Vec<String>)>>,
}

impl PrometheusMetricSink {
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
            gauges: RwLock::new(HashMap::new()),
        }
    }

    /// Text-format exposition of everything published so far.
    pub fn export(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(err) = encoder.encode(&self.registry.gather(), &mut buffer) {
            warn!("failed to encode metrics: {}", err);
        }
        String::from_utf8(buffer).unwrap_or_default()
    }

    fn verified(
        name: &str,
        registered: &(GaugeVec, Vec<String>),
        label_names: &[&str],
    ) -> Option<GaugeVec> {
        let (gauge, registered_names) = registered;
        if registered_names
            .iter()
            .map(String::as_str)
            .eq(label_names.iter().copied())
        {
            Some(gauge.clone())
        } else {
            warn!(
                "metric '{}' published with labels {:?} but registered with {:?}; dropped",
                name, label_names, registered_names
            );
            None
        }
    }

    fn gauge_for(&self, name: &str, label_names: &[&str]) -> Option<GaugeVec> {
        if let Some(registered) = self.gauges.read().unwrap().get(name) {
            return Self::verified(name, registered, label_names);
        }
        let mut gauges = self.gauges.write().unwrap();
        if let Some(registered) = gauges.get(name) {
            return Self::verified(name, registered, label_names);
        }
        let opts = Opts::new(name.to_string(), format!("engine-published metric {name}"));
        match GaugeVec::new(opts, label_names) {
            Ok(gauge) => {
                if let Err(err) = self.registry.register(Box::new(gauge.clone())) {
                    warn!("failed to register metric '{}': {}", name, err);
                    return None;
                }
                let names = label_names.iter().map(|l| l.to_string()).collect();
                gauges.insert(name.to_string(), (gauge.clone(), names));
                Some(gauge)
            }
            Err(err) => {
                warn!("invalid metric '{}': {}", name, err);
                None
            }
        }
    }
}

impl Default for PrometheusMetricSink {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricSink for PrometheusMetricSink {
    fn publish_metric(&self, name: &str, value: f64, labels: &HashMap<String, String>) {
        let mut label_names: Vec<&str> = labels.keys().map(String::as_str).collect();
        label_names.sort_unstable();

        let Some(gauge) = self.gauge_for(name, &label_names) else {
            return;
        };
        let label_values: Vec<&str> = label_names.iter().map(|k| labels[*k].as_str()).collect();
        match gauge.get_metric_with_label_values(&label_values) {
            Ok(metric) => metric.set(value),
            Err(err) => warn!("metric '{}' label mismatch: {}", name, err),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Comparison {
    Above,
    Below,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentSeverity {
    Info,
    Warning,
    Critical,
}

/// One threshold rule evaluated on every matching observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdRule {
    pub metric: String,
    pub comparison: Comparison,
    pub threshold: f64,
    pub severity: IncidentSeverity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub metric: String,
    pub value: f64,
    pub threshold: f64,
    pub severity: IncidentSeverity,
    pub message: String,
    pub occurred_at_ms: u64,
}

pub struct MetricMonitor {
    sink: Arc<dyn MetricSink>,
    alert_sink: Option<Arc<dyn AlertSink>>,
    rules: RwLock<Vec<ThresholdRule>>,
    incidents: Mutex<VecDeque<Incident>>,
    incident_history: usize,
}

impl MetricMonitor {
    pub fn new(sink: Arc<dyn MetricSink>, incident_history: usize) -> Self {
        Self {
            sink,
            alert_sink: None,
            rules: RwLock::new(Vec::new()),
            incidents: Mutex::new(VecDeque::new()),
            incident_history: incident_history.max(1),
        }
    }

    pub fn with_alert_sink(mut self, alert_sink: Arc<dyn AlertSink>) -> Self {
        self.alert_sink = Some(alert_sink);
        self
    }

    pub fn add_rule(&self, rule: ThresholdRule) {
        self.rules.write().unwrap().push(rule);
    }

    /// Forward one observation and evaluate threshold rules against it.
    /// Returns the incidents fired by this observation.
    pub fn observe(
        &self,
        name: &str,
        value: f64,
        labels: &HashMap<String, String>,
    ) -> Vec<Incident> {
        self.sink.publish_metric(name, value, labels);

        let mut fired = Vec::new();
        for rule in self.rules.read().unwrap().iter() {
            if rule.metric != name {
                continue;
            }
            let breached = match rule.comparison {
                Comparison::Above => value > rule.threshold,
                Comparison::Below => value < rule.threshold,
            };
            if breached {
                let direction = match rule.comparison {
                    Comparison::Above => "above",
                    Comparison::Below => "below",
                };
                fired.push(Incident {
                    metric: name.to_string(),
                    value,
                    threshold: rule.threshold,
                    severity: rule.severity,
                    message: format!(
                        "{} is {} threshold {} (observed {})",
                        name, direction, rule.threshold, value
                    ),
                    occurred_at_ms: chrono::Utc::now().timestamp_millis() as u64,
                });
            }
        }

        if !fired.is_empty() {
            let mut incidents = self.incidents.lock().unwrap();
            for incident in &fired {
                warn!("threshold breached: {}", incident.message);
                while incidents.len() >= self.incident_history {
                    incidents.pop_front();
                }
                incidents.push_back(incident.clone());
                self.raise_alert(incident);
            }
        }
        fired
    }

    fn raise_alert(&self, incident: &Incident) {
        let Some(alert_sink) = &self.alert_sink else {
            return;
        };
        let spec = AlertSpec {
            name: format!("{}_threshold", incident.metric),
            condition: incident.message.clone(),
            threshold: incident.threshold,
            channels: Vec::new(),
        };
        // Best-effort: a rejected alert never propagates.
        if let Err(err) = alert_sink.create_alert(&spec) {
            warn!("alert sink rejected '{}': {}", spec.name, err);
        }
    }

    /// Publish the derived metrics of a regression report and alert on
    /// severe regressions.
    pub fn report_regression(&self, report: &RegressionReport) {
        let mut labels = HashMap::new();
        labels.insert("operation".to_string(), report.operation.clone());

        self.sink.publish_metric(
            "operation_mean_change_percent",
            report.mean_change_percent,
            &labels,
        );
        self.sink
            .publish_metric("operation_regression_confidence", report.confidence, &labels);

        if report.severity == RegressionSeverity::Severe {
            let incident = Incident {
                metric: "operation_mean_change_percent".to_string(),
                value: report.mean_change_percent,
                threshold: 75.0,
                severity: IncidentSeverity::Critical,
                message: format!(
                    "severe regression on '{}': mean latency rose {:.0}%",
                    report.operation, report.mean_change_percent
                ),
                occurred_at_ms: chrono::Utc::now().timestamp_millis() as u64,
            };
            warn!("{}", incident.message);
            let mut incidents = self.incidents.lock().unwrap();
            while incidents.len() >= self.incident_history {
                incidents.pop_front();
            }
            incidents.push_back(incident.clone());
            drop(incidents);
            self.raise_alert(&incident);
        }
    }

    /// Recorded incidents, oldest first.
    pub fn incidents(&self) -> Vec<Incident> {
        self.incidents.lock().unwrap().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PerfError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingSink {
        published: Mutex<Vec<(String, f64)>>,
    }

    impl MetricSink for RecordingSink {
        fn publish_metric(&self, name: &str, value: f64, _labels: &HashMap<String, String>) {
            self.published.lock().unwrap().push((name.to_string(), value));
        }
    }

    struct FlakyAlertSink {
        calls: AtomicUsize,
    }

    impl AlertSink for FlakyAlertSink {
        fn create_alert(&self, _alert: &AlertSpec) -> Result<AlertHandle> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(PerfError::InvalidConfig("alert backend down".to_string()))
        }
    }

    #[test]
    fn observe_forwards_to_the_sink() {
        let sink = Arc::new(RecordingSink::default());
        let monitor = MetricMonitor::new(sink.clone(), 16);

        monitor.observe("latency_ms", 12.0, &HashMap::new());
        assert_eq!(
            sink.published.lock().unwrap().as_slice(),
            &[("latency_ms".to_string(), 12.0)]
        );
        assert!(monitor.incidents().is_empty());
    }

    #[test]
    fn threshold_rules_fire_incidents() {
        let monitor = MetricMonitor::new(Arc::new(TracingMetricSink), 16);
        monitor.add_rule(ThresholdRule {
            metric: "error_rate".to_string(),
            comparison: Comparison::Above,
            threshold: 0.05,
            severity: IncidentSeverity::Critical,
        });
        monitor.add_rule(ThresholdRule {
            metric: "cache_hit_ratio".to_string(),
            comparison: Comparison::Below,
            threshold: 0.7,
            severity: IncidentSeverity::Warning,
        });

        assert!(monitor.observe("error_rate", 0.01, &HashMap::new()).is_empty());
        let fired = monitor.observe("error_rate", 0.2, &HashMap::new());
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].severity, IncidentSeverity::Critical);

        let fired = monitor.observe("cache_hit_ratio", 0.5, &HashMap::new());
        assert_eq!(fired.len(), 1);
        assert_eq!(monitor.incidents().len(), 2);
    }

    #[test]
    fn incident_history_is_bounded() {
        let monitor = MetricMonitor::new(Arc::new(TracingMetricSink), 3);
        monitor.add_rule(ThresholdRule {
            metric: "m".to_string(),
            comparison: Comparison::Above,
            threshold: 0.0,
            severity: IncidentSeverity::Info,
        });
        for i in 0..10 {
            monitor.observe("m", 1.0 + i as f64, &HashMap::new());
        }

        let incidents = monitor.incidents();
        assert_eq!(incidents.len(), 3);
        assert_eq!(incidents[0].value, 8.0);
    }

    #[test]
    fn failing_alert_sink_never_propagates() {
        let alert_sink = Arc::new(FlakyAlertSink {
            calls: AtomicUsize::new(0),
        });
        let monitor = MetricMonitor::new(Arc::new(TracingMetricSink), 16)
            .with_alert_sink(alert_sink.clone());
        monitor.add_rule(ThresholdRule {
            metric: "m".to_string(),
            comparison: Comparison::Above,
            threshold: 1.0,
            severity: IncidentSeverity::Warning,
        });

        let fired = monitor.observe("m", 5.0, &HashMap::new());
        assert_eq!(fired.len(), 1);
        assert_eq!(alert_sink.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn prometheus_sink_exports_published_gauges() {
        let sink = PrometheusMetricSink::new();
        let mut labels = HashMap::new();
        labels.insert("operation".to_string(), "db_query".to_string());

        sink.publish_metric("operation_latency_ms", 42.0, &labels);
        sink.publish_metric("operation_latency_ms", 43.0, &labels);

        let exported = sink.export();
        assert!(exported.contains("operation_latency_ms"));
        assert!(exported.contains("db_query"));
        assert!(exported.contains("43"));
    }

    #[test]
    fn prometheus_sink_drops_mismatched_label_names() {
        let sink = PrometheusMetricSink::new();
        let mut labels = HashMap::new();
        labels.insert("operation".to_string(), "db_query".to_string());
        sink.publish_metric("operation_latency_ms", 42.0, &labels);

        // Same label count, different label name: dropped, not misfiled.
        let mut other = HashMap::new();
        other.insert("service".to_string(), "api".to_string());
        sink.publish_metric("operation_latency_ms", 99.0, &other);

        let exported = sink.export();
        assert!(exported.contains("db_query"));
        assert!(!exported.contains("api"));
        assert!(!exported.contains("99"));
    }
}
