//! Prometheus text exposition of a [`MetricsSnapshot`].

use std::collections::BTreeMap;
use std::fmt::Write as _;

use predictor_core::MetricType;

use tracing::warn;

use super::aggregator::{MetricValue, MetricsSnapshot, SnapshotEntry};

/// Labels added to every exposed series, identifying the deployment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeploymentLabels {
    labels: BTreeMap<String, String>,
}

impl DeploymentLabels {
    /// Builds the label set. `image` is split on its last `:` into
    /// `model_image` and `model_version`; empty values are omitted.
    #[must_use]
    pub fn new(deployment_name: &str, predictor_name: &str, model_name: &str, image: &str) -> Self {
        let (model_image, model_version) = split_image_tag(image);
        let labels = [
            ("deployment_name", deployment_name),
            ("predictor_name", predictor_name),
            ("model_name", model_name),
            ("model_image", model_image),
            ("model_version", model_version),
        ]
        .into_iter()
        .filter(|(_, v)| !v.is_empty())
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        Self { labels }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// Splits `repo/name:tag` into `("repo/name", "tag")`. A colon belonging to a
/// registry port (`host:5000/name`) is not a tag separator.
#[must_use]
pub fn split_image_tag(image: &str) -> (&str, &str) {
    match image.rsplit_once(':') {
        Some((name, tag)) if !tag.contains('/') => (name, tag),
        _ => (image, if image.is_empty() { "" } else { "latest" }),
    }
}

/// Renders the snapshot as Prometheus text format, one `# TYPE` line per
/// metric family.
///
/// Families are keyed by sanitized name. When one name is used with several
/// metric types, the first type (counter, gauge, timer) keeps the name and the
/// others are exposed as `<name>_<type>`; a suffixed name that is itself taken
/// is skipped.
#[must_use]
pub fn render(snapshot: &MetricsSnapshot, deployment: &DeploymentLabels) -> String {
    let mut by_name: BTreeMap<String, BTreeMap<MetricType, Vec<&SnapshotEntry>>> =
        BTreeMap::new();
    for entry in &snapshot.entries {
        by_name
            .entry(sanitize_name(&entry.key))
            .or_default()
            .entry(entry.metric_type)
            .or_default()
            .push(entry);
    }

    let mut families = Vec::new();
    for (name, types) in &by_name {
        for (i, (metric_type, entries)) in types.iter().enumerate() {
            if i == 0 {
                families.push((name.clone(), *metric_type, entries));
                continue;
            }
            let renamed = format!("{name}_{}", metric_type.as_str().to_ascii_lowercase());
            if by_name.contains_key(&renamed) {
                warn!(
                    metric = %name,
                    kind = metric_type.as_str(),
                    "conflicting metric type dropped from exposition"
                );
                continue;
            }
            families.push((renamed, *metric_type, entries));
        }
    }

    let mut out = String::new();
    for (name, metric_type, entries) in families {
        let kind = match metric_type {
            MetricType::COUNTER => "counter",
            MetricType::GAUGE => "gauge",
            MetricType::TIMER => "histogram",
        };
        let _ = writeln!(out, "# TYPE {name} {kind}");
        for entry in entries {
            let labels = series_labels(deployment, entry);
            match &entry.value {
                MetricValue::Counter(v) | MetricValue::Gauge(v) => {
                    let _ = writeln!(out, "{name}{} {}", label_set(&labels, None), fmt_f64(*v));
                }
                MetricValue::Timer(h) => {
                    for (bound, count) in h.cumulative() {
                        let le = if bound.is_infinite() {
                            "+Inf".to_string()
                        } else {
                            fmt_f64(bound)
                        };
                        let _ = writeln!(
                            out,
                            "{name}_bucket{} {count}",
                            label_set(&labels, Some(&le))
                        );
                    }
                    let plain = label_set(&labels, None);
                    let _ = writeln!(out, "{name}_sum{plain} {}", fmt_f64(h.sum()));
                    let _ = writeln!(out, "{name}_count{plain} {}", h.count());
                }
            }
        }
    }
    out
}

/// Deployment labels plus the entry's tags. A tag that would shadow a
/// deployment label, `le`, or a `__`-prefixed name is exposed as `tag_<key>`.
fn series_labels(
    deployment: &DeploymentLabels,
    entry: &SnapshotEntry,
) -> BTreeMap<String, String> {
    let mut labels = deployment.labels.clone();
    for (key, value) in &entry.tags {
        let key = sanitize_label(key);
        let reserved =
            key == "le" || key.starts_with("__") || deployment.labels.contains_key(&key);
        let key = if reserved { format!("tag_{key}") } else { key };
        labels.entry(key).or_insert_with(|| value.clone());
    }
    labels
}

fn label_set(labels: &BTreeMap<String, String>, le: Option<&str>) -> String {
    if labels.is_empty() && le.is_none() {
        return String::new();
    }
    let mut parts: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{k}=\"{}\"", escape_label(v)))
        .collect();
    if let Some(le) = le {
        parts.push(format!("le=\"{le}\""));
    }
    format!("{{{}}}", parts.join(","))
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

/// Replaces characters outside `[a-zA-Z0-9_:]` with `_`.
fn sanitize_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == ':' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

/// Label names additionally exclude `:`.
fn sanitize_label(name: &str) -> String {
    sanitize_name(name).replace(':', "_")
}

fn fmt_f64(v: f64) -> String {
    if v.is_infinite() {
        if v > 0.0 { "+Inf" } else { "-Inf" }.to_string()
    } else {
        format!("{v}")
    }
}

#[cfg(test)]
mod tests {
    use predictor_core::MetricRecord;

    use super::*;
    use crate::metrics::MetricsAggregator;

    #[test]
    fn split_image_tag_cases() {
        assert_eq!(split_image_tag("seldonio/model:0.1"), ("seldonio/model", "0.1"));
        assert_eq!(split_image_tag("seldonio/model"), ("seldonio/model", "latest"));
        assert_eq!(
            split_image_tag("registry:5000/model"),
            ("registry:5000/model", "latest")
        );
        assert_eq!(
            split_image_tag("registry:5000/model:2"),
            ("registry:5000/model", "2")
        );
        assert_eq!(split_image_tag(""), ("", ""));
    }

    #[test]
    fn renders_counter_with_deployment_labels() {
        let agg = MetricsAggregator::new();
        agg.record(&[MetricRecord::counter("my-counter", 2.0)], "predict")
            .unwrap();
        let labels = DeploymentLabels::new("dep", "pred", "model", "img:1.0");
        let text = render(&agg.snapshot(), &labels);
        assert!(text.contains("# TYPE my_counter counter"));
        assert!(text.contains(
            "my_counter{deployment_name=\"dep\",method=\"predict\",model_image=\"img\",\
             model_name=\"model\",model_version=\"1.0\",predictor_name=\"pred\"} 2"
        ));
    }

    #[test]
    fn renders_histogram_series() {
        let agg = MetricsAggregator::new();
        agg.record(&[MetricRecord::timer("latency", 20.0)], "predict")
            .unwrap();
        let text = render(&agg.snapshot(), &DeploymentLabels::default());
        assert!(text.contains("# TYPE latency histogram"));
        assert!(text.contains("latency_bucket{method=\"predict\",le=\"0.01\"} 0"));
        assert!(text.contains("latency_bucket{method=\"predict\",le=\"0.025\"} 1"));
        assert!(text.contains("latency_bucket{method=\"predict\",le=\"+Inf\"} 1"));
        assert!(text.contains("latency_sum{method=\"predict\"} 0.02"));
        assert!(text.contains("latency_count{method=\"predict\"} 1"));
    }

    #[test]
    fn label_values_are_escaped() {
        let agg = MetricsAggregator::new();
        let rec = MetricRecord::gauge("g", 1.0).with_tag("path", "a\"b\\c");
        agg.record(&[rec], "predict").unwrap();
        let text = render(&agg.snapshot(), &DeploymentLabels::default());
        assert!(text.contains(r#"path="a\"b\\c""#));
    }

    #[test]
    fn one_name_with_two_types_gets_distinct_families() {
        let agg = MetricsAggregator::new();
        agg.record(
            &[
                MetricRecord::counter("hits", 1.0),
                MetricRecord::gauge("hits", 5.0),
                MetricRecord::counter("hi-ts", 2.0),
            ],
            "predict",
        )
        .unwrap();
        let text = render(&agg.snapshot(), &DeploymentLabels::default());
        let type_lines: Vec<&str> = text.lines().filter(|l| l.starts_with("# TYPE")).collect();
        assert_eq!(
            type_lines,
            vec![
                "# TYPE hi_ts counter",
                "# TYPE hits counter",
                "# TYPE hits_gauge gauge"
            ]
        );
        assert!(text.contains("hits{method=\"predict\"} 1"));
        assert!(text.contains("hits_gauge{method=\"predict\"} 5"));
    }

    #[test]
    fn reserved_tag_keys_are_renamed() {
        let agg = MetricsAggregator::new();
        let rec = MetricRecord::timer("latency", 20.0)
            .with_tag("le", "x")
            .with_tag("model_name", "spoofed")
            .with_tag("a:b", "c");
        agg.record(&[rec], "predict").unwrap();
        let labels = DeploymentLabels::new("", "", "iris", "");
        let text = render(&agg.snapshot(), &labels);
        assert!(text.contains(
            "latency_bucket{a_b=\"c\",method=\"predict\",model_name=\"iris\",\
             tag_le=\"x\",tag_model_name=\"spoofed\",le=\"+Inf\"} 1"
        ));
        assert!(!text.contains(",model_name=\"spoofed\""));
    }

    #[test]
    fn empty_snapshot_renders_nothing() {
        assert!(render(&MetricsSnapshot::default(), &DeploymentLabels::default()).is_empty());
    }
}
