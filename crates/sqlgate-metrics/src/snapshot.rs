// Copyright 2025 sqlgate Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Plain-data snapshots and Prometheus text exposition.

use crate::registry::{
    QUERY_DURATION_HELP, QUERY_DURATION_NAME, SERIALIZATION_FAILURE_HELP,
    SERIALIZATION_FAILURE_NAME,
};

/// One summary series at a point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct SummarySnapshot {
    pub name: String,
    pub labels: Vec<(String, String)>,
    pub count: u64,
    pub sum: f64,
    /// `(quantile, value)` pairs.
    pub quantiles: Vec<(f64, f64)>,
}

/// One counter series at a point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct CounterSnapshot {
    pub name: String,
    pub labels: Vec<(String, String)>,
    pub value: u64,
}

/// Everything the registry tracks, ready for exposition or assertions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub summaries: Vec<SummarySnapshot>,
    pub counters: Vec<CounterSnapshot>,
}

/// Renders a snapshot in the Prometheus text exposition format.
pub(crate) fn render_prometheus(snapshot: &MetricsSnapshot) -> String {
    let mut out = String::new();

    out.push_str(&format!("# HELP {QUERY_DURATION_NAME} {QUERY_DURATION_HELP}\n"));
    out.push_str(&format!("# TYPE {QUERY_DURATION_NAME} summary\n"));

    for summary in &snapshot.summaries {
        let labels = render_labels(&summary.labels);

        for (quantile, value) in &summary.quantiles {
            out.push_str(&format!(
                "{}{{{labels},quantile=\"{quantile}\"}} {value}\n",
                summary.name,
            ));
        }

        out.push_str(&format!("{}_sum{{{labels}}} {}\n", summary.name, summary.sum));
        out.push_str(&format!("{}_count{{{labels}}} {}\n", summary.name, summary.count));
    }

    out.push_str(&format!(
        "# HELP {SERIALIZATION_FAILURE_NAME} {SERIALIZATION_FAILURE_HELP}\n",
    ));
    out.push_str(&format!("# TYPE {SERIALIZATION_FAILURE_NAME} counter\n"));

    for counter in &snapshot.counters {
        out.push_str(&format!(
            "{}{{{}}} {}\n",
            counter.name,
            render_labels(&counter.labels),
            counter.value,
        ));
    }

    out
}

fn render_labels(labels: &[(String, String)]) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}=\"{}\"", escape_label_value(v)))
        .collect::<Vec<_>>()
        .join(",")
}

fn escape_label_value(v: &str) -> String {
    v.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{QueryDurationLabels, SqlMetrics};

    fn populated() -> SqlMetrics {
        let metrics = SqlMetrics::new();
        metrics.observe_query_duration(
            &QueryDurationLabels {
                db_type: "postgres",
                db_addr: "127.0.0.1:5432",
                db_name: "app",
                is_error: false,
                operation: "select",
                table: "users",
            },
            12.5,
        );
        metrics.inc_serialization_failure("postgres", "127.0.0.1:5432", "app");

        metrics
    }

    #[test]
    fn render_has_help_and_type_lines() {
        let out = populated().render();

        assert!(out.contains("# HELP sql_query_duration_milliseconds"));
        assert!(out.contains("# TYPE sql_query_duration_milliseconds summary"));
        assert!(out.contains("# TYPE sql_serialization_failure_errors_total counter"));
    }

    #[test]
    fn render_has_quantile_sum_count_series() {
        let out = populated().render();

        assert!(out.contains("quantile=\"0.5\""));
        assert!(out.contains("quantile=\"0.9\""));
        assert!(out.contains("quantile=\"0.99\""));
        assert!(out.contains("sql_query_duration_milliseconds_sum{"));
        assert!(out.contains("sql_query_duration_milliseconds_count{"));
        assert!(out.contains(
            "sql_serialization_failure_errors_total{db_type=\"postgres\",db_addr=\"127.0.0.1:5432\",db_name=\"app\"} 1",
        ));
    }

    #[test]
    fn render_includes_all_duration_labels() {
        let out = populated().render();

        for label in [
            "db_type=\"postgres\"",
            "db_addr=\"127.0.0.1:5432\"",
            "db_name=\"app\"",
            "is_error=\"false\"",
            "operation=\"select\"",
            "table=\"users\"",
        ] {
            assert!(out.contains(label), "missing {label} in:\n{out}");
        }
    }

    #[test]
    fn label_values_are_escaped() {
        assert_eq!(escape_label_value("a\"b\\c\nd"), "a\\\"b\\\\c\\nd");
    }

    #[test]
    fn every_sample_line_is_well_formed() {
        let out = populated().render();

        for line in out.lines() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            assert!(
                line.contains('{') && line.contains("} "),
                "malformed line: {line}",
            );
        }
    }
}
