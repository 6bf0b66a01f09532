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

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use crate::snapshot::{CounterSnapshot, MetricsSnapshot, SummarySnapshot};

pub(crate) const QUERY_DURATION_NAME: &str = "sql_query_duration_milliseconds";
pub(crate) const QUERY_DURATION_HELP: &str =
    "Summary of response time for SQL queries (milliseconds)";
pub(crate) const QUERY_DURATION_LABELS: [&str; 6] =
    ["db_type", "db_addr", "db_name", "is_error", "operation", "table"];

pub(crate) const SERIALIZATION_FAILURE_NAME: &str = "sql_serialization_failure_errors_total";
pub(crate) const SERIALIZATION_FAILURE_HELP: &str =
    "SQL transaction serialization failure count";
pub(crate) const SERIALIZATION_FAILURE_LABELS: [&str; 3] = ["db_type", "db_addr", "db_name"];

/// Reported quantiles with their estimation tolerance.
pub const QUANTILE_OBJECTIVES: [(f64, f64); 3] = [(0.5, 0.05), (0.9, 0.01), (0.99, 0.001)];

/// Samples kept per series for quantile estimation.
const SAMPLE_WINDOW: usize = 1024;

/// Labels of one query duration observation.
#[derive(Debug, Clone, Copy)]
pub struct QueryDurationLabels<'a> {
    pub db_type: &'a str,
    pub db_addr: &'a str,
    pub db_name: &'a str,
    pub is_error: bool,
    pub operation: &'a str,
    pub table: &'a str,
}

#[derive(Default)]
struct SummarySeries {
    count: AtomicU64,
    sum_bits: AtomicU64,
    window: Mutex<Vec<f64>>,
}

impl SummarySeries {
    fn record(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);

        let mut cur = self.sum_bits.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(cur) + value).to_bits();
            match self
                .sum_bits
                .compare_exchange_weak(cur, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }

        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        if window.len() == SAMPLE_WINDOW {
            window.remove(0);
        }
        window.push(value);
    }

    fn sum(&self) -> f64 {
        f64::from_bits(self.sum_bits.load(Ordering::Relaxed))
    }

    /// Quantiles estimated from the retained sample window.
    fn quantiles(&self) -> Vec<(f64, f64)> {
        let mut samples = self
            .window
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        if samples.is_empty() {
            return QUANTILE_OBJECTIVES.iter().map(|(q, _)| (*q, 0.0)).collect();
        }

        samples.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        QUANTILE_OBJECTIVES
            .iter()
            .map(|(q, _)| {
                let idx = ((samples.len() - 1) as f64 * q).round() as usize;
                (*q, samples[idx.min(samples.len() - 1)])
            })
            .collect()
    }
}

struct SummaryVec {
    series: RwLock<HashMap<Vec<String>, Arc<SummarySeries>>>,
}

impl SummaryVec {
    fn new() -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
        }
    }

    fn observe(&self, label_values: Vec<String>, value: f64) {
        if let Some(series) = self
            .series
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&label_values)
        {
            series.record(value);
            return;
        }

        let series = {
            let mut map = self.series.write().unwrap_or_else(|e| e.into_inner());
            map.entry(label_values)
                .or_insert_with(|| Arc::new(SummarySeries::default()))
                .clone()
        };
        series.record(value);
    }
}

struct CounterVec {
    series: RwLock<HashMap<Vec<String>, Arc<AtomicU64>>>,
}

impl CounterVec {
    fn new() -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
        }
    }

    fn inc(&self, label_values: Vec<String>) {
        if let Some(counter) = self
            .series
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&label_values)
        {
            counter.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let counter = {
            let mut map = self.series.write().unwrap_or_else(|e| e.into_inner());
            map.entry(label_values)
                .or_insert_with(|| Arc::new(AtomicU64::new(0)))
                .clone()
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// The SQL metrics registry.
pub struct SqlMetrics {
    query_duration: SummaryVec,
    serialization_failures: CounterVec,
}

impl Default for SqlMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SqlMetrics {
    pub fn new() -> Self {
        Self {
            query_duration: SummaryVec::new(),
            serialization_failures: CounterVec::new(),
        }
    }

    /// Process-wide registry. The first call creates it, later calls return
    /// the same instance; registration cannot fail.
    pub fn global() -> Arc<SqlMetrics> {
        static GLOBAL: OnceLock<Arc<SqlMetrics>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(SqlMetrics::new())).clone()
    }

    pub fn observe_query_duration(&self, labels: &QueryDurationLabels<'_>, millis: f64) {
        self.query_duration.observe(
            vec![
                labels.db_type.to_string(),
                labels.db_addr.to_string(),
                labels.db_name.to_string(),
                labels.is_error.to_string(),
                labels.operation.to_string(),
                labels.table.to_string(),
            ],
            millis,
        );
    }

    pub fn inc_serialization_failure(&self, db_type: &str, db_addr: &str, db_name: &str) {
        self.serialization_failures.inc(vec![
            db_type.to_string(),
            db_addr.to_string(),
            db_name.to_string(),
        ]);
    }

    /// Plain-data snapshot of every series, sorted by label values for
    /// deterministic output.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut summaries: Vec<SummarySnapshot> = self
            .query_duration
            .series
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(values, series)| SummarySnapshot {
                name: QUERY_DURATION_NAME.to_string(),
                labels: QUERY_DURATION_LABELS
                    .iter()
                    .map(|l| l.to_string())
                    .zip(values.iter().cloned())
                    .collect(),
                count: series.count.load(Ordering::Relaxed),
                sum: series.sum(),
                quantiles: series.quantiles(),
            })
            .collect();
        summaries.sort_by(|a, b| a.labels.cmp(&b.labels));

        let mut counters: Vec<CounterSnapshot> = self
            .serialization_failures
            .series
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(values, counter)| CounterSnapshot {
                name: SERIALIZATION_FAILURE_NAME.to_string(),
                labels: SERIALIZATION_FAILURE_LABELS
                    .iter()
                    .map(|l| l.to_string())
                    .zip(values.iter().cloned())
                    .collect(),
                value: counter.load(Ordering::Relaxed),
            })
            .collect();
        counters.sort_by(|a, b| a.labels.cmp(&b.labels));

        MetricsSnapshot {
            summaries,
            counters,
        }
    }

    /// Prometheus text exposition of the current snapshot.
    pub fn render(&self) -> String {
        crate::snapshot::render_prometheus(&self.snapshot())
    }
}
