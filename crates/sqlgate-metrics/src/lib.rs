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

//! SQL query metrics: a summary of per-query duration and a counter of
//! transaction serialization failures, with Prometheus text exposition.
//!
//! The registry is self-contained (per-series atomics plus a bounded sample
//! window for quantile estimation), so it can back a `/metrics` endpoint
//! without dragging a metrics framework into the client library.
//!
//! # Example
//!
//! ```rust
//! use sqlgate_metrics::{QueryDurationLabels, SqlMetrics};
//!
//! let metrics = SqlMetrics::new();
//! metrics.observe_query_duration(
//!     &QueryDurationLabels {
//!         db_type: "postgres",
//!         db_addr: "127.0.0.1:5432",
//!         db_name: "app",
//!         is_error: false,
//!         operation: "select",
//!         table: "users",
//!     },
//!     12.5,
//! );
//!
//! let text = metrics.render();
//! assert!(text.contains("sql_query_duration_milliseconds"));
//! ```

mod registry;
mod snapshot;

pub use registry::{QueryDurationLabels, SqlMetrics, QUANTILE_OBJECTIVES};
pub use snapshot::{CounterSnapshot, MetricsSnapshot, SummarySnapshot};
