use std::collections::HashMap;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::RwLock;

use crate::models::PathStats;

/// Per-route request counts, error counts and response times.
#[derive(Default)]
pub struct MetricsCollector {
    stats: RwLock<HashMap<String, PathStats>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn collect(&self, path: &str, started: Instant, status: u16) {
        let duration_ms = started.elapsed().as_millis() as u64;
        self.record(path, duration_ms, status).await;
    }

    pub async fn record(&self, path: &str, duration_ms: u64, status: u16) {
        let mut stats = self.stats.write().await;
        let now = Utc::now();
        let entry = stats.entry(path.to_string()).or_insert_with(|| PathStats {
            request_count: 0,
            error_count: 0,
            average_response_time: 0,
            last_request: now,
        });

        entry.request_count += 1;
        if status >= 400 {
            entry.error_count += 1;
        }

        let n = entry.request_count as f64;
        let previous = entry.average_response_time as f64;
        entry.average_response_time = ((previous * (n - 1.0) + duration_ms as f64) / n).round() as u64;
        entry.last_request = now;
    }

    pub async fn snapshot(&self) -> HashMap<String, PathStats> {
        self.stats.read().await.clone()
    }

    pub async fn reset(&self) {
        self.stats.write().await.clear();
    }
}
