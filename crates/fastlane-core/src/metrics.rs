//! In-process engine metrics
//!
//! Per-queue gauges and counters, exposed through the API health endpoint.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::queue::QueueName;

/// Counters for one stream
#[derive(Debug, Default)]
pub struct QueueMetrics {
    in_flight: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
}

impl QueueMetrics {
    /// A handler took a message
    pub fn message_started(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    /// The handler finished, one way or the other
    pub fn message_finished(&self, success: bool) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        if success {
            self.processed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Messages currently being handled
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Messages handled successfully
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Messages whose handler failed
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Engine-wide metrics, one set of counters per stream
#[derive(Debug, Default)]
pub struct EngineMetrics {
    jobs: QueueMetrics,
    monitor: QueueMetrics,
    webhooks: QueueMetrics,
    notify: QueueMetrics,
}

impl EngineMetrics {
    /// Create zeroed metrics
    pub fn new() -> Self {
        Self::default()
    }

    /// Counters for one stream
    pub fn queue(&self, name: QueueName) -> &QueueMetrics {
        match name {
            QueueName::Jobs => &self.jobs,
            QueueName::Monitor => &self.monitor,
            QueueName::Webhooks => &self.webhooks,
            QueueName::Notify => &self.notify,
        }
    }

    /// Snapshot for the health endpoint
    pub fn snapshot(&self) -> MetricsSummary {
        let per_queue = QueueName::all()
            .iter()
            .map(|name| {
                let metrics = self.queue(*name);
                QueueSummary {
                    queue: name.as_str(),
                    in_flight: metrics.in_flight(),
                    processed: metrics.processed(),
                    failed: metrics.failed(),
                }
            })
            .collect();
        MetricsSummary { queues: per_queue }
    }
}

/// Point-in-time counters for one stream
#[derive(Debug, Clone, Serialize)]
pub struct QueueSummary {
    /// Stream name
    pub queue: &'static str,

    /// Messages currently being handled
    pub in_flight: u64,

    /// Messages handled successfully
    pub processed: u64,

    /// Messages whose handler failed
    pub failed: u64,
}

/// Point-in-time engine counters
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    /// Per-stream counters
    pub queues: Vec<QueueSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gauge_tracks_in_flight() {
        let metrics = EngineMetrics::new();
        let jobs = metrics.queue(QueueName::Jobs);

        jobs.message_started();
        jobs.message_started();
        assert_eq!(jobs.in_flight(), 2);

        jobs.message_finished(true);
        jobs.message_finished(false);
        assert_eq!(jobs.in_flight(), 0);
        assert_eq!(jobs.processed(), 1);
        assert_eq!(jobs.failed(), 1);
    }

    #[test]
    fn test_snapshot_covers_all_queues() {
        let metrics = EngineMetrics::new();
        let summary = metrics.snapshot();
        assert_eq!(summary.queues.len(), 4);
    }
}
