//! Component health probes and aggregate metrics.
//!
//! Latency classification: the durable store is healthy up to one second
//! round-trip, the fast store up to 100 ms; errors are unhealthy. Queue
//! depths degrade at 10 000 (main queue) and 1 000 (DLQ). The same
//! aggregate numbers feed both the structured `/metrics` response and the
//! Prometheus text exposition.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::time::{Duration, Instant};
use tracing::instrument;

use crate::db::errors::DbError;
use crate::db::handlers::{Deliveries, Events, Subscriptions};
use crate::errors::Result;
use crate::queue::FastStore;

const DB_HEALTHY_LATENCY: Duration = Duration::from_secs(1);
const FAST_STORE_HEALTHY_LATENCY: Duration = Duration::from_millis(100);
const QUEUE_DEPTH_DEGRADED: i64 = 10_000;
const DLQ_DEPTH_DEGRADED: i64 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct ComponentHealth {
    pub name: &'static str,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub version: &'static str,
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: f64,
    pub components: Vec<ComponentHealth>,
}

#[derive(Debug, Serialize)]
pub struct ReadinessReport {
    pub ready: bool,
    pub checks: HashMap<&'static str, bool>,
}

/// Aggregate counters for `/metrics`, in both JSON and Prometheus form.
#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub events_by_status: HashMap<String, i64>,
    pub deliveries_by_status: HashMap<String, i64>,
    pub subscriptions_by_status: HashMap<String, i64>,
    pub subscriptions_healthy: i64,
    pub queue_depth: i64,
    pub dlq_depth: i64,
    pub queue_oldest_age_seconds: Option<f64>,
    pub uptime_seconds: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone)]
pub struct HealthService {
    pool: PgPool,
    store: FastStore,
    started_at: Instant,
}

impl HealthService {
    pub fn new(pool: PgPool, store: FastStore, started_at: Instant) -> Self {
        Self {
            pool,
            store,
            started_at,
        }
    }

    fn uptime_seconds(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    /// Full component report.
    #[instrument(skip(self))]
    pub async fn check(&self) -> HealthReport {
        let mut components = vec![self.check_database().await, self.check_fast_store().await];
        components.extend(self.check_queues().await);

        let status = if components.iter().all(|c| c.status == HealthStatus::Healthy) {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };

        HealthReport {
            status,
            version: env!("CARGO_PKG_VERSION"),
            timestamp: Utc::now(),
            uptime_seconds: self.uptime_seconds(),
            components,
        }
    }

    /// Readiness: the durable store must answer; the fast store is
    /// reported but not required.
    #[instrument(skip(self))]
    pub async fn readiness(&self) -> ReadinessReport {
        let mut checks = HashMap::new();

        let db_ok = sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .is_ok();
        checks.insert("database", db_ok);
        checks.insert("fast_store", self.store.ping().await.is_ok());

        ReadinessReport {
            ready: db_ok,
            checks,
        }
    }

    async fn check_database(&self) -> ComponentHealth {
        let start = Instant::now();
        match sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(&self.pool).await {
            Ok(_) => {
                let latency = start.elapsed();
                ComponentHealth {
                    name: "database",
                    status: if latency <= DB_HEALTHY_LATENCY {
                        HealthStatus::Healthy
                    } else {
                        HealthStatus::Degraded
                    },
                    latency_ms: Some(latency.as_secs_f64() * 1000.0),
                    message: None,
                }
            }
            Err(e) => ComponentHealth {
                name: "database",
                status: HealthStatus::Unhealthy,
                latency_ms: None,
                message: Some(e.to_string()),
            },
        }
    }

    async fn check_fast_store(&self) -> ComponentHealth {
        match self.store.ping().await {
            Ok(latency) => ComponentHealth {
                name: "fast_store",
                status: if latency <= FAST_STORE_HEALTHY_LATENCY {
                    HealthStatus::Healthy
                } else {
                    HealthStatus::Degraded
                },
                latency_ms: Some(latency.as_secs_f64() * 1000.0),
                message: None,
            },
            Err(e) => ComponentHealth {
                name: "fast_store",
                status: HealthStatus::Unhealthy,
                latency_ms: None,
                message: Some(e.to_string()),
            },
        }
    }

    async fn check_queues(&self) -> Vec<ComponentHealth> {
        let queue = match self.store.queue_depth().await {
            Ok(depth) => ComponentHealth {
                name: "event_queue",
                status: if depth < QUEUE_DEPTH_DEGRADED {
                    HealthStatus::Healthy
                } else {
                    HealthStatus::Degraded
                },
                latency_ms: None,
                message: Some(format!("depth: {depth}")),
            },
            Err(e) => ComponentHealth {
                name: "event_queue",
                status: HealthStatus::Unhealthy,
                latency_ms: None,
                message: Some(e.to_string()),
            },
        };

        let dlq = match self.store.dlq_depth().await {
            Ok(depth) => ComponentHealth {
                name: "dead_letter_queue",
                status: if depth < DLQ_DEPTH_DEGRADED {
                    HealthStatus::Healthy
                } else {
                    HealthStatus::Degraded
                },
                latency_ms: None,
                message: Some(format!("depth: {depth}")),
            },
            Err(e) => ComponentHealth {
                name: "dead_letter_queue",
                status: HealthStatus::Unhealthy,
                latency_ms: None,
                message: Some(e.to_string()),
            },
        };

        vec![queue, dlq]
    }

    /// Aggregate counters from both stores.
    #[instrument(skip(self), err)]
    pub async fn metrics(&self) -> Result<MetricsSnapshot> {
        let mut conn = self.pool.acquire().await.map_err(DbError::from)?;

        let events_by_status: HashMap<String, i64> = {
            let mut repo = Events::new(&mut conn);
            repo.count_by_status().await?.into_iter().collect()
        };
        let deliveries_by_status: HashMap<String, i64> = {
            let mut repo = Deliveries::new(&mut conn);
            repo.count_by_status().await?.into_iter().collect()
        };
        let (subscriptions_by_status, subscriptions_healthy) = {
            let mut repo = Subscriptions::new(&mut conn);
            let by_status: HashMap<String, i64> =
                repo.count_by_status().await?.into_iter().collect();
            let healthy = repo.count_healthy().await?;
            (by_status, healthy)
        };
        drop(conn);

        let queue_depth = self.store.queue_depth().await.unwrap_or(0);
        let dlq_depth = self.store.dlq_depth().await.unwrap_or(0);
        let queue_oldest_age_seconds = self.store.oldest_queue_item_age().await.unwrap_or(None);

        Ok(MetricsSnapshot {
            events_by_status,
            deliveries_by_status,
            subscriptions_by_status,
            subscriptions_healthy,
            queue_depth,
            dlq_depth,
            queue_oldest_age_seconds,
            uptime_seconds: self.uptime_seconds(),
            timestamp: Utc::now(),
        })
    }
}

/// Render a snapshot as Prometheus text exposition. The numbers are the
/// same ones served as JSON.
pub fn prometheus_text(snapshot: &MetricsSnapshot) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "# HELP fanout_events_total Events by status");
    let _ = writeln!(out, "# TYPE fanout_events_total gauge");
    for (status, count) in sorted(&snapshot.events_by_status) {
        let _ = writeln!(out, "fanout_events_total{{status=\"{status}\"}} {count}");
    }

    let _ = writeln!(out, "# HELP fanout_deliveries_total Deliveries by status");
    let _ = writeln!(out, "# TYPE fanout_deliveries_total gauge");
    for (status, count) in sorted(&snapshot.deliveries_by_status) {
        let _ = writeln!(out, "fanout_deliveries_total{{status=\"{status}\"}} {count}");
    }

    let _ = writeln!(out, "# HELP fanout_subscriptions_total Subscriptions by status");
    let _ = writeln!(out, "# TYPE fanout_subscriptions_total gauge");
    for (status, count) in sorted(&snapshot.subscriptions_by_status) {
        let _ = writeln!(out, "fanout_subscriptions_total{{status=\"{status}\"}} {count}");
    }

    let _ = writeln!(out, "# HELP fanout_subscriptions_healthy Healthy subscriptions");
    let _ = writeln!(out, "# TYPE fanout_subscriptions_healthy gauge");
    let _ = writeln!(out, "fanout_subscriptions_healthy {}", snapshot.subscriptions_healthy);

    let _ = writeln!(out, "# HELP fanout_queue_depth Events waiting on the queue");
    let _ = writeln!(out, "# TYPE fanout_queue_depth gauge");
    let _ = writeln!(out, "fanout_queue_depth {}", snapshot.queue_depth);

    let _ = writeln!(out, "# HELP fanout_dlq_depth Dead-letter queue depth");
    let _ = writeln!(out, "# TYPE fanout_dlq_depth gauge");
    let _ = writeln!(out, "fanout_dlq_depth {}", snapshot.dlq_depth);

    if let Some(age) = snapshot.queue_oldest_age_seconds {
        let _ = writeln!(out, "# HELP fanout_queue_oldest_age_seconds Age of the oldest queued event");
        let _ = writeln!(out, "# TYPE fanout_queue_oldest_age_seconds gauge");
        let _ = writeln!(out, "fanout_queue_oldest_age_seconds {age}");
    }

    let _ = writeln!(out, "# HELP fanout_uptime_seconds Process uptime");
    let _ = writeln!(out, "# TYPE fanout_uptime_seconds gauge");
    let _ = writeln!(out, "fanout_uptime_seconds {}", snapshot.uptime_seconds);

    out
}

fn sorted(map: &HashMap<String, i64>) -> Vec<(&String, &i64)> {
    let mut entries: Vec<_> = map.iter().collect();
    entries.sort_by_key(|(k, _)| k.as_str());
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prometheus_rendering() {
        let snapshot = MetricsSnapshot {
            events_by_status: HashMap::from([
                ("pending".to_string(), 3),
                ("delivered".to_string(), 7),
            ]),
            deliveries_by_status: HashMap::from([("retrying".to_string(), 2)]),
            subscriptions_by_status: HashMap::from([("active".to_string(), 4)]),
            subscriptions_healthy: 4,
            queue_depth: 3,
            dlq_depth: 1,
            queue_oldest_age_seconds: Some(12.5),
            uptime_seconds: 99.0,
            timestamp: Utc::now(),
        };

        let text = prometheus_text(&snapshot);
        assert!(text.contains("fanout_events_total{status=\"pending\"} 3"));
        assert!(text.contains("fanout_events_total{status=\"delivered\"} 7"));
        assert!(text.contains("fanout_deliveries_total{status=\"retrying\"} 2"));
        assert!(text.contains("fanout_subscriptions_total{status=\"active\"} 4"));
        assert!(text.contains("fanout_queue_depth 3"));
        assert!(text.contains("fanout_dlq_depth 1"));
        assert!(text.contains("fanout_queue_oldest_age_seconds 12.5"));
        assert!(text.contains("fanout_uptime_seconds 99"));
    }

    #[test]
    fn test_prometheus_omits_missing_queue_age() {
        let snapshot = MetricsSnapshot {
            events_by_status: HashMap::new(),
            deliveries_by_status: HashMap::new(),
            subscriptions_by_status: HashMap::new(),
            subscriptions_healthy: 0,
            queue_depth: 0,
            dlq_depth: 0,
            queue_oldest_age_seconds: None,
            uptime_seconds: 1.0,
            timestamp: Utc::now(),
        };
        let text = prometheus_text(&snapshot);
        assert!(!text.contains("fanout_queue_oldest_age_seconds"));
    }
}
