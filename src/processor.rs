//! Event processor: turns pending events into delivery rows.
//!
//! A poll loop claims batches of `status = pending` events oldest-first,
//! asks the matcher for the receiving subscriptions, and inserts one
//! delivery row per match — all rows for one event inside the batch
//! transaction. Events with no matches complete immediately as `delivered`.
//!
//! The loop reads the durable store directly, which doubles as the
//! catch-up scan: an event whose fast-store enqueue was lost is still
//! picked up here.

use std::time::Duration;

use metrics::counter;
use sqlx::{PgConnection, PgPool};
use tokio_util::sync::CancellationToken;

use crate::config::ProcessorConfig;
use crate::db::handlers::{Deliveries, Events, Subscriptions};
use crate::db::models::deliveries::DeliveryCreateDBRequest;
use crate::db::models::events::Event;
use crate::db::models::subscriptions::Subscription;
use crate::matcher;
use crate::types;

/// Back-off after an unexpected loop error.
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

pub struct EventProcessor {
    pool: PgPool,
    config: ProcessorConfig,
}

impl EventProcessor {
    pub fn new(pool: PgPool, config: ProcessorConfig) -> Self {
        Self { pool, config }
    }

    /// Poll loop; exits on shutdown.
    pub async fn run(self, shutdown: CancellationToken) {
        let poll = Duration::from_millis(self.config.poll_interval_ms);
        tracing::info!(
            poll_ms = self.config.poll_interval_ms,
            batch_size = self.config.batch_size,
            "event processor started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("event processor shutting down");
                    return;
                }
                _ = tokio::time::sleep(poll) => {
                    match self.process_batch().await {
                        Ok(0) => {}
                        Ok(count) => {
                            tracing::debug!(count, "processed pending events");
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "event processor batch failed");
                            tokio::time::sleep(ERROR_BACKOFF).await;
                        }
                    }
                }
            }
        }
    }

    /// Claim and fan out one batch. Returns how many events were handled.
    pub async fn process_batch(&self) -> anyhow::Result<usize> {
        let mut tx = self.pool.begin().await?;

        let events = {
            let mut repo = Events::new(&mut tx);
            repo.claim_pending(self.config.batch_size).await?
        };

        if events.is_empty() {
            tx.commit().await?;
            return Ok(0);
        }

        let subscriptions = {
            let mut repo = Subscriptions::new(&mut tx);
            repo.list_active_healthy().await?
        };

        for event in &events {
            if let Err(e) = fan_out(&mut tx, event, &subscriptions).await {
                tracing::warn!(event_id = %event.id, error = %e, "fan-out failed, marking event failed");
                let mut repo = Events::new(&mut tx);
                repo.mark_failed(&event.id, &e.to_string()).await?;
            }
        }

        tx.commit().await?;
        counter!("fanout_events_processed_total").increment(events.len() as u64);

        Ok(events.len())
    }
}

/// Create delivery rows for every matching subscription and advance the
/// event status.
async fn fan_out(
    conn: &mut PgConnection,
    event: &Event,
    subscriptions: &[Subscription],
) -> crate::db::errors::Result<()> {
    let matches: Vec<&Subscription> = subscriptions
        .iter()
        .filter(|s| matcher::subscription_matches(s, &event.event_type, &event.source))
        .collect();

    if matches.is_empty() {
        tracing::debug!(event_id = %event.id, "no matching subscriptions");
        let mut repo = Events::new(&mut *conn);
        repo.mark_delivered_no_matches(&event.id).await?;
        return Ok(());
    }

    for subscription in &matches {
        let mut repo = Deliveries::new(&mut *conn);
        repo.create(&DeliveryCreateDBRequest {
            id: types::delivery_id(),
            event_id: event.id.clone(),
            subscription_id: subscription.id.clone(),
            max_attempts: subscription.max_retries + 1,
            request_url: subscription.target_url.clone(),
        })
        .await?;
    }

    let mut repo = Events::new(&mut *conn);
    repo.mark_processing(&event.id, matches.len() as i32).await?;

    counter!("fanout_deliveries_created_total").increment(matches.len() as u64);
    tracing::debug!(
        event_id = %event.id,
        deliveries = matches.len(),
        "created deliveries for event"
    );

    Ok(())
}
