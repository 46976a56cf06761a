//! Long-lived consumer loop with manual acknowledgment.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use flowboard_common::Decode;

use super::MessageBus;
use crate::config::BusConfig;

/// Receives decoded messages from [`run_consumer`]. Returning an error
/// requeues the message for another attempt.
#[async_trait]
pub trait Handler<M>: Send + Sync {
    async fn handle(&self, message: M) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub poll_interval: Duration,
    pub retry_base: Duration,
    pub retry_max: Duration,
}

impl ConsumerConfig {
    pub fn from_bus_config(config: &BusConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            retry_base: config.retry_base(),
            retry_max: config.retry_max(),
        }
    }

    /// Delay after the `failures`-th consecutive handler failure: doubles from
    /// `retry_base`, capped at `retry_max`.
    pub fn backoff(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.saturating_sub(1));
        self.retry_base.saturating_mul(factor).min(self.retry_max)
    }
}

/// Counters reported when a consumer stops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub acked: u64,
    pub requeued: u64,
    pub discarded: u64,
}

/// Consume `queue` until `shutdown` is cancelled.
///
/// Each delivery is decoded once. Undecodable bodies are rejected without
/// requeue so they cannot block the queue. A handler error requeues the
/// message and backs off before the next fetch. Cancellation is checked
/// between deliveries; a handler already running is allowed to finish.
pub async fn run_consumer<M, H>(
    bus: Arc<dyn MessageBus>,
    queue: &str,
    handler: Arc<H>,
    config: ConsumerConfig,
    shutdown: CancellationToken,
) -> ConsumerStats
where
    M: Decode + Send,
    H: Handler<M> + ?Sized,
{
    let mut stats = ConsumerStats::default();
    let mut failures: u32 = 0;
    tracing::info!(%queue, "consumer started");

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        let delivery = match bus.fetch(queue).await {
            Ok(Some(delivery)) => delivery,
            Ok(None) => {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = bus.published() => {}
                    _ = tokio::time::sleep(config.poll_interval) => {}
                }
                continue;
            }
            Err(e) => {
                failures += 1;
                let delay = config.backoff(failures);
                tracing::warn!(%queue, error = %e, delay_ms = delay.as_millis() as u64, "fetch failed, backing off");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                continue;
            }
        };
        let tag = delivery.tag;

        let message = match M::decode(&delivery.body) {
            Ok(message) => message,
            Err(e) => {
                tracing::error!(
                    %queue,
                    delivery_tag = tag,
                    message_id = %delivery.message_id,
                    error = %e,
                    "data-quality error: discarding undecodable message"
                );
                if let Err(e) = bus.nack(tag, false).await {
                    tracing::warn!(delivery_tag = tag, error = %e, "failed to reject message");
                }
                stats.discarded += 1;
                continue;
            }
        };

        match handler.handle(message).await {
            Ok(()) => {
                failures = 0;
                match bus.ack(tag).await {
                    Ok(()) => stats.acked += 1,
                    Err(e) => tracing::warn!(delivery_tag = tag, error = %e, "failed to ack message"),
                }
            }
            Err(e) => {
                failures += 1;
                let delay = config.backoff(failures);
                tracing::warn!(
                    %queue,
                    delivery_tag = tag,
                    deliveries = delivery.delivery_count,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "handler failed, requeueing"
                );
                match bus.nack(tag, true).await {
                    Ok(()) => stats.requeued += 1,
                    Err(e) => tracing::warn!(delivery_tag = tag, error = %e, "failed to requeue message"),
                }
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    tracing::info!(
        %queue,
        acked = stats.acked,
        requeued = stats.requeued,
        discarded = stats.discarded,
        "consumer stopped"
    );
    stats
}
