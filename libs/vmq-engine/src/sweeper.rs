use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::broker::Broker;
use crate::log::TruncateOutcome;

/// Background task driving lease expiry, delayed delivery and eviction of
/// silent members.
///
/// Sleeps until the earliest pending timer, capped at `sweep_interval_ms`,
/// and wakes early when a sooner timer is scheduled.
pub fn spawn_sweeper(broker: Arc<Broker>, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = Duration::from_millis(broker.config().sweep_interval_ms);
        tracing::info!(interval_ms = broker.config().sweep_interval_ms, "sweeper started");
        loop {
            let wait = match broker.next_timer_due() {
                Some(due) => Duration::from_millis(due.saturating_sub(broker.now_ms())).min(interval),
                None => interval,
            };
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = broker.timer_changed().notified() => continue,
                _ = tokio::time::sleep(wait) => {}
            }
            broker.sweep();
        }
        tracing::info!("sweeper stopped");
    })
}

/// Periodic retention pass. `None` when no retention limit is configured.
pub fn spawn_retention(broker: Arc<Broker>, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
    if !broker.config().retention.enabled() {
        return None;
    }
    Some(tokio::spawn(async move {
        let interval = Duration::from_millis(broker.config().retention.interval_ms);
        tracing::info!(interval_ms = broker.config().retention.interval_ms, "retention started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            let worker = broker.clone();
            match tokio::task::spawn_blocking(move || worker.apply_retention()).await {
                Ok(outcomes) => {
                    let truncated = outcomes
                        .iter()
                        .filter(|(_, o)| matches!(o, TruncateOutcome::Truncated { .. }))
                        .count();
                    if !outcomes.is_empty() {
                        tracing::info!(partitions = outcomes.len(), truncated, "retention pass");
                    }
                }
                Err(e) => tracing::error!(error = %e, "retention task failed"),
            }
        }
        tracing::info!("retention stopped");
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmq_api::{ManualClock, NewRecord, NoopMetrics};
    use vmq_storage_memory::MemoryStorage;

    use crate::config::BrokerConfig;

    #[tokio::test]
    async fn sweeper_stops_on_cancel() {
        let broker = Arc::new(
            Broker::open(
                BrokerConfig::default(),
                Arc::new(MemoryStorage::default()),
                Arc::new(ManualClock::new(0)),
                Arc::new(NoopMetrics),
            )
            .unwrap(),
        );
        let token = CancellationToken::new();
        let handle = spawn_sweeper(broker.clone(), token.clone());
        assert!(spawn_retention(broker.clone(), token.clone()).is_none());

        broker.publish("t", NewRecord::new(b"x".to_vec())).unwrap();
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
