use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::admission::{forget, persist, restore_all, seconds};
use crate::clock::Clock;
use crate::config::CoalescingConfig;
use crate::domain::SenderId;
use crate::storage::StateStore;

pub const NAMESPACE: &str = "coalescing";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingMessage {
    pub text: String,
    pub arrived_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoalescingGroup {
    pub sender: SenderId,
    pub pending: Vec<PendingMessage>,
    pub last_update: DateTime<Utc>,
}

/// Messages from one sender merged into a single prompt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CoalescedBatch {
    pub sender: SenderId,
    pub merged: String,
    pub message_count: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CoalescerStats {
    pub active_groups: usize,
    pub pending_messages: usize,
}

pub struct MessageCoalescer {
    config: CoalescingConfig,
    clock: Arc<dyn Clock>,
    store: Arc<dyn StateStore>,
    groups: Mutex<HashMap<SenderId, CoalescingGroup>>,
}

impl MessageCoalescer {
    pub async fn restore(
        config: CoalescingConfig,
        clock: Arc<dyn Clock>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        let groups = restore_all::<CoalescingGroup>(store.as_ref(), NAMESPACE)
            .await
            .into_iter()
            .map(|(_, group)| (group.sender.clone(), group))
            .collect();
        Self { config, clock, store, groups: Mutex::new(groups) }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    fn merge(&self, sender: SenderId, pending: &[PendingMessage]) -> CoalescedBatch {
        let merged = pending
            .iter()
            .map(|message| message.text.as_str())
            .collect::<Vec<_>>()
            .join(&self.config.delimiter);
        CoalescedBatch { sender, merged, message_count: pending.len() }
    }

    /// Adds a message to the sender's group. Returns the merged text when the group
    /// flushes on this arrival, `None` while it keeps waiting.
    pub async fn accumulate(&self, sender: &SenderId, text: &str) -> Option<String> {
        let now = self.clock.now();
        let window = seconds(self.config.window_secs);
        let mut groups = self.groups.lock().await;

        let group = groups.entry(sender.clone()).or_insert_with(|| CoalescingGroup {
            sender: sender.clone(),
            pending: Vec::new(),
            last_update: now,
        });
        let idle_for = now - group.last_update;
        group.pending.push(PendingMessage { text: text.to_string(), arrived_at: now });
        group.last_update = now;

        let before = group.pending.len();
        group.pending.retain(|message| now - message.arrived_at <= window);
        if group.pending.len() < before {
            debug!(
                event_name = "admission.coalescing.expired_dropped",
                sender = %sender,
                dropped = before - group.pending.len(),
                "dropped pending messages older than the coalescing window"
            );
        }

        let full = group.pending.len() >= self.config.max_batch;
        let window_elapsed = idle_for >= window;
        if full || window_elapsed {
            let batch = self.merge(sender.clone(), &group.pending);
            groups.remove(sender);
            forget(self.store.as_ref(), NAMESPACE, sender.as_str()).await;
            info!(
                event_name = "admission.coalescing.flushed",
                sender = %sender,
                message_count = batch.message_count,
                trigger = if full { "max_batch" } else { "window" },
                "coalesced messages flushed"
            );
            return Some(batch.merged);
        }

        persist(self.store.as_ref(), NAMESPACE, sender.as_str(), &*group).await;
        None
    }

    /// Flushes every group idle for at least one window.
    pub async fn drain_due(&self) -> Vec<CoalescedBatch> {
        let now = self.clock.now();
        let window = seconds(self.config.window_secs);
        let mut groups = self.groups.lock().await;

        let due: Vec<SenderId> = groups
            .values()
            .filter(|group| now - group.last_update >= window)
            .map(|group| group.sender.clone())
            .collect();

        let mut batches = Vec::with_capacity(due.len());
        for sender in due {
            if let Some(group) = groups.remove(&sender) {
                forget(self.store.as_ref(), NAMESPACE, sender.as_str()).await;
                if group.pending.is_empty() {
                    continue;
                }
                info!(
                    event_name = "admission.coalescing.flushed",
                    sender = %sender,
                    message_count = group.pending.len(),
                    trigger = "timer",
                    "coalesced messages flushed"
                );
                batches.push(self.merge(sender, &group.pending));
            }
        }
        batches
    }

    /// Drops groups idle for two windows or more. Returns how many were removed.
    pub async fn sweep_stale(&self) -> usize {
        let now = self.clock.now();
        let stale_after = seconds(self.config.window_secs) * 2;
        let mut groups = self.groups.lock().await;

        let stale: Vec<SenderId> = groups
            .values()
            .filter(|group| now - group.last_update >= stale_after)
            .map(|group| group.sender.clone())
            .collect();
        for sender in &stale {
            groups.remove(sender);
            forget(self.store.as_ref(), NAMESPACE, sender.as_str()).await;
        }
        stale.len()
    }

    pub async fn stats(&self) -> CoalescerStats {
        let groups = self.groups.lock().await;
        CoalescerStats {
            active_groups: groups.len(),
            pending_messages: groups.values().map(|group| group.pending.len()).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, TimeZone, Utc};

    use super::{MessageCoalescer, NAMESPACE};
    use crate::clock::ManualClock;
    use crate::config::CoalescingConfig;
    use crate::domain::SenderId;
    use crate::storage::{InMemoryStateStore, StateStore};

    fn clock() -> ManualClock {
        ManualClock::new(Utc.with_ymd_and_hms(2026, 6, 1, 15, 0, 0).single().expect("timestamp"))
    }

    fn sender(raw: &str) -> SenderId {
        SenderId::parse(raw).expect("valid sender")
    }

    async fn coalescer(clock: &ManualClock, store: Arc<dyn StateStore>) -> MessageCoalescer {
        MessageCoalescer::restore(CoalescingConfig::default(), Arc::new(clock.clone()), store).await
    }

    #[tokio::test]
    async fn max_batch_messages_flush_once_in_arrival_order() {
        let clock = clock();
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        let coalescer = coalescer(&clock, Arc::clone(&store)).await;
        let alice = sender("5511900000001");

        let mut flushed = Vec::new();
        for text in ["oi", "tudo bem?", "quero saber", "o preço", "do plano"] {
            clock.advance(Duration::seconds(2));
            if let Some(merged) = coalescer.accumulate(&alice, text).await {
                flushed.push(merged);
            }
        }

        assert_eq!(flushed, vec!["oi | tudo bem? | quero saber | o preço | do plano".to_string()]);
        assert_eq!(coalescer.stats().await.active_groups, 0);
        assert!(store.load(NAMESPACE, alice.as_str()).await.expect("load").is_none());
    }

    #[tokio::test]
    async fn message_after_window_flushes_the_waiting_group_lazily() {
        let clock = clock();
        let coalescer = coalescer(&clock, Arc::new(InMemoryStateStore::new())).await;
        let bob = sender("5511900000002");

        assert_eq!(coalescer.accumulate(&bob, "primeira").await, None);
        clock.advance(Duration::seconds(30));
        assert_eq!(coalescer.accumulate(&bob, "segunda").await.as_deref(), Some("primeira | segunda"));
    }

    #[tokio::test]
    async fn timer_drain_flushes_a_stranded_group() {
        let clock = clock();
        let coalescer = coalescer(&clock, Arc::new(InMemoryStateStore::new())).await;
        let carol = sender("5511900000003");

        assert_eq!(coalescer.accumulate(&carol, "alguém aí?").await, None);
        clock.advance(Duration::seconds(29));
        assert!(coalescer.drain_due().await.is_empty());

        clock.advance(Duration::seconds(1));
        let batches = coalescer.drain_due().await;
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].sender, carol);
        assert_eq!(batches[0].merged, "alguém aí?");
        assert_eq!(batches[0].message_count, 1);
        assert!(coalescer.drain_due().await.is_empty());
    }

    #[tokio::test]
    async fn messages_older_than_the_window_are_dropped_before_merging() {
        let clock = clock();
        let coalescer = coalescer(&clock, Arc::new(InMemoryStateStore::new())).await;
        let dave = sender("5511900000004");

        assert_eq!(coalescer.accumulate(&dave, "old").await, None);
        clock.advance(Duration::seconds(45));
        assert_eq!(coalescer.accumulate(&dave, "new").await.as_deref(), Some("new"));
        assert_eq!(coalescer.stats().await.active_groups, 0);
    }

    #[tokio::test]
    async fn sweep_removes_only_groups_idle_for_two_windows() {
        let clock = clock();
        let coalescer = coalescer(&clock, Arc::new(InMemoryStateStore::new())).await;

        coalescer.accumulate(&sender("a"), "x").await;
        clock.advance(Duration::seconds(45));
        coalescer.accumulate(&sender("b"), "y").await;
        clock.advance(Duration::seconds(15));

        assert_eq!(coalescer.sweep_stale().await, 1);
        let stats = coalescer.stats().await;
        assert_eq!(stats.active_groups, 1);
        assert_eq!(stats.pending_messages, 1);
    }

    #[tokio::test]
    async fn pending_groups_are_restored_after_restart() {
        let clock = clock();
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        let erin = sender("5511900000005");

        coalescer(&clock, Arc::clone(&store)).await.accumulate(&erin, "um").await;
        let restarted = coalescer(&clock, Arc::clone(&store)).await;
        clock.advance(Duration::seconds(5));
        restarted.accumulate(&erin, "dois").await;
        restarted.accumulate(&erin, "três").await;
        restarted.accumulate(&erin, "quatro").await;

        assert_eq!(
            restarted.accumulate(&erin, "cinco").await.as_deref(),
            Some("um | dois | três | quatro | cinco")
        );
    }

    #[tokio::test]
    async fn shrinking_max_batch_flushes_overflowing_group_immediately() {
        let clock = clock();
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        let frank = sender("5511900000006");

        let wide = CoalescingConfig { max_batch: 10, ..CoalescingConfig::default() };
        let first = MessageCoalescer::restore(wide, Arc::new(clock.clone()), Arc::clone(&store)).await;
        for text in ["1", "2", "3", "4"] {
            assert_eq!(first.accumulate(&frank, text).await, None);
        }

        let narrow = CoalescingConfig { max_batch: 3, ..CoalescingConfig::default() };
        let second = MessageCoalescer::restore(narrow, Arc::new(clock.clone()), store).await;
        assert_eq!(second.accumulate(&frank, "5").await.as_deref(), Some("1 | 2 | 3 | 4 | 5"));
    }
}
