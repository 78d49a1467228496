use std::collections::{HashMap, VecDeque};

use prechat_agent::AssistantReply;
use tokio::sync::Mutex;
use tracing::warn;

/// Replies produced off the request path (timer-flushed batches), held until the
/// transport collects them for their sender.
pub struct Outbox {
    per_sender_capacity: usize,
    pending: Mutex<HashMap<String, VecDeque<AssistantReply>>>,
}

impl Outbox {
    pub fn new(per_sender_capacity: usize) -> Self {
        Self { per_sender_capacity: per_sender_capacity.max(1), pending: Mutex::new(HashMap::new()) }
    }

    pub async fn push(&self, reply: AssistantReply) {
        let mut pending = self.pending.lock().await;
        let queue = pending.entry(reply.sender.clone()).or_default();
        if queue.len() >= self.per_sender_capacity {
            if let Some(dropped) = queue.pop_front() {
                warn!(
                    event_name = "server.outbox.overflow",
                    sender = %dropped.sender,
                    decision = dropped.decision,
                    "outbox full; oldest undelivered reply dropped"
                );
            }
        }
        queue.push_back(reply);
    }

    pub async fn drain(&self, sender: &str) -> Vec<AssistantReply> {
        self.pending.lock().await.remove(sender).map(Vec::from).unwrap_or_default()
    }

    pub async fn len(&self) -> usize {
        self.pending.lock().await.values().map(VecDeque::len).sum()
    }
}
