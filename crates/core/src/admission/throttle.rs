use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

use crate::admission::window::Calendar;
use crate::admission::{forget, persist, restore_all, seconds};
use crate::clock::Clock;
use crate::config::ThrottleConfig;
use crate::domain::{IntentSource, PurchaseIntent, SenderId};
use crate::storage::StateStore;

pub const NAMESPACE: &str = "user_state";

/// Senders at or above this share of their ceiling are reported as near the limit.
const NEAR_LIMIT_PCT: u32 = 80;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    EscalatedToHuman,
    PurchaseDecided,
    Manual,
}

impl BlockReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EscalatedToHuman => "escalated_to_human",
            Self::PurchaseDecided => "purchase_decided",
            Self::Manual => "manual",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserState {
    pub sender: SenderId,
    pub response_count: u32,
    pub count_day: NaiveDate,
    pub last_seen: DateTime<Utc>,
    pub blocked_until: Option<DateTime<Utc>>,
    pub block_reason: Option<BlockReason>,
    pub blocked_at: Option<DateTime<Utc>>,
}

impl UserState {
    fn new(sender: SenderId, now: DateTime<Utc>, calendar: &Calendar) -> Self {
        Self {
            sender,
            response_count: 0,
            count_day: calendar.day(now),
            last_seen: now,
            blocked_until: None,
            block_reason: None,
            blocked_at: None,
        }
    }

    pub fn is_blocked(&self, now: DateTime<Utc>) -> bool {
        self.blocked_until.is_some_and(|until| now < until)
    }
}

/// Applies the lazy rules: a new calendar day zeroes the counter and an elapsed
/// block is cleared.
pub fn normalize_user_state(mut state: UserState, now: DateTime<Utc>, calendar: &Calendar) -> UserState {
    let today = calendar.day(now);
    if state.count_day != today {
        state.response_count = 0;
        state.count_day = today;
    }
    if state.blocked_until.is_some_and(|until| until <= now) {
        state.blocked_until = None;
        state.block_reason = None;
        state.blocked_at = None;
    }
    state
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ThrottleDecision {
    Allowed,
    Blocked { reason: BlockReason, remaining: Duration },
    LimitReached { count: u32, ceiling: u32 },
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub removed: usize,
    pub expired_blocks: usize,
    pub remaining: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ThrottleStats {
    pub tracked_senders: usize,
    pub blocked_senders: usize,
    pub responses_today: u64,
    pub senders_at_limit: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NearLimitSender {
    pub sender: SenderId,
    pub response_count: u32,
    pub ceiling: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BlockedSender {
    pub sender: SenderId,
    pub reason: Option<BlockReason>,
    pub blocked_until: DateTime<Utc>,
}

pub struct UserThrottle {
    config: ThrottleConfig,
    calendar: Calendar,
    clock: Arc<dyn Clock>,
    store: Arc<dyn StateStore>,
    users: Mutex<HashMap<SenderId, UserState>>,
}

impl UserThrottle {
    pub async fn restore(
        config: ThrottleConfig,
        calendar: Calendar,
        clock: Arc<dyn Clock>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        let users = restore_all::<UserState>(store.as_ref(), NAMESPACE)
            .await
            .into_iter()
            .map(|(_, state)| (state.sender.clone(), state))
            .collect();
        Self { config, calendar, clock, store, users: Mutex::new(users) }
    }

    pub fn ceiling_for(&self, intent: Option<PurchaseIntent>) -> u32 {
        let bonus = match intent {
            Some(PurchaseIntent::Interested) if self.config.shopping_bonus_enabled => {
                self.config.shopping_bonus
            }
            _ => 0,
        };
        self.config.max_responses_per_day.saturating_add(bonus)
    }

    /// Normalizes the stored state in place and persists it when normalization
    /// changed something.
    async fn normalized(
        &self,
        users: &mut HashMap<SenderId, UserState>,
        sender: &SenderId,
        now: DateTime<Utc>,
    ) -> Option<UserState> {
        let current = users.get(sender)?.clone();
        let normalized = normalize_user_state(current.clone(), now, &self.calendar);
        if normalized != current {
            if current.blocked_until.is_some() && normalized.blocked_until.is_none() {
                info!(
                    event_name = "admission.throttle.block_expired",
                    sender = %sender,
                    "sender block expired"
                );
            }
            users.insert(sender.clone(), normalized.clone());
            persist(self.store.as_ref(), NAMESPACE, sender.as_str(), &normalized).await;
        }
        Some(normalized)
    }

    pub async fn can_respond(&self, sender: &SenderId, intent: Option<PurchaseIntent>) -> ThrottleDecision {
        let now = self.clock.now();
        let mut users = self.users.lock().await;
        let Some(mut state) = self.normalized(&mut users, sender, now).await else {
            return ThrottleDecision::Allowed;
        };
        if state.last_seen < now {
            state.last_seen = now;
            persist(self.store.as_ref(), NAMESPACE, sender.as_str(), &state).await;
            users.insert(sender.clone(), state.clone());
        }

        if let Some(until) = state.blocked_until.filter(|until| now < *until) {
            info!(
                event_name = "admission.throttle.blocked",
                sender = %sender,
                reason = state.block_reason.map(BlockReason::as_str).unwrap_or("unknown"),
                "blocked sender attempted contact"
            );
            return ThrottleDecision::Blocked {
                reason: state.block_reason.unwrap_or(BlockReason::Manual),
                remaining: until - now,
            };
        }

        if !self.config.enabled {
            return ThrottleDecision::Allowed;
        }

        let ceiling = self.ceiling_for(intent);
        if state.response_count >= ceiling {
            info!(
                event_name = "admission.throttle.limit_reached",
                sender = %sender,
                count = state.response_count,
                ceiling,
                intent = intent.map(PurchaseIntent::as_str).unwrap_or("unknown"),
                "sender reached daily automated reply ceiling"
            );
            return ThrottleDecision::LimitReached { count: state.response_count, ceiling };
        }

        ThrottleDecision::Allowed
    }

    /// Counts one delivered automated reply for today.
    pub async fn record_response(&self, sender: &SenderId) -> u32 {
        let now = self.clock.now();
        let mut users = self.users.lock().await;
        let mut state = match self.normalized(&mut users, sender, now).await {
            Some(state) => state,
            None => UserState::new(sender.clone(), now, &self.calendar),
        };

        state.response_count = state.response_count.saturating_add(1);
        state.last_seen = now;
        let count = state.response_count;

        persist(self.store.as_ref(), NAMESPACE, sender.as_str(), &state).await;
        users.insert(sender.clone(), state);
        count
    }

    pub async fn block(&self, sender: &SenderId, reason: BlockReason) -> DateTime<Utc> {
        let now = self.clock.now();
        let until = now
            .checked_add_signed(seconds(self.config.block_duration_secs))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let mut users = self.users.lock().await;
        let mut state = match self.normalized(&mut users, sender, now).await {
            Some(state) => state,
            None => UserState::new(sender.clone(), now, &self.calendar),
        };

        state.blocked_until = Some(until);
        state.block_reason = Some(reason);
        state.blocked_at = Some(now);
        state.last_seen = now;

        persist(self.store.as_ref(), NAMESPACE, sender.as_str(), &state).await;
        users.insert(sender.clone(), state);
        info!(
            event_name = "admission.throttle.sender_blocked",
            sender = %sender,
            reason = reason.as_str(),
            blocked_until = %until.to_rfc3339(),
            "sender blocked from automated replies"
        );
        until
    }

    /// Menu selection and classifier detection both end in the same handoff block.
    pub async fn record_purchase_decision(&self, sender: &SenderId, source: IntentSource) -> DateTime<Utc> {
        info!(
            event_name = "admission.throttle.purchase_decided",
            sender = %sender,
            source = source.as_str(),
            "purchase decision detected; handing sender over to sales"
        );
        self.block(sender, BlockReason::PurchaseDecided).await
    }

    pub async fn unblock(&self, sender: &SenderId) -> bool {
        let now = self.clock.now();
        let mut users = self.users.lock().await;
        let Some(mut state) = self.normalized(&mut users, sender, now).await else {
            return false;
        };
        if state.blocked_until.is_none() {
            return false;
        }

        state.blocked_until = None;
        state.block_reason = None;
        state.blocked_at = None;
        state.last_seen = now;
        persist(self.store.as_ref(), NAMESPACE, sender.as_str(), &state).await;
        users.insert(sender.clone(), state);
        info!(event_name = "admission.throttle.unblocked", sender = %sender, "sender unblocked by operator");
        true
    }

    pub async fn remaining_block_time(&self, sender: &SenderId) -> Duration {
        let now = self.clock.now();
        let mut users = self.users.lock().await;
        self.normalized(&mut users, sender, now)
            .await
            .and_then(|state| state.blocked_until)
            .map(|until| (until - now).max(Duration::zero()))
            .unwrap_or_else(Duration::zero)
    }

    pub async fn reset_counter(&self, sender: &SenderId) -> bool {
        let now = self.clock.now();
        let mut users = self.users.lock().await;
        let Some(mut state) = self.normalized(&mut users, sender, now).await else {
            return false;
        };
        state.response_count = 0;
        state.last_seen = now;
        persist(self.store.as_ref(), NAMESPACE, sender.as_str(), &state).await;
        users.insert(sender.clone(), state);
        info!(event_name = "admission.throttle.counter_reset", sender = %sender, "sender reply counter reset");
        true
    }

    pub async fn state_of(&self, sender: &SenderId) -> Option<UserState> {
        let now = self.clock.now();
        let mut users = self.users.lock().await;
        self.normalized(&mut users, sender, now).await
    }

    /// Clears elapsed blocks and purges senders idle past the retention period.
    pub async fn sweep(&self) -> SweepReport {
        let now = self.clock.now();
        let retention = Duration::days(i64::from(self.config.retention_days));
        let mut users = self.users.lock().await;
        let mut report = SweepReport::default();

        let senders: Vec<SenderId> = users.keys().cloned().collect();
        for sender in senders {
            let Some(state) = users.get(&sender).cloned() else { continue };
            if state.blocked_until.is_some_and(|until| until <= now) {
                report.expired_blocks += 1;
            }
            let normalized = normalize_user_state(state.clone(), now, &self.calendar);

            if !normalized.is_blocked(now) && now - normalized.last_seen >= retention {
                users.remove(&sender);
                forget(self.store.as_ref(), NAMESPACE, sender.as_str()).await;
                report.removed += 1;
            } else if normalized != state {
                persist(self.store.as_ref(), NAMESPACE, sender.as_str(), &normalized).await;
                users.insert(sender, normalized);
            }
        }

        report.remaining = users.len();
        if report.removed > 0 || report.expired_blocks > 0 {
            info!(
                event_name = "admission.throttle.swept",
                removed = report.removed,
                expired_blocks = report.expired_blocks,
                remaining = report.remaining,
                "sender state sweep completed"
            );
        }
        report
    }

    fn normalized_view(&self, now: DateTime<Utc>, users: &HashMap<SenderId, UserState>) -> Vec<UserState> {
        users.values().map(|state| normalize_user_state(state.clone(), now, &self.calendar)).collect()
    }

    pub async fn stats(&self) -> ThrottleStats {
        let now = self.clock.now();
        let users = self.users.lock().await;
        let view = self.normalized_view(now, &users);
        let base = self.config.max_responses_per_day;
        ThrottleStats {
            tracked_senders: view.len(),
            blocked_senders: view.iter().filter(|state| state.is_blocked(now)).count(),
            responses_today: view.iter().map(|state| u64::from(state.response_count)).sum(),
            senders_at_limit: view.iter().filter(|state| state.response_count >= base).count(),
        }
    }

    pub async fn blocked_senders(&self) -> Vec<BlockedSender> {
        let now = self.clock.now();
        let users = self.users.lock().await;
        let mut blocked: Vec<BlockedSender> = self
            .normalized_view(now, &users)
            .into_iter()
            .filter_map(|state| {
                let until = state.blocked_until.filter(|until| now < *until)?;
                Some(BlockedSender { sender: state.sender, reason: state.block_reason, blocked_until: until })
            })
            .collect();
        blocked.sort_by_key(|entry| entry.blocked_until);
        blocked
    }

    /// Senders at or above 80% of the base daily ceiling.
    pub async fn senders_near_limit(&self) -> Vec<NearLimitSender> {
        let now = self.clock.now();
        let ceiling = self.config.max_responses_per_day;
        let users = self.users.lock().await;
        let mut near: Vec<NearLimitSender> = self
            .normalized_view(now, &users)
            .into_iter()
            .filter(|state| state.response_count.saturating_mul(100) >= ceiling.saturating_mul(NEAR_LIMIT_PCT))
            .map(|state| NearLimitSender { sender: state.sender, response_count: state.response_count, ceiling })
            .collect();
        near.sort_by(|a, b| b.response_count.cmp(&a.response_count).then_with(|| a.sender.cmp(&b.sender)));
        near
    }
}
