use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::admission::budget::{
    BudgetAdmission, BudgetReservation, BudgetStatus, DeactivationReason, RateBudgetTracker,
};
use crate::admission::cache::{CacheStats, ResponseCache};
use crate::admission::coalescer::{CoalescedBatch, CoalescerStats, MessageCoalescer};
use crate::admission::messages::MessageTemplates;
use crate::admission::throttle::{
    BlockedSender, NearLimitSender, SweepReport, ThrottleDecision, ThrottleStats, UserThrottle,
};
use crate::admission::window::Calendar;
use crate::clock::Clock;
use crate::config::AppConfig;
use crate::domain::{IntentSource, PurchaseIntent, SenderId};
use crate::storage::StateStore;
use crate::tokens::TokenEstimator;

const UNCLASSIFIED: &str = "unclassified";

/// Outcome of running one inbound message through admission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Answer straight from cache; counted as a delivered reply.
    UseCache(String),
    StillCoalescing,
    Blocked(String),
    ThrottleExceeded(String),
    /// The model budget is exhausted or switched off; carries the maintenance notice.
    BudgetExceeded(String),
    /// Budget is reserved; call the model with this prompt, then `commit`.
    ProceedToModel(String),
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UseCache(_) => "use_cache",
            Self::StillCoalescing => "still_coalescing",
            Self::Blocked(_) => "blocked",
            Self::ThrottleExceeded(_) => "throttle_exceeded",
            Self::BudgetExceeded(_) => "budget_exceeded",
            Self::ProceedToModel(_) => "proceed_to_model",
        }
    }
}

/// Result of the stages that run before a prompt is known.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Gate {
    Settled(Decision),
    /// The prompt to classify and pass to `admit`.
    Ready(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CommitOutcome {
    pub reconciled: bool,
    pub cached: bool,
    pub response_count: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AdmissionSnapshot {
    pub taken_at: DateTime<Utc>,
    pub budget: BudgetStatus,
    pub cache: CacheStats,
    pub coalescing: CoalescerStats,
    pub throttle: ThrottleStats,
    pub blocked_senders: Vec<BlockedSender>,
    pub senders_near_limit: Vec<NearLimitSender>,
    pub in_flight: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub cache_purged: usize,
    pub stale_groups: usize,
    pub sweep: SweepReport,
}

#[derive(Clone, Debug)]
struct InFlight {
    prompt: String,
    category: String,
    reservation: BudgetReservation,
}

pub struct AdmissionCoordinator {
    budget: RateBudgetTracker,
    cache: ResponseCache,
    coalescer: MessageCoalescer,
    throttle: UserThrottle,
    templates: MessageTemplates,
    estimator: Arc<dyn TokenEstimator>,
    clock: Arc<dyn Clock>,
    response_token_allowance: u64,
    in_flight: Mutex<HashMap<SenderId, VecDeque<InFlight>>>,
}

impl AdmissionCoordinator {
    /// Builds every component from configuration, restoring persisted state.
    pub async fn restore(
        config: &AppConfig,
        clock: Arc<dyn Clock>,
        store: Arc<dyn StateStore>,
        estimator: Arc<dyn TokenEstimator>,
    ) -> Self {
        let calendar = Calendar::new(config.calendar);
        let budget = RateBudgetTracker::restore(
            config.budget.clone(),
            calendar,
            Arc::clone(&clock),
            Arc::clone(&store),
        )
        .await;
        let cache =
            ResponseCache::restore(config.cache.clone(), Arc::clone(&clock), Arc::clone(&store)).await;
        let coalescer =
            MessageCoalescer::restore(config.coalescing.clone(), Arc::clone(&clock), Arc::clone(&store))
                .await;
        let throttle =
            UserThrottle::restore(config.throttle.clone(), calendar, Arc::clone(&clock), store).await;

        info!(
            event_name = "admission.coordinator.restored",
            system_active = budget.is_active().await,
            cached_answers = cache.stats().await.size,
            "admission state restored"
        );

        Self {
            budget,
            cache,
            coalescer,
            throttle,
            templates: MessageTemplates::new(config.messages.clone()),
            estimator,
            clock,
            response_token_allowance: config.budget.response_token_allowance,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn budget(&self) -> &RateBudgetTracker {
        &self.budget
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn coalescer(&self) -> &MessageCoalescer {
        &self.coalescer
    }

    pub fn throttle(&self) -> &UserThrottle {
        &self.throttle
    }

    pub fn templates(&self) -> &MessageTemplates {
        &self.templates
    }

    /// throttle → coalescing → cache → budget; the first stage that says no wins.
    pub async fn handle(
        &self,
        sender: &SenderId,
        text: &str,
        intent: Option<PurchaseIntent>,
    ) -> Decision {
        match self.gate(sender, text, intent).await {
            Gate::Settled(decision) => decision,
            Gate::Ready(prompt) => self.admit(sender, prompt, intent).await,
        }
    }

    /// Runs the throttle and coalescing stages only. A `Ready` prompt may merge several
    /// messages, so callers can settle its intent before calling `admit`.
    pub async fn gate(
        &self,
        sender: &SenderId,
        text: &str,
        intent: Option<PurchaseIntent>,
    ) -> Gate {
        if let Some(denied) = self.throttle_check(sender, intent).await {
            return Gate::Settled(denied);
        }

        if !self.coalescer.is_enabled() {
            return Gate::Ready(text.to_string());
        }
        match self.coalescer.accumulate(sender, text).await {
            Some(merged) => Gate::Ready(merged),
            None => {
                debug!(
                    event_name = "admission.decision.still_coalescing",
                    sender = %sender,
                    "message held for coalescing"
                );
                Gate::Settled(Decision::StillCoalescing)
            }
        }
    }

    /// Continues a timer-flushed batch with the intent settled on its merged text.
    pub async fn handle_flushed(
        &self,
        batch: CoalescedBatch,
        intent: Option<PurchaseIntent>,
    ) -> Decision {
        self.admit(&batch.sender, batch.merged, intent).await
    }

    pub async fn drain_due(&self) -> Vec<CoalescedBatch> {
        self.coalescer.drain_due().await
    }

    /// Ceiling → cache → budget for a prompt that left coalescing. `intent` selects both
    /// the cache category and the reply ceiling.
    pub async fn admit(
        &self,
        sender: &SenderId,
        prompt: String,
        intent: Option<PurchaseIntent>,
    ) -> Decision {
        if let Some(denied) = self.throttle_check(sender, intent).await {
            return denied;
        }

        let category = intent.map(PurchaseIntent::as_str).unwrap_or(UNCLASSIFIED);

        if let Some(answer) = self.cache.lookup(&prompt, category).await {
            self.throttle.record_response(sender).await;
            info!(
                event_name = "admission.decision.use_cache",
                sender = %sender,
                category,
                "answered from cache without model call"
            );
            return Decision::UseCache(answer);
        }

        let estimated = self.estimator.estimate(&prompt).saturating_add(self.response_token_allowance);
        match self.budget.check_admission(estimated).await {
            BudgetAdmission::Denied { reason } => {
                warn!(
                    event_name = "admission.decision.budget_exceeded",
                    sender = %sender,
                    reason = reason.as_str(),
                    "model call refused; sending maintenance notice"
                );
                Decision::BudgetExceeded(self.templates.maintenance())
            }
            BudgetAdmission::Admitted(reservation) => {
                self.in_flight.lock().await.entry(sender.clone()).or_default().push_back(InFlight {
                    prompt: prompt.clone(),
                    category: category.to_string(),
                    reservation,
                });
                info!(
                    event_name = "admission.decision.proceed_to_model",
                    sender = %sender,
                    category,
                    estimated_tokens = estimated,
                    "model call admitted"
                );
                Decision::ProceedToModel(prompt)
            }
        }
    }

    async fn throttle_check(
        &self,
        sender: &SenderId,
        intent: Option<PurchaseIntent>,
    ) -> Option<Decision> {
        match self.throttle.can_respond(sender, intent).await {
            ThrottleDecision::Allowed => None,
            ThrottleDecision::Blocked { remaining, .. } => {
                Some(Decision::Blocked(self.templates.blocked(remaining)))
            }
            ThrottleDecision::LimitReached { count, ceiling } => {
                Some(Decision::ThrottleExceeded(self.templates.limit_reached(count, ceiling)))
            }
        }
    }

    /// Settles the oldest admitted request for `sender` once the model call finished.
    pub async fn commit(
        &self,
        sender: &SenderId,
        tokens_spent: u64,
        result_text: &str,
        success: bool,
    ) -> CommitOutcome {
        let pending = {
            let mut in_flight = self.in_flight.lock().await;
            let popped = in_flight.get_mut(sender).and_then(VecDeque::pop_front);
            if in_flight.get(sender).is_some_and(VecDeque::is_empty) {
                in_flight.remove(sender);
            }
            popped
        };

        let mut outcome = CommitOutcome { reconciled: false, cached: false, response_count: 0 };
        match pending {
            Some(request) => {
                if success && !result_text.trim().is_empty() {
                    self.cache.store(&request.prompt, &request.category, result_text).await;
                    outcome.cached = true;
                }
                self.budget.commit_usage(&request.reservation, tokens_spent).await;
                outcome.reconciled = true;
            }
            None => {
                warn!(
                    event_name = "admission.commit.unmatched",
                    sender = %sender,
                    tokens_spent,
                    "commit without an admitted request; budget not reconciled"
                );
            }
        }

        outcome.response_count = self.throttle.record_response(sender).await;
        outcome
    }

    pub async fn reactivate(&self) -> bool {
        self.budget.reactivate().await
    }

    pub async fn deactivate(&self) {
        self.budget.deactivate(DeactivationReason::Operator).await;
    }

    pub async fn unblock(&self, sender: &SenderId) -> bool {
        self.throttle.unblock(sender).await
    }

    pub async fn reset_counter(&self, sender: &SenderId) -> bool {
        self.throttle.reset_counter(sender).await
    }

    pub async fn record_purchase_decision(
        &self,
        sender: &SenderId,
        source: IntentSource,
    ) -> DateTime<Utc> {
        self.throttle.record_purchase_decision(sender, source).await
    }

    pub async fn snapshot(&self) -> AdmissionSnapshot {
        let in_flight: usize = self.in_flight.lock().await.values().map(VecDeque::len).sum();
        AdmissionSnapshot {
            taken_at: self.clock.now(),
            budget: self.budget.status().await,
            cache: self.cache.stats().await,
            coalescing: self.coalescer.stats().await,
            throttle: self.throttle.stats().await,
            blocked_senders: self.throttle.blocked_senders().await,
            senders_near_limit: self.throttle.senders_near_limit().await,
            in_flight,
        }
    }

    pub async fn run_maintenance(&self) -> MaintenanceReport {
        let report = MaintenanceReport {
            cache_purged: self.cache.purge_expired().await,
            stale_groups: self.coalescer.sweep_stale().await,
            sweep: self.throttle.sweep().await,
        };
        info!(
            event_name = "admission.maintenance.completed",
            cache_purged = report.cache_purged,
            stale_groups = report.stale_groups,
            senders_removed = report.sweep.removed,
            "admission maintenance pass completed"
        );
        report
    }
}
