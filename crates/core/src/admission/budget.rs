use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::admission::window::{Calendar, RateWindow, WindowSpan};
use crate::admission::{persist, restore_all};
use crate::clock::Clock;
use crate::config::BudgetConfig;
use crate::storage::StateStore;

pub const NAMESPACE: &str = "rate_budget";
const STATE_KEY: &str = "state";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeactivationReason {
    RequestsPerMinute,
    RequestsPerDay,
    TokensPerMinute,
    TokensPerDay,
    Operator,
}

impl DeactivationReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RequestsPerMinute => "requests_per_minute",
            Self::RequestsPerDay => "requests_per_day",
            Self::TokensPerMinute => "tokens_per_minute",
            Self::TokensPerDay => "tokens_per_day",
            Self::Operator => "operator",
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            Self::RequestsPerMinute => "requests-per-minute safety limit reached",
            Self::RequestsPerDay => "requests-per-day safety limit reached",
            Self::TokensPerMinute => "tokens-per-minute safety limit reached",
            Self::TokensPerDay => "tokens-per-day safety limit reached",
            Self::Operator => "deactivated by operator",
        }
    }
}

/// Proof that one request and `estimated_tokens` were reserved in specific windows.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetReservation {
    pub estimated_tokens: u64,
    pub minute_window_start: DateTime<Utc>,
    pub day_window_start: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BudgetAdmission {
    Admitted(BudgetReservation),
    Denied { reason: DeactivationReason },
}

impl BudgetAdmission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Admitted(_))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WindowStatus {
    pub used: u64,
    pub limit: u64,
    pub safe_limit: u64,
    pub usage_pct: f64,
    pub resets_at: DateTime<Utc>,
}

impl From<&RateWindow> for WindowStatus {
    fn from(window: &RateWindow) -> Self {
        Self {
            used: window.counter,
            limit: window.limit,
            safe_limit: window.safe_limit(),
            usage_pct: window.usage_pct(),
            resets_at: window.resets_at(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BudgetStatus {
    pub system_active: bool,
    pub deactivation_reason: Option<DeactivationReason>,
    pub deactivated_at: Option<DateTime<Utc>>,
    pub requests_per_minute: WindowStatus,
    pub requests_per_day: WindowStatus,
    pub tokens_per_minute: WindowStatus,
    pub tokens_per_day: WindowStatus,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) struct BudgetState {
    pub(crate) requests_per_minute: RateWindow,
    pub(crate) requests_per_day: RateWindow,
    pub(crate) tokens_per_minute: RateWindow,
    pub(crate) tokens_per_day: RateWindow,
    pub(crate) system_active: bool,
    pub(crate) deactivation: Option<DeactivationReason>,
    pub(crate) deactivated_at: Option<DateTime<Utc>>,
    pub(crate) last_checked_at: DateTime<Utc>,
}

impl BudgetState {
    fn fresh(config: &BudgetConfig, calendar: &Calendar, now: DateTime<Utc>) -> Self {
        let margin = config.safety_margin;
        Self {
            requests_per_minute: RateWindow::new(
                WindowSpan::Minute,
                config.requests_per_minute,
                margin,
                calendar,
                now,
            ),
            requests_per_day: RateWindow::new(
                WindowSpan::Day,
                config.requests_per_day,
                margin,
                calendar,
                now,
            ),
            tokens_per_minute: RateWindow::new(
                WindowSpan::Minute,
                config.tokens_per_minute,
                margin,
                calendar,
                now,
            ),
            tokens_per_day: RateWindow::new(WindowSpan::Day, config.tokens_per_day, margin, calendar, now),
            system_active: true,
            deactivation: None,
            deactivated_at: None,
            last_checked_at: now,
        }
    }

    /// Limits always come from the running configuration, never from persisted state.
    fn apply_limits(&mut self, config: &BudgetConfig) {
        let margin = config.safety_margin;
        for (window, limit) in [
            (&mut self.requests_per_minute, config.requests_per_minute),
            (&mut self.requests_per_day, config.requests_per_day),
            (&mut self.tokens_per_minute, config.tokens_per_minute),
            (&mut self.tokens_per_day, config.tokens_per_day),
        ] {
            window.limit = limit;
            window.safety_fraction = margin;
            window.counter = window.counter.min(limit);
        }
    }

    fn roll_all(&mut self, now: DateTime<Utc>, calendar: &Calendar) -> bool {
        let mut rolled = false;
        rolled |= self.requests_per_minute.roll(now, calendar);
        rolled |= self.requests_per_day.roll(now, calendar);
        rolled |= self.tokens_per_minute.roll(now, calendar);
        rolled |= self.tokens_per_day.roll(now, calendar);
        rolled
    }

    fn first_exhausted(&self, estimated_tokens: u64) -> Option<DeactivationReason> {
        if !self.requests_per_minute.has_headroom() {
            return Some(DeactivationReason::RequestsPerMinute);
        }
        if !self.requests_per_day.has_headroom() {
            return Some(DeactivationReason::RequestsPerDay);
        }
        if !self.tokens_per_minute.admits(estimated_tokens) {
            return Some(DeactivationReason::TokensPerMinute);
        }
        if !self.tokens_per_day.admits(estimated_tokens) {
            return Some(DeactivationReason::TokensPerDay);
        }
        None
    }

    fn status(&self) -> BudgetStatus {
        BudgetStatus {
            system_active: self.system_active,
            deactivation_reason: self.deactivation,
            deactivated_at: self.deactivated_at,
            requests_per_minute: WindowStatus::from(&self.requests_per_minute),
            requests_per_day: WindowStatus::from(&self.requests_per_day),
            tokens_per_minute: WindowStatus::from(&self.tokens_per_minute),
            tokens_per_day: WindowStatus::from(&self.tokens_per_day),
        }
    }
}

/// Tracks upstream model usage against fixed minute/day windows and trips a
/// kill-switch once any window reaches its safety limit.
pub struct RateBudgetTracker {
    config: BudgetConfig,
    calendar: Calendar,
    clock: Arc<dyn Clock>,
    store: Arc<dyn StateStore>,
    state: Mutex<BudgetState>,
}

impl RateBudgetTracker {
    /// Builds the tracker from persisted state when present, otherwise fresh windows.
    pub async fn restore(
        config: BudgetConfig,
        calendar: Calendar,
        clock: Arc<dyn Clock>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        let now = clock.now();
        let restored = restore_all::<BudgetState>(store.as_ref(), NAMESPACE)
            .await
            .into_iter()
            .find_map(|(key, state)| (key == STATE_KEY).then_some(state));

        let state = match restored {
            Some(mut state) => {
                state.apply_limits(&config);
                if !state.system_active {
                    warn!(
                        event_name = "admission.budget.restored_inactive",
                        reason = state.deactivation.map(DeactivationReason::as_str).unwrap_or("unknown"),
                        "model budget restored in deactivated state; operator reactivation required"
                    );
                }
                state
            }
            None => BudgetState::fresh(&config, &calendar, now),
        };

        Self { config, calendar, clock, store, state: Mutex::new(state) }
    }

    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    /// Rolls windows, checks every safety limit and, on success, reserves one request
    /// plus `estimated_tokens` before the caller contacts the model.
    pub async fn check_admission(&self, estimated_tokens: u64) -> BudgetAdmission {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        if !state.system_active {
            return BudgetAdmission::Denied {
                reason: state.deactivation.unwrap_or(DeactivationReason::Operator),
            };
        }

        state.roll_all(now, &self.calendar);
        state.last_checked_at = now;

        if let Some(reason) = state.first_exhausted(estimated_tokens) {
            state.system_active = false;
            state.deactivation = Some(reason);
            state.deactivated_at = Some(now);
            warn!(
                event_name = "admission.budget.denied",
                reason = reason.as_str(),
                requests_per_minute = state.requests_per_minute.counter,
                requests_per_day = state.requests_per_day.counter,
                tokens_per_minute = state.tokens_per_minute.counter,
                tokens_per_day = state.tokens_per_day.counter,
                estimated_tokens,
                "model budget safety limit reached; automated model replies deactivated"
            );
            persist(self.store.as_ref(), NAMESPACE, STATE_KEY, &*state).await;
            return BudgetAdmission::Denied { reason };
        }

        state.requests_per_minute.add(1);
        state.requests_per_day.add(1);
        state.tokens_per_minute.add(estimated_tokens);
        state.tokens_per_day.add(estimated_tokens);

        let reservation = BudgetReservation {
            estimated_tokens,
            minute_window_start: state.tokens_per_minute.window_start,
            day_window_start: state.tokens_per_day.window_start,
        };
        persist(self.store.as_ref(), NAMESPACE, STATE_KEY, &*state).await;
        BudgetAdmission::Admitted(reservation)
    }

    /// Replaces the reserved token estimate with what the model actually spent, in the
    /// windows that still hold the reservation.
    pub async fn commit_usage(&self, reservation: &BudgetReservation, tokens_spent: u64) {
        let now = self.clock.now();
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        state.roll_all(now, &self.calendar);

        let estimated = reservation.estimated_tokens;
        let targets = [
            (&mut state.tokens_per_minute, reservation.minute_window_start),
            (&mut state.tokens_per_day, reservation.day_window_start),
        ];
        for (window, reserved_in) in targets {
            if window.window_start != reserved_in {
                continue;
            }
            if tokens_spent >= estimated {
                window.add(tokens_spent - estimated);
            } else {
                window.subtract(estimated - tokens_spent);
            }
        }

        persist(self.store.as_ref(), NAMESPACE, STATE_KEY, &*state).await;
    }

    pub async fn status(&self) -> BudgetStatus {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        if state.roll_all(now, &self.calendar) {
            persist(self.store.as_ref(), NAMESPACE, STATE_KEY, &*state).await;
        }
        state.status()
    }

    pub async fn is_active(&self) -> bool {
        self.state.lock().await.system_active
    }

    /// Operator action: re-enables admission without touching counters.
    pub async fn reactivate(&self) -> bool {
        let mut state = self.state.lock().await;
        let was_inactive = !state.system_active;
        state.system_active = true;
        state.deactivation = None;
        state.deactivated_at = None;
        info!(
            event_name = "admission.budget.reactivated",
            was_inactive,
            requests_per_minute = state.requests_per_minute.counter,
            tokens_per_day = state.tokens_per_day.counter,
            "model budget reactivated by operator"
        );
        persist(self.store.as_ref(), NAMESPACE, STATE_KEY, &*state).await;
        was_inactive
    }

    /// Operator kill-switch.
    pub async fn deactivate(&self, reason: DeactivationReason) {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.system_active = false;
        state.deactivation = Some(reason);
        state.deactivated_at = Some(now);
        warn!(
            event_name = "admission.budget.deactivated",
            reason = reason.as_str(),
            "model budget deactivated"
        );
        persist(self.store.as_ref(), NAMESPACE, STATE_KEY, &*state).await;
    }

    #[cfg(test)]
    pub(crate) async fn seed(&self, apply: impl FnOnce(&mut BudgetState)) {
        apply(&mut *self.state.lock().await);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, TimeZone, Utc};

    use super::{BudgetAdmission, DeactivationReason, RateBudgetTracker, NAMESPACE};
    use crate::admission::window::Calendar;
    use crate::clock::ManualClock;
    use crate::config::BudgetConfig;
    use crate::storage::test_support::FailingStateStore;
    use crate::storage::{InMemoryStateStore, StateStore};

    fn config() -> BudgetConfig {
        BudgetConfig {
            requests_per_minute: 100,
            requests_per_day: 10_000,
            tokens_per_minute: 100_000,
            tokens_per_day: 1_000_000,
            safety_margin: 0.8,
            response_token_allowance: 0,
        }
    }

    fn clock() -> ManualClock {
        ManualClock::new(Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 5).single().expect("timestamp"))
    }

    async fn tracker(
        config: BudgetConfig,
        clock: &ManualClock,
        store: Arc<dyn StateStore>,
    ) -> RateBudgetTracker {
        RateBudgetTracker::restore(config, Calendar::utc(), Arc::new(clock.clone()), store).await
    }

    #[tokio::test]
    async fn admits_at_79_percent_and_denies_at_81_percent_of_minute_limit() {
        let clock = clock();
        let budget = tracker(config(), &clock, Arc::new(InMemoryStateStore::new())).await;

        budget.seed(|state| state.requests_per_minute.counter = 79).await;
        let admitted = budget.check_admission(10).await;
        assert!(admitted.is_allowed());
        assert_eq!(budget.status().await.requests_per_minute.used, 80);

        budget.seed(|state| state.requests_per_minute.counter = 81).await;
        let denied = budget.check_admission(10).await;
        assert_eq!(denied, BudgetAdmission::Denied { reason: DeactivationReason::RequestsPerMinute });

        let status = budget.status().await;
        assert!(!status.system_active);
        assert_eq!(status.deactivation_reason, Some(DeactivationReason::RequestsPerMinute));
        assert_eq!(status.requests_per_minute.used, 81);
    }

    #[tokio::test]
    async fn deactivation_survives_window_reset_until_operator_reactivates() {
        let clock = clock();
        let budget = tracker(config(), &clock, Arc::new(InMemoryStateStore::new())).await;

        budget.seed(|state| state.requests_per_minute.counter = 80).await;
        assert!(!budget.check_admission(1).await.is_allowed());

        clock.advance(Duration::minutes(2));
        assert!(!budget.check_admission(1).await.is_allowed());
        assert_eq!(budget.status().await.requests_per_minute.used, 0);

        assert!(budget.reactivate().await);
        assert!(budget.check_admission(1).await.is_allowed());
    }

    #[tokio::test]
    async fn reactivate_keeps_counters_and_re_evaluates_them() {
        let clock = clock();
        let budget = tracker(config(), &clock, Arc::new(InMemoryStateStore::new())).await;

        budget.seed(|state| state.requests_per_minute.counter = 81).await;
        assert!(!budget.check_admission(1).await.is_allowed());

        budget.reactivate().await;
        let status = budget.status().await;
        assert!(status.system_active);
        assert_eq!(status.requests_per_minute.used, 81);

        assert!(!budget.check_admission(1).await.is_allowed());
    }

    #[tokio::test]
    async fn token_windows_include_the_pending_estimate() {
        let clock = clock();
        let budget = tracker(config(), &clock, Arc::new(InMemoryStateStore::new())).await;

        budget.seed(|state| state.tokens_per_minute.counter = 79_000).await;
        assert!(budget.check_admission(1_000).await.is_allowed());
        assert_eq!(budget.status().await.tokens_per_minute.used, 80_000);

        assert_eq!(
            budget.check_admission(1).await,
            BudgetAdmission::Denied { reason: DeactivationReason::TokensPerMinute }
        );
    }

    #[tokio::test]
    async fn commit_reconciles_estimate_with_actual_usage() {
        let clock = clock();
        let budget = tracker(config(), &clock, Arc::new(InMemoryStateStore::new())).await;

        let BudgetAdmission::Admitted(first) = budget.check_admission(200).await else {
            panic!("first reservation should be admitted");
        };
        budget.commit_usage(&first, 350).await;

        let BudgetAdmission::Admitted(second) = budget.check_admission(200).await else {
            panic!("second reservation should be admitted");
        };
        budget.commit_usage(&second, 50).await;

        let status = budget.status().await;
        assert_eq!(status.tokens_per_minute.used, 400);
        assert_eq!(status.tokens_per_day.used, 400);
        assert_eq!(status.requests_per_minute.used, 2);
    }

    #[tokio::test]
    async fn commit_after_minute_rollover_only_adjusts_day_window() {
        let clock = clock();
        let budget = tracker(config(), &clock, Arc::new(InMemoryStateStore::new())).await;

        let BudgetAdmission::Admitted(reservation) = budget.check_admission(100).await else {
            panic!("reservation should be admitted");
        };
        clock.advance(Duration::minutes(1));
        budget.commit_usage(&reservation, 300).await;

        let status = budget.status().await;
        assert_eq!(status.tokens_per_minute.used, 0);
        assert_eq!(status.tokens_per_day.used, 300);
    }

    #[tokio::test]
    async fn commit_clamps_excess_at_nominal_limit_and_refunds_at_zero() {
        let clock = clock();
        let mut small = config();
        small.tokens_per_minute = 1_000;
        let budget = tracker(small, &clock, Arc::new(InMemoryStateStore::new())).await;

        let BudgetAdmission::Admitted(reservation) = budget.check_admission(100).await else {
            panic!("reservation should be admitted");
        };
        budget.commit_usage(&reservation, 5_000).await;
        assert_eq!(budget.status().await.tokens_per_minute.used, 1_000);

        budget.seed(|state| state.tokens_per_minute.counter = 10).await;
        budget.commit_usage(&reservation, 0).await;
        assert_eq!(budget.status().await.tokens_per_minute.used, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_admissions_never_exceed_the_safe_limit() {
        let clock = clock();
        let mut tight = config();
        tight.requests_per_minute = 30;
        let budget = Arc::new(tracker(tight, &clock, Arc::new(InMemoryStateStore::new())).await);

        let mut handles = Vec::new();
        for _ in 0..60 {
            let budget = Arc::clone(&budget);
            handles.push(tokio::spawn(async move { budget.check_admission(1).await.is_allowed() }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.expect("task should not panic") {
                admitted += 1;
            }
        }

        assert_eq!(admitted, 24);
        assert_eq!(budget.status().await.requests_per_minute.used, 24);
    }

    #[tokio::test]
    async fn restart_restores_counters_and_inactive_flag() {
        let clock = clock();
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        let budget = tracker(config(), &clock, Arc::clone(&store)).await;

        budget.check_admission(500).await;
        budget.deactivate(DeactivationReason::Operator).await;
        assert!(store.load(NAMESPACE, "state").await.expect("load").is_some());

        let mut raised = config();
        raised.requests_per_minute = 200;
        let restored = tracker(raised, &clock, Arc::clone(&store)).await;
        let status = restored.status().await;

        assert!(!status.system_active);
        assert_eq!(status.deactivation_reason, Some(DeactivationReason::Operator));
        assert_eq!(status.tokens_per_day.used, 500);
        assert_eq!(status.requests_per_minute.limit, 200);
    }

    #[tokio::test]
    async fn persistence_failures_do_not_block_admission() {
        let clock = clock();
        let budget = tracker(config(), &clock, Arc::new(FailingStateStore)).await;

        assert!(budget.check_admission(10).await.is_allowed());
        assert_eq!(budget.status().await.requests_per_day.used, 1);
    }
}
