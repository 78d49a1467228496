//! Usage-governed admission: decides, per inbound message, whether the upstream
//! model may be called, whether a cached answer suffices, whether the message waits
//! for more from the same sender, or whether the sender is throttled or blocked.

pub mod budget;
pub mod cache;
pub mod coalescer;
pub mod coordinator;
pub mod messages;
pub mod throttle;
pub mod window;

use chrono::Duration;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::storage::StateStore;

pub use budget::{
    BudgetAdmission, BudgetReservation, BudgetStatus, DeactivationReason, RateBudgetTracker,
    WindowStatus,
};
pub use cache::{CacheStats, ResponseCache};
pub use coalescer::{CoalescedBatch, CoalescerStats, MessageCoalescer};
pub use coordinator::{
    AdmissionCoordinator, AdmissionSnapshot, CommitOutcome, Decision, Gate, MaintenanceReport,
};
pub use throttle::{
    BlockReason, BlockedSender, NearLimitSender, SweepReport, ThrottleDecision, ThrottleStats,
    UserState, UserThrottle,
};
pub use window::{Calendar, RateWindow, WindowSpan};

/// Config durations are `u64` seconds; clamp into chrono's representable range.
pub(crate) fn seconds(value: u64) -> Duration {
    Duration::seconds(i64::try_from(value).unwrap_or(i64::MAX).min(i64::MAX / 1_000))
}

pub(crate) async fn persist<T: Serialize>(
    store: &dyn StateStore,
    namespace: &'static str,
    key: &str,
    value: &T,
) {
    let payload = match serde_json::to_value(value) {
        Ok(payload) => payload,
        Err(error) => {
            warn!(
                event_name = "admission.persistence.encode_failed",
                namespace,
                key,
                error = %error,
                "admission state could not be encoded; keeping in-memory copy only"
            );
            return;
        }
    };

    if let Err(error) = store.save(namespace, key, payload).await {
        warn!(
            event_name = "admission.persistence.save_failed",
            namespace,
            key,
            error = %error,
            "admission state was not persisted; in-memory state remains authoritative"
        );
    }
}

pub(crate) async fn forget(store: &dyn StateStore, namespace: &'static str, key: &str) {
    if let Err(error) = store.delete(namespace, key).await {
        warn!(
            event_name = "admission.persistence.delete_failed",
            namespace,
            key,
            error = %error,
            "persisted admission state could not be deleted"
        );
    }
}

/// Loads every decodable record in a namespace; undecodable rows are skipped and logged.
pub(crate) async fn restore_all<T: DeserializeOwned>(
    store: &dyn StateStore,
    namespace: &'static str,
) -> Vec<(String, T)> {
    let rows = match store.load_all(namespace).await {
        Ok(rows) => rows,
        Err(error) => {
            warn!(
                event_name = "admission.persistence.restore_failed",
                namespace,
                error = %error,
                "starting with empty admission state"
            );
            return Vec::new();
        }
    };

    rows.into_iter()
        .filter_map(|(key, payload)| match serde_json::from_value::<T>(payload) {
            Ok(value) => Some((key, value)),
            Err(error) => {
                warn!(
                    event_name = "admission.persistence.decode_failed",
                    namespace,
                    key = %key,
                    error = %error,
                    "skipping undecodable admission record"
                );
                None
            }
        })
        .collect()
}
