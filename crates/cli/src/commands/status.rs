use std::sync::Arc;

use prechat_core::{
    AdmissionCoordinator, AdmissionSnapshot, CharRatioEstimator, InMemoryStateStore, StateStore,
    SystemClock,
};
use prechat_db::{connect_from_config, NamespaceSummary, SqlStateStore};
use serde_json::json;

use crate::commands::{load_config, runtime, CommandResult};

/// Reports persisted admission state without touching it.
///
/// Every namespace is copied into memory first and the coordinator is restored from that copy,
/// so sweeps run during restore never write back to the shared database.
pub fn run(json_output: bool) -> CommandResult {
    let config = match load_config("status") {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match runtime("status") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let result = runtime.block_on(async {
        let pool = connect_from_config(&config.database)
            .await
            .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;
        let store = SqlStateStore::new(pool.clone());

        let namespaces =
            store.summarize().await.map_err(|error| ("state_read", error.to_string(), 6u8))?;
        let copy = InMemoryStateStore::new();
        for summary in &namespaces {
            let records = store
                .load_all(&summary.namespace)
                .await
                .map_err(|error| ("state_read", error.to_string(), 6u8))?;
            for (key, value) in records {
                copy.save(&summary.namespace, &key, value)
                    .await
                    .map_err(|error| ("state_read", error.to_string(), 6u8))?;
            }
        }
        pool.close().await;

        let coordinator = AdmissionCoordinator::restore(
            &config,
            Arc::new(SystemClock),
            Arc::new(copy),
            Arc::new(CharRatioEstimator::default()),
        )
        .await;
        Ok::<_, (&'static str, String, u8)>((namespaces, coordinator.snapshot().await))
    });

    match result {
        Ok((namespaces, snapshot)) if json_output => CommandResult::success_with_data(
            "status",
            summary_line(&snapshot),
            json!({
                "namespaces": namespaces.iter().map(|summary| json!({
                    "namespace": summary.namespace,
                    "records": summary.records,
                    "last_updated_at": summary.last_updated_at,
                })).collect::<Vec<_>>(),
                "admission": snapshot,
            }),
        ),
        Ok((namespaces, snapshot)) => {
            CommandResult { exit_code: 0, output: render_human(&namespaces, &snapshot) }
        }
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("status", error_class, message, exit_code)
        }
    }
}

fn summary_line(snapshot: &AdmissionSnapshot) -> String {
    let state = if snapshot.budget.system_active { "active" } else { "deactivated" };
    format!(
        "model access {state}; {} sender(s) tracked, {} blocked",
        snapshot.throttle.tracked_senders, snapshot.throttle.blocked_senders
    )
}

fn render_human(namespaces: &[NamespaceSummary], snapshot: &AdmissionSnapshot) -> String {
    let budget = &snapshot.budget;
    let mut lines = vec![summary_line(snapshot)];

    if let Some(reason) = budget.deactivation_reason {
        lines.push(format!("- deactivated: {}", reason.describe()));
    }
    for (label, window) in [
        ("requests/minute", &budget.requests_per_minute),
        ("requests/day", &budget.requests_per_day),
        ("tokens/minute", &budget.tokens_per_minute),
        ("tokens/day", &budget.tokens_per_day),
    ] {
        lines.push(format!(
            "- {label}: {}/{} ({:.1}% of safe limit, resets {})",
            window.used,
            window.safe_limit,
            window.usage_pct,
            window.resets_at.to_rfc3339()
        ));
    }
    lines.push(format!("- cache entries: {}/{}", snapshot.cache.size, snapshot.cache.max_size));
    lines.push(format!(
        "- coalescing: {} open group(s), {} pending message(s)",
        snapshot.coalescing.active_groups, snapshot.coalescing.pending_messages
    ));
    lines.push(format!("- responses today: {}", snapshot.throttle.responses_today));
    for blocked in &snapshot.blocked_senders {
        let until = blocked.blocked_until.to_rfc3339();
        lines.push(format!("- blocked {} until {until}", blocked.sender));
    }

    if namespaces.is_empty() {
        lines.push("- no persisted admission state".to_string());
    }
    for summary in namespaces {
        let updated = summary
            .last_updated_at
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        lines.push(format!(
            "- namespace {}: {} record(s), last updated {updated}",
            summary.namespace, summary.records
        ));
    }

    lines.join("\n")
}
