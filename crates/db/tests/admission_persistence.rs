use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use prechat_core::config::AppConfig;
use prechat_core::{
    AdmissionCoordinator, CharRatioEstimator, Decision, IntentSource, ManualClock, SenderId,
    StateStore,
};
use prechat_db::{connect_with_settings, migrations, SqlStateStore};

type PersistenceTestResult<T = ()> = Result<T, String>;

async fn sql_store() -> PersistenceTestResult<Arc<SqlStateStore>> {
    let pool = connect_with_settings("sqlite::memory:", 1, 30)
        .await
        .map_err(|error| format!("connect failed: {error}"))?;
    migrations::run_pending(&pool).await.map_err(|error| format!("migrations failed: {error}"))?;
    Ok(Arc::new(SqlStateStore::new(pool)))
}

async fn coordinator(
    config: &AppConfig,
    clock: &ManualClock,
    store: Arc<SqlStateStore>,
) -> AdmissionCoordinator {
    let store: Arc<dyn StateStore> = store;
    AdmissionCoordinator::restore(
        config,
        Arc::new(clock.clone()),
        store,
        Arc::new(CharRatioEstimator::default()),
    )
    .await
}

fn sender(raw: &str) -> PersistenceTestResult<SenderId> {
    SenderId::parse(raw).map_err(|error| error.to_string())
}

#[tokio::test]
async fn admission_state_survives_restart_through_sqlite() -> PersistenceTestResult {
    let store = sql_store().await?;
    let clock = ManualClock::new(
        Utc.with_ymd_and_hms(2026, 6, 1, 11, 0, 0).single().ok_or("invalid timestamp")?,
    );
    let mut config = AppConfig::default();
    config.coalescing.enabled = false;

    let alice = sender("5511933330001")?;
    let bob = sender("5511933330002")?;

    let first = coordinator(&config, &clock, Arc::clone(&store)).await;
    match first.handle(&alice, "Vocês entregam em Campinas?", None).await {
        Decision::ProceedToModel(_) => {}
        other => return Err(format!("expected model call, got {other:?}")),
    }
    first.commit(&alice, 80, "Sim, entregamos em Campinas.", true).await;
    first.record_purchase_decision(&bob, IntentSource::Classifier).await;
    first.deactivate().await;
    drop(first);

    clock.advance(Duration::minutes(5));
    let second = coordinator(&config, &clock, Arc::clone(&store)).await;
    let snapshot = second.snapshot().await;

    if snapshot.budget.system_active {
        return Err("deactivation should survive restart".to_string());
    }
    if snapshot.budget.tokens_per_day.used != 80 {
        return Err(format!("expected 80 tokens today, got {}", snapshot.budget.tokens_per_day.used));
    }
    if snapshot.cache.size != 1 {
        return Err(format!("expected one cached answer, got {}", snapshot.cache.size));
    }
    if snapshot.blocked_senders.len() != 1 {
        return Err("purchase handoff block should survive restart".to_string());
    }

    match second.handle(&sender("5511933330003")?, "vocês entregam em campinas?", None).await {
        Decision::UseCache(answer) if answer == "Sim, entregamos em Campinas." => {}
        other => return Err(format!("expected cached answer, got {other:?}")),
    }
    match second.handle(&bob, "oi", None).await {
        Decision::Blocked(_) => {}
        other => return Err(format!("expected blocked decision, got {other:?}")),
    }

    let summary = store.summarize().await.map_err(|error| error.to_string())?;
    let namespaces: Vec<&str> = summary.iter().map(|entry| entry.namespace.as_str()).collect();
    if namespaces != ["rate_budget", "response_cache", "user_state"] {
        return Err(format!("unexpected namespaces: {namespaces:?}"));
    }
    Ok(())
}

#[tokio::test]
async fn corrupt_row_does_not_hide_the_rest_of_its_namespace() -> PersistenceTestResult {
    let pool = connect_with_settings("sqlite::memory:", 1, 30)
        .await
        .map_err(|error| format!("connect failed: {error}"))?;
    migrations::run_pending(&pool).await.map_err(|error| format!("migrations failed: {error}"))?;
    let store = Arc::new(SqlStateStore::new(pool.clone()));
    let clock = ManualClock::new(
        Utc.with_ymd_and_hms(2026, 6, 1, 11, 0, 0).single().ok_or("invalid timestamp")?,
    );
    let config = AppConfig::default();

    let first = coordinator(&config, &clock, Arc::clone(&store)).await;
    first.throttle().record_response(&sender("5511933330004")?).await;
    first.throttle().record_response(&sender("5511933330005")?).await;
    drop(first);

    sqlx::query(
        "INSERT INTO admission_state (namespace, state_key, payload_json, updated_at)
         VALUES ('user_state', '5511933330006', '{truncated', '2026-06-01T11:00:00Z')",
    )
    .execute(&pool)
    .await
    .map_err(|error| format!("insert failed: {error}"))?;

    let rows = store.load_all("user_state").await.map_err(|error| error.to_string())?;
    if rows.len() != 2 {
        return Err(format!("expected the two decodable rows, got {}", rows.len()));
    }

    let second = coordinator(&config, &clock, store).await;
    let tracked = second.snapshot().await.throttle.tracked_senders;
    if tracked != 2 {
        return Err(format!("expected two restored senders, got {tracked}"));
    }
    Ok(())
}
