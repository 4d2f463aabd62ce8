use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::Row;

use crate::app::{now_iso, process_event, AppState};
use crate::flow::{pending_action_deadline, FlowEvent};
use crate::types::ConversationStatus;

/// Thresholds and cadence for the idle-conversation sweep.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub interval_seconds: u64,
    pub idle_after: ChronoDuration,
    pub close_after: ChronoDuration,
}

impl ReaperConfig {
    pub fn from_env() -> Self {
        Self {
            interval_seconds: env_u64("REAPER_INTERVAL_SECS", 60),
            idle_after: ChronoDuration::seconds(env_u64("CONVERSATION_IDLE_AFTER_SECS", 1800) as i64),
            close_after: ChronoDuration::seconds(
                env_u64("CONVERSATION_CLOSE_AFTER_SECS", 21_600) as i64,
            ),
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepAction {
    MarkIdle,
    Close,
}

/// Decide what the sweep should do with a conversation, given when it was
/// last active. Older than the close threshold closes outright, even from
/// `active` — a conversation dead for that long should not need a second
/// pass through `idle`.
pub fn classify(
    status: ConversationStatus,
    last_activity: DateTime<Utc>,
    now: DateTime<Utc>,
    config: &ReaperConfig,
) -> Option<SweepAction> {
    if status == ConversationStatus::Closed {
        return None;
    }
    let age = now - last_activity;
    if age >= config.close_after {
        return Some(SweepAction::Close);
    }
    if age >= config.idle_after && status != ConversationStatus::Idle {
        return Some(SweepAction::MarkIdle);
    }
    None
}

/// Periodic sweep loop. Inactivity is the absence of events, so this is
/// timer-driven rather than event-driven; a missed run only lets idle
/// conversations linger, it never corrupts state.
pub async fn run(state: Arc<AppState>, config: ReaperConfig) {
    let mut ticker = tokio::time::interval(Duration::from_secs(config.interval_seconds.max(1)));
    loop {
        ticker.tick().await;
        match sweep(&state, &config).await {
            Ok((idled, closed)) if idled > 0 || closed > 0 => {
                tracing::info!(idled, closed, "idle conversation sweep");
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(error = %err, "idle conversation sweep failed"),
        }
        sweep_action_timeouts(&state).await;
    }
}

/// One pass over non-closed conversations. Each transition re-checks
/// `last_activity_at` inside its UPDATE, so an inbound webhook that
/// touched the conversation in the meantime wins and the closure (or
/// idling) is silently skipped for that row.
pub async fn sweep(
    state: &Arc<AppState>,
    config: &ReaperConfig,
) -> Result<(u64, u64), sqlx::Error> {
    let now = Utc::now();
    let rows = sqlx::query(
        "SELECT id, status, last_activity_at FROM conversations \
         WHERE status IN ('active', 'waiting_for_input', 'idle')",
    )
    .fetch_all(&state.db)
    .await?;

    let mut idled = 0u64;
    let mut closed = 0u64;
    for row in rows {
        let id: String = row.get("id");
        let status_raw: String = row.get("status");
        let seen_activity: String = row.get("last_activity_at");
        let status = status_raw
            .parse::<ConversationStatus>()
            .unwrap_or(ConversationStatus::Closed);
        let Ok(last_activity) = DateTime::parse_from_rfc3339(&seen_activity) else {
            tracing::warn!(
                conversation_id = id.as_str(),
                value = seen_activity.as_str(),
                "unparseable last_activity_at, skipping"
            );
            continue;
        };

        match classify(status, last_activity.with_timezone(&Utc), now, config) {
            Some(SweepAction::Close) => {
                let result = sqlx::query(
                    "UPDATE conversations \
                     SET status = 'closed', current_step_id = NULL, updated_at = $1 \
                     WHERE id = $2 AND status != 'closed' AND last_activity_at = $3",
                )
                .bind(now_iso())
                .bind(&id)
                .bind(&seen_activity)
                .execute(&state.db)
                .await?;
                if result.rows_affected() > 0 {
                    closed += 1;
                    state.locks.remove(&id).await;
                    tracing::debug!(conversation_id = id.as_str(), "closed idle conversation");
                }
            }
            Some(SweepAction::MarkIdle) => {
                let result = sqlx::query(
                    "UPDATE conversations SET status = 'idle', updated_at = $1 \
                     WHERE id = $2 AND status IN ('active', 'waiting_for_input') \
                       AND last_activity_at = $3",
                )
                .bind(now_iso())
                .bind(&id)
                .bind(&seen_activity)
                .execute(&state.db)
                .await?;
                if result.rows_affected() > 0 {
                    idled += 1;
                }
            }
            None => {}
        }
    }
    Ok((idled, closed))
}

/// Feed timeout events to conversations parked on a blocking action whose
/// deadline has passed. The event goes through the normal engine entry
/// point, so it takes the conversation lock and replays cleanly if the
/// action completed in the meantime.
pub async fn sweep_action_timeouts(state: &Arc<AppState>) {
    let now = Utc::now();
    let rows = sqlx::query(
        "SELECT id, context FROM conversations WHERE status = 'waiting_for_input'",
    )
    .fetch_all(&state.db)
    .await
    .unwrap_or_default();

    for row in rows {
        let id: String = row.get("id");
        let context_raw: String = row.get("context");
        let context = serde_json::from_str::<serde_json::Value>(&context_raw)
            .unwrap_or(serde_json::Value::Null);
        let expired = pending_action_deadline(&context).is_some_and(|deadline| deadline <= now);
        if !expired {
            continue;
        }
        tracing::info!(conversation_id = id.as_str(), "blocking action deadline passed");
        if let Err(err) = process_event(state, &id, FlowEvent::ActionTimedOut).await {
            tracing::warn!(
                conversation_id = id.as_str(),
                error = %err,
                "failed to apply action timeout"
            );
        }
    }
}
