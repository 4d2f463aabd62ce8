use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::{PgPool, Row};
use strum::{Display, EnumIter, EnumString};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::app::{now_iso, process_event, AppState};
use crate::flow::FlowEvent;

/// Categories of asynchronous work the engine dispatches. The set is
/// closed; flow definitions reference these by their kebab-case names.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter, Serialize, Deserialize,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum TaskCategory {
    OutboundMessage,
    DataLookup,
    PaymentRequest,
    BulkIngest,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("no queue lane named '{0}'")]
    UnknownLane(String),

    #[error("lane '{0}' is not accepting tasks")]
    LaneClosed(String),
}

/// A unit of work handed to a lane consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedTask {
    pub id: String,
    pub category: TaskCategory,
    pub payload: Value,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

/// Receipt returned to dispatch callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskHandle {
    pub task_id: String,
    pub lane: String,
}

/// Static category-to-lane map with a mandatory default lane.
///
/// The table is explicit configuration, never an implicit fallback at a
/// call site: a burst of bulk work queuing behind conversational sends is
/// exactly the failure this separation exists to prevent.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    routes: HashMap<TaskCategory, String>,
    default_lane: String,
}

impl RoutingTable {
    pub fn new(routes: HashMap<TaskCategory, String>, default_lane: impl Into<String>) -> Self {
        Self {
            routes,
            default_lane: default_lane.into(),
        }
    }

    /// The production routing policy: conversational sends are isolated on
    /// their own lane, settlement and bulk work each get one, everything
    /// else lands on the default background lane.
    pub fn standard() -> Self {
        let mut routes = HashMap::new();
        routes.insert(TaskCategory::OutboundMessage, "interactive".to_string());
        routes.insert(TaskCategory::PaymentRequest, "settlement".to_string());
        routes.insert(TaskCategory::BulkIngest, "bulk".to_string());
        Self::new(routes, "background")
    }

    pub fn lane_for(&self, category: TaskCategory) -> &str {
        self.routes
            .get(&category)
            .map(String::as_str)
            .unwrap_or(&self.default_lane)
    }

    pub fn default_lane(&self) -> &str {
        &self.default_lane
    }

    /// Every lane the table can route to, default included, deduplicated.
    pub fn lanes(&self) -> Vec<String> {
        let mut lanes = vec![self.default_lane.clone()];
        for lane in self.routes.values() {
            if !lanes.contains(lane) {
                lanes.push(lane.clone());
            }
        }
        lanes
    }
}

/// Named-lane enqueue seam. Enqueue must not block the caller; the
/// transport hands the task to a consumer and returns.
pub trait QueueTransport: Send + Sync {
    fn enqueue(&self, lane: &str, task: QueuedTask) -> Result<(), DispatchError>;
}

/// In-process transport: one unbounded channel per lane, receivers drained
/// by the worker loops spawned at startup.
pub struct InProcessQueue {
    senders: HashMap<String, mpsc::UnboundedSender<QueuedTask>>,
}

impl InProcessQueue {
    pub fn new(lanes: &[String]) -> (Self, HashMap<String, mpsc::UnboundedReceiver<QueuedTask>>) {
        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        for lane in lanes {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.insert(lane.clone(), tx);
            receivers.insert(lane.clone(), rx);
        }
        (Self { senders }, receivers)
    }
}

impl QueueTransport for InProcessQueue {
    fn enqueue(&self, lane: &str, task: QueuedTask) -> Result<(), DispatchError> {
        let sender = self
            .senders
            .get(lane)
            .ok_or_else(|| DispatchError::UnknownLane(lane.to_string()))?;
        sender
            .send(task)
            .map_err(|_| DispatchError::LaneClosed(lane.to_string()))
    }
}

/// Routes tasks onto lanes. Dispatch is fire-and-forget: enqueue, return a
/// handle, never wait for a consumer.
pub struct TaskRouter {
    table: RoutingTable,
    transport: Arc<dyn QueueTransport>,
}

impl TaskRouter {
    pub fn new(table: RoutingTable, transport: Arc<dyn QueueTransport>) -> Self {
        Self { table, transport }
    }

    pub fn dispatch(&self, task: QueuedTask) -> Result<TaskHandle, DispatchError> {
        let lane = self.table.lane_for(task.category).to_string();
        let task_id = task.id.clone();
        tracing::debug!(
            task_id = task_id.as_str(),
            category = %task.category,
            lane = lane.as_str(),
            "dispatching task"
        );
        self.transport.enqueue(&lane, task)?;
        Ok(TaskHandle { task_id, lane })
    }

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }
}

const MAX_OUTBOX_ATTEMPTS: i64 = 5;

/// One durable effect, written in the same transaction as the conversation
/// state that produced it. Rows start `pending`; a successful lane enqueue
/// marks them `dispatched`, an execution failure puts them back to
/// `pending` for the retry sweep, and the attempt cap parks them `failed`.
#[derive(Debug, Clone)]
pub struct OutboxRow {
    pub id: String,
    pub conversation_id: String,
    pub category: TaskCategory,
    pub lane: String,
    pub payload: Value,
}

impl OutboxRow {
    pub fn task(&self) -> QueuedTask {
        QueuedTask {
            id: self.id.clone(),
            category: self.category,
            payload: self.payload.clone(),
            conversation_id: Some(self.conversation_id.clone()),
        }
    }
}

pub async fn insert_outbox_row(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    row: &OutboxRow,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO effect_outbox \
         (id, conversation_id, category, lane, payload, status, attempts, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, 'pending', 0, $6, $6)",
    )
    .bind(&row.id)
    .bind(&row.conversation_id)
    .bind(row.category.to_string())
    .bind(&row.lane)
    .bind(row.payload.to_string())
    .bind(now_iso())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn mark_outbox_dispatched(db: &PgPool, id: &str) {
    let _ = sqlx::query(
        "UPDATE effect_outbox SET status = 'dispatched', attempts = attempts + 1, \
         updated_at = $1 WHERE id = $2",
    )
    .bind(now_iso())
    .bind(id)
    .execute(db)
    .await;
}

/// Put a row whose execution failed back on the retry path, or park it as
/// `failed` once the attempt cap is reached.
pub async fn mark_outbox_retry(db: &PgPool, id: &str) {
    let _ = sqlx::query(
        "UPDATE effect_outbox SET \
         status = CASE WHEN attempts >= $1 THEN 'failed' ELSE 'pending' END, \
         updated_at = $2 WHERE id = $3",
    )
    .bind(MAX_OUTBOX_ATTEMPTS)
    .bind(now_iso())
    .bind(id)
    .execute(db)
    .await;
}

/// Consumer for the `interactive` lane: delivers rendered messages through
/// the provider HTTP collaborator. A delivery failure marks the outbox row
/// for retry; the conversation state it came from is never rolled back.
pub async fn run_outbound_worker(
    state: Arc<AppState>,
    mut tasks: mpsc::UnboundedReceiver<QueuedTask>,
) {
    while let Some(task) = tasks.recv().await {
        match deliver_outbound_message(&state, &task).await {
            Ok(()) => {
                tracing::debug!(task_id = task.id.as_str(), "outbound message delivered");
            }
            Err(err) => {
                tracing::warn!(
                    task_id = task.id.as_str(),
                    error = err.as_str(),
                    "outbound delivery failed"
                );
                mark_outbox_retry(&state.db, &task.id).await;
            }
        }
    }
}

async fn deliver_outbound_message(state: &Arc<AppState>, task: &QueuedTask) -> Result<(), String> {
    let to = task.payload.get("to").and_then(Value::as_str).unwrap_or("");
    let body = task.payload.get("body").and_then(Value::as_str).unwrap_or("");
    let app_config_id = task
        .payload
        .get("appConfigId")
        .and_then(Value::as_str)
        .unwrap_or("");
    if to.is_empty() || app_config_id.is_empty() {
        return Err("task payload missing recipient or tenant".to_string());
    }

    let row = sqlx::query(
        "SELECT access_token, phone_number_id FROM app_configs WHERE id = $1 AND active = true",
    )
    .bind(app_config_id)
    .fetch_optional(&state.db)
    .await
    .map_err(|e| e.to_string())?;
    let Some(row) = row else {
        return Err("tenant missing or inactive".to_string());
    };
    let access_token: String = row.get("access_token");
    let phone_number_id: String = row.get("phone_number_id");
    if access_token.is_empty() {
        return Err("missing whatsapp access token".to_string());
    }

    let payload = json!({
        "messaging_product": "whatsapp",
        "recipient_type": "individual",
        "to": to,
        "type": "text",
        "text": {
            "preview_url": false,
            "body": body
        }
    });
    let response = state
        .http
        .post(format!(
            "https://graph.facebook.com/v21.0/{phone_number_id}/messages"
        ))
        .bearer_auth(&access_token)
        .json(&payload)
        .send()
        .await
        .map_err(|e| e.to_string())?;

    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let raw_body = response.text().await.unwrap_or_default();
    Err(format!("provider returned {status}: {raw_body}"))
}

/// Consumer for the side-effect lanes (settlement, bulk, background).
/// Executions are recorded, and a completion event is fed back through the
/// engine so a conversation parked on a blocking action resumes. The
/// engine drops completions for tasks it is not waiting on, so feeding one
/// for a non-blocking task is a no-op.
pub async fn run_action_worker(
    state: Arc<AppState>,
    lane: String,
    mut tasks: mpsc::UnboundedReceiver<QueuedTask>,
) {
    while let Some(task) = tasks.recv().await {
        tracing::info!(
            task_id = task.id.as_str(),
            category = %task.category,
            lane = lane.as_str(),
            "executing task"
        );
        let Some(conversation_id) = task.conversation_id.clone() else {
            continue;
        };
        let result = json!({
            "status": "completed",
            "category": task.category.to_string(),
            "completedAt": now_iso(),
        });
        let event = FlowEvent::ActionCompleted {
            task_id: task.id.clone(),
            result,
        };
        if let Err(err) = process_event(&state, &conversation_id, event).await {
            tracing::warn!(
                task_id = task.id.as_str(),
                conversation_id = conversation_id.as_str(),
                error = %err,
                "failed to apply action completion"
            );
            mark_outbox_retry(&state.db, &task.id).await;
        }
    }
}

/// Periodic re-dispatch of outbox rows a transient failure left `pending`.
pub async fn run_outbox_retry_sweep(state: Arc<AppState>, interval_seconds: u64) {
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_seconds.max(1)));
    loop {
        ticker.tick().await;
        if let Err(err) = retry_pending_outbox(&state).await {
            tracing::warn!(error = %err, "outbox retry sweep failed");
        }
    }
}

pub async fn retry_pending_outbox(state: &Arc<AppState>) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE effect_outbox SET status = 'failed', updated_at = $1 \
         WHERE status = 'pending' AND attempts >= $2",
    )
    .bind(now_iso())
    .bind(MAX_OUTBOX_ATTEMPTS)
    .execute(&state.db)
    .await?;

    let rows = sqlx::query(
        "SELECT id, conversation_id, category, payload FROM effect_outbox \
         WHERE status = 'pending' AND attempts < $1 \
         ORDER BY created_at ASC LIMIT 100",
    )
    .bind(MAX_OUTBOX_ATTEMPTS)
    .fetch_all(&state.db)
    .await?;

    for row in rows {
        let id: String = row.get("id");
        let category_raw: String = row.get("category");
        let Ok(category) = category_raw.parse::<TaskCategory>() else {
            // corrupt row; retrying cannot fix it
            tracing::warn!(
                outbox_id = id.as_str(),
                category = category_raw.as_str(),
                "outbox row has unknown category"
            );
            let _ = sqlx::query(
                "UPDATE effect_outbox SET status = 'failed', updated_at = $1 WHERE id = $2",
            )
            .bind(now_iso())
            .bind(&id)
            .execute(&state.db)
            .await;
            continue;
        };
        let payload_raw: String = row.get("payload");
        let payload = serde_json::from_str::<Value>(&payload_raw).unwrap_or(Value::Null);
        let task = QueuedTask {
            id: id.clone(),
            category,
            payload,
            conversation_id: Some(row.get("conversation_id")),
        };
        match state.tasks.dispatch(task) {
            Ok(handle) => {
                mark_outbox_dispatched(&state.db, &id).await;
                tracing::debug!(
                    outbox_id = id.as_str(),
                    lane = handle.lane.as_str(),
                    "re-dispatched pending effect"
                );
            }
            // transport still unavailable; leave the row for the next pass
            Err(err) => {
                tracing::warn!(outbox_id = id.as_str(), error = %err, "re-dispatch failed");
            }
        }
    }
    Ok(())
}
