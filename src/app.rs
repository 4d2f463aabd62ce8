use std::{collections::HashMap, env, sync::Arc};

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::context::set_path;
use crate::flow::{
    advance, FlowDefinition, FlowEvent, FlowState, OutboundEffect, CLOSED_REASON_KEY,
};
use crate::reaper::{self, ReaperConfig};
use crate::signature::verify_signature;
use crate::tasks::{
    insert_outbox_row, mark_outbox_dispatched, run_action_worker, run_outbound_worker,
    run_outbox_retry_sweep, InProcessQueue, OutboxRow, RoutingTable, TaskCategory, TaskRouter,
};
use crate::types::{
    AppConfig, Contact, Conversation, ConversationStatus, EngineError, InboundMessage,
    UnverifiedPhoneNumberId, WebhookOutcome,
};

pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

fn resolve_database_url() -> String {
    if let Ok(url) = env::var("DATABASE_URL") {
        if !url.trim().is_empty() {
            return url;
        }
    }
    let host = env::var("POSTGRES_HOST")
        .or_else(|_| env::var("PGHOST"))
        .unwrap_or_else(|_| "localhost".to_string());
    let port = env::var("POSTGRES_PORT")
        .or_else(|_| env::var("PGPORT"))
        .unwrap_or_else(|_| "5432".to_string());
    let user = env::var("POSTGRES_USER")
        .or_else(|_| env::var("PGUSER"))
        .unwrap_or_else(|_| "postgres".to_string());
    let password = env::var("POSTGRES_PASSWORD")
        .or_else(|_| env::var("PGPASSWORD"))
        .unwrap_or_else(|_| "postgres".to_string());
    let db = env::var("POSTGRES_DB")
        .or_else(|_| env::var("PGDATABASE"))
        .unwrap_or_else(|_| "waflow".to_string());
    format!("postgres://{user}:{password}@{host}:{port}/{db}")
}

fn body_digest(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    hex::encode(hasher.finalize())
}

fn normalize_wa_id(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Per-conversation write locks. Webhook events and action completions for
/// one conversation are serialized through its entry; unrelated
/// conversations proceed in parallel.
pub struct ConversationLocks {
    inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ConversationLocks {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub async fn acquire(&self, conversation_id: &str) -> Arc<Mutex<()>> {
        let mut map = self.inner.lock().await;
        map.entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop a closed conversation's entry so the registry stays bounded by
    /// the number of live conversations.
    pub async fn remove(&self, conversation_id: &str) {
        self.inner.lock().await.remove(conversation_id);
    }
}

impl Default for ConversationLocks {
    fn default() -> Self {
        Self::new()
    }
}

pub struct AppState {
    pub db: PgPool,
    pub http: reqwest::Client,
    pub tasks: TaskRouter,
    pub locks: ConversationLocks,
}

/// The business number the payload claims to target. Untrusted until the
/// signature check for the matched tenant passes.
fn payload_phone_number_id(payload: &Value) -> Option<UnverifiedPhoneNumberId> {
    let entries = payload.get("entry")?.as_array()?;
    for entry in entries {
        let Some(changes) = entry.get("changes").and_then(Value::as_array) else {
            continue;
        };
        for change in changes {
            let id = change
                .get("value")
                .and_then(|v| v.get("metadata"))
                .and_then(|m| m.get("phone_number_id"))
                .and_then(Value::as_str)
                .unwrap_or("");
            if !id.is_empty() {
                return Some(UnverifiedPhoneNumberId(id.to_string()));
            }
        }
    }
    None
}

fn profile_names(value: &Value) -> HashMap<String, String> {
    let mut names = HashMap::new();
    let contacts = value
        .get("contacts")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for contact in contacts {
        let wa_id = contact.get("wa_id").and_then(Value::as_str).unwrap_or("");
        let name = contact
            .get("profile")
            .and_then(|p| p.get("name"))
            .and_then(Value::as_str)
            .unwrap_or("");
        if !wa_id.is_empty() && !name.is_empty() {
            names.insert(normalize_wa_id(wa_id), name.to_string());
        }
    }
    names
}

/// Text messages addressed to the matched tenant, in payload order.
/// Status callbacks and message shapes without a text body are skipped.
fn extract_inbound_messages(payload: &Value, phone_number_id: &str) -> Vec<InboundMessage> {
    let mut inbound = Vec::new();
    let entries = payload
        .get("entry")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for entry in entries {
        let changes = entry
            .get("changes")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for change in changes {
            let value = change.get("value").cloned().unwrap_or_else(|| json!({}));
            let metadata_phone_id = value
                .get("metadata")
                .and_then(|m| m.get("phone_number_id"))
                .and_then(Value::as_str)
                .unwrap_or("");
            if metadata_phone_id != phone_number_id {
                continue;
            }
            let names = profile_names(&value);
            let messages = value
                .get("messages")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for message in messages {
                let provider_message_id = message
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                let from_wa_id =
                    normalize_wa_id(message.get("from").and_then(Value::as_str).unwrap_or(""));
                if provider_message_id.is_empty() || from_wa_id.is_empty() {
                    continue;
                }
                let text = message
                    .get("text")
                    .and_then(|t| t.get("body"))
                    .and_then(Value::as_str)
                    .or_else(|| {
                        message
                            .get("button")
                            .and_then(|b| b.get("text"))
                            .and_then(Value::as_str)
                    })
                    .unwrap_or("")
                    .to_string();
                if text.is_empty() {
                    continue;
                }
                let profile_name = names.get(&from_wa_id).cloned().unwrap_or_default();
                inbound.push(InboundMessage {
                    provider_message_id,
                    from_wa_id,
                    profile_name,
                    text,
                });
            }
        }
    }
    inbound
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": now_iso() }))
}

/// Provider subscription handshake. The tenant is picked by the
/// `phone_number_id` query parameter when present, otherwise the token is
/// matched across active configs.
async fn webhook_verify(
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let mode = params.get("hub.mode").cloned().unwrap_or_default();
    let verify_token = params.get("hub.verify_token").cloned().unwrap_or_default();
    let challenge = params.get("hub.challenge").cloned().unwrap_or_default();
    if mode != "subscribe" || challenge.is_empty() || verify_token.is_empty() {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "invalid webhook verification request" })),
        )
            .into_response();
    }

    let matched = match params.get("phone_number_id") {
        Some(phone_number_id) => {
            find_active_app_config(&state.db, &UnverifiedPhoneNumberId(phone_number_id.clone()))
                .await
                .filter(|config| {
                    !config.verify_token.is_empty() && config.verify_token == verify_token
                })
        }
        None => find_app_config_by_verify_token(&state.db, &verify_token).await,
    };
    if matched.is_some() {
        return (StatusCode::OK, challenge).into_response();
    }
    (
        StatusCode::FORBIDDEN,
        Json(json!({ "error": "invalid webhook verification token" })),
    )
        .into_response()
}

/// Webhook ingestion. Always acknowledges with 200 so the provider does
/// not retry-storm; diagnostic detail goes to logs and the audit table,
/// never the response body.
async fn webhook_event(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let signature_header = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok());
    let claimed_signature = signature_header.unwrap_or("").to_string();
    let raw_payload = String::from_utf8_lossy(&body).to_string();
    let payload = serde_json::from_slice::<Value>(&body).unwrap_or_else(|_| json!({}));

    // Phase one: pick the candidate tenant from the unverified payload.
    let Some(claimed_id) = payload_phone_number_id(&payload) else {
        let _ = record_webhook_event(
            &state.db,
            None,
            None,
            &raw_payload,
            &claimed_signature,
            WebhookOutcome::UnmatchedTenant,
        )
        .await;
        tracing::debug!("webhook payload names no business number");
        return ack(0);
    };
    let Some(config) = find_active_app_config(&state.db, &claimed_id).await else {
        let _ = record_webhook_event(
            &state.db,
            None,
            None,
            &raw_payload,
            &claimed_signature,
            WebhookOutcome::UnmatchedTenant,
        )
        .await;
        tracing::debug!(
            phone_number_id = claimed_id.0.as_str(),
            "webhook for unknown business number"
        );
        return ack(0);
    };

    // Phase two: the tenant's own secret decides whether to trust it.
    if !verify_signature(&config.webhook_secret, signature_header, &body) {
        let _ = record_webhook_event(
            &state.db,
            Some(&config.id),
            None,
            &raw_payload,
            &claimed_signature,
            WebhookOutcome::SignatureFailed,
        )
        .await;
        tracing::warn!(
            app_config_id = config.id.as_str(),
            "webhook signature verification failed"
        );
        return ack(0);
    }

    let messages = extract_inbound_messages(&payload, &config.phone_number_id);
    if messages.is_empty() {
        // Status callbacks and other message-less payloads are audited
        // too; the body digest keeps replays from stacking up rows.
        let digest = format!("payload-{}", body_digest(&body));
        let _ = record_webhook_event(
            &state.db,
            Some(&config.id),
            Some(&digest),
            &raw_payload,
            &claimed_signature,
            WebhookOutcome::Verified,
        )
        .await;
        return ack(0);
    }

    let mut processed = 0usize;
    for message in messages {
        let inserted = match record_webhook_event(
            &state.db,
            Some(&config.id),
            Some(&message.provider_message_id),
            &raw_payload,
            &claimed_signature,
            WebhookOutcome::Verified,
        )
        .await
        {
            Ok(inserted) => inserted,
            Err(err) => {
                tracing::warn!(error = %err, "failed to record webhook event");
                continue;
            }
        };
        if !inserted {
            // same provider message id seen before: replay, no-op success
            tracing::debug!(
                provider_message_id = message.provider_message_id.as_str(),
                "duplicate webhook message skipped"
            );
            continue;
        }
        if let Err(err) = process_inbound_message(&state, &config, &message).await {
            tracing::warn!(
                provider_message_id = message.provider_message_id.as_str(),
                error = %err,
                "failed to process inbound message"
            );
            continue;
        }
        processed += 1;
    }
    ack(processed)
}

fn ack(processed: usize) -> axum::response::Response {
    (
        StatusCode::OK,
        Json(json!({ "received": true, "processed": processed })),
    )
        .into_response()
}

fn parse_app_config_row(row: sqlx::postgres::PgRow) -> AppConfig {
    AppConfig {
        id: row.get("id"),
        name: row.get("name"),
        phone_number_id: row.get("phone_number_id"),
        webhook_secret: row.get("webhook_secret"),
        verify_token: row.get("verify_token"),
        access_token: row.get("access_token"),
        active: row.get("active"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

async fn find_active_app_config(
    db: &PgPool,
    claimed: &UnverifiedPhoneNumberId,
) -> Option<AppConfig> {
    sqlx::query(
        "SELECT id, name, phone_number_id, webhook_secret, verify_token, access_token, \
                active, created_at, updated_at \
         FROM app_configs WHERE phone_number_id = $1 AND active = true LIMIT 1",
    )
    .bind(&claimed.0)
    .fetch_optional(db)
    .await
    .ok()
    .flatten()
    .map(parse_app_config_row)
}

async fn find_app_config_by_verify_token(db: &PgPool, token: &str) -> Option<AppConfig> {
    if token.trim().is_empty() {
        return None;
    }
    sqlx::query(
        "SELECT id, name, phone_number_id, webhook_secret, verify_token, access_token, \
                active, created_at, updated_at \
         FROM app_configs WHERE verify_token = $1 AND active = true \
         ORDER BY created_at ASC LIMIT 1",
    )
    .bind(token)
    .fetch_optional(db)
    .await
    .ok()
    .flatten()
    .map(parse_app_config_row)
}

/// Write-once audit record. For verified messages the unique index over
/// (app_config_id, provider_message_id) doubles as the idempotency check:
/// zero rows inserted means the event was already processed.
async fn record_webhook_event(
    db: &PgPool,
    app_config_id: Option<&str>,
    provider_message_id: Option<&str>,
    raw_payload: &str,
    claimed_signature: &str,
    outcome: WebhookOutcome,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "INSERT INTO webhook_events \
         (id, app_config_id, provider_message_id, raw_payload, claimed_signature, outcome, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         ON CONFLICT (app_config_id, provider_message_id) DO NOTHING",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(app_config_id)
    .bind(provider_message_id)
    .bind(raw_payload)
    .bind(claimed_signature)
    .bind(outcome.to_string())
    .bind(now_iso())
    .execute(db)
    .await?;
    Ok(result.rows_affected() > 0)
}

async fn ensure_contact(
    db: &PgPool,
    config: &AppConfig,
    wa_id: &str,
    profile_name: &str,
) -> Result<Contact, sqlx::Error> {
    let now = now_iso();
    let existing = sqlx::query(
        "SELECT id, display_name FROM contacts WHERE app_config_id = $1 AND wa_id = $2 LIMIT 1",
    )
    .bind(&config.id)
    .bind(wa_id)
    .fetch_optional(db)
    .await?;
    if let Some(row) = existing {
        let id: String = row.get("id");
        let display_name: String = row.get("display_name");
        if !profile_name.is_empty() && profile_name != display_name {
            let _ =
                sqlx::query("UPDATE contacts SET display_name = $1, updated_at = $2 WHERE id = $3")
                    .bind(profile_name)
                    .bind(&now)
                    .bind(&id)
                    .execute(db)
                    .await;
            return Ok(Contact {
                id,
                app_config_id: Some(config.id.clone()),
                wa_id: wa_id.to_string(),
                display_name: profile_name.to_string(),
            });
        }
        return Ok(Contact {
            id,
            app_config_id: Some(config.id.clone()),
            wa_id: wa_id.to_string(),
            display_name,
        });
    }

    let id = Uuid::new_v4().to_string();
    let inserted = sqlx::query(
        "INSERT INTO contacts (id, app_config_id, wa_id, display_name, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $5) \
         ON CONFLICT (app_config_id, wa_id) DO NOTHING",
    )
    .bind(&id)
    .bind(&config.id)
    .bind(wa_id)
    .bind(profile_name)
    .bind(&now)
    .execute(db)
    .await?;
    if inserted.rows_affected() == 0 {
        // lost a race with a concurrent webhook for the same contact
        let row = sqlx::query(
            "SELECT id, display_name FROM contacts WHERE app_config_id = $1 AND wa_id = $2 LIMIT 1",
        )
        .bind(&config.id)
        .bind(wa_id)
        .fetch_one(db)
        .await?;
        return Ok(Contact {
            id: row.get("id"),
            app_config_id: Some(config.id.clone()),
            wa_id: wa_id.to_string(),
            display_name: row.get("display_name"),
        });
    }
    Ok(Contact {
        id,
        app_config_id: Some(config.id.clone()),
        wa_id: wa_id.to_string(),
        display_name: profile_name.to_string(),
    })
}

fn parse_conversation_row(row: sqlx::postgres::PgRow) -> Conversation {
    let status_raw: String = row.get("status");
    let context_raw: String = row.get("context");
    Conversation {
        id: row.get("id"),
        contact_id: row.get("contact_id"),
        contact_wa_id: row.get("wa_id"),
        app_config_id: row.get("app_config_id"),
        current_flow_id: row.get("current_flow_id"),
        current_step_id: row.get("current_step_id"),
        status: status_raw
            .parse::<ConversationStatus>()
            .unwrap_or(ConversationStatus::Closed),
        context: serde_json::from_str(&context_raw).unwrap_or_else(|_| json!({})),
        last_activity_at: row.get("last_activity_at"),
    }
}

async fn load_conversation(db: &PgPool, id: &str) -> Result<Option<Conversation>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT c.id, c.contact_id, ct.wa_id, ct.app_config_id, c.current_flow_id, \
                c.current_step_id, c.status, c.context, c.last_activity_at \
         FROM conversations c JOIN contacts ct ON ct.id = c.contact_id \
         WHERE c.id = $1 LIMIT 1",
    )
    .bind(id)
    .fetch_optional(db)
    .await?;
    Ok(row.map(parse_conversation_row))
}

async fn find_open_conversation(
    db: &PgPool,
    contact_id: &str,
) -> Result<Option<Conversation>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT c.id, c.contact_id, ct.wa_id, ct.app_config_id, c.current_flow_id, \
                c.current_step_id, c.status, c.context, c.last_activity_at \
         FROM conversations c JOIN contacts ct ON ct.id = c.contact_id \
         WHERE c.contact_id = $1 AND c.status != 'closed' \
         ORDER BY c.updated_at DESC LIMIT 1",
    )
    .bind(contact_id)
    .fetch_optional(db)
    .await?;
    Ok(row.map(parse_conversation_row))
}

async fn default_flow_id(db: &PgPool, app_config_id: &str) -> Result<Option<String>, sqlx::Error> {
    sqlx::query_scalar::<_, String>(
        "SELECT id FROM flows WHERE app_config_id = $1 AND enabled = true \
         ORDER BY created_at ASC LIMIT 1",
    )
    .bind(app_config_id)
    .fetch_optional(db)
    .await
}

async fn create_conversation(
    db: &PgPool,
    contact: &Contact,
    flow_id: &str,
) -> Result<Conversation, sqlx::Error> {
    let now = now_iso();
    let id = Uuid::new_v4().to_string();
    let context = json!({
        "contact": {
            "name": contact.display_name,
            "phone": contact.wa_id,
            "wa_id": contact.wa_id,
        }
    });
    let inserted = sqlx::query(
        "INSERT INTO conversations \
         (id, contact_id, current_flow_id, current_step_id, status, context, \
          last_activity_at, created_at, updated_at) \
         VALUES ($1, $2, $3, NULL, 'active', $4, $5, $5, $5) \
         ON CONFLICT (contact_id) WHERE status != 'closed' DO NOTHING",
    )
    .bind(&id)
    .bind(&contact.id)
    .bind(flow_id)
    .bind(context.to_string())
    .bind(&now)
    .execute(db)
    .await?;
    if inserted.rows_affected() == 0 {
        // a concurrent webhook already opened this contact's conversation
        if let Some(existing) = find_open_conversation(db, &contact.id).await? {
            return Ok(existing);
        }
    }
    Ok(Conversation {
        id,
        contact_id: contact.id.clone(),
        contact_wa_id: contact.wa_id.clone(),
        app_config_id: contact.app_config_id.clone(),
        current_flow_id: flow_id.to_string(),
        current_step_id: None,
        status: ConversationStatus::Active,
        context,
        last_activity_at: now,
    })
}

async fn load_flow_definition(
    db: &PgPool,
    flow_id: &str,
) -> Result<Option<FlowDefinition>, EngineError> {
    let raw = sqlx::query_scalar::<_, String>("SELECT definition FROM flows WHERE id = $1 LIMIT 1")
        .bind(flow_id)
        .fetch_optional(db)
        .await?;
    match raw {
        Some(raw) => Ok(Some(FlowDefinition::parse(&raw)?)),
        None => Ok(None),
    }
}

/// Configuration problems fail a single conversation closed instead of
/// surfacing to the webhook response.
async fn fail_conversation_closed(db: &PgPool, conversation: &Conversation, reason: &str) {
    tracing::warn!(
        conversation_id = conversation.id.as_str(),
        reason,
        "failing conversation closed"
    );
    let mut context = conversation.context.clone();
    set_path(
        &mut context,
        CLOSED_REASON_KEY,
        Value::String(reason.to_string()),
    );
    let _ = sqlx::query(
        "UPDATE conversations SET status = 'closed', current_step_id = NULL, \
         context = $1, updated_at = $2 WHERE id = $3",
    )
    .bind(context.to_string())
    .bind(now_iso())
    .bind(&conversation.id)
    .execute(db)
    .await;
}

fn outbox_rows_for_effects(
    table: &RoutingTable,
    conversation: &Conversation,
    effects: &[OutboundEffect],
) -> Vec<OutboxRow> {
    effects
        .iter()
        .map(|effect| match effect {
            OutboundEffect::Message { body } => OutboxRow {
                id: Uuid::new_v4().to_string(),
                conversation_id: conversation.id.clone(),
                category: TaskCategory::OutboundMessage,
                lane: table.lane_for(TaskCategory::OutboundMessage).to_string(),
                payload: json!({
                    "to": conversation.contact_wa_id,
                    "body": body,
                    "appConfigId": conversation.app_config_id,
                }),
            },
            OutboundEffect::Task {
                task_id,
                category,
                payload,
                ..
            } => OutboxRow {
                id: task_id.clone(),
                conversation_id: conversation.id.clone(),
                category: *category,
                lane: table.lane_for(*category).to_string(),
                payload: payload.clone(),
            },
        })
        .collect()
}

/// Persist the advanced state and its effects in one transaction, bumping
/// `last_activity_at` so a racing reaper pass backs off.
async fn persist_transition(
    state: &Arc<AppState>,
    conversation: &Conversation,
    new_state: &FlowState,
    rows: &[OutboxRow],
) -> Result<(), EngineError> {
    let now = now_iso();
    let mut tx = state.db.begin().await?;
    sqlx::query(
        "UPDATE conversations SET current_step_id = $1, status = $2, context = $3, \
         last_activity_at = $4, updated_at = $4 WHERE id = $5",
    )
    .bind(&new_state.step_id)
    .bind(new_state.status.to_string())
    .bind(new_state.context.to_string())
    .bind(&now)
    .bind(&conversation.id)
    .execute(&mut *tx)
    .await?;
    for row in rows {
        insert_outbox_row(&mut tx, row).await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Post-commit dispatch. A failure here leaves the outbox row `pending`
/// for the retry sweep; the persisted state stands either way, so a
/// transport outage never causes an inbound event to be reprocessed.
async fn dispatch_outbox_rows(state: &Arc<AppState>, rows: Vec<OutboxRow>) {
    for row in rows {
        match state.tasks.dispatch(row.task()) {
            Ok(_) => mark_outbox_dispatched(&state.db, &row.id).await,
            Err(err) => {
                tracing::warn!(
                    outbox_id = row.id.as_str(),
                    error = %err,
                    "dispatch failed, leaving effect pending"
                );
            }
        }
    }
}

/// Apply one event to a conversation under its lock: load, advance,
/// persist, dispatch. `advance` itself never awaits; the only blocking
/// I/O inside the critical section is the state load and persist.
pub async fn process_event(
    state: &Arc<AppState>,
    conversation_id: &str,
    event: FlowEvent,
) -> Result<(), EngineError> {
    let lock = state.locks.acquire(conversation_id).await;
    let _guard = lock.lock().await;

    let Some(conversation) = load_conversation(&state.db, conversation_id).await? else {
        tracing::warn!(conversation_id, "event for unknown conversation dropped");
        return Ok(());
    };
    if conversation.status == ConversationStatus::Closed {
        return Ok(());
    }

    let flow = match load_flow_definition(&state.db, &conversation.current_flow_id).await {
        Ok(Some(flow)) => flow,
        Ok(None) => {
            fail_conversation_closed(&state.db, &conversation, "flow definition missing").await;
            state.locks.remove(conversation_id).await;
            return Ok(());
        }
        Err(EngineError::Config(err)) => {
            fail_conversation_closed(&state.db, &conversation, &err.to_string()).await;
            state.locks.remove(conversation_id).await;
            return Ok(());
        }
        Err(err) => return Err(err),
    };

    let flow_state = FlowState {
        step_id: conversation.current_step_id.clone(),
        status: conversation.status,
        context: conversation.context.clone(),
    };
    let outcome = advance(&flow, flow_state.clone(), event, Utc::now());
    if outcome.effects.is_empty() && outcome.state == flow_state {
        // the event changed nothing (replay, or an event the current step
        // ignores); leave the row untouched
        return Ok(());
    }
    let rows = outbox_rows_for_effects(state.tasks.table(), &conversation, &outcome.effects);
    persist_transition(state, &conversation, &outcome.state, &rows).await?;
    if outcome.state.status == ConversationStatus::Closed {
        state.locks.remove(conversation_id).await;
    }
    dispatch_outbox_rows(state, rows).await;
    Ok(())
}

async fn process_inbound_message(
    state: &Arc<AppState>,
    config: &AppConfig,
    message: &InboundMessage,
) -> Result<(), EngineError> {
    let contact =
        ensure_contact(&state.db, config, &message.from_wa_id, &message.profile_name).await?;
    let conversation = match find_open_conversation(&state.db, &contact.id).await? {
        Some(existing) => existing,
        None => {
            let Some(flow_id) = default_flow_id(&state.db, &config.id).await? else {
                tracing::warn!(
                    app_config_id = config.id.as_str(),
                    "no enabled flow for tenant, dropping message"
                );
                return Ok(());
            };
            create_conversation(&state.db, &contact, &flow_id).await?
        }
    };
    process_event(
        state,
        &conversation.id,
        FlowEvent::ContactMessage {
            text: message.text.clone(),
        },
    )
    .await
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("waflow_server=info,warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

pub async fn run() {
    let _ = dotenvy::dotenv();
    init_tracing();

    let port = env::var("PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(4000);
    let database_url = resolve_database_url();
    let db = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .expect("failed to connect to postgres (set DATABASE_URL or POSTGRES_* env vars)");

    sqlx::migrate!("./migrations")
        .run(&db)
        .await
        .expect("failed to run sqlx migrations");

    let table = RoutingTable::standard();
    let (queue, receivers) = InProcessQueue::new(&table.lanes());
    let interactive_lane = table.lane_for(TaskCategory::OutboundMessage).to_string();
    let state = Arc::new(AppState {
        db,
        http: reqwest::Client::new(),
        tasks: TaskRouter::new(table, Arc::new(queue)),
        locks: ConversationLocks::new(),
    });

    for (lane, receiver) in receivers {
        if lane == interactive_lane {
            tokio::spawn(run_outbound_worker(state.clone(), receiver));
        } else {
            tokio::spawn(run_action_worker(state.clone(), lane, receiver));
        }
    }
    let retry_interval = env::var("OUTBOX_RETRY_INTERVAL_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(30);
    tokio::spawn(run_outbox_retry_sweep(state.clone(), retry_interval));
    tokio::spawn(reaper::run(state.clone(), ReaperConfig::from_env()));

    let app = Router::new()
        .route("/health", get(health))
        .route(
            "/webhooks/whatsapp",
            get(webhook_verify).post(webhook_event),
        )
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind TCP listener");
    tracing::info!(addr = addr.as_str(), "waflow server listening");
    axum::serve(listener, app)
        .await
        .expect("server runtime failure");
}
