use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumString};
use thiserror::Error;

use crate::flow::FlowConfigError;

/// A tenant: one business account with its own webhook secret and
/// messaging credential. Looked up by `phone_number_id` on every webhook.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub id: String,
    pub name: String,
    pub phone_number_id: String,
    pub webhook_secret: String,
    pub verify_token: String,
    pub access_token: String,
    pub active: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// The provider-assigned business number as read from an *unverified*
/// payload. Only good for selecting a candidate tenant; signature
/// verification decides whether the payload is trusted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnverifiedPhoneNumberId(pub String);

#[derive(Debug, Clone)]
pub struct Contact {
    pub id: String,
    pub app_config_id: Option<String>,
    pub wa_id: String,
    pub display_name: String,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Active,
    WaitingForInput,
    Idle,
    Closed,
}

/// A conversation row joined with the contact and tenant columns the
/// engine needs to address outbound effects.
#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: String,
    pub contact_id: String,
    pub contact_wa_id: String,
    pub app_config_id: Option<String>,
    pub current_flow_id: String,
    pub current_step_id: Option<String>,
    pub status: ConversationStatus,
    pub context: Value,
    pub last_activity_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum WebhookOutcome {
    Verified,
    SignatureFailed,
    UnmatchedTenant,
}

/// One inbound provider message extracted from a verified webhook payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub provider_message_id: String,
    pub from_wa_id: String,
    pub profile_name: String,
    pub text: String,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("flow configuration error: {0}")]
    Config(#[from] FlowConfigError),
}
