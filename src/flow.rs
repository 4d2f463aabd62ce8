use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::context::{display_value, render, resolve, set_path, type_name};
use crate::tasks::TaskCategory;
use crate::types::ConversationStatus;

/// Upper bound on steps executed per inbound event. Stops a mis-wired
/// flow graph from spinning; hitting it fails the conversation closed.
pub const MAX_STEPS_PER_EVENT: usize = 32;

/// Context key holding `{taskId, deadline}` while a blocking action-call
/// is in flight. Overwritten (never removed) once the action resolves.
pub const PENDING_ACTION_KEY: &str = "pending_action";

/// Context key the completion payload of a blocking action-call lands in.
pub const ACTION_RESULT_KEY: &str = "action_result";

/// Context key recording why a conversation was failed closed.
pub const CLOSED_REASON_KEY: &str = "closed_reason";

const DEFAULT_ACTION_TIMEOUT_SECS: i64 = 300;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowDefinition {
    pub entry: String,
    pub steps: Vec<FlowStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowStep {
    pub id: String,
    #[serde(flatten)]
    pub kind: StepKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    /// Render the template against context and emit one outbound message.
    /// A missing `next` ends the flow cleanly.
    #[serde(rename_all = "camelCase")]
    SendMessage {
        template: String,
        #[serde(default)]
        next: Option<String>,
    },
    /// Park the conversation until the contact replies; the reply is
    /// stored (typed) at `save_key`, then the flow continues at `next`.
    #[serde(rename_all = "camelCase")]
    AwaitReply { save_key: String, next: String },
    /// First rule whose condition matches picks the next step; no match
    /// falls through to `default_next`. A branch without a default is
    /// rejected when the definition is loaded.
    #[serde(rename_all = "camelCase")]
    Branch {
        rules: Vec<BranchRule>,
        default_next: String,
    },
    /// Dispatch an async task carrying the rendered payload. Non-blocking
    /// calls advance immediately; blocking calls park the conversation
    /// until the task completes or its deadline passes.
    #[serde(rename_all = "camelCase")]
    ActionCall {
        action: TaskCategory,
        #[serde(default)]
        payload: Value,
        #[serde(default)]
        blocking: bool,
        #[serde(default)]
        timeout_seconds: Option<i64>,
        #[serde(default)]
        next: Option<String>,
        #[serde(default)]
        on_timeout: Option<String>,
    },
    /// Close the conversation, optionally sending a rendered farewell.
    #[serde(rename_all = "camelCase")]
    Terminate {
        #[serde(default)]
        template: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchRule {
    pub path: String,
    pub operator: RuleOperator,
    #[serde(default)]
    pub value: Value,
    pub next: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleOperator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    GreaterThan,
    GreaterOrEqual,
    LessThan,
    LessOrEqual,
    IsEmpty,
    IsNotEmpty,
}

#[derive(Debug, Error)]
pub enum FlowConfigError {
    #[error("flow definition is not valid: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("flow has no steps")]
    Empty,

    #[error("duplicate step id '{0}'")]
    DuplicateStep(String),

    #[error("entry step '{0}' not found")]
    MissingEntry(String),

    #[error("step '{step}' references unknown step '{target}'")]
    DanglingReference { step: String, target: String },
}

impl FlowDefinition {
    /// Parse and validate a stored definition. Malformed JSON, a branch
    /// without a default (a serde error — the field is mandatory), and
    /// dangling step references are all caught here, at load time.
    pub fn parse(raw: &str) -> Result<Self, FlowConfigError> {
        let definition: FlowDefinition = serde_json::from_str(raw)?;
        definition.validate()?;
        Ok(definition)
    }

    pub fn validate(&self) -> Result<(), FlowConfigError> {
        if self.steps.is_empty() {
            return Err(FlowConfigError::Empty);
        }
        let mut ids = HashSet::new();
        for step in &self.steps {
            if !ids.insert(step.id.as_str()) {
                return Err(FlowConfigError::DuplicateStep(step.id.clone()));
            }
        }
        if !ids.contains(self.entry.as_str()) {
            return Err(FlowConfigError::MissingEntry(self.entry.clone()));
        }
        for step in &self.steps {
            for target in step.targets() {
                if !ids.contains(target) {
                    return Err(FlowConfigError::DanglingReference {
                        step: step.id.clone(),
                        target: target.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn step(&self, id: &str) -> Option<&FlowStep> {
        self.steps.iter().find(|step| step.id == id)
    }

    fn step_index(&self) -> HashMap<&str, &FlowStep> {
        self.steps.iter().map(|step| (step.id.as_str(), step)).collect()
    }
}

impl FlowStep {
    fn targets(&self) -> Vec<&str> {
        match &self.kind {
            StepKind::SendMessage { next, .. } => next.iter().map(String::as_str).collect(),
            StepKind::AwaitReply { next, .. } => vec![next.as_str()],
            StepKind::Branch { rules, default_next } => rules
                .iter()
                .map(|rule| rule.next.as_str())
                .chain(std::iter::once(default_next.as_str()))
                .collect(),
            StepKind::ActionCall { next, on_timeout, .. } => next
                .iter()
                .chain(on_timeout.iter())
                .map(String::as_str)
                .collect(),
            StepKind::Terminate { .. } => vec![],
        }
    }
}

/// The mutable slice of a conversation the state machine works on.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowState {
    pub step_id: Option<String>,
    pub status: ConversationStatus,
    pub context: Value,
}

impl FlowState {
    /// State of a freshly created conversation, before any step has run.
    pub fn opening(context: Value) -> Self {
        Self {
            step_id: None,
            status: ConversationStatus::Active,
            context,
        }
    }
}

#[derive(Debug, Clone)]
pub enum FlowEvent {
    ContactMessage { text: String },
    ActionCompleted { task_id: String, result: Value },
    ActionTimedOut,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutboundEffect {
    Message {
        body: String,
    },
    Task {
        task_id: String,
        category: TaskCategory,
        payload: Value,
        blocking: bool,
    },
}

#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub state: FlowState,
    pub effects: Vec<OutboundEffect>,
}

enum Resumption {
    Continue(Option<String>),
    Stay,
    FailClosed(&'static str),
}

/// Run one inbound event through the flow. Pure: no I/O, no clock reads
/// beyond the supplied `now`. Returns the new state plus the outbound
/// effects to dispatch; callers persist the state before dispatching.
pub fn advance(
    flow: &FlowDefinition,
    mut state: FlowState,
    event: FlowEvent,
    now: DateTime<Utc>,
) -> StepOutcome {
    let mut effects: Vec<OutboundEffect> = Vec::new();
    if state.status == ConversationStatus::Closed {
        return StepOutcome { state, effects };
    }
    let steps = flow.step_index();

    let parked = matches!(
        state.status,
        ConversationStatus::WaitingForInput | ConversationStatus::Idle
    );
    let mut cursor: Option<String> = match state.step_id.clone() {
        Some(step_id) if parked => {
            let Some(step) = steps.get(step_id.as_str()) else {
                fail_closed(&mut state, "current step missing from flow definition");
                return StepOutcome { state, effects };
            };
            match consume_parked_event(step, &event, &mut state, now) {
                Resumption::Continue(next) => next,
                Resumption::Stay => return StepOutcome { state, effects },
                Resumption::FailClosed(reason) => {
                    fail_closed(&mut state, reason);
                    return StepOutcome { state, effects };
                }
            }
        }
        step_id => {
            // Not parked on an input-consuming step: only a contact
            // message may (re)start the walk.
            if !matches!(event, FlowEvent::ContactMessage { .. }) {
                return StepOutcome { state, effects };
            }
            Some(step_id.unwrap_or_else(|| flow.entry.clone()))
        }
    };

    state.status = ConversationStatus::Active;

    for _ in 0..MAX_STEPS_PER_EVENT {
        let Some(current_id) = cursor else {
            // walked off the end of the flow
            state.status = ConversationStatus::Closed;
            state.step_id = None;
            return StepOutcome { state, effects };
        };
        let Some(step) = steps.get(current_id.as_str()) else {
            fail_closed(&mut state, "next step missing from flow definition");
            return StepOutcome { state, effects };
        };
        state.step_id = Some(current_id.clone());

        match &step.kind {
            StepKind::SendMessage { template, next } => {
                effects.push(OutboundEffect::Message {
                    body: render(template, &state.context),
                });
                cursor = next.clone();
            }
            StepKind::AwaitReply { .. } => {
                state.status = ConversationStatus::WaitingForInput;
                return StepOutcome { state, effects };
            }
            StepKind::Branch { rules, default_next } => {
                cursor = Some(
                    rules
                        .iter()
                        .find(|rule| rule_matches(rule, &state.context))
                        .map(|rule| rule.next.clone())
                        .unwrap_or_else(|| default_next.clone()),
                );
            }
            StepKind::ActionCall {
                action,
                payload,
                blocking,
                timeout_seconds,
                next,
                ..
            } => {
                let task_id = Uuid::new_v4().to_string();
                effects.push(OutboundEffect::Task {
                    task_id: task_id.clone(),
                    category: *action,
                    payload: render_payload(payload, &state.context),
                    blocking: *blocking,
                });
                if *blocking {
                    let deadline = now
                        + ChronoDuration::seconds(
                            timeout_seconds.unwrap_or(DEFAULT_ACTION_TIMEOUT_SECS),
                        );
                    set_path(
                        &mut state.context,
                        PENDING_ACTION_KEY,
                        json!({ "taskId": task_id, "deadline": deadline.to_rfc3339() }),
                    );
                    state.status = ConversationStatus::WaitingForInput;
                    return StepOutcome { state, effects };
                }
                cursor = next.clone();
            }
            StepKind::Terminate { template } => {
                if let Some(template) = template {
                    let body = render(template, &state.context);
                    if !body.is_empty() {
                        effects.push(OutboundEffect::Message { body });
                    }
                }
                state.status = ConversationStatus::Closed;
                state.step_id = None;
                return StepOutcome { state, effects };
            }
        }
    }

    fail_closed(&mut state, "step budget exhausted");
    StepOutcome { state, effects }
}

/// Apply an event to the step the conversation is parked on.
fn consume_parked_event(
    step: &FlowStep,
    event: &FlowEvent,
    state: &mut FlowState,
    now: DateTime<Utc>,
) -> Resumption {
    match (&step.kind, event) {
        (StepKind::AwaitReply { save_key, next }, FlowEvent::ContactMessage { text }) => {
            let value = typed_reply(text);
            tracing::debug!(
                key = save_key.as_str(),
                kind = type_name(Some(&value)),
                "stored contact reply in context"
            );
            set_path(&mut state.context, save_key, value);
            Resumption::Continue(Some(next.clone()))
        }
        (
            StepKind::ActionCall { next, .. },
            FlowEvent::ActionCompleted { task_id, result },
        ) => {
            // A completion only resumes the task the conversation is
            // actually parked on; stale completions are dropped.
            let expected = resolve(&state.context, "pending_action.taskId")
                .and_then(Value::as_str);
            if expected.is_some_and(|pending| pending != task_id.as_str()) {
                tracing::debug!(
                    task_id = task_id.as_str(),
                    "ignoring completion for a task that is not pending"
                );
                return Resumption::Stay;
            }
            set_path(&mut state.context, ACTION_RESULT_KEY, result.clone());
            set_path(
                &mut state.context,
                PENDING_ACTION_KEY,
                json!({ "taskId": task_id, "resolved": true }),
            );
            Resumption::Continue(next.clone())
        }
        (StepKind::ActionCall { on_timeout, .. }, FlowEvent::ActionTimedOut) => {
            resolve_action_timeout(on_timeout, state)
        }
        (StepKind::ActionCall { on_timeout, .. }, FlowEvent::ContactMessage { .. }) => {
            // A contact reply cannot satisfy a blocking action. If the
            // deadline already passed, take the failure branch now.
            if pending_action_deadline(&state.context).is_some_and(|deadline| deadline <= now) {
                resolve_action_timeout(on_timeout, state)
            } else {
                Resumption::Stay
            }
        }
        _ => Resumption::Stay,
    }
}

fn resolve_action_timeout(on_timeout: &Option<String>, state: &mut FlowState) -> Resumption {
    set_path(
        &mut state.context,
        PENDING_ACTION_KEY,
        json!({ "resolved": true, "timedOut": true }),
    );
    match on_timeout {
        Some(target) => Resumption::Continue(Some(target.clone())),
        None => Resumption::FailClosed("blocking action timed out with no failure branch"),
    }
}

fn fail_closed(state: &mut FlowState, reason: &str) {
    tracing::warn!(
        step = state.step_id.as_deref().unwrap_or(""),
        reason,
        "failing conversation closed"
    );
    set_path(
        &mut state.context,
        CLOSED_REASON_KEY,
        Value::String(reason.to_string()),
    );
    state.status = ConversationStatus::Closed;
    state.step_id = None;
}

/// Parse a contact reply into a typed value: int, then float, then bool,
/// else the trimmed text.
pub fn typed_reply(text: &str) -> Value {
    let trimmed = text.trim();
    if let Ok(number) = trimmed.parse::<i64>() {
        return Value::from(number);
    }
    if let Ok(number) = trimmed.parse::<f64>() {
        if number.is_finite() {
            return json!(number);
        }
    }
    match trimmed.to_ascii_lowercase().as_str() {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(trimmed.to_string()),
    }
}

/// Deadline of the blocking action the conversation is parked on, if any.
pub fn pending_action_deadline(context: &Value) -> Option<DateTime<Utc>> {
    resolve(context, "pending_action.deadline")
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|ts| ts.with_timezone(&Utc))
}

/// Render every string leaf of an action payload against the context.
fn render_payload(payload: &Value, context: &Value) -> Value {
    match payload {
        Value::String(template) => Value::String(render(template, context)),
        Value::Array(items) => {
            Value::Array(items.iter().map(|item| render_payload(item, context)).collect())
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| (key.clone(), render_payload(item, context)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn is_empty_value(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(text)) => text.trim().is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        Some(Value::Object(map)) => map.is_empty(),
        _ => false,
    }
}

fn rule_matches(rule: &BranchRule, context: &Value) -> bool {
    let actual = resolve(context, &rule.path);
    match rule.operator {
        RuleOperator::IsEmpty => is_empty_value(actual),
        RuleOperator::IsNotEmpty => !is_empty_value(actual),
        RuleOperator::GreaterThan
        | RuleOperator::GreaterOrEqual
        | RuleOperator::LessThan
        | RuleOperator::LessOrEqual => {
            let (Some(left), Some(right)) = (actual.and_then(numeric), numeric(&rule.value))
            else {
                return false;
            };
            match rule.operator {
                RuleOperator::GreaterThan => left > right,
                RuleOperator::GreaterOrEqual => left >= right,
                RuleOperator::LessThan => left < right,
                _ => left <= right,
            }
        }
        RuleOperator::Equals | RuleOperator::NotEquals => {
            let equal = match (actual.and_then(numeric), numeric(&rule.value)) {
                (Some(left), Some(right)) => left == right,
                _ => {
                    let left = actual.map(display_value).unwrap_or_default();
                    left.to_ascii_lowercase()
                        == display_value(&rule.value).to_ascii_lowercase()
                }
            };
            if rule.operator == RuleOperator::NotEquals {
                !equal
            } else {
                equal
            }
        }
        RuleOperator::Contains
        | RuleOperator::NotContains
        | RuleOperator::StartsWith
        | RuleOperator::EndsWith => {
            let left = actual
                .map(display_value)
                .unwrap_or_default()
                .to_ascii_lowercase();
            let right = display_value(&rule.value).to_ascii_lowercase();
            match rule.operator {
                RuleOperator::Contains => left.contains(&right),
                RuleOperator::NotContains => !left.contains(&right),
                RuleOperator::StartsWith => left.starts_with(&right),
                _ => left.ends_with(&right),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str, kind: StepKind) -> FlowStep {
        FlowStep {
            id: id.to_string(),
            kind,
        }
    }

    fn send(id: &str, template: &str, next: Option<&str>) -> FlowStep {
        step(
            id,
            StepKind::SendMessage {
                template: template.to_string(),
                next: next.map(str::to_string),
            },
        )
    }

    fn flow(entry: &str, steps: Vec<FlowStep>) -> FlowDefinition {
        let definition = FlowDefinition {
            entry: entry.to_string(),
            steps,
        };
        definition.validate().expect("test flow should be valid");
        definition
    }

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-08-04T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn parse_rejects_branch_without_default() {
        let raw = r#"{
            "entry": "b",
            "steps": [
                { "id": "b", "kind": "branch",
                  "rules": [ { "path": "age", "operator": "greater_or_equal", "value": 18, "next": "b" } ] }
            ]
        }"#;
        assert!(matches!(
            FlowDefinition::parse(raw),
            Err(FlowConfigError::Parse(_))
        ));
    }

    #[test]
    fn parse_accepts_well_formed_definition() {
        let raw = r#"{
            "entry": "hello",
            "steps": [
                { "id": "hello", "kind": "send_message", "template": "Hi {{contact.name}}", "next": "bye" },
                { "id": "bye", "kind": "terminate" }
            ]
        }"#;
        let definition = FlowDefinition::parse(raw).unwrap();
        assert_eq!(definition.entry, "hello");
        assert_eq!(definition.steps.len(), 2);
    }

    #[test]
    fn validate_rejects_dangling_reference() {
        let definition = FlowDefinition {
            entry: "a".to_string(),
            steps: vec![send("a", "hi", Some("ghost"))],
        };
        assert!(matches!(
            definition.validate(),
            Err(FlowConfigError::DanglingReference { .. })
        ));
    }

    #[test]
    fn validate_rejects_duplicate_ids_and_missing_entry() {
        let duplicated = FlowDefinition {
            entry: "a".to_string(),
            steps: vec![send("a", "x", None), send("a", "y", None)],
        };
        assert!(matches!(
            duplicated.validate(),
            Err(FlowConfigError::DuplicateStep(_))
        ));

        let no_entry = FlowDefinition {
            entry: "ghost".to_string(),
            steps: vec![send("a", "x", None)],
        };
        assert!(matches!(
            no_entry.validate(),
            Err(FlowConfigError::MissingEntry(_))
        ));
    }

    #[test]
    fn typed_reply_parses_in_precedence_order() {
        assert_eq!(typed_reply("17"), json!(17));
        assert_eq!(typed_reply(" 4.5 "), json!(4.5));
        assert_eq!(typed_reply("TRUE"), json!(true));
        assert_eq!(typed_reply("false"), json!(false));
        assert_eq!(typed_reply(" yes "), json!("yes"));
    }

    #[test]
    fn send_message_renders_and_advances() {
        let definition = flow(
            "hello",
            vec![
                send("hello", "Hello {{contact.name}}", Some("ask")),
                step(
                    "ask",
                    StepKind::AwaitReply {
                        save_key: "answer".to_string(),
                        next: "hello".to_string(),
                    },
                ),
            ],
        );
        let state = FlowState::opening(json!({ "contact": { "name": "Alice" } }));
        let outcome = advance(
            &definition,
            state,
            FlowEvent::ContactMessage { text: "hi".to_string() },
            now(),
        );
        assert_eq!(
            outcome.effects,
            vec![OutboundEffect::Message { body: "Hello Alice".to_string() }]
        );
        assert_eq!(outcome.state.status, ConversationStatus::WaitingForInput);
        assert_eq!(outcome.state.step_id.as_deref(), Some("ask"));
    }

    #[test]
    fn send_message_without_next_closes_cleanly() {
        let definition = flow("only", vec![send("only", "bye", None)]);
        let outcome = advance(
            &definition,
            FlowState::opening(json!({})),
            FlowEvent::ContactMessage { text: "hi".to_string() },
            now(),
        );
        assert_eq!(outcome.state.status, ConversationStatus::Closed);
        assert_eq!(outcome.state.step_id, None);
        assert_eq!(outcome.effects.len(), 1);
    }

    #[test]
    fn await_reply_stores_typed_value_and_branch_picks_first_match() {
        let definition = flow(
            "ask",
            vec![
                step(
                    "ask",
                    StepKind::AwaitReply {
                        save_key: "age".to_string(),
                        next: "check".to_string(),
                    },
                ),
                step(
                    "check",
                    StepKind::Branch {
                        rules: vec![
                            BranchRule {
                                path: "age".to_string(),
                                operator: RuleOperator::GreaterOrEqual,
                                value: json!(18),
                                next: "adult".to_string(),
                            },
                            BranchRule {
                                path: "age".to_string(),
                                operator: RuleOperator::LessThan,
                                value: json!(18),
                                next: "minor".to_string(),
                            },
                        ],
                        default_next: "fallback".to_string(),
                    },
                ),
                send("adult", "welcome", None),
                step(
                    "minor",
                    StepKind::AwaitReply {
                        save_key: "guardian".to_string(),
                        next: "adult".to_string(),
                    },
                ),
                send("fallback", "hm", None),
            ],
        );
        let state = FlowState {
            step_id: Some("ask".to_string()),
            status: ConversationStatus::WaitingForInput,
            context: json!({}),
        };
        let outcome = advance(
            &definition,
            state,
            FlowEvent::ContactMessage { text: "17".to_string() },
            now(),
        );
        // reply stored as a typed int, branch evaluated against it
        assert_eq!(outcome.state.context["age"], json!(17));
        assert_eq!(outcome.state.step_id.as_deref(), Some("minor"));
        assert_eq!(outcome.state.status, ConversationStatus::WaitingForInput);
    }

    #[test]
    fn branch_falls_through_to_default() {
        let definition = flow(
            "check",
            vec![
                step(
                    "check",
                    StepKind::Branch {
                        rules: vec![BranchRule {
                            path: "plan".to_string(),
                            operator: RuleOperator::Equals,
                            value: json!("pro"),
                            next: "pro".to_string(),
                        }],
                        default_next: "free".to_string(),
                    },
                ),
                send("pro", "pro plan", None),
                send("free", "free plan", None),
            ],
        );
        let outcome = advance(
            &definition,
            FlowState::opening(json!({ "plan": "starter" })),
            FlowEvent::ContactMessage { text: "hi".to_string() },
            now(),
        );
        assert_eq!(
            outcome.effects,
            vec![OutboundEffect::Message { body: "free plan".to_string() }]
        );
    }

    #[test]
    fn terminate_closes_and_clears_step() {
        let definition = flow(
            "bye",
            vec![step(
                "bye",
                StepKind::Terminate {
                    template: Some("Bye {{contact.name}}".to_string()),
                },
            )],
        );
        let outcome = advance(
            &definition,
            FlowState::opening(json!({ "contact": { "name": "Ana" } })),
            FlowEvent::ContactMessage { text: "quit".to_string() },
            now(),
        );
        assert_eq!(outcome.state.status, ConversationStatus::Closed);
        assert_eq!(outcome.state.step_id, None);
        assert_eq!(
            outcome.effects,
            vec![OutboundEffect::Message { body: "Bye Ana".to_string() }]
        );
    }

    #[test]
    fn events_on_closed_conversations_are_noops() {
        let definition = flow("only", vec![send("only", "hi", None)]);
        let state = FlowState {
            step_id: None,
            status: ConversationStatus::Closed,
            context: json!({}),
        };
        let outcome = advance(
            &definition,
            state,
            FlowEvent::ContactMessage { text: "again".to_string() },
            now(),
        );
        assert!(outcome.effects.is_empty());
        assert_eq!(outcome.state.status, ConversationStatus::Closed);
    }

    #[test]
    fn missing_current_step_fails_closed() {
        let definition = flow("a", vec![send("a", "hi", None)]);
        let state = FlowState {
            step_id: Some("removed-by-edit".to_string()),
            status: ConversationStatus::WaitingForInput,
            context: json!({}),
        };
        let outcome = advance(
            &definition,
            state,
            FlowEvent::ContactMessage { text: "hello".to_string() },
            now(),
        );
        assert_eq!(outcome.state.status, ConversationStatus::Closed);
        assert_eq!(outcome.state.step_id, None);
        assert!(outcome.effects.is_empty());
        assert_eq!(
            outcome.state.context[CLOSED_REASON_KEY],
            json!("current step missing from flow definition")
        );
    }

    #[test]
    fn step_budget_stops_runaway_cycles() {
        let definition = flow(
            "a",
            vec![send("a", "ping", Some("b")), send("b", "pong", Some("a"))],
        );
        let outcome = advance(
            &definition,
            FlowState::opening(json!({})),
            FlowEvent::ContactMessage { text: "go".to_string() },
            now(),
        );
        assert_eq!(outcome.state.status, ConversationStatus::Closed);
        assert_eq!(outcome.effects.len(), MAX_STEPS_PER_EVENT);
    }

    #[test]
    fn non_blocking_action_call_advances_optimistically() {
        let definition = flow(
            "lookup",
            vec![
                step(
                    "lookup",
                    StepKind::ActionCall {
                        action: TaskCategory::DataLookup,
                        payload: json!({ "phone": "{{contact.phone}}" }),
                        blocking: false,
                        timeout_seconds: None,
                        next: Some("done".to_string()),
                        on_timeout: None,
                    },
                ),
                send("done", "thanks", None),
            ],
        );
        let outcome = advance(
            &definition,
            FlowState::opening(json!({ "contact": { "phone": "5511888887777" } })),
            FlowEvent::ContactMessage { text: "start".to_string() },
            now(),
        );
        assert_eq!(outcome.effects.len(), 2);
        match &outcome.effects[0] {
            OutboundEffect::Task { category, payload, blocking, .. } => {
                assert_eq!(*category, TaskCategory::DataLookup);
                assert_eq!(payload["phone"], json!("5511888887777"));
                assert!(!blocking);
            }
            other => panic!("expected task effect, got {other:?}"),
        }
        assert_eq!(outcome.state.status, ConversationStatus::Closed);
    }

    fn blocking_flow() -> FlowDefinition {
        flow(
            "pay",
            vec![
                step(
                    "pay",
                    StepKind::ActionCall {
                        action: TaskCategory::PaymentRequest,
                        payload: json!({ "amount": 10 }),
                        blocking: true,
                        timeout_seconds: Some(60),
                        next: Some("paid".to_string()),
                        on_timeout: Some("expired".to_string()),
                    },
                ),
                send("paid", "payment ok: {{action_result.status}}", None),
                send("expired", "payment expired", None),
            ],
        )
    }

    #[test]
    fn blocking_action_call_parks_and_resumes_on_completion() {
        let definition = blocking_flow();
        let outcome = advance(
            &definition,
            FlowState::opening(json!({})),
            FlowEvent::ContactMessage { text: "pay".to_string() },
            now(),
        );
        assert_eq!(outcome.state.status, ConversationStatus::WaitingForInput);
        assert_eq!(outcome.state.step_id.as_deref(), Some("pay"));
        let deadline = pending_action_deadline(&outcome.state.context).unwrap();
        assert_eq!(deadline, now() + ChronoDuration::seconds(60));

        let pending_task_id = resolve(&outcome.state.context, "pending_action.taskId")
            .and_then(Value::as_str)
            .unwrap()
            .to_string();
        let completed = advance(
            &definition,
            outcome.state,
            FlowEvent::ActionCompleted {
                task_id: pending_task_id,
                result: json!({ "status": "settled" }),
            },
            now(),
        );
        assert_eq!(
            completed.effects,
            vec![OutboundEffect::Message { body: "payment ok: settled".to_string() }]
        );
        assert_eq!(completed.state.status, ConversationStatus::Closed);
    }

    #[test]
    fn completion_for_a_different_task_is_ignored() {
        let definition = blocking_flow();
        let parked = advance(
            &definition,
            FlowState::opening(json!({})),
            FlowEvent::ContactMessage { text: "pay".to_string() },
            now(),
        );
        let stale = advance(
            &definition,
            parked.state,
            FlowEvent::ActionCompleted {
                task_id: "some-earlier-task".to_string(),
                result: json!({ "status": "settled" }),
            },
            now(),
        );
        assert!(stale.effects.is_empty());
        assert_eq!(stale.state.status, ConversationStatus::WaitingForInput);
        assert_eq!(stale.state.step_id.as_deref(), Some("pay"));
    }

    #[test]
    fn blocking_action_timeout_takes_failure_branch() {
        let definition = blocking_flow();
        let parked = advance(
            &definition,
            FlowState::opening(json!({})),
            FlowEvent::ContactMessage { text: "pay".to_string() },
            now(),
        );
        let timed_out = advance(&definition, parked.state, FlowEvent::ActionTimedOut, now());
        assert_eq!(
            timed_out.effects,
            vec![OutboundEffect::Message { body: "payment expired".to_string() }]
        );
    }

    #[test]
    fn contact_message_during_fresh_blocking_wait_is_ignored() {
        let definition = blocking_flow();
        let parked = advance(
            &definition,
            FlowState::opening(json!({})),
            FlowEvent::ContactMessage { text: "pay".to_string() },
            now(),
        );
        let nudged = advance(
            &definition,
            parked.state,
            FlowEvent::ContactMessage { text: "hello?".to_string() },
            now(),
        );
        assert!(nudged.effects.is_empty());
        assert_eq!(nudged.state.status, ConversationStatus::WaitingForInput);
        assert_eq!(nudged.state.step_id.as_deref(), Some("pay"));
    }

    #[test]
    fn contact_message_after_deadline_takes_failure_branch() {
        let definition = blocking_flow();
        let parked = advance(
            &definition,
            FlowState::opening(json!({})),
            FlowEvent::ContactMessage { text: "pay".to_string() },
            now(),
        );
        let late = now() + ChronoDuration::seconds(120);
        let nudged = advance(
            &definition,
            parked.state,
            FlowEvent::ContactMessage { text: "hello?".to_string() },
            late,
        );
        assert_eq!(
            nudged.effects,
            vec![OutboundEffect::Message { body: "payment expired".to_string() }]
        );
    }

    #[test]
    fn idle_conversation_resumes_like_a_parked_one() {
        let definition = flow(
            "ask",
            vec![
                step(
                    "ask",
                    StepKind::AwaitReply {
                        save_key: "answer".to_string(),
                        next: "done".to_string(),
                    },
                ),
                send("done", "got {{answer}}", None),
            ],
        );
        let state = FlowState {
            step_id: Some("ask".to_string()),
            status: ConversationStatus::Idle,
            context: json!({}),
        };
        let outcome = advance(
            &definition,
            state,
            FlowEvent::ContactMessage { text: "42".to_string() },
            now(),
        );
        assert_eq!(
            outcome.effects,
            vec![OutboundEffect::Message { body: "got 42".to_string() }]
        );
    }

    #[test]
    fn rule_operators_cover_string_and_numeric_forms() {
        let context = json!({ "age": 21, "name": "Alice", "tags": [] });
        let rule = |path: &str, operator, value| BranchRule {
            path: path.to_string(),
            operator,
            value,
            next: "x".to_string(),
        };
        assert!(rule_matches(&rule("age", RuleOperator::GreaterThan, json!(18)), &context));
        assert!(rule_matches(&rule("age", RuleOperator::Equals, json!("21")), &context));
        assert!(rule_matches(&rule("name", RuleOperator::Equals, json!("alice")), &context));
        assert!(rule_matches(&rule("name", RuleOperator::Contains, json!("lic")), &context));
        assert!(rule_matches(&rule("name", RuleOperator::StartsWith, json!("al")), &context));
        assert!(rule_matches(&rule("tags", RuleOperator::IsEmpty, json!(null)), &context));
        assert!(rule_matches(&rule("missing", RuleOperator::IsEmpty, json!(null)), &context));
        assert!(!rule_matches(&rule("age", RuleOperator::LessThan, json!(18)), &context));
        assert!(!rule_matches(&rule("missing", RuleOperator::GreaterThan, json!(1)), &context));
    }
}
