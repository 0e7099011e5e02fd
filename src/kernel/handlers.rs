//! Handler binding and the built-in rune set.
//!
//! A [`DispatchTable`] maps rune ids to native functions. Registry entries
//! without a binding are unbound: they stay visible (and are reported at
//! startup) but every call to them fails with [`HandlerError::Unbound`].

use std::collections::{BTreeMap, HashMap};

use chrono::{SecondsFormat, Utc};
use serde_json::{json, Map, Value};
use thiserror::Error;

use super::audit::LedgerError;
use super::dispatcher::CallerContext;
use super::entropy;
use super::governance::{Decision, GovernanceLedger, ReceiptRequest};
use super::guard;
use super::hashing::{canonical_hash, HashError};
use super::registry::{
    field, EvidenceMode, RegistryError, RegistrySnapshot, RuneDescriptor, StabilizationRole,
};
use super::schema::{Direction, FieldType, SchemaOverrides, SchemaSpec};

/// Rune id of the echo demo.
pub const ECHO: &str = "demo.echo";
/// Rune id of the advisory planner.
pub const PLAN: &str = "ops.plan";
/// Rune id of the governed actuator.
pub const APPLY: &str = "ops.apply";
/// Rune id of the governance decision recorder.
pub const DECIDE: &str = "governance.decide";
/// Rune id of the pure detector.
pub const DETECT: &str = "evidence.detect";
/// Rune id of the shadow-lane probe.
pub const SHADOW_PROBE: &str = "evidence.shadow_probe";

const DEFAULT_DETECT_THRESHOLD: f64 = 0.5;

/// Handler-side failures.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The payload passed the schema but is still unusable.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// The handler ran and failed.
    #[error("execution failed: {0}")]
    Failed(String),
    /// The rune is registered but has no implementation.
    #[error("rune '{0}' has no bound handler")]
    Unbound(String),
    /// A ledger the handler writes to failed.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    /// Hashing a handler value failed.
    #[error(transparent)]
    Hash(#[from] HashError),
}

impl HandlerError {
    /// Short machine-readable kind for telemetry.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::Failed(_) => "failed",
            Self::Unbound(_) => "unbound",
            Self::Ledger(_) => "ledger",
            Self::Hash(_) => "hash",
        }
    }
}

/// Everything a handler may look at.
#[derive(Debug, Clone, Copy)]
pub struct HandlerRequest<'a> {
    /// Rune being invoked.
    pub operation_id: &'a str,
    /// Validated payload.
    pub payload: &'a Value,
    /// Caller context.
    pub caller: &'a CallerContext,
    /// Governance ledger, for runes that record decisions.
    pub governance: &'a GovernanceLedger,
}

/// Native handler signature.
pub type HandlerFn = fn(&HandlerRequest<'_>) -> Result<Value, HandlerError>;

/// Binding state of a rune.
#[derive(Debug, Clone, Copy)]
pub enum RuneHandler {
    /// Bound to a native function.
    Native(HandlerFn),
    /// Registered without an implementation.
    Unbound,
}

impl RuneHandler {
    /// Run the handler.
    ///
    /// # Errors
    ///
    /// Returns the handler's error, or [`HandlerError::Unbound`].
    pub fn invoke(self, request: &HandlerRequest<'_>) -> Result<Value, HandlerError> {
        match self {
            Self::Native(f) => f(request),
            Self::Unbound => Err(HandlerError::Unbound(request.operation_id.to_owned())),
        }
    }
}

/// Rune id to handler map.
#[derive(Debug, Clone, Default)]
pub struct DispatchTable {
    bindings: HashMap<String, HandlerFn>,
}

impl DispatchTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with every built-in rune bound.
    pub fn builtin() -> Self {
        Self::new()
            .bind(ECHO, echo)
            .bind(PLAN, plan)
            .bind(APPLY, apply)
            .bind(DECIDE, decide)
            .bind(DETECT, detect)
            .bind(SHADOW_PROBE, shadow_probe)
    }

    /// Builder: bind `id` to `handler`, replacing any earlier binding.
    pub fn bind(mut self, id: &str, handler: HandlerFn) -> Self {
        self.bindings.insert(id.to_owned(), handler);
        self
    }

    /// Binding for `id`.
    pub fn resolve(&self, id: &str) -> RuneHandler {
        match self.bindings.get(id) {
            Some(f) => RuneHandler::Native(*f),
            None => RuneHandler::Unbound,
        }
    }

    /// Registered runes with no binding, sorted.
    pub fn unbound_runes(&self, snapshot: &RegistrySnapshot) -> Vec<String> {
        let mut unbound: Vec<String> = snapshot
            .runes()
            .iter()
            .filter(|r| !self.bindings.contains_key(&r.id))
            .map(|r| r.id.clone())
            .collect();
        unbound.sort();
        unbound
    }
}

// ── Built-in registry ───────────────────────────────────────────

/// Descriptors for the built-in runes.
pub fn builtin_descriptors() -> Vec<RuneDescriptor> {
    vec![
        RuneDescriptor::new(ECHO, EvidenceMode::Plain)
            .with_inputs(vec![field("msg", FieldType::String, true)])
            .with_outputs(vec![field("msg", FieldType::String, true)])
            .with_description("Echo the message back."),
        RuneDescriptor::new(PLAN, EvidenceMode::Plain)
            .with_inputs(vec![
                field("action", FieldType::String, true),
                field("service", FieldType::String, true),
                field("target", FieldType::String, true),
                field("notes", FieldType::String, false),
            ])
            .with_outputs(vec![
                field("planId", FieldType::String, true),
                field("actionOperationId", FieldType::String, true),
                field("actionPayload", FieldType::Map, true),
                field("steps", FieldType::List, true),
            ])
            .with_stabilization(StabilizationRole::Advisory)
            .with_description("Draft an operations plan without touching anything."),
        RuneDescriptor::new(APPLY, EvidenceMode::OpsActuator)
            .with_stabilization(StabilizationRole::Destructive {
                advisory: PLAN.to_owned(),
            })
            .with_description("Carry out an approved operations plan."),
        RuneDescriptor::new(DECIDE, EvidenceMode::Plain)
            .with_inputs(vec![
                field("actionOperationId", FieldType::String, true),
                field("actionPayload", FieldType::Map, true),
                field("decision", FieldType::String, true),
                field("decidedBy", FieldType::String, true),
                field("evidenceBundle", FieldType::Map, false),
                field("reason", FieldType::String, false),
            ])
            .with_outputs(vec![
                field("receiptId", FieldType::String, true),
                field("decision", FieldType::String, true),
                field("pointer", FieldType::Map, true),
            ])
            .with_description("Record a governance decision for a future action."),
        RuneDescriptor::new(DETECT, EvidenceMode::DetectorOnly)
            .with_inputs(vec![
                field("signals", FieldType::Map, true),
                field("threshold", FieldType::Float, false),
            ])
            .with_outputs(vec![
                field("findings", FieldType::List, true),
                field("outboundNetwork", FieldType::Boolean, true),
            ])
            .with_description("Flag signals at or above a threshold."),
        RuneDescriptor::new(SHADOW_PROBE, EvidenceMode::ShadowLane)
            .with_inputs(vec![field("observation", FieldType::Map, true)])
            .with_outputs(vec![
                field("observationHash", FieldType::String, true),
                field("fieldCount", FieldType::Integer, true),
                field("lane", FieldType::String, true),
            ])
            .with_description("Fingerprint an observation in the shadow lane."),
    ]
}

/// Registry snapshot of the built-in runes.
///
/// # Errors
///
/// Returns [`RegistryError`] if the descriptors fail validation.
pub fn builtin_registry() -> Result<RegistrySnapshot, RegistryError> {
    RegistrySnapshot::from_descriptors(builtin_descriptors())
}

/// Strict schemas for the built-in actuator.
pub fn builtin_schema_overrides() -> SchemaOverrides {
    let mut overrides = SchemaOverrides::new();
    let input = SchemaSpec {
        required: BTreeMap::from([
            ("governanceReceiptId".to_owned(), FieldType::String),
            ("action".to_owned(), FieldType::String),
            ("service".to_owned(), FieldType::String),
            ("target".to_owned(), FieldType::String),
        ]),
        optional: BTreeMap::from([("seed".to_owned(), FieldType::Integer)]),
        allow_extra: false,
    };
    let output = SchemaSpec {
        required: BTreeMap::from([
            ("applied".to_owned(), FieldType::Boolean),
            ("action".to_owned(), FieldType::String),
            ("service".to_owned(), FieldType::String),
            ("target".to_owned(), FieldType::String),
            ("receiptId".to_owned(), FieldType::String),
            ("appliedAt".to_owned(), FieldType::String),
        ]),
        optional: BTreeMap::new(),
        allow_extra: false,
    };
    overrides.insert(APPLY, Direction::Input, input);
    overrides.insert(APPLY, Direction::Output, output);
    overrides
}

// ── Built-in handlers ───────────────────────────────────────────

fn str_field<'a>(payload: &'a Value, name: &str) -> Result<&'a str, HandlerError> {
    payload
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| HandlerError::InvalidInput(format!("'{name}' must be a string")))
}

fn echo(request: &HandlerRequest<'_>) -> Result<Value, HandlerError> {
    let msg = str_field(request.payload, "msg")?;
    Ok(json!({ "msg": msg }))
}

fn plan(request: &HandlerRequest<'_>) -> Result<Value, HandlerError> {
    let action = str_field(request.payload, "action")?;
    let service = str_field(request.payload, "service")?;
    let target = str_field(request.payload, "target")?;
    let plan_id = format!("plan-{:016x}", entropy::next_u64());
    Ok(json!({
        "planId": plan_id,
        "actionOperationId": APPLY,
        "actionPayload": { "action": action, "service": service, "target": target },
        "steps": [
            format!("check {service} health on {target}"),
            format!("{action} {service} on {target}"),
            format!("confirm {service} health on {target}"),
        ],
    }))
}

fn apply(request: &HandlerRequest<'_>) -> Result<Value, HandlerError> {
    let receipt_id = str_field(request.payload, "governanceReceiptId")?;
    Ok(json!({
        "applied": true,
        "action": str_field(request.payload, "action")?,
        "service": str_field(request.payload, "service")?,
        "target": str_field(request.payload, "target")?,
        "receiptId": receipt_id,
        "appliedAt": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    }))
}

fn decide(request: &HandlerRequest<'_>) -> Result<Value, HandlerError> {
    let payload = request.payload;
    let decision: Decision = str_field(payload, "decision")?
        .parse()
        .map_err(HandlerError::InvalidInput)?;
    let receipt = ReceiptRequest {
        action_operation_id: str_field(payload, "actionOperationId")?.to_owned(),
        action_payload: payload.get("actionPayload").cloned().unwrap_or(Value::Null),
        evidence_bundle: payload
            .get("evidenceBundle")
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new())),
        decision,
        decided_by: str_field(payload, "decidedBy")?.to_owned(),
        reason: payload
            .get("reason")
            .and_then(Value::as_str)
            .map(str::to_owned),
    };
    let pointer = request.governance.record_receipt(receipt)?;
    Ok(json!({
        "receiptId": pointer.hash,
        "decision": decision.as_str(),
        "pointer": {
            "scheme": pointer.scheme,
            "path": pointer.path,
            "hash": pointer.hash,
        },
    }))
}

fn detect(request: &HandlerRequest<'_>) -> Result<Value, HandlerError> {
    let signals = request
        .payload
        .get("signals")
        .and_then(Value::as_object)
        .ok_or_else(|| HandlerError::InvalidInput("'signals' must be an object".to_owned()))?;
    let threshold = request
        .payload
        .get("threshold")
        .and_then(Value::as_f64)
        .unwrap_or(DEFAULT_DETECT_THRESHOLD);
    // Map iteration is key-ordered, so findings come out sorted.
    let findings: Vec<&String> = signals
        .iter()
        .filter(|(_, v)| v.as_f64().is_some_and(|score| score >= threshold))
        .map(|(k, _)| k)
        .collect();
    Ok(json!({
        "findings": findings,
        "outboundNetwork": guard::outbound_allowed(),
    }))
}

fn shadow_probe(request: &HandlerRequest<'_>) -> Result<Value, HandlerError> {
    let observation = request
        .payload
        .get("observation")
        .and_then(Value::as_object)
        .ok_or_else(|| HandlerError::InvalidInput("'observation' must be an object".to_owned()))?;
    let field_count = u64::try_from(observation.len()).unwrap_or(u64::MAX);
    Ok(json!({
        "observationHash": canonical_hash(observation)?,
        "fieldCount": field_count,
        "lane": "shadow",
    }))
}
