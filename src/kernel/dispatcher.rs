//! The kernel dispatcher: the single entry point for rune invocation.
//!
//! A call moves through a fixed sequence, and every refusal happens before
//! the handler runs:
//!
//! 1. resolve the rune in a freshly loaded registry snapshot
//! 2. policy gate (reject telemetry on denial)
//! 3. inbound schema validation (reject telemetry on failure)
//! 4. evidence-mode and stabilization gates
//! 5. explicit seeding of the ambient random source
//! 6. start telemetry
//! 7. handler, behind a purity guard for detector-class runes
//! 8. outbound validation (fatal only for actuators)
//! 9. provenance
//! 10. dual write to the invocation ledger and event almanac
//! 11. advisory-cycle increment, then end telemetry
//!
//! Ledgers only ever see successful calls.

use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe, Location};
use std::sync::Arc;
use std::time::Instant;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::audit::{AuditRecord, AuditStream, StreamKind};
use super::entropy;
use super::governance::{Decision, GovernanceLedger};
use super::guard;
use super::handlers::{builtin_registry, builtin_schema_overrides, DispatchTable, HandlerRequest};
use super::hashing::canonical_hash;
use super::policy::{FilePolicyStore, PolicyDocument, PolicyStore};
use super::registry::{
    EvidenceMode, FileRegistry, RegistrySource, RuneDescriptor, StabilizationRole,
};
use super::schema::{validate, Direction, SchemaOverrides, SchemaRegistry};
use super::signing::SignatureProvider;
use super::stabilization::{FileStabilizationStore, StabilizationStore};
use super::telemetry::{JsonlTelemetry, Phase, TelemetryEvent, TelemetrySink};
use super::KernelError;
use crate::config::KernelConfig;

/// Payload field naming the governance receipt for an actuator call.
pub const GOVERNANCE_RECEIPT_FIELD: &str = "governanceReceiptId";

/// Payload field carrying an explicit random seed.
pub const SEED_FIELD: &str = "seed";

/// Capability that admits callers to shadow-lane runes by default.
pub const DEFAULT_SHADOW_CAPABILITY: &str = "shadow-lane";

// ── Call data ───────────────────────────────────────────────────

/// Who is calling, and with which capabilities.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallerContext {
    /// Free-form principal name.
    #[serde(default)]
    pub principal: String,
    /// Capability tokens held by the caller.
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    /// Extra attributes echoed back in the envelope.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attributes: Map<String, Value>,
}

impl CallerContext {
    /// Context for `principal` with no capabilities.
    pub fn new(principal: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            ..Self::default()
        }
    }

    /// Builder: grant a capability.
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    /// Whether the caller holds `capability`.
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }
}

/// Provenance attached to every successful invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvenanceBundle {
    /// Completion time, RFC 3339 UTC.
    pub timestamp: String,
    /// Revision of the registry snapshot that resolved the rune.
    pub revision_id: String,
    /// Canonical hash of the request payload.
    pub payload_hash: String,
    /// Hash of the runtime environment description.
    pub runtime_fingerprint: String,
    /// Explicit seed the call ran under, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// Output schema mismatches tolerated for non-actuator runes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_validation_warning: Option<Vec<String>>,
}

/// Result of a successful dispatch.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Rune that ran.
    pub operation_id: String,
    /// Handler output.
    pub result: Value,
    /// Provenance for the call.
    pub provenance_bundle: ProvenanceBundle,
    /// Caller context the call ran under.
    pub context: CallerContext,
}

// ── Collaborators ───────────────────────────────────────────────

/// Injected collaborators. Nothing in here is looked up globally.
pub struct KernelContext {
    /// Registry source, read on every call.
    pub registry: Arc<dyn RegistrySource>,
    /// Policy source, read on every call.
    pub policy: Arc<dyn PolicyStore>,
    /// Advisory-cycle counters.
    pub stabilization: Arc<dyn StabilizationStore>,
    /// Authoritative schema overrides.
    pub schemas: SchemaOverrides,
    /// Governance receipt store.
    pub governance: GovernanceLedger,
    /// Invocation ledger stream.
    pub invocations: AuditStream,
    /// Event almanac stream.
    pub almanac: AuditStream,
    /// Telemetry sink.
    pub telemetry: Arc<dyn TelemetrySink>,
    /// Capability required for shadow-lane runes.
    pub shadow_capability: String,
}

impl std::fmt::Debug for KernelContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelContext")
            .field("governance", &self.governance)
            .field("invocations", &self.invocations)
            .field("almanac", &self.almanac)
            .field("shadow_capability", &self.shadow_capability)
            .finish_non_exhaustive()
    }
}

impl KernelContext {
    /// Wire file-backed collaborators from configuration.
    ///
    /// The built-in registry is used when no registry file exists, and the
    /// built-in actuator schemas are overlaid by any schema file.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError`] if a store cannot be opened or the schema
    /// file is malformed.
    pub fn from_config(config: &KernelConfig) -> Result<Self, KernelError> {
        let paths = &config.paths;
        std::fs::create_dir_all(&paths.root).map_err(|e| {
            KernelError::Configuration(format!("cannot create {}: {e}", paths.root.display()))
        })?;

        let mut schemas = builtin_schema_overrides();
        schemas.merge(SchemaOverrides::load(&paths.resolve(&paths.schemas))?);

        let signer = SignatureProvider::from_env(
            config.signing.key_env.clone(),
            Some(config.env_file()),
        );
        let governance = GovernanceLedger::open(paths.resolve(&paths.governance_ledger), signer)?
            .with_required_signing(config.signing.require);

        Ok(Self {
            registry: Arc::new(
                FileRegistry::new(paths.resolve(&paths.registry))
                    .with_fallback(builtin_registry()?),
            ),
            policy: Arc::new(FilePolicyStore::new(paths.resolve(&paths.policy))),
            stabilization: Arc::new(FileStabilizationStore::new(
                paths.resolve(&paths.stabilization_state),
            )),
            schemas,
            governance,
            invocations: AuditStream::open(
                StreamKind::InvocationLedger,
                paths.resolve(&paths.invocation_ledger),
            )?,
            almanac: AuditStream::open(
                StreamKind::EventAlmanac,
                paths.resolve(&paths.event_almanac),
            )?,
            telemetry: Arc::new(JsonlTelemetry::new(paths.resolve(&paths.telemetry))),
            shadow_capability: config.shadow.capability.clone(),
        })
    }
}

// ── Dispatcher ──────────────────────────────────────────────────

/// Mediates every rune invocation.
#[derive(Debug)]
pub struct KernelDispatcher {
    context: KernelContext,
    table: DispatchTable,
    unbound: Vec<String>,
}

impl KernelDispatcher {
    /// Build a dispatcher, reporting registered runes that have no handler.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError`] if the registry cannot be loaded.
    pub fn new(context: KernelContext, table: DispatchTable) -> Result<Self, KernelError> {
        let snapshot = context.registry.load()?;
        let unbound = table.unbound_runes(&snapshot);
        for id in &unbound {
            warn!(rune = %id, "registered rune has no bound handler; calls will fail");
        }
        info!(
            runes = snapshot.runes().len(),
            revision = %snapshot.revision(),
            unbound = unbound.len(),
            "kernel dispatcher ready"
        );
        Ok(Self {
            context,
            table,
            unbound,
        })
    }

    /// Injected collaborators.
    pub fn context(&self) -> &KernelContext {
        &self.context
    }

    /// Runes that were unbound when the dispatcher was built.
    pub fn unbound_runes(&self) -> &[String] {
        &self.unbound
    }

    /// Invoke `operation_id` with `payload` on behalf of `caller`.
    ///
    /// The source location of the caller is recorded in the ledgers.
    ///
    /// # Errors
    ///
    /// Returns the [`KernelError`] for whichever step refused or failed the
    /// call. A panicking handler is not converted: the panic continues to
    /// unwind after error telemetry is emitted.
    #[track_caller]
    pub fn dispatch(
        &self,
        operation_id: &str,
        payload: Value,
        caller: CallerContext,
    ) -> Result<Envelope, KernelError> {
        let location = Location::caller().to_string();
        let invocation_id = Uuid::new_v4();

        let snapshot = self.context.registry.load()?;
        let rune = snapshot
            .get(operation_id)
            .cloned()
            .ok_or_else(|| KernelError::UnknownOperation {
                operation_id: operation_id.to_owned(),
            })?;

        let policy = self.context.policy.load()?;
        if let Err(reason) = policy.check_rune(&rune) {
            return Err(self.policy_rejection(operation_id, invocation_id, reason));
        }

        let schemas = SchemaRegistry::build(&snapshot, &self.context.schemas);
        let mut errors = schemas
            .schema_for(operation_id, Direction::Input)
            .map(|spec| validate(&payload, spec).errors)
            .unwrap_or_default();
        let seed = match explicit_seed(&payload) {
            Ok(seed) => seed,
            Err(code) => {
                if !errors.contains(&code) {
                    errors.push(code);
                }
                None
            }
        };
        if !errors.is_empty() {
            self.context.telemetry.emit(
                TelemetryEvent::new(operation_id, Phase::Reject, invocation_id)
                    .with("reason", "validation_failed")
                    .with("errors", errors.clone()),
            );
            return Err(KernelError::ValidationFailed {
                operation_id: operation_id.to_owned(),
                errors,
            });
        }

        self.check_gates(&rune, &payload, &caller, &policy, invocation_id)?;

        if let Some(seed) = seed {
            entropy::reseed(seed);
        }

        self.context.telemetry.emit(
            TelemetryEvent::new(operation_id, Phase::Start, invocation_id)
                .with("evidenceMode", evidence_mode_name(rune.evidence_mode))
                .with("caller", location.as_str()),
        );
        let started = Instant::now();

        let handler = self.table.resolve(operation_id);
        let request = HandlerRequest {
            operation_id,
            payload: &payload,
            caller: &caller,
            governance: &self.context.governance,
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let _purity = rune.evidence_mode.is_detector_class().then(guard::acquire);
            handler.invoke(&request)
        }));

        let result = match outcome {
            Ok(Ok(value)) => value,
            Ok(Err(source)) => {
                self.context.telemetry.emit(
                    TelemetryEvent::new(operation_id, Phase::Error, invocation_id)
                        .with("errorKind", source.kind())
                        .with("message", source.to_string()),
                );
                return Err(KernelError::HandlerFailure {
                    operation_id: operation_id.to_owned(),
                    source,
                });
            }
            Err(panic_payload) => {
                self.context.telemetry.emit(
                    TelemetryEvent::new(operation_id, Phase::Error, invocation_id)
                        .with("errorKind", "panic")
                        .with("message", panic_message(panic_payload.as_ref())),
                );
                panic::resume_unwind(panic_payload);
            }
        };

        let completion = Completion {
            rune: &rune,
            payload: &payload,
            result,
            revision_id: snapshot.revision(),
            schemas: &schemas,
            seed,
            location: &location,
        };
        match self.complete(completion) {
            Ok((result, provenance)) => {
                let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                self.context.telemetry.emit(
                    TelemetryEvent::new(operation_id, Phase::End, invocation_id)
                        .with("durationMs", duration_ms)
                        .with("resultKeys", result_keys(&result)),
                );
                Ok(Envelope {
                    operation_id: operation_id.to_owned(),
                    result,
                    provenance_bundle: provenance,
                    context: caller,
                })
            }
            Err(e) => {
                self.context.telemetry.emit(
                    TelemetryEvent::new(operation_id, Phase::Error, invocation_id)
                        .with("errorKind", e.kind())
                        .with("message", e.to_string()),
                );
                Err(e)
            }
        }
    }

    fn policy_rejection(
        &self,
        operation_id: &str,
        invocation_id: Uuid,
        reason: String,
    ) -> KernelError {
        self.context.telemetry.emit(
            TelemetryEvent::new(operation_id, Phase::Reject, invocation_id)
                .with("reason", "policy_denied")
                .with("detail", reason.as_str()),
        );
        KernelError::PolicyDenied {
            operation_id: operation_id.to_owned(),
            reason,
        }
    }

    // ── Gates ───────────────────────────────────────────────────

    fn check_gates(
        &self,
        rune: &RuneDescriptor,
        payload: &Value,
        caller: &CallerContext,
        policy: &PolicyDocument,
        invocation_id: Uuid,
    ) -> Result<(), KernelError> {
        match rune.evidence_mode {
            EvidenceMode::ShadowLane => {
                if !caller.has_capability(&self.context.shadow_capability) {
                    warn!(
                        rune = %rune.id,
                        principal = %caller.principal,
                        capability = %self.context.shadow_capability,
                        "shadow-lane call refused"
                    );
                    return Err(KernelError::ShadowAccessDenied {
                        operation_id: rune.id.clone(),
                        capability: self.context.shadow_capability.clone(),
                    });
                }
            }
            EvidenceMode::OpsActuator => {
                if let Err(reason) = policy.check_actuator_request(payload) {
                    return Err(self.policy_rejection(&rune.id, invocation_id, reason));
                }
                self.check_governance(rune, payload)?;
            }
            EvidenceMode::Plain | EvidenceMode::DetectorOnly => {}
        }

        if let Some(StabilizationRole::Destructive { advisory }) = &rune.stabilization {
            let observed = self.context.stabilization.cycles(advisory)?;
            let required = policy.required_advisory_cycles();
            if observed < required {
                warn!(
                    rune = %rune.id,
                    advisory = %advisory,
                    observed,
                    required,
                    "destructive rune not yet stabilized"
                );
                return Err(KernelError::StabilizationNotReady {
                    operation_id: rune.id.clone(),
                    advisory: advisory.clone(),
                    observed,
                    required,
                });
            }
        }
        Ok(())
    }

    fn check_governance(&self, rune: &RuneDescriptor, payload: &Value) -> Result<(), KernelError> {
        let deny = |reason: String| {
            warn!(rune = %rune.id, reason = %reason, "governance gate refused actuator call");
            KernelError::GovernanceDenied {
                operation_id: rune.id.clone(),
                reason,
            }
        };

        self.context.governance.ensure_signing_ready()?;
        let Some(receipt_id) = payload.get(GOVERNANCE_RECEIPT_FIELD).and_then(Value::as_str) else {
            return Err(deny(format!("payload carries no '{GOVERNANCE_RECEIPT_FIELD}'")));
        };
        let Some(receipt) = self.context.governance.find_receipt(receipt_id)? else {
            return Err(deny(format!("receipt {receipt_id} not found")));
        };
        if receipt.decision != Decision::Approve {
            return Err(deny(format!(
                "receipt {receipt_id} records {}",
                receipt.decision.as_str()
            )));
        }
        if receipt.action_operation_id != rune.id {
            return Err(deny(format!(
                "receipt {receipt_id} approves '{}', not '{}'",
                receipt.action_operation_id, rune.id
            )));
        }
        if receipt.is_signed() {
            if !self.context.governance.verify_receipt(&receipt) {
                return Err(deny(format!("receipt {receipt_id} failed signature verification")));
            }
        } else if self.context.governance.requires_signing() {
            return Err(deny(format!("receipt {receipt_id} is unsigned and signing is required")));
        }
        debug!(rune = %rune.id, receipt_id, "governance receipt accepted");
        Ok(())
    }

    // ── Completion ──────────────────────────────────────────────

    fn complete(&self, c: Completion<'_>) -> Result<(Value, ProvenanceBundle), KernelError> {
        let operation_id = c.rune.id.as_str();
        let mut warning = None;
        if let Some(spec) = c.schemas.schema_for(operation_id, Direction::Output) {
            let validation = validate(&c.result, spec);
            if !validation.is_ok() {
                if c.rune.evidence_mode.is_actuator() {
                    return Err(KernelError::ResultValidationFailed {
                        operation_id: operation_id.to_owned(),
                        errors: validation.errors,
                    });
                }
                warn!(
                    rune = %operation_id,
                    errors = ?validation.errors,
                    "handler result does not match its schema"
                );
                warning = Some(validation.errors);
            }
        }

        let provenance = ProvenanceBundle {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            revision_id: c.revision_id.to_owned(),
            payload_hash: canonical_hash(c.payload)?,
            runtime_fingerprint: runtime_fingerprint()?,
            seed: c.seed,
            result_validation_warning: warning,
        };

        let record = AuditRecord {
            operation_id,
            payload: c.payload,
            provenance: &provenance,
            caller: c.location,
        };
        self.context.invocations.append(record)?;
        self.context.almanac.append(record)?;

        if c.rune.stabilization == Some(StabilizationRole::Advisory) {
            let cycles = self.context.stabilization.record_cycle(operation_id)?;
            debug!(rune = %operation_id, cycles, "advisory cycle recorded");
        }
        Ok((c.result, provenance))
    }
}

struct Completion<'a> {
    rune: &'a RuneDescriptor,
    payload: &'a Value,
    result: Value,
    revision_id: &'a str,
    schemas: &'a SchemaRegistry,
    seed: Option<u64>,
    location: &'a str,
}

// ── Helpers ─────────────────────────────────────────────────────

/// The payload's explicit seed, or the mismatch code when it is not a `u64`.
fn explicit_seed(payload: &Value) -> Result<Option<u64>, String> {
    match payload.get(SEED_FIELD) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .map(Some)
            .ok_or_else(|| format!("type_mismatch:{SEED_FIELD}")),
    }
}

fn evidence_mode_name(mode: EvidenceMode) -> &'static str {
    match mode {
        EvidenceMode::Plain => "plain",
        EvidenceMode::DetectorOnly => "detectorOnly",
        EvidenceMode::OpsActuator => "opsActuator",
        EvidenceMode::ShadowLane => "shadowLane",
    }
}

fn result_keys(result: &Value) -> Vec<String> {
    result
        .as_object()
        .map(|map| map.keys().cloned().collect())
        .unwrap_or_default()
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_owned()
    }
}

/// Hash identifying the build and platform the kernel runs on.
///
/// # Errors
///
/// Returns [`KernelError::Hashing`] if canonicalization fails.
pub fn runtime_fingerprint() -> Result<String, KernelError> {
    let description = json!({
        "package": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "os": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "family": std::env::consts::FAMILY,
    });
    Ok(canonical_hash(&description)?)
}
