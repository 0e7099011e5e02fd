//! Shared fixtures for the kernel integration tests.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use tempfile::TempDir;

use runespine::kernel::audit::{AuditStream, StreamKind};
use runespine::kernel::dispatcher::{KernelContext, KernelDispatcher, DEFAULT_SHADOW_CAPABILITY};
use runespine::kernel::governance::{Decision, GovernanceLedger, ReceiptRequest};
use runespine::kernel::handlers::{
    builtin_descriptors, builtin_schema_overrides, DispatchTable, APPLY, PLAN,
};
use runespine::kernel::policy::{PolicyDocument, PolicyStore, StaticPolicy};
use runespine::kernel::registry::{RegistrySnapshot, RegistrySource, RuneDescriptor, StaticRegistry};
use runespine::kernel::schema::SchemaOverrides;
use runespine::kernel::signing::SignatureProvider;
use runespine::kernel::stabilization::{MemoryStabilizationStore, StabilizationStore};
use runespine::kernel::telemetry::MemoryTelemetry;

pub const TEST_KEY: &[u8] = b"integration-test-key";

pub struct Harness {
    pub dir: TempDir,
    pub dispatcher: KernelDispatcher,
    pub telemetry: Arc<MemoryTelemetry>,
    pub stabilization: Arc<MemoryStabilizationStore>,
}

impl Harness {
    pub fn invocations_path(&self) -> PathBuf {
        self.dir.path().join("invocations.jsonl")
    }

    pub fn almanac_path(&self) -> PathBuf {
        self.dir.path().join("almanac.jsonl")
    }

    pub fn governance_path(&self) -> PathBuf {
        self.dir.path().join("governance.jsonl")
    }

    pub fn governance(&self) -> &GovernanceLedger {
        &self.dispatcher.context().governance
    }

    /// Record a receipt directly in the dispatcher's ledger.
    pub fn receipt(&self, action: &str, decision: Decision) -> String {
        let pointer = self
            .governance()
            .record_receipt(ReceiptRequest {
                action_operation_id: action.to_owned(),
                action_payload: serde_json::json!({
                    "action": "restart",
                    "service": "web",
                    "target": "host-1",
                }),
                evidence_bundle: serde_json::json!({"source": "test"}),
                decision,
                decided_by: "alice".to_owned(),
                reason: None,
            })
            .expect("record receipt");
        pointer.hash
    }

    /// Bring the plan rune's counter to `cycles`.
    pub fn stabilize(&self, cycles: u64) {
        for _ in 0..cycles {
            self.stabilization.record_cycle(PLAN).expect("record cycle");
        }
    }

    /// Non-empty lines in a stream file (0 when missing).
    pub fn line_count(path: &std::path::Path) -> usize {
        match std::fs::read_to_string(path) {
            Ok(contents) => contents.lines().filter(|l| !l.trim().is_empty()).count(),
            Err(_) => 0,
        }
    }
}

pub struct HarnessBuilder {
    dir: TempDir,
    registry: Option<Arc<dyn RegistrySource>>,
    extra_runes: Vec<RuneDescriptor>,
    table: DispatchTable,
    policy: PolicyDocument,
    policy_store: Option<Arc<dyn PolicyStore>>,
    schemas: SchemaOverrides,
    signer: SignatureProvider,
    require_signing: bool,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("tempdir"),
            registry: None,
            extra_runes: Vec::new(),
            table: DispatchTable::builtin(),
            policy: permissive_policy(),
            policy_store: None,
            schemas: builtin_schema_overrides(),
            signer: SignatureProvider::with_key(TEST_KEY.to_vec()),
            require_signing: false,
        }
    }

    pub fn dir(&self) -> &std::path::Path {
        self.dir.path()
    }

    pub fn rune(mut self, descriptor: RuneDescriptor) -> Self {
        self.extra_runes.push(descriptor);
        self
    }

    pub fn registry(mut self, source: Arc<dyn RegistrySource>) -> Self {
        self.registry = Some(source);
        self
    }

    pub fn table(mut self, f: impl FnOnce(DispatchTable) -> DispatchTable) -> Self {
        self.table = f(self.table);
        self
    }

    pub fn policy(mut self, policy: PolicyDocument) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy_store(mut self, store: Arc<dyn PolicyStore>) -> Self {
        self.policy_store = Some(store);
        self
    }

    pub fn schemas(mut self, f: impl FnOnce(&mut SchemaOverrides)) -> Self {
        f(&mut self.schemas);
        self
    }

    pub fn signer(mut self, signer: SignatureProvider) -> Self {
        self.signer = signer;
        self
    }

    pub fn require_signing(mut self) -> Self {
        self.require_signing = true;
        self
    }

    pub fn build(self) -> Harness {
        let registry = match self.registry {
            Some(source) => source,
            None => {
                let mut runes = builtin_descriptors();
                runes.extend(self.extra_runes);
                let snapshot = RegistrySnapshot::from_descriptors(runes).expect("registry");
                Arc::new(StaticRegistry(snapshot))
            }
        };
        let policy: Arc<dyn PolicyStore> = match self.policy_store {
            Some(store) => store,
            None => Arc::new(StaticPolicy(self.policy)),
        };
        let telemetry = Arc::new(MemoryTelemetry::new());
        let stabilization = Arc::new(MemoryStabilizationStore::new());
        let root = self.dir.path();
        let governance = GovernanceLedger::open(root.join("governance.jsonl"), self.signer)
            .expect("governance ledger")
            .with_required_signing(self.require_signing);
        let context = KernelContext {
            registry,
            policy,
            stabilization: stabilization.clone(),
            schemas: self.schemas,
            governance,
            invocations: AuditStream::open(
                StreamKind::InvocationLedger,
                root.join("invocations.jsonl"),
            )
            .expect("invocation ledger"),
            almanac: AuditStream::open(StreamKind::EventAlmanac, root.join("almanac.jsonl"))
                .expect("event almanac"),
            telemetry: telemetry.clone(),
            shadow_capability: DEFAULT_SHADOW_CAPABILITY.to_owned(),
        };
        let dispatcher = KernelDispatcher::new(context, self.table).expect("dispatcher");
        Harness {
            dir: self.dir,
            dispatcher,
            telemetry,
            stabilization,
        }
    }
}

/// Policy with actuators switched on and no allow list.
pub fn permissive_policy() -> PolicyDocument {
    let mut policy = PolicyDocument::default();
    policy.actuator.enabled = true;
    policy
}

pub fn harness() -> Harness {
    HarnessBuilder::new().build()
}

/// Payload for the built-in actuator under `receipt`.
pub fn apply_payload(receipt: &str) -> Value {
    serde_json::json!({
        "governanceReceiptId": receipt,
        "action": "restart",
        "service": "web",
        "target": "host-1",
    })
}

pub const ACTUATOR: &str = APPLY;
