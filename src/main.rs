//! Runespine CLI entry point.
//!
//! One-shot subcommands that build a dispatcher from configuration, run a
//! single rune call (or an audit check), and print JSON to stdout.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use runespine::config::KernelConfig;
use runespine::kernel::audit::{cross_check, verify_chain, StreamKind};
use runespine::kernel::dispatcher::{
    CallerContext, Envelope, KernelContext, KernelDispatcher, GOVERNANCE_RECEIPT_FIELD, SEED_FIELD,
};
use runespine::kernel::governance::Decision;
use runespine::kernel::handlers::{DispatchTable, APPLY, DECIDE, PLAN};

/// Runespine: governed rune invocation.
#[derive(Parser)]
#[command(name = "runespine", version, about)]
struct Cli {
    /// Config file (takes precedence over `$RUNESPINE_CONFIG_PATH`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Principal recorded in the caller context.
    #[arg(long, global = true, default_value = "cli")]
    principal: String,

    /// Also write JSON logs to the configured logs directory.
    #[arg(long, global = true)]
    log_file: bool,

    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// List the runes in the current registry.
    Runes,
    /// Invoke any rune with a JSON payload.
    Invoke {
        /// Rune id.
        operation: String,
        /// JSON object payload.
        #[arg(long, default_value = "{}")]
        payload: String,
        /// Capability to grant the caller (repeatable).
        #[arg(long = "capability")]
        capabilities: Vec<String>,
    },
    /// Draft an operations plan (advisory; counts toward stabilization).
    Plan {
        /// Action verb, e.g. `restart`.
        #[arg(long)]
        action: String,
        /// Service to act on.
        #[arg(long)]
        service: String,
        /// Host or environment.
        #[arg(long)]
        target: String,
        /// Explicit random seed.
        #[arg(long)]
        seed: Option<u64>,
        /// Save the plan to this file for `promote` and `apply`.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Record a governance decision on an action.
    Decide {
        /// The decision.
        decision: DecisionArg,
        /// Rune the decision applies to.
        #[arg(long)]
        action: String,
        /// JSON payload being decided on.
        #[arg(long, default_value = "{}")]
        payload: String,
        /// JSON evidence bundle.
        #[arg(long)]
        evidence: Option<String>,
        /// Who decided.
        #[arg(long)]
        by: String,
        /// Optional reason.
        #[arg(long)]
        reason: Option<String>,
    },
    /// Approve a saved plan, using the plan itself as evidence.
    Promote {
        /// Plan file written by `plan --out`.
        #[arg(long)]
        plan: PathBuf,
        /// Who approved.
        #[arg(long)]
        by: String,
        /// Optional reason.
        #[arg(long)]
        reason: Option<String>,
    },
    /// Apply a saved plan under an approving receipt.
    Apply {
        /// Plan file written by `plan --out`.
        #[arg(long)]
        plan: PathBuf,
        /// Receipt id printed by `promote` or `decide`.
        #[arg(long)]
        receipt: String,
    },
    /// Check a stored receipt's signature.
    VerifyReceipt {
        /// Receipt id.
        id: String,
    },
    /// Verify both audit streams and compare them.
    AuditCheck,
}

/// Decision argument.
#[derive(Clone, Copy, ValueEnum)]
enum DecisionArg {
    /// Permit the action.
    Approve,
    /// Refuse the action.
    Deny,
}

impl From<DecisionArg> for Decision {
    fn from(arg: DecisionArg) -> Self {
        match arg {
            DecisionArg::Approve => Decision::Approve,
            DecisionArg::Deny => Decision::Deny,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let _log_guard = if cli.log_file {
        let logs = config.paths.resolve(&config.paths.logs);
        Some(runespine::logging::init_production(&logs, &config.logging.level)?)
    } else {
        runespine::logging::init_cli(&config.logging.level);
        None
    };
    debug!(root = %config.paths.root.display(), "configuration loaded");

    let caller = CallerContext::new(cli.principal.clone());
    match cli.command {
        Command::Runes => handle_runes(&config),
        Command::Invoke {
            operation,
            payload,
            capabilities,
        } => {
            let caller = capabilities
                .into_iter()
                .fold(caller, CallerContext::with_capability);
            let payload = parse_json("--payload", &payload)?;
            print_envelope(&build_dispatcher(&config)?.dispatch(&operation, payload, caller)?)
        }
        Command::Plan {
            action,
            service,
            target,
            seed,
            out,
        } => handle_plan(&config, caller, &action, &service, &target, seed, out.as_deref()),
        Command::Decide {
            decision,
            action,
            payload,
            evidence,
            by,
            reason,
        } => {
            let mut request = Map::new();
            request.insert("actionOperationId".to_owned(), json!(action));
            request.insert("actionPayload".to_owned(), parse_json("--payload", &payload)?);
            request.insert("decision".to_owned(), json!(Decision::from(decision).as_str()));
            request.insert("decidedBy".to_owned(), json!(by));
            if let Some(evidence) = evidence {
                request.insert("evidenceBundle".to_owned(), parse_json("--evidence", &evidence)?);
            }
            if let Some(reason) = reason {
                request.insert("reason".to_owned(), json!(reason));
            }
            let dispatcher = build_dispatcher(&config)?;
            print_envelope(&dispatcher.dispatch(DECIDE, Value::Object(request), caller)?)
        }
        Command::Promote { plan, by, reason } => {
            handle_promote(&config, caller, &plan, &by, reason)
        }
        Command::Apply { plan, receipt } => handle_apply(&config, caller, &plan, &receipt),
        Command::VerifyReceipt { id } => handle_verify_receipt(&config, &id),
        Command::AuditCheck => handle_audit_check(&config),
    }
}

fn load_config(explicit: Option<&Path>) -> anyhow::Result<KernelConfig> {
    let explicit = explicit.map(|p| p.display().to_string());
    KernelConfig::load_with(|key| match (key, &explicit) {
        ("RUNESPINE_CONFIG_PATH", Some(path)) => Some(path.clone()),
        _ => std::env::var(key).ok(),
    })
    .context("failed to load configuration")
}

fn build_dispatcher(config: &KernelConfig) -> anyhow::Result<KernelDispatcher> {
    let context = KernelContext::from_config(config).context("failed to wire kernel")?;
    Ok(KernelDispatcher::new(context, DispatchTable::builtin())?)
}

fn parse_json(flag: &str, raw: &str) -> anyhow::Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("{flag} is not valid JSON"))
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_envelope(envelope: &Envelope) -> anyhow::Result<()> {
    print_json(envelope)
}

fn read_plan(path: &Path) -> anyhow::Result<Value> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read plan {}", path.display()))?;
    let plan: Value = serde_json::from_str(&raw)
        .with_context(|| format!("plan {} is not valid JSON", path.display()))?;
    if plan.get("actionPayload").and_then(Value::as_object).is_none() {
        bail!("plan {} has no actionPayload object", path.display());
    }
    Ok(plan)
}

fn handle_runes(config: &KernelConfig) -> anyhow::Result<()> {
    let dispatcher = build_dispatcher(config)?;
    let snapshot = dispatcher.context().registry.load()?;
    let runes: Vec<Value> = snapshot
        .runes()
        .iter()
        .map(|r| {
            json!({
                "id": r.id,
                "evidenceMode": r.evidence_mode,
                "stabilization": r.stabilization,
                "bound": !dispatcher.unbound_runes().contains(&r.id),
                "description": r.description,
            })
        })
        .collect();
    print_json(&json!({ "revision": snapshot.revision(), "runes": runes }))
}

fn handle_plan(
    config: &KernelConfig,
    caller: CallerContext,
    action: &str,
    service: &str,
    target: &str,
    seed: Option<u64>,
    out: Option<&Path>,
) -> anyhow::Result<()> {
    let mut payload = json!({ "action": action, "service": service, "target": target });
    if let (Some(seed), Some(map)) = (seed, payload.as_object_mut()) {
        map.insert(SEED_FIELD.to_owned(), json!(seed));
    }
    let envelope = build_dispatcher(config)?.dispatch(PLAN, payload, caller)?;
    if let Some(out) = out {
        std::fs::write(out, serde_json::to_string_pretty(&envelope.result)?)
            .with_context(|| format!("failed to write plan {}", out.display()))?;
        info!(path = %out.display(), "plan saved");
    }
    print_envelope(&envelope)
}

fn handle_promote(
    config: &KernelConfig,
    caller: CallerContext,
    plan_path: &Path,
    by: &str,
    reason: Option<String>,
) -> anyhow::Result<()> {
    let plan = read_plan(plan_path)?;
    let action = plan
        .get("actionOperationId")
        .and_then(Value::as_str)
        .unwrap_or(APPLY)
        .to_owned();
    let mut request = json!({
        "actionOperationId": action,
        "actionPayload": plan["actionPayload"].clone(),
        "decision": Decision::Approve.as_str(),
        "decidedBy": by,
        "evidenceBundle": plan,
    });
    if let (Some(reason), Some(map)) = (reason, request.as_object_mut()) {
        map.insert("reason".to_owned(), json!(reason));
    }
    print_envelope(&build_dispatcher(config)?.dispatch(DECIDE, request, caller)?)
}

fn handle_apply(
    config: &KernelConfig,
    caller: CallerContext,
    plan_path: &Path,
    receipt: &str,
) -> anyhow::Result<()> {
    let plan = read_plan(plan_path)?;
    let mut payload = plan["actionPayload"].clone();
    if let Some(map) = payload.as_object_mut() {
        map.insert(GOVERNANCE_RECEIPT_FIELD.to_owned(), json!(receipt));
    }
    let action = plan
        .get("actionOperationId")
        .and_then(Value::as_str)
        .unwrap_or(APPLY);
    print_envelope(&build_dispatcher(config)?.dispatch(action, payload, caller)?)
}

fn handle_verify_receipt(config: &KernelConfig, id: &str) -> anyhow::Result<()> {
    let context = KernelContext::from_config(config).context("failed to wire kernel")?;
    let Some(receipt) = context.governance.find_receipt(id)? else {
        bail!("receipt {id} not found");
    };
    let verified = context.governance.verify_receipt(&receipt);
    print_json(&json!({
        "id": receipt.id,
        "decision": receipt.decision,
        "actionOperationId": receipt.action_operation_id,
        "signed": receipt.is_signed(),
        "verified": verified,
    }))?;
    if !verified {
        bail!("receipt {id} did not verify");
    }
    Ok(())
}

fn handle_audit_check(config: &KernelConfig) -> anyhow::Result<()> {
    let paths = &config.paths;
    let invocations = paths.resolve(&paths.invocation_ledger);
    let almanac = paths.resolve(&paths.event_almanac);

    let count = |kind: StreamKind, path: &Path| -> anyhow::Result<usize> {
        if !path.exists() {
            return Ok(0);
        }
        verify_chain(kind, path).with_context(|| format!("{} chain is broken", kind.name()))
    };
    let invocation_entries = count(StreamKind::InvocationLedger, &invocations)?;
    let almanac_entries = count(StreamKind::EventAlmanac, &almanac)?;

    let divergences = if invocations.exists() && almanac.exists() {
        cross_check(&invocations, &almanac)?.divergences
    } else if invocation_entries != almanac_entries {
        vec![format!(
            "stream lengths differ: invocation ledger has {invocation_entries}, \
             event almanac has {almanac_entries}"
        )]
    } else {
        Vec::new()
    };

    print_json(&json!({
        "invocationLedger": invocation_entries,
        "eventAlmanac": almanac_entries,
        "divergences": divergences,
    }))?;
    if !divergences.is_empty() {
        bail!("audit streams diverge");
    }
    Ok(())
}
