//! Kernel invocation spine.
//!
//! Every rune call goes through [`dispatcher::KernelDispatcher::dispatch`],
//! which resolves, gates, runs, validates, and records it. The submodules
//! are the collaborators the dispatcher is wired with.

pub mod audit;
pub mod dispatcher;
pub mod entropy;
pub mod governance;
pub mod guard;
pub mod handlers;
pub mod hashing;
pub mod policy;
pub mod registry;
pub mod schema;
pub mod signing;
pub mod stabilization;
pub mod telemetry;

use thiserror::Error;

use audit::LedgerError;
use handlers::HandlerError;
use hashing::HashError;
use policy::PolicyError;
use registry::RegistryError;
use schema::SchemaError;
use signing::SigningError;
use stabilization::StateError;

/// Everything a dispatch can fail with.
#[derive(Debug, Error)]
pub enum KernelError {
    /// The rune is not in the current registry snapshot.
    #[error("unknown operation '{operation_id}'")]
    UnknownOperation {
        /// Requested rune id.
        operation_id: String,
    },

    /// Policy refused the rune or its actuator request.
    #[error("policy denied '{operation_id}': {reason}")]
    PolicyDenied {
        /// Rune id.
        operation_id: String,
        /// Why.
        reason: String,
    },

    /// The payload does not match the input schema.
    #[error("payload for '{operation_id}' failed validation: {}", errors.join(", "))]
    ValidationFailed {
        /// Rune id.
        operation_id: String,
        /// Mismatch codes.
        errors: Vec<String>,
    },

    /// An actuator's result does not match its output schema.
    #[error("result of '{operation_id}' failed validation: {}", errors.join(", "))]
    ResultValidationFailed {
        /// Rune id.
        operation_id: String,
        /// Mismatch codes.
        errors: Vec<String>,
    },

    /// Shadow-lane rune called without the capability.
    #[error("'{operation_id}' requires capability '{capability}'")]
    ShadowAccessDenied {
        /// Rune id.
        operation_id: String,
        /// Missing capability.
        capability: String,
    },

    /// Actuator call without a usable approving receipt.
    #[error("governance denied '{operation_id}': {reason}")]
    GovernanceDenied {
        /// Rune id.
        operation_id: String,
        /// Why.
        reason: String,
    },

    /// Destructive rune called before its advisory rune has run enough.
    #[error(
        "'{operation_id}' needs {required} confirmed '{advisory}' cycles, observed {observed}"
    )]
    StabilizationNotReady {
        /// Destructive rune id.
        operation_id: String,
        /// Advisory counterpart.
        advisory: String,
        /// Cycles recorded so far.
        observed: u64,
        /// Cycles required by policy.
        required: u64,
    },

    /// The handler returned an error.
    #[error("handler for '{operation_id}' failed")]
    HandlerFailure {
        /// Rune id.
        operation_id: String,
        /// The handler's own error.
        #[source]
        source: HandlerError,
    },

    /// Registry, policy, or schema configuration is unusable.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A ledger or state file could not be read or written.
    #[error("storage error: {0}")]
    Storage(String),

    /// Canonical hashing failed.
    #[error(transparent)]
    Hashing(#[from] HashError),

    /// Signing was required and could not be performed.
    #[error(transparent)]
    Signing(SigningError),
}

impl KernelError {
    /// Short machine-readable kind, used in telemetry and exit codes.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownOperation { .. } => "unknown_operation",
            Self::PolicyDenied { .. } => "policy_denied",
            Self::ValidationFailed { .. } => "validation_failed",
            Self::ResultValidationFailed { .. } => "result_validation_failed",
            Self::ShadowAccessDenied { .. } => "shadow_access_denied",
            Self::GovernanceDenied { .. } => "governance_denied",
            Self::StabilizationNotReady { .. } => "stabilization_not_ready",
            Self::HandlerFailure { .. } => "handler_failure",
            Self::Configuration(_) => "configuration",
            Self::Storage(_) => "storage",
            Self::Hashing(_) => "hashing",
            Self::Signing(_) => "signing",
        }
    }
}

impl From<RegistryError> for KernelError {
    fn from(e: RegistryError) -> Self {
        Self::Configuration(e.to_string())
    }
}

impl From<PolicyError> for KernelError {
    fn from(e: PolicyError) -> Self {
        Self::Configuration(e.to_string())
    }
}

impl From<SchemaError> for KernelError {
    fn from(e: SchemaError) -> Self {
        Self::Configuration(e.to_string())
    }
}

impl From<StateError> for KernelError {
    fn from(e: StateError) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<LedgerError> for KernelError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::Signing(inner) => Self::Signing(inner),
            LedgerError::Hash(inner) => Self::Hashing(inner),
            other => Self::Storage(other.to_string()),
        }
    }
}

impl From<SigningError> for KernelError {
    fn from(e: SigningError) -> Self {
        Self::Signing(e)
    }
}
