//! Configuration loading.
//!
//! Loads `KernelConfig` from `$RUNESPINE_CONFIG_PATH`, else
//! `$RUNESPINE_ROOT/config.toml`, else `~/.runespine/config.toml`. A missing
//! file yields defaults.
//!
//! Precedence: env vars > config file > defaults.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Name of the state directory under the home directory.
pub const STATE_DIR_NAME: &str = ".runespine";

// ── Top-level config ────────────────────────────────────────────

/// Top-level kernel configuration loaded from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Where state files live.
    pub paths: PathsConfig,
    /// Governance receipt signing.
    pub signing: SigningConfig,
    /// Shadow-lane access.
    pub shadow: ShadowConfig,
    /// Log filter defaults.
    pub logging: LoggingConfig,
}

impl KernelConfig {
    /// Load with precedence env vars > TOML file > defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be read or
    /// parsed, or if no home directory can be found for the default path.
    pub fn load() -> Result<Self> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    /// [`KernelConfig::load`] with a custom env resolver.
    ///
    /// # Errors
    ///
    /// Same as [`KernelConfig::load`].
    pub fn load_with(env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let path = Self::config_path_with(&env)?;
        let mut config = Self::load_from_file(&path)?;
        config.apply_overrides(&env);
        Ok(config)
    }

    /// Load from a TOML file only; a missing file yields defaults.
    ///
    /// # Errors
    ///
    /// Returns an error for unreadable or malformed files.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                tracing::debug!(path = %path.display(), "loading config from file");
                Self::from_toml(&contents)
                    .with_context(|| format!("invalid config file {}", path.display()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!(
                "failed to read config file {}: {e}",
                path.display()
            )),
        }
    }

    /// Parse a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let mut config: KernelConfig =
            toml::from_str(toml_str).context("failed to parse config TOML")?;
        config.paths.root = expand_home(&config.paths.root);
        Ok(config)
    }

    /// Defaults rooted at `root`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let mut config = Self::default();
        config.paths.root = root.into();
        config
    }

    /// Resolve the config file path using a custom env resolver.
    ///
    /// # Errors
    ///
    /// Returns an error if no override is set and the home directory cannot
    /// be determined.
    pub fn config_path_with(env: impl Fn(&str) -> Option<String>) -> Result<PathBuf> {
        if let Some(p) = env("RUNESPINE_CONFIG_PATH") {
            return Ok(PathBuf::from(p));
        }
        if let Some(root) = env("RUNESPINE_ROOT") {
            return Ok(PathBuf::from(root).join("config.toml"));
        }
        Ok(config_dir()?.join("config.toml"))
    }

    /// Apply environment variable overrides.
    ///
    /// Takes a resolver function so tests never touch the process env.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("RUNESPINE_ROOT") {
            self.paths.root = expand_home(Path::new(&v));
        }
        if let Some(v) = env("RUNESPINE_REGISTRY") {
            self.paths.registry = PathBuf::from(v);
        }
        if let Some(v) = env("RUNESPINE_POLICY") {
            self.paths.policy = PathBuf::from(v);
        }
        if let Some(v) = env("RUNESPINE_SIGNING_KEY_ENV") {
            if v.trim().is_empty() {
                tracing::warn!(var = "RUNESPINE_SIGNING_KEY_ENV", "ignoring empty env override");
            } else {
                self.signing.key_env = v;
            }
        }
        if let Some(v) = env("RUNESPINE_REQUIRE_SIGNING") {
            match v.parse() {
                Ok(b) => self.signing.require = b,
                Err(_) => tracing::warn!(
                    var = "RUNESPINE_REQUIRE_SIGNING",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
        if let Some(v) = env("RUNESPINE_SHADOW_CAPABILITY") {
            if v.trim().is_empty() {
                tracing::warn!(var = "RUNESPINE_SHADOW_CAPABILITY", "ignoring empty env override");
            } else {
                self.shadow.capability = v;
            }
        }
    }

    /// `.env` file consulted for the signing key when the env var is unset.
    pub fn env_file(&self) -> PathBuf {
        self.paths.root.join(".env")
    }
}

// ── Sections ────────────────────────────────────────────────────

/// State file locations. Relative entries resolve under `root`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// State root directory.
    pub root: PathBuf,
    /// Registry snapshot (JSON).
    pub registry: PathBuf,
    /// Policy document (JSON).
    pub policy: PathBuf,
    /// Explicit schema override table (JSON, optional).
    pub schemas: PathBuf,
    /// Governance receipt ledger (JSONL).
    pub governance_ledger: PathBuf,
    /// Invocation ledger stream (JSONL).
    pub invocation_ledger: PathBuf,
    /// Event almanac stream (JSONL).
    pub event_almanac: PathBuf,
    /// Advisory-cycle counters (JSON).
    pub stabilization_state: PathBuf,
    /// Telemetry stream (JSONL).
    pub telemetry: PathBuf,
    /// Rotated log files.
    pub logs: PathBuf,
}

impl PathsConfig {
    /// Absolute paths pass through; relative ones are joined to `root`.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            root: config_dir().unwrap_or_else(|_| PathBuf::from(STATE_DIR_NAME)),
            registry: PathBuf::from("registry.json"),
            policy: PathBuf::from("policy.json"),
            schemas: PathBuf::from("schemas.json"),
            governance_ledger: PathBuf::from("governance.jsonl"),
            invocation_ledger: PathBuf::from("invocations.jsonl"),
            event_almanac: PathBuf::from("almanac.jsonl"),
            stabilization_state: PathBuf::from("stabilization.json"),
            telemetry: PathBuf::from("telemetry.jsonl"),
            logs: PathBuf::from("logs"),
        }
    }
}

/// Receipt signing settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SigningConfig {
    /// Environment variable holding the HMAC key.
    pub key_env: String,
    /// Refuse to write or honour unsigned receipts.
    pub require: bool,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            key_env: "RUNESPINE_SIGNING_KEY".to_owned(),
            require: false,
        }
    }
}

/// Shadow-lane settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShadowConfig {
    /// Capability callers must hold.
    pub capability: String,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            capability: crate::kernel::dispatcher::DEFAULT_SHADOW_CAPABILITY.to_owned(),
        }
    }
}

/// Log filter settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
        }
    }
}

// ── Paths ───────────────────────────────────────────────────────

/// Default state directory (`~/.runespine`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn config_dir() -> Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.home_dir().join(STATE_DIR_NAME))
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match directories::BaseDirs::new() {
            Some(home) => home.home_dir().join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}
