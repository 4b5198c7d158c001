//! Sandbox configuration.
//!
//! [`SandboxConfig`] controls validation ceilings, signature policy, and the
//! permission/limit defaults applied to packs.  Sensible defaults are provided
//! via the [`Default`] implementation, a builder-style API allows callers to
//! customise individual fields fluently, and the whole structure can be read
//! from a TOML file.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SandboxError};
use crate::permissions::{PermissionSet, ResourceLimits};

/// Validation, trust and default-policy settings for the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Hard ceiling on the size of a pack binary, in bytes.
    ///
    /// Default: **10 MiB**.
    pub max_pack_size: u64,

    /// Loadable binary extensions (without the dot, compared
    /// case-insensitively).
    ///
    /// Default: **`["wasm"]`**.
    pub allowed_extensions: Vec<String>,

    /// Refuse packs that carry no valid detached signature.
    ///
    /// Default: **false**.
    pub require_signature: bool,

    /// Base64-encoded Ed25519 public keys of trusted publishers.
    pub trusted_publisher_keys: Vec<String>,

    /// Permissions used when a caller requests none.
    pub default_permissions: PermissionSet,

    /// Limits assigned to every newly loaded pack.
    pub default_limits: ResourceLimits,

    /// Upper bound on what a pack's own manifest may grant it.
    ///
    /// Default: the deny-by-default baseline.
    pub manifest_permission_ceiling: PermissionSet,

    /// Granularity of the hard-abort timer used by the wasm backend, in
    /// milliseconds.
    ///
    /// Default: **10 ms**.
    pub interrupt_tick_ms: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_pack_size: 10 * 1024 * 1024,
            allowed_extensions: vec!["wasm".to_owned()],
            require_signature: false,
            trusted_publisher_keys: Vec::new(),
            default_permissions: PermissionSet::default(),
            default_limits: ResourceLimits::default(),
            manifest_permission_ceiling: PermissionSet::default(),
            interrupt_tick_ms: 10,
        }
    }
}

impl SandboxConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a configuration from TOML text. Missing keys keep their
    /// defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| SandboxError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read a configuration from a TOML file on disk.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)?;
        tracing::debug!(path = %path.display(), "sandbox configuration loaded");
        Ok(config)
    }

    /// Reject configurations that would make every load fail or disable the
    /// abort timer.
    pub fn validate(&self) -> Result<()> {
        if self.max_pack_size == 0 {
            return Err(SandboxError::Config("max_pack_size must be non-zero".into()));
        }
        if self.allowed_extensions.is_empty() {
            return Err(SandboxError::Config(
                "allowed_extensions must not be empty".into(),
            ));
        }
        if self.interrupt_tick_ms == 0 {
            return Err(SandboxError::Config(
                "interrupt_tick_ms must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Tick interval of the wasm hard-abort timer.
    pub fn interrupt_tick(&self) -> Duration {
        Duration::from_millis(self.interrupt_tick_ms)
    }

    /// Set the pack size ceiling (in bytes).
    pub fn with_max_pack_size(mut self, bytes: u64) -> Self {
        self.max_pack_size = bytes;
        self
    }

    /// Replace the extension allow-list.
    pub fn with_allowed_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_extensions = extensions.into_iter().map(Into::into).collect();
        self
    }

    /// Require (or stop requiring) detached signatures.
    pub fn with_require_signature(mut self, require: bool) -> Self {
        self.require_signature = require;
        self
    }

    /// Trust an additional base64-encoded Ed25519 publisher key.
    pub fn with_trusted_key(mut self, key_b64: impl Into<String>) -> Self {
        self.trusted_publisher_keys.push(key_b64.into());
        self
    }

    /// Set the permissions used when a caller requests none.
    pub fn with_default_permissions(mut self, permissions: PermissionSet) -> Self {
        self.default_permissions = permissions;
        self
    }

    /// Set the limits assigned to newly loaded packs.
    pub fn with_default_limits(mut self, limits: ResourceLimits) -> Self {
        self.default_limits = limits;
        self
    }

    /// Set the ceiling applied to manifest-requested permissions.
    pub fn with_manifest_permission_ceiling(mut self, ceiling: PermissionSet) -> Self {
        self.manifest_permission_ceiling = ceiling;
        self
    }

    /// Set the hard-abort timer granularity (in milliseconds).
    pub fn with_interrupt_tick_ms(mut self, ms: u64) -> Self {
        self.interrupt_tick_ms = ms;
        self
    }
}
