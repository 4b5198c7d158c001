//! Sandbox runtime facade.
//!
//! [`SandboxRuntime`] bundles the registry, validator, coordinator and audit
//! sink behind the API the host application uses: load a pack securely,
//! execute its operations, adjust its limits and permissions, and unload it.

use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditSink, TracingAuditSink};
use crate::config::SandboxConfig;
use crate::coordinator::ExecutionCoordinator;
use crate::error::{Result, ValidationFailure};
use crate::isolation::{IsolationBackend, PackIdentity, PackInfo, PackState};
use crate::loader::PackLoader;
use crate::permissions::{Access, PermissionSet, ResourceLimits, default_permissions};
use crate::registry::PackRegistry;
use crate::wasm::WasmBackend;

/// The pack sandbox.
///
/// Cheaply cloneable; clones share the same registry.
#[derive(Debug, Clone)]
pub struct SandboxRuntime {
    config: Arc<SandboxConfig>,
    registry: PackRegistry,
    coordinator: ExecutionCoordinator,
}

impl SandboxRuntime {
    /// Create a runtime backed by wasmtime that audits to `tracing`.
    pub fn new(config: SandboxConfig) -> Result<Self> {
        config.validate()?;
        let backend = WasmBackend::new(&config)?;
        Self::with_parts(config, Arc::new(backend), Arc::new(TracingAuditSink))
    }

    /// Create a runtime with default configuration.
    pub fn with_defaults() -> Result<Self> {
        Self::new(SandboxConfig::default())
    }

    /// Create a runtime from an explicit backend and audit sink.
    pub fn with_parts(
        config: SandboxConfig,
        backend: Arc<dyn IsolationBackend>,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self> {
        config.validate()?;
        let registry = PackRegistry::new(&config, backend, audit)?;
        let coordinator = ExecutionCoordinator::new(registry.clone());

        tracing::info!(
            max_pack_size = config.max_pack_size,
            require_signature = config.require_signature,
            trusted_keys = config.trusted_publisher_keys.len(),
            "sandbox runtime initialized"
        );

        Ok(Self {
            config: Arc::new(config),
            registry,
            coordinator,
        })
    }

    /// Return a reference to the runtime configuration.
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Return the underlying registry.
    pub fn registry(&self) -> &PackRegistry {
        &self.registry
    }

    /// Validate and load the pack at `path`.
    ///
    /// `None` grants the configured default permissions.
    pub async fn load_pack_securely(
        &self,
        path: &Path,
        permissions: Option<PermissionSet>,
    ) -> Result<PackIdentity> {
        let permissions = permissions.unwrap_or_else(|| self.config.default_permissions.clone());
        self.registry.load_pack(path, permissions).await
    }

    /// Unload the named pack. Unknown names are a no-op.
    pub async fn unload_pack(&self, name: &str) -> Result<()> {
        self.registry.unload_pack(name).await
    }

    /// `true` when the binary at `path` passes every trust check.
    pub fn validate_pack_signature(&self, path: &Path) -> bool {
        self.registry.validator().validate(path)
    }

    /// Like [`validate_pack_signature`](Self::validate_pack_signature), but
    /// says why a pack is untrusted.
    pub fn check_pack(&self, path: &Path) -> std::result::Result<(), ValidationFailure> {
        self.registry.validator().check(path)
    }

    /// The deny-by-default baseline permissions.
    pub fn default_permissions(&self) -> PermissionSet {
        default_permissions()
    }

    /// Replace the limits of a loaded pack. No-op if absent.
    pub async fn set_resource_limits(&self, name: &str, limits: ResourceLimits) {
        self.registry.set_resource_limits(name, limits).await;
    }

    /// Replace the permission set of a loaded pack. No-op if absent.
    pub async fn set_permissions(&self, name: &str, permissions: PermissionSet) {
        self.registry.set_permissions(name, permissions).await;
    }

    /// Run `method` on the pack called `name` under its execution deadline.
    pub async fn execute_pack_method(
        &self,
        name: &str,
        method: &str,
        args: Value,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        self.coordinator.execute(name, method, args, cancel).await
    }

    /// Snapshot of every loaded pack, sorted by name.
    pub fn loaded_packs(&self) -> Vec<PackInfo> {
        self.registry.list_loaded_packs()
    }

    /// Lifecycle state of `name`.
    pub fn pack_state(&self, name: &str) -> PackState {
        self.registry.state(name)
    }

    /// Check a privileged access on behalf of a pack.
    pub fn authorize(&self, name: &str, access: &Access) -> Result<()> {
        self.registry.authorize(name, access)
    }

    /// Load every pack found in `dir`, skipping the ones that fail.
    pub async fn load_directory(&self, dir: &Path) -> Result<Vec<PackIdentity>> {
        PackLoader::new(dir, self.clone()).load_all().await
    }
}
