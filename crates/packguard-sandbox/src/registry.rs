//! Registry of loaded packs.
//!
//! [`PackRegistry`] is the single source of truth for "is this pack loaded"
//! and the only entry and exit point for lifecycle transitions.  The loaded
//! map is a [`DashMap`]; mutations for one pack name are linearized through a
//! per-name async lock, so a load and an unload of the same name can never
//! interleave.  Operations on different names run fully in parallel.
//!
//! Every refused load is reported to the [`AuditSink`] as a security
//! violation; successful loads and unloads are reported as system events.

use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::audit::{AuditEvent, AuditSink, Severity};
use crate::config::SandboxConfig;
use crate::error::{Result, SandboxError, ValidationFailure};
use crate::isolation::{
    IsolationBackend, IsolationContext, PackIdentity, PackInfo, PackState,
};
use crate::permissions::{Access, PermissionSet, ResourceLimits, default_permissions};
use crate::signature::SignatureValidator;

/// Concurrent registry of loaded packs.
///
/// Cheaply cloneable (`Arc`-backed) and `Send + Sync`.
#[derive(Clone)]
pub struct PackRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    packs: DashMap<String, Arc<IsolationContext>>,
    /// States of names that are not (or no longer) in `packs`.
    transient: DashMap<String, PackState>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    validator: SignatureValidator,
    backend: Arc<dyn IsolationBackend>,
    audit: Arc<dyn AuditSink>,
    default_limits: ResourceLimits,
}

impl PackRegistry {
    /// Create an empty registry.
    pub fn new(
        config: &SandboxConfig,
        backend: Arc<dyn IsolationBackend>,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self> {
        let validator = SignatureValidator::new(config)?;
        tracing::debug!(backend = backend.kind(), "pack registry created");
        Ok(Self {
            inner: Arc::new(Inner {
                packs: DashMap::new(),
                transient: DashMap::new(),
                locks: DashMap::new(),
                validator,
                backend,
                audit,
                default_limits: config.default_limits,
            }),
        })
    }

    /// The validator that gates every load.
    pub fn validator(&self) -> &SignatureValidator {
        &self.inner.validator
    }

    /// The sink receiving this registry's audit records.
    pub fn audit_sink(&self) -> Arc<dyn AuditSink> {
        Arc::clone(&self.inner.audit)
    }

    /// The deny-by-default baseline.
    pub fn default_permissions(&self) -> PermissionSet {
        default_permissions()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Validate, build and register the pack at `path`.
    ///
    /// On any failure a security violation is audited and nothing is
    /// registered.
    pub async fn load_pack(
        &self,
        path: &Path,
        permissions: PermissionSet,
    ) -> Result<PackIdentity> {
        let name = match self.inner.validator.check_name(path) {
            Ok(name) => name,
            Err(failure) => {
                let label = file_label(path);
                self.refuse_load(&label, &failure);
                return Err(failure.into());
            }
        };

        let lock = self.lock_for(&name);
        let outcome = {
            let _guard = lock.lock().await;
            self.load_locked(&name, path, permissions).await
        };
        drop(lock);
        self.forget_lock(&name);
        outcome
    }

    async fn load_locked(
        &self,
        name: &str,
        path: &Path,
        permissions: PermissionSet,
    ) -> Result<PackIdentity> {
        if self.inner.packs.contains_key(name) {
            self.inner.audit.record(AuditEvent::violation(
                "load_pack",
                name,
                "pack already loaded",
            ));
            return Err(SandboxError::AlreadyLoaded {
                name: name.to_owned(),
            });
        }

        self.inner
            .transient
            .insert(name.to_owned(), PackState::Validating);

        let validator = self.inner.validator.clone();
        let owned_path = path.to_path_buf();
        let verified = tokio::task::spawn_blocking(move || validator.verify(&owned_path))
            .await
            .map_err(|e| SandboxError::LoadFailure {
                name: name.to_owned(),
                reason: format!("validation task failed: {e}"),
            });
        let verified = match verified {
            Ok(Ok(pack)) => pack,
            Ok(Err(failure)) => {
                self.inner.transient.remove(name);
                self.refuse_load(name, &failure);
                return Err(failure.into());
            }
            Err(err) => {
                self.inner.transient.insert(name.to_owned(), PackState::Error);
                self.inner.audit.record(
                    AuditEvent::violation("load_pack", name, &err.to_string())
                        .with_severity(Severity::Critical),
                );
                return Err(err);
            }
        };

        let limits = self.inner.default_limits;
        let boundary = match self.inner.backend.instantiate(&verified, &limits).await {
            Ok(boundary) => boundary,
            Err(err) => {
                self.inner.transient.insert(name.to_owned(), PackState::Error);
                self.inner
                    .audit
                    .record(AuditEvent::violation("load_pack", name, &err.to_string()));
                tracing::warn!(pack = %name, error = %err, "pack failed to load");
                return Err(err);
            }
        };

        let identity = PackIdentity {
            name: name.to_owned(),
            path: verified.path.clone(),
        };
        let context = Arc::new(IsolationContext::new(
            identity.clone(),
            permissions,
            limits,
            boundary,
        ));
        let operations = context.info().operations.len();

        self.inner.packs.insert(name.to_owned(), context);
        self.inner.transient.remove(name);

        self.inner.audit.record(
            AuditEvent::system("load_pack", name)
                .with_metadata("backend", self.inner.backend.kind())
                .with_metadata("signed", verified.signed)
                .with_metadata("operations", operations),
        );
        tracing::info!(
            pack = %name,
            signed = verified.signed,
            operations,
            "pack loaded"
        );

        Ok(identity)
    }

    /// Release and remove the pack called `name`.
    ///
    /// Absent names are a silent no-op. Waits for the call in flight, if
    /// any, before the boundary is released.
    pub async fn unload_pack(&self, name: &str) -> Result<()> {
        let lock = self.lock_for(name);
        let outcome = {
            let _guard = lock.lock().await;
            self.unload_locked(name).await
        };
        drop(lock);
        self.forget_lock(name);
        outcome
    }

    async fn unload_locked(&self, name: &str) -> Result<()> {
        let Some(context) = self.get(name) else {
            // Forget a failed load so its `Error` state does not linger.
            self.inner.transient.remove(name);
            tracing::debug!(pack = %name, "unload of pack that is not loaded; ignoring");
            return Ok(());
        };

        let released = context.release().await;
        self.inner.packs.remove(name);

        match released {
            Ok(()) => {
                self.inner.transient.remove(name);
                self.inner
                    .audit
                    .record(AuditEvent::system("unload_pack", name));
                tracing::info!(pack = %name, "pack unloaded");
                Ok(())
            }
            Err(err) => {
                self.inner.transient.insert(name.to_owned(), PackState::Error);
                self.inner.audit.record(
                    AuditEvent::system("unload_pack", name)
                        .failed(&err.to_string())
                        .with_severity(Severity::Warning),
                );
                tracing::warn!(pack = %name, error = %err, "pack boundary failed to release");
                Err(err)
            }
        }
    }

    /// Replace the limits of a loaded pack. No-op if absent.
    ///
    /// Calls already in flight keep the limits they started with.
    pub async fn set_resource_limits(&self, name: &str, limits: ResourceLimits) {
        let lock = self.lock_for(name);
        {
            let _guard = lock.lock().await;
            if let Some(context) = self.get(name) {
                context.set_limits(limits);
                tracing::info!(pack = %name, ?limits, "resource limits updated");
            }
        }
        drop(lock);
        self.forget_lock(name);
    }

    /// Replace the permission set of a loaded pack. No-op if absent.
    pub async fn set_permissions(&self, name: &str, permissions: PermissionSet) {
        let lock = self.lock_for(name);
        {
            let _guard = lock.lock().await;
            if let Some(context) = self.get(name) {
                context.set_permissions(permissions);
                self.inner
                    .audit
                    .record(AuditEvent::system("set_permissions", name));
                tracing::info!(pack = %name, "permissions updated");
            }
        }
        drop(lock);
        self.forget_lock(name);
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Snapshot of every loaded pack, sorted by name.
    pub fn list_loaded_packs(&self) -> Vec<PackInfo> {
        let mut packs: Vec<PackInfo> = self
            .inner
            .packs
            .iter()
            .map(|entry| entry.value().info())
            .collect();
        packs.sort_by(|a, b| a.name.cmp(&b.name));
        packs
    }

    /// Lifecycle state of `name`, including names that are mid-load or
    /// failed to load.
    pub fn state(&self, name: &str) -> PackState {
        if let Some(context) = self.inner.packs.get(name) {
            return context.state();
        }
        self.inner
            .transient
            .get(name)
            .map(|s| *s)
            .unwrap_or(PackState::Unloaded)
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.inner.packs.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.inner.packs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.packs.is_empty()
    }

    /// Check a privileged access against the pack's permissions.
    ///
    /// A denial is always audited as a security violation.
    pub fn authorize(&self, name: &str, access: &Access) -> Result<()> {
        let context = self.get(name).ok_or_else(|| SandboxError::PackNotLoaded {
            name: name.to_owned(),
        })?;

        match context.permissions().check(access) {
            Ok(()) => {
                tracing::trace!(pack = %name, access = access.kind(), "access granted");
                Ok(())
            }
            Err(reason) => {
                self.inner.audit.record(
                    AuditEvent::violation("authorize", name, &reason)
                        .with_metadata("access", access.kind()),
                );
                tracing::warn!(pack = %name, access = access.kind(), "access denied");
                Err(SandboxError::PermissionDenied {
                    pack: name.to_owned(),
                    access: access.to_string(),
                })
            }
        }
    }

    pub(crate) fn get(&self, name: &str) -> Option<Arc<IsolationContext>> {
        self.inner
            .packs
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn refuse_load(&self, resource: &str, failure: &ValidationFailure) {
        let severity = match failure {
            ValidationFailure::SignatureInvalid => Severity::Critical,
            _ => Severity::Warning,
        };
        self.inner.audit.record(
            AuditEvent::violation("load_pack", resource, &failure.to_string())
                .with_severity(severity),
        );
        tracing::warn!(pack = %resource, reason = %failure, "pack refused");
    }

    fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.inner
                .locks
                .entry(name.to_owned())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    /// Drop the per-name lock once nobody else holds or waits on it.
    fn forget_lock(&self, name: &str) {
        self.inner
            .locks
            .remove_if(name, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl std::fmt::Debug for PackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackRegistry")
            .field("backend", &self.inner.backend.kind())
            .field("loaded", &self.inner.packs.len())
            .finish_non_exhaustive()
    }
}

/// A label for a refused path that never includes its directories.
fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "<unnamed>".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditEventType, MemoryAuditSink};
    use crate::testing::{FakeBackend, write_pack};
    use std::time::Duration;

    fn registry(backend: FakeBackend) -> (PackRegistry, Arc<MemoryAuditSink>) {
        let sink = Arc::new(MemoryAuditSink::new());
        let registry =
            PackRegistry::new(&SandboxConfig::default(), Arc::new(backend), sink.clone()).unwrap();
        (registry, sink)
    }

    #[tokio::test]
    async fn load_registers_and_audits() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_pack(tmp.path(), "sample");
        let (registry, sink) = registry(FakeBackend::default());

        let identity = registry
            .load_pack(&path, default_permissions())
            .await
            .unwrap();
        assert_eq!(identity.name, "sample");
        assert!(registry.is_loaded("sample"));
        assert_eq!(registry.state("sample"), PackState::Loaded);
        assert_eq!(registry.len(), 1);

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, AuditEventType::SystemEvent);
        assert_eq!(events[0].resource, "sample");
        assert!(!events[0].metadata.values().any(|v| v.contains("sample.wasm")));
    }

    #[tokio::test]
    async fn duplicate_load_is_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_pack(tmp.path(), "sample");
        let backend = FakeBackend::default();
        let (registry, sink) = registry(backend.clone());

        registry.load_pack(&path, default_permissions()).await.unwrap();
        let err = registry
            .load_pack(&path, PermissionSet::new().with_network(true))
            .await
            .unwrap_err();

        assert!(matches!(err, SandboxError::AlreadyLoaded { .. }));
        assert_eq!(registry.len(), 1);
        assert!(!registry.list_loaded_packs()[0].permissions.allow_network);
        assert_eq!(sink.count(AuditEventType::SecurityViolation), 1);
        assert_eq!(backend.instantiations.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disallowed_extension_never_registers() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("tool.exe");
        std::fs::write(&path, crate::signature::WASM_HEADER).unwrap();
        let (registry, sink) = registry(FakeBackend::default());

        let err = registry
            .load_pack(&path, default_permissions())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SandboxError::Validation(ValidationFailure::DisallowedExtension { .. })
        ));
        assert!(registry.is_empty());
        assert_eq!(registry.state("tool"), PackState::Unloaded);

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, AuditEventType::SecurityViolation);
        assert_eq!(events[0].resource, "tool.exe");
    }

    #[tokio::test]
    async fn backend_failure_leaves_error_state() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_pack(tmp.path(), "broken");
        let (registry, sink) = registry(FakeBackend::refusing());

        let err = registry
            .load_pack(&path, default_permissions())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::LoadFailure { .. }));
        assert!(!registry.is_loaded("broken"));
        assert_eq!(registry.state("broken"), PackState::Error);
        assert_eq!(sink.count(AuditEventType::SecurityViolation), 1);

        sink.drain();
        registry.unload_pack("broken").await.unwrap();
        assert_eq!(registry.state("broken"), PackState::Unloaded);
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn unload_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_pack(tmp.path(), "sample");
        let backend = FakeBackend::default();
        let (registry, sink) = registry(backend.clone());

        registry.load_pack(&path, default_permissions()).await.unwrap();
        sink.drain();

        registry.unload_pack("sample").await.unwrap();
        registry.unload_pack("sample").await.unwrap();

        assert!(!registry.is_loaded("sample"));
        assert_eq!(registry.state("sample"), PackState::Unloaded);
        assert_eq!(backend.unload_count(), 1);
        assert_eq!(sink.events().len(), 1);
        assert_eq!(sink.count(AuditEventType::SystemEvent), 1);
    }

    #[tokio::test]
    async fn unload_unknown_is_silent() {
        let (registry, sink) = registry(FakeBackend::default());
        registry.unload_pack("never-loaded").await.unwrap();
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn unload_waits_for_execution_slot() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_pack(tmp.path(), "busy");
        let backend = FakeBackend::default();
        let (registry, _sink) = registry(backend.clone());
        registry.load_pack(&path, default_permissions()).await.unwrap();

        let context = registry.get("busy").unwrap();
        let slot = context.slot().await;

        let unloader = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.unload_pack("busy").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!unloader.is_finished());
        assert!(registry.is_loaded("busy"));

        drop(slot);
        unloader.await.unwrap().unwrap();
        assert!(!registry.is_loaded("busy"));
        assert_eq!(backend.unload_count(), 1);
    }

    #[tokio::test]
    async fn limits_and_permissions_update_only_loaded_packs() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_pack(tmp.path(), "sample");
        let (registry, _sink) = registry(FakeBackend::default());

        registry
            .set_resource_limits("ghost", ResourceLimits::new().with_max_threads(1))
            .await;
        assert_eq!(registry.state("ghost"), PackState::Unloaded);

        registry.load_pack(&path, default_permissions()).await.unwrap();
        registry
            .set_resource_limits("sample", ResourceLimits::new().with_max_threads(1))
            .await;
        registry
            .set_permissions("sample", PermissionSet::new().with_database(true))
            .await;

        let info = &registry.list_loaded_packs()[0];
        assert_eq!(info.limits.max_threads, 1);
        assert!(info.permissions.allow_database);
    }

    #[tokio::test]
    async fn authorize_audits_denials_only() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_pack(tmp.path(), "sample");
        let (registry, sink) = registry(FakeBackend::default());
        registry
            .load_pack(&path, PermissionSet::new().with_network(true).with_host("api.example.com"))
            .await
            .unwrap();
        sink.drain();

        registry
            .authorize("sample", &Access::Network("api.example.com".into()))
            .unwrap();
        assert!(sink.events().is_empty());

        let err = registry
            .authorize("sample", &Access::Filesystem("/etc/passwd".into()))
            .unwrap_err();
        assert!(matches!(err, SandboxError::PermissionDenied { .. }));
        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, AuditEventType::SecurityViolation);
        assert_eq!(events[0].metadata["access"], "filesystem");
        assert!(!format!("{events:?}").contains("/etc/passwd"));

        assert!(matches!(
            registry.authorize("ghost", &Access::Ui),
            Err(SandboxError::PackNotLoaded { .. })
        ));
    }

    #[tokio::test]
    async fn list_is_sorted_and_unique() {
        let tmp = tempfile::tempdir().unwrap();
        let (registry, _sink) = registry(FakeBackend::default());
        for name in ["charlie", "alpha", "bravo"] {
            let path = write_pack(tmp.path(), name);
            registry.load_pack(&path, default_permissions()).await.unwrap();
        }
        let names: Vec<String> = registry
            .list_loaded_packs()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["alpha", "bravo", "charlie"]);

        registry.unload_pack("bravo").await.unwrap();
        assert!(registry.list_loaded_packs().iter().all(|p| p.name != "bravo"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_load_and_unload_stay_consistent() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_pack(tmp.path(), "contended");
        let backend = FakeBackend::default();
        let (registry, _sink) = registry(backend.clone());

        let mut tasks = Vec::new();
        for i in 0..32 {
            let registry = registry.clone();
            let path = path.clone();
            tasks.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    let _ = registry.load_pack(&path, default_permissions()).await;
                } else {
                    registry.unload_pack("contended").await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let loads = backend.instantiations.load(std::sync::atomic::Ordering::SeqCst);
        let expected_loaded = usize::from(registry.is_loaded("contended"));
        assert_eq!(loads - backend.unload_count(), expected_loaded);
        assert!(registry.list_loaded_packs().len() <= 1);
    }
}
