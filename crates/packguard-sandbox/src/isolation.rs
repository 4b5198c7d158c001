//! Isolation boundary and per-pack context.
//!
//! An [`IsolationBackend`] turns verified bytes into an [`IsolatedPack`]: the
//! boundary that exclusively owns the pack's code.  The boundary publishes a
//! closed capability table ([`IsolatedPack::operations`]) at load time, so
//! dispatch is a lookup into a fixed set of names rather than open-ended
//! reflection.
//!
//! Each loaded pack is wrapped in an [`IsolationContext`] owned by the
//! registry.  The context holds the boundary behind an async mutex; that mutex
//! is also the pack's execution slot, which serializes calls per pack and lets
//! unload wait for the call in flight.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::permissions::{PermissionSet, ResourceLimits};
use crate::signature::VerifiedPack;

// ---------------------------------------------------------------------------
// Backend contract
// ---------------------------------------------------------------------------

/// Builds isolation boundaries from verified pack binaries.
#[async_trait]
pub trait IsolationBackend: Send + Sync {
    /// Short backend identifier used in logs.
    fn kind(&self) -> &'static str;

    /// Load `pack` into a fresh boundary.
    ///
    /// Must fail with [`SandboxError::LoadFailure`](crate::SandboxError::LoadFailure)
    /// when the code is corrupt or lacks what the backend needs to run it.
    async fn instantiate(
        &self,
        pack: &VerifiedPack,
        limits: &ResourceLimits,
    ) -> Result<Box<dyn IsolatedPack>>;
}

/// One pack's code, exclusively owned by its [`IsolationContext`].
#[async_trait]
pub trait IsolatedPack: Send + Sync {
    /// The closed set of operation names this pack exposes.
    fn operations(&self) -> BTreeSet<String>;

    /// Run one operation.
    ///
    /// `call.cancel` fires on caller cancellation or deadline; backends that
    /// can stop the code should do so and return [`PackFault::Interrupted`].
    async fn invoke(&self, call: Invocation) -> std::result::Result<Value, PackFault>;

    /// Release everything the boundary holds. Called exactly once, before the
    /// context leaves the registry.
    async fn unload(&mut self) -> Result<()>;
}

/// A single dispatch into a pack.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub method: String,
    pub args: Value,
    /// Limits captured when the call started.
    pub limits: ResourceLimits,
    /// Fires on caller cancellation or when the deadline passes.
    pub cancel: CancellationToken,
}

/// How a pack call failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackFault {
    /// The pack's own code reported or raised an error.
    Failed(String),
    /// The backend stopped the call because its token fired.
    Interrupted,
    /// The boundary is unusable; the pack should be unloaded.
    Fatal(String),
}

impl fmt::Display for PackFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(reason) => write!(f, "{reason}"),
            Self::Interrupted => f.write_str("interrupted"),
            Self::Fatal(reason) => write!(f, "fatal: {reason}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Identity, state, snapshots
// ---------------------------------------------------------------------------

/// Who a loaded pack is. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackIdentity {
    /// Registry key, derived from the file stem.
    pub name: String,
    /// Where the binary was loaded from. Never written to audit records.
    pub path: PathBuf,
}

/// Lifecycle state of a pack name.
///
/// ```text
/// Unloaded -> Validating -> Loaded -> (Executing)* -> Unloading -> Unloaded
///                  \-> Error      \-> Error
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackState {
    Unloaded,
    Validating,
    Loaded,
    Executing,
    Unloading,
    Error,
}

/// Read-only snapshot of a loaded pack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackInfo {
    pub name: String,
    pub state: PackState,
    pub permissions: PermissionSet,
    pub limits: ResourceLimits,
    pub loaded_at: DateTime<Utc>,
    /// A call is in flight.
    pub is_active: bool,
    /// Capability table.
    pub operations: Vec<String>,
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Everything the sandbox knows about one loaded pack.
pub struct IsolationContext {
    identity: PackIdentity,
    permissions: RwLock<PermissionSet>,
    limits: RwLock<ResourceLimits>,
    loaded_at: DateTime<Utc>,
    state: RwLock<PackState>,
    operations: BTreeSet<String>,
    boundary: Mutex<Option<Box<dyn IsolatedPack>>>,
}

impl IsolationContext {
    /// Wrap a freshly built boundary. The context starts `Loaded`.
    pub fn new(
        identity: PackIdentity,
        permissions: PermissionSet,
        limits: ResourceLimits,
        boundary: Box<dyn IsolatedPack>,
    ) -> Self {
        let operations = boundary.operations();
        Self {
            identity,
            permissions: RwLock::new(permissions),
            limits: RwLock::new(limits),
            loaded_at: Utc::now(),
            state: RwLock::new(PackState::Loaded),
            operations,
            boundary: Mutex::new(Some(boundary)),
        }
    }

    pub fn identity(&self) -> &PackIdentity {
        &self.identity
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    /// Whether the capability table contains `method`.
    pub fn has_operation(&self, method: &str) -> bool {
        self.operations.contains(method)
    }

    pub fn permissions(&self) -> PermissionSet {
        self.permissions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn limits(&self) -> ResourceLimits {
        *self.limits.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> PackState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn set_permissions(&self, permissions: PermissionSet) {
        *self.permissions.write().unwrap_or_else(|e| e.into_inner()) = permissions;
    }

    pub(crate) fn set_limits(&self, limits: ResourceLimits) {
        *self.limits.write().unwrap_or_else(|e| e.into_inner()) = limits;
    }

    pub(crate) fn set_state(&self, state: PackState) {
        let mut guard = self.state.write().unwrap_or_else(|e| e.into_inner());
        tracing::trace!(pack = %self.identity.name, old = ?*guard, new = ?state, "pack state changed");
        *guard = state;
    }

    /// Acquire the execution slot. Waits for the call in flight, if any.
    pub(crate) async fn slot(&self) -> MutexGuard<'_, Option<Box<dyn IsolatedPack>>> {
        self.boundary.lock().await
    }

    /// Snapshot for listing.
    pub fn info(&self) -> PackInfo {
        let state = self.state();
        PackInfo {
            name: self.identity.name.clone(),
            state,
            permissions: self.permissions(),
            limits: self.limits(),
            loaded_at: self.loaded_at,
            is_active: state == PackState::Executing,
            operations: self.operations.iter().cloned().collect(),
        }
    }

    /// Release the boundary. Waits for the call in flight first.
    ///
    /// After this returns the context is `Unloaded` and every later call
    /// through it fails with `PackNotLoaded`.
    pub(crate) async fn release(&self) -> Result<()> {
        let mut slot = self.slot().await;
        self.set_state(PackState::Unloading);
        let outcome = match slot.take() {
            Some(mut boundary) => boundary.unload().await,
            None => Ok(()),
        };
        self.set_state(match outcome {
            Ok(()) => PackState::Unloaded,
            Err(_) => PackState::Error,
        });
        outcome
    }
}

impl fmt::Debug for IsolationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IsolationContext")
            .field("name", &self.identity.name)
            .field("state", &self.state())
            .field("loaded_at", &self.loaded_at)
            .field("operations", &self.operations)
            .finish_non_exhaustive()
    }
}
