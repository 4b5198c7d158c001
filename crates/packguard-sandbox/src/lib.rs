//! Packguard pack sandbox.
//!
//! This crate takes third-party binary extensions ("packs"), validates them,
//! loads each one into an isolation boundary, constrains what it may do, bounds
//! how long and how much it may consume, and tears it down cleanly.
//!
//! - **[`config`]** -- [`SandboxConfig`] controls size ceilings, trust policy,
//!   and the default permissions and limits.
//! - **[`error`]** -- [`SandboxError`] enumerates every failure mode.
//! - **[`permissions`]** -- [`PermissionSet`], [`ResourceLimits`] and the
//!   [`Access`] checks built on them.
//! - **[`signature`]** -- [`SignatureValidator`] gates every load.
//! - **[`isolation`]** -- the backend seam and the per-pack
//!   [`IsolationContext`].
//! - **[`registry`]** -- [`PackRegistry`], the authoritative set of loaded
//!   packs.
//! - **[`coordinator`]** -- [`ExecutionCoordinator`] runs operations under a
//!   deadline.
//! - **[`audit`]** -- [`AuditEvent`] and the [`AuditSink`] trait.
//! - **[`wasm`]** -- [`WasmBackend`], the wasmtime isolation backend.
//! - **[`loader`]** -- [`PackLoader`] for whole directories.
//! - **[`runtime`]** -- [`SandboxRuntime`] is the main entry point.
//!
//! # Resource limits
//!
//! With [`WasmBackend`], memory and CPU time are enforced per call and a call
//! that overruns is hard-aborted.  Thread limits hold trivially because wasm
//! threads are disabled.  `max_file_handles` is advisory: no WASI is linked,
//! so packs cannot open files at all.  Other [`IsolationBackend`]
//! implementations decide for themselves; an in-process backend cannot stop a
//! call that ignores its cancellation token, and the coordinator then only
//! abandons it.
//!
//! All public types are `Send + Sync` and designed for use within a
//! multi-threaded tokio runtime.

pub mod audit;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod isolation;
pub mod loader;
pub mod permissions;
pub mod registry;
pub mod runtime;
pub mod signature;
pub mod wasm;

#[cfg(test)]
pub(crate) mod testing;

// Re-export the most commonly used types at the crate root.
pub use audit::{AuditEvent, AuditEventType, AuditSink, MemoryAuditSink, Severity, TracingAuditSink};
pub use config::SandboxConfig;
pub use coordinator::ExecutionCoordinator;
pub use error::{Result, SandboxError, ValidationFailure};
pub use isolation::{
    Invocation, IsolatedPack, IsolationBackend, IsolationContext, PackFault, PackIdentity,
    PackInfo, PackState,
};
pub use loader::{PackLoader, PackManifest};
pub use permissions::{Access, PermissionSet, ResourceLimits, default_permissions};
pub use registry::PackRegistry;
pub use runtime::SandboxRuntime;
pub use signature::{SignatureValidator, VerifiedPack};
pub use wasm::WasmBackend;
