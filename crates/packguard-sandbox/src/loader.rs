//! Pack discovery and bulk loading.
//!
//! The [`PackLoader`] scans a directory for pack binaries with an allowed
//! extension, reads the optional `<stem>.json` manifest next to each one, and
//! loads every pack through the [`SandboxRuntime`].  Packs that fail are
//! logged and skipped rather than aborting the entire batch.

use std::path::{Path, PathBuf};

use futures::future::join_all;
use serde::{Deserialize, Serialize};

use crate::audit::AuditEvent;
use crate::error::{Result, SandboxError};
use crate::isolation::PackIdentity;
use crate::permissions::PermissionSet;
use crate::runtime::SandboxRuntime;

/// Metadata shipped alongside a pack binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackManifest {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Permissions the pack asks for. Absent means the runtime defaults.
    #[serde(default)]
    pub permissions: Option<PermissionSet>,
}

impl PackManifest {
    /// Parse a manifest from JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| SandboxError::Manifest(e.to_string()))
    }

    /// Read the manifest that belongs to `binary`, if there is one.
    pub async fn for_binary(binary: &Path) -> Result<Option<Self>> {
        let path = manifest_path(binary);
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Self::from_json(&text).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SandboxError::Io(e)),
        }
    }
}

/// Location of the manifest for `binary` (`<stem>.json` in the same
/// directory).
pub fn manifest_path(binary: &Path) -> PathBuf {
    binary.with_extension("json")
}

/// Discovers and loads the packs in one directory.
#[derive(Debug, Clone)]
pub struct PackLoader {
    packs_dir: PathBuf,
    runtime: SandboxRuntime,
}

impl PackLoader {
    pub fn new(packs_dir: impl Into<PathBuf>, runtime: SandboxRuntime) -> Self {
        Self {
            packs_dir: packs_dir.into(),
            runtime,
        }
    }

    /// Return the configured packs directory.
    pub fn packs_dir(&self) -> &Path {
        &self.packs_dir
    }

    /// List candidate pack binaries, sorted for a deterministic load order.
    pub async fn discover(&self) -> Result<Vec<PathBuf>> {
        let dir = &self.packs_dir;

        if !dir.exists() {
            tracing::warn!(path = %dir.display(), "packs directory does not exist");
            return Ok(Vec::new());
        }
        if !dir.is_dir() {
            return Err(SandboxError::Io(std::io::Error::new(
                std::io::ErrorKind::NotADirectory,
                format!("{} is not a directory", dir.display()),
            )));
        }

        let allowed = &self.runtime.config().allowed_extensions;
        let mut entries = Vec::new();
        let mut read_dir = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            let matches = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|ext| {
                    allowed
                        .iter()
                        .any(|a| a.trim_start_matches('.').eq_ignore_ascii_case(ext))
                });
            if matches {
                entries.push(path);
            }
        }
        entries.sort();

        tracing::info!(
            packs_dir = %dir.display(),
            count = entries.len(),
            "discovered pack files"
        );
        Ok(entries)
    }

    /// Load every discovered pack. Failures are logged and skipped.
    ///
    /// The returned identities are sorted by name.
    pub async fn load_all(&self) -> Result<Vec<PackIdentity>> {
        let entries = self.discover().await?;
        let results = join_all(entries.iter().map(|path| self.load_one(path))).await;

        let mut loaded = Vec::with_capacity(results.len());
        for (path, result) in entries.iter().zip(results) {
            match result {
                Ok(identity) => loaded.push(identity),
                Err(err) => {
                    tracing::warn!(
                        file = %path.file_name().unwrap_or_default().to_string_lossy(),
                        error = %err,
                        "failed to load pack, skipping"
                    );
                }
            }
        }
        loaded.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(loaded)
    }

    /// Load one pack with the permissions its manifest requests, capped at
    /// the configured manifest ceiling.
    pub async fn load_one(&self, path: &Path) -> Result<PackIdentity> {
        let manifest = PackManifest::for_binary(path).await?;
        let permissions = match &manifest {
            Some(m) => {
                tracing::debug!(
                    pack_id = %m.id,
                    name = %m.name,
                    version = %m.version,
                    "read pack manifest"
                );
                m.permissions
                    .as_ref()
                    .map(|requested| self.cap_requested(path, requested))
            }
            None => None,
        };
        self.runtime.load_pack_securely(path, permissions).await
    }

    fn cap_requested(&self, path: &Path, requested: &PermissionSet) -> PermissionSet {
        let capped = requested.capped_by(&self.runtime.config().manifest_permission_ceiling);
        if capped != *requested {
            // Illegal names are refused and audited by the load itself.
            if let Ok(name) = self.runtime.registry().validator().check_name(path) {
                self.runtime.registry().audit_sink().record(AuditEvent::violation(
                    "manifest_permissions",
                    &name,
                    "manifest requested permissions beyond the host ceiling",
                ));
                tracing::warn!(pack = %name, "manifest permissions trimmed to host ceiling");
            }
        }
        capped
    }
}
