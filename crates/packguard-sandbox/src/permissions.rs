//! Pack permission and resource-limit policy.
//!
//! [`PermissionSet`] is the declarative capability grant attached to every
//! loaded pack; [`ResourceLimits`] is the ceiling on what a single pack may
//! consume.  Both are pure data.  Anything that performs a privileged action
//! on behalf of a pack describes it as an [`Access`] and asks
//! [`PermissionSet::check`] first.
//!
//! Absence from an allow-list means deny.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default cap on a single execution.
pub const DEFAULT_MAX_EXECUTION_TIME: Duration = Duration::from_secs(30);

/// Capability grant for a single pack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionSet {
    /// Whether the pack may touch the host filesystem at all.
    ///
    /// Default: **false**.
    pub allow_filesystem: bool,

    /// Whether the pack may make network requests at all.
    ///
    /// Default: **false**.
    pub allow_network: bool,

    /// Whether the pack may access the application database.
    ///
    /// Default: **false**.
    pub allow_database: bool,

    /// Whether the pack may drive the UI.
    ///
    /// Default: **true**.
    pub allow_ui: bool,

    /// Directories under which filesystem access is granted.
    pub allowed_directories: BTreeSet<PathBuf>,

    /// Hosts the pack may contact. `*.example.com` matches any subdomain.
    pub allowed_hosts: BTreeSet<String>,

    /// Maximum wall-clock time of a single invocation.
    ///
    /// Default: **30 s**.
    #[serde(with = "millis")]
    pub max_execution_time: Duration,
}

impl Default for PermissionSet {
    fn default() -> Self {
        Self {
            allow_filesystem: false,
            allow_network: false,
            allow_database: false,
            allow_ui: true,
            allowed_directories: BTreeSet::new(),
            allowed_hosts: BTreeSet::new(),
            max_execution_time: DEFAULT_MAX_EXECUTION_TIME,
        }
    }
}

/// The deny-by-default baseline handed to packs that request nothing.
pub fn default_permissions() -> PermissionSet {
    PermissionSet::default()
}

impl PermissionSet {
    /// Create a permission set with default (deny-by-default) values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant or revoke filesystem access.
    pub fn with_filesystem(mut self, allow: bool) -> Self {
        self.allow_filesystem = allow;
        self
    }

    /// Grant or revoke network access.
    pub fn with_network(mut self, allow: bool) -> Self {
        self.allow_network = allow;
        self
    }

    /// Grant or revoke database access.
    pub fn with_database(mut self, allow: bool) -> Self {
        self.allow_database = allow;
        self
    }

    /// Grant or revoke UI access.
    pub fn with_ui(mut self, allow: bool) -> Self {
        self.allow_ui = allow;
        self
    }

    /// Add a directory to the filesystem allow-list.
    pub fn with_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.allowed_directories.insert(dir.into());
        self
    }

    /// Add a host to the network allow-list.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.allowed_hosts.insert(host.into().to_ascii_lowercase());
        self
    }

    /// Set the maximum execution time of a single call.
    pub fn with_max_execution_time(mut self, limit: Duration) -> Self {
        self.max_execution_time = limit;
        self
    }

    /// Narrow this grant so it never exceeds `ceiling`.
    ///
    /// Flags are ANDed, allow-list entries survive only when the ceiling
    /// covers them, and the execution time is the smaller of the two.
    pub fn capped_by(&self, ceiling: &PermissionSet) -> PermissionSet {
        let ceiling_dirs: Vec<PathBuf> = ceiling
            .allowed_directories
            .iter()
            .filter_map(|dir| normalize(dir))
            .filter(|dir| dir.is_absolute())
            .collect();
        let allowed_directories = self
            .allowed_directories
            .iter()
            .filter(|dir| {
                normalize(dir)
                    .filter(|dir| dir.is_absolute())
                    .is_some_and(|dir| ceiling_dirs.iter().any(|c| dir.starts_with(c)))
            })
            .cloned()
            .collect();

        let allowed_hosts = self
            .allowed_hosts
            .iter()
            .map(|h| h.to_ascii_lowercase())
            .filter(|host| {
                let bare = host.strip_prefix("*.").unwrap_or(host);
                ceiling
                    .allowed_hosts
                    .iter()
                    .any(|c| c.eq_ignore_ascii_case(host) || host_matches(&c.to_ascii_lowercase(), bare))
            })
            .collect();

        PermissionSet {
            allow_filesystem: self.allow_filesystem && ceiling.allow_filesystem,
            allow_network: self.allow_network && ceiling.allow_network,
            allow_database: self.allow_database && ceiling.allow_database,
            allow_ui: self.allow_ui && ceiling.allow_ui,
            allowed_directories,
            allowed_hosts,
            max_execution_time: self.max_execution_time.min(ceiling.max_execution_time),
        }
    }

    /// Decide whether `access` is covered by this grant.
    ///
    /// Returns the denial reason on failure.
    pub fn check(&self, access: &Access) -> Result<(), String> {
        match access {
            Access::Filesystem(path) => {
                if !self.allow_filesystem {
                    return Err("filesystem access not granted".into());
                }
                let Some(path) = normalize(path) else {
                    return Err("path escapes its parent".into());
                };
                if !path.is_absolute() {
                    return Err("path is not absolute".into());
                }
                let covered = self
                    .allowed_directories
                    .iter()
                    .filter_map(|dir| normalize(dir))
                    .filter(|dir| dir.is_absolute())
                    .any(|dir| path.starts_with(&dir));
                if covered {
                    Ok(())
                } else {
                    Err("path outside allowed directories".into())
                }
            }
            Access::Network(host) => {
                if !self.allow_network {
                    return Err("network access not granted".into());
                }
                let host = host.to_ascii_lowercase();
                if self.allowed_hosts.iter().any(|h| host_matches(h, &host)) {
                    Ok(())
                } else {
                    Err(format!("host `{host}` not in allowed hosts"))
                }
            }
            Access::Database => {
                if self.allow_database {
                    Ok(())
                } else {
                    Err("database access not granted".into())
                }
            }
            Access::Ui => {
                if self.allow_ui {
                    Ok(())
                } else {
                    Err("ui access not granted".into())
                }
            }
        }
    }
}

/// A privileged action a host component wants to perform for a pack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Access {
    Filesystem(PathBuf),
    Network(String),
    Database,
    Ui,
}

impl Access {
    /// Short category label, safe to put in audit records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Filesystem(_) => "filesystem",
            Self::Network(_) => "network",
            Self::Database => "database",
            Self::Ui => "ui",
        }
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Paths never reach audit output.
        match self {
            Self::Network(host) => write!(f, "network:{host}"),
            other => f.write_str(other.kind()),
        }
    }
}

/// Lexically normalize `path`, refusing anything that climbs above its root.
fn normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    Some(out)
}

fn host_matches(pattern: &str, host: &str) -> bool {
    match pattern.strip_prefix("*.") {
        Some(suffix) => host
            .strip_suffix(suffix)
            .is_some_and(|rest| rest.ends_with('.') && rest.len() > 1),
        None => pattern == host,
    }
}

/// Resource ceiling for a single pack.
///
/// See the crate docs for which fields the wasm backend enforces and which
/// are advisory metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Maximum linear memory, in bytes.
    ///
    /// Default: **50 MiB**.
    pub max_memory_bytes: usize,

    /// Maximum threads the pack may spawn.
    ///
    /// Default: **2**.
    pub max_threads: u32,

    /// Maximum CPU time of a single call.
    ///
    /// Default: **10 s**.
    #[serde(with = "millis")]
    pub max_cpu_time: Duration,

    /// Maximum simultaneously open file handles.
    ///
    /// Default: **10**.
    pub max_file_handles: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_bytes: 50 * 1024 * 1024,
            max_threads: 2,
            max_cpu_time: Duration::from_secs(10),
            max_file_handles: 10,
        }
    }
}

impl ResourceLimits {
    /// Create limits with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the memory ceiling (in bytes).
    pub fn with_max_memory_bytes(mut self, bytes: usize) -> Self {
        self.max_memory_bytes = bytes;
        self
    }

    /// Set the thread ceiling.
    pub fn with_max_threads(mut self, threads: u32) -> Self {
        self.max_threads = threads;
        self
    }

    /// Set the per-call CPU time ceiling.
    pub fn with_max_cpu_time(mut self, limit: Duration) -> Self {
        self.max_cpu_time = limit;
        self
    }

    /// Set the open file handle ceiling.
    pub fn with_max_file_handles(mut self, handles: u32) -> Self {
        self.max_file_handles = handles;
        self
    }
}

/// Serde adapter storing a [`Duration`] as integer milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
