//! Security audit events.
//!
//! The sandbox never keeps audit history itself.  Every security-relevant
//! transition is turned into an [`AuditEvent`] and pushed to an external
//! [`AuditSink`] the moment it happens, so the order of records matches the
//! order of events (a pre-invocation record always precedes the outcome of
//! the call it describes).
//!
//! # Redaction
//!
//! Audit output must never carry raw filesystem paths or secrets.  Failure
//! reasons go through [`redact_text`] and metadata values through
//! [`redact_value`] before an event is built; the constructors do this, so a
//! caller cannot forget.

use std::collections::BTreeMap;
use std::sync::{LazyLock, Mutex};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Longest failure reason kept in an event.
const MAX_REASON_LEN: usize = 256;

static SENSITIVE_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)password|passwd|key|token|secret|credential")
        .expect("sensitive-key pattern is a valid regex")
});

static INLINE_SECRET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(password|passwd|api[_-]?key|token|secret|credential)s?\s*[=:]\s*[^\s,;]+")
        .expect("inline-secret pattern is a valid regex")
});

static PATH_LIKE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(^|[\s'"(=`])((?:[A-Za-z]:\\|~/|\.{1,2}/|/)[^\s'"),`]*)"#)
        .expect("path pattern is a valid regex")
});

// ---------------------------------------------------------------------------
// Event model
// ---------------------------------------------------------------------------

/// Category of an audit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// Something a pack did (or tried to do) was refused or misbehaved.
    SecurityViolation,
    /// A normal lifecycle transition (load, unload, cancellation).
    SystemEvent,
    /// A pack is about to run code on the host's behalf.
    PrivilegedOperation,
}

/// How urgently an operator should look at a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// A single structured audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_type: AuditEventType,
    pub severity: Severity,
    /// What was attempted, e.g. `"load_pack"`.
    pub action: String,
    /// Pack name or `pack.method`. Never a path.
    pub resource: String,
    pub success: bool,
    /// Sanitized reason for a failure.
    pub failure_reason: Option<String>,
    /// Redacted free-form context.
    pub metadata: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    fn new(
        event_type: AuditEventType,
        severity: Severity,
        action: &str,
        resource: &str,
        success: bool,
        failure_reason: Option<&str>,
    ) -> Self {
        Self {
            event_type,
            severity,
            action: action.to_owned(),
            resource: redact_text(resource),
            success,
            failure_reason: failure_reason.map(sanitize_reason),
            metadata: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// A successful lifecycle transition.
    pub fn system(action: &str, resource: &str) -> Self {
        Self::new(
            AuditEventType::SystemEvent,
            Severity::Info,
            action,
            resource,
            true,
            None,
        )
    }

    /// A refused or misbehaving action.
    pub fn violation(action: &str, resource: &str, reason: &str) -> Self {
        Self::new(
            AuditEventType::SecurityViolation,
            Severity::Warning,
            action,
            resource,
            false,
            Some(reason),
        )
    }

    /// A record written just before pack code runs.
    pub fn privileged(action: &str, resource: &str) -> Self {
        Self::new(
            AuditEventType::PrivilegedOperation,
            Severity::Info,
            action,
            resource,
            true,
            None,
        )
    }

    /// Override the default severity.
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Mark the event as failed with a (sanitized) reason.
    pub fn failed(mut self, reason: &str) -> Self {
        self.success = false;
        self.failure_reason = Some(sanitize_reason(reason));
        self
    }

    /// Attach a metadata entry. Sensitive keys and path-like values are
    /// redacted.
    pub fn with_metadata(mut self, key: &str, value: impl ToString) -> Self {
        let value = redact_value(key, &value.to_string());
        self.metadata.insert(key.to_owned(), value);
        self
    }
}

// ---------------------------------------------------------------------------
// Redaction
// ---------------------------------------------------------------------------

/// Redact a metadata value given its key.
pub fn redact_value(key: &str, value: &str) -> String {
    if SENSITIVE_KEY.is_match(key) {
        "[REDACTED]".to_owned()
    } else {
        redact_text(value)
    }
}

/// Strip path-like substrings and inline `secret=...` pairs from free text.
pub fn redact_text(text: &str) -> String {
    let without_secrets = INLINE_SECRET.replace_all(text, "$1=[REDACTED]");
    PATH_LIKE
        .replace_all(&without_secrets, "${1}[PATH]")
        .into_owned()
}

/// Reduce an arbitrary error message to one redacted, bounded line.
pub fn sanitize_reason(reason: &str) -> String {
    let first_line = reason.lines().next().unwrap_or_default().trim();
    let mut out = redact_text(first_line);
    if out.len() > MAX_REASON_LEN {
        let mut cut = MAX_REASON_LEN;
        while !out.is_char_boundary(cut) {
            cut -= 1;
        }
        out.truncate(cut);
        out.push('…');
    }
    out
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Receiver of audit records.
///
/// Implementations must be cheap and must not block for long: records are
/// pushed synchronously from the lifecycle and execution paths.
pub trait AuditSink: Send + Sync {
    /// Accept one record.
    fn record(&self, event: AuditEvent);
}

/// Writes every record as a structured `tracing` event on the `audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        let metadata = serde_json::to_string(&event.metadata).unwrap_or_default();
        let reason = event.failure_reason.as_deref().unwrap_or("");
        match event.severity {
            Severity::Info => tracing::info!(
                target: "audit",
                event_type = ?event.event_type,
                action = %event.action,
                resource = %event.resource,
                success = event.success,
                reason,
                %metadata,
                "audit"
            ),
            Severity::Warning => tracing::warn!(
                target: "audit",
                event_type = ?event.event_type,
                action = %event.action,
                resource = %event.resource,
                success = event.success,
                reason,
                %metadata,
                "audit"
            ),
            Severity::Critical => tracing::error!(
                target: "audit",
                event_type = ?event.event_type,
                action = %event.action,
                resource = %event.resource,
                success = event.success,
                reason,
                %metadata,
                "audit"
            ),
        }
    }
}

/// Collects records in memory. Used by embedders that forward records in
/// batches, and by tests.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every record received so far, in arrival order.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Number of records of the given type.
    pub fn count(&self, event_type: AuditEventType) -> usize {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    /// Take every record, leaving the sink empty.
    pub fn drain(&self) -> Vec<AuditEvent> {
        std::mem::take(&mut *self.events.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}
