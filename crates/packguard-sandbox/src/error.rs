//! Sandbox error types.
//!
//! All sandbox subsystems surface errors through [`SandboxError`], which is the
//! single error type returned by every public API in this crate.  Validation
//! failures carry a typed [`ValidationFailure`] so callers can tell *why* a
//! pack was refused without parsing strings.

/// Why a candidate pack binary was refused before any of its code ran.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationFailure {
    /// The file name is not a legal pack name (traversal, separators, double
    /// extensions, illegal characters).
    #[error("illegal pack file name")]
    IllegalName,

    /// The extension is not on the loadable-binary allow-list.
    #[error("extension `{extension}` is not allowed")]
    DisallowedExtension { extension: String },

    /// The file does not exist or is not a regular file.
    #[error("pack binary not found")]
    NotFound,

    /// The binary is empty.
    #[error("pack binary is empty")]
    Empty,

    /// The binary exceeds the hard size ceiling.
    #[error("pack binary too large: {size} > {limit} bytes")]
    TooLarge { size: u64, limit: u64 },

    /// The binary header is not a loadable module.
    #[error("pack binary is malformed")]
    Malformed,

    /// A signature is required but no detached signature was found.
    #[error("pack signature missing")]
    SignatureMissing,

    /// The detached signature did not verify against any trusted key.
    #[error("pack signature invalid")]
    SignatureInvalid,

    /// Signatures are required but no trusted publisher key is configured.
    #[error("no trusted publisher keys configured")]
    NoTrustedKeys,
}

/// Unified error type for the pack sandbox.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// The pack failed path, size, format or signature validation.
    #[error("pack validation failed: {0}")]
    Validation(#[from] ValidationFailure),

    /// The isolation backend could not build the (already validated) code.
    #[error("pack `{name}` failed to load: {reason}")]
    LoadFailure { name: String, reason: String },

    /// A pack with the same name is already loaded.
    #[error("pack `{name}` is already loaded")]
    AlreadyLoaded { name: String },

    /// The named pack is not in the registry.
    #[error("pack `{name}` is not loaded")]
    PackNotLoaded { name: String },

    /// The pack does not expose the requested operation.
    #[error("pack `{pack}` has no operation `{method}`")]
    UnknownOperation { pack: String, method: String },

    /// The call exceeded the pack's maximum execution time.
    #[error("timeout: `{pack}.{method}` exceeded {limit_ms}ms")]
    Timeout {
        pack: String,
        method: String,
        limit_ms: u64,
    },

    /// The caller cancelled the call before it completed.
    #[error("`{pack}.{method}` was cancelled by the caller")]
    Cancelled { pack: String, method: String },

    /// The pack's own code failed during a legitimate call.
    #[error("`{pack}.{method}` failed: {reason}")]
    ExecutionFailed {
        pack: String,
        method: String,
        reason: String,
    },

    /// A privileged action outside the pack's granted permissions.
    #[error("permission denied for pack `{pack}`: {access}")]
    PermissionDenied { pack: String, access: String },

    /// A pack manifest could not be parsed.
    #[error("invalid pack manifest: {0}")]
    Manifest(String),

    /// The sandbox configuration is invalid.
    #[error("invalid sandbox configuration: {0}")]
    Config(String),

    /// An I/O error occurred (e.g. reading a pack binary from disk).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the sandbox crate.
pub type Result<T> = std::result::Result<T, SandboxError>;
