//! Pack trust checks.
//!
//! [`SignatureValidator`] gates every load: nothing from a binary executes
//! until it has passed, in order,
//!
//! 1. file-name legality (no traversal, no separators, no double extensions),
//! 2. the extension allow-list,
//! 3. existence and the hard size ceiling,
//! 4. the WebAssembly header check,
//! 5. the detached Ed25519 signature check against trusted publisher keys.
//!
//! [`SignatureValidator::verify`] returns the exact bytes that passed, so the
//! caller never re-reads a file that could have been swapped in between.

use std::ffi::OsString;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, LazyLock};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use regex::Regex;
use ring::signature::{ED25519, UnparsedPublicKey};

use crate::config::SandboxConfig;
use crate::error::{Result, SandboxError, ValidationFailure};

/// WebAssembly binary magic followed by version 1.
pub const WASM_HEADER: [u8; 8] = [0x00, 0x61, 0x73, 0x6D, 0x01, 0x00, 0x00, 0x00];

/// Length of a raw Ed25519 signature.
const SIGNATURE_LEN: usize = 64;

/// Upper bound on a signature file; base64 text plus whitespace fits easily.
const MAX_SIGNATURE_FILE_LEN: u64 = 1024;

/// Length of a raw Ed25519 public key.
const PUBLIC_KEY_LEN: usize = 32;

static PACK_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,63}$").expect("pack-name pattern is a valid regex")
});

/// A binary that passed every check, with the bytes that were checked.
#[derive(Debug, Clone)]
pub struct VerifiedPack {
    /// Registry name derived from the file stem.
    pub name: String,
    /// Where the binary was read from.
    pub path: PathBuf,
    /// The verified contents.
    pub bytes: Vec<u8>,
    /// Whether a trusted signature covered the contents.
    pub signed: bool,
}

/// Verifies that a candidate pack binary is well-formed and trustworthy.
///
/// Cheap to clone; the key list is shared.
#[derive(Debug, Clone)]
pub struct SignatureValidator {
    max_size: u64,
    allowed_extensions: Arc<[String]>,
    require_signature: bool,
    trusted_keys: Arc<[[u8; PUBLIC_KEY_LEN]]>,
}

impl SignatureValidator {
    /// Build a validator from the sandbox configuration.
    ///
    /// Fails if a configured publisher key is not a base64 32-byte Ed25519
    /// key.
    pub fn new(config: &SandboxConfig) -> Result<Self> {
        let mut keys = Vec::with_capacity(config.trusted_publisher_keys.len());
        for encoded in &config.trusted_publisher_keys {
            let raw = STANDARD
                .decode(encoded.trim())
                .map_err(|e| SandboxError::Config(format!("invalid publisher key: {e}")))?;
            let key: [u8; PUBLIC_KEY_LEN] = raw.try_into().map_err(|_| {
                SandboxError::Config("publisher key must be 32 bytes".to_owned())
            })?;
            keys.push(key);
        }

        if config.require_signature && keys.is_empty() {
            tracing::warn!("signatures required but no trusted keys configured; every pack will be refused");
        }

        Ok(Self {
            max_size: config.max_pack_size,
            allowed_extensions: config
                .allowed_extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            require_signature: config.require_signature,
            trusted_keys: keys.into(),
        })
    }

    /// `true` when `path` passes every check. Never panics and never errors.
    pub fn validate(&self, path: &Path) -> bool {
        self.check(path).is_ok()
    }

    /// Run every check, returning the first failure.
    pub fn check(&self, path: &Path) -> std::result::Result<(), ValidationFailure> {
        self.verify(path).map(|_| ())
    }

    /// Run every check and return the verified bytes, or the first failure.
    pub fn verify(&self, path: &Path) -> std::result::Result<VerifiedPack, ValidationFailure> {
        let name = self.check_name(path)?;

        let meta = std::fs::symlink_metadata(path).map_err(|_| ValidationFailure::NotFound)?;
        if meta.file_type().is_symlink() {
            return Err(ValidationFailure::IllegalName);
        }
        if !meta.is_file() {
            return Err(ValidationFailure::NotFound);
        }
        self.check_size(meta.len())?;

        let bytes = self.read_bounded(path)?;
        self.check_size(bytes.len() as u64)?;

        if !bytes.starts_with(&WASM_HEADER) {
            return Err(ValidationFailure::Malformed);
        }

        let signed = self.check_signature(path, &bytes)?;

        Ok(VerifiedPack {
            name,
            path: path.to_path_buf(),
            bytes,
            signed,
        })
    }

    /// Validate the file name and extension, returning the pack name.
    pub fn check_name(&self, path: &Path) -> std::result::Result<String, ValidationFailure> {
        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(ValidationFailure::IllegalName);
        }

        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or(ValidationFailure::IllegalName)?;
        if !PACK_NAME.is_match(stem) {
            return Err(ValidationFailure::IllegalName);
        }

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        if !self.allowed_extensions.iter().any(|e| *e == extension) {
            return Err(ValidationFailure::DisallowedExtension { extension });
        }

        Ok(stem.to_owned())
    }

    fn check_size(&self, size: u64) -> std::result::Result<(), ValidationFailure> {
        if size == 0 {
            return Err(ValidationFailure::Empty);
        }
        if size > self.max_size {
            return Err(ValidationFailure::TooLarge {
                size,
                limit: self.max_size,
            });
        }
        Ok(())
    }

    /// Read at most one byte past the ceiling so a growing file is caught.
    fn read_bounded(&self, path: &Path) -> std::result::Result<Vec<u8>, ValidationFailure> {
        let file = std::fs::File::open(path).map_err(|_| ValidationFailure::NotFound)?;
        let mut bytes = Vec::new();
        file.take(self.max_size.saturating_add(1))
            .read_to_end(&mut bytes)
            .map_err(|_| ValidationFailure::NotFound)?;
        Ok(bytes)
    }

    fn check_signature(
        &self,
        path: &Path,
        bytes: &[u8],
    ) -> std::result::Result<bool, ValidationFailure> {
        let signature = read_signature(&signature_path(path))?;

        match signature {
            None if !self.trusted_keys.is_empty() => Err(ValidationFailure::SignatureMissing),
            None if self.require_signature => Err(ValidationFailure::NoTrustedKeys),
            None => {
                tracing::warn!("accepting unsigned pack; no trusted keys are configured");
                Ok(false)
            }
            Some(_) if self.trusted_keys.is_empty() => {
                if self.require_signature {
                    Err(ValidationFailure::NoTrustedKeys)
                } else {
                    tracing::warn!("pack is signed but no trusted keys are configured; ignoring signature");
                    Ok(false)
                }
            }
            Some(sig) => {
                let trusted = self
                    .trusted_keys
                    .iter()
                    .any(|key| UnparsedPublicKey::new(&ED25519, key).verify(bytes, &sig).is_ok());
                if trusted {
                    Ok(true)
                } else {
                    Err(ValidationFailure::SignatureInvalid)
                }
            }
        }
    }
}

/// Location of the detached signature for `path` (`<path>.sig`).
pub fn signature_path(path: &Path) -> PathBuf {
    let mut os: OsString = path.as_os_str().to_owned();
    os.push(".sig");
    PathBuf::from(os)
}

/// Read the detached signature, if any. Only a missing file means unsigned.
fn read_signature(
    sig_path: &Path,
) -> std::result::Result<Option<[u8; SIGNATURE_LEN]>, ValidationFailure> {
    let file = match std::fs::File::open(sig_path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(_) => return Err(ValidationFailure::SignatureInvalid),
    };
    let mut raw = Vec::new();
    file.take(MAX_SIGNATURE_FILE_LEN + 1)
        .read_to_end(&mut raw)
        .map_err(|_| ValidationFailure::SignatureInvalid)?;
    if raw.len() as u64 > MAX_SIGNATURE_FILE_LEN {
        return Err(ValidationFailure::SignatureInvalid);
    }
    decode_signature(&raw)
        .map(Some)
        .ok_or(ValidationFailure::SignatureInvalid)
}

/// Accept either 64 raw bytes or base64 text.
fn decode_signature(raw: &[u8]) -> Option<[u8; SIGNATURE_LEN]> {
    if raw.len() == SIGNATURE_LEN {
        return raw.try_into().ok();
    }
    let text = std::str::from_utf8(raw).ok()?;
    STANDARD.decode(text.trim()).ok()?.try_into().ok()
}
