//! In-process test doubles for the isolation seam.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Result, SandboxError};
use crate::isolation::{Invocation, IsolatedPack, IsolationBackend, PackFault};
use crate::permissions::ResourceLimits;
use crate::signature::{VerifiedPack, WASM_HEADER};

/// Backend whose packs expose a fixed set of scripted operations:
///
/// - `ping` returns `"pong"`
/// - `echo` returns its arguments
/// - `nap` sleeps 100ms, honoring the token
/// - `hang` never completes and ignores the token
/// - `fail` reports an error
/// - `crash` reports a fatal fault
#[derive(Debug, Default, Clone)]
pub(crate) struct FakeBackend {
    pub unloads: Arc<AtomicUsize>,
    pub instantiations: Arc<AtomicUsize>,
    pub refuse: bool,
}

impl FakeBackend {
    pub fn refusing() -> Self {
        Self {
            refuse: true,
            ..Self::default()
        }
    }

    pub fn unload_count(&self) -> usize {
        self.unloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IsolationBackend for FakeBackend {
    fn kind(&self) -> &'static str {
        "fake"
    }

    async fn instantiate(
        &self,
        pack: &VerifiedPack,
        _limits: &ResourceLimits,
    ) -> Result<Box<dyn IsolatedPack>> {
        if self.refuse {
            return Err(SandboxError::LoadFailure {
                name: pack.name.clone(),
                reason: "missing entry point".into(),
            });
        }
        self.instantiations.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakePack {
            unloads: Arc::clone(&self.unloads),
        }))
    }
}

struct FakePack {
    unloads: Arc<AtomicUsize>,
}

#[async_trait]
impl IsolatedPack for FakePack {
    fn operations(&self) -> BTreeSet<String> {
        ["ping", "echo", "nap", "hang", "fail", "crash"]
            .into_iter()
            .map(str::to_owned)
            .collect()
    }

    async fn invoke(&self, call: Invocation) -> std::result::Result<Value, PackFault> {
        match call.method.as_str() {
            "ping" => Ok(Value::from("pong")),
            "echo" => Ok(call.args),
            "nap" => tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(100)) => Ok(Value::Null),
                _ = call.cancel.cancelled() => Err(PackFault::Interrupted),
            },
            "hang" => std::future::pending().await,
            "fail" => Err(PackFault::Failed("disk full at /var/secret/db".into())),
            "crash" => Err(PackFault::Fatal("boundary poisoned".into())),
            other => Err(PackFault::Failed(format!("no operation `{other}`"))),
        }
    }

    async fn unload(&mut self) -> Result<()> {
        self.unloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Write a header-only wasm file named `<name>.wasm` into `dir`.
pub(crate) fn write_pack(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(format!("{name}.wasm"));
    std::fs::write(&path, WASM_HEADER).expect("writing a test pack must succeed");
    path
}
