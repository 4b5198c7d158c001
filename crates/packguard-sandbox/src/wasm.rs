//! WebAssembly isolation backend.
//!
//! [`WasmBackend`] runs packs as wasm modules under wasmtime.  Every call gets
//! a fresh [`Store`], so no state survives between calls, and the store is
//! where the pack's [`ResourceLimits`] are enforced:
//!
//! | limit              | enforcement                                         |
//! |--------------------|-----------------------------------------------------|
//! | `max_memory_bytes` | [`StoreLimits`]; `memory.grow` past it fails         |
//! | `max_cpu_time`     | per-call abort timer plus a fuel budget derived from it |
//! | `max_threads`      | wasm threads are disabled, so a pack never has more than one |
//! | `max_file_handles` | advisory: no WASI is linked, packs cannot open files |
//!
//! Runaway calls are hard-aborted through epoch interruption: a ticker thread
//! bumps the engine epoch and each store checks its cancellation token on
//! every tick.
//!
//! # Pack ABI
//!
//! A pack exports its operations as functions of type `() -> i32` (zero means
//! success); exports starting with `_` are reserved and never dispatched.  It
//! may import the following from `env`:
//!
//! - `host_log(level: i32, ptr: i32, len: i32)`
//! - `host_args_len() -> i32`
//! - `host_get_args(ptr: i32, len: i32) -> i32` copies the JSON arguments
//! - `host_set_result(ptr: i32, len: i32)` stores the JSON result
//!
//! Anything else is refused at load time.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use wasmtime::{
    Caller, Engine, Extern, ExternType, FuncType, InstancePre, Linker, Module, Store, StoreLimits,
    StoreLimitsBuilder, Trap, UpdateDeadline, ValType,
};

use crate::config::SandboxConfig;
use crate::error::{Result, SandboxError};
use crate::isolation::{Invocation, IsolatedPack, IsolationBackend, PackFault};
use crate::permissions::ResourceLimits;
use crate::signature::VerifiedPack;

/// Fuel granted per millisecond of `max_cpu_time`.
const FUEL_PER_MS: u64 = 100_000;

/// Per-call state stored in the wasmtime [`Store`].
struct HostState {
    pack: String,
    /// JSON-encoded arguments for the current call.
    input_json: Vec<u8>,
    /// Buffer where the guest writes its JSON result.
    output_json: Vec<u8>,
    limits: StoreLimits,
}

/// Stops the epoch ticker thread when the last backend handle goes away.
struct Ticker {
    stop: Arc<AtomicBool>,
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

/// The wasmtime-backed isolation backend.
///
/// Cheap to clone; clones share the engine and ticker.
#[derive(Clone)]
pub struct WasmBackend {
    engine: Engine,
    _ticker: Arc<Ticker>,
}

impl WasmBackend {
    /// Create the engine and start the interrupt ticker.
    pub fn new(config: &SandboxConfig) -> Result<Self> {
        let mut wasm_config = wasmtime::Config::new();
        wasm_config.consume_fuel(true);
        wasm_config.epoch_interruption(true);
        wasm_config.wasm_threads(false);
        wasm_config.wasm_memory64(false);

        let engine = Engine::new(&wasm_config)
            .map_err(|e| SandboxError::Config(format!("failed to create wasm engine: {e}")))?;

        let stop = Arc::new(AtomicBool::new(false));
        spawn_ticker(engine.clone(), Arc::clone(&stop), config.interrupt_tick())?;

        tracing::info!(tick_ms = config.interrupt_tick_ms, "wasm backend initialized");

        Ok(Self {
            engine,
            _ticker: Arc::new(Ticker { stop }),
        })
    }

    /// Create a backend with default configuration.
    pub fn with_defaults() -> Result<Self> {
        Self::new(&SandboxConfig::default())
    }

    /// Return a reference to the wasmtime [`Engine`].
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Compile and link `bytes`, returning the capability table and a
    /// pre-linked instance factory.
    fn prepare(
        engine: &Engine,
        name: &str,
        bytes: &[u8],
    ) -> Result<(BTreeSet<String>, InstancePre<HostState>)> {
        let load_failure = |reason: String| SandboxError::LoadFailure {
            name: name.to_owned(),
            reason,
        };

        let module = Module::new(engine, bytes).map_err(|e| load_failure(e.to_string()))?;

        let operations: BTreeSet<String> = module
            .exports()
            .filter(|export| !export.name().starts_with('_'))
            .filter_map(|export| match export.ty() {
                ExternType::Func(ty) if is_operation(&ty) => Some(export.name().to_owned()),
                _ => None,
            })
            .collect();

        if operations.is_empty() {
            return Err(load_failure("module exports no operations".into()));
        }

        let mut linker: Linker<HostState> = Linker::new(engine);
        define_host_functions(&mut linker).map_err(|e| load_failure(e.to_string()))?;

        let pre = linker
            .instantiate_pre(&module)
            .map_err(|e| load_failure(format!("unsupported imports: {e}")))?;

        Ok((operations, pre))
    }
}

#[async_trait]
impl IsolationBackend for WasmBackend {
    fn kind(&self) -> &'static str {
        "wasm"
    }

    async fn instantiate(
        &self,
        pack: &VerifiedPack,
        limits: &ResourceLimits,
    ) -> Result<Box<dyn IsolatedPack>> {
        let engine = self.engine.clone();
        let name = pack.name.clone();
        let bytes = pack.bytes.clone();

        // Compilation is CPU-bound; keep it off the async workers.
        let (operations, pre) =
            tokio::task::spawn_blocking(move || Self::prepare(&engine, &name, &bytes))
                .await
                .map_err(|e| SandboxError::LoadFailure {
                    name: pack.name.clone(),
                    reason: format!("compile task failed: {e}"),
                })??;

        tracing::info!(
            pack = %pack.name,
            operations = operations.len(),
            max_memory_bytes = limits.max_memory_bytes,
            max_file_handles = limits.max_file_handles,
            "compiled wasm pack (file handle limit is advisory; no WASI linked)"
        );

        Ok(Box::new(WasmPack {
            name: pack.name.clone(),
            engine: self.engine.clone(),
            operations,
            pre: Some(pre),
        }))
    }
}

/// A compiled pack. Instances are created per call.
struct WasmPack {
    name: String,
    engine: Engine,
    operations: BTreeSet<String>,
    pre: Option<InstancePre<HostState>>,
}

#[async_trait]
impl IsolatedPack for WasmPack {
    fn operations(&self) -> BTreeSet<String> {
        self.operations.clone()
    }

    async fn invoke(&self, call: Invocation) -> std::result::Result<Value, PackFault> {
        let pre = self
            .pre
            .clone()
            .ok_or_else(|| PackFault::Fatal("pack already unloaded".into()))?;
        if !self.operations.contains(&call.method) {
            return Err(PackFault::Failed(format!("no operation `{}`", call.method)));
        }

        // The CPU timer only stops this call; the caller's token stays intact.
        let outer = call.cancel.clone();
        let cpu = outer.child_token();
        let cpu_timer = {
            let cpu = cpu.clone();
            let limit = call.limits.max_cpu_time;
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                cpu.cancel();
            })
        };

        let engine = self.engine.clone();
        let pack = self.name.clone();
        let inner = Invocation {
            cancel: cpu,
            ..call
        };
        let outcome = tokio::task::spawn_blocking(move || run_operation(&engine, &pre, pack, inner))
            .await
            .map_err(|e| PackFault::Fatal(format!("blocking task failed: {e}")));
        cpu_timer.abort();

        match outcome? {
            Err(PackFault::Interrupted) if !outer.is_cancelled() => {
                Err(PackFault::Failed("cpu time limit exceeded".into()))
            }
            other => other,
        }
    }

    async fn unload(&mut self) -> Result<()> {
        if self.pre.take().is_some() {
            tracing::info!(pack = %self.name, "released wasm module");
        }
        Ok(())
    }
}

/// Instantiate and run one operation on the current (blocking) thread.
fn run_operation(
    engine: &Engine,
    pre: &InstancePre<HostState>,
    pack: String,
    call: Invocation,
) -> std::result::Result<Value, PackFault> {
    let input_json =
        serde_json::to_vec(&call.args).map_err(|e| PackFault::Failed(e.to_string()))?;

    let limits = StoreLimitsBuilder::new()
        .memory_size(call.limits.max_memory_bytes)
        .instances(1)
        .build();
    let mut store = Store::new(
        engine,
        HostState {
            pack,
            input_json,
            output_json: Vec::new(),
            limits,
        },
    );
    store.limiter(|state| &mut state.limits);
    store
        .set_fuel(fuel_budget(&call.limits))
        .map_err(|e| PackFault::Fatal(e.to_string()))?;

    let cancel = call.cancel.clone();
    store.epoch_deadline_callback(move |_| {
        if cancel.is_cancelled() {
            Err(Trap::Interrupt.into())
        } else {
            Ok(UpdateDeadline::Continue(1))
        }
    });
    store.set_epoch_deadline(1);

    if call.cancel.is_cancelled() {
        return Err(PackFault::Interrupted);
    }

    let instance = pre
        .instantiate(&mut store)
        .map_err(|e| trap_to_fault(&call, e))?;
    let func = instance
        .get_typed_func::<(), i32>(&mut store, &call.method)
        .map_err(|e| PackFault::Failed(e.to_string()))?;

    let code = func
        .call(&mut store, ())
        .map_err(|e| trap_to_fault(&call, e))?;
    if code != 0 {
        return Err(PackFault::Failed(format!("operation returned code {code}")));
    }

    let output = &store.data().output_json;
    if output.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice(output)
        .map_err(|e| PackFault::Failed(format!("invalid result JSON: {e}")))
}

fn trap_to_fault(call: &Invocation, err: wasmtime::Error) -> PackFault {
    if call.cancel.is_cancelled() {
        return PackFault::Interrupted;
    }
    match err.downcast_ref::<Trap>() {
        Some(Trap::OutOfFuel) => PackFault::Failed("cpu budget exhausted".into()),
        Some(Trap::Interrupt) => PackFault::Interrupted,
        Some(trap) => PackFault::Failed(format!("wasm trap: {trap}")),
        None => PackFault::Failed(err.to_string()),
    }
}

fn fuel_budget(limits: &ResourceLimits) -> u64 {
    u64::try_from(limits.max_cpu_time.as_millis())
        .unwrap_or(u64::MAX)
        .saturating_mul(FUEL_PER_MS)
}

/// An operation takes no parameters and returns one `i32` status code.
fn is_operation(ty: &FuncType) -> bool {
    let results: Vec<ValType> = ty.results().collect();
    ty.params().len() == 0 && results.len() == 1 && matches!(results[0], ValType::I32)
}

fn spawn_ticker(engine: Engine, stop: Arc<AtomicBool>, tick: Duration) -> Result<()> {
    std::thread::Builder::new()
        .name("packguard-epoch".into())
        .spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                std::thread::sleep(tick);
                engine.increment_epoch();
            }
        })?;
    Ok(())
}

/// Borrow the guest's exported memory from inside a host function.
fn guest_memory(caller: &mut Caller<'_, HostState>) -> Option<wasmtime::Memory> {
    match caller.get_export("memory") {
        Some(Extern::Memory(m)) => Some(m),
        _ => None,
    }
}

/// Define the host functions that packs can import.
fn define_host_functions(linker: &mut Linker<HostState>) -> wasmtime::Result<()> {
    // host_log: let packs emit tracing events.
    linker.func_wrap(
        "env",
        "host_log",
        |mut caller: Caller<'_, HostState>, level: i32, ptr: i32, len: i32| {
            let Some(memory) = guest_memory(&mut caller) else {
                return;
            };
            let data = memory.data(&caller);
            let start = ptr as usize;
            let end = start.saturating_add(len as usize);
            if end > data.len() {
                return;
            }
            let pack = caller.data().pack.as_str();
            if let Ok(msg) = std::str::from_utf8(&data[start..end]) {
                match level {
                    0 => tracing::error!(pack, pack_msg = msg),
                    1 => tracing::warn!(pack, pack_msg = msg),
                    2 => tracing::info!(pack, pack_msg = msg),
                    3 => tracing::debug!(pack, pack_msg = msg),
                    _ => tracing::trace!(pack, pack_msg = msg),
                }
            }
        },
    )?;

    // host_args_len: size of the JSON arguments.
    linker.func_wrap(
        "env",
        "host_args_len",
        |caller: Caller<'_, HostState>| -> i32 {
            i32::try_from(caller.data().input_json.len()).unwrap_or(i32::MAX)
        },
    )?;

    // host_get_args: copy the JSON arguments into guest memory.
    linker.func_wrap(
        "env",
        "host_get_args",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> i32 {
            let Some(memory) = guest_memory(&mut caller) else {
                return -1;
            };
            let input = caller.data().input_json.clone();
            let write_len = std::cmp::min(input.len(), len.max(0) as usize);
            let start = ptr as usize;
            let end = start.saturating_add(write_len);
            let data = memory.data_mut(&mut caller);
            if end > data.len() {
                return -1;
            }
            data[start..end].copy_from_slice(&input[..write_len]);
            write_len as i32
        },
    )?;

    // host_set_result: pack writes its JSON result.
    linker.func_wrap(
        "env",
        "host_set_result",
        |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| {
            let Some(memory) = guest_memory(&mut caller) else {
                return;
            };
            let data = memory.data(&caller);
            let start = ptr as usize;
            let end = start.saturating_add(len.max(0) as usize);
            if end > data.len() {
                return;
            }
            let bytes = data[start..end].to_vec();
            caller.data_mut().output_json = bytes;
        },
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tokio_util::sync::CancellationToken;

    /// Test pack exercising the whole host ABI.
    const SAMPLE_WAT: &str = r#"
        (module
          (import "env" "host_log" (func $log (param i32 i32 i32)))
          (import "env" "host_args_len" (func $args_len (result i32)))
          (import "env" "host_get_args" (func $get_args (param i32 i32) (result i32)))
          (import "env" "host_set_result" (func $set_result (param i32 i32)))
          (memory (export "memory") 1)
          (data (i32.const 1024) "\"pong\"hello")
          (func (export "ping") (result i32)
            (call $set_result (i32.const 1024) (i32.const 6))
            (i32.const 0))
          (func (export "echo") (result i32)
            (local $n i32)
            (local.set $n (call $get_args (i32.const 0) (call $args_len)))
            (call $set_result (i32.const 0) (local.get $n))
            (i32.const 0))
          (func (export "say_hello") (result i32)
            (call $log (i32.const 2) (i32.const 1030) (i32.const 5))
            (i32.const 0))
          (func (export "fail") (result i32)
            (i32.const 7))
          (func (export "trap") (result i32)
            unreachable)
          (func (export "grow") (result i32)
            (if (result i32)
              (i32.eq (memory.grow (i32.const 100)) (i32.const -1))
              (then (i32.const 3))
              (else (i32.const 0))))
          (func (export "spin_forever") (result i32)
            (loop $l (br $l))
            (i32.const 0))
          (func (export "_initialize"))
          (func (export "helper") (param i32) (result i32)
            (local.get 0)))
    "#;

    fn sample_wasm() -> Vec<u8> {
        wat::parse_str(SAMPLE_WAT).expect("sample pack must assemble")
    }

    fn verified(name: &str, bytes: Vec<u8>) -> VerifiedPack {
        VerifiedPack {
            name: name.to_owned(),
            path: PathBuf::from(format!("/packs/{name}.wasm")),
            bytes,
            signed: false,
        }
    }

    fn call(method: &str, args: Value, limits: ResourceLimits) -> Invocation {
        Invocation {
            method: method.to_owned(),
            args,
            limits,
            cancel: CancellationToken::new(),
        }
    }

    async fn load_sample() -> Box<dyn IsolatedPack> {
        let backend = WasmBackend::with_defaults().expect("backend must build");
        backend
            .instantiate(&verified("sample", sample_wasm()), &ResourceLimits::default())
            .await
            .expect("sample must load")
    }

    #[tokio::test]
    async fn capability_table_lists_operations_only() {
        let pack = load_sample().await;
        let ops: Vec<String> = pack.operations().into_iter().collect();
        assert_eq!(
            ops,
            vec!["echo", "fail", "grow", "ping", "say_hello", "spin_forever", "trap"]
        );
    }

    #[tokio::test]
    async fn ping_returns_result() {
        let pack = load_sample().await;
        let out = pack
            .invoke(call("ping", Value::Null, ResourceLimits::default()))
            .await
            .unwrap();
        assert_eq!(out, serde_json::json!("pong"));
    }

    #[tokio::test]
    async fn echo_round_trips_arguments() {
        let pack = load_sample().await;
        let args = serde_json::json!({"greeting": "hi", "n": [1, 2, 3]});
        let out = pack
            .invoke(call("echo", args.clone(), ResourceLimits::default()))
            .await
            .unwrap();
        assert_eq!(out, args);
    }

    #[tokio::test]
    async fn no_result_is_null() {
        let pack = load_sample().await;
        let out = pack
            .invoke(call("say_hello", Value::Null, ResourceLimits::default()))
            .await
            .unwrap();
        assert_eq!(out, Value::Null);
    }

    #[tokio::test]
    async fn non_zero_code_and_trap_are_failures() {
        let pack = load_sample().await;
        let err = pack
            .invoke(call("fail", Value::Null, ResourceLimits::default()))
            .await
            .unwrap_err();
        assert_eq!(err, PackFault::Failed("operation returned code 7".into()));

        let err = pack
            .invoke(call("trap", Value::Null, ResourceLimits::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, PackFault::Failed(msg) if msg.starts_with("wasm trap")));
    }

    #[tokio::test]
    async fn memory_growth_past_limit_fails() {
        let pack = load_sample().await;
        let limits = ResourceLimits::new().with_max_memory_bytes(1024 * 1024);
        let err = pack
            .invoke(call("grow", Value::Null, limits))
            .await
            .unwrap_err();
        assert_eq!(err, PackFault::Failed("operation returned code 3".into()));

        let out = pack
            .invoke(call("grow", Value::Null, ResourceLimits::default()))
            .await;
        assert!(out.is_ok());
    }

    #[tokio::test]
    async fn runaway_call_is_interrupted_by_token() {
        let pack = load_sample().await;
        let invocation = call("spin_forever", Value::Null, ResourceLimits::default());
        let token = invocation.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });

        let started = std::time::Instant::now();
        let err = pack.invoke(invocation).await.unwrap_err();
        assert_eq!(err, PackFault::Interrupted);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn runaway_call_hits_cpu_limit() {
        let pack = load_sample().await;
        let limits = ResourceLimits::new().with_max_cpu_time(Duration::from_millis(50));
        let err = pack
            .invoke(call("spin_forever", Value::Null, limits))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PackFault::Failed(ref msg) if msg == "cpu time limit exceeded" || msg == "cpu budget exhausted"
        ));
    }

    #[tokio::test]
    async fn unload_invalidates_pack() {
        let mut pack = load_sample().await;
        pack.unload().await.unwrap();
        let err = pack
            .invoke(call("ping", Value::Null, ResourceLimits::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, PackFault::Fatal(_)));
    }

    #[tokio::test]
    async fn corrupt_module_is_load_failure() {
        let backend = WasmBackend::with_defaults().unwrap();
        let mut bytes = crate::signature::WASM_HEADER.to_vec();
        bytes.extend_from_slice(b"garbage");
        let err = backend
            .instantiate(&verified("bad", bytes), &ResourceLimits::default())
            .await
            .err()
            .expect("corrupt module must not load");
        assert!(matches!(err, SandboxError::LoadFailure { .. }));
    }

    #[tokio::test]
    async fn module_without_operations_is_load_failure() {
        let backend = WasmBackend::with_defaults().unwrap();
        let err = backend
            .instantiate(
                &verified("empty", crate::signature::WASM_HEADER.to_vec()),
                &ResourceLimits::default(),
            )
            .await
            .err()
            .expect("empty module must not load");
        assert!(matches!(err, SandboxError::LoadFailure { .. }));
    }

    #[tokio::test]
    async fn foreign_imports_are_load_failure() {
        let wat = r#"
            (module
              (import "wasi_snapshot_preview1" "fd_write"
                (func (param i32 i32 i32 i32) (result i32)))
              (func (export "ping") (result i32) (i32.const 0)))
        "#;
        let backend = WasmBackend::with_defaults().unwrap();
        let err = backend
            .instantiate(
                &verified("wasi", wat::parse_str(wat).unwrap()),
                &ResourceLimits::default(),
            )
            .await
            .err()
            .expect("wasi imports must be refused");
        assert!(matches!(err, SandboxError::LoadFailure { .. }));
    }
}
