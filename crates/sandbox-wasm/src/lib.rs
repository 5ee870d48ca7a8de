//! WebAssembly isolation backend.
//!
//! Runs untrusted Wasm modules under wasmtime with fuel metering, a linear
//! memory cap, a wall-clock deadline, and an import allow-list. Unlike the
//! OS backends this needs no kernel facilities, so it works anywhere.

use std::time::{Duration, Instant};

use sandbox::{
    ExecutionErrorKind, ExecutionResult, OutputBuffer, Result, SandboxError, SetupStep,
    WasmSandboxConfig, exit_code,
};
use tracing::debug;
use wasmtime::{Config, Engine, Linker, Module, Store, StoreLimits, StoreLimitsBuilder, Trap};

/// Wasm magic and version prefix, checked before handing bytes to the
/// compiler so garbage input gets a clear rejection.
const WASM_MAGIC: [u8; 8] = [0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00];

/// Granularity of the wall-clock deadline.
const EPOCH_TICK: Duration = Duration::from_millis(10);

struct StoreData {
    limits: StoreLimits,
}

/// Shared wasmtime engine with fuel metering and epoch interruption on.
///
/// A background ticker advances the engine epoch every [`EPOCH_TICK`]; each
/// execution sets its own deadline in ticks, so concurrent runs do not
/// disturb each other. The ticker exits when the engine is dropped.
pub struct WasmBackend {
    engine: Engine,
}

impl WasmBackend {
    pub fn new() -> Result<Self> {
        let mut config = Config::new();
        config.consume_fuel(true);
        config.epoch_interruption(true);
        let engine = Engine::new(&config).map_err(|e| SandboxError::Setup {
            step: SetupStep::WasmEngine,
            detail: e.to_string(),
        })?;

        let weak = engine.weak();
        std::thread::Builder::new()
            .name("wasm-epoch".into())
            .spawn(move || {
                loop {
                    std::thread::sleep(EPOCH_TICK);
                    match weak.upgrade() {
                        Some(engine) => engine.increment_epoch(),
                        None => break,
                    }
                }
            })
            .map_err(|e| SandboxError::Setup {
                step: SetupStep::WasmEngine,
                detail: format!("epoch ticker: {e}"),
            })?;

        Ok(Self { engine })
    }

    pub fn name(&self) -> &'static str {
        "wasm"
    }

    /// Reject bytes that are not a Wasm module without compiling them.
    pub fn validate(&self, bytes: &[u8]) -> Result<()> {
        if bytes.len() < WASM_MAGIC.len() || !bytes.starts_with(&WASM_MAGIC) {
            return Err(SandboxError::Compilation(
                "not a wasm module (bad magic or version)".into(),
            ));
        }
        Module::validate(&self.engine, bytes)
            .map_err(|e| SandboxError::Compilation(e.to_string()))
    }

    /// Compile and run a module to completion under the config's limits.
    ///
    /// The entry point is the exported `_start` function, falling back to
    /// `main`. Compilation failures and disallowed imports are hard errors;
    /// once the module runs, traps and exhaustion fold into the result.
    pub async fn execute(
        &self,
        module_bytes: Vec<u8>,
        config: &WasmSandboxConfig,
    ) -> Result<ExecutionResult> {
        self.validate(&module_bytes)?;
        let engine = self.engine.clone();
        let config = config.clone();
        tokio::task::spawn_blocking(move || run_module(&engine, &module_bytes, &config))
            .await
            .map_err(|e| SandboxError::Runtime(format!("execution task: {e}")))?
    }
}

fn run_module(
    engine: &Engine,
    bytes: &[u8],
    config: &WasmSandboxConfig,
) -> Result<ExecutionResult> {
    let module =
        Module::new(engine, bytes).map_err(|e| SandboxError::Compilation(e.to_string()))?;

    for import in module.imports() {
        if !config.import_allowed(import.module(), import.name()) {
            return Err(SandboxError::ImportNotAllowed(format!(
                "{}.{}",
                import.module(),
                import.name()
            )));
        }
    }

    let memory_limit = usize::try_from(config.memory_limit()).unwrap_or(usize::MAX);
    let mut store = Store::new(
        engine,
        StoreData {
            limits: StoreLimitsBuilder::new().memory_size(memory_limit).build(),
        },
    );
    store.limiter(|data| &mut data.limits);
    store
        .set_fuel(config.fuel())
        .map_err(|e| SandboxError::Setup {
            step: SetupStep::WasmEngine,
            detail: format!("set fuel: {e}"),
        })?;

    // Deadline in ticks of the engine-wide epoch clock.
    let ticks = config
        .timeout()
        .as_millis()
        .div_ceil(EPOCH_TICK.as_millis())
        .max(1);
    store.set_epoch_deadline(u64::try_from(ticks).unwrap_or(u64::MAX));

    let mut linker = Linker::new(engine);
    // Whitelisted imports the host does not implement trap if called.
    linker
        .define_unknown_imports_as_traps(&module)
        .map_err(|e| SandboxError::Setup {
            step: SetupStep::WasmModule,
            detail: e.to_string(),
        })?;

    let started = Instant::now();
    let instance = linker
        .instantiate(&mut store, &module)
        .map_err(|e| SandboxError::Setup {
            step: SetupStep::WasmInstantiate,
            detail: e.to_string(),
        })?;

    let Some(entry) = instance
        .get_func(&mut store, "_start")
        .or_else(|| instance.get_func(&mut store, "main"))
    else {
        return Err(SandboxError::Runtime(
            "no entry point: expected exported `_start` or `main`".into(),
        ));
    };

    let call_result = entry.call(&mut store, &[], &mut []);
    let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    let fuel_consumed = store
        .get_fuel()
        .ok()
        .map(|remaining| config.fuel().saturating_sub(remaining));
    let memory_used = instance
        .get_memory(&mut store, "memory")
        .map(|m| m.data_size(&store) as u64);

    let mut result = match call_result {
        Ok(()) => ExecutionResult::completed(0, OutputBuffer::new(), OutputBuffer::new()),
        Err(e) => match e.downcast_ref::<Trap>() {
            Some(Trap::OutOfFuel) => {
                debug!(fuel = config.fuel(), "fuel exhausted");
                let mut r = ExecutionResult::failed(
                    exit_code::TIMED_OUT,
                    ExecutionErrorKind::Timeout,
                    format!("fuel budget of {} instructions exhausted", config.fuel()),
                );
                r.timed_out = true;
                r
            }
            Some(Trap::Interrupt) => {
                debug!(timeout = ?config.timeout(), "deadline reached");
                ExecutionResult::failed(
                    exit_code::TIMED_OUT,
                    ExecutionErrorKind::Timeout,
                    format!("wall clock limit {:?} exceeded", config.timeout()),
                )
            }
            _ => ExecutionResult::failed(1, ExecutionErrorKind::Runtime, e.to_string()),
        },
    };
    result.execution_time_ms = elapsed_ms;
    result.fuel_consumed = fuel_consumed;
    result.memory_used_bytes = memory_used;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbox::WasmSandboxConfigBuilder;

    fn backend() -> WasmBackend {
        WasmBackend::new().unwrap()
    }

    fn config() -> WasmSandboxConfig {
        WasmSandboxConfigBuilder::new().build().unwrap()
    }

    #[tokio::test]
    async fn runs_a_trivial_module() {
        let wasm = wat::parse_str(r#"(module (func (export "_start")))"#).unwrap();
        let result = backend().execute(wasm, &config()).await.unwrap();
        assert!(result.success);
        assert_eq!(result.exit_code, 0);
        assert!(result.fuel_consumed.is_some());
    }

    #[tokio::test]
    async fn falls_back_to_main_entry() {
        let wasm = wat::parse_str(r#"(module (func (export "main")))"#).unwrap();
        let result = backend().execute(wasm, &config()).await.unwrap();
        assert!(result.success);
    }

    #[tokio::test]
    async fn missing_entry_point_is_an_error() {
        let wasm = wat::parse_str(r#"(module (func (export "other")))"#).unwrap();
        let err = backend().execute(wasm, &config()).await.unwrap_err();
        assert!(matches!(err, SandboxError::Runtime(_)));
    }

    #[tokio::test]
    async fn garbage_bytes_are_rejected_before_compilation() {
        let err = backend()
            .execute(vec![0x00, 0x01, 0x02, 0x03], &config())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Compilation(_)));
    }

    #[tokio::test]
    async fn disallowed_import_is_rejected_with_qualified_name() {
        let wasm = wat::parse_str(
            r#"(module (import "env" "evil" (func)) (func (export "_start")))"#,
        )
        .unwrap();
        let err = backend().execute(wasm, &config()).await.unwrap_err();
        match err {
            SandboxError::ImportNotAllowed(name) => assert_eq!(name, "env.evil"),
            other => panic!("expected ImportNotAllowed, got {other}"),
        }
    }

    #[tokio::test]
    async fn whitelisted_import_instantiates() {
        let wasm = wat::parse_str(
            r#"(module (import "env" "log" (func)) (func (export "_start")))"#,
        )
        .unwrap();
        let cfg = WasmSandboxConfigBuilder::new()
            .allow_import("env.log")
            .build()
            .unwrap();
        let result = backend().execute(wasm, &cfg).await.unwrap();
        assert!(result.success);
    }

    #[tokio::test]
    async fn infinite_loop_exhausts_fuel() {
        let wasm =
            wat::parse_str(r#"(module (func (export "_start") (loop $l (br $l))))"#).unwrap();
        let cfg = WasmSandboxConfigBuilder::new()
            .fuel(10_000)
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap();
        let result = backend().execute(wasm, &cfg).await.unwrap();
        assert!(!result.success);
        assert!(result.timed_out);
        assert_eq!(result.exit_code, exit_code::TIMED_OUT);
    }

    #[tokio::test]
    async fn runtime_trap_folds_into_the_result() {
        let wasm = wat::parse_str(
            r#"(module (func (export "_start") (drop (i32.div_s (i32.const 1) (i32.const 0)))))"#,
        )
        .unwrap();
        let result = backend().execute(wasm, &config()).await.unwrap();
        assert!(!result.success);
        assert!(!result.timed_out);
        let error = result.error.unwrap();
        assert_eq!(error.kind, ExecutionErrorKind::Runtime);
    }

    #[tokio::test]
    async fn oversized_initial_memory_fails_instantiation() {
        // 100 pages (6.4 MiB) against a 64 KiB cap.
        let wasm =
            wat::parse_str(r#"(module (memory 100) (func (export "_start")))"#).unwrap();
        let cfg = WasmSandboxConfigBuilder::new()
            .memory_limit(64 * 1024)
            .build()
            .unwrap();
        let err = backend().execute(wasm, &cfg).await.unwrap_err();
        assert!(matches!(err, SandboxError::Setup { .. }));
    }

    #[tokio::test]
    async fn fuel_consumption_is_reported() {
        let wasm = wat::parse_str(
            r#"(module (func (export "_start") (local $i i32)
                 (loop $l
                   (local.set $i (i32.add (local.get $i) (i32.const 1)))
                   (br_if $l (i32.lt_s (local.get $i) (i32.const 100))))))"#,
        )
        .unwrap();
        let result = backend().execute(wasm, &config()).await.unwrap();
        assert!(result.success);
        assert!(result.fuel_consumed.unwrap() > 100);
    }
}
