//! Module Loader — validates submitted bytes and prepares them for execution
//!
//! Checks run cheapest first:
//!
//! 1. size ceiling (`ResourceExhausted`)
//! 2. wasm magic and version header
//! 3. engine validation and compilation
//! 4. imports: functions from the `contract` namespace only
//! 5. initial memory and table sizes within the sandbox ceilings, so every
//!    deployed module can at least be instantiated
//! 6. linking against the host functions (names and signatures)
//! 7. a `memory` export
//!
//! Everything after step 1 fails with `InvalidModule`.

use std::collections::BTreeSet;

use wasmtime::{ExternType, InstancePre, Module};

use crate::config::WASM_PAGE_BYTES;
use crate::sandbox::{HostContext, Sandbox, HOST_NAMESPACE, MAX_TABLE_ELEMENTS};
use crate::{ContractId, Error, Result};

const WASM_MAGIC: &[u8; 4] = b"\0asm";
const WASM_VERSION: &[u8; 4] = &[1, 0, 0, 0];

/// A validated module bound to its identity. Immutable once built.
pub struct LoadedModule {
    id: ContractId,
    module: Module,
    instance_pre: InstancePre<HostContext>,
    entry_points: BTreeSet<String>,
    imports: Vec<String>,
    size: usize,
}

impl std::fmt::Debug for LoadedModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModule")
            .field("id", &self.id)
            .field("entry_points", &self.entry_points)
            .field("size", &self.size)
            .finish()
    }
}

/// Description of a module, as reported by `inspect`
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ModuleInfo {
    pub id: ContractId,
    pub size: usize,
    pub entry_points: Vec<String>,
    pub imports: Vec<String>,
}

impl LoadedModule {
    pub fn id(&self) -> &ContractId {
        &self.id
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn entry_points(&self) -> impl Iterator<Item = &str> {
        self.entry_points.iter().map(String::as_str)
    }

    pub fn has_entry_point(&self, name: &str) -> bool {
        self.entry_points.contains(name)
    }

    pub(crate) fn instance_pre(&self) -> &InstancePre<HostContext> {
        &self.instance_pre
    }

    pub fn info(&self) -> ModuleInfo {
        ModuleInfo {
            id: self.id,
            size: self.size,
            entry_points: self.entry_points.iter().cloned().collect(),
            imports: self.imports.clone(),
        }
    }
}

/// Validate `bytes` and link them against the sandbox's host functions
pub fn load(sandbox: &Sandbox, bytes: &[u8]) -> Result<LoadedModule> {
    let limit = sandbox.config().max_module_bytes;
    if bytes.len() > limit {
        return Err(Error::ResourceExhausted(format!(
            "module is {} bytes, limit is {} bytes",
            bytes.len(),
            limit
        )));
    }
    check_header(bytes)?;

    let module = Module::from_binary(sandbox.engine(), bytes)
        .map_err(|e| Error::InvalidModule(format!("{:#}", e)))?;

    let mut imports = Vec::new();
    for import in module.imports() {
        if import.module() != HOST_NAMESPACE {
            return Err(Error::InvalidModule(format!(
                "import '{}.{}' is outside the '{}' namespace",
                import.module(),
                import.name(),
                HOST_NAMESPACE
            )));
        }
        match import.ty() {
            ExternType::Func(_) => imports.push(import.name().to_string()),
            other => {
                return Err(Error::InvalidModule(format!(
                    "import '{}' is a {}, only functions may be imported",
                    import.name(),
                    extern_kind(&other)
                )))
            }
        }
    }

    check_initial_sizes(sandbox, &module)?;

    let instance_pre = sandbox
        .linker()
        .instantiate_pre(&module)
        .map_err(|e| Error::InvalidModule(format!("{:#}", e)))?;

    if !matches!(module.get_export("memory"), Some(ExternType::Memory(_))) {
        return Err(Error::InvalidModule("module must export 'memory'".into()));
    }

    let entry_points = module
        .exports()
        .filter_map(|export| match export.ty() {
            ExternType::Func(func)
                if func.params().len() == 0 && func.results().len() == 0 =>
            {
                Some(export.name().to_string())
            }
            _ => None,
        })
        .collect();

    Ok(LoadedModule {
        id: ContractId::for_module(bytes),
        module,
        instance_pre,
        entry_points,
        imports,
        size: bytes.len(),
    })
}

fn check_header(bytes: &[u8]) -> Result<()> {
    if bytes.is_empty() {
        return Err(Error::InvalidModule("module is empty".into()));
    }
    if bytes.len() < 8 {
        return Err(Error::InvalidModule("module is truncated".into()));
    }
    if &bytes[..4] != WASM_MAGIC {
        return Err(Error::InvalidModule("missing wasm magic number".into()));
    }
    if &bytes[4..8] != WASM_VERSION {
        return Err(Error::InvalidModule("unsupported wasm version".into()));
    }
    Ok(())
}

/// Reject modules whose declared minimums already exceed what a call may use
fn check_initial_sizes(sandbox: &Sandbox, module: &Module) -> Result<()> {
    let required = module.resources_required();
    let ceiling = sandbox.config().max_memory_bytes as u64;
    if let Some(pages) = required.max_initial_memory_size {
        let bytes = u64::from(pages).saturating_mul(WASM_PAGE_BYTES as u64);
        if bytes > ceiling {
            return Err(Error::InvalidModule(format!(
                "initial memory of {} bytes exceeds ceiling of {} bytes",
                bytes, ceiling
            )));
        }
    }
    if let Some(elements) = required.max_initial_table_size {
        let elements = u64::from(elements);
        if elements > u64::from(MAX_TABLE_ELEMENTS) {
            return Err(Error::InvalidModule(format!(
                "initial table of {} elements exceeds limit of {}",
                elements, MAX_TABLE_ELEMENTS
            )));
        }
    }
    Ok(())
}

fn extern_kind(ty: &ExternType) -> &'static str {
    match ty {
        ExternType::Func(_) => "function",
        ExternType::Global(_) => "global",
        ExternType::Table(_) => "table",
        ExternType::Memory(_) => "memory",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::COUNTER_WAT;
    use crate::RuntimeConfig;
    use std::sync::Arc;

    fn compile(wat: &str) -> Vec<u8> {
        wat::parse_str(wat).unwrap()
    }

    fn sandbox() -> Sandbox {
        Sandbox::new(Arc::new(RuntimeConfig::default())).unwrap()
    }

    fn invalid(wat: &str) -> Error {
        load(&sandbox(), &compile(wat)).unwrap_err()
    }

    #[test]
    fn test_load_counter_entry_points() {
        let bytes = compile(COUNTER_WAT);
        let module = load(&sandbox(), &bytes).unwrap();
        assert_eq!(module.id(), &ContractId::for_module(&bytes));
        assert!(module.has_entry_point("increment"));
        assert!(module.has_entry_point("get"));
        // (i32, i32) -> i32 is exported but not an entry point
        assert!(!module.has_entry_point("add"));
        assert!(!module.has_entry_point("memory"));
        assert!(module.info().imports.contains(&"state_get".to_string()));
    }

    #[test]
    fn test_size_checked_before_anything_else() {
        let config = RuntimeConfig {
            max_module_bytes: 16,
            ..RuntimeConfig::default()
        };
        let sandbox = Sandbox::new(Arc::new(config)).unwrap();
        let err = load(&sandbox, &[0xFF; 17]).unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));
    }

    #[test]
    fn test_bad_headers() {
        let sandbox = sandbox();
        for bytes in [
            &[][..],
            &b"\0asm"[..],
            &b"\x7fELF\x02\x01\x01\x00"[..],
            &b"\0asm\x02\x00\x00\x00"[..],
        ] {
            assert!(
                matches!(load(&sandbox, bytes), Err(Error::InvalidModule(_))),
                "{:?} should be rejected",
                bytes
            );
        }
    }

    #[test]
    fn test_engine_rejects_garbage_body() {
        let mut bytes = b"\0asm\x01\x00\x00\x00".to_vec();
        bytes.extend_from_slice(&[0x01, 0xFF, 0xFF]);
        assert!(matches!(
            load(&sandbox(), &bytes),
            Err(Error::InvalidModule(_))
        ));
    }

    #[test]
    fn test_foreign_namespace_rejected() {
        let err = invalid(
            r#"(module
                (import "env" "state_get" (func (param i32 i32) (result i64)))
                (memory (export "memory") 1))"#,
        );
        assert!(err.to_string().contains("namespace"));
    }

    #[test]
    fn test_imported_memory_rejected() {
        let err = invalid(r#"(module (import "contract" "memory" (memory 1)))"#);
        assert!(err.to_string().contains("memory"));
    }

    #[test]
    fn test_unknown_host_function_rejected() {
        invalid(
            r#"(module
                (import "contract" "launch_missiles" (func))
                (memory (export "memory") 1))"#,
        );
    }

    #[test]
    fn test_host_signature_mismatch_rejected() {
        invalid(
            r#"(module
                (import "contract" "input_len" (func (result i64)))
                (memory (export "memory") 1))"#,
        );
    }

    #[test]
    fn test_initial_memory_above_ceiling_rejected() {
        let config = RuntimeConfig {
            max_memory_bytes: 65536,
            ..RuntimeConfig::default()
        };
        let sandbox = Sandbox::new(Arc::new(config)).unwrap();
        let err = load(&sandbox, &compile(r#"(module (memory (export "memory") 4))"#)).unwrap_err();
        assert!(matches!(err, Error::InvalidModule(_)));
        assert!(err.to_string().contains("initial memory"), "{}", err);

        // Exactly at the ceiling is fine
        load(&sandbox, &compile(r#"(module (memory (export "memory") 1))"#)).unwrap();
    }

    #[test]
    fn test_unexported_memory_is_checked_too() {
        let config = RuntimeConfig {
            max_memory_bytes: 2 * 65536,
            ..RuntimeConfig::default()
        };
        let sandbox = Sandbox::new(Arc::new(config)).unwrap();
        // A single memory may be defined; oversized and not exported
        let err = load(&sandbox, &compile(r#"(module (memory 3) (func (export "run")))"#)).unwrap_err();
        assert!(err.to_string().contains("initial memory"), "{}", err);
    }

    #[test]
    fn test_initial_table_above_limit_rejected() {
        let err = invalid(
            r#"(module
                (memory (export "memory") 1)
                (table 10001 funcref))"#,
        );
        assert!(err.to_string().contains("initial table"), "{}", err);
        load(
            &sandbox(),
            &compile(r#"(module (memory (export "memory") 1) (table 10000 funcref))"#),
        )
        .unwrap();
    }

    #[test]
    fn test_missing_memory_export_rejected() {
        let err = invalid(r#"(module (func (export "run")))"#);
        assert!(err.to_string().contains("memory"));
    }
}
