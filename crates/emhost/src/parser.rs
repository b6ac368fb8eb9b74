//! Module interface scan.
//!
//! Wraps `wasmparser` to pull out what the host needs before (or while) the
//! engine compiles the module: imports and their signatures, exports, and
//! where static data ends.

use anyhow::{Context, Result};
use emhost_runtime::{Signature, ValueType, GLOBAL_BASE};

use crate::error::TrampolineMismatch;
use wasmparser::{ExternalKind, FuncType, Parser, Payload, TypeRef, ValType};

/// An active data segment targeting memory 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataSegment {
    /// `None` when the offset is not a constant (e.g. `global.get $memoryBase`).
    pub offset: Option<u32>,
    pub len: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    Func,
    Table,
    Memory,
    Global,
}

#[derive(Debug, Clone)]
pub struct ExportInfo {
    pub name: String,
    pub kind: ExportKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ImportKind {
    /// `None` if the function type has no emscripten signature string
    /// (multi-value results or non-numeric types).
    Function(Option<Signature>),
    Global,
    Memory,
}

#[derive(Debug, Clone)]
pub struct ImportInfo {
    pub module_name: String,
    pub name: String,
    pub kind: ImportKind,
}

impl ImportInfo {
    /// Name with the mangling underscores stripped (`___cxa_throw` -> `cxa_throw`).
    pub fn canonical_name(&self) -> &str {
        canonical(&self.name)
    }
}

/// Strip the leading underscores emscripten adds to C symbols.
pub fn canonical(name: &str) -> &str {
    name.trim_start_matches('_')
}

/// What the host needs to know about a module.
#[derive(Debug, Clone, Default)]
pub struct ModuleInterface {
    pub imports: Vec<ImportInfo>,
    pub exports: Vec<ExportInfo>,
    pub data_segments: Vec<DataSegment>,
}

impl ModuleInterface {
    pub fn imports_memory(&self) -> bool {
        self.imports
            .iter()
            .any(|import| import.kind == ImportKind::Memory)
    }

    /// Every `invoke_SIG` and `jsCall_SIG` import must take the table index
    /// followed by the parameters of `SIG`, and return its result.
    pub fn check_trampolines(&self) -> Result<()> {
        for import in &self.imports {
            let ImportKind::Function(declared) = &import.kind else {
                continue;
            };
            let bare = import.canonical_name();
            let Some(suffix) = bare
                .strip_prefix("invoke_")
                .or_else(|| bare.strip_prefix("jsCall_"))
            else {
                continue;
            };
            let expected = trampoline_signature(suffix);
            if expected.is_none() || expected != *declared {
                return Err(TrampolineMismatch {
                    name: import.name.clone(),
                    expected: expected.map_or_else(|| suffix.to_string(), |sig| sig.to_string()),
                    declared: declared
                        .as_ref()
                        .map_or_else(|| "?".to_string(), Signature::to_string),
                }
                .into());
            }
        }
        Ok(())
    }

    /// First exported function among `name` and `_name`.
    pub fn function_export(&self, name: &str) -> Option<&str> {
        let prefixed = format!("_{name}");
        let found = [name, prefixed.as_str()].into_iter().find_map(|candidate| {
            self.exports
                .iter()
                .find(|e| e.kind == ExportKind::Func && e.name == candidate)
                .map(|e| e.name.as_str())
        });
        found
    }

    /// End of the highest constant-offset data segment.
    pub fn data_end(&self) -> u32 {
        self.data_segments
            .iter()
            .filter_map(|seg| seg.offset.map(|offset| offset.saturating_add(seg.len)))
            .max()
            .unwrap_or(0)
    }

    /// Bytes of static data above `GLOBAL_BASE`.
    pub fn static_bump(&self) -> u32 {
        self.data_end().saturating_sub(GLOBAL_BASE)
    }

    /// Exports that must run once before `main`, in export order.
    pub fn static_constructors(&self) -> impl Iterator<Item = &str> {
        self.exports
            .iter()
            .filter(|e| e.kind == ExportKind::Func)
            .map(|e| e.name.as_str())
            .filter(|name| {
                let bare = canonical(name);
                bare.starts_with("GLOBAL__") || bare == "post_instantiate" || bare == "runPostSets"
            })
    }
}

/// Full type of a trampoline for table signature `sig`: an `i32` index
/// prepended to its parameters.
fn trampoline_signature(sig: &str) -> Option<Signature> {
    let sig: Signature = sig.parse().ok()?;
    let params: Vec<ValueType> = std::iter::once(ValueType::I32)
        .chain(sig.params().iter().copied())
        .collect();
    Some(Signature::from_types(&params, sig.result()))
}

/// Emscripten signature string for a function type.
pub fn signature_of(ty: &FuncType) -> Option<Signature> {
    let params = ty
        .params()
        .iter()
        .map(value_type)
        .collect::<Option<Vec<_>>>()?;
    let result = match ty.results() {
        [] => None,
        [single] => Some(value_type(single)?),
        _ => return None,
    };
    Some(Signature::from_types(&params, result))
}

fn value_type(ty: &ValType) -> Option<ValueType> {
    match ty {
        ValType::I32 => Some(ValueType::I32),
        ValType::I64 => Some(ValueType::I64),
        ValType::F32 => Some(ValueType::F32),
        ValType::F64 => Some(ValueType::F64),
        _ => None,
    }
}

/// Offsets are `i32.const` in static modules; anything else is relocated
/// at load time and has no fixed address.
fn eval_offset(const_expr: wasmparser::ConstExpr) -> Result<Option<u32>> {
    let mut reader = const_expr.get_operators_reader();
    let op = reader.read().context("reading data offset operator")?;
    match op {
        wasmparser::Operator::I32Const { value } => Ok(Some(value as u32)),
        _ => Ok(None),
    }
}

/// Scan a WebAssembly binary.
pub fn scan_module(wasm_bytes: &[u8]) -> Result<ModuleInterface> {
    let mut types: Vec<FuncType> = Vec::new();
    let mut interface = ModuleInterface::default();

    for payload in Parser::new(0).parse_all(wasm_bytes) {
        let payload = payload.context("parsing wasm payload")?;

        match payload {
            Payload::TypeSection(reader) => {
                for rec_group in reader {
                    let rec_group = rec_group.context("reading rec group")?;
                    for sub_type in rec_group.types() {
                        if let wasmparser::CompositeInnerType::Func(func_ty) =
                            &sub_type.composite_type.inner
                        {
                            types.push(func_ty.clone());
                        }
                    }
                }
            }

            Payload::ImportSection(reader) => {
                for import in reader {
                    let import = import.context("reading import")?;
                    let kind = match import.ty {
                        TypeRef::Func(type_idx) => {
                            ImportKind::Function(types.get(type_idx as usize).and_then(signature_of))
                        }
                        TypeRef::Global(_) => ImportKind::Global,
                        TypeRef::Memory(_) => ImportKind::Memory,
                        // Tables and tags are left to import resolution,
                        // which reports them as unresolved.
                        _ => continue,
                    };
                    interface.imports.push(ImportInfo {
                        module_name: import.module.to_string(),
                        name: import.name.to_string(),
                        kind,
                    });
                }
            }

            Payload::ExportSection(reader) => {
                for export in reader {
                    let export = export.context("reading export")?;
                    let kind = match export.kind {
                        ExternalKind::Func => ExportKind::Func,
                        ExternalKind::Table => ExportKind::Table,
                        ExternalKind::Memory => ExportKind::Memory,
                        ExternalKind::Global => ExportKind::Global,
                        ExternalKind::Tag => continue,
                    };
                    interface.exports.push(ExportInfo {
                        name: export.name.to_string(),
                        kind,
                    });
                }
            }

            Payload::DataSection(reader) => {
                for data in reader {
                    let data = data.context("reading data segment")?;
                    if let wasmparser::DataKind::Active {
                        memory_index: 0,
                        offset_expr,
                    } = data.kind
                    {
                        interface.data_segments.push(DataSegment {
                            offset: eval_offset(offset_expr)?,
                            len: data.data.len() as u32,
                        });
                    }
                }
            }

            _ => {}
        }
    }

    Ok(interface)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_minimal_module() {
        let wasm = wat::parse_str("(module)").unwrap();
        let interface = scan_module(&wasm).unwrap();
        assert!(interface.imports.is_empty());
        assert_eq!(interface.static_bump(), 0);
    }

    #[test]
    fn imports_carry_signatures() {
        let wat = r#"
            (module
                (import "env" "invoke_iii" (func (param i32 i32 i32) (result i32)))
                (import "env" "___cxa_throw" (func (param i32 i32 i32)))
                (import "env" "_llvm_pow" (func (param f64 f64) (result f64)))
                (import "env" "STACKTOP" (global i32))
                (import "env" "memory" (memory 256 256))
            )
        "#;
        let wasm = wat::parse_str(wat).unwrap();
        let interface = scan_module(&wasm).unwrap();

        let sigs: Vec<_> = interface
            .imports
            .iter()
            .filter_map(|i| match &i.kind {
                ImportKind::Function(Some(sig)) => Some(sig.as_str().to_string()),
                _ => None,
            })
            .collect();
        assert_eq!(sigs, ["iiii", "viii", "ddd"]);
        assert_eq!(interface.imports[1].canonical_name(), "cxa_throw");
        assert!(interface.imports_memory());
        assert_eq!(interface.imports[3].kind, ImportKind::Global);
        assert_eq!(interface.imports[4].kind, ImportKind::Memory);
        interface.check_trampolines().unwrap();
    }

    #[test]
    fn trampoline_types_must_match_their_suffix() {
        let wat = r#"
            (module
                (import "env" "jsCall_vi" (func (param i32 i32)))
                (import "env" "invoke_iii" (func (param i32 i32) (result i32)))
            )
        "#;
        let wasm = wat::parse_str(wat).unwrap();
        let interface = scan_module(&wasm).unwrap();
        let err = interface.check_trampolines().unwrap_err();
        assert_eq!(
            err.downcast_ref::<TrampolineMismatch>(),
            Some(&TrampolineMismatch {
                name: "invoke_iii".into(),
                expected: "iiii".into(),
                declared: "iii".into(),
            })
        );
    }

    #[test]
    fn unparseable_trampoline_suffix_is_a_mismatch() {
        let wat = r#"
            (module
                (import "env" "invoke_vx" (func (param i32 i32)))
            )
        "#;
        let wasm = wat::parse_str(wat).unwrap();
        let err = scan_module(&wasm).unwrap().check_trampolines().unwrap_err();
        let mismatch = err.downcast_ref::<TrampolineMismatch>().unwrap();
        assert_eq!(mismatch.expected, "vx");
        assert_eq!(mismatch.declared, "vii");
    }

    #[test]
    fn static_bump_comes_from_data_segments() {
        let wat = r#"
            (module
                (memory 1)
                (data (i32.const 1024) "hello\00")
                (data (i32.const 2048) "world")
            )
        "#;
        let wasm = wat::parse_str(wat).unwrap();
        let interface = scan_module(&wasm).unwrap();
        assert_eq!(interface.data_end(), 2053);
        assert_eq!(interface.static_bump(), 1029);
    }

    #[test]
    fn relocatable_offsets_are_not_counted() {
        let wat = r#"
            (module
                (import "env" "memoryBase" (global i32))
                (import "env" "memory" (memory 1))
                (data (global.get 0) "abc")
            )
        "#;
        let wasm = wat::parse_str(wat).unwrap();
        let interface = scan_module(&wasm).unwrap();
        assert_eq!(interface.data_segments.len(), 1);
        assert_eq!(interface.data_segments[0].offset, None);
        assert_eq!(interface.data_end(), 0);
    }

    #[test]
    fn exports_and_constructors() {
        let wat = r#"
            (module
                (memory (export "memory") 1)
                (func (export "_main") (result i32) i32.const 0)
                (func (export "__GLOBAL__sub_I_main_cpp"))
                (func (export "__post_instantiate"))
                (func (export "_malloc") (param i32) (result i32) i32.const 0)
            )
        "#;
        let wasm = wat::parse_str(wat).unwrap();
        let interface = scan_module(&wasm).unwrap();
        assert!(interface
            .exports
            .iter()
            .any(|e| e.name == "memory" && e.kind == ExportKind::Memory));
        assert_eq!(interface.function_export("main"), Some("_main"));
        assert_eq!(interface.function_export("malloc"), Some("_malloc"));
        assert_eq!(interface.function_export("free"), None);
        let ctors: Vec<_> = interface.static_constructors().collect();
        assert_eq!(ctors, ["__GLOBAL__sub_I_main_cpp", "__post_instantiate"]);
    }

    #[test]
    fn multi_value_results_have_no_signature() {
        let wat = r#"
            (module
                (import "env" "pair" (func (result i32 i32)))
            )
        "#;
        let wasm = wat::parse_str(wat).unwrap();
        let interface = scan_module(&wasm).unwrap();
        assert_eq!(interface.imports[0].kind, ImportKind::Function(None));
    }
}
