//! The compile driver.
//!
//! One [`Compiler`] instance belongs to one VM state and accumulates
//! classes, functions and diagnostics across compiles. Each compile runs
//! the two passes of the front end over one unit: pass 1 registers every
//! declaration (recursively compiling imports), pass 2 compiles function
//! bodies through the code generator. Linking is a separate step once
//! all units are in.

use beryl_bytecode::segment::{func_flags, type_flags, Segments, TypeFamily, NO_METHOD};
use beryl_bytecode::type_ids;
use beryl_parser::Lexer;
use beryl_parser::TokenStream;
use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;

use crate::codegen::{LiteralPool, OptStats};
use crate::error::{CompileErrorKind, CompileMessage};
use crate::expr::LambdaBody;
use crate::model::{CClass, CFunc, CVarDecl, CompileUnit, Param, Signature};
use crate::options::{Options, RuntimeOption};
use crate::{body, decl, linker};

/// Marker error: the compile produced diagnostics. Drain them through
/// [`Compiler::next_error`].
#[derive(Debug, Clone, Copy, Error)]
#[error("compilation failed; drain diagnostics with next_error()")]
pub struct CompileFailed;

/// A deferred global-variable initializer.
pub(crate) struct GlobalInit {
    /// Global slot to initialize.
    pub slot: u32,
    /// Compilation unit holding the initializer expression.
    pub unit: usize,
    /// Token index of the initializer expression.
    pub tok: usize,
}

/// A captured variable binding of a pending lambda.
pub(crate) struct CaptureBinding {
    /// Name inside the lambda body.
    pub name: String,
    /// Type of the captured variable.
    pub type_id: u32,
    /// Captured from a weak variable.
    pub is_weak: bool,
}

/// A lambda whose body compiles after its enclosing function.
pub(crate) struct PendingLambda {
    /// Index into the compiler's function list.
    pub cfunc: usize,
    /// Captured environment, in push order.
    pub captures: Vec<CaptureBinding>,
    /// The body to compile.
    pub body: LambdaBody,
    /// Unit the lambda appeared in.
    pub unit: usize,
}

/// The Beryl compiler.
pub struct Compiler {
    /// Active option set.
    pub options: Options,
    pub(crate) classes: Vec<CClass>,
    pub(crate) funcs: Vec<CFunc>,
    pub(crate) type_map: FxHashMap<String, u32>,
    pub(crate) globals: Vec<CVarDecl>,
    pub(crate) global_inits: Vec<GlobalInit>,
    pub(crate) pending_lambdas: Vec<PendingLambda>,
    pub(crate) literals: LiteralPool,
    pub(crate) units: Vec<CompileUnit>,
    pub(crate) errors: Vec<CompileMessage>,
    error_cursor: usize,
    imports: FxHashMap<String, String>,
    pub(crate) imported: FxHashSet<String>,
    pub(crate) log: Vec<String>,
    /// True while compiling a native type declaration.
    pub(crate) native_mode: bool,
    pub(crate) opt_stats: OptStats,
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

impl Compiler {
    /// A fresh compiler with default options.
    pub fn new() -> Self {
        Self {
            options: Options::default(),
            classes: Vec::new(),
            funcs: Vec::new(),
            type_map: FxHashMap::default(),
            globals: Vec::new(),
            global_inits: Vec::new(),
            pending_lambdas: Vec::new(),
            literals: LiteralPool::new(),
            units: Vec::new(),
            errors: Vec::new(),
            error_cursor: 0,
            imports: FxHashMap::default(),
            imported: FxHashSet::default(),
            log: Vec::new(),
            native_mode: false,
            opt_stats: OptStats::default(),
        }
    }

    /// Register the built-in types into empty segments. Must run once
    /// before the first compile; the id order is frozen in
    /// `beryl_bytecode::type_ids`.
    pub fn bootstrap(&mut self, seg: &mut Segments) {
        if !seg.types.is_empty() {
            return;
        }
        let builtins: [(&str, TypeFamily); 7] = [
            ("undefined", TypeFamily::Undefined),
            ("int", TypeFamily::Integral),
            ("float", TypeFamily::Integral),
            ("string", TypeFamily::Integral),
            ("var", TypeFamily::Undefined),
            ("global", TypeFamily::Class),
            ("task", TypeFamily::Thread),
        ];
        for (name, family) in builtins {
            let id = seg.add_type(family, name);
            self.type_map.insert(name.to_string(), id);
            self.classes.push(CClass::new(name, id, family));
        }

        // The built-in `exception` interface: script classes thrown as
        // exceptions implement it.
        let exc = seg.add_type(TypeFamily::Interface, "exception");
        debug_assert_eq!(exc, type_ids::EXCEPTION);
        self.type_map.insert("exception".into(), exc);
        let mut class = CClass::new("exception", exc, TypeFamily::Interface);
        class.has_body = true;
        for (slot, (name, ret)) in [("getError", type_ids::INT), ("getMessage", type_ids::STRING)]
            .into_iter()
            .enumerate()
        {
            let name_offs = seg.cstr.add(name);
            let func_idx = seg.add_function(beryl_bytecode::segment::FuncInfo {
                type_id: exc,
                flags: func_flags::METHOD,
                member_idx: slot as u32,
                name_offs,
                ..Default::default()
            });
            class.funcs.push(self.funcs.len());
            self.funcs.push(CFunc {
                name: name.to_string(),
                func_idx,
                owner: exc,
                flags: func_flags::METHOD,
                sig: Signature {
                    params: Vec::new(),
                    ret,
                    ret_weak: false,
                },
                member_idx: slot as u32,
                unit: usize::MAX,
                body_tok: None,
                code: Vec::new(),
                capture_count: 0,
            });
        }
        seg.types[exc as usize].vtable = vec![NO_METHOD; 2];
        self.classes.push(class);
    }

    /// Apply an option string. Runtime options are returned for the VM
    /// to apply while it is still uninitialized.
    pub fn set_options(&mut self, input: &str) -> Result<Vec<RuntimeOption>, CompileFailed> {
        match self.options.parse(input) {
            Ok(runtime) => Ok(runtime),
            Err(kind) => {
                self.report_at(kind, "<options>", 0, 0);
                Err(CompileFailed)
            }
        }
    }

    /// Register an import name with its source text. Explicit
    /// registrations take precedence over file-system resolution.
    pub fn register_import(&mut self, name: &str, source: &str) {
        self.imports.insert(name.to_string(), source.to_string());
    }

    /// Compile one source unit, running both passes. Errors accumulate
    /// on the compiler; drain them with [`Self::next_error`].
    pub fn compile(
        &mut self,
        seg: &mut Segments,
        name: &str,
        source: &str,
    ) -> Result<(), CompileFailed> {
        self.bootstrap(seg);
        let before = self.hard_error_count();
        self.imported.insert(name.to_string());
        self.compile_unit(seg, name, source);
        if self.hard_error_count() > before {
            Err(CompileFailed)
        } else {
            Ok(())
        }
    }

    /// Compile a native type declaration string. The produced classes
    /// are flagged native-bound and their functions carry no bodies.
    pub fn compile_native_decl(
        &mut self,
        seg: &mut Segments,
        type_name: &str,
        declaration: &str,
        package_list: &str,
    ) -> Result<u32, CompileFailed> {
        self.bootstrap(seg);
        let before = self.hard_error_count();
        // The package list is a comma-separated import list the
        // declaration depends on.
        for dep in package_list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            self.resolve_import(seg, dep, 0, 0);
        }
        self.native_mode = true;
        self.compile_unit(seg, type_name, declaration);
        self.native_mode = false;
        if self.hard_error_count() > before {
            self.report_at(
                CompileErrorKind::NativeDeclarationFailed(type_name.to_string()),
                type_name,
                0,
                0,
            );
            return Err(CompileFailed);
        }
        match self.type_map.get(type_name) {
            Some(&id) => Ok(id),
            None => {
                self.report_at(
                    CompileErrorKind::NativeDeclarationFailed(type_name.to_string()),
                    type_name,
                    0,
                    0,
                );
                Err(CompileFailed)
            }
        }
    }

    fn compile_unit(&mut self, seg: &mut Segments, name: &str, source: &str) {
        if self.options.verbose {
            self.log.push(format!("compiling '{name}'"));
        }
        let tokens = match Lexer::new(source)
            .default_float(self.options.default_float)
            .tokenize()
        {
            Ok(tokens) => tokens,
            Err(errors) => {
                for e in errors {
                    self.report_at(
                        CompileErrorKind::Lexer(e.kind.to_string()),
                        name,
                        e.line,
                        e.column,
                    );
                }
                return;
            }
        };

        let unit_idx = self.units.len();
        self.units
            .push(CompileUnit::new(name, TokenStream::new(tokens)));

        decl::precompile(self, seg, unit_idx);
        body::compile_unit(self, seg, unit_idx);
        body::compile_pending_lambdas(self, seg);
    }

    /// Resolve and compile an import: explicitly registered sources
    /// first, then the file system when `file-import` allows it. A
    /// repeated import is a no-op, which also breaks import cycles.
    pub(crate) fn resolve_import(&mut self, seg: &mut Segments, name: &str, line: u32, col: u32) {
        if self.imported.contains(name) {
            return;
        }
        self.imported.insert(name.to_string());
        if let Some(source) = self.imports.get(name).cloned() {
            self.compile_unit(seg, name, &source);
            return;
        }
        if self.options.file_import {
            let path = format!("{name}.{}", self.options.file_ext);
            if let Ok(source) = std::fs::read_to_string(&path) {
                self.compile_unit(seg, name, &source);
                return;
            }
        }
        let unit = self
            .units
            .last()
            .map(|u| u.name.clone())
            .unwrap_or_default();
        self.report_at(
            CompileErrorKind::ImportNotDefined(name.to_string()),
            &unit,
            line,
            col,
        );
    }

    /// Link everything compiled so far. See the `linker` module for the
    /// pass order. Returns the size of the global object.
    pub fn link(&mut self, seg: &mut Segments) -> Result<u32, CompileFailed> {
        linker::link(self, seg)
    }

    // ===== Diagnostics =====

    /// Record a diagnostic, applying the warning-level gate.
    pub(crate) fn report_at(&mut self, kind: CompileErrorKind, file: &str, line: u32, col: u32) {
        if kind.is_warning() && kind.warning_level() > self.options.warning_level {
            return;
        }
        self.errors.push(CompileMessage {
            kind,
            file: file.to_string(),
            line,
            column: col,
        });
    }

    /// Number of hard (non-warning) diagnostics so far.
    pub fn hard_error_count(&self) -> usize {
        self.errors.iter().filter(|e| !e.kind.is_warning()).count()
    }

    /// Total diagnostic count, warnings included.
    pub fn message_count(&self) -> usize {
        self.errors.len()
    }

    /// Error iteration API: returns the next rendered diagnostic, or
    /// `None` once exhausted.
    pub fn next_error(&mut self) -> Option<String> {
        let msg = self.errors.get(self.error_cursor)?;
        self.error_cursor += 1;
        Some(msg.render(self.options.error_format))
    }

    /// All diagnostics, for hosts that want structured access.
    pub fn messages(&self) -> &[CompileMessage] {
        &self.errors
    }

    /// Drain the verbose progress log.
    pub fn take_log(&mut self) -> Vec<String> {
        std::mem::take(&mut self.log)
    }

    /// Accumulated optimization statistics.
    pub fn opt_stats(&self) -> OptStats {
        self.opt_stats
    }

    // ===== Model access =====

    /// Type id for a name, aliases included.
    pub fn find_type(&self, name: &str) -> Option<u32> {
        self.type_map.get(name).copied()
    }

    /// The class model entry for a type id.
    pub(crate) fn class_of(&self, type_id: u32) -> Option<&CClass> {
        self.classes.iter().find(|c| c.type_id == type_id)
    }

    pub(crate) fn class_of_mut(&mut self, type_id: u32) -> Option<&mut CClass> {
        self.classes.iter_mut().find(|c| c.type_id == type_id)
    }

    /// All functions named `name` owned by `owner`.
    pub(crate) fn funcs_named(&self, owner: u32, name: &str) -> Vec<usize> {
        self.funcs
            .iter()
            .enumerate()
            .filter(|(_, f)| f.owner == owner && f.name == name)
            .map(|(i, _)| i)
            .collect()
    }

    /// Number of declared global variables.
    pub fn global_count(&self) -> usize {
        self.globals.len()
    }

    /// Function-segment indices of every global function named `name`.
    pub fn find_functions(&self, name: &str) -> Vec<u32> {
        self.funcs
            .iter()
            .filter(|f| f.owner == type_ids::GLOBAL && f.name == name)
            .map(|f| f.func_idx)
            .collect()
    }

    /// Function-segment index of a method of `type_id` (or its bases)
    /// named `name`. Static (non-method) functions do not match.
    pub fn find_method(&self, type_id: u32, name: &str) -> Option<u32> {
        let mut probe = type_id;
        while probe != 0 {
            let class = self.class_of(probe)?;
            for &fi in &class.funcs {
                let f = &self.funcs[fi];
                if f.name == name && f.flags & func_flags::METHOD != 0 {
                    return Some(f.func_idx);
                }
            }
            probe = if class.base_id != 0 {
                class.base_id
            } else {
                class.hybrid_id
            };
        }
        None
    }

    /// Signature of a function by its function-segment index.
    pub fn signature_of(&self, func_idx: u32) -> Option<&Signature> {
        self.funcs
            .iter()
            .find(|f| f.func_idx == func_idx)
            .map(|f| &f.sig)
    }

    /// Find a global variable slot by name.
    pub(crate) fn find_global(&self, name: &str) -> Option<&CVarDecl> {
        self.globals.iter().find(|g| g.name == name)
    }

    // ===== Declaration emission =====

    /// Render the declaration of a type as Beryl source. Feeding the
    /// result back to `compile` re-creates an equivalent type.
    pub fn emit_declaration(&self, seg: &Segments, type_id: u32) -> Option<String> {
        let class = self.class_of(type_id)?;
        let mut out = String::new();
        match class.family {
            TypeFamily::Interface => out.push_str(&format!("interface {}", class.name)),
            TypeFamily::Delegate => {
                let sig = class.delegate_sig.as_ref()?;
                out.push_str(&format!(
                    "delegate {}{}({});",
                    ret_prefix(seg, sig),
                    class.name,
                    render_params(seg, &sig.params)
                ));
                return Some(out);
            }
            _ => {
                if class.modifiers & crate::model::class_mods::STRICT != 0 {
                    out.push_str("strict ");
                }
                out.push_str(&format!("class {}", class.name));
            }
        }
        if !class.tag.is_empty() {
            out.push_str(&format!(" [\"{}\"]", class.tag));
        }
        if class.base_id != 0 {
            out.push_str(&format!(
                " implements {}",
                seg.type_name(class.base_id)
            ));
        }
        if class.hybrid_id != 0 {
            out.push_str(&format!(" hybrid {}", seg.type_name(class.hybrid_id)));
        }
        out.push_str(" {\n");
        for var in &class.vars {
            out.push('\t');
            if var.is_private {
                out.push_str("private ");
            }
            if var.is_const {
                out.push_str("const ");
            }
            if var.is_weak {
                out.push_str("weak ");
            }
            out.push_str(&format!("{} {};\n", seg.type_name(var.type_id), var.name));
        }
        for &fi in &class.funcs {
            let f = &self.funcs[fi];
            out.push('\t');
            if f.flags & func_flags::EXPLICIT != 0 {
                out.push_str("explicit ");
            }
            if f.flags & func_flags::VIRTUAL != 0 {
                out.push_str("virtual ");
            }
            let keyword = if f.flags & func_flags::ACCESSOR != 0 {
                "accessor"
            } else if f.flags & func_flags::COFUNC != 0 {
                "cofunction"
            } else if f.flags & func_flags::METHOD != 0 {
                "method"
            } else {
                "function"
            };
            if f.flags & func_flags::CTOR != 0 {
                out.push_str(&format!(
                    "{keyword} {}({});\n",
                    f.name,
                    render_params(seg, &f.sig.params)
                ));
            } else if f.flags & func_flags::CONVERTOR != 0 {
                out.push_str(&format!("{keyword} {}();\n", seg.type_name(f.sig.ret)));
            } else {
                out.push_str(&format!(
                    "{keyword} {}{}({});\n",
                    ret_prefix(seg, &f.sig),
                    f.name,
                    render_params(seg, &f.sig.params)
                ));
            }
        }
        out.push_str("}\n");
        Some(out)
    }

    /// Whether a function's owner marks it as native.
    pub(crate) fn is_native_type(&self, seg: &Segments, type_id: u32) -> bool {
        seg.types
            .get(type_id as usize)
            .map(|t| t.flags & type_flags::NATIVE != 0 || {
                self.class_of(type_id)
                    .map(|c| c.modifiers & crate::model::class_mods::NATIVE_BINDING != 0)
                    .unwrap_or(false)
            })
            .unwrap_or(false)
    }
}

fn ret_prefix(seg: &Segments, sig: &Signature) -> String {
    if sig.returns_value() {
        format!("{} ", seg.type_name(sig.ret))
    } else {
        String::new()
    }
}

fn render_params(seg: &Segments, params: &[Param]) -> String {
    params
        .iter()
        .map(|p| {
            let mut s = String::new();
            if p.is_const {
                s.push_str("const ");
            }
            if p.is_weak {
                s.push_str("weak ");
            }
            let tname = if p.type_id == type_ids::VAR {
                "var"
            } else {
                seg.type_name(p.type_id)
            };
            s.push_str(tname);
            if !p.name.is_empty() {
                s.push(' ');
                s.push_str(&p.name);
            }
            s
        })
        .collect::<Vec<_>>()
        .join(", ")
}
