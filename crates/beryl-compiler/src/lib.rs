//! Two-pass compiler and linker for the Beryl scripting language.
//!
//! The front end runs a precompile pass that registers every
//! declaration (resolving imports recursively) and a compile pass that
//! emits per-function bytecode through the code generator. A separate
//! link pass lays out the code segment, builds v-tables and rewrites
//! call sites once every unit is in.

pub mod body;
pub mod codegen;
pub mod compiler;
pub mod decl;
pub mod error;
pub mod expr;
pub mod linker;
pub mod model;
pub mod options;
pub mod restore;

pub use codegen::{LiteralPool, OptStats, VarMode};
pub use compiler::{CompileFailed, Compiler};
pub use error::{CompileErrorKind, CompileMessage, ErrorFormat};
pub use model::{CompileUnit, Param, Signature};
pub use options::{GcLog, LocalsMode, Options, RuntimeOption};
pub use restore::RestorePoint;

#[cfg(test)]
mod tests {
    use super::*;
    use beryl_bytecode::segment::Segments;
    use beryl_bytecode::type_ids;

    fn compile(src: &str) -> (Compiler, Segments) {
        let mut comp = Compiler::new();
        let mut seg = Segments::new();
        comp.compile(&mut seg, "test", src)
            .unwrap_or_else(|_| panic!("compile failed: {:?}", comp.messages()));
        comp.link(&mut seg)
            .unwrap_or_else(|_| panic!("link failed: {:?}", comp.messages()));
        (comp, seg)
    }

    fn compile_err(src: &str) -> Vec<CompileErrorKind> {
        let mut comp = Compiler::new();
        let mut seg = Segments::new();
        let _ = comp.compile(&mut seg, "test", src);
        let _ = comp.link(&mut seg);
        comp.messages().iter().map(|m| m.kind.clone()).collect()
    }

    #[test]
    fn test_simple_function_compiles_and_links() {
        let (comp, seg) = compile("function int main() { return 42; }");
        let main = comp.find_functions("main");
        assert_eq!(main.len(), 1);
        let info = &seg.functions[main[0] as usize];
        assert!(info.has_body());
        assert!(info.code_size > 0);
    }

    #[test]
    fn test_unknown_identifier_reports_error() {
        let errors = compile_err("function int f() { return nope; }");
        assert!(errors
            .iter()
            .any(|e| matches!(e, CompileErrorKind::UndefinedIdentifier(n) if n == "nope")));
    }

    #[test]
    fn test_parser_recovers_and_reports_multiple() {
        let errors = compile_err(
            "function int f() { return nope; }\nfunction int g() { return also_nope; }",
        );
        let undefined = errors
            .iter()
            .filter(|e| matches!(e, CompileErrorKind::UndefinedIdentifier(_)))
            .count();
        assert_eq!(undefined, 2);
    }

    #[test]
    fn test_class_with_method_and_vtable() {
        let (comp, seg) = compile(
            "class Point {\n\
             \tint x;\n\
             \tint y;\n\
             \tmethod Point() { x = 0; y = 0; }\n\
             \tmethod int getX() { return x; }\n\
             }\n",
        );
        let id = comp.find_type("Point").unwrap();
        let info = &seg.types[id as usize];
        assert_eq!(info.instance_size, 2);
        // ctor + getX occupy v-table slots, all resolved.
        assert_eq!(info.vtable.len(), 2);
        assert!(info.vtable.iter().all(|&slot| slot != u32::MAX));
    }

    #[test]
    fn test_interface_not_complete() {
        let errors = compile_err(
            "interface shape { method int area(); }\n\
             class circle implements shape { method circle() { } }\n",
        );
        assert!(errors
            .iter()
            .any(|e| matches!(e, CompileErrorKind::InterfaceNotComplete(_))));
    }

    #[test]
    fn test_strict_class_requires_bodies() {
        let errors = compile_err(
            "strict class s { method s(); method int f(); }\n",
        );
        assert!(errors
            .iter()
            .any(|e| matches!(e, CompileErrorKind::NoFunctionBody(_))));
    }

    #[test]
    fn test_function_keyword_in_class_is_error() {
        let errors = compile_err("class c { function int f() { return 1; } }");
        assert!(errors
            .iter()
            .any(|e| matches!(e, CompileErrorKind::FunctionAtClassScope)));
    }

    #[test]
    fn test_cofunction_return_is_error() {
        let errors = compile_err("cofunction int gen() { return 1; }");
        assert!(errors
            .iter()
            .any(|e| matches!(e, CompileErrorKind::ReturnInCofunction)));
    }

    #[test]
    fn test_yield_outside_cofunction_is_error() {
        let errors = compile_err("function int f() { yield 1; }");
        assert!(errors
            .iter()
            .any(|e| matches!(e, CompileErrorKind::YieldOutsideCofunction)));
    }

    #[test]
    fn test_missing_return_value() {
        let errors = compile_err("function int f() { int a = 1; }");
        assert!(errors
            .iter()
            .any(|e| matches!(e, CompileErrorKind::NoReturnValue)));
    }

    #[test]
    fn test_const_reassignment_is_error() {
        let errors = compile_err("function f() { const int a = 1; a = 2; }");
        assert!(errors
            .iter()
            .any(|e| matches!(e, CompileErrorKind::LValueIsConst)));
    }

    #[test]
    fn test_overload_const_conflict() {
        let errors = compile_err(
            "function f(int a);\nfunction f(const int a) { }\n",
        );
        assert!(errors
            .iter()
            .any(|e| matches!(e, CompileErrorKind::ConstModifierConflict(_))));
    }

    #[test]
    fn test_import_cycle_resolves() {
        let mut comp = Compiler::new();
        let mut seg = Segments::new();
        comp.register_import("a", "import b; function int fa() { return 1; }");
        comp.register_import("b", "import a; function int fb() { return 2; }");
        comp.compile(&mut seg, "main", "import a; function int m() { return fa() + fb(); }")
            .unwrap_or_else(|_| panic!("cycle failed: {:?}", comp.messages()));
        comp.link(&mut seg).unwrap();
    }

    #[test]
    fn test_unresolved_import() {
        let errors = compile_err("import missing;");
        assert!(errors
            .iter()
            .any(|e| matches!(e, CompileErrorKind::ImportNotDefined(n) if n == "missing")));
    }

    #[test]
    fn test_selftest_warns_and_continues() {
        let mut comp = Compiler::new();
        let mut seg = Segments::new();
        comp.options.warning_level = 4;
        comp.compile(&mut seg, "t", "__selftest;\nfunction int f() { return 1; }")
            .unwrap();
        assert!(comp
            .messages()
            .iter()
            .any(|m| matches!(m.kind, CompileErrorKind::SelfTestIgnored)));
        assert_eq!(comp.find_functions("f").len(), 1);
    }

    #[test]
    fn test_deeply_nested_blocks_report_parser_limit() {
        // Thousands of nested blocks must surface a compile error, not
        // exhaust the native stack.
        let mut src = String::from("function f() ");
        for _ in 0..2000 {
            src.push('{');
        }
        for _ in 0..2000 {
            src.push('}');
        }
        let errors = compile_err(&src);
        assert!(errors
            .iter()
            .any(|e| matches!(e, CompileErrorKind::ParserLimitExceeded)));
    }

    #[test]
    fn test_deeply_nested_ifs_report_parser_limit() {
        let mut src = String::from("function f() {\n");
        for _ in 0..2000 {
            src.push_str("if (1) ");
        }
        src.push(';');
        src.push_str("\n}");
        let errors = compile_err(&src);
        assert!(errors
            .iter()
            .any(|e| matches!(e, CompileErrorKind::ParserLimitExceeded)));
    }

    #[test]
    fn test_reasonable_nesting_compiles() {
        let mut src = String::from("function int f() { int a = 0; ");
        for _ in 0..50 {
            src.push_str("{ a = a + 1; ");
        }
        for _ in 0..50 {
            src.push('}');
        }
        src.push_str(" return a; }");
        let (comp, _) = compile(&src);
        assert_eq!(comp.find_functions("f").len(), 1);
    }

    #[test]
    fn test_literal_dedup_across_functions() {
        let (_, seg) = compile(
            "function int a() { return 7; }\nfunction int b() { return 7; }\n",
        );
        let sevens = seg
            .data
            .iter()
            .filter(|d| d.type_id == type_ids::INT && d.payload as i64 == 7)
            .count();
        assert_eq!(sevens, 1);
    }

    #[test]
    fn test_error_iteration_api() {
        let mut comp = Compiler::new();
        let mut seg = Segments::new();
        let _ = comp.compile(&mut seg, "t", "function int f() { return nope; }");
        let mut drained = 0;
        while comp.next_error().is_some() {
            drained += 1;
        }
        assert!(drained >= 1);
        assert!(comp.next_error().is_none());
    }

    #[test]
    fn test_emit_declaration_roundtrip() {
        let src = "class pair {\n\
                   \tint first;\n\
                   \tint second;\n\
                   \tmethod pair() { first = 0; second = 0; }\n\
                   \tmethod int sum() { return first + second; }\n\
                   }\n";
        let (comp, seg) = compile(src);
        let id = comp.find_type("pair").unwrap();
        let decl = comp.emit_declaration(&seg, id).unwrap();

        // The emitted declaration compiles back into an equivalent
        // class (bodies become forward declarations), and re-emitting
        // that class reproduces the same declaration.
        let mut comp2 = Compiler::new();
        let mut seg2 = Segments::new();
        comp2
            .compile(&mut seg2, "redecl", &decl)
            .unwrap_or_else(|_| panic!("redecl failed: {:?}\n{}", comp2.messages(), decl));
        let id2 = comp2.find_type("pair").unwrap();
        let decl2 = comp2.emit_declaration(&seg2, id2).unwrap();
        assert_eq!(decl, decl2);
    }

    #[test]
    fn test_global_variables_sized_at_link() {
        let mut comp = Compiler::new();
        let mut seg = Segments::new();
        comp.compile(&mut seg, "t", "int g1 = 5;\nint g2;\nfunction int f() { return g1; }")
            .unwrap();
        let size = comp.link(&mut seg).unwrap();
        assert_eq!(size, 2);
        assert_eq!(seg.types[type_ids::GLOBAL as usize].instance_size, 2);
    }

    #[test]
    fn test_calls_rewritten_to_jsr() {
        use beryl_bytecode::opcode::Opcode;
        let (_, seg) = compile(
            "function int helper() { return 1; }\nfunction int main() { return helper(); }\n",
        );
        let mut pc = 0;
        let mut saw_jsr = false;
        while pc < seg.code.len() {
            let op = Opcode::from_u32(seg.code[pc]).unwrap();
            assert_ne!(op, Opcode::CallS, "unresolved call site survived link");
            if op == Opcode::Jsr {
                saw_jsr = true;
            }
            pc += op.word_count();
        }
        assert!(saw_jsr);
    }
}
