//! Restore points for incremental compilation.
//!
//! A restore point snapshots the high-water marks of every segment and
//! of the compiler's own collections. Rolling back truncates everything
//! to the marks, so a failed incremental compile leaves the state
//! exactly as it was.

use beryl_bytecode::segment::Segments;

use crate::compiler::Compiler;

/// High-water marks of one snapshot.
#[derive(Debug, Clone, Copy)]
pub struct RestorePoint {
    code: usize,
    functions: usize,
    types: usize,
    data: usize,
    cstr: usize,
    classes: usize,
    funcs: usize,
    globals: usize,
    units: usize,
    errors: usize,
}

impl Compiler {
    /// Snapshot the current segment and compiler high-water marks.
    pub fn snapshot(&self, seg: &Segments) -> RestorePoint {
        RestorePoint {
            code: seg.code.len(),
            functions: seg.functions.len(),
            types: seg.types.len(),
            data: seg.data.len(),
            cstr: seg.cstr.len(),
            classes: self.classes.len(),
            funcs: self.funcs.len(),
            globals: self.globals.len(),
            units: self.units.len(),
            errors: self.errors.len(),
        }
    }

    /// Roll everything back to a restore point. Entries created after
    /// the snapshot vanish; entries before it are untouched.
    pub fn rollback(&mut self, seg: &mut Segments, point: &RestorePoint) {
        seg.code.truncate(point.code);
        seg.functions.truncate(point.functions);
        seg.types.truncate(point.types);
        seg.data.truncate(point.data);
        seg.cstr.truncate(point.cstr);

        self.classes.truncate(point.classes);
        self.funcs.truncate(point.funcs);
        self.globals.truncate(point.globals);
        self.errors.truncate(point.errors);
        self.global_inits
            .retain(|g| (g.slot as usize) < point.globals && g.unit < point.units);
        self.pending_lambdas.retain(|p| p.cfunc < point.funcs);

        // Name maps: drop every entry that points past the marks.
        let types = point.types as u32;
        self.type_map.retain(|_, &mut id| id < types);
        self.literals.forget_from(point.data as u32);

        // Units compiled after the snapshot lose their imported mark,
        // so a later import compiles them again.
        let dropped: Vec<String> = self
            .units
            .drain(point.units..)
            .map(|u| u.name)
            .collect();
        for name in dropped {
            self.imported.remove(&name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rollback_restores_marks() {
        let mut comp = Compiler::new();
        let mut seg = Segments::new();
        comp.bootstrap(&mut seg);

        let point = comp.snapshot(&seg);
        let types_before = seg.types.len();

        comp.compile(&mut seg, "t1", "function int one() { return 1; }")
            .unwrap();
        assert!(seg.functions.len() > point.functions);

        comp.rollback(&mut seg, &point);
        assert_eq!(seg.types.len(), types_before);
        assert_eq!(seg.functions.len(), point.functions);
        assert_eq!(seg.code.len(), point.code);
        assert_eq!(comp.global_count(), 0);
        assert!(comp.find_type("one").is_none());

        // The same unit compiles cleanly again after rollback.
        comp.compile(&mut seg, "t1", "function int one() { return 1; }")
            .unwrap();
    }

    #[test]
    fn test_rollback_keeps_prior_compiles() {
        let mut comp = Compiler::new();
        let mut seg = Segments::new();
        comp.bootstrap(&mut seg);
        comp.compile(&mut seg, "a", "function int keep() { return 1; }")
            .unwrap();
        let keep_funcs = seg.functions.len();

        let point = comp.snapshot(&seg);
        comp.compile(&mut seg, "b", "function int drop_me() { return 2; }")
            .unwrap();
        comp.rollback(&mut seg, &point);

        assert_eq!(seg.functions.len(), keep_funcs);
        assert!(!comp.find_functions("keep").is_empty());
        assert!(comp.find_functions("drop_me").is_empty());
    }
}
