//! The link pass.
//!
//! Runs once all compilation units are in, before execution:
//!
//! 1. Concatenate every compiled function body into the code segment
//!    and write `(code_addr, code_size)` back into the descriptors.
//! 2. Build each class's v-table, pulling inherited implementations
//!    from the hybrid base and reporting unimplemented interface
//!    methods.
//! 3. Rewrite every `calls` site into a `jsr` to the final address.
//! 4. Size the global object to hold every global variable.
//! 5. Emit link statistics through the verbose log.

use beryl_bytecode::opcode::Opcode;
use beryl_bytecode::segment::{func_flags, Segments, TypeFamily, NO_METHOD, UNRESOLVED};
use beryl_bytecode::type_ids;

use crate::compiler::{CompileFailed, Compiler};
use crate::decl::slot_count;
use crate::error::CompileErrorKind;

/// Run the link pass. Returns the size of the global object in
/// handles.
pub(crate) fn link(comp: &mut Compiler, seg: &mut Segments) -> Result<u32, CompileFailed> {
    let before = comp.hard_error_count();

    place_code(comp, seg);
    build_vtables(comp, seg);
    patch_call_sites(comp, seg);
    check_strict_bodies(comp, seg);

    // Step 4: the global object must hold every global variable; the
    // runtime resizes the live instance in place on re-link.
    let global_size = comp.globals.len() as u32;
    seg.types[type_ids::GLOBAL as usize].instance_size = global_size;

    if comp.options.verbose {
        let stats = comp.opt_stats();
        comp.log.push(format!(
            "link: {} function(s), {} type(s), {} data handle(s), {} code word(s), {} global(s)",
            seg.functions.len(),
            seg.types.len(),
            seg.data.len(),
            seg.code.len(),
            global_size
        ));
        if stats.instructions_saved > 0 {
            comp.log.push(format!(
                "optimizer: {} instruction(s) saved total ({} -> {} words)",
                stats.instructions_saved, stats.size_before, stats.size_after
            ));
        }
    }
    log::debug!(
        "link pass complete: {} code words, {} globals",
        seg.code.len(),
        global_size
    );

    if comp.hard_error_count() > before {
        Err(CompileFailed)
    } else {
        Ok(global_size)
    }
}

/// Step 1: lay out every unplaced function body.
fn place_code(comp: &mut Compiler, seg: &mut Segments) {
    for f in &mut comp.funcs {
        if f.code.is_empty() {
            continue;
        }
        let info = &mut seg.functions[f.func_idx as usize];
        if info.code_size != 0 {
            // Already placed by an earlier link.
            continue;
        }
        info.code_addr = seg.code.len() as u32;
        info.code_size = f.code.len() as u32;
        seg.code.extend_from_slice(&f.code);
    }
}

/// Step 2: fill v-tables. Own methods win, then the hybrid base's
/// implementations, and a slot declared by the interface chain with no
/// implementation anywhere is a hard error.
fn build_vtables(comp: &mut Compiler, seg: &mut Segments) {
    let mut errors: Vec<CompileErrorKind> = Vec::new();
    for ci in 0..comp.classes.len() {
        let (type_id, family, base_id, name) = {
            let c = &comp.classes[ci];
            (c.type_id, c.family, c.base_id, c.name.clone())
        };
        if family != TypeFamily::Class {
            continue;
        }
        if comp.classes[ci].modifiers & crate::model::class_mods::NATIVE_BINDING != 0 {
            // Native types dispatch by declaration ordinal.
            continue;
        }
        if !comp.classes[ci].has_body {
            continue;
        }

        let size = slot_count(comp, type_id);
        let mut vtable = vec![UNRESOLVED; size as usize];

        // Walk the chain from most-derived to base so the most derived
        // implementation wins each slot.
        let mut chain = Vec::new();
        let mut probe = type_id;
        while probe != 0 {
            chain.push(probe);
            probe = comp
                .class_of(probe)
                .map(|c| if c.hybrid_id != 0 { c.hybrid_id } else { 0 })
                .unwrap_or(0);
        }
        for &link in &chain {
            if let Some(class) = comp.class_of(link) {
                for &fi in &class.funcs {
                    let f = &comp.funcs[fi];
                    if f.member_idx == NO_METHOD || f.member_idx as usize >= vtable.len() {
                        continue;
                    }
                    let slot = f.member_idx as usize;
                    if vtable[slot] == UNRESOLVED && !f.code.is_empty() {
                        vtable[slot] = f.func_idx;
                    }
                }
            }
        }

        // Any unresolved slot declared by the interface chain means the
        // class left an inherited method unimplemented; an unresolved
        // slot of its own means a declared body never showed up.
        for (slot, &entry) in vtable.iter().enumerate() {
            if entry != UNRESOLVED {
                continue;
            }
            let iface_owner = interface_slot_owner(comp, base_id, slot as u32);
            if let Some(owner_fi) = iface_owner {
                errors.push(CompileErrorKind::InterfaceNotComplete(format!(
                    "{}::{}",
                    name, comp.funcs[owner_fi].name
                )));
            } else if let Some(own_fi) = comp.classes[ci]
                .funcs
                .iter()
                .copied()
                .find(|&fi| comp.funcs[fi].member_idx == slot as u32)
            {
                errors.push(CompileErrorKind::NoFunctionBody(format!(
                    "{}::{}",
                    name, comp.funcs[own_fi].name
                )));
            }
        }

        seg.types[type_id as usize].instance_size = comp.classes[ci].vars.len() as u32;
        seg.types[type_id as usize].vtable = vtable;
    }
    for kind in errors {
        comp.report_at(kind, "<link>", 0, 0);
    }
}

/// Find the interface declaring a given slot, walking the base chain.
fn interface_slot_owner(comp: &Compiler, base_id: u32, slot: u32) -> Option<usize> {
    let mut probe = base_id;
    while probe != 0 {
        let class = comp.class_of(probe)?;
        for &fi in &class.funcs {
            if comp.funcs[fi].member_idx == slot {
                return Some(fi);
            }
        }
        probe = class.base_id;
    }
    None
}

/// Step 3: rewrite `calls <funcIdx>` into `jsr <absAddr>`.
fn patch_call_sites(comp: &mut Compiler, seg: &mut Segments) {
    let mut errors: Vec<CompileErrorKind> = Vec::new();
    let mut pc = 0usize;
    let mut rewritten = 0u32;
    while pc < seg.code.len() {
        let Some(op) = Opcode::from_u32(seg.code[pc]) else {
            break;
        };
        if op == Opcode::CallS {
            let func_idx = seg.code[pc + 1] as usize;
            match seg.functions.get(func_idx) {
                Some(info) if info.has_body() => {
                    seg.code[pc] = Opcode::Jsr.to_u32();
                    seg.code[pc + 1] = info.code_addr;
                    rewritten += 1;
                }
                Some(info) => {
                    errors.push(CompileErrorKind::NoFunctionBody(
                        seg.cstr.get(info.name_offs).to_string(),
                    ));
                }
                None => {
                    errors.push(CompileErrorKind::NoFunctionBody(format!(
                        "<function #{func_idx}>"
                    )));
                }
            }
        }
        pc += op.word_count();
    }
    if comp.options.verbose {
        comp.log
            .push(format!("link: {rewritten} call site(s) resolved"));
    }
    for kind in errors {
        comp.report_at(kind, "<link>", 0, 0);
    }
}

/// A `strict` class promises a body for every declared function.
fn check_strict_bodies(comp: &mut Compiler, seg: &Segments) {
    let mut errors: Vec<CompileErrorKind> = Vec::new();
    for f in &comp.funcs {
        if f.flags & func_flags::STRICT != 0
            && f.flags & func_flags::NATIVE == 0
            && f.body_tok.is_none()
        {
            errors.push(CompileErrorKind::NoFunctionBody(format!(
                "{}::{}",
                seg.type_name(f.owner),
                f.name
            )));
        }
    }
    for kind in errors {
        comp.report_at(kind, "<link>", 0, 0);
    }
}
