//! Per-function code emission.
//!
//! [`FuncGen`] owns the instruction buffer of one function body: the
//! register file allocation, the stack frame model, branch patching and
//! the peephole pass that runs at finalize. Literal interning into the
//! data segment goes through [`LiteralPool`] so identical constants share
//! one data handle program-wide.
//!
//! Frame layout, top of the data stack first: temporaries pushed during
//! expression evaluation, then the function's stack locals, then closure
//! captures, then arguments. Callers save their live registers around
//! calls and pop the arguments; callees pop their locals and captures.

use beryl_bytecode::opcode::Opcode;
use beryl_bytecode::segment::{DataHandle, Segments};
use beryl_bytecode::{NUM_REGISTERS, REG_FIRST_FREE};
use rustc_hash::FxHashMap;

use crate::error::CompileErrorKind;

/// Local variable placement mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarMode {
    /// Prefer a register, fall back to the stack.
    Auto,
    /// Require a register; fail if none is free.
    Register,
    /// Never use a register.
    Stack,
}

/// Where a local variable lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarLoc {
    /// In a general register.
    Reg(u32),
    /// In a stack-local slot.
    Stack(u32),
}

/// Deduplicated literal constants in the data segment.
///
/// Every int, float and string literal with the same value shares one
/// data handle; `moveh` sites reference the shared index directly.
#[derive(Debug, Default)]
pub struct LiteralPool {
    ints: FxHashMap<i64, u32>,
    floats: FxHashMap<u64, u32>,
    strings: FxHashMap<String, u32>,
    null: Option<u32>,
}

impl LiteralPool {
    /// Empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern the null constant; the VM materializes it as the null
    /// handle.
    pub fn intern_null(&mut self, seg: &mut Segments) -> u32 {
        if let Some(idx) = self.null {
            return idx;
        }
        let idx = seg.data.len() as u32;
        seg.data.push(DataHandle {
            type_id: beryl_bytecode::type_ids::UNDEFINED,
            payload: 0,
        });
        self.null = Some(idx);
        idx
    }

    /// Intern an integer literal.
    pub fn intern_int(&mut self, seg: &mut Segments, value: i64) -> u32 {
        *self.ints.entry(value).or_insert_with(|| {
            let idx = seg.data.len() as u32;
            seg.data.push(DataHandle::int(value));
            idx
        })
    }

    /// Intern a float literal. Keyed by bit pattern so 0.0 and -0.0 stay
    /// distinct.
    pub fn intern_float(&mut self, seg: &mut Segments, value: f64) -> u32 {
        *self.floats.entry(value.to_bits()).or_insert_with(|| {
            let idx = seg.data.len() as u32;
            seg.data.push(DataHandle::float(value));
            idx
        })
    }

    /// Intern a string literal, sharing the C-string pool entry.
    pub fn intern_string(&mut self, seg: &mut Segments, value: &str) -> u32 {
        if let Some(&idx) = self.strings.get(value) {
            return idx;
        }
        let offs = seg.cstr.add(value);
        let idx = seg.data.len() as u32;
        seg.data.push(DataHandle::string(offs));
        self.strings.insert(value.to_string(), idx);
        idx
    }

    /// Drop every interned index at or past a data-segment mark. Used by
    /// restore-point rollback.
    pub fn forget_from(&mut self, data_mark: u32) {
        self.ints.retain(|_, &mut idx| idx < data_mark);
        self.floats.retain(|_, &mut idx| idx < data_mark);
        self.strings.retain(|_, &mut idx| idx < data_mark);
        if matches!(self.null, Some(idx) if idx >= data_mark) {
            self.null = None;
        }
    }
}

/// Optimization statistics for one finalize run.
#[derive(Debug, Clone, Copy, Default)]
pub struct OptStats {
    /// Instructions removed or fused away.
    pub instructions_saved: u32,
    /// Body size in words before optimization.
    pub size_before: u32,
    /// Body size in words after optimization.
    pub size_after: u32,
}

/// Function body state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuncState {
    /// Declaration seen, no statement yet.
    Open,
    /// Inside the body.
    Body,
    /// Scope-closing brace consumed.
    Closed,
}

/// A pending branch waiting for its target.
#[derive(Debug, Clone, Copy)]
pub struct BranchPatch {
    instr_start: usize,
    operand_pos: usize,
}

/// Code emitter for one function body.
pub struct FuncGen {
    body: Vec<u32>,
    reg_used: [bool; NUM_REGISTERS],
    usage: [u32; NUM_REGISTERS],
    reg_high: u32,
    stack_locals: u32,
    /// Temporaries currently pushed on the data stack.
    pub push_depth: u32,
    ret_patches: Vec<BranchPatch>,
    arg_count: u32,
    capture_count: u32,
    /// Body state machine.
    pub state: FuncState,
}

impl FuncGen {
    /// Emitter for a function with the given argument and capture
    /// counts. Captures must be known up front; the frame layout depends
    /// on them.
    pub fn new(arg_count: u32, capture_count: u32) -> Self {
        let mut reg_used = [false; NUM_REGISTERS];
        // r0 result, r1 this, r2 globals are never allocatable.
        reg_used[0] = true;
        reg_used[1] = true;
        reg_used[2] = true;
        Self {
            body: Vec::new(),
            reg_used,
            usage: [0; NUM_REGISTERS],
            reg_high: 0,
            stack_locals: 0,
            push_depth: 0,
            ret_patches: Vec::new(),
            arg_count,
            capture_count,
            state: FuncState::Open,
        }
    }

    // ===== Registers =====

    /// Allocate a scratch register.
    pub fn alloc_temp(&mut self) -> Result<u32, CompileErrorKind> {
        for r in REG_FIRST_FREE as usize..NUM_REGISTERS {
            if !self.reg_used[r] {
                self.reg_used[r] = true;
                self.usage[r] += 1;
                self.reg_high = self.reg_high.max(r as u32);
                return Ok(r as u32);
            }
        }
        Err(CompileErrorKind::NoFreeRegister("temporary".into()))
    }

    /// Release a scratch register. Releasing a reserved register is a
    /// no-op.
    pub fn free_temp(&mut self, reg: u32) {
        if reg >= REG_FIRST_FREE {
            self.reg_used[reg as usize] = false;
        }
    }

    /// Allocate storage for a local variable under the given mode.
    pub fn alloc_local(&mut self, name: &str, mode: VarMode) -> Result<VarLoc, CompileErrorKind> {
        match mode {
            VarMode::Stack => Ok(self.alloc_stack_slot()),
            VarMode::Register | VarMode::Auto => match self.alloc_temp() {
                Ok(reg) => Ok(VarLoc::Reg(reg)),
                Err(_) if mode == VarMode::Auto => Ok(self.alloc_stack_slot()),
                Err(_) => Err(CompileErrorKind::NoFreeRegister(name.to_string())),
            },
        }
    }

    fn alloc_stack_slot(&mut self) -> VarLoc {
        let slot = self.stack_locals;
        self.stack_locals += 1;
        VarLoc::Stack(slot)
    }

    /// Register usage histogram, indexed by register.
    pub fn usage(&self) -> &[u32; NUM_REGISTERS] {
        &self.usage
    }

    /// Number of stack-resident locals allocated so far.
    pub fn stack_local_count(&self) -> u32 {
        self.stack_locals
    }

    // ===== Frame displacements =====

    /// Stack displacement of a local slot at the current push depth.
    pub fn local_disp(&self, slot: u32) -> u32 {
        self.push_depth + slot
    }

    /// Stack displacement of a closure capture slot.
    pub fn capture_disp(&self, capture: u32) -> u32 {
        self.push_depth + self.stack_locals + (self.capture_count - 1 - capture)
    }

    /// Stack displacement of an argument slot.
    pub fn arg_disp(&self, arg: u32) -> u32 {
        self.push_depth + self.stack_locals + self.capture_count + (self.arg_count - 1 - arg)
    }

    // ===== Emission =====

    /// Current body offset in words.
    pub fn here(&self) -> usize {
        self.body.len()
    }

    /// Emit one instruction.
    pub fn emit(&mut self, op: Opcode, operands: &[u32]) {
        debug_assert_eq!(operands.len(), op.info().operands.len());
        self.body.push(op.to_u32());
        self.body.extend_from_slice(operands);
    }

    /// Emit a branch with an unresolved target, returning the patch.
    pub fn emit_branch(&mut self, op: Opcode, reg: Option<u32>) -> BranchPatch {
        let instr_start = self.body.len();
        self.body.push(op.to_u32());
        if let Some(r) = reg {
            self.body.push(r);
        }
        let operand_pos = self.body.len();
        self.body.push(0);
        BranchPatch {
            instr_start,
            operand_pos,
        }
    }

    /// Resolve a pending branch to a body offset.
    pub fn patch_branch(&mut self, patch: BranchPatch, target: usize) {
        let offset = target as i64 - patch.instr_start as i64;
        self.body[patch.operand_pos] = offset as i32 as u32;
    }

    /// Emit a backward jump to a known label.
    pub fn emit_jump_back(&mut self, target: usize) {
        let instr_start = self.body.len() as i64;
        let offset = target as i64 - instr_start;
        self.emit(Opcode::Jmp, &[offset as i32 as u32]);
    }

    /// Emit the result move and jump-to-epilogue of a `return`.
    pub fn emit_return_jump(&mut self) {
        let patch = self.emit_branch(Opcode::Jmp, None);
        self.ret_patches.push(patch);
    }

    /// Emit the caller-save prologue of a call site: pushes every
    /// register the function has touched. Returns the saved count for
    /// [`Self::emit_call_restore`].
    pub fn emit_call_save(&mut self) -> u32 {
        if self.reg_high >= REG_FIRST_FREE {
            let count = self.reg_high - REG_FIRST_FREE + 1;
            self.emit(Opcode::PushR, &[REG_FIRST_FREE, count]);
            self.push_depth += count;
            count
        } else {
            0
        }
    }

    /// Pop call arguments and restore caller-saved registers.
    pub fn emit_call_restore(&mut self, saved: u32, arg_words: u32) {
        if arg_words > 0 {
            self.emit(Opcode::PopZ, &[arg_words]);
            self.push_depth -= arg_words;
        }
        if saved > 0 {
            self.emit(Opcode::PopR, &[REG_FIRST_FREE, saved]);
            self.push_depth -= saved;
        }
    }

    /// Note a value pushed onto the data stack.
    pub fn note_push(&mut self) {
        self.push_depth += 1;
    }

    /// Note a value popped off the data stack.
    pub fn note_pop(&mut self) {
        self.push_depth -= 1;
    }

    // ===== Finalize =====

    /// Close the body: build prologue and epilogue, resolve return
    /// jumps, run the peephole pass for the given optimization level and
    /// return the finished code.
    pub fn finalize(mut self, opt_level: u32) -> (Vec<u32>, OptStats) {
        // Returns jump to the epilogue appended after the body.
        let epilogue = self.body.len();
        for patch in std::mem::take(&mut self.ret_patches) {
            self.patch_branch(patch, epilogue);
        }
        let frame = self.stack_locals + self.capture_count;
        if frame > 0 {
            self.emit(Opcode::PopZ, &[frame]);
        }
        self.emit(Opcode::Ret, &[]);

        let mut stats = OptStats {
            size_before: self.body.len() as u32,
            ..OptStats::default()
        };
        let body = if opt_level >= 1 {
            let optimized = peephole(&self.body, &mut stats);
            stats.size_after = optimized.len() as u32;
            optimized
        } else {
            stats.size_after = self.body.len() as u32;
            std::mem::take(&mut self.body)
        };

        // Prologue goes in front; intra-body jumps are relative and
        // unaffected.
        let mut code = Vec::with_capacity(body.len() + 2);
        if self.stack_locals > 0 {
            code.push(Opcode::PushZ.to_u32());
            code.push(self.stack_locals);
        }
        code.extend_from_slice(&body);
        stats.size_before += code.len() as u32 - stats.size_after;
        stats.size_after = code.len() as u32;
        (code, stats)
    }
}

/// One decoded instruction during the peephole pass.
struct DecodedInstr {
    op: Opcode,
    operands: Vec<u32>,
    orig_addr: usize,
}

/// Peephole optimization: drop nops and self-moves, fuse push/pop pairs
/// into register moves, then relocate every relative branch.
fn peephole(body: &[u32], stats: &mut OptStats) -> Vec<u32> {
    // Decode.
    let mut instrs = Vec::new();
    let mut pc = 0usize;
    while pc < body.len() {
        let op = match Opcode::from_u32(body[pc]) {
            Some(op) => op,
            // Unknown word: abandon the pass, the verifier will complain.
            None => return body.to_vec(),
        };
        let count = op.info().operands.len();
        instrs.push(DecodedInstr {
            op,
            operands: body[pc + 1..pc + 1 + count].to_vec(),
            orig_addr: pc,
        });
        pc += 1 + count;
    }

    // Collect branch targets; a fused instruction must not be one.
    let mut targets: Vec<usize> = Vec::new();
    for ins in &instrs {
        if let Some(pos) = rel_operand_pos(ins.op) {
            let target = (ins.orig_addr as i64 + ins.operands[pos] as i32 as i64) as usize;
            targets.push(target);
        }
    }

    // Transform.
    let mut out: Vec<DecodedInstr> = Vec::with_capacity(instrs.len());
    let mut iter = instrs.into_iter().peekable();
    while let Some(ins) = iter.next() {
        match ins.op {
            Opcode::Nop if !targets.contains(&ins.orig_addr) => {
                stats.instructions_saved += 1;
            }
            Opcode::MoveR | Opcode::CopyR
                if ins.operands[0] == ins.operands[1]
                    && !targets.contains(&ins.orig_addr) =>
            {
                stats.instructions_saved += 1;
            }
            Opcode::Push => {
                let fused = matches!(iter.peek(), Some(next) if next.op == Opcode::Pop
                    && !targets.contains(&next.orig_addr)
                    && !targets.contains(&ins.orig_addr));
                if fused {
                    let next = iter.next().unwrap();
                    stats.instructions_saved += 1;
                    if ins.operands[0] != next.operands[0] {
                        out.push(DecodedInstr {
                            op: Opcode::MoveR,
                            operands: vec![ins.operands[0], next.operands[0]],
                            orig_addr: ins.orig_addr,
                        });
                    }
                } else {
                    out.push(ins);
                }
            }
            _ => out.push(ins),
        }
    }

    // Relocate: map original addresses to new ones.
    let mut new_addr = FxHashMap::default();
    let mut addr = 0usize;
    for ins in &out {
        new_addr.insert(ins.orig_addr, addr);
        addr += 1 + ins.operands.len();
    }
    let resolve = |orig: usize| -> usize {
        // A removed target resolves to the next surviving instruction.
        let mut probe = orig;
        loop {
            if let Some(&a) = new_addr.get(&probe) {
                return a;
            }
            probe += 1;
            if probe > body.len() {
                return addr;
            }
        }
    };

    let mut result = Vec::with_capacity(addr);
    for ins in &out {
        let at = result.len();
        result.push(ins.op.to_u32());
        let rel_pos = rel_operand_pos(ins.op);
        for (i, &word) in ins.operands.iter().enumerate() {
            if Some(i) == rel_pos {
                let orig_target = (ins.orig_addr as i64 + word as i32 as i64) as usize;
                let new_target = resolve(orig_target);
                result.push((new_target as i64 - at as i64) as i32 as u32);
            } else {
                result.push(word);
            }
        }
    }
    result
}

/// Operand index of the relative address, for branching opcodes.
fn rel_operand_pos(op: Opcode) -> Option<usize> {
    match op {
        Opcode::Jmp => Some(0),
        Opcode::BraT | Opcode::BraF => Some(1),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_dedup() {
        let mut seg = Segments::new();
        let mut pool = LiteralPool::new();
        let a = pool.intern_int(&mut seg, 42);
        let b = pool.intern_int(&mut seg, 42);
        let c = pool.intern_int(&mut seg, 43);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(seg.data.len(), 2);

        let s1 = pool.intern_string(&mut seg, "x");
        let s2 = pool.intern_string(&mut seg, "x");
        assert_eq!(s1, s2);
        assert_eq!(seg.data.len(), 3);
    }

    #[test]
    fn test_literal_forget_from() {
        let mut seg = Segments::new();
        let mut pool = LiteralPool::new();
        pool.intern_int(&mut seg, 1);
        let mark = seg.data.len() as u32;
        pool.intern_int(&mut seg, 2);
        seg.data.truncate(mark as usize);
        pool.forget_from(mark);
        // 2 must be re-created, 1 must be reused.
        assert_eq!(pool.intern_int(&mut seg, 1), 0);
        assert_eq!(pool.intern_int(&mut seg, 2), mark);
    }

    #[test]
    fn test_register_allocation() {
        let mut gen = FuncGen::new(0, 0);
        let a = gen.alloc_temp().unwrap();
        let b = gen.alloc_temp().unwrap();
        assert_eq!(a, REG_FIRST_FREE);
        assert_eq!(b, REG_FIRST_FREE + 1);
        gen.free_temp(a);
        let c = gen.alloc_temp().unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn test_register_exhaustion() {
        let mut gen = FuncGen::new(0, 0);
        for _ in 0..(NUM_REGISTERS as u32 - REG_FIRST_FREE) {
            gen.alloc_temp().unwrap();
        }
        assert!(matches!(
            gen.alloc_temp(),
            Err(CompileErrorKind::NoFreeRegister(_))
        ));
    }

    #[test]
    fn test_local_modes() {
        let mut gen = FuncGen::new(0, 0);
        assert!(matches!(
            gen.alloc_local("a", VarMode::Stack),
            Ok(VarLoc::Stack(0))
        ));
        assert!(matches!(
            gen.alloc_local("b", VarMode::Register),
            Ok(VarLoc::Reg(_))
        ));
        assert!(matches!(
            gen.alloc_local("c", VarMode::Auto),
            Ok(VarLoc::Reg(_))
        ));
        assert_eq!(gen.stack_local_count(), 1);
    }

    #[test]
    fn test_frame_displacements() {
        let mut gen = FuncGen::new(2, 1);
        gen.alloc_local("a", VarMode::Stack).unwrap();
        gen.alloc_local("b", VarMode::Stack).unwrap();
        // locals 0..1, capture below them, args deepest
        assert_eq!(gen.local_disp(0), 0);
        assert_eq!(gen.local_disp(1), 1);
        assert_eq!(gen.capture_disp(0), 2);
        assert_eq!(gen.arg_disp(0), 4); // arg 0 pushed first, deepest
        assert_eq!(gen.arg_disp(1), 3);
        gen.note_push();
        assert_eq!(gen.local_disp(0), 1);
        gen.note_pop();
    }

    #[test]
    fn test_branch_patching() {
        let mut gen = FuncGen::new(0, 0);
        let patch = gen.emit_branch(Opcode::BraF, Some(3));
        gen.emit(Opcode::Nop, &[]);
        let target = gen.here();
        gen.patch_branch(patch, target);
        let (code, _) = gen.finalize(0);
        // braf r3, +4 (over itself and the nop) ... but the nop survives
        // at level 0.
        assert_eq!(code[0], Opcode::BraF.to_u32());
        assert_eq!(code[2] as i32, 4);
    }

    #[test]
    fn test_finalize_builds_frame() {
        let mut gen = FuncGen::new(0, 0);
        gen.alloc_local("a", VarMode::Stack).unwrap();
        gen.emit(Opcode::Nop, &[]);
        let (code, _) = gen.finalize(0);
        assert_eq!(code[0], Opcode::PushZ.to_u32());
        assert_eq!(code[1], 1);
        assert_eq!(code[2], Opcode::Nop.to_u32());
        assert_eq!(code[3], Opcode::PopZ.to_u32());
        assert_eq!(code[4], 1);
        assert_eq!(code[5], Opcode::Ret.to_u32());
    }

    #[test]
    fn test_peephole_fuses_push_pop() {
        let mut gen = FuncGen::new(0, 0);
        gen.emit(Opcode::Push, &[4]);
        gen.emit(Opcode::Pop, &[5]);
        gen.emit(Opcode::Push, &[6]);
        gen.emit(Opcode::Pop, &[6]);
        let (code, stats) = gen.finalize(1);
        // push4/pop5 -> mover 4,5 ; push6/pop6 -> nothing
        assert_eq!(code[0], Opcode::MoveR.to_u32());
        assert_eq!(&code[1..3], &[4, 5]);
        assert_eq!(code[3], Opcode::Ret.to_u32());
        assert!(stats.instructions_saved >= 2);
        assert!(stats.size_after < stats.size_before);
    }

    #[test]
    fn test_peephole_keeps_branch_targets_valid() {
        let mut gen = FuncGen::new(0, 0);
        // jump over a nop that will be deleted, into a second nop that
        // will also be deleted; the branch must land on the ret.
        let patch = gen.emit_branch(Opcode::Jmp, None);
        gen.emit(Opcode::Nop, &[]);
        let target = gen.here();
        gen.patch_branch(patch, target);
        gen.emit(Opcode::Nop, &[]);
        let (code, _) = gen.finalize(1);
        assert_eq!(code[0], Opcode::Jmp.to_u32());
        let offset = code[1] as i32;
        // Lands exactly on the ret that follows.
        assert_eq!(code[offset as usize], Opcode::Ret.to_u32());
    }

    #[test]
    fn test_return_jump_resolves_to_epilogue() {
        let mut gen = FuncGen::new(0, 0);
        gen.alloc_local("x", VarMode::Stack).unwrap();
        gen.emit_return_jump();
        gen.emit(Opcode::Nop, &[]);
        let (code, _) = gen.finalize(0);
        // prologue(2) jmp(2) nop(1) popz(2) ret(1)
        assert_eq!(code[2], Opcode::Jmp.to_u32());
        let target = 2 + code[3] as i32 as usize;
        assert_eq!(code[target], Opcode::PopZ.to_u32());
    }
}
