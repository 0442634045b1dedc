//! Pass 2: function body compilation.
//!
//! Walks each function body recorded by pass 1, parses statements and
//! expression trees, and drives the code generator. Identifier
//! resolution order: block locals, arguments, closure captures, member
//! variables of the owning class, global variables, then function
//! references.

use beryl_bytecode::opcode::Opcode;
use beryl_bytecode::segment::{func_flags, Segments, TypeFamily};
use beryl_bytecode::{type_ids, REG_GLOBALS, REG_RESULT, REG_THIS};
use beryl_parser::{Span, Token, TokenStream};

use crate::codegen::{BranchPatch, FuncGen, FuncState, VarLoc, VarMode};
use crate::compiler::{CaptureBinding, Compiler, PendingLambda};
use crate::decl::{expect, parse_type, recover, restore_tokens, take_tokens};
use crate::error::CompileErrorKind;
use crate::expr::{self, AssignOp, BinOp, Callee, Expr, LambdaBody, UnOp};
use crate::model::SigMatch;
use crate::options::LocalsMode;

type CResult<T> = Result<T, CompileErrorKind>;

/// Nesting limit for statement compilation. Blocks and control-flow
/// statements recurse per level; deeper input reports a compile error
/// instead of exhausting the native stack.
const MAX_STMT_DEPTH: u32 = 256;

/// A value sitting in a register during expression emission.
#[derive(Debug, Clone, Copy)]
struct Val {
    reg: u32,
    type_id: u32,
    /// The register is a scratch temp owned by this value.
    owned: bool,
    /// The value came from a weak variable.
    weak: bool,
    /// The value is a freshly produced temporary (not a variable read).
    temp_value: bool,
}

impl Val {
    fn fixed(reg: u32, type_id: u32) -> Self {
        Val {
            reg,
            type_id,
            owned: false,
            weak: false,
            temp_value: false,
        }
    }
}

/// An assignable location.
enum Place {
    Reg {
        reg: u32,
        type_id: u32,
        is_const: bool,
        is_weak: bool,
    },
    Stack {
        slot: u32,
        type_id: u32,
        is_const: bool,
        is_weak: bool,
    },
    Arg {
        idx: u32,
        type_id: u32,
        is_const: bool,
    },
    Member {
        obj: Val,
        slot: u32,
        type_id: u32,
        is_const: bool,
        is_weak: bool,
    },
    Global {
        slot: u32,
        type_id: u32,
        is_const: bool,
        is_weak: bool,
    },
    /// Property writer accessor.
    Accessor {
        obj: Val,
        member_idx: u32,
        type_id: u32,
    },
}

impl Place {
    fn type_id(&self) -> u32 {
        match self {
            Place::Reg { type_id, .. }
            | Place::Stack { type_id, .. }
            | Place::Arg { type_id, .. }
            | Place::Member { type_id, .. }
            | Place::Global { type_id, .. }
            | Place::Accessor { type_id, .. } => *type_id,
        }
    }

    fn is_const(&self) -> bool {
        match self {
            Place::Reg { is_const, .. }
            | Place::Stack { is_const, .. }
            | Place::Arg { is_const, .. }
            | Place::Member { is_const, .. }
            | Place::Global { is_const, .. } => *is_const,
            Place::Accessor { .. } => false,
        }
    }

    fn is_weak(&self) -> bool {
        match self {
            Place::Reg { is_weak, .. }
            | Place::Stack { is_weak, .. }
            | Place::Member { is_weak, .. }
            | Place::Global { is_weak, .. } => *is_weak,
            _ => false,
        }
    }
}

/// One local variable in scope.
struct Local {
    name: String,
    type_id: u32,
    is_const: bool,
    is_weak: bool,
    loc: VarLoc,
    depth: u32,
}

/// Break/continue bookkeeping for one enclosing loop or switch.
struct LoopFrame {
    breaks: Vec<BranchPatch>,
    continue_target: Option<usize>,
    continues: Vec<BranchPatch>,
    is_switch: bool,
}

struct Ctx<'a> {
    comp: &'a mut Compiler,
    seg: &'a mut Segments,
    ts: &'a mut TokenStream,
    gen: FuncGen,
    file: String,
    fi: usize,
    owner: u32,
    is_method: bool,
    is_cofunc: bool,
    ret_type: u32,
    locals: Vec<Local>,
    scope_depth: u32,
    loops: Vec<LoopFrame>,
    captures: Vec<CaptureBinding>,
    stmt_span: Span,
    stmt_depth: u32,
}

/// Compile every function body declared in one unit, then the unit's
/// global initializers.
pub(crate) fn compile_unit(comp: &mut Compiler, seg: &mut Segments, unit_idx: usize) {
    let todo: Vec<usize> = comp
        .funcs
        .iter()
        .enumerate()
        .filter(|(_, f)| {
            f.unit == unit_idx
                && f.body_tok.is_some()
                && f.code.is_empty()
                && f.flags & func_flags::NATIVE == 0
        })
        .map(|(i, _)| i)
        .collect();
    for fi in todo {
        compile_function(comp, seg, fi, Vec::new());
    }
    compile_global_inits(comp, seg, unit_idx);
}

/// Drain the queue of lambdas discovered while compiling bodies. A
/// lambda body may itself contain lambdas, so this loops until dry.
pub(crate) fn compile_pending_lambdas(comp: &mut Compiler, seg: &mut Segments) {
    while let Some(pending) = comp.pending_lambdas.pop() {
        compile_lambda(comp, seg, pending);
    }
}

fn compile_function(
    comp: &mut Compiler,
    seg: &mut Segments,
    fi: usize,
    captures: Vec<CaptureBinding>,
) {
    let unit_idx = comp.funcs[fi].unit;
    let body_tok = match comp.funcs[fi].body_tok {
        Some(tok) => tok,
        None => return,
    };
    let arg_count = comp.funcs[fi].sig.params.len() as u32;
    let owner = comp.funcs[fi].owner;
    let flags = comp.funcs[fi].flags;
    let ret_type = comp.funcs[fi].sig.ret;
    let file = comp.units[unit_idx].name.clone();

    let mut ts = take_tokens(comp, unit_idx);
    let return_pos = ts.tell();
    ts.seek(body_tok);

    let mut ctx = Ctx {
        comp,
        seg,
        ts: &mut ts,
        gen: FuncGen::new(arg_count, captures.len() as u32),
        file,
        fi,
        owner,
        is_method: flags & func_flags::METHOD != 0,
        is_cofunc: flags & func_flags::COFUNC != 0,
        ret_type,
        locals: Vec::new(),
        scope_depth: 0,
        loops: Vec::new(),
        captures,
        stmt_span: Span::default(),
        stmt_depth: 0,
    };

    let terminates = match compile_block(&mut ctx) {
        Ok(t) => t,
        Err(kind) => {
            let span = ctx.stmt_span;
            ctx.report(kind, span);
            recover(ctx.ts);
            false
        }
    };
    ctx.gen.state = FuncState::Closed;

    if ret_type != type_ids::UNDEFINED && !terminates && !ctx.is_cofunc {
        let span = ctx.stmt_span;
        ctx.report(CompileErrorKind::NoReturnValue, span);
    }

    let opt_level = ctx.comp.options.optimize;
    let (code, stats) = ctx.gen.finalize(opt_level);
    comp.opt_stats.instructions_saved += stats.instructions_saved;
    comp.opt_stats.size_before += stats.size_before;
    comp.opt_stats.size_after += stats.size_after;
    if comp.options.verbose && stats.instructions_saved > 0 {
        comp.log.push(format!(
            "optimized '{}': {} instruction(s) saved, {} -> {} words",
            comp.funcs[fi].name, stats.instructions_saved, stats.size_before, stats.size_after
        ));
    }
    comp.funcs[fi].code = code;

    ts.seek(return_pos);
    restore_tokens(comp, unit_idx, ts);
}

fn compile_lambda(comp: &mut Compiler, seg: &mut Segments, pending: PendingLambda) {
    match pending.body {
        LambdaBody::Block { start } => {
            comp.funcs[pending.cfunc].body_tok = Some(start);
            compile_function(comp, seg, pending.cfunc, pending.captures);
        }
        LambdaBody::Expr(body) => {
            // Expression-bodied lambda: compile `return <expr>;`.
            let fi = pending.cfunc;
            let unit_idx = pending.unit;
            let arg_count = comp.funcs[fi].sig.params.len() as u32;
            let file = comp.units[unit_idx].name.clone();
            let mut ts = take_tokens(comp, unit_idx);
            let mut ctx = Ctx {
                comp,
                seg,
                ts: &mut ts,
                gen: FuncGen::new(arg_count, pending.captures.len() as u32),
                file,
                fi,
                owner: type_ids::GLOBAL,
                is_method: false,
                is_cofunc: false,
                ret_type: type_ids::VAR,
                locals: Vec::new(),
                scope_depth: 0,
                loops: Vec::new(),
                captures: pending.captures,
                stmt_span: Span::default(),
                stmt_depth: 0,
            };
            ctx.gen.state = FuncState::Body;
            match ctx.emit_expr(&body) {
                Ok(val) => {
                    ctx.gen.emit(Opcode::MoveR, &[val.reg, REG_RESULT]);
                    ctx.release(val);
                    ctx.gen.emit_return_jump();
                }
                Err(kind) => {
                    let span = ctx.stmt_span;
                    ctx.report(kind, span);
                }
            }
            let opt_level = ctx.comp.options.optimize;
            let (code, _) = ctx.gen.finalize(opt_level);
            comp.funcs[fi].code = code;
            restore_tokens(comp, unit_idx, ts);
        }
    }
}

/// Synthesize the global-initializer function of one unit.
fn compile_global_inits(comp: &mut Compiler, seg: &mut Segments, unit_idx: usize) {
    let inits: Vec<(u32, usize)> = comp
        .global_inits
        .iter()
        .filter(|g| g.unit == unit_idx)
        .map(|g| (g.slot, g.tok))
        .collect();
    if inits.is_empty() {
        return;
    }
    comp.global_inits.retain(|g| g.unit != unit_idx);

    let name = format!("__init#{unit_idx}");
    let name_offs = seg.cstr.add(&name);
    let func_idx = seg.add_function(beryl_bytecode::segment::FuncInfo {
        type_id: type_ids::GLOBAL,
        flags: func_flags::INIT,
        name_offs,
        ..Default::default()
    });
    let fi = comp.funcs.len();
    comp.funcs.push(crate::model::CFunc {
        name,
        func_idx,
        owner: type_ids::GLOBAL,
        flags: func_flags::INIT,
        sig: crate::model::Signature::default(),
        member_idx: beryl_bytecode::segment::NO_METHOD,
        unit: unit_idx,
        body_tok: None,
        code: Vec::new(),
        capture_count: 0,
    });

    let file = comp.units[unit_idx].name.clone();
    let mut ts = take_tokens(comp, unit_idx);
    let mut ctx = Ctx {
        comp,
        seg,
        ts: &mut ts,
        gen: FuncGen::new(0, 0),
        file,
        fi,
        owner: type_ids::GLOBAL,
        is_method: false,
        is_cofunc: false,
        ret_type: type_ids::UNDEFINED,
        locals: Vec::new(),
        scope_depth: 0,
        loops: Vec::new(),
        captures: Vec::new(),
        stmt_span: Span::default(),
        stmt_depth: 0,
    };
    ctx.gen.state = FuncState::Body;

    for (slot, tok) in inits {
        ctx.ts.seek(tok);
        ctx.stmt_span = ctx.ts.span();
        let result = (|| -> CResult<()> {
            let tree = expr::parse_expr(ctx.comp, ctx.ts)?;
            let tree = ctx.maybe_fold(tree);
            let target_type = ctx.comp.globals[slot as usize].type_id;
            let val = ctx.emit_expr(&tree)?;
            let val = ctx.coerce(val, target_type)?;
            ctx.gen.emit(Opcode::MoveRM, &[val.reg, REG_GLOBALS, slot]);
            ctx.release(val);
            Ok(())
        })();
        if let Err(kind) = result {
            let span = ctx.stmt_span;
            ctx.report(kind, span);
        }
    }

    let opt_level = ctx.comp.options.optimize;
    let (code, _) = ctx.gen.finalize(opt_level);
    comp.funcs[fi].code = code;
    restore_tokens(comp, unit_idx, ts);
}

impl<'a> Ctx<'a> {
    fn report(&mut self, kind: CompileErrorKind, span: Span) {
        self.comp.report_at(kind, &self.file, span.line, span.column);
    }

    fn release(&mut self, val: Val) {
        if val.owned {
            self.gen.free_temp(val.reg);
        }
    }

    fn var_mode(&self) -> VarMode {
        match self.comp.options.effective_locals_mode() {
            LocalsMode::Auto => VarMode::Auto,
            LocalsMode::Stack => VarMode::Stack,
        }
    }

    fn maybe_fold(&mut self, tree: Expr) -> Expr {
        if self.comp.options.optimize >= 1 {
            let mut folds = 0;
            let tree = expr::fold(tree, &mut folds);
            self.comp.opt_stats.instructions_saved += folds;
            tree
        } else {
            tree
        }
    }

    // ===== Statements =====

    /// Depth-guarded statement entry; every recursive statement site
    /// goes through here.
    fn compile_stmt(&mut self) -> CResult<bool> {
        if self.stmt_depth >= MAX_STMT_DEPTH {
            return Err(CompileErrorKind::ParserLimitExceeded);
        }
        self.stmt_depth += 1;
        let result = self.compile_stmt_inner();
        self.stmt_depth -= 1;
        result
    }

    fn compile_stmt_inner(&mut self) -> CResult<bool> {
        self.stmt_span = self.ts.span();
        if self.gen.state == FuncState::Open {
            self.gen.state = FuncState::Body;
        }
        match self.ts.peek().clone() {
            Token::LBrace => {
                self.ts.next();
                self.enter_scope();
                let mut terminates = false;
                let mut warned = false;
                while self.ts.peek() != &Token::RBrace {
                    if self.ts.at_eof() {
                        return Err(CompileErrorKind::UnexpectedEof);
                    }
                    if terminates && !warned {
                        let span = self.ts.span();
                        self.report(CompileErrorKind::UnreachableCode, span);
                        warned = true;
                    }
                    let span = self.ts.span();
                    match self.compile_stmt() {
                        Ok(t) => terminates = terminates || t,
                        Err(kind) => {
                            self.report(kind, span);
                            recover(self.ts);
                        }
                    }
                }
                self.ts.next();
                self.leave_scope();
                Ok(terminates)
            }
            Token::If => self.compile_if(),
            Token::While => self.compile_while(),
            Token::Do => self.compile_do(),
            Token::For => self.compile_for(),
            Token::Switch => self.compile_switch(),
            Token::Break => {
                self.ts.next();
                expect(self.ts, &Token::Semicolon)?;
                let patch = self.gen.emit_branch(Opcode::Jmp, None);
                match self.loops.last_mut() {
                    Some(frame) => frame.breaks.push(patch),
                    None => return Err(CompileErrorKind::BreakWithoutLoop),
                }
                Ok(false)
            }
            Token::Continue => {
                self.ts.next();
                expect(self.ts, &Token::Semicolon)?;
                let frame = self
                    .loops
                    .iter_mut()
                    .rev()
                    .find(|f| !f.is_switch)
                    .ok_or(CompileErrorKind::BreakWithoutLoop)?;
                match frame.continue_target {
                    Some(target) => {
                        let t = target;
                        self.gen.emit_jump_back(t);
                    }
                    None => {
                        let patch = self.gen.emit_branch(Opcode::Jmp, None);
                        self.loops
                            .iter_mut()
                            .rev()
                            .find(|f| !f.is_switch)
                            .unwrap()
                            .continues
                            .push(patch);
                    }
                }
                Ok(false)
            }
            Token::Return => self.compile_return(),
            Token::Yield => {
                self.ts.next();
                if !self.is_cofunc {
                    return Err(CompileErrorKind::YieldOutsideCofunction);
                }
                let tree = expr::parse_expr(self.comp, self.ts)?;
                let tree = self.maybe_fold(tree);
                expect(self.ts, &Token::Semicolon)?;
                let val = self.emit_expr(&tree)?;
                let val = self.coerce(val, self.ret_type)?;
                self.gen.emit(Opcode::Yield, &[val.reg]);
                self.release(val);
                Ok(false)
            }
            Token::Throw => {
                self.ts.next();
                let tree = expr::parse_expr(self.comp, self.ts)?;
                let tree = self.maybe_fold(tree);
                expect(self.ts, &Token::Semicolon)?;
                let val = self.emit_expr(&tree)?;
                self.gen.emit(Opcode::Throw, &[val.reg]);
                self.release(val);
                Ok(true)
            }
            Token::BrkKw => {
                self.ts.next();
                expect(self.ts, &Token::Semicolon)?;
                self.gen.emit(Opcode::Brk, &[]);
                Ok(false)
            }
            Token::RtChkKw => {
                // __rtchk (expr, type);
                self.ts.next();
                expect(self.ts, &Token::LParen)?;
                let tree = expr::parse_expr(self.comp, self.ts)?;
                expect(self.ts, &Token::Comma)?;
                let type_id = parse_type(self.comp, self.ts)?;
                expect(self.ts, &Token::RParen)?;
                expect(self.ts, &Token::Semicolon)?;
                let val = self.emit_expr(&tree)?;
                self.gen.emit(Opcode::RtChk, &[val.reg, type_id]);
                self.release(val);
                Ok(false)
            }
            Token::SelfTest => {
                let span = self.ts.span();
                self.ts.next();
                self.report(CompileErrorKind::SelfTestIgnored, span);
                recover(self.ts);
                Ok(false)
            }
            Token::Goto | Token::Namespace | Token::Using | Token::Clause | Token::Array => {
                let word = self.ts.next();
                recover(self.ts);
                Err(CompileErrorKind::ReservedKeyword(word.lexeme().to_string()))
            }
            Token::Semicolon => {
                self.ts.next();
                Ok(false)
            }
            _ => self.compile_decl_or_expr(),
        }
    }

    fn compile_if(&mut self) -> CResult<bool> {
        self.ts.next();
        expect(self.ts, &Token::LParen)?;
        let cond = expr::parse_expr(self.comp, self.ts)?;
        let cond = self.maybe_fold(cond);
        expect(self.ts, &Token::RParen)?;

        let val = self.emit_expr(&cond)?;
        let skip = self.gen.emit_branch(Opcode::BraF, Some(val.reg));
        self.release(val);

        let then_terminates = self.compile_stmt()?;
        if self.ts.eat(&Token::Else) {
            let end = self.gen.emit_branch(Opcode::Jmp, None);
            let target = self.gen.here();
            self.gen.patch_branch(skip, target);
            let else_terminates = self.compile_stmt()?;
            let target = self.gen.here();
            self.gen.patch_branch(end, target);
            Ok(then_terminates && else_terminates)
        } else {
            let target = self.gen.here();
            self.gen.patch_branch(skip, target);
            Ok(false)
        }
    }

    fn compile_while(&mut self) -> CResult<bool> {
        self.ts.next();
        expect(self.ts, &Token::LParen)?;
        let top = self.gen.here();
        let cond = expr::parse_expr(self.comp, self.ts)?;
        let cond = self.maybe_fold(cond);
        expect(self.ts, &Token::RParen)?;

        let val = self.emit_expr(&cond)?;
        let exit = self.gen.emit_branch(Opcode::BraF, Some(val.reg));
        self.release(val);

        self.loops.push(LoopFrame {
            breaks: Vec::new(),
            continue_target: Some(top),
            continues: Vec::new(),
            is_switch: false,
        });
        self.compile_stmt()?;
        self.gen.emit_jump_back(top);

        let end = self.gen.here();
        self.gen.patch_branch(exit, end);
        let frame = self.loops.pop().unwrap();
        for patch in frame.breaks {
            self.gen.patch_branch(patch, end);
        }
        Ok(false)
    }

    fn compile_do(&mut self) -> CResult<bool> {
        self.ts.next();
        let top = self.gen.here();
        self.loops.push(LoopFrame {
            breaks: Vec::new(),
            continue_target: None,
            continues: Vec::new(),
            is_switch: false,
        });
        self.compile_stmt()?;

        let cond_label = self.gen.here();
        expect(self.ts, &Token::While)?;
        expect(self.ts, &Token::LParen)?;
        let cond = expr::parse_expr(self.comp, self.ts)?;
        let cond = self.maybe_fold(cond);
        expect(self.ts, &Token::RParen)?;
        expect(self.ts, &Token::Semicolon)?;

        let val = self.emit_expr(&cond)?;
        let reg = val.reg;
        // Branch back while true.
        let back = self.gen.here() as i64;
        let offset = top as i64 - back;
        self.gen.emit(Opcode::BraT, &[reg, offset as i32 as u32]);
        self.release(val);

        let end = self.gen.here();
        let frame = self.loops.pop().unwrap();
        for patch in frame.breaks {
            self.gen.patch_branch(patch, end);
        }
        for patch in frame.continues {
            self.gen.patch_branch(patch, cond_label);
        }
        Ok(false)
    }

    fn compile_for(&mut self) -> CResult<bool> {
        self.ts.next();
        expect(self.ts, &Token::LParen)?;
        self.enter_scope();

        // Initializer: declaration, expression or empty.
        if !self.ts.eat(&Token::Semicolon) {
            self.compile_decl_or_expr()?;
        }

        let top = self.gen.here();
        // Condition: empty means always true.
        let exit = if self.ts.peek() != &Token::Semicolon {
            let cond = expr::parse_expr(self.comp, self.ts)?;
            let cond = self.maybe_fold(cond);
            let val = self.emit_expr(&cond)?;
            let patch = self.gen.emit_branch(Opcode::BraF, Some(val.reg));
            self.release(val);
            Some(patch)
        } else {
            None
        };
        expect(self.ts, &Token::Semicolon)?;

        // Increment clause: parsed now, emitted after the body.
        let inc = if self.ts.peek() != &Token::RParen {
            let tree = expr::parse_expr(self.comp, self.ts)?;
            Some(self.maybe_fold(tree))
        } else {
            None
        };
        expect(self.ts, &Token::RParen)?;

        self.loops.push(LoopFrame {
            breaks: Vec::new(),
            continue_target: None,
            continues: Vec::new(),
            is_switch: false,
        });
        self.compile_stmt()?;

        let inc_label = self.gen.here();
        if let Some(tree) = inc {
            let val = self.emit_expr(&tree)?;
            self.release(val);
        }
        self.gen.emit_jump_back(top);

        let end = self.gen.here();
        if let Some(patch) = exit {
            self.gen.patch_branch(patch, end);
        }
        let frame = self.loops.pop().unwrap();
        for patch in frame.breaks {
            self.gen.patch_branch(patch, end);
        }
        for patch in frame.continues {
            self.gen.patch_branch(patch, inc_label);
        }
        self.leave_scope();
        Ok(false)
    }

    fn compile_switch(&mut self) -> CResult<bool> {
        self.ts.next();
        expect(self.ts, &Token::LParen)?;
        let scrut = expr::parse_expr(self.comp, self.ts)?;
        let scrut = self.maybe_fold(scrut);
        expect(self.ts, &Token::RParen)?;
        expect(self.ts, &Token::LBrace)?;

        // The scrutinee stays pinned in its register across the cases.
        let scrut_val = self.emit_expr(&scrut)?;
        let scrut_reg = if scrut_val.owned {
            scrut_val.reg
        } else {
            let reg = self.gen.alloc_temp()?;
            self.gen.emit(Opcode::MoveR, &[scrut_val.reg, reg]);
            reg
        };

        self.loops.push(LoopFrame {
            breaks: Vec::new(),
            continue_target: None,
            continues: Vec::new(),
            is_switch: true,
        });
        self.enter_scope();

        let mut fail: Option<BranchPatch> = None;
        let mut seen_default = false;
        let mut first_section = true;
        while self.ts.peek() != &Token::RBrace {
            match self.ts.peek().clone() {
                Token::Case => {
                    if seen_default {
                        return Err(CompileErrorKind::DefaultNotLast);
                    }
                    self.ts.next();
                    let case_expr = expr::parse_expr(self.comp, self.ts)?;
                    let case_expr = self.maybe_fold(case_expr);
                    if !case_expr.is_literal() {
                        return Err(CompileErrorKind::CaseNotConstant);
                    }
                    expect(self.ts, &Token::Colon)?;

                    // Fall through from the previous section skips the
                    // test.
                    let skip_test = if first_section {
                        None
                    } else {
                        Some(self.gen.emit_branch(Opcode::Jmp, None))
                    };
                    if let Some(patch) = fail.take() {
                        let here = self.gen.here();
                        self.gen.patch_branch(patch, here);
                    }
                    let lit = self.emit_expr(&case_expr)?;
                    let test = self.gen.alloc_temp()?;
                    self.gen
                        .emit(Opcode::CmpEq, &[scrut_reg, lit.reg, test]);
                    self.release(lit);
                    fail = Some(self.gen.emit_branch(Opcode::BraF, Some(test)));
                    self.gen.free_temp(test);
                    if let Some(patch) = skip_test {
                        let here = self.gen.here();
                        self.gen.patch_branch(patch, here);
                    }
                    first_section = false;
                }
                Token::Default => {
                    self.ts.next();
                    expect(self.ts, &Token::Colon)?;
                    seen_default = true;
                    // Matching falls straight in; a failed prior test
                    // lands here too.
                    if let Some(patch) = fail.take() {
                        let here = self.gen.here();
                        self.gen.patch_branch(patch, here);
                    }
                    first_section = false;
                }
                Token::Eof => return Err(CompileErrorKind::UnexpectedEof),
                _ => {
                    let span = self.ts.span();
                    if first_section {
                        self.report(CompileErrorKind::SyntaxError, span);
                        recover(self.ts);
                        continue;
                    }
                    if let Err(kind) = self.compile_stmt() {
                        self.report(kind, span);
                        recover(self.ts);
                    }
                }
            }
        }
        self.ts.next();

        let end = self.gen.here();
        if let Some(patch) = fail {
            self.gen.patch_branch(patch, end);
        }
        let frame = self.loops.pop().unwrap();
        for patch in frame.breaks {
            self.gen.patch_branch(patch, end);
        }
        self.leave_scope();
        self.gen.free_temp(scrut_reg);
        Ok(false)
    }

    fn compile_return(&mut self) -> CResult<bool> {
        self.ts.next();
        if self.is_cofunc {
            return Err(CompileErrorKind::ReturnInCofunction);
        }
        if self.ts.eat(&Token::Semicolon) {
            if self.ret_type != type_ids::UNDEFINED {
                return Err(CompileErrorKind::MustReturnValue);
            }
            self.gen.emit_return_jump();
            return Ok(true);
        }
        if self.ret_type == type_ids::UNDEFINED {
            return Err(CompileErrorKind::CannotReturnValue);
        }
        let tree = expr::parse_expr(self.comp, self.ts)?;
        let tree = self.maybe_fold(tree);
        expect(self.ts, &Token::Semicolon)?;

        // Returning a weak reference to a local is almost always a
        // dangling value after the frame unwinds.
        if let Expr::Ident(name) = &tree {
            if self
                .locals
                .iter()
                .any(|l| &l.name == name && l.is_weak)
            {
                let span = self.stmt_span;
                self.report(CompileErrorKind::ReturnWeakLocal, span);
            }
        }

        let val = self.emit_expr(&tree)?;
        let val = self.coerce(val, self.ret_type)?;
        self.gen.emit(Opcode::MoveR, &[val.reg, REG_RESULT]);
        self.release(val);
        self.gen.emit_return_jump();
        Ok(true)
    }

    /// Either a local variable declaration or an expression statement.
    fn compile_decl_or_expr(&mut self) -> CResult<bool> {
        let mark = self.ts.tell();
        let mut is_const = false;
        let mut is_weak = false;
        loop {
            match self.ts.peek() {
                Token::Const => {
                    is_const = true;
                    self.ts.next();
                }
                Token::Weak => {
                    is_weak = true;
                    self.ts.next();
                }
                _ => break,
            }
        }

        let is_decl = (is_const || is_weak)
            || (matches!(self.ts.peek(), Token::Ident(_) | Token::Var)
                && matches!(self.ts.peek_at(1), Token::Ident(_))
                && parse_type(self.comp, &mut probe_stream(self.ts)).is_ok());
        if !is_decl {
            self.ts.seek(mark);
            let tree = expr::parse_expr(self.comp, self.ts)?;
            let tree = self.maybe_fold(tree);
            expect(self.ts, &Token::Semicolon)?;
            let val = self.emit_expr(&tree)?;
            self.release(val);
            return Ok(false);
        }

        let type_id = parse_type(self.comp, self.ts)?;
        if is_weak && matches!(type_id, type_ids::INT | type_ids::FLOAT) {
            return Err(CompileErrorKind::WeakNeedsReference);
        }
        loop {
            let name = match self.ts.next() {
                Token::Ident(n) => n,
                other => return Err(CompileErrorKind::UnexpectedToken(other.describe())),
            };
            if self
                .locals
                .iter()
                .any(|l| l.name == name && l.depth == self.scope_depth)
            {
                return Err(CompileErrorKind::IdentifierAlreadyDefined(name));
            }
            let mode = self.var_mode();
            let loc = self.gen.alloc_local(&name, mode)?;
            self.locals.push(Local {
                name,
                type_id,
                is_const,
                is_weak,
                loc,
                depth: self.scope_depth,
            });

            if self.ts.eat(&Token::Assign) {
                let tree = expr::parse_expr(self.comp, self.ts)?;
                let tree = self.maybe_fold(tree);
                let val = self.emit_expr(&tree)?;
                let val = self.coerce(val, type_id)?;
                if is_weak {
                    if val.weak {
                        let span = self.stmt_span;
                        self.report(CompileErrorKind::WeakFromWeak, span);
                    }
                    if val.temp_value {
                        let span = self.stmt_span;
                        self.report(CompileErrorKind::WeakFromTemporary, span);
                    }
                }
                let store_op = if is_weak { Opcode::WRef } else { Opcode::MoveR };
                match loc {
                    VarLoc::Reg(reg) => {
                        self.gen.emit(store_op, &[val.reg, reg]);
                    }
                    VarLoc::Stack(slot) => {
                        let disp = self.gen.local_disp(slot);
                        self.gen.emit(Opcode::MoveRS, &[val.reg, disp]);
                    }
                }
                self.release(val);
            } else if is_const {
                return Err(CompileErrorKind::ConstNeedsInit);
            }

            if !self.ts.eat(&Token::Comma) {
                break;
            }
        }
        expect(self.ts, &Token::Semicolon)?;
        Ok(false)
    }

    fn enter_scope(&mut self) {
        self.scope_depth += 1;
    }

    fn leave_scope(&mut self) {
        let depth = self.scope_depth;
        // Register locals of the closing scope free up; stack slots
        // stay allocated for the whole frame.
        let mut keep = Vec::new();
        for local in self.locals.drain(..) {
            if local.depth == depth {
                if let VarLoc::Reg(reg) = local.loc {
                    self.gen.free_temp(reg);
                }
            } else {
                keep.push(local);
            }
        }
        self.locals = keep;
        self.scope_depth -= 1;
    }

    // ===== Identifier resolution =====

    fn find_local(&self, name: &str) -> Option<&Local> {
        self.locals.iter().rev().find(|l| l.name == name)
    }

    fn find_arg(&self, name: &str) -> Option<(u32, u32, bool)> {
        let sig = &self.comp.funcs[self.fi].sig;
        sig.params
            .iter()
            .position(|p| p.name == name)
            .map(|i| (i as u32, sig.params[i].type_id, sig.params[i].is_const))
    }

    fn find_capture(&self, name: &str) -> Option<(u32, u32, bool)> {
        self.captures
            .iter()
            .position(|c| c.name == name)
            .map(|i| (i as u32, self.captures[i].type_id, self.captures[i].is_weak))
    }

    /// Visible member variable of the owning class, `this` context only.
    fn find_member(&self, name: &str) -> Option<(u32, u32, bool, bool)> {
        if !self.is_method {
            return None;
        }
        self.comp
            .class_of(self.owner)
            .and_then(|c| c.find_var(name))
            .map(|v| (v.slot, v.type_id, v.is_const, v.is_weak))
    }

    // ===== Expression emission =====

    fn emit_expr(&mut self, tree: &Expr) -> CResult<Val> {
        match tree {
            Expr::IntLit(v) => {
                let idx = self.comp.literals.intern_int(self.seg, *v);
                self.load_data(idx, type_ids::INT)
            }
            Expr::FloatLit(v) => {
                let idx = self.comp.literals.intern_float(self.seg, *v);
                self.load_data(idx, type_ids::FLOAT)
            }
            Expr::StrLit(s) => {
                let idx = self.comp.literals.intern_string(self.seg, s);
                self.load_data(idx, type_ids::STRING)
            }
            Expr::Null => {
                let idx = self.comp.literals.intern_null(self.seg);
                self.load_data(idx, type_ids::UNDEFINED)
            }
            Expr::This => {
                if !self.is_method {
                    return Err(CompileErrorKind::MethodWithoutObject);
                }
                Ok(Val::fixed(REG_THIS, self.owner))
            }
            Expr::Ident(name) => self.emit_ident(name),
            Expr::Member(obj, name) => self.emit_member_read(obj, name),
            Expr::Call { callee, args } => self.emit_call(callee, args),
            Expr::New { type_name, args } => self.emit_new(type_name, args),
            Expr::Unary(op, inner) => self.emit_unary(*op, inner),
            Expr::Binary(op, lhs, rhs) => self.emit_binary(*op, lhs, rhs),
            Expr::Assign(op, lhs, rhs) => self.emit_assign(*op, lhs, rhs),
            Expr::IncDec { dec, post, target } => self.emit_incdec(*dec, *post, target),
            Expr::Ternary(cond, then, otherwise) => self.emit_ternary(cond, then, otherwise),
            Expr::TypeOf(inner) => {
                let val = self.emit_expr(inner)?;
                let dst = self.gen.alloc_temp()?;
                self.gen.emit(Opcode::TypeOf, &[val.reg, dst]);
                self.release(val);
                Ok(Val {
                    reg: dst,
                    type_id: type_ids::INT,
                    owned: true,
                    weak: false,
                    temp_value: true,
                })
            }
            Expr::SameRef(a, b) => {
                let va = self.emit_expr(a)?;
                let vb = self.emit_expr(b)?;
                let dst = self.gen.alloc_temp()?;
                self.gen.emit(Opcode::SameRef, &[va.reg, vb.reg, dst]);
                self.release(va);
                self.release(vb);
                Ok(Val {
                    reg: dst,
                    type_id: type_ids::INT,
                    owned: true,
                    weak: false,
                    temp_value: true,
                })
            }
            Expr::Lambda(lambda) => self.emit_lambda(lambda),
        }
    }

    fn load_data(&mut self, idx: u32, type_id: u32) -> CResult<Val> {
        let reg = self.gen.alloc_temp()?;
        self.gen.emit(Opcode::MoveH, &[idx, reg]);
        Ok(Val {
            reg,
            type_id,
            owned: true,
            weak: false,
            temp_value: true,
        })
    }

    fn emit_ident(&mut self, name: &str) -> CResult<Val> {
        if let Some(local) = self.find_local(name) {
            let (type_id, is_weak, loc) = (local.type_id, local.is_weak, local.loc);
            return match loc {
                VarLoc::Reg(reg) => Ok(Val {
                    reg,
                    type_id,
                    owned: false,
                    weak: is_weak,
                    temp_value: false,
                }),
                VarLoc::Stack(slot) => {
                    let reg = self.gen.alloc_temp()?;
                    let disp = self.gen.local_disp(slot);
                    self.gen.emit(Opcode::MoveSR, &[disp, reg]);
                    Ok(Val {
                        reg,
                        type_id,
                        owned: true,
                        weak: is_weak,
                        temp_value: false,
                    })
                }
            };
        }
        if let Some((idx, type_id, _)) = self.find_arg(name) {
            let reg = self.gen.alloc_temp()?;
            let disp = self.gen.arg_disp(idx);
            self.gen.emit(Opcode::MoveSR, &[disp, reg]);
            return Ok(Val {
                reg,
                type_id,
                owned: true,
                weak: false,
                temp_value: false,
            });
        }
        if let Some((idx, type_id, is_weak)) = self.find_capture(name) {
            let reg = self.gen.alloc_temp()?;
            let disp = self.gen.capture_disp(idx);
            self.gen.emit(Opcode::MoveSR, &[disp, reg]);
            return Ok(Val {
                reg,
                type_id,
                owned: true,
                weak: is_weak,
                temp_value: false,
            });
        }
        if let Some((slot, type_id, _, is_weak)) = self.find_member(name) {
            let reg = self.gen.alloc_temp()?;
            self.gen.emit(Opcode::MoveMR, &[REG_THIS, slot, reg]);
            return Ok(Val {
                reg,
                type_id,
                owned: true,
                weak: is_weak,
                temp_value: false,
            });
        }
        if let Some(global) = self.comp.find_global(name) {
            let (slot, type_id, is_weak) = (global.slot, global.type_id, global.is_weak);
            let reg = self.gen.alloc_temp()?;
            self.gen.emit(Opcode::MoveMR, &[REG_GLOBALS, slot, reg]);
            return Ok(Val {
                reg,
                type_id,
                owned: true,
                weak: is_weak,
                temp_value: false,
            });
        }
        // A bare function name is a delegate literal.
        let candidates = self.comp.funcs_named(type_ids::GLOBAL, name);
        let plain: Vec<usize> = candidates
            .into_iter()
            .filter(|&fi| self.comp.funcs[fi].flags & func_flags::COFUNC == 0)
            .collect();
        if plain.len() == 1 {
            let func_idx = self.comp.funcs[plain[0]].func_idx;
            let sig = self.comp.funcs[plain[0]].sig.clone();
            let reg = self.gen.alloc_temp()?;
            self.gen.emit(Opcode::AllocDG, &[func_idx, reg]);
            return Ok(Val {
                reg,
                type_id: self.delegate_type_for(&sig),
                owned: true,
                weak: false,
                temp_value: true,
            });
        }
        Err(CompileErrorKind::UndefinedIdentifier(name.to_string()))
    }

    /// Delegate type whose signature matches, or `var` when none is
    /// declared.
    fn delegate_type_for(&self, sig: &crate::model::Signature) -> u32 {
        self.comp
            .classes
            .iter()
            .find(|c| {
                c.family == TypeFamily::Delegate
                    && c.delegate_sig
                        .as_ref()
                        .map(|s| matches!(s.match_against(sig), SigMatch::Same) && s.ret == sig.ret)
                        .unwrap_or(false)
            })
            .map(|c| c.type_id)
            .unwrap_or(type_ids::VAR)
    }

    fn emit_member_read(&mut self, obj: &Expr, name: &str) -> CResult<Val> {
        let obj_val = self.emit_expr(obj)?;
        let (family, var, has_var) = {
            let class = self
                .comp
                .class_of(obj_val.type_id)
                .ok_or(CompileErrorKind::NeedObject)?;
            (
                class.family,
                class.find_var(name).cloned(),
                class.find_var(name).is_some(),
            )
        };
        if !matches!(
            family,
            TypeFamily::Class | TypeFamily::Interface | TypeFamily::Thread
        ) {
            return Err(CompileErrorKind::NeedObject);
        }
        let inside_own = self.is_method && obj_val.type_id == self.owner;

        if let Some(var) = &var {
            if !var.is_private || inside_own {
                let (slot, type_id, is_weak) = (var.slot, var.type_id, var.is_weak);
                let reg = self.gen.alloc_temp()?;
                self.gen.emit(Opcode::MoveMR, &[obj_val.reg, slot, reg]);
                self.release(obj_val);
                return Ok(Val {
                    reg,
                    type_id,
                    owned: true,
                    weak: is_weak,
                    temp_value: false,
                });
            }
        }

        // Not directly visible: try a reader accessor.
        if let Some(fi) = self.find_accessor(obj_val.type_id, name, true) {
            let ret = self.comp.funcs[fi].sig.ret;
            let member_idx = self.comp.funcs[fi].member_idx;
            let result = self.emit_method_call(obj_val, member_idx, ret, &[])?;
            return Ok(result);
        }

        // A bare method name is a bound delegate.
        if let Some(fi) = self.find_method_in_chain(obj_val.type_id, name, None) {
            let member_idx = self.comp.funcs[fi].member_idx;
            let sig = self.comp.funcs[fi].sig.clone();
            let dst = self.gen.alloc_temp()?;
            self.gen
                .emit(Opcode::AllocDM, &[member_idx, obj_val.reg, dst]);
            self.release(obj_val);
            return Ok(Val {
                reg: dst,
                type_id: self.delegate_type_for(&sig),
                owned: true,
                weak: false,
                temp_value: true,
            });
        }

        if has_var {
            return Err(CompileErrorKind::PrivateMember(name.to_string()));
        }
        Err(CompileErrorKind::NoSuitableAccessor(name.to_string()))
    }

    /// Find an accessor: `reader` selects zero-argument readers,
    /// otherwise single-argument writers.
    fn find_accessor(&self, type_id: u32, name: &str, reader: bool) -> Option<usize> {
        let class = self.comp.class_of(type_id)?;
        class.funcs.iter().copied().find(|&fi| {
            let f = &self.comp.funcs[fi];
            f.name == name
                && f.flags & func_flags::ACCESSOR != 0
                && if reader {
                    f.sig.params.is_empty() && f.sig.returns_value()
                } else {
                    f.sig.params.len() == 1 && !f.sig.returns_value()
                }
        })
    }

    /// Find a method by name (and optionally argument types) walking
    /// the base interface and hybrid chains.
    fn find_method_in_chain(
        &self,
        type_id: u32,
        name: &str,
        args: Option<&[u32]>,
    ) -> Option<usize> {
        let mut probe = type_id;
        while probe != 0 {
            let class = self.comp.class_of(probe)?;
            let candidates: Vec<usize> = class
                .funcs
                .iter()
                .copied()
                .filter(|&fi| {
                    let f = &self.comp.funcs[fi];
                    f.name == name
                        && f.flags & func_flags::METHOD != 0
                        && f.flags & func_flags::ACCESSOR == 0
                })
                .collect();
            if let Some(args) = args {
                // Exact match first, then promotion.
                if let Some(&fi) = candidates.iter().find(|&&fi| {
                    let p = &self.comp.funcs[fi].sig.params;
                    p.len() == args.len()
                        && p.iter().zip(args).all(|(p, &a)| p.type_id == a)
                }) {
                    return Some(fi);
                }
                if let Some(&fi) = candidates
                    .iter()
                    .find(|&&fi| self.comp.funcs[fi].sig.accepts(args))
                {
                    return Some(fi);
                }
            } else if let Some(&fi) = candidates.first() {
                return Some(fi);
            }
            probe = if class.base_id != 0 {
                class.base_id
            } else {
                class.hybrid_id
            };
        }
        None
    }

    /// Push arguments, coercing each to its parameter type. Returns the
    /// pushed word count. Caller must have emitted the register save.
    fn push_args(&mut self, args: &[Expr], params: &[crate::model::Param]) -> CResult<u32> {
        for (i, arg) in args.iter().enumerate() {
            let val = self.emit_expr(arg)?;
            let val = if i < params.len() {
                self.coerce(val, params[i].type_id)?
            } else {
                val
            };
            self.gen.emit(Opcode::Push, &[val.reg]);
            self.gen.note_push();
            self.release(val);
        }
        Ok(args.len() as u32)
    }

    /// Shared tail of every call: result pickup from r0.
    fn call_result(&mut self, ret: u32) -> CResult<Val> {
        if ret == type_ids::UNDEFINED {
            return Ok(Val {
                reg: REG_RESULT,
                type_id: type_ids::UNDEFINED,
                owned: false,
                weak: false,
                temp_value: true,
            });
        }
        let dst = self.gen.alloc_temp()?;
        self.gen.emit(Opcode::MoveR, &[REG_RESULT, dst]);
        Ok(Val {
            reg: dst,
            type_id: ret,
            owned: true,
            weak: false,
            temp_value: true,
        })
    }

    fn emit_method_call(
        &mut self,
        obj: Val,
        member_idx: u32,
        ret: u32,
        args: &[Expr],
    ) -> CResult<Val> {
        let params = self
            .method_params_for(obj.type_id, member_idx)
            .unwrap_or_default();
        let saved = self.gen.emit_call_save();
        let arg_words = self.push_args(args, &params)?;
        self.gen.emit(Opcode::CallM, &[obj.reg, member_idx]);
        self.gen.emit_call_restore(saved, arg_words);
        self.release(obj);
        self.call_result(ret)
    }

    fn method_params_for(
        &self,
        type_id: u32,
        member_idx: u32,
    ) -> Option<Vec<crate::model::Param>> {
        let mut probe = type_id;
        while probe != 0 {
            let class = self.comp.class_of(probe)?;
            for &fi in &class.funcs {
                let f = &self.comp.funcs[fi];
                if f.member_idx == member_idx && f.flags & func_flags::METHOD != 0 {
                    return Some(f.sig.params.clone());
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

    fn arg_types(&mut self, args: &[Expr]) -> CResult<Vec<u32>> {
        // Cheap static typing pass used only for overload selection.
        args.iter().map(|a| self.static_type(a)).collect()
    }

    /// Best-effort static type of an expression without emitting code.
    fn static_type(&mut self, tree: &Expr) -> CResult<u32> {
        Ok(match tree {
            Expr::IntLit(_) => type_ids::INT,
            Expr::FloatLit(_) => type_ids::FLOAT,
            Expr::StrLit(_) => type_ids::STRING,
            Expr::Null => type_ids::UNDEFINED,
            Expr::This => self.owner,
            Expr::Ident(name) => {
                if let Some(local) = self.find_local(name) {
                    local.type_id
                } else if let Some((_, t, _)) = self.find_arg(name) {
                    t
                } else if let Some((_, t, _)) = self.find_capture(name) {
                    t
                } else if let Some((_, t, _, _)) = self.find_member(name) {
                    t
                } else if let Some(g) = self.comp.find_global(name) {
                    g.type_id
                } else {
                    type_ids::VAR
                }
            }
            Expr::Binary(op, a, b) => match op {
                BinOp::Eq
                | BinOp::Ne
                | BinOp::Lt
                | BinOp::Le
                | BinOp::Gt
                | BinOp::Ge
                | BinOp::LAnd
                | BinOp::LOr => type_ids::INT,
                _ => {
                    let ta = self.static_type(a)?;
                    let tb = self.static_type(b)?;
                    if ta == type_ids::STRING || tb == type_ids::STRING {
                        type_ids::STRING
                    } else if ta == type_ids::FLOAT || tb == type_ids::FLOAT {
                        type_ids::FLOAT
                    } else {
                        ta
                    }
                }
            },
            Expr::Unary(UnOp::LNot, _) => type_ids::INT,
            Expr::Unary(_, a) => self.static_type(a)?,
            Expr::New { type_name, .. } => {
                self.comp.find_type(type_name).unwrap_or(type_ids::VAR)
            }
            Expr::TypeOf(_) | Expr::SameRef(..) => type_ids::INT,
            _ => type_ids::VAR,
        })
    }

    fn emit_call(&mut self, callee: &Callee, args: &[Expr]) -> CResult<Val> {
        match callee {
            Callee::Name(name) => self.emit_named_call(name, args),
            Callee::Scoped(type_name, func_name) => {
                let type_id = self
                    .comp
                    .find_type(type_name)
                    .ok_or_else(|| CompileErrorKind::UndefinedType(type_name.clone()))?;
                if !self.comp.is_native_type(self.seg, type_id) {
                    return Err(CompileErrorKind::NoMatchingOverload(func_name.clone()));
                }
                let types = self.arg_types(args)?;
                let fi = self
                    .comp
                    .funcs_named(type_id, func_name)
                    .into_iter()
                    .find(|&fi| {
                        let f = &self.comp.funcs[fi];
                        f.flags & func_flags::METHOD == 0 && f.sig.accepts(&types)
                    })
                    .ok_or_else(|| CompileErrorKind::NoMatchingOverload(func_name.clone()))?;
                let (ordinal, ret, params) = {
                    let f = &self.comp.funcs[fi];
                    (f.member_idx, f.sig.ret, f.sig.params.clone())
                };
                let saved = self.gen.emit_call_save();
                let arg_words = self.push_args(args, &params)?;
                self.gen.emit(Opcode::CallN, &[type_id, ordinal]);
                self.gen.emit_call_restore(saved, arg_words);
                self.call_result(ret)
            }
            Callee::Member(obj, name) => self.emit_member_call(obj, name, args),
            Callee::Expr(inner) => {
                let val = self.emit_expr(inner)?;
                self.emit_value_call(val, args)
            }
        }
    }

    /// Call through a delegate or resume a task held in a value.
    fn emit_value_call(&mut self, val: Val, args: &[Expr]) -> CResult<Val> {
        let family = self
            .comp
            .class_of(val.type_id)
            .map(|c| c.family)
            .unwrap_or(TypeFamily::Undefined);
        match family {
            TypeFamily::Thread => {
                if !args.is_empty() {
                    return Err(CompileErrorKind::NoMatchingOverload("resume".into()));
                }
                let ret = self
                    .comp
                    .class_of(val.type_id)
                    .and_then(|c| c.delegate_sig.as_ref())
                    .map(|s| s.ret)
                    .unwrap_or(type_ids::VAR);
                let dst = self.gen.alloc_temp()?;
                self.gen.emit(Opcode::Resume, &[val.reg, dst]);
                self.release(val);
                Ok(Val {
                    reg: dst,
                    type_id: ret,
                    owned: true,
                    weak: false,
                    temp_value: true,
                })
            }
            _ => {
                // Delegate (or dynamically typed) call.
                let (params, ret) = self
                    .comp
                    .class_of(val.type_id)
                    .and_then(|c| c.delegate_sig.as_ref())
                    .map(|s| (s.params.clone(), s.ret))
                    .unwrap_or((Vec::new(), type_ids::VAR));
                let saved = self.gen.emit_call_save();
                let arg_words = self.push_args(args, &params)?;
                self.gen.emit(Opcode::CallD, &[val.reg]);
                self.gen.emit_call_restore(saved, arg_words);
                self.release(val);
                self.call_result(ret)
            }
        }
    }

    fn emit_named_call(&mut self, name: &str, args: &[Expr]) -> CResult<Val> {
        // A variable holding a delegate or task shadows functions.
        let is_var = self.find_local(name).is_some()
            || self.find_arg(name).is_some()
            || self.find_capture(name).is_some()
            || self.find_member(name).is_some()
            || self.comp.find_global(name).is_some();
        if is_var {
            let val = self.emit_ident(name)?;
            return self.emit_value_call(val, args);
        }

        let types = self.arg_types(args)?;

        // Own-class method call without an explicit object.
        if self.is_method {
            if let Some(fi) = self.find_method_in_chain(self.owner, name, Some(&types)) {
                let (member_idx, ret) = {
                    let f = &self.comp.funcs[fi];
                    (f.member_idx, f.sig.ret)
                };
                let this = Val::fixed(REG_THIS, self.owner);
                return self.emit_method_call(this, member_idx, ret, args);
            }
        }

        // Global function overloads.
        let candidates: Vec<usize> = self
            .comp
            .funcs_named(type_ids::GLOBAL, name)
            .into_iter()
            .filter(|&fi| self.comp.funcs[fi].flags & func_flags::COFUNC == 0)
            .collect();
        let exact = candidates.iter().copied().find(|&fi| {
            let p = &self.comp.funcs[fi].sig.params;
            p.len() == types.len() && p.iter().zip(&types).all(|(p, &a)| p.type_id == a)
        });
        let chosen = exact.or_else(|| {
            candidates
                .iter()
                .copied()
                .find(|&fi| self.comp.funcs[fi].sig.accepts(&types))
        });
        if let Some(fi) = chosen {
            let (func_idx, ret, params) = {
                let f = &self.comp.funcs[fi];
                (f.func_idx, f.sig.ret, f.sig.params.clone())
            };
            let saved = self.gen.emit_call_save();
            let arg_words = self.push_args(args, &params)?;
            self.gen.emit(Opcode::CallS, &[func_idx]);
            self.gen.emit_call_restore(saved, arg_words);
            return self.call_result(ret);
        }

        // Conversion call: int(x), float(x), or a convertor method of
        // the argument's class.
        if let Some(target) = self.comp.find_type(name) {
            if args.len() == 1 {
                return self.emit_conversion(target, &args[0]);
            }
        }

        Err(CompileErrorKind::NoMatchingOverload(name.to_string()))
    }

    fn emit_conversion(&mut self, target: u32, arg: &Expr) -> CResult<Val> {
        let val = self.emit_expr(arg)?;
        match (val.type_id, target) {
            (type_ids::INT, type_ids::FLOAT) => {
                let dst = self.gen.alloc_temp()?;
                self.gen.emit(Opcode::CvF, &[val.reg, dst]);
                self.release(val);
                Ok(Val {
                    reg: dst,
                    type_id: type_ids::FLOAT,
                    owned: true,
                    weak: false,
                    temp_value: true,
                })
            }
            (type_ids::FLOAT, type_ids::INT) => {
                let dst = self.gen.alloc_temp()?;
                self.gen.emit(Opcode::CvI, &[val.reg, dst]);
                self.release(val);
                Ok(Val {
                    reg: dst,
                    type_id: type_ids::INT,
                    owned: true,
                    weak: false,
                    temp_value: true,
                })
            }
            (_, type_ids::STRING) => {
                let dst = self.gen.alloc_temp()?;
                self.gen.emit(Opcode::ToStr, &[val.reg, dst]);
                self.release(val);
                Ok(Val {
                    reg: dst,
                    type_id: type_ids::STRING,
                    owned: true,
                    weak: false,
                    temp_value: true,
                })
            }
            (src, _) if src == target => Ok(val),
            (src, _) => {
                // A convertor method of the source class.
                let target_name = self.seg.type_name(target).to_string();
                let class = self
                    .comp
                    .class_of(src)
                    .ok_or(CompileErrorKind::TypeMismatch)?;
                let fi = class
                    .funcs
                    .iter()
                    .copied()
                    .find(|&fi| {
                        let f = &self.comp.funcs[fi];
                        f.flags & func_flags::CONVERTOR != 0 && f.name == target_name
                    })
                    .ok_or(CompileErrorKind::TypeMismatch)?;
                let (member_idx, ret) = {
                    let f = &self.comp.funcs[fi];
                    (f.member_idx, f.sig.ret)
                };
                self.emit_method_call(val, member_idx, ret, &[])
            }
        }
    }

    fn emit_member_call(&mut self, obj: &Expr, name: &str, args: &[Expr]) -> CResult<Val> {
        let obj_val = self.emit_expr(obj)?;
        let types = self.arg_types(args)?;
        let type_id = obj_val.type_id;

        if self.comp.is_native_type(self.seg, type_id) {
            let fi = self
                .comp
                .funcs_named(type_id, name)
                .into_iter()
                .find(|&fi| {
                    let f = &self.comp.funcs[fi];
                    f.flags & func_flags::METHOD != 0 && f.sig.accepts(&types)
                })
                .ok_or_else(|| CompileErrorKind::NoMatchingOverload(name.to_string()))?;
            let (ordinal, ret, params) = {
                let f = &self.comp.funcs[fi];
                (f.member_idx, f.sig.ret, f.sig.params.clone())
            };
            let saved = self.gen.emit_call_save();
            let arg_words = self.push_args(args, &params)?;
            // Receiver rides the stack; the VM pops it before dispatch.
            self.gen.emit(Opcode::Push, &[obj_val.reg]);
            self.gen.note_push();
            self.gen.emit(Opcode::CallN, &[type_id, ordinal]);
            self.gen.note_pop();
            self.gen.emit_call_restore(saved, arg_words);
            self.release(obj_val);
            return self.call_result(ret);
        }

        let fi = self
            .find_method_in_chain(type_id, name, Some(&types))
            .ok_or_else(|| CompileErrorKind::NoMatchingOverload(name.to_string()))?;
        let (member_idx, ret) = {
            let f = &self.comp.funcs[fi];
            (f.member_idx, f.sig.ret)
        };
        self.emit_method_call(obj_val, member_idx, ret, args)
    }

    fn emit_new(&mut self, type_name: &str, args: &[Expr]) -> CResult<Val> {
        let type_id = self
            .comp
            .find_type(type_name)
            .ok_or_else(|| CompileErrorKind::UndefinedType(type_name.to_string()))?;
        let family = self
            .comp
            .class_of(type_id)
            .map(|c| c.family)
            .ok_or_else(|| CompileErrorKind::UndefinedType(type_name.to_string()))?;

        match family {
            TypeFamily::Thread => {
                // Cofunction instantiation: arguments are consumed into
                // the new task's private stack.
                let fi = *self
                    .comp
                    .class_of(type_id)
                    .and_then(|c| c.funcs.first())
                    .ok_or_else(|| CompileErrorKind::UndefinedType(type_name.to_string()))?;
                let (func_idx, params) = {
                    let f = &self.comp.funcs[fi];
                    (f.func_idx, f.sig.params.clone())
                };
                if params.len() != args.len() {
                    return Err(CompileErrorKind::NoMatchingOverload(type_name.to_string()));
                }
                // The new task lands in the result register so the
                // caller-save restore cannot clobber it.
                let saved = self.gen.emit_call_save();
                let arg_words = self.push_args(args, &params)?;
                self.gen.emit(Opcode::AllocT, &[func_idx, REG_RESULT]);
                // AllocT consumed the arguments.
                for _ in 0..arg_words {
                    self.gen.note_pop();
                }
                self.gen.emit_call_restore(saved, 0);
                let dst = self.gen.alloc_temp()?;
                self.gen.emit(Opcode::MoveR, &[REG_RESULT, dst]);
                Ok(Val {
                    reg: dst,
                    type_id,
                    owned: true,
                    weak: false,
                    temp_value: true,
                })
            }
            TypeFamily::Class => {
                let native = self.comp.is_native_type(self.seg, type_id);
                let types = self.arg_types(args)?;
                let ctor = self
                    .comp
                    .funcs_named(type_id, type_name)
                    .into_iter()
                    .find(|&fi| {
                        let f = &self.comp.funcs[fi];
                        f.flags & func_flags::CTOR != 0 && f.sig.accepts(&types)
                    });

                let dst = self.gen.alloc_temp()?;
                if native {
                    self.gen.emit(Opcode::AllocN, &[type_id, dst]);
                } else {
                    self.gen.emit(Opcode::Alloc, &[type_id, dst]);
                }

                match ctor {
                    Some(fi) => {
                        let (member_idx, params) = {
                            let f = &self.comp.funcs[fi];
                            (f.member_idx, f.sig.params.clone())
                        };
                        let saved = self.gen.emit_call_save();
                        let arg_words = self.push_args(args, &params)?;
                        if native {
                            self.gen.emit(Opcode::Push, &[dst]);
                            self.gen.note_push();
                            self.gen.emit(Opcode::CallN, &[type_id, member_idx]);
                            self.gen.note_pop();
                        } else {
                            self.gen.emit(Opcode::CallM, &[dst, member_idx]);
                        }
                        self.gen.emit_call_restore(saved, arg_words);
                    }
                    None if args.is_empty() => {}
                    None => {
                        return Err(CompileErrorKind::NoMatchingOverload(
                            type_name.to_string(),
                        ))
                    }
                }
                Ok(Val {
                    reg: dst,
                    type_id,
                    owned: true,
                    weak: false,
                    temp_value: true,
                })
            }
            _ => Err(CompileErrorKind::NotAClass(type_name.to_string())),
        }
    }

    fn emit_unary(&mut self, op: UnOp, inner: &Expr) -> CResult<Val> {
        let val = self.emit_expr(inner)?;
        let opcode = match op {
            UnOp::Neg => {
                if !matches!(val.type_id, type_ids::INT | type_ids::FLOAT | type_ids::VAR) {
                    return Err(CompileErrorKind::TypeMismatch);
                }
                Opcode::Neg
            }
            UnOp::LNot => Opcode::LNot,
            UnOp::BNot => {
                if !matches!(val.type_id, type_ids::INT | type_ids::VAR) {
                    return Err(CompileErrorKind::TypeMismatch);
                }
                Opcode::BNot
            }
        };
        let dst = self.gen.alloc_temp()?;
        self.gen.emit(opcode, &[val.reg, dst]);
        let type_id = if op == UnOp::LNot {
            type_ids::INT
        } else {
            val.type_id
        };
        self.release(val);
        Ok(Val {
            reg: dst,
            type_id,
            owned: true,
            weak: false,
            temp_value: true,
        })
    }

    fn emit_binary(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr) -> CResult<Val> {
        if matches!(op, BinOp::LAnd | BinOp::LOr) {
            return self.emit_short_circuit(op, lhs, rhs);
        }

        // Level 2: evaluating the non-literal side first keeps literal
        // loads close to their use and frees a register earlier.
        let (lhs, rhs) = if self.comp.options.optimize >= 2
            && op.is_commutative()
            && lhs.is_literal()
            && !rhs.is_literal()
        {
            (rhs, lhs)
        } else {
            (lhs, rhs)
        };

        let mut va = self.emit_expr(lhs)?;
        let mut vb = self.emit_expr(rhs)?;

        // Numeric promotion: int operand converts when the other side
        // is float. String concatenation converts the other side.
        let string_op = matches!(op, BinOp::Add)
            && (va.type_id == type_ids::STRING || vb.type_id == type_ids::STRING);
        if string_op {
            if va.type_id != type_ids::STRING {
                va = self.to_string_val(va)?;
            }
            if vb.type_id != type_ids::STRING {
                vb = self.to_string_val(vb)?;
            }
        } else if va.type_id == type_ids::FLOAT && vb.type_id == type_ids::INT {
            vb = self.coerce(vb, type_ids::FLOAT)?;
        } else if va.type_id == type_ids::INT && vb.type_id == type_ids::FLOAT {
            va = self.coerce(va, type_ids::FLOAT)?;
        }

        let int_only = matches!(
            op,
            BinOp::BAnd | BinOp::BOr | BinOp::BXor | BinOp::Shl | BinOp::Shr
        );
        if int_only
            && !(matches!(va.type_id, type_ids::INT | type_ids::VAR)
                && matches!(vb.type_id, type_ids::INT | type_ids::VAR))
        {
            return Err(CompileErrorKind::TypeMismatch);
        }

        let (opcode, result_type) = match op {
            BinOp::Add => (Opcode::Add, va.type_id),
            BinOp::Sub => (Opcode::Sub, va.type_id),
            BinOp::Mul => (Opcode::Mul, va.type_id),
            BinOp::Div => (Opcode::Div, va.type_id),
            BinOp::Mod => (Opcode::Mod, va.type_id),
            BinOp::BAnd => (Opcode::BAnd, type_ids::INT),
            BinOp::BOr => (Opcode::BOr, type_ids::INT),
            BinOp::BXor => (Opcode::BXor, type_ids::INT),
            BinOp::Shl => (Opcode::Shl, type_ids::INT),
            BinOp::Shr => (Opcode::Shr, type_ids::INT),
            BinOp::Eq => (Opcode::CmpEq, type_ids::INT),
            BinOp::Ne => (Opcode::CmpNe, type_ids::INT),
            BinOp::Lt => (Opcode::CmpLt, type_ids::INT),
            BinOp::Le => (Opcode::CmpLe, type_ids::INT),
            BinOp::Gt => (Opcode::CmpGt, type_ids::INT),
            BinOp::Ge => (Opcode::CmpGe, type_ids::INT),
            BinOp::LAnd | BinOp::LOr => unreachable!("short-circuited above"),
        };

        let dst = self.gen.alloc_temp()?;
        self.gen.emit(opcode, &[va.reg, vb.reg, dst]);
        self.release(va);
        self.release(vb);
        Ok(Val {
            reg: dst,
            type_id: result_type,
            owned: true,
            weak: false,
            temp_value: true,
        })
    }

    fn to_string_val(&mut self, val: Val) -> CResult<Val> {
        let dst = self.gen.alloc_temp()?;
        self.gen.emit(Opcode::ToStr, &[val.reg, dst]);
        self.release(val);
        Ok(Val {
            reg: dst,
            type_id: type_ids::STRING,
            owned: true,
            weak: false,
            temp_value: true,
        })
    }

    fn emit_short_circuit(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr) -> CResult<Val> {
        let dst = self.gen.alloc_temp()?;
        let va = self.emit_expr(lhs)?;
        let first_exit = if op == BinOp::LAnd {
            self.gen.emit_branch(Opcode::BraF, Some(va.reg))
        } else {
            self.gen.emit_branch(Opcode::BraT, Some(va.reg))
        };
        self.release(va);
        let vb = self.emit_expr(rhs)?;
        let second_exit = if op == BinOp::LAnd {
            self.gen.emit_branch(Opcode::BraF, Some(vb.reg))
        } else {
            self.gen.emit_branch(Opcode::BraT, Some(vb.reg))
        };
        self.release(vb);

        // Both tests fell through.
        let through = if op == BinOp::LAnd { 1 } else { 0 };
        let idx = self.comp.literals.intern_int(self.seg, through);
        self.gen.emit(Opcode::MoveH, &[idx, dst]);
        let done = self.gen.emit_branch(Opcode::Jmp, None);

        let exit_target = self.gen.here();
        self.gen.patch_branch(first_exit, exit_target);
        self.gen.patch_branch(second_exit, exit_target);
        let idx = self.comp.literals.intern_int(self.seg, 1 - through);
        self.gen.emit(Opcode::MoveH, &[idx, dst]);

        let end = self.gen.here();
        self.gen.patch_branch(done, end);
        Ok(Val {
            reg: dst,
            type_id: type_ids::INT,
            owned: true,
            weak: false,
            temp_value: true,
        })
    }

    fn emit_ternary(&mut self, cond: &Expr, then: &Expr, otherwise: &Expr) -> CResult<Val> {
        let cv = self.emit_expr(cond)?;
        let skip = self.gen.emit_branch(Opcode::BraF, Some(cv.reg));
        self.release(cv);

        let dst = self.gen.alloc_temp()?;
        let tv = self.emit_expr(then)?;
        self.gen.emit(Opcode::MoveR, &[tv.reg, dst]);
        let t_type = tv.type_id;
        self.release(tv);
        let done = self.gen.emit_branch(Opcode::Jmp, None);

        let target = self.gen.here();
        self.gen.patch_branch(skip, target);
        let ev = self.emit_expr(otherwise)?;
        self.gen.emit(Opcode::MoveR, &[ev.reg, dst]);
        let e_type = ev.type_id;
        self.release(ev);

        let end = self.gen.here();
        self.gen.patch_branch(done, end);
        let type_id = if t_type == e_type { t_type } else { type_ids::VAR };
        Ok(Val {
            reg: dst,
            type_id,
            owned: true,
            weak: false,
            temp_value: true,
        })
    }

    fn emit_incdec(&mut self, dec: bool, post: bool, target: &Expr) -> CResult<Val> {
        let place = self.emit_place(target)?;
        if place.is_const() {
            return Err(CompileErrorKind::LValueIsConst);
        }
        let type_id = place.type_id();
        if !matches!(type_id, type_ids::INT | type_ids::FLOAT | type_ids::VAR) {
            return Err(CompileErrorKind::TypeMismatch);
        }
        let current = self.load_place(&place)?;

        let old = if post {
            let keep = self.gen.alloc_temp()?;
            self.gen.emit(Opcode::MoveR, &[current.reg, keep]);
            Some(keep)
        } else {
            None
        };

        let one = if type_id == type_ids::FLOAT {
            self.comp.literals.intern_float(self.seg, 1.0)
        } else {
            self.comp.literals.intern_int(self.seg, 1)
        };
        let one_reg = self.gen.alloc_temp()?;
        self.gen.emit(Opcode::MoveH, &[one, one_reg]);
        let dst = self.gen.alloc_temp()?;
        let opcode = if dec { Opcode::Sub } else { Opcode::Add };
        self.gen.emit(opcode, &[current.reg, one_reg, dst]);
        self.gen.free_temp(one_reg);
        self.release(current);

        let new_val = Val {
            reg: dst,
            type_id,
            owned: true,
            weak: false,
            temp_value: true,
        };
        self.store_place(&place, new_val)?;

        match old {
            Some(keep) => {
                self.gen.free_temp(dst);
                Ok(Val {
                    reg: keep,
                    type_id,
                    owned: true,
                    weak: false,
                    temp_value: true,
                })
            }
            None => Ok(new_val),
        }
    }

    fn emit_assign(&mut self, op: AssignOp, lhs: &Expr, rhs: &Expr) -> CResult<Val> {
        let place = self.emit_place(lhs)?;
        if place.is_const() {
            return Err(CompileErrorKind::LValueIsConst);
        }
        let target_type = place.type_id();

        let value = if op == AssignOp::Plain {
            let v = self.emit_expr(rhs)?;
            self.coerce(v, target_type)?
        } else {
            let bin = match op {
                AssignOp::Add => BinOp::Add,
                AssignOp::Sub => BinOp::Sub,
                AssignOp::Mul => BinOp::Mul,
                AssignOp::Div => BinOp::Div,
                AssignOp::Mod => BinOp::Mod,
                AssignOp::BAnd => BinOp::BAnd,
                AssignOp::BOr => BinOp::BOr,
                AssignOp::BXor => BinOp::BXor,
                AssignOp::Shl => BinOp::Shl,
                AssignOp::Shr => BinOp::Shr,
                AssignOp::Plain => unreachable!(),
            };
            let current = self.load_place(&place)?;
            let rv = self.emit_expr(rhs)?;
            let combined = self.emit_binary_vals(bin, current, rv)?;
            self.coerce(combined, target_type)?
        };

        if place.is_weak() {
            if value.weak {
                let span = self.stmt_span;
                self.report(CompileErrorKind::WeakFromWeak, span);
            }
            if value.temp_value {
                let span = self.stmt_span;
                self.report(CompileErrorKind::WeakFromTemporary, span);
            }
        }

        // Runtime type check when storing dynamically typed values into
        // typed slots.
        if self.comp.options.use_rtchk
            && value.type_id == type_ids::VAR
            && !matches!(target_type, type_ids::VAR | type_ids::UNDEFINED)
        {
            self.gen.emit(Opcode::RtChk, &[value.reg, target_type]);
        }

        self.store_place(&place, value)?;
        Ok(value)
    }

    /// Combine two already-emitted values. Shared by compound
    /// assignment.
    fn emit_binary_vals(&mut self, op: BinOp, va: Val, vb: Val) -> CResult<Val> {
        let (mut va, mut vb) = (va, vb);
        if va.type_id == type_ids::FLOAT && vb.type_id == type_ids::INT {
            vb = self.coerce(vb, type_ids::FLOAT)?;
        } else if va.type_id == type_ids::INT && vb.type_id == type_ids::FLOAT {
            va = self.coerce(va, type_ids::FLOAT)?;
        }
        let opcode = match op {
            BinOp::Add => Opcode::Add,
            BinOp::Sub => Opcode::Sub,
            BinOp::Mul => Opcode::Mul,
            BinOp::Div => Opcode::Div,
            BinOp::Mod => Opcode::Mod,
            BinOp::BAnd => Opcode::BAnd,
            BinOp::BOr => Opcode::BOr,
            BinOp::BXor => Opcode::BXor,
            BinOp::Shl => Opcode::Shl,
            BinOp::Shr => Opcode::Shr,
            _ => return Err(CompileErrorKind::TypeMismatch),
        };
        let dst = self.gen.alloc_temp()?;
        self.gen.emit(opcode, &[va.reg, vb.reg, dst]);
        let type_id = va.type_id;
        self.release(va);
        self.release(vb);
        Ok(Val {
            reg: dst,
            type_id,
            owned: true,
            weak: false,
            temp_value: true,
        })
    }

    /// Insert an int-to-float conversion when the target wants float,
    /// reject other mismatches.
    fn coerce(&mut self, val: Val, target: u32) -> CResult<Val> {
        if val.type_id == target
            || target == type_ids::VAR
            || target == type_ids::UNDEFINED
            || val.type_id == type_ids::VAR
            || val.type_id == type_ids::UNDEFINED
        {
            return Ok(val);
        }
        if target == type_ids::FLOAT && val.type_id == type_ids::INT {
            let dst = self.gen.alloc_temp()?;
            self.gen.emit(Opcode::CvF, &[val.reg, dst]);
            self.release(val);
            return Ok(Val {
                reg: dst,
                type_id: type_ids::FLOAT,
                owned: true,
                weak: false,
                temp_value: true,
            });
        }
        // Subtype: a class value assigns to its base interface or
        // hybrid base.
        let mut probe = val.type_id;
        while probe != 0 {
            if probe == target {
                return Ok(val);
            }
            probe = self
                .comp
                .class_of(probe)
                .map(|c| if c.base_id != 0 { c.base_id } else { c.hybrid_id })
                .unwrap_or(0);
        }
        Err(CompileErrorKind::TypeMismatch)
    }

    // ===== Places =====

    fn emit_place(&mut self, tree: &Expr) -> CResult<Place> {
        match tree {
            Expr::Ident(name) => {
                if let Some(local) = self.find_local(name) {
                    let (type_id, is_const, is_weak, loc) =
                        (local.type_id, local.is_const, local.is_weak, local.loc);
                    return Ok(match loc {
                        VarLoc::Reg(reg) => Place::Reg {
                            reg,
                            type_id,
                            is_const,
                            is_weak,
                        },
                        VarLoc::Stack(slot) => Place::Stack {
                            slot,
                            type_id,
                            is_const,
                            is_weak,
                        },
                    });
                }
                if let Some((idx, type_id, is_const)) = self.find_arg(name) {
                    return Ok(Place::Arg {
                        idx,
                        type_id,
                        is_const,
                    });
                }
                if let Some((slot, type_id, is_const, is_weak)) = self.find_member(name) {
                    return Ok(Place::Member {
                        obj: Val::fixed(REG_THIS, self.owner),
                        slot,
                        type_id,
                        is_const,
                        is_weak,
                    });
                }
                if let Some(global) = self.comp.find_global(name) {
                    return Ok(Place::Global {
                        slot: global.slot,
                        type_id: global.type_id,
                        is_const: global.is_const,
                        is_weak: global.is_weak,
                    });
                }
                Err(CompileErrorKind::UndefinedIdentifier(name.to_string()))
            }
            Expr::Member(obj, name) => {
                let obj_val = self.emit_expr(obj)?;
                let class = self
                    .comp
                    .class_of(obj_val.type_id)
                    .ok_or(CompileErrorKind::NeedObject)?;
                let inside_own = self.is_method && obj_val.type_id == self.owner;
                if let Some(var) = class.find_var(name) {
                    if !var.is_private || inside_own {
                        return Ok(Place::Member {
                            obj: obj_val,
                            slot: var.slot,
                            type_id: var.type_id,
                            is_const: var.is_const,
                            is_weak: var.is_weak,
                        });
                    }
                }
                if let Some(fi) = self.find_accessor(obj_val.type_id, name, false) {
                    let f = &self.comp.funcs[fi];
                    return Ok(Place::Accessor {
                        obj: obj_val,
                        member_idx: f.member_idx,
                        type_id: f.sig.params[0].type_id,
                    });
                }
                if class.find_var(name).is_some() {
                    return Err(CompileErrorKind::PrivateMember(name.to_string()));
                }
                Err(CompileErrorKind::NoSuitableAccessor(name.to_string()))
            }
            _ => Err(CompileErrorKind::NotAnLValue),
        }
    }

    fn load_place(&mut self, place: &Place) -> CResult<Val> {
        match place {
            Place::Reg { reg, type_id, .. } => Ok(Val::fixed(*reg, *type_id)),
            Place::Stack { slot, type_id, .. } => {
                let reg = self.gen.alloc_temp()?;
                let disp = self.gen.local_disp(*slot);
                self.gen.emit(Opcode::MoveSR, &[disp, reg]);
                Ok(Val {
                    reg,
                    type_id: *type_id,
                    owned: true,
                    weak: false,
                    temp_value: false,
                })
            }
            Place::Arg { idx, type_id, .. } => {
                let reg = self.gen.alloc_temp()?;
                let disp = self.gen.arg_disp(*idx);
                self.gen.emit(Opcode::MoveSR, &[disp, reg]);
                Ok(Val {
                    reg,
                    type_id: *type_id,
                    owned: true,
                    weak: false,
                    temp_value: false,
                })
            }
            Place::Member { obj, slot, type_id, .. } => {
                let reg = self.gen.alloc_temp()?;
                self.gen.emit(Opcode::MoveMR, &[obj.reg, *slot, reg]);
                Ok(Val {
                    reg,
                    type_id: *type_id,
                    owned: true,
                    weak: false,
                    temp_value: false,
                })
            }
            Place::Global { slot, type_id, .. } => {
                let reg = self.gen.alloc_temp()?;
                self.gen.emit(Opcode::MoveMR, &[REG_GLOBALS, *slot, reg]);
                Ok(Val {
                    reg,
                    type_id: *type_id,
                    owned: true,
                    weak: false,
                    temp_value: false,
                })
            }
            Place::Accessor { .. } => Err(CompileErrorKind::NotAnLValue),
        }
    }

    fn store_place(&mut self, place: &Place, value: Val) -> CResult<()> {
        match place {
            Place::Reg { reg, is_weak, .. } => {
                let op = if *is_weak { Opcode::WRef } else { Opcode::MoveR };
                self.gen.emit(op, &[value.reg, *reg]);
            }
            Place::Stack { slot, .. } => {
                let disp = self.gen.local_disp(*slot);
                self.gen.emit(Opcode::MoveRS, &[value.reg, disp]);
            }
            Place::Arg { idx, .. } => {
                let disp = self.gen.arg_disp(*idx);
                self.gen.emit(Opcode::MoveRS, &[value.reg, disp]);
            }
            Place::Member { obj, slot, .. } => {
                self.gen.emit(Opcode::MoveRM, &[value.reg, obj.reg, *slot]);
                let obj = *obj;
                self.release(obj);
            }
            Place::Global { slot, .. } => {
                self.gen
                    .emit(Opcode::MoveRM, &[value.reg, REG_GLOBALS, *slot]);
            }
            Place::Accessor {
                obj, member_idx, ..
            } => {
                let saved = self.gen.emit_call_save();
                self.gen.emit(Opcode::Push, &[value.reg]);
                self.gen.note_push();
                self.gen.emit(Opcode::CallM, &[obj.reg, *member_idx]);
                self.gen.emit_call_restore(saved, 1);
                let obj = *obj;
                self.release(obj);
            }
        }
        Ok(())
    }

    // ===== Lambdas =====

    fn emit_lambda(&mut self, lambda: &crate::expr::LambdaExpr) -> CResult<Val> {
        // Discover captures: identifiers that resolve to enclosing
        // locals, arguments or captures and are not lambda parameters.
        let mut names = Vec::new();
        match &lambda.body {
            LambdaBody::Expr(body) => body.collect_idents(&mut names),
            LambdaBody::Block { start } => {
                let mark = self.ts.tell();
                self.ts.seek(*start);
                collect_block_idents(self.ts, &mut names);
                self.ts.seek(mark);
            }
        }

        let mut captures = Vec::new();
        let mut sources = Vec::new();
        for name in names {
            if lambda.params.iter().any(|p| p.name == name) {
                continue;
            }
            let binding = if let Some(local) = self.find_local(&name) {
                Some((local.type_id, local.is_weak, CaptureSource::Loc(local.loc)))
            } else if let Some((idx, type_id, _)) = self.find_arg(&name) {
                Some((type_id, false, CaptureSource::Arg(idx)))
            } else if let Some((idx, type_id, is_weak)) = self.find_capture(&name) {
                Some((type_id, is_weak, CaptureSource::Capture(idx)))
            } else {
                None
            };
            if let Some((type_id, is_weak, source)) = binding {
                captures.push(CaptureBinding {
                    name,
                    type_id,
                    is_weak,
                });
                sources.push(source);
            }
        }

        // Register the anonymous function.
        let lambda_name = format!("__lambda#{}", self.comp.funcs.len());
        let name_offs = self.seg.cstr.add(&lambda_name);
        let func_idx = self.seg.add_function(beryl_bytecode::segment::FuncInfo {
            type_id: type_ids::GLOBAL,
            flags: func_flags::ANONYMOUS,
            arg_count: lambda.params.len() as u32,
            member_idx: beryl_bytecode::segment::NO_METHOD,
            name_offs,
            ..Default::default()
        });
        let cfunc = self.comp.funcs.len();
        let sig = crate::model::Signature {
            params: lambda.params.clone(),
            ret: type_ids::VAR,
            ret_weak: false,
        };
        self.comp.funcs.push(crate::model::CFunc {
            name: lambda_name,
            func_idx,
            owner: type_ids::GLOBAL,
            flags: func_flags::ANONYMOUS,
            sig: sig.clone(),
            member_idx: beryl_bytecode::segment::NO_METHOD,
            unit: self.comp.funcs[self.fi].unit,
            body_tok: None,
            code: Vec::new(),
            capture_count: captures.len() as u32,
        });

        // Push the captured handles, then build the closure.
        for source in &sources {
            match source {
                CaptureSource::Loc(VarLoc::Reg(reg)) => {
                    self.gen.emit(Opcode::Push, &[*reg]);
                    self.gen.note_push();
                }
                CaptureSource::Loc(VarLoc::Stack(slot)) => {
                    let tmp = self.gen.alloc_temp()?;
                    let disp = self.gen.local_disp(*slot);
                    self.gen.emit(Opcode::MoveSR, &[disp, tmp]);
                    self.gen.emit(Opcode::Push, &[tmp]);
                    self.gen.note_push();
                    self.gen.free_temp(tmp);
                }
                CaptureSource::Arg(idx) => {
                    let tmp = self.gen.alloc_temp()?;
                    let disp = self.gen.arg_disp(*idx);
                    self.gen.emit(Opcode::MoveSR, &[disp, tmp]);
                    self.gen.emit(Opcode::Push, &[tmp]);
                    self.gen.note_push();
                    self.gen.free_temp(tmp);
                }
                CaptureSource::Capture(idx) => {
                    let tmp = self.gen.alloc_temp()?;
                    let disp = self.gen.capture_disp(*idx);
                    self.gen.emit(Opcode::MoveSR, &[disp, tmp]);
                    self.gen.emit(Opcode::Push, &[tmp]);
                    self.gen.note_push();
                    self.gen.free_temp(tmp);
                }
            }
        }
        let dst = self.gen.alloc_temp()?;
        self.gen
            .emit(Opcode::AllocC, &[func_idx, captures.len() as u32, dst]);
        for _ in 0..captures.len() {
            self.gen.note_pop();
        }

        // Queue the body for compilation after this function. The
        // enclosing tree is borrowed, so the body is deep-copied into
        // the queue.
        let body = match &lambda.body {
            LambdaBody::Block { start } => LambdaBody::Block { start: *start },
            LambdaBody::Expr(e) => LambdaBody::Expr(Box::new(clone_expr(e))),
        };
        self.comp.pending_lambdas.push(PendingLambda {
            cfunc,
            captures,
            body,
            unit: self.comp.funcs[self.fi].unit,
        });

        Ok(Val {
            reg: dst,
            type_id: self.delegate_type_for(&sig),
            owned: true,
            weak: false,
            temp_value: true,
        })
    }
}

enum CaptureSource {
    Loc(VarLoc),
    Arg(u32),
    Capture(u32),
}

/// Collect identifier tokens inside a balanced block, in order of first
/// appearance. Over-collection is harmless: a name that turns out not
/// to be a capture simply never resolves to one.
fn collect_block_idents(ts: &mut TokenStream, out: &mut Vec<String>) {
    debug_assert_eq!(ts.peek(), &Token::LBrace);
    let mut depth = 0i32;
    loop {
        match ts.next() {
            Token::LBrace => depth += 1,
            Token::RBrace => {
                depth -= 1;
                if depth == 0 {
                    return;
                }
            }
            Token::Ident(name) => {
                if !out.contains(&name) {
                    out.push(name);
                }
            }
            Token::Eof => return,
            _ => {}
        }
    }
}

/// Deep-copy an expression tree. Lambda bodies move through the pending
/// queue while the enclosing tree is still borrowed.
fn clone_expr(expr: &Expr) -> Expr {
    use Expr::*;
    match expr {
        IntLit(v) => IntLit(*v),
        FloatLit(v) => FloatLit(*v),
        StrLit(s) => StrLit(s.clone()),
        Null => Null,
        This => This,
        Ident(s) => Ident(s.clone()),
        Member(o, n) => Member(Box::new(clone_expr(o)), n.clone()),
        Call { callee, args } => Call {
            callee: match callee {
                Callee::Name(n) => Callee::Name(n.clone()),
                Callee::Scoped(a, b) => Callee::Scoped(a.clone(), b.clone()),
                Callee::Member(o, n) => Callee::Member(Box::new(clone_expr(o)), n.clone()),
                Callee::Expr(e) => Callee::Expr(Box::new(clone_expr(e))),
            },
            args: args.iter().map(clone_expr).collect(),
        },
        New { type_name, args } => New {
            type_name: type_name.clone(),
            args: args.iter().map(clone_expr).collect(),
        },
        Unary(op, e) => Unary(*op, Box::new(clone_expr(e))),
        Binary(op, a, b) => Binary(*op, Box::new(clone_expr(a)), Box::new(clone_expr(b))),
        Assign(op, a, b) => Assign(*op, Box::new(clone_expr(a)), Box::new(clone_expr(b))),
        IncDec { dec, post, target } => IncDec {
            dec: *dec,
            post: *post,
            target: Box::new(clone_expr(target)),
        },
        Ternary(c, t, e) => Ternary(
            Box::new(clone_expr(c)),
            Box::new(clone_expr(t)),
            Box::new(clone_expr(e)),
        ),
        TypeOf(e) => TypeOf(Box::new(clone_expr(e))),
        SameRef(a, b) => SameRef(Box::new(clone_expr(a)), Box::new(clone_expr(b))),
        Lambda(l) => Lambda(crate::expr::LambdaExpr {
            params: l.params.clone(),
            ret: l.ret,
            body: match &l.body {
                LambdaBody::Block { start } => LambdaBody::Block { start: *start },
                LambdaBody::Expr(e) => LambdaBody::Expr(Box::new(clone_expr(e))),
            },
        }),
    }
}

/// Entry point for a whole function body: the `{` is the current token.
fn compile_block(ctx: &mut Ctx) -> CResult<bool> {
    ctx.compile_stmt()
}

/// A cheap probing clone of the stream position for declaration
/// lookahead.
fn probe_stream(ts: &TokenStream) -> TokenStream {
    // Only the type-name position matters; two tokens are enough.
    TokenStream::new(vec![
        (ts.peek().clone(), Span::default()),
        (Token::Eof, Span::default()),
    ])
}
