//! The dispatch loop.
//!
//! A tight decoded switch over the instruction table. Execution state
//! lives in the machine's current context; cofunction resume swaps the
//! whole context and a resume stack remembers who to hand control back
//! to. Returning through a frame pushed by the call bridge exits the
//! loop.

use beryl_bytecode::opcode::Opcode;
use beryl_bytecode::segment::{func_flags, NO_METHOD, UNRESOLVED};
use beryl_bytecode::{type_ids, REG_RESULT, REG_THIS};

use crate::context::{Context, Frame, ResumeFrame, RETURN_TO_NATIVE};
use crate::error::{VmError, Vector};
use crate::handle::{DelegateData, HandleId, ObjectData, Payload, TaskData};
use crate::machine::Machine;

/// How an execution run ended.
#[derive(Debug)]
pub(crate) enum ExecOutcome {
    /// Control returned through a native-bridge frame.
    Returned,
    /// A software exception unwound out; the handle carries one owned
    /// reference.
    Thrown(HandleId),
}

/// Scalar operand snapshot used by the arithmetic helpers.
enum Num {
    I(i64),
    F(f64),
    S(String),
}

impl Machine {
    #[inline]
    fn reg(&self, r: u32) -> HandleId {
        self.cur.registers[r as usize]
    }

    /// Store an owned reference into a register, releasing the old
    /// occupant.
    fn set_reg(&mut self, r: u32, id: HandleId) {
        let old = self.cur.registers[r as usize];
        self.cur.registers[r as usize] = id;
        self.release_id(old);
    }

    /// Store a shared reference into a register.
    fn set_reg_shared(&mut self, r: u32, id: HandleId) {
        self.handles.add_ref(id);
        self.set_reg(r, id);
    }

    fn truthy(&self, id: HandleId) -> bool {
        match self.handles.get(id).map(|h| &h.payload) {
            None | Some(Payload::Null) => false,
            Some(Payload::Int(v)) => *v != 0,
            Some(Payload::Float(v)) => *v != 0.0,
            _ => true,
        }
    }

    fn push_data(&mut self, id: HandleId) -> Result<(), VmError> {
        if self.cur.data_stack.len() >= self.data_stack_max {
            return Err(self.machine_error(VmError::StackOverflow));
        }
        self.cur.data_stack.push(id);
        Ok(())
    }

    fn pop_data(&mut self) -> Result<HandleId, VmError> {
        match self.cur.data_stack.pop() {
            Some(id) => Ok(id),
            None => Err(self.machine_error(VmError::InvalidOperand)),
        }
    }

    /// Push a call frame, saving the caller's `this` and installing the
    /// callee's. Checks for call-stack overflow first.
    fn push_frame(&mut self, ret_pc: u32, new_this: HandleId) -> Result<(), VmError> {
        if self.cur.call_stack.len() >= self.call_stack_max {
            return Err(self.machine_error(VmError::StackOverflow));
        }
        let saved = self.cur.registers[REG_THIS as usize];
        self.cur.call_stack.push(Frame { ret_pc, this: saved });
        self.handles.add_ref(new_this);
        self.cur.registers[REG_THIS as usize] = new_this;
        Ok(())
    }

    /// Invoke a function at a code address with pre-built owned
    /// argument handles, running the dispatch loop to completion.
    ///
    /// The whole register file is saved and restored around the call so
    /// a host-driven invocation leaves no residue in the current
    /// context.
    pub(crate) fn invoke_at(
        &mut self,
        code_addr: u32,
        args: Vec<HandleId>,
        this: HandleId,
    ) -> Result<crate::machine::CallOutcome, VmError> {
        use crate::machine::CallOutcome;

        let entry_data = self.cur.data_stack.len();
        let entry_calls = self.cur.call_stack.len();
        let saved_regs = self.cur.registers;
        for &id in saved_regs.iter() {
            self.handles.add_ref(id);
        }

        let finish = |m: &mut Machine| {
            m.unwind_to(entry_data, entry_calls);
            for (r, &id) in saved_regs.iter().enumerate() {
                let old = std::mem::replace(&mut m.cur.registers[r], id);
                m.release_id(old);
            }
        };

        let fail = |m: &mut Machine, err: VmError| {
            finish(m);
            Err(err)
        };

        for id in args {
            if let Err(err) = self.push_data(id) {
                return fail(self, err);
            }
        }
        if let Err(err) = self.push_frame(RETURN_TO_NATIVE, this) {
            return fail(self, err);
        }
        let saved_pc = self.cur.pc;
        self.cur.pc = code_addr;

        let result = self.exec();
        self.cur.pc = saved_pc;
        match result {
            Ok(ExecOutcome::Returned) => {
                let ret = self.cur.registers[REG_RESULT as usize];
                self.handles.add_ref(ret);
                finish(self);
                Ok(CallOutcome::Return(beryl_sdk::HandleRef(ret)))
            }
            Ok(ExecOutcome::Thrown(exception)) => {
                finish(self);
                Ok(CallOutcome::Exception(beryl_sdk::HandleRef(exception)))
            }
            Err(err) => fail(self, err),
        }
    }

    /// Discard stack growth above the entry marks, restoring `this`
    /// through each abandoned frame.
    fn unwind_to(&mut self, data_len: usize, call_len: usize) {
        while self.cur.call_stack.len() > call_len {
            let frame = self.cur.call_stack.pop().unwrap();
            let old = self.cur.registers[REG_THIS as usize];
            self.cur.registers[REG_THIS as usize] = frame.this;
            self.release_id(old);
        }
        while self.cur.data_stack.len() > data_len {
            let id = self.cur.data_stack.pop().unwrap();
            self.release_id(id);
        }
    }

    /// The decoded dispatch loop. Returns when control passes back
    /// through a native-bridge frame or an exception unwinds out.
    pub(crate) fn exec(&mut self) -> Result<ExecOutcome, VmError> {
        let floor = self.resume_stack.len();
        self.exec_with_floor(floor)
    }

    /// The dispatch loop with an explicit resume floor; the bridge uses
    /// a lowered floor when it starts execution inside a task.
    pub(crate) fn exec_with_floor(&mut self, resume_floor: usize) -> Result<ExecOutcome, VmError> {
        let result = self.exec_inner(resume_floor);
        if result.is_err() || matches!(result, Ok(ExecOutcome::Thrown(_))) {
            // An exception inside a cofunction unwinds through every
            // resume entered by this run; the tasks are dead.
            while self.resume_stack.len() > resume_floor {
                let frame = self.resume_stack.pop().unwrap();
                let task_ctx = std::mem::replace(&mut self.cur, frame.caller);
                self.park_task(frame.task_id, frame.func_idx, task_ctx, true);
            }
        }
        result
    }

    fn exec_inner(&mut self, resume_floor: usize) -> Result<ExecOutcome, VmError> {
        loop {
            if self.trace_enabled {
                self.raise(Vector::Trace, VmError::Trace, 0);
            }
            self.instr_count += 1;
            if self.gc_interval > 0 && self.instr_count % self.gc_interval == 0 {
                self.gc_collect();
            }

            let pc = self.cur.pc as usize;
            if pc >= self.segments.code.len() {
                return Err(self.machine_error(VmError::InvalidCodeAddress));
            }
            let op = match Opcode::from_u32(self.segments.code[pc]) {
                Some(op) => op,
                None => return Err(self.machine_error(VmError::IllegalInstruction)),
            };
            let words = op.word_count();
            if pc + words > self.segments.code.len() {
                return Err(self.machine_error(VmError::InvalidCodeAddress));
            }
            // Operand snapshot; instructions carry at most three.
            let w1 = if words > 1 { self.segments.code[pc + 1] } else { 0 };
            let w2 = if words > 2 { self.segments.code[pc + 2] } else { 0 };
            let w3 = if words > 3 { self.segments.code[pc + 3] } else { 0 };
            let mut next_pc = (pc + words) as u32;

            match op {
                Opcode::Nop => {}

                // ===== Data movement =====
                Opcode::MoveH => {
                    let found = self.data_handles.get(w1 as usize).copied();
                    let id = match found {
                        Some(id) => id,
                        None => return Err(self.machine_error(VmError::InvalidOperand)),
                    };
                    self.set_reg_shared(w2, id);
                }
                Opcode::MoveR => {
                    let id = self.reg(w1);
                    self.set_reg_shared(w2, id);
                }
                Opcode::CopyR => {
                    let id = self.reg(w1);
                    let copy = self.deep_copy(id)?;
                    self.set_reg(w2, copy);
                }
                Opcode::MoveRS => {
                    let id = self.reg(w1);
                    let slot = self.stack_slot(w2)?;
                    self.handles.add_ref(id);
                    let old = std::mem::replace(&mut self.cur.data_stack[slot], id);
                    self.release_id(old);
                }
                Opcode::MoveSR => {
                    let slot = self.stack_slot(w1)?;
                    let id = self.cur.data_stack[slot];
                    self.set_reg_shared(w2, id);
                }
                Opcode::MoveMR => {
                    let id = self.member_read(self.reg(w1), w2)?;
                    self.set_reg_shared(w3, id);
                }
                Opcode::MoveRM => {
                    let src = self.reg(w1);
                    self.member_write(self.reg(w2), w3, src)?;
                }
                Opcode::MoveXR => {
                    let slot = self.int_of(self.reg(w2))? as u32;
                    let id = self.member_read(self.reg(w1), slot)?;
                    self.set_reg_shared(w3, id);
                }
                Opcode::MoveRX => {
                    let src = self.reg(w1);
                    let slot = self.int_of(self.reg(w3))? as u32;
                    self.member_write(self.reg(w2), slot, src)?;
                }

                // ===== Stack =====
                Opcode::Push => {
                    let id = self.reg(w1);
                    self.handles.add_ref(id);
                    self.push_data(id)?;
                }
                Opcode::Pop => {
                    let id = self.pop_data()?;
                    self.set_reg(w1, id);
                }
                Opcode::PushR => {
                    for r in w1..w1 + w2 {
                        let id = self.cur.registers[r as usize];
                        self.handles.add_ref(id);
                        self.push_data(id)?;
                    }
                }
                Opcode::PopR => {
                    for r in (w1..w1 + w2).rev() {
                        let id = self.pop_data()?;
                        let old = std::mem::replace(&mut self.cur.registers[r as usize], id);
                        self.release_id(old);
                    }
                }
                Opcode::PushZ => {
                    for _ in 0..w1 {
                        self.push_data(0)?;
                    }
                }
                Opcode::PopZ => {
                    for _ in 0..w1 {
                        let id = self.pop_data()?;
                        self.release_id(id);
                    }
                }

                // ===== Arithmetic =====
                Opcode::Add
                | Opcode::Sub
                | Opcode::Mul
                | Opcode::Div
                | Opcode::Mod
                | Opcode::BAnd
                | Opcode::BOr
                | Opcode::BXor
                | Opcode::Shl
                | Opcode::Shr => {
                    let result = self.arith(op, self.reg(w1), self.reg(w2))?;
                    self.set_reg(w3, result);
                }
                Opcode::Neg => {
                    let result = match self.num_of(self.reg(w1))? {
                        Num::I(v) => self.alloc_int(v.wrapping_neg()),
                        Num::F(v) => self.alloc_float(-v),
                        Num::S(_) => return Err(self.machine_error(VmError::UnsupportedType)),
                    };
                    self.set_reg(w2, result);
                }
                Opcode::LNot => {
                    let value = !self.truthy(self.reg(w1));
                    let result = self.alloc_int(value as i64);
                    self.set_reg(w2, result);
                }
                Opcode::BNot => {
                    let v = self.int_of(self.reg(w1))?;
                    let result = self.alloc_int(!v);
                    self.set_reg(w2, result);
                }

                // ===== Comparison =====
                Opcode::CmpEq
                | Opcode::CmpNe
                | Opcode::CmpLt
                | Opcode::CmpLe
                | Opcode::CmpGt
                | Opcode::CmpGe => {
                    let value = self.compare(op, self.reg(w1), self.reg(w2))?;
                    let result = self.alloc_int(value as i64);
                    self.set_reg(w3, result);
                }
                Opcode::SameRef => {
                    let same = self.reg(w1) == self.reg(w2);
                    let result = self.alloc_int(same as i64);
                    self.set_reg(w3, result);
                }

                // ===== Control flow =====
                Opcode::Jmp => {
                    next_pc = (pc as i64 + w1 as i32 as i64) as u32;
                }
                Opcode::BraT => {
                    if self.truthy(self.reg(w1)) {
                        next_pc = (pc as i64 + w2 as i32 as i64) as u32;
                    }
                }
                Opcode::BraF => {
                    if !self.truthy(self.reg(w1)) {
                        next_pc = (pc as i64 + w2 as i32 as i64) as u32;
                    }
                }
                Opcode::CallS => {
                    // The linker rewrites every calls; a survivor means
                    // unlinked code.
                    return Err(self.machine_error(VmError::CallToNonFunction));
                }
                Opcode::Jsr => {
                    let this = self.cur.registers[REG_THIS as usize];
                    self.push_frame(next_pc, this)?;
                    next_pc = w1;
                }
                Opcode::CallM => {
                    let obj = self.reg(w1);
                    let found = self.handles.get(obj).map(|h| h.type_id);
                    let type_id = match found {
                        Some(t) if obj != 0 => t,
                        _ => return Err(self.machine_error(VmError::NullReference)),
                    };
                    let native = self.segments.types[type_id as usize].is_native();
                    if native {
                        self.native_call(type_id, w2, Some(obj))?;
                    } else {
                        let slot = self.segments.types[type_id as usize]
                            .vtable
                            .get(w2 as usize)
                            .copied();
                        let func_idx = match slot {
                            Some(idx) if idx != UNRESOLVED => idx,
                            _ => return Err(self.machine_error(VmError::CallToNonFunction)),
                        };
                        let placed = self
                            .segments
                            .functions
                            .get(func_idx as usize)
                            .filter(|f| f.has_body())
                            .map(|f| f.code_addr);
                        let addr = match placed {
                            Some(addr) => addr,
                            None => {
                                return Err(self.machine_error(VmError::InvalidCodeAddress))
                            }
                        };
                        self.push_frame(next_pc, obj)?;
                        next_pc = addr;
                    }
                }
                Opcode::CallN => {
                    let found = self
                        .find_native_func(w1, w2)
                        .map(|f| f.flags & func_flags::METHOD != 0);
                    let is_method = match found {
                        Some(m) => m,
                        None => return Err(self.machine_error(VmError::CallToNonFunction)),
                    };
                    let obj = if is_method {
                        let id = self.pop_data()?;
                        if id == 0 {
                            return Err(self.machine_error(VmError::NullReference));
                        }
                        Some(id)
                    } else {
                        None
                    };
                    let result = self.native_call(w1, w2, obj);
                    if let Some(id) = obj {
                        self.release_id(id);
                    }
                    result?;
                }
                Opcode::CallD => {
                    let id = self.reg(w1);
                    let snapshot = match self.handles.get(id).map(|h| &h.payload) {
                        Some(Payload::Delegate(d)) => Some((
                            d.target,
                            d.is_method,
                            d.bound,
                            d.env.clone(),
                        )),
                        _ => None,
                    };
                    let (target, is_method, bound, env) = match snapshot {
                        Some(s) => s,
                        None => return Err(self.machine_error(VmError::CallToNonFunction)),
                    };
                    let func_idx = if is_method {
                        let found = self.handles.get(bound).map(|h| h.type_id);
                        let bound_type = match found {
                            Some(t) => t,
                            None => return Err(self.machine_error(VmError::NullReference)),
                        };
                        let slot = self.segments.types[bound_type as usize]
                            .vtable
                            .get(target as usize)
                            .copied();
                        match slot {
                            Some(s) if s != UNRESOLVED => s,
                            _ => return Err(self.machine_error(VmError::CallToNonFunction)),
                        }
                    } else {
                        target
                    };
                    let placed = self
                        .segments
                        .functions
                        .get(func_idx as usize)
                        .filter(|f| f.has_body())
                        .map(|f| f.code_addr);
                    let addr = match placed {
                        Some(addr) => addr,
                        None => return Err(self.machine_error(VmError::InvalidCodeAddress)),
                    };
                    // Closure environment rides the data stack below
                    // the callee's locals.
                    for &cap in &env {
                        self.handles.add_ref(cap);
                        self.push_data(cap)?;
                    }
                    let this = if bound != 0 {
                        bound
                    } else {
                        self.cur.registers[REG_THIS as usize]
                    };
                    self.push_frame(next_pc, this)?;
                    next_pc = addr;
                }
                Opcode::Ret => {
                    match self.cur.call_stack.pop() {
                        Some(frame) => {
                            let old = self.cur.registers[REG_THIS as usize];
                            self.cur.registers[REG_THIS as usize] = frame.this;
                            self.release_id(old);
                            if frame.ret_pc == RETURN_TO_NATIVE {
                                return Ok(ExecOutcome::Returned);
                            }
                            next_pc = frame.ret_pc;
                        }
                        None => {
                            // Top of a cofunction body: the task is
                            // exhausted.
                            if self.resume_stack.len() > resume_floor {
                                let frame = self.resume_stack.pop().unwrap();
                                let task_ctx =
                                    std::mem::replace(&mut self.cur, frame.caller);
                                self.park_task(frame.task_id, frame.func_idx, task_ctx, true);
                                return self.software_exception("cofunction exhausted");
                            }
                            return Ok(ExecOutcome::Returned);
                        }
                    }
                }

                // ===== Cofunctions =====
                Opcode::Yield => {
                    if self.resume_stack.len() <= resume_floor {
                        return Err(self.machine_error(VmError::IllegalInstruction));
                    }
                    let value = self.reg(w1);
                    self.handles.add_ref(value);
                    self.cur.pc = next_pc;
                    let frame = self.resume_stack.pop().unwrap();
                    let task_ctx = std::mem::replace(&mut self.cur, frame.caller);
                    self.park_task(frame.task_id, frame.func_idx, task_ctx, false);
                    self.set_reg(frame.dst_reg, value);
                    if frame.host {
                        return Ok(ExecOutcome::Returned);
                    }
                    next_pc = self.cur.pc;
                }
                Opcode::Resume => {
                    let task_id = self.reg(w1);
                    if self.handles.get(task_id).is_none() {
                        return Err(self.machine_error(VmError::NullReference));
                    }
                    let is_task = matches!(
                        self.handles.get(task_id).map(|h| &h.payload),
                        Some(Payload::Task(_))
                    );
                    if !is_task {
                        return Err(self.machine_error(VmError::UnsupportedType));
                    }
                    let taken = match std::mem::replace(
                        &mut self.handles.get_mut(task_id).unwrap().payload,
                        Payload::Null,
                    ) {
                        Payload::Task(t) => *t,
                        _ => unreachable!("checked above"),
                    };
                    if taken.done {
                        let func_idx = taken.func_idx;
                        let ctx = taken.ctx;
                        self.park_task(task_id, func_idx, ctx, true);
                        return self.software_exception("cofunction exhausted");
                    }
                    // Context switch: the caller context parks in the
                    // resume stack, the task context becomes current.
                    self.cur.pc = next_pc;
                    let caller = std::mem::replace(&mut self.cur, taken.ctx);
                    self.resume_stack.push(ResumeFrame {
                        task_id,
                        func_idx: taken.func_idx,
                        dst_reg: w2,
                        caller,
                        host: false,
                    });
                    next_pc = self.cur.pc;
                }

                // ===== Allocation =====
                Opcode::Alloc => {
                    let found = self.segments.types.get(w1 as usize).map(|t| t.instance_size);
                    let size = match found {
                        Some(size) => size,
                        None => return Err(self.machine_error(VmError::InvalidOperand)),
                    };
                    let block = self.fixmem.alloc_words(size.max(1) as usize);
                    let id = self
                        .handles
                        .alloc(w1, Payload::Object(ObjectData { block, count: size }));
                    self.set_reg(w2, id);
                }
                Opcode::AllocN => {
                    let id = self.native_new_object(w1)?;
                    self.set_reg(w2, id);
                }
                Opcode::AllocDG => {
                    let id = self.handles.alloc(
                        type_ids::VAR,
                        Payload::Delegate(DelegateData {
                            target: w1,
                            is_method: false,
                            bound: 0,
                            env: Vec::new(),
                        }),
                    );
                    self.set_reg(w2, id);
                }
                Opcode::AllocDM => {
                    let bound = self.reg(w2);
                    if bound == 0 {
                        return Err(self.machine_error(VmError::NullReference));
                    }
                    self.handles.add_ref(bound);
                    let id = self.handles.alloc(
                        type_ids::VAR,
                        Payload::Delegate(DelegateData {
                            target: w1,
                            is_method: true,
                            bound,
                            env: Vec::new(),
                        }),
                    );
                    self.set_reg(w3, id);
                }
                Opcode::AllocC => {
                    let count = w2 as usize;
                    if self.cur.data_stack.len() < count {
                        return Err(self.machine_error(VmError::InvalidOperand));
                    }
                    let at = self.cur.data_stack.len() - count;
                    // Ownership of the popped references transfers to
                    // the closure environment.
                    let env: Vec<HandleId> = self.cur.data_stack.split_off(at);
                    let id = self.handles.alloc(
                        type_ids::VAR,
                        Payload::Delegate(DelegateData {
                            target: w1,
                            is_method: false,
                            bound: 0,
                            env,
                        }),
                    );
                    self.set_reg(w3, id);
                }
                Opcode::AllocT => {
                    let info = self
                        .segments
                        .functions
                        .get(w1 as usize)
                        .filter(|f| f.has_body())
                        .map(|f| (f.arg_count as usize, f.code_addr));
                    let (argc, addr) = match info {
                        Some(pair) => pair,
                        None => return Err(self.machine_error(VmError::InvalidCodeAddress)),
                    };
                    if self.cur.data_stack.len() < argc {
                        return Err(self.machine_error(VmError::InvalidOperand));
                    }
                    let at = self.cur.data_stack.len() - argc;
                    let args = self.cur.data_stack.split_off(at);
                    let mut ctx = Context::new();
                    ctx.data_stack = args;
                    ctx.pc = addr;
                    // Tasks see the same global object in register 2.
                    ctx.registers[beryl_bytecode::REG_GLOBALS as usize] = self.globals;
                    self.handles.add_ref(self.globals);
                    let id = self.handles.alloc(
                        type_ids::TASK,
                        Payload::Task(Box::new(TaskData {
                            func_idx: w1,
                            ctx,
                            done: false,
                        })),
                    );
                    self.set_reg(w2, id);
                }

                // ===== Exceptions and type operations =====
                Opcode::Throw => {
                    let id = self.reg(w1);
                    self.handles.add_ref(id);
                    self.raise(Vector::Software, VmError::SoftwareException, id);
                    return Ok(ExecOutcome::Thrown(id));
                }
                Opcode::TypeOf => {
                    let type_id = self
                        .handles
                        .get(self.reg(w1))
                        .map(|h| h.type_id)
                        .unwrap_or(type_ids::UNDEFINED);
                    let result = self.alloc_int(type_id as i64);
                    self.set_reg(w2, result);
                }
                Opcode::RtChk => {
                    let id = self.reg(w1);
                    if id != 0 && !self.is_instance_of(id, w2) {
                        return Err(self.machine_error(VmError::TypeMismatch));
                    }
                }
                Opcode::CvF => {
                    let v = self.int_of(self.reg(w1))?;
                    let result = self.alloc_float(v as f64);
                    self.set_reg(w2, result);
                }
                Opcode::CvI => {
                    let result = match self.num_of(self.reg(w1))? {
                        Num::F(v) => self.alloc_int(v as i64),
                        Num::I(v) => self.alloc_int(v),
                        Num::S(_) => return Err(self.machine_error(VmError::UnsupportedType)),
                    };
                    self.set_reg(w2, result);
                }
                Opcode::WRef => {
                    // Weakness is enforced at compile time; the slot
                    // shares the reference and the GC breaks any cycle
                    // the weak link was meant to avoid.
                    let id = self.reg(w1);
                    self.set_reg_shared(w2, id);
                }
                Opcode::ToStr => {
                    let text = self.stringify(self.reg(w1));
                    let id = self.handles.alloc(type_ids::STRING, Payload::Str(text));
                    self.set_reg(w2, id);
                }
                Opcode::Brk => {
                    self.raise(Vector::Break, VmError::Break, 0);
                }
            }

            self.cur.pc = next_pc;
        }
    }

    /// Park a task context back into its handle, suspended or done.
    fn park_task(&mut self, task_id: HandleId, func_idx: u32, ctx: Context, done: bool) {
        if let Some(h) = self.handles.get_mut(task_id) {
            h.payload = Payload::Task(Box::new(TaskData {
                func_idx,
                ctx,
                done,
            }));
        }
    }

    /// Raise the software vector and produce a thrown runtime
    /// exception.
    fn software_exception(&mut self, message: &str) -> Result<ExecOutcome, VmError> {
        let id = self.make_runtime_exception(VmError::SoftwareException);
        if let Some(Payload::Native(n)) = self.handles.get_mut(id).map(|h| &mut h.payload) {
            if let Some(obj) = n
                .object
                .as_mut()
                .and_then(|b| b.downcast_mut::<crate::machine::RtExcObj>())
            {
                obj.message = message.to_string();
            }
        }
        self.raise(Vector::Software, VmError::SoftwareException, id);
        Ok(ExecOutcome::Thrown(id))
    }

    /// Raise the machine vector and pass the error through.
    pub(crate) fn machine_error(&mut self, err: VmError) -> VmError {
        self.raise(Vector::Machine, err, 0);
        err
    }

    // ===== Operand helpers =====

    fn stack_slot(&mut self, disp: u32) -> Result<usize, VmError> {
        let len = self.cur.data_stack.len();
        match len.checked_sub(1 + disp as usize) {
            Some(slot) => Ok(slot),
            None => Err(self.machine_error(VmError::InvalidOperand)),
        }
    }

    fn num_of(&mut self, id: HandleId) -> Result<Num, VmError> {
        let value = match self.handles.get(id).map(|h| &h.payload) {
            Some(Payload::Int(v)) => Some(Num::I(*v)),
            Some(Payload::Float(v)) => Some(Num::F(*v)),
            Some(Payload::Str(s)) => Some(Num::S(s.clone())),
            _ => None,
        };
        match value {
            Some(v) => Ok(v),
            None => Err(self.machine_error(VmError::UnsupportedType)),
        }
    }

    pub(crate) fn int_of(&mut self, id: HandleId) -> Result<i64, VmError> {
        let value = match self.handles.get(id).map(|h| &h.payload) {
            Some(Payload::Int(v)) => Some(*v),
            _ => None,
        };
        match value {
            Some(v) => Ok(v),
            None => Err(self.machine_error(VmError::TypeMismatch)),
        }
    }

    fn alloc_int(&mut self, v: i64) -> HandleId {
        self.handles.alloc(type_ids::INT, Payload::Int(v))
    }

    fn alloc_float(&mut self, v: f64) -> HandleId {
        self.handles.alloc(type_ids::FLOAT, Payload::Float(v))
    }

    /// Locate an object's member block, classifying the failure modes.
    fn member_block(
        &mut self,
        obj: HandleId,
        slot: u32,
    ) -> Result<crate::fixmem::BlockId, VmError> {
        enum Found {
            Block(crate::fixmem::BlockId),
            OutOfRange,
            NotAnObject,
        }
        if obj == 0 {
            return Err(self.machine_error(VmError::NullReference));
        }
        let found = match self.handles.get(obj).map(|h| &h.payload) {
            Some(Payload::Object(o)) if slot < o.count => Found::Block(o.block),
            Some(Payload::Object(_)) => Found::OutOfRange,
            _ => Found::NotAnObject,
        };
        match found {
            Found::Block(block) => Ok(block),
            Found::OutOfRange => Err(self.machine_error(VmError::InvalidOperand)),
            Found::NotAnObject => Err(self.machine_error(VmError::UnsupportedType)),
        }
    }

    fn member_read(&mut self, obj: HandleId, slot: u32) -> Result<HandleId, VmError> {
        let block = self.member_block(obj, slot)?;
        Ok(self.fixmem.words(block)[slot as usize])
    }

    fn member_write(&mut self, obj: HandleId, slot: u32, value: HandleId) -> Result<(), VmError> {
        let block = self.member_block(obj, slot)?;
        self.handles.add_ref(value);
        let old = std::mem::replace(&mut self.fixmem.words_mut(block)[slot as usize], value);
        self.release_id(old);
        Ok(())
    }

    /// Numeric and string arithmetic on two handles, producing a fresh
    /// result handle.
    fn arith(&mut self, op: Opcode, a: HandleId, b: HandleId) -> Result<HandleId, VmError> {
        let va = self.num_of(a)?;
        let vb = self.num_of(b)?;

        let id = match (va, vb) {
            (Num::S(x), Num::S(y)) if op == Opcode::Add => self
                .handles
                .alloc(type_ids::STRING, Payload::Str(format!("{x}{y}"))),
            (Num::I(x), Num::I(y)) => {
                let v = match op {
                    Opcode::Add => x.wrapping_add(y),
                    Opcode::Sub => x.wrapping_sub(y),
                    Opcode::Mul => x.wrapping_mul(y),
                    Opcode::Div => {
                        if y == 0 {
                            return Err(self.machine_error(VmError::DivideByZero));
                        }
                        x.wrapping_div(y)
                    }
                    Opcode::Mod => {
                        if y == 0 {
                            return Err(self.machine_error(VmError::DivideByZero));
                        }
                        x.wrapping_rem(y)
                    }
                    Opcode::BAnd => x & y,
                    Opcode::BOr => x | y,
                    Opcode::BXor => x ^ y,
                    Opcode::Shl => x.wrapping_shl(y as u32),
                    Opcode::Shr => x.wrapping_shr(y as u32),
                    _ => return Err(self.machine_error(VmError::InvalidOperand)),
                };
                self.alloc_int(v)
            }
            (Num::I(x), Num::F(y)) => return self.float_arith(op, x as f64, y),
            (Num::F(x), Num::I(y)) => return self.float_arith(op, x, y as f64),
            (Num::F(x), Num::F(y)) => return self.float_arith(op, x, y),
            _ => return Err(self.machine_error(VmError::TypeMismatch)),
        };
        Ok(id)
    }

    fn float_arith(&mut self, op: Opcode, x: f64, y: f64) -> Result<HandleId, VmError> {
        let v = match op {
            Opcode::Add => x + y,
            Opcode::Sub => x - y,
            Opcode::Mul => x * y,
            Opcode::Div => {
                if y == 0.0 {
                    return Err(self.machine_error(VmError::DivideByZero));
                }
                x / y
            }
            Opcode::Mod => {
                if y == 0.0 {
                    return Err(self.machine_error(VmError::DivideByZero));
                }
                x % y
            }
            _ => return Err(self.machine_error(VmError::TypeMismatch)),
        };
        Ok(self.alloc_float(v))
    }

    fn compare(&mut self, op: Opcode, a: HandleId, b: HandleId) -> Result<bool, VmError> {
        use std::cmp::Ordering;

        enum Cmp {
            Ord(Option<Ordering>),
            Identity,
        }
        let kind = match (
            self.handles.get(a).map(|h| &h.payload),
            self.handles.get(b).map(|h| &h.payload),
        ) {
            (Some(Payload::Int(x)), Some(Payload::Int(y))) => Cmp::Ord(Some(x.cmp(y))),
            (Some(Payload::Float(x)), Some(Payload::Float(y))) => Cmp::Ord(x.partial_cmp(y)),
            (Some(Payload::Int(x)), Some(Payload::Float(y))) => {
                Cmp::Ord((*x as f64).partial_cmp(y))
            }
            (Some(Payload::Float(x)), Some(Payload::Int(y))) => {
                Cmp::Ord(x.partial_cmp(&(*y as f64)))
            }
            (Some(Payload::Str(x)), Some(Payload::Str(y))) => Cmp::Ord(Some(x.cmp(y))),
            (Some(Payload::Null), Some(Payload::Null)) | (None, None) => {
                Cmp::Ord(Some(Ordering::Equal))
            }
            _ => Cmp::Identity,
        };

        let ord = match kind {
            // Reference values compare by identity, equality only.
            Cmp::Identity => {
                return match op {
                    Opcode::CmpEq => Ok(a == b),
                    Opcode::CmpNe => Ok(a != b),
                    _ => Err(self.machine_error(VmError::TypeMismatch)),
                };
            }
            // NaN comparisons are false, except !=.
            Cmp::Ord(None) => return Ok(op == Opcode::CmpNe),
            Cmp::Ord(Some(ord)) => ord,
        };
        Ok(match op {
            Opcode::CmpEq => ord == Ordering::Equal,
            Opcode::CmpNe => ord != Ordering::Equal,
            Opcode::CmpLt => ord == Ordering::Less,
            Opcode::CmpLe => ord != Ordering::Greater,
            Opcode::CmpGt => ord == Ordering::Greater,
            Opcode::CmpGe => ord != Ordering::Less,
            _ => unreachable!(),
        })
    }

    fn deep_copy(&mut self, id: HandleId) -> Result<HandleId, VmError> {
        enum Snapshot {
            Scalar(Payload),
            Delegate(u32, bool, HandleId, Vec<HandleId>),
            Object(Vec<HandleId>, u32),
            Fail,
        }
        let (type_id, snap) = match self.handles.get(id) {
            None => return Ok(0),
            Some(h) => {
                let snap = match &h.payload {
                    Payload::Null => return Ok(0),
                    Payload::Int(v) => Snapshot::Scalar(Payload::Int(*v)),
                    Payload::Float(v) => Snapshot::Scalar(Payload::Float(*v)),
                    Payload::Str(s) => Snapshot::Scalar(Payload::Str(s.clone())),
                    Payload::Delegate(d) => {
                        Snapshot::Delegate(d.target, d.is_method, d.bound, d.env.clone())
                    }
                    Payload::Object(o) => Snapshot::Object(
                        self.fixmem.words(o.block)[..o.count as usize].to_vec(),
                        o.count,
                    ),
                    Payload::Task(_) | Payload::Native(_) => Snapshot::Fail,
                };
                (h.type_id, snap)
            }
        };
        match snap {
            Snapshot::Scalar(payload) => Ok(self.handles.alloc(type_id, payload)),
            Snapshot::Delegate(target, is_method, bound, env) => {
                self.handles.add_ref(bound);
                for &e in &env {
                    self.handles.add_ref(e);
                }
                Ok(self.handles.alloc(
                    type_id,
                    Payload::Delegate(DelegateData {
                        target,
                        is_method,
                        bound,
                        env,
                    }),
                ))
            }
            Snapshot::Object(members, count) => {
                let block = self.fixmem.alloc_words(count.max(1) as usize);
                for (i, &m) in members.iter().enumerate() {
                    self.fixmem.words_mut(block)[i] = m;
                    self.handles.add_ref(m);
                }
                Ok(self
                    .handles
                    .alloc(type_id, Payload::Object(ObjectData { block, count })))
            }
            Snapshot::Fail => Err(self.machine_error(VmError::ObjectCopyFailed)),
        }
    }

    fn is_instance_of(&self, id: HandleId, wanted: u32) -> bool {
        let Some(h) = self.handles.get(id) else {
            return false;
        };
        if wanted == type_ids::VAR {
            return true;
        }
        // Delegate and task values carry dynamic tags; the declared
        // delegate/thread type was checked statically, so the payload
        // kind decides here.
        match self.segments.types.get(wanted as usize).map(|t| t.family) {
            Some(beryl_bytecode::segment::TypeFamily::Delegate) => {
                return matches!(h.payload, Payload::Delegate(_));
            }
            Some(beryl_bytecode::segment::TypeFamily::Thread) => {
                return matches!(h.payload, Payload::Task(_));
            }
            _ => {}
        }
        let mut probe = h.type_id;
        while probe != 0 {
            if probe == wanted {
                return true;
            }
            let t = &self.segments.types[probe as usize];
            probe = if t.base_id != 0 { t.base_id } else { t.hybrid_id };
        }
        false
    }

    /// String form of a value. Objects render as their type name.
    pub(crate) fn stringify(&self, id: HandleId) -> String {
        match self.handles.get(id).map(|h| (&h.payload, h.type_id)) {
            None | Some((Payload::Null, _)) => "null".to_string(),
            Some((Payload::Int(v), _)) => v.to_string(),
            Some((Payload::Float(v), _)) => {
                if v.fract() == 0.0 && v.is_finite() {
                    format!("{v:.1}")
                } else {
                    v.to_string()
                }
            }
            Some((Payload::Str(s), _)) => s.clone(),
            Some((_, type_id)) => format!("[{}]", self.segments.type_name(type_id)),
        }
    }

    /// Function descriptor of a native function, looked up by type and
    /// declaration ordinal.
    pub(crate) fn find_native_func(
        &self,
        type_id: u32,
        ordinal: u32,
    ) -> Option<&beryl_bytecode::segment::FuncInfo> {
        self.segments
            .functions
            .iter()
            .find(|f| f.type_id == type_id && f.member_idx == ordinal && f.member_idx != NO_METHOD)
    }
}
